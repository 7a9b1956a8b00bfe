use std::fmt;

use thiserror::Error;

use super::ErrorKind;

/// Worker endpoint an engine request was addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineEndpoint {
    Start,
    Stop,
    Progress,
    Stream,
}

impl EngineEndpoint {
    #[must_use]
    pub const fn path(self) -> &'static str {
        match self {
            EngineEndpoint::Start => "start",
            EngineEndpoint::Stop => "stop",
            EngineEndpoint::Progress => "progress",
            EngineEndpoint::Stream => "stream",
        }
    }
}

impl fmt::Display for EngineEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.path())
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Request to {engine}/{endpoint} failed: {source}")]
    Request {
        engine: String,
        endpoint: EngineEndpoint,
        #[source]
        source: reqwest::Error,
    },
    #[error("Engine {engine}/{endpoint} answered with status {status}.")]
    UnexpectedStatus {
        engine: String,
        endpoint: EngineEndpoint,
        status: u16,
    },
    #[error("Engine {engine}/{endpoint} failed after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        engine: String,
        endpoint: EngineEndpoint,
        attempts: u32,
        last_error: String,
    },
    #[error("Engine {engine} has no resolved address.")]
    AddressUnresolved { engine: String },
    #[error("Engine {engine} stream was already consumed.")]
    StreamConsumed { engine: String },
    #[error("Serialization error during {context}: {source}")]
    Serialize {
        context: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("Stream read error on {engine}: {message}")]
    StreamRead { engine: String, message: String },
    #[error("Metric line has {fields} fields, expected at least {expected}.")]
    MetricLineTooShort { fields: usize, expected: usize },
    #[error("Metric line latency '{value}' is not numeric.")]
    MetricLatencyInvalid { value: String },
    #[cfg(test)]
    #[error("Test expectation failed: {message}")]
    TestExpectation { message: &'static str },
    #[cfg(test)]
    #[error("Test expectation failed: {message}: {value}")]
    TestExpectationValue {
        message: &'static str,
        value: String,
    },
}

impl EngineError {
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Request { .. }
            | EngineError::UnexpectedStatus { .. }
            | EngineError::RetriesExhausted { .. }
            | EngineError::StreamRead { .. } => ErrorKind::Transient,
            EngineError::AddressUnresolved { .. } | EngineError::StreamConsumed { .. } => {
                ErrorKind::Internal
            }
            EngineError::Serialize { .. }
            | EngineError::MetricLineTooShort { .. }
            | EngineError::MetricLatencyInvalid { .. } => ErrorKind::Validation,
            #[cfg(test)]
            EngineError::TestExpectation { .. } | EngineError::TestExpectationValue { .. } => {
                ErrorKind::Internal
            }
        }
    }
}
