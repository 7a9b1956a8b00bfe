use std::fmt;
use std::str::FromStr;

use crate::error::{ConfigError, EngineError};

/// Load-generation runtime backing an engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineKind {
    Jmeter,
}

/// Fields the controller reads out of one metric line.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricLine {
    pub label: String,
    pub status: String,
    pub threads: f64,
    pub latency: f64,
}

// timeStamp|elapsed|label|responseCode|responseMessage|threadName|success|bytes|grpThreads|allThreads|Latency|Connect
const JMETER_FIELDS: usize = 12;
const JMETER_LABEL: usize = 2;
const JMETER_STATUS: usize = 3;
const JMETER_THREADS: usize = 9;
const JMETER_LATENCY: usize = 10;

impl EngineKind {
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            EngineKind::Jmeter => "jmeter",
        }
    }

    #[must_use]
    pub const fn default_image(self) -> &'static str {
        match self {
            EngineKind::Jmeter => "loadplane/jmeter-agent:latest",
        }
    }

    /// Decode one line emitted on the engine's metric stream.
    ///
    /// # Errors
    ///
    /// Returns an error for short lines and for lines whose latency is not
    /// numeric (such as the CSV header row).
    pub fn parse_line(self, raw: &str) -> Result<MetricLine, EngineError> {
        match self {
            EngineKind::Jmeter => parse_jmeter_line(raw),
        }
    }
}

fn parse_jmeter_line(raw: &str) -> Result<MetricLine, EngineError> {
    let fields: Vec<&str> = raw.split('|').collect();
    if fields.len() < JMETER_FIELDS {
        return Err(EngineError::MetricLineTooShort {
            fields: fields.len(),
            expected: JMETER_FIELDS,
        });
    }
    let field = |idx: usize| fields.get(idx).copied().unwrap_or_default();

    let latency_raw = field(JMETER_LATENCY);
    let latency = latency_raw
        .trim()
        .parse::<f64>()
        .map_err(|_err| EngineError::MetricLatencyInvalid {
            value: latency_raw.to_owned(),
        })?;
    let threads = field(JMETER_THREADS).trim().parse::<f64>().unwrap_or(0.0);

    Ok(MetricLine {
        label: field(JMETER_LABEL).to_owned(),
        status: field(JMETER_STATUS).to_owned(),
        threads,
        latency,
    })
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for EngineKind {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "jmeter" => Ok(EngineKind::Jmeter),
            _ => Err(ConfigError::UnsupportedEngineKind {
                kind: value.to_owned(),
            }),
        }
    }
}
