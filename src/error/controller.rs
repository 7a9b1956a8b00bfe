use std::fmt;

use thiserror::Error;

use super::ErrorKind;

/// One engine's failure inside an aggregated plan operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineFailure {
    pub engine_index: usize,
    pub message: String,
}

impl fmt::Display for EngineFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "engine #{}: {}", self.engine_index, self.message)
    }
}

struct FailureList<'list, T>(&'list [T]);

impl<T: fmt::Display> fmt::Display for FailureList<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (idx, failure) in self.0.iter().enumerate() {
            if idx > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{}", failure)?;
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("Plan {plan_id} of collection {collection_id} still has registered engines; terminate it first.")]
    PlanStillRegistered { collection_id: i64, plan_id: i64 },
    #[error("Collection {collection_id} is busy: {reason}")]
    CollectionBusy {
        collection_id: i64,
        reason: &'static str,
    },
    #[error("Triggering plan aborted. There is no test file in plan {plan_id}.")]
    MissingTestFile { plan_id: i64 },
    #[error("Plan {plan_id} is invalid: {reason}")]
    InvalidPlan { plan_id: i64, reason: String },
    #[error("Collection requests {requested} engines but at most {max} are allowed.")]
    TooManyEngines { requested: usize, max: usize },
    #[error("Deploying plan {plan_id} failed for {}", FailureList(.failures))]
    PartialDeploy {
        plan_id: i64,
        failures: Vec<EngineFailure>,
    },
    #[error("Triggering plan {plan_id} failed for {}", FailureList(.failures))]
    PartialTrigger {
        plan_id: i64,
        failures: Vec<EngineFailure>,
    },
    #[error("Collection {collection_id} had plan errors: {}", FailureList(.errors))]
    PlanErrors {
        collection_id: i64,
        errors: Vec<String>,
    },
    #[error("Metric broker is no longer running.")]
    BrokerClosed,
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

impl ControllerError {
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            ControllerError::PlanStillRegistered { .. }
            | ControllerError::CollectionBusy { .. } => ErrorKind::Conflict,
            ControllerError::MissingTestFile { .. }
            | ControllerError::InvalidPlan { .. }
            | ControllerError::TooManyEngines { .. } => ErrorKind::Validation,
            ControllerError::PartialDeploy { .. }
            | ControllerError::PartialTrigger { .. }
            | ControllerError::PlanErrors { .. } => ErrorKind::Transient,
            ControllerError::BrokerClosed => ErrorKind::Internal,
            #[cfg(test)]
            ControllerError::TestExpectation { .. }
            | ControllerError::TestExpectationValue { .. } => ErrorKind::Internal,
        }
    }
}
