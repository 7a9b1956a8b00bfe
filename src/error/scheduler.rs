use thiserror::Error;

use super::ErrorKind;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Feature unavailable: {feature}")]
    FeatureUnavailable { feature: &'static str },
    #[error("Ingress for collection {collection_id} is not ready: {message}")]
    IngressUnavailable { collection_id: i64, message: String },
    #[error("Failed to deploy {engine}: {message}")]
    Deploy { engine: String, message: String },
    #[error("Collection {collection_id} is not deployed.")]
    CollectionNotDeployed { collection_id: i64 },
    #[error("Scheduler call failed during {context}: {source}")]
    External {
        context: &'static str,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
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

impl SchedulerError {
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            SchedulerError::FeatureUnavailable { .. } => ErrorKind::Validation,
            SchedulerError::CollectionNotDeployed { .. } => ErrorKind::NotFound,
            SchedulerError::IngressUnavailable { .. }
            | SchedulerError::Deploy { .. }
            | SchedulerError::External { .. } => ErrorKind::Transient,
            #[cfg(test)]
            SchedulerError::TestExpectation { .. } | SchedulerError::TestExpectationValue { .. } => {
                ErrorKind::Internal
            }
        }
    }

    /// Address resolution failures that should not be read as "engine idle".
    #[must_use]
    pub const fn is_ingress(&self) -> bool {
        matches!(self, SchedulerError::IngressUnavailable { .. })
    }
}
