use thiserror::Error;

use super::ErrorKind;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{entity} {id} not found.")]
    NotFound { entity: &'static str, id: String },
    #[error("Collection {collection_id} already has a run in progress.")]
    RunInProgress { collection_id: i64 },
    #[error("Collection {collection_id} has a launch in progress. Please either wait or purge.")]
    LaunchInProgress { collection_id: i64 },
    #[error("SQLite error during {context}: {source}")]
    Sqlite {
        context: &'static str,
        #[source]
        source: tokio_rusqlite::Error,
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

impl StoreError {
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            StoreError::NotFound { .. } => ErrorKind::NotFound,
            StoreError::RunInProgress { .. } | StoreError::LaunchInProgress { .. } => {
                ErrorKind::Conflict
            }
            StoreError::Sqlite { .. } => ErrorKind::Transient,
            #[cfg(test)]
            StoreError::TestExpectation { .. } | StoreError::TestExpectationValue { .. } => {
                ErrorKind::Internal
            }
        }
    }

    pub(crate) fn not_found(entity: &'static str, id: impl ToString) -> Self {
        StoreError::NotFound {
            entity,
            id: id.to_string(),
        }
    }
}
