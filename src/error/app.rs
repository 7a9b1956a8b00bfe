use thiserror::Error;

use super::{
    ConfigError, ControllerError, DataError, EngineError, SchedulerError, StoreError,
};

#[derive(Debug, Error)]
pub enum AppError {
    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
    #[error("CLI error: {source}")]
    Clap {
        #[from]
        source: clap::Error,
    },
    #[error("JSON error: {source}")]
    Json {
        #[from]
        source: serde_json::Error,
    },
    #[error("HTTP client error: {source}")]
    Reqwest {
        #[from]
        source: reqwest::Error,
    },
    #[error("Join error: {source}")]
    Join {
        #[from]
        source: tokio::task::JoinError,
    },
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),
    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error("Execution data error: {0}")]
    Data(#[from] DataError),
    #[error("Controller error: {0}")]
    Controller(#[from] ControllerError),
}

pub type AppResult<T> = Result<T, AppError>;

/// Coarse classification used by the API boundary to pick a response status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    NotFound,
    Conflict,
    Transient,
    Fatal,
    Internal,
}

impl AppError {
    pub fn config<E>(error: E) -> Self
    where
        E: Into<ConfigError>,
    {
        error.into().into()
    }

    pub fn engine<E>(error: E) -> Self
    where
        E: Into<EngineError>,
    {
        error.into().into()
    }

    pub fn scheduler<E>(error: E) -> Self
    where
        E: Into<SchedulerError>,
    {
        error.into().into()
    }

    pub fn store<E>(error: E) -> Self
    where
        E: Into<StoreError>,
    {
        error.into().into()
    }

    pub fn data<E>(error: E) -> Self
    where
        E: Into<DataError>,
    {
        error.into().into()
    }

    pub fn controller<E>(error: E) -> Self
    where
        E: Into<ControllerError>,
    {
        error.into().into()
    }

    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            AppError::Config(_) | AppError::Clap { .. } => ErrorKind::Fatal,
            AppError::Json { .. } | AppError::Data(_) => ErrorKind::Validation,
            AppError::Io { .. } | AppError::Reqwest { .. } => ErrorKind::Transient,
            AppError::Join { .. } => ErrorKind::Internal,
            AppError::Engine(err) => err.kind(),
            AppError::Scheduler(err) => err.kind(),
            AppError::Store(err) => err.kind(),
            AppError::Controller(err) => err.kind(),
        }
    }
}
