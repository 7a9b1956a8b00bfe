mod app;
mod config;
mod controller;
mod data;
mod engine;
mod scheduler;
mod store;

#[cfg(test)]
mod test_support;

pub use app::{AppError, AppResult, ErrorKind};
pub use config::ConfigError;
pub use controller::{ControllerError, EngineFailure};
pub use data::DataError;
pub use engine::{EngineEndpoint, EngineError};
pub use scheduler::SchedulerError;
pub use store::StoreError;
