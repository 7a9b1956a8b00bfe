//! CLI argument types.
mod cli;
mod types;


pub use cli::ControllerArgs;
pub use types::Role;
