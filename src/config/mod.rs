//! Configuration loading and validation.
mod loader;
mod parse;
mod settings;
pub mod types;

#[cfg(test)]
mod tests;

pub use loader::load_config;
pub use settings::ControllerSettings;

#[cfg(test)]
pub(crate) use loader::load_config_file;
pub(crate) use parse::parse_duration_value;
