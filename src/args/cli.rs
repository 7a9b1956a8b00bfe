use clap::Parser;

use super::types::Role;

#[derive(Debug, Parser, Clone)]
#[clap(
    version,
    about = "Execution controller for a distributed load-testing platform: deploys engines, streams their metrics and reconciles cluster state."
)]
pub struct ControllerArgs {
    /// Path to a TOML or JSON config file (defaults to loadplane.toml / loadplane.json)
    #[arg(long = "config", short = 'c', env = "LOADPLANE_CONFIG")]
    pub config: Option<String>,

    /// Deployment context used in engine keys (overrides config)
    #[arg(long = "context", env = "LOADPLANE_CONTEXT")]
    pub context: Option<String>,

    /// Process role; defaults to `api` in distributed mode and `all` otherwise
    #[arg(long = "role", value_enum)]
    pub role: Option<Role>,

    /// Enable debug logging
    #[arg(long = "verbose", short = 'v')]
    pub verbose: bool,
}
