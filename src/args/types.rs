use clap::ValueEnum;
use serde::{Deserialize, Serialize};

/// Which half of the controller this process runs.
#[derive(Debug, Clone, Copy, ValueEnum, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Broker, readers and every reconciliation loop in one process.
    All,
    /// Broker and metric readers only; loops run elsewhere.
    Api,
    /// Reconciliation loops only.
    Reconciler,
}

impl Role {
    #[must_use]
    pub const fn runs_loops(self) -> bool {
        matches!(self, Role::All | Role::Reconciler)
    }

    #[must_use]
    pub const fn runs_streams(self) -> bool {
        matches!(self, Role::All | Role::Api)
    }
}
