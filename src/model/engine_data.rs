use std::collections::BTreeMap;

use base64::{Engine as _, engine::general_purpose::STANDARD as B64};
use serde::{Deserialize, Serialize};

/// Where one engine's copy of a file comes from and which slice it takes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileShard {
    pub filename: String,
    pub filepath: String,
    pub total_splits: usize,
    pub current_split: usize,
}

impl FileShard {
    #[must_use]
    pub fn whole(filename: &str, filepath: &str) -> Self {
        Self {
            filename: filename.to_owned(),
            filepath: filepath.to_owned(),
            total_splits: 1,
            current_split: 0,
        }
    }
}

/// Per-engine file layout; index is the engine (or plan) number.
pub type ShardLayout = Vec<BTreeMap<String, FileShard>>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineFile {
    pub filename: String,
    /// Base64 encoded payload.
    pub content: String,
}

impl EngineFile {
    #[must_use]
    pub fn encode(filename: &str, payload: &[u8]) -> Self {
        Self {
            filename: filename.to_owned(),
            content: B64.encode(payload),
        }
    }

    /// Decode the payload.
    ///
    /// # Errors
    ///
    /// Returns an error when the content is not valid base64.
    pub fn decode(&self) -> Result<Vec<u8>, base64::DecodeError> {
        B64.decode(self.content.as_bytes())
    }
}

/// Body of `POST /start`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineDataConfig {
    pub engine_data: BTreeMap<String, EngineFile>,
    pub duration: String,
    pub concurrency: String,
    pub rampup: String,
    pub run_id: i64,
    pub engine_id: usize,
}
