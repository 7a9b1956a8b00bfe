use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DataError {
    #[error("Cannot split into {total} shards; split count must be >= 1.")]
    ZeroSplits { total: usize },
    #[error("Split index {current} is out of range for {total} shards.")]
    SplitOutOfRange { current: usize, total: usize },
    #[error("Failed to parse CSV '{filename}': {source}")]
    CsvParse {
        filename: String,
        #[source]
        source: csv::Error,
    },
    #[error("Failed to write CSV shard of '{filename}': {message}")]
    CsvWrite { filename: String, message: String },
    #[error("Failed to read artifact '{path}': {source}")]
    ArtifactRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("No payload was fetched for artifact '{filepath}'.")]
    MissingPayload { filepath: String },
    #[error("Artifact path '{path}' escapes the artifact root.")]
    ArtifactPathEscapes { path: String },
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
