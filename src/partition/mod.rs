//! Deterministic sharding of shared input files across engines.
//!
//! Tabular (`.csv`) files assigned more than one split are parsed once and
//! cut into contiguous, order-preserving row slices. Every other file is
//! handed to each engine unchanged.
use std::collections::{BTreeMap, HashMap};
use std::ops::Range;

use bytes::Bytes;
use csv::{ByteRecord, ReaderBuilder, WriterBuilder};
use tokio::task::JoinSet;

use crate::error::{AppError, AppResult, DataError};
use crate::model::ShardLayout;


/// Per-engine mapping of filename to payload; index is the engine number.
pub type ExecutionData = Vec<BTreeMap<String, Bytes>>;

const CSV_SUFFIX: &str = ".csv";

#[must_use]
pub fn is_partitionable(filename: &str) -> bool {
    filename.ends_with(CSV_SUFFIX)
}

/// Rows taken by `current_split` out of `total_splits`.
///
/// With fewer rows than splits every shard gets the whole file. Otherwise
/// each shard gets `total_rows / total_splits` rows and the remainder is
/// dropped.
#[must_use]
pub fn row_range(total_rows: usize, total_splits: usize, current_split: usize) -> Range<usize> {
    if total_rows < total_splits {
        return 0..total_rows;
    }
    let Some(chunk) = total_rows.checked_div(total_splits) else {
        return 0..total_rows;
    };
    let start = chunk.saturating_mul(current_split);
    let end = start.saturating_add(chunk);
    start..end
}

fn validate_split(total_splits: usize, current_split: usize) -> Result<(), DataError> {
    if total_splits == 0 {
        return Err(DataError::ZeroSplits {
            total: total_splits,
        });
    }
    if current_split >= total_splits {
        return Err(DataError::SplitOutOfRange {
            current: current_split,
            total: total_splits,
        });
    }
    Ok(())
}

/// Records of one tabular file, parsed once and sliced per shard.
#[derive(Debug)]
pub struct CsvRecords {
    filename: String,
    records: Vec<ByteRecord>,
}

impl CsvRecords {
    /// Parse a payload with flexible record lengths and no header row.
    ///
    /// # Errors
    ///
    /// Returns an error when the payload is not valid CSV.
    pub fn parse(filename: &str, payload: &[u8]) -> Result<Self, DataError> {
        let mut reader = ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_reader(payload);
        let mut records = Vec::new();
        for record in reader.byte_records() {
            let record = record.map_err(|err| DataError::CsvParse {
                filename: filename.to_owned(),
                source: err,
            })?;
            records.push(record);
        }
        Ok(Self {
            filename: filename.to_owned(),
            records,
        })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Serialize the slice owned by `current_split`.
    ///
    /// # Errors
    ///
    /// Returns an error when the split index is out of range or the slice
    /// cannot be written back.
    pub fn shard(&self, total_splits: usize, current_split: usize) -> Result<Vec<u8>, DataError> {
        validate_split(total_splits, current_split)?;
        let range = row_range(self.records.len(), total_splits, current_split);
        let rows = self.records.get(range).unwrap_or_default();

        let mut writer = WriterBuilder::new().flexible(true).from_writer(Vec::new());
        for row in rows {
            writer
                .write_byte_record(row)
                .map_err(|err| DataError::CsvWrite {
                    filename: self.filename.clone(),
                    message: err.to_string(),
                })?;
        }
        writer.into_inner().map_err(|err| DataError::CsvWrite {
            filename: self.filename.clone(),
            message: err.to_string(),
        })
    }
}

/// Split a single CSV payload.
///
/// # Errors
///
/// Returns an error when `current_split >= total_splits` or the payload is not valid CSV.
pub fn split_csv(
    filename: &str,
    payload: &[u8],
    total_splits: usize,
    current_split: usize,
) -> Result<Vec<u8>, DataError> {
    validate_split(total_splits, current_split)?;
    CsvRecords::parse(filename, payload)?.shard(total_splits, current_split)
}

struct ShardTarget {
    engine: usize,
    total_splits: usize,
    current_split: usize,
}

fn partition_source(
    filename: &str,
    payload: &Bytes,
    targets: &[ShardTarget],
) -> Result<Vec<(usize, Bytes)>, DataError> {
    let needs_split = is_partitionable(filename) && targets.iter().any(|t| t.total_splits > 1);
    if !needs_split {
        return Ok(targets
            .iter()
            .map(|target| (target.engine, payload.clone()))
            .collect());
    }

    let records = CsvRecords::parse(filename, payload)?;
    let mut out = Vec::with_capacity(targets.len());
    for target in targets {
        let shard = if target.total_splits > 1 {
            Bytes::from(records.shard(target.total_splits, target.current_split)?)
        } else {
            payload.clone()
        };
        out.push((target.engine, shard));
    }
    Ok(out)
}

/// Materialize a shard layout into per-engine payloads.
///
/// Each distinct source file is parsed once on the blocking pool and
/// independent files are processed concurrently. The result has exactly
/// `layout.len()` entries.
///
/// # Errors
///
/// Returns an error when a payload is missing, a split is invalid, or a
/// partition task fails.
pub async fn build_execution_data(
    layout: &ShardLayout,
    payloads: &HashMap<String, Bytes>,
) -> AppResult<ExecutionData> {
    let mut groups: BTreeMap<(String, String), Vec<ShardTarget>> = BTreeMap::new();
    for (engine, files) in layout.iter().enumerate() {
        for shard in files.values() {
            groups
                .entry((shard.filename.clone(), shard.filepath.clone()))
                .or_default()
                .push(ShardTarget {
                    engine,
                    total_splits: shard.total_splits,
                    current_split: shard.current_split,
                });
        }
    }

    let mut tasks = JoinSet::new();
    for ((filename, filepath), targets) in groups {
        let payload = payloads
            .get(&filepath)
            .cloned()
            .ok_or_else(|| AppError::data(DataError::MissingPayload { filepath }))?;
        tasks.spawn_blocking(move || {
            partition_source(&filename, &payload, &targets).map(|shards| (filename, shards))
        });
    }

    let mut data: ExecutionData = vec![BTreeMap::new(); layout.len()];
    while let Some(joined) = tasks.join_next().await {
        let (filename, shards) = joined?.map_err(AppError::data)?;
        for (engine, payload) in shards {
            if let Some(files) = data.get_mut(engine) {
                files.insert(filename.clone(), payload);
            }
        }
    }
    tracing::debug!("Built execution data for {} engines", data.len());
    Ok(data)
}
