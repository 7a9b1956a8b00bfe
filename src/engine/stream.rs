use bytes::Bytes;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use tokio::sync::{mpsc, watch};

use crate::error::EngineError;
use crate::model::EngineMetric;

use super::kind::EngineKind;

pub type ByteStream = BoxStream<'static, Result<Bytes, EngineError>>;

/// Identifiers stamped onto every metric read from one stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamTags {
    pub collection_id: i64,
    pub plan_id: i64,
    pub run_id: i64,
    pub engine_id: usize,
}

/// An open server-sent-events connection to one engine.
pub struct MetricStream {
    engine: String,
    kind: EngineKind,
    tags: StreamTags,
    body: ByteStream,
    cancel: watch::Receiver<bool>,
}

impl std::fmt::Debug for MetricStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricStream")
            .field("engine", &self.engine)
            .field("kind", &self.kind)
            .field("tags", &self.tags)
            .finish_non_exhaustive()
    }
}

impl MetricStream {
    #[must_use]
    pub fn new(
        engine: String,
        kind: EngineKind,
        tags: StreamTags,
        body: ByteStream,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        Self {
            engine,
            kind,
            tags,
            body,
            cancel,
        }
    }

    #[must_use]
    pub fn engine(&self) -> &str {
        &self.engine
    }

    #[must_use]
    pub const fn tags(&self) -> StreamTags {
        self.tags
    }

    /// Drop the connection without reading it.
    pub fn close(self) {
        tracing::debug!("Closing metric stream of {}", self.engine);
    }

    /// Spawn the decoding task and return the metrics it yields in source order.
    ///
    /// The receiver ends when the engine closes the connection, the engine
    /// handle is cancelled, or a read fails.
    #[must_use]
    pub fn into_metrics(self) -> mpsc::UnboundedReceiver<EngineMetric> {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(pump_metrics(self, tx));
        rx
    }
}

async fn pump_metrics(mut stream: MetricStream, tx: mpsc::UnboundedSender<EngineMetric>) {
    let mut decoder = SseDecoder::default();
    let mut watch_cancel = true;
    if *stream.cancel.borrow() {
        return;
    }

    loop {
        tokio::select! {
            changed = stream.cancel.changed(), if watch_cancel => {
                match changed {
                    Ok(()) if *stream.cancel.borrow() => break,
                    Ok(()) => {}
                    Err(_) => watch_cancel = false,
                }
            }
            chunk = stream.body.next() => {
                match chunk {
                    Some(Ok(bytes)) => {
                        for data in decoder.push(&bytes) {
                            let line = match stream.kind.parse_line(&data) {
                                Ok(line) => line,
                                Err(err) => {
                                    tracing::debug!("Skipping line from {}: {}", stream.engine, err);
                                    continue;
                                }
                            };
                            let metric = EngineMetric {
                                threads: line.threads,
                                latency: line.latency,
                                label: line.label,
                                status: line.status,
                                raw: data,
                                collection_id: stream.tags.collection_id,
                                plan_id: stream.tags.plan_id,
                                run_id: stream.tags.run_id,
                                engine_id: stream.tags.engine_id,
                            };
                            if tx.send(metric).is_err() {
                                return;
                            }
                        }
                    }
                    Some(Err(err)) => {
                        tracing::warn!("Metric stream of {} failed: {}", stream.engine, err);
                        break;
                    }
                    None => break,
                }
            }
        }
    }
    tracing::debug!("Metric stream of {} ended", stream.engine);
}

/// Incremental decoder for `text/event-stream` bodies; yields each event's data.
#[derive(Debug, Default)]
pub(crate) struct SseDecoder {
    buffer: Vec<u8>,
    data: Vec<String>,
}

impl SseDecoder {
    pub(crate) fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|byte| *byte == b'\n') {
            let mut line: Vec<u8> = self.buffer.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            let line = String::from_utf8_lossy(&line);
            if line.is_empty() {
                if !self.data.is_empty() {
                    events.push(self.data.join("\n"));
                    self.data.clear();
                }
                continue;
            }
            if let Some(value) = line.strip_prefix("data:") {
                let value = value.strip_prefix(' ').unwrap_or(value);
                self.data.push(value.to_owned());
            }
        }
        events
    }
}
