use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use reqwest::StatusCode;
use reqwest::header::{ACCEPT, CONTENT_TYPE};

use crate::error::{EngineEndpoint, EngineError};

use super::retry::{RetryExhausted, RetryPolicy};
use super::stream::ByteStream;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// How a worker answered `POST /start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerOutcome {
    Started,
    AlreadyRunning,
}

/// HTTP client for the worker protocol, shared by every engine handle.
#[derive(Debug, Clone)]
pub struct EngineClient {
    http: reqwest::Client,
    request_timeout: Duration,
    retry: RetryPolicy,
}

fn endpoint_url(base: &str, endpoint: EngineEndpoint) -> String {
    format!("{}/{}", base.trim_end_matches('/'), endpoint.path())
}

fn exhausted(
    engine: &str,
    endpoint: EngineEndpoint,
    err: RetryExhausted<EngineError>,
) -> EngineError {
    EngineError::RetriesExhausted {
        engine: engine.to_owned(),
        endpoint,
        attempts: err.attempts,
        last_error: err.last_error.to_string(),
    }
}

impl EngineClient {
    /// Build a client with per-request timeouts for control calls.
    ///
    /// # Errors
    ///
    /// Returns an error when the underlying HTTP client cannot be built.
    pub fn new(request_timeout: Duration, retry: RetryPolicy) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .connect_timeout(DEFAULT_CONNECT_TIMEOUT)
            .tcp_nodelay(true)
            .build()?;
        Ok(Self {
            http,
            request_timeout,
            retry,
        })
    }

    #[must_use]
    pub const fn retry(&self) -> RetryPolicy {
        self.retry
    }

    pub(crate) async fn start(
        &self,
        engine: &str,
        base: &str,
        body: Bytes,
    ) -> Result<TriggerOutcome, EngineError> {
        let url = endpoint_url(base, EngineEndpoint::Start);
        self.retry
            .run("trigger", || {
                let request = self
                    .http
                    .post(url.as_str())
                    .header(CONTENT_TYPE, "application/json")
                    .timeout(self.request_timeout)
                    .body(body.clone());
                let engine = engine.to_owned();
                async move {
                    let response = request.send().await.map_err(|source| EngineError::Request {
                        engine: engine.clone(),
                        endpoint: EngineEndpoint::Start,
                        source,
                    })?;
                    let status = response.status();
                    if status == StatusCode::CONFLICT {
                        return Ok(TriggerOutcome::AlreadyRunning);
                    }
                    if status.is_success() {
                        return Ok(TriggerOutcome::Started);
                    }
                    Err(EngineError::UnexpectedStatus {
                        engine,
                        endpoint: EngineEndpoint::Start,
                        status: status.as_u16(),
                    })
                }
            })
            .await
            .map_err(|err| exhausted(engine, EngineEndpoint::Start, err))
    }

    /// Only transport failures are retried; any answer other than 200 means idle.
    pub(crate) async fn progress(&self, engine: &str, base: &str) -> Result<bool, EngineError> {
        let url = endpoint_url(base, EngineEndpoint::Progress);
        self.retry
            .run("progress", || {
                let request = self.http.get(url.as_str()).timeout(self.request_timeout);
                let engine = engine.to_owned();
                async move {
                    let response = request.send().await.map_err(|source| EngineError::Request {
                        engine,
                        endpoint: EngineEndpoint::Progress,
                        source,
                    })?;
                    Ok(response.status() == StatusCode::OK)
                }
            })
            .await
            .map_err(|err| exhausted(engine, EngineEndpoint::Progress, err))
    }

    pub(crate) async fn stop(&self, engine: &str, base: &str) -> Result<(), EngineError> {
        let url = endpoint_url(base, EngineEndpoint::Stop);
        let response = self
            .http
            .post(url.as_str())
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|source| EngineError::Request {
                engine: engine.to_owned(),
                endpoint: EngineEndpoint::Stop,
                source,
            })?;
        if !response.status().is_success() {
            return Err(EngineError::UnexpectedStatus {
                engine: engine.to_owned(),
                endpoint: EngineEndpoint::Stop,
                status: response.status().as_u16(),
            });
        }
        Ok(())
    }

    pub(crate) async fn open_stream(&self, engine: &str, base: &str) -> Result<ByteStream, EngineError> {
        let url = endpoint_url(base, EngineEndpoint::Stream);
        tracing::info!("Subscribing to engine url {}", url);
        let response = self
            .http
            .get(url.as_str())
            .header(ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(|source| EngineError::Request {
                engine: engine.to_owned(),
                endpoint: EngineEndpoint::Stream,
                source,
            })?;
        if !response.status().is_success() {
            return Err(EngineError::UnexpectedStatus {
                engine: engine.to_owned(),
                endpoint: EngineEndpoint::Stream,
                status: response.status().as_u16(),
            });
        }
        let engine = engine.to_owned();
        Ok(response
            .bytes_stream()
            .map(move |chunk| {
                chunk.map_err(|err| EngineError::StreamRead {
                    engine: engine.clone(),
                    message: err.to_string(),
                })
            })
            .boxed())
    }
}
