use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use tokio::sync::watch;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use super::stream::SseDecoder;
use super::*;
use crate::error::{AppError, AppResult};
use crate::model::EngineDataConfig;

const FAST_RETRY: RetryPolicy = RetryPolicy::new(3, Duration::from_millis(10));
const METRIC_WAIT: Duration = Duration::from_secs(2);

fn run_async_test<F>(future: F) -> AppResult<()>
where
    F: Future<Output = AppResult<()>>,
{
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .map_err(|err| AppError::engine(format!("Failed to build runtime: {}", err)))?;
    runtime.block_on(future)
}

fn test_engine(address: Option<String>) -> AppResult<Engine> {
    let client = EngineClient::new(Duration::from_secs(2), FAST_RETRY)?;
    let engine = Engine::new(
        "test",
        EngineId {
            project_id: 1,
            collection_id: 7,
            plan_id: 3,
            engine_index: 2,
        },
        EngineKind::Jmeter,
        client,
    );
    Ok(match address {
        Some(address) => engine.with_address(address),
        None => engine,
    })
}

fn data_config() -> EngineDataConfig {
    EngineDataConfig {
        engine_data: BTreeMap::new(),
        duration: "5".to_owned(),
        concurrency: "10".to_owned(),
        rampup: "1".to_owned(),
        run_id: 42,
        engine_id: 2,
    }
}

async fn request_count(server: &MockServer) -> usize {
    server
        .received_requests()
        .await
        .map(|requests| requests.len())
        .unwrap_or(0)
}

const SAMPLE_LINE: &str =
    "1700000000000|120|login|200|OK|Thread Group 1-1|true|512|10|25|118|3";

#[test]
fn engine_key_format_is_stable() -> AppResult<()> {
    let engine = test_engine(None)?;
    if engine.key().as_str() != "test-7-3-2" {
        return Err(AppError::engine(format!("unexpected key {}", engine.key())));
    }
    if engine.id().service_name() != "service-1-7-3-2" {
        return Err(AppError::engine("unexpected service name"));
    }
    Ok(())
}

#[test]
fn jmeter_line_fields_are_extracted() -> AppResult<()> {
    let line = EngineKind::Jmeter.parse_line(SAMPLE_LINE)?;
    if line.label != "login" || line.status != "200" {
        return Err(AppError::engine(format!("unexpected line {:?}", line)));
    }
    if line.threads.total_cmp(&25.0).is_ne() || line.latency.total_cmp(&118.0).is_ne() {
        return Err(AppError::engine(format!("unexpected numbers {:?}", line)));
    }
    Ok(())
}

#[test]
fn jmeter_header_and_short_lines_are_rejected() -> AppResult<()> {
    let header = "timeStamp|elapsed|label|responseCode|responseMessage|threadName|success|bytes|grpThreads|allThreads|Latency|Connect";
    if !matches!(
        EngineKind::Jmeter.parse_line(header),
        Err(EngineError::MetricLatencyInvalid { .. })
    ) {
        return Err(AppError::engine("header row must be rejected"));
    }
    if !matches!(
        EngineKind::Jmeter.parse_line("a|b|c"),
        Err(EngineError::MetricLineTooShort { fields: 3, .. })
    ) {
        return Err(AppError::engine("short line must be rejected"));
    }
    Ok(())
}

#[test]
fn sse_decoder_handles_split_chunks() -> AppResult<()> {
    let mut decoder = SseDecoder::default();
    let mut events = decoder.push(b"data: first\n\nda");
    events.extend(decoder.push(b"ta: sec"));
    events.extend(decoder.push(b"ond\r\n\r\n: comment\n\n"));
    if events != ["first", "second"] {
        return Err(AppError::engine(format!("unexpected events {:?}", events)));
    }
    Ok(())
}

#[test]
fn trigger_conflict_is_success_without_resend() -> AppResult<()> {
    run_async_test(async {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/start"))
            .respond_with(ResponseTemplate::new(409))
            .mount(&server)
            .await;

        let engine = test_engine(Some(server.uri()))?;
        let outcome = engine.trigger(&data_config()).await?;
        if outcome != TriggerOutcome::AlreadyRunning {
            return Err(AppError::engine(format!("unexpected outcome {:?}", outcome)));
        }
        if request_count(&server).await != 1 {
            return Err(AppError::engine("conflict must not be re-sent"));
        }
        if engine.state() != EngineState::Triggered {
            return Err(AppError::engine("engine should be triggered"));
        }
        Ok(())
    })
}

#[test]
fn trigger_retries_then_surfaces_failure() -> AppResult<()> {
    run_async_test(async {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/start"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let engine = test_engine(Some(server.uri()))?;
        match engine.trigger(&data_config()).await {
            Err(EngineError::RetriesExhausted { attempts: 3, .. }) => {}
            other => {
                return Err(AppError::engine(format!("unexpected result {:?}", other)));
            }
        }
        if request_count(&server).await != 3 {
            return Err(AppError::engine("expected one request per attempt"));
        }
        Ok(())
    })
}

#[test]
fn trigger_sends_engine_data_config() -> AppResult<()> {
    run_async_test(async {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/start"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let engine = test_engine(Some(server.uri()))?;
        engine.trigger(&data_config()).await?;
        let requests = server.received_requests().await.unwrap_or_default();
        let first = requests
            .first()
            .ok_or_else(|| AppError::engine("no request recorded"))?;
        let body: EngineDataConfig = serde_json::from_slice(&first.body)?;
        if body != data_config() {
            return Err(AppError::engine("trigger body mismatch"));
        }
        Ok(())
    })
}

#[test]
fn progress_reports_running_and_idle() -> AppResult<()> {
    run_async_test(async {
        let running = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/progress"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&running)
            .await;
        let idle = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/progress"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&idle)
            .await;

        if !test_engine(Some(running.uri()))?.progress().await {
            return Err(AppError::engine("200 should mean running"));
        }
        if test_engine(Some(idle.uri()))?.progress().await {
            return Err(AppError::engine("404 should mean idle"));
        }
        if test_engine(None)?.progress().await {
            return Err(AppError::engine("unresolved engine should be idle"));
        }
        Ok(())
    })
}

#[test]
fn unreachable_progress_is_treated_as_idle() -> AppResult<()> {
    run_async_test(async {
        let engine = test_engine(Some("http://127.0.0.1:9".to_owned()))?;
        if engine.progress().await {
            return Err(AppError::engine("transport failure should mean idle"));
        }
        Ok(())
    })
}

#[test]
fn terminate_stops_worker_and_closes_stream() -> AppResult<()> {
    run_async_test(async {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/stop"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let engine = test_engine(Some(server.uri()))?;
        engine.terminate(false).await?;
        if request_count(&server).await != 1 {
            return Err(AppError::engine("expected one stop request"));
        }
        if !engine.is_stream_closed() || engine.state() != EngineState::Terminated {
            return Err(AppError::engine("engine should be terminated"));
        }
        Ok(())
    })
}

#[test]
fn forced_terminate_skips_stop_request() -> AppResult<()> {
    run_async_test(async {
        let server = MockServer::start().await;
        let engine = test_engine(Some(server.uri()))?;
        engine.terminate(true).await?;
        if request_count(&server).await != 0 {
            return Err(AppError::engine("force must not call the worker"));
        }
        if !engine.is_stream_closed() {
            return Err(AppError::engine("stream should be closed"));
        }
        Ok(())
    })
}

#[test]
fn failed_stop_still_closes_stream() -> AppResult<()> {
    run_async_test(async {
        let engine = test_engine(Some("http://127.0.0.1:9".to_owned()))?;
        if engine.terminate(false).await.is_ok() {
            return Err(AppError::engine("stop failure should be returned"));
        }
        if !engine.is_stream_closed() {
            return Err(AppError::engine("stream should be closed"));
        }
        Ok(())
    })
}

#[test]
fn subscribed_stream_yields_tagged_metrics() -> AppResult<()> {
    run_async_test(async {
        let server = MockServer::start().await;
        let body = format!(
            "data: timeStamp|elapsed|label|responseCode|responseMessage|threadName|success|bytes|grpThreads|allThreads|Latency|Connect\n\ndata: {}\n\n",
            SAMPLE_LINE
        );
        Mock::given(method("GET"))
            .and(path("/stream"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string(body),
            )
            .mount(&server)
            .await;

        let engine = test_engine(Some(server.uri()))?;
        let stream = engine.subscribe(42).await?;
        if engine.run_id() != Some(42) || engine.state() != EngineState::Subscribed {
            return Err(AppError::engine("engine should be subscribed to run 42"));
        }

        let mut metrics = stream.into_metrics();
        let metric = tokio::time::timeout(METRIC_WAIT, metrics.recv())
            .await
            .map_err(|_err| AppError::engine("timed out waiting for metric"))?
            .ok_or_else(|| AppError::engine("stream ended without metrics"))?;
        if metric.collection_id != 7
            || metric.plan_id != 3
            || metric.run_id != 42
            || metric.engine_id != 2
            || metric.raw != SAMPLE_LINE
        {
            return Err(AppError::engine(format!("unexpected metric {:?}", metric)));
        }
        let rest = tokio::time::timeout(METRIC_WAIT, metrics.recv())
            .await
            .map_err(|_err| AppError::engine("timed out waiting for stream end"))?;
        if rest.is_some() {
            return Err(AppError::engine("header row must be skipped"));
        }
        Ok(())
    })
}

#[test]
fn cancelled_stream_stops_reading() -> AppResult<()> {
    run_async_test(async {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let body = futures_util::stream::iter(vec![Ok::<Bytes, EngineError>(Bytes::from(
            format!("data: {}\n\n", SAMPLE_LINE),
        ))])
        .chain(futures_util::stream::pending())
        .boxed();
        let stream = MetricStream::new(
            "test-7-3-2".to_owned(),
            EngineKind::Jmeter,
            StreamTags {
                collection_id: 7,
                plan_id: 3,
                run_id: 1,
                engine_id: 2,
            },
            body,
            cancel_rx,
        );
        let mut metrics = stream.into_metrics();
        let first = tokio::time::timeout(METRIC_WAIT, metrics.recv())
            .await
            .map_err(|_err| AppError::engine("timed out waiting for metric"))?;
        if first.is_none() {
            return Err(AppError::engine("expected one metric"));
        }

        cancel_tx.send_replace(true);
        let ended = tokio::time::timeout(METRIC_WAIT, metrics.recv())
            .await
            .map_err(|_err| AppError::engine("cancel did not end the stream"))?;
        if ended.is_some() {
            return Err(AppError::engine("no metric expected after cancel"));
        }
        Ok(())
    })
}

#[test]
fn subscribe_without_address_fails() -> AppResult<()> {
    run_async_test(async {
        let engine = test_engine(None)?;
        match engine.subscribe(1).await {
            Err(EngineError::AddressUnresolved { .. }) => Ok(()),
            other => Err(AppError::engine(format!(
                "unexpected result {:?}",
                other.map(|stream| stream.engine().to_owned())
            ))),
        }
    })
}
