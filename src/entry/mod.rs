use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use crate::args::ControllerArgs;
use crate::artifacts::LocalArtifacts;
use crate::broker::MetricBroker;
use crate::config::{ControllerSettings, load_config};
use crate::controller::{Controller, ControllerParts};
use crate::engine::EngineClient;
use crate::error::{AppError, AppResult};
use crate::logger::init_logging;
use crate::metrics::{MetricsSink, TimeSeriesRegistry, serve_metrics};
use crate::reconcile::{resume_on_boot, spawn_loops};
use crate::scheduler::build_scheduler;
use crate::shutdown_handlers::{drain_tasks, setup_signal_shutdown_handler, shutdown_channel};
use crate::store::{ExecutionStore, MemoryStore, SqliteStore};

/// Time each background task gets to stop after shutdown is broadcast.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Process entry: parse flags, build the runtime and run until a signal.
///
/// # Errors
///
/// Returns configuration, store and runtime setup errors.
pub fn run() -> AppResult<()> {
    let args = ControllerArgs::parse();
    init_logging(args.verbose);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(run_async(args))
}

async fn open_store(settings: &ControllerSettings) -> AppResult<Arc<dyn ExecutionStore>> {
    match settings.store_path.as_ref() {
        Some(path) => {
            tracing::info!("Opening execution store at {}", path.display());
            let store = SqliteStore::open(path).await.map_err(AppError::store)?;
            Ok(Arc::new(store))
        }
        None => {
            tracing::warn!("No store path configured, state is kept in memory");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

async fn run_async(args: ControllerArgs) -> AppResult<()> {
    let config = load_config(args.config.as_deref())?;
    let settings = ControllerSettings::from_config(config, &args)?;
    tracing::info!(
        "Starting controller in context {} with role {:?}",
        settings.context,
        settings.role
    );

    let (shutdown_tx, mut shutdown_rx) = shutdown_channel();
    let signal_handle = setup_signal_shutdown_handler(&shutdown_tx, settings.role);

    let scheduler = build_scheduler(&settings.scheduler, settings.request_timeout)?;
    let store = open_store(&settings).await?;
    let registry = Arc::new(TimeSeriesRegistry::new());
    let (broker, broker_handle) = MetricBroker::spawn(shutdown_tx.subscribe());
    let client = EngineClient::new(settings.request_timeout, settings.retry)?;

    let controller = Controller::new(ControllerParts {
        context: settings.context.clone(),
        scheduler,
        store,
        artifacts: Arc::new(LocalArtifacts::new(settings.artifacts_root.clone())),
        sink: Arc::clone(&registry) as Arc<dyn MetricsSink>,
        broker,
        client,
        engine_kind: settings.engine_kind,
        container: settings.container.clone(),
        max_engines_in_collection: settings.max_engines_in_collection,
    });

    let mut handles: Vec<JoinHandle<()>> = vec![signal_handle, broker_handle];

    if let Some(addr) = settings.metrics_listen {
        let listener = TcpListener::bind(addr).await?;
        handles.push(tokio::spawn(serve_metrics(
            listener,
            Arc::clone(&registry),
            shutdown_tx.subscribe(),
        )));
    }

    if settings.role.runs_streams() {
        let resumed = resume_on_boot(&controller).await?;
        tracing::info!("Resumed metric streams for {} engines", resumed);
    }
    if settings.role.runs_loops() {
        handles.extend(spawn_loops(&controller, &settings.reconcile, &shutdown_tx));
    }

    drop(shutdown_rx.recv().await);
    tracing::info!("Shutting down controller");

    let total = handles.len();
    let aborted = drain_tasks(handles, SHUTDOWN_GRACE).await;
    if aborted > 0 {
        tracing::warn!("Aborted {} of {} background tasks", aborted, total);
    }
    let engines = controller.engines();
    for key in engines.keys() {
        if let Some(engine) = engines.remove(&key) {
            engine.close_stream();
        }
    }
    Ok(())
}
