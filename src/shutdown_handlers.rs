use std::fmt;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::args::Role;
use crate::shutdown::{ShutdownReceiver, ShutdownSender};

#[cfg(unix)]
use tokio::signal::unix::{SignalKind, signal};

/// Every task holds its own receiver; one message stops them all.
const SHUTDOWN_CHANNEL_CAPACITY: usize = 1;

#[must_use]
pub fn shutdown_channel() -> (ShutdownSender, ShutdownReceiver) {
    broadcast::channel::<()>(SHUTDOWN_CHANNEL_CAPACITY)
}

/// Process signal that asked the controller to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopSignal {
    Interrupt,
    Terminate,
}

impl fmt::Display for StopSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopSignal::Interrupt => f.write_str("SIGINT"),
            StopSignal::Terminate => f.write_str("SIGTERM"),
        }
    }
}

#[cfg(unix)]
async fn next_stop_signal() -> StopSignal {
    let mut term_signal = match signal(SignalKind::terminate()) {
        Ok(signal) => Some(signal),
        Err(err) => {
            tracing::warn!("SIGTERM cannot be observed, only SIGINT stops the controller: {}", err);
            None
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => StopSignal::Interrupt,
        () = async {
            match term_signal.as_mut() {
                Some(signal) => {
                    signal.recv().await;
                }
                None => std::future::pending::<()>().await,
            }
        } => StopSignal::Terminate,
    }
}

#[cfg(not(unix))]
async fn next_stop_signal() -> StopSignal {
    drop(tokio::signal::ctrl_c().await);
    StopSignal::Interrupt
}

/// Broadcast shutdown on the first stop signal; exits quietly when shutdown
/// was already broadcast by someone else.
pub fn setup_signal_shutdown_handler(shutdown_tx: &ShutdownSender, role: Role) -> JoinHandle<()> {
    let shutdown_tx = shutdown_tx.clone();
    let mut shutdown_rx = shutdown_tx.subscribe();
    tokio::spawn(async move {
        tokio::select! {
            _ = shutdown_rx.recv() => {}
            stop = next_stop_signal() => {
                tracing::info!(
                    "Received {}, stopping {:?} controller (streams: {}, loops: {})",
                    stop,
                    role,
                    role.runs_streams(),
                    role.runs_loops()
                );
                if shutdown_tx.send(()).is_err() {
                    tracing::debug!("No task was listening for shutdown");
                }
            }
        }
    })
}

/// Join background tasks after shutdown was broadcast.
///
/// A task still running after `grace` is aborted. Returns how many were.
#[must_use]
pub async fn drain_tasks(handles: Vec<JoinHandle<()>>, grace: Duration) -> usize {
    let mut aborted: usize = 0;
    for mut handle in handles {
        match tokio::time::timeout(grace, &mut handle).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => tracing::warn!("Background task ended abnormally: {}", err),
            Err(_elapsed) => {
                tracing::debug!("Background task ignored shutdown for {:?}, aborting", grace);
                handle.abort();
                aborted = aborted.saturating_add(1);
            }
        }
    }
    aborted
}
