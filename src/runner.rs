//! Signal-aware entrypoint.
//!
//! [`run`] executes a [`Scraper`] under OS signal handling: the first
//! SIGINT/SIGTERM starts a graceful shutdown (in-flight dispatches get the
//! configured grace period), a second signal cancels everything
//! immediately. The returned exit code follows convention: 0 for a clean
//! run, 1 for a startup or client error, 130 when a signal ended the run.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::engine::core::Engine;
use crate::scraper::Scraper;

const EXIT_OK: i32 = 0;
const EXIT_ERROR: i32 = 1;
const EXIT_SIGNAL: i32 = 130;

/// Runs the scraper to completion with signal handling and returns the
/// process exit code.
pub async fn run(scraper: Scraper) -> i32 {
    let engine = match Engine::build(scraper) {
        Ok(engine) => engine,
        Err(e) => {
            error!(error = %e, "startup failed");
            return EXIT_ERROR;
        }
    };

    let shutdown = engine.shutdown_token();
    let force = engine.force_token();
    let grace = engine.shutdown_grace();
    let signaled = Arc::new(AtomicBool::new(false));

    let watcher = tokio::spawn(signal_watcher(
        shutdown.clone(),
        force.clone(),
        Arc::clone(&signaled),
    ));

    // Once a graceful shutdown starts, the grace period bounds how long
    // in-flight work may keep running before everything is cancelled.
    let escalation = tokio::spawn({
        let shutdown = shutdown.clone();
        let force = force.clone();
        async move {
            shutdown.cancelled().await;
            tokio::time::sleep(grace).await;
            force.cancel();
        }
    });

    let result = engine.run().await;
    watcher.abort();
    escalation.abort();

    match result {
        Ok(()) if signaled.load(Ordering::SeqCst) => EXIT_SIGNAL,
        Ok(()) => EXIT_OK,
        Err(e) => {
            error!(error = %e, "run failed");
            if signaled.load(Ordering::SeqCst) {
                EXIT_SIGNAL
            } else {
                EXIT_ERROR
            }
        }
    }
}

#[cfg(unix)]
async fn signal_watcher(
    shutdown: CancellationToken,
    force: CancellationToken,
    signaled: Arc<AtomicBool>,
) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(e) => {
            error!(error = %e, "cannot install SIGTERM handler");
            return ctrl_c_only(shutdown, force, signaled).await;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("SIGINT received, starting shutdown"),
        _ = term.recv() => info!("SIGTERM received, starting shutdown"),
    }
    signaled.store(true, Ordering::SeqCst);
    shutdown.cancel();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
    error!("second signal received, cancelling immediately");
    force.cancel();
}

#[cfg(not(unix))]
async fn signal_watcher(
    shutdown: CancellationToken,
    force: CancellationToken,
    signaled: Arc<AtomicBool>,
) {
    ctrl_c_only(shutdown, force, signaled).await;
}

async fn ctrl_c_only(
    shutdown: CancellationToken,
    force: CancellationToken,
    signaled: Arc<AtomicBool>,
) {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("interrupt received, starting shutdown");
        signaled.store(true, Ordering::SeqCst);
        shutdown.cancel();
    }
    if tokio::signal::ctrl_c().await.is_ok() {
        error!("second interrupt received, cancelling immediately");
        force.cancel();
    }
}
