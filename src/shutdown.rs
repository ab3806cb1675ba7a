//! Cooperative shutdown: a flag flipped by Ctrl-C / SIGTERM and polled by
//! every long-running phase between units of work.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use log::{error, warn};

#[derive(Debug, Clone, Default)]
pub struct ShutdownFlag {
    requested: Arc<AtomicBool>,
}

impl ShutdownFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.requested.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }
}

/// Spawns a watcher thread that sets `flag` on the first termination signal.
/// In-flight requests are allowed to finish; phases stop at their next check.
pub fn install_signal_handler(flag: ShutdownFlag) {
    thread::Builder::new()
        .name("signal-watcher".to_string())
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(err) => {
                    error!("Failed to start signal watcher runtime: {err}");
                    return;
                }
            };
            runtime.block_on(wait_for_termination());
            warn!("Received stop signal. Finishing current work and exiting gracefully...");
            flag.request();
        })
        .map(|_| ())
        .unwrap_or_else(|err| error!("Failed to spawn signal watcher thread: {err}"));
}

#[cfg(unix)]
async fn wait_for_termination() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut terminate) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = terminate.recv() => {}
            }
        }
        Err(err) => {
            warn!("SIGTERM handler unavailable ({err}); listening for Ctrl-C only");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_termination() {
    let _ = tokio::signal::ctrl_c().await;
}
