/// Graceful shutdown (spec §10.5): waits for the platform interrupt signal,
/// takes the same critical lock every batch write holds, and exits once
/// any in-flight write has finished.
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;
use tracing::info;

/// Spawns the shutdown watcher. Returns immediately; the spawned task runs
/// for the lifetime of the process.
pub fn spawn_shutdown_handler(critical: Arc<AsyncMutex<()>>) {
    tokio::spawn(async move {
        wait_for_interrupt().await;
        info!("shutdown signal received, waiting for in-flight writes to settle");
        let _guard = critical.lock().await;
        info!("database quiesced, exiting");
        std::process::exit(0);
    });
}

#[cfg(unix)]
async fn wait_for_interrupt() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut terminate = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_interrupt() {
    let _ = tokio::signal::ctrl_c().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn spawned_handler_does_not_block_caller() {
        let critical = Arc::new(AsyncMutex::new(()));
        spawn_shutdown_handler(critical.clone());
        // The watcher parked on the signal future; the lock is still free.
        assert!(critical.try_lock().is_ok());
    }
}
