use std::sync::LazyLock;

use egress_common::{Liveness, Signal, internal};
use tokio::sync::broadcast;

use crate::Egress;

pub static SHUTDOWN_BROADCAST: LazyLock<broadcast::Sender<Signal>> = LazyLock::new(|| {
    let (sender, _receiver) = broadcast::channel(64);
    sender
});

#[tracing::instrument(level = "trace")]
async fn shutdown() -> anyhow::Result<()> {
    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            internal!(level = INFO, "CTRL+C entered -- Enter it again to force shutdown");
        }
        _ = terminate.recv() => {
            internal!(level = INFO, "Terminate Signal received, shutting down");
        }
    };

    SHUTDOWN_BROADCAST
        .send(Signal::Shutdown)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Interrupted, e.to_string()))?;

    tokio::signal::ctrl_c().await?;
    internal!(level = WARN, "Forcing shutdown");

    Ok(())
}

impl Egress {
    /// Run the queue worker until SIGINT or SIGTERM
    ///
    /// Logging is expected to be initialised already, see
    /// [`egress_common::logging::init`].
    ///
    /// # Errors
    ///
    /// This function will return an error if the stores cannot be built or
    /// migrated, or the signal handlers cannot be installed.
    #[tracing::instrument(level = "trace", skip_all, err)]
    pub async fn run(self) -> anyhow::Result<()> {
        let stores = self.stores()?;
        if stores.is_persistent() {
            stores.migrate().await?;
        } else {
            internal!(
                level = WARN,
                "Using the in-memory store; the queue is not shared with other hosts"
            );
        }

        if self.processor.is_dry_run() {
            internal!(
                level = WARN,
                "Processor is Log; claimed rows are logged and stay locked until swept"
            );
        }

        let worker = self.worker(&stores, Liveness::new());

        internal!(
            level = INFO,
            worker_name = %self.worker.worker_name,
            batch_size = self.worker.batch_size,
            "Controller running"
        );

        let ret = tokio::select! {
            r = worker.serve(SHUTDOWN_BROADCAST.subscribe()) => {
                r.map_err(anyhow::Error::from)
            }
            r = shutdown() => {
                r
            }
        };

        internal!(level = INFO, "Shutting down...");

        ret
    }
}
