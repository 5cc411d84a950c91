//! Notification bridge (C6, §4.6).
//!
//! Maintains a `PgListener` subscription to `new_tasks` with reconnect
//! backoff and a liveness ping, forwarding wake-ups to the worker pool's
//! 1-slot `Notify` handle. Grounded in mindia-worker's `worker_pool()`
//! reconnect-on-`PgListener`-failure loop, which uses the identical
//! min/max backoff shape this component calls for.

use std::time::Duration;

use sqlx::postgres::PgListener;
use sqlx::PgPool;
use tokio::sync::{broadcast, Notify};

const MIN_BACKOFF: Duration = Duration::from_secs(10);
const MAX_BACKOFF: Duration = Duration::from_secs(60);
const LIVENESS_PING_INTERVAL: Duration = Duration::from_secs(90);
const CHANNEL: &str = "new_tasks";

pub struct NotifyBridge {
    pool: PgPool,
}

impl NotifyBridge {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Runs until `shutdown` fires. Workers keep functioning via their own
    /// backoff polling even while this loop is reconnecting (§4.6, §5).
    pub async fn run(self, wake: std::sync::Arc<Notify>, mut shutdown: broadcast::Receiver<()>) {
        let mut backoff = MIN_BACKOFF;

        loop {
            let mut listener = match PgListener::connect_with(&self.pool).await {
                Ok(listener) => listener,
                Err(err) => {
                    log::warn!(target: "scheduler::notify_bridge", "failed to connect listener: {err}; retrying in {backoff:?}");
                    if sleep_or_shutdown(backoff, &mut shutdown).await {
                        return;
                    }
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                    continue;
                }
            };

            if let Err(err) = listener.listen(CHANNEL).await {
                log::warn!(target: "scheduler::notify_bridge", "failed to LISTEN {CHANNEL}: {err}; retrying in {backoff:?}");
                if sleep_or_shutdown(backoff, &mut shutdown).await {
                    return;
                }
                backoff = (backoff * 2).min(MAX_BACKOFF);
                continue;
            }

            backoff = MIN_BACKOFF;
            log::info!(target: "scheduler::notify_bridge", "subscribed to {CHANNEL}");

            loop {
                tokio::select! {
                    notification = listener.recv() => {
                        match notification {
                            Ok(_) => wake.notify_one(),
                            Err(err) => {
                                log::warn!(target: "scheduler::notify_bridge", "listener error: {err}; reconnecting");
                                break;
                            }
                        }
                    }
                    () = tokio::time::sleep(LIVENESS_PING_INTERVAL) => {
                        log::debug!(target: "scheduler::notify_bridge", "liveness ping: still subscribed to {CHANNEL}");
                    }
                    _ = shutdown.recv() => return,
                }
            }
        }
    }
}

/// Returns `true` if shutdown fired during the wait.
async fn sleep_or_shutdown(duration: Duration, shutdown: &mut broadcast::Receiver<()>) -> bool {
    tokio::select! {
        () = tokio::time::sleep(duration) => false,
        _ = shutdown.recv() => true,
    }
}
