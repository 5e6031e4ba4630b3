//! Background supervision for the durable queue.
//!
//! Lease expiry has no server-side timeout: a supervisor must drive the
//! reaper periodically. The housekeeper also applies terminal-job
//! retention on the same cadence.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::config::{LeaseConfig, QueueConfig};
use super::queue::LeaseExpiryScanner;

#[derive(Debug)]
pub struct Housekeeper {
    interval: Duration,
    retention: chrono::Duration,
    shutdown_token: CancellationToken,
}

impl Housekeeper {
    pub fn new(lease: &LeaseConfig, queue: &QueueConfig) -> Self {
        Self {
            interval: Duration::from_millis(lease.housekeeper_interval_ms),
            retention: chrono::Duration::days(queue.terminal_retention_days),
            shutdown_token: CancellationToken::new(),
        }
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    /// Spawn the periodic reap/purge loop. The returned handle completes
    /// after the shutdown token is cancelled.
    pub fn start<Q>(&self, queue: Arc<Q>) -> JoinHandle<()>
    where
        Q: LeaseExpiryScanner + 'static,
    {
        let interval = self.interval;
        let retention = self.retention;
        let shutdown = self.shutdown_token.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        info!("housekeeper shutting down");
                        break;
                    }
                    _ = tokio::time::sleep(interval) => {
                        let now = Utc::now();
                        if let Err(err) = queue.reap_expired(now).await {
                            warn!("housekeeper reap_expired error: {err}");
                        }
                        if let Err(err) = queue.purge_terminal(now - retention).await {
                            warn!("housekeeper purge_terminal error: {err}");
                        }
                    }
                }
            }
        })
    }

    pub fn shutdown(&self) {
        self.shutdown_token.cancel();
    }
}
