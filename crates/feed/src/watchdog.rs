//! Liveness timer for one physical connection.
//!
//! Every inbound frame, data or liveness, must call [`HeartbeatWatchdog::reset`].
//! When the feed stays silent for a full interval the watchdog sends one
//! [`ForceReconnect`] and stops; the connection is torn down as if the transport
//! had failed, even though the socket may still look open.

use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, warn};

/// Request to tear down the named connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForceReconnect {
    pub connection_id: u64,
}

#[derive(Debug)]
pub struct HeartbeatWatchdog {
    interval: Duration,
    reset_tx: Option<watch::Sender<Instant>>,
    task: Option<JoinHandle<()>>,
}

impl HeartbeatWatchdog {
    #[must_use]
    pub const fn new(interval: Duration) -> Self {
        Self {
            interval,
            reset_tx: None,
            task: None,
        }
    }

    #[must_use]
    pub const fn interval(&self) -> Duration {
        self.interval
    }

    /// Arms the timer for `connection_id`. Any previous timer is stopped first.
    pub fn start(&mut self, connection_id: u64, on_expiry: mpsc::Sender<ForceReconnect>) {
        self.stop();

        let (reset_tx, mut reset_rx) = watch::channel(Instant::now());
        let interval = self.interval;
        let task = tokio::spawn(async move {
            let mut deadline = *reset_rx.borrow_and_update() + interval;
            loop {
                tokio::select! {
                    () = sleep_until(deadline) => {
                        warn!(connection_id, ?interval, "No message within watchdog interval, forcing reconnect");
                        let _ = on_expiry.send(ForceReconnect { connection_id }).await;
                        return;
                    }
                    changed = reset_rx.changed() => {
                        if changed.is_err() {
                            return;
                        }
                        deadline = *reset_rx.borrow_and_update() + interval;
                    }
                }
            }
        });

        debug!(connection_id, ?interval, "Watchdog started");
        self.reset_tx = Some(reset_tx);
        self.task = Some(task);
    }

    /// Pushes the deadline one interval past now. No-op when stopped.
    pub fn reset(&self) {
        if let Some(tx) = &self.reset_tx {
            tx.send_replace(Instant::now());
        }
    }

    pub fn stop(&mut self) {
        self.reset_tx = None;
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }
}

impl Drop for HeartbeatWatchdog {
    fn drop(&mut self) {
        self.stop();
    }
}
