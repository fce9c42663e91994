//! Anomaly watcher: coalesces event batches and runs the per-kind handlers.
//!
//! One detector per configured kind, built once from config. Each tick
//! takes one batch blocking, then coalesces whatever else arrives within a
//! short window - this bounds jitter without stalling under load. Events
//! are masked per kind by the producing tool id before detection.

use crate::anomaly::{AnomalyAction, AnomalyKind};
use crate::config::Config;
use crate::handlers::AnomalyHandler;
use crate::shutdown::ShutdownSignal;
use crate::supervisor::WorkerError;
use crossbeam_channel::{Receiver, RecvTimeoutError, TryRecvError};
use shmring::{Event, EventBatch};
use std::collections::BTreeMap;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Bound on the post-receive coalescing window.
const COALESCE_WAIT: Duration = Duration::from_millis(5);

/// How long a blocking receive waits before re-checking the shutdown flag.
const RECV_CHECK_INTERVAL: Duration = Duration::from_millis(500);

/// Idle receive timeouts tolerated after shutdown is flagged, giving the
/// dispatcher's final drain time to land its batch and sentinel. Must stay
/// under the supervisor's join timeout.
const SHUTDOWN_GRACE_TICKS: u32 = 4;

/// Consumes event batches, emits anomaly actions.
pub struct Watcher {
    rx: Receiver<Option<EventBatch>>,
    tx: tokio::sync::mpsc::Sender<Option<AnomalyAction>>,
    handlers: BTreeMap<AnomalyKind, AnomalyHandler>,
    interval: Duration,
    shutdown: ShutdownSignal,
}

impl Watcher {
    pub fn new(
        config: &Config,
        rx: Receiver<Option<EventBatch>>,
        tx: tokio::sync::mpsc::Sender<Option<AnomalyAction>>,
        shutdown: ShutdownSignal,
    ) -> Self {
        let mut handlers = BTreeMap::new();
        for anomaly in config.guardian.anomalies.values() {
            handlers.insert(anomaly.kind, AnomalyHandler::from_config(anomaly));
        }
        Self {
            rx,
            tx,
            handlers,
            interval: Duration::from_secs(config.watch_interval_sec),
            shutdown,
        }
    }

    /// Runs until the upstream sentinel arrives, forwarding it exactly once.
    pub fn run(self) -> Result<(), WorkerError> {
        info!(kinds = self.handlers.len(), "watcher started");
        loop {
            let mut batch = match self.next_batch() {
                Some(batch) => batch,
                None => break,
            };
            let saw_sentinel = self.coalesce_into(&mut batch);

            self.evaluate(&batch)?;

            if saw_sentinel {
                break;
            }
            thread::sleep(self.interval);
        }

        let _ = self.tx.blocking_send(None);
        info!("watcher stopped");
        Ok(())
    }

    /// Blocks for the next batch; `None` means the pipeline is terminating
    /// (sentinel, disconnected upstream, or shutdown with a wedged
    /// upstream).
    fn next_batch(&self) -> Option<EventBatch> {
        let mut shutdown_grace = SHUTDOWN_GRACE_TICKS;
        loop {
            match self.rx.recv_timeout(RECV_CHECK_INTERVAL) {
                Ok(Some(batch)) => return Some(batch),
                Ok(None) | Err(RecvTimeoutError::Disconnected) => return None,
                Err(RecvTimeoutError::Timeout) => {
                    if self.shutdown.is_shutdown() {
                        // Normally the dispatcher's sentinel ends this loop;
                        // the grace countdown only matters when upstream is
                        // wedged and will never send it.
                        if shutdown_grace == 0 {
                            return None;
                        }
                        shutdown_grace -= 1;
                    }
                }
            }
        }
    }

    /// Concatenates any batches that arrive within the coalescing window.
    /// Returns `true` if the terminating sentinel was pulled while
    /// coalescing.
    fn coalesce_into(&self, batch: &mut EventBatch) -> bool {
        let deadline = Instant::now() + COALESCE_WAIT;
        loop {
            match self.rx.try_recv() {
                Ok(Some(more)) => batch.extend(more),
                Ok(None) | Err(TryRecvError::Disconnected) => return true,
                Err(TryRecvError::Empty) => {
                    if Instant::now() >= deadline {
                        return false;
                    }
                    thread::sleep(Duration::from_micros(500));
                }
            }
        }
    }

    /// Runs every handler over its masked slice of the batch, emitting at
    /// most one action per kind.
    fn evaluate(&self, batch: &[Event]) -> Result<(), WorkerError> {
        for (&kind, handler) in &self.handlers {
            let masked: Vec<Event> = batch
                .iter()
                .filter(|e| e.tool == kind.tool_id())
                .copied()
                .collect();
            if masked.is_empty() {
                continue;
            }
            if handler.detect(&masked) {
                let action = AnomalyAction::now(kind);
                debug!(%kind, timestamp_ns = action.timestamp_ns, "anomaly detected");
                self.tx
                    .blocking_send(Some(action))
                    .map_err(|_| WorkerError::ChannelClosed)?;
            }
        }
        Ok(())
    }
}
