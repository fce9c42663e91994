//! Bounded-concurrency log-bundle runner.
//!
//! The collector hosts a single-threaded cooperative runtime: its workload
//! is I/O-bound subprocess invocations and file reads, so one OS thread is
//! enough. Anomalies are accepted one at a time in receive order; the
//! actions of every in-flight anomaly share one semaphore, so no more than
//! [`MAX_CONCURRENT_ACTIONS`] actions run at any moment across all
//! anomalies. A new anomaly may begin scheduling as soon as a slot frees.
//!
//! Per-action failures never cancel sibling actions, and a failed bundle
//! never stalls other bundles beyond the concurrency limit. A bundle is
//! finalized (archived and its working directory removed) regardless of
//! individual action outcomes, so a partially populated bundle still ships.

use crate::actions::{finalize_bundle, QuickAction};
use crate::anomaly::{AnomalyAction, AnomalyKind};
use crate::audit::{ActionOutcome, AuditEntry, AuditLog};
use crate::supervisor::WorkerError;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

/// Cap on in-flight actions across all anomalies.
pub const MAX_CONCURRENT_ACTIONS: usize = 4;

/// Thread-safe collector counters (shared with concurrent action tasks).
#[derive(Debug, Default)]
pub struct CollectorMetrics {
    bundles_completed: AtomicU64,
    actions_failed: AtomicU64,
    inflight_actions: AtomicU64,
    max_inflight_actions: AtomicU64,
}

impl CollectorMetrics {
    pub fn bundles_completed(&self) -> u64 {
        self.bundles_completed.load(Ordering::Relaxed)
    }

    pub fn actions_failed(&self) -> u64 {
        self.actions_failed.load(Ordering::Relaxed)
    }

    pub fn inflight_actions(&self) -> u64 {
        self.inflight_actions.load(Ordering::Relaxed)
    }

    /// High-water mark of concurrently running actions.
    pub fn max_inflight_actions(&self) -> u64 {
        self.max_inflight_actions.load(Ordering::Relaxed)
    }

    fn action_started(&self) {
        let now = self.inflight_actions.fetch_add(1, Ordering::Relaxed) + 1;
        self.max_inflight_actions.fetch_max(now, Ordering::Relaxed);
    }

    fn action_finished(&self, ok: bool) {
        self.inflight_actions.fetch_sub(1, Ordering::Relaxed);
        if !ok {
            self.actions_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn bundle_completed(&self) {
        self.bundles_completed.fetch_add(1, Ordering::Relaxed);
    }
}

/// Runs log-collection bundles for detected anomalies.
pub struct Collector {
    /// Receiver survives worker restarts: a respawned run re-locks it.
    rx: Arc<Mutex<mpsc::Receiver<Option<AnomalyAction>>>>,
    registry: Arc<BTreeMap<AnomalyKind, Vec<QuickAction>>>,
    batches_dir: PathBuf,
    archive_extension: String,
    audit: Arc<AuditLog>,
    metrics: Arc<CollectorMetrics>,
}

impl Collector {
    pub fn new(
        config: &crate::config::Config,
        rx: Arc<Mutex<mpsc::Receiver<Option<AnomalyAction>>>>,
        metrics: Arc<CollectorMetrics>,
    ) -> Self {
        Self {
            rx,
            registry: Arc::new(crate::actions::build_action_registry(config)),
            batches_dir: config.batches_dir(),
            archive_extension: config.cleanup.archive_extension.clone(),
            audit: Arc::new(AuditLog::new(&config.aod_output_dir)),
            metrics,
        }
    }

    #[cfg(test)]
    fn with_registry(
        registry: BTreeMap<AnomalyKind, Vec<QuickAction>>,
        rx: Arc<Mutex<mpsc::Receiver<Option<AnomalyAction>>>>,
        output_root: &std::path::Path,
        metrics: Arc<CollectorMetrics>,
    ) -> Self {
        Self {
            rx,
            registry: Arc::new(registry),
            batches_dir: output_root.join("batches"),
            archive_extension: ".tar.zst".to_string(),
            audit: Arc::new(AuditLog::new(output_root)),
            metrics,
        }
    }

    /// Runs the accept loop on a fresh current-thread runtime until the
    /// terminating sentinel, then drains every in-flight bundle.
    pub fn run(&self) -> Result<(), WorkerError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        runtime.block_on(self.accept_loop());
        Ok(())
    }

    async fn accept_loop(&self) {
        info!(batches_dir = ?self.batches_dir, "collector started");
        let mut rx = self.rx.lock().await;
        let semaphore = Arc::new(Semaphore::new(MAX_CONCURRENT_ACTIONS));
        let mut bundles: JoinSet<()> = JoinSet::new();

        loop {
            tokio::select! {
                // Reap finished bundles without blocking the accept path.
                Some(result) = bundles.join_next(), if !bundles.is_empty() => {
                    if let Err(e) = result {
                        error!(error = %e, "bundle task panicked");
                    }
                }

                msg = rx.recv() => match msg {
                    Some(Some(action)) => self.start_bundle(action, &semaphore, &mut bundles),
                    // Sentinel (or a dropped upstream): stop accepting.
                    Some(None) | None => break,
                },
            }
        }

        // Drain in-flight bundles; no new semaphore-gated work starts past
        // this point because the accept loop is done.
        while let Some(result) = bundles.join_next().await {
            if let Err(e) = result {
                error!(error = %e, "bundle task panicked during drain");
            }
        }
        info!("collector stopped");
    }

    fn start_bundle(
        &self,
        action: AnomalyAction,
        semaphore: &Arc<Semaphore>,
        bundles: &mut JoinSet<()>,
    ) {
        let Some(actions) = self.registry.get(&action.kind) else {
            warn!(kind = %action.kind, "no actions registered for kind, dropping anomaly");
            return;
        };
        if actions.is_empty() {
            warn!(kind = %action.kind, "empty action list for kind, dropping anomaly");
            return;
        }

        let bundle = Bundle {
            kind: action.kind,
            timestamp_ns: action.timestamp_ns,
            actions: actions.clone(),
            work_dir: self.batches_dir.join(format!("aod_quick_{}", action.timestamp_ns)),
            archive_path: self
                .batches_dir
                .join(format!("aod_quick_{}{}", action.timestamp_ns, self.archive_extension)),
            semaphore: Arc::clone(semaphore),
            audit: Arc::clone(&self.audit),
            metrics: Arc::clone(&self.metrics),
        };
        bundles.spawn(bundle.collect());
    }

    pub fn metrics(&self) -> &Arc<CollectorMetrics> {
        &self.metrics
    }
}

/// One anomaly's worth of scheduled work.
struct Bundle {
    kind: AnomalyKind,
    timestamp_ns: u64,
    actions: Vec<QuickAction>,
    work_dir: PathBuf,
    archive_path: PathBuf,
    semaphore: Arc<Semaphore>,
    audit: Arc<AuditLog>,
    metrics: Arc<CollectorMetrics>,
}

impl Bundle {
    async fn collect(self) {
        if let Err(e) = tokio::fs::create_dir_all(&self.work_dir).await {
            error!(dir = ?self.work_dir, error = %e, "cannot create bundle directory");
            return;
        }

        let mut tasks: JoinSet<ActionOutcome> = JoinSet::new();
        for action in self.actions {
            let semaphore = Arc::clone(&self.semaphore);
            let metrics = Arc::clone(&self.metrics);
            let dir = self.work_dir.clone();
            tasks.spawn(async move {
                // The owned permit is released on every exit path, including
                // cancellation, when it drops.
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return ActionOutcome { name: action.name().to_string(), ok: false },
                };
                metrics.action_started();
                let result = action.execute(&dir).await;
                metrics.action_finished(result.is_ok());
                if let Err(e) = &result {
                    warn!(action = action.name(), error = %e, "log action failed");
                }
                ActionOutcome { name: action.name().to_string(), ok: result.is_ok() }
            });
        }

        let mut outcomes = Vec::new();
        while let Some(result) = tasks.join_next().await {
            match result {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => error!(error = %e, "action task panicked"),
            }
        }

        // Finalize even when some actions failed: a partial bundle still
        // has forensic value.
        let work_dir = self.work_dir.clone();
        let archive_path = self.archive_path.clone();
        let finalized = tokio::task::spawn_blocking(move || finalize_bundle(&work_dir, &archive_path))
            .await;
        let finalized = match finalized {
            Ok(Ok(())) => {
                self.metrics.bundle_completed();
                info!(archive = ?self.archive_path, "bundle finalized");
                true
            }
            Ok(Err(e)) => {
                error!(archive = ?self.archive_path, error = %e, "bundle finalization failed");
                false
            }
            Err(e) => {
                error!(error = %e, "finalize task panicked");
                false
            }
        };

        let entry = AuditEntry {
            timestamp_ns: self.timestamp_ns,
            kind: self.kind,
            archive: self.archive_path,
            finalized,
            actions: outcomes,
        };
        if let Err(e) = self.audit.record(&entry).await {
            warn!(error = %e, "audit append failed");
        }
    }
}
