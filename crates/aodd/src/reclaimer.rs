//! Disk-space reclamation for finalized bundles.
//!
//! Periodically measures the finalized archives under the batches
//! directory and enforces two budgets: a size budget with a high/low
//! watermark pair (cleanup starts at 90% of the budget and deletes
//! oldest-first down to 50%, so it does not thrash), and an age budget
//! swept once per age window. Only finalized archives are ever considered;
//! in-progress bundle directories and `.tmp` files never match the
//! extension filter, which is what makes deletion race-free without locks.

use crate::config::{CleanupConfig, Config};
use crate::shutdown::ShutdownSignal;
use crate::supervisor::WorkerError;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};

/// How often the sleep loop re-checks the shutdown flag.
const SHUTDOWN_CHECK_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug)]
struct ArchiveEntry {
    path: PathBuf,
    len: u64,
    mtime: SystemTime,
}

/// Enforces the disk budgets under the batches directory.
pub struct Reclaimer {
    batches_dir: PathBuf,
    cleanup: CleanupConfig,
    last_age_sweep: SystemTime,
    shutdown: ShutdownSignal,
}

impl Reclaimer {
    pub fn new(config: &Config, shutdown: ShutdownSignal) -> Self {
        Self {
            batches_dir: config.batches_dir(),
            cleanup: config.cleanup.clone(),
            last_age_sweep: SystemTime::now(),
            shutdown,
        }
    }

    /// Wakes every `cleanup_interval_sec` until shutdown.
    pub fn run(mut self) -> Result<(), WorkerError> {
        info!(dir = ?self.batches_dir, "reclaimer started");
        while !self.shutdown.is_shutdown() {
            self.sleep_interval();
            if self.shutdown.is_shutdown() {
                break;
            }
            self.tick();
        }
        info!("reclaimer stopped");
        Ok(())
    }

    fn sleep_interval(&self) {
        let deadline = SystemTime::now() + self.cleanup.interval();
        while SystemTime::now() < deadline && !self.shutdown.is_shutdown() {
            thread::sleep(SHUTDOWN_CHECK_INTERVAL.min(self.cleanup.interval()));
        }
    }

    /// One measurement-and-cleanup pass.
    pub fn tick(&mut self) {
        let entries = match self.scan() {
            Ok(entries) => entries,
            Err(e) => {
                warn!(error = %e, "bundle scan failed, retrying next tick");
                return;
            }
        };

        let total: u64 = entries.iter().map(|e| e.len).sum();
        let budget = self.cleanup.max_total_bytes();
        debug!(archives = entries.len(), total_bytes = total, "reclaimer tick");

        if total >= budget / 10 * 9 {
            self.cleanup_by_size(entries, total);
        } else if self.age_sweep_due() {
            self.cleanup_by_age(&entries);
        }
    }

    /// Finalized archives directly under the batches directory: regular
    /// files named `aod_*` with the configured archive extension.
    fn scan(&self) -> io::Result<Vec<ArchiveEntry>> {
        let dir = match fs::read_dir(&self.batches_dir) {
            Ok(dir) => dir,
            // Nothing collected yet.
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut entries = Vec::new();
        for entry in dir {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !name.starts_with("aod_") || !name.ends_with(&self.cleanup.archive_extension) {
                continue;
            }
            match entry.metadata() {
                Ok(meta) if meta.is_file() => entries.push(ArchiveEntry {
                    path: entry.path(),
                    len: meta.len(),
                    mtime: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
                }),
                Ok(_) => {}
                Err(e) => warn!(path = ?entry.path(), error = %e, "skipping unreadable entry"),
            }
        }
        Ok(entries)
    }

    /// Deletes oldest-first until total falls to the 50% low watermark.
    fn cleanup_by_size(&self, mut entries: Vec<ArchiveEntry>, total: u64) {
        let low_watermark = self.cleanup.max_total_bytes() / 2;
        entries.sort_by_key(|e| e.mtime);

        let mut remaining = total;
        let mut deleted = 0usize;
        for entry in &entries {
            if remaining <= low_watermark {
                break;
            }
            match fs::remove_file(&entry.path) {
                Ok(()) => {
                    remaining -= entry.len;
                    deleted += 1;
                    info!(path = ?entry.path, bytes = entry.len, "deleted archive (size budget)");
                }
                Err(e) => warn!(path = ?entry.path, error = %e, "failed to delete archive"),
            }
        }
        info!(deleted, remaining_bytes = remaining, "size-based cleanup complete");
    }

    /// True once per `max_log_age_days` window.
    fn age_sweep_due(&mut self) -> bool {
        let now = SystemTime::now();
        let elapsed = now
            .duration_since(self.last_age_sweep)
            .unwrap_or(Duration::ZERO);
        if elapsed >= self.cleanup.max_age() {
            self.last_age_sweep = now;
            return true;
        }
        false
    }

    /// Deletes archives whose mtime is older than the age window.
    fn cleanup_by_age(&self, entries: &[ArchiveEntry]) {
        let Some(cutoff) = SystemTime::now().checked_sub(self.cleanup.max_age()) else {
            return;
        };

        let mut deleted = 0usize;
        for entry in entries.iter().filter(|e| e.mtime < cutoff) {
            match fs::remove_file(&entry.path) {
                Ok(()) => {
                    deleted += 1;
                    info!(path = ?entry.path, "deleted archive (age budget)");
                }
                Err(e) => warn!(path = ?entry.path, error = %e, "failed to delete archive"),
            }
        }
        info!(deleted, "age-based cleanup complete");
    }
}
