//! Per-kind anomaly detectors.
//!
//! The watcher hands each handler the slice of a batch already masked down
//! to the handler's tool id; the handler only decides whether the window is
//! anomalous. Handlers are a closed enum dispatched from a table built once
//! from config - new kinds are added here, not discovered at runtime.

use crate::anomaly::{AnomalyKind, N_SMB_COMMANDS};
use crate::config::AnomalyConfig;
use shmring::Event;

/// A single event at or above this latency is anomalous on its own,
/// regardless of `acceptable_count`.
pub const HARD_LATENCY_CEILING_NS: u64 = 1_000_000_000;

/// Detector for one configured anomaly kind.
#[derive(Debug)]
pub enum AnomalyHandler {
    Latency(LatencyHandler),
    Error(ErrorHandler),
}

impl AnomalyHandler {
    /// Builds the handler matching `config.kind`.
    pub fn from_config(config: &AnomalyConfig) -> Self {
        match config.kind {
            AnomalyKind::Latency => Self::Latency(LatencyHandler::new(config)),
            AnomalyKind::Error => Self::Error(ErrorHandler),
        }
    }

    /// Returns `true` if the masked window is anomalous.
    pub fn detect(&self, events: &[Event]) -> bool {
        match self {
            Self::Latency(h) => h.detect(events),
            Self::Error(h) => h.detect(events),
        }
    }
}

/// Latency outlier detection against per-command thresholds.
///
/// Thresholds are precomputed into a dense table indexed by command id so
/// the per-event check is a load and a compare. Commands without a
/// configured threshold map to 0; the kernel-side tool is armed with the
/// tracked command set, so untracked commands are not expected in the
/// stream in the first place.
#[derive(Debug)]
pub struct LatencyHandler {
    threshold_ns: [u64; N_SMB_COMMANDS + 1],
    acceptable_count: u64,
}

impl LatencyHandler {
    pub fn new(config: &AnomalyConfig) -> Self {
        let mut threshold_ns = [0u64; N_SMB_COMMANDS + 1];
        for (&cmd, &threshold_ms) in &config.track {
            if let Some(slot) = threshold_ns.get_mut(cmd as usize) {
                *slot = threshold_ms * 1_000_000;
            }
        }
        Self {
            threshold_ns,
            acceptable_count: config.acceptable_count,
        }
    }

    /// Detects many commands crossing their thresholds, or any single
    /// command crossing the one-second ceiling.
    pub fn detect(&self, events: &[Event]) -> bool {
        let mut anomaly_count = 0u64;
        let mut max_latency = 0u64;
        for event in events {
            let latency = event.latency_ns();
            let threshold = self
                .threshold_ns
                .get(event.smbcommand as usize)
                .copied()
                .unwrap_or(0);
            if latency >= threshold {
                anomaly_count += 1;
            }
            max_latency = max_latency.max(latency);
        }

        tracing::debug!(
            anomaly_count,
            max_latency_ms = max_latency / 1_000_000,
            "latency window evaluated"
        );
        anomaly_count >= self.acceptable_count || max_latency >= HARD_LATENCY_CEILING_NS
    }
}

/// Error-code burst detection.
///
/// Reserved extension: the kernel-side error tool is not wired up yet, so
/// this always reports a quiet window. The dispatch structure is kept so a
/// real detector can drop in without touching the watcher.
#[derive(Debug)]
pub struct ErrorHandler;

impl ErrorHandler {
    #[allow(clippy::unused_self)]
    pub fn detect(&self, _events: &[Event]) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anomaly::AnomalyKind;
    use std::collections::BTreeMap;

    fn latency_config(acceptable_count: u64, track: &[(u16, u64)]) -> AnomalyConfig {
        AnomalyConfig {
            kind: AnomalyKind::Latency,
            tool: "smbsloweraod".to_string(),
            acceptable_count,
            default_threshold_ms: None,
            track: track.iter().copied().collect::<BTreeMap<_, _>>(),
            actions: Vec::new(),
        }
    }

    fn event(cmd: u16, latency_ns: u64) -> Event {
        Event {
            pid: 1,
            cmd_end_time_ns: 0,
            session_id: 0,
            mid: 0,
            smbcommand: cmd,
            metric: latency_ns,
            tool: 0,
            is_compounded: 0,
            task: [0; 16],
        }
    }

    #[test]
    fn under_threshold_batch_is_quiet() {
        // 5 records one nanosecond under the SMB2_READ threshold.
        let handler = LatencyHandler::new(&latency_config(3, &[(8, 50)]));
        let threshold_ns = 50 * 1_000_000;
        let events: Vec<Event> = (0..5).map(|_| event(8, threshold_ns - 1)).collect();
        assert!(!handler.detect(&events));
    }

    #[test]
    fn exactly_acceptable_count_fires_once() {
        let handler = LatencyHandler::new(&latency_config(3, &[(8, 50)]));
        let threshold_ns = 50 * 1_000_000;
        let events: Vec<Event> = (0..3).map(|_| event(8, threshold_ns)).collect();
        assert!(handler.detect(&events));
    }

    #[test]
    fn single_spike_beats_acceptable_count() {
        // One 2-second event fires even with an unreachable count.
        let handler = LatencyHandler::new(&latency_config(1000, &[(8, 50)]));
        let events = vec![event(8, 2 * HARD_LATENCY_CEILING_NS)];
        assert!(handler.detect(&events));
    }

    #[test]
    fn mixed_commands_use_their_own_thresholds() {
        let handler = LatencyHandler::new(&latency_config(2, &[(8, 50), (9, 200)]));
        let events = vec![
            event(8, 60 * 1_000_000),  // over read threshold
            event(9, 100 * 1_000_000), // under write threshold
            event(9, 250 * 1_000_000), // over write threshold
        ];
        assert!(handler.detect(&events));
    }

    #[test]
    fn out_of_table_command_counts_against_zero_threshold() {
        let handler = LatencyHandler::new(&latency_config(2, &[(8, 50)]));
        // Command 40 is outside the table; threshold 0 means any latency
        // counts, matching the upstream expectation that the producer only
        // emits tracked commands.
        let events = vec![event(40, 1), event(40, 1)];
        assert!(handler.detect(&events));
    }

    #[test]
    fn error_handler_is_a_stub() {
        let handler = ErrorHandler;
        assert!(!handler.detect(&[event(8, u64::MAX)]));
    }
}
