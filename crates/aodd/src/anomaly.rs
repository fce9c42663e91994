//! Anomaly kinds, the command table, and the action records that flow from
//! the watcher to the collector.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// SMB2 protocol commands known to the kernel-side tools, in wire-id order.
pub const ALL_SMB_COMMANDS: [(&str, u16); 20] = [
    ("SMB2_NEGOTIATE", 0),
    ("SMB2_SESSION_SETUP", 1),
    ("SMB2_LOGOFF", 2),
    ("SMB2_TREE_CONNECT", 3),
    ("SMB2_TREE_DISCONNECT", 4),
    ("SMB2_CREATE", 5),
    ("SMB2_CLOSE", 6),
    ("SMB2_FLUSH", 7),
    ("SMB2_READ", 8),
    ("SMB2_WRITE", 9),
    ("SMB2_LOCK", 10),
    ("SMB2_IOCTL", 11),
    ("SMB2_CANCEL", 12),
    ("SMB2_ECHO", 13),
    ("SMB2_QUERY_DIRECTORY", 14),
    ("SMB2_CHANGE_NOTIFY", 15),
    ("SMB2_QUERY_INFO", 16),
    ("SMB2_SET_INFO", 17),
    ("SMB2_OPLOCK_BREAK", 18),
    ("SMB2_SERVER_TO_CLIENT_NOTIFICATION", 19),
];

/// Number of known SMB2 commands; valid ids are `0..N_SMB_COMMANDS`.
pub const N_SMB_COMMANDS: usize = ALL_SMB_COMMANDS.len();

/// Looks up a command id by its protocol name.
pub fn smb_command_id(name: &str) -> Option<u16> {
    ALL_SMB_COMMANDS
        .iter()
        .find(|(cmd, _)| *cmd == name)
        .map(|&(_, id)| id)
}

/// The closed set of anomaly kinds the watcher can detect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnomalyKind {
    /// Command latency outliers against per-command thresholds.
    Latency,
    /// Error-code bursts. Reserved: the detector is a stub until the
    /// kernel-side error tool lands.
    Error,
}

impl AnomalyKind {
    /// The tool id stamped into events by the kernel-side producer for this
    /// kind. Batches are masked by this id before detection.
    #[inline]
    pub const fn tool_id(self) -> u8 {
        match self {
            Self::Latency => 0,
            Self::Error => 1,
        }
    }

    /// Parses the config spelling (case-insensitive).
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "latency" => Some(Self::Latency),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

impl fmt::Display for AnomalyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Latency => write!(f, "latency"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// A detection outcome, emitted at most once per watcher tick per kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnomalyAction {
    pub kind: AnomalyKind,
    /// Wall-clock nanoseconds since the epoch; doubles as the bundle id.
    pub timestamp_ns: u64,
}

impl AnomalyAction {
    /// Stamps an action for `kind` at the current wall clock.
    pub fn now(kind: AnomalyKind) -> Self {
        let timestamp_ns = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_nanos() as u64);
        Self { kind, timestamp_ns }
    }
}
