//! Configuration loading and validation.
//!
//! The YAML file is deserialized into a raw serde layer, then resolved and
//! validated into the frozen [`Config`] the rest of the daemon consumes.
//! Validation is fail-fast: a bad config means the daemon exits non-zero
//! before any worker starts.
//!
//! ```yaml
//! watch_interval_sec: 1
//! aod_output_dir: /var/log/aod
//! guardian:
//!   anomalies:
//!     latency:
//!       type: Latency
//!       tool: smbsloweraod
//!       acceptable_count: 9
//!       default_threshold_ms: 10
//!       mode: trackonly
//!       track_commands:
//!         - command: SMB2_READ
//!           threshold: 50
//!         - command: SMB2_WRITE
//!       actions: [dmesg, mounts, stats]
//! cleanup:
//!   max_log_age_days: 2
//!   max_total_log_size_mb: 200
//!   cleanup_interval_sec: 60
//! ```

use crate::anomaly::{smb_command_id, AnomalyKind, ALL_SMB_COMMANDS};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

/// Threshold applied to tracked commands that do not carry their own.
pub const DEFAULT_THRESHOLD_MS: u64 = 10;

/// Where tool binaries are looked up unless the config overrides it.
pub const DEFAULT_TOOLS_DIR: &str = "/usr/libexec/aodd";

const DEFAULT_ARCHIVE_EXTENSION: &str = ".tar.zst";

/// Errno names accepted in error-anomaly track/exclude lists, with their
/// Linux numbers. A curated set; the error detector is a reserved extension
/// so this only gates validation.
const ERRNO_CODES: [(&str, u16); 28] = [
    ("EPERM", 1),
    ("ENOENT", 2),
    ("EINTR", 4),
    ("EIO", 5),
    ("ENXIO", 6),
    ("EBADF", 9),
    ("EAGAIN", 11),
    ("ENOMEM", 12),
    ("EACCES", 13),
    ("EFAULT", 14),
    ("EBUSY", 16),
    ("EEXIST", 17),
    ("ENODEV", 19),
    ("ENOTDIR", 20),
    ("EISDIR", 21),
    ("EINVAL", 22),
    ("ENFILE", 23),
    ("EMFILE", 24),
    ("EFBIG", 27),
    ("ENOSPC", 28),
    ("EROFS", 30),
    ("EPIPE", 32),
    ("ENETDOWN", 100),
    ("ENETUNREACH", 101),
    ("ECONNRESET", 104),
    ("ENOTCONN", 107),
    ("ETIMEDOUT", 110),
    ("ECONNREFUSED", 111),
];

fn errno_code(name: &str) -> Option<u16> {
    ERRNO_CODES.iter().find(|(n, _)| *n == name).map(|&(_, c)| c)
}

// =============================================================================
// ERRORS
// =============================================================================

/// Startup configuration failures. All of these abort the daemon.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read or deserialized.
    #[error("loading config: {0}")]
    Load(#[from] config::ConfigError),

    /// An anomaly entry names a kind this daemon does not implement.
    #[error("anomaly {anomaly:?}: unknown kind {kind:?}")]
    UnknownKind { anomaly: String, kind: String },

    /// An anomaly entry names an unknown track-resolution mode.
    #[error("anomaly {anomaly:?}: unknown mode {mode:?} (expected trackonly, excludeonly, or all)")]
    UnknownMode { anomaly: String, mode: String },

    /// A track or exclude list names a command outside the protocol table.
    #[error("anomaly {anomaly:?}: unknown command {name:?}")]
    UnknownCommand { anomaly: String, name: String },

    /// A track or exclude list names an errno outside the known table.
    #[error("anomaly {anomaly:?}: unknown error code {name:?}")]
    UnknownErrorCode { anomaly: String, name: String },

    /// A name appears in both the track and exclude lists; it is unclear
    /// whether it should be tracked.
    #[error("anomaly {anomaly:?}: {name:?} appears in both track and exclude lists")]
    TrackExcludeOverlap { anomaly: String, name: String },

    /// Nothing left to track after resolving the lists.
    #[error("anomaly {anomaly:?}: no commands to track after applying mode and exclusions")]
    EmptyTrack { anomaly: String },
}

// =============================================================================
// RAW LAYER (mirrors the YAML)
// =============================================================================

#[derive(Debug, Deserialize)]
struct RawConfig {
    watch_interval_sec: u64,
    aod_output_dir: PathBuf,
    guardian: RawGuardian,
    cleanup: RawCleanup,
    #[serde(default)]
    tools_dir: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct RawGuardian {
    anomalies: BTreeMap<String, RawAnomaly>,
}

#[derive(Debug, Deserialize)]
struct RawAnomaly {
    #[serde(rename = "type")]
    kind: String,
    tool: String,
    acceptable_count: u64,
    #[serde(default)]
    default_threshold_ms: Option<u64>,
    #[serde(default)]
    mode: Option<String>,
    #[serde(default)]
    track_commands: Vec<RawTrackCommand>,
    #[serde(default)]
    exclude_commands: Vec<String>,
    #[serde(default)]
    track_codes: Vec<String>,
    #[serde(default)]
    exclude_codes: Vec<String>,
    #[serde(default)]
    actions: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RawTrackCommand {
    command: String,
    #[serde(default)]
    threshold: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawCleanup {
    max_log_age_days: u64,
    max_total_log_size_mb: u64,
    cleanup_interval_sec: u64,
    #[serde(default)]
    archive_extension: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TrackMode {
    TrackOnly,
    ExcludeOnly,
    All,
}

impl TrackMode {
    fn parse(anomaly: &str, mode: Option<&str>) -> Result<Self, ConfigError> {
        match mode {
            None => Ok(Self::All),
            Some("trackonly") => Ok(Self::TrackOnly),
            Some("excludeonly") => Ok(Self::ExcludeOnly),
            Some("all") => Ok(Self::All),
            Some(other) => Err(ConfigError::UnknownMode {
                anomaly: anomaly.to_string(),
                mode: other.to_string(),
            }),
        }
    }
}

// =============================================================================
// FROZEN LAYER
// =============================================================================

/// One validated anomaly entry. Frozen after load.
#[derive(Debug, Clone)]
pub struct AnomalyConfig {
    pub kind: AnomalyKind,
    /// Name of the kernel-side tool whose events feed this anomaly; also
    /// selects the supervised subprocess.
    pub tool: String,
    /// How many over-threshold events in one window count as an anomaly.
    pub acceptable_count: u64,
    pub default_threshold_ms: Option<u64>,
    /// Tracked ids (command ids for latency, errno values for error) mapped
    /// to their threshold in milliseconds. Non-empty by validation.
    pub track: BTreeMap<u16, u64>,
    /// Ordered log-collection actions to run when this anomaly fires.
    pub actions: Vec<String>,
}

impl AnomalyConfig {
    /// Smallest tracked threshold, used to arm the kernel-side tool.
    pub fn min_threshold_ms(&self) -> u64 {
        self.track.values().copied().min().unwrap_or(DEFAULT_THRESHOLD_MS)
    }
}

/// Which anomalies to detect and how to respond.
#[derive(Debug, Clone)]
pub struct GuardianConfig {
    pub anomalies: BTreeMap<String, AnomalyConfig>,
}

/// Disk-budget enforcement for finalized bundles.
#[derive(Debug, Clone)]
pub struct CleanupConfig {
    pub max_log_age_days: u64,
    pub max_total_log_size_mb: u64,
    pub cleanup_interval_sec: u64,
    /// Suffix identifying finalized archives (default `.tar.zst`).
    pub archive_extension: String,
}

impl CleanupConfig {
    #[inline]
    pub fn max_total_bytes(&self) -> u64 {
        self.max_total_log_size_mb * 1024 * 1024
    }

    #[inline]
    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_log_age_days * 24 * 60 * 60)
    }

    #[inline]
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_sec)
    }
}

/// The frozen top-level configuration. Shared read-only by every worker.
#[derive(Debug, Clone)]
pub struct Config {
    pub watch_interval_sec: u64,
    pub aod_output_dir: PathBuf,
    pub guardian: GuardianConfig,
    pub cleanup: CleanupConfig,
    pub tools_dir: PathBuf,
}

impl Config {
    /// Loads and validates the YAML file at `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw: RawConfig = config::Config::builder()
            .add_source(config::File::from(path))
            .build()?
            .try_deserialize()?;
        Self::from_raw(raw)
    }

    /// Directory that holds working directories and finalized archives.
    pub fn batches_dir(&self) -> PathBuf {
        self.aod_output_dir.join("batches")
    }

    /// The distinct kernel-side tools referenced by the anomalies.
    pub fn tool_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self
            .guardian
            .anomalies
            .values()
            .map(|a| a.tool.as_str())
            .collect();
        names.sort_unstable();
        names.dedup();
        names
    }

    fn from_raw(raw: RawConfig) -> Result<Self, ConfigError> {
        let mut anomalies = BTreeMap::new();
        for (name, raw_anomaly) in raw.guardian.anomalies {
            let anomaly = validate_anomaly(&name, raw_anomaly)?;
            anomalies.insert(name, anomaly);
        }

        Ok(Self {
            watch_interval_sec: raw.watch_interval_sec,
            aod_output_dir: raw.aod_output_dir,
            guardian: GuardianConfig { anomalies },
            cleanup: CleanupConfig {
                max_log_age_days: raw.cleanup.max_log_age_days,
                max_total_log_size_mb: raw.cleanup.max_total_log_size_mb,
                cleanup_interval_sec: raw.cleanup.cleanup_interval_sec,
                archive_extension: raw
                    .cleanup
                    .archive_extension
                    .unwrap_or_else(|| DEFAULT_ARCHIVE_EXTENSION.to_string()),
            },
            tools_dir: raw
                .tools_dir
                .unwrap_or_else(|| PathBuf::from(DEFAULT_TOOLS_DIR)),
        })
    }
}

// =============================================================================
// TRACK-SET RESOLUTION
// =============================================================================

fn validate_anomaly(name: &str, raw: RawAnomaly) -> Result<AnomalyConfig, ConfigError> {
    let kind = AnomalyKind::parse(&raw.kind).ok_or_else(|| ConfigError::UnknownKind {
        anomaly: name.to_string(),
        kind: raw.kind.clone(),
    })?;
    let mode = TrackMode::parse(name, raw.mode.as_deref())?;

    let track = match kind {
        AnomalyKind::Latency => resolve_latency_track(name, &raw, mode)?,
        AnomalyKind::Error => resolve_error_track(name, &raw, mode)?,
    };
    if track.is_empty() {
        return Err(ConfigError::EmptyTrack { anomaly: name.to_string() });
    }

    Ok(AnomalyConfig {
        kind,
        tool: raw.tool,
        acceptable_count: raw.acceptable_count,
        default_threshold_ms: raw.default_threshold_ms,
        track,
        actions: raw.actions,
    })
}

/// Resolves the per-command latency thresholds.
///
/// `trackonly` tracks exactly the listed commands; `excludeonly` tracks the
/// whole table minus the excluded commands; `all` starts from the whole
/// table at the default threshold, applies per-command overrides, then
/// removes exclusions. In `all` mode a command in both lists is ambiguous
/// and rejected.
fn resolve_latency_track(
    name: &str,
    raw: &RawAnomaly,
    mode: TrackMode,
) -> Result<BTreeMap<u16, u64>, ConfigError> {
    let default_ms = raw.default_threshold_ms.unwrap_or(DEFAULT_THRESHOLD_MS);

    let mut track_commands: &[RawTrackCommand] = &raw.track_commands;
    let mut exclude_commands: &[String] = &raw.exclude_commands;
    match mode {
        TrackMode::TrackOnly if !exclude_commands.is_empty() => {
            warn!(anomaly = name, "exclude_commands ignored in trackonly mode");
            exclude_commands = &[];
        }
        TrackMode::ExcludeOnly if !track_commands.is_empty() => {
            warn!(anomaly = name, "track_commands ignored in excludeonly mode");
            track_commands = &[];
        }
        _ => {}
    }

    // Validate both lists against the protocol table before resolving.
    let mut seen_track = 0u32;
    for cmd in track_commands {
        let id = smb_command_id(&cmd.command).ok_or_else(|| ConfigError::UnknownCommand {
            anomaly: name.to_string(),
            name: cmd.command.clone(),
        })?;
        if seen_track & (1 << id) != 0 {
            warn!(anomaly = name, command = %cmd.command, "duplicate track command");
        }
        seen_track |= 1 << id;
    }
    let mut seen_exclude = 0u32;
    for cmd in exclude_commands {
        let id = smb_command_id(cmd).ok_or_else(|| ConfigError::UnknownCommand {
            anomaly: name.to_string(),
            name: cmd.clone(),
        })?;
        if seen_exclude & (1 << id) != 0 {
            warn!(anomaly = name, command = %cmd, "duplicate exclude command");
        }
        seen_exclude |= 1 << id;
        if mode == TrackMode::All && seen_track & (1 << id) != 0 {
            return Err(ConfigError::TrackExcludeOverlap {
                anomaly: name.to_string(),
                name: cmd.clone(),
            });
        }
    }

    let mut map = BTreeMap::new();
    match mode {
        TrackMode::TrackOnly => {
            for cmd in track_commands {
                let id = smb_command_id(&cmd.command).unwrap_or_default();
                map.insert(id, cmd.threshold.unwrap_or(default_ms));
            }
        }
        TrackMode::ExcludeOnly | TrackMode::All => {
            for &(_, id) in &ALL_SMB_COMMANDS {
                map.insert(id, default_ms);
            }
            for cmd in track_commands {
                let id = smb_command_id(&cmd.command).unwrap_or_default();
                map.insert(id, cmd.threshold.unwrap_or(default_ms));
            }
            for cmd in exclude_commands {
                if let Some(id) = smb_command_id(cmd) {
                    map.remove(&id);
                }
            }
        }
    }
    Ok(map)
}

/// Resolves the error-code track set. Thresholds do not apply to error
/// codes; tracked entries carry 0.
fn resolve_error_track(
    name: &str,
    raw: &RawAnomaly,
    mode: TrackMode,
) -> Result<BTreeMap<u16, u64>, ConfigError> {
    let mut track_codes: &[String] = &raw.track_codes;
    let mut exclude_codes: &[String] = &raw.exclude_codes;
    match mode {
        TrackMode::TrackOnly if !exclude_codes.is_empty() => {
            warn!(anomaly = name, "exclude_codes ignored in trackonly mode");
            exclude_codes = &[];
        }
        TrackMode::ExcludeOnly if !track_codes.is_empty() => {
            warn!(anomaly = name, "track_codes ignored in excludeonly mode");
            track_codes = &[];
        }
        _ => {}
    }

    let mut tracked = Vec::new();
    for code in track_codes {
        let num = errno_code(code).ok_or_else(|| ConfigError::UnknownErrorCode {
            anomaly: name.to_string(),
            name: code.clone(),
        })?;
        if tracked.contains(&num) {
            warn!(anomaly = name, code = %code, "duplicate track code");
        }
        tracked.push(num);
    }
    let mut excluded = Vec::new();
    for code in exclude_codes {
        let num = errno_code(code).ok_or_else(|| ConfigError::UnknownErrorCode {
            anomaly: name.to_string(),
            name: code.clone(),
        })?;
        if excluded.contains(&num) {
            warn!(anomaly = name, code = %code, "duplicate exclude code");
        }
        if tracked.contains(&num) {
            return Err(ConfigError::TrackExcludeOverlap {
                anomaly: name.to_string(),
                name: code.clone(),
            });
        }
        excluded.push(num);
    }

    let map = match mode {
        TrackMode::TrackOnly => tracked.into_iter().map(|c| (c, 0)).collect(),
        TrackMode::ExcludeOnly | TrackMode::All => ERRNO_CODES
            .iter()
            .map(|&(_, c)| c)
            .filter(|c| !excluded.contains(c))
            .map(|c| (c, 0))
            .collect(),
    };
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn raw_latency() -> RawAnomaly {
        RawAnomaly {
            kind: "Latency".to_string(),
            tool: "smbsloweraod".to_string(),
            acceptable_count: 9,
            default_threshold_ms: Some(10),
            mode: None,
            track_commands: Vec::new(),
            exclude_commands: Vec::new(),
            track_codes: Vec::new(),
            exclude_codes: Vec::new(),
            actions: vec!["dmesg".to_string()],
        }
    }

    #[test]
    fn trackonly_keeps_only_listed_commands() {
        let mut raw = raw_latency();
        raw.mode = Some("trackonly".to_string());
        raw.track_commands = vec![
            RawTrackCommand { command: "SMB2_READ".to_string(), threshold: Some(50) },
            RawTrackCommand { command: "SMB2_WRITE".to_string(), threshold: None },
        ];

        let anomaly = validate_anomaly("latency", raw).unwrap();
        assert_eq!(anomaly.track.len(), 2);
        assert_eq!(anomaly.track[&8], 50);
        assert_eq!(anomaly.track[&9], 10);
        assert_eq!(anomaly.min_threshold_ms(), 10);
    }

    #[test]
    fn all_mode_applies_overrides_and_exclusions() {
        let mut raw = raw_latency();
        raw.track_commands = vec![RawTrackCommand {
            command: "SMB2_READ".to_string(),
            threshold: Some(100),
        }];
        raw.exclude_commands = vec!["SMB2_ECHO".to_string()];

        let anomaly = validate_anomaly("latency", raw).unwrap();
        assert_eq!(anomaly.track.len(), ALL_SMB_COMMANDS.len() - 1);
        assert_eq!(anomaly.track[&8], 100);
        assert!(!anomaly.track.contains_key(&13));
    }

    #[test]
    fn excludeonly_drops_excluded_commands() {
        let mut raw = raw_latency();
        raw.mode = Some("excludeonly".to_string());
        raw.exclude_commands = vec!["SMB2_READ".to_string(), "SMB2_WRITE".to_string()];

        let anomaly = validate_anomaly("latency", raw).unwrap();
        assert_eq!(anomaly.track.len(), ALL_SMB_COMMANDS.len() - 2);
        assert!(!anomaly.track.contains_key(&8));
    }

    #[test]
    fn overlap_is_rejected_in_all_mode() {
        let mut raw = raw_latency();
        raw.track_commands = vec![RawTrackCommand {
            command: "SMB2_READ".to_string(),
            threshold: Some(100),
        }];
        raw.exclude_commands = vec!["SMB2_READ".to_string()];

        assert!(matches!(
            validate_anomaly("latency", raw),
            Err(ConfigError::TrackExcludeOverlap { .. })
        ));
    }

    #[test]
    fn unknown_command_is_rejected() {
        let mut raw = raw_latency();
        raw.track_commands = vec![RawTrackCommand {
            command: "SMB2_RENAME".to_string(),
            threshold: None,
        }];
        assert!(matches!(
            validate_anomaly("latency", raw),
            Err(ConfigError::UnknownCommand { .. })
        ));
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let mut raw = raw_latency();
        raw.kind = "Jitter".to_string();
        assert!(matches!(
            validate_anomaly("latency", raw),
            Err(ConfigError::UnknownKind { .. })
        ));
    }

    #[test]
    fn trackonly_with_empty_list_is_rejected() {
        let mut raw = raw_latency();
        raw.mode = Some("trackonly".to_string());
        assert!(matches!(
            validate_anomaly("latency", raw),
            Err(ConfigError::EmptyTrack { .. })
        ));
    }

    #[test]
    fn error_kind_resolves_codes() {
        let mut raw = raw_latency();
        raw.kind = "Error".to_string();
        raw.mode = Some("trackonly".to_string());
        raw.track_codes = vec!["EIO".to_string(), "ETIMEDOUT".to_string()];

        let anomaly = validate_anomaly("errors", raw).unwrap();
        assert_eq!(anomaly.kind, AnomalyKind::Error);
        assert!(anomaly.track.contains_key(&5));
        assert!(anomaly.track.contains_key(&110));
    }

    #[test]
    fn load_full_yaml() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        write!(
            file,
            r"
watch_interval_sec: 1
aod_output_dir: /var/log/aod
guardian:
  anomalies:
    latency:
      type: Latency
      tool: smbsloweraod
      acceptable_count: 9
      default_threshold_ms: 10
      mode: trackonly
      track_commands:
        - command: SMB2_READ
          threshold: 50
        - command: SMB2_WRITE
      actions: [dmesg, mounts, stats]
cleanup:
  max_log_age_days: 2
  max_total_log_size_mb: 200
  cleanup_interval_sec: 60
"
        )
        .unwrap();

        let cfg = Config::load(file.path()).unwrap();
        assert_eq!(cfg.watch_interval_sec, 1);
        assert_eq!(cfg.batches_dir(), PathBuf::from("/var/log/aod/batches"));
        assert_eq!(cfg.cleanup.archive_extension, ".tar.zst");
        assert_eq!(cfg.cleanup.max_total_bytes(), 200 * 1024 * 1024);
        assert_eq!(cfg.tool_names(), vec!["smbsloweraod"]);

        let latency = &cfg.guardian.anomalies["latency"];
        assert_eq!(latency.track[&8], 50);
        assert_eq!(latency.actions, vec!["dmesg", "mounts", "stats"]);
    }

    #[test]
    fn missing_cleanup_section_fails_load() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        write!(
            file,
            r"
watch_interval_sec: 1
aod_output_dir: /var/log/aod
guardian:
  anomalies: {{}}
"
        )
        .unwrap();
        assert!(matches!(Config::load(file.path()), Err(ConfigError::Load(_))));
    }
}
