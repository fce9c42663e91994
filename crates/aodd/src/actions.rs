//! Log-collection quick actions and bundle finalization.
//!
//! Every action is one unit of forensic capture: it declares one of two
//! command shapes - read a procfs-like pseudo-file, or run a short command
//! and capture stdout - and writes exactly one file into the bundle's
//! working directory. The collector schedules actions without interpreting
//! them.
//!
//! The set is a closed enum with a registry built once from config; unknown
//! action names in the config are skipped with a warning (they are operator
//! extension points, not hard errors).

use crate::anomaly::AnomalyKind;
use crate::config::Config;
use std::collections::BTreeMap;
use std::io;
use std::path::Path;
use std::process::ExitStatus;
use thiserror::Error;
use tokio::process::Command;
use tracing::warn;

/// Per-action failures. Logged and recorded; never fatal to the bundle.
#[derive(Debug, Error)]
pub enum ActionError {
    #[error("io: {0}")]
    Io(#[from] io::Error),

    /// The command ran but exited unsuccessfully. Its stdout is still
    /// captured in the bundle.
    #[error("{program} exited with {status}")]
    CommandFailed { program: String, status: ExitStatus },
}

/// How an action gathers its bytes.
#[derive(Debug, Clone)]
pub enum CommandSpec {
    /// Copy a pseudo-file (procfs and friends) into the bundle.
    ReadFile { src: &'static str },
    /// Spawn a command and capture its stdout.
    RunCommand { argv: Vec<String> },
}

/// The closed set of log-collection actions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuickAction {
    /// `journalctl --since "<watch interval> seconds ago"`
    Journalctl { since_sec: u64 },
    /// Kernel log slice: `journalctl -k --since ...`
    Dmesg { since_sec: u64 },
    /// `/proc/fs/cifs/Stats`
    CifsStats,
    /// `/proc/fs/cifs/DebugData`
    DebugData,
    /// `/proc/mounts`
    Mounts,
    /// `smbinfo -h filebasicinfo`
    Smbinfo,
    /// Last `lines` of `/var/log/syslog`
    SysLogs { lines: u32 },
    /// Deterministic slow (or failing) action for scheduler tests.
    #[cfg(test)]
    Probe { millis: u64, fail: bool },
}

impl QuickAction {
    /// Builds an action from its config name. `watch_interval_sec` scopes
    /// the time-windowed actions to the detection window.
    pub fn from_name(name: &str, watch_interval_sec: u64) -> Option<Self> {
        // Windows shorter than a second would collect nothing useful.
        let since_sec = watch_interval_sec.max(1);
        match name {
            "journalctl" => Some(Self::Journalctl { since_sec }),
            "dmesg" => Some(Self::Dmesg { since_sec }),
            "stats" => Some(Self::CifsStats),
            "debugdata" => Some(Self::DebugData),
            "mounts" => Some(Self::Mounts),
            "smbinfo" => Some(Self::Smbinfo),
            "syslogs" => Some(Self::SysLogs { lines: 100 }),
            _ => None,
        }
    }

    /// The registry name, also used in audit records.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Journalctl { .. } => "journalctl",
            Self::Dmesg { .. } => "dmesg",
            Self::CifsStats => "stats",
            Self::DebugData => "debugdata",
            Self::Mounts => "mounts",
            Self::Smbinfo => "smbinfo",
            Self::SysLogs { .. } => "syslogs",
            #[cfg(test)]
            Self::Probe { .. } => "probe",
        }
    }

    /// File this action writes inside the bundle working directory.
    pub fn log_filename(&self) -> &'static str {
        match self {
            Self::Journalctl { .. } => "journalctl.log",
            Self::Dmesg { .. } => "dmesg.log",
            Self::CifsStats => "cifsstats.log",
            Self::DebugData => "debug_data.log",
            Self::Mounts => "mounts.log",
            Self::Smbinfo => "smbinfo.log",
            Self::SysLogs { .. } => "syslogs.log",
            #[cfg(test)]
            Self::Probe { .. } => "probe.log",
        }
    }

    /// The declared command shape.
    pub fn command(&self) -> CommandSpec {
        fn argv(parts: &[&str]) -> Vec<String> {
            parts.iter().map(ToString::to_string).collect()
        }
        match self {
            Self::Journalctl { since_sec } => CommandSpec::RunCommand {
                argv: argv(&["journalctl", "--since", &format!("{since_sec} seconds ago")]),
            },
            Self::Dmesg { since_sec } => CommandSpec::RunCommand {
                argv: argv(&["journalctl", "-k", "--since", &format!("{since_sec} seconds ago")]),
            },
            Self::CifsStats => CommandSpec::ReadFile { src: "/proc/fs/cifs/Stats" },
            Self::DebugData => CommandSpec::ReadFile { src: "/proc/fs/cifs/DebugData" },
            Self::Mounts => CommandSpec::ReadFile { src: "/proc/mounts" },
            Self::Smbinfo => CommandSpec::RunCommand {
                argv: argv(&["smbinfo", "-h", "filebasicinfo"]),
            },
            Self::SysLogs { lines } => CommandSpec::RunCommand {
                argv: argv(&["tail", &format!("-n{lines}"), "/var/log/syslog"]),
            },
            #[cfg(test)]
            Self::Probe { millis, fail } => CommandSpec::RunCommand {
                argv: if *fail {
                    argv(&["false"])
                } else {
                    argv(&["sleep", &format!("{}", *millis as f64 / 1000.0)])
                },
            },
        }
    }

    /// Collects this action's bytes into `out_dir`.
    pub async fn execute(&self, out_dir: &Path) -> Result<(), ActionError> {
        let out = out_dir.join(self.log_filename());
        match self.command() {
            CommandSpec::ReadFile { src } => read_file_capture(src, &out).await,
            CommandSpec::RunCommand { argv } => run_command_capture(&argv, &out).await,
        }
    }
}

async fn read_file_capture(src: &str, out: &Path) -> Result<(), ActionError> {
    tokio::fs::copy(src, out).await?;
    Ok(())
}

async fn run_command_capture(argv: &[String], out: &Path) -> Result<(), ActionError> {
    let output = Command::new(&argv[0]).args(&argv[1..]).output().await?;
    // Capture whatever the command produced, even on failure - a partial
    // log beats no log.
    tokio::fs::write(out, &output.stdout).await?;
    if !output.status.success() {
        return Err(ActionError::CommandFailed {
            program: argv[0].clone(),
            status: output.status,
        });
    }
    Ok(())
}

/// Builds the kind -> ordered actions table once from config.
pub fn build_action_registry(config: &Config) -> BTreeMap<AnomalyKind, Vec<QuickAction>> {
    let mut registry = BTreeMap::new();
    for (name, anomaly) in &config.guardian.anomalies {
        let mut actions = Vec::with_capacity(anomaly.actions.len());
        for action_name in &anomaly.actions {
            match QuickAction::from_name(action_name, config.watch_interval_sec) {
                Some(action) => actions.push(action),
                None => warn!(anomaly = %name, action = %action_name, "unknown action name, skipping"),
            }
        }
        registry.insert(anomaly.kind, actions);
    }
    registry
}

/// Publishes a finished working directory as a finalized archive.
///
/// The tarball is written under a `.tmp` name (invisible to the reclaimer's
/// extension match) and renamed into place, so partially written archives
/// are never observable. The working directory is removed afterwards.
pub fn finalize_bundle(work_dir: &Path, archive_path: &Path) -> io::Result<()> {
    let mut tmp = archive_path.as_os_str().to_os_string();
    tmp.push(".tmp");
    let tmp = std::path::PathBuf::from(tmp);

    let file = std::fs::File::create(&tmp)?;
    let mut encoder = zstd::stream::Encoder::new(file, 3)?;
    {
        let mut builder = tar::Builder::new(&mut encoder);
        let root = work_dir.file_name().unwrap_or_else(|| work_dir.as_os_str());
        builder.append_dir_all(root, work_dir)?;
        builder.finish()?;
    }
    let file = encoder.finish()?;
    file.sync_all()?;

    std::fs::rename(&tmp, archive_path)?;
    std::fs::remove_dir_all(work_dir)?;
    Ok(())
}
