//! Audit trail of finalized bundles.
//!
//! One JSON line per bundle, appended to `audit.log` under the output
//! root. Append failures are warnings: the bundle itself is the product,
//! the audit line is the receipt.

use crate::anomaly::AnomalyKind;
use serde::Serialize;
use std::io;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

/// Outcome of one scheduled action within a bundle.
#[derive(Debug, Clone, Serialize)]
pub struct ActionOutcome {
    pub name: String,
    pub ok: bool,
}

/// One audit record, serialized as a single JSON line.
#[derive(Debug, Serialize)]
pub struct AuditEntry {
    pub timestamp_ns: u64,
    pub kind: AnomalyKind,
    pub archive: PathBuf,
    /// Whether the archive was published (false means the bundle directory
    /// could not be finalized).
    pub finalized: bool,
    pub actions: Vec<ActionOutcome>,
}

/// Append-only JSON-lines audit log.
#[derive(Debug, Clone)]
pub struct AuditLog {
    path: PathBuf,
}

impl AuditLog {
    pub fn new(output_root: &Path) -> Self {
        Self { path: output_root.join("audit.log") }
    }

    /// Appends one record.
    pub async fn record(&self, entry: &AuditEntry) -> io::Result<()> {
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn records_are_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::new(dir.path());

        for ts in [1u64, 2] {
            log.record(&AuditEntry {
                timestamp_ns: ts,
                kind: AnomalyKind::Latency,
                archive: dir.path().join(format!("aod_quick_{ts}.tar.zst")),
                finalized: true,
                actions: vec![ActionOutcome { name: "mounts".to_string(), ok: true }],
            })
            .await
            .unwrap();
        }

        let contents = std::fs::read_to_string(dir.path().join("audit.log")).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["kind"], "latency");
        assert_eq!(first["finalized"], true);
        assert_eq!(first["actions"][0]["name"], "mounts");
    }
}
