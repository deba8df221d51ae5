//! # Device Status
//!
//! What the status LED would show, published over a `watch` channel.
//!
//! This module handles:
//! - The device state (booting, searching, logging, uploading, error)
//! - Publishing state changes to any number of observers
//! - Writing a JSON status report next to the log files

use chrono::NaiveDateTime;
use serde::Serialize;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

use crate::error::Result;
use crate::storage::paths::temp_path;

/// High-level device state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    /// Starting up, nothing logged yet
    Booting,
    /// Logging file open but no valid fix
    Searching,
    /// Writing records
    Logging,
    /// Sync pass running
    Uploading,
    /// Last rotation or write failed
    Error,
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeviceStatus::Booting => "booting",
            DeviceStatus::Searching => "searching",
            DeviceStatus::Logging => "logging",
            DeviceStatus::Uploading => "uploading",
            DeviceStatus::Error => "error",
        };
        f.write_str(s)
    }
}

/// Publishing side of the status channel
#[derive(Debug, Clone)]
pub struct StatusReporter {
    tx: Arc<watch::Sender<DeviceStatus>>,
}

/// Create a status channel starting at [`DeviceStatus::Booting`]
pub fn channel() -> (StatusReporter, watch::Receiver<DeviceStatus>) {
    let (tx, rx) = watch::channel(DeviceStatus::Booting);
    (StatusReporter { tx: Arc::new(tx) }, rx)
}

impl StatusReporter {
    /// Publish `status`; observers are only woken on an actual change
    pub fn set(&self, status: DeviceStatus) {
        self.tx.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                debug!("Status {} -> {}", current, status);
                *current = status;
                true
            }
        });
    }

    /// Replace `from` with `to`, leaving any other state alone
    pub fn transition(&self, from: DeviceStatus, to: DeviceStatus) {
        self.tx.send_if_modified(|current| {
            if *current == from && from != to {
                *current = to;
                true
            } else {
                false
            }
        });
    }

    pub fn current(&self) -> DeviceStatus {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<DeviceStatus> {
        self.tx.subscribe()
    }
}

/// Snapshot written to the status file after each rotation
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub device_id: String,
    pub status: DeviceStatus,
    pub current_file: Option<PathBuf>,
    pub last_rotation: Option<NaiveDateTime>,
    pub rotations: u64,
    pub records_written: u64,
    pub records_discarded: u64,
    pub records_dropped: u64,
    pub write_errors: u64,
}

impl StatusReport {
    /// Write the report as pretty JSON, replacing `path` atomically
    pub fn write_to(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        let temp = temp_path(path);
        fs::write(&temp, json)?;
        fs::rename(&temp, path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_starts_booting() {
        let (reporter, rx) = channel();
        assert_eq!(reporter.current(), DeviceStatus::Booting);
        assert_eq!(*rx.borrow(), DeviceStatus::Booting);
    }

    #[test]
    fn test_set_only_notifies_on_change() {
        let (reporter, mut rx) = channel();

        reporter.set(DeviceStatus::Booting);
        assert!(!rx.has_changed().unwrap());

        reporter.set(DeviceStatus::Logging);
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), DeviceStatus::Logging);
    }

    #[test]
    fn test_transition_only_from_expected_state() {
        let (reporter, _rx) = channel();
        reporter.set(DeviceStatus::Error);
        reporter.transition(DeviceStatus::Uploading, DeviceStatus::Logging);
        assert_eq!(reporter.current(), DeviceStatus::Error);

        reporter.set(DeviceStatus::Uploading);
        reporter.transition(DeviceStatus::Uploading, DeviceStatus::Logging);
        assert_eq!(reporter.current(), DeviceStatus::Logging);
    }

    #[test]
    fn test_display() {
        assert_eq!(DeviceStatus::Searching.to_string(), "searching");
    }

    #[test]
    fn test_report_json() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("status.json");
        let report = StatusReport {
            device_id: "gnssr0".to_string(),
            status: DeviceStatus::Logging,
            current_file: Some(PathBuf::from("data/gnssr0_2024-03-01T0930.lz4")),
            last_rotation: None,
            rotations: 1,
            records_written: 3,
            records_discarded: 0,
            records_dropped: 0,
            write_errors: 0,
        };
        report.write_to(&path).unwrap();

        let value: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value["status"], "logging");
        assert_eq!(value["records_written"], 3);
        assert!(value["last_rotation"].is_null());
        assert!(!temp_path(&path).exists());
    }
}
