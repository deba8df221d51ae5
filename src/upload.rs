//! # Upload Module
//!
//! Moves finished log files off the device.
//!
//! This module handles:
//! - Listing finished files (unfinished `.tmp` files are never touched)
//! - Verifying that each file holds a complete frame
//! - Handing files to an [`Uploader`]
//! - Moving uploaded files into the archive directory
//! - Running sync passes on a worker thread after each rotation
//!
//! ## Transport
//!
//! [`DirectoryUploader`] delivers into an outbox directory, which a separate
//! process (or a mounted remote share) picks up. Other transports plug in
//! through the [`Uploader`] trait.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::thread::{self, JoinHandle};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};

use crate::error::{LoggerError, Result};
use crate::frame::decoder::verify_file;
use crate::pipeline::UploadHook;
use crate::rotation::Rotation;
use crate::status::{DeviceStatus, StatusReporter};
use crate::storage::paths::{self, finished_files, temp_path};

/// Delivers one finished file somewhere off the device
#[cfg_attr(test, mockall::automock)]
pub trait Uploader: Send {
    fn upload(&mut self, path: &Path) -> Result<()>;
}

/// Copies files into an outbox directory
#[derive(Debug, Clone)]
pub struct DirectoryUploader {
    outbox: PathBuf,
}

impl DirectoryUploader {
    pub fn new(outbox: PathBuf) -> Self {
        Self { outbox }
    }
}

impl Uploader for DirectoryUploader {
    /// Copy under a temporary name, then rename, so the outbox never shows a
    /// partial file
    fn upload(&mut self, path: &Path) -> Result<()> {
        let name = path
            .file_name()
            .ok_or_else(|| LoggerError::Upload(format!("no file name in {}", path.display())))?;
        let target = self.outbox.join(name);
        let temp = temp_path(&target);

        fs::copy(path, &temp).map_err(|e| upload_err(path, e))?;
        fs::File::open(&temp)
            .and_then(|f| f.sync_all())
            .map_err(|e| upload_err(path, e))?;
        fs::rename(&temp, &target).map_err(|e| upload_err(path, e))?;
        paths::sync_dir(&self.outbox);
        Ok(())
    }
}

fn upload_err(path: &Path, e: io::Error) -> LoggerError {
    LoggerError::Upload(format!("{}: {}", path.display(), e))
}

/// Result of one sync pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Uploaded and archived
    pub uploaded: usize,
    /// Failed verification, left in place
    pub invalid: usize,
    /// Not attempted because the upload failed
    pub pending: usize,
}

/// One pass over the data directory
#[derive(Debug, Clone)]
pub struct SyncPass {
    pub data_dir: PathBuf,
    pub archive_dir: PathBuf,
    pub extension: String,
}

impl SyncPass {
    /// Upload every finished file, oldest name first
    ///
    /// The pass stops at the first upload failure; the link is most likely
    /// down and the remaining files wait for the next pass.
    ///
    /// # Errors
    ///
    /// Returns `Io` if the data directory cannot be listed or an uploaded
    /// file cannot be moved to the archive.
    pub fn run(&self, uploader: &mut dyn Uploader) -> Result<SyncReport> {
        let files = finished_files(&self.data_dir, &self.extension)?;
        let mut report = SyncReport::default();

        for (i, path) in files.iter().enumerate() {
            if let Err(e) = verify_file(path) {
                warn!("Skipping {}: {}", path.display(), e);
                report.invalid += 1;
                continue;
            }

            if let Err(e) = uploader.upload(path) {
                warn!("Upload of {} failed: {}", path.display(), e);
                report.pending = files.len() - i;
                break;
            }

            self.archive(path)?;
            report.uploaded += 1;
            debug!("Uploaded {}", path.display());
        }

        info!(
            "Sync pass: {} uploaded, {} invalid, {} pending",
            report.uploaded, report.invalid, report.pending
        );
        Ok(report)
    }

    fn archive(&self, path: &Path) -> Result<()> {
        if let Some(name) = path.file_name() {
            fs::rename(path, self.archive_dir.join(name))?;
            paths::sync_dir(&self.archive_dir);
        }
        Ok(())
    }
}

/// Upload hook that runs sync passes on a worker thread
///
/// Requests made while a pass is queued collapse into that pass.
#[derive(Debug)]
pub struct SyncScheduler {
    requests: mpsc::Sender<()>,
}

impl SyncScheduler {
    /// Start the worker thread
    ///
    /// The worker exits once the scheduler is dropped and any queued pass
    /// has run.
    ///
    /// # Errors
    ///
    /// Returns `Io` if the thread cannot be spawned.
    pub fn spawn(
        pass: SyncPass,
        mut uploader: Box<dyn Uploader>,
        status: StatusReporter,
    ) -> Result<(Self, JoinHandle<()>)> {
        let (requests, mut rx) = mpsc::channel::<()>(1);

        let handle = thread::Builder::new()
            .name("upload".to_string())
            .spawn(move || {
                while rx.blocking_recv().is_some() {
                    let before = status.current();
                    status.set(DeviceStatus::Uploading);
                    if let Err(e) = pass.run(uploader.as_mut()) {
                        warn!("Sync pass failed: {}", e);
                    }
                    status.transition(DeviceStatus::Uploading, before);
                }
                debug!("Upload worker stopped");
            })?;

        Ok((Self { requests }, handle))
    }

    /// Ask for a sync pass
    ///
    /// # Returns
    ///
    /// * `bool` - `false` if the worker is gone
    pub fn request(&self) -> bool {
        match self.requests.try_send(()) {
            Ok(()) => true,
            Err(TrySendError::Full(())) => {
                debug!("Sync pass already queued");
                true
            }
            Err(TrySendError::Closed(())) => false,
        }
    }
}

impl UploadHook for SyncScheduler {
    fn on_rotation(&mut self, _rotation: &Rotation) -> Result<()> {
        if self.request() {
            Ok(())
        } else {
            Err(LoggerError::Upload("upload worker stopped".to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FramePreferences;
    use crate::status;
    use crate::storage::{ContextMode, StreamWriter};
    use tempfile::{tempdir, TempDir};

    struct Dirs {
        _root: TempDir,
        data: PathBuf,
        archive: PathBuf,
        outbox: PathBuf,
    }

    fn dirs() -> Dirs {
        let root = tempdir().unwrap();
        let data = root.path().join("data");
        let archive = root.path().join("archive");
        let outbox = root.path().join("outbox");
        for dir in [&data, &archive, &outbox] {
            fs::create_dir(dir).unwrap();
        }
        Dirs {
            _root: root,
            data,
            archive,
            outbox,
        }
    }

    fn write_log(dir: &Path, name: &str, content: &[u8]) -> PathBuf {
        let path = dir.join(name);
        let mut w = StreamWriter::new(ContextMode::PerStream, FramePreferences::default()).unwrap();
        w.open(&path).unwrap();
        w.write(content).unwrap();
        w.close().unwrap()
    }

    fn pass(d: &Dirs) -> SyncPass {
        SyncPass {
            data_dir: d.data.clone(),
            archive_dir: d.archive.clone(),
            extension: "lz4".to_string(),
        }
    }

    #[test]
    fn test_sync_pass_uploads_and_archives() {
        let d = dirs();
        write_log(&d.data, "gnssr0_a.lz4", b"$GPRMC,A\n");
        write_log(&d.data, "gnssr0_b.lz4", b"$GPRMC,B\n");
        fs::write(d.data.join("gnssr0_c.lz4.tmp"), b"partial").unwrap();

        let mut uploader = DirectoryUploader::new(d.outbox.clone());
        let report = pass(&d).run(&mut uploader).unwrap();

        assert_eq!(report.uploaded, 2);
        assert!(d.outbox.join("gnssr0_a.lz4").exists());
        assert!(d.outbox.join("gnssr0_b.lz4").exists());
        assert!(d.archive.join("gnssr0_a.lz4").exists());
        assert!(!d.data.join("gnssr0_a.lz4").exists());
        // Unfinished file untouched
        assert!(d.data.join("gnssr0_c.lz4.tmp").exists());
        assert!(!d.outbox.join("gnssr0_c.lz4.tmp").exists());
    }

    #[test]
    fn test_sync_pass_skips_invalid_files() {
        let d = dirs();
        fs::write(d.data.join("broken.lz4"), b"not a frame").unwrap();
        write_log(&d.data, "good.lz4", b"$GPRMC,A\n");

        let mut uploader = MockUploader::new();
        uploader
            .expect_upload()
            .withf(|p| p.ends_with("good.lz4"))
            .times(1)
            .returning(|_| Ok(()));

        let report = pass(&d).run(&mut uploader).unwrap();
        assert_eq!(report.uploaded, 1);
        assert_eq!(report.invalid, 1);
        assert!(d.data.join("broken.lz4").exists());
    }

    #[test]
    fn test_sync_pass_stops_on_upload_failure() {
        let d = dirs();
        for name in ["a.lz4", "b.lz4", "c.lz4"] {
            write_log(&d.data, name, b"$GPRMC,A\n");
        }

        let mut uploader = MockUploader::new();
        let mut calls = 0;
        uploader.expect_upload().times(2).returning(move |_| {
            calls += 1;
            if calls == 1 {
                Ok(())
            } else {
                Err(LoggerError::Upload("link down".to_string()))
            }
        });

        let report = pass(&d).run(&mut uploader).unwrap();
        assert_eq!(report.uploaded, 1);
        assert_eq!(report.pending, 2);
        assert!(d.archive.join("a.lz4").exists());
        assert!(d.data.join("b.lz4").exists());
        assert!(d.data.join("c.lz4").exists());
    }

    #[test]
    fn test_scheduler_runs_pass_on_rotation() {
        let d = dirs();
        write_log(&d.data, "a.lz4", b"$GPRMC,A\n");
        let (reporter, _rx) = status::channel();
        reporter.set(DeviceStatus::Logging);

        let (mut scheduler, handle) = SyncScheduler::spawn(
            pass(&d),
            Box::new(DirectoryUploader::new(d.outbox.clone())),
            reporter.clone(),
        )
        .unwrap();

        let rotation = Rotation {
            finished: Some(d.data.join("a.lz4")),
            opened: d.data.join("b.lz4"),
            at: chrono::NaiveDate::from_ymd_opt(2024, 3, 1)
                .and_then(|d| d.and_hms_opt(0, 0, 0))
                .unwrap(),
        };
        scheduler.on_rotation(&rotation).unwrap();
        scheduler.on_rotation(&rotation).unwrap();
        drop(scheduler);
        handle.join().unwrap();

        assert!(d.outbox.join("a.lz4").exists());
        assert!(d.archive.join("a.lz4").exists());
        assert_eq!(reporter.current(), DeviceStatus::Logging);
    }

    #[test]
    fn test_upload_missing_file_fails() {
        let d = dirs();
        let mut uploader = DirectoryUploader::new(d.outbox.clone());
        let result = uploader.upload(&d.data.join("missing.lz4"));
        assert!(matches!(result, Err(LoggerError::Upload(_))));
    }
}
