//! # Ingestion Loop
//!
//! The single task that owns the writer and the rotation controller.
//!
//! This module handles:
//! - Waiting on the rotation trigger and the record queue at the same time
//! - Running rotations and handing their outcome to the upload hook
//! - Writing records while a file is open and the fix is valid
//! - Finalizing the open file on shutdown
//!
//! Nothing else touches the writer, so no locking is needed. The wait in
//! [`Pipeline::next_event`] is the loop's only await point; everything after
//! it runs to completion before the next event is looked at.

pub mod queue;
pub mod trigger;

pub use queue::{bounded, Record, RecordReceiver, RecordSender};
pub use trigger::{spawn_rollover_ticker, RotationTrigger};

use chrono::NaiveDateTime;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::error::{LoggerError, Result};
use crate::rotation::{Rotation, RotationController};
use crate::status::{self, DeviceStatus, StatusReport, StatusReporter};
use crate::storage::StreamWriter;

/// Whether incoming records are worth keeping
#[cfg_attr(test, mockall::automock)]
pub trait FixSource: Send {
    fn is_fix_valid(&self) -> bool;
}

impl<T: FixSource + Sync + ?Sized> FixSource for Arc<T> {
    fn is_fix_valid(&self) -> bool {
        (**self).is_fix_valid()
    }
}

/// Fix source for setups that log everything
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysValid;

impl FixSource for AlwaysValid {
    fn is_fix_valid(&self) -> bool {
        true
    }
}

/// Called after every successful rotation
#[cfg_attr(test, mockall::automock)]
pub trait UploadHook: Send {
    fn on_rotation(&mut self, rotation: &Rotation) -> Result<()>;
}

/// Upload hook that does nothing
#[derive(Debug, Clone, Copy, Default)]
pub struct NoUpload;

impl UploadHook for NoUpload {
    fn on_rotation(&mut self, _rotation: &Rotation) -> Result<()> {
        Ok(())
    }
}

/// What woke the loop
#[derive(Debug, PartialEq, Eq)]
pub enum Event {
    /// The rotation trigger was raised
    Rotate,
    /// A record was dequeued
    Record(Record),
    /// Every producer is gone and the queue is drained
    Closed,
}

/// Loop counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    /// Records written to a log file
    pub written: u64,
    /// Records dequeued but not written (no file open or no fix)
    pub discarded: u64,
    /// Records dropped by producers on a full queue
    pub dropped: u64,
    /// Records lost to write failures
    pub write_errors: u64,
    /// Successful rotations
    pub rotations: u64,
    /// Failed rotations
    pub rotation_failures: u64,
}

/// Owned state of the ingestion loop
pub struct Pipeline {
    writer: StreamWriter,
    controller: RotationController,
    trigger: RotationTrigger,
    records: RecordReceiver,
    fix: Box<dyn FixSource>,
    upload: Box<dyn UploadHook>,
    status: StatusReporter,
    status_file: Option<PathBuf>,
    last_rotation: Option<NaiveDateTime>,
    stats: PipelineStats,
}

impl Pipeline {
    /// Assemble the loop from its parts
    ///
    /// # Arguments
    ///
    /// * `writer` - Closed writer; the first rotation opens it
    /// * `controller` - Rotation policy and naming
    /// * `trigger` - Trigger shared with the ticker and the button
    /// * `records` - Consumer end of the record queue
    /// * `fix` - Decides whether a record is kept
    /// * `upload` - Notified after each rotation
    pub fn new(
        writer: StreamWriter,
        controller: RotationController,
        trigger: RotationTrigger,
        records: RecordReceiver,
        fix: Box<dyn FixSource>,
        upload: Box<dyn UploadHook>,
    ) -> Self {
        let (status, _) = status::channel();
        Self {
            writer,
            controller,
            trigger,
            records,
            fix,
            upload,
            status,
            status_file: None,
            last_rotation: None,
            stats: PipelineStats::default(),
        }
    }

    /// Publish device state through `status`
    pub fn with_status(mut self, status: StatusReporter) -> Self {
        self.status = status;
        self
    }

    /// Write a JSON [`StatusReport`] to `path` after each rotation
    pub fn with_status_file(mut self, path: PathBuf) -> Self {
        self.status_file = Some(path);
        self
    }

    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            dropped: self.records.dropped(),
            ..self.stats
        }
    }

    pub fn writer(&self) -> &StreamWriter {
        &self.writer
    }

    pub fn controller(&self) -> &RotationController {
        &self.controller
    }

    /// Wait for the next thing to do
    ///
    /// A raised trigger wins over waiting records, so a rotation is never
    /// starved by a busy receiver.
    pub async fn next_event(&mut self) -> Event {
        tokio::select! {
            biased;
            _ = self.trigger.raised() => Event::Rotate,
            record = self.records.recv() => match record {
                Some(record) => Event::Record(record),
                None => Event::Closed,
            },
        }
    }

    /// Act on one event
    ///
    /// # Returns
    ///
    /// * `bool` - `false` once the queue is closed
    pub fn handle(&mut self, event: Event) -> bool {
        match event {
            Event::Rotate => {
                self.on_rotate();
                true
            }
            Event::Record(record) => {
                self.on_record(record);
                true
            }
            Event::Closed => false,
        }
    }

    /// Run until every producer is gone, then finalize the open file
    pub async fn run(&mut self) -> PipelineStats {
        info!("Ingestion loop started");
        loop {
            let event = self.next_event().await;
            if !self.handle(event) {
                break;
            }
        }
        info!("Record queue closed");
        self.shutdown();
        self.stats()
    }

    /// Finalize the open file, if any
    ///
    /// # Returns
    ///
    /// * `Option<PathBuf>` - Path of the finished file
    pub fn shutdown(&mut self) -> Option<PathBuf> {
        if !self.writer.is_open() {
            return None;
        }
        match self.writer.close() {
            Ok(path) => Some(path),
            Err(e) => {
                error!("Failed to finalize log file on shutdown: {}", e);
                self.writer.abandon();
                None
            }
        }
    }

    fn on_rotate(&mut self) {
        if self.trigger.take_override() {
            info!("Rotation requested by user");
            self.controller.request_override();
        }

        match self.controller.rotate_if_due(&mut self.writer) {
            Ok(Some(rotation)) => {
                self.stats.rotations += 1;
                self.last_rotation = Some(rotation.at);
                self.status.set(self.logging_status());
                self.write_status_report();

                if let Err(e) = self.upload.on_rotation(&rotation) {
                    warn!("Upload hook failed: {}", e);
                }
            }
            Ok(None) => debug!("No rotation due"),
            Err(e) => {
                self.stats.rotation_failures += 1;
                error!("Rotation failed: {}", e);
                self.status.set(DeviceStatus::Error);
                self.write_status_report();
            }
        }
    }

    fn on_record(&mut self, record: Record) {
        if !self.writer.is_open() {
            self.stats.discarded += 1;
            return;
        }
        if !self.fix.is_fix_valid() {
            self.stats.discarded += 1;
            self.status.transition(DeviceStatus::Logging, DeviceStatus::Searching);
            return;
        }

        match self.writer.write(record.as_bytes()) {
            Ok(()) => {
                self.stats.written += 1;
                self.status.transition(DeviceStatus::Searching, DeviceStatus::Logging);
            }
            Err(e @ (LoggerError::Codec(_) | LoggerError::Corrupted(_))) => {
                self.stats.write_errors += 1;
                error!("Abandoning log file: {}", e);
                self.writer.abandon();
                self.status.set(DeviceStatus::Error);
            }
            Err(e) => {
                self.stats.write_errors += 1;
                warn!("Failed to write record: {}", e);
            }
        }
    }

    fn logging_status(&self) -> DeviceStatus {
        if self.fix.is_fix_valid() {
            DeviceStatus::Logging
        } else {
            DeviceStatus::Searching
        }
    }

    fn write_status_report(&self) {
        let Some(path) = &self.status_file else {
            return;
        };
        let stats = self.stats();
        let report = StatusReport {
            device_id: self.controller.naming().device_id.clone(),
            status: self.status.current(),
            current_file: self.writer.target().map(|p| p.to_path_buf()),
            last_rotation: self.last_rotation,
            rotations: stats.rotations,
            records_written: stats.written,
            records_discarded: stats.discarded,
            records_dropped: stats.dropped,
            write_errors: stats.write_errors,
        };
        if let Err(e) = report.write_to(path) {
            warn!("Failed to write status file {}: {}", path.display(), e);
        }
    }
}
