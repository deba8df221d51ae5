//! # Rotation Controller
//!
//! Decides when the current log file is finished and a new one starts.
//!
//! This module handles:
//! - The rotation policy (calendar day changed, user override, nothing open)
//! - File naming from device identity and timestamp
//! - Duplicate name avoidance
//! - Closing the old stream and opening the new one

use chrono::{NaiveDate, NaiveDateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::error::{LoggerError, Result};
use crate::storage::paths::temp_path;
use crate::storage::StreamWriter;

/// Suffixed names tried before giving up on a timestamp
pub const MAX_NAME_ATTEMPTS: u32 = 99;

/// Source of the current date and time
pub trait Clock: Send {
    fn now(&self) -> NaiveDateTime;
}

impl<T: Clock + Sync + ?Sized> Clock for Arc<T> {
    fn now(&self) -> NaiveDateTime {
        (**self).now()
    }
}

/// Host clock in UTC
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        Utc::now().naive_utc()
    }
}

/// Builds log file paths: `{dir}/{device_id}_{timestamp}.{extension}`
#[derive(Debug, Clone)]
pub struct FileNaming {
    pub dir: PathBuf,
    pub device_id: String,
    pub extension: String,
    /// `chrono` strftime pattern
    pub timestamp_format: String,
}

impl FileNaming {
    /// File name for `at`; attempt 0 is the plain name, later attempts get `_{n}`
    pub fn file_name(&self, at: &NaiveDateTime, attempt: u32) -> String {
        let stamp = at.format(&self.timestamp_format);
        if attempt == 0 {
            format!("{}_{}.{}", self.device_id, stamp, self.extension)
        } else {
            format!("{}_{}_{}.{}", self.device_id, stamp, attempt, self.extension)
        }
    }

    /// First path for `at` that is neither a finished file nor an unfinished one
    ///
    /// # Errors
    ///
    /// Returns `NameCollision` when the plain name and all
    /// [`MAX_NAME_ATTEMPTS`] suffixed names are taken.
    pub fn next_free(&self, at: &NaiveDateTime) -> Result<PathBuf> {
        for attempt in 0..=MAX_NAME_ATTEMPTS {
            let path = self.dir.join(self.file_name(at, attempt));
            if !is_taken(&path) {
                if attempt > 0 {
                    warn!("Log file name taken, using {}", path.display());
                }
                return Ok(path);
            }
        }
        Err(LoggerError::NameCollision(
            self.dir.join(self.file_name(at, 0)),
        ))
    }
}

fn is_taken(path: &Path) -> bool {
    path.exists() || temp_path(path).exists()
}

/// Outcome of a successful rotation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rotation {
    /// File finalized by this rotation, if one was open
    pub finished: Option<PathBuf>,
    /// File now receiving records
    pub opened: PathBuf,
    /// Clock reading used for the new name
    pub at: NaiveDateTime,
}

/// Rotation policy state plus the naming scheme
pub struct RotationController {
    clock: Box<dyn Clock>,
    naming: FileNaming,
    last_day: Option<NaiveDate>,
    override_pending: bool,
    rotations: u64,
}

impl std::fmt::Debug for RotationController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RotationController")
            .field("naming", &self.naming)
            .field("last_day", &self.last_day)
            .field("override_pending", &self.override_pending)
            .field("rotations", &self.rotations)
            .finish_non_exhaustive()
    }
}

impl RotationController {
    pub fn new(clock: Box<dyn Clock>, naming: FileNaming) -> Self {
        Self {
            clock,
            naming,
            last_day: None,
            override_pending: false,
            rotations: 0,
        }
    }

    pub fn naming(&self) -> &FileNaming {
        &self.naming
    }

    /// Force the next evaluation to rotate
    pub fn request_override(&mut self) {
        self.override_pending = true;
    }

    pub fn override_pending(&self) -> bool {
        self.override_pending
    }

    /// Day of the last successful rotation
    pub fn last_day(&self) -> Option<NaiveDate> {
        self.last_day
    }

    /// Successful rotations so far
    pub fn rotations(&self) -> u64 {
        self.rotations
    }

    /// Whether a rotation is warranted
    ///
    /// True when the calendar day differs from the last rotation, when an
    /// override is pending, or when no stream is open.
    pub fn is_due(&self, today: NaiveDate, stream_open: bool) -> bool {
        self.last_day != Some(today) || self.override_pending || !stream_open
    }

    /// Rotate `writer` when the policy says so
    ///
    /// # Returns
    ///
    /// * `Result<Option<Rotation>>` - `None` when no rotation was due
    ///
    /// # Errors
    ///
    /// - Close failure: the old stream is abandoned (its temporary file stays)
    ///   and the error is returned
    /// - `NameCollision` when no free name is left
    /// - `Io`/`Codec` when the new stream cannot be opened
    ///
    /// After any error the writer is closed and the override stays pending.
    pub fn rotate_if_due(&mut self, writer: &mut StreamWriter) -> Result<Option<Rotation>> {
        let now = self.clock.now();
        if !self.is_due(now.date(), writer.is_open()) {
            return Ok(None);
        }
        self.rotate(writer, now).map(Some)
    }

    fn rotate(&mut self, writer: &mut StreamWriter, now: NaiveDateTime) -> Result<Rotation> {
        let finished = if writer.is_open() {
            match writer.close() {
                Ok(path) => Some(path),
                Err(e) => {
                    error!("Failed to finalize log file: {}", e);
                    writer.abandon();
                    return Err(e);
                }
            }
        } else {
            None
        };

        let opened = self.naming.next_free(&now)?;
        writer.open(&opened)?;

        self.override_pending = false;
        self.last_day = Some(now.date());
        self.rotations += 1;
        info!("Rotated to {}", opened.display());

        Ok(Rotation {
            finished,
            opened,
            at: now,
        })
    }
}
