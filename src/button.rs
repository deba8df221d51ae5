//! # User Button
//!
//! Turns a key press on an input device into a rotation override, so the
//! operator can close the current file on demand (e.g. before pulling the
//! SD card).
//!
//! The device is read through evdev on a dedicated thread because
//! `fetch_events` blocks.

use evdev::{Device, InputEvent, InputEventKind, Key};
use std::path::{Path, PathBuf};
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info};

use crate::error::{LoggerError, Result};
use crate::pipeline::RotationTrigger;

/// Key value evdev reports for a press (1), as opposed to release (0) or repeat (2)
const KEY_PRESSED: i32 = 1;

/// Maps input events to rotation overrides
#[derive(Debug)]
pub struct ButtonWatcher {
    key: Key,
    trigger: RotationTrigger,
    presses: u64,
}

impl ButtonWatcher {
    /// # Arguments
    ///
    /// * `key_code` - evdev key code of the button (e.g. 256 for `BTN_0`)
    /// * `trigger` - Trigger to request the override on
    pub fn new(key_code: u16, trigger: RotationTrigger) -> Self {
        Self {
            key: Key::new(key_code),
            trigger,
            presses: 0,
        }
    }

    /// Handle one event
    ///
    /// # Returns
    ///
    /// * `bool` - `true` if the event was a press of the watched key
    pub fn process_event(&mut self, event: &InputEvent) -> bool {
        match event.kind() {
            InputEventKind::Key(key) if key == self.key && event.value() == KEY_PRESSED => {
                self.presses += 1;
                info!("Button pressed, requesting rotation");
                self.trigger.request_override();
                true
            }
            _ => false,
        }
    }

    pub fn presses(&self) -> u64 {
        self.presses
    }
}

/// Open the button's input device
///
/// # Errors
///
/// Returns `Button` if the device cannot be opened.
pub fn open_device(path: &Path) -> Result<Device> {
    let device = Device::open(path)
        .map_err(|e| LoggerError::Button(format!("Failed to open {}: {}", path.display(), e)))?;
    info!(
        "Watching button on {} ({})",
        path.display(),
        device.name().unwrap_or("unnamed")
    );
    Ok(device)
}

/// Watch `path` on a background thread
///
/// The device is opened before the thread starts, so a wrong path fails
/// here rather than in the background. The thread exits when the device
/// stops delivering events.
///
/// # Errors
///
/// Returns `Button` if the device cannot be opened and `Io` if the thread
/// cannot be spawned.
pub fn spawn_button_thread(
    path: PathBuf,
    key_code: u16,
    trigger: RotationTrigger,
) -> Result<JoinHandle<()>> {
    let mut device = open_device(&path)?;
    let mut watcher = ButtonWatcher::new(key_code, trigger);

    let handle = thread::Builder::new()
        .name("button".to_string())
        .spawn(move || loop {
            match device.fetch_events() {
                Ok(events) => {
                    for event in events {
                        watcher.process_event(&event);
                    }
                }
                Err(e) => {
                    error!("Button device {} failed: {}", path.display(), e);
                    break;
                }
            }
            debug!("Button presses so far: {}", watcher.presses());
        })?;

    Ok(handle)
}
