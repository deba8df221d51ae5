//! # GNSS-R Logger Library
//!
//! Compressed, rotating NMEA data logger for GNSS reflectometry stations.
//!
//! Sentences from the GNSS receiver are queued, written into LZ4-framed log
//! files through a temporary file, and rotated on calendar-day changes or on
//! request. Finished files are verified and handed to an uploader.

pub mod button;
pub mod config;
pub mod error;
pub mod frame;
pub mod gnss;
pub mod pipeline;
pub mod rotation;
pub mod status;
pub mod storage;
pub mod upload;
