//! # GNSS Module
//!
//! Receiver side of the logger: reads NMEA sentences, tracks fix state and
//! feeds the record queue.
//!
//! This module handles:
//! - Opening the receiver's serial port, and reopening it when it goes away
//! - Reading and validating NMEA sentences
//! - Tracking fix validity and GNSS time from RMC sentences
//! - Raising a rotation when the GNSS date rolls over
//! - Forwarding the configured sentence types as records

pub mod nmea;

use chrono::{NaiveDate, NaiveDateTime};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio_serial::SerialPortBuilderExt;
use tracing::{debug, info, warn};

use crate::error::{LoggerError, Result};
use crate::pipeline::{FixSource, Record, RecordSender, RotationTrigger};
use crate::rotation::{Clock, SystemClock};

/// Last GNSS time seen and when it arrived
#[derive(Debug, Clone, Copy)]
struct TimeFix {
    at: NaiveDateTime,
    received: Instant,
}

/// Fix validity and GNSS time, shared by the reader and the ingestion loop
#[derive(Debug, Default)]
pub struct FixState {
    valid: AtomicBool,
    time: Mutex<Option<TimeFix>>,
    rollover: Option<RotationTrigger>,
}

impl FixState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise `trigger` whenever the GNSS date changes
    pub fn with_rollover_trigger(trigger: RotationTrigger) -> Self {
        Self {
            rollover: Some(trigger),
            ..Self::default()
        }
    }

    /// Apply one RMC sentence
    pub fn update(&self, rmc: &nmea::Rmc) {
        let was_valid = self.valid.swap(rmc.valid, Ordering::AcqRel);
        if was_valid != rmc.valid {
            info!("GNSS fix {}", if rmc.valid { "acquired" } else { "lost" });
        }

        let Some(at) = rmc.timestamp else {
            return;
        };
        let previous = self
            .time
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(TimeFix {
                at,
                received: Instant::now(),
            });

        if let Some(prev) = previous {
            if prev.at.date() != at.date() {
                info!("GNSS date rolled over to {}", at.date());
                if let Some(trigger) = &self.rollover {
                    trigger.raise();
                }
            }
        }
    }

    /// Forget the fix, e.g. when the receiver went away
    pub fn invalidate(&self) {
        if self.valid.swap(false, Ordering::AcqRel) {
            info!("GNSS fix lost");
        }
    }

    /// Date of the latest GNSS time
    pub fn gnss_date(&self) -> Option<NaiveDate> {
        self.latest().map(|t| t.at.date())
    }

    fn latest(&self) -> Option<TimeFix> {
        *self.time.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl FixSource for FixState {
    fn is_fix_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }
}

impl Clock for FixState {
    /// Latest GNSS time advanced by the time since it arrived, or the system
    /// clock before the receiver has reported any time
    fn now(&self) -> NaiveDateTime {
        match self.latest() {
            Some(fix) => {
                let elapsed = chrono::Duration::from_std(fix.received.elapsed())
                    .unwrap_or_else(|_| chrono::Duration::zero());
                fix.at + elapsed
            }
            None => SystemClock.now(),
        }
    }
}

/// Reader counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReaderStats {
    /// Lines read
    pub lines: u64,
    /// Lines that failed validation
    pub invalid: u64,
    /// Records accepted by the queue
    pub produced: u64,
    /// Records the queue refused
    pub rejected: u64,
}

/// Reads NMEA lines and produces records
pub struct NmeaReader<R> {
    reader: R,
    sentences: Vec<String>,
    fix: Arc<FixState>,
    records: RecordSender,
    stats: ReaderStats,
}

impl<R: AsyncBufRead + Unpin> NmeaReader<R> {
    /// # Arguments
    ///
    /// * `reader` - Line source (serial port, file, test buffer)
    /// * `sentences` - Sentence types to log, e.g. `["RMC", "GSV"]`; empty logs all
    /// * `fix` - Updated from every RMC sentence
    /// * `records` - Queue to produce into
    pub fn new(reader: R, sentences: Vec<String>, fix: Arc<FixState>, records: RecordSender) -> Self {
        Self {
            reader,
            sentences,
            fix,
            records,
            stats: ReaderStats::default(),
        }
    }

    pub fn stats(&self) -> ReaderStats {
        self.stats
    }

    /// Read until end of input
    ///
    /// # Errors
    ///
    /// Returns `Io` when reading fails. Malformed sentences are skipped.
    pub async fn run(mut self) -> Result<ReaderStats> {
        let mut line = Vec::with_capacity(128);
        loop {
            line.clear();
            if self.reader.read_until(b'\n', &mut line).await? == 0 {
                break;
            }
            match std::str::from_utf8(&line) {
                Ok(text) => {
                    self.handle_line(text);
                }
                Err(_) => {
                    self.stats.lines += 1;
                    self.stats.invalid += 1;
                }
            }
        }
        info!(
            "NMEA input ended: {} lines, {} invalid, {} records",
            self.stats.lines, self.stats.invalid, self.stats.produced
        );
        Ok(self.stats)
    }

    /// Process one line
    ///
    /// # Returns
    ///
    /// * `bool` - `true` if a record was queued
    pub fn handle_line(&mut self, line: &str) -> bool {
        let sentence = line.trim_end_matches(['\r', '\n']);
        if sentence.is_empty() {
            return false;
        }
        self.stats.lines += 1;

        let body = match nmea::validate(sentence) {
            Ok(body) => body,
            Err(e) => {
                self.stats.invalid += 1;
                debug!("Skipping sentence: {}", e);
                return false;
            }
        };

        let kind = nmea::sentence_type(body);
        if kind == "RMC" {
            match nmea::parse_rmc(body) {
                Ok(rmc) => self.fix.update(&rmc),
                Err(e) => warn!("Unusable RMC sentence: {}", e),
            }
        }

        if !self.sentences.is_empty() && !self.sentences.iter().any(|s| s == kind) {
            return false;
        }

        let mut payload = String::with_capacity(sentence.len() + 1);
        payload.push_str(sentence);
        payload.push('\n');
        if self.records.produce(Record::new(payload)) {
            self.stats.produced += 1;
            true
        } else {
            self.stats.rejected += 1;
            false
        }
    }
}

/// Read from the receiver for as long as the ingestion loop runs
///
/// `open` is called for every connection. When it fails, or the connection
/// ends or errors, the fix is dropped and `open` is retried after `retry`.
/// Returns once the record queue is closed.
pub async fn run_reconnecting<R, F>(
    mut open: F,
    sentences: Vec<String>,
    fix: Arc<FixState>,
    records: RecordSender,
    retry: Duration,
) where
    R: AsyncBufRead + Unpin,
    F: FnMut() -> Result<R>,
{
    loop {
        match open() {
            Ok(port) => {
                let reader =
                    NmeaReader::new(port, sentences.clone(), Arc::clone(&fix), records.clone());
                match reader.run().await {
                    Ok(_) => warn!("GNSS receiver closed the connection"),
                    Err(e) => warn!("GNSS receiver read failed: {}", e),
                }
                fix.invalidate();
            }
            Err(e) => warn!("GNSS receiver unavailable: {}", e),
        }

        if records.is_closed() {
            debug!("Record queue closed, GNSS reader stopping");
            return;
        }
        tokio::time::sleep(retry).await;
    }
}

/// Open the receiver's serial port
///
/// # Errors
///
/// Returns `Gnss` if the port cannot be opened.
///
/// # Examples
///
/// ```no_run
/// use gnssr_logger::gnss::open_serial;
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let port = open_serial("/dev/ttyS1", 9600)?;
///     Ok(())
/// }
/// ```
pub fn open_serial(path: &str, baud_rate: u32) -> Result<BufReader<tokio_serial::SerialStream>> {
    let port = tokio_serial::new(path, baud_rate)
        .data_bits(tokio_serial::DataBits::Eight)
        .parity(tokio_serial::Parity::None)
        .stop_bits(tokio_serial::StopBits::One)
        .flow_control(tokio_serial::FlowControl::None)
        .open_native_async()
        .map_err(|e| LoggerError::Gnss(format!("Failed to open {}: {}", path, e)))?;

    info!("Opened GNSS receiver at {} ({} baud)", path, baud_rate);
    Ok(BufReader::new(port))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::bounded;
    use tokio_test::{assert_ready, task};

    const RMC: &str = "$GPRMC,093000.00,A,5107.0017737,N,11402.3291611,W,0.08,,010324,,,A*5B";
    const RMC_NO_FIX: &str = "$GPRMC,093000.00,V,,,,,,,010324,,,N*73";
    const RMC_LATE: &str = "$GPRMC,235959.00,A,5107.0017737,N,11402.3291611,W,0.08,,010324,,,A*50";
    const RMC_NEXT_DAY: &str =
        "$GPRMC,000001.00,A,5107.0017737,N,11402.3291611,W,0.08,,020324,,,A*53";
    const GSV: &str = "$GPGSV,3,1,12,01,40,083,46,02,17,308,41,12,07,344,39,14,22,228,45*7F";
    const GGA: &str =
        "$GPGGA,093000.00,5107.0017737,N,11402.3291611,W,1,08,0.9,1050.3,M,-17.0,M,,*66";

    fn rmc(line: &str) -> nmea::Rmc {
        nmea::parse_rmc(nmea::validate(line).unwrap()).unwrap()
    }

    #[test]
    fn test_fix_state_tracks_validity() {
        let fix = FixState::new();
        assert!(!fix.is_fix_valid());

        fix.update(&rmc(RMC));
        assert!(fix.is_fix_valid());

        fix.update(&rmc(RMC_NO_FIX));
        assert!(!fix.is_fix_valid());
    }

    #[test]
    fn test_clock_follows_gnss_time() {
        let fix = FixState::new();
        fix.update(&rmc(RMC));

        let now = fix.now();
        let reported = NaiveDate::from_ymd_opt(2024, 3, 1)
            .and_then(|d| d.and_hms_opt(9, 30, 0))
            .unwrap();
        assert!(now >= reported);
        assert!(now - reported < chrono::Duration::seconds(5));
        assert_eq!(fix.gnss_date(), NaiveDate::from_ymd_opt(2024, 3, 1));
    }

    #[test]
    fn test_clock_falls_back_to_system() {
        let fix = FixState::new();
        let system = SystemClock.now();
        assert!(fix.now() - system < chrono::Duration::seconds(5));
    }

    #[test]
    fn test_day_rollover_raises_trigger() {
        let trigger = RotationTrigger::new();
        let fix = FixState::with_rollover_trigger(trigger.clone());

        // First time seen and same-day updates do not raise
        fix.update(&rmc(RMC));
        fix.update(&rmc(RMC_LATE));
        let mut raised = task::spawn(trigger.raised());
        assert!(raised.poll().is_pending());
        drop(raised);

        fix.update(&rmc(RMC_NEXT_DAY));
        let mut raised = task::spawn(trigger.raised());
        assert_ready!(raised.poll());
    }

    #[test]
    fn test_handle_line_filters_sentences() {
        let (tx, _rx) = bounded(10);
        let fix = Arc::new(FixState::new());
        let mut reader = NmeaReader::new(
            tokio::io::empty(),
            vec!["RMC".to_string(), "GSV".to_string()],
            Arc::clone(&fix),
            tx,
        );

        assert!(reader.handle_line(&format!("{}\r\n", RMC)));
        assert!(reader.handle_line(GSV));
        assert!(!reader.handle_line(GGA));
        assert!(!reader.handle_line("$GPRMC,garbage*00"));
        assert!(!reader.handle_line("\r\n"));

        let stats = reader.stats();
        assert_eq!(stats.lines, 4);
        assert_eq!(stats.invalid, 1);
        assert_eq!(stats.produced, 2);
        assert!(fix.is_fix_valid());
    }

    #[test]
    fn test_handle_line_counts_rejected() {
        let (tx, _rx) = bounded(1);
        let mut reader = NmeaReader::new(tokio::io::empty(), Vec::new(), Arc::new(FixState::new()), tx);

        assert!(reader.handle_line(GGA));
        assert!(!reader.handle_line(GGA));
        assert_eq!(reader.stats().rejected, 1);
    }

    #[tokio::test]
    async fn test_run_reads_until_eof() {
        let mut input = format!("{}\r\n{}\r\n", RMC, GSV).into_bytes();
        input.extend_from_slice(b"\xFF\n");
        input.extend_from_slice(format!("{}\r\n", GGA).as_bytes());

        let (tx, mut rx) = bounded(10);
        let fix = Arc::new(FixState::new());
        let reader = NmeaReader::new(
            &input[..],
            vec!["RMC".to_string(), "GSV".to_string()],
            fix,
            tx,
        );

        let stats = reader.run().await.unwrap();
        assert_eq!(stats.produced, 2);

        assert_eq!(rx.recv().await.unwrap().as_bytes(), format!("{}\n", RMC).as_bytes());
        assert_eq!(rx.recv().await.unwrap().as_bytes(), format!("{}\n", GSV).as_bytes());
        // Reader dropped its sender when it finished
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnects_after_input_ends() {
        let mut connections = vec![
            Ok(format!("{}\r\n", RMC)),
            Err(()),
            Ok(format!("{}\r\n", GSV)),
        ]
        .into_iter();
        let (tx, mut rx) = bounded(10);
        let fix = Arc::new(FixState::new());

        let task = tokio::spawn(run_reconnecting(
            move || match connections.next() {
                Some(Ok(text)) => Ok(std::io::Cursor::new(text.into_bytes())),
                _ => Err(LoggerError::Gnss("no receiver".to_string())),
            },
            Vec::new(),
            Arc::clone(&fix),
            tx,
            Duration::from_millis(1000),
        ));

        // Records keep coming after the first connection ended
        assert_eq!(rx.recv().await.unwrap().as_bytes(), format!("{}\n", RMC).as_bytes());
        assert_eq!(rx.recv().await.unwrap().as_bytes(), format!("{}\n", GSV).as_bytes());
        assert!(!fix.is_fix_valid());

        drop(rx);
        task.await.unwrap();
    }
}
