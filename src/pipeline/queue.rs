//! # Record Queue
//!
//! Bounded hand-off between record producers and the ingestion loop.
//!
//! Producers never wait: when the queue is full the record is dropped on the
//! spot and counted. The ingestion loop is the only consumer.

use bytes::Bytes;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

/// One newline-framed message, e.g. an NMEA sentence
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    payload: Bytes,
}

impl Record {
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.payload
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// Create a queue holding at most `capacity` records
///
/// # Panics
///
/// Panics if `capacity` is zero. The configuration rejects that value.
pub fn bounded(capacity: usize) -> (RecordSender, RecordReceiver) {
    let (tx, rx) = mpsc::channel(capacity);
    let dropped = Arc::new(AtomicU64::new(0));
    (
        RecordSender {
            tx,
            dropped: Arc::clone(&dropped),
        },
        RecordReceiver { rx, dropped },
    )
}

/// Producer side; cheap to clone
#[derive(Debug, Clone)]
pub struct RecordSender {
    tx: mpsc::Sender<Record>,
    dropped: Arc<AtomicU64>,
}

impl RecordSender {
    /// Enqueue without waiting
    ///
    /// # Returns
    ///
    /// * `bool` - `false` if the record was dropped (queue full or loop gone)
    pub fn produce(&self, record: Record) -> bool {
        match self.tx.try_send(record) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if total == 1 || total % 100 == 0 {
                    warn!("Record queue full, {} records dropped so far", total);
                }
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!("Record queue closed, dropping record");
                false
            }
        }
    }

    /// Records dropped because the queue was full
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// The ingestion loop is gone
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Consumer side, owned by the ingestion loop
#[derive(Debug)]
pub struct RecordReceiver {
    rx: mpsc::Receiver<Record>,
    dropped: Arc<AtomicU64>,
}

impl RecordReceiver {
    /// Next record, `None` once every sender is gone and the queue is empty
    pub async fn recv(&mut self) -> Option<Record> {
        self.rx.recv().await
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
