//! # Streaming File Writer
//!
//! Writes one compressed log file at a time.
//!
//! ## Lifecycle
//!
//! ```text
//! Closed --open(path)--> Open --write(data)*--> Open --close()--> Closed
//! ```
//!
//! `open` creates `<path>.tmp` and writes the frame header. `write` appends
//! to a [`StreamBuffer`] and compresses a chunk whenever the next bytes would
//! not fit. `close` compresses whatever is left, writes the frame end and
//! renames the temporary file to `<path>`. A file therefore only appears
//! under its final name once it holds a complete frame.
//!
//! Every write to storage is followed by a data sync; the logger runs on
//! batteries and can lose power at any moment.
//!
//! A block that storage rejects is cut off the temporary file again and taken
//! back from the codec, so the frame on storage only ever holds whole blocks.
//! If the cut fails, the stream is marked corrupted and can only be abandoned.
//!
//! ## Compression context
//!
//! In [`ContextMode::PerStream`] every stream allocates its own
//! [`CompressionContext`] and drops it on close. In [`ContextMode::Reused`]
//! the writer keeps a single context and lends it to each stream, avoiding an
//! allocation per file.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::buffer::StreamBuffer;
use super::paths;
use crate::error::{LoggerError, Result};
use crate::frame::{CompressionContext, FramePreferences};

/// How the writer manages its compression context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContextMode {
    /// Allocate at `open`, release at `close`
    PerStream,
    /// Allocate once, keep across streams
    #[default]
    Reused,
}

/// Context held by an open stream
enum ContextLease {
    /// Allocated for this stream, dropped with it
    Owned(CompressionContext),
    /// Lent by the writer, handed back on close
    Borrowed(CompressionContext),
}

impl ContextLease {
    fn get_mut(&mut self) -> &mut CompressionContext {
        match self {
            ContextLease::Owned(ctx) | ContextLease::Borrowed(ctx) => ctx,
        }
    }
}

/// Temporary file plus the length known to hold whole blocks
struct TempFile {
    file: File,
    committed: u64,
    corrupted: bool,
}

impl TempFile {
    fn new(file: File) -> Self {
        Self {
            file,
            committed: 0,
            corrupted: false,
        }
    }

    /// Write and sync `bytes`, cutting them off again on failure
    fn append(&mut self, bytes: &[u8]) -> io::Result<()> {
        if let Err(e) = self.file.write_all(bytes).and_then(|()| self.file.sync_data()) {
            if let Err(cut) = self.rewind() {
                warn!("Failed to cut partial write: {}", cut);
                self.corrupted = true;
            }
            return Err(e);
        }
        self.committed += bytes.len() as u64;
        Ok(())
    }

    /// Drop everything past the committed length
    fn rewind(&mut self) -> io::Result<()> {
        if self.file.metadata()?.len() != self.committed {
            self.file.set_len(self.committed)?;
            self.file.sync_data()?;
        }
        self.file.seek(SeekFrom::Start(self.committed))?;
        Ok(())
    }
}

/// One open log file
struct OutputStream {
    target: PathBuf,
    temp: PathBuf,
    out: TempFile,
    ctx: ContextLease,
}

impl OutputStream {
    fn check(&self) -> Result<()> {
        if self.out.corrupted {
            return Err(LoggerError::Corrupted(self.temp.clone()));
        }
        Ok(())
    }
}

/// Counters for the currently (or most recently) open stream
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriterStats {
    /// `write` calls accepted
    pub writes: u64,
    /// Raw bytes accepted
    pub bytes_in: u64,
    /// Bytes written to storage, header and trailer included
    pub bytes_out: u64,
    /// Chunks handed to the codec
    pub flushes: u64,
}

/// Compressed log file writer
pub struct StreamWriter {
    prefs: FramePreferences,
    mode: ContextMode,
    kept: Option<CompressionContext>,
    buffer: StreamBuffer,
    stream: Option<OutputStream>,
    stats: WriterStats,
}

impl std::fmt::Debug for StreamWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamWriter")
            .field("mode", &self.mode)
            .field("target", &self.target())
            .field("buffered", &self.buffer.len())
            .finish_non_exhaustive()
    }
}

impl StreamWriter {
    /// Create a closed writer
    ///
    /// The codec's buffer bounds are checked here, so a misconfigured build
    /// fails at startup rather than at the first rotation.
    ///
    /// # Errors
    ///
    /// Returns `Codec` if the compression context cannot be created.
    pub fn new(mode: ContextMode, prefs: FramePreferences) -> Result<Self> {
        let ctx = CompressionContext::new(prefs)?;
        let kept = match mode {
            ContextMode::Reused => Some(ctx),
            ContextMode::PerStream => None,
        };

        Ok(Self {
            prefs,
            mode,
            kept,
            buffer: StreamBuffer::new(),
            stream: None,
            stats: WriterStats::default(),
        })
    }

    pub fn mode(&self) -> ContextMode {
        self.mode
    }

    pub fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    /// Final path of the open stream
    pub fn target(&self) -> Option<&Path> {
        self.stream.as_ref().map(|s| s.target.as_path())
    }

    /// Bytes waiting in the source buffer
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn stats(&self) -> WriterStats {
        self.stats
    }

    /// Open a new stream that will end up at `path`
    ///
    /// # Errors
    ///
    /// - `AlreadyOpen` if a stream is open
    /// - `Io` if the temporary file cannot be created or the header cannot
    ///   be written (the temporary file is removed again)
    /// - `Codec` if a context cannot be created
    pub fn open<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        if let Some(stream) = &self.stream {
            return Err(LoggerError::AlreadyOpen(stream.target.clone()));
        }

        let target = path.as_ref().to_path_buf();
        let temp = paths::temp_path(&target);
        let mut ctx = self.lease_context()?;

        let file = match OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp)
        {
            Ok(file) => file,
            Err(e) => {
                self.release_context(ctx);
                return Err(e.into());
            }
        };

        let mut out = TempFile::new(file);
        let header = match write_header(&mut out, ctx.get_mut()) {
            Ok(n) => n,
            Err(e) => {
                drop(out);
                if let Err(rm) = fs::remove_file(&temp) {
                    warn!("Failed to remove {}: {}", temp.display(), rm);
                }
                self.release_context(ctx);
                return Err(e);
            }
        };

        self.buffer.clear();
        self.stats = WriterStats {
            bytes_out: header,
            ..Default::default()
        };
        info!("Opened log file {}", temp.display());
        self.stream = Some(OutputStream {
            target,
            temp,
            out,
            ctx,
        });
        Ok(())
    }

    /// Append record bytes to the open stream
    ///
    /// Bytes are buffered. When the buffer cannot take all of `data`, the
    /// buffered chunk is compressed, written and synced first. Input longer
    /// than one chunk is split, so memory stays bounded by one chunk.
    ///
    /// # Errors
    ///
    /// - `NotOpen` if no stream is open
    /// - `Codec` if compression fails; the stream must be abandoned
    /// - `Io` if storage rejects the write; the chunk in flight is lost but
    ///   the frame stays decodable
    /// - `Corrupted` if a rejected write could not be cut off the file; the
    ///   stream must be abandoned
    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        let stream = self.stream.as_mut().ok_or(LoggerError::NotOpen)?;
        stream.check()?;
        self.stats.writes += 1;

        let mut rest = data;
        while !rest.is_empty() {
            if self.buffer.remaining() < rest.len() && !self.buffer.is_empty() {
                flush_buffer(&mut self.buffer, stream, &mut self.stats)?;
            }
            let taken = self.buffer.push(rest);
            self.stats.bytes_in += taken as u64;
            rest = &rest[taken..];
        }
        Ok(())
    }

    /// Finalize the open stream
    ///
    /// Flushes the buffer, writes the frame end, syncs, releases the file and
    /// renames it onto its final name.
    ///
    /// # Returns
    ///
    /// * `Result<PathBuf>` - Final path of the finished file
    ///
    /// # Errors
    ///
    /// - `NotOpen` if no stream is open
    /// - `Codec`/`Io`/`Corrupted` while finishing the frame; the stream stays
    ///   open and the caller should [`abandon`](Self::abandon) it
    /// - `Io` if the rename fails; the complete frame stays at the temporary
    ///   path and the writer is closed
    pub fn close(&mut self) -> Result<PathBuf> {
        let mut stream = self.stream.take().ok_or(LoggerError::NotOpen)?;

        if let Err(e) = stream.check().and_then(|()| finish_frame(&mut self.buffer, &mut stream, &mut self.stats)) {
            self.stream = Some(stream);
            return Err(e);
        }

        let OutputStream {
            target,
            temp,
            out,
            ctx,
        } = stream;
        drop(out);
        self.release_context(ctx);

        fs::rename(&temp, &target)?;
        if let Some(dir) = target.parent() {
            paths::sync_dir(dir);
        }

        info!(
            "Closed log file {} ({} bytes in, {} bytes out)",
            target.display(),
            self.stats.bytes_in,
            self.stats.bytes_out
        );
        Ok(target)
    }

    /// Drop the open stream without finalizing it
    ///
    /// The temporary file stays on storage as an incomplete write.
    ///
    /// # Returns
    ///
    /// * `Option<PathBuf>` - Temporary path left behind, `None` if nothing was open
    pub fn abandon(&mut self) -> Option<PathBuf> {
        let stream = self.stream.take()?;
        let OutputStream { temp, out, ctx, .. } = stream;
        drop(out);
        self.release_context(ctx);
        self.buffer.clear();
        warn!("Abandoned log file {}", temp.display());
        Some(temp)
    }

    fn lease_context(&mut self) -> Result<ContextLease> {
        Ok(match self.mode {
            ContextMode::PerStream => ContextLease::Owned(CompressionContext::new(self.prefs)?),
            ContextMode::Reused => match self.kept.take() {
                Some(ctx) => ContextLease::Borrowed(ctx),
                None => ContextLease::Borrowed(CompressionContext::new(self.prefs)?),
            },
        })
    }

    fn release_context(&mut self, lease: ContextLease) {
        match lease {
            ContextLease::Owned(ctx) => drop(ctx),
            ContextLease::Borrowed(ctx) => self.kept = Some(ctx),
        }
    }
}

/// Write and sync the frame header
fn write_header(out: &mut TempFile, ctx: &mut CompressionContext) -> Result<u64> {
    let header = ctx.begin()?;
    out.append(header)?;
    Ok(header.len() as u64)
}

/// Compress the buffered chunk and write it out
///
/// The buffer is emptied once the codec has taken the chunk.
fn flush_buffer(
    buffer: &mut StreamBuffer,
    stream: &mut OutputStream,
    stats: &mut WriterStats,
) -> Result<()> {
    if buffer.is_empty() {
        return Ok(());
    }

    let encoded = stream.ctx.get_mut().update(buffer.as_slice());
    let raw_len = buffer.len();
    buffer.clear();
    let block = encoded?;
    stats.flushes += 1;

    if block.is_empty() {
        return Ok(());
    }
    let encoded_len = block.len();
    if let Err(e) = stream.out.append(block) {
        stream.ctx.get_mut().rollback();
        if stream.out.corrupted {
            warn!("Block write failed: {}", e);
            return Err(LoggerError::Corrupted(stream.temp.clone()));
        }
        return Err(e.into());
    }
    stats.bytes_out += encoded_len as u64;
    debug!("Flushed {} -> {} bytes", raw_len, encoded_len);
    Ok(())
}

/// Flush what is left and write the frame end
fn finish_frame(
    buffer: &mut StreamBuffer,
    stream: &mut OutputStream,
    stats: &mut WriterStats,
) -> Result<()> {
    flush_buffer(buffer, stream, stats)?;

    let trailer = stream.ctx.get_mut().end()?;
    let trailer_len = trailer.len();
    stream.out.append(trailer)?;
    stream.out.file.sync_all()?;
    stats.bytes_out += trailer_len as u64;
    Ok(())
}
