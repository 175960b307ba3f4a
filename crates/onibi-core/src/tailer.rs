//! Append-only tailing of the hook log.
//!
//! [`TailBuffer`] owns the [`Watermark`]: the identity of the file being read
//! and the offset just past the last complete line handed downstream. Bytes
//! after the watermark that do not yet end in a terminator are held as a
//! fragment and delivered once, as part of their complete line.
//!
//! The file handle stays open across polls, so bytes appended to a file after
//! it was renamed away are still drained before switching to its replacement.
//!
//! Invariants:
//! - `watermark.offset + fragment + skipped == read_offset <= size at read time`
//! - the watermark only moves backwards on rotation or [`TailBuffer::adopt_rotation`]
//! - no line is delivered twice, and none before its terminator arrives

use std::fs::{self, File, Metadata};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::{StartPosition, WatchConfig};
use crate::stats::{Counter, PipelineStats};

/// One complete line and its byte range `[start, end)` in the file.
///
/// `end` includes the terminator; `text` excludes it and any trailing `\r`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    pub text: String,
    pub start: u64,
    pub end: u64,
}

/// Identity of a file on disk. Survives renames, changes on replacement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileIdentity {
    pub device: u64,
    pub inode: u64,
}

impl FileIdentity {
    #[cfg(unix)]
    #[must_use]
    pub fn of(meta: &Metadata) -> Self {
        use std::os::unix::fs::MetadataExt;
        Self {
            device: meta.dev(),
            inode: meta.ino(),
        }
    }

    #[cfg(not(unix))]
    #[must_use]
    pub fn of(meta: &Metadata) -> Self {
        let created = meta
            .created()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map_or(0, |d| d.as_nanos() as u64);
        Self {
            device: 0,
            inode: created,
        }
    }
}

/// Durable read position.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Watermark {
    /// `None` until the file has been seen
    pub identity: Option<FileIdentity>,
    pub offset: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TailerConfig {
    /// Bytes read from the live file per poll
    pub max_read_bytes: usize,
    /// Longer lines are skipped
    pub max_line_bytes: usize,
    pub start_position: StartPosition,
}

impl Default for TailerConfig {
    fn default() -> Self {
        Self::from(&WatchConfig::default())
    }
}

impl From<&WatchConfig> for TailerConfig {
    fn from(watch: &WatchConfig) -> Self {
        Self {
            max_read_bytes: watch.max_read_bytes.max(1),
            max_line_bytes: watch.max_line_bytes.max(1),
            start_position: watch.start_position,
        }
    }
}

/// Result of one [`TailBuffer::poll`].
#[derive(Debug, Default)]
pub struct TailPoll {
    pub lines: Vec<LogLine>,
    /// The file was replaced or truncated; reading restarted at offset 0
    pub rotated: bool,
    /// The path does not currently exist
    pub missing: bool,
}

struct OpenFile {
    file: File,
    identity: FileIdentity,
}

/// Reads appended bytes and splits them into complete lines.
pub struct TailBuffer {
    path: PathBuf,
    config: TailerConfig,
    watermark: Watermark,
    read_offset: u64,
    fragment: Vec<u8>,
    /// Bytes of an oversized line skipped so far
    skipping: Option<u64>,
    handle: Option<OpenFile>,
    stats: Arc<PipelineStats>,
}

impl TailBuffer {
    /// Position a tailer on `path`.
    ///
    /// A restored watermark is honoured when it names the current file and
    /// still fits inside it. A restored watermark for a different file means
    /// the log was rotated while nobody was reading, so the new file is read
    /// from the start. Without one, `start_position` decides.
    pub fn open(
        path: impl Into<PathBuf>,
        config: TailerConfig,
        restored: Option<Watermark>,
        stats: Arc<PipelineStats>,
    ) -> io::Result<Self> {
        let path = path.into();
        let meta = stat(&path)?;

        let watermark = match (meta, restored) {
            (None, _) => Watermark::default(),
            (Some(meta), Some(saved)) => {
                let identity = FileIdentity::of(&meta);
                if saved.identity == Some(identity) && saved.offset <= meta.len() {
                    saved
                } else {
                    info!(
                        path = %path.display(),
                        saved_offset = saved.offset,
                        "Persisted watermark is for a different file; reading from the start"
                    );
                    Watermark {
                        identity: Some(identity),
                        offset: 0,
                    }
                }
            }
            (Some(meta), None) => Watermark {
                identity: Some(FileIdentity::of(&meta)),
                offset: match config.start_position {
                    StartPosition::End => line_start_before(&path, meta.len())?,
                    StartPosition::Beginning => 0,
                },
            },
        };

        debug!(path = %path.display(), offset = watermark.offset, "Tailer positioned");
        Ok(Self {
            path,
            config,
            read_offset: watermark.offset,
            watermark,
            fragment: Vec::new(),
            skipping: None,
            handle: None,
            stats,
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Offset past the last delivered line, with the identity it refers to.
    #[must_use]
    pub fn watermark(&self) -> Watermark {
        self.watermark
    }

    /// Bytes consumed from the file, including a buffered fragment.
    #[must_use]
    pub fn read_offset(&self) -> u64 {
        self.read_offset
    }

    #[must_use]
    pub fn fragment_len(&self) -> usize {
        self.fragment.len()
    }

    /// Read whatever has been appended since the last poll.
    pub fn poll(&mut self) -> io::Result<TailPoll> {
        let mut poll = TailPoll::default();

        let Some(meta) = stat(&self.path)? else {
            // Deleted: the open handle can still see bytes written before unlink.
            self.drain_handle(&mut poll.lines)?;
            self.handle = None;
            poll.missing = true;
            return Ok(poll);
        };
        let identity = FileIdentity::of(&meta);

        match self.watermark.identity {
            Some(current) if current != identity => {
                self.drain_handle(&mut poll.lines)?;
                info!(path = %self.path.display(), "Log file replaced; restarting at offset 0");
                self.restart(identity);
                poll.rotated = true;
            }
            Some(_) => {}
            None => self.watermark.identity = Some(identity),
        }

        if self.handle.is_none() {
            let file = match File::open(&self.path) {
                Ok(file) => file,
                Err(err) if err.kind() == io::ErrorKind::NotFound => {
                    poll.missing = true;
                    return Ok(poll);
                }
                Err(err) => return Err(err),
            };
            let opened = FileIdentity::of(&file.metadata()?);
            if opened != identity {
                // Replaced between stat and open; the next poll sees the new file.
                debug!(path = %self.path.display(), "Rotation race while opening; deferring");
                return Ok(poll);
            }
            self.handle = Some(OpenFile { file, identity });
        }

        let size = match &self.handle {
            Some(open) => open.file.metadata()?.len(),
            None => return Ok(poll),
        };
        if size < self.read_offset {
            info!(
                path = %self.path.display(),
                size,
                read_offset = self.read_offset,
                "Log file truncated in place; restarting at offset 0"
            );
            self.restart(identity);
            poll.rotated = true;
            let file = File::open(&self.path)?;
            self.handle = Some(OpenFile { file, identity });
        }

        self.read_chunk(self.config.max_read_bytes as u64, &mut poll.lines)?;
        Ok(poll)
    }

    /// Drop the buffered fragment; it will be read again from the watermark.
    ///
    /// Returns the number of bytes abandoned.
    pub fn abandon_partial(&mut self) -> u64 {
        let abandoned = self.read_offset - self.watermark.offset;
        if abandoned > 0 {
            self.stats.incr(Counter::PartialDiscarded);
            debug!(path = %self.path.display(), bytes = abandoned, "Abandoned partial line");
        }
        self.fragment.clear();
        self.skipping = None;
        self.read_offset = self.watermark.offset;
        abandoned
    }

    /// Hand-off after the truncator moved the unread tail
    /// `[watermark.offset, EOF)` to offset 0 of a new file.
    pub fn adopt_rotation(&mut self, identity: FileIdentity) {
        self.read_offset -= self.watermark.offset;
        self.watermark = Watermark {
            identity: Some(identity),
            offset: 0,
        };
        self.handle = None;
    }

    // -------------------------------------------------------------------------

    fn restart(&mut self, identity: FileIdentity) {
        if !self.fragment.is_empty() || self.skipping.is_some() {
            self.stats.incr(Counter::PartialDiscarded);
        }
        self.stats.incr(Counter::Rotations);
        self.watermark = Watermark {
            identity: Some(identity),
            offset: 0,
        };
        self.read_offset = 0;
        self.fragment.clear();
        self.skipping = None;
        self.handle = None;
    }

    /// Read the remainder of the currently open file, whatever its size.
    fn drain_handle(&mut self, lines: &mut Vec<LogLine>) -> io::Result<()> {
        let is_current = self
            .handle
            .as_ref()
            .is_some_and(|open| Some(open.identity) == self.watermark.identity);
        if !is_current {
            return Ok(());
        }
        while self.read_chunk(self.config.max_read_bytes as u64, lines)? > 0 {}
        Ok(())
    }

    fn read_chunk(&mut self, limit: u64, lines: &mut Vec<LogLine>) -> io::Result<usize> {
        let Some(open) = self.handle.as_mut() else {
            return Ok(0);
        };
        open.file.seek(SeekFrom::Start(self.read_offset))?;
        let mut buf = Vec::new();
        (&mut open.file).take(limit).read_to_end(&mut buf)?;
        if !buf.is_empty() {
            self.consume(&buf, lines);
        }
        Ok(buf.len())
    }

    fn consume(&mut self, chunk: &[u8], lines: &mut Vec<LogLine>) {
        self.read_offset += chunk.len() as u64;
        self.stats.add(Counter::BytesRead, chunk.len() as u64);

        let mut rest = chunk;
        while let Some(pos) = memchr::memchr(b'\n', rest) {
            let (head, tail) = rest.split_at(pos);
            rest = &tail[1..];
            self.complete_line(head, lines);
        }

        if rest.is_empty() {
            return;
        }
        if let Some(skipped) = self.skipping.as_mut() {
            *skipped += rest.len() as u64;
        } else {
            self.fragment.extend_from_slice(rest);
            if self.fragment.len() > self.config.max_line_bytes {
                self.skipping = Some(self.fragment.len() as u64);
                self.fragment.clear();
            }
        }
    }

    fn complete_line(&mut self, head: &[u8], lines: &mut Vec<LogLine>) {
        let start = self.watermark.offset;

        if let Some(skipped) = self.skipping.take() {
            let end = start + skipped + head.len() as u64 + 1;
            self.watermark.offset = end;
            self.stats.incr(Counter::OversizedLines);
            warn!(path = %self.path.display(), offset = start, bytes = end - start, "Skipped oversized line");
            return;
        }

        let len = self.fragment.len() + head.len();
        let end = start + len as u64 + 1;
        self.watermark.offset = end;

        if len > self.config.max_line_bytes {
            self.fragment.clear();
            self.stats.incr(Counter::OversizedLines);
            warn!(path = %self.path.display(), offset = start, bytes = len, "Skipped oversized line");
            return;
        }

        let text = if self.fragment.is_empty() {
            decode(head)
        } else {
            self.fragment.extend_from_slice(head);
            let text = decode(&self.fragment);
            self.fragment.clear();
            text
        };
        self.stats.incr(Counter::LinesRead);
        lines.push(LogLine { text, start, end });
    }
}

fn decode(bytes: &[u8]) -> String {
    let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
    String::from_utf8_lossy(bytes).into_owned()
}

/// Offset just past the last `\n` before `len`, or 0 if there is none.
/// A line still being written when the tailer starts is delivered whole.
fn line_start_before(path: &Path, len: u64) -> io::Result<u64> {
    const CHUNK: u64 = 8 * 1024;
    let mut file = File::open(path)?;
    let mut buf = vec![0u8; CHUNK as usize];
    let mut end = len;
    while end > 0 {
        let start = end.saturating_sub(CHUNK);
        let chunk = &mut buf[..(end - start) as usize];
        file.seek(SeekFrom::Start(start))?;
        file.read_exact(chunk)?;
        if let Some(pos) = memchr::memrchr(b'\n', chunk) {
            return Ok(start + pos as u64 + 1);
        }
        end = start;
    }
    Ok(0)
}

fn stat(path: &Path) -> io::Result<Option<Metadata>> {
    match fs::metadata(path) {
        Ok(meta) => Ok(Some(meta)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err),
    }
}
