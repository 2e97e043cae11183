//! Byte-source and block-sink abstractions.
//!
//! The engine performs no direct file-system calls; every read, write and
//! seek goes through [`ByteSource`], and every completed block leaves through
//! a [`BlockSink`]. The surrounding I/O layer decides what actually backs
//! them (files, pipes, in-memory buffers).

use std::io::{self, Read, Seek, SeekFrom, Write};

use crate::error::{Error, Result};

/// Origin for relative repositioning, mirroring `SeekFrom` without the
/// embedded offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Whence {
    Start,
    Current,
    End,
}

/// Blocking byte-stream interface consumed by the engine.
///
/// `get_length` returns 0 when the length is unknown (pipes). Implementations
/// that cannot seek must return `false` from `can_seek` and fail the
/// positioning calls; the engine treats such sources as sequential-only.
pub trait ByteSource {
    fn read_bytes(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    fn get_pos(&mut self) -> io::Result<u64>;
    fn set_pos_abs(&mut self, pos: u64) -> io::Result<()>;
    fn set_pos_rel(&mut self, delta: i64, whence: Whence) -> io::Result<()>;
    fn push_back_byte(&mut self, byte: u8);
    fn get_length(&mut self) -> u64;
    fn can_seek(&mut self) -> bool;
    fn write_bytes(&mut self, buf: &[u8]) -> io::Result<usize>;
}

/// Read `buf.len()` bytes or fail. Short reads surface as `UnexpectedEof`.
pub fn read_exact<S: ByteSource + ?Sized>(src: &mut S, buf: &mut [u8]) -> io::Result<()> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = src.read_bytes(&mut buf[filled..])?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "short read from byte source",
            ));
        }
        filled += n;
    }
    Ok(())
}

/// Read one byte and push it straight back, leaving the position unchanged.
/// Returns `None` at end of stream.
pub fn peek_byte<S: ByteSource + ?Sized>(src: &mut S) -> io::Result<Option<u8>> {
    let mut one = [0u8; 1];
    match src.read_bytes(&mut one)? {
        0 => Ok(None),
        _ => {
            src.push_back_byte(one[0]);
            Ok(Some(one[0]))
        }
    }
}

// ── Seekable source over std Read + Write + Seek ─────────────────────────────

/// [`ByteSource`] over any `Read + Write + Seek` value (`File`,
/// `Cursor<Vec<u8>>`). A read-only `File` satisfies the bounds; its
/// `write_bytes` simply fails at call time, matching the underlying OS
/// behaviour.
pub struct StdSource<T> {
    inner: T,
    pushed: Option<u8>,
}

impl<T: Read + Write + Seek> StdSource<T> {
    pub fn new(inner: T) -> Self {
        Self { inner, pushed: None }
    }

    pub fn into_inner(self) -> T {
        self.inner
    }
}

impl<T: Read + Write + Seek> ByteSource for StdSource<T> {
    fn read_bytes(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if let Some(b) = self.pushed.take() {
            buf[0] = b;
            let n = self.inner.read(&mut buf[1..])?;
            return Ok(n + 1);
        }
        self.inner.read(buf)
    }

    fn get_pos(&mut self) -> io::Result<u64> {
        let pos = self.inner.stream_position()?;
        Ok(pos - self.pushed.is_some() as u64)
    }

    fn set_pos_abs(&mut self, pos: u64) -> io::Result<()> {
        self.pushed = None;
        self.inner.seek(SeekFrom::Start(pos)).map(|_| ())
    }

    fn set_pos_rel(&mut self, delta: i64, whence: Whence) -> io::Result<()> {
        let from = match whence {
            Whence::Start => SeekFrom::Start(delta.max(0) as u64),
            Whence::Current => {
                // Account for a pending pushed-back byte.
                let adj = delta - self.pushed.is_some() as i64;
                SeekFrom::Current(adj)
            }
            Whence::End => SeekFrom::End(delta),
        };
        self.pushed = None;
        self.inner.seek(from).map(|_| ())
    }

    fn push_back_byte(&mut self, byte: u8) {
        self.pushed = Some(byte);
    }

    fn get_length(&mut self) -> u64 {
        let Ok(save) = self.inner.stream_position() else {
            return 0;
        };
        let len = self.inner.seek(SeekFrom::End(0)).unwrap_or(0);
        let _ = self.inner.seek(SeekFrom::Start(save));
        len
    }

    fn can_seek(&mut self) -> bool {
        true
    }

    fn write_bytes(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf)
    }
}

// ── Sequential-only source ───────────────────────────────────────────────────

/// [`ByteSource`] over a plain `Read` stream (pipe, socket). Length is
/// unknown, seeking is refused, and the engine falls back to sequential-only
/// behaviour (no tag loading, no trailing wrapper, no random-access seek).
pub struct PipeSource<T> {
    inner: T,
    pos: u64,
    pushed: Option<u8>,
}

impl<T: Read> PipeSource<T> {
    pub fn new(inner: T) -> Self {
        Self { inner, pos: 0, pushed: None }
    }
}

impl<T: Read> ByteSource for PipeSource<T> {
    fn read_bytes(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let n = if let Some(b) = self.pushed.take() {
            buf[0] = b;
            self.inner.read(&mut buf[1..])? + 1
        } else {
            self.inner.read(buf)?
        };
        self.pos += n as u64;
        Ok(n)
    }

    fn get_pos(&mut self) -> io::Result<u64> {
        Ok(self.pos)
    }

    fn set_pos_abs(&mut self, _pos: u64) -> io::Result<()> {
        Err(io::Error::new(io::ErrorKind::Unsupported, "pipe source cannot seek"))
    }

    fn set_pos_rel(&mut self, _delta: i64, _whence: Whence) -> io::Result<()> {
        Err(io::Error::new(io::ErrorKind::Unsupported, "pipe source cannot seek"))
    }

    fn push_back_byte(&mut self, byte: u8) {
        self.pushed = Some(byte);
        self.pos -= 1;
    }

    fn get_length(&mut self) -> u64 {
        0
    }

    fn can_seek(&mut self) -> bool {
        false
    }

    fn write_bytes(&mut self, _buf: &[u8]) -> io::Result<usize> {
        Err(io::Error::new(io::ErrorKind::Unsupported, "pipe source is read-only"))
    }
}

// ── Block sinks ──────────────────────────────────────────────────────────────

/// Destination stream for a completed block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkDest {
    Primary,
    Correction,
}

/// Receives completed blocks from the packer.
pub trait BlockSink {
    fn emit(&mut self, dest: SinkDest, block: &[u8]) -> Result<()>;
}

/// In-memory sink keeping each emitted block separate. The block lists
/// concatenate into valid primary/correction byte streams.
#[derive(Debug, Default)]
pub struct VecSink {
    pub primary: Vec<Vec<u8>>,
    pub correction: Vec<Vec<u8>>,
}

impl VecSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn primary_bytes(&self) -> Vec<u8> {
        self.primary.concat()
    }

    pub fn correction_bytes(&self) -> Vec<u8> {
        self.correction.concat()
    }
}

impl BlockSink for VecSink {
    fn emit(&mut self, dest: SinkDest, block: &[u8]) -> Result<()> {
        match dest {
            SinkDest::Primary => self.primary.push(block.to_vec()),
            SinkDest::Correction => self.correction.push(block.to_vec()),
        }
        Ok(())
    }
}

/// Sink writing primary and correction blocks to two `Write` streams.
pub struct PairSink<P, C> {
    pub primary: P,
    pub correction: Option<C>,
}

impl<P: Write, C: Write> PairSink<P, C> {
    pub fn new(primary: P, correction: Option<C>) -> Self {
        Self { primary, correction }
    }
}

impl<P: Write, C: Write> BlockSink for PairSink<P, C> {
    fn emit(&mut self, dest: SinkDest, block: &[u8]) -> Result<()> {
        let result = match dest {
            SinkDest::Primary => self.primary.write_all(block),
            SinkDest::Correction => match self.correction.as_mut() {
                Some(w) => w.write_all(block),
                None => return Err(Error::Sink("no correction sink attached".into())),
            },
        };
        result.map_err(|e| Error::Sink(e.to_string()))
    }
}
