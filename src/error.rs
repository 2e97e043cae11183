use std::io;
use thiserror::Error;

/// Result type alias for tidepack operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the pack/unpack engine.
///
/// CRC and correction-file mismatches are deliberately *not* represented
/// here: they are recoverable events counted on the container (see
/// `Unpacker::num_errors`) and decoding continues past them.
#[derive(Error, Debug)]
pub enum Error {
    /// Bad magic, version out of range, reserved bytes set, or a stream that
    /// never yields a usable block. Fatal for the current open/seek attempt.
    #[error("format error: {0}")]
    Format(String),

    /// A metadata sub-record declares more payload than the block holds.
    #[error("truncated metadata record")]
    TruncatedMetadata,

    /// The gap between the last produced sample and the next block's start
    /// exceeds the silence-fill cap; the stream is unusable past this point.
    #[error("sample discontinuity of {gap} samples")]
    Discontinuity { gap: u32 },

    /// More channels than the format can carry (at configuration time) or
    /// more concurrent streams than a frame set may hold (at decode time).
    #[error("too many channels: {0}")]
    TooManyChannels(usize),

    /// Seek requested on a stream with unknown length or a non-seekable
    /// byte source. Non-fatal: sequential decoding may continue.
    #[error("stream is not seekable")]
    Unseekable,

    /// The block sink refused a completed block (disk full, closed pipe).
    #[error("block sink rejected output: {0}")]
    Sink(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}
