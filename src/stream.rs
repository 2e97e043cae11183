//! Stream context: the codec state for one mono or stereo channel-group.
//!
//! A multichannel container is a sequence of frame sets, each holding one
//! block per channel-group. The context owns the raw block buffers for its
//! group (primary and, in hybrid mode, correction), the decoded staging
//! buffer, and the monotonic sample position. The coordinator addresses
//! contexts by explicit index; nothing in here knows about its siblings.

use log::debug;

use crate::codec::{DecodeParams, ResidualCodec};
use crate::header::{flags, meta, find_meta, BlockHeader};

/// Verdict on a correction-stream candidate block (see
/// [`StreamContext::feed_correction_candidate`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateAction {
    /// True cross-file match: merge residuals.
    Accept,
    /// The correction stream is behind; keep reading forward.
    Retry,
    /// The correction stream is ahead; rewind one header length and play
    /// this primary block without correction.
    Defer,
}

/// Decode/encode state for one channel-group.
pub struct StreamContext {
    /// Header of the current primary block (replaced per block).
    pub header: BlockHeader,
    /// Absolute index of the next sample this stream will produce. Monotonic
    /// except across an explicit seek.
    pub sample_index: u32,
    /// Metadata area of the current primary block. Reallocated every block
    /// boundary; never retained across blocks.
    pub block_buf: Vec<u8>,
    /// Header of the matched correction block, when one was accepted.
    pub corr_header: Option<BlockHeader>,
    /// Metadata area of the matched correction block. Independently
    /// capacity-tracked from `block_buf`.
    pub corr_buf: Vec<u8>,
    /// No matching correction block was found for the current primary block.
    pub correction_skip: bool,
    /// Whether decode state has been (re)established for the current block.
    /// Cleared by [`reset`](Self::reset), every seek and block boundary.
    pub init_done: bool,
    /// CRC verdict for the current block, valid once `init_done`.
    pub crc_ok: bool,
    /// The current block decoded without its correction part despite being
    /// hybrid, valid once `init_done`.
    pub was_lossy: bool,

    decoded: Vec<i32>,
    decoded_pos: usize,

    /// Encode-side accumulation buffer (interleaved for stereo groups).
    pub sample_buffer: Vec<i32>,
}

impl Default for StreamContext {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamContext {
    pub fn new() -> Self {
        Self {
            header: BlockHeader::default(),
            sample_index: 0,
            block_buf: Vec::new(),
            corr_header: None,
            corr_buf: Vec::new(),
            correction_skip: false,
            init_done: false,
            crc_ok: true,
            was_lossy: false,
            decoded: Vec::new(),
            decoded_pos: 0,
            sample_buffer: Vec::new(),
        }
    }

    /// Channels this stream contributes to the interleaved output.
    pub fn channels(&self) -> usize {
        self.header.channels()
    }

    /// Install a freshly read primary block. Clears any previous correction
    /// match and forces re-initialisation.
    pub fn begin_block(&mut self, header: BlockHeader, meta_area: Vec<u8>) {
        self.header = header;
        self.block_buf = meta_area;
        self.corr_header = None;
        self.corr_buf = Vec::new();
        self.correction_skip = false;
        self.init_done = false;
        self.crc_ok = true;
        self.was_lossy = false;
        self.decoded = Vec::new();
        self.decoded_pos = 0;
    }

    /// Install an accepted (or directly loaded, after a seek) correction
    /// block for the current primary block.
    pub fn accept_correction(&mut self, header: BlockHeader, meta_area: Vec<u8>) {
        self.corr_header = Some(header);
        self.corr_buf = meta_area;
        self.correction_skip = false;
    }

    /// Compare the current primary header against a correction-stream
    /// candidate.
    ///
    /// Equal start index and sample count with identical flags is a true
    /// match. With equal position but differing flags, and for diverging
    /// positions, the relative ordering decides whether the correction
    /// stream must advance (`Retry`) or has overshot (`Defer`); the caller
    /// rewinds one header length on `Defer` so the candidate can match a
    /// later primary block. This bounds forward scanning on streams that
    /// have drifted out of lockstep.
    pub fn feed_correction_candidate(&self, candidate: &BlockHeader) -> CandidateAction {
        let primary = &self.header;
        if primary.block_index == candidate.block_index
            && primary.block_samples == candidate.block_samples
        {
            if primary.flags == candidate.flags {
                return CandidateAction::Accept;
            }
            let rank = |f: u32| {
                let mut r = 0i32;
                if f & flags::INITIAL_BLOCK != 0 {
                    r -= 1;
                }
                if f & flags::FINAL_BLOCK != 0 {
                    r += 1;
                }
                r
            };
            return if rank(candidate.flags) - rank(primary.flags) < 0 {
                CandidateAction::Retry
            } else {
                CandidateAction::Defer
            };
        }
        if (candidate.block_index.wrapping_sub(primary.block_index) as i32) < 0 {
            CandidateAction::Retry
        } else {
            CandidateAction::Defer
        }
    }

    /// Decode the current block into the staging buffer if that has not
    /// happened yet. Structural failures produce a silent block with
    /// `crc_ok == false`; only the CRC verdict reports them.
    pub fn ensure_decoded(&mut self, codec: &dyn ResidualCodec) {
        if self.init_done {
            return;
        }
        self.sample_index = self.header.block_index;
        let n = self.header.block_samples as usize;
        let ch = self.channels();

        let merged = self.corr_header.is_some() && !self.correction_skip;
        let hybrid = self.header.flags & flags::HYBRID != 0;
        self.was_lossy = hybrid && !merged;

        let params = DecodeParams {
            channels: ch,
            joint_stereo: self.header.flags & flags::JOINT_STEREO != 0,
            block_samples: n,
        };
        let correction = merged
            .then(|| find_meta(&self.corr_buf, meta::CORRECTION))
            .flatten();
        let outcome = find_meta(&self.block_buf, meta::RESIDUAL)
            .ok_or(())
            .and_then(|residual| codec.decode(residual, correction, &params).map_err(|_| ()));

        let expected_crc = match (&self.corr_header, merged) {
            (Some(corr), true) => corr.crc,
            _ => self.header.crc,
        };
        match outcome {
            Ok(samples) => {
                self.crc_ok = crate::codec::samples_crc(&samples) == expected_crc;
                self.decoded = samples;
            }
            Err(()) => {
                debug!(
                    "block at sample {} is undecodable, substituting silence",
                    self.header.block_index
                );
                self.decoded = vec![0i32; n * ch];
                self.crc_ok = false;
            }
        }
        self.decoded_pos = 0;
        self.init_done = true;
    }

    /// Samples of the current block not yet consumed.
    pub fn remaining(&self) -> u32 {
        self.header.block_end().wrapping_sub(self.sample_index)
    }

    /// Consume `n` samples from the staging buffer, advancing the stream
    /// position. Returns the interleaved slice (`n * channels` values).
    pub fn take(&mut self, n: usize) -> &[i32] {
        let ch = self.channels();
        let start = self.decoded_pos * ch;
        let end = ((self.decoded_pos + n) * ch).min(self.decoded.len());
        self.decoded_pos += n;
        self.sample_index = self.sample_index.wrapping_add(n as u32);
        &self.decoded[start.min(self.decoded.len())..end]
    }

    /// Clear decode state so the next access re-establishes it from the
    /// block start. Used at every seek and at error-recovery points.
    pub fn reset(&mut self) {
        self.init_done = false;
        self.decoded_pos = 0;
    }

    /// Drop all block buffers (kept header and position). Called at every
    /// frame-set boundary; buffers are reallocated for the next block.
    pub fn release(&mut self) {
        self.block_buf = Vec::new();
        self.corr_buf = Vec::new();
        self.corr_header = None;
        self.decoded = Vec::new();
        self.decoded_pos = 0;
        self.init_done = false;
    }
}
