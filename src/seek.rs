//! Seek engine: locate the block containing an arbitrary sample index.
//!
//! The byte stream has no seek table; block positions are found by an
//! approximate-then-refine bracket search. A linear interpolation between
//! the known `[sample, byte]` bracket endpoints estimates a byte position,
//! scaled by a confidence ratio that shrinks on every failed probe; each
//! probe scans forward for the next stream-initial audio header and narrows
//! the bracket by the found block's sample range. The same routine serves
//! the primary and the correction stream.

use log::debug;

use crate::error::Result;
use crate::header::BlockHeader;
use crate::io::ByteSource;
use crate::scan;

/// Probe confidence at the first attempt.
const START_RATIO: f64 = 0.96;
/// Confidence lost per failed probe; at 0.0 the next miss gives up.
const RATIO_STEP: f64 = 0.24;

/// Byte position of the audio block containing `sample`, or `None` when the
/// bracket search exhausts its confidence budget.
///
/// `current` optionally carries the header and byte position of the block
/// currently loaded for the initial stream; when it brackets the target on
/// either side the search starts narrowed, and when it contains the target
/// the search is over before any probe.
pub fn find_block<S: ByteSource + ?Sized>(
    src: &mut S,
    current: Option<(&BlockHeader, u64)>,
    total_samples: u32,
    initial_index: u32,
    sample: u32,
) -> Result<Option<u64>> {
    if sample >= total_samples {
        return Ok(None);
    }

    let mut file_pos1 = 0u64;
    let mut file_pos2 = src.get_length();
    let mut sample_pos1 = 0u32;
    let mut sample_pos2 = total_samples;
    let mut ratio = START_RATIO;
    let mut file_skip = false;

    if let Some((hdr, pos)) = current {
        if hdr.block_samples > 0 && pos > 0 {
            if hdr.block_index > sample {
                sample_pos2 = hdr.block_index;
                file_pos2 = pos;
            } else if hdr.block_end() <= sample {
                sample_pos1 = hdr.block_index;
                file_pos1 = pos;
            } else {
                return Ok(Some(pos));
            }
        }
    }

    loop {
        let span = sample_pos2.saturating_sub(sample_pos1).max(1);
        let bytes_per_sample = (file_pos2.saturating_sub(file_pos1)) as f64 / f64::from(span);
        let mut probe_pos = file_pos1 + if file_skip { 32 } else { 0 };
        probe_pos += (bytes_per_sample * f64::from(sample - sample_pos1) * ratio) as u64;

        let found = scan::find_header(src, probe_pos, true)?.map(|(pos, mut hdr)| {
            hdr.block_index = hdr.block_index.wrapping_sub(initial_index);
            (pos, hdr)
        });
        debug!(
            "seek probe at byte {probe_pos} (ratio {ratio:.2}) -> {:?}",
            found.as_ref().map(|(p, h)| (*p, h.block_index))
        );

        match found {
            Some((pos, hdr)) if pos < file_pos2 => {
                if hdr.block_index > sample {
                    sample_pos2 = hdr.block_index;
                    file_pos2 = pos;
                } else if hdr.block_end() <= sample {
                    if pos == file_pos1 {
                        // The bracket floor keeps reproducing itself; nudge
                        // the next estimate past its header.
                        file_skip = true;
                    } else {
                        sample_pos1 = hdr.block_index;
                        file_pos1 = pos;
                    }
                } else {
                    return Ok(Some(pos));
                }
            }
            _ => {
                if ratio > 0.0 {
                    ratio = (ratio - RATIO_STEP).max(0.0);
                } else {
                    return Ok(None);
                }
            }
        }
    }
}
