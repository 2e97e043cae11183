//! Header scanning: the shared "find next plausible header at or after
//! position" primitives.
//!
//! Sequential decode and the seek engine both resynchronise by scanning raw
//! bytes for a valid 32-byte header. Both paths go through
//! [`BlockHeader::plausible`] so a header accepted by one is accepted by the
//! other; divergent predicates would make seek land on blocks the decoder
//! then refuses.

use log::debug;

use crate::error::Result;
use crate::header::{BlockHeader, HEADER_SIZE, MAGIC};
use crate::io::ByteSource;

/// Sequential scans give up after skipping this many bytes.
pub const HEADER_SEARCH_LIMIT: u64 = 1024 * 1024;

/// Buffer size for the seeking scan.
const PROBE_BUF: usize = 4096;

/// Read forward from the current position until a plausible header is found.
///
/// Does not require a seekable source. Returns the number of bytes skipped
/// before the header and the parsed header itself; the source is left
/// positioned at the first byte after the 32 header bytes. `Ok(None)` means
/// end of stream or more than `limit` bytes of junk.
pub fn next_header<S: ByteSource + ?Sized>(
    src: &mut S,
    limit: u64,
) -> Result<Option<(u64, BlockHeader)>> {
    let mut buf = [0u8; HEADER_SIZE];
    let mut have = 0usize;
    let mut skipped = 0u64;

    loop {
        while have < HEADER_SIZE {
            let n = src.read_bytes(&mut buf[have..])?;
            if n == 0 {
                return Ok(None);
            }
            have += n;
        }

        if let Some(hdr) = BlockHeader::plausible(&buf) {
            if skipped > 0 {
                debug!("resynchronised after {skipped} junk bytes");
            }
            return Ok(Some((skipped, hdr)));
        }

        // Slide the window to the next possible magic byte.
        let step = buf[1..]
            .iter()
            .position(|&b| b == MAGIC[0])
            .map(|p| p + 1)
            .unwrap_or(HEADER_SIZE);
        buf.copy_within(step.., 0);
        have = HEADER_SIZE - step;
        skipped += step as u64;
        if skipped > limit {
            return Ok(None);
        }
    }
}

/// Seek to `pos` and scan forward for a plausible header, returning its
/// exact byte offset. With `audio_initial_only` the scan skips headers that
/// do not open an audio frame set, which is what seek probing needs: only
/// stream-initial audio blocks carry a usable sample position.
///
/// Large intervening blocks are skipped by their declared size rather than
/// byte-scanned. Scans to end of stream; `Ok(None)` when nothing qualifies.
pub fn find_header<S: ByteSource + ?Sized>(
    src: &mut S,
    pos: u64,
    audio_initial_only: bool,
) -> Result<Option<(u64, BlockHeader)>> {
    if src.set_pos_abs(pos).is_err() {
        return Ok(None);
    }

    let mut window: Vec<u8> = Vec::with_capacity(PROBE_BUF);
    let mut base = pos;

    'refill: loop {
        let old_len = window.len();
        window.resize(PROBE_BUF, 0);
        let n = src.read_bytes(&mut window[old_len..])?;
        window.truncate(old_len + n);
        if window.len() < HEADER_SIZE {
            return Ok(None);
        }

        let mut i = 0usize;
        while i + HEADER_SIZE <= window.len() {
            if window[i] == MAGIC[0] {
                let raw: &[u8; HEADER_SIZE] = window[i..i + HEADER_SIZE].try_into().unwrap();
                if let Some(hdr) = BlockHeader::plausible(raw) {
                    if !audio_initial_only || (hdr.block_samples > 0 && hdr.is_initial()) {
                        return Ok(Some((base + i as u64, hdr)));
                    }
                    if hdr.ck_size > 1024 {
                        // Not a candidate; jump past its payload instead of
                        // scanning through it.
                        let jump = base + i as u64 + u64::from(hdr.ck_size) + 8;
                        if src.set_pos_abs(jump).is_err() {
                            return Ok(None);
                        }
                        window.clear();
                        base = jump;
                        continue 'refill;
                    }
                }
            }
            i += 1;
        }

        if n == 0 {
            return Ok(None);
        }
        // Keep the tail that may start a header spanning the refill boundary.
        let keep = HEADER_SIZE - 1;
        let drop = window.len() - keep;
        window.copy_within(drop.., 0);
        window.truncate(keep);
        base += drop as u64;
    }
}

/// Scan backward-ish from the stream tail for the last audio block and
/// return one past its final sample index. Used when the first block does
/// not carry a usable total-sample count. Leaves the position undefined.
pub fn final_sample_index<S: ByteSource + ?Sized>(src: &mut S) -> Result<Option<u32>> {
    use crate::io::Whence;

    let len = src.get_length();
    if len > 1_200_000 {
        if src.set_pos_rel(-1_048_576, Whence::End).is_err() {
            return Ok(None);
        }
    } else if src.set_pos_abs(0).is_err() {
        return Ok(None);
    }

    let mut result = None;
    while let Some((_skipped, hdr)) = next_header(src, HEADER_SEARCH_LIMIT)? {
        if src
            .set_pos_rel(hdr.meta_len() as i64, Whence::Current)
            .is_err()
        {
            break;
        }
        if hdr.block_samples > 0 && hdr.is_final() {
            result = Some(hdr.block_end());
        }
    }
    Ok(result)
}
