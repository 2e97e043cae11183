//! Multi-stream coordinator: the streaming pack/unpack engine.
//!
//! # Unpacker
//! [`Unpacker`] drives sequential decode over a primary byte source and an
//! optional correction source. Each decode step reads the next frame set
//! (one block per channel-group), matches correction blocks against primary
//! blocks, de-interleaves per-group output positionally into the caller's
//! buffer, and recovers from CRC damage by rewinding a bounded distance and
//! resynchronising on the next plausible header.
//!
//! # Packer
//! [`Packer`] accumulates interleaved samples into per-stream buffers until
//! the block-sample target is reached, then emits one self-delimiting block
//! per stream (primary and, in hybrid mode, correction) through a
//! [`BlockSink`]. Wrapper bytes and the stream checksum ride along as
//! metadata sub-records.
//!
//! All I/O is blocking and single-threaded; fixed byte/iteration bounds act
//! as circuit breakers instead of cancellation.

use log::{debug, warn};

use crate::codec::{default_codec, BlockParams, ResidualCodec};
use crate::error::{Error, Result};
use crate::header::{
    self, find_meta, flags, meta, write_meta, BlockHeader, MetaIter, CUR_VERSION, UNKNOWN_TOTAL,
};
use crate::io::{peek_byte, read_exact, BlockSink, ByteSource, SinkDest, Whence};
use crate::scan::{self, HEADER_SEARCH_LIMIT};
use crate::seek;
use crate::stream::StreamContext;
use crate::tags::TagStore;
use crate::wrapper::{PendingMeta, WrapperStore, MAX_WRAPPER_BYTES};

/// Most channel-group streams one container may hold.
pub const MAX_STREAMS: usize = 8;
/// Largest silence-fill gap; anything larger is a fatal discontinuity.
pub const MAX_GAP_SAMPLES: u32 = 262_144;
/// Largest decode-and-discard distance after landing a seek.
pub const MAX_SEEK_SKIP: u32 = 131_072;
/// Consecutive zero-sample headers tolerated before giving up on a stream.
const MAX_EMPTY_HEADERS: u32 = 16;

/// Backward-resync policy applied after a CRC mismatch. The rewind distance
/// is `ck_size / divisor` clamped to `max_rewind`; the constants are
/// empirical, preserved as policy rather than re-derived.
#[derive(Debug, Clone, Copy)]
pub struct ResyncPolicy {
    pub divisor: u32,
    pub max_rewind: u32,
}

impl Default for ResyncPolicy {
    fn default() -> Self {
        Self { divisor: 3, max_rewind: 16 * 1024 }
    }
}

/// Global stream properties negotiated from the first audio block.
#[derive(Debug, Clone, Copy)]
pub struct StreamConfig {
    pub sample_rate: u32,
    pub num_channels: usize,
    pub bits_per_sample: u32,
    pub bytes_per_sample: u32,
    pub hybrid: bool,
}

/// Summary of what an open container turned out to be.
#[derive(Debug, Clone, Copy, Default)]
pub struct Mode {
    /// Bit-exact output (pure lossless, or hybrid with correction merged and
    /// no lossy blocks observed so far).
    pub lossless: bool,
    pub hybrid: bool,
    /// A correction stream was attached and matched.
    pub has_correction: bool,
    /// At least one block decoded without its correction part.
    pub lossy_blocks: bool,
    pub has_tag: bool,
    pub has_ape_tag: bool,
}

/// Options for [`Unpacker::open`].
#[derive(Debug, Clone, Copy)]
pub struct OpenOptions {
    /// Raw mode: decode blocks as they come, ignoring their stream
    /// positions. Seeking is unsupported.
    pub streaming: bool,
    /// Look for a trailer tag before decoding (seekable sources only).
    pub read_tags: bool,
    /// Accumulate wrapper bytes found in block metadata.
    pub collect_wrapper: bool,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self { streaming: false, read_tags: false, collect_wrapper: true }
    }
}

// ── Shared helpers ───────────────────────────────────────────────────────────

fn read_block_payload<S: ByteSource + ?Sized>(
    src: &mut S,
    hdr: &BlockHeader,
) -> std::io::Result<Vec<u8>> {
    let mut payload = vec![0u8; hdr.meta_len()];
    read_exact(src, &mut payload)?;
    Ok(payload)
}

fn collect_meta(
    area: &[u8],
    collect_wrapper: bool,
    wrapper: &mut WrapperStore,
    checksum: &mut Option<[u8; 16]>,
) {
    for rec in MetaIter::new(area) {
        let Ok(rec) = rec else {
            debug!("truncated metadata area, stopping sub-record scan");
            break;
        };
        match rec.id {
            meta::WRAPPER_HEAD | meta::WRAPPER_TAIL if collect_wrapper => wrapper.push(rec.data),
            meta::STREAM_CHECKSUM if rec.data.len() == 16 => {
                let mut digest = [0u8; 16];
                digest.copy_from_slice(rec.data);
                *checksum = Some(digest);
            }
            _ => {}
        }
    }
}

/// Read the correction block matching the stream's current primary block.
///
/// Candidates are scanned forward; see
/// [`StreamContext::feed_correction_candidate`] for the match policy. A
/// missed block sets the skip flag and counts one error; only a dead
/// correction stream returns `Ok(false)`.
fn read_correction_block<S: ByteSource + ?Sized>(
    corr: &mut S,
    ctx: &mut StreamContext,
    initial_index: u32,
    streaming: bool,
    file2pos: &mut u64,
    crc_errors: &mut u32,
) -> Result<bool> {
    use crate::stream::CandidateAction::*;

    loop {
        let start = corr.get_pos()?;
        let Some((skipped, mut hdr)) = scan::next_header(corr, HEADER_SEARCH_LIMIT)? else {
            ctx.correction_skip = true;
            *crc_errors += 1;
            return Ok(false);
        };
        if streaming {
            hdr.block_index = ctx.header.block_index;
        } else {
            hdr.block_index = hdr.block_index.wrapping_sub(initial_index);
        }
        if hdr.is_initial() {
            *file2pos = start + skipped;
        }

        match ctx.feed_correction_candidate(&hdr) {
            Accept => {
                let bad_flags = hdr.flags & !flags::KNOWN_MASK != 0;
                match read_block_payload(corr, &hdr) {
                    Ok(payload) if !bad_flags => {
                        ctx.accept_correction(hdr, payload);
                        return Ok(true);
                    }
                    _ => {
                        ctx.correction_skip = true;
                        *crc_errors += 1;
                        return Ok(false);
                    }
                }
            }
            Retry => {
                debug!(
                    "correction stream behind (candidate {} < primary {}), reading on",
                    hdr.block_index, ctx.header.block_index
                );
            }
            Defer => {
                debug!(
                    "correction stream ahead (candidate {} > primary {}), deferring",
                    hdr.block_index, ctx.header.block_index
                );
                ctx.correction_skip = true;
                let _ = corr.set_pos_rel(-(header::HEADER_SIZE as i64), Whence::Current);
                *crc_errors += 1;
                return Ok(true);
            }
        }
    }
}

// ── Unpacker ─────────────────────────────────────────────────────────────────

/// Streaming decoder over a primary byte source and an optional correction
/// source. Callers must serialise access; no internal locking exists.
pub struct Unpacker<S: ByteSource> {
    primary: S,
    correction: Option<S>,
    codec: Box<dyn ResidualCodec>,
    streams: Vec<StreamContext>,
    config: StreamConfig,
    total_samples: Option<u32>,
    initial_index: u32,
    streaming: bool,
    collect_wrapper: bool,
    has_correction: bool,
    crc_errors: u32,
    lossy_blocks: bool,
    wrapper: WrapperStore,
    stored_checksum: Option<[u8; 16]>,
    out_hasher: blake3::Hasher,
    tag: Option<TagStore>,
    /// Byte position of the current initial-stream block header.
    filepos: u64,
    /// Byte position of the current correction frame set.
    file2pos: u64,
    pub resync: ResyncPolicy,
    pending_error: Option<Error>,
}

impl<S: ByteSource> Unpacker<S> {
    /// Open a container for decoding, negotiating the stream configuration
    /// from the first audio block. The correction source, when given, is
    /// attached only if the stream is hybrid.
    pub fn open(primary: S, correction: Option<S>, opts: OpenOptions) -> Result<Self> {
        let mut up = Unpacker {
            primary,
            correction,
            codec: default_codec(),
            streams: vec![StreamContext::new()],
            config: StreamConfig {
                sample_rate: 44100,
                num_channels: 2,
                bits_per_sample: 16,
                bytes_per_sample: 2,
                hybrid: false,
            },
            total_samples: None,
            initial_index: 0,
            streaming: opts.streaming,
            collect_wrapper: opts.collect_wrapper,
            has_correction: false,
            crc_errors: 0,
            lossy_blocks: false,
            wrapper: WrapperStore::new(),
            stored_checksum: None,
            out_hasher: blake3::Hasher::new(),
            tag: None,
            filepos: 0,
            file2pos: 0,
            resync: ResyncPolicy::default(),
            pending_error: None,
        };

        if opts.read_tags && up.primary.can_seek() {
            up.tag = TagStore::load(&mut up.primary)?;
            up.primary.set_pos_abs(0)?;
        }
        if peek_byte(&mut up.primary)?.is_none() {
            return Err(Error::Format("empty stream".into()));
        }

        let mut empty_blocks = 0u32;
        loop {
            up.filepos = up.primary.get_pos()?;
            let Some((skipped, mut hdr)) = scan::next_header(&mut up.primary, HEADER_SEARCH_LIMIT)?
            else {
                return Err(Error::Format("no usable block found".into()));
            };
            up.filepos += skipped;
            if hdr.block_samples == 0 {
                empty_blocks += 1;
                if empty_blocks > MAX_EMPTY_HEADERS {
                    return Err(Error::Format("stream yields only empty blocks".into()));
                }
            }

            if opts.streaming {
                hdr.block_index = 0;
            }
            let payload = read_block_payload(&mut up.primary, &hdr)?;
            up.streams[0].begin_block(hdr, payload);
            collect_meta(
                &up.streams[0].block_buf,
                up.collect_wrapper,
                &mut up.wrapper,
                &mut up.stored_checksum,
            );

            if up.streams[0].header.block_samples == 0 {
                continue;
            }

            if !opts.streaming {
                let hdr = up.streams[0].header;
                if hdr.block_index != 0 || hdr.total_samples == UNKNOWN_TOTAL {
                    up.initial_index = hdr.block_index;
                    up.streams[0].header.block_index = 0;
                    if up.primary.can_seek() {
                        let save = up.primary.get_pos()?;
                        if let Some(final_index) = scan::final_sample_index(&mut up.primary)? {
                            up.total_samples =
                                Some(final_index.wrapping_sub(up.initial_index));
                        }
                        up.primary.set_pos_abs(save)?;
                    }
                } else {
                    up.total_samples = Some(hdr.total_samples);
                }
            }

            if up.correction.is_some() && up.streams[0].header.flags & flags::HYBRID != 0 {
                up.has_correction = true;
                let corr = up.correction.as_mut().unwrap();
                if !read_correction_block(
                    corr,
                    &mut up.streams[0],
                    up.initial_index,
                    up.streaming,
                    &mut up.file2pos,
                    &mut up.crc_errors,
                )? {
                    return Err(Error::Format(
                        "correction stream does not match the primary stream".into(),
                    ));
                }
            }
            break;
        }

        let first = &up.streams[0];
        let hdr = first.header;
        up.config = StreamConfig {
            sample_rate: hdr.sample_rate(),
            num_channels: find_meta(&first.block_buf, meta::CHANNEL_INFO)
                .and_then(|d| d.first().copied())
                .map(usize::from)
                .filter(|&n| n > 0)
                .unwrap_or_else(|| hdr.channels()),
            bits_per_sample: (hdr.bytes_per_sample() * 8).saturating_sub(hdr.shift()).max(1),
            bytes_per_sample: hdr.bytes_per_sample(),
            hybrid: hdr.flags & flags::HYBRID != 0,
        };
        Ok(up)
    }

    // ── Introspection ───────────────────────────────────────────────────────

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    pub fn sample_rate(&self) -> u32 {
        self.config.sample_rate
    }

    pub fn num_channels(&self) -> usize {
        self.config.num_channels
    }

    pub fn bits_per_sample(&self) -> u32 {
        self.config.bits_per_sample
    }

    pub fn bytes_per_sample(&self) -> u32 {
        self.config.bytes_per_sample
    }

    /// Total samples in the stream, when known.
    pub fn total_samples(&self) -> Option<u32> {
        self.total_samples
    }

    /// Absolute index of the next sample to be produced.
    pub fn sample_index(&self) -> u32 {
        self.streams[0].sample_index
    }

    /// CRC/correction error events observed so far. Degraded output is
    /// visible only through this counter; decoding never aborts on it.
    pub fn num_errors(&self) -> u32 {
        self.crc_errors
    }

    /// Whether any block decoded without its correction part.
    pub fn lossy_blocks(&self) -> bool {
        self.lossy_blocks
    }

    /// Progress through the stream from 0.0 to 1.0, when the total is known.
    pub fn progress(&self) -> Option<f64> {
        self.total_samples
            .filter(|&t| t > 0)
            .map(|t| f64::from(self.sample_index()) / f64::from(t))
    }

    pub fn mode(&self) -> Mode {
        let hybrid = self.config.hybrid;
        Mode {
            lossless: (!hybrid || self.has_correction) && !self.lossy_blocks,
            hybrid,
            has_correction: self.has_correction,
            lossy_blocks: self.lossy_blocks,
            has_tag: self.tag.as_ref().is_some_and(|t| t.is_valid()),
            has_ape_tag: self.tag.as_ref().is_some_and(|t| t.has_ape()),
        }
    }

    pub fn tag(&self) -> Option<&TagStore> {
        self.tag.as_ref()
    }

    pub fn tag_mut(&mut self) -> Option<&mut TagStore> {
        self.tag.as_mut()
    }

    /// Wrapper bytes accumulated from decoded blocks so far.
    pub fn wrapper_data(&self) -> &[u8] {
        self.wrapper.bytes()
    }

    /// Hand over and clear the accumulated wrapper bytes.
    pub fn take_wrapper(&mut self) -> Vec<u8> {
        self.wrapper.take()
    }

    /// First 16 bytes of the BLAKE3 of everything unpacked so far. Only
    /// meaningful after a full sequential decode from sample 0.
    pub fn computed_checksum(&self) -> [u8; 16] {
        let mut digest = [0u8; 16];
        digest.copy_from_slice(&self.out_hasher.finalize().as_bytes()[..16]);
        digest
    }

    /// The stream checksum stored by the encoder, scanning the stream tail
    /// if it has not been seen yet (seekable sources only).
    pub fn stream_checksum(&mut self) -> Result<Option<[u8; 16]>> {
        if self.stored_checksum.is_none() {
            self.scan_tail()?;
        }
        Ok(self.stored_checksum)
    }

    /// Pick up any trailing wrapper stored in the final blocks, restoring
    /// the read position afterward. Unavailable on non-seekable sources.
    pub fn seek_trailing_wrapper(&mut self) -> Result<()> {
        self.scan_tail()
    }

    fn scan_tail(&mut self) -> Result<()> {
        if !self.primary.can_seek() {
            return Err(Error::Unseekable);
        }
        let save = self.primary.get_pos()?;
        if self.primary.get_length() > 1_200_000 {
            self.primary.set_pos_rel(-1_048_576, Whence::End)?;
        } else {
            self.primary.set_pos_abs(0)?;
        }
        while let Some((_skipped, hdr)) = scan::next_header(&mut self.primary, HEADER_SEARCH_LIMIT)?
        {
            let Ok(payload) = read_block_payload(&mut self.primary, &hdr) else {
                break;
            };
            collect_meta(&payload, true, &mut self.wrapper, &mut self.stored_checksum);
        }
        self.primary.set_pos_abs(save)?;
        Ok(())
    }

    // ── Decode ──────────────────────────────────────────────────────────────

    fn release_blocks(&mut self) {
        self.streams.truncate(1);
        self.streams[0].release();
    }

    fn feed_hasher(&mut self, samples: &[i32]) {
        for v in samples {
            self.out_hasher.update(&v.to_le_bytes());
        }
    }

    /// Unpack up to `out.len() / num_channels` complete samples from the
    /// current position, right-justified 32-bit per channel, interleaved.
    /// Returns the number of complete samples produced; 0 after the stream
    /// end. Recoverable damage shows up in [`num_errors`](Self::num_errors),
    /// not in the return value.
    pub fn unpack(&mut self, out: &mut [i32]) -> Result<u32> {
        if let Some(err) = self.pending_error.take() {
            return Err(err);
        }
        let nch = self.config.num_channels;
        debug_assert_eq!(out.len() % nch, 0);
        let mut want = (out.len() / nch) as u32;
        let mut produced = 0u32;
        let mut out_off = 0usize;

        'outer: while want > 0 {
            let need_block = {
                let ctx = &self.streams[0];
                ctx.header.block_samples == 0
                    || !ctx.header.is_initial()
                    || ctx.sample_index >= ctx.header.block_end()
            };

            if need_block {
                if self.wrapper.len() >= MAX_WRAPPER_BYTES {
                    break;
                }
                self.release_blocks();
                self.filepos = self.primary.get_pos()?;
                let Some((skipped, mut hdr)) =
                    scan::next_header(&mut self.primary, HEADER_SEARCH_LIMIT)?
                else {
                    break;
                };
                if self.streaming {
                    hdr.block_index = 0;
                    self.streams[0].sample_index = 0;
                } else {
                    hdr.block_index = hdr.block_index.wrapping_sub(self.initial_index);
                }
                self.filepos += skipped;

                let payload = match read_block_payload(&mut self.primary, &hdr) {
                    Ok(p) => p,
                    Err(_) => {
                        warn!("cannot read all of last block");
                        self.streams[0].header = BlockHeader::default();
                        break;
                    }
                };
                let ctx = &mut self.streams[0];
                let index_drift =
                    hdr.block_samples > 0 && ctx.sample_index != hdr.block_index;
                ctx.begin_block(hdr, payload);
                collect_meta(
                    &self.streams[0].block_buf,
                    self.collect_wrapper,
                    &mut self.wrapper,
                    &mut self.stored_checksum,
                );
                if index_drift {
                    self.crc_errors += 1;
                }
                if hdr.block_samples > 0 && self.has_correction {
                    let corr = self.correction.as_mut().unwrap();
                    read_correction_block(
                        corr,
                        &mut self.streams[0],
                        self.initial_index,
                        self.streaming,
                        &mut self.file2pos,
                        &mut self.crc_errors,
                    )?;
                }
            }

            {
                let ctx = &self.streams[0];
                if ctx.header.block_samples == 0
                    || !ctx.header.is_initial()
                    || ctx.sample_index >= ctx.header.block_end()
                {
                    continue;
                }
            }

            // Silence-fill any gap up to the block start.
            if self.streams[0].sample_index < self.streams[0].header.block_index {
                let gap = self.streams[0].header.block_index - self.streams[0].sample_index;
                if gap > MAX_GAP_SAMPLES {
                    warn!("discontinuity of {gap} samples, stream unusable");
                    self.streams[0].header = BlockHeader::default();
                    let err = Error::Discontinuity { gap };
                    if produced == 0 {
                        return Err(err);
                    }
                    self.pending_error = Some(err);
                    break;
                }
                let fill = gap.min(want);
                for ctx in &mut self.streams {
                    ctx.sample_index = ctx.sample_index.wrapping_add(fill);
                }
                out[out_off..out_off + fill as usize * nch].fill(0);
                self.feed_hasher(&out[out_off..out_off + fill as usize * nch]);
                produced += fill;
                want -= fill;
                out_off += fill as usize * nch;
                continue;
            }

            let block_end = self.streams[0].header.block_end();
            let n = (block_end - self.streams[0].sample_index).min(want) as usize;
            let mut file_done = false;
            let mut lossy_seen = false;

            if self.streams[0].header.is_final() && nch <= 2 {
                let ctx = &mut self.streams[0];
                ctx.ensure_decoded(&*self.codec);
                lossy_seen |= ctx.was_lossy;
                let chunk = ctx.take(n);
                out[out_off..out_off + chunk.len()].copy_from_slice(chunk);
            } else {
                // Frame-set gather: one stream per block until the final
                // flag, the stream cap, or a full set of output slots.
                let mut offset = 0usize;
                let mut si = 0usize;
                let mut saw_final = false;
                loop {
                    if si == self.streams.len() {
                        let Some((_skipped, mut hdr)) =
                            scan::next_header(&mut self.primary, HEADER_SEARCH_LIMIT)?
                        else {
                            self.streams[0].header = BlockHeader::default();
                            file_done = true;
                            break;
                        };
                        if self.streaming {
                            hdr.block_index = 0;
                        } else {
                            hdr.block_index = hdr.block_index.wrapping_sub(self.initial_index);
                        }
                        let payload = match read_block_payload(&mut self.primary, &hdr) {
                            Ok(p) => p,
                            Err(_) => {
                                self.streams[0].header = BlockHeader::default();
                                file_done = true;
                                break;
                            }
                        };
                        let mut ctx = StreamContext::new();
                        ctx.begin_block(hdr, payload);
                        collect_meta(
                            &ctx.block_buf,
                            self.collect_wrapper,
                            &mut self.wrapper,
                            &mut self.stored_checksum,
                        );
                        if self.has_correction {
                            let corr = self.correction.as_mut().unwrap();
                            read_correction_block(
                                corr,
                                &mut ctx,
                                self.initial_index,
                                self.streaming,
                                &mut self.file2pos,
                                &mut self.crc_errors,
                            )?;
                        }
                        self.streams.push(ctx);
                    }

                    let stream_count = self.streams.len();
                    let ctx = &mut self.streams[si];
                    ctx.ensure_decoded(&*self.codec);
                    lossy_seen |= ctx.was_lossy;
                    let stream_ch = ctx.channels();
                    let chunk = ctx.take(n);

                    if stream_ch == 1 {
                        for (k, &v) in chunk.iter().enumerate() {
                            out[out_off + k * nch + offset] = v;
                        }
                        offset += 1;
                    } else if offset == nch - 1 {
                        // A stereo block landing on the last output slot
                        // contributes only its left channel.
                        for k in 0..chunk.len() / 2 {
                            out[out_off + k * nch + offset] = chunk[2 * k];
                        }
                        self.crc_errors += 1;
                        offset += 1;
                    } else {
                        for k in 0..chunk.len() / 2 {
                            out[out_off + k * nch + offset] = chunk[2 * k];
                            out[out_off + k * nch + offset + 1] = chunk[2 * k + 1];
                        }
                        offset += 2;
                    }

                    saw_final = self.streams[si].header.is_final();
                    if saw_final || stream_count == MAX_STREAMS || offset >= nch {
                        break;
                    }
                    si += 1;
                }

                if !saw_final && !file_done && self.streams.len() == MAX_STREAMS {
                    let err = Error::TooManyChannels(nch);
                    if produced == 0 {
                        return Err(err);
                    }
                    self.pending_error = Some(err);
                    break 'outer;
                }
            }

            if lossy_seen {
                self.lossy_blocks = true;
            }
            if file_done {
                warn!("cannot read all of last frame set");
                break;
            }

            let region_start = out_off;
            produced += n as u32;
            want -= n as u32;
            out_off += n * nch;
            self.feed_hasher(&out[region_start..out_off]);

            // Frame set complete: verify CRCs and resynchronise on damage.
            if self.streams[0].sample_index == block_end {
                let any_bad = self.streams.iter().any(|s| s.init_done && !s.crc_ok);
                if any_bad {
                    let rewind =
                        (self.streams[0].header.ck_size / self.resync.divisor.max(1))
                            .min(self.resync.max_rewind);
                    debug!("crc mismatch in frame set, rewinding {rewind} bytes to resync");
                    if self.primary.can_seek() {
                        let _ = self.primary.set_pos_rel(-i64::from(rewind), Whence::Current);
                    }
                    if self.has_correction {
                        if let Some(corr_hdr) = self.streams[0].corr_header {
                            let corr = self.correction.as_mut().unwrap();
                            if corr.can_seek() {
                                let rewind = (corr_hdr.ck_size / self.resync.divisor.max(1))
                                    .min(self.resync.max_rewind);
                                let _ = corr.set_pos_rel(-i64::from(rewind), Whence::Current);
                            }
                        }
                    }
                    self.crc_errors += 1;
                }
            }

            if let Some(total) = self.total_samples {
                if self.streams[0].sample_index >= total {
                    break;
                }
            }
        }

        Ok(produced)
    }

    // ── Seek ────────────────────────────────────────────────────────────────

    /// Seek so the next [`unpack`](Self::unpack) call produces `sample`.
    ///
    /// Requires a known total-sample count and seekable sources; returns
    /// [`Error::Unseekable`] otherwise, which is non-fatal — sequential
    /// decoding may continue from the current position.
    pub fn seek_to_sample(&mut self, sample: u32) -> Result<()> {
        let Some(total) = self.total_samples else {
            return Err(Error::Unseekable);
        };
        if sample >= total || self.streaming || !self.primary.can_seek() {
            return Err(Error::Unseekable);
        }
        if self.has_correction
            && !self.correction.as_mut().map(|c| c.can_seek()).unwrap_or(false)
        {
            return Err(Error::Unseekable);
        }

        let in_current = {
            let ctx = &self.streams[0];
            ctx.header.block_samples > 0
                && ctx.header.is_initial()
                && !ctx.block_buf.is_empty()
                && sample >= ctx.header.block_index
                && sample < ctx.header.block_end()
        };

        if !in_current {
            let hint_header = self.streams[0].header;
            self.release_blocks();
            let pos = seek::find_block(
                &mut self.primary,
                Some((&hint_header, self.filepos)),
                total,
                self.initial_index,
                sample,
            )?
            .ok_or(Error::Unseekable)?;
            self.filepos = pos;

            if self.has_correction {
                let corr = self.correction.as_mut().unwrap();
                self.file2pos =
                    seek::find_block(corr, None, total, self.initial_index, sample)?
                        .ok_or(Error::Unseekable)?;
            }

            self.primary.set_pos_abs(self.filepos)?;
            let mut raw = [0u8; header::HEADER_SIZE];
            read_exact(&mut self.primary, &mut raw)?;
            let mut hdr = BlockHeader::from_bytes(&raw)?;
            hdr.block_index = hdr.block_index.wrapping_sub(self.initial_index);
            let payload = read_block_payload(&mut self.primary, &hdr)?;
            self.streams[0].begin_block(hdr, payload);

            if self.has_correction {
                let corr = self.correction.as_mut().unwrap();
                corr.set_pos_abs(self.file2pos)?;
                let mut raw = [0u8; header::HEADER_SIZE];
                read_exact(corr, &mut raw)?;
                let mut corr_hdr = BlockHeader::from_bytes(&raw)?;
                corr_hdr.block_index = corr_hdr.block_index.wrapping_sub(self.initial_index);
                let corr_payload = read_block_payload(corr, &corr_hdr)?;
                self.streams[0].accept_correction(corr_hdr, corr_payload);
            }
        }

        // Pull the rest of the frame set for multichannel streams.
        while !self.streams.last().unwrap().header.is_final() {
            if self.streams.len() == MAX_STREAMS {
                self.release_blocks();
                return Err(Error::TooManyChannels(self.config.num_channels));
            }
            let Some((_skipped, mut hdr)) =
                scan::next_header(&mut self.primary, HEADER_SEARCH_LIMIT)?
            else {
                self.release_blocks();
                return Err(Error::Format("frame set truncated".into()));
            };
            hdr.block_index = hdr.block_index.wrapping_sub(self.initial_index);
            let payload = read_block_payload(&mut self.primary, &hdr)?;
            let mut ctx = StreamContext::new();
            ctx.begin_block(hdr, payload);
            if self.has_correction {
                let corr = self.correction.as_mut().unwrap();
                read_correction_block(
                    corr,
                    &mut ctx,
                    self.initial_index,
                    false,
                    &mut self.file2pos,
                    &mut self.crc_errors,
                )?;
            }
            self.streams.push(ctx);
        }

        let codec = &*self.codec;
        for ctx in &mut self.streams {
            ctx.ensure_decoded(codec);
        }
        if sample < self.streams[0].sample_index {
            // Backward within the current block: re-establish decode state.
            for ctx in &mut self.streams {
                ctx.reset();
                ctx.ensure_decoded(codec);
            }
        }

        let skip = sample - self.streams[0].sample_index;
        if skip > MAX_SEEK_SKIP {
            self.release_blocks();
            return Err(Error::Unseekable);
        }
        for ctx in &mut self.streams {
            ctx.take(skip as usize);
        }
        debug!("seek to sample {sample} landed at byte {}", self.filepos);
        Ok(())
    }
}

// ── Packer ───────────────────────────────────────────────────────────────────

/// Configuration for [`Packer::new`].
#[derive(Debug, Clone)]
pub struct PackConfig {
    pub sample_rate: u32,
    pub num_channels: usize,
    /// Valid bits per sample, 1..=32.
    pub bits_per_sample: u32,
    /// Bytes per sample in the original data, 1..=4.
    pub bytes_per_sample: u32,
    pub joint_stereo: bool,
    /// Low bits carried only by the correction stream; 0 = pure lossless.
    pub hybrid_bits: u8,
    /// Emit correction blocks (hybrid lossless). Ignored unless
    /// `hybrid_bits > 0`.
    pub with_correction: bool,
    /// Force samples per block instead of deriving from the sample rate.
    pub block_samples_override: Option<u32>,
    /// Known duration, stamped into every header; `None` writes the
    /// unknown sentinel (patch later with [`update_total_samples`]).
    pub total_samples: Option<u32>,
    /// Write the stream checksum sub-record on finish.
    pub with_checksum: bool,
}

impl Default for PackConfig {
    fn default() -> Self {
        Self {
            sample_rate: 44100,
            num_channels: 2,
            bits_per_sample: 16,
            bytes_per_sample: 2,
            joint_stereo: true,
            hybrid_bits: 0,
            with_correction: false,
            block_samples_override: None,
            total_samples: None,
            with_checksum: true,
        }
    }
}

/// Streaming encoder: accumulates interleaved samples and emits completed
/// blocks through a [`BlockSink`].
pub struct Packer<K: BlockSink> {
    sink: K,
    codec: Box<dyn ResidualCodec>,
    config: PackConfig,
    streams: Vec<StreamContext>,
    block_samples: u32,
    max_samples: u32,
    acc_samples: u32,
    pending: PendingMeta,
    hasher: blake3::Hasher,
    audio_started: bool,
    filelen: u64,
    file2len: u64,
}

impl<K: BlockSink> Packer<K> {
    /// Validate the configuration, lay out channel-groups and compute the
    /// block-sample target.
    pub fn new(sink: K, config: PackConfig) -> Result<Self> {
        if config.num_channels == 0 || config.num_channels > MAX_STREAMS * 2 {
            return Err(Error::TooManyChannels(config.num_channels));
        }
        if !(1..=32).contains(&config.bits_per_sample)
            || !(1..=4).contains(&config.bytes_per_sample)
            || config.bits_per_sample > config.bytes_per_sample * 8
        {
            return Err(Error::Format("invalid sample format".into()));
        }
        let stream_count = config.num_channels.div_ceil(2);
        if stream_count > MAX_STREAMS {
            return Err(Error::TooManyChannels(config.num_channels));
        }

        let mut block_samples = match config.block_samples_override {
            Some(n) => n.clamp(1, header::MAX_BLOCK_SAMPLES),
            None => {
                let mut bs = if config.sample_rate % 2 == 0 {
                    config.sample_rate / 2
                } else {
                    config.sample_rate
                };
                let nch = config.num_channels as u32;
                while bs * nch > 150_000 {
                    bs /= 2;
                }
                while bs * nch < 40_000 {
                    bs *= 2;
                }
                bs
            }
        };
        block_samples = block_samples.max(1);
        let max_samples = block_samples + block_samples / 2;

        let shift = config.bytes_per_sample * 8 - config.bits_per_sample;
        let base_flags = (config.bytes_per_sample - 1)
            | (shift << flags::SHIFT_LSB)
            | (header::sample_rate_index(config.sample_rate) << flags::SRATE_LSB)
            | if config.hybrid_bits > 0 { flags::HYBRID } else { 0 };
        let total = config.total_samples.unwrap_or(UNKNOWN_TOTAL);

        let mut streams = Vec::with_capacity(stream_count);
        let mut remaining = config.num_channels;
        while remaining > 0 {
            let chans = if remaining > 1 { 2 } else { 1 };
            remaining -= chans;

            let mut f = base_flags;
            if chans == 1 {
                f |= flags::MONO;
            } else if config.joint_stereo {
                f |= flags::JOINT_STEREO | flags::CROSS_DECORR;
            }
            if streams.is_empty() {
                f |= flags::INITIAL_BLOCK;
            }
            if remaining == 0 {
                f |= flags::FINAL_BLOCK;
            }

            let mut ctx = StreamContext::new();
            ctx.header = BlockHeader {
                version: CUR_VERSION,
                total_samples: total,
                flags: f,
                ..BlockHeader::default()
            };
            streams.push(ctx);
        }

        Ok(Self {
            sink,
            codec: default_codec(),
            config,
            streams,
            block_samples,
            max_samples,
            acc_samples: 0,
            pending: PendingMeta::new(),
            hasher: blake3::Hasher::new(),
            audio_started: false,
            filelen: 0,
            file2len: 0,
        })
    }

    pub fn config(&self) -> &PackConfig {
        &self.config
    }

    /// Samples per block chosen for this configuration.
    pub fn block_samples(&self) -> u32 {
        self.block_samples
    }

    /// Absolute index of the next sample a block boundary would start at.
    pub fn sample_index(&self) -> u32 {
        self.streams[0].sample_index
    }

    /// Bytes emitted so far to the primary and correction sinks.
    pub fn bytes_written(&self) -> (u64, u64) {
        (self.filelen, self.file2len)
    }

    /// Queue wrapper bytes: before any audio they become a leading wrapper
    /// record, afterwards a trailing one.
    pub fn add_wrapper(&mut self, data: &[u8]) {
        if self.streams[0].sample_index == 0 && self.acc_samples == 0 {
            self.pending.push_wrapper_head(data);
        } else {
            self.pending.push_wrapper_tail(data);
        }
    }

    /// Accumulate interleaved samples (one value per channel per frame),
    /// emitting blocks whenever the buffer target is reached.
    pub fn pack(&mut self, interleaved: &[i32]) -> Result<()> {
        let nch = self.config.num_channels;
        debug_assert_eq!(interleaved.len() % nch, 0);

        // A large leading wrapper goes out in its own metadata block rather
        // than riding the first audio block.
        if !self.audio_started && self.pending.payload_bytes() > 4096 {
            self.write_metadata_block()?;
        }
        self.audio_started = true;

        let mut remaining = interleaved.len() / nch;
        let mut frame = 0usize;
        while remaining > 0 {
            let room = (self.max_samples - self.acc_samples) as usize;
            let n = remaining.min(room);

            let mut ch_off = 0usize;
            for ctx in &mut self.streams {
                let stream_ch = ctx.header.channels();
                for f in frame..frame + n {
                    let base = f * nch + ch_off;
                    ctx.sample_buffer.push(interleaved[base]);
                    if stream_ch == 2 {
                        ctx.sample_buffer.push(interleaved[base + 1]);
                    }
                }
                ch_off += stream_ch;
            }
            for v in &interleaved[frame * nch..(frame + n) * nch] {
                self.hasher.update(&v.to_le_bytes());
            }

            self.acc_samples += n as u32;
            frame += n;
            remaining -= n;

            if self.acc_samples == self.max_samples {
                let target = self.block_samples;
                self.pack_streams(target)?;
            }
        }
        Ok(())
    }

    /// Emit one block per stream holding the first `block_samples` buffered
    /// samples, then shift the remainder down to the buffer front.
    fn pack_streams(&mut self, block_samples: u32) -> Result<()> {
        for si in 0..self.streams.len() {
            let stream_ch = self.streams[si].header.channels();
            let take = block_samples as usize * stream_ch;
            let params = BlockParams {
                channels: stream_ch,
                joint_stereo: self.streams[si].header.flags & flags::JOINT_STEREO != 0,
                lossy_bits: self.config.hybrid_bits,
            };
            let encoded = self
                .codec
                .encode(&self.streams[si].sample_buffer[..take], &params);

            let mut area = Vec::new();
            if si == 0 {
                self.pending.drain_into(&mut area);
            }
            write_meta(&mut area, meta::RESIDUAL, &encoded.residual);
            if si == 0 && self.config.num_channels > 2 {
                write_meta(&mut area, meta::CHANNEL_INFO, &[self.config.num_channels as u8]);
            }

            let hybrid = self.config.hybrid_bits > 0;
            let hdr = BlockHeader {
                ck_size: (header::HEADER_SIZE as u32 - header::CK_SIZE_OFFSET)
                    + area.len() as u32,
                version: CUR_VERSION,
                total_samples: self.streams[si].header.total_samples,
                block_index: self.streams[si].sample_index,
                block_samples,
                flags: self.streams[si].header.flags,
                crc: if hybrid { encoded.crc_primary } else { encoded.crc_exact },
            };
            let mut block = Vec::with_capacity(header::HEADER_SIZE + area.len());
            hdr.write(&mut block)?;
            block.extend_from_slice(&area);
            self.sink.emit(SinkDest::Primary, &block)?;
            self.filelen += block.len() as u64;

            if let Some(corr_payload) = encoded.correction {
                if self.config.with_correction {
                    let mut corr_area = Vec::new();
                    write_meta(&mut corr_area, meta::CORRECTION, &corr_payload);
                    let corr_hdr = BlockHeader {
                        ck_size: (header::HEADER_SIZE as u32 - header::CK_SIZE_OFFSET)
                            + corr_area.len() as u32,
                        crc: encoded.crc_exact,
                        ..hdr
                    };
                    let mut corr_block =
                        Vec::with_capacity(header::HEADER_SIZE + corr_area.len());
                    corr_hdr.write(&mut corr_block)?;
                    corr_block.extend_from_slice(&corr_area);
                    self.sink.emit(SinkDest::Correction, &corr_block)?;
                    self.file2len += corr_block.len() as u64;
                }
            }

            let ctx = &mut self.streams[si];
            ctx.sample_index += block_samples;
            ctx.sample_buffer.drain(..take);
        }
        self.acc_samples -= block_samples;
        Ok(())
    }

    /// Emit a zero-sample block carrying only queued metadata records.
    fn write_metadata_block(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let mut area = Vec::new();
        self.pending.drain_into(&mut area);
        let hdr = BlockHeader {
            ck_size: (header::HEADER_SIZE as u32 - header::CK_SIZE_OFFSET) + area.len() as u32,
            version: CUR_VERSION,
            total_samples: self.streams[0].header.total_samples,
            block_index: self.streams[0].sample_index,
            block_samples: 0,
            flags: self.streams[0].header.flags,
            crc: 0,
        };
        let mut block = Vec::with_capacity(header::HEADER_SIZE + area.len());
        hdr.write(&mut block)?;
        block.extend_from_slice(&area);
        self.sink.emit(SinkDest::Primary, &block)?;
        self.filelen += block.len() as u64;
        Ok(())
    }

    /// Drain every buffered sample into blocks, splitting by halves so the
    /// trailing blocks stay reasonably sized.
    pub fn flush(&mut self) -> Result<()> {
        while self.acc_samples > 0 {
            let n = if self.acc_samples > self.block_samples {
                self.acc_samples / 2
            } else {
                self.acc_samples
            };
            self.pack_streams(n)?;
        }
        Ok(())
    }

    /// Flush, then emit any trailing wrapper and the stream checksum in a
    /// final metadata block. Call exactly once when the audio is done.
    pub fn finish(&mut self) -> Result<()> {
        self.flush()?;
        if self.config.with_checksum {
            let mut digest = [0u8; 16];
            digest.copy_from_slice(&self.hasher.finalize().as_bytes()[..16]);
            self.pending.push_checksum(digest);
        }
        self.write_metadata_block()
    }

    /// Append a finished trailer tag after the last block.
    pub fn write_tag(&mut self, tag: &TagStore) -> Result<()> {
        let mut bytes = Vec::new();
        tag.write_to(&mut bytes)?;
        if !bytes.is_empty() {
            self.sink.emit(SinkDest::Primary, &bytes)?;
            self.filelen += bytes.len() as u64;
        }
        Ok(())
    }

    pub fn into_sink(self) -> K {
        self.sink
    }
}

/// Patch the total-sample count of a retrieved first block, for encodes
/// whose duration was unknown up front. The caller rewrites the block.
pub fn update_total_samples(first_block: &mut [u8], total: u32) -> Result<()> {
    if first_block.len() < header::HEADER_SIZE || first_block[0..4] != header::MAGIC {
        return Err(Error::Format("not a block image".into()));
    }
    first_block[12..16].copy_from_slice(&total.to_le_bytes());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::VecSink;

    #[test]
    fn block_samples_target_lands_in_band() {
        for (rate, nch) in [(44100u32, 2usize), (8000, 1), (192_000, 6), (11025, 2)] {
            let cfg = PackConfig {
                sample_rate: rate,
                num_channels: nch,
                ..PackConfig::default()
            };
            let packer = Packer::new(VecSink::new(), cfg).unwrap();
            let product = packer.block_samples() as u64 * nch as u64;
            assert!(
                (40_000..=150_000).contains(&product),
                "rate {rate} nch {nch} gave {product}"
            );
        }
    }

    #[test]
    fn too_many_channels_is_rejected() {
        let cfg = PackConfig { num_channels: MAX_STREAMS * 2 + 1, ..PackConfig::default() };
        assert!(matches!(
            Packer::new(VecSink::new(), cfg),
            Err(Error::TooManyChannels(_))
        ));
    }

    #[test]
    fn first_and_last_stream_carry_frame_set_flags() {
        let cfg = PackConfig { num_channels: 5, ..PackConfig::default() };
        let packer = Packer::new(VecSink::new(), cfg).unwrap();
        assert_eq!(packer.streams.len(), 3);
        assert!(packer.streams[0].header.is_initial());
        assert!(!packer.streams[0].header.is_final());
        assert!(packer.streams[2].header.is_final());
        assert_eq!(packer.streams[2].header.channels(), 1);
    }
}
