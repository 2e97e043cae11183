//! Entropy transform: per-block lossless (or hybrid two-part) coding of one
//! stream's samples.
//!
//! The container treats this as a swappable black box with a fixed contract:
//!
//! - pure lossless: `decode(encode(s)) == s` bit-exact, no correction part;
//! - hybrid: the primary part alone decodes to quantised output, and merging
//!   the correction part restores bit-exact samples.
//!
//! The built-in [`BitPackCodec`] zig-zag maps each channel and packs it at
//! the block's measured magnitude; joint-stereo blocks get the reversible
//! mid/side transform first. The coordinator never touches payload bytes —
//! it only moves them between blocks and this module.

use crate::error::{Error, Result};

/// Encoding parameters for one block of one stream.
#[derive(Debug, Clone, Copy)]
pub struct BlockParams {
    /// 1 (mono) or 2 (stereo pair).
    pub channels: usize,
    pub joint_stereo: bool,
    /// Low bits dropped from the primary part; 0 = pure lossless.
    pub lossy_bits: u8,
}

/// Decoding parameters recovered from the block header.
#[derive(Debug, Clone, Copy)]
pub struct DecodeParams {
    pub channels: usize,
    pub joint_stereo: bool,
    /// Samples per channel declared by the header.
    pub block_samples: usize,
}

/// Output of [`ResidualCodec::encode`] for one block.
#[derive(Debug)]
pub struct EncodedBlock {
    /// Primary payload (RESIDUAL sub-record).
    pub residual: Vec<u8>,
    /// Correction payload (CORRECTION sub-record); present iff hybrid.
    pub correction: Option<Vec<u8>>,
    /// CRC-32 of what the primary part alone decodes to.
    pub crc_primary: u32,
    /// CRC-32 of the exact input samples.
    pub crc_exact: u32,
}

/// The entropy-transform seam between the coordinator and the bit-level
/// coding scheme.
pub trait ResidualCodec {
    fn encode(&self, samples: &[i32], params: &BlockParams) -> EncodedBlock;

    /// Decode `block_samples` interleaved samples. A structurally corrupt
    /// payload is an error here; the stream context maps it to a silent
    /// block plus a CRC event rather than aborting the stream.
    fn decode(
        &self,
        residual: &[u8],
        correction: Option<&[u8]>,
        params: &DecodeParams,
    ) -> Result<Vec<i32>>;
}

/// The codec used when none is supplied explicitly.
pub fn default_codec() -> Box<dyn ResidualCodec> {
    Box::new(BitPackCodec)
}

/// CRC-32 over the little-endian image of a sample buffer. This is the value
/// carried in every block header.
pub fn samples_crc(samples: &[i32]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    for v in samples {
        hasher.update(&v.to_le_bytes());
    }
    hasher.finalize()
}

// ── Zig-zag mapping ──────────────────────────────────────────────────────────

#[inline]
fn zigzag(value: i32) -> u32 {
    (value.wrapping_shl(1) ^ (value >> 31)) as u32
}

#[inline]
fn unzigzag(value: u32) -> i32 {
    ((value >> 1) as i32) ^ -((value & 1) as i32)
}

#[inline]
fn bit_width(max: u32) -> u8 {
    (32 - max.leading_zeros()) as u8
}

// ── Bit-level I/O ────────────────────────────────────────────────────────────

struct BitWriter {
    out: Vec<u8>,
    acc: u64,
    nbits: u32,
}

impl BitWriter {
    fn new() -> Self {
        Self { out: Vec::new(), acc: 0, nbits: 0 }
    }

    fn push(&mut self, value: u32, bits: u32) {
        debug_assert!(bits <= 32);
        if bits == 0 {
            return;
        }
        let mask = if bits == 32 { u64::from(u32::MAX) } else { (1u64 << bits) - 1 };
        self.acc |= (u64::from(value) & mask) << self.nbits;
        self.nbits += bits;
        while self.nbits >= 8 {
            self.out.push(self.acc as u8);
            self.acc >>= 8;
            self.nbits -= 8;
        }
    }

    fn finish(mut self) -> Vec<u8> {
        if self.nbits > 0 {
            self.out.push(self.acc as u8);
        }
        self.out
    }
}

struct BitReader<'a> {
    buf: &'a [u8],
    pos: usize,
    acc: u64,
    nbits: u32,
}

impl<'a> BitReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0, acc: 0, nbits: 0 }
    }

    /// Reads past the end return zero bits; corrupt payloads decode to
    /// garbage that the block CRC catches, never to a panic.
    fn read(&mut self, bits: u32) -> u32 {
        debug_assert!(bits <= 32);
        if bits == 0 {
            return 0;
        }
        while self.nbits < bits {
            let byte = if self.pos < self.buf.len() {
                let b = self.buf[self.pos];
                self.pos += 1;
                b
            } else {
                0
            };
            self.acc |= u64::from(byte) << self.nbits;
            self.nbits += 8;
        }
        let mask = if bits == 32 { u64::from(u32::MAX) } else { (1u64 << bits) - 1 };
        let value = (self.acc & mask) as u32;
        self.acc >>= bits;
        self.nbits -= bits;
        value
    }
}

// ── Joint stereo ─────────────────────────────────────────────────────────────

fn joint_forward(work: &mut [i32]) {
    for frame in work.chunks_exact_mut(2) {
        let side = frame[0].wrapping_sub(frame[1]);
        let mid = frame[1].wrapping_add(side >> 1);
        frame[0] = mid;
        frame[1] = side;
    }
}

fn joint_inverse(work: &mut [i32]) {
    for frame in work.chunks_exact_mut(2) {
        let (mid, side) = (frame[0], frame[1]);
        let right = mid.wrapping_sub(side >> 1);
        frame[0] = side.wrapping_add(right);
        frame[1] = right;
    }
}

// ── Built-in codec ───────────────────────────────────────────────────────────

/// Fixed-width bit-packing transform.
///
/// Payload layout (both parts): `[lossy_bits, width_ch0, width_ch1, 0]`
/// followed by the packed values, channel 0 first. The correction part packs
/// the dropped low bits at exactly `lossy_bits` width.
pub struct BitPackCodec;

impl ResidualCodec for BitPackCodec {
    fn encode(&self, samples: &[i32], params: &BlockParams) -> EncodedBlock {
        let ch = params.channels.clamp(1, 2);
        debug_assert_eq!(samples.len() % ch, 0);
        let n = samples.len() / ch;
        let crc_exact = samples_crc(samples);

        let mut work = samples.to_vec();
        if ch == 2 && params.joint_stereo {
            joint_forward(&mut work);
        }

        let b = u32::from(params.lossy_bits.min(31));
        let mut low_bits: Vec<u32> = Vec::new();
        if b > 0 {
            low_bits.reserve(work.len());
            for v in work.iter_mut() {
                let q = *v >> b;
                low_bits.push(v.wrapping_sub(q.wrapping_shl(b)) as u32);
                *v = q;
            }
        }

        let mut widths = [0u8; 2];
        for c in 0..ch {
            let mut max = 0u32;
            for f in 0..n {
                max = max.max(zigzag(work[f * ch + c]));
            }
            widths[c] = bit_width(max);
        }

        let mut residual = vec![b as u8, widths[0], widths[1], 0];
        let mut writer = BitWriter::new();
        for c in 0..ch {
            for f in 0..n {
                writer.push(zigzag(work[f * ch + c]), u32::from(widths[c]));
            }
        }
        residual.extend(writer.finish());

        let correction = (b > 0).then(|| {
            let mut out = vec![b as u8, 0, 0, 0];
            let mut writer = BitWriter::new();
            for c in 0..ch {
                for f in 0..n {
                    writer.push(low_bits[f * ch + c], b);
                }
            }
            out.extend(writer.finish());
            out
        });

        let crc_primary = if b > 0 {
            let mut lossy = work;
            for v in lossy.iter_mut() {
                *v = v.wrapping_shl(b);
            }
            if ch == 2 && params.joint_stereo {
                joint_inverse(&mut lossy);
            }
            samples_crc(&lossy)
        } else {
            crc_exact
        };

        EncodedBlock { residual, correction, crc_primary, crc_exact }
    }

    fn decode(
        &self,
        residual: &[u8],
        correction: Option<&[u8]>,
        params: &DecodeParams,
    ) -> Result<Vec<i32>> {
        let ch = params.channels.clamp(1, 2);
        let n = params.block_samples;
        if residual.len() < 4 {
            return Err(Error::Format("residual payload too short".into()));
        }
        let b = u32::from(residual[0]);
        let widths = [u32::from(residual[1]), u32::from(residual[2])];
        if b > 31 || widths[0] > 32 || widths[1] > 32 {
            return Err(Error::Format("corrupt residual payload header".into()));
        }

        let mut reader = BitReader::new(&residual[4..]);
        let mut work = vec![0i32; n * ch];
        for c in 0..ch {
            for f in 0..n {
                work[f * ch + c] = unzigzag(reader.read(widths[c]));
            }
        }

        if b > 0 {
            // A correction part with a mismatched quantisation step decodes
            // lossy; the CRC comparison upstream reports the damage.
            let merged = correction.filter(|c| c.len() >= 4 && u32::from(c[0]) == b);
            if let Some(corr) = merged {
                let mut low = BitReader::new(&corr[4..]);
                for c in 0..ch {
                    for f in 0..n {
                        let r = low.read(b);
                        let q = work[f * ch + c];
                        work[f * ch + c] = q.wrapping_shl(b).wrapping_add(r as i32);
                    }
                }
            } else {
                for v in work.iter_mut() {
                    *v = v.wrapping_shl(b);
                }
            }
        }

        if ch == 2 && params.joint_stereo {
            joint_inverse(&mut work);
        }
        Ok(work)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noise(n: usize, ch: usize) -> Vec<i32> {
        let mut state = 0x2468_ace1u32;
        (0..n * ch)
            .map(|_| {
                state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
                ((state >> 12) & 0xffff) as i32 - 0x8000
            })
            .collect()
    }

    #[test]
    fn lossless_roundtrip_mono() {
        let samples = noise(1000, 1);
        let params = BlockParams { channels: 1, joint_stereo: false, lossy_bits: 0 };
        let enc = BitPackCodec.encode(&samples, &params);
        assert!(enc.correction.is_none());
        assert_eq!(enc.crc_primary, enc.crc_exact);
        let dec = BitPackCodec
            .decode(
                &enc.residual,
                None,
                &DecodeParams { channels: 1, joint_stereo: false, block_samples: 1000 },
            )
            .unwrap();
        assert_eq!(dec, samples);
    }

    #[test]
    fn lossless_roundtrip_joint_stereo() {
        let samples = noise(777, 2);
        let params = BlockParams { channels: 2, joint_stereo: true, lossy_bits: 0 };
        let enc = BitPackCodec.encode(&samples, &params);
        let dec = BitPackCodec
            .decode(
                &enc.residual,
                None,
                &DecodeParams { channels: 2, joint_stereo: true, block_samples: 777 },
            )
            .unwrap();
        assert_eq!(dec, samples);
    }

    #[test]
    fn hybrid_merge_is_exact_and_lossy_matches_crc() {
        let samples = noise(512, 2);
        let params = BlockParams { channels: 2, joint_stereo: true, lossy_bits: 4 };
        let enc = BitPackCodec.encode(&samples, &params);
        let corr = enc.correction.as_deref().expect("hybrid emits a correction part");
        let dp = DecodeParams { channels: 2, joint_stereo: true, block_samples: 512 };

        let exact = BitPackCodec.decode(&enc.residual, Some(corr), &dp).unwrap();
        assert_eq!(exact, samples);
        assert_eq!(samples_crc(&exact), enc.crc_exact);

        let lossy = BitPackCodec.decode(&enc.residual, None, &dp).unwrap();
        assert_ne!(lossy, samples);
        assert_eq!(samples_crc(&lossy), enc.crc_primary);
    }

    #[test]
    fn extreme_values_survive() {
        let samples = vec![i32::MIN, i32::MAX, 0, -1, 1, i32::MIN + 1];
        let params = BlockParams { channels: 1, joint_stereo: false, lossy_bits: 0 };
        let enc = BitPackCodec.encode(&samples, &params);
        let dec = BitPackCodec
            .decode(
                &enc.residual,
                None,
                &DecodeParams { channels: 1, joint_stereo: false, block_samples: samples.len() },
            )
            .unwrap();
        assert_eq!(dec, samples);
    }
}
