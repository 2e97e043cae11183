//! Block header codec and metadata sub-record framing.
//!
//! Every block starts with a fixed 32-byte header followed by a sequence of
//! id/size-prefixed sub-records carrying the entropy payload, wrapper bytes,
//! the stream checksum and padding. All binary I/O is strictly little-endian;
//! no runtime endianness negotiation is ever performed.

use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use std::io::{self, Write};

use crate::error::{Error, Result};

/// Magic bytes opening every block.
pub const MAGIC: [u8; 4] = *b"tdpk";
/// Fixed header size on the wire.
pub const HEADER_SIZE: usize = 32;
/// `ck_size` excludes the magic and the size field itself.
pub const CK_SIZE_OFFSET: u32 = 8;
/// Oldest stream version this build reads.
pub const MIN_VERSION: u16 = 0x402;
/// Newest stream version this build reads.
pub const MAX_VERSION: u16 = 0x410;
/// Version written by this build.
pub const CUR_VERSION: u16 = 0x407;
/// Sentinel for "total sample count unknown".
pub const UNKNOWN_TOTAL: u32 = u32::MAX;
/// Upper bound a plausible header may declare for `block_samples`.
pub const MAX_BLOCK_SAMPLES: u32 = 0x20000;
/// Upper bound a plausible header may declare for `ck_size` (16 MiB blocks).
pub const MAX_CK_SIZE: u32 = 1 << 24;

/// Fixed table indexed by the header's sample-rate field. Index 15 marks a
/// non-standard rate.
pub const SAMPLE_RATES: [u32; 15] = [
    6000, 8000, 9600, 11025, 12000, 16000, 22050, 24000, 32000, 44100, 48000, 64000, 88200, 96000,
    192000,
];

/// Per-block flag bitfield.
pub mod flags {
    /// Bytes per sample minus one (bits 0-1).
    pub const BYTES_STORED: u32 = 0x3;
    pub const MONO: u32 = 0x4;
    /// Lossy primary stream; exact samples need the correction stream.
    pub const HYBRID: u32 = 0x8;
    /// Mid/side stereo decorrelation applied before entropy coding.
    pub const JOINT_STEREO: u32 = 0x10;
    /// Cross-channel decorrelation hint (advisory).
    pub const CROSS_DECORR: u32 = 0x20;
    /// First block of a frame set.
    pub const INITIAL_BLOCK: u32 = 0x800;
    /// Last block of a frame set.
    pub const FINAL_BLOCK: u32 = 0x1000;
    pub const SHIFT_LSB: u32 = 13;
    pub const SHIFT_MASK: u32 = 0x1f << SHIFT_LSB;
    pub const SRATE_LSB: u32 = 23;
    pub const SRATE_MASK: u32 = 0xf << SRATE_LSB;

    /// Every bit this build understands. Correction-block candidates with
    /// bits outside this mask are refused.
    pub const KNOWN_MASK: u32 = BYTES_STORED
        | MONO
        | HYBRID
        | JOINT_STEREO
        | CROSS_DECORR
        | INITIAL_BLOCK
        | FINAL_BLOCK
        | SHIFT_MASK
        | SRATE_MASK;
}

/// Metadata sub-record ids (the 6-bit selector without the size flags).
pub mod meta {
    /// Padding; payload ignored.
    pub const DUMMY: u8 = 0x00;
    /// Entropy-transform payload for the block's samples.
    pub const RESIDUAL: u8 = 0x02;
    /// Correction residual carried by correction-stream blocks.
    pub const CORRECTION: u8 = 0x0a;
    /// Channel count for files spanning more than one stream.
    pub const CHANNEL_INFO: u8 = 0x0d;
    /// Leading wrapper bytes (original container header).
    pub const WRAPPER_HEAD: u8 = 0x21;
    /// Trailing wrapper bytes.
    pub const WRAPPER_TAIL: u8 = 0x22;
    /// 16-byte checksum of all decoded samples.
    pub const STREAM_CHECKSUM: u8 = 0x26;

    /// Id byte flag: two extra size bytes follow.
    pub const ID_LARGE: u8 = 0x80;
    /// Id byte flag: payload is one byte shorter than the word count implies.
    pub const ID_ODD_SIZE: u8 = 0x40;
    /// Mask extracting the 6-bit id selector.
    pub const ID_UNIQUE: u8 = 0x3f;
}

// ── Block header ─────────────────────────────────────────────────────────────

/// The fixed 32-byte record opening every block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    /// Total chunk size minus 8; the metadata area that follows the header
    /// holds exactly `ck_size - 24` bytes.
    pub ck_size: u32,
    pub version: u16,
    /// Absolute count of samples in the whole stream, or [`UNKNOWN_TOTAL`].
    pub total_samples: u32,
    /// Absolute index of this block's first sample.
    pub block_index: u32,
    /// Samples in this block; 0 marks a metadata-only block.
    pub block_samples: u32,
    pub flags: u32,
    /// CRC-32 of the block's decoded samples.
    pub crc: u32,
}

impl Default for BlockHeader {
    fn default() -> Self {
        Self {
            ck_size: HEADER_SIZE as u32 - CK_SIZE_OFFSET,
            version: CUR_VERSION,
            total_samples: UNKNOWN_TOTAL,
            block_index: 0,
            block_samples: 0,
            flags: 0,
            crc: 0,
        }
    }
}

impl BlockHeader {
    /// Parse a raw 32-byte header, validating the magic, the version range
    /// and the two reserved bytes.
    pub fn from_bytes(raw: &[u8; HEADER_SIZE]) -> Result<Self> {
        if raw[0..4] != MAGIC {
            return Err(Error::Format("bad block magic".into()));
        }
        let version = LittleEndian::read_u16(&raw[8..10]);
        if !(MIN_VERSION..=MAX_VERSION).contains(&version) {
            return Err(Error::Format(format!("unsupported stream version {version:#x}")));
        }
        if raw[10] != 0 || raw[11] != 0 {
            return Err(Error::Format("reserved header bytes are not zero".into()));
        }
        Ok(Self {
            ck_size: LittleEndian::read_u32(&raw[4..8]),
            version,
            total_samples: LittleEndian::read_u32(&raw[12..16]),
            block_index: LittleEndian::read_u32(&raw[16..20]),
            block_samples: LittleEndian::read_u32(&raw[20..24]),
            flags: LittleEndian::read_u32(&raw[24..28]),
            crc: LittleEndian::read_u32(&raw[28..32]),
        })
    }

    /// Serialize to the exact wire image; `from_bytes(to_bytes(h)) == h`.
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut raw = [0u8; HEADER_SIZE];
        raw[0..4].copy_from_slice(&MAGIC);
        LittleEndian::write_u32(&mut raw[4..8], self.ck_size);
        LittleEndian::write_u16(&mut raw[8..10], self.version);
        LittleEndian::write_u32(&mut raw[12..16], self.total_samples);
        LittleEndian::write_u32(&mut raw[16..20], self.block_index);
        LittleEndian::write_u32(&mut raw[20..24], self.block_samples);
        LittleEndian::write_u32(&mut raw[24..28], self.flags);
        LittleEndian::write_u32(&mut raw[28..32], self.crc);
        raw
    }

    pub fn write<W: Write>(&self, mut writer: W) -> io::Result<()> {
        writer.write_all(&MAGIC)?;
        writer.write_u32::<LittleEndian>(self.ck_size)?;
        writer.write_u16::<LittleEndian>(self.version)?;
        writer.write_u16::<LittleEndian>(0)?;
        writer.write_u32::<LittleEndian>(self.total_samples)?;
        writer.write_u32::<LittleEndian>(self.block_index)?;
        writer.write_u32::<LittleEndian>(self.block_samples)?;
        writer.write_u32::<LittleEndian>(self.flags)?;
        writer.write_u32::<LittleEndian>(self.crc)?;
        Ok(())
    }

    /// The validity predicate shared by sequential resynchronisation and
    /// seek probing: both must accept exactly the same headers or their
    /// behaviour diverges on damaged streams.
    pub fn plausible(raw: &[u8; HEADER_SIZE]) -> Option<Self> {
        let hdr = Self::from_bytes(raw).ok()?;
        let min = HEADER_SIZE as u32 - CK_SIZE_OFFSET;
        if hdr.ck_size < min || hdr.ck_size >= MAX_CK_SIZE || hdr.ck_size % 2 != 0 {
            return None;
        }
        if hdr.block_samples > MAX_BLOCK_SAMPLES {
            return None;
        }
        Some(hdr)
    }

    /// Byte count of the metadata area following the 32-byte header.
    pub fn meta_len(&self) -> usize {
        (self.ck_size as usize).saturating_sub(HEADER_SIZE - CK_SIZE_OFFSET as usize)
    }

    pub fn is_initial(&self) -> bool {
        self.flags & flags::INITIAL_BLOCK != 0
    }

    pub fn is_final(&self) -> bool {
        self.flags & flags::FINAL_BLOCK != 0
    }

    /// Channels carried by this block: 1 for mono, 2 otherwise.
    pub fn channels(&self) -> usize {
        if self.flags & flags::MONO != 0 {
            1
        } else {
            2
        }
    }

    pub fn bytes_per_sample(&self) -> u32 {
        (self.flags & flags::BYTES_STORED) + 1
    }

    pub fn shift(&self) -> u32 {
        (self.flags & flags::SHIFT_MASK) >> flags::SHIFT_LSB
    }

    /// Sample rate from the header's rate index; non-standard rates report
    /// the 44100 default.
    pub fn sample_rate(&self) -> u32 {
        let idx = ((self.flags & flags::SRATE_MASK) >> flags::SRATE_LSB) as usize;
        SAMPLE_RATES.get(idx).copied().unwrap_or(44100)
    }

    /// Index of the first sample past this block.
    pub fn block_end(&self) -> u32 {
        self.block_index.wrapping_add(self.block_samples)
    }
}

/// Table index for a sample rate, or 15 when the rate is non-standard.
pub fn sample_rate_index(rate: u32) -> u32 {
    SAMPLE_RATES
        .iter()
        .position(|&r| r == rate)
        .map(|i| i as u32)
        .unwrap_or(15)
}

// ── Metadata sub-records ─────────────────────────────────────────────────────

/// One decoded sub-record: the 6-bit id selector and its payload with the
/// odd-size padding already stripped.
#[derive(Debug, Clone, Copy)]
pub struct MetaRecord<'a> {
    pub id: u8,
    pub data: &'a [u8],
}

/// Cursor over a block's metadata area.
///
/// Yields `Err(TruncatedMetadata)` once and then stops when a record
/// declares more payload than the area holds — the iterator never reads out
/// of bounds.
pub struct MetaIter<'a> {
    buf: &'a [u8],
    pos: usize,
    poisoned: bool,
}

impl<'a> MetaIter<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0, poisoned: false }
    }
}

impl<'a> Iterator for MetaIter<'a> {
    type Item = Result<MetaRecord<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.poisoned || self.pos >= self.buf.len() {
            return None;
        }
        let remaining = self.buf.len() - self.pos;
        if remaining < 2 {
            self.poisoned = true;
            return Some(Err(Error::TruncatedMetadata));
        }
        let id = self.buf[self.pos];
        let mut words = self.buf[self.pos + 1] as usize;
        self.pos += 2;
        if id & meta::ID_LARGE != 0 {
            if self.buf.len() - self.pos < 2 {
                self.poisoned = true;
                return Some(Err(Error::TruncatedMetadata));
            }
            words += (self.buf[self.pos] as usize) << 8;
            words += (self.buf[self.pos + 1] as usize) << 16;
            self.pos += 2;
        }
        let stored = words * 2;
        if self.buf.len() - self.pos < stored {
            self.poisoned = true;
            return Some(Err(Error::TruncatedMetadata));
        }
        let data_len = stored.saturating_sub((id & meta::ID_ODD_SIZE != 0) as usize);
        let data = &self.buf[self.pos..self.pos + data_len];
        self.pos += stored;
        Some(Ok(MetaRecord { id: id & meta::ID_UNIQUE, data }))
    }
}

/// Append one sub-record to a metadata area, choosing the small or large
/// form and flagging odd payload sizes.
pub fn write_meta(out: &mut Vec<u8>, id: u8, data: &[u8]) {
    debug_assert_eq!(id & meta::ID_UNIQUE, id);
    let odd = data.len() % 2 == 1;
    let words = data.len().div_ceil(2);
    debug_assert!(words < 1 << 24);
    let large = words > 0xff;
    let mut id_byte = id;
    if odd {
        id_byte |= meta::ID_ODD_SIZE;
    }
    if large {
        id_byte |= meta::ID_LARGE;
    }
    out.push(id_byte);
    out.push((words & 0xff) as u8);
    if large {
        out.push(((words >> 8) & 0xff) as u8);
        out.push(((words >> 16) & 0xff) as u8);
    }
    out.extend_from_slice(data);
    if odd {
        out.push(0);
    }
}

/// First sub-record payload with the given id, or `None`. Truncated areas
/// report `None` as well; callers that must distinguish use [`MetaIter`].
pub fn find_meta(buf: &[u8], id: u8) -> Option<&[u8]> {
    for rec in MetaIter::new(buf) {
        match rec {
            Ok(rec) if rec.id == id => return Some(rec.data),
            Ok(_) => {}
            Err(_) => return None,
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn header_roundtrip_basic() {
        let hdr = BlockHeader {
            ck_size: 120,
            version: CUR_VERSION,
            total_samples: 44100,
            block_index: 22050,
            block_samples: 4096,
            flags: flags::INITIAL_BLOCK | flags::FINAL_BLOCK | flags::JOINT_STEREO | 0x1,
            crc: 0xdead_beef,
        };
        let parsed = BlockHeader::from_bytes(&hdr.to_bytes()).unwrap();
        assert_eq!(parsed, hdr);
    }

    #[test]
    fn rejects_bad_magic_and_reserved() {
        let hdr = BlockHeader::default();
        let mut raw = hdr.to_bytes();
        raw[0] = b'x';
        assert!(BlockHeader::from_bytes(&raw).is_err());

        let mut raw = hdr.to_bytes();
        raw[10] = 1;
        assert!(BlockHeader::from_bytes(&raw).is_err());
    }

    #[test]
    fn meta_roundtrip_small_and_odd() {
        let mut area = Vec::new();
        write_meta(&mut area, meta::RESIDUAL, &[1, 2, 3, 4]);
        write_meta(&mut area, meta::WRAPPER_HEAD, &[9, 9, 9]); // odd
        write_meta(&mut area, meta::DUMMY, &[]);

        let recs: Vec<_> = MetaIter::new(&area).map(|r| r.unwrap()).collect();
        assert_eq!(recs.len(), 3);
        assert_eq!(recs[0].id, meta::RESIDUAL);
        assert_eq!(recs[0].data, &[1, 2, 3, 4]);
        assert_eq!(recs[1].id, meta::WRAPPER_HEAD);
        assert_eq!(recs[1].data, &[9, 9, 9]);
        assert_eq!(recs[2].data.len(), 0);
    }

    #[test]
    fn meta_large_form() {
        let payload = vec![0xabu8; 70_000];
        let mut area = Vec::new();
        write_meta(&mut area, meta::WRAPPER_TAIL, &payload);
        let rec = MetaIter::new(&area).next().unwrap().unwrap();
        assert_eq!(rec.id, meta::WRAPPER_TAIL);
        assert_eq!(rec.data, &payload[..]);
    }

    #[test]
    fn meta_truncated_signals_error_without_overrun() {
        let mut area = Vec::new();
        write_meta(&mut area, meta::RESIDUAL, &[0u8; 40]);
        area.truncate(10);
        let mut iter = MetaIter::new(&area);
        assert!(matches!(iter.next(), Some(Err(Error::TruncatedMetadata))));
        assert!(iter.next().is_none());
    }

    proptest! {
        #[test]
        fn header_roundtrip_prop(
            ck_size in 24u32..MAX_CK_SIZE,
            version in MIN_VERSION..=MAX_VERSION,
            total in any::<u32>(),
            index in any::<u32>(),
            samples in 0u32..=MAX_BLOCK_SAMPLES,
            raw_flags in any::<u32>(),
            crc in any::<u32>(),
        ) {
            let hdr = BlockHeader {
                ck_size,
                version,
                total_samples: total,
                block_index: index,
                block_samples: samples,
                flags: raw_flags,
                crc,
            };
            let parsed = BlockHeader::from_bytes(&hdr.to_bytes()).unwrap();
            prop_assert_eq!(parsed, hdr);
        }

        #[test]
        fn meta_roundtrip_prop(payloads in prop::collection::vec(
            prop::collection::vec(any::<u8>(), 0..700), 0..8))
        {
            let mut area = Vec::new();
            for (i, p) in payloads.iter().enumerate() {
                write_meta(&mut area, (i as u8 + 1) & meta::ID_UNIQUE, p);
            }
            let recs: Vec<_> = MetaIter::new(&area)
                .map(|r| r.unwrap().data.to_vec())
                .collect();
            prop_assert_eq!(recs, payloads);
        }
    }
}
