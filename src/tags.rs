//! Trailer tag store: APEv2 tags with read-only ID3v1 fallback.
//!
//! Tags live after the last block of the primary stream. An APEv2 tag is a
//! 32-byte header, a flat item region and a 32-byte footer; items are
//! `{value_size, flags, NUL-terminated key, value}` with all integers
//! little-endian. An ID3v1 tag is the classic fixed 128-byte record.
//! Exactly one kind is active at a time: finding an APEv2 tag disables
//! ID3v1 recognition for the same file.

use byteorder::{ByteOrder, LittleEndian};
use log::debug;
use std::io::{self, Write};

use crate::io::{read_exact, ByteSource, Whence};

pub const APE_MAGIC: [u8; 8] = *b"APETAGEX";
pub const APE_VERSION: u32 = 2000;
/// Size of the APEv2 header and of the footer.
pub const APE_HEADER_SIZE: usize = 32;
pub const ID3_TAG_SIZE: usize = 128;

/// Refuse to load tags larger than this.
const APE_MAX_LENGTH: u32 = 1024 * 1024;
/// Tag has a leading header in addition to the footer.
const APE_FLAG_HAS_HEADER: u32 = 0x8000_0000;
/// This 32-byte record is the header, not the footer.
const APE_FLAG_IS_HEADER: u32 = 0x2000_0000;
/// Item flag bits marking non-text payloads; such items are not exposed.
const APE_ITEM_NON_TEXT: u32 = 6;

// ── Bounded copy with ellipsis truncation ────────────────────────────────────

/// Copy `src` into `dst` as a NUL-terminated string. When `src` does not
/// fit, as much as fits minus three bytes is copied and `...` appended,
/// matching legacy display conventions. Returns the string length written
/// (0 when `dst` cannot hold even the truncated form).
pub fn copy_bounded(src: &[u8], dst: &mut [u8]) -> usize {
    if src.len() < dst.len() {
        dst[..src.len()].copy_from_slice(src);
        dst[src.len()] = 0;
        src.len()
    } else if dst.len() >= 4 {
        let n = dst.len() - 1;
        dst[..n].copy_from_slice(&src[..n]);
        dst[n - 3..n].copy_from_slice(b"...");
        dst[n] = 0;
        n
    } else {
        0
    }
}

// ── APEv2 ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
struct ApeHeader {
    version: u32,
    /// Item region plus footer, excluding the leading header.
    length: u32,
    item_count: u32,
    flags: u32,
}

impl ApeHeader {
    fn from_bytes(raw: &[u8; APE_HEADER_SIZE]) -> Option<Self> {
        if raw[0..8] != APE_MAGIC {
            return None;
        }
        Some(Self {
            version: LittleEndian::read_u32(&raw[8..12]),
            length: LittleEndian::read_u32(&raw[12..16]),
            item_count: LittleEndian::read_u32(&raw[16..20]),
            flags: LittleEndian::read_u32(&raw[20..24]),
        })
    }

    fn to_bytes(self) -> [u8; APE_HEADER_SIZE] {
        let mut raw = [0u8; APE_HEADER_SIZE];
        raw[0..8].copy_from_slice(&APE_MAGIC);
        LittleEndian::write_u32(&mut raw[8..12], self.version);
        LittleEndian::write_u32(&mut raw[12..16], self.length);
        LittleEndian::write_u32(&mut raw[16..20], self.item_count);
        LittleEndian::write_u32(&mut raw[20..24], self.flags);
        raw
    }
}

/// One item located inside the flat region.
struct ApeItem<'a> {
    key: &'a [u8],
    value: &'a [u8],
    flags: u32,
    /// Byte range of the whole item record within the region.
    start: usize,
    end: usize,
}

/// Walk the item region with the same bounds discipline as the original:
/// stop at the first record that would run past the region.
fn ape_items(data: &[u8], item_count: u32) -> impl Iterator<Item = ApeItem<'_>> {
    let mut pos = 0usize;
    let mut index = 0u32;
    std::iter::from_fn(move || {
        if index >= item_count || data.len().saturating_sub(pos) <= 8 {
            return None;
        }
        let start = pos;
        let value_size = LittleEndian::read_u32(&data[pos..pos + 4]) as usize;
        let flags = LittleEndian::read_u32(&data[pos + 4..pos + 8]);
        let key_start = pos + 8;
        let key_len = data[key_start..].iter().position(|&b| b == 0)?;
        let value_start = key_start + key_len + 1;
        let end = value_start.checked_add(value_size)?;
        if value_size > data.len() || end > data.len() {
            return None;
        }
        pos = end;
        index += 1;
        Some(ApeItem {
            key: &data[key_start..key_start + key_len],
            value: &data[value_start..end],
            flags,
            start,
            end,
        })
    })
}

// ── ID3v1 ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct Id3Tag {
    title: [u8; 30],
    artist: [u8; 30],
    album: [u8; 30],
    year: [u8; 4],
    comment: [u8; 30],
}

impl Id3Tag {
    fn from_bytes(raw: &[u8; ID3_TAG_SIZE]) -> Option<Self> {
        if &raw[0..3] != b"TAG" {
            return None;
        }
        let mut tag = Self {
            title: [0; 30],
            artist: [0; 30],
            album: [0; 30],
            year: [0; 4],
            comment: [0; 30],
        };
        tag.title.copy_from_slice(&raw[3..33]);
        tag.artist.copy_from_slice(&raw[33..63]);
        tag.album.copy_from_slice(&raw[63..93]);
        tag.year.copy_from_slice(&raw[93..97]);
        tag.comment.copy_from_slice(&raw[97..127]);
        Some(tag)
    }

    /// Track number convention: a non-zero final comment byte preceded by a
    /// NUL holds the track.
    fn track(&self) -> Option<u8> {
        (self.comment[29] != 0 && self.comment[28] == 0).then_some(self.comment[29])
    }

    fn field(&self, key: &str) -> Option<Vec<u8>> {
        let raw: &[u8] = match key.to_ascii_lowercase().as_str() {
            "title" => &self.title,
            "artist" => &self.artist,
            "album" => &self.album,
            "year" => &self.year,
            "comment" => &self.comment,
            "track" => return self.track().map(|t| t.to_string().into_bytes()),
            _ => return None,
        };
        let trimmed = trim_id3(raw);
        (!trimmed.is_empty()).then(|| trimmed.to_vec())
    }

    fn fields(&self) -> Vec<(&'static str, Vec<u8>)> {
        let mut out = Vec::new();
        for (name, raw) in [
            ("Title", &self.title[..]),
            ("Artist", &self.artist[..]),
            ("Album", &self.album[..]),
            ("Year", &self.year[..]),
            ("Comment", &self.comment[..]),
        ] {
            let trimmed = trim_id3(raw);
            if !trimmed.is_empty() {
                out.push((name, trimmed.to_vec()));
            }
        }
        if let Some(track) = self.track() {
            out.push(("Track", track.to_string().into_bytes()));
        }
        out
    }
}

/// Strip leading spaces and trailing spaces/NULs, honouring the embedded
/// track-number convention (a trailing track byte is not text).
fn trim_id3(raw: &[u8]) -> &[u8] {
    let mut end = raw.len();
    if end >= 2 && raw[end - 1] != 0 && raw[end - 2] == 0 {
        end -= 1;
    }
    let slice = &raw[..end];
    let start = slice.iter().position(|&b| b != b' ').unwrap_or(slice.len());
    let end = slice[start..]
        .iter()
        .rposition(|&b| b != b' ' && b != 0)
        .map(|p| start + p + 1)
        .unwrap_or(start);
    &slice[start..end]
}

// ── Tag store ────────────────────────────────────────────────────────────────

/// The trailer tag attached to a container, created lazily on first append.
#[derive(Debug, Default)]
pub struct TagStore {
    ape: Option<(ApeHeader, Vec<u8>)>,
    id3: Option<Id3Tag>,
    /// Offset of the whole tag relative to end-of-file, for rewriting.
    tag_file_pos: i64,
}

impl TagStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_ape(&self) -> bool {
        self.ape.is_some()
    }

    pub fn has_id3(&self) -> bool {
        self.id3.is_some()
    }

    pub fn is_valid(&self) -> bool {
        self.ape.is_some() || self.id3.is_some()
    }

    /// Byte offset of the tag relative to end-of-file (zero or negative).
    pub fn file_pos(&self) -> i64 {
        self.tag_file_pos
    }

    /// Number of exposed (text) items.
    pub fn len(&self) -> usize {
        match (&self.ape, &self.id3) {
            (Some((hdr, data)), _) => ape_items(data, hdr.item_count)
                .filter(|i| i.flags & APE_ITEM_NON_TEXT == 0 && !i.key.is_empty())
                .count(),
            (None, Some(id3)) => id3.fields().len(),
            (None, None) => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Value for `key`, case-insensitive. `None` when absent.
    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        if let Some((hdr, data)) = &self.ape {
            return ape_items(data, hdr.item_count)
                .find(|i| {
                    i.flags & APE_ITEM_NON_TEXT == 0
                        && !i.key.is_empty()
                        && !i.value.is_empty()
                        && i.key.eq_ignore_ascii_case(key.as_bytes())
                })
                .map(|i| i.value.to_vec());
        }
        self.id3.as_ref().and_then(|id3| id3.field(key))
    }

    /// Value for `key` copied into a bounded buffer with ellipsis
    /// truncation. Returns the string length written, 0 when absent.
    pub fn get_into(&self, key: &str, buf: &mut [u8]) -> usize {
        match self.get(key) {
            Some(value) => copy_bounded(&value, buf),
            None => {
                if let Some(first) = buf.first_mut() {
                    *first = 0;
                }
                0
            }
        }
    }

    /// Item `(key, value)` by storage order.
    pub fn get_indexed(&self, index: usize) -> Option<(String, Vec<u8>)> {
        if let Some((hdr, data)) = &self.ape {
            return ape_items(data, hdr.item_count)
                .filter(|i| i.flags & APE_ITEM_NON_TEXT == 0 && !i.key.is_empty())
                .nth(index)
                .map(|i| (String::from_utf8_lossy(i.key).into_owned(), i.value.to_vec()));
        }
        self.id3
            .as_ref()
            .and_then(|id3| id3.fields().into_iter().nth(index))
            .map(|(name, value)| (name.to_string(), value))
    }

    /// Append an item, replacing any existing item with the same key
    /// (case-insensitive). Creates the APEv2 structure on first use; files
    /// holding only an ID3v1 tag cannot be appended to.
    pub fn append(&mut self, key: &str, value: &[u8]) -> bool {
        if self.ape.is_none() && self.id3.is_some() {
            return false;
        }
        while self.delete(key) {}

        let (hdr, data) = self.ape.get_or_insert_with(|| {
            (
                ApeHeader {
                    version: APE_VERSION,
                    length: APE_HEADER_SIZE as u32,
                    item_count: 0,
                    flags: APE_FLAG_HAS_HEADER,
                },
                Vec::new(),
            )
        });

        let mut item = Vec::with_capacity(9 + key.len() + value.len());
        item.extend_from_slice(&(value.len() as u32).to_le_bytes());
        item.extend_from_slice(&0u32.to_le_bytes());
        item.extend_from_slice(key.as_bytes());
        item.push(0);
        item.extend_from_slice(value);

        hdr.item_count += 1;
        hdr.length += item.len() as u32;
        data.extend_from_slice(&item);
        true
    }

    /// Delete the first item matching `key`, compacting the region by
    /// shifting the trailing bytes down. Returns whether an item was
    /// removed.
    pub fn delete(&mut self, key: &str) -> bool {
        let Some((hdr, data)) = &mut self.ape else {
            return false;
        };
        let found = ape_items(data, hdr.item_count).find_map(|i| {
            (!i.key.is_empty()
                && !i.value.is_empty()
                && i.key.eq_ignore_ascii_case(key.as_bytes()))
            .then_some((i.start, i.end))
        });
        match found {
            Some((start, end)) => {
                data.drain(start..end);
                hdr.item_count -= 1;
                hdr.length -= (end - start) as u32;
                true
            }
            None => false,
        }
    }

    /// Total on-disk size of the tag: header, items and footer.
    pub fn disk_size(&self) -> usize {
        match &self.ape {
            Some((hdr, _)) => hdr.length as usize + APE_HEADER_SIZE,
            None if self.id3.is_some() => ID3_TAG_SIZE,
            None => 0,
        }
    }

    /// Serialise the APEv2 tag: header, item region, footer.
    pub fn write_to<W: Write>(&self, mut writer: W) -> io::Result<()> {
        let Some((hdr, data)) = &self.ape else {
            return Ok(());
        };
        let mut leading = *hdr;
        leading.flags |= APE_FLAG_IS_HEADER;
        writer.write_all(&leading.to_bytes())?;
        writer.write_all(data)?;
        let mut footer = *hdr;
        footer.flags &= !APE_FLAG_IS_HEADER;
        writer.write_all(&footer.to_bytes())?;
        Ok(())
    }

    /// Load a trailer tag from a seekable source: an APEv2 tag is looked
    /// for first at end-of-file (and again in front of any ID3v1 record
    /// found there); ID3v1 is the fallback. The read position is left
    /// undefined.
    pub fn load<S: ByteSource + ?Sized>(src: &mut S) -> io::Result<Option<TagStore>> {
        let mut id3: Option<Id3Tag> = None;

        loop {
            // APEv2 footer either at EOF or just before the ID3v1 record.
            let back = if id3.is_some() {
                -((APE_HEADER_SIZE + ID3_TAG_SIZE) as i64)
            } else {
                -(APE_HEADER_SIZE as i64)
            };
            let mut raw = [0u8; APE_HEADER_SIZE];
            let footer = if src.set_pos_rel(back, Whence::End).is_ok()
                && read_exact(src, &mut raw).is_ok()
            {
                ApeHeader::from_bytes(&raw)
            } else {
                None
            };

            if let Some(footer) = footer {
                if footer.version == APE_VERSION
                    && footer.item_count > 0
                    && footer.length > APE_HEADER_SIZE as u32
                    && footer.length < APE_MAX_LENGTH
                {
                    let mut tag_file_pos =
                        if id3.is_some() { -(ID3_TAG_SIZE as i64) } else { 0 };
                    tag_file_pos -= i64::from(footer.length) + APE_HEADER_SIZE as i64;
                    src.set_pos_rel(tag_file_pos, Whence::End)?;

                    let mut raw = [0u8; APE_HEADER_SIZE];
                    read_exact(src, &mut raw)?;
                    let Some(header) = ApeHeader::from_bytes(&raw) else {
                        return Ok(None);
                    };
                    if header.version != APE_VERSION
                        || header.item_count != footer.item_count
                        || header.length != footer.length
                    {
                        return Ok(None);
                    }
                    let mut data = vec![0u8; header.length as usize - APE_HEADER_SIZE];
                    read_exact(src, &mut data)?;
                    debug!("loaded APEv2 tag with {} item(s)", header.item_count);
                    // An APEv2 tag shadows any ID3v1 record behind it.
                    return Ok(Some(TagStore {
                        ape: Some((header, data)),
                        id3: None,
                        tag_file_pos,
                    }));
                }
            }

            if id3.is_some() {
                return Ok(Some(TagStore {
                    ape: None,
                    id3,
                    tag_file_pos: -(ID3_TAG_SIZE as i64),
                }));
            }

            // No APEv2 at EOF: try ID3v1, then loop once more to look for
            // an APEv2 tag sitting in front of it.
            let mut raw = [0u8; ID3_TAG_SIZE];
            if src.set_pos_rel(-(ID3_TAG_SIZE as i64), Whence::End).is_err()
                || read_exact(src, &mut raw).is_err()
            {
                return Ok(None);
            }
            match Id3Tag::from_bytes(&raw) {
                Some(tag) => id3 = Some(tag),
                None => return Ok(None),
            }
        }
    }
}
