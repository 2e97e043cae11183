//! Wrapper/metadata store: non-audio bytes riding inside the block stream.
//!
//! On the encode side this is an append-only queue of sub-records (leading
//! or trailing wrapper blobs, the stream checksum) waiting to be flushed
//! into whichever block is open next — or into a trailing zero-sample block
//! when the audio is done. On the decode side it accumulates wrapper bytes
//! found in any block's sub-records, bounded so a damaged stream cannot
//! balloon memory.

use crate::header::{meta, write_meta};

/// Decode-side accumulation stops at this many wrapper bytes.
pub const MAX_WRAPPER_BYTES: usize = 16 * 1024 * 1024;

// ── Decode side ──────────────────────────────────────────────────────────────

/// Wrapper bytes recovered from decoded blocks, in stream order.
#[derive(Debug, Default)]
pub struct WrapperStore {
    data: Vec<u8>,
}

impl WrapperStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append wrapper bytes, silently dropping anything past the cap.
    pub fn push(&mut self, bytes: &[u8]) {
        let room = MAX_WRAPPER_BYTES.saturating_sub(self.data.len());
        self.data.extend_from_slice(&bytes[..bytes.len().min(room)]);
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Hand the accumulated bytes to the caller and reset the store.
    pub fn take(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.data)
    }
}

// ── Encode side ──────────────────────────────────────────────────────────────

/// Sub-records queued for the next emitted block.
#[derive(Debug, Default)]
pub struct PendingMeta {
    records: Vec<(u8, Vec<u8>)>,
}

impl PendingMeta {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_wrapper_head(&mut self, bytes: &[u8]) {
        self.records.push((meta::WRAPPER_HEAD, bytes.to_vec()));
    }

    pub fn push_wrapper_tail(&mut self, bytes: &[u8]) {
        self.records.push((meta::WRAPPER_TAIL, bytes.to_vec()));
    }

    pub fn push_checksum(&mut self, digest: [u8; 16]) {
        self.records.push((meta::STREAM_CHECKSUM, digest.to_vec()));
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Total payload bytes queued (excluding record framing).
    pub fn payload_bytes(&self) -> usize {
        self.records.iter().map(|(_, d)| d.len()).sum()
    }

    /// Serialise and clear the queue, appending every record to `area`.
    pub fn drain_into(&mut self, area: &mut Vec<u8>) {
        for (id, data) in self.records.drain(..) {
            write_meta(area, id, &data);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::{find_meta, MetaIter};

    #[test]
    fn store_caps_accumulation() {
        let mut store = WrapperStore::new();
        store.push(&vec![1u8; MAX_WRAPPER_BYTES - 4]);
        store.push(&[2u8; 16]);
        assert_eq!(store.len(), MAX_WRAPPER_BYTES);
    }

    #[test]
    fn pending_drains_in_order() {
        let mut pending = PendingMeta::new();
        pending.push_wrapper_head(b"RIFFxxxx");
        pending.push_wrapper_tail(b"LIST");
        pending.push_checksum([7u8; 16]);
        assert_eq!(pending.payload_bytes(), 8 + 4 + 16);

        let mut area = Vec::new();
        pending.drain_into(&mut area);
        assert!(pending.is_empty());

        let ids: Vec<u8> = MetaIter::new(&area).map(|r| r.unwrap().id).collect();
        assert_eq!(ids, vec![meta::WRAPPER_HEAD, meta::WRAPPER_TAIL, meta::STREAM_CHECKSUM]);
        assert_eq!(find_meta(&area, meta::WRAPPER_HEAD).unwrap(), b"RIFFxxxx");
    }
}
