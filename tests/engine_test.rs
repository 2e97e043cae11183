use std::io::Cursor;

use tidepack::io::{PipeSource, StdSource, VecSink};
use tidepack::{Error, OpenOptions, PackConfig, Packer, TagStore, Unpacker};

// ── helpers ──────────────────────────────────────────────────────────────────

fn noise(frames: usize, channels: usize, seed: u32) -> Vec<i32> {
    let mut state = seed | 1;
    (0..frames * channels)
        .map(|_| {
            state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
            ((state >> 12) & 0xffff) as i32 - 0x8000
        })
        .collect()
}

fn pack_config(frames: usize, channels: usize) -> PackConfig {
    PackConfig {
        num_channels: channels,
        block_samples_override: Some(3000),
        total_samples: Some(frames as u32),
        ..PackConfig::default()
    }
}

fn encode(samples: &[i32], config: PackConfig) -> VecSink {
    let mut packer = Packer::new(VecSink::new(), config).unwrap();
    packer.pack(samples).unwrap();
    packer.finish().unwrap();
    packer.into_sink()
}

type MemUnpacker = Unpacker<StdSource<Cursor<Vec<u8>>>>;

fn open_mem(primary: Vec<u8>, correction: Option<Vec<u8>>, opts: OpenOptions) -> MemUnpacker {
    Unpacker::open(
        StdSource::new(Cursor::new(primary)),
        correction.map(|c| StdSource::new(Cursor::new(c))),
        opts,
    )
    .unwrap()
}

fn decode_all(unpacker: &mut MemUnpacker) -> Vec<i32> {
    let nch = unpacker.num_channels();
    let mut buf = vec![0i32; 1024 * nch];
    let mut out = Vec::new();
    for _ in 0..100_000 {
        let got = unpacker.unpack(&mut buf).unwrap();
        if got == 0 {
            return out;
        }
        out.extend_from_slice(&buf[..got as usize * nch]);
    }
    panic!("decoder failed to reach end of stream");
}

// ── round-trips ──────────────────────────────────────────────────────────────

#[test]
fn roundtrip_mono() {
    let samples = noise(10_000, 1, 7);
    let sink = encode(&samples, pack_config(10_000, 1));
    assert!(sink.correction.is_empty());

    let mut up = open_mem(sink.primary_bytes(), None, OpenOptions::default());
    assert_eq!(up.num_channels(), 1);
    assert_eq!(up.total_samples(), Some(10_000));
    assert_eq!(decode_all(&mut up), samples);
    assert_eq!(up.num_errors(), 0);
    assert!(up.mode().lossless);
}

#[test]
fn roundtrip_stereo_joint() {
    let samples = noise(20_011, 2, 99);
    let sink = encode(&samples, pack_config(20_011, 2));

    let mut up = open_mem(sink.primary_bytes(), None, OpenOptions::default());
    assert_eq!(up.num_channels(), 2);
    assert_eq!(up.sample_rate(), 44100);
    assert_eq!(decode_all(&mut up), samples);
    assert_eq!(up.num_errors(), 0);
}

#[test]
fn roundtrip_multichannel_five() {
    let samples = noise(9_500, 5, 3);
    let sink = encode(&samples, pack_config(9_500, 5));

    let mut up = open_mem(sink.primary_bytes(), None, OpenOptions::default());
    assert_eq!(up.num_channels(), 5);
    assert_eq!(decode_all(&mut up), samples);
    assert_eq!(up.num_errors(), 0);
}

#[test]
fn roundtrip_hybrid_with_correction_is_bit_exact() {
    let samples = noise(12_000, 2, 42);
    let config = PackConfig {
        hybrid_bits: 4,
        with_correction: true,
        ..pack_config(12_000, 2)
    };
    let sink = encode(&samples, config);
    assert!(!sink.correction.is_empty());

    let mut up = open_mem(
        sink.primary_bytes(),
        Some(sink.correction_bytes()),
        OpenOptions::default(),
    );
    let mode = up.mode();
    assert!(mode.hybrid && mode.has_correction);
    assert_eq!(decode_all(&mut up), samples);
    assert_eq!(up.num_errors(), 0);
    assert!(up.mode().lossless);
    assert!(!up.lossy_blocks());
}

#[test]
fn hybrid_without_correction_is_lossy_but_close() {
    let samples = noise(12_000, 2, 42);
    let config = PackConfig {
        hybrid_bits: 4,
        with_correction: true,
        ..pack_config(12_000, 2)
    };
    let sink = encode(&samples, config);

    let mut up = open_mem(sink.primary_bytes(), None, OpenOptions::default());
    let decoded = decode_all(&mut up);
    assert_eq!(decoded.len(), samples.len());
    assert_ne!(decoded, samples);
    // Quantisation error is bounded by the dropped bits.
    for (a, b) in decoded.iter().zip(&samples) {
        assert!((a - b).abs() < 64, "lossy output drifted too far");
    }
    assert!(up.lossy_blocks());
    assert!(!up.mode().lossless);
    assert_eq!(up.num_errors(), 0);
}

// ── seeking ──────────────────────────────────────────────────────────────────

#[test]
fn seek_matches_sequential_decode() {
    let frames = 40_000usize;
    let samples = noise(frames, 2, 5);
    let sink = encode(&samples, pack_config(frames, 2));
    let bytes = sink.primary_bytes();

    for &target in &[0u32, 1, 2_999, 3_000, 12_345, 29_999, frames as u32 - 1] {
        let mut up = open_mem(bytes.clone(), None, OpenOptions::default());
        up.seek_to_sample(target).unwrap();
        let mut one = [0i32; 2];
        assert_eq!(up.unpack(&mut one).unwrap(), 1, "seek to {target}");
        let t = target as usize;
        assert_eq!(one, [samples[t * 2], samples[t * 2 + 1]], "sample {target}");
    }
}

#[test]
fn seek_works_in_hybrid_mode() {
    let frames = 30_000usize;
    let samples = noise(frames, 2, 17);
    let config = PackConfig {
        hybrid_bits: 3,
        with_correction: true,
        ..pack_config(frames, 2)
    };
    let sink = encode(&samples, config);

    let mut up = open_mem(
        sink.primary_bytes(),
        Some(sink.correction_bytes()),
        OpenOptions::default(),
    );
    for &target in &[25_000u32, 4_000, 4_001] {
        up.seek_to_sample(target).unwrap();
        let mut one = [0i32; 2];
        assert_eq!(up.unpack(&mut one).unwrap(), 1);
        let t = target as usize;
        assert_eq!(one, [samples[t * 2], samples[t * 2 + 1]], "sample {target}");
    }
    assert_eq!(up.num_errors(), 0);
}

#[test]
fn seek_multichannel_gathers_whole_frame_set() {
    let frames = 12_000usize;
    let samples = noise(frames, 5, 23);
    let sink = encode(&samples, pack_config(frames, 5));

    let mut up = open_mem(sink.primary_bytes(), None, OpenOptions::default());
    up.seek_to_sample(7_777).unwrap();
    let mut two = [0i32; 10];
    assert_eq!(up.unpack(&mut two).unwrap(), 2);
    assert_eq!(two[..], samples[7_777 * 5..7_779 * 5]);
}

#[test]
fn seek_refused_on_unseekable_source() {
    let samples = noise(8_000, 2, 11);
    let sink = encode(&samples, pack_config(8_000, 2));
    let bytes = sink.primary_bytes();

    let mut up = Unpacker::open(
        PipeSource::new(Cursor::new(bytes)),
        None,
        OpenOptions::default(),
    )
    .unwrap();
    assert!(matches!(up.seek_to_sample(100), Err(Error::Unseekable)));

    // Sequential decode still works after the refused seek.
    let mut buf = vec![0i32; 512 * 2];
    let got = up.unpack(&mut buf).unwrap();
    assert!(got > 0);
    assert_eq!(&buf[..4], &samples[..4]);
}

#[test]
fn seek_past_end_is_refused() {
    let samples = noise(5_000, 1, 31);
    let sink = encode(&samples, pack_config(5_000, 1));
    let mut up = open_mem(sink.primary_bytes(), None, OpenOptions::default());
    assert!(matches!(up.seek_to_sample(5_000), Err(Error::Unseekable)));
    assert!(matches!(up.seek_to_sample(u32::MAX), Err(Error::Unseekable)));
}

// ── damage recovery ──────────────────────────────────────────────────────────

#[test]
fn crc_mismatch_is_counted_and_decoding_continues() {
    let frames = 30_000usize;
    let samples = noise(frames, 2, 77);
    let sink = encode(&samples, pack_config(frames, 2));

    // Flip one byte inside the second audio block's payload.
    let mut blocks = sink.primary.clone();
    assert!(blocks.len() >= 4);
    blocks[1][60] ^= 0xff;
    let corrupted: Vec<u8> = blocks.concat();

    let mut up = open_mem(corrupted, None, OpenOptions::default());
    let decoded = decode_all(&mut up);
    assert_eq!(decoded.len(), samples.len(), "stream length survives damage");
    assert!(up.num_errors() >= 1, "damage must be counted");

    // Blocks outside the damaged one still decode bit-exact.
    let bs = 3_000usize;
    assert_eq!(&decoded[..bs * 2], &samples[..bs * 2]);
    assert_eq!(&decoded[2 * bs * 2..], &samples[2 * bs * 2..]);
}

#[test]
fn missing_correction_block_degrades_only_its_region() {
    let frames = 15_000usize;
    let samples = noise(frames, 2, 55);
    let config = PackConfig {
        hybrid_bits: 4,
        with_correction: true,
        ..pack_config(frames, 2)
    };
    let sink = encode(&samples, config);
    assert_eq!(sink.correction.len(), 5);

    // Drop the middle correction block.
    let mut corr_blocks = sink.correction.clone();
    corr_blocks.remove(2);
    let correction: Vec<u8> = corr_blocks.concat();

    let mut up = open_mem(sink.primary_bytes(), Some(correction), OpenOptions::default());
    let decoded = decode_all(&mut up);
    assert_eq!(decoded.len(), samples.len());
    assert_eq!(up.num_errors(), 1, "exactly one miss event");
    assert!(up.lossy_blocks());

    let bs = 3_000usize;
    // Regions with a correction block are bit-exact.
    assert_eq!(&decoded[..2 * bs * 2], &samples[..2 * bs * 2]);
    assert_eq!(&decoded[3 * bs * 2..], &samples[3 * bs * 2..]);
    // The uncovered region is lossy but bounded.
    let damaged = &decoded[2 * bs * 2..3 * bs * 2];
    let reference = &samples[2 * bs * 2..3 * bs * 2];
    assert_ne!(damaged, reference);
    for (a, b) in damaged.iter().zip(reference) {
        assert!((a - b).abs() < 64);
    }
}

#[test]
fn junk_prefix_is_skipped() {
    let samples = noise(6_000, 2, 13);
    let sink = encode(&samples, pack_config(6_000, 2));
    let mut bytes = vec![0x55u8; 777];
    bytes.extend(sink.primary_bytes());

    let mut up = open_mem(bytes, None, OpenOptions::default());
    assert_eq!(decode_all(&mut up), samples);
}

#[test]
fn empty_and_garbage_streams_fail_to_open() {
    let err = Unpacker::open(
        StdSource::new(Cursor::new(Vec::new())),
        None,
        OpenOptions::default(),
    )
    .err()
    .expect("empty stream must not open");
    assert!(matches!(err, Error::Format(_)));

    let garbage = vec![0xa5u8; 4096];
    assert!(Unpacker::open(
        StdSource::new(Cursor::new(garbage)),
        None,
        OpenOptions::default(),
    )
    .is_err());
}

// ── wrapper, checksum, tags ──────────────────────────────────────────────────

#[test]
fn wrapper_head_and_tail_roundtrip() {
    let samples = noise(7_000, 2, 21);
    let mut packer = Packer::new(VecSink::new(), pack_config(7_000, 2)).unwrap();
    packer.add_wrapper(b"RIFF....WAVEfmt ");
    packer.pack(&samples).unwrap();
    packer.flush().unwrap();
    packer.add_wrapper(b"LIST-trailing-chunk");
    packer.finish().unwrap();
    let sink = packer.into_sink();

    let mut up = open_mem(sink.primary_bytes(), None, OpenOptions::default());
    decode_all(&mut up);
    let wrapper = up.take_wrapper();
    let expected: Vec<u8> = [&b"RIFF....WAVEfmt "[..], &b"LIST-trailing-chunk"[..]].concat();
    assert_eq!(wrapper, expected);

    // The trailing wrapper is also reachable without decoding, by an
    // explicit tail scan that restores the read position.
    let mut up = open_mem(sink.primary_bytes(), None, OpenOptions::default());
    up.seek_trailing_wrapper().unwrap();
    let data = up.wrapper_data().to_vec();
    assert!(data
        .windows(b"LIST-trailing-chunk".len())
        .any(|w| w == b"LIST-trailing-chunk"));
    // Decoding still starts at sample zero afterward.
    let decoded = decode_all(&mut up);
    assert_eq!(&decoded[..8], &samples[..8]);
}

#[test]
fn stream_checksum_verifies_and_detects_damage() {
    let samples = noise(9_000, 2, 61);
    let sink = encode(&samples, pack_config(9_000, 2));
    let bytes = sink.primary_bytes();

    let mut up = open_mem(bytes, None, OpenOptions::default());
    decode_all(&mut up);
    let stored = up.stream_checksum().unwrap().expect("checksum record present");
    assert_eq!(stored, up.computed_checksum());

    let mut blocks = sink.primary.clone();
    blocks[1][60] ^= 0x10;
    let mut up = open_mem(blocks.concat(), None, OpenOptions::default());
    decode_all(&mut up);
    let stored = up.stream_checksum().unwrap().expect("checksum record present");
    assert_ne!(stored, up.computed_checksum());
}

#[test]
fn trailer_tag_roundtrips_through_pack() {
    let samples = noise(4_000, 2, 19);
    let mut packer = Packer::new(VecSink::new(), pack_config(4_000, 2)).unwrap();
    packer.pack(&samples).unwrap();
    packer.finish().unwrap();

    let mut tag = TagStore::new();
    tag.append("Title", b"Integration");
    tag.append("Artist", b"Nobody");
    packer.write_tag(&tag).unwrap();
    let sink = packer.into_sink();

    let mut up = open_mem(
        sink.primary_bytes(),
        None,
        OpenOptions { read_tags: true, ..OpenOptions::default() },
    );
    let mode = up.mode();
    assert!(mode.has_tag && mode.has_ape_tag);
    let loaded = up.tag().expect("tag loaded");
    assert_eq!(loaded.get("title").as_deref(), Some(&b"Integration"[..]));
    assert_eq!(loaded.get("ARTIST").as_deref(), Some(&b"Nobody"[..]));

    // The tag bytes at the stream tail do not disturb audio decode.
    assert_eq!(decode_all(&mut up), samples);
}

// ── unknown-length streams ───────────────────────────────────────────────────

#[test]
fn unknown_total_is_recovered_from_stream_tail_when_seekable() {
    let samples = noise(10_000, 2, 29);
    let config = PackConfig { total_samples: None, ..pack_config(10_000, 2) };
    let sink = encode(&samples, config);

    let mut up = open_mem(sink.primary_bytes(), None, OpenOptions::default());
    assert_eq!(up.total_samples(), Some(10_000));
    assert_eq!(decode_all(&mut up), samples);
}

#[test]
fn update_total_samples_patches_first_block() {
    let frames = 6_000usize;
    let samples = noise(frames, 2, 47);
    let config = PackConfig { total_samples: None, ..pack_config(frames, 2) };
    let sink = encode(&samples, config);

    // A pipe cannot scan the tail: duration is unknown.
    let up = Unpacker::open(
        PipeSource::new(Cursor::new(sink.primary_bytes())),
        None,
        OpenOptions::default(),
    )
    .unwrap();
    assert_eq!(up.total_samples(), None);

    // Patch the first block the way a writer finalising a stream would.
    let mut blocks = sink.primary.clone();
    tidepack::update_total_samples(&mut blocks[0], frames as u32).unwrap();
    let up = Unpacker::open(
        PipeSource::new(Cursor::new(blocks.concat())),
        None,
        OpenOptions::default(),
    )
    .unwrap();
    assert_eq!(up.total_samples(), Some(frames as u32));
}

// ── file-backed end to end ───────────────────────────────────────────────────

#[test]
fn file_backed_pack_and_unpack() {
    use std::fs::File;
    use std::io::Write;
    use tidepack::io::PairSink;

    let dir = tempfile::tempdir().unwrap();
    let wv_path = dir.path().join("take.tdp");
    let wvc_path = dir.path().join("take.tdpc");

    let samples = noise(8_000, 2, 83);
    let config = PackConfig {
        hybrid_bits: 2,
        with_correction: true,
        ..pack_config(8_000, 2)
    };
    {
        let sink = PairSink::new(
            File::create(&wv_path).unwrap(),
            Some(File::create(&wvc_path).unwrap()),
        );
        let mut packer = Packer::new(sink, config).unwrap();
        packer.pack(&samples).unwrap();
        packer.finish().unwrap();
        let mut sink = packer.into_sink();
        sink.primary.flush().unwrap();
    }

    let mut up = Unpacker::open(
        StdSource::new(File::open(&wv_path).unwrap()),
        Some(StdSource::new(File::open(&wvc_path).unwrap())),
        OpenOptions::default(),
    )
    .unwrap();
    let nch = up.num_channels();
    let mut buf = vec![0i32; 1024 * nch];
    let mut decoded = Vec::new();
    loop {
        let got = up.unpack(&mut buf).unwrap();
        if got == 0 {
            break;
        }
        decoded.extend_from_slice(&buf[..got as usize * nch]);
    }
    assert_eq!(decoded, samples);
    assert!(up.mode().lossless);
}
