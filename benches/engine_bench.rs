use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::io::Cursor;

use tidepack::io::{StdSource, VecSink};
use tidepack::{OpenOptions, PackConfig, Packer, Unpacker};

fn noise(frames: usize, channels: usize) -> Vec<i32> {
    let mut state = 0x1234_5678u32;
    (0..frames * channels)
        .map(|_| {
            state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
            ((state >> 12) & 0xffff) as i32 - 0x8000
        })
        .collect()
}

fn bench_pack(c: &mut Criterion) {
    let samples = noise(44_100, 2);

    c.bench_function("pack_1s_stereo", |b| {
        b.iter(|| {
            let mut packer = Packer::new(VecSink::new(), PackConfig::default()).unwrap();
            packer.pack(black_box(&samples)).unwrap();
            packer.finish().unwrap();
            packer.into_sink()
        })
    });

    c.bench_function("pack_1s_stereo_hybrid", |b| {
        let config = PackConfig {
            hybrid_bits: 4,
            with_correction: true,
            ..PackConfig::default()
        };
        b.iter(|| {
            let mut packer = Packer::new(VecSink::new(), config.clone()).unwrap();
            packer.pack(black_box(&samples)).unwrap();
            packer.finish().unwrap();
            packer.into_sink()
        })
    });
}

fn bench_unpack(c: &mut Criterion) {
    let samples = noise(44_100, 2);
    let mut packer = Packer::new(VecSink::new(), PackConfig::default()).unwrap();
    packer.pack(&samples).unwrap();
    packer.finish().unwrap();
    let bytes = packer.into_sink().primary_bytes();

    c.bench_function("unpack_1s_stereo", |b| {
        b.iter(|| {
            let mut up = Unpacker::open(
                StdSource::new(Cursor::new(bytes.clone())),
                None,
                OpenOptions::default(),
            )
            .unwrap();
            let mut buf = vec![0i32; 4096 * 2];
            let mut total = 0u32;
            loop {
                let got = up.unpack(&mut buf).unwrap();
                if got == 0 {
                    break;
                }
                total += got;
            }
            black_box(total)
        })
    });
}

fn bench_seek(c: &mut Criterion) {
    let samples = noise(441_000, 2);
    let mut packer = Packer::new(VecSink::new(), PackConfig::default()).unwrap();
    packer.pack(&samples).unwrap();
    packer.finish().unwrap();
    let bytes = packer.into_sink().primary_bytes();

    c.bench_function("seek_10s_stereo", |b| {
        b.iter(|| {
            let mut up = Unpacker::open(
                StdSource::new(Cursor::new(bytes.clone())),
                None,
                OpenOptions::default(),
            )
            .unwrap();
            up.seek_to_sample(black_box(399_999)).unwrap();
            let mut one = [0i32; 2];
            up.unpack(&mut one).unwrap();
            black_box(one)
        })
    });
}

criterion_group!(benches, bench_pack, bench_unpack, bench_seek);
criterion_main!(benches);
