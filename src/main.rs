use clap::{Parser, Subcommand};
use std::fs::File;
use std::path::{Path, PathBuf};

use tidepack::io::{PairSink, StdSource};
use tidepack::{OpenOptions, PackConfig, Packer, TagStore, Unpacker};

#[derive(Parser)]
#[command(name = "tdpk", about = "The tidepack hybrid lossless audio container CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Pack raw PCM samples into a .tdp stream
    Pack {
        /// Raw PCM input (interleaved, little-endian, signed)
        input: PathBuf,
        #[arg(short, long)]
        output: PathBuf,
        #[arg(short, long, default_value = "44100")]
        rate: u32,
        #[arg(short, long, default_value = "2")]
        channels: usize,
        /// Valid bits per sample (input width is 2 bytes up to 16 bits, else 4)
        #[arg(short, long, default_value = "16")]
        bits: u32,
        /// Hybrid mode: drop this many low bits into the correction stream
        #[arg(long, default_value = "0")]
        hybrid_bits: u8,
        /// Write a .tdpc correction stream next to the output
        #[arg(long)]
        correction: bool,
        /// Tag items to append, as key=value
        #[arg(long = "tag")]
        tags: Vec<String>,
    },
    /// Unpack a .tdp stream back to raw PCM
    Unpack {
        input: PathBuf,
        #[arg(short, long)]
        output: PathBuf,
        /// Merge the sibling .tdpc correction stream if present
        #[arg(long)]
        correction: bool,
    },
    /// Show stream properties
    Info { input: PathBuf },
    /// List trailer tag items
    Tags { input: PathBuf },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    match Cli::parse().command {
        Commands::Pack {
            input,
            output,
            rate,
            channels,
            bits,
            hybrid_bits,
            correction,
            tags,
        } => {
            let bytes_per_sample = if bits <= 16 { 2 } else { 4 };
            let raw = std::fs::read(&input)?;
            let samples = decode_pcm(&raw, bytes_per_sample);
            let frames = samples.len() / channels;

            let corr_file = if correction && hybrid_bits > 0 {
                Some(File::create(correction_path(&output))?)
            } else {
                None
            };
            let sink = PairSink::new(File::create(&output)?, corr_file);

            let config = PackConfig {
                sample_rate: rate,
                num_channels: channels,
                bits_per_sample: bits,
                bytes_per_sample,
                hybrid_bits,
                with_correction: correction && hybrid_bits > 0,
                total_samples: Some(frames as u32),
                ..PackConfig::default()
            };
            let mut packer = Packer::new(sink, config)?;
            packer.pack(&samples)?;
            packer.finish()?;

            if !tags.is_empty() {
                let mut tag = TagStore::new();
                for item in &tags {
                    let (key, value) = item
                        .split_once('=')
                        .ok_or("tag items must be key=value")?;
                    tag.append(key, value.as_bytes());
                }
                packer.write_tag(&tag)?;
            }

            let (primary, corr) = packer.bytes_written();
            println!(
                "packed {frames} sample(s) -> {} ({primary} B primary, {corr} B correction)",
                output.display()
            );
        }

        Commands::Unpack { input, output, correction } => {
            let primary = StdSource::new(File::open(&input)?);
            let corr = correction
                .then(|| File::open(correction_path(&input)).ok().map(StdSource::new))
                .flatten();
            let mut unpacker = Unpacker::open(primary, corr, OpenOptions::default())?;

            let nch = unpacker.num_channels();
            let bytes_per_sample = unpacker.bytes_per_sample() as usize;
            let mut out = File::create(&output)?;
            let mut buf = vec![0i32; 4096 * nch];
            let mut total = 0u64;
            loop {
                let got = unpacker.unpack(&mut buf)?;
                if got == 0 {
                    break;
                }
                write_pcm(&mut out, &buf[..got as usize * nch], bytes_per_sample)?;
                total += u64::from(got);
            }

            let mode = unpacker.mode();
            println!(
                "unpacked {total} sample(s), {} error(s){}",
                unpacker.num_errors(),
                if mode.lossless { "" } else { " [lossy]" }
            );
        }

        Commands::Info { input } => {
            let primary = StdSource::new(File::open(&input)?);
            let corr = File::open(correction_path(&input)).ok().map(StdSource::new);
            let mut unpacker =
                Unpacker::open(primary, corr, OpenOptions { read_tags: true, ..OpenOptions::default() })?;
            let mode = unpacker.mode();

            println!("── tidepack stream ─────────────────────────────────────");
            println!("  Path            {}", input.display());
            println!("  Sample rate     {}", unpacker.sample_rate());
            println!("  Channels        {}", unpacker.num_channels());
            println!("  Bits per sample {}", unpacker.bits_per_sample());
            match unpacker.total_samples() {
                Some(total) => println!("  Total samples   {total}"),
                None => println!("  Total samples   unknown"),
            }
            println!("  Hybrid          {}", mode.hybrid);
            println!("  Correction      {}", mode.has_correction);
            println!("  Lossless        {}", mode.lossless);
            println!("  Tag             {}", if mode.has_ape_tag { "APEv2" } else if mode.has_tag { "ID3v1" } else { "none" });
            if let Ok(Some(digest)) = unpacker.stream_checksum() {
                println!("  Checksum        {}", hex::encode(digest));
            }
        }

        Commands::Tags { input } => {
            let primary = StdSource::new(File::open(&input)?);
            let unpacker = Unpacker::open(
                primary,
                None,
                OpenOptions { read_tags: true, ..OpenOptions::default() },
            )?;
            match unpacker.tag() {
                Some(tag) if tag.is_valid() => {
                    let mut index = 0;
                    while let Some((key, value)) = tag.get_indexed(index) {
                        println!("{key}: {}", String::from_utf8_lossy(&value));
                        index += 1;
                    }
                }
                _ => println!("no tag"),
            }
        }
    }
    Ok(())
}

// ── helpers ──────────────────────────────────────────────────────────────────

/// Correction stream path convention: the primary path plus a trailing "c".
fn correction_path(primary: &Path) -> PathBuf {
    let mut name = primary.as_os_str().to_owned();
    name.push("c");
    PathBuf::from(name)
}

fn decode_pcm(raw: &[u8], bytes_per_sample: u32) -> Vec<i32> {
    match bytes_per_sample {
        2 => raw
            .chunks_exact(2)
            .map(|c| i32::from(i16::from_le_bytes([c[0], c[1]])))
            .collect(),
        _ => raw
            .chunks_exact(4)
            .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
    }
}

fn write_pcm<W: std::io::Write>(
    out: &mut W,
    samples: &[i32],
    bytes_per_sample: usize,
) -> std::io::Result<()> {
    for v in samples {
        out.write_all(&v.to_le_bytes()[..bytes_per_sample.clamp(1, 4)])?;
    }
    Ok(())
}
