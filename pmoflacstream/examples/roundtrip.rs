//! Encodes a generated tone to FLAC, decodes it back and checks the samples.
//!
//! ```sh
//! RUST_LOG=pmoflacstream=debug cargo run -p pmoflacstream --example roundtrip -- out.flac
//! ```

use std::{env, f64::consts::PI};

use tokio::io::AsyncReadExt;
use tracing::info;
use tracing_subscriber::EnvFilter;

use pmoflacstream::{
    DecoderOptions, EncoderOptions, MetadataBlock, PcmFormat, decode_flac_file,
    encode_flac_file,
};

const SECONDS: usize = 3;

fn tone(format: PcmFormat) -> Vec<u8> {
    let frames = format.sample_rate as usize * SECONDS;
    let mut pcm = Vec::with_capacity(frames * format.channels as usize * 2);
    for n in 0..frames {
        let t = n as f64 / format.sample_rate as f64;
        for channel in 0..format.channels {
            let freq = 440.0 * (channel as f64 + 1.0);
            let value = ((2.0 * PI * freq * t).sin() * 12_000.0) as i16;
            pcm.extend_from_slice(&value.to_le_bytes());
        }
    }
    pcm
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let path = env::args().nth(1).unwrap_or_else(|| "roundtrip.flac".into());
    let format = PcmFormat::default();
    let pcm = tone(format);

    let options = EncoderOptions {
        compression_level: Some(8),
        metadata: vec![MetadataBlock::tags([("TITLE", "Roundtrip tone")])],
        ..EncoderOptions::with_format(format)
    };
    let summary = encode_flac_file(pcm.as_slice(), &path, options).await?;
    info!(
        path = %path,
        samples = summary.samples,
        bytes = summary.bytes_written,
        ratio = summary.bytes_written as f64 / pcm.len() as f64,
        "encoded"
    );

    let options = DecoderOptions {
        md5_checking: true,
        ..Default::default()
    };
    let mut stream = decode_flac_file(&path, options).await?;
    let mut decoded = Vec::new();
    stream.read_to_end(&mut decoded).await?;
    let progress = stream.progress();
    stream.wait().await?;

    info!(
        seconds = progress.current_seconds,
        identical = decoded == pcm,
        "decoded"
    );
    Ok(())
}
