#![allow(dead_code)]

use std::{
    io,
    pin::Pin,
    task::{Context, Poll},
};

use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};

use pmoflacstream::{
    DecoderOptions, EncoderOptions, FlacError, PcmFormat, StreamFormat, decode_flac_stream,
    encode_flac_stream,
};

/// Serves a byte vector, at most `step` bytes per read.
pub struct VecAsyncReader {
    data: Vec<u8>,
    pos: usize,
    step: usize,
}

impl VecAsyncReader {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data,
            pos: 0,
            step: usize::MAX,
        }
    }

    pub fn with_step(data: Vec<u8>, step: usize) -> Self {
        Self {
            data,
            pos: 0,
            step: step.max(1),
        }
    }
}

impl AsyncRead for VecAsyncReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.pos >= self.data.len() {
            return Poll::Ready(Ok(()));
        }
        let remaining = &self.data[self.pos..];
        let to_copy = remaining.len().min(buf.remaining()).min(self.step);
        if to_copy == 0 {
            return Poll::Ready(Ok(()));
        }
        buf.put_slice(&remaining[..to_copy]);
        self.pos += to_copy;
        Poll::Ready(Ok(()))
    }
}

pub fn format(sample_rate: u32, channels: u8, bits_per_sample: u8) -> PcmFormat {
    PcmFormat {
        sample_rate,
        channels,
        bits_per_sample,
    }
}

/// Deterministic interleaved PCM: a sawtooth per channel, using about half
/// of the range of the bit depth, negative values included.
pub fn synth_pcm(frames: usize, format: PcmFormat) -> Vec<u8> {
    let width = format.bytes_per_sample();
    let amplitude = 1i64 << (format.bits_per_sample - 2);
    let mut out = Vec::with_capacity(frames * format.channels as usize * width);
    for frame in 0..frames as i64 {
        for channel in 0..format.channels as i64 {
            let value = (frame * 97 + channel * 12_345) % (2 * amplitude) - amplitude;
            out.extend_from_slice(&(value as i32).to_le_bytes()[..width]);
        }
    }
    out
}

pub async fn encode_all(pcm: Vec<u8>, options: EncoderOptions) -> Result<Vec<u8>, FlacError> {
    let mut stream = encode_flac_stream(VecAsyncReader::new(pcm), options).await?;
    let mut flac = Vec::new();
    stream.read_to_end(&mut flac).await?;
    stream.wait().await?;
    Ok(flac)
}

pub async fn decode_all(
    flac: Vec<u8>,
    options: DecoderOptions,
) -> Result<(StreamFormat, Vec<u8>), FlacError> {
    let mut stream = decode_flac_stream(VecAsyncReader::new(flac), options).await?;
    let format = stream.format();
    let mut pcm = Vec::new();
    stream.read_to_end(&mut pcm).await?;
    stream.wait().await?;
    Ok((format, pcm))
}
