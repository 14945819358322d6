//! # pmoflacstream
//!
//! Backpressure-aware async streaming on top of libFLAC.
//!
//! libFLAC is frame-synchronous: its decoder pulls bytes through a blocking
//! read callback and its encoder pushes bytes through a blocking write
//! callback. This crate runs each codec on a Tokio blocking thread and
//! connects it to async code through bounded channels, so that:
//!
//! - encoded input can be pushed in chunks of any size, a single byte
//!   included, while memory stays bounded;
//! - a slow consumer holds the codec back instead of letting output pile up;
//! - sample accounting is exact and encoding is byte-for-byte independent
//!   of how the input was split.
//!
//! ## Push API
//!
//! ```no_run
//! use bytes::Bytes;
//! use pmoflacstream::{DecoderEvent, DecoderOptions, StreamDecoder};
//!
//! # async fn run(chunks: Vec<Bytes>) -> Result<(), pmoflacstream::FlacError> {
//! let (mut sink, mut events) = StreamDecoder::new(DecoderOptions::default())?;
//! let consumer = tokio::spawn(async move {
//!     let mut samples = 0u64;
//!     while let Some(event) = events.recv().await {
//!         if let DecoderEvent::Frame(frame) = event {
//!             samples += frame.samples as u64;
//!         }
//!     }
//!     samples
//! });
//! for chunk in chunks {
//!     sink.write(chunk).await?;
//! }
//! sink.end().await?;
//! println!("decoded {} sample-frames", consumer.await.unwrap_or(0));
//! # Ok(())
//! # }
//! ```
//!
//! ## Reader API
//!
//! ```no_run
//! use pmoflacstream::{decode_flac_stream, DecoderOptions};
//! use tokio::{fs::File, io::AsyncReadExt};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let file = File::open("audio.flac").await?;
//!     let mut stream = decode_flac_stream(file, DecoderOptions::default()).await?;
//!
//!     let format = stream.format();
//!     println!("{} Hz, {} channels", format.sample_rate, format.channels);
//!
//!     let mut pcm = Vec::new();
//!     stream.read_to_end(&mut pcm).await?;
//!     stream.wait().await?;
//!     Ok(())
//! }
//! ```

pub mod chunk_queue;
pub mod codec;
pub mod convert;
pub mod decoder;
pub mod encoder;
pub mod error;
pub mod options;
pub mod pcm;
pub mod progress;
mod read_bridge;
pub mod session;
mod stream;

pub use codec::{
    decoder::DecodeErrorKind,
    metadata::{MetadataBlock, MetadataKind, StreamInfo},
};
pub use decoder::{
    DecoderEvent, DecoderEvents, DecoderSink, FlacDecodedStream, PcmFrame, StreamDecoder,
    decode_flac_file, decode_flac_stream,
};
pub use encoder::{
    EncodeSummary, EncodedChunks, EncoderSink, FlacEncodedStream, StreamEncoder,
    encode_flac_file, encode_flac_stream,
};
pub use error::{ConvertError, FlacError};
pub use options::{DecoderOptions, EncoderOptions, EncoderTuning, MetadataRequest};
pub use pcm::{PcmFormat, StreamFormat};
pub use progress::Progress;
pub use session::{SessionState, WriteOutcome};
pub use stream::ManagedAsyncReader;
