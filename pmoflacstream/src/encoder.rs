//! FLAC encoding sessions.
//!
//! [`StreamEncoder::new`] returns a PCM sink and a receiver of encoded
//! chunks. Interleaved bytes may be split anywhere: partial sample-frames
//! are carried over to the next write, so feeding a stream one byte at a
//! time yields the same output as feeding it whole. Whatever is left of an
//! incomplete frame at the end is discarded.
//!
//! Like decoding, the output channel is bounded and must be drained while
//! writing.

use std::{
    io,
    path::{Path, PathBuf},
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use bytes::{Bytes, BytesMut};
use serde::Serialize;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWriteExt},
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tracing::{debug, warn};

use crate::{
    codec::{
        encoder::{EncodeHandler, EncoderSession, EncoderTarget},
        metadata::{StreamInfo, read_stream_info},
    },
    convert::{CarryBuffer, le_bytes_to_i32},
    error::{ConvertError, FlacError},
    options::EncoderOptions,
    pcm::{PcmChunk, PcmFormat, StreamFormat},
    progress::Progress,
    session::{SendOutcome, SessionShared, SessionState},
    stream::{ManagedAsyncReader, PIPE_CAPACITY},
};

const PCM_FRAMES_PER_CHUNK: usize = 4096;
const INGEST_CHUNK_SIZE: usize = 16 * 1024;

/// Outcome of a completed encode.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EncodeSummary {
    /// Sample-frames handed to libFLAC.
    pub samples: u64,
    pub bytes_written: u64,
    /// Final STREAMINFO, when libFLAC reported it.
    pub stream_info: Option<StreamInfo>,
}

enum PcmInput {
    Interleaved(PcmChunk),
    Planar { channels: Vec<Vec<i32>>, frames: u32 },
}

enum Output {
    Channel(mpsc::Sender<Bytes>),
    File(PathBuf),
}

/// Receiver of encoded FLAC bytes, in stream order.
#[derive(Debug)]
pub struct EncodedChunks {
    rx: mpsc::Receiver<Bytes>,
    shared: Arc<SessionShared>,
}

impl EncodedChunks {
    /// Next encoded chunk, or `None` once the encoder finished or was
    /// destroyed.
    pub async fn recv(&mut self) -> Option<Bytes> {
        if self.shared.is_destroyed() {
            self.rx.close();
            while self.rx.try_recv().is_ok() {}
            return None;
        }
        self.rx.recv().await
    }
}

/// Entry point of push-based encoding.
pub struct StreamEncoder;

impl StreamEncoder {
    /// Builds an idle session. The codec thread starts with the first write,
    /// so [`EncoderSink::apply_format`] may still change the PCM layout.
    pub fn new(options: EncoderOptions) -> Result<(EncoderSink, EncodedChunks), FlacError> {
        options.validate()?;
        let (tx, rx) = mpsc::channel(options.channel_capacity);
        let sink = EncoderSink::build(options, Output::Channel(tx));
        let chunks = EncodedChunks {
            rx,
            shared: sink.shared.clone(),
        };
        Ok((sink, chunks))
    }

    /// Builds a session writing to `path` through libFLAC's file writer,
    /// which rewrites STREAMINFO once the stream is complete.
    pub fn file(
        options: EncoderOptions,
        path: impl AsRef<Path>,
    ) -> Result<EncoderSink, FlacError> {
        options.validate()?;
        Ok(EncoderSink::build(
            options,
            Output::File(path.as_ref().to_path_buf()),
        ))
    }
}

/// PCM side of an encoding session.
///
/// Dropping the sink closes the input; the stream is finished with what
/// was written.
pub struct EncoderSink {
    options: EncoderOptions,
    shared: Arc<SessionShared>,
    output: Option<Output>,
    pcm_tx: Option<mpsc::Sender<PcmInput>>,
    carry: CarryBuffer,
    codec: Option<JoinHandle<Result<EncodeSummary, FlacError>>>,
    destroyed_reason: Option<String>,
}

impl EncoderSink {
    fn build(options: EncoderOptions, output: Output) -> Self {
        let carry = CarryBuffer::new(options.pcm_bytes_per_frame());
        Self {
            options,
            shared: Arc::new(SessionShared::new("encoder")),
            output: Some(output),
            pcm_tx: None,
            carry,
            codec: None,
            destroyed_reason: None,
        }
    }

    /// Replaces the PCM layout announced by the producer.
    ///
    /// Only honoured before the first write; afterwards the codec is already
    /// configured and the call is a no-op returning `Ok(false)`.
    pub fn apply_format(&mut self, format: PcmFormat) -> Result<bool, FlacError> {
        if self.shared.state() != SessionState::Uninitialized {
            debug!(state = %self.shared.state(), "late format ignored, encoder already built");
            return Ok(false);
        }
        format
            .validate()
            .map_err(|msg| FlacError::InvalidOption(format!("invalid PCM format: {msg}")))?;
        self.options.format = format;
        self.carry = CarryBuffer::new(self.options.pcm_bytes_per_frame());
        Ok(true)
    }

    /// Feeds interleaved little-endian PCM.
    pub async fn write(&mut self, pcm: &[u8]) -> Result<(), FlacError> {
        self.ready().await?;
        let Some(frames) = self.carry.take_frames(pcm) else {
            return Ok(());
        };
        let samples = le_bytes_to_i32(&frames, self.options.pcm_bytes_per_sample())?;
        let channels = self.options.format.channels;
        for piece in samples.chunks(PCM_FRAMES_PER_CHUNK * channels as usize) {
            let chunk = PcmChunk::new(piece.to_vec(), channels);
            self.send(PcmInput::Interleaved(chunk)).await?;
        }
        Ok(())
    }

    /// Feeds one little-endian buffer per channel, `samples` samples each.
    pub async fn write_channels(
        &mut self,
        channels: &[&[u8]],
        samples: usize,
    ) -> Result<(), FlacError> {
        let expected = self.options.format.channels as usize;
        if channels.len() != expected {
            return Err(FlacError::InvalidOption(format!(
                "expected {expected} channel buffers, got {}",
                channels.len()
            )));
        }
        if samples == 0 {
            return Err(ConvertError::ZeroSamples.into());
        }
        if self.carry.residual() > 0 {
            return Err(FlacError::Protocol(
                "per-channel write while a partial interleaved frame is pending".into(),
            ));
        }
        let width = self.options.pcm_bytes_per_sample();
        let needed = samples * width;
        if let Some(short) = channels.iter().find(|channel| channel.len() < needed) {
            return Err(ConvertError::BufferTooShort {
                needed,
                actual: short.len(),
            }
            .into());
        }

        self.ready().await?;
        for start in (0..samples).step_by(PCM_FRAMES_PER_CHUNK) {
            let frames = PCM_FRAMES_PER_CHUNK.min(samples - start);
            let range = start * width..(start + frames) * width;
            let planar = channels
                .iter()
                .map(|channel| le_bytes_to_i32(&channel[range.clone()], width))
                .collect::<Result<Vec<_>, _>>()?;
            self.send(PcmInput::Planar {
                channels: planar,
                frames: frames as u32,
            })
            .await?;
        }
        Ok(())
    }

    /// Closes the input and waits for libFLAC to finish the stream.
    pub async fn end(&mut self) -> Result<EncodeSummary, FlacError> {
        self.ensure_alive()?;
        if self.shared.state() == SessionState::Uninitialized {
            self.start().await?;
        }
        let dropped = self.carry.discard();
        if dropped > 0 {
            warn!(
                bytes = dropped,
                frame_bytes = self.carry.frame_bytes(),
                "discarding incomplete trailing sample-frame"
            );
        }
        if self.shared.state() == SessionState::Active
            && self.shared.advance(SessionState::Draining).is_err()
        {
            debug!("encoder failed before draining");
        }
        self.pcm_tx.take();
        self.join().await
    }

    /// Tears the session down. The output is left incomplete.
    pub fn destroy(&mut self, reason: impl Into<String>) {
        if !self.shared.mark_destroyed() {
            return;
        }
        let reason = reason.into();
        debug!(reason = %reason, state = %self.shared.state(), "destroying encoder");
        self.shared.fail();
        self.pcm_tx.take();
        self.output.take();
        self.codec.take();
        self.carry.discard();
        self.destroyed_reason = Some(reason);
    }

    pub fn progress(&self) -> Progress {
        self.shared.tracker.snapshot()
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    pub fn format(&self) -> PcmFormat {
        self.options.format
    }

    fn ensure_alive(&self) -> Result<(), FlacError> {
        match &self.destroyed_reason {
            Some(reason) => Err(FlacError::Destroyed(reason.clone())),
            None => Ok(()),
        }
    }

    async fn ready(&mut self) -> Result<(), FlacError> {
        self.ensure_alive()?;
        match self.shared.state() {
            SessionState::Uninitialized => self.start().await,
            SessionState::Active => Ok(()),
            SessionState::Failed => {
                self.join().await?;
                Err(FlacError::Protocol("cannot write into a failed encoder".into()))
            }
            state => Err(FlacError::Protocol(format!(
                "cannot write into a {state} encoder"
            ))),
        }
    }

    /// Builds the codec thread and waits until libFLAC accepted the settings.
    pub(crate) async fn start(&mut self) -> Result<(), FlacError> {
        self.shared.advance(SessionState::Initializing)?;
        let output = self.output.take().ok_or(FlacError::ChannelClosed)?;
        let (pcm_tx, pcm_rx) = mpsc::channel(self.options.channel_capacity);
        let (init_tx, init_rx) = oneshot::channel();

        let options = self.options.clone();
        let shared = self.shared.clone();
        debug!(
            channels = options.format.channels,
            bits_per_sample = options.format.bits_per_sample,
            sample_rate = options.format.sample_rate,
            ogg = options.is_ogg,
            "starting encoder thread"
        );
        let codec = tokio::task::spawn_blocking(move || {
            run_encoder(options, output, pcm_rx, shared, init_tx)
        });

        match init_rx.await {
            Ok(Ok(())) => {
                self.pcm_tx = Some(pcm_tx);
                self.codec = Some(codec);
                Ok(())
            }
            Ok(Err(err)) => {
                self.shared.fail();
                Err(err)
            }
            Err(_) => {
                self.shared.fail();
                Err(join_codec(codec)
                    .await
                    .err()
                    .unwrap_or(FlacError::ChannelClosed))
            }
        }
    }

    async fn send(&mut self, input: PcmInput) -> Result<(), FlacError> {
        let tx = self.pcm_tx.as_ref().ok_or(FlacError::ChannelClosed)?;
        if tx.send(input).await.is_err() {
            // The codec thread stopped: report why.
            self.pcm_tx.take();
            self.join().await?;
            return Err(FlacError::ChannelClosed);
        }
        Ok(())
    }

    async fn join(&mut self) -> Result<EncodeSummary, FlacError> {
        let Some(codec) = self.codec.take() else {
            return Err(FlacError::Protocol(format!(
                "encoder is {} and has no running codec",
                self.shared.state()
            )));
        };
        let result = join_codec(codec).await;
        if result.is_err() {
            self.shared.fail();
        }
        result
    }
}

async fn join_codec(
    codec: JoinHandle<Result<EncodeSummary, FlacError>>,
) -> Result<EncodeSummary, FlacError> {
    match codec.await {
        Ok(res) => res,
        Err(err) => Err(FlacError::TaskJoin {
            role: "flac-encode",
            details: err.to_string(),
        }),
    }
}

/// Forwards encoded bytes to the output channel and keeps the totals.
struct OutputForwarder {
    tx: Option<mpsc::Sender<Bytes>>,
    shared: Arc<SessionShared>,
    bytes_written: u64,
    stream_info: Option<StreamInfo>,
    consumer_gone: bool,
}

impl EncodeHandler for OutputForwarder {
    fn on_write(&mut self, bytes: &[u8], _samples: u32, _current_frame: u32) -> bool {
        if self.shared.is_destroyed() || self.consumer_gone {
            return false;
        }
        let Some(tx) = &self.tx else {
            return false;
        };
        match self.shared.send_from_codec(tx, Bytes::copy_from_slice(bytes)) {
            SendOutcome::Sent => {
                self.bytes_written += bytes.len() as u64;
                true
            }
            SendOutcome::Cancelled => false,
            SendOutcome::Closed => {
                debug!("encoded chunk receiver dropped");
                self.consumer_gone = true;
                false
            }
        }
    }

    fn on_stream_info(&mut self, info: StreamInfo) {
        self.stream_info = Some(info);
    }

    fn on_progress(&mut self, bytes_written: u64, _samples_written: u64) {
        self.bytes_written = bytes_written;
    }
}

fn run_encoder(
    options: EncoderOptions,
    output: Output,
    pcm_rx: mpsc::Receiver<PcmInput>,
    shared: Arc<SessionShared>,
    init_tx: oneshot::Sender<Result<(), FlacError>>,
) -> Result<EncodeSummary, FlacError> {
    let (tx, path) = match output {
        Output::Channel(tx) => (Some(tx), None),
        Output::File(path) => (None, Some(path)),
    };
    let forwarder = OutputForwarder {
        tx,
        shared: shared.clone(),
        bytes_written: 0,
        stream_info: None,
        consumer_gone: false,
    };
    let target = match &path {
        Some(path) => EncoderTarget::File(path),
        None => EncoderTarget::Stream,
    };

    let session = EncoderSession::new(&options, target, forwarder).and_then(|session| {
        shared.advance(SessionState::Active)?;
        Ok(session)
    });
    let mut session = match session {
        Ok(session) => session,
        Err(err) => {
            let _ = init_tx.send(Err(err));
            return Ok(EncodeSummary::default());
        }
    };
    shared.tracker.set_format(StreamFormat {
        channels: options.format.channels,
        bits_per_sample: options.format.bits_per_sample,
        sample_rate: options.format.sample_rate,
        total_samples: options.total_samples_estimate,
        is_32bit: options.input_as_32,
    });
    let _ = init_tx.send(Ok(()));

    let result = encode(&mut session, pcm_rx, &shared).and_then(|mut summary| {
        if let Some(path) = &path {
            summary.stream_info = read_stream_info(path)?;
        }
        Ok(summary)
    });
    match &result {
        Ok(summary) => debug!(
            samples = summary.samples,
            bytes = summary.bytes_written,
            "encoder finished"
        ),
        Err(err) => {
            debug!(error = %err, "encoder thread stopped");
            shared.fail();
        }
    }
    result
}

fn encode(
    session: &mut EncoderSession<OutputForwarder>,
    mut pcm_rx: mpsc::Receiver<PcmInput>,
    shared: &SessionShared,
) -> Result<EncodeSummary, FlacError> {
    while let Some(input) = pcm_rx.blocking_recv() {
        if shared.is_destroyed() {
            return Err(FlacError::Destroyed("encoder destroyed while running".into()));
        }
        let (ok, frames) = match input {
            PcmInput::Interleaved(chunk) => (
                session.process_interleaved(&chunk.data, chunk.frames),
                chunk.frames,
            ),
            PcmInput::Planar { channels, frames } => {
                let planar: Vec<&[i32]> = channels.iter().map(Vec::as_slice).collect();
                (session.process(&planar, frames), frames)
            }
        };
        if !ok {
            if shared.is_destroyed() {
                return Err(FlacError::Destroyed("encoder destroyed while running".into()));
            }
            return Err(encoder_failure(session));
        }
        shared.tracker.add_samples(frames as u64);
    }

    if shared.is_destroyed() {
        return Err(FlacError::Destroyed("encoder destroyed while running".into()));
    }
    if !session.finish() {
        return Err(encoder_failure(session));
    }
    shared.advance(SessionState::Finished)?;

    let handler = session.handler_mut();
    Ok(EncodeSummary {
        samples: shared.tracker.processed_samples(),
        bytes_written: handler.bytes_written,
        stream_info: handler.stream_info.take(),
    })
}

fn encoder_failure(session: &EncoderSession<OutputForwarder>) -> FlacError {
    if session.handler().consumer_gone {
        return FlacError::ChannelClosed;
    }
    let state = session.state();
    let mut message = session.resolved_state_string();
    if state.is_verify_failure() {
        message = format!("verification failed: {message}");
    }
    FlacError::Process {
        state: state.code(),
        message,
    }
}

/// Encoded FLAC exposed as an `AsyncRead`.
pub struct FlacEncodedStream {
    format: PcmFormat,
    shared: Arc<SessionShared>,
    reader: ManagedAsyncReader<EncodeSummary>,
}

impl FlacEncodedStream {
    pub fn format(&self) -> PcmFormat {
        self.format
    }

    pub fn progress(&self) -> Progress {
        self.shared.tracker.snapshot()
    }

    pub fn into_reader(self) -> ManagedAsyncReader<EncodeSummary> {
        self.reader
    }

    /// Waits until the encoder finished and returns its summary.
    pub async fn wait(self) -> Result<EncodeSummary, FlacError> {
        self.reader.wait().await
    }
}

impl AsyncRead for FlacEncodedStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.reader).poll_read(cx, buf)
    }
}

async fn feed<R>(reader: &mut R, sink: &mut EncoderSink) -> Result<EncodeSummary, FlacError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(INGEST_CHUNK_SIZE);
    loop {
        buf.clear();
        buf.reserve(INGEST_CHUNK_SIZE);
        let read = match reader.read_buf(&mut buf).await {
            Ok(read) => read,
            Err(err) => {
                sink.destroy(format!("input read failed: {err}"));
                return Err(FlacError::Io(err));
            }
        };
        if read == 0 {
            return sink.end().await;
        }
        sink.write(&buf).await?;
    }
}

/// Encodes interleaved little-endian PCM read from `reader`.
///
/// libFLAC is configured before this returns, so invalid settings fail
/// here rather than on the first read.
pub async fn encode_flac_stream<R>(
    reader: R,
    options: EncoderOptions,
) -> Result<FlacEncodedStream, FlacError>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let format = options.format;
    let (mut sink, mut chunks) = StreamEncoder::new(options)?;
    sink.start().await?;
    let shared = sink.shared.clone();

    let ingest = tokio::spawn(async move {
        let mut reader = reader;
        feed(&mut reader, &mut sink).await
    });

    let (flac_reader, mut flac_writer) = tokio::io::duplex(PIPE_CAPACITY);
    let pump = tokio::spawn(async move {
        let mut write_result = Ok(());
        while let Some(chunk) = chunks.recv().await {
            if let Err(err) = flac_writer.write_all(&chunk).await {
                write_result = Err(FlacError::Io(err));
                break;
            }
        }
        drop(chunks);
        let summary = match ingest.await {
            Ok(res) => res,
            Err(err) => Err(FlacError::TaskJoin {
                role: "flac-encode-input",
                details: err.to_string(),
            }),
        };
        write_result?;
        let summary = summary?;
        flac_writer.shutdown().await?;
        Ok(summary)
    });

    let reader = ManagedAsyncReader::new("flac-encode-writer", flac_reader, pump);
    Ok(FlacEncodedStream {
        format,
        shared,
        reader,
    })
}

/// Encodes interleaved little-endian PCM from `reader` into a file.
pub async fn encode_flac_file<R>(
    reader: R,
    path: impl AsRef<Path>,
    options: EncoderOptions,
) -> Result<EncodeSummary, FlacError>
where
    R: AsyncRead + Unpin,
{
    let mut reader = reader;
    let mut sink = StreamEncoder::file(options, path)?;
    feed(&mut reader, &mut sink).await
}
