//! FLAC decoding sessions.
//!
//! [`StreamDecoder::new`] returns a push sink and an event receiver. Encoded
//! bytes written into the sink are queued and handed to libFLAC through the
//! read bridge; decoded frames, stream facts and metadata come back on the
//! event channel in the order libFLAC produced them.
//!
//! The event channel is bounded. When nobody drains it the codec thread
//! stops inside its write callback, the sink stops acknowledging writes, and
//! the producer is held back. Events must therefore be consumed concurrently
//! with writing.
//!
//! [`decode_flac_stream`] and [`decode_flac_file`] wrap a session into an
//! `AsyncRead` of interleaved little-endian PCM.

use std::{
    io,
    path::{Path, PathBuf},
    pin::Pin,
    sync::{Arc, Mutex},
    task::{Context, Poll},
};

use bytes::{Bytes, BytesMut};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWriteExt},
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tracing::{debug, trace, warn};

use crate::{
    codec::{
        decoder::{DecodeErrorKind, DecodeHandler, DecoderSession, FrameHeader},
        metadata::MetadataBlock,
    },
    convert::{i32_to_le_bytes, interleave},
    error::FlacError,
    options::DecoderOptions,
    pcm::{StreamFormat, bytes_per_sample},
    progress::Progress,
    read_bridge::{BridgeServer, ReadBridge, read_bridge},
    session::{SendOutcome, SessionShared, SessionState, WriteOutcome},
    stream::{ManagedAsyncReader, PIPE_CAPACITY},
};

const INGEST_CHUNK_SIZE: usize = 16 * 1024;

/// One decoded frame as interleaved little-endian PCM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PcmFrame {
    pub data: Bytes,
    /// Sample-frames in `data`.
    pub samples: u32,
    pub channels: u8,
    pub bytes_per_sample: u8,
}

/// What a decoding session reports, in engine order.
#[derive(Debug, Clone, PartialEq)]
pub enum DecoderEvent {
    /// Stream facts, sent once before the first frame.
    Format(StreamFormat),
    Metadata(MetadataBlock),
    Frame(PcmFrame),
    /// A recoverable problem; decoding goes on.
    DecodeError(DecodeErrorKind),
}

/// Receiving end of a decoding session.
#[derive(Debug)]
pub struct DecoderEvents {
    rx: mpsc::Receiver<DecoderEvent>,
    shared: Arc<SessionShared>,
}

impl DecoderEvents {
    /// Next event, or `None` once the session ended or was destroyed.
    pub async fn recv(&mut self) -> Option<DecoderEvent> {
        if self.shared.is_destroyed() {
            self.discard();
            return None;
        }
        self.rx.recv().await
    }

    pub fn progress(&self) -> Progress {
        self.shared.tracker.snapshot()
    }

    fn discard(&mut self) {
        self.rx.close();
        while self.rx.try_recv().is_ok() {}
    }
}

/// Entry point of push-based decoding.
pub struct StreamDecoder;

impl StreamDecoder {
    /// Builds an idle session. The codec thread starts with the first write.
    pub fn new(options: DecoderOptions) -> Result<(DecoderSink, DecoderEvents), FlacError> {
        options.validate()?;
        let shared = Arc::new(SessionShared::new("decoder"));
        let (events_tx, events_rx) = mpsc::channel(options.channel_capacity);
        let sink = DecoderSink {
            options,
            shared: shared.clone(),
            events_tx: Some(events_tx),
            server: None,
            codec: None,
            destroyed_reason: None,
        };
        let events = DecoderEvents {
            rx: events_rx,
            shared,
        };
        Ok((sink, events))
    }
}

/// Push side of a decoding session.
///
/// Dropping the sink while the codec is running closes the input: what was
/// already written is decoded, then the session finishes on its own.
#[derive(Debug)]
pub struct DecoderSink {
    options: DecoderOptions,
    shared: Arc<SessionShared>,
    events_tx: Option<mpsc::Sender<DecoderEvent>>,
    server: Option<BridgeServer>,
    codec: Option<JoinHandle<Result<(), FlacError>>>,
    destroyed_reason: Option<String>,
}

impl DecoderSink {
    /// Queues encoded bytes.
    ///
    /// Resolves once the input queue is almost empty again, or once the
    /// codec reached the end of the stream.
    pub async fn write(&mut self, chunk: Bytes) -> Result<WriteOutcome, FlacError> {
        self.ensure_alive()?;
        match self.shared.state() {
            SessionState::Uninitialized => self.start().await?,
            SessionState::Active => {}
            SessionState::Finished => return Ok(WriteOutcome::Finished),
            SessionState::Draining => {
                return Err(FlacError::Protocol(
                    "input written after end of input was signalled".into(),
                ));
            }
            SessionState::Failed => {
                self.join().await?;
                return Err(FlacError::Protocol("cannot write into a failed decoder".into()));
            }
            state => {
                return Err(FlacError::Protocol(format!(
                    "cannot write into a {state} decoder"
                )));
            }
        }

        self.server_mut()?.push(chunk)?;
        self.pump().await
    }

    /// Signals the end of input and waits until everything queued is decoded.
    pub async fn end(&mut self) -> Result<(), FlacError> {
        self.ensure_alive()?;
        match self.shared.state() {
            SessionState::Uninitialized => self.start().await?,
            SessionState::Finished => return self.join().await,
            SessionState::Failed => return self.join().await,
            _ => {}
        }

        if self.shared.state() == SessionState::Active
            && self.shared.advance(SessionState::Draining).is_err()
        {
            // The codec thread failed in the meantime.
            return self.join().await;
        }

        let server = self.server_mut()?;
        server.end_input();
        while let Some(demand) = server.next_demand().await {
            server.park(demand)?;
        }
        self.join().await
    }

    /// Tears the session down without draining it.
    ///
    /// Queued input and the parked read are dropped; the codec thread
    /// aborts at its next callback, including one stuck on a full event
    /// channel. Later calls fail with
    /// [`FlacError::Destroyed`].
    pub fn destroy(&mut self, reason: impl Into<String>) {
        if !self.shared.mark_destroyed() {
            return;
        }
        let reason = reason.into();
        debug!(reason = %reason, state = %self.shared.state(), "destroying decoder");
        self.shared.fail();
        if let Some(server) = self.server.as_mut() {
            server.release();
        }
        self.events_tx.take();
        // Detached: the codec thread ends by itself once it sees the flag.
        self.codec.take();
        self.destroyed_reason = Some(reason);
    }

    pub fn progress(&self) -> Progress {
        self.shared.tracker.snapshot()
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    /// Stream facts, once the codec announced them.
    pub fn format(&self) -> Option<StreamFormat> {
        self.shared.tracker.format()
    }

    fn ensure_alive(&self) -> Result<(), FlacError> {
        match &self.destroyed_reason {
            Some(reason) => Err(FlacError::Destroyed(reason.clone())),
            None if self.shared.is_destroyed() => {
                Err(FlacError::Destroyed("session destroyed".into()))
            }
            None => Ok(()),
        }
    }

    fn server_mut(&mut self) -> Result<&mut BridgeServer, FlacError> {
        self.server.as_mut().ok_or(FlacError::ChannelClosed)
    }

    async fn start(&mut self) -> Result<(), FlacError> {
        self.shared.advance(SessionState::Initializing)?;
        let events_tx = self.events_tx.take().ok_or(FlacError::ChannelClosed)?;
        let (bridge, server) = read_bridge(self.options.prefetch_factor);
        let (init_tx, init_rx) = oneshot::channel();

        let options = self.options.clone();
        let forwarder = EventForwarder::new(&options, events_tx, self.shared.clone());
        let shared = self.shared.clone();
        debug!(
            ogg = options.is_ogg,
            output_as_32 = options.output_as_32,
            "starting decoder thread"
        );
        let codec = tokio::task::spawn_blocking(move || {
            run_stream_decoder(options, bridge, forwarder, shared, init_tx)
        });
        self.server = Some(server);

        match init_rx.await {
            Ok(Ok(())) => {
                self.codec = Some(codec);
                Ok(())
            }
            Ok(Err(err)) => {
                self.shared.fail();
                Err(err)
            }
            Err(_) => {
                self.shared.fail();
                Err(join_codec(codec, "flac-decode")
                    .await
                    .err()
                    .unwrap_or(FlacError::ChannelClosed))
            }
        }
    }

    async fn pump(&mut self) -> Result<WriteOutcome, FlacError> {
        if self.service_demands().await? {
            Ok(WriteOutcome::Accepted)
        } else {
            self.join().await?;
            Ok(WriteOutcome::Finished)
        }
    }

    /// Services demands until the almost-empty policy asks for more input.
    /// Returns false once the codec thread stopped reading.
    async fn service_demands(&mut self) -> Result<bool, FlacError> {
        let server = self.server_mut()?;
        loop {
            while !server.has_parked() {
                match server.try_next_demand() {
                    Ok(demand) => server.park(demand)?,
                    Err(mpsc::error::TryRecvError::Empty) => break,
                    Err(mpsc::error::TryRecvError::Disconnected) => return Ok(false),
                }
            }
            if server.wants_input() {
                trace!(
                    queued = server.queued(),
                    threshold = server.threshold(),
                    "write acknowledged"
                );
                return Ok(true);
            }
            match server.next_demand().await {
                Some(demand) => server.park(demand)?,
                None => return Ok(false),
            }
        }
    }

    async fn join(&mut self) -> Result<(), FlacError> {
        let Some(codec) = self.codec.take() else {
            return match self.shared.state() {
                SessionState::Failed => Err(FlacError::Protocol(
                    "decoder already failed".into(),
                )),
                _ => Ok(()),
            };
        };
        let result = join_codec(codec, "flac-decode").await;
        if result.is_err() {
            self.shared.fail();
        }
        result
    }
}

impl Drop for DecoderSink {
    fn drop(&mut self) {
        if self.shared.state().is_terminal() || self.shared.is_destroyed() {
            return;
        }
        let (Some(mut server), Some(codec)) = (self.server.take(), self.codec.take()) else {
            return;
        };
        server.end_input();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    while let Some(demand) = server.next_demand().await {
                        if server.park(demand).is_err() {
                            break;
                        }
                    }
                    if let Err(err) = join_codec(codec, "flac-decode").await {
                        debug!(error = %err, "decoder closed by drop ended with an error");
                    }
                });
            }
            Err(_) => server.release(),
        }
    }
}

async fn join_codec<T>(
    codec: JoinHandle<Result<T, FlacError>>,
    role: &'static str,
) -> Result<T, FlacError> {
    match codec.await {
        Ok(res) => res,
        Err(err) => Err(FlacError::TaskJoin {
            role,
            details: err.to_string(),
        }),
    }
}

/// Turns libFLAC callbacks into [`DecoderEvent`]s.
struct EventForwarder {
    tx: mpsc::Sender<DecoderEvent>,
    shared: Arc<SessionShared>,
    metadata: crate::options::MetadataRequest,
    output_as_32: bool,
    planar: Vec<Vec<u8>>,
    consumer_gone: bool,
    failure: Option<FlacError>,
}

impl EventForwarder {
    fn new(
        options: &DecoderOptions,
        tx: mpsc::Sender<DecoderEvent>,
        shared: Arc<SessionShared>,
    ) -> Self {
        Self {
            tx,
            shared,
            metadata: options.metadata.clone(),
            output_as_32: options.output_as_32,
            planar: Vec::new(),
            consumer_gone: false,
            failure: None,
        }
    }

    fn send(&mut self, event: DecoderEvent) -> bool {
        if self.consumer_gone || self.shared.is_destroyed() {
            return false;
        }
        match self.shared.send_from_codec(&self.tx, event) {
            SendOutcome::Sent => true,
            SendOutcome::Cancelled => false,
            SendOutcome::Closed => {
                debug!("decoder event receiver dropped");
                self.consumer_gone = true;
                false
            }
        }
    }

    fn announce(&mut self, format: StreamFormat) {
        if self.shared.tracker.set_format(format) {
            debug!(
                channels = format.channels,
                bits_per_sample = format.bits_per_sample,
                sample_rate = format.sample_rate,
                total_samples = ?format.total_samples,
                "stream format"
            );
            self.send(DecoderEvent::Format(format));
        }
    }

    fn take_failure(&mut self) -> Option<FlacError> {
        if let Some(err) = self.failure.take() {
            return Some(err);
        }
        self.consumer_gone.then_some(FlacError::ChannelClosed)
    }
}

impl DecodeHandler for EventForwarder {
    fn on_metadata(&mut self, block: MetadataBlock) {
        if let MetadataBlock::StreamInfo(info) = &block {
            self.announce(StreamFormat {
                channels: info.channels,
                bits_per_sample: info.bits_per_sample,
                sample_rate: info.sample_rate,
                total_samples: (info.total_samples > 0).then_some(info.total_samples),
                is_32bit: self.output_as_32,
            });
        }
        if self.metadata.wants(block.kind()) {
            self.send(DecoderEvent::Metadata(block));
        }
    }

    fn on_frame(&mut self, header: FrameHeader, channels: &[&[i32]]) -> bool {
        if self.shared.is_destroyed() {
            return false;
        }
        if self.shared.tracker.format().is_none() {
            // No STREAMINFO: take the facts from the first frame header.
            self.announce(StreamFormat {
                channels: header.channels as u8,
                bits_per_sample: header.bits_per_sample as u8,
                sample_rate: header.sample_rate,
                total_samples: None,
                is_32bit: self.output_as_32,
            });
        }

        let out_bps = if self.output_as_32 {
            4
        } else {
            bytes_per_sample(header.bits_per_sample as u8)
        };
        self.planar.resize_with(channels.len(), Vec::new);
        for (buffer, samples) in self.planar.iter_mut().zip(channels) {
            buffer.clear();
            i32_to_le_bytes(samples, 4, buffer);
        }
        let planar: Vec<&[u8]> = self.planar.iter().map(Vec::as_slice).collect();
        let data = match interleave(&planar, header.block_size as usize, 4, out_bps) {
            Ok(data) => data,
            Err(err) => {
                self.failure = Some(err.into());
                return false;
            }
        };

        self.shared.tracker.add_samples(header.block_size as u64);
        self.send(DecoderEvent::Frame(PcmFrame {
            data: Bytes::from(data),
            samples: header.block_size,
            channels: header.channels as u8,
            bytes_per_sample: out_bps as u8,
        }))
    }

    fn on_error(&mut self, kind: DecodeErrorKind) {
        warn!(?kind, "FLAC decode error");
        self.send(DecoderEvent::DecodeError(kind));
    }
}

fn run_stream_decoder(
    options: DecoderOptions,
    bridge: ReadBridge,
    forwarder: EventForwarder,
    shared: Arc<SessionShared>,
    init_tx: oneshot::Sender<Result<(), FlacError>>,
) -> Result<(), FlacError> {
    let session = DecoderSession::new_stream(&options, bridge, forwarder);
    run_decoder(session, options.md5_checking, &shared, init_tx)
}

fn run_file_decoder(
    options: DecoderOptions,
    path: PathBuf,
    forwarder: EventForwarder,
    shared: Arc<SessionShared>,
    init_tx: oneshot::Sender<Result<(), FlacError>>,
) -> Result<(), FlacError> {
    let session = DecoderSession::new_file(&options, &path, forwarder);
    run_decoder(session, options.md5_checking, &shared, init_tx)
}

fn run_decoder(
    session: Result<DecoderSession<EventForwarder>, FlacError>,
    md5_checking: bool,
    shared: &SessionShared,
    init_tx: oneshot::Sender<Result<(), FlacError>>,
) -> Result<(), FlacError> {
    let mut session = match session.and_then(|s| {
        shared.advance(SessionState::Active)?;
        Ok(s)
    }) {
        Ok(session) => session,
        Err(err) => {
            let _ = init_tx.send(Err(err));
            return Ok(());
        }
    };
    let _ = init_tx.send(Ok(()));

    let result = drive(&mut session, md5_checking, shared);
    if let Err(err) = &result {
        debug!(error = %err, "decoder thread stopped");
        shared.fail();
    }
    result
}

/// Runs libFLAC one frame at a time until the end of the stream.
fn drive(
    session: &mut DecoderSession<EventForwarder>,
    md5_checking: bool,
    shared: &SessionShared,
) -> Result<(), FlacError> {
    let mut metadata_read = false;
    loop {
        if shared.is_destroyed() {
            // Flushing first keeps finish from reporting a partial MD5.
            session.flush();
            session.finish();
            return Err(FlacError::Destroyed("decoder destroyed while running".into()));
        }

        let ok = if metadata_read {
            session.process_single()
        } else {
            metadata_read = true;
            session.process_until_end_of_metadata()
        };
        let state = session.state();

        if let Some(err) = session.handler_mut().take_failure() {
            return Err(err);
        }
        if state.is_end_of_stream() {
            // flush drops the running MD5, so it only runs when nobody checks it.
            if !md5_checking {
                session.flush();
            }
            if !session.finish() {
                return Err(FlacError::Process {
                    state: state.code(),
                    message: "MD5 signature mismatch".into(),
                });
            }
            shared.advance(SessionState::Finished)?;
            return Ok(());
        }
        if !ok || state.is_failure() {
            if shared.is_destroyed() {
                continue;
            }
            return Err(FlacError::Process {
                state: state.code(),
                message: session.resolved_state_string(),
            });
        }
    }
}

/// Decoded PCM exposed as an `AsyncRead` of interleaved little-endian
/// samples.
pub struct FlacDecodedStream {
    format: StreamFormat,
    shared: Arc<SessionShared>,
    metadata: Arc<Mutex<Vec<MetadataBlock>>>,
    reader: ManagedAsyncReader<()>,
}

impl FlacDecodedStream {
    pub fn format(&self) -> StreamFormat {
        self.format
    }

    pub fn progress(&self) -> Progress {
        self.shared.tracker.snapshot()
    }

    /// Metadata blocks received so far.
    pub fn metadata(&self) -> Vec<MetadataBlock> {
        self.metadata
            .lock()
            .map(|blocks| blocks.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    pub fn into_reader(self) -> ManagedAsyncReader<()> {
        self.reader
    }

    /// Waits until decoding completed and reports how it ended.
    pub async fn wait(self) -> Result<(), FlacError> {
        self.reader.wait().await
    }
}

impl AsyncRead for FlacDecodedStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.reader).poll_read(cx, buf)
    }
}

/// Decodes FLAC (or Ogg FLAC) read from `reader`.
///
/// Returns once the stream facts are known, so a stream without any
/// decodable header fails here rather than on the first read.
pub async fn decode_flac_stream<R>(
    reader: R,
    options: DecoderOptions,
) -> Result<FlacDecodedStream, FlacError>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let (mut sink, events) = StreamDecoder::new(options)?;
    let shared = sink.shared.clone();

    let ingest = tokio::spawn(async move {
        let mut reader = reader;
        let mut buf = BytesMut::with_capacity(INGEST_CHUNK_SIZE);
        loop {
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
            if sink.write(buf.split().freeze()).await? == WriteOutcome::Finished {
                return Ok(());
            }
        }
    });

    open_stream(shared, events, ingest).await
}

/// Decodes a FLAC (or Ogg FLAC) file through libFLAC's own file reader.
pub async fn decode_flac_file(
    path: impl AsRef<Path>,
    options: DecoderOptions,
) -> Result<FlacDecodedStream, FlacError> {
    options.validate()?;
    let path = path.as_ref().to_path_buf();
    let shared = Arc::new(SessionShared::new("decoder"));
    let (events_tx, events_rx) = mpsc::channel(options.channel_capacity);
    let events = DecoderEvents {
        rx: events_rx,
        shared: shared.clone(),
    };

    shared.advance(SessionState::Initializing)?;
    let forwarder = EventForwarder::new(&options, events_tx, shared.clone());
    let (init_tx, init_rx) = oneshot::channel();
    let thread_shared = shared.clone();
    debug!(path = %path.display(), ogg = options.is_ogg, "starting file decoder thread");
    let codec = tokio::task::spawn_blocking(move || {
        run_file_decoder(options, path, forwarder, thread_shared, init_tx)
    });

    match init_rx.await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => {
            shared.fail();
            return Err(err);
        }
        Err(_) => {
            shared.fail();
            return Err(FlacError::ChannelClosed);
        }
    }

    let ingest = tokio::spawn(async move { join_codec(codec, "flac-decode").await });
    open_stream(shared, events, ingest).await
}

async fn open_stream(
    shared: Arc<SessionShared>,
    mut events: DecoderEvents,
    driver: JoinHandle<Result<(), FlacError>>,
) -> Result<FlacDecodedStream, FlacError> {
    let metadata = Arc::new(Mutex::new(Vec::new()));
    let (format_tx, format_rx) = oneshot::channel::<Result<StreamFormat, FlacError>>();
    let (pcm_reader, mut pcm_writer) = tokio::io::duplex(PIPE_CAPACITY);

    let collected = metadata.clone();
    let pump = tokio::spawn(async move {
        let mut format_tx = Some(format_tx);
        let mut write_result = Ok(());
        while let Some(event) = events.recv().await {
            match event {
                DecoderEvent::Format(format) => {
                    if let Some(tx) = format_tx.take() {
                        let _ = tx.send(Ok(format));
                    }
                }
                DecoderEvent::Metadata(block) => match collected.lock() {
                    Ok(mut blocks) => blocks.push(block),
                    Err(poisoned) => poisoned.into_inner().push(block),
                },
                DecoderEvent::Frame(frame) => {
                    if let Err(err) = pcm_writer.write_all(&frame.data).await {
                        write_result = Err(FlacError::Io(err));
                        break;
                    }
                }
                DecoderEvent::DecodeError(_) => {}
            }
        }
        drop(events);

        let driven = join_codec(driver, "flac-decode-input").await;
        if let Some(tx) = format_tx.take() {
            let err = match driven {
                Err(err) => err,
                Ok(()) => FlacError::MissingStreamInfo,
            };
            let _ = tx.send(Err(err));
            return Err(FlacError::MissingStreamInfo);
        }
        write_result?;
        driven?;
        pcm_writer.shutdown().await?;
        Ok(())
    });

    let format = format_rx.await.map_err(|_| FlacError::ChannelClosed)??;
    let reader = ManagedAsyncReader::new("flac-decode-writer", pcm_reader, pump);
    Ok(FlacDecodedStream {
        format,
        shared,
        metadata,
        reader,
    })
}
