use std::{ffi::c_void, path::Path, slice};

use libflac_sys::*;

use super::{c_string, flac_bool, metadata::MetadataBlock, path_to_cstring};
use crate::{error::FlacError, options::DecoderOptions, read_bridge::{ReadBridge, ReadOutcome}};

/// Header fields of a decoded frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FrameHeader {
    pub block_size: u32,
    pub sample_rate: u32,
    pub channels: u32,
    pub bits_per_sample: u32,
}

/// Non-fatal problems reported through libFLAC's error callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum DecodeErrorKind {
    LostSync,
    BadHeader,
    FrameCrcMismatch,
    UnparseableStream,
    Other(u32),
}

impl DecodeErrorKind {
    fn from_raw(status: FLAC__StreamDecoderErrorStatus) -> Self {
        match status {
            FLAC__STREAM_DECODER_ERROR_STATUS_LOST_SYNC => DecodeErrorKind::LostSync,
            FLAC__STREAM_DECODER_ERROR_STATUS_BAD_HEADER => DecodeErrorKind::BadHeader,
            FLAC__STREAM_DECODER_ERROR_STATUS_FRAME_CRC_MISMATCH => {
                DecodeErrorKind::FrameCrcMismatch
            }
            FLAC__STREAM_DECODER_ERROR_STATUS_UNPARSEABLE_STREAM => {
                DecodeErrorKind::UnparseableStream
            }
            other => DecodeErrorKind::Other(other as u32),
        }
    }
}

/// libFLAC decoder state, as returned by `get_state`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct DecoderState(u32);

impl DecoderState {
    pub fn code(self) -> u32 {
        self.0
    }

    pub fn is_end_of_stream(self) -> bool {
        self.0 == FLAC__STREAM_DECODER_END_OF_STREAM as u32
    }

    /// States a decoder cannot continue from.
    pub fn is_failure(self) -> bool {
        [
            FLAC__STREAM_DECODER_OGG_ERROR,
            FLAC__STREAM_DECODER_SEEK_ERROR,
            FLAC__STREAM_DECODER_ABORTED,
            FLAC__STREAM_DECODER_MEMORY_ALLOCATION_ERROR,
            FLAC__STREAM_DECODER_UNINITIALIZED,
        ]
        .iter()
        .any(|&state| state as u32 == self.0)
    }
}

/// Receives what the decoder produces, in engine order.
pub(crate) trait DecodeHandler: Send {
    fn on_metadata(&mut self, block: MetadataBlock);
    /// Returns false to abort decoding.
    fn on_frame(&mut self, header: FrameHeader, channels: &[&[i32]]) -> bool;
    fn on_error(&mut self, kind: DecodeErrorKind);
}

struct DecoderClient<H> {
    bridge: Option<ReadBridge>,
    handler: H,
}

/// Owner of a `FLAC__StreamDecoder`.
///
/// Dropping the session finishes the decoder if that has not happened yet,
/// then deletes it; both happen exactly once.
pub(crate) struct DecoderSession<H: DecodeHandler> {
    ptr: *mut FLAC__StreamDecoder,
    client: Box<DecoderClient<H>>,
    finished: bool,
}

// The handle is only used by the thread that owns the session.
unsafe impl<H: DecodeHandler> Send for DecoderSession<H> {}

impl<H: DecodeHandler> DecoderSession<H> {
    /// Decoder reading pushed bytes through `bridge`.
    pub fn new_stream(
        options: &DecoderOptions,
        bridge: ReadBridge,
        handler: H,
    ) -> Result<Self, FlacError> {
        let mut session = Self::allocate(options, Some(bridge), handler)?;
        let client = session.client_data();
        let status = unsafe {
            if options.is_ogg {
                FLAC__stream_decoder_init_ogg_stream(
                    session.ptr,
                    Some(read_callback::<H>),
                    Some(seek_callback::<H>),
                    Some(tell_callback::<H>),
                    Some(length_callback::<H>),
                    Some(eof_callback::<H>),
                    Some(write_callback::<H>),
                    Some(metadata_callback::<H>),
                    Some(error_callback::<H>),
                    client,
                )
            } else {
                FLAC__stream_decoder_init_stream(
                    session.ptr,
                    Some(read_callback::<H>),
                    Some(seek_callback::<H>),
                    Some(tell_callback::<H>),
                    Some(length_callback::<H>),
                    Some(eof_callback::<H>),
                    Some(write_callback::<H>),
                    Some(metadata_callback::<H>),
                    Some(error_callback::<H>),
                    client,
                )
            }
        };
        session.check_init(status)?;
        Ok(session)
    }

    /// Decoder reading a file through libFLAC's own file entry point.
    pub fn new_file(options: &DecoderOptions, path: &Path, handler: H) -> Result<Self, FlacError> {
        let filename = path_to_cstring(path)?;
        let mut session = Self::allocate(options, None, handler)?;
        let client = session.client_data();
        let status = unsafe {
            if options.is_ogg {
                FLAC__stream_decoder_init_ogg_file(
                    session.ptr,
                    filename.as_ptr(),
                    Some(write_callback::<H>),
                    Some(metadata_callback::<H>),
                    Some(error_callback::<H>),
                    client,
                )
            } else {
                FLAC__stream_decoder_init_file(
                    session.ptr,
                    filename.as_ptr(),
                    Some(write_callback::<H>),
                    Some(metadata_callback::<H>),
                    Some(error_callback::<H>),
                    client,
                )
            }
        };
        session.check_init(status)?;
        Ok(session)
    }

    fn allocate(
        options: &DecoderOptions,
        bridge: Option<ReadBridge>,
        handler: H,
    ) -> Result<Self, FlacError> {
        let ptr = unsafe { FLAC__stream_decoder_new() };
        if ptr.is_null() {
            return Err(FlacError::Init {
                status: FLAC__STREAM_DECODER_INIT_STATUS_MEMORY_ALLOCATION_ERROR as u32,
                message: "FLAC__stream_decoder_new returned null".into(),
            });
        }
        let session = Self {
            ptr,
            client: Box::new(DecoderClient { bridge, handler }),
            finished: false,
        };

        let ensure = |ok: FLAC__bool, what: &str| {
            if ok == 0 {
                Err(FlacError::InvalidOption(format!("{what} rejected by libFLAC")))
            } else {
                Ok(())
            }
        };

        unsafe {
            ensure(
                FLAC__stream_decoder_set_md5_checking(ptr, flac_bool(options.md5_checking)),
                "md5_checking",
            )?;
            if let Some(serial) = options.ogg_serial_number {
                ensure(
                    FLAC__stream_decoder_set_ogg_serial_number(ptr, serial as _),
                    "ogg_serial_number",
                )?;
            }
            match &options.metadata {
                crate::options::MetadataRequest::None => {}
                crate::options::MetadataRequest::All => {
                    ensure(FLAC__stream_decoder_set_metadata_respond_all(ptr), "metadata")?;
                }
                crate::options::MetadataRequest::Only(kinds) => {
                    for kind in kinds {
                        ensure(
                            FLAC__stream_decoder_set_metadata_respond(ptr, kind.to_raw()),
                            "metadata",
                        )?;
                    }
                }
            }
        }
        Ok(session)
    }

    fn client_data(&mut self) -> *mut c_void {
        &mut *self.client as *mut DecoderClient<H> as *mut c_void
    }

    fn check_init(&mut self, status: FLAC__StreamDecoderInitStatus) -> Result<(), FlacError> {
        if status == FLAC__STREAM_DECODER_INIT_STATUS_OK {
            return Ok(());
        }
        // Nothing to finish: the decoder never left the uninitialized state.
        self.finished = true;
        Err(FlacError::Init {
            status: status as u32,
            message: init_status_message(status).into(),
        })
    }

    pub fn process_single(&mut self) -> bool {
        unsafe { FLAC__stream_decoder_process_single(self.ptr) != 0 }
    }

    pub fn process_until_end_of_metadata(&mut self) -> bool {
        unsafe { FLAC__stream_decoder_process_until_end_of_metadata(self.ptr) != 0 }
    }

    pub fn flush(&mut self) -> bool {
        unsafe { FLAC__stream_decoder_flush(self.ptr) != 0 }
    }

    /// Finishes the decoder. Later calls return true without touching libFLAC.
    ///
    /// Returns false when MD5 checking was on and the signature did not match.
    pub fn finish(&mut self) -> bool {
        if self.finished {
            return true;
        }
        self.finished = true;
        unsafe { FLAC__stream_decoder_finish(self.ptr) != 0 }
    }

    pub fn state(&self) -> DecoderState {
        DecoderState(unsafe { FLAC__stream_decoder_get_state(self.ptr) } as u32)
    }

    pub fn resolved_state_string(&self) -> String {
        c_string(unsafe { FLAC__stream_decoder_get_resolved_state_string(self.ptr) })
    }

    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.client.handler
    }
}

impl<H: DecodeHandler> Drop for DecoderSession<H> {
    fn drop(&mut self) {
        if self.ptr.is_null() {
            return;
        }
        unsafe {
            if !self.finished {
                FLAC__stream_decoder_finish(self.ptr);
            }
            FLAC__stream_decoder_delete(self.ptr);
        }
        self.ptr = std::ptr::null_mut();
    }
}

fn init_status_message(status: FLAC__StreamDecoderInitStatus) -> &'static str {
    match status {
        FLAC__STREAM_DECODER_INIT_STATUS_UNSUPPORTED_CONTAINER => {
            "container not supported by this libFLAC build"
        }
        FLAC__STREAM_DECODER_INIT_STATUS_INVALID_CALLBACKS => "required callback missing",
        FLAC__STREAM_DECODER_INIT_STATUS_MEMORY_ALLOCATION_ERROR => "memory allocation failed",
        FLAC__STREAM_DECODER_INIT_STATUS_ERROR_OPENING_FILE => "could not open the file",
        FLAC__STREAM_DECODER_INIT_STATUS_ALREADY_INITIALIZED => "decoder already initialized",
        _ => "unknown initialization status",
    }
}

unsafe fn client<'a, H>(client_data: *mut c_void) -> &'a mut DecoderClient<H> {
    unsafe { &mut *(client_data as *mut DecoderClient<H>) }
}

unsafe extern "C" fn read_callback<H: DecodeHandler>(
    _decoder: *const FLAC__StreamDecoder,
    buffer: *mut FLAC__byte,
    bytes: *mut usize,
    client_data: *mut c_void,
) -> FLAC__StreamDecoderReadStatus {
    let client = unsafe { client::<H>(client_data) };
    let Some(bridge) = client.bridge.as_mut() else {
        unsafe { *bytes = 0 };
        return FLAC__STREAM_DECODER_READ_STATUS_ABORT;
    };
    let wanted = unsafe { *bytes };
    let buf = unsafe { slice::from_raw_parts_mut(buffer, wanted) };
    let (read, status) = match bridge.read(buf) {
        ReadOutcome::Bytes(n) if n > 0 => (n, FLAC__STREAM_DECODER_READ_STATUS_CONTINUE),
        ReadOutcome::Bytes(_) | ReadOutcome::EndOfStream => {
            (0, FLAC__STREAM_DECODER_READ_STATUS_END_OF_STREAM)
        }
        ReadOutcome::Abort => (0, FLAC__STREAM_DECODER_READ_STATUS_ABORT),
    };
    unsafe { *bytes = read };
    status
}

unsafe extern "C" fn seek_callback<H: DecodeHandler>(
    _decoder: *const FLAC__StreamDecoder,
    _absolute_byte_offset: FLAC__uint64,
    _client_data: *mut c_void,
) -> FLAC__StreamDecoderSeekStatus {
    FLAC__STREAM_DECODER_SEEK_STATUS_UNSUPPORTED
}

unsafe extern "C" fn tell_callback<H: DecodeHandler>(
    _decoder: *const FLAC__StreamDecoder,
    absolute_byte_offset: *mut FLAC__uint64,
    client_data: *mut c_void,
) -> FLAC__StreamDecoderTellStatus {
    let client = unsafe { client::<H>(client_data) };
    match client.bridge.as_ref() {
        Some(bridge) => {
            unsafe { *absolute_byte_offset = bridge.position() };
            FLAC__STREAM_DECODER_TELL_STATUS_OK
        }
        None => FLAC__STREAM_DECODER_TELL_STATUS_UNSUPPORTED,
    }
}

unsafe extern "C" fn length_callback<H: DecodeHandler>(
    _decoder: *const FLAC__StreamDecoder,
    _stream_length: *mut FLAC__uint64,
    _client_data: *mut c_void,
) -> FLAC__StreamDecoderLengthStatus {
    FLAC__STREAM_DECODER_LENGTH_STATUS_UNSUPPORTED
}

unsafe extern "C" fn eof_callback<H: DecodeHandler>(
    _decoder: *const FLAC__StreamDecoder,
    client_data: *mut c_void,
) -> FLAC__bool {
    let client = unsafe { client::<H>(client_data) };
    flac_bool(client.bridge.as_ref().is_none_or(ReadBridge::is_eof))
}

unsafe extern "C" fn write_callback<H: DecodeHandler>(
    _decoder: *const FLAC__StreamDecoder,
    frame: *const FLAC__Frame,
    buffer: *const *const FLAC__int32,
    client_data: *mut c_void,
) -> FLAC__StreamDecoderWriteStatus {
    let client = unsafe { client::<H>(client_data) };
    let raw = unsafe { &(*frame).header };
    let header = FrameHeader {
        block_size: raw.blocksize,
        sample_rate: raw.sample_rate,
        channels: raw.channels,
        bits_per_sample: raw.bits_per_sample,
    };
    let block = header.block_size as usize;
    let channels: Vec<&[i32]> = (0..header.channels as usize)
        .map(|ch| unsafe { slice::from_raw_parts(*buffer.add(ch), block) })
        .collect();

    if client.handler.on_frame(header, &channels) {
        FLAC__STREAM_DECODER_WRITE_STATUS_CONTINUE
    } else {
        FLAC__STREAM_DECODER_WRITE_STATUS_ABORT
    }
}

unsafe extern "C" fn metadata_callback<H: DecodeHandler>(
    _decoder: *const FLAC__StreamDecoder,
    metadata: *const FLAC__StreamMetadata,
    client_data: *mut c_void,
) {
    let client = unsafe { client::<H>(client_data) };
    let block = unsafe { MetadataBlock::from_raw(metadata) };
    client.handler.on_metadata(block);
}

unsafe extern "C" fn error_callback<H: DecodeHandler>(
    _decoder: *const FLAC__StreamDecoder,
    status: FLAC__StreamDecoderErrorStatus,
    client_data: *mut c_void,
) {
    let client = unsafe { client::<H>(client_data) };
    client.handler.on_error(DecodeErrorKind::from_raw(status));
}
