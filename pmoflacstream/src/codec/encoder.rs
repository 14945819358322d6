use std::{
    ffi::{CString, c_void},
    path::Path,
    slice,
};

use libflac_sys::*;

use super::{
    c_string, flac_bool,
    metadata::{MetadataBlock, OwnedMetadata, StreamInfo},
    path_to_cstring,
};
use crate::{error::FlacError, options::EncoderOptions};

/// Where the encoded bytes go.
pub(crate) enum EncoderTarget<'a> {
    /// Every byte comes back through [`EncodeHandler::on_write`].
    Stream,
    /// libFLAC writes the file itself and rewrites STREAMINFO on finish.
    File(&'a Path),
}

/// libFLAC encoder state, as returned by `get_state`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct EncoderState(u32);

impl EncoderState {
    pub fn code(self) -> u32 {
        self.0
    }

    pub fn is_verify_failure(self) -> bool {
        self.0 == FLAC__STREAM_ENCODER_VERIFY_MISMATCH_IN_AUDIO_DATA as u32
            || self.0 == FLAC__STREAM_ENCODER_VERIFY_DECODER_ERROR as u32
    }
}

pub(crate) trait EncodeHandler: Send {
    /// Returns false to make libFLAC fail the current call.
    fn on_write(&mut self, bytes: &[u8], samples: u32, current_frame: u32) -> bool;

    /// Final STREAMINFO, reported once when a stream encoder finishes.
    fn on_stream_info(&mut self, _info: StreamInfo) {}

    /// Progress of a file encoder.
    fn on_progress(&mut self, _bytes_written: u64, _samples_written: u64) {}
}

struct EncoderClient<H> {
    handler: H,
}

/// Owner of a `FLAC__StreamEncoder` and of the metadata objects it points to.
pub(crate) struct EncoderSession<H: EncodeHandler> {
    ptr: *mut FLAC__StreamEncoder,
    client: Box<EncoderClient<H>>,
    // Must outlive the encoder: libFLAC keeps the pointers until finish.
    _metadata: Vec<OwnedMetadata>,
    _apodization: Option<CString>,
    finished: bool,
}

// The handle is only used by the thread that owns the session.
unsafe impl<H: EncodeHandler> Send for EncoderSession<H> {}

impl<H: EncodeHandler> EncoderSession<H> {
    pub fn new(
        options: &EncoderOptions,
        target: EncoderTarget<'_>,
        handler: H,
    ) -> Result<Self, FlacError> {
        options.validate()?;

        let ptr = unsafe { FLAC__stream_encoder_new() };
        if ptr.is_null() {
            return Err(FlacError::Init {
                status: FLAC__STREAM_ENCODER_INIT_STATUS_ENCODER_ERROR as u32,
                message: "FLAC__stream_encoder_new returned null".into(),
            });
        }

        let mut session = Self {
            ptr,
            client: Box::new(EncoderClient { handler }),
            _metadata: Vec::new(),
            _apodization: None,
            finished: true,
        };
        session.configure(options)?;

        let client = &mut *session.client as *mut EncoderClient<H> as *mut c_void;
        let status = match target {
            EncoderTarget::Stream => unsafe {
                if options.is_ogg {
                    FLAC__stream_encoder_init_ogg_stream(
                        ptr,
                        None,
                        Some(write_callback::<H>),
                        None,
                        None,
                        Some(metadata_callback::<H>),
                        client,
                    )
                } else {
                    FLAC__stream_encoder_init_stream(
                        ptr,
                        Some(write_callback::<H>),
                        None,
                        None,
                        Some(metadata_callback::<H>),
                        client,
                    )
                }
            },
            EncoderTarget::File(path) => {
                let filename = path_to_cstring(path)?;
                unsafe {
                    if options.is_ogg {
                        FLAC__stream_encoder_init_ogg_file(
                            ptr,
                            filename.as_ptr(),
                            Some(progress_callback::<H>),
                            client,
                        )
                    } else {
                        FLAC__stream_encoder_init_file(
                            ptr,
                            filename.as_ptr(),
                            Some(progress_callback::<H>),
                            client,
                        )
                    }
                }
            }
        };

        if status != FLAC__STREAM_ENCODER_INIT_STATUS_OK {
            let mut message = init_status_message(status).to_string();
            if status == FLAC__STREAM_ENCODER_INIT_STATUS_ENCODER_ERROR {
                message = format!("{message}: {}", session.resolved_state_string());
            }
            return Err(FlacError::Init {
                status: status as u32,
                message,
            });
        }
        session.finished = false;
        Ok(session)
    }

    fn configure(&mut self, options: &EncoderOptions) -> Result<(), FlacError> {
        let ptr = self.ptr;
        let ensure = |ok: FLAC__bool, what: &str| {
            if ok == 0 {
                Err(FlacError::InvalidOption(format!("{what} rejected by libFLAC")))
            } else {
                Ok(())
            }
        };
        let format = options.format;

        unsafe {
            ensure(
                FLAC__stream_encoder_set_channels(ptr, format.channels as u32),
                "channels",
            )?;
            ensure(
                FLAC__stream_encoder_set_bits_per_sample(ptr, format.bits_per_sample as u32),
                "bits_per_sample",
            )?;
            ensure(
                FLAC__stream_encoder_set_sample_rate(ptr, format.sample_rate),
                "sample_rate",
            )?;
            // Subset streams stop at 24 bits and 4608-sample blocks.
            let subset = format.bits_per_sample <= 24
                && options.tuning.block_size.is_none_or(|size| size <= 4608);
            ensure(
                FLAC__stream_encoder_set_streamable_subset(ptr, flac_bool(subset)),
                "streamable_subset",
            )?;
            ensure(
                FLAC__stream_encoder_set_verify(ptr, flac_bool(options.verify)),
                "verify",
            )?;
            if let Some(level) = options.compression_level {
                ensure(
                    FLAC__stream_encoder_set_compression_level(ptr, level),
                    "compression_level",
                )?;
            }
            if let Some(total) = options.total_samples_estimate {
                ensure(
                    FLAC__stream_encoder_set_total_samples_estimate(ptr, total),
                    "total_samples_estimate",
                )?;
            }
            if let Some(serial) = options.ogg_serial_number {
                ensure(
                    FLAC__stream_encoder_set_ogg_serial_number(ptr, serial as _),
                    "ogg_serial_number",
                )?;
            }

            let tuning = &options.tuning;
            if let Some(size) = tuning.block_size {
                ensure(FLAC__stream_encoder_set_blocksize(ptr, size), "block_size")?;
            }
            if let Some(value) = tuning.do_mid_side_stereo {
                ensure(
                    FLAC__stream_encoder_set_do_mid_side_stereo(ptr, flac_bool(value)),
                    "do_mid_side_stereo",
                )?;
            }
            if let Some(value) = tuning.loose_mid_side_stereo {
                ensure(
                    FLAC__stream_encoder_set_loose_mid_side_stereo(ptr, flac_bool(value)),
                    "loose_mid_side_stereo",
                )?;
            }
            if let Some(apodization) = &tuning.apodization {
                let spec = CString::new(apodization.as_str()).map_err(|_| {
                    FlacError::InvalidOption("apodization contains a NUL byte".into())
                })?;
                ensure(
                    FLAC__stream_encoder_set_apodization(ptr, spec.as_ptr()),
                    "apodization",
                )?;
                self._apodization = Some(spec);
            }
            if let Some(order) = tuning.max_lpc_order {
                ensure(
                    FLAC__stream_encoder_set_max_lpc_order(ptr, order),
                    "max_lpc_order",
                )?;
            }
            if let Some(precision) = tuning.qlp_coeff_precision {
                ensure(
                    FLAC__stream_encoder_set_qlp_coeff_precision(ptr, precision),
                    "qlp_coeff_precision",
                )?;
            }
            if let Some(value) = tuning.do_qlp_coeff_prec_search {
                ensure(
                    FLAC__stream_encoder_set_do_qlp_coeff_prec_search(ptr, flac_bool(value)),
                    "do_qlp_coeff_prec_search",
                )?;
            }
            if let Some(value) = tuning.do_exhaustive_model_search {
                ensure(
                    FLAC__stream_encoder_set_do_exhaustive_model_search(ptr, flac_bool(value)),
                    "do_exhaustive_model_search",
                )?;
            }
            if let Some(order) = tuning.min_residual_partition_order {
                ensure(
                    FLAC__stream_encoder_set_min_residual_partition_order(ptr, order),
                    "min_residual_partition_order",
                )?;
            }
            if let Some(order) = tuning.max_residual_partition_order {
                ensure(
                    FLAC__stream_encoder_set_max_residual_partition_order(ptr, order),
                    "max_residual_partition_order",
                )?;
            }
        }

        if !options.metadata.is_empty() {
            let owned = options
                .metadata
                .iter()
                .map(MetadataBlock::to_raw)
                .collect::<Result<Vec<_>, _>>()?;
            let mut pointers: Vec<*mut FLAC__StreamMetadata> =
                owned.iter().map(OwnedMetadata::as_ptr).collect();
            // libFLAC copies the pointer array but not the blocks.
            let ok = unsafe {
                FLAC__stream_encoder_set_metadata(ptr, pointers.as_mut_ptr(), pointers.len() as u32)
            };
            ensure(ok, "metadata")?;
            self._metadata = owned;
        }
        Ok(())
    }

    /// Feeds `frames` interleaved sample-frames.
    pub fn process_interleaved(&mut self, samples: &[i32], frames: u32) -> bool {
        unsafe { FLAC__stream_encoder_process_interleaved(self.ptr, samples.as_ptr(), frames) != 0 }
    }

    /// Feeds one buffer per channel, `frames` samples each.
    pub fn process(&mut self, channels: &[&[i32]], frames: u32) -> bool {
        if channels.iter().any(|channel| channel.len() < frames as usize) {
            return false;
        }
        let pointers: Vec<*const i32> = channels.iter().map(|channel| channel.as_ptr()).collect();
        unsafe { FLAC__stream_encoder_process(self.ptr, pointers.as_ptr(), frames) != 0 }
    }

    /// Flushes the last frame and finalizes the stream. Later calls return
    /// true without touching libFLAC.
    pub fn finish(&mut self) -> bool {
        if self.finished {
            return true;
        }
        self.finished = true;
        unsafe { FLAC__stream_encoder_finish(self.ptr) != 0 }
    }

    pub fn state(&self) -> EncoderState {
        EncoderState(unsafe { FLAC__stream_encoder_get_state(self.ptr) } as u32)
    }

    pub fn resolved_state_string(&self) -> String {
        c_string(unsafe { FLAC__stream_encoder_get_resolved_state_string(self.ptr) })
    }

    pub fn handler(&self) -> &H {
        &self.client.handler
    }

    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.client.handler
    }
}

impl<H: EncodeHandler> Drop for EncoderSession<H> {
    fn drop(&mut self) {
        if self.ptr.is_null() {
            return;
        }
        unsafe {
            if !self.finished {
                FLAC__stream_encoder_finish(self.ptr);
            }
            FLAC__stream_encoder_delete(self.ptr);
        }
        self.ptr = std::ptr::null_mut();
    }
}

fn init_status_message(status: FLAC__StreamEncoderInitStatus) -> &'static str {
    match status {
        FLAC__STREAM_ENCODER_INIT_STATUS_ENCODER_ERROR => "encoder error",
        FLAC__STREAM_ENCODER_INIT_STATUS_UNSUPPORTED_CONTAINER => {
            "container not supported by this libFLAC build"
        }
        FLAC__STREAM_ENCODER_INIT_STATUS_INVALID_CALLBACKS => "required callback missing",
        FLAC__STREAM_ENCODER_INIT_STATUS_INVALID_NUMBER_OF_CHANNELS => "invalid channel count",
        FLAC__STREAM_ENCODER_INIT_STATUS_INVALID_BITS_PER_SAMPLE => "invalid bits per sample",
        FLAC__STREAM_ENCODER_INIT_STATUS_INVALID_SAMPLE_RATE => "invalid sample rate",
        FLAC__STREAM_ENCODER_INIT_STATUS_INVALID_BLOCK_SIZE => "invalid block size",
        FLAC__STREAM_ENCODER_INIT_STATUS_INVALID_MAX_LPC_ORDER => "invalid max LPC order",
        FLAC__STREAM_ENCODER_INIT_STATUS_INVALID_QLP_COEFF_PRECISION => {
            "invalid QLP coefficient precision"
        }
        FLAC__STREAM_ENCODER_INIT_STATUS_BLOCK_SIZE_TOO_SMALL_FOR_LPC_ORDER => {
            "block size too small for the LPC order"
        }
        FLAC__STREAM_ENCODER_INIT_STATUS_NOT_STREAMABLE => "settings violate the streamable subset",
        FLAC__STREAM_ENCODER_INIT_STATUS_INVALID_METADATA => "invalid metadata",
        FLAC__STREAM_ENCODER_INIT_STATUS_ALREADY_INITIALIZED => "encoder already initialized",
        _ => "unknown initialization status",
    }
}

unsafe fn client<'a, H>(client_data: *mut c_void) -> &'a mut EncoderClient<H> {
    unsafe { &mut *(client_data as *mut EncoderClient<H>) }
}

unsafe extern "C" fn write_callback<H: EncodeHandler>(
    _encoder: *const FLAC__StreamEncoder,
    buffer: *const FLAC__byte,
    bytes: usize,
    samples: u32,
    current_frame: u32,
    client_data: *mut c_void,
) -> FLAC__StreamEncoderWriteStatus {
    let client = unsafe { client::<H>(client_data) };
    let data = if bytes == 0 {
        &[][..]
    } else {
        unsafe { slice::from_raw_parts(buffer, bytes) }
    };
    if client.handler.on_write(data, samples, current_frame) {
        FLAC__STREAM_ENCODER_WRITE_STATUS_OK
    } else {
        FLAC__STREAM_ENCODER_WRITE_STATUS_FATAL_ERROR
    }
}

unsafe extern "C" fn metadata_callback<H: EncodeHandler>(
    _encoder: *const FLAC__StreamEncoder,
    metadata: *const FLAC__StreamMetadata,
    client_data: *mut c_void,
) {
    let client = unsafe { client::<H>(client_data) };
    if let MetadataBlock::StreamInfo(info) = unsafe { MetadataBlock::from_raw(metadata) } {
        client.handler.on_stream_info(info);
    }
}

unsafe extern "C" fn progress_callback<H: EncodeHandler>(
    _encoder: *const FLAC__StreamEncoder,
    bytes_written: FLAC__uint64,
    samples_written: FLAC__uint64,
    _frames_written: u32,
    _total_frames_estimate: u32,
    client_data: *mut c_void,
) {
    let client = unsafe { client::<H>(client_data) };
    client.handler.on_progress(bytes_written, samples_written);
}
