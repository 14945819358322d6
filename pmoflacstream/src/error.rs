use std::io;

/// Errors surfaced by the streaming sessions.
#[derive(thiserror::Error, Debug)]
pub enum FlacError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid option: {0}")]
    InvalidOption(String),
    #[error("libFLAC initialization failed ({status}): {message}")]
    Init { status: u32, message: String },
    #[error("libFLAC processing failed (state {state}): {message}")]
    Process { state: u32, message: String },
    #[error(transparent)]
    Convert(#[from] ConvertError),
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("session destroyed: {0}")]
    Destroyed(String),
    #[error("stream ended before any stream information was decoded")]
    MissingStreamInfo,
    #[error("internal channel closed unexpectedly")]
    ChannelClosed,
    #[error("{role} task failed: {details}")]
    TaskJoin { role: &'static str, details: String },
}

/// Input-contract violations reported by the sample format converter.
///
/// These are synchronous rejections: the converter never produces partial
/// output when it returns one of them.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ConvertError {
    #[error("unsupported sample width: {0} bytes (expected 1..=4)")]
    UnsupportedWidth(usize),
    #[error("sample count must be greater than 0")]
    ZeroSamples,
    #[error("channel count must be greater than 0")]
    NoChannels,
    #[error("buffer holds {actual} bytes, {needed} required")]
    BufferTooShort { needed: usize, actual: usize },
}

impl From<serde_yaml::Error> for FlacError {
    fn from(err: serde_yaml::Error) -> Self {
        FlacError::InvalidOption(err.to_string())
    }
}
