//! Session configuration.
//!
//! Options are plain structs with documented defaults. They are validated
//! eagerly, before any libFLAC object is built, and can be loaded from YAML
//! (missing keys fall back to the defaults):
//!
//! ```
//! use pmoflacstream::EncoderOptions;
//!
//! let options = EncoderOptions::from_yaml_str(
//!     "channels: 1\nbits_per_sample: 24\nsample_rate: 48000\ncompression_level: 8\n",
//! )
//! .unwrap();
//! assert_eq!(options.format.channels, 1);
//! assert_eq!(options.compression_level, Some(8));
//! ```

use serde::Deserialize;

use crate::{
    codec::metadata::{MetadataBlock, MetadataKind},
    error::FlacError,
    pcm::PcmFormat,
};

/// Bound of the channels between the codec thread and the consumer.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 8;

/// Default multiplier of the "almost empty" input policy.
pub const DEFAULT_PREFETCH_FACTOR: usize = 2;

/// Which metadata blocks the decoder reports as events.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetadataRequest {
    /// Only the stream facts derived from STREAMINFO.
    #[default]
    None,
    All,
    Only(Vec<MetadataKind>),
}

impl MetadataRequest {
    pub fn wants(&self, kind: MetadataKind) -> bool {
        match self {
            MetadataRequest::None => false,
            MetadataRequest::All => true,
            MetadataRequest::Only(kinds) => kinds.contains(&kind),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DecoderOptions {
    /// Read Ogg FLAC instead of native FLAC. Default: false.
    pub is_ogg: bool,
    /// Emit 32-bit PCM whatever the stream bit depth. Default: false.
    pub output_as_32: bool,
    /// Check the decoded audio against the STREAMINFO MD5. Default: false.
    pub md5_checking: bool,
    /// Metadata blocks forwarded as events. Default: none.
    pub metadata: MetadataRequest,
    /// Ogg logical stream to decode; first one found when unset.
    pub ogg_serial_number: Option<i64>,
    /// Multiplier of the almost-empty input policy, >= 1. Default: 2.
    pub prefetch_factor: usize,
    /// Capacity of the event channel, >= 1. Default: 8.
    pub channel_capacity: usize,
}

impl Default for DecoderOptions {
    fn default() -> Self {
        Self {
            is_ogg: false,
            output_as_32: false,
            md5_checking: false,
            metadata: MetadataRequest::None,
            ogg_serial_number: None,
            prefetch_factor: DEFAULT_PREFETCH_FACTOR,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

impl DecoderOptions {
    pub fn from_yaml_str(yaml: &str) -> Result<Self, FlacError> {
        let options: Self = serde_yaml::from_str(yaml)?;
        options.validate()?;
        Ok(options)
    }

    pub fn validate(&self) -> Result<(), FlacError> {
        if self.prefetch_factor == 0 {
            return Err(FlacError::InvalidOption(
                "prefetch_factor must be at least 1".into(),
            ));
        }
        if self.channel_capacity == 0 {
            return Err(FlacError::InvalidOption(
                "channel_capacity must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Fine-grained encoder settings. Every field left unset keeps the libFLAC
/// default; setting any of them excludes `compression_level`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct EncoderTuning {
    pub block_size: Option<u32>,
    pub do_mid_side_stereo: Option<bool>,
    pub loose_mid_side_stereo: Option<bool>,
    pub apodization: Option<String>,
    pub max_lpc_order: Option<u32>,
    pub qlp_coeff_precision: Option<u32>,
    pub do_qlp_coeff_prec_search: Option<bool>,
    pub do_exhaustive_model_search: Option<bool>,
    pub min_residual_partition_order: Option<u32>,
    pub max_residual_partition_order: Option<u32>,
}

impl EncoderTuning {
    pub fn is_empty(&self) -> bool {
        *self == EncoderTuning::default()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EncoderOptions {
    /// Write Ogg FLAC instead of native FLAC. Default: false.
    pub is_ogg: bool,
    /// Channels (1..=8), bit depth (4..=32) and sample rate. Default:
    /// 2 channels, 16 bits, 44100 Hz.
    #[serde(flatten)]
    pub format: PcmFormat,
    /// Input PCM uses 32-bit samples whatever the bit depth. Default: false.
    pub input_as_32: bool,
    /// libFLAC preset 0..=8; libFLAC default (5) when unset.
    pub compression_level: Option<u32>,
    pub tuning: EncoderTuning,
    /// Decode each frame again and compare. Default: false.
    pub verify: bool,
    /// Length hint written to STREAMINFO when the output cannot be rewound.
    pub total_samples_estimate: Option<u64>,
    pub ogg_serial_number: Option<i64>,
    /// Blocks written before the audio frames.
    pub metadata: Vec<MetadataBlock>,
    /// Capacity of the PCM and output channels, >= 1. Default: 8.
    pub channel_capacity: usize,
}

impl Default for EncoderOptions {
    fn default() -> Self {
        Self {
            is_ogg: false,
            format: PcmFormat::default(),
            input_as_32: false,
            compression_level: None,
            tuning: EncoderTuning::default(),
            verify: false,
            total_samples_estimate: None,
            ogg_serial_number: None,
            metadata: Vec::new(),
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

impl EncoderOptions {
    pub fn from_yaml_str(yaml: &str) -> Result<Self, FlacError> {
        let options: Self = serde_yaml::from_str(yaml)?;
        options.validate()?;
        Ok(options)
    }

    pub fn with_format(format: PcmFormat) -> Self {
        Self {
            format,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), FlacError> {
        self.format
            .validate()
            .map_err(|msg| FlacError::InvalidOption(format!("invalid PCM format: {msg}")))?;

        if let Some(level) = self.compression_level {
            if level > 8 {
                return Err(FlacError::InvalidOption(
                    "compression level must be in 0..=8".into(),
                ));
            }
            if !self.tuning.is_empty() {
                return Err(FlacError::InvalidOption(
                    "compression_level cannot be combined with tuning options".into(),
                ));
            }
        }

        if let Some(apodization) = &self.tuning.apodization {
            if apodization.is_empty() || apodization.contains('\0') {
                return Err(FlacError::InvalidOption(
                    "apodization must be a non-empty string without NUL bytes".into(),
                ));
            }
        }

        for block in &self.metadata {
            if !matches!(
                block.kind(),
                MetadataKind::Padding | MetadataKind::Application | MetadataKind::VorbisComment
            ) {
                return Err(FlacError::InvalidOption(format!(
                    "{:?} blocks cannot be written by the encoder",
                    block.kind()
                )));
            }
        }

        if self.channel_capacity == 0 {
            return Err(FlacError::InvalidOption(
                "channel_capacity must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Width of one input sample in bytes.
    pub fn pcm_bytes_per_sample(&self) -> usize {
        if self.input_as_32 {
            4
        } else {
            self.format.bytes_per_sample()
        }
    }

    /// Width of one interleaved input sample-frame in bytes.
    pub fn pcm_bytes_per_frame(&self) -> usize {
        self.pcm_bytes_per_sample() * self.format.channels as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compression_level_excludes_tuning() {
        let mut options = EncoderOptions {
            compression_level: Some(5),
            ..Default::default()
        };
        assert!(options.validate().is_ok());
        options.tuning.block_size = Some(1152);
        assert!(matches!(
            options.validate(),
            Err(FlacError::InvalidOption(_))
        ));
        options.compression_level = None;
        assert!(options.validate().is_ok());
    }

    #[test]
    fn rejects_out_of_range_values() {
        let options = EncoderOptions {
            compression_level: Some(9),
            ..Default::default()
        };
        assert!(options.validate().is_err());

        let options = EncoderOptions::with_format(PcmFormat {
            sample_rate: 44_100,
            channels: 9,
            bits_per_sample: 16,
        });
        assert!(options.validate().is_err());

        let options = DecoderOptions {
            prefetch_factor: 0,
            ..Default::default()
        };
        assert!(options.validate().is_err());
    }

    #[test]
    fn loads_decoder_options_from_yaml() {
        let options = DecoderOptions::from_yaml_str(
            "output_as_32: true\nmetadata:\n  only: [vorbis_comment, picture]\n",
        )
        .unwrap();
        assert!(options.output_as_32);
        assert!(options.metadata.wants(MetadataKind::VorbisComment));
        assert!(!options.metadata.wants(MetadataKind::Padding));
        assert_eq!(options.prefetch_factor, DEFAULT_PREFETCH_FACTOR);
    }

    #[test]
    fn loads_encoder_metadata_from_yaml() {
        let yaml = r#"
channels: 1
bits_per_sample: 8
sample_rate: 8000
input_as_32: true
tuning:
  block_size: 1152
  apodization: "tukey(0.5)"
metadata:
  - type: vorbis_comment
    comments: [["TITLE", "Demo"]]
  - type: padding
    length: 64
"#;
        let options = EncoderOptions::from_yaml_str(yaml).unwrap();
        assert_eq!(options.format.channels, 1);
        assert_eq!(options.pcm_bytes_per_frame(), 4);
        assert_eq!(options.tuning.block_size, Some(1152));
        assert_eq!(options.metadata.len(), 2);
        assert_eq!(options.metadata[1], MetadataBlock::Padding { length: 64 });
    }

    #[test]
    fn yaml_errors_are_invalid_options() {
        let err = EncoderOptions::from_yaml_str("channels: many").unwrap_err();
        assert!(matches!(err, FlacError::InvalidOption(_)));
    }
}
