use std::cmp;

use serde::{Deserialize, Serialize};

/// Stream facts announced once per session, after the codec's first
/// structural-info callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StreamFormat {
    pub channels: u8,
    pub bits_per_sample: u8,
    pub sample_rate: u32,
    pub total_samples: Option<u64>,
    /// True when PCM is exchanged as 32-bit samples regardless of the codec
    /// bit depth.
    pub is_32bit: bool,
}

impl StreamFormat {
    /// Width in bytes of one PCM sample on the application side.
    pub fn pcm_bytes_per_sample(&self) -> usize {
        if self.is_32bit {
            4
        } else {
            bytes_per_sample(self.bits_per_sample)
        }
    }

    /// Width in bytes of one interleaved sample-frame on the application side.
    pub fn pcm_bytes_per_frame(&self) -> usize {
        self.pcm_bytes_per_sample() * self.channels as usize
    }
}

/// Basic PCM layout used when encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PcmFormat {
    pub sample_rate: u32,
    pub channels: u8,
    pub bits_per_sample: u8,
}

impl Default for PcmFormat {
    fn default() -> Self {
        Self {
            sample_rate: 44_100,
            channels: 2,
            bits_per_sample: 16,
        }
    }
}

impl PcmFormat {
    pub fn validate(&self) -> Result<(), String> {
        if self.channels == 0 {
            return Err("channel count must be greater than 0".into());
        }
        if self.channels > 8 {
            return Err("channel count greater than 8 is unsupported".into());
        }
        if self.sample_rate == 0 {
            return Err("sample rate must be greater than 0".into());
        }
        if self.sample_rate > MAX_SAMPLE_RATE {
            return Err(format!("sample rate must be at most {MAX_SAMPLE_RATE} Hz"));
        }
        if !(4..=32).contains(&self.bits_per_sample) {
            return Err("bits per sample must be in 4..=32".into());
        }
        Ok(())
    }

    pub fn bytes_per_sample(&self) -> usize {
        bytes_per_sample(self.bits_per_sample)
    }
}

/// Interleaved samples handed to the encoder thread.
#[derive(Debug)]
pub(crate) struct PcmChunk {
    pub data: Vec<i32>,
    pub frames: u32,
}

impl PcmChunk {
    pub fn new(data: Vec<i32>, channels: u8) -> Self {
        let frames = (data.len() / channels.max(1) as usize) as u32;
        debug_assert_eq!(data.len(), frames as usize * channels as usize);
        Self { data, frames }
    }
}

/// Highest sample rate a FLAC frame header can carry.
pub const MAX_SAMPLE_RATE: u32 = 655_350;

pub(crate) fn bytes_per_sample(bits_per_sample: u8) -> usize {
    cmp::max(1, (bits_per_sample as usize).div_ceil(8))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_width_rounds_up() {
        assert_eq!(bytes_per_sample(4), 1);
        assert_eq!(bytes_per_sample(12), 2);
        assert_eq!(bytes_per_sample(20), 3);
        assert_eq!(bytes_per_sample(32), 4);
    }

    #[test]
    fn rejects_out_of_range_format() {
        let mut format = PcmFormat::default();
        assert!(format.validate().is_ok());
        format.channels = 9;
        assert!(format.validate().is_err());
        format.channels = 2;
        format.bits_per_sample = 3;
        assert!(format.validate().is_err());
        format.bits_per_sample = 16;
        format.sample_rate = 0;
        assert!(format.validate().is_err());
    }

    #[test]
    fn pcm_width_honours_32bit_flag() {
        let format = StreamFormat {
            channels: 2,
            bits_per_sample: 24,
            sample_rate: 48_000,
            total_samples: None,
            is_32bit: true,
        };
        assert_eq!(format.pcm_bytes_per_frame(), 8);
        let narrow = StreamFormat {
            is_32bit: false,
            ..format
        };
        assert_eq!(narrow.pcm_bytes_per_frame(), 6);
    }
}
