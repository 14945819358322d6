//! Sample format conversion.
//!
//! PCM on the application side is little-endian signed integers, 1 to 4
//! bytes per sample. Widening sign-extends; narrowing keeps the low-order
//! bytes, so any value that fits the narrower width survives a round trip
//! through a wider one unchanged.
//!
//! All functions here are pure. The only stateful piece is [`CarryBuffer`],
//! which the encoder session owns.

use crate::error::ConvertError;

fn check_width(bytes_per_sample: usize) -> Result<(), ConvertError> {
    if (1..=4).contains(&bytes_per_sample) {
        Ok(())
    } else {
        Err(ConvertError::UnsupportedWidth(bytes_per_sample))
    }
}

fn check_len(actual: usize, needed: usize) -> Result<(), ConvertError> {
    if actual < needed {
        Err(ConvertError::BufferTooShort { needed, actual })
    } else {
        Ok(())
    }
}

#[inline]
fn read_sample(bytes: &[u8], width: usize) -> i32 {
    let mut value = 0i32;
    for (i, &byte) in bytes[..width].iter().enumerate() {
        value |= (byte as i32) << (8 * i);
    }
    if width < 4 {
        let shift = 32 - 8 * width as u32;
        value = (value << shift) >> shift;
    }
    value
}

#[inline]
fn write_sample(value: i32, width: usize, out: &mut Vec<u8>) {
    out.extend_from_slice(&value.to_le_bytes()[..width]);
}

/// Converts `samples` samples from `in_bps` to `out_bps` bytes per sample.
///
/// Input bytes past `samples × in_bps` are ignored, not buffered.
pub fn convert_sample_width(
    input: &[u8],
    in_bps: usize,
    out_bps: usize,
    samples: usize,
) -> Result<Vec<u8>, ConvertError> {
    check_width(in_bps)?;
    check_width(out_bps)?;
    if samples == 0 {
        return Err(ConvertError::ZeroSamples);
    }
    check_len(input.len(), samples * in_bps)?;

    if in_bps == out_bps {
        return Ok(input[..samples * in_bps].to_vec());
    }

    let mut out = Vec::with_capacity(samples * out_bps);
    for chunk in input.chunks_exact(in_bps).take(samples) {
        write_sample(read_sample(chunk, in_bps), out_bps, &mut out);
    }
    Ok(out)
}

/// Builds one interleaved buffer out of per-channel buffers.
pub fn interleave(
    channels: &[&[u8]],
    samples: usize,
    in_bps: usize,
    out_bps: usize,
) -> Result<Vec<u8>, ConvertError> {
    check_width(in_bps)?;
    check_width(out_bps)?;
    if channels.is_empty() {
        return Err(ConvertError::NoChannels);
    }
    if samples == 0 {
        return Err(ConvertError::ZeroSamples);
    }
    for channel in channels {
        check_len(channel.len(), samples * in_bps)?;
    }

    let mut out = Vec::with_capacity(samples * channels.len() * out_bps);
    for frame in 0..samples {
        let offset = frame * in_bps;
        for channel in channels {
            let value = read_sample(&channel[offset..offset + in_bps], in_bps);
            write_sample(value, out_bps, &mut out);
        }
    }
    Ok(out)
}

/// Splits an interleaved buffer into one buffer per channel.
pub fn deinterleave(
    buffer: &[u8],
    channels: usize,
    samples: usize,
    in_bps: usize,
    out_bps: usize,
) -> Result<Vec<Vec<u8>>, ConvertError> {
    check_width(in_bps)?;
    check_width(out_bps)?;
    if channels == 0 {
        return Err(ConvertError::NoChannels);
    }
    if samples == 0 {
        return Err(ConvertError::ZeroSamples);
    }
    check_len(buffer.len(), samples * channels * in_bps)?;

    let mut out: Vec<Vec<u8>> = (0..channels)
        .map(|_| Vec::with_capacity(samples * out_bps))
        .collect();
    let frame_bytes = channels * in_bps;
    for frame in buffer.chunks_exact(frame_bytes).take(samples) {
        for (channel, sample) in out.iter_mut().zip(frame.chunks_exact(in_bps)) {
            write_sample(read_sample(sample, in_bps), out_bps, channel);
        }
    }
    Ok(out)
}

/// Serialises 32-bit samples as little-endian integers of `bytes_per_sample` bytes.
pub fn i32_to_le_bytes(samples: &[i32], bytes_per_sample: usize, out: &mut Vec<u8>) {
    out.reserve(samples.len() * bytes_per_sample);
    for &sample in samples {
        write_sample(sample, bytes_per_sample, out);
    }
}

/// Reads little-endian integers of `bytes_per_sample` bytes as 32-bit samples.
pub fn le_bytes_to_i32(bytes: &[u8], bytes_per_sample: usize) -> Result<Vec<i32>, ConvertError> {
    check_width(bytes_per_sample)?;
    if bytes.len() % bytes_per_sample != 0 {
        let needed = bytes.len().div_ceil(bytes_per_sample) * bytes_per_sample;
        return Err(ConvertError::BufferTooShort {
            needed,
            actual: bytes.len(),
        });
    }
    Ok(bytes
        .chunks_exact(bytes_per_sample)
        .map(|chunk| read_sample(chunk, bytes_per_sample))
        .collect())
}

/// Holds the tail of an interleaved stream that does not yet form a whole
/// sample-frame.
#[derive(Debug)]
pub struct CarryBuffer {
    pending: Vec<u8>,
    frame_bytes: usize,
}

impl CarryBuffer {
    pub fn new(frame_bytes: usize) -> Self {
        Self {
            pending: Vec::new(),
            frame_bytes: frame_bytes.max(1),
        }
    }

    pub fn frame_bytes(&self) -> usize {
        self.frame_bytes
    }

    /// Number of bytes currently carried over.
    pub fn residual(&self) -> usize {
        self.pending.len()
    }

    /// Appends `input` after the carried bytes and returns every complete
    /// sample-frame, keeping the remainder for the next call.
    pub fn take_frames(&mut self, input: &[u8]) -> Option<Vec<u8>> {
        if self.pending.is_empty() && input.len() % self.frame_bytes == 0 {
            return (!input.is_empty()).then(|| input.to_vec());
        }

        self.pending.extend_from_slice(input);
        let whole = self.pending.len() / self.frame_bytes * self.frame_bytes;
        if whole == 0 {
            return None;
        }
        let rest = self.pending.split_off(whole);
        Some(std::mem::replace(&mut self.pending, rest))
    }

    /// Drops the carried bytes and returns how many there were.
    pub fn discard(&mut self) -> usize {
        let dropped = self.pending.len();
        self.pending.clear();
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(values: &[i32], width: usize) -> Vec<u8> {
        let mut out = Vec::new();
        i32_to_le_bytes(values, width, &mut out);
        out
    }

    #[test]
    fn widening_then_narrowing_is_identity() {
        let cases: [(usize, Vec<i32>); 3] = [
            (1, vec![0, 1, -1, 127, -128, 42]),
            (2, vec![0, 1, -1, 32_767, -32_768, -1234]),
            (3, vec![0, 1, -1, 8_388_607, -8_388_608, 65_536]),
        ];
        for (width, values) in cases {
            let original = encode(&values, width);
            let wide = convert_sample_width(&original, width, 4, values.len()).unwrap();
            assert_eq!(le_bytes_to_i32(&wide, 4).unwrap(), values);
            let back = convert_sample_width(&wide, 4, width, values.len()).unwrap();
            assert_eq!(back, original, "width {width}");
        }
    }

    #[test]
    fn converts_only_requested_samples() {
        let input = encode(&[1, 2, 3, 4], 2);
        let out = convert_sample_width(&input, 2, 4, 2).unwrap();
        assert_eq!(le_bytes_to_i32(&out, 4).unwrap(), vec![1, 2]);
    }

    #[test]
    fn rejects_contract_violations() {
        let input = [0u8; 8];
        assert_eq!(
            convert_sample_width(&input, 5, 2, 1),
            Err(ConvertError::UnsupportedWidth(5))
        );
        assert_eq!(
            convert_sample_width(&input, 2, 0, 1),
            Err(ConvertError::UnsupportedWidth(0))
        );
        assert_eq!(
            convert_sample_width(&input, 2, 4, 0),
            Err(ConvertError::ZeroSamples)
        );
        assert_eq!(
            convert_sample_width(&input, 4, 2, 3),
            Err(ConvertError::BufferTooShort {
                needed: 12,
                actual: 8
            })
        );
        assert_eq!(
            deinterleave(&input, 2, 2, 4, 4),
            Err(ConvertError::BufferTooShort {
                needed: 16,
                actual: 8
            })
        );
        assert_eq!(interleave(&[], 1, 2, 2), Err(ConvertError::NoChannels));
    }

    #[test]
    fn deinterleaves_24bit_into_sign_extended_32bit() {
        // Three stereo frames: (1, -1), (-8388608, 8388607), (-2, 300)
        let left = [1, -8_388_608, -2];
        let right = [-1, 8_388_607, 300];
        let mut interleaved = Vec::new();
        for i in 0..3 {
            i32_to_le_bytes(&[left[i], right[i]], 3, &mut interleaved);
        }
        assert_eq!(interleaved.len(), 18);

        let channels = deinterleave(&interleaved, 2, 3, 3, 4).unwrap();
        assert_eq!(channels.len(), 2);
        assert_eq!(le_bytes_to_i32(&channels[0], 4).unwrap(), left);
        assert_eq!(le_bytes_to_i32(&channels[1], 4).unwrap(), right);
        assert_eq!(&channels[0][4..8], &[0x00, 0x00, 0x80, 0xFF]);
    }

    #[test]
    fn interleave_inverts_deinterleave() {
        let interleaved = encode(&[10, -10, 20, -20, 30, -30], 2);
        let planar = deinterleave(&interleaved, 2, 3, 2, 2).unwrap();
        let refs: Vec<&[u8]> = planar.iter().map(Vec::as_slice).collect();
        assert_eq!(interleave(&refs, 3, 2, 2).unwrap(), interleaved);

        let widened = interleave(&refs, 3, 2, 4).unwrap();
        assert_eq!(
            le_bytes_to_i32(&widened, 4).unwrap(),
            vec![10, -10, 20, -20, 30, -30]
        );
    }

    #[test]
    fn carry_buffer_keeps_partial_frames() {
        let mut carry = CarryBuffer::new(4);
        assert_eq!(carry.take_frames(&[1, 2, 3]), None);
        assert_eq!(carry.residual(), 3);
        assert_eq!(carry.take_frames(&[4, 5, 6]), Some(vec![1, 2, 3, 4]));
        assert_eq!(carry.residual(), 2);
        assert_eq!(
            carry.take_frames(&[7, 8, 9, 10, 11, 12]),
            Some(vec![5, 6, 7, 8, 9, 10, 11, 12])
        );
        assert_eq!(carry.residual(), 0);
        assert_eq!(carry.take_frames(&[1]), None);
        assert_eq!(carry.discard(), 1);
    }
}
