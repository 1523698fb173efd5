//! WAV container header for the endless DAB stream.

use bytes::{BufMut, Bytes, BytesMut};

/// Generates a standard 44-byte WAVE header for an unbounded LPCM stream.
///
/// Both chunk-size fields are zero-filled: clients treat the stream as
/// endless and keep reading until the connection closes.
///
/// @param is_float - true only when samples are 32-bit floating point.
/// @param channels - 1 (mono) or 2 (stereo).
/// @param bits_per_sample - Bit depth (16 or 24). Invalid values default to 16.
/// @param sample_rate - As reported by the driver with the first frame.
pub fn create_wav_header(
    is_float: bool,
    channels: u16,
    bits_per_sample: u16,
    sample_rate: u32,
) -> Bytes {
    // Only 16 and 24 are valid bit depths for integer PCM WAV
    let bits_per_sample = match bits_per_sample {
        16 | 24 => bits_per_sample,
        32 if is_float => 32,
        other => {
            log::warn!("[WAV] Invalid bits_per_sample {}, defaulting to 16", other);
            16
        }
    };

    let mut header = BytesMut::with_capacity(44);

    let bytes_per_sample = bits_per_sample / 8;
    let byte_rate = sample_rate * channels as u32 * bytes_per_sample as u32;
    let block_align = channels * bytes_per_sample;

    // RIFF header
    header.put_slice(b"RIFF");
    header.put_u32_le(0); // File size: unbounded stream
    header.put_slice(b"WAVE");

    // fmt chunk
    header.put_slice(b"fmt ");
    header.put_u32_le(16); // Chunk size
    header.put_u16_le(if is_float { 3 } else { 1 }); // Format: float (3) or PCM (1)
    header.put_u16_le(channels);
    header.put_u32_le(sample_rate);
    header.put_u32_le(byte_rate);
    header.put_u16_le(block_align);
    header.put_u16_le(bits_per_sample);

    // data chunk
    header.put_slice(b"data");
    header.put_u32_le(0); // Data size: unbounded stream

    header.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_is_44_bytes_with_zeroed_sizes() {
        let header = create_wav_header(false, 2, 16, 48000);
        assert_eq!(header.len(), 44);
        assert_eq!(&header[0..4], b"RIFF");
        assert_eq!(&header[4..8], &[0, 0, 0, 0]); // file size zeroed
        assert_eq!(&header[8..12], b"WAVE");
        assert_eq!(&header[36..40], b"data");
        assert_eq!(&header[40..44], &[0, 0, 0, 0]); // data size zeroed
    }

    #[test]
    fn pcm_format_fields() {
        let header = create_wav_header(false, 2, 16, 48000);
        // format code 1 (PCM), 2 channels
        assert_eq!(&header[20..22], &1u16.to_le_bytes());
        assert_eq!(&header[22..24], &2u16.to_le_bytes());
        assert_eq!(&header[24..28], &48000u32.to_le_bytes());
        // byte rate = 48000 * 2 * 2, block align = 4, bits = 16
        assert_eq!(&header[28..32], &192_000u32.to_le_bytes());
        assert_eq!(&header[32..34], &4u16.to_le_bytes());
        assert_eq!(&header[34..36], &16u16.to_le_bytes());
    }

    #[test]
    fn float_format_code() {
        let header = create_wav_header(true, 2, 32, 44100);
        assert_eq!(&header[20..22], &3u16.to_le_bytes());
        assert_eq!(&header[34..36], &32u16.to_le_bytes());
    }

    #[test]
    fn invalid_bit_depth_defaults_to_16() {
        let header = create_wav_header(false, 2, 20, 48000);
        assert_eq!(&header[34..36], &16u16.to_le_bytes());
    }
}
