//! # Audio Codec
//!
//! Converts between the float samples the audio devices work with and the
//! base64-encoded 16-bit PCM the live session carries on the wire.
//!
//! ## Wire Format:
//! - **Outbound**: mono, 16kHz, `audio/pcm;rate=16000`
//! - **Inbound**: mono, usually 24kHz, rate declared in the chunk's MIME type
//! - **Samples**: signed 16-bit little-endian, base64 standard alphabet
//!
//! All functions are pure and safe to call from any thread.

use crate::error::{CoreError, CoreResult};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use byteorder::{ByteOrder, LittleEndian};

/// Microphone capture rate expected by the live backend.
pub const INPUT_SAMPLE_RATE: u32 = 16_000;

/// Rate of model audio when the server does not say otherwise.
pub const OUTPUT_SAMPLE_RATE: u32 = 24_000;

/// MIME type attached to every outbound frame.
pub const PCM_MIME: &str = "audio/pcm;rate=16000";

const BYTES_PER_SAMPLE: usize = 2;

/// One chunk of captured audio ready to send upstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireFrame {
    /// Base64 of the little-endian 16-bit samples
    pub data: String,
    pub mime_type: String,
}

/// Decoded audio ready for the output context.
///
/// `channels[c][i]` is sample `i` of channel `c`, normalized to [-1, 1).
#[derive(Debug, Clone, PartialEq)]
pub struct PcmBuffer {
    pub sample_rate: u32,
    pub channels: Vec<Vec<f32>>,
}

impl PcmBuffer {
    /// Samples per channel.
    pub fn frame_count(&self) -> usize {
        self.channels.first().map(Vec::len).unwrap_or(0)
    }

    /// Playback length in seconds.
    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frame_count() as f64 / self.sample_rate as f64
    }

    /// Interleave the channels into a single sample vector.
    pub fn interleaved(&self) -> Vec<f32> {
        let frames = self.frame_count();
        let mut out = Vec::with_capacity(frames * self.channels.len());
        for i in 0..frames {
            for channel in &self.channels {
                out.push(channel[i]);
            }
        }
        out
    }
}

/// Encode float samples into an outbound wire frame.
///
/// Each sample is scaled by 32768 and converted with `as`, which truncates
/// toward zero and saturates at the i16 bounds (so 1.0 becomes 32767).
pub fn encode(samples: &[f32]) -> WireFrame {
    let ints: Vec<i16> = samples.iter().map(|s| (s * 32768.0) as i16).collect();

    let mut bytes = vec![0u8; ints.len() * BYTES_PER_SAMPLE];
    LittleEndian::write_i16_into(&ints, &mut bytes);

    WireFrame {
        data: STANDARD.encode(&bytes),
        mime_type: PCM_MIME.to_string(),
    }
}

/// Decode a base64 payload into raw bytes.
pub fn decode(data: &str) -> CoreResult<Vec<u8>> {
    Ok(STANDARD.decode(data)?)
}

/// Interpret raw bytes as interleaved 16-bit little-endian PCM.
///
/// Fails with `CoreError::Format` when the byte count does not split into
/// whole frames of `channels` samples.
pub fn bytes_to_audio_buffer(bytes: &[u8], sample_rate: u32, channels: usize) -> CoreResult<PcmBuffer> {
    let frame_bytes = BYTES_PER_SAMPLE * channels;
    if channels == 0 || bytes.len() % frame_bytes != 0 {
        return Err(CoreError::Format {
            len: bytes.len(),
            frame_bytes,
        });
    }

    let mut ints = vec![0i16; bytes.len() / BYTES_PER_SAMPLE];
    LittleEndian::read_i16_into(bytes, &mut ints);

    let frames = ints.len() / channels;
    let mut out = vec![Vec::with_capacity(frames); channels];
    for frame in ints.chunks_exact(channels) {
        for (channel, sample) in out.iter_mut().zip(frame) {
            channel.push(*sample as f32 / 32768.0);
        }
    }

    Ok(PcmBuffer {
        sample_rate,
        channels: out,
    })
}

/// Extract the `rate=` parameter of a PCM MIME type such as `audio/pcm;rate=24000`.
pub fn sample_rate_from_mime(mime_type: &str) -> Option<u32> {
    mime_type
        .split(';')
        .skip(1)
        .filter_map(|param| param.split_once('='))
        .find(|(key, _)| key.trim().eq_ignore_ascii_case("rate"))
        .and_then(|(_, value)| value.trim().parse().ok())
        .filter(|rate| *rate > 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_known_values() {
        let frame = encode(&[0.0, 0.5, -0.5, 1.0, -1.0]);
        assert_eq!(frame.mime_type, "audio/pcm;rate=16000");

        let bytes = decode(&frame.data).unwrap();
        assert_eq!(
            bytes,
            vec![0x00, 0x00, 0x00, 0x40, 0x00, 0xC0, 0xFF, 0x7F, 0x00, 0x80]
        );
    }

    #[test]
    fn test_encode_truncates_toward_zero() {
        // 0.00005 * 32768 = 1.6384 -> 1, and the negative mirror -> -1
        let bytes = decode(&encode(&[0.00005, -0.00005]).data).unwrap();
        assert_eq!(bytes, vec![0x01, 0x00, 0xFF, 0xFF]);
    }

    #[test]
    fn test_encode_saturates_full_scale() {
        // Overdriven samples clip instead of wrapping to the opposite sign
        let bytes = decode(&encode(&[1.0, 1.5, -1.5]).data).unwrap();
        assert_eq!(bytes, vec![0xFF, 0x7F, 0xFF, 0x7F, 0x00, 0x80]);
    }

    #[test]
    fn test_round_trip_within_one_quantization_step() {
        let samples: Vec<f32> = (0..480).map(|i| ((i as f32) * 0.05).sin() * 0.9).collect();
        let bytes = decode(&encode(&samples).data).unwrap();
        let buffer = bytes_to_audio_buffer(&bytes, INPUT_SAMPLE_RATE, 1).unwrap();

        assert_eq!(buffer.frame_count(), samples.len());
        for (original, decoded) in samples.iter().zip(&buffer.channels[0]) {
            assert!((original - decoded).abs() <= 1.0 / 32768.0);
        }
    }

    #[test]
    fn test_empty_input() {
        let frame = encode(&[]);
        assert_eq!(frame.data, "");
        let buffer = bytes_to_audio_buffer(&[], OUTPUT_SAMPLE_RATE, 1).unwrap();
        assert_eq!(buffer.frame_count(), 0);
        assert_eq!(buffer.duration_secs(), 0.0);
    }

    #[test]
    fn test_odd_length_is_format_error() {
        let err = bytes_to_audio_buffer(&[0x00, 0x01, 0x02], OUTPUT_SAMPLE_RATE, 1).unwrap_err();
        assert!(matches!(err, CoreError::Format { len: 3, frame_bytes: 2 }));

        let err = bytes_to_audio_buffer(&[0; 6], OUTPUT_SAMPLE_RATE, 2).unwrap_err();
        assert!(matches!(err, CoreError::Format { len: 6, frame_bytes: 4 }));

        assert!(bytes_to_audio_buffer(&[0; 4], OUTPUT_SAMPLE_RATE, 0).is_err());
    }

    #[test]
    fn test_stereo_deinterleave() {
        // L = 16384 (0.5), R = -16384 (-0.5), twice
        let bytes = [0x00, 0x40, 0x00, 0xC0, 0x00, 0x40, 0x00, 0xC0];
        let buffer = bytes_to_audio_buffer(&bytes, 48_000, 2).unwrap();
        assert_eq!(buffer.channels, vec![vec![0.5, 0.5], vec![-0.5, -0.5]]);
        assert_eq!(buffer.interleaved(), vec![0.5, -0.5, 0.5, -0.5]);
    }

    #[test]
    fn test_duration() {
        let bytes = vec![0u8; 24_000 * 2];
        let buffer = bytes_to_audio_buffer(&bytes, OUTPUT_SAMPLE_RATE, 1).unwrap();
        assert!((buffer.duration_secs() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_malformed_base64() {
        assert!(matches!(decode("not base64!"), Err(CoreError::Decode(_))));
    }

    #[test]
    fn test_sample_rate_from_mime() {
        assert_eq!(sample_rate_from_mime("audio/pcm;rate=24000"), Some(24_000));
        assert_eq!(sample_rate_from_mime("audio/pcm; rate=16000"), Some(16_000));
        assert_eq!(sample_rate_from_mime("audio/pcm"), None);
        assert_eq!(sample_rate_from_mime("audio/pcm;rate=abc"), None);
    }
}
