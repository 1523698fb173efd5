//! Audio stream output: codec selection and WAV header generation.

mod wav;

pub use wav::create_wav_header;

use serde::Serialize;

/// Output codec of the DAB audio stream.
///
/// The driver either decodes to PCM (served in a WAV container so ordinary
/// media clients can play the endless stream) or passes the broadcast AAC
/// through untouched.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AudioCodec {
    Pcm,
    Aac,
}

impl AudioCodec {
    /// Maps the driver's decode setting to the served codec.
    #[must_use]
    pub const fn for_decode_setting(decode_audio: bool) -> Self {
        if decode_audio {
            Self::Pcm
        } else {
            Self::Aac
        }
    }

    /// Returns the MIME type for this codec.
    ///
    /// Note: PCM returns "audio/wav" because it is served in a WAV container.
    #[must_use]
    pub const fn mime_type(&self) -> &'static str {
        match self {
            Self::Pcm => "audio/wav",
            Self::Aac => "audio/aac",
        }
    }
}
