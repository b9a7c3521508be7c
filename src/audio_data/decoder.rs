use crate::audio_data::PcmClip;
use crate::error::Result;

/// Turns encoded clip bytes into PCM.
///
/// The engine ships [`SymphoniaDecoder`](crate::audio_data::SymphoniaDecoder);
/// other decoders can be installed with
/// [`UnAudioEngine::set_decoder`](crate::UnAudioEngine::set_decoder).
/// Decoders run on the loading thread, never inside the render callback.
///
/// # Example
///
/// ```ignore
/// use unaudio::audio_data::{ClipDecoder, PcmClip};
/// use unaudio::error::Result;
///
/// struct RawMono48k;
///
/// impl ClipDecoder for RawMono48k {
///     fn decode(&self, bytes: &[u8]) -> Result<PcmClip> {
///         let samples = bytes.iter().map(|b| (*b as f32 - 128.0) / 128.0).collect();
///         PcmClip::new(samples, 48000, 1, 8)
///     }
/// }
/// ```
pub trait ClipDecoder: Send + Sync {
    /// Decodes a complete in-memory clip.
    ///
    /// # Errors
    ///
    /// `FormatNotSupported` when the container or codec is not recognized,
    /// `DecodeFailed` when the data is corrupt or holds no audio.
    fn decode(&self, bytes: &[u8]) -> Result<PcmClip>;
}
