use crate::audio_data::{ClipDecoder, PcmClip};
use crate::error::{Result, UnAudioError};
use std::io::Cursor;
use symphonia::{
    core::{
        audio::SampleBuffer, codecs::DecoderOptions, errors::Error, formats::FormatOptions,
        io::MediaSourceStream, meta::MetadataOptions, probe::Hint,
    },
    default::{get_codecs, get_probe},
};

/// Decodes WAV and MP3 clips from memory with symphonia.
#[derive(Debug, Default, Clone, Copy)]
pub struct SymphoniaDecoder;

impl SymphoniaDecoder {
    pub fn new() -> Self {
        Self
    }
}

impl ClipDecoder for SymphoniaDecoder {
    fn decode(&self, bytes: &[u8]) -> Result<PcmClip> {
        if bytes.is_empty() {
            return Err(UnAudioError::invalid("audio data is empty"));
        }

        let source = Cursor::new(bytes.to_vec());
        let mss = MediaSourceStream::new(Box::new(source), Default::default());

        let probed = get_probe()
            .format(
                &Hint::new(),
                mss,
                &FormatOptions::default(),
                &MetadataOptions::default(),
            )
            .map_err(|e| UnAudioError::FormatNotSupported(format!("probe failed: {}", e)))?;

        let mut format = probed.format;

        let track = format
            .default_track()
            .ok_or_else(|| UnAudioError::FormatNotSupported("no default audio track".into()))?;
        let track_id = track.id;
        let codec_params = track.codec_params.clone();

        let mut decoder = get_codecs()
            .make(&codec_params, &DecoderOptions::default())
            .map_err(|e| UnAudioError::FormatNotSupported(format!("no decoder: {}", e)))?;

        let mut sample_rate = codec_params.sample_rate.unwrap_or(0);
        let mut channels = codec_params.channels.map(|c| c.count() as u16).unwrap_or(0);
        let bits_per_sample = codec_params.bits_per_sample.unwrap_or(0) as u16;

        let mut samples: Vec<f32> = Vec::new();
        let mut sample_buffer: Option<SampleBuffer<f32>> = None;

        loop {
            let packet = match format.next_packet() {
                Ok(packet) => packet,
                Err(Error::IoError(_)) => break, // end-of-stream
                Err(Error::ResetRequired) => break,
                Err(e) => {
                    return Err(UnAudioError::DecodeFailed(format!(
                        "error reading packet: {}",
                        e
                    )));
                }
            };

            if packet.track_id() != track_id {
                continue;
            }

            let decoded = match decoder.decode(&packet) {
                Ok(decoded) => decoded,
                Err(Error::IoError(_)) => break,
                Err(Error::DecodeError(e)) => {
                    log::debug!("Skipping corrupt packet: {}", e);
                    continue;
                }
                Err(e) => {
                    return Err(UnAudioError::DecodeFailed(format!(
                        "error decoding packet: {}",
                        e
                    )));
                }
            };

            let spec = *decoded.spec();
            if channels == 0 {
                channels = spec.channels.count() as u16;
            }
            if sample_rate == 0 {
                sample_rate = spec.rate;
            }

            let needs_buffer = sample_buffer
                .as_ref()
                .is_none_or(|buf| buf.capacity() < decoded.capacity() * spec.channels.count());
            if needs_buffer {
                sample_buffer = Some(SampleBuffer::<f32>::new(decoded.capacity() as u64, spec));
            }
            if let Some(buf) = sample_buffer.as_mut() {
                buf.copy_interleaved_ref(decoded);
                samples.extend_from_slice(buf.samples());
            }
        }

        if channels == 0 || sample_rate == 0 {
            return Err(UnAudioError::DecodeFailed(
                "stream does not describe its channels or sample rate".into(),
            ));
        }
        if samples.len() < channels as usize {
            return Err(UnAudioError::DecodeFailed("no audio frames decoded".into()));
        }

        log::debug!(
            "Decoded {} frames ({} Hz, {} ch)",
            samples.len() / channels as usize,
            sample_rate,
            channels
        );

        PcmClip::new(samples, sample_rate, channels, bits_per_sample)
    }
}
