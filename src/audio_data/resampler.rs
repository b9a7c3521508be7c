use crate::error::{Result, UnAudioError};
use rubato::{FftFixedIn, Resampler};

/// Offline sample-rate converter used when a clip's rate differs from the
/// output rate. Runs on the loading thread only.
pub struct AudioResampler {
    source_sample_rate: u32,
    target_sample_rate: u32,
    channels: u16,
    chunk_size: usize,
}

impl AudioResampler {
    pub fn new(
        source_sample_rate: u32,
        target_sample_rate: u32,
        channels: u16,
        chunk_size: Option<usize>,
    ) -> Result<Self> {
        if source_sample_rate == 0 || target_sample_rate == 0 {
            return Err(UnAudioError::invalid("sample rates must be greater than 0"));
        }

        if channels == 0 {
            return Err(UnAudioError::invalid("channel count must be greater than 0"));
        }

        Ok(Self {
            source_sample_rate,
            target_sample_rate,
            channels,
            chunk_size: chunk_size.unwrap_or(1024).max(1),
        })
    }

    /// Number of output frames produced for `input_frames` input frames.
    pub fn output_frames(&self, input_frames: usize) -> usize {
        (input_frames as f64 * self.resample_ratio()).round() as usize
    }

    /// Resamples interleaved audio. The output holds exactly
    /// [`output_frames`](Self::output_frames) frames with the filter delay
    /// removed.
    pub fn resample_interleaved(&self, interleaved_samples: &[f32]) -> Result<Vec<f32>> {
        if self.source_sample_rate == self.target_sample_rate {
            return Ok(interleaved_samples.to_vec());
        }

        let channels = self.channels as usize;
        let input_frames = interleaved_samples.len() / channels;
        let expected = self.output_frames(input_frames);
        if expected == 0 {
            return Ok(Vec::new());
        }

        let mut resampler = FftFixedIn::<f32>::new(
            self.source_sample_rate as usize,
            self.target_sample_rate as usize,
            self.chunk_size,
            2, // sub_chunks
            channels,
        )
        .map_err(|e| UnAudioError::DecodeFailed(format!("failed to create resampler: {}", e)))?;

        let delay = resampler.output_delay();
        let mut planar_in = vec![vec![0.0f32; self.chunk_size]; channels];
        let mut planar_out: Vec<Vec<f32>> = vec![Vec::with_capacity(expected + delay); channels];

        let mut input_frame = 0;
        while planar_out[0].len() < expected + delay {
            // De-interleave the next chunk, zero padded past the end of input
            let take = input_frames.saturating_sub(input_frame).min(self.chunk_size);
            for (ch, buffer) in planar_in.iter_mut().enumerate() {
                buffer.fill(0.0);
                for i in 0..take {
                    buffer[i] = interleaved_samples[(input_frame + i) * channels + ch];
                }
            }
            input_frame += take;

            let waves_out = resampler
                .process(&planar_in, None)
                .map_err(|e| UnAudioError::DecodeFailed(format!("resampling error: {}", e)))?;
            for (out, wave) in planar_out.iter_mut().zip(waves_out.iter()) {
                out.extend_from_slice(wave);
            }
        }

        let mut interleaved = Vec::with_capacity(expected * channels);
        for frame in delay..delay + expected {
            for channel in &planar_out {
                interleaved.push(channel[frame]);
            }
        }

        Ok(interleaved)
    }

    pub fn target_sample_rate(&self) -> u32 {
        self.target_sample_rate
    }

    pub fn source_sample_rate(&self) -> u32 {
        self.source_sample_rate
    }

    pub fn resample_ratio(&self) -> f64 {
        self.target_sample_rate as f64 / self.source_sample_rate as f64
    }
}
