use crate::config::UnAudioConfig;
use crate::error::{Result, UnAudioError};
use crate::mixer::{DeviceMonitor, Mixer};
use crate::output::AudioOutput;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, SizedSample};
use crossbeam_channel::{Sender, bounded};
use std::thread::JoinHandle;

/// Plays through the host's default output device.
///
/// `cpal::Stream` cannot move between threads, so each stream lives on its
/// own `unaudio-output` thread, which drops it when told to stop.
#[derive(Default)]
pub struct CpalOutput {
    worker: Option<StreamWorker>,
}

struct StreamWorker {
    stop: Sender<()>,
    handle: JoinHandle<()>,
    device_name: String,
}

impl CpalOutput {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AudioOutput for CpalOutput {
    fn open(&mut self, config: &UnAudioConfig, mixer: Mixer, monitor: DeviceMonitor) -> Result<()> {
        self.close();

        if config.exclusive_mode {
            log::warn!("Exclusive mode is not available through cpal, opening a shared stream");
        }

        let (ready_tx, ready_rx) = bounded::<Result<String>>(1);
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let config = config.clone();

        let handle = std::thread::Builder::new()
            .name("unaudio-output".to_string())
            .spawn(move || match start_stream(&config, mixer, monitor) {
                Ok((stream, device_name)) => {
                    let _ = ready_tx.send(Ok(device_name));
                    // Returns on stop or when the output is dropped
                    let _ = stop_rx.recv();
                    drop(stream);
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                }
            })
            .map_err(|e| UnAudioError::Platform(format!("failed to spawn output thread: {}", e)))?;

        match ready_rx.recv() {
            Ok(Ok(device_name)) => {
                log::info!("Output stream started on '{}'", device_name);
                self.worker = Some(StreamWorker {
                    stop: stop_tx,
                    handle,
                    device_name,
                });
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(e)
            }
            Err(_) => {
                let _ = handle.join();
                Err(UnAudioError::Platform(
                    "output thread exited during startup".into(),
                ))
            }
        }
    }

    fn close(&mut self) {
        if let Some(worker) = self.worker.take() {
            let _ = worker.stop.send(());
            if worker.handle.join().is_err() {
                log::error!("Output thread panicked");
            }
            log::debug!("Output stream on '{}' closed", worker.device_name);
        }
    }

    fn device_name(&self) -> Option<String> {
        self.worker.as_ref().map(|w| w.device_name.clone())
    }
}

impl Drop for CpalOutput {
    fn drop(&mut self) {
        self.close();
    }
}

fn start_stream(
    config: &UnAudioConfig,
    mixer: Mixer,
    monitor: DeviceMonitor,
) -> Result<(cpal::Stream, String)> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| UnAudioError::DeviceNotFound("no default output device available".into()))?;
    let device_name = device.name().unwrap_or_else(|_| "unknown".to_string());

    let default_config = device.default_output_config().map_err(|e| {
        UnAudioError::DeviceNotFound(format!("failed to get default config: {}", e))
    })?;

    let stream_config = cpal::StreamConfig {
        channels: config.channels,
        sample_rate: cpal::SampleRate(config.sample_rate),
        buffer_size: cpal::BufferSize::Fixed(config.buffer_size_frames),
    };
    let max_frames = config.buffer_size_frames as usize;

    let stream = match default_config.sample_format() {
        cpal::SampleFormat::F32 => {
            create_stream::<f32>(&device, &stream_config, mixer, monitor, max_frames)?
        }
        cpal::SampleFormat::I16 => {
            create_stream::<i16>(&device, &stream_config, mixer, monitor, max_frames)?
        }
        cpal::SampleFormat::U16 => {
            create_stream::<u16>(&device, &stream_config, mixer, monitor, max_frames)?
        }
        other => {
            return Err(UnAudioError::Platform(format!(
                "unsupported sample format {:?}",
                other
            )));
        }
    };

    stream
        .play()
        .map_err(|e| UnAudioError::Platform(format!("failed to start stream: {}", e)))?;

    Ok((stream, device_name))
}

/// Create a typed output stream. Rendering goes through a scratch buffer
/// sized for one period; larger device buffers are rendered in chunks.
fn create_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    mut mixer: Mixer,
    monitor: DeviceMonitor,
    max_frames: usize,
) -> Result<cpal::Stream>
where
    T: SizedSample + FromSample<f32>,
{
    let channels = config.channels as usize;
    let mut scratch = vec![0.0f32; max_frames.max(1) * channels];

    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                for chunk in data.chunks_mut(scratch.len()) {
                    let rendered = &mut scratch[..chunk.len()];
                    mixer.render(rendered);
                    for (sample, value) in chunk.iter_mut().zip(rendered.iter()) {
                        *sample = T::from_sample(*value);
                    }
                }
            },
            move |err| {
                log::error!("Audio stream error: {}", err);
                if matches!(err, cpal::StreamError::DeviceNotAvailable) {
                    monitor.report_device_lost();
                }
            },
            None,
        )
        .map_err(|e| match e {
            cpal::BuildStreamError::DeviceNotAvailable => {
                UnAudioError::DeviceNotFound("output device is not available".into())
            }
            other => UnAudioError::Platform(format!("failed to build stream: {}", other)),
        })
}
