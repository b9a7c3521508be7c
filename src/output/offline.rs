use crate::config::UnAudioConfig;
use crate::error::{Result, UnAudioError};
use crate::mixer::{DeviceMonitor, Mixer};
use crate::output::AudioOutput;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

/// Output without a device: periods are rendered when the caller asks.
///
/// Clones share the same stream, so a test can hand one clone to the engine
/// and pull audio through another.
///
/// ```ignore
/// let output = OfflineOutput::new();
/// let engine = UnAudioEngine::with_output(Box::new(output.clone()));
/// engine.initialize(UnAudioConfig::default())?;
/// let period = output.render_period();
/// ```
#[derive(Clone, Default)]
pub struct OfflineOutput {
    inner: Arc<Mutex<OfflineStream>>,
}

#[derive(Default)]
struct OfflineStream {
    mixer: Option<Mixer>,
    monitor: Option<DeviceMonitor>,
    channels: u16,
    buffer_size_frames: usize,
    opened: u32,
    /// Errors returned by upcoming opens, oldest first
    failures: VecDeque<UnAudioError>,
}

impl OfflineOutput {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, OfflineStream> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn is_open(&self) -> bool {
        self.lock().mixer.is_some()
    }

    /// Number of successful opens so far.
    pub fn open_count(&self) -> u32 {
        self.lock().opened
    }

    pub fn buffer_size_frames(&self) -> usize {
        self.lock().buffer_size_frames
    }

    /// Makes the next `open` fail with `error`. Calls queue up, so two
    /// calls fail the next two opens.
    pub fn fail_next_open(&self, error: UnAudioError) {
        self.lock().failures.push_back(error);
    }

    /// Renders into `out`. Returns `false` (and silence) when closed.
    pub fn render(&self, out: &mut [f32]) -> bool {
        let mut stream = self.lock();
        match stream.mixer.as_mut() {
            Some(mixer) => {
                mixer.render(out);
                true
            }
            None => {
                out.fill(0.0);
                false
            }
        }
    }

    /// Renders `frames` frames of interleaved output.
    pub fn render_frames(&self, frames: usize) -> Vec<f32> {
        let channels = self.lock().channels.max(1) as usize;
        let mut out = vec![0.0f32; frames * channels];
        self.render(&mut out);
        out
    }

    /// Renders one configured period.
    pub fn render_period(&self) -> Vec<f32> {
        let frames = self.buffer_size_frames();
        self.render_frames(frames)
    }

    /// Reports device loss the way a platform error callback would.
    pub fn simulate_device_loss(&self) {
        if let Some(monitor) = self.lock().monitor.as_ref() {
            monitor.report_device_lost();
        }
    }
}

impl AudioOutput for OfflineOutput {
    fn open(&mut self, config: &UnAudioConfig, mixer: Mixer, monitor: DeviceMonitor) -> Result<()> {
        let mut stream = self.lock();
        if let Some(error) = stream.failures.pop_front() {
            return Err(error);
        }
        stream.mixer = Some(mixer);
        stream.monitor = Some(monitor);
        stream.channels = config.channels;
        stream.buffer_size_frames = config.buffer_size_frames as usize;
        stream.opened += 1;
        Ok(())
    }

    fn close(&mut self) {
        let mut stream = self.lock();
        stream.mixer = None;
        stream.monitor = None;
    }

    fn device_name(&self) -> Option<String> {
        self.is_open().then(|| "offline".to_string())
    }
}
