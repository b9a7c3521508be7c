//! Output backends.
//!
//! A backend owns the platform stream and drives a [`Mixer`] once per
//! device period. [`CpalOutput`] plays through the default device;
//! [`OfflineOutput`] lets the caller pull periods on demand.

mod cpal_output;
mod offline;

use crate::config::UnAudioConfig;
use crate::error::Result;
use crate::mixer::{DeviceMonitor, Mixer};

pub use cpal_output::CpalOutput;
pub use offline::OfflineOutput;

/// A sink for rendered audio.
///
/// The engine opens the output on initialize and on every buffer size change,
/// and closes it on shutdown. `close` must not return while a render call on
/// the previous mixer can still be running or start later.
pub trait AudioOutput: Send {
    /// Starts a stream that calls `mixer.render` every period.
    ///
    /// # Errors
    ///
    /// `DeviceNotFound` when no usable device exists, `Platform` when the
    /// device rejects the configuration.
    fn open(&mut self, config: &UnAudioConfig, mixer: Mixer, monitor: DeviceMonitor) -> Result<()>;

    /// Stops the stream and drops its mixer. Idempotent.
    fn close(&mut self);

    fn device_name(&self) -> Option<String> {
        None
    }
}
