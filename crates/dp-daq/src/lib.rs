//! dp-daq: DAQ device enumeration and output sessions
//!
//! Abstracts the data-acquisition hardware behind two narrow traits:
//!
//! ```text
//! ┌────────────────┐     ┌───────────────┐     ┌──────────────────┐
//! │ DeviceRegistry │────▶│   DaqDriver   │────▶│  OutputSession   │
//! │                │     │               │     │                  │
//! │ - enumeration  │     │ - devices()   │     │ - AO write       │
//! │ - validation   │     │ - open()      │     │ - DO sync lines  │
//! │ - caching      │     │               │     │ - sample counter │
//! └────────────────┘     └───────────────┘     └──────────────────┘
//! ```
//!
//! The default driver is a simulated device that paces consumption off the
//! wall clock, so the whole engine runs and tests without hardware. The
//! `nidaqmx` feature swaps in the NI-DAQmx C driver.

mod device;
mod driver;
mod error;
mod sim;

#[cfg(feature = "nidaqmx")]
pub mod nidaqmx;

pub use device::*;
pub use driver::*;
pub use error::*;
pub use sim::*;

use dp_core::{ChannelSpec, DEFAULT_FRAMES_PER_BUFFER, DEFAULT_SAMPLES_PER_FRAME};

/// Everything a driver needs to configure an AO + DO session pair.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Device name as the driver reports it (e.g. `Dev1`).
    pub device_name: String,
    /// Channels to bind. AO carries audio, DO carries the TTL sync level.
    pub channels: ChannelSpec,
    /// Hardware sample clock rate, per channel.
    pub sample_rate_hz: u32,
    /// Source frames per write call.
    pub samples_per_frame: usize,
    /// Device buffer size, in multiples of `samples_per_frame`.
    pub frames_per_buffer: usize,
}

impl SessionConfig {
    pub fn new(device_name: &str, channels: ChannelSpec, sample_rate_hz: u32) -> Self {
        Self {
            device_name: device_name.to_string(),
            channels,
            sample_rate_hz,
            samples_per_frame: DEFAULT_SAMPLES_PER_FRAME,
            frames_per_buffer: DEFAULT_FRAMES_PER_BUFFER,
        }
    }

    /// Device buffer capacity in interleaved samples.
    pub fn buffer_capacity(&self) -> usize {
        self.samples_per_frame * self.frames_per_buffer * self.channels.ao_count()
    }
}
