//! Driver and session traits
//!
//! `DaqDriver` is the seam between the engine and the hardware vendor
//! stack. A driver enumerates devices and opens output sessions; a session
//! owns one analog-output task and one digital-output task that share a
//! start trigger, so the first AO sample and the DO rising edge coincide
//! within one sample clock.

use crate::{DaqResult, DeviceDescriptor, SessionConfig};

pub trait DaqDriver: Send + Sync {
    /// Enumerate devices. May take tens of milliseconds to seconds.
    fn devices(&self) -> DaqResult<Vec<DeviceDescriptor>>;

    /// Installed driver version string, if the backend exposes one.
    fn driver_version(&self) -> Option<String>;

    /// Open an AO + DO session pair on the named device.
    fn open(&self, config: &SessionConfig) -> DaqResult<Box<dyn OutputSession>>;
}

/// A configured, startable AO + DO task pair.
///
/// Sessions begin stopped with the DO lines LOW. Dropping a session must
/// release the underlying tasks.
pub trait OutputSession: Send {
    /// Start the hardware sample clock.
    fn start(&mut self) -> DaqResult<()>;

    /// Stop generation. The generated-sample counter is retained.
    fn stop(&mut self) -> DaqResult<()>;

    /// Queue interleaved AO samples, blocking while the device buffer is
    /// full. This is the pump's only intentional suspension point.
    fn write(&mut self, interleaved: &[f32]) -> DaqResult<()>;

    /// Drive the DO sync lines HIGH or LOW.
    fn set_sync_lines(&mut self, high: bool) -> DaqResult<()>;

    /// Per-channel samples the device has generated since the session was
    /// created. Monotone across start/stop.
    fn samples_generated(&self) -> u64;

    /// Free space in the device buffer, in interleaved samples.
    fn buffer_slots(&self) -> usize;

    /// Underflow events the hardware reported since the last call.
    fn take_underflows(&mut self) -> u32;
}
