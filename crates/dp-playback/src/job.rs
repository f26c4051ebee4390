//! Playback job state
//!
//! A job is created at `load_audio` and lives until terminate or reload.
//! The immutable half ([`JobSpec`]) describes the asset and the bound
//! device; the mutable half ([`SharedState`]) is the single piece of
//! state shared between the audio thread and control handlers.
//!
//! Locking discipline: the params mutex is held for O(1) reads/writes
//! only, never across a decoder read or a device write. Position and
//! counters are atomics so status snapshots never need the transport.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use dp_core::{samples_to_seconds, ChannelSpec, LoopMode, DEFAULT_VOLUME_PCT};
use dp_daq::DeviceDescriptor;

/// Canonical transport states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportState {
    #[default]
    Idle,
    Loaded,
    Playing,
    Paused,
    Seeking,
    Completed,
}

/// Immutable description of the loaded job.
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub path: PathBuf,
    pub device: DeviceDescriptor,
    pub channels: ChannelSpec,
    /// Always the asset's native rate; no resampling.
    pub sample_rate_hz: u32,
    pub samples_per_frame: usize,
    pub frames_per_buffer: usize,
    pub channel_count: usize,
    pub bit_depth: u32,
    pub total_samples: u64,
}

impl JobSpec {
    pub fn duration_s(&self) -> f64 {
        samples_to_seconds(self.total_samples, self.sample_rate_hz)
    }
}

/// Parameters control handlers may change at any time.
#[derive(Debug, Clone)]
pub struct ControlParams {
    pub volume_pct: u8,
    pub muted: bool,
    pub flip_lr_stereo: bool,
    pub loop_mode: LoopMode,
}

impl Default for ControlParams {
    fn default() -> Self {
        Self {
            volume_pct: DEFAULT_VOLUME_PCT,
            muted: false,
            flip_lr_stereo: false,
            loop_mode: LoopMode::None,
        }
    }
}

/// State shared between the audio thread and control handlers.
#[derive(Debug, Default)]
pub struct SharedState {
    pub params: Mutex<ControlParams>,
    /// Absolute position in source samples, monotone except across seeks.
    pub position_samples: AtomicU64,
    /// Underflow events since the job was created.
    pub underflow_events: AtomicU32,
    pub completed: AtomicBool,
    /// Last playback error, surfaced through status replies.
    pub error: Mutex<Option<String>>,
}

impl SharedState {
    /// Linear gain the pump applies this frame.
    pub fn gain(&self) -> (f32, bool) {
        let params = self.params.lock();
        let gain = if params.muted {
            0.0
        } else {
            f32::from(params.volume_pct) / 100.0
        };
        (gain, params.flip_lr_stereo)
    }

    pub fn position(&self) -> u64 {
        self.position_samples.load(Ordering::Acquire)
    }

    pub fn set_error(&self, message: impl Into<String>) {
        *self.error.lock() = Some(message.into());
    }
}

/// Serializable snapshot of the whole player, used by `status` replies
/// and progress telemetry.
#[derive(Debug, Clone, Serialize)]
pub struct PlayerStatus {
    pub state: TransportState,
    pub playing: bool,
    pub audio_completed: bool,

    pub device_name: Option<String>,
    pub ao_channels: Vec<String>,
    pub do_channels: Vec<String>,
    pub ai_channels: Vec<String>,

    pub file: Option<String>,
    pub sample_rate_hz: u32,
    pub channel_count: u32,
    pub bit_depth: u32,
    pub duration_s: f64,

    pub position_samples: u64,
    pub position_s: f64,
    pub total_samples: u64,

    pub volume_pct: u8,
    pub muted: bool,
    pub flip_lr_stereo: bool,
    pub loop_mode: LoopMode,

    pub underflow_events: u32,
    pub error: Option<String>,
}

impl PlayerStatus {
    pub fn idle() -> Self {
        Self {
            state: TransportState::Idle,
            playing: false,
            audio_completed: false,
            device_name: None,
            ao_channels: Vec::new(),
            do_channels: Vec::new(),
            ai_channels: Vec::new(),
            file: None,
            sample_rate_hz: 0,
            channel_count: 0,
            bit_depth: 0,
            duration_s: 0.0,
            position_samples: 0,
            position_s: 0.0,
            total_samples: 0,
            volume_pct: DEFAULT_VOLUME_PCT,
            muted: false,
            flip_lr_stereo: false,
            loop_mode: LoopMode::None,
            underflow_events: 0,
            error: None,
        }
    }

    pub fn progress_percent(&self) -> f64 {
        if self.total_samples == 0 {
            return 0.0;
        }
        (self.position_samples as f64 / self.total_samples as f64 * 100.0).min(100.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gain_follows_volume_and_mute() {
        let shared = SharedState::default();
        shared.params.lock().volume_pct = 80;
        assert_eq!(shared.gain(), (0.8, false));

        shared.params.lock().muted = true;
        assert_eq!(shared.gain().0, 0.0);

        let mut params = shared.params.lock();
        params.muted = false;
        params.flip_lr_stereo = true;
        drop(params);
        assert_eq!(shared.gain(), (0.8, true));
    }

    #[test]
    fn test_progress_percent_clamps() {
        let mut status = PlayerStatus::idle();
        status.total_samples = 1000;
        status.position_samples = 500;
        assert!((status.progress_percent() - 50.0).abs() < 1e-9);

        status.position_samples = 2000;
        assert_eq!(status.progress_percent(), 100.0);
    }

    #[test]
    fn test_state_serialization() {
        let json = serde_json::to_string(&TransportState::Playing).unwrap();
        assert_eq!(json, "\"playing\"");
    }
}
