//! dp-core: Shared types for the daqplay workspace
//!
//! Foundational types used across all daqplay crates: the sample type,
//! channel specifications, and the validation error taxonomy.

mod channel;
mod error;

pub use channel::*;
pub use error::*;

/// Audio sample type used throughout the pipeline.
///
/// Decoders produce f32 in [-1, 1]; the driver converts to device-native
/// voltage and clips anything outside the range silently.
pub type Sample = f32;

/// Default callback granularity (source frames per write).
pub const DEFAULT_SAMPLES_PER_FRAME: usize = 8192;

/// Default number of frames pre-queued in the device buffer.
pub const DEFAULT_FRAMES_PER_BUFFER: usize = 10;

/// Default control socket port.
pub const DEFAULT_CONTROL_PORT: u16 = 21749;

/// Default volume on load, in percent.
pub const DEFAULT_VOLUME_PCT: u8 = 20;

/// Convert a sample position to seconds at the given rate.
#[inline]
pub fn samples_to_seconds(samples: u64, sample_rate_hz: u32) -> f64 {
    if sample_rate_hz == 0 {
        return 0.0;
    }
    samples as f64 / sample_rate_hz as f64
}

/// Convert a time in seconds to the nearest sample position.
#[inline]
pub fn seconds_to_samples(seconds: f64, sample_rate_hz: u32) -> u64 {
    (seconds.max(0.0) * sample_rate_hz as f64).round() as u64
}

/// Loop mode requested by a client.
///
/// Echoed through status replies; the engine itself plays `None` semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoopMode {
    #[default]
    None,
    All,
    One,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_time_round_trip() {
        let samples = seconds_to_samples(45.5, 44100);
        assert_eq!(samples, 2_006_550);
        assert!((samples_to_seconds(samples, 44100) - 45.5).abs() < 1e-9);
    }

    #[test]
    fn test_zero_rate_is_zero_seconds() {
        assert_eq!(samples_to_seconds(48000, 0), 0.0);
    }
}
