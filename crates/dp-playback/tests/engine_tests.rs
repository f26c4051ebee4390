//! Playback engine integration tests
//!
//! Drives the full Transport → FramePump → OutputSession path against the
//! simulated DAQ driver:
//! - mono fan-out across four AO lines
//! - stereo mapping and mid-playback flip at a frame boundary
//! - seek during playback and from pause
//! - underflow escalation with a stalling source
//! - device disappearance mid-stream
//! - high-rate multi-channel completion without underflows

use std::sync::Arc;
use std::time::{Duration, Instant};

use dp_core::Sample;
use dp_daq::{DaqDriver, DeviceRegistry, Pace, SimDriver};
use dp_playback::{
    AudioSource, LoadRequest, PlaybackResult, SourceFactory, Transport, TransportState,
};

// ═══════════════════════════════════════════════════════════════════════════════
// HELPERS
// ═══════════════════════════════════════════════════════════════════════════════

/// Deterministic per-channel sample value, so captured device output can
/// be traced back to (frame, channel).
fn tone(frame: u64, channel: usize) -> Sample {
    let base = [0.25, -0.5, 0.1, 0.15][channel % 4];
    base + (frame % 50) as f32 * 0.001
}

/// Synthetic finite source producing `tone` values.
struct ToneSource {
    channels: usize,
    sample_rate_hz: u32,
    total: u64,
    pos: u64,
}

impl ToneSource {
    fn new(channels: usize, sample_rate_hz: u32, total: u64) -> Self {
        Self {
            channels,
            sample_rate_hz,
            total,
            pos: 0,
        }
    }
}

impl AudioSource for ToneSource {
    fn read_into(&mut self, dest: &mut [Sample], max_frames: usize) -> PlaybackResult<usize> {
        let remaining = (self.total - self.pos) as usize;
        let frames = max_frames.min(remaining);
        for f in 0..frames {
            for c in 0..self.channels {
                dest[f * self.channels + c] = tone(self.pos + f as u64, c);
            }
        }
        self.pos += frames as u64;
        Ok(frames)
    }

    fn seek_to_sample(&mut self, sample: u64) -> PlaybackResult<()> {
        self.pos = sample.min(self.total);
        Ok(())
    }

    fn total_samples(&self) -> u64 {
        self.total
    }

    fn sample_rate_hz(&self) -> u32 {
        self.sample_rate_hz
    }

    fn channel_count(&self) -> usize {
        self.channels
    }

    fn bit_depth(&self) -> u32 {
        16
    }
}

/// A source that cannot currently yield samples: every read is short.
struct StallingSource {
    sample_rate_hz: u32,
}

impl AudioSource for StallingSource {
    fn read_into(&mut self, _dest: &mut [Sample], _max_frames: usize) -> PlaybackResult<usize> {
        Ok(0)
    }

    fn seek_to_sample(&mut self, _sample: u64) -> PlaybackResult<()> {
        Ok(())
    }

    fn total_samples(&self) -> u64 {
        u64::MAX / 2
    }

    fn sample_rate_hz(&self) -> u32 {
        self.sample_rate_hz
    }

    fn channel_count(&self) -> usize {
        1
    }

    fn bit_depth(&self) -> u32 {
        16
    }
}

fn tone_factory(channels: usize, sample_rate_hz: u32, total: u64) -> SourceFactory {
    Box::new(move |_| {
        Ok(Box::new(ToneSource::new(channels, sample_rate_hz, total)) as Box<dyn AudioSource>)
    })
}

fn engine(driver: SimDriver, factory: SourceFactory) -> (Transport, Arc<SimDriver>) {
    let driver = Arc::new(driver);
    let registry = DeviceRegistry::new(Arc::clone(&driver) as Arc<dyn DaqDriver>);
    let transport = Transport::with_source_factory(Arc::new(registry), factory);
    (transport, driver)
}

fn load_request(ao: &[&str], samples_per_frame: usize) -> LoadRequest {
    LoadRequest {
        file_path: "/assets/take.wav".to_string(),
        device_name: "SimDev1".to_string(),
        ao_channels: ao.iter().map(|s| s.to_string()).collect(),
        do_channels: vec!["port0/line0".to_string(), "port0/line1".to_string()],
        ai_channels: vec![],
        volume_pct: Some(100),
        samples_per_frame: Some(samples_per_frame),
        flip_lr_stereo: None,
    }
}

fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    check()
}

// ═══════════════════════════════════════════════════════════════════════════════
// MONO FAN-OUT
// ═══════════════════════════════════════════════════════════════════════════════

#[test]
fn test_mono_fanout_to_four_lines() {
    let total = 2048u64;
    let (transport, driver) = engine(
        SimDriver::new().with_pace(Pace::Turbo).with_capture(),
        tone_factory(1, 48_000, total),
    );

    transport
        .load(load_request(&["ao0", "ao1", "ao2", "ao3"], 256))
        .expect("load should succeed");
    assert_eq!(transport.state(), TransportState::Loaded);

    transport.play(None, None, None).expect("play should succeed");
    assert!(
        wait_until(Duration::from_secs(5), || transport.status().audio_completed),
        "playback should complete"
    );

    let status = transport.status();
    assert_eq!(status.state, TransportState::Completed);
    assert_eq!(
        status.position_samples, total,
        "position at Completed must equal total_samples"
    );
    assert!(!driver.sync_lines_high(), "DO lines must be LOW after completion");
    assert_eq!(driver.underflow_total(), 0);

    // Every AO line carries the mono signal.
    let captured = driver.captured();
    assert!(captured.len() >= total as usize * 4);
    for frame in 0..total as usize {
        let expected = tone(frame as u64, 0);
        for line in 0..4 {
            assert_eq!(
                captured[frame * 4 + line],
                expected,
                "frame {} line {}",
                frame,
                line
            );
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// STEREO + FLIP
// ═══════════════════════════════════════════════════════════════════════════════

#[test]
fn test_stereo_flip_applies_at_frame_boundary() {
    let sample_rate = 192_000;
    let total = 96_000u64; // 0.5 s
    let spf = 4096usize;
    let (transport, driver) = engine(
        SimDriver::new().with_capture(),
        tone_factory(2, sample_rate, total),
    );

    transport
        .load(load_request(&["ao0", "ao1", "ao2", "ao3"], spf))
        .unwrap();
    transport.play(None, None, None).unwrap();
    assert!(driver.sync_lines_high(), "DO lines must be HIGH while Playing");

    std::thread::sleep(Duration::from_millis(120));
    let position_before = transport.status().position_samples;
    let (flipped, _) = transport.set_flip_lr_stereo(Some(true)).unwrap();
    assert!(flipped);

    assert!(
        wait_until(Duration::from_secs(10), || transport.status().audio_completed),
        "playback should complete"
    );
    let status = transport.status();
    assert!(status.position_samples >= position_before, "no position rollback");
    assert!(!driver.sync_lines_high());

    // Each device frame is either [L R L R] or [R L R L]; the flip never
    // splits a frame, and both orientations must occur.
    let captured = driver.captured();
    assert!(captured.len() >= total as usize * 4);
    let mut saw_normal = false;
    let mut saw_flipped = false;
    for (index, quad) in captured[..total as usize * 4].chunks_exact(4).enumerate() {
        let frame = index as u64;
        let normal = [tone(frame, 0), tone(frame, 1), tone(frame, 0), tone(frame, 1)];
        let swapped = [tone(frame, 1), tone(frame, 0), tone(frame, 1), tone(frame, 0)];
        if quad == normal.as_slice() {
            saw_normal = true;
        } else if quad == swapped.as_slice() {
            saw_flipped = true;
        } else {
            panic!("frame {} mixes stereo orientations: {:?}", frame, quad);
        }
    }
    assert!(saw_normal, "pre-flip frames should be L-first");
    assert!(saw_flipped, "post-flip frames should be R-first");
}

// ═══════════════════════════════════════════════════════════════════════════════
// SEEK
// ═══════════════════════════════════════════════════════════════════════════════

#[test]
fn test_seek_while_playing_resumes_from_target() {
    let sample_rate = 48_000;
    let total = 480_000u64; // 10 s
    let (transport, _driver) = engine(SimDriver::new(), tone_factory(2, sample_rate, total));

    transport.load(load_request(&["ao0", "ao1"], 8192)).unwrap();
    transport.play(None, None, None).unwrap();
    std::thread::sleep(Duration::from_millis(100));

    let target_s = 9.9;
    let status = transport.seek_to_time(target_s).unwrap();
    assert_eq!(status.state, TransportState::Playing, "seek keeps playing");
    let target = (target_s * f64::from(sample_rate)) as u64;
    assert!(
        status.position_samples.abs_diff(target) <= 8192,
        "reported position {} should be within one frame of {}",
        status.position_samples,
        target
    );

    assert!(
        wait_until(Duration::from_secs(5), || transport.status().audio_completed),
        "the remaining 0.1s should finish quickly"
    );
    assert_eq!(transport.status().position_samples, total);
}

#[test]
fn test_seek_while_paused_stays_paused() {
    let (transport, _driver) = engine(SimDriver::new(), tone_factory(2, 44_100, 2_646_000));

    transport.load(load_request(&["ao0", "ao1"], 8192)).unwrap();
    transport.play(None, None, None).unwrap();
    transport.pause().unwrap();

    let target = (45.5 * 44_100.0) as u64;
    let status = transport.seek_to_sample(target).unwrap();
    assert_eq!(status.state, TransportState::Paused);
    assert_eq!(status.position_samples, target);

    let (position_s, duration_s) = transport.position();
    assert!((position_s - 45.5).abs() < 0.2);
    assert!((duration_s - 60.0).abs() < 0.01);
}

// ═══════════════════════════════════════════════════════════════════════════════
// UNDERFLOW ESCALATION
// ═══════════════════════════════════════════════════════════════════════════════

#[test]
fn test_stalling_source_escalates_to_paused_with_error() {
    let (transport, _driver) = engine(
        SimDriver::new().with_pace(Pace::Turbo),
        Box::new(|_| {
            Ok(Box::new(StallingSource { sample_rate_hz: 48_000 }) as Box<dyn AudioSource>)
        }),
    );

    transport.load(load_request(&["ao0", "ao1"], 1024)).unwrap();
    transport.play(None, None, None).unwrap();

    assert!(
        wait_until(Duration::from_secs(5), || {
            transport.status().state == TransportState::Paused
        }),
        "repeated short reads should pause playback"
    );
    let status = transport.status();
    assert!(status.underflow_events >= 3, "one event per starved frame");
    assert!(
        status.error.is_some(),
        "the pause must carry an error field"
    );
}

// ═══════════════════════════════════════════════════════════════════════════════
// DEVICE DISAPPEARANCE
// ═══════════════════════════════════════════════════════════════════════════════

#[test]
fn test_device_disappearance_forces_idle() {
    let (transport, driver) = engine(
        SimDriver::new().with_pace(Pace::Turbo).failing_after(4096),
        tone_factory(2, 48_000, 480_000),
    );

    transport.load(load_request(&["ao0", "ao1"], 1024)).unwrap();
    transport.play(None, None, None).unwrap();

    assert!(
        wait_until(Duration::from_secs(5), || {
            transport.status().state == TransportState::Idle
        }),
        "a device fault must force Idle"
    );
    let status = transport.status();
    assert!(status.error.is_some(), "fault must be surfaced");
    assert!(!driver.sync_lines_high(), "DO lines commanded LOW");
    assert!(!status.playing);
}

// ═══════════════════════════════════════════════════════════════════════════════
// HIGH-RATE PLAYBACK
// ═══════════════════════════════════════════════════════════════════════════════

#[test]
fn test_high_rate_four_channel_run() {
    let total = 500_000u64; // 2 s at 250 kHz
    let (transport, driver) = engine(
        SimDriver::new().with_pace(Pace::Turbo),
        tone_factory(4, 250_000, total),
    );

    transport
        .load(load_request(&["ao0", "ao1", "ao2", "ao3"], 8192))
        .unwrap();
    transport.play(None, None, None).unwrap();

    assert!(
        wait_until(Duration::from_secs(30), || transport.status().audio_completed),
        "high-rate run should complete"
    );
    let status = transport.status();
    assert_eq!(status.position_samples, total);
    assert_eq!(status.underflow_events, 0, "no underflows expected");
    assert_eq!(driver.underflow_total(), 0);
}

// ═══════════════════════════════════════════════════════════════════════════════
// TRANSITION GUARDS
// ═══════════════════════════════════════════════════════════════════════════════

#[test]
fn test_guards_reject_invalid_transitions() {
    let (transport, _driver) = engine(SimDriver::new(), tone_factory(2, 48_000, 48_000));

    assert!(transport.play(None, None, None).is_err(), "play before load");
    assert!(transport.pause().is_err(), "pause before load");
    assert!(transport.set_volume(50).is_err(), "volume before load");

    transport.load(load_request(&["ao0", "ao1"], 4096)).unwrap();
    assert!(transport.pause().is_err(), "pause while merely Loaded");

    transport.play(None, None, None).unwrap();
    assert!(
        transport.play(None, None, None).is_err(),
        "play while already Playing"
    );
}

#[test]
fn test_completed_play_restarts_from_zero() {
    let total = 24_000u64;
    let (transport, _driver) = engine(
        SimDriver::new().with_pace(Pace::Turbo),
        tone_factory(1, 48_000, total),
    );

    transport.load(load_request(&["ao0"], 2048)).unwrap();
    transport.play(None, None, None).unwrap();
    assert!(wait_until(Duration::from_secs(5), || {
        transport.status().audio_completed
    }));

    // play from Completed implies an implicit seek to zero.
    transport.play(None, None, None).unwrap();
    let status = transport.status();
    assert!(status.playing || status.audio_completed);
    assert!(wait_until(Duration::from_secs(5), || {
        transport.status().audio_completed
    }));
    assert_eq!(transport.status().position_samples, total);
}
