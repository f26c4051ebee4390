//! Simulated DAQ driver
//!
//! Models one device with a bounded output buffer and a consumer thread
//! that drains it at the configured sample clock rate. Writes block while
//! the buffer is full, exactly like a hardware stream writer, so the frame
//! pump sees realistic backpressure. The clock keeps running when the
//! buffer starves; each starved tick is reported as one underflow.
//!
//! Observability hooks (consumed samples, sync-line level, underflow
//! totals) live on the driver so integration tests can assert on them
//! without holding the session.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rtrb::{Consumer, Producer, RingBuffer};

use crate::{DaqDriver, DaqError, DaqResult, DeviceDescriptor, OutputSession, SessionConfig};

/// How long a blocked write waits before giving up, matching the stream
/// writer timeout used against real hardware.
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

const CONSUMER_TICK: Duration = Duration::from_millis(1);

/// Consumption pacing for the simulated sample clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pace {
    /// Drain at `sample_rate_hz` wall-clock time. Underflows are detected.
    Realtime,
    /// Drain as fast as samples arrive. Never underflows; used by tests
    /// that care about data flow rather than timing.
    Turbo,
}

/// Simulated NI-style DAQ driver.
pub struct SimDriver {
    devices: Vec<DeviceDescriptor>,
    pace: Pace,
    capture: Option<Arc<Mutex<Vec<f32>>>>,
    sync_high: Arc<AtomicBool>,
    total_underflows: Arc<AtomicU32>,
    enumerations: AtomicU32,
    fail_after_samples: Option<u64>,
}

impl SimDriver {
    pub fn new() -> Self {
        Self {
            devices: vec![DeviceDescriptor {
                name: "SimDev1".to_string(),
                product_type: "USB-6363".to_string(),
                product_category: "XSeriesDAQ".to_string(),
                max_ao_rate_hz: 1_000_000.0,
                ao_line_count: 4,
                do_line_count: 8,
            }],
            pace: Pace::Realtime,
            capture: None,
            sync_high: Arc::new(AtomicBool::new(false)),
            total_underflows: Arc::new(AtomicU32::new(0)),
            enumerations: AtomicU32::new(0),
            fail_after_samples: None,
        }
    }

    pub fn with_pace(mut self, pace: Pace) -> Self {
        self.pace = pace;
        self
    }

    /// Record every consumed sample for later inspection.
    pub fn with_capture(mut self) -> Self {
        self.capture = Some(Arc::new(Mutex::new(Vec::new())));
        self
    }

    /// Fail writes once the device has generated this many per-channel
    /// samples, simulating the device being unplugged mid-stream.
    pub fn failing_after(mut self, samples: u64) -> Self {
        self.fail_after_samples = Some(samples);
        self
    }

    /// Samples the device consumed, interleaved across AO lines.
    pub fn captured(&self) -> Vec<f32> {
        self.capture
            .as_ref()
            .map(|c| c.lock().clone())
            .unwrap_or_default()
    }

    /// Current TTL sync level.
    pub fn sync_lines_high(&self) -> bool {
        self.sync_high.load(Ordering::Acquire)
    }

    /// Underflow events across all sessions of this driver.
    pub fn underflow_total(&self) -> u32 {
        self.total_underflows.load(Ordering::Relaxed)
    }

    /// How many times the driver has been asked to enumerate.
    pub fn enumeration_count(&self) -> u32 {
        self.enumerations.load(Ordering::Relaxed)
    }
}

impl Default for SimDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl DaqDriver for SimDriver {
    fn devices(&self) -> DaqResult<Vec<DeviceDescriptor>> {
        self.enumerations.fetch_add(1, Ordering::Relaxed);
        Ok(self.devices.clone())
    }

    fn driver_version(&self) -> Option<String> {
        Some("SimDAQmx 1.0.0".to_string())
    }

    fn open(&self, config: &SessionConfig) -> DaqResult<Box<dyn OutputSession>> {
        if !self.devices.iter().any(|d| d.name == config.device_name) {
            return Err(DaqError::DeviceNotFound(config.device_name.clone()));
        }

        let ao_count = config.channels.ao_count();
        let capacity = config.buffer_capacity();
        let (producer, consumer) = RingBuffer::new(capacity);

        let shared = Arc::new(SimShared {
            consumed: AtomicU64::new(0),
            underflows: AtomicU32::new(0),
            running: AtomicBool::new(false),
            alive: AtomicBool::new(true),
        });

        let clock = SimClock {
            consumer,
            shared: Arc::clone(&shared),
            pace: self.pace,
            sample_rate_hz: config.sample_rate_hz,
            ao_count,
            capture: self.capture.clone(),
            total_underflows: Arc::clone(&self.total_underflows),
        };
        let thread = thread::Builder::new()
            .name("sim-daq-clock".to_string())
            .spawn(move || clock.run())
            .map_err(|e| DaqError::TaskCreation(e.to_string()))?;

        Ok(Box::new(SimSession {
            producer,
            shared,
            thread: Some(thread),
            ao_count,
            sync_high: Arc::clone(&self.sync_high),
            fail_after_samples: self.fail_after_samples,
        }))
    }
}

struct SimShared {
    /// Interleaved samples the clock has generated.
    consumed: AtomicU64,
    /// Underflows since the pump last collected them.
    underflows: AtomicU32,
    running: AtomicBool,
    alive: AtomicBool,
}

struct SimSession {
    producer: Producer<f32>,
    shared: Arc<SimShared>,
    thread: Option<thread::JoinHandle<()>>,
    ao_count: usize,
    sync_high: Arc<AtomicBool>,
    fail_after_samples: Option<u64>,
}

impl OutputSession for SimSession {
    fn start(&mut self) -> DaqResult<()> {
        self.shared.running.store(true, Ordering::Release);
        Ok(())
    }

    fn stop(&mut self) -> DaqResult<()> {
        self.shared.running.store(false, Ordering::Release);
        Ok(())
    }

    fn write(&mut self, interleaved: &[f32]) -> DaqResult<()> {
        if let Some(limit) = self.fail_after_samples {
            if self.samples_generated() >= limit {
                return Err(DaqError::Disconnected("SimDev1".to_string()));
            }
        }

        let deadline = Instant::now() + WRITE_TIMEOUT;
        let mut offset = 0;

        while offset < interleaved.len() {
            let n = self.producer.slots().min(interleaved.len() - offset);
            if n == 0 {
                if Instant::now() > deadline {
                    return Err(DaqError::WriteTimeout(WRITE_TIMEOUT.as_millis() as u64));
                }
                thread::sleep(Duration::from_micros(500));
                continue;
            }
            if let Ok(chunk) = self.producer.write_chunk_uninit(n) {
                chunk.fill_from_iter(interleaved[offset..offset + n].iter().copied());
                offset += n;
            }
        }

        Ok(())
    }

    fn set_sync_lines(&mut self, high: bool) -> DaqResult<()> {
        self.sync_high.store(high, Ordering::Release);
        Ok(())
    }

    fn samples_generated(&self) -> u64 {
        self.shared.consumed.load(Ordering::Acquire) / self.ao_count as u64
    }

    fn buffer_slots(&self) -> usize {
        self.producer.slots()
    }

    fn take_underflows(&mut self) -> u32 {
        self.shared.underflows.swap(0, Ordering::AcqRel)
    }
}

impl Drop for SimSession {
    fn drop(&mut self) {
        self.shared.running.store(false, Ordering::Release);
        self.shared.alive.store(false, Ordering::Release);
        self.sync_high.store(false, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// The simulated sample clock: one thread per session.
struct SimClock {
    consumer: Consumer<f32>,
    shared: Arc<SimShared>,
    pace: Pace,
    sample_rate_hz: u32,
    ao_count: usize,
    capture: Option<Arc<Mutex<Vec<f32>>>>,
    total_underflows: Arc<AtomicU32>,
}

impl SimClock {
    fn run(mut self) {
        let mut due_frames = 0.0f64;
        let mut last_tick = Instant::now();

        while self.shared.alive.load(Ordering::Acquire) {
            thread::sleep(CONSUMER_TICK);
            let now = Instant::now();

            if !self.shared.running.load(Ordering::Acquire) {
                // Clock is stopped; don't accrue time against the buffer.
                last_tick = now;
                due_frames = 0.0;
                continue;
            }

            let elapsed = now.duration_since(last_tick).as_secs_f64();
            last_tick = now;

            let want_frames = match self.pace {
                Pace::Realtime => {
                    due_frames += elapsed * f64::from(self.sample_rate_hz);
                    let whole = due_frames.floor() as usize;
                    due_frames -= whole as f64;
                    whole
                }
                Pace::Turbo => self.consumer.slots() / self.ao_count,
            };
            if want_frames == 0 {
                continue;
            }

            let want = want_frames * self.ao_count;
            let avail = self.consumer.slots().min(want);

            if avail > 0 {
                if let Ok(chunk) = self.consumer.read_chunk(avail) {
                    if let Some(capture) = &self.capture {
                        capture.lock().extend(chunk.into_iter());
                    } else {
                        chunk.into_iter().for_each(drop);
                    }
                }
            }

            if avail < want && self.pace == Pace::Realtime {
                // The device consumed samples the host never wrote.
                self.shared.underflows.fetch_add(1, Ordering::AcqRel);
                self.total_underflows.fetch_add(1, Ordering::Relaxed);
            }

            // The hardware clock advances regardless; a starved interval is
            // regenerated output on a real device.
            self.shared.consumed.fetch_add(want as u64, Ordering::AcqRel);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dp_core::ChannelSpec;

    fn stereo_config(rate: u32) -> SessionConfig {
        let mut config = SessionConfig::new("SimDev1", ChannelSpec::default(), rate);
        config.samples_per_frame = 256;
        config.frames_per_buffer = 4;
        config
    }

    #[test]
    fn test_write_then_drain() {
        let driver = SimDriver::new().with_pace(Pace::Turbo).with_capture();
        let mut session = driver.open(&stereo_config(48_000)).unwrap();

        let frame: Vec<f32> = (0..512).map(|i| i as f32 / 512.0).collect();
        session.write(&frame).unwrap();
        session.start().unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while session.samples_generated() < 256 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(2));
        }

        assert_eq!(session.samples_generated(), 256);
        drop(session);
        assert_eq!(driver.captured(), frame);
    }

    #[test]
    fn test_unknown_device_rejected() {
        let driver = SimDriver::new();
        let config = SessionConfig::new("Dev9", ChannelSpec::default(), 48_000);
        assert!(matches!(
            driver.open(&config),
            Err(DaqError::DeviceNotFound(_))
        ));
    }

    #[test]
    fn test_sync_lines_follow_commands() {
        let driver = SimDriver::new();
        let mut session = driver.open(&stereo_config(48_000)).unwrap();

        assert!(!driver.sync_lines_high());
        session.set_sync_lines(true).unwrap();
        assert!(driver.sync_lines_high());
        session.set_sync_lines(false).unwrap();
        assert!(!driver.sync_lines_high());
    }

    #[test]
    fn test_starved_clock_reports_underflow() {
        let driver = SimDriver::new();
        let mut session = driver.open(&stereo_config(96_000)).unwrap();

        // Prime far less than one tick's worth, then let the clock run dry.
        session.write(&vec![0.1f32; 64]).unwrap();
        session.start().unwrap();
        thread::sleep(Duration::from_millis(50));
        session.stop().unwrap();

        assert!(session.take_underflows() > 0);
        assert!(driver.underflow_total() > 0);
    }

    #[test]
    fn test_stopped_clock_consumes_nothing() {
        let driver = SimDriver::new();
        let mut session = driver.open(&stereo_config(48_000)).unwrap();

        session.write(&vec![0.5f32; 128]).unwrap();
        thread::sleep(Duration::from_millis(20));
        assert_eq!(session.samples_generated(), 0);
        assert_eq!(session.buffer_slots(), 256 * 4 * 2 - 128);
    }
}
