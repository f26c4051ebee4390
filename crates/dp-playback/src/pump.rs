//! Frame pump: the dedicated audio thread
//!
//! Owns the AO + DO session and drains the decoder through the channel
//! mapper into the device buffer, one frame of `samples_per_frame` source
//! frames at a time. The blocking device write is the pump's only
//! suspension point and provides the every-N-samples cadence.
//!
//! The steady path never allocates: source and output buffers are sized
//! once, and the two output buffers rotate between writes.
//!
//! Failure policy (see the transport for the resulting transitions):
//! - short read or hardware write-too-late: zero-pad, record one
//!   underflow event, keep going; three consecutive events within two
//!   seconds stop the session with [`PumpOutcome::UnderflowEscalation`]
//! - decoder error mid-stream: zero-pad and retry once via a seek to the
//!   current position; a second failure ends the run
//! - device error: ends the run immediately

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use dp_core::Sample;
use dp_daq::{DaqDriver, OutputSession, SessionConfig};

use crate::{AudioSource, ChannelMapper, JobSpec, PlaybackResult, SharedState};

/// Consecutive underflow events that trigger escalation.
const UNDERFLOW_ESCALATION_COUNT: u32 = 3;
/// Window the consecutive events must fall into.
const UNDERFLOW_ESCALATION_WINDOW: Duration = Duration::from_secs(2);

/// How a pump run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PumpOutcome {
    /// Stopped on request; position retained.
    Stopped,
    /// Every source sample was generated by the device.
    Completed,
    /// Repeated underflows; the transport pauses with an error.
    UnderflowEscalation,
    /// The device or driver failed; the transport goes idle.
    DeviceFault(String),
    /// The decoder failed twice in a row; playback terminates.
    DecoderFault(String),
}

/// A primed, startable pump: session open, decoder positioned, device
/// buffer pre-filled.
pub struct FramePump {
    session: Box<dyn OutputSession>,
    source: Box<dyn AudioSource>,
    mapper: ChannelMapper,
    shared: Arc<SharedState>,

    samples_per_frame: usize,
    ao_count: usize,
    total_samples: u64,
    /// Absolute source position of the first sample this session plays.
    start_sample: u64,
    /// Source frames handed out by the decoder so far.
    frames_consumed: u64,

    src_buf: Vec<Sample>,
    out_bufs: [Vec<Sample>; 2],
    out_index: usize,
}

impl FramePump {
    /// Open a session on the job's device, position the decoder, and
    /// pre-fill the device buffer so `start` can begin generating
    /// immediately.
    pub fn prepare(
        driver: &dyn DaqDriver,
        spec: &JobSpec,
        mut source: Box<dyn AudioSource>,
        shared: Arc<SharedState>,
        start_sample: u64,
    ) -> PlaybackResult<Self> {
        let config = SessionConfig {
            device_name: spec.device.name.clone(),
            channels: spec.channels.clone(),
            sample_rate_hz: spec.sample_rate_hz,
            samples_per_frame: spec.samples_per_frame,
            frames_per_buffer: spec.frames_per_buffer,
        };
        let session = driver.open(&config)?;

        let start_sample = start_sample.min(spec.total_samples);
        if start_sample > 0 {
            source.seek_to_sample(start_sample)?;
        }

        let ao_count = spec.channels.ao_count();
        let frame_len = spec.samples_per_frame * ao_count;
        let mut pump = Self {
            session,
            source,
            mapper: ChannelMapper::new(spec.channel_count, ao_count),
            shared,
            samples_per_frame: spec.samples_per_frame,
            ao_count,
            total_samples: spec.total_samples,
            start_sample,
            frames_consumed: 0,
            src_buf: vec![0.0; spec.samples_per_frame * spec.channel_count],
            out_bufs: [vec![0.0; frame_len], vec![0.0; frame_len]],
            out_index: 0,
        };

        pump.shared
            .position_samples
            .store(start_sample, Ordering::Release);
        for _ in 0..spec.frames_per_buffer {
            pump.prime_one_frame()?;
        }

        Ok(pump)
    }

    /// Raise the sync lines, start the sample clock, and hand the pump to
    /// its own thread.
    pub fn start(mut self, stop: Arc<AtomicBool>) -> PlaybackResult<PumpHandle> {
        self.session.set_sync_lines(true)?;
        self.session.start()?;

        let flag = Arc::clone(&stop);
        let thread = thread::Builder::new()
            .name("audio-pump".to_string())
            .spawn(move || self.run(flag))
            .map_err(|e| crate::PlaybackError::Internal(e.to_string()))?;

        Ok(PumpHandle {
            stop,
            thread: Some(thread),
        })
    }

    fn eos(&self) -> bool {
        self.start_sample + self.frames_consumed >= self.total_samples
    }

    /// Decode and queue one frame without underflow accounting (priming
    /// happens before the clock runs).
    fn prime_one_frame(&mut self) -> PlaybackResult<()> {
        let (gain, flip) = self.shared.gain();
        let frames = if self.eos() {
            0
        } else {
            self.source
                .read_into(&mut self.src_buf, self.samples_per_frame)?
        };
        self.frames_consumed += frames as u64;

        let out = &mut self.out_bufs[self.out_index];
        self.out_index ^= 1;
        self.mapper.map_into(&self.src_buf, frames, gain, flip, out);
        out[frames * self.ao_count..].fill(0.0);

        self.session.write(out)?;
        Ok(())
    }

    fn run(mut self, stop: Arc<AtomicBool>) -> PumpOutcome {
        let mut consecutive_underflows = 0u32;
        let mut window_start = Instant::now();
        let mut decode_retry_armed = false;

        loop {
            if stop.load(Ordering::Acquire) {
                self.shutdown();
                return PumpOutcome::Stopped;
            }

            let (gain, flip) = self.shared.gain();

            // 1. Read up to one frame of source audio.
            let frames = if self.eos() {
                0
            } else {
                match self
                    .source
                    .read_into(&mut self.src_buf, self.samples_per_frame)
                {
                    Ok(frames) => {
                        decode_retry_armed = false;
                        frames
                    }
                    Err(e) if !decode_retry_armed => {
                        // One recovery attempt: re-seek to where we are and
                        // pad this frame with silence.
                        log::warn!("Decoder error mid-stream, retrying: {}", e);
                        decode_retry_armed = true;
                        let position = self.start_sample + self.frames_consumed;
                        if let Err(seek_err) = self.source.seek_to_sample(position) {
                            self.shutdown();
                            return PumpOutcome::DecoderFault(seek_err.to_string());
                        }
                        0
                    }
                    Err(e) => {
                        self.shutdown();
                        return PumpOutcome::DecoderFault(e.to_string());
                    }
                }
            };
            self.frames_consumed += frames as u64;

            // 2. Underflow accounting: a hardware write-too-late or a short
            // read before end of stream both count as one event.
            let hardware_underflows = self.session.take_underflows();
            let starved = hardware_underflows > 0
                || (frames < self.samples_per_frame && !self.eos());
            if starved {
                self.shared.underflow_events.fetch_add(1, Ordering::AcqRel);
                if consecutive_underflows == 0
                    || window_start.elapsed() > UNDERFLOW_ESCALATION_WINDOW
                {
                    consecutive_underflows = 0;
                    window_start = Instant::now();
                }
                consecutive_underflows += 1;
                log::warn!(
                    "Underflow ({} consecutive, {} hardware)",
                    consecutive_underflows,
                    hardware_underflows
                );
                if consecutive_underflows >= UNDERFLOW_ESCALATION_COUNT {
                    self.shutdown();
                    return PumpOutcome::UnderflowEscalation;
                }
            } else {
                consecutive_underflows = 0;
            }

            // 3. Map into the rotating output buffer, zero-padding the tail.
            let out_index = self.out_index;
            self.out_index ^= 1;
            {
                let out = &mut self.out_bufs[out_index];
                self.mapper.map_into(&self.src_buf, frames, gain, flip, out);
                out[frames * self.ao_count..].fill(0.0);
            }

            // 4. Queue into the device; blocks while the buffer is full.
            if let Err(e) = self.session.write(&self.out_bufs[out_index]) {
                log::error!("Device write failed: {}", e);
                self.shutdown();
                return PumpOutcome::DeviceFault(e.to_string());
            }

            // 5. Advance the published position from the device's counter.
            let generated = self.start_sample + self.session.samples_generated();
            self.shared
                .position_samples
                .store(generated.min(self.total_samples), Ordering::Release);

            // 6. Once the last real sample has been generated (not merely
            // queued), finish.
            if self.eos() && generated >= self.total_samples {
                self.shared
                    .position_samples
                    .store(self.total_samples, Ordering::Release);
                self.shared.completed.store(true, Ordering::Release);
                self.shutdown();
                return PumpOutcome::Completed;
            }
        }
    }

    fn shutdown(&mut self) {
        if let Err(e) = self.session.set_sync_lines(false) {
            log::warn!("Failed to drop sync lines: {}", e);
        }
        if let Err(e) = self.session.stop() {
            log::warn!("Failed to stop session: {}", e);
        }
    }
}

/// Handle to a running pump thread.
pub struct PumpHandle {
    stop: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<PumpOutcome>>,
}

impl PumpHandle {
    /// Whether the audio thread has already returned on its own.
    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().map_or(true, |t| t.is_finished())
    }

    /// Request a stop and wait for the thread's outcome.
    pub fn stop(mut self) -> PumpOutcome {
        self.stop.store(true, Ordering::Release);
        self.join_inner()
    }

    /// Wait for the outcome without requesting a stop.
    pub fn join(mut self) -> PumpOutcome {
        self.join_inner()
    }

    fn join_inner(&mut self) -> PumpOutcome {
        match self.thread.take() {
            Some(thread) => thread
                .join()
                .unwrap_or_else(|_| PumpOutcome::DeviceFault("audio thread panicked".into())),
            None => PumpOutcome::Stopped,
        }
    }
}

impl Drop for PumpHandle {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}
