//! Transport state machine
//!
//! Owns the playback job and drives every documented transition:
//!
//! ```text
//! Idle ──load──▶ Loaded ──play──▶ Playing ──pause──▶ Paused
//!                   ▲               │  ▲               │
//!                   │             seek  └───play───────┘
//!                   │               ▼
//!  any ──load──▶ (rebuild)       Seeking ──▶ {Playing, Paused}
//!                                   │
//!          Playing ──stream end──▶ Completed ──play──▶ Playing (from 0)
//! ```
//!
//! All mutations serialize through one lock. Status reads go through a
//! published view plus the job's atomics, so they never wait on a
//! mutation in flight.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use dp_core::{seconds_to_samples, ChannelSpec, LoopMode, ValidationError, DEFAULT_FRAMES_PER_BUFFER, DEFAULT_SAMPLES_PER_FRAME, DEFAULT_VOLUME_PCT};
use dp_daq::DeviceRegistry;

use crate::{
    AudioDecoder, AudioSource, FramePump, JobSpec, PlaybackError, PlaybackResult, PlayerStatus,
    PumpHandle, PumpOutcome, SharedState, TransportState,
};

/// Builds a fresh [`AudioSource`] for a path. The default opens the
/// symphonia decoder; tests substitute synthetic sources.
pub type SourceFactory =
    Box<dyn Fn(&Path) -> PlaybackResult<Box<dyn AudioSource>> + Send + Sync>;

/// Parameters accepted by `load_audio`.
#[derive(Debug, Clone)]
pub struct LoadRequest {
    pub file_path: String,
    pub device_name: String,
    pub ao_channels: Vec<String>,
    pub do_channels: Vec<String>,
    pub ai_channels: Vec<String>,
    pub volume_pct: Option<u8>,
    pub samples_per_frame: Option<usize>,
    pub flip_lr_stereo: Option<bool>,
}

struct Job {
    spec: JobSpec,
    shared: Arc<SharedState>,
    /// Primed pump waiting for `play`, and the position it was primed at.
    primed: Option<(FramePump, u64)>,
    running: Option<PumpHandle>,
    /// Where the next session resumes from.
    resume_base: u64,
}

struct Inner {
    state: TransportState,
    job: Option<Job>,
}

/// Published, lock-free-readable view of the transport.
#[derive(Clone, Default)]
struct View {
    state: TransportState,
    file: Option<String>,
    device_name: Option<String>,
    ao_channels: Vec<String>,
    do_channels: Vec<String>,
    ai_channels: Vec<String>,
    sample_rate_hz: u32,
    channel_count: u32,
    bit_depth: u32,
    total_samples: u64,
    duration_s: f64,
    shared: Option<Arc<SharedState>>,
    /// Survives job teardown so a terminal error still reaches `status`.
    error: Option<String>,
}

pub struct Transport {
    registry: Arc<DeviceRegistry>,
    source_factory: SourceFactory,
    inner: Mutex<Inner>,
    view: RwLock<View>,
}

impl Transport {
    pub fn new(registry: Arc<DeviceRegistry>) -> Self {
        Self::with_source_factory(
            registry,
            Box::new(|path: &Path| {
                AudioDecoder::open(path).map(|d| Box::new(d) as Box<dyn AudioSource>)
            }),
        )
    }

    pub fn with_source_factory(registry: Arc<DeviceRegistry>, source_factory: SourceFactory) -> Self {
        Self {
            registry,
            source_factory,
            inner: Mutex::new(Inner {
                state: TransportState::Idle,
                job: None,
            }),
            view: RwLock::new(View::default()),
        }
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    // ───────────────────────────────────────────────────────────────────
    // Transitions
    // ───────────────────────────────────────────────────────────────────

    /// Validate, then full teardown and rebuild: open the decoder, prime
    /// the device buffer, land in `Loaded`. Validation failures leave the
    /// current job untouched.
    pub fn load(&self, request: LoadRequest) -> PlaybackResult<PlayerStatus> {
        let mut inner = self.inner.lock();
        self.reconcile(&mut inner);

        // Everything that can be checked without releasing the device.
        let source = (self.source_factory)(Path::new(&request.file_path))?;
        let device = self
            .registry
            .find(&request.device_name)
            .ok_or_else(|| ValidationError::UnknownDevice(request.device_name.clone()))?;
        let channels = ChannelSpec::new(
            request.ao_channels.clone(),
            request.do_channels.clone(),
            request.ai_channels.clone(),
        );
        self.registry.validate(&device, &channels)?;
        self.registry.validate_rate(&device, source.sample_rate_hz())?;

        // The old job holds the device; release it before rebuilding.
        self.teardown(&mut inner);

        let result = self.load_inner(&mut inner, &request, source, device, channels);
        self.publish(&inner, result.as_ref().err());
        result?;
        Ok(self.compose_status())
    }

    fn load_inner(
        &self,
        inner: &mut Inner,
        request: &LoadRequest,
        source: Box<dyn AudioSource>,
        device: dp_daq::DeviceDescriptor,
        channels: ChannelSpec,
    ) -> PlaybackResult<()> {
        let spec = JobSpec {
            path: PathBuf::from(&request.file_path),
            device,
            channels,
            sample_rate_hz: source.sample_rate_hz(),
            samples_per_frame: request
                .samples_per_frame
                .unwrap_or(DEFAULT_SAMPLES_PER_FRAME),
            frames_per_buffer: DEFAULT_FRAMES_PER_BUFFER,
            channel_count: source.channel_count(),
            bit_depth: source.bit_depth(),
            total_samples: source.total_samples(),
        };

        let shared = Arc::new(SharedState::default());
        {
            let mut params = shared.params.lock();
            params.volume_pct = request.volume_pct.unwrap_or(DEFAULT_VOLUME_PCT).min(100);
            params.flip_lr_stereo = match request.flip_lr_stereo {
                Some(true) if spec.channel_count != 2 => {
                    log::warn!(
                        "flip_lr_stereo ignored: source has {} channels",
                        spec.channel_count
                    );
                    false
                }
                other => other.unwrap_or(false),
            };
        }

        let pump = FramePump::prepare(
            self.registry.driver().as_ref(),
            &spec,
            source,
            Arc::clone(&shared),
            0,
        )?;

        log::info!(
            "Audio loaded: {} ({:.2}s @ {}Hz, {} ch)",
            spec.path.display(),
            spec.duration_s(),
            spec.sample_rate_hz,
            spec.channel_count
        );

        inner.job = Some(Job {
            spec,
            shared,
            primed: Some((pump, 0)),
            running: None,
            resume_base: 0,
        });
        inner.state = TransportState::Loaded;
        Ok(())
    }

    /// Start or restart generation. From `Completed` this implies a seek
    /// to zero; from `Paused` it resumes at the retained position.
    pub fn play(
        &self,
        start_position_s: Option<f64>,
        volume_pct: Option<u8>,
        loop_mode: Option<LoopMode>,
    ) -> PlaybackResult<PlayerStatus> {
        let mut inner = self.inner.lock();
        self.reconcile(&mut inner);

        match inner.state {
            TransportState::Playing => {
                return Err(PlaybackError::InvalidState("Audio is already playing".into()))
            }
            TransportState::Loaded | TransportState::Paused | TransportState::Completed => {}
            _ => {
                return Err(PlaybackError::InvalidState(
                    "No audio file loaded. Load audio first.".into(),
                ))
            }
        }

        let from_completed = inner.state == TransportState::Completed;
        let job = inner.job.as_mut().expect("job exists in loaded states");

        {
            let mut params = job.shared.params.lock();
            if let Some(volume) = volume_pct {
                params.volume_pct = volume.min(100);
            }
            if let Some(mode) = loop_mode {
                params.loop_mode = mode;
            }
        }

        if from_completed {
            job.resume_base = 0;
        }
        if let Some(seconds) = start_position_s {
            let target = seconds_to_samples(seconds, job.spec.sample_rate_hz)
                .min(job.spec.total_samples);
            job.resume_base = target;
        }
        job.shared.completed.store(false, Ordering::Release);
        *job.shared.error.lock() = None;

        let base = job.resume_base;
        let result = self.start_at(job, base);
        match result {
            Ok(()) => {
                inner.state = TransportState::Playing;
                self.publish(&inner, None);
                log::info!("Audio playback started");
                Ok(self.compose_status())
            }
            Err(e) => {
                // A device that refuses to start forces a full release.
                self.teardown(&mut inner);
                self.publish(&inner, Some(&e));
                Err(e)
            }
        }
    }

    /// Stop the tasks and retain the position for resume.
    pub fn pause(&self) -> PlaybackResult<PlayerStatus> {
        let mut inner = self.inner.lock();
        self.reconcile(&mut inner);

        if inner.state != TransportState::Playing {
            return Err(PlaybackError::InvalidState(
                "No audio currently playing".into(),
            ));
        }

        let handle = inner.job.as_mut().and_then(|job| job.running.take());
        if let Some(handle) = handle {
            match handle.stop() {
                PumpOutcome::Stopped => {}
                outcome => {
                    // The pump beat us to it (completion or a fault).
                    self.apply_outcome(&mut inner, outcome);
                    return Ok(self.compose_status());
                }
            }
        }
        if let Some(job) = inner.job.as_mut() {
            job.resume_base = job.shared.position();
            log::info!(
                "Audio playback paused at {:.2}s",
                dp_core::samples_to_seconds(job.resume_base, job.spec.sample_rate_hz)
            );
        }
        inner.state = TransportState::Paused;
        self.publish(&inner, None);
        Ok(self.compose_status())
    }

    /// Resume from `Paused`; errors in any other state.
    pub fn resume(&self) -> PlaybackResult<PlayerStatus> {
        {
            let mut inner = self.inner.lock();
            self.reconcile(&mut inner);
            match inner.state {
                TransportState::Paused => {}
                TransportState::Playing => {
                    return Err(PlaybackError::InvalidState("Audio is already playing".into()))
                }
                _ => {
                    return Err(PlaybackError::InvalidState(
                        "No audio currently paused. Use play to start playback.".into(),
                    ))
                }
            }
        }
        self.play(None, None, None)
    }

    /// Stop, reposition the decoder, refill, and restart if previously
    /// playing.
    pub fn seek_to_sample(&self, target: u64) -> PlaybackResult<PlayerStatus> {
        let mut inner = self.inner.lock();
        self.reconcile(&mut inner);

        match inner.state {
            TransportState::Loaded
            | TransportState::Playing
            | TransportState::Paused
            | TransportState::Completed => {}
            _ => {
                return Err(PlaybackError::InvalidState(
                    "No audio file loaded. Load audio first.".into(),
                ))
            }
        }

        let was_playing = inner.state == TransportState::Playing;
        inner.state = TransportState::Seeking;
        self.publish(&inner, None);

        let job = inner.job.as_mut().expect("seekable states imply a job");
        if let Some(handle) = job.running.take() {
            let _ = handle.stop();
        }
        job.primed = None;

        let target = target.min(job.spec.total_samples);
        job.resume_base = target;
        job.shared.position_samples.store(target, Ordering::Release);
        job.shared.completed.store(false, Ordering::Release);

        let result = if was_playing {
            self.start_at(job, target)
        } else {
            self.prime_at(job, target)
        };

        match result {
            Ok(()) => {
                inner.state = if was_playing {
                    TransportState::Playing
                } else {
                    TransportState::Paused
                };
                self.publish(&inner, None);
                log::info!("Seeked to sample {}", target);
                Ok(self.compose_status())
            }
            Err(e) => {
                self.teardown(&mut inner);
                self.publish(&inner, Some(&e));
                Err(e)
            }
        }
    }

    /// Seek with a time target, in seconds.
    pub fn seek_to_time(&self, seconds: f64) -> PlaybackResult<PlayerStatus> {
        let rate = self.view.read().sample_rate_hz;
        if rate == 0 {
            return Err(PlaybackError::InvalidState(
                "No audio file loaded. Load audio first.".into(),
            ));
        }
        self.seek_to_sample(seconds_to_samples(seconds, rate))
    }

    /// Set the output volume, as an integer percentage.
    pub fn set_volume(&self, volume_pct: u8) -> PlaybackResult<PlayerStatus> {
        let mut inner = self.inner.lock();
        self.reconcile(&mut inner);
        let job = inner.job.as_ref().ok_or_else(|| {
            PlaybackError::InvalidState("No audio player initialized. Load audio first.".into())
        })?;
        job.shared.params.lock().volume_pct = volume_pct.min(100);
        drop(inner);
        Ok(self.compose_status())
    }

    /// Set or query the stereo flip. Takes effect at the next frame
    /// boundary; ignored (with a warning) for non-stereo sources.
    pub fn set_flip_lr_stereo(&self, flip: Option<bool>) -> PlaybackResult<(bool, PlayerStatus)> {
        let mut inner = self.inner.lock();
        self.reconcile(&mut inner);
        let job = inner.job.as_ref().ok_or_else(|| {
            PlaybackError::InvalidState("No audio player initialized. Load audio first.".into())
        })?;

        let current = if let Some(flip) = flip {
            if job.spec.channel_count == 2 {
                job.shared.params.lock().flip_lr_stereo = flip;
                flip
            } else {
                log::warn!(
                    "flip_lr_stereo ignored: source has {} channels",
                    job.spec.channel_count
                );
                job.shared.params.lock().flip_lr_stereo
            }
        } else {
            job.shared.params.lock().flip_lr_stereo
        };
        drop(inner);
        Ok((current, self.compose_status()))
    }

    /// Release the device and decoder; back to `Idle`.
    pub fn terminate(&self) {
        let mut inner = self.inner.lock();
        self.teardown(&mut inner);
        self.publish(&inner, None);
        log::info!("Transport terminated");
    }

    // ───────────────────────────────────────────────────────────────────
    // Reads
    // ───────────────────────────────────────────────────────────────────

    /// Consistent snapshot without waiting on the transport lock. If a
    /// finished pump hasn't been reconciled yet, its completion flag is
    /// still reflected.
    pub fn status(&self) -> PlayerStatus {
        if let Some(mut inner) = self.inner.try_lock() {
            self.reconcile(&mut inner);
            self.publish(&inner, None);
        }
        self.compose_status()
    }

    /// `(position_s, duration_s)` for the loaded asset.
    pub fn position(&self) -> (f64, f64) {
        let status = self.status();
        (status.position_s, status.duration_s)
    }

    pub fn state(&self) -> TransportState {
        self.status().state
    }

    // ───────────────────────────────────────────────────────────────────
    // Internals (inner lock held)
    // ───────────────────────────────────────────────────────────────────

    fn build_pump(&self, job: &Job, start: u64) -> PlaybackResult<FramePump> {
        let source = (self.source_factory)(&job.spec.path)?;
        FramePump::prepare(
            self.registry.driver().as_ref(),
            &job.spec,
            source,
            Arc::clone(&job.shared),
            start,
        )
    }

    fn prime_at(&self, job: &mut Job, start: u64) -> PlaybackResult<()> {
        if !matches!(job.primed, Some((_, at)) if at == start) {
            job.primed = Some((self.build_pump(job, start)?, start));
        }
        Ok(())
    }

    fn start_at(&self, job: &mut Job, start: u64) -> PlaybackResult<()> {
        self.prime_at(job, start)?;
        let (pump, _) = job.primed.take().expect("primed above");
        let handle = pump.start(Arc::new(AtomicBool::new(false)))?;
        job.running = Some(handle);
        Ok(())
    }

    /// Fold in the outcome of a pump that ended on its own.
    fn reconcile(&self, inner: &mut Inner) {
        let finished = inner.job.as_mut().and_then(|job| {
            if job.running.as_ref().is_some_and(|h| h.is_finished()) {
                job.running.take()
            } else {
                None
            }
        });
        if let Some(handle) = finished {
            let outcome = handle.join();
            self.apply_outcome(inner, outcome);
        }
    }

    fn apply_outcome(&self, inner: &mut Inner, outcome: PumpOutcome) {
        match outcome {
            PumpOutcome::Completed => {
                if let Some(job) = inner.job.as_mut() {
                    job.resume_base = job.spec.total_samples;
                    job.running = None;
                }
                inner.state = TransportState::Completed;
                log::info!("Audio playback completed");
            }
            PumpOutcome::UnderflowEscalation => {
                if let Some(job) = inner.job.as_mut() {
                    job.resume_base = job.shared.position();
                    job.running = None;
                    job.shared
                        .set_error("Playback paused after repeated underflows");
                }
                inner.state = TransportState::Paused;
                log::error!("Playback paused after repeated underflows");
            }
            PumpOutcome::DeviceFault(message) => {
                log::error!("Device fault: {}", message);
                self.teardown(inner);
                self.view.write().error = Some(message);
            }
            PumpOutcome::DecoderFault(message) => {
                log::error!("Decoder fault: {}", message);
                self.teardown(inner);
                self.view.write().error = Some(message);
            }
            PumpOutcome::Stopped => {
                if let Some(job) = inner.job.as_mut() {
                    job.resume_base = job.shared.position();
                    job.running = None;
                }
                inner.state = TransportState::Paused;
            }
        }
        self.publish(inner, None);
    }

    fn teardown(&self, inner: &mut Inner) {
        if let Some(mut job) = inner.job.take() {
            if let Some(handle) = job.running.take() {
                let _ = handle.stop();
            }
            job.primed = None;
        }
        inner.state = TransportState::Idle;
    }

    fn publish(&self, inner: &Inner, error: Option<&PlaybackError>) {
        let mut view = self.view.write();
        view.state = inner.state;
        if let Some(e) = error {
            view.error = Some(e.to_string());
        } else if inner.state != TransportState::Idle {
            view.error = None;
        }
        match &inner.job {
            Some(job) => {
                view.file = Some(job.spec.path.display().to_string());
                view.device_name = Some(job.spec.device.name.clone());
                view.ao_channels = job.spec.channels.ao_channels.clone();
                view.do_channels = job.spec.channels.do_channels.clone();
                view.ai_channels = job.spec.channels.ai_channels.clone();
                view.sample_rate_hz = job.spec.sample_rate_hz;
                view.channel_count = job.spec.channel_count as u32;
                view.bit_depth = job.spec.bit_depth;
                view.total_samples = job.spec.total_samples;
                view.duration_s = job.spec.duration_s();
                view.shared = Some(Arc::clone(&job.shared));
            }
            None => {
                let error = view.error.clone();
                *view = View::default();
                view.state = inner.state;
                view.error = error;
            }
        }
    }

    fn compose_status(&self) -> PlayerStatus {
        let view = self.view.read();
        let mut status = PlayerStatus::idle();
        status.state = view.state;
        status.playing = view.state == TransportState::Playing;
        status.file = view.file.clone();
        status.device_name = view.device_name.clone();
        status.ao_channels = view.ao_channels.clone();
        status.do_channels = view.do_channels.clone();
        status.ai_channels = view.ai_channels.clone();
        status.sample_rate_hz = view.sample_rate_hz;
        status.channel_count = view.channel_count;
        status.bit_depth = view.bit_depth;
        status.duration_s = view.duration_s;
        status.total_samples = view.total_samples;
        status.error = view.error.clone();

        if let Some(shared) = &view.shared {
            let params = shared.params.lock().clone();
            status.volume_pct = params.volume_pct;
            status.muted = params.muted;
            status.flip_lr_stereo = params.flip_lr_stereo;
            status.loop_mode = params.loop_mode;
            status.position_samples = shared.position();
            status.position_s =
                dp_core::samples_to_seconds(status.position_samples, view.sample_rate_hz);
            status.audio_completed = shared.completed.load(Ordering::Acquire)
                || view.state == TransportState::Completed;
            status.underflow_events = shared.underflow_events.load(Ordering::Acquire);
            if status.error.is_none() {
                status.error = shared.error.lock().clone();
            }
            // A pump that completed between reconciles still reads as
            // playing in the view; prefer the completion flag.
            if status.audio_completed && status.state == TransportState::Playing {
                status.state = TransportState::Completed;
                status.playing = false;
            }
        }
        status
    }
}
