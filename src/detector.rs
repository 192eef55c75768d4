//! Background pitch detection
//!
//! [`PitchDetectionService`] owns a single capture thread that reads frames
//! from a [`FrameSource`], runs them through a [`PitchEstimator`] and publishes
//! the latest [`PitchSample`]. Readers never block on the capture thread.

use anyhow::Result;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError};
use log::{debug, error, info, trace, warn};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::audio::{AudioInput, FrameRead, FrameSource};
use crate::config::Config;
use crate::pitch::{frequency_to_note, Note, PitchEstimator};

/// One pitch reading, produced per analysed frame
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PitchSample {
    /// Estimated fundamental; 0.0 when no pitch was found
    pub frequency_hz: f32,
    #[serde(serialize_with = "serialize_note")]
    pub note: Option<Note>,
}

fn serialize_note<S: serde::Serializer>(note: &Option<Note>, s: S) -> Result<S::Ok, S::Error> {
    match note {
        Some(note) => s.serialize_some(&note.to_string()),
        None => s.serialize_none(),
    }
}

impl PitchSample {
    /// The "no signal" reading
    pub const SILENT: PitchSample = PitchSample {
        frequency_hz: 0.0,
        note: None,
    };

    pub fn from_frequency(frequency_hz: f32, reference_hz: f32) -> Self {
        Self {
            frequency_hz,
            note: frequency_to_note(frequency_hz, reference_hz),
        }
    }

    pub fn is_voiced(&self) -> bool {
        self.note.is_some()
    }
}

impl Default for PitchSample {
    fn default() -> Self {
        Self::SILENT
    }
}

/// Opens a frame source on the capture thread
pub type SourceOpener = Box<dyn Fn(&Config) -> Result<Box<dyn FrameSource>> + Send + Sync>;

/// Anything a note-matching session can listen to
pub trait PitchSource {
    fn start(&self);
    /// Returns false if the capture thread did not exit within the stop timeout
    fn stop(&self) -> bool;
    fn latest(&self) -> PitchSample;
    fn is_running(&self) -> bool;
}

struct Worker {
    handle: JoinHandle<()>,
    done_rx: Receiver<()>,
}

#[derive(Default)]
struct WorkerSlot {
    worker: Option<Worker>,
    generation: u64,
}

/// Runs pitch detection on a background thread
pub struct PitchDetectionService {
    config: Arc<Config>,
    opener: Arc<SourceOpener>,
    /// Generation of the live capture thread, 0 when none is running
    active: Arc<AtomicU64>,
    latest: Arc<RwLock<PitchSample>>,
    slot: Mutex<WorkerSlot>,
}

impl PitchDetectionService {
    /// Service that captures from the microphone
    pub fn new(config: Config) -> Self {
        Self::with_opener(
            config,
            Box::new(|config: &Config| -> Result<Box<dyn FrameSource>> {
                let input = AudioInput::open(config)?;
                Ok(Box::new(input) as Box<dyn FrameSource>)
            }),
        )
    }

    /// Service that captures from whatever `opener` returns
    pub fn with_opener(config: Config, opener: SourceOpener) -> Self {
        Self {
            config: Arc::new(config),
            opener: Arc::new(opener),
            active: Arc::new(AtomicU64::new(0)),
            latest: Arc::new(RwLock::new(PitchSample::SILENT)),
            slot: Mutex::new(WorkerSlot::default()),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Spawn the capture thread unless one is already running
    pub fn start(&self) {
        let mut slot = lock_slot(&self.slot);

        if self.is_running() {
            debug!("Pitch detection already running");
            return;
        }

        // A previous worker either exited on its own (device failure) or
        // missed its stop deadline and may still own the input
        if let Some(old) = slot.worker.take() {
            if let Err(old) = reap(old, self.config.stop_timeout()) {
                warn!("Previous capture thread still holds the audio input; not starting");
                slot.worker = Some(old);
                return;
            }
        }

        slot.generation += 1;
        let generation = slot.generation;
        self.active.store(generation, Ordering::Release);

        let (done_tx, done_rx) = bounded::<()>(1);
        let config = self.config.clone();
        let opener = self.opener.clone();
        let active = self.active.clone();
        let latest = self.latest.clone();

        let spawned = thread::Builder::new()
            .name("pitch-capture".to_string())
            .spawn(move || {
                capture_loop(&config, &opener, &active, generation, &latest);
                // Only clear the flag if no newer worker has taken over
                let _ =
                    active.compare_exchange(generation, 0, Ordering::AcqRel, Ordering::Acquire);
                let _ = done_tx.send(());
            });

        match spawned {
            Ok(handle) => {
                info!("Pitch detection started");
                slot.worker = Some(Worker { handle, done_rx });
            }
            Err(e) => {
                error!("Failed to spawn capture thread: {}", e);
                self.active.store(0, Ordering::Release);
            }
        }
    }

    /// Signal the capture thread to exit and wait for it
    ///
    /// Returns `false` if the thread did not finish within the stop timeout;
    /// it is kept so the next `start` waits for it before opening the input
    /// again. The latest sample is reset to silence either way.
    pub fn stop(&self) -> bool {
        let mut slot = lock_slot(&self.slot);
        self.active.store(0, Ordering::Release);

        let joined = match slot.worker.take() {
            Some(w) => match reap(w, self.config.stop_timeout()) {
                Ok(()) => true,
                Err(w) => {
                    slot.worker = Some(w);
                    false
                }
            },
            None => true,
        };

        self.publish(PitchSample::SILENT);
        if joined {
            debug!("Pitch detection stopped");
        }
        joined
    }

    /// Most recent sample; never blocks on the capture thread
    pub fn latest(&self) -> PitchSample {
        match self.latest.read() {
            Ok(sample) => *sample,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.active.load(Ordering::Acquire) != 0
    }

    fn publish(&self, sample: PitchSample) {
        publish(&self.latest, sample);
    }
}

impl PitchSource for PitchDetectionService {
    fn start(&self) {
        PitchDetectionService::start(self)
    }

    fn stop(&self) -> bool {
        PitchDetectionService::stop(self)
    }

    fn latest(&self) -> PitchSample {
        PitchDetectionService::latest(self)
    }

    fn is_running(&self) -> bool {
        PitchDetectionService::is_running(self)
    }
}

impl Drop for PitchDetectionService {
    fn drop(&mut self) {
        self.stop();
    }
}

fn lock_slot(slot: &Mutex<WorkerSlot>) -> std::sync::MutexGuard<'_, WorkerSlot> {
    match slot.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn publish(latest: &RwLock<PitchSample>, sample: PitchSample) {
    match latest.write() {
        Ok(mut slot) => *slot = sample,
        Err(poisoned) => *poisoned.into_inner() = sample,
    }
}

/// Wait for a worker to signal completion, then join it
///
/// Hands the worker back if it is still alive after `timeout`.
fn reap(worker: Worker, timeout: Duration) -> Result<(), Worker> {
    match worker.done_rx.recv_timeout(timeout) {
        // Disconnected means the thread ended without signalling (panic)
        Ok(()) | Err(RecvTimeoutError::Disconnected) => {
            if worker.handle.join().is_err() {
                error!("Capture thread panicked");
            }
            Ok(())
        }
        Err(RecvTimeoutError::Timeout) => {
            warn!("Capture thread still running after {:?}", timeout);
            Err(worker)
        }
    }
}

fn capture_loop(
    config: &Config,
    opener: &SourceOpener,
    active: &AtomicU64,
    generation: u64,
    latest: &RwLock<PitchSample>,
) {
    let running = || active.load(Ordering::Acquire) == generation;

    let mut source = match opener(config) {
        Ok(source) => source,
        Err(e) => {
            error!("Failed to open audio input: {:#}", e);
            return;
        }
    };

    let sample_rate = source.sample_rate();
    let reference_hz = config.tuned_reference_hz();
    let mut estimator = PitchEstimator::from_config(config, sample_rate);
    debug!("Capture loop running at {} Hz", sample_rate);

    let mut skipped = 0u64;
    let mut failed = 0u64;

    while running() {
        let frame = match source.read_frame() {
            FrameRead::Frame(frame) => frame,
            FrameRead::Skipped => {
                skipped += 1;
                continue;
            }
            FrameRead::Closed => {
                warn!("Audio input closed");
                break;
            }
        };

        let frequency = match estimator.estimate(&frame) {
            Ok(estimate) => estimate.unwrap_or(0.0),
            Err(e) => {
                failed += 1;
                trace!("Estimation failed: {}", e);
                0.0
            }
        };

        // A stop may have landed while we were reading; don't overwrite the reset
        if !running() {
            break;
        }
        publish(latest, PitchSample::from_frequency(frequency, reference_hz));
    }

    if skipped > 0 || failed > 0 {
        debug!(
            "Capture loop finished ({} skipped reads, {} failed estimates)",
            skipped, failed
        );
    }
    // Dropping the source releases the device
    drop(source);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    struct SineSource {
        frequency: f32,
        sample_rate: u32,
        frame_size: usize,
        phase: usize,
        alive: Arc<AtomicUsize>,
    }

    impl FrameSource for SineSource {
        fn sample_rate(&self) -> u32 {
            self.sample_rate
        }

        fn read_frame(&mut self) -> FrameRead {
            thread::sleep(Duration::from_millis(2));
            let frame = (0..self.frame_size)
                .map(|i| {
                    let t = (self.phase + i) as f32 / self.sample_rate as f32;
                    0.5 * (2.0 * std::f32::consts::PI * self.frequency * t).sin()
                })
                .collect();
            self.phase += self.frame_size;
            FrameRead::Frame(frame)
        }
    }

    impl Drop for SineSource {
        fn drop(&mut self) {
            self.alive.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn sine_service(
        frequency: f32,
        opened: Arc<AtomicUsize>,
        alive: Arc<AtomicUsize>,
    ) -> PitchDetectionService {
        tuned_sine_service(Config::default(), frequency, opened, alive)
    }

    fn tuned_sine_service(
        config: Config,
        frequency: f32,
        opened: Arc<AtomicUsize>,
        alive: Arc<AtomicUsize>,
    ) -> PitchDetectionService {
        PitchDetectionService::with_opener(
            config,
            Box::new(move |config: &Config| -> Result<Box<dyn FrameSource>> {
                opened.fetch_add(1, Ordering::SeqCst);
                alive.fetch_add(1, Ordering::SeqCst);
                Ok(Box::new(SineSource {
                    frequency,
                    sample_rate: config.sample_rate,
                    frame_size: config.buffer_size,
                    phase: 0,
                    alive: alive.clone(),
                }) as Box<dyn FrameSource>)
            }),
        )
    }

    fn wait_for<F: Fn() -> bool>(cond: F) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_latest_before_start_is_silent() {
        let service = sine_service(440.0, Arc::default(), Arc::default());
        assert_eq!(service.latest(), PitchSample::SILENT);
        assert!(!service.is_running());
    }

    #[test]
    fn test_start_is_idempotent() {
        let opened = Arc::new(AtomicUsize::new(0));
        let alive = Arc::new(AtomicUsize::new(0));
        let service = sine_service(440.0, opened.clone(), alive.clone());

        service.start();
        service.start();
        assert!(service.is_running());
        assert!(wait_for(|| service.latest().is_voiced()));
        assert_eq!(opened.load(Ordering::SeqCst), 1);

        assert!(service.stop());
        assert_eq!(alive.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_stop_is_idempotent_and_resets_sample() {
        let service = sine_service(440.0, Arc::default(), Arc::default());
        assert!(service.stop());

        service.start();
        assert!(wait_for(|| service.latest().is_voiced()));
        let sample = service.latest();
        assert_eq!(sample.note.map(|n| n.to_string()).as_deref(), Some("A4"));

        assert!(service.stop());
        assert!(service.stop());
        assert!(!service.is_running());
        assert_eq!(service.latest(), PitchSample::SILENT);
    }

    #[test]
    fn test_concurrent_start_opens_one_device() {
        let opened = Arc::new(AtomicUsize::new(0));
        let service = Arc::new(sine_service(330.0, opened.clone(), Arc::default()));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let service = service.clone();
                thread::spawn(move || service.start())
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(wait_for(|| opened.load(Ordering::SeqCst) >= 1));
        assert_eq!(opened.load(Ordering::SeqCst), 1);
        assert!(service.stop());
    }

    #[test]
    fn test_device_open_failure_leaves_service_stopped() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        let service = PitchDetectionService::with_opener(
            Config::default(),
            Box::new(move |_: &Config| -> Result<Box<dyn FrameSource>> {
                counter.fetch_add(1, Ordering::SeqCst);
                anyhow::bail!("no microphone")
            }),
        );

        service.start();
        assert!(wait_for(|| !service.is_running()));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);

        // Not retried on its own, but a new start tries again
        thread::sleep(Duration::from_millis(20));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        service.start();
        assert!(wait_for(|| attempts.load(Ordering::SeqCst) == 2));
        assert!(service.stop());
    }

    #[test]
    fn test_samples_are_named_with_tuned_reference() {
        // Tuned a semitone down: 415.3 Hz is the new A4
        let config = Config {
            tuning_offset: -1.0,
            ..Default::default()
        };
        let service = tuned_sine_service(config, 415.3, Arc::default(), Arc::default());
        service.start();
        assert!(wait_for(|| service.latest().is_voiced()));
        assert_eq!(service.latest().note.unwrap().to_string(), "A4");
        assert!(service.stop());
    }

    #[test]
    fn test_pitch_sample_from_frequency() {
        let sample = PitchSample::from_frequency(261.63, 440.0);
        assert_eq!(sample.note.unwrap().to_string(), "C4");
        assert_eq!(PitchSample::from_frequency(0.0, 440.0), PitchSample::SILENT);
        assert!(!PitchSample::from_frequency(-3.0, 440.0).is_voiced());
    }
}
