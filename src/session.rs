//! Note matching: decides whether the player is holding the target note
//!
//! A [`NoteMatchSession`] walks `Idle -> Armed -> Listening -> {Matched, TimedOut}`.
//! While listening it polls a [`PitchSource`], requires the pitch to stay on
//! target for the stability window, and gives up after the listen duration.
//! Time is passed in explicitly so the state machine can be driven by a
//! wall-clock loop ([`NoteMatchSession::run`]) or by simulated ticks.

use anyhow::Result;
use log::{debug, info};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::config::{Config, MatchPolicy};
use crate::detector::{PitchSample, PitchSource};
use crate::pitch::{cents_between, frequency_to_note, target_frequency, Note, PitchClass};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Armed,
    Listening,
    Matched,
    TimedOut,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Matched | SessionState::TimedOut)
    }
}

/// Shared flag used to abort a running session from another thread
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Snapshot of a session for display
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionStatus {
    pub state: SessionState,
    pub target: Option<PitchClass>,
    pub status_message: String,
    pub detected_note: Option<String>,
    pub detected_frequency_hz: Option<f32>,
    pub deviation_hz: Option<f32>,
    pub result: Option<bool>,
    pub is_running: bool,
    /// Seconds the pitch has currently been held on target
    pub stable_for: f32,
}

/// How one sample compares to the target
#[derive(Debug, Clone, Copy, PartialEq)]
struct Evaluation {
    frequency_hz: f32,
    note: Option<Note>,
    deviation_hz: Option<f32>,
    on_target: bool,
}

pub struct NoteMatchSession {
    policy: MatchPolicy,
    /// Reference pitch with the tuning offset applied
    reference_hz: f32,
    listen_duration: Duration,
    required_stability: Duration,
    poll_interval: Duration,

    state: SessionState,
    target: Option<PitchClass>,
    session_start: Option<Instant>,
    stable_since: Option<Instant>,
    last_tick: Option<Instant>,
    result: Option<bool>,
    status_message: String,
    detected: Option<PitchSample>,
    deviation_hz: Option<f32>,
    detector_running: bool,
}

impl NoteMatchSession {
    pub fn new(config: &Config) -> Self {
        Self {
            policy: config.match_policy,
            reference_hz: config.tuned_reference_hz(),
            listen_duration: config.listen_duration(),
            required_stability: config.required_stability(),
            poll_interval: config.poll_interval(),
            state: SessionState::Idle,
            target: None,
            session_start: None,
            stable_since: None,
            last_tick: None,
            result: None,
            status_message: String::new(),
            detected: None,
            deviation_hz: None,
            detector_running: false,
        }
    }

    /// Prepare an attempt for `target`
    ///
    /// Allowed from `Idle` or a finished attempt; a session that is still
    /// listening must be cancelled first.
    pub fn arm(&mut self, target: PitchClass) -> Result<()> {
        if self.state == SessionState::Listening {
            anyhow::bail!("cannot arm a session that is still listening");
        }
        self.reset();
        self.target = Some(target);
        self.state = SessionState::Armed;
        self.status_message = format!(
            "Press start and hold the note for {:.1}s.",
            self.required_stability.as_secs_f32()
        );
        debug!("Session armed for {}", target);
        Ok(())
    }

    /// Start the detector and begin listening at `now`
    pub fn begin<S: PitchSource + ?Sized>(&mut self, source: &S, now: Instant) -> Result<()> {
        if self.state != SessionState::Armed {
            anyhow::bail!("session must be armed before listening (state: {:?})", self.state);
        }
        source.start();
        self.detector_running = source.is_running();
        self.session_start = Some(now);
        self.stable_since = None;
        self.state = SessionState::Listening;
        self.status_message = "Get ready... sing and hold the note!".to_string();
        info!(
            "Listening for {} (up to {:.1}s)",
            self.target.map(|t| t.name()).unwrap_or("?"),
            self.listen_duration.as_secs_f32()
        );
        Ok(())
    }

    /// Process one poll at time `now`
    pub fn tick<S: PitchSource + ?Sized>(&mut self, source: &S, now: Instant) -> SessionState {
        if self.state != SessionState::Listening {
            return self.state;
        }
        let (Some(target), Some(start)) = (self.target, self.session_start) else {
            return self.state;
        };
        self.last_tick = Some(now);

        self.detector_running = source.is_running();
        if !self.detector_running {
            // The capture thread died under us (device lost or never opened)
            source.stop();
            self.state = SessionState::Idle;
            self.stable_since = None;
            self.status_message = "Microphone unavailable.".to_string();
            info!("Detector stopped while listening; abandoning attempt");
            return self.state;
        }

        let sample = source.latest();
        let eval = self.evaluate(target, &sample);
        self.detected = eval.note.map(|_| sample);
        self.deviation_hz = eval.deviation_hz;

        if eval.on_target {
            let since = *self.stable_since.get_or_insert(now);
            let held = now.saturating_duration_since(since);
            if held >= self.required_stability {
                let note = eval.note.map(|n| n.to_string()).unwrap_or_default();
                self.finish(source, true, format!("Matched! Note {} confirmed.", note));
                return self.state;
            }
            self.status_message = format!(
                "Hold it! {:.1}s / {:.1}s",
                held.as_secs_f32(),
                self.required_stability.as_secs_f32()
            );
        } else {
            self.stable_since = None;
            self.status_message = self.correction_message(target, &eval);
        }

        if now.saturating_duration_since(start) >= self.listen_duration {
            self.finish(source, false, "Time's up. Try again.".to_string());
        }
        self.state
    }

    /// Abort a listening session without producing a result
    pub fn cancel<S: PitchSource + ?Sized>(&mut self, source: &S) {
        if self.state == SessionState::Listening {
            source.stop();
            info!("Session cancelled");
        }
        self.state = SessionState::Idle;
        self.stable_since = None;
        self.detector_running = false;
        self.status_message = "Cancelled.".to_string();
    }

    /// Forget the current attempt and return to `Idle`
    pub fn reset(&mut self) {
        self.state = SessionState::Idle;
        self.target = None;
        self.session_start = None;
        self.stable_since = None;
        self.last_tick = None;
        self.result = None;
        self.status_message.clear();
        self.detected = None;
        self.deviation_hz = None;
        self.detector_running = false;
    }

    /// Poll `source` in real time until the attempt ends
    ///
    /// Arms-to-listening happens here if `begin` was not called yet. Returns
    /// `None` when cancelled or when the detector stops on its own.
    pub fn run<S: PitchSource + ?Sized>(
        &mut self,
        source: &S,
        cancel: &CancelToken,
    ) -> Result<Option<bool>> {
        self.run_observed(source, cancel, |_| {})
    }

    /// Like [`run`](Self::run), calling `observe` after every poll
    pub fn run_observed<S, F>(
        &mut self,
        source: &S,
        cancel: &CancelToken,
        mut observe: F,
    ) -> Result<Option<bool>>
    where
        S: PitchSource + ?Sized,
        F: FnMut(&SessionStatus),
    {
        if self.state == SessionState::Armed {
            self.begin(source, Instant::now())?;
        }
        if self.state != SessionState::Listening {
            anyhow::bail!("session is not listening (state: {:?})", self.state);
        }

        loop {
            if cancel.is_cancelled() {
                self.cancel(source);
                return Ok(None);
            }
            let state = self.tick(source, Instant::now());
            observe(&self.status());
            match state {
                SessionState::Listening => thread::sleep(self.poll_interval),
                state if state.is_terminal() => return Ok(self.result),
                _ => return Ok(None),
            }
        }
    }

    fn finish<S: PitchSource + ?Sized>(&mut self, source: &S, matched: bool, message: String) {
        source.stop();
        self.detector_running = false;
        self.result = Some(matched);
        self.state = if matched {
            SessionState::Matched
        } else {
            SessionState::TimedOut
        };
        if !matched {
            self.stable_since = None;
        }
        info!("{}", message);
        self.status_message = message;
    }

    fn evaluate(&self, target: PitchClass, sample: &PitchSample) -> Evaluation {
        let freq = sample.frequency_hz;
        let note = match sample.note {
            Some(_) => frequency_to_note(freq, self.reference_hz),
            None => None,
        };
        let Some(note) = note else {
            return Evaluation {
                frequency_hz: freq,
                note: None,
                deviation_hz: None,
                on_target: false,
            };
        };

        let deviation_hz =
            target_frequency(target, freq, self.reference_hz).map(|target_hz| freq - target_hz);
        let on_target = match self.policy {
            MatchPolicy::Tolerance { hz } => deviation_hz.is_some_and(|d| d.abs() <= hz),
            MatchPolicy::PitchClass => note.pitch_class == target,
        };

        Evaluation {
            frequency_hz: freq,
            note: Some(note),
            deviation_hz,
            on_target,
        }
    }

    fn correction_message(&self, target: PitchClass, eval: &Evaluation) -> String {
        let Some(note) = eval.note else {
            return "Silence...".to_string();
        };
        let (MatchPolicy::Tolerance { .. }, Some(d)) = (self.policy, eval.deviation_hz) else {
            return format!("Detected {}. Looking for {}", note, target);
        };
        let cents = cents_between(eval.frequency_hz, eval.frequency_hz - d);
        if d < 0.0 {
            format!(
                "Detected {}. Raise your pitch by {:.1} Hz ({:+.0} cents)",
                note, -d, cents
            )
        } else {
            format!(
                "Detected {}. Lower your pitch by {:.1} Hz ({:+.0} cents)",
                note, d, cents
            )
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn target(&self) -> Option<PitchClass> {
        self.target
    }

    pub fn result(&self) -> Option<bool> {
        self.result
    }

    pub fn stable_since(&self) -> Option<Instant> {
        self.stable_since
    }

    pub fn session_start(&self) -> Option<Instant> {
        self.session_start
    }

    pub fn status_message(&self) -> &str {
        &self.status_message
    }

    pub fn deviation_hz(&self) -> Option<f32> {
        self.deviation_hz
    }

    pub fn detected(&self) -> Option<PitchSample> {
        self.detected
    }

    pub fn status(&self) -> SessionStatus {
        let stable_for = match (self.stable_since, self.last_tick) {
            (Some(since), Some(now)) => now.saturating_duration_since(since).as_secs_f32(),
            _ => 0.0,
        };
        SessionStatus {
            state: self.state,
            target: self.target,
            status_message: self.status_message.clone(),
            detected_note: self
                .detected
                .and_then(|s| frequency_to_note(s.frequency_hz, self.reference_hz))
                .map(|n| n.to_string()),
            detected_frequency_hz: self.detected.map(|s| s.frequency_hz),
            deviation_hz: self.deviation_hz,
            result: self.result,
            is_running: self.detector_running,
            stable_for,
        }
    }
}
