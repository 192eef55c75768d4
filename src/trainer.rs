use anyhow::Result;
use log::{info, warn};

use crate::config::Config;
use crate::detector::{PitchDetectionService, PitchSource};
use crate::pitch::PitchClass;
use crate::session::{CancelToken, NoteMatchSession, SessionState, SessionStatus};
use crate::song::{Song, SongNote, SongProgress};

/// What came of one listening attempt
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AttemptOutcome {
    /// Target held long enough; for song play the note is now unlocked
    Matched(PitchClass),
    TimedOut,
    Cancelled,
    /// The detector could not start or lost its input
    DeviceUnavailable,
    /// Every note of the loaded song is already unlocked
    Finished,
}

/// Owns the detector and drives note-matching attempts for a game
pub struct Trainer<S: PitchSource = PitchDetectionService> {
    config: Config,
    source: S,
    session: NoteMatchSession,
    progress: Option<SongProgress>,
}

impl Trainer<PitchDetectionService> {
    /// Trainer listening to the microphone
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let source = PitchDetectionService::new(config.clone());
        Ok(Self::with_source(config, source))
    }
}

impl<S: PitchSource> Trainer<S> {
    pub fn with_source(config: Config, source: S) -> Self {
        let session = NoteMatchSession::new(&config);
        info!(
            "Trainer initialized (reference {:.1} Hz, tuning offset {:+.1} st, policy {:?})",
            config.reference_hz, config.tuning_offset, config.match_policy
        );
        Self {
            config,
            source,
            session,
            progress: None,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn session(&self) -> &NoteMatchSession {
        &self.session
    }

    pub fn status(&self) -> SessionStatus {
        self.session.status()
    }

    /// Begin a new round on `song`
    pub fn load_song(&mut self, song: Song) {
        info!("Loaded song with {} notes", song.notes.len());
        self.session.reset();
        self.progress = Some(SongProgress::new(song));
    }

    pub fn progress(&self) -> Option<&SongProgress> {
        self.progress.as_ref()
    }

    /// Next note the player has to sing
    pub fn current_target(&self) -> Option<SongNote> {
        self.progress.as_ref().and_then(|p| p.current_target())
    }

    /// Listen for a single pitch class, independent of any song
    pub fn attempt_note(
        &mut self,
        target: PitchClass,
        cancel: &CancelToken,
    ) -> Result<AttemptOutcome> {
        self.attempt_note_observed(target, cancel, |_| {})
    }

    pub fn attempt_note_observed<F>(
        &mut self,
        target: PitchClass,
        cancel: &CancelToken,
        observe: F,
    ) -> Result<AttemptOutcome>
    where
        F: FnMut(&SessionStatus),
    {
        self.session.arm(target)?;
        let result = self.session.run_observed(&self.source, cancel, observe)?;

        let outcome = match result {
            Some(true) => AttemptOutcome::Matched(target),
            Some(false) => AttemptOutcome::TimedOut,
            None if cancel.is_cancelled() => AttemptOutcome::Cancelled,
            None => {
                warn!("No audio input; check the microphone and try again");
                AttemptOutcome::DeviceUnavailable
            }
        };
        Ok(outcome)
    }

    /// Listen for the current target of the loaded song, unlocking it on a match
    pub fn attempt(&mut self, cancel: &CancelToken) -> Result<AttemptOutcome> {
        self.attempt_observed(cancel, |_| {})
    }

    pub fn attempt_observed<F>(
        &mut self,
        cancel: &CancelToken,
        observe: F,
    ) -> Result<AttemptOutcome>
    where
        F: FnMut(&SessionStatus),
    {
        let Some(target) = self.current_target() else {
            if self.progress.is_none() {
                anyhow::bail!("no song loaded");
            }
            return Ok(AttemptOutcome::Finished);
        };

        let outcome = self.attempt_note_observed(target.note, cancel, observe)?;
        if let AttemptOutcome::Matched(_) = outcome {
            if let Some(progress) = self.progress.as_mut() {
                progress.unlock();
                info!(
                    "Note unlocked ({}/{})",
                    progress.unlocked().len(),
                    progress.song().notes.len()
                );
            }
        }
        Ok(outcome)
    }

    /// Abandon any attempt in progress and release the detector
    pub fn stop(&mut self) {
        if self.session.state() == SessionState::Listening {
            self.session.cancel(&self.source);
        } else if !self.source.stop() {
            warn!("Detector did not shut down cleanly");
        }
    }
}

impl<S: PitchSource> Drop for Trainer<S> {
    fn drop(&mut self) {
        self.stop();
    }
}
