use anyhow::{Context, Result};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use crate::pitch::PitchClass;

/// One note of a melody
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SongNote {
    pub note: PitchClass,
    /// Playback length in seconds
    pub duration: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Song {
    pub title: String,
    pub notes: Vec<SongNote>,
}

impl Song {
    fn validate(&self) -> Result<()> {
        if self.title.trim().is_empty() {
            anyhow::bail!("song title must not be empty");
        }
        if self.notes.is_empty() {
            anyhow::bail!("song '{}' has no notes", self.title);
        }
        if let Some((i, n)) = self
            .notes
            .iter()
            .enumerate()
            .find(|(_, n)| !(n.duration.is_finite() && n.duration > 0.0))
        {
            anyhow::bail!(
                "song '{}' note {} ({}) has invalid duration {}",
                self.title,
                i + 1,
                n.note,
                n.duration
            );
        }
        Ok(())
    }
}

/// The set of songs a game draws from
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SongLibrary {
    pub songs: Vec<Song>,
}

impl SongLibrary {
    pub fn new(songs: Vec<Song>) -> Result<Self> {
        let library = Self { songs };
        library.validate()?;
        Ok(library)
    }

    /// Load a song library from JSON file
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read song library {}", path))?;
        let library: SongLibrary = serde_json::from_str(&contents)
            .with_context(|| format!("Invalid song library {}", path))?;
        library.validate()?;
        Ok(library)
    }

    pub fn validate(&self) -> Result<()> {
        for song in &self.songs {
            song.validate()?;
        }
        Ok(())
    }

    /// Case-insensitive lookup by title
    pub fn find(&self, title: &str) -> Option<&Song> {
        let wanted = title.trim().to_lowercase();
        self.songs
            .iter()
            .find(|s| s.title.trim().to_lowercase() == wanted)
    }

    pub fn pick_random(&self) -> Option<&Song> {
        self.songs.choose(&mut rand::thread_rng())
    }

    pub fn len(&self) -> usize {
        self.songs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.songs.is_empty()
    }
}

/// How far the player has unlocked a song
#[derive(Debug, Clone)]
pub struct SongProgress {
    song: Song,
    unlocked: usize,
}

impl SongProgress {
    /// Start a song with no notes unlocked; the first note is the first target
    pub fn new(song: Song) -> Self {
        Self { song, unlocked: 0 }
    }

    pub fn song(&self) -> &Song {
        &self.song
    }

    /// Next note to sing, or `None` once every note is unlocked
    pub fn current_target(&self) -> Option<SongNote> {
        self.song.notes.get(self.unlocked).copied()
    }

    /// Reveal the current target; returns the note that was unlocked
    pub fn unlock(&mut self) -> Option<SongNote> {
        let note = self.current_target()?;
        self.unlocked += 1;
        Some(note)
    }

    /// Notes the player has revealed so far
    pub fn unlocked(&self) -> &[SongNote] {
        &self.song.notes[..self.unlocked]
    }

    pub fn is_complete(&self) -> bool {
        self.unlocked >= self.song.notes.len()
    }
}
