use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Standard concert pitch for A4
pub const DEFAULT_REFERENCE_HZ: f32 = 440.0;

/// MIDI note number of A4
const A4_MIDI: i32 = 69;

const NOTE_NAMES: [&str; 12] = [
    "C", "C#", "D", "D#", "E", "F", "F#", "G", "G#", "A", "A#", "B",
];

/// One of the 12 equal-tempered semitone classes, without octave
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum PitchClass {
    C,
    CSharp,
    D,
    DSharp,
    E,
    F,
    FSharp,
    G,
    GSharp,
    A,
    ASharp,
    B,
}

impl PitchClass {
    pub const ALL: [PitchClass; 12] = [
        PitchClass::C,
        PitchClass::CSharp,
        PitchClass::D,
        PitchClass::DSharp,
        PitchClass::E,
        PitchClass::F,
        PitchClass::FSharp,
        PitchClass::G,
        PitchClass::GSharp,
        PitchClass::A,
        PitchClass::ASharp,
        PitchClass::B,
    ];

    /// Semitone index starting at C = 0
    pub fn index(self) -> usize {
        self as usize
    }

    /// Pitch class for a semitone index; wraps modulo 12
    pub fn from_index(index: i32) -> Self {
        Self::ALL[index.rem_euclid(12) as usize]
    }

    pub fn name(self) -> &'static str {
        NOTE_NAMES[self.index()]
    }
}

impl fmt::Display for PitchClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown pitch class '{0}'")]
pub struct ParsePitchClassError(String);

impl FromStr for PitchClass {
    type Err = ParsePitchClassError;

    /// Accepts sharp spellings ("C#") and the common flat aliases ("Db")
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let mut chars = trimmed.chars();
        let letter = chars
            .next()
            .ok_or_else(|| ParsePitchClassError(s.to_string()))?
            .to_ascii_uppercase();
        let base = match letter {
            'C' => 0,
            'D' => 2,
            'E' => 4,
            'F' => 5,
            'G' => 7,
            'A' => 9,
            'B' => 11,
            _ => return Err(ParsePitchClassError(s.to_string())),
        };
        let offset = match chars.as_str() {
            "" => 0,
            "#" | "♯" => 1,
            "b" | "♭" => -1,
            _ => return Err(ParsePitchClassError(s.to_string())),
        };
        Ok(Self::from_index(base + offset))
    }
}

impl TryFrom<String> for PitchClass {
    type Error = ParsePitchClassError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PitchClass> for String {
    fn from(value: PitchClass) -> Self {
        value.name().to_string()
    }
}

/// A pitch class in a specific octave (scientific pitch notation, A4 = MIDI 69)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Note {
    pub pitch_class: PitchClass,
    pub octave: i32,
}

impl Note {
    pub fn new(pitch_class: PitchClass, octave: i32) -> Self {
        Self {
            pitch_class,
            octave,
        }
    }

    /// Build a note from a MIDI-convention note number (no clamping)
    pub fn from_midi(midi: i32) -> Self {
        Self {
            pitch_class: PitchClass::from_index(midi),
            octave: midi.div_euclid(12) - 1,
        }
    }

    pub fn midi(self) -> i32 {
        (self.octave + 1) * 12 + self.pitch_class.index() as i32
    }

    pub fn pitch_class(self) -> PitchClass {
        self.pitch_class
    }
}

impl fmt::Display for Note {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.pitch_class, self.octave)
    }
}

/// Convert a frequency to the nearest equal-tempered note
///
/// Returns `None` for non-positive or non-finite frequencies. Extreme
/// frequencies still map to a note; octaves are not clamped.
pub fn frequency_to_note(frequency: f32, reference_hz: f32) -> Option<Note> {
    if !frequency.is_finite() || frequency <= 0.0 {
        return None;
    }
    if !reference_hz.is_finite() || reference_hz <= 0.0 {
        return None;
    }

    // MIDI note = 69 + 12 * log2(frequency / reference)
    let n = 12.0 * (f64::from(frequency) / f64::from(reference_hz)).log2() + f64::from(A4_MIDI);
    if !n.is_finite() || n.abs() > f64::from(i32::MAX / 2) {
        return None;
    }
    Some(Note::from_midi(n.round() as i32))
}

/// Nominal frequency of a note
pub fn note_frequency(note: Note, reference_hz: f32) -> f32 {
    let semitones = (note.midi() - A4_MIDI) as f32;
    reference_hz * 2.0_f32.powf(semitones / 12.0)
}

/// Nominal frequency of `pitch_class` in the octave nearest to `detected_hz`
///
/// Returns `None` when `detected_hz` cannot be mapped to a note.
pub fn target_frequency(
    pitch_class: PitchClass,
    detected_hz: f32,
    reference_hz: f32,
) -> Option<f32> {
    let detected = frequency_to_note(detected_hz, reference_hz)?;
    let mut diff = pitch_class.index() as i32 - detected.pitch_class.index() as i32;
    if diff > 6 {
        diff -= 12;
    } else if diff < -6 {
        diff += 12;
    }
    let candidate = Note::from_midi(detected.midi() + diff);
    let nominal = note_frequency(candidate, reference_hz);

    // A tritone away is ambiguous: pick whichever octave is closer in Hz.
    if diff.abs() == 6 {
        let other = note_frequency(Note::from_midi(detected.midi() - diff), reference_hz);
        if (other - detected_hz).abs() < (nominal - detected_hz).abs() {
            return Some(other);
        }
    }
    Some(nominal)
}

/// Signed distance in cents from `reference` to `frequency`
pub fn cents_between(frequency: f32, reference: f32) -> f32 {
    1200.0 * (frequency / reference).log2()
}
