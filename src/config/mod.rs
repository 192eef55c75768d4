use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How a detected pitch is compared against the target note
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MatchPolicy {
    /// Detected frequency must lie within `hz` of the target pitch class in the
    /// nearest octave (inclusive)
    Tolerance { hz: f32 },
    /// Detected pitch class must equal the target; octave and cents ignored
    PitchClass,
}

impl Default for MatchPolicy {
    fn default() -> Self {
        MatchPolicy::Tolerance { hz: 30.0 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Requested capture sample rate; the device default is used if unsupported
    pub sample_rate: u32,

    /// Samples per captured frame (hop size)
    pub buffer_size: usize,

    /// Samples in the pitch analysis window
    #[serde(default = "default_window_size")]
    pub window_size: usize,

    /// YIN threshold for pitch detection
    pub pitch_threshold: f32,

    /// Frames quieter than this (dBFS) report no pitch
    #[serde(default = "default_silence_db")]
    pub silence_db: f32,

    /// Lowest accepted fundamental (Hz)
    #[serde(default = "default_min_frequency")]
    pub min_frequency: f32,

    /// Highest accepted fundamental (Hz)
    #[serde(default = "default_max_frequency")]
    pub max_frequency: f32,

    /// Frequency of A4 (Hz)
    #[serde(default = "default_reference_hz")]
    pub reference_hz: f32,

    /// Tuning offset in semitones applied to target frequencies
    #[serde(default)]
    pub tuning_offset: f32,

    /// Maximum length of one listening attempt (seconds)
    #[serde(default = "default_listen_duration")]
    pub listen_duration: f32,

    /// How long the pitch must stay on target to count as a match (seconds)
    #[serde(default = "default_required_stability")]
    pub required_stability: f32,

    /// Delay between session polls (milliseconds)
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Bounded wait for the capture thread to exit on stop (milliseconds)
    #[serde(default = "default_stop_timeout_ms")]
    pub stop_timeout_ms: u64,

    #[serde(default)]
    pub match_policy: MatchPolicy,

    /// Input device name substring (None for the default device)
    #[serde(default)]
    pub input_device: Option<String>,

    /// Enable verbose logging
    #[serde(default)]
    pub verbose: bool,
}

fn default_window_size() -> usize {
    4096
}

fn default_silence_db() -> f32 {
    -40.0
}

fn default_min_frequency() -> f32 {
    60.0
}

fn default_max_frequency() -> f32 {
    1600.0
}

fn default_reference_hz() -> f32 {
    440.0
}

fn default_listen_duration() -> f32 {
    10.0
}

fn default_required_stability() -> f32 {
    1.0
}

fn default_poll_interval_ms() -> u64 {
    50
}

fn default_stop_timeout_ms() -> u64 {
    1000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sample_rate: 44100,
            buffer_size: 1024,
            window_size: default_window_size(),
            pitch_threshold: 0.15,
            silence_db: default_silence_db(),
            min_frequency: default_min_frequency(),
            max_frequency: default_max_frequency(),
            reference_hz: default_reference_hz(),
            tuning_offset: 0.0,
            listen_duration: default_listen_duration(),
            required_stability: default_required_stability(),
            poll_interval_ms: default_poll_interval_ms(),
            stop_timeout_ms: default_stop_timeout_ms(),
            match_policy: MatchPolicy::default(),
            input_device: None,
            verbose: false,
        }
    }
}

impl Config {
    /// Load configuration from JSON file
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to JSON file
    pub fn to_file(&self, path: &str) -> anyhow::Result<()> {
        self.validate()?;
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Frequency multiplier for the tuning offset: 2^(offset / 12)
    pub fn tuning_multiplier(&self) -> f32 {
        2.0_f32.powf(self.tuning_offset / 12.0)
    }

    /// A4 with the tuning offset applied; every note name is derived from this
    pub fn tuned_reference_hz(&self) -> f32 {
        self.reference_hz * self.tuning_multiplier()
    }

    /// Log filter for `env_logger`: Debug when verbose, Info otherwise
    pub fn log_level(&self) -> log::LevelFilter {
        if self.verbose {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        }
    }

    pub fn listen_duration(&self) -> Duration {
        Duration::from_secs_f32(self.listen_duration)
    }

    pub fn required_stability(&self) -> Duration {
        Duration::from_secs_f32(self.required_stability)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    /// Validate configuration parameters
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.buffer_size == 0 || self.window_size == 0 {
            anyhow::bail!("buffer_size and window_size must be non-zero");
        }
        if self.window_size < self.buffer_size {
            anyhow::bail!(
                "window_size ({}) must be at least buffer_size ({})",
                self.window_size,
                self.buffer_size
            );
        }
        if !(self.min_frequency > 0.0 && self.min_frequency < self.max_frequency) {
            anyhow::bail!(
                "frequency range must satisfy 0 < min_frequency ({}) < max_frequency ({})",
                self.min_frequency,
                self.max_frequency
            );
        }
        if !(self.reference_hz.is_finite() && self.reference_hz > 0.0) {
            anyhow::bail!("reference_hz must be positive, got {}", self.reference_hz);
        }
        if !self.tuning_offset.is_finite() {
            anyhow::bail!("tuning_offset must be finite");
        }
        if !(self.listen_duration.is_finite() && self.listen_duration > 0.0) {
            anyhow::bail!("listen_duration must be positive, got {}", self.listen_duration);
        }
        if !(self.required_stability.is_finite() && self.required_stability >= 0.0) {
            anyhow::bail!(
                "required_stability must be non-negative, got {}",
                self.required_stability
            );
        }
        if self.required_stability > self.listen_duration {
            anyhow::bail!(
                "required_stability ({}) cannot exceed listen_duration ({}). \
                 No attempt could ever be confirmed.",
                self.required_stability,
                self.listen_duration
            );
        }
        if self.poll_interval_ms == 0 {
            anyhow::bail!("poll_interval_ms must be non-zero");
        }
        if let MatchPolicy::Tolerance { hz } = self.match_policy {
            if !(hz.is_finite() && hz >= 0.0) {
                anyhow::bail!("match tolerance must be non-negative, got {}", hz);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.sample_rate, 44100);
        assert_eq!(config.buffer_size, 1024);
        assert_eq!(config.reference_hz, 440.0);
        assert_eq!(config.match_policy, MatchPolicy::Tolerance { hz: 30.0 });
        assert_eq!(config.listen_duration(), Duration::from_secs(10));
        assert_eq!(config.required_stability(), Duration::from_secs(1));
        assert_eq!(config.poll_interval(), Duration::from_millis(50));
        assert!(!config.verbose);
    }

    #[test]
    fn test_config_serialization() {
        let config = Config {
            match_policy: MatchPolicy::PitchClass,
            ..Default::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        let deserialized: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized.buffer_size, config.buffer_size);
        assert_eq!(deserialized.match_policy, MatchPolicy::PitchClass);
    }

    #[test]
    fn test_config_minimal_json_uses_defaults() {
        let json = r#"{"sample_rate": 48000, "buffer_size": 2048, "pitch_threshold": 0.1}"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.sample_rate, 48000);
        assert_eq!(config.window_size, 4096);
        assert_eq!(config.match_policy, MatchPolicy::Tolerance { hz: 30.0 });
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_tuning_multiplier() {
        let mut config = Config::default();
        assert_relative_eq!(config.tuning_multiplier(), 1.0);
        config.tuning_offset = 12.0;
        assert_relative_eq!(config.tuning_multiplier(), 2.0, epsilon = 1e-6);
        config.tuning_offset = -1.0;
        assert_relative_eq!(config.tuning_multiplier(), 0.943_874_3, epsilon = 1e-5);
        assert_relative_eq!(config.tuned_reference_hz(), 415.305, epsilon = 1e-2);
    }

    #[test]
    fn test_log_level_follows_verbose() {
        let json = r#"{"sample_rate": 44100, "buffer_size": 1024, "pitch_threshold": 0.15}"#;
        let mut config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.log_level(), log::LevelFilter::Info);
        config.verbose = true;
        assert_eq!(config.log_level(), log::LevelFilter::Debug);
    }

    #[test]
    fn test_config_validation_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_config_validation_stability_exceeds_listen() {
        let config = Config {
            listen_duration: 1.0,
            required_stability: 2.0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_bad_range() {
        let config = Config {
            min_frequency: 800.0,
            max_frequency: 400.0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_negative_tolerance() {
        let config = Config {
            match_policy: MatchPolicy::Tolerance { hz: -1.0 },
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_file_round_trip() {
        let path = std::env::temp_dir().join("solfejo_config_round_trip.json");
        let path = path.to_str().unwrap();
        let config = Config {
            tuning_offset: 2.0,
            input_device: Some("USB".to_string()),
            ..Default::default()
        };
        config.to_file(path).unwrap();
        let loaded = Config::from_file(path).unwrap();
        assert_eq!(loaded.tuning_offset, 2.0);
        assert_eq!(loaded.input_device.as_deref(), Some("USB"));
        let _ = std::fs::remove_file(path);
    }
}
