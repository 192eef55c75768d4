use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::info;
use solfejo::{
    audio,
    config::Config,
    detector::PitchDetectionService,
    pitch::PitchClass,
    session::{CancelToken, SessionStatus},
    song::SongLibrary,
    trainer::{AttemptOutcome, Trainer},
};
use std::io::{self, BufRead, Write};
use std::thread;
use std::time::{Duration, Instant};

#[derive(Parser)]
#[command(name = "solfejo")]
#[command(version = "0.1.0")]
#[command(about = "Sing the next note to unlock the song", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Listen for a single note and report whether it was held
    Listen {
        /// Pitch class to sing (e.g. A, C#, Bb)
        #[arg(short, long)]
        note: PitchClass,

        /// Enable verbose logging
        #[arg(short, long)]
        verbose: bool,

        /// Configuration file path
        #[arg(short, long)]
        config: Option<String>,
    },

    /// Unlock a song note by note
    Play {
        /// Song library (JSON)
        #[arg(short, long)]
        songs: String,

        /// Song title (random if omitted)
        #[arg(short, long)]
        title: Option<String>,

        /// Enable verbose logging
        #[arg(short, long)]
        verbose: bool,

        /// Configuration file path
        #[arg(short, long)]
        config: Option<String>,
    },

    /// Print live pitch readings
    Monitor {
        /// How long to listen
        #[arg(long, default_value = "10")]
        seconds: u64,

        /// Enable verbose logging
        #[arg(short, long)]
        verbose: bool,

        /// Configuration file path
        #[arg(short, long)]
        config: Option<String>,
    },

    /// List available audio input devices
    ListDevices,

    /// Generate default configuration file
    GenerateConfig {
        /// Output file path
        #[arg(default_value = "config.json")]
        output: String,
    },
}

fn init_logging(config: &Config) {
    env_logger::Builder::from_default_env()
        .filter_level(config.log_level())
        .init();
}

/// Load the config file (or defaults); `--verbose` turns verbose on
fn load_config(path: Option<String>, verbose: bool) -> Result<Config> {
    let mut config = match path {
        Some(path) => Config::from_file(&path)?,
        None => Config::default(),
    };
    config.verbose |= verbose;
    Ok(config)
}

/// Print the status line whenever it changes
fn status_printer() -> impl FnMut(&SessionStatus) {
    let mut last = String::new();
    move |status: &SessionStatus| {
        if status.status_message != last {
            match status.detected_frequency_hz {
                Some(hz) => println!("  {:<48} [{:.1} Hz]", status.status_message, hz),
                None => println!("  {}", status.status_message),
            }
            last = status.status_message.clone();
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Listen {
            note,
            verbose,
            config,
        } => {
            let config = load_config(config, verbose)?;
            init_logging(&config);
            let mut trainer = Trainer::new(config)?;

            println!("Sing and hold {}...", note);
            let outcome =
                trainer.attempt_note_observed(note, &CancelToken::new(), status_printer())?;
            report(outcome);
            Ok(())
        }

        Commands::Play {
            songs,
            title,
            verbose,
            config,
        } => {
            let config = load_config(config, verbose)?;
            init_logging(&config);
            let library = SongLibrary::from_file(&songs)?;
            let song = match title {
                Some(title) => library
                    .find(&title)
                    .with_context(|| format!("Song '{}' not found", title))?,
                None => library.pick_random().context("Song library is empty")?,
            }
            .clone();

            let total = song.notes.len();
            let mut trainer = Trainer::new(config)?;
            trainer.load_song(song);
            info!("Starting round with {} notes", total);

            let stdin = io::stdin();
            loop {
                if trainer.current_target().is_none() {
                    println!("All {} notes unlocked!", total);
                    if let Some(progress) = trainer.progress() {
                        println!("The song was: {}", progress.song().title);
                    }
                    break;
                }
                let unlocked = trainer.progress().map(|p| p.unlocked().len()).unwrap_or(0);
                print!(
                    "Note {}/{}: press Enter to sing (or q to quit) ",
                    unlocked + 1,
                    total
                );
                io::stdout().flush()?;

                let mut line = String::new();
                if stdin.lock().read_line(&mut line)? == 0 || line.trim() == "q" {
                    break;
                }

                let outcome = trainer.attempt_observed(&CancelToken::new(), status_printer())?;
                report(outcome);
                if outcome == AttemptOutcome::DeviceUnavailable {
                    break;
                }
            }
            Ok(())
        }

        Commands::Monitor {
            seconds,
            verbose,
            config,
        } => {
            let config = load_config(config, verbose)?;
            init_logging(&config);
            let poll = config.poll_interval();
            let service = PitchDetectionService::new(config);
            service.start();

            let deadline = Instant::now() + Duration::from_secs(seconds);
            let mut last = None;
            while Instant::now() < deadline {
                if !service.is_running() {
                    anyhow::bail!("Audio input is not available");
                }
                let sample = service.latest();
                if sample.note != last {
                    match sample.note {
                        Some(note) => {
                            println!("{:>4}  {:8.2} Hz", note.to_string(), sample.frequency_hz)
                        }
                        None => println!("   -"),
                    }
                    last = sample.note;
                }
                thread::sleep(poll);
            }
            service.stop();
            Ok(())
        }

        Commands::ListDevices => {
            println!("Available audio input devices:");
            let devices = audio::list_input_devices()?;
            if devices.is_empty() {
                println!("  (no devices found)");
            } else {
                for (i, device) in devices.iter().enumerate() {
                    println!("  {}: {}", i + 1, device);
                }
            }
            Ok(())
        }

        Commands::GenerateConfig { output } => {
            let config = Config::default();
            config.to_file(&output)?;
            println!("Configuration file generated: {}", output);
            Ok(())
        }
    }
}

fn report(outcome: AttemptOutcome) {
    match outcome {
        AttemptOutcome::Matched(note) => println!("Unlocked {}!", note),
        AttemptOutcome::TimedOut => println!("Time's up. Try again."),
        AttemptOutcome::Cancelled => println!("Cancelled."),
        AttemptOutcome::DeviceUnavailable => {
            println!("No microphone available. Fix the input device and try again.")
        }
        AttemptOutcome::Finished => println!("Nothing left to unlock."),
    }
}
