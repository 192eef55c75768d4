
use audio_generator::{generate_test_audio, noise_samples, read_wav, ScriptedSource};
use solfejo::audio::{FrameRead, FrameSource};
use solfejo::config::Config;
use solfejo::detector::{PitchDetectionService, PitchSample};
use solfejo::pitch::PitchClass;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn service_with<F>(make: F) -> PitchDetectionService
where
    F: Fn() -> ScriptedSource + Send + Sync + 'static,
{
    PitchDetectionService::with_opener(
        Config::default(),
        Box::new(move |_: &Config| -> anyhow::Result<Box<dyn FrameSource>> {
            Ok(Box::new(make()))
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
fn test_detects_sung_tone() {
    let service = service_with(|| ScriptedSource::tone(392.0, 1024, 64, 44100).looping());
    service.start();

    assert!(wait_for(|| service.latest().is_voiced()));
    let sample = service.latest();
    let note = sample.note.unwrap();
    assert_eq!(note.pitch_class, PitchClass::G);
    assert_eq!(note.octave, 4);
    assert!((sample.frequency_hz - 392.0).abs() < 392.0 * 0.02);

    assert!(service.stop());
    assert_eq!(service.latest(), PitchSample::SILENT);
}

#[test]
fn test_detects_tone_from_wav_file() {
    let path = std::env::temp_dir().join("solfejo_detector_c4.wav");
    let path = generate_test_audio(261.63, 1.0, 44100, path.to_str().unwrap());
    let (samples, rate) = read_wav(&path);
    std::fs::remove_file(&path).unwrap();

    let service =
        service_with(move || ScriptedSource::from_samples(&samples, 1024, rate).looping());
    service.start();
    assert!(wait_for(|| service.latest().is_voiced()));
    assert_eq!(service.latest().note.unwrap().to_string(), "C4");
    service.stop();
}

#[test]
fn test_quiet_noise_reads_as_silence() {
    let service = service_with(|| {
        let reads = (0..16)
            .map(|_| FrameRead::Frame(noise_samples(0.001, 1024)))
            .collect();
        ScriptedSource::new(reads, 44100).looping()
    });
    service.start();
    thread::sleep(Duration::from_millis(100));
    assert!(service.is_running());
    assert_eq!(service.latest().note, None);
    service.stop();
}

#[test]
fn test_bad_frames_do_not_stop_capture() {
    let service = service_with(|| {
        let mut reads = vec![
            FrameRead::Skipped,
            FrameRead::Frame(vec![]),
            FrameRead::Frame(vec![f32::NAN; 1024]),
            FrameRead::Skipped,
        ];
        reads.extend((0..8).map(|i| {
            FrameRead::Frame(audio_generator::sine_samples(
                440.0,
                0.5,
                i * 1024,
                1024,
                44100,
            ))
        }));
        ScriptedSource::new(reads, 44100)
    });
    service.start();

    assert!(wait_for(|| service.latest().is_voiced()));
    assert!(service.is_running());
    assert_eq!(service.latest().note.unwrap().to_string(), "A4");
    service.stop();
}

#[test]
fn test_closed_input_ends_capture_and_releases_device() {
    let released = Arc::new(AtomicUsize::new(0));
    let counter = released.clone();
    let service = service_with(move || {
        ScriptedSource::new(vec![FrameRead::Skipped, FrameRead::Closed], 44100)
            .with_release_counter(counter.clone())
    });

    service.start();
    assert!(wait_for(|| !service.is_running()));
    assert!(wait_for(|| released.load(Ordering::SeqCst) == 1));

    // Restarting opens a fresh source
    service.start();
    assert!(wait_for(|| released.load(Ordering::SeqCst) == 2));
    assert!(service.stop());
}

#[test]
fn test_stop_releases_device_and_allows_restart() {
    let released = Arc::new(AtomicUsize::new(0));
    let counter = released.clone();
    let service = service_with(move || {
        ScriptedSource::tone(440.0, 1024, 32, 44100)
            .looping()
            .with_release_counter(counter.clone())
    });

    for round in 1..=3 {
        service.start();
        service.start();
        assert!(wait_for(|| service.latest().is_voiced()));
        assert!(service.stop());
        assert_eq!(released.load(Ordering::SeqCst), round);
        assert!(!service.is_running());
        assert_eq!(service.latest(), PitchSample::SILENT);
    }
}

#[test]
fn test_stop_times_out_on_stuck_reader() {
    let config = Config {
        stop_timeout_ms: 50,
        ..Default::default()
    };
    let service = PitchDetectionService::with_opener(
        config,
        Box::new(|_: &Config| -> anyhow::Result<Box<dyn FrameSource>> {
            Ok(Box::new(ScriptedSource::new(vec![], 44100).with_delay(Duration::from_millis(500)))
                as Box<dyn FrameSource>)
        }),
    );

    service.start();
    thread::sleep(Duration::from_millis(20));
    assert!(!service.stop());
    assert!(!service.is_running());
    assert_eq!(service.latest(), PitchSample::SILENT);
}

#[test]
fn test_restart_waits_for_stuck_reader_to_release_device() {
    let config = Config {
        stop_timeout_ms: 50,
        ..Default::default()
    };
    let opened = Arc::new(AtomicUsize::new(0));
    let released = Arc::new(AtomicUsize::new(0));
    let most_open = Arc::new(AtomicUsize::new(0));
    let (o, r, m) = (opened.clone(), released.clone(), most_open.clone());
    let service = PitchDetectionService::with_opener(
        config,
        Box::new(move |_: &Config| -> anyhow::Result<Box<dyn FrameSource>> {
            let open_now = o.fetch_add(1, Ordering::SeqCst) + 1 - r.load(Ordering::SeqCst);
            m.fetch_max(open_now, Ordering::SeqCst);
            Ok(Box::new(
                ScriptedSource::new(vec![], 44100)
                    .with_delay(Duration::from_millis(300))
                    .with_release_counter(r.clone()),
            ))
        }),
    );

    service.start();
    assert!(wait_for(|| opened.load(Ordering::SeqCst) == 1));
    assert!(!service.stop());

    // The old reader still owns the device: no second open
    service.start();
    assert!(!service.is_running());
    assert_eq!(opened.load(Ordering::SeqCst), 1);

    // Once it lets go, a restart opens it again
    assert!(wait_for(|| released.load(Ordering::SeqCst) == 1));
    service.start();
    assert!(service.is_running());
    assert!(wait_for(|| opened.load(Ordering::SeqCst) == 2));
    assert_eq!(most_open.load(Ordering::SeqCst), 1);
}

#[test]
fn test_concurrent_readers() {
    let service = Arc::new(service_with(|| {
        ScriptedSource::tone(523.25, 1024, 64, 44100).looping()
    }));
    service.start();

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let service = service.clone();
            thread::spawn(move || {
                let mut voiced = 0;
                for _ in 0..100 {
                    let sample = service.latest();
                    // Never a torn sample: note and frequency always agree
                    if let Some(note) = sample.note {
                        assert_eq!(note.to_string(), "C5");
                        assert!(sample.frequency_hz > 0.0);
                        voiced += 1;
                    } else {
                        assert_eq!(sample.frequency_hz, 0.0);
                    }
                    thread::sleep(Duration::from_millis(1));
                }
                voiced
            })
        })
        .collect();

    let voiced: usize = readers.into_iter().map(|r| r.join().unwrap()).sum();
    assert!(voiced > 0);
    service.stop();
}
