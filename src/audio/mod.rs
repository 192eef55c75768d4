use anyhow::{Context, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, Sample, SampleFormat, Stream, StreamConfig};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use log::{debug, error, info, trace, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;

/// Outcome of one attempt to read a frame from an input
#[derive(Debug, Clone, PartialEq)]
pub enum FrameRead {
    /// A full mono frame
    Frame(Vec<f32>),
    /// Nothing usable this time (overrun, late data); keep reading
    Skipped,
    /// The input is gone; stop reading
    Closed,
}

/// A blocking source of fixed-size mono frames
pub trait FrameSource {
    fn sample_rate(&self) -> u32;

    /// Block for roughly one frame's worth of audio
    fn read_frame(&mut self) -> FrameRead;
}

/// How many device callbacks may queue up before blocks are dropped
const CHANNEL_CAPACITY: usize = 32;

/// Microphone input through cpal
///
/// Dropping it stops the stream and releases the device.
pub struct AudioInput {
    _stream: Stream,
    rx: Receiver<Vec<f32>>,
    pending: Vec<f32>,
    frame_size: usize,
    sample_rate: u32,
    read_timeout: Duration,
    device_lost: Arc<AtomicBool>,
}

impl AudioInput {
    /// Open the configured (or default) input device and start streaming
    pub fn open(config: &Config) -> Result<Self> {
        let host = cpal::default_host();
        let device = match config.input_device.as_deref() {
            Some(name) => find_input_device(&host, name)?,
            None => host
                .default_input_device()
                .context("No input device available")?,
        };

        info!("Using input device: {}", device.name()?);

        let supported = device
            .default_input_config()
            .context("Failed to get default input config")?;
        let sample_format = supported.sample_format();
        let mut stream_config: StreamConfig = supported.into();
        if supports_rate(&device, config.sample_rate) {
            stream_config.sample_rate = cpal::SampleRate(config.sample_rate);
        } else {
            warn!(
                "Device does not support {} Hz, using {} Hz",
                config.sample_rate, stream_config.sample_rate.0
            );
        }
        debug!("Audio config: {:?} ({:?})", stream_config, sample_format);

        let (tx, rx) = bounded(CHANNEL_CAPACITY);
        let device_lost = Arc::new(AtomicBool::new(false));

        let lost = device_lost.clone();
        let stream = match sample_format {
            SampleFormat::F32 => build_stream::<f32>(&device, &stream_config, tx, lost)?,
            SampleFormat::I16 => build_stream::<i16>(&device, &stream_config, tx, lost)?,
            SampleFormat::U16 => build_stream::<u16>(&device, &stream_config, tx, lost)?,
            SampleFormat::I32 => build_stream::<i32>(&device, &stream_config, tx, lost)?,
            other => anyhow::bail!("Unsupported sample format: {:?}", other),
        };

        stream.play().context("Failed to start input stream")?;
        info!("Audio stream started");

        let sample_rate = stream_config.sample_rate.0;
        let frame_size = config.buffer_size;
        // Allow a few frames of slack before calling a read late
        let read_timeout = Duration::from_secs_f32(4.0 * frame_size as f32 / sample_rate as f32)
            .max(Duration::from_millis(100));

        Ok(Self {
            _stream: stream,
            rx,
            pending: Vec::with_capacity(frame_size * 2),
            frame_size,
            sample_rate,
            read_timeout,
            device_lost,
        })
    }
}

impl FrameSource for AudioInput {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn read_frame(&mut self) -> FrameRead {
        loop {
            if self.pending.len() >= self.frame_size {
                let frame: Vec<f32> = self.pending.drain(..self.frame_size).collect();
                return FrameRead::Frame(frame);
            }
            if self.device_lost.load(Ordering::Acquire) {
                return FrameRead::Closed;
            }
            match self.rx.recv_timeout(self.read_timeout) {
                Ok(block) => self.pending.extend_from_slice(&block),
                Err(RecvTimeoutError::Timeout) => return FrameRead::Skipped,
                Err(RecvTimeoutError::Disconnected) => return FrameRead::Closed,
            }
        }
    }
}

fn build_stream<T>(
    device: &Device,
    config: &StreamConfig,
    tx: Sender<Vec<f32>>,
    device_lost: Arc<AtomicBool>,
) -> Result<Stream>
where
    T: Sample + cpal::SizedSample + Send + 'static,
    f32: cpal::FromSample<T>,
{
    let channels = config.channels.max(1) as usize;
    let stream = device.build_input_stream(
        config,
        move |data: &[T], _: &cpal::InputCallbackInfo| {
            // Downmix interleaved channels to mono
            let mono: Vec<f32> = data
                .chunks(channels)
                .map(|frame| {
                    frame.iter().map(|&s| f32::from_sample(s)).sum::<f32>() / frame.len() as f32
                })
                .collect();
            match tx.try_send(mono) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => trace!("Input queue full, dropping block"),
                Err(TrySendError::Disconnected(_)) => {}
            }
        },
        move |err| {
            error!("Audio stream error: {}", err);
            if matches!(err, cpal::StreamError::DeviceNotAvailable) {
                device_lost.store(true, Ordering::Release);
            }
        },
        None,
    )?;
    Ok(stream)
}

fn find_input_device(host: &cpal::Host, name: &str) -> Result<Device> {
    let devices = host.input_devices().context("Failed to enumerate input devices")?;
    for device in devices {
        if device.name().map(|n| n.contains(name)).unwrap_or(false) {
            return Ok(device);
        }
    }
    anyhow::bail!("Input device '{}' not found", name)
}

fn supports_rate(device: &Device, rate: u32) -> bool {
    device
        .supported_input_configs()
        .map(|mut configs| {
            configs.any(|c| c.min_sample_rate().0 <= rate && rate <= c.max_sample_rate().0)
        })
        .unwrap_or(false)
}

/// List the names of available input devices
pub fn list_input_devices() -> Result<Vec<String>> {
    let host = cpal::default_host();
    let mut names = Vec::new();
    for device in host.input_devices()? {
        if let Ok(name) = device.name() {
            names.push(name);
        }
    }
    Ok(names)
}
