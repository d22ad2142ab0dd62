//! Frame sources for producers
//!
//! Sources deliver 20 ms frames of 16 kHz mono PCM over a bounded channel.
//! The microphone source captures on a dedicated thread that owns the cpal
//! stream, the tone source synthesizes a sine wave for tests and demos.

use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::{FromSample, Sample, SizedSample};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::audio::device::{find_device, Direction};
use crate::audio::frame::frame_duration;
use crate::audio::resample::LinearResampler;
use crate::constants::{SAMPLES_PER_FRAME, SAMPLE_RATE};
use crate::error::AudioError;

/// Frames buffered between a source and its consumer
pub const SOURCE_QUEUE_FRAMES: usize = 64;

/// Producer-side audio input
pub trait FrameSource: Send {
    /// Start producing frames of [`SAMPLES_PER_FRAME`] samples
    fn start(&mut self) -> Result<Receiver<Vec<i16>>, AudioError>;

    fn stop(&mut self);

    fn is_running(&self) -> bool;

    /// Frames discarded because the consumer fell behind
    fn dropped_frames(&self) -> u64 {
        0
    }
}

/// Splits resampled mono audio into fixed-size frames
struct Framer {
    pending: Vec<f32>,
    resampler: LinearResampler,
    mono: Vec<f32>,
    resampled: Vec<f32>,
    channels: usize,
}

impl Framer {
    fn new(input_rate: u32, channels: u16) -> Self {
        Self {
            pending: Vec::with_capacity(SAMPLES_PER_FRAME * 2),
            resampler: LinearResampler::new(input_rate, SAMPLE_RATE),
            mono: Vec::new(),
            resampled: Vec::new(),
            channels: channels.max(1) as usize,
        }
    }

    /// Feed interleaved device samples, calling `emit` for each full frame
    fn feed(&mut self, data: &[f32], mut emit: impl FnMut(Vec<i16>)) {
        self.mono.clear();
        self.mono.extend(
            data.chunks(self.channels)
                .map(|c| c.iter().sum::<f32>() / c.len() as f32),
        );
        self.resampled.clear();
        self.resampler.process(&self.mono, &mut self.resampled);
        self.pending.extend_from_slice(&self.resampled);

        while self.pending.len() >= SAMPLES_PER_FRAME {
            let frame: Vec<i16> = self
                .pending
                .drain(..SAMPLES_PER_FRAME)
                .map(|s| (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16)
                .collect();
            emit(frame);
        }
    }
}

fn send_frame(tx: &Sender<Vec<i16>>, frame: Vec<i16>, dropped: &AtomicU64) {
    if let Err(TrySendError::Full(_)) = tx.try_send(frame) {
        dropped.fetch_add(1, Ordering::Relaxed);
    }
}

/// Microphone capture through cpal
pub struct MicrophoneSource {
    device_id: Option<String>,
    running: Arc<AtomicBool>,
    thread_handle: Option<JoinHandle<()>>,
    error_rx: Option<Receiver<AudioError>>,
    dropped: Arc<AtomicU64>,
}

impl MicrophoneSource {
    /// Capture from a device id, or the default input device
    pub fn new(device_id: Option<String>) -> Self {
        Self {
            device_id,
            running: Arc::new(AtomicBool::new(false)),
            thread_handle: None,
            error_rx: None,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Next stream error reported by the device, if any
    pub fn check_errors(&self) -> Option<AudioError> {
        self.error_rx.as_ref().and_then(|rx| rx.try_recv().ok())
    }
}

impl FrameSource for MicrophoneSource {
    fn start(&mut self) -> Result<Receiver<Vec<i16>>, AudioError> {
        if self.running.load(Ordering::SeqCst) {
            return Err(AudioError::AlreadyRunning);
        }

        let device = find_device(Direction::Input, self.device_id.as_deref())?;
        let default_config = device.default_config()?;
        let sample_format = default_config.sample_format();
        let config: cpal::StreamConfig = default_config.into();

        let (frame_tx, frame_rx) = bounded::<Vec<i16>>(SOURCE_QUEUE_FRAMES);
        let (error_tx, error_rx) = bounded::<AudioError>(16);
        let (ready_tx, ready_rx) = bounded::<Result<(), AudioError>>(1);
        self.error_rx = Some(error_rx);
        self.running.store(true, Ordering::SeqCst);

        let running = self.running.clone();
        let dropped = self.dropped.clone();
        let device_name = device.name.clone();

        let handle = thread::Builder::new()
            .name("capture".to_string())
            .spawn(move || {
                let cpal_device = device.into_inner();
                let framer = Framer::new(config.sample_rate.0, config.channels);
                let built = match sample_format {
                    cpal::SampleFormat::F32 => build_input::<f32>(
                        &cpal_device,
                        &config,
                        framer,
                        frame_tx,
                        error_tx,
                        running.clone(),
                        dropped,
                    ),
                    cpal::SampleFormat::I16 => build_input::<i16>(
                        &cpal_device,
                        &config,
                        framer,
                        frame_tx,
                        error_tx,
                        running.clone(),
                        dropped,
                    ),
                    other => Err(AudioError::UnsupportedFormat(format!("{:?}", other))),
                };

                let stream = match built {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(e.into()));
                    return;
                }
                let _ = ready_tx.send(Ok(()));

                while running.load(Ordering::Relaxed) {
                    thread::sleep(Duration::from_millis(10));
                }
                // Stream is dropped here, stopping capture
            })
            .map_err(|e| {
                self.running.store(false, Ordering::SeqCst);
                AudioError::StreamError(e.to_string())
            })?;

        let ready = ready_rx
            .recv()
            .unwrap_or_else(|_| Err(AudioError::StreamError("Capture thread exited".to_string())));
        if let Err(e) = ready {
            self.running.store(false, Ordering::SeqCst);
            let _ = handle.join();
            return Err(e);
        }

        tracing::info!("Capturing from '{}'", device_name);
        self.thread_handle = Some(handle);
        Ok(frame_rx)
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn dropped_frames(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Drop for MicrophoneSource {
    fn drop(&mut self) {
        self.stop();
    }
}

fn build_input<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    mut framer: Framer,
    frame_tx: Sender<Vec<i16>>,
    error_tx: Sender<AudioError>,
    running: Arc<AtomicBool>,
    dropped: Arc<AtomicU64>,
) -> Result<cpal::Stream, AudioError>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    let mut scratch: Vec<f32> = Vec::new();
    let stream = device.build_input_stream(
        config,
        move |data: &[T], _: &cpal::InputCallbackInfo| {
            if !running.load(Ordering::Relaxed) {
                return;
            }
            scratch.clear();
            scratch.extend(data.iter().map(|s| f32::from_sample(*s)));
            framer.feed(&scratch, |frame| send_frame(&frame_tx, frame, &dropped));
        },
        move |err| {
            let _ = error_tx.try_send(AudioError::StreamError(err.to_string()));
        },
        None,
    )?;
    Ok(stream)
}

/// Sine wave generator paced at real time
pub struct ToneSource {
    frequency: f32,
    amplitude: f32,
    frame_limit: Option<u64>,
    paced: bool,
    running: Arc<AtomicBool>,
    thread_handle: Option<JoinHandle<()>>,
    dropped: Arc<AtomicU64>,
}

impl ToneSource {
    pub fn new(frequency: f32, amplitude: f32) -> Self {
        Self {
            frequency,
            amplitude: amplitude.clamp(0.0, 1.0),
            frame_limit: None,
            paced: true,
            running: Arc::new(AtomicBool::new(false)),
            thread_handle: None,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Stop after emitting `frames` frames
    pub fn with_frame_limit(mut self, frames: u64) -> Self {
        self.frame_limit = Some(frames);
        self
    }

    /// Emit frames as fast as the consumer takes them
    pub fn unpaced(mut self) -> Self {
        self.paced = false;
        self
    }
}

impl FrameSource for ToneSource {
    fn start(&mut self) -> Result<Receiver<Vec<i16>>, AudioError> {
        if self.running.load(Ordering::SeqCst) {
            return Err(AudioError::AlreadyRunning);
        }
        let (frame_tx, frame_rx) = bounded::<Vec<i16>>(SOURCE_QUEUE_FRAMES);
        self.running.store(true, Ordering::SeqCst);

        let running = self.running.clone();
        let dropped = self.dropped.clone();
        let step = std::f32::consts::TAU * self.frequency / SAMPLE_RATE as f32;
        let amplitude = self.amplitude * i16::MAX as f32;
        let frame_limit = self.frame_limit;
        let paced = self.paced;

        let handle = thread::Builder::new()
            .name("tone".to_string())
            .spawn(move || {
                let mut phase = 0.0f32;
                let mut emitted = 0u64;
                let started = Instant::now();

                while running.load(Ordering::Relaxed) {
                    if frame_limit.is_some_and(|limit| emitted >= limit) {
                        break;
                    }
                    let frame: Vec<i16> = (0..SAMPLES_PER_FRAME)
                        .map(|_| {
                            let s = (phase.sin() * amplitude) as i16;
                            phase = (phase + step) % std::f32::consts::TAU;
                            s
                        })
                        .collect();

                    if paced {
                        send_frame(&frame_tx, frame, &dropped);
                        emitted += 1;
                        let due = started + frame_duration() * emitted as u32;
                        if let Some(wait) = due.checked_duration_since(Instant::now()) {
                            thread::sleep(wait);
                        }
                    } else {
                        if frame_tx.send(frame).is_err() {
                            break;
                        }
                        emitted += 1;
                    }
                }
                running.store(false, Ordering::SeqCst);
            })
            .map_err(|e| {
                self.running.store(false, Ordering::SeqCst);
                AudioError::StreamError(e.to_string())
            })?;

        self.thread_handle = Some(handle);
        Ok(frame_rx)
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn dropped_frames(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Drop for ToneSource {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_framer_downmixes_and_chunks() {
        let mut framer = Framer::new(SAMPLE_RATE, 2);
        let mut frames = Vec::new();
        // 500 stereo sample pairs: one full frame plus leftover
        let data: Vec<f32> = (0..500).flat_map(|_| [0.5f32, 0.0]).collect();
        framer.feed(&data, |f| frames.push(f));

        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].len(), SAMPLES_PER_FRAME);
        let expected = (0.25 * i16::MAX as f32) as i16;
        assert!(frames[0].iter().all(|s| (*s - expected).abs() <= 1));
        assert_eq!(framer.pending.len(), 500 - SAMPLES_PER_FRAME);
    }

    #[test]
    fn test_framer_resamples_to_relay_rate() {
        let mut framer = Framer::new(48_000, 1);
        let mut count = 0;
        // One second at 48 kHz becomes about 50 frames at 16 kHz
        for _ in 0..100 {
            framer.feed(&[0.1f32; 480], |_| count += 1);
        }
        assert!((49..=50).contains(&count), "{}", count);
    }

    #[test]
    fn test_tone_source_frame_limit() {
        let mut source = ToneSource::new(440.0, 0.5).with_frame_limit(10).unpaced();
        let rx = source.start().unwrap();
        let frames: Vec<Vec<i16>> = rx.iter().collect();
        assert_eq!(frames.len(), 10);
        assert!(frames.iter().all(|f| f.len() == SAMPLES_PER_FRAME));
        let peak = frames.iter().flatten().map(|s| s.unsigned_abs()).max().unwrap();
        assert!(peak > 15_000 && peak <= 16_384, "{}", peak);
        source.stop();
        assert!(!source.is_running());
    }

    #[test]
    fn test_tone_source_rejects_double_start() {
        let mut source = ToneSource::new(440.0, 0.5).with_frame_limit(1000);
        let _rx = source.start().unwrap();
        assert!(matches!(source.start(), Err(AudioError::AlreadyRunning)));
        source.stop();
    }
}
