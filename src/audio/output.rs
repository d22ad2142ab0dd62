//! cpal output sink
//!
//! The cpal stream is not `Send`, so it lives on its own thread. Processed
//! frames are converted to the device's rate and channel count and handed to
//! the audio callback through a small bounded channel. A full channel blocks
//! `write`, which paces the playback loop at hardware speed.

use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::{FromSample, Sample, SizedSample};
use crossbeam_channel::{bounded, Receiver, SendTimeoutError, Sender};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::audio::device::{find_device, Direction};
use crate::audio::playback::AudioSink;
use crate::audio::resample::LinearResampler;
use crate::constants::SAMPLE_RATE;
use crate::error::AudioError;

/// Chunks queued ahead of the audio callback
const OUTPUT_QUEUE_CHUNKS: usize = 4;

/// Give up on a device that stops pulling audio
const WRITE_TIMEOUT: Duration = Duration::from_secs(2);

/// Output stream parameters chosen for the device
#[derive(Debug, Clone, Copy)]
struct OutputFormat {
    sample_rate: u32,
    channels: u16,
}

/// Sink that plays 16 kHz mono PCM on a cpal output device
pub struct CpalSink {
    device_name: String,
    format: OutputFormat,
    chunk_tx: Option<Sender<Vec<f32>>>,
    error_rx: Receiver<AudioError>,
    running: Arc<AtomicBool>,
    thread_handle: Option<JoinHandle<()>>,
    resampler: LinearResampler,
    mono: Vec<f32>,
    resampled: Vec<f32>,
    silence_fills: Arc<AtomicU64>,
}

impl CpalSink {
    /// Open an output device by id, or the default device
    pub fn open(device_id: Option<&str>) -> Result<Self, AudioError> {
        let device = find_device(Direction::Output, device_id)?;
        let device_name = device.name.clone();
        let default_config = device.default_config()?;
        let sample_format = default_config.sample_format();
        let config: cpal::StreamConfig = default_config.into();
        let format = OutputFormat {
            sample_rate: config.sample_rate.0,
            channels: config.channels.max(1),
        };

        let (chunk_tx, chunk_rx) = bounded::<Vec<f32>>(OUTPUT_QUEUE_CHUNKS);
        let (error_tx, error_rx) = bounded::<AudioError>(16);
        let (ready_tx, ready_rx) = bounded::<Result<(), AudioError>>(1);
        let running = Arc::new(AtomicBool::new(true));
        let silence_fills = Arc::new(AtomicU64::new(0));

        let thread_running = running.clone();
        let thread_fills = silence_fills.clone();
        let handle = thread::Builder::new()
            .name("audio-output".to_string())
            .spawn(move || {
                let cpal_device = device.into_inner();
                let built = match sample_format {
                    cpal::SampleFormat::F32 => build_stream::<f32>(
                        &cpal_device,
                        &config,
                        chunk_rx,
                        error_tx,
                        thread_running.clone(),
                        thread_fills,
                    ),
                    cpal::SampleFormat::I16 => build_stream::<i16>(
                        &cpal_device,
                        &config,
                        chunk_rx,
                        error_tx,
                        thread_running.clone(),
                        thread_fills,
                    ),
                    cpal::SampleFormat::U16 => build_stream::<u16>(
                        &cpal_device,
                        &config,
                        chunk_rx,
                        error_tx,
                        thread_running.clone(),
                        thread_fills,
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

                // Keep the stream alive until the sink is closed
                while thread_running.load(Ordering::Relaxed) {
                    thread::sleep(Duration::from_millis(10));
                }
            })
            .map_err(|e| AudioError::StreamError(e.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = handle.join();
                return Err(e);
            }
            Err(_) => {
                let _ = handle.join();
                return Err(AudioError::StreamError("Output thread exited".to_string()));
            }
        }

        tracing::info!(
            "Opened output '{}' at {} Hz, {} channel(s)",
            device_name,
            format.sample_rate,
            format.channels
        );

        Ok(Self {
            device_name,
            format,
            chunk_tx: Some(chunk_tx),
            error_rx,
            running,
            thread_handle: Some(handle),
            resampler: LinearResampler::new(SAMPLE_RATE, format.sample_rate),
            mono: Vec::new(),
            resampled: Vec::new(),
            silence_fills,
        })
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    pub fn sample_rate(&self) -> u32 {
        self.format.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.format.channels
    }

    /// Audio callbacks that ran out of data and played silence
    pub fn silence_fills(&self) -> u64 {
        self.silence_fills.load(Ordering::Relaxed)
    }
}

impl AudioSink for CpalSink {
    fn write(&mut self, samples: &[i16]) -> Result<(), AudioError> {
        if let Ok(err) = self.error_rx.try_recv() {
            return Err(err);
        }
        let Some(chunk_tx) = self.chunk_tx.as_ref() else {
            return Err(AudioError::SinkClosed);
        };

        self.mono.clear();
        self.mono.extend(samples.iter().map(|s| *s as f32 / 32768.0));
        self.resampled.clear();
        self.resampler.process(&self.mono, &mut self.resampled);

        let channels = self.format.channels as usize;
        let mut chunk = Vec::with_capacity(self.resampled.len() * channels);
        for sample in &self.resampled {
            chunk.extend(std::iter::repeat(*sample).take(channels));
        }

        match chunk_tx.send_timeout(chunk, WRITE_TIMEOUT) {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(_)) => Err(AudioError::SinkFailed(format!(
                "Output '{}' stopped consuming audio",
                self.device_name
            ))),
            Err(SendTimeoutError::Disconnected(_)) => Err(AudioError::SinkClosed),
        }
    }

    fn close(&mut self) {
        self.chunk_tx = None;
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for CpalSink {
    fn drop(&mut self) {
        self.close();
    }
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    chunk_rx: Receiver<Vec<f32>>,
    error_tx: Sender<AudioError>,
    running: Arc<AtomicBool>,
    silence_fills: Arc<AtomicU64>,
) -> Result<cpal::Stream, AudioError>
where
    T: SizedSample + FromSample<f32>,
{
    let mut pending: VecDeque<f32> = VecDeque::new();

    let stream = device.build_output_stream(
        config,
        move |out: &mut [T], _: &cpal::OutputCallbackInfo| {
            if !running.load(Ordering::Relaxed) {
                out.fill(T::EQUILIBRIUM);
                return;
            }

            while pending.len() < out.len() {
                match chunk_rx.try_recv() {
                    Ok(chunk) => pending.extend(chunk),
                    Err(_) => break,
                }
            }

            if pending.len() < out.len() {
                silence_fills.fetch_add(1, Ordering::Relaxed);
            }
            for slot in out.iter_mut() {
                *slot = match pending.pop_front() {
                    Some(s) => T::from_sample(s),
                    None => T::EQUILIBRIUM,
                };
            }
        },
        move |err| {
            let _ = error_tx.try_send(AudioError::StreamError(err.to_string()));
        },
        None,
    )?;

    Ok(stream)
}
