//! Microphone capture through cpal, playback through rodio.

use super::{resample_into, AudioBackend, InputStream, OutputSink, Waveform};
use crate::{Error, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::{HeapCons, HeapRb};
use rodio::buffer::SamplesBuffer;
use rodio::{OutputStream, OutputStreamHandle, Sink};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

/// Seconds of native-rate audio buffered between the device callback and
/// the reader
pub const BUFFER_SECS: usize = 2;

const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Default host devices
pub struct CpalBackend;

impl CpalBackend {
    pub fn new() -> Self {
        Self
    }
}

impl Default for CpalBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioBackend for CpalBackend {
    fn open_input(&self, sample_rate: u32) -> Result<Box<dyn InputStream>> {
        Ok(Box::new(CpalInput::open(sample_rate)?))
    }

    fn open_output(&self) -> Result<Box<dyn OutputSink>> {
        Ok(Box::new(RodioOutput::open()?))
    }
}

/// Live microphone stream, downmixed to mono and resampled on read
pub struct CpalInput {
    // Stream must stay alive for the callback to keep running
    _stream: cpal::Stream,
    consumer: HeapCons<i16>,
    native_rate: u32,
    target_rate: u32,
    scratch: Vec<i16>,
}

impl CpalInput {
    pub fn open(target_rate: u32) -> Result<Self> {
        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .ok_or_else(|| Error::DeviceUnavailable("no input device found".to_string()))?;

        tracing::debug!(
            device = %device.name().unwrap_or_else(|_| "Unknown".into()),
            "opening input device"
        );

        let supported = device
            .default_input_config()
            .map_err(|e| Error::DeviceUnavailable(format!("input config: {}", e)))?;

        let native_rate = supported.sample_rate();
        let channels = usize::from(supported.channels()).max(1);
        let config: cpal::StreamConfig = supported.config();

        let rb = HeapRb::<i16>::new(native_rate as usize * BUFFER_SECS);
        let (mut producer, consumer) = rb.split();

        let err_fn = |err: cpal::StreamError| tracing::error!(error = %err, "input stream error");

        let stream = match supported.sample_format() {
            cpal::SampleFormat::F32 => device.build_input_stream(
                &config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    let mono = data.chunks(channels).map(|frame| {
                        let avg = frame.iter().sum::<f32>() / frame.len() as f32;
                        (avg * 32767.0).clamp(-32768.0, 32767.0) as i16
                    });
                    // Samples that do not fit are dropped when the reader falls behind
                    producer.push_iter(mono);
                },
                err_fn,
                None,
            ),
            cpal::SampleFormat::I16 => device.build_input_stream(
                &config,
                move |data: &[i16], _: &cpal::InputCallbackInfo| {
                    let mono = data.chunks(channels).map(|frame| {
                        let sum: i32 = frame.iter().map(|&s| i32::from(s)).sum();
                        (sum / frame.len() as i32) as i16
                    });
                    producer.push_iter(mono);
                },
                err_fn,
                None,
            ),
            other => {
                return Err(Error::DeviceUnavailable(format!(
                    "unsupported input sample format {:?}",
                    other
                )))
            }
        }
        .map_err(|e| Error::DeviceUnavailable(format!("building input stream: {}", e)))?;

        stream
            .play()
            .map_err(|e| Error::DeviceUnavailable(format!("starting input stream: {}", e)))?;

        tracing::debug!(native_rate, target_rate, channels, "input stream started");

        Ok(Self {
            _stream: stream,
            consumer,
            native_rate,
            target_rate,
            scratch: Vec::new(),
        })
    }

    fn native_len(&self, target_len: usize) -> usize {
        if self.native_rate == self.target_rate {
            return target_len;
        }
        ((target_len as u64 * u64::from(self.native_rate)) / u64::from(self.target_rate)).max(1)
            as usize
    }
}

impl InputStream for CpalInput {
    fn read_frame(&mut self, frame: &mut [i16], timeout: Duration) -> Result<bool> {
        let needed = self.native_len(frame.len());
        let deadline = Instant::now() + timeout;

        while self.consumer.occupied_len() < needed {
            if Instant::now() >= deadline {
                return Ok(false);
            }
            thread::sleep(POLL_INTERVAL);
        }

        if needed == frame.len() {
            self.consumer.pop_slice(frame);
        } else {
            self.scratch.resize(needed, 0);
            self.consumer.pop_slice(&mut self.scratch);
            resample_into(&self.scratch, frame);
        }
        Ok(true)
    }
}

/// Default output device via rodio
pub struct RodioOutput {
    // Audio stream must live as long as the handle
    _stream: OutputStream,
    handle: OutputStreamHandle,
}

impl RodioOutput {
    pub fn open() -> Result<Self> {
        let (stream, handle) = OutputStream::try_default()
            .map_err(|e| Error::DeviceUnavailable(format!("no audio output device: {}", e)))?;
        Ok(Self {
            _stream: stream,
            handle,
        })
    }
}

impl OutputSink for RodioOutput {
    fn play(&mut self, waveform: &Waveform, stop: &AtomicBool) -> Result<()> {
        if waveform.is_empty() {
            return Ok(());
        }

        let sink = Sink::try_new(&self.handle)
            .map_err(|e| Error::DeviceUnavailable(format!("failed to create sink: {}", e)))?;
        sink.append(SamplesBuffer::new(
            waveform.channels.max(1),
            waveform.sample_rate,
            waveform.samples.clone(),
        ));

        while !sink.empty() {
            if stop.load(Ordering::SeqCst) {
                sink.stop();
                tracing::debug!("playback interrupted");
                return Ok(());
            }
            thread::sleep(Duration::from_millis(20));
        }
        Ok(())
    }
}
