pub mod assets;
pub mod cpal_audio;
pub mod piper;
pub mod rustpotter_wake;
pub mod vosk_stt;

use crate::profiles::Language;
use crate::Result;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

/// Sample rate every recognizer and wake engine is fed at
pub const SAMPLE_RATE: u32 = 16000;

/// A fully synthesized utterance, interleaved 16-bit PCM
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Waveform {
    pub samples: Vec<i16>,
    pub sample_rate: u32,
    pub channels: u16,
}

impl Waveform {
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 || self.channels == 0 {
            return Duration::ZERO;
        }
        let frames = self.samples.len() as u64 / u64::from(self.channels);
        Duration::from_millis(frames * 1000 / u64::from(self.sample_rate))
    }
}

/// The physical microphone and speaker.
///
/// Streams are opened on the worker thread that uses them and are never
/// moved across threads, so they need not be `Send`.
pub trait AudioBackend: Send + Sync {
    /// Open the microphone, delivering mono samples at `sample_rate`
    fn open_input(&self, sample_rate: u32) -> Result<Box<dyn InputStream>>;

    /// Open the speaker
    fn open_output(&self) -> Result<Box<dyn OutputSink>>;
}

pub trait InputStream {
    /// Fill `frame` with the next samples.
    ///
    /// Waits at most `timeout`; returns `Ok(false)` if not enough audio
    /// arrived in time, leaving whatever did arrive for the next call.
    fn read_frame(&mut self, frame: &mut [i16], timeout: Duration) -> Result<bool>;
}

pub trait OutputSink {
    /// Play `waveform` to the end, or until `stop` is raised
    fn play(&mut self, waveform: &Waveform, stop: &AtomicBool) -> Result<()>;
}

/// Streaming recognizer for one utterance
pub trait SpeechRecognizer: Send {
    /// Feed one block. Returns true once the recognizer has heard the end of
    /// the utterance.
    fn accept(&mut self, pcm: &[i16]) -> Result<bool>;

    /// Best hypothesis for everything fed so far
    fn final_text(&mut self) -> String;
}

/// A loaded speech-to-text model that can mint recognizers
pub trait SttModel: Send + Sync {
    fn recognizer(&self, sample_rate: u32) -> Result<Box<dyn SpeechRecognizer>>;
}

/// Trait that all speech synthesis backends must implement.
pub trait SpeechBackend: Send + Sync {
    /// Synthesize the whole of `text` into one waveform
    fn synthesize(&self, text: &str) -> Result<Waveform>;

    /// Returns the unique ID of the voice (e.g., "en_US-lessac-medium")
    fn id(&self) -> &str;
}

/// Frame-based wake word detector
pub trait WakeEngine: Send {
    /// Number of samples the engine wants per call
    fn frame_length(&self) -> usize;

    fn sample_rate(&self) -> u32 {
        SAMPLE_RATE
    }

    /// Feed exactly one frame; true on detection
    fn process(&mut self, pcm: &[i16]) -> bool;
}

/// Where models come from. Each language loads independently, so a missing
/// Hindi model never affects English.
pub trait ModelProvider: Send + Sync {
    fn load_stt(&self, language: Language) -> Result<Arc<dyn SttModel>>;

    fn load_tts(&self, language: Language) -> Result<Arc<dyn SpeechBackend>>;

    fn load_wake(&self, sensitivity: f32) -> Result<Box<dyn WakeEngine>>;
}

/// Linear interpolation resampling to an exact output length
pub fn resample_into(input: &[i16], output: &mut [i16]) {
    if output.is_empty() {
        return;
    }
    if input.is_empty() {
        output.fill(0);
        return;
    }
    let ratio = input.len() as f64 / output.len() as f64;

    for (i, out) in output.iter_mut().enumerate() {
        let src_idx = i as f64 * ratio;
        let idx = src_idx as usize;
        let frac = (src_idx - idx as f64) as f32;

        let sample = if idx + 1 < input.len() {
            f32::from(input[idx]) * (1.0 - frac) + f32::from(input[idx + 1]) * frac
        } else {
            f32::from(input[input.len() - 1])
        };

        *out = sample.round().clamp(i16::MIN as f32, i16::MAX as f32) as i16;
    }
}
