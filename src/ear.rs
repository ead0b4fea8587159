//! Command capture: record one utterance after the wake word and transcribe it.

use crate::backends::{SpeechRecognizer, SAMPLE_RATE};
use crate::device::AudioDevice;
use crate::profiles::LanguageProfile;
use crate::{worker, Error, Result};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

const RUNNING: u8 = 0;
const STOPPED: u8 = 1;
const DONE: u8 = 2;

type ResultCallback = Box<dyn FnOnce(Result<String>) + Send>;

/// Audio captured for one command
#[derive(Debug, Default, Clone)]
pub struct Utterance {
    pub raw_audio_frames: Vec<i16>,
    pub transcript: Option<String>,
}

/// Hands the capture result to the caller at most once.
///
/// If the worker unwinds without delivering, dropping this reports an empty
/// transcript.
struct Delivery {
    state: Arc<AtomicU8>,
    callback: Option<ResultCallback>,
}

impl Delivery {
    fn deliver(&mut self, result: Result<String>) {
        let Some(callback) = self.callback.take() else {
            return;
        };
        if self
            .state
            .compare_exchange(RUNNING, DONE, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            callback(result);
        } else {
            tracing::debug!("capture was stopped, result dropped");
        }
    }
}

impl Drop for Delivery {
    fn drop(&mut self) {
        self.deliver(Ok(String::new()));
    }
}

pub struct Ear {
    device: AudioDevice,
    block: Duration,
    max_duration: Duration,
    current: Mutex<Option<Arc<AtomicU8>>>,
}

impl Ear {
    pub fn new(device: AudioDevice, block: Duration, max_duration: Duration) -> Self {
        Self {
            device,
            block: block.max(Duration::from_millis(10)),
            max_duration,
            current: Mutex::new(None),
        }
    }

    /// Capture one utterance with `profile`'s recognizer.
    ///
    /// `on_result` is called exactly once unless [`stop`](Self::stop) is
    /// called first, in which case it is never called.
    pub fn start<F>(&self, profile: &LanguageProfile, on_result: F) -> Result<()>
    where
        F: FnOnce(Result<String>) + Send + 'static,
    {
        let mut current = self.current.lock().unwrap_or_else(|e| e.into_inner());
        if current
            .as_ref()
            .is_some_and(|s| s.load(Ordering::SeqCst) == RUNNING)
        {
            return Err(Error::Busy("capture already running".to_string()));
        }

        let state = Arc::new(AtomicU8::new(RUNNING));
        let device = self.device.clone();
        let stt = profile.stt.clone();
        let language = profile.language;
        let block = self.block;
        let max_duration = self.max_duration;
        let worker_state = state.clone();

        worker::spawn("speech-capture", move || {
            let mut delivery = Delivery {
                state: worker_state.clone(),
                callback: Some(Box::new(on_result)),
            };
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                let recognizer = match stt.recognizer(SAMPLE_RATE) {
                    Ok(r) => r,
                    Err(e) => {
                        tracing::warn!(error = %e, %language, "recognizer unavailable");
                        return Ok(Utterance::default());
                    }
                };
                capture(&device, recognizer, block, max_duration, &worker_state)
            }));
            match outcome {
                Ok(Ok(utterance)) => {
                    tracing::debug!(
                        samples = utterance.raw_audio_frames.len(),
                        "capture finished"
                    );
                    delivery.deliver(Ok(utterance.transcript.unwrap_or_default()));
                }
                Ok(Err(e)) => {
                    tracing::warn!(error = %e, "capture failed");
                    delivery.deliver(Err(e));
                }
                Err(_) => tracing::error!("capture worker panicked"),
            }
        })?;

        *current = Some(state);
        tracing::debug!(%language, "capture started");
        Ok(())
    }

    /// Cancel the current capture. Safe to call at any time, any number of
    /// times.
    pub fn stop(&self) {
        let taken = self
            .current
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(state) = taken {
            if state
                .compare_exchange(RUNNING, STOPPED, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                tracing::debug!("capture stop requested");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.current
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|s| s.load(Ordering::SeqCst) == RUNNING)
    }
}

fn capture(
    device: &AudioDevice,
    mut recognizer: Box<dyn SpeechRecognizer>,
    block: Duration,
    max_duration: Duration,
    state: &AtomicU8,
) -> Result<Utterance> {
    let block_len = (u128::from(SAMPLE_RATE) * block.as_millis() / 1000).max(1) as usize;
    let mut utterance = Utterance::default();
    let mut frame = vec![0i16; block_len];
    let mut recognized = true;

    {
        let (_lease, mut input) = device.open_capture(SAMPLE_RATE)?;
        let started = Instant::now();

        while state.load(Ordering::SeqCst) == RUNNING {
            if started.elapsed() >= max_duration {
                tracing::debug!("maximum utterance length reached");
                break;
            }
            if !input.read_frame(&mut frame, block)? {
                continue;
            }
            utterance.raw_audio_frames.extend_from_slice(&frame);
            match recognizer.accept(&frame) {
                Ok(true) => break,
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "recognition failed");
                    recognized = false;
                    break;
                }
            }
        }
        // Stream and lease are released here, before the transcript is read
    }

    if state.load(Ordering::SeqCst) != RUNNING {
        return Ok(utterance);
    }
    if recognized {
        let text = recognizer.final_text();
        tracing::info!(transcript = %text, "utterance transcribed");
        utterance.transcript = Some(text);
    }
    Ok(utterance)
}
