use crate::backends::SpeechBackend;
use crate::device::AudioDevice;
use crate::worker::{self, OnDrop};
use crate::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Speaks text through the shared audio device, one utterance per worker.
#[derive(Clone)]
pub struct AudioEngine {
    device: AudioDevice,
    current: Arc<Mutex<Option<Arc<AtomicBool>>>>,
}

impl AudioEngine {
    pub fn new(device: AudioDevice) -> Self {
        Self {
            device,
            current: Arc::new(Mutex::new(None)),
        }
    }

    /// Synthesize `text` with `voice` and play it.
    ///
    /// `on_done` runs exactly once after the device has been released,
    /// whether playback finished, was stopped, or failed. Synthesis and
    /// playback errors are logged, not returned.
    pub fn speak<F>(&self, voice: Arc<dyn SpeechBackend>, text: &str, on_done: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        *self.current.lock().unwrap_or_else(|e| e.into_inner()) = Some(stop.clone());

        let done = OnDrop::new(on_done);
        let device = self.device.clone();
        let text = text.to_string();

        worker::spawn("speech-playback", move || {
            let _done = done;
            play_text(&device, voice.as_ref(), &text, &stop);
        })?;
        Ok(())
    }

    /// Interrupt whatever is playing
    pub fn stop(&self) {
        if let Some(stop) = self
            .current
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            stop.store(true, Ordering::SeqCst);
            tracing::debug!("playback stop requested");
        }
    }
}

fn play_text(device: &AudioDevice, voice: &dyn SpeechBackend, text: &str, stop: &AtomicBool) {
    tracing::debug!(voice = voice.id(), "synthesizing '{}'", text);
    let waveform = match voice.synthesize(text) {
        Ok(w) => w,
        Err(e) => {
            tracing::error!(error = %e, "speech synthesis failed");
            return;
        }
    };
    if waveform.is_empty() || stop.load(Ordering::SeqCst) {
        return;
    }

    let (_lease, mut sink) = match device.open_playback() {
        Ok(pair) => pair,
        Err(e) => {
            tracing::warn!(error = %e, "cannot play speech");
            return;
        }
    };
    // Stopped while waiting for the device
    if stop.load(Ordering::SeqCst) {
        return;
    }
    if let Err(e) = sink.play(&waveform, stop) {
        tracing::warn!(error = %e, "playback failed");
    }
}
