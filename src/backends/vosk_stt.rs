use super::{SpeechRecognizer, SttModel};
use crate::{Error, Result};
use std::path::Path;
use std::sync::Once;
use vosk::{CompleteResult, DecodingState, LogLevel, Model, Recognizer};

static QUIET_KALDI: Once = Once::new();

/// An offline Vosk model directory loaded into memory
pub struct VoskModel {
    model: Model,
    name: String,
}

impl VoskModel {
    pub fn load(path: &Path) -> Result<Self> {
        QUIET_KALDI.call_once(|| vosk::set_log_level(LogLevel::Error));

        if !path.is_dir() {
            return Err(Error::InitializationFailed(format!(
                "vosk model not found at {}",
                path.display()
            )));
        }

        let model = Model::new(path.to_string_lossy()).ok_or_else(|| {
            Error::InitializationFailed(format!("failed to load vosk model {}", path.display()))
        })?;

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        tracing::info!(model = %name, "vosk model loaded");

        Ok(Self { model, name })
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl SttModel for VoskModel {
    fn recognizer(&self, sample_rate: u32) -> Result<Box<dyn SpeechRecognizer>> {
        let recognizer = Recognizer::new(&self.model, sample_rate as f32).ok_or_else(|| {
            Error::InitializationFailed(format!("vosk recognizer for {}", self.name))
        })?;
        Ok(Box::new(VoskRecognizer {
            recognizer,
            finalized: false,
        }))
    }
}

pub struct VoskRecognizer {
    recognizer: Recognizer,
    // Set once Vosk reports the end of an utterance
    finalized: bool,
}

impl SpeechRecognizer for VoskRecognizer {
    fn accept(&mut self, pcm: &[i16]) -> Result<bool> {
        let state = self
            .recognizer
            .accept_waveform(pcm)
            .map_err(|e| Error::InitializationFailed(format!("vosk decode: {:?}", e)))?;
        if matches!(state, DecodingState::Finalized) {
            self.finalized = true;
        }
        Ok(self.finalized)
    }

    fn final_text(&mut self) -> String {
        let result = if self.finalized {
            self.recognizer.result()
        } else {
            self.recognizer.final_result()
        };
        text_of(result)
    }
}

fn text_of(result: CompleteResult<'_>) -> String {
    match result.single() {
        Some(single) => single.text.trim().to_string(),
        None => String::new(),
    }
}
