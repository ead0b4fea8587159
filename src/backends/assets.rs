//! On-disk model layout.
//!
//! ```text
//! <assets_dir>/vosk/vosk-model-small-en-us-0.15/
//! <assets_dir>/vosk/vosk-model-small-hi-0.22/
//! <assets_dir>/piper/en_US-lessac-medium.onnx(.json)
//! <assets_dir>/piper/hi_IN-cmu-medium.onnx(.json)
//! ```

use super::piper::PiperVoice;
use super::rustpotter_wake::RustpotterEngine;
use super::vosk_stt::VoskModel;
use super::{ModelProvider, SpeechBackend, SttModel, WakeEngine};
use crate::config_loader::Settings;
use crate::profiles::Language;
use crate::Result;
use std::path::PathBuf;
use std::sync::Arc;

/// Loads Vosk, Piper and rustpotter models from the assets directory
#[derive(Debug, Clone)]
pub struct AssetModels {
    assets_dir: PathBuf,
    piper_binary: String,
    wake_model: PathBuf,
}

impl AssetModels {
    pub fn new(
        assets_dir: impl Into<PathBuf>,
        piper_binary: impl Into<String>,
        wake_model: impl Into<PathBuf>,
    ) -> Self {
        Self {
            assets_dir: assets_dir.into(),
            piper_binary: piper_binary.into(),
            wake_model: wake_model.into(),
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(
            &settings.assets_dir,
            settings.piper_binary.clone(),
            &settings.wake_model_path,
        )
    }

    pub fn stt_path(&self, language: Language) -> PathBuf {
        let dir = match language {
            Language::En => "vosk-model-small-en-us-0.15",
            Language::Hi => "vosk-model-small-hi-0.22",
        };
        self.assets_dir.join("vosk").join(dir)
    }

    pub fn tts_path(&self, language: Language) -> PathBuf {
        let voice = match language {
            Language::En => "en_US-lessac-medium.onnx",
            Language::Hi => "hi_IN-cmu-medium.onnx",
        };
        self.assets_dir.join("piper").join(voice)
    }
}

impl ModelProvider for AssetModels {
    fn load_stt(&self, language: Language) -> Result<Arc<dyn SttModel>> {
        Ok(Arc::new(VoskModel::load(&self.stt_path(language))?))
    }

    fn load_tts(&self, language: Language) -> Result<Arc<dyn SpeechBackend>> {
        Ok(Arc::new(PiperVoice::load(
            &self.piper_binary,
            &self.tts_path(language),
        )?))
    }

    fn load_wake(&self, sensitivity: f32) -> Result<Box<dyn WakeEngine>> {
        Ok(Box::new(RustpotterEngine::load(&self.wake_model, sensitivity)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    #[test]
    fn test_layout() {
        let assets = AssetModels::new("/srv/heybro", "piper", "/srv/heybro/wake/hey-bro.rpw");
        assert_eq!(
            assets.stt_path(Language::Hi),
            PathBuf::from("/srv/heybro/vosk/vosk-model-small-hi-0.22")
        );
        assert_eq!(
            assets.tts_path(Language::En),
            PathBuf::from("/srv/heybro/piper/en_US-lessac-medium.onnx")
        );
    }

    #[test]
    fn test_missing_language_fails_alone() {
        let dir = tempfile::tempdir().unwrap();
        let piper = dir.path().join("piper");
        std::fs::create_dir_all(&piper).unwrap();
        std::fs::write(piper.join("en_US-lessac-medium.onnx"), b"").unwrap();
        std::fs::write(piper.join("en_US-lessac-medium.onnx.json"), b"{}").unwrap();

        let assets = AssetModels::new(dir.path(), "piper", dir.path().join("none.rpw"));
        assert!(assets.load_tts(Language::En).is_ok());
        assert!(matches!(
            assets.load_tts(Language::Hi),
            Err(Error::InitializationFailed(_))
        ));
        assert!(matches!(
            assets.load_wake(0.5),
            Err(Error::InitializationFailed(_))
        ));
    }
}
