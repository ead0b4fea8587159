//! Per-language model handles and the cache that owns them.

use crate::backends::{ModelProvider, SpeechBackend, SttModel};
use crate::{Error, Result};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Language {
    #[default]
    En,
    Hi,
}

impl Language {
    pub fn code(self) -> &'static str {
        match self {
            Language::En => "en",
            Language::Hi => "hi",
        }
    }

    /// The other supported language
    pub fn toggle(self) -> Self {
        match self {
            Language::En => Language::Hi,
            Language::Hi => Language::En,
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for Language {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "en" | "english" => Ok(Language::En),
            "hi" | "hindi" => Ok(Language::Hi),
            other => Err(Error::InitializationFailed(format!(
                "unsupported language '{}'",
                other
            ))),
        }
    }
}

/// Everything needed to hear and speak one language
#[derive(Clone)]
pub struct LanguageProfile {
    pub language: Language,
    pub stt: Arc<dyn SttModel>,
    pub tts: Arc<dyn SpeechBackend>,
}

impl LanguageProfile {
    /// Load both models for `language`. Blocks while the models are read.
    pub fn load(provider: &dyn ModelProvider, language: Language) -> Result<Self> {
        tracing::info!(%language, "loading language models");
        let stt = provider.load_stt(language)?;
        let tts = provider.load_tts(language)?;
        Ok(Self { language, stt, tts })
    }
}

impl fmt::Debug for LanguageProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LanguageProfile")
            .field("language", &self.language)
            .field("voice", &self.tts.id())
            .finish()
    }
}

/// Loaded profiles, one per language, kept for the life of the process.
///
/// A language's models are loaded the first time it is activated. A failed
/// load leaves the cache untouched, so it may be retried later.
pub struct LanguageProfiles {
    provider: Arc<dyn ModelProvider>,
    loaded: HashMap<Language, LanguageProfile>,
    active: Option<Language>,
}

impl LanguageProfiles {
    pub fn new(provider: Arc<dyn ModelProvider>) -> Self {
        Self {
            provider,
            loaded: HashMap::new(),
            active: None,
        }
    }

    pub fn provider(&self) -> Arc<dyn ModelProvider> {
        self.provider.clone()
    }

    pub fn is_loaded(&self, language: Language) -> bool {
        self.loaded.contains_key(&language)
    }

    /// Cache a profile loaded elsewhere, replacing any earlier one.
    pub fn insert(&mut self, profile: LanguageProfile) {
        self.loaded.insert(profile.language, profile);
    }

    /// Switch to an already loaded language. `None` if it is not cached.
    pub fn select(&mut self, language: Language) -> Option<LanguageProfile> {
        let profile = self.loaded.get(&language)?.clone();
        self.active = Some(language);
        Some(profile)
    }

    /// Make `language` the active profile, loading its models on this
    /// thread if needed.
    pub fn activate(&mut self, language: Language) -> Result<LanguageProfile> {
        if let Some(profile) = self.select(language) {
            return Ok(profile);
        }
        let profile = LanguageProfile::load(self.provider.as_ref(), language)?;
        self.insert(profile);
        self.select(language)
            .ok_or_else(|| Error::InitializationFailed(format!("{} profile missing", language)))
    }

    pub fn active(&self) -> Option<LanguageProfile> {
        self.active.and_then(|l| self.loaded.get(&l).cloned())
    }

    pub fn active_language(&self) -> Option<Language> {
        self.active
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::{SpeechRecognizer, WakeEngine, Waveform};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct NullStt;
    impl SttModel for NullStt {
        fn recognizer(&self, _: u32) -> Result<Box<dyn SpeechRecognizer>> {
            Err(Error::InitializationFailed("null".into()))
        }
    }

    struct NullVoice;
    impl SpeechBackend for NullVoice {
        fn synthesize(&self, _: &str) -> Result<Waveform> {
            Ok(Waveform::default())
        }
        fn id(&self) -> &str {
            "null"
        }
    }

    #[derive(Default)]
    struct CountingProvider {
        stt_loads: AtomicUsize,
    }

    impl ModelProvider for CountingProvider {
        fn load_stt(&self, language: Language) -> Result<Arc<dyn SttModel>> {
            if language == Language::Hi {
                return Err(Error::InitializationFailed("no hindi model".into()));
            }
            self.stt_loads.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(NullStt))
        }
        fn load_tts(&self, _: Language) -> Result<Arc<dyn SpeechBackend>> {
            Ok(Arc::new(NullVoice))
        }
        fn load_wake(&self, _: f32) -> Result<Box<dyn WakeEngine>> {
            Err(Error::InitializationFailed("no wake".into()))
        }
    }

    #[test]
    fn test_language_parse_and_toggle() {
        assert_eq!("HI".parse::<Language>().unwrap(), Language::Hi);
        assert_eq!("english".parse::<Language>().unwrap(), Language::En);
        assert!("fr".parse::<Language>().is_err());
        assert_eq!(Language::En.toggle(), Language::Hi);
        assert_eq!(Language::Hi.to_string(), "hi");
    }

    #[test]
    fn test_models_load_once() {
        let provider = Arc::new(CountingProvider::default());
        let mut profiles = LanguageProfiles::new(provider.clone());

        profiles.activate(Language::En).unwrap();
        profiles.activate(Language::En).unwrap();
        assert_eq!(provider.stt_loads.load(Ordering::SeqCst), 1);
        assert_eq!(profiles.active_language(), Some(Language::En));
    }

    #[test]
    fn test_insert_then_select() {
        let provider = Arc::new(CountingProvider::default());
        let mut profiles = LanguageProfiles::new(provider.clone());

        assert!(profiles.select(Language::En).is_none());
        let profile = LanguageProfile::load(provider.as_ref(), Language::En).unwrap();
        profiles.insert(profile);
        assert!(profiles.is_loaded(Language::En));
        assert_eq!(profiles.active_language(), None);

        assert_eq!(profiles.select(Language::En).unwrap().language, Language::En);
        assert_eq!(profiles.active_language(), Some(Language::En));
        assert_eq!(provider.stt_loads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failed_load_keeps_previous_profile() {
        let provider = Arc::new(CountingProvider::default());
        let mut profiles = LanguageProfiles::new(provider);

        profiles.activate(Language::En).unwrap();
        assert!(profiles.activate(Language::Hi).is_err());
        assert!(!profiles.is_loaded(Language::Hi));
        assert_eq!(profiles.active().unwrap().language, Language::En);
    }
}
