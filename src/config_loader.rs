use crate::backends::cpal_audio::BUFFER_SECS;
use config::{Config, File};
use lazy_static::lazy_static;
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::RwLock;

/// Named NLU backends selectable through `active_backend`.
pub const BACKENDS: [&str; 3] = ["local", "ec2", "lightning"];

/// Languages with bundled model layouts.
pub const LANGUAGES: [&str; 2] = ["en", "hi"];

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    // NLU server
    pub active_backend: String, // "local", "ec2" or "lightning"
    pub local_url: String,
    pub ec2_url: String,
    pub lightning_url: String,
    pub nlu_timeout_secs: u64,
    pub reset_timeout_secs: u64,
    // Language and models
    pub language: String, // "en" or "hi"
    pub assets_dir: String,
    pub piper_binary: String,
    // Wake word
    pub wake_model_path: String,
    pub wake_sensitivity: f32,
    // Capture
    pub capture_block_ms: u64,
    pub capture_max_duration_ms: u64,
    // Learned apps and platform
    pub custom_actions_path: String,
    pub vpn_package: String,
    // Conversation log length
    pub log_history: usize,
}

fn home() -> String {
    std::env::var("HOME").unwrap_or_else(|_| ".".to_string())
}

fn default_assets_dir() -> String {
    format!("{}/.local/share/heybro/assets", home())
}

fn default_custom_actions_path() -> String {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from(home()).join(".local/share"))
        .join("heybro")
        .join("custom_actions.json")
        .to_string_lossy()
        .into_owned()
}

impl Default for Settings {
    fn default() -> Self {
        let assets_dir = default_assets_dir();
        Self {
            active_backend: "local".to_string(),
            local_url: "http://192.168.1.100:5000".to_string(),
            ec2_url: "http://YOUR_EC2_PUBLIC_IP:5000".to_string(),
            lightning_url: "https://YOUR_LIGHTNING_URL.litng.ai".to_string(),
            nlu_timeout_secs: 60,
            reset_timeout_secs: 10,
            language: "en".to_string(),
            wake_model_path: format!("{}/wake/hey-bro.rpw", assets_dir),
            assets_dir,
            piper_binary: "piper".to_string(),
            wake_sensitivity: 0.5,
            capture_block_ms: 200,
            capture_max_duration_ms: 15000,
            custom_actions_path: default_custom_actions_path(),
            vpn_package: "com.your.vpn.app.package".to_string(),
            log_history: 100,
        }
    }
}

lazy_static! {
    pub static ref SETTINGS: RwLock<Settings> =
        RwLock::new(Settings::new().unwrap_or_else(|e| {
            tracing::warn!(error = %e, "invalid settings, falling back to defaults");
            Settings::default()
        }));
}

impl Settings {
    pub fn new() -> Result<Self, config::ConfigError> {
        let defaults = Settings::default();
        let builder = Config::builder()
            // NLU defaults
            .set_default("active_backend", defaults.active_backend)?
            .set_default("local_url", defaults.local_url)?
            .set_default("ec2_url", defaults.ec2_url)?
            .set_default("lightning_url", defaults.lightning_url)?
            .set_default("nlu_timeout_secs", defaults.nlu_timeout_secs)?
            .set_default("reset_timeout_secs", defaults.reset_timeout_secs)?
            // Language and model defaults
            .set_default("language", defaults.language)?
            .set_default("assets_dir", defaults.assets_dir)?
            .set_default("piper_binary", defaults.piper_binary)?
            // Wake word defaults
            .set_default("wake_model_path", defaults.wake_model_path)?
            .set_default("wake_sensitivity", defaults.wake_sensitivity as f64)?
            // Capture defaults
            .set_default("capture_block_ms", defaults.capture_block_ms)?
            .set_default("capture_max_duration_ms", defaults.capture_max_duration_ms)?
            .set_default("custom_actions_path", defaults.custom_actions_path)?
            .set_default("vpn_package", defaults.vpn_package)?
            .set_default("log_history", defaults.log_history as u64)?
            // Merge with local config file (if exists)
            .add_source(File::with_name("HeyBro").required(false))
            .add_source(
                File::with_name(&format!("{}/.config/heybro/HeyBro", home())).required(false),
            )
            // Merge with environment variables (e.g. HEYBRO_LOCAL_URL)
            .add_source(config::Environment::with_prefix("HEYBRO"));

        let settings: Settings = builder.build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), config::ConfigError> {
        if !(0.0..=1.0).contains(&self.wake_sensitivity) {
            return Err(config::ConfigError::Message(format!(
                "Invalid wake_sensitivity: {}. Must be between 0.0 and 1.0",
                self.wake_sensitivity
            )));
        }
        let max_block_ms = (BUFFER_SECS * 1000) as u64;
        if self.capture_block_ms == 0 || self.capture_block_ms > max_block_ms {
            return Err(config::ConfigError::Message(format!(
                "Invalid capture_block_ms: {}. Must be between 1 and {}",
                self.capture_block_ms, max_block_ms
            )));
        }
        if !BACKENDS.contains(&self.active_backend.to_lowercase().as_str()) {
            return Err(config::ConfigError::Message(format!(
                "Unknown active_backend '{}'. Expected one of {:?}",
                self.active_backend, BACKENDS
            )));
        }
        if !LANGUAGES.contains(&self.language.as_str()) {
            return Err(config::ConfigError::Message(format!(
                "Unknown language '{}'. Expected one of {:?}",
                self.language, LANGUAGES
            )));
        }
        if self.log_history == 0 {
            return Err(config::ConfigError::Message(
                "log_history must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Base URL of the currently selected NLU backend.
    pub fn active_nlu_url(&self) -> Option<String> {
        let url = match self.active_backend.to_lowercase().as_str() {
            "local" => &self.local_url,
            "ec2" => &self.ec2_url,
            "lightning" => &self.lightning_url,
            _ => return None,
        };
        let url = url.trim().trim_end_matches('/');
        if url.is_empty() {
            None
        } else {
            Some(url.to_string())
        }
    }
}

/// Reads the active NLU url from the global settings on every call, so a
/// backend switch takes effect on the next request.
pub fn current_nlu_url() -> Option<String> {
    SETTINGS.read().ok().and_then(|s| s.active_nlu_url())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_config_load() {
        let settings = Settings::new().expect("Failed to load settings");
        assert_eq!(settings.nlu_timeout_secs, 60);
        assert_eq!(settings.reset_timeout_secs, 10);
        assert!(settings.log_history > 0);
    }

    #[test]
    #[serial]
    fn test_env_overrides_backend_url() {
        std::env::set_var("HEYBRO_ACTIVE_BACKEND", "ec2");
        std::env::set_var("HEYBRO_EC2_URL", "http://10.0.0.7:5000/");
        let settings = Settings::new();
        std::env::remove_var("HEYBRO_ACTIVE_BACKEND");
        std::env::remove_var("HEYBRO_EC2_URL");

        let settings = settings.expect("Failed to load settings");
        assert_eq!(
            settings.active_nlu_url().as_deref(),
            Some("http://10.0.0.7:5000")
        );
    }

    #[test]
    fn test_validate_rejects_bad_sensitivity() {
        let settings = Settings {
            wake_sensitivity: 1.5,
            ..Settings::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_validate_capture_block_fits_buffer() {
        for (block_ms, ok) in [(0, false), (200, true), (2000, true), (2001, false)] {
            let settings = Settings {
                capture_block_ms: block_ms,
                ..Settings::default()
            };
            assert_eq!(settings.validate().is_ok(), ok, "block of {} ms", block_ms);
        }
    }

    #[test]
    fn test_validate_rejects_unknown_backend() {
        let settings = Settings {
            active_backend: "mainframe".to_string(),
            ..Settings::default()
        };
        assert!(settings.validate().is_err());
        assert_eq!(settings.active_nlu_url(), None);
    }

    #[test]
    fn test_blank_url_is_unconfigured() {
        let settings = Settings {
            local_url: "   ".to_string(),
            ..Settings::default()
        };
        assert_eq!(settings.active_nlu_url(), None);
    }
}
