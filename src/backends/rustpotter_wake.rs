use super::{WakeEngine, SAMPLE_RATE};
use crate::{Error, Result};
use rustpotter::{Rustpotter, RustpotterConfig, SampleFormat};
use std::path::Path;

const WAKEWORD_KEY: &str = "hey-bro";

/// Wake word detector using rustpotter.
pub struct RustpotterEngine {
    detector: Rustpotter,
    frame: Vec<f32>,
}

impl RustpotterEngine {
    /// `sensitivity` in [0, 1]; higher fires more readily.
    pub fn load(model_path: &Path, sensitivity: f32) -> Result<Self> {
        if !model_path.exists() {
            return Err(Error::InitializationFailed(format!(
                "wake word model not found at {}",
                model_path.display()
            )));
        }

        let mut config = RustpotterConfig::default();
        config.fmt.sample_rate = SAMPLE_RATE as usize;
        config.fmt.channels = 1;
        config.fmt.sample_format = SampleFormat::F32;
        config.detector.threshold = threshold_for(sensitivity);

        let mut detector = Rustpotter::new(&config).map_err(|e| {
            Error::InitializationFailed(format!("Failed to create rustpotter detector: {}", e))
        })?;
        detector
            .add_wakeword_from_file(WAKEWORD_KEY, &model_path.to_string_lossy())
            .map_err(|e| {
                Error::InitializationFailed(format!("Failed to load wake word model: {}", e))
            })?;

        tracing::info!(model = %model_path.display(), sensitivity, "wake word detector loaded");
        Ok(Self {
            detector,
            frame: Vec::new(),
        })
    }
}

fn threshold_for(sensitivity: f32) -> f32 {
    (1.0 - sensitivity.clamp(0.0, 1.0)).clamp(0.05, 0.95)
}

impl WakeEngine for RustpotterEngine {
    fn frame_length(&self) -> usize {
        self.detector.get_samples_per_frame()
    }

    fn process(&mut self, pcm: &[i16]) -> bool {
        self.frame.clear();
        self.frame
            .extend(pcm.iter().map(|&s| f32::from(s) / 32768.0));
        self.detector.process_samples(self.frame.clone()).is_some()
    }
}
