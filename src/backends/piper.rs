use super::{SpeechBackend, Waveform};
use crate::{Error, Result};
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

/// A Piper voice: the `.onnx` model, its `.onnx.json` config and the binary
/// that runs them.
pub struct PiperVoice {
    binary_path: String,
    onnx_path: PathBuf,
    voice_id: String,
}

impl PiperVoice {
    pub fn load(binary_path: &str, onnx_path: &Path) -> Result<Self> {
        let config_path = PathBuf::from(format!("{}.json", onnx_path.display()));
        if !onnx_path.exists() || !config_path.exists() {
            return Err(Error::InitializationFailed(format!(
                "Piper model not found locally: {}",
                onnx_path.display()
            )));
        }

        let voice_id = onnx_path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("unknown")
            .to_string();
        tracing::info!(voice = %voice_id, "piper voice ready");

        Ok(Self {
            binary_path: binary_path.to_string(),
            onnx_path: onnx_path.to_path_buf(),
            voice_id,
        })
    }

    fn run_piper(&self, text: &str) -> Result<Vec<u8>> {
        let mut child = Command::new(&self.binary_path)
            .arg("-m")
            .arg(&self.onnx_path)
            .arg("--output_file")
            .arg("-") // WAV on stdout
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(text.as_bytes())?;
            stdin.write_all(b"\n")?;
        }

        let output = child.wait_with_output()?;
        if output.status.success() {
            Ok(output.stdout)
        } else {
            let err = String::from_utf8_lossy(&output.stderr);
            Err(Error::InitializationFailed(format!("Piper error: {}", err.trim())))
        }
    }
}

impl SpeechBackend for PiperVoice {
    fn synthesize(&self, text: &str) -> Result<Waveform> {
        if text.trim().is_empty() {
            return Ok(Waveform::default());
        }
        let wav = self.run_piper(text)?;
        decode_wav(&wav)
    }

    fn id(&self) -> &str {
        &self.voice_id
    }
}

/// Decode 16-bit PCM WAV bytes
pub fn decode_wav(bytes: &[u8]) -> Result<Waveform> {
    let mut reader = hound::WavReader::new(Cursor::new(bytes))
        .map_err(|e| Error::InitializationFailed(format!("invalid WAV from synthesizer: {}", e)))?;
    let spec = reader.spec();
    if spec.bits_per_sample != 16 || spec.sample_format != hound::SampleFormat::Int {
        return Err(Error::InitializationFailed(format!(
            "unsupported WAV format: {} bit {:?}",
            spec.bits_per_sample, spec.sample_format
        )));
    }
    let samples = reader
        .samples::<i16>()
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::InitializationFailed(format!("truncated WAV: {}", e)))?;

    Ok(Waveform {
        samples,
        sample_rate: spec.sample_rate,
        channels: spec.channels,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn wav_bytes(samples: &[i16], sample_rate: u32) -> Vec<u8> {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
            for &s in samples {
                writer.write_sample(s).unwrap();
            }
            writer.finalize().unwrap();
        }
        cursor.into_inner()
    }

    #[test]
    fn test_decode_wav() {
        let bytes = wav_bytes(&[1, -2, 3, -4], 22050);
        let wf = decode_wav(&bytes).unwrap();
        assert_eq!(wf.samples, vec![1, -2, 3, -4]);
        assert_eq!(wf.sample_rate, 22050);
        assert_eq!(wf.channels, 1);
    }

    #[test]
    fn test_decode_garbage_fails() {
        assert!(decode_wav(b"definitely not a wav").is_err());
    }

    #[test]
    fn test_missing_model_is_initialization_failure() {
        let dir = tempdir().unwrap();
        let result = PiperVoice::load("piper", &dir.path().join("nope.onnx"));
        assert!(matches!(result, Err(Error::InitializationFailed(_))));
    }

    #[test]
    fn test_blank_text_needs_no_binary() {
        let dir = tempdir().unwrap();
        let onnx = dir.path().join("en_US-test-low.onnx");
        std::fs::write(&onnx, b"").unwrap();
        std::fs::write(dir.path().join("en_US-test-low.onnx.json"), b"{}").unwrap();

        let voice = PiperVoice::load("/nonexistent/piper", &onnx).unwrap();
        assert_eq!(voice.id(), "en_US-test-low");
        assert!(voice.synthesize("   ").unwrap().is_empty());
    }
}
