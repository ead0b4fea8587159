//! Apps the user has taught the assistant, by spoken name.

use crate::Result;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

/// Lower-cased app name to package id, saved as a JSON object
#[derive(Clone, Default)]
pub struct CustomActionMap {
    path: Option<PathBuf>,
    data: Arc<Mutex<HashMap<String, String>>>,
}

fn key(name: &str) -> String {
    name.trim().to_lowercase()
}

impl CustomActionMap {
    /// Load from `path`. A missing file is an empty map; an unreadable one is
    /// logged and replaced on the next save.
    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let data = match fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                tracing::warn!(path = %path.display(), error = %e, "ignoring corrupt custom actions");
                HashMap::new()
            }),
            Err(_) => HashMap::new(),
        };
        tracing::debug!(path = %path.display(), entries = data.len(), "custom actions loaded");

        Self {
            path: Some(path),
            data: Arc::new(Mutex::new(data)),
        }
    }

    /// A map that is never written to disk
    pub fn in_memory() -> Self {
        Self::default()
    }

    fn data(&self) -> MutexGuard<'_, HashMap<String, String>> {
        self.data.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn get(&self, name: &str) -> Option<String> {
        self.data().get(&key(name)).cloned()
    }

    pub fn insert(&self, name: &str, package: &str) {
        let name = key(name);
        if name.is_empty() || package.trim().is_empty() {
            return;
        }
        self.data().insert(name, package.trim().to_string());
    }

    /// Remember `package` under the app's own name and under what the user
    /// called it, then persist.
    pub fn learn(&self, app_name: &str, guess: &str, package: &str) -> Result<()> {
        self.insert(app_name, package);
        self.insert(guess, package);
        tracing::info!(app = app_name, guess, package, "learned app");
        self.save()
    }

    pub fn save(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&*self.data())?;
        fs::write(path, json)?;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.data().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
