//! Per-instance notification preferences.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// What the user allows notifications to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationPreferences {
    /// Render notifications at all.
    pub enabled: bool,
    /// Include message text in the body.
    pub preview: bool,
}

impl Default for NotificationPreferences {
    fn default() -> Self {
        Self {
            enabled: true,
            preview: true,
        }
    }
}

/// Storage for [`NotificationPreferences`]. Read on every notify call.
pub trait PreferenceStore: Send + Sync {
    /// Current preferences; a store with nothing saved yields the defaults.
    fn load(&self) -> Result<NotificationPreferences>;
    /// Persists preferences.
    fn save(&self, prefs: &NotificationPreferences) -> Result<()>;
}

/// Preferences held in memory.
#[derive(Debug, Default)]
pub struct MemoryPreferenceStore {
    prefs: Mutex<NotificationPreferences>,
}

impl MemoryPreferenceStore {
    pub fn new(prefs: NotificationPreferences) -> Self {
        Self {
            prefs: Mutex::new(prefs),
        }
    }
}

impl PreferenceStore for MemoryPreferenceStore {
    fn load(&self) -> Result<NotificationPreferences> {
        Ok(*self.prefs.lock().expect("lock poisoned"))
    }

    fn save(&self, prefs: &NotificationPreferences) -> Result<()> {
        *self.prefs.lock().expect("lock poisoned") = *prefs;
        Ok(())
    }
}

/// Preferences in a namespaced JSON file: `<dir>/<namespace>.preferences.json`.
#[derive(Debug, Clone)]
pub struct FilePreferenceStore {
    path: PathBuf,
}

impl FilePreferenceStore {
    pub fn new(dir: impl AsRef<Path>, namespace: &str) -> Self {
        Self {
            path: dir
                .as_ref()
                .join(format!("{}.preferences.json", namespace)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl PreferenceStore for FilePreferenceStore {
    fn load(&self) -> Result<NotificationPreferences> {
        match fs::read(&self.path) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(NotificationPreferences::default()),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, prefs: &NotificationPreferences) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, serde_json::to_vec_pretty(prefs)?)?;
        Ok(())
    }
}
