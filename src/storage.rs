//! File-backed EEPROM store.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::eeprom::EepromStorage;

/// Persists the EEPROM hex blob to a file. Missing files mean a blank
/// chip; I/O failures are logged and otherwise ignored, so a read-only or
/// unavailable store never takes the machine down.
pub struct FileStorage {
    path: PathBuf,
}

impl FileStorage {
    pub fn new(path: impl AsRef<Path>) -> Self {
        FileStorage {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl EepromStorage for FileStorage {
    fn load(&mut self) -> Option<String> {
        match fs::read_to_string(&self.path) {
            Ok(blob) => Some(blob),
            Err(e) if e.kind() == ErrorKind::NotFound => None,
            Err(e) => {
                log::warn!("eeprom store {} unreadable: {}", self.path.display(), e);
                None
            }
        }
    }

    fn save(&mut self, blob: &str) {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                let _ = fs::create_dir_all(parent);
            }
        }
        if let Err(e) = fs::write(&self.path, blob) {
            log::warn!("eeprom store {} not written: {}", self.path.display(), e);
        }
    }
}
