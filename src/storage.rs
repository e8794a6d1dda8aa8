//! Blob storage used for the face index file, uploaded source images and the
//! task queue ledger.
//!
//! Keys are flat names inside one namespace (no path separators). A missing
//! key is reported as `io::ErrorKind::NotFound` so callers can tell "never
//! written" apart from real I/O failures.

use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use crate::eid::Eid;

pub trait StorageManager: Send + Sync {
    fn write(&self, ident: &str, data: &[u8]) -> io::Result<()>;
    fn read(&self, ident: &str) -> io::Result<Vec<u8>>;
    fn exists(&self, ident: &str) -> bool;
    fn delete(&self, ident: &str) -> io::Result<()>;
    fn list(&self) -> Vec<String>;
}

/// Directory-backed storage. Writes go to a uniquely named temp file which is
/// fsynced and renamed over the target, so a reader sees either the old or
/// the new blob.
#[derive(Clone, Debug)]
pub struct BackendLocal {
    pub base_dir: PathBuf,
}

impl BackendLocal {
    pub fn new(storage_dir: impl AsRef<Path>) -> io::Result<Self> {
        let base_dir = storage_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&base_dir)?;
        Ok(BackendLocal { base_dir })
    }

    fn path_for(&self, ident: &str) -> io::Result<PathBuf> {
        if ident.is_empty()
            || ident.contains('/')
            || ident.contains('\\')
            || ident == "."
            || ident == ".."
        {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid storage key {ident:?}"),
            ));
        }
        Ok(self.base_dir.join(ident))
    }
}

impl StorageManager for BackendLocal {
    fn exists(&self, ident: &str) -> bool {
        self.path_for(ident)
            .map(|path| path.is_file())
            .unwrap_or(false)
    }

    fn read(&self, ident: &str) -> io::Result<Vec<u8>> {
        std::fs::read(self.path_for(ident)?)
    }

    fn write(&self, ident: &str, data: &[u8]) -> io::Result<()> {
        let path = self.path_for(ident)?;
        let temp_path = self.base_dir.join(format!(".{}-{ident}.tmp", Eid::new()));

        let result = (|| {
            let mut file = File::create(&temp_path)?;
            file.write_all(data)?;
            file.sync_all()?;
            std::fs::rename(&temp_path, &path)
        })();

        if result.is_err() {
            let _ = std::fs::remove_file(&temp_path);
        }

        result
    }

    fn delete(&self, ident: &str) -> io::Result<()> {
        std::fs::remove_file(self.path_for(ident)?)
    }

    fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(&self.base_dir)
            .map(|entries| {
                entries
                    .filter_map(|entry| entry.ok())
                    .filter_map(|entry| {
                        let path = entry.path();
                        if !path.is_file() {
                            return None;
                        }
                        path.file_name()
                            .and_then(|name| name.to_str())
                            .filter(|name| !name.starts_with('.'))
                            .map(|s| s.to_string())
                    })
                    .collect()
            })
            .unwrap_or_default();
        names.sort();
        names
    }
}
