use std::{fs, io::ErrorKind, path::PathBuf};

use super::{StateStore, StoreResult};

/// Stores each key as a file in a directory, durable across restarts.
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(key)
    }
}

impl StateStore for FileStore {
    fn save(&self, key: &str, value: &str) -> StoreResult<()> {
        fs::create_dir_all(&self.dir)?;
        fs::write(self.path_for(key), value)?;

        Ok(())
    }

    fn load(&self, key: &str) -> StoreResult<Option<String>> {
        match fs::read_to_string(self.path_for(key)) {
            Ok(value) => Ok(Some(value)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn clear(&self, key: &str) -> StoreResult<()> {
        match fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}
