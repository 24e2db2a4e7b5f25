use std::collections::HashMap;

use parking_lot::Mutex;

use super::{StateStore, StoreResult};

/// An in-process store, for tests and embedders that handle durability
/// themselves.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStore for MemoryStore {
    fn save(&self, key: &str, value: &str) -> StoreResult<()> {
        self.entries
            .lock()
            .insert(key.to_string(), value.to_string());

        Ok(())
    }

    fn load(&self, key: &str) -> StoreResult<Option<String>> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn clear(&self, key: &str) -> StoreResult<()> {
        self.entries.lock().remove(key);

        Ok(())
    }
}
