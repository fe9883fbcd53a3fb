use std::collections::HashMap;

use parking_lot::RwLock;

use super::{CacheKey, CacheRecord, DmCache};
use crate::error::CacheError;

/// In-process cache, used by tests and by callers that opt out of disk storage.
#[derive(Debug, Default)]
pub struct MemoryCache {
    records: RwLock<HashMap<CacheKey, CacheRecord>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

impl DmCache for MemoryCache {
    fn read(&self, key: &CacheKey) -> Result<Option<CacheRecord>, CacheError> {
        Ok(self.records.read().get(key).cloned())
    }

    fn write(&self, key: &CacheKey, record: &CacheRecord) -> Result<(), CacheError> {
        self.records.write().insert(key.clone(), record.clone());
        Ok(())
    }

    fn delete(&self, key: &CacheKey) -> Result<(), CacheError> {
        self.records.write().remove(key);
        Ok(())
    }
}
