use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use uuid::Uuid;

use crate::error::AppError;
use crate::job::{Platform, ScrapedItem};
use crate::traits::ContentStore;

/// In-process content store that only remembers content hashes.
///
/// Good enough to tell new content from repeats within one process lifetime.
#[derive(Debug, Clone, Default)]
pub struct MemoryContentStore {
    seen: Arc<Mutex<HashSet<(Platform, String)>>>,
}

impl MemoryContentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.seen.lock().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ContentStore for MemoryContentStore {
    async fn create(
        &self,
        _job_id: Uuid,
        platform: Platform,
        item: &ScrapedItem,
    ) -> Result<bool, AppError> {
        let mut seen = self
            .seen
            .lock()
            .map_err(|_| AppError::StoreError("content index lock poisoned".into()))?;
        Ok(seen.insert((platform, item.content_hash())))
    }
}
