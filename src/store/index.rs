use std::collections::{BTreeSet, HashMap};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use crate::core::UploadId;

/// Secondary index of stored records by creation time.
#[derive(Debug, Default)]
pub struct CreatedIndex {
    inner: Mutex<IndexInner>,
}

#[derive(Debug, Default)]
struct IndexInner {
    by_time: BTreeSet<(DateTime<Utc>, UploadId)>,
    by_id: HashMap<UploadId, DateTime<Utc>>,
}

impl CreatedIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, upload_id: &UploadId, created_at: DateTime<Utc>) {
        let mut inner = self.inner.lock();
        if let Some(previous) = inner.by_id.insert(upload_id.clone(), created_at) {
            inner.by_time.remove(&(previous, upload_id.clone()));
        }
        inner.by_time.insert((created_at, upload_id.clone()));
    }

    pub fn remove(&self, upload_id: &UploadId) {
        let mut inner = self.inner.lock();
        if let Some(created_at) = inner.by_id.remove(upload_id) {
            inner.by_time.remove(&(created_at, upload_id.clone()));
        }
    }

    pub fn contains(&self, upload_id: &UploadId) -> bool {
        self.inner.lock().by_id.contains_key(upload_id)
    }

    /// Ids oldest first
    pub fn ids(&self) -> Vec<UploadId> {
        self.inner.lock().by_time.iter().map(|(_, id)| id.clone()).collect()
    }

    /// Ids created strictly before `cutoff`, oldest first
    pub fn before(&self, cutoff: DateTime<Utc>) -> Vec<UploadId> {
        self.inner
            .lock()
            .by_time
            .iter()
            .take_while(|(created_at, _)| *created_at < cutoff)
            .map(|(_, id)| id.clone())
            .collect()
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.by_time.clear();
        inner.by_id.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_reinsert_moves_entry() {
        let index = CreatedIndex::new();
        let now = Utc::now();
        let a = UploadId::from("a");
        let b = UploadId::from("b");

        index.insert(&a, now - Duration::days(10));
        index.insert(&b, now - Duration::days(1));
        assert_eq!(index.before(now - Duration::days(7)), vec![a.clone()]);

        index.insert(&a, now);
        assert!(index.before(now - Duration::days(7)).is_empty());
        assert_eq!(index.ids(), vec![b.clone(), a.clone()]);

        index.remove(&b);
        assert!(!index.contains(&b));
    }
}
