use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use jobforge_core::{JobId, JobLogEntry, NewLogEntry};

use super::{JobLogStore, JobLogStoreError};

#[derive(Debug, Default)]
struct Inner {
    next_id: i64,
    entries: HashMap<JobId, Vec<JobLogEntry>>,
}

/// In-memory job log store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryJobLogStore {
    inner: RwLock<Inner>,
}

impl InMemoryJobLogStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Total number of stored entries across all jobs.
    pub fn len(&self) -> usize {
        self.inner
            .read()
            .map(|inner| inner.entries.values().map(Vec::len).sum())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn poisoned() -> JobLogStoreError {
        JobLogStoreError::Storage("lock poisoned".to_string())
    }
}

impl JobLogStore for InMemoryJobLogStore {
    fn append(&self, entry: NewLogEntry) -> Result<JobLogEntry, JobLogStoreError> {
        let mut inner = self.inner.write().map_err(|_| Self::poisoned())?;
        inner.next_id += 1;
        let stored = JobLogEntry::from_new(inner.next_id, entry);
        inner
            .entries
            .entry(stored.job_id)
            .or_default()
            .push(stored.clone());
        Ok(stored)
    }

    fn recent(&self, job_id: JobId, limit: usize) -> Result<Vec<JobLogEntry>, JobLogStoreError> {
        let inner = self.inner.read().map_err(|_| Self::poisoned())?;
        let mut entries = inner.entries.get(&job_id).cloned().unwrap_or_default();

        entries.sort_by_key(|e| Reverse((e.created_at, e.id)));
        entries.truncate(limit);
        Ok(entries)
    }

    fn delete_for_jobs(&self, job_ids: &[JobId]) -> Result<u64, JobLogStoreError> {
        let mut inner = self.inner.write().map_err(|_| Self::poisoned())?;
        let removed = job_ids
            .iter()
            .filter_map(|id| inner.entries.remove(id))
            .map(|entries| entries.len() as u64)
            .sum();
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use jobforge_core::LogLevel;

    #[test]
    fn append_assigns_increasing_ids() {
        let store = InMemoryJobLogStore::new();
        let job = JobId::new();

        let a = store.append(NewLogEntry::info(job, "started")).unwrap();
        let b = store.append(NewLogEntry::info(job, "done")).unwrap();
        assert!(b.id > a.id);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn recent_is_newest_first_and_limited() {
        let store = InMemoryJobLogStore::new();
        let job = JobId::new();
        let now = Utc::now();

        store
            .append(NewLogEntry::info(job, "first").at(now - Duration::seconds(2)))
            .unwrap();
        store
            .append(NewLogEntry::warn(job, "second").at(now - Duration::seconds(1)))
            .unwrap();
        store.append(NewLogEntry::error(job, "third").at(now)).unwrap();
        store.append(NewLogEntry::info(JobId::new(), "other job")).unwrap();

        let recent = store.recent(job, 2).unwrap();
        let messages: Vec<_> = recent.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(messages, vec!["third", "second"]);
        assert_eq!(recent[0].level, LogLevel::Error);
    }

    #[test]
    fn same_timestamp_falls_back_to_append_order() {
        let store = InMemoryJobLogStore::new();
        let job = JobId::new();
        let now = Utc::now();

        store.append(NewLogEntry::info(job, "a").at(now)).unwrap();
        store.append(NewLogEntry::info(job, "b").at(now)).unwrap();

        assert_eq!(store.recent(job, 10).unwrap()[0].message, "b");
    }

    #[test]
    fn delete_for_jobs_only_touches_listed_jobs() {
        let store = InMemoryJobLogStore::new();
        let gone = JobId::new();
        let kept = JobId::new();
        store.append(NewLogEntry::info(gone, "x")).unwrap();
        store.append(NewLogEntry::info(gone, "y")).unwrap();
        store.append(NewLogEntry::info(kept, "z")).unwrap();

        assert_eq!(store.delete_for_jobs(&[gone, JobId::new()]).unwrap(), 2);
        assert!(store.recent(gone, 10).unwrap().is_empty());
        assert_eq!(store.recent(kept, 10).unwrap().len(), 1);
    }
}
