//! In-memory execution registry

use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;

use crate::types::{ExecutionFilter, ExecutionId, SandboxExecution};

#[derive(Default)]
struct Inner {
    next_seq: u64,
    /// Insertion order; the highest sequence number is the newest record
    records: BTreeMap<u64, SandboxExecution>,
    index: HashMap<ExecutionId, u64>,
}

/// Every execution the manager has seen. All updates go through one async lock.
#[derive(Default)]
pub struct ExecutionStore {
    inner: RwLock<Inner>,
}

impl ExecutionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a record, suffixing its id if it collides. Returns the id actually stored.
    pub async fn insert(&self, mut execution: SandboxExecution) -> ExecutionId {
        let mut inner = self.inner.write().await;

        if inner.index.contains_key(&execution.id) {
            let base = execution.id.clone();
            let mut n = 1;
            while inner.index.contains_key(&base.with_suffix(n)) {
                n += 1;
            }
            execution.id = base.with_suffix(n);
        }

        let seq = inner.next_seq;
        inner.next_seq += 1;
        let id = execution.id.clone();
        inner.index.insert(id.clone(), seq);
        inner.records.insert(seq, execution);
        id
    }

    /// Apply `f` to the record under the write lock
    pub async fn update<F, R>(&self, id: &ExecutionId, f: F) -> Option<R>
    where
        F: FnOnce(&mut SandboxExecution) -> R,
    {
        let mut inner = self.inner.write().await;
        let seq = *inner.index.get(id)?;
        inner.records.get_mut(&seq).map(f)
    }

    pub async fn get(&self, id: &ExecutionId) -> Option<SandboxExecution> {
        let inner = self.inner.read().await;
        let seq = inner.index.get(id)?;
        inner.records.get(seq).cloned()
    }

    /// Matching records, newest first, at most `filter.limit` of them
    pub async fn list(&self, filter: &ExecutionFilter) -> Vec<SandboxExecution> {
        let inner = self.inner.read().await;
        inner
            .records
            .values()
            .rev()
            .filter(|e| filter.matches(e))
            .take(filter.limit)
            .cloned()
            .collect()
    }

    /// Drop terminal records matching the filter's language and status. The limit is ignored.
    pub async fn purge(&self, filter: &ExecutionFilter) -> usize {
        let mut inner = self.inner.write().await;
        let doomed: Vec<(u64, ExecutionId)> = inner
            .records
            .iter()
            .filter(|(_, e)| e.is_terminal() && filter.matches(e))
            .map(|(seq, e)| (*seq, e.id.clone()))
            .collect();

        for (seq, id) in &doomed {
            inner.records.remove(seq);
            inner.index.remove(id);
        }
        doomed.len()
    }

    pub async fn status_distribution(&self) -> BTreeMap<String, usize> {
        let inner = self.inner.read().await;
        let mut distribution = BTreeMap::new();
        for execution in inner.records.values() {
            *distribution
                .entry(execution.status.to_string())
                .or_insert(0) += 1;
        }
        distribution
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.records.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
