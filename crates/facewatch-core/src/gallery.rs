//! In-memory registry of known faces and its synchronization boundary.

use crate::codec::{self, StoreLoadError};
use crate::types::{Embedding, KnownFace};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// Default maximum number of embeddings retained per label.
pub const DEFAULT_LABEL_CAPACITY: usize = 10;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("embedding has {actual} components, store expects {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("label must not be empty")]
    EmptyLabel,
}

/// Append-only set of (label, embedding) pairs, the ground truth for matching.
#[derive(Debug, Clone)]
pub struct EmbeddingStore {
    dim: usize,
    entries: Vec<KnownFace>,
    counts: HashMap<String, usize>,
}

impl EmbeddingStore {
    /// Create an empty store for embeddings of `dim` components.
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            entries: Vec::new(),
            counts: HashMap::new(),
        }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Replace the contents with decoded persisted rows.
    ///
    /// Rows that fail to decode are logged and skipped; the remaining rows
    /// are still loaded. Returns the per-row failures.
    pub fn load<I>(&mut self, rows: I) -> Vec<StoreLoadError>
    where
        I: IntoIterator<Item = (String, Vec<u8>)>,
    {
        self.entries.clear();
        self.counts.clear();

        let mut failures = Vec::new();
        for (label, blob) in rows {
            let decoded = if label.trim().is_empty() {
                Err(StoreLoadError::EmptyLabel)
            } else {
                codec::decode(&blob, self.dim)
            };
            match decoded {
                Ok(embedding) => self.push(label, embedding),
                Err(e) => {
                    tracing::warn!(label = %label, error = %e, "skipping malformed persisted face");
                    failures.push(StoreLoadError::Row {
                        label,
                        source: Box::new(e),
                    });
                }
            }
        }

        tracing::info!(
            entries = self.entries.len(),
            labels = self.counts.len(),
            skipped = failures.len(),
            "known faces loaded"
        );
        failures
    }

    /// Add one entry. O(1) amortized.
    pub fn append(&mut self, label: &str, embedding: Embedding) -> Result<(), StoreError> {
        if label.trim().is_empty() {
            return Err(StoreError::EmptyLabel);
        }
        if embedding.dim() != self.dim {
            return Err(StoreError::DimensionMismatch {
                expected: self.dim,
                actual: embedding.dim(),
            });
        }
        self.push(label.to_string(), embedding);
        Ok(())
    }

    fn push(&mut self, label: String, embedding: Embedding) {
        *self.counts.entry(label.clone()).or_insert(0) += 1;
        self.entries.push(KnownFace { label, embedding });
    }

    /// Current number of entries registered under `label`.
    pub fn count_for_label(&self, label: &str) -> usize {
        self.counts.get(label).copied().unwrap_or(0)
    }

    /// All entries in insertion order.
    pub fn entries(&self) -> &[KnownFace] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove every entry registered under `label`, returning how many went.
    pub fn remove_label(&mut self, label: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|e| e.label != label);
        self.counts.remove(label);
        before - self.entries.len()
    }

    /// `(label, count)` pairs ordered by each label's first insertion.
    pub fn labels(&self) -> Vec<(String, usize)> {
        let mut seen = Vec::<(String, usize)>::new();
        for e in &self.entries {
            if !seen.iter().any(|(l, _)| l == &e.label) {
                seen.push((e.label.clone(), self.count_for_label(&e.label)));
            }
        }
        seen
    }
}

/// Shared handle to an [`EmbeddingStore`] with snapshot-swap publication.
///
/// Readers get an immutable `Arc` snapshot and never observe a partially
/// applied batch. Writers are serialized, edit a private copy and publish
/// it in one pointer swap.
#[derive(Debug)]
pub struct SharedStore {
    current: RwLock<Arc<EmbeddingStore>>,
    writer: Mutex<()>,
}

impl SharedStore {
    pub fn new(store: EmbeddingStore) -> Self {
        Self {
            current: RwLock::new(Arc::new(store)),
            writer: Mutex::new(()),
        }
    }

    /// The most recently published store.
    pub fn snapshot(&self) -> Arc<EmbeddingStore> {
        self.current.read().clone()
    }

    /// Apply `f` to a copy and publish it only if `f` succeeds.
    pub fn transaction<T, E>(
        &self,
        f: impl FnOnce(&mut EmbeddingStore) -> Result<T, E>,
    ) -> Result<T, E> {
        let _guard = self.writer.lock();
        let mut draft = (*self.snapshot()).clone();
        let out = f(&mut draft)?;
        self.publish(draft);
        Ok(out)
    }

    /// Apply `f` to a copy and publish it unconditionally.
    pub fn modify<T>(&self, f: impl FnOnce(&mut EmbeddingStore) -> T) -> T {
        let _guard = self.writer.lock();
        let mut draft = (*self.snapshot()).clone();
        let out = f(&mut draft);
        self.publish(draft);
        out
    }

    fn publish(&self, store: EmbeddingStore) {
        *self.current.write() = Arc::new(store);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emb(v: f32) -> Embedding {
        Embedding::new(vec![v, v, v])
    }

    #[test]
    fn test_append_and_count() {
        let mut store = EmbeddingStore::new(3);
        store.append("Alice", emb(0.1)).unwrap();
        store.append("Alice", emb(0.2)).unwrap();
        store.append("Bob", emb(0.3)).unwrap();
        assert_eq!(store.count_for_label("Alice"), 2);
        assert_eq!(store.count_for_label("Bob"), 1);
        assert_eq!(store.count_for_label("Carol"), 0);
        assert_eq!(store.len(), 3);
        assert_eq!(store.entries()[2].label, "Bob");
    }

    #[test]
    fn test_append_rejects_wrong_dimension() {
        let mut store = EmbeddingStore::new(3);
        let err = store.append("Alice", Embedding::new(vec![0.1])).unwrap_err();
        assert_eq!(err, StoreError::DimensionMismatch { expected: 3, actual: 1 });
        assert!(store.is_empty());
    }

    #[test]
    fn test_append_rejects_empty_label() {
        let mut store = EmbeddingStore::new(3);
        assert_eq!(store.append("  ", emb(0.1)).unwrap_err(), StoreError::EmptyLabel);
    }

    #[test]
    fn test_load_skips_bad_rows_and_keeps_good_ones() {
        let mut store = EmbeddingStore::new(3);
        store.append("stale", emb(0.9)).unwrap();

        let rows = vec![
            ("Alice".to_string(), codec::encode(&emb(0.1))),
            ("Broken".to_string(), vec![0u8; 5]),
            ("Bob".to_string(), codec::encode(&emb(0.2))),
        ];
        let failures = store.load(rows);

        assert_eq!(failures.len(), 1);
        assert!(matches!(&failures[0], StoreLoadError::Row { label, .. } if label == "Broken"));
        assert_eq!(store.len(), 2);
        assert_eq!(store.count_for_label("stale"), 0);
        assert_eq!(store.entries()[0].embedding, emb(0.1));
    }

    #[test]
    fn test_remove_label() {
        let mut store = EmbeddingStore::new(3);
        store.append("Alice", emb(0.1)).unwrap();
        store.append("Bob", emb(0.2)).unwrap();
        store.append("Alice", emb(0.3)).unwrap();
        assert_eq!(store.remove_label("Alice"), 2);
        assert_eq!(store.count_for_label("Alice"), 0);
        assert_eq!(store.len(), 1);
        assert_eq!(store.remove_label("Alice"), 0);
    }

    #[test]
    fn test_labels_in_first_insertion_order() {
        let mut store = EmbeddingStore::new(3);
        store.append("Bob", emb(0.1)).unwrap();
        store.append("Alice", emb(0.2)).unwrap();
        store.append("Bob", emb(0.3)).unwrap();
        assert_eq!(
            store.labels(),
            vec![("Bob".to_string(), 2), ("Alice".to_string(), 1)]
        );
    }

    #[test]
    fn test_snapshot_is_isolated_from_later_writes() {
        let shared = SharedStore::new(EmbeddingStore::new(3));
        let before = shared.snapshot();
        shared.modify(|s| s.append("Alice", emb(0.1))).unwrap();
        assert!(before.is_empty());
        assert_eq!(shared.snapshot().len(), 1);
    }

    #[test]
    fn test_failed_transaction_is_not_published() {
        let shared = SharedStore::new(EmbeddingStore::new(3));
        let result: Result<(), &str> = shared.transaction(|s| {
            s.append("Alice", emb(0.1)).unwrap();
            s.append("Alice", emb(0.2)).unwrap();
            Err("disk full")
        });
        assert_eq!(result, Err("disk full"));
        assert!(shared.snapshot().is_empty());
    }

    #[test]
    fn test_panicking_writer_leaves_store_usable() {
        let shared = Arc::new(SharedStore::new(EmbeddingStore::new(3)));
        let writer = {
            let shared = Arc::clone(&shared);
            std::thread::spawn(move || {
                shared.modify(|s| {
                    s.append("Alice", emb(0.1)).unwrap();
                    panic!("writer died mid-batch");
                })
            })
        };
        assert!(writer.join().is_err());

        assert!(shared.snapshot().is_empty());
        shared.modify(|s| s.append("Bob", emb(0.2))).unwrap();
        assert_eq!(shared.snapshot().labels(), vec![("Bob".to_string(), 1)]);
    }

    #[test]
    fn test_concurrent_readers_see_whole_batches() {
        let shared = Arc::new(SharedStore::new(EmbeddingStore::new(3)));
        let reader = {
            let shared = Arc::clone(&shared);
            std::thread::spawn(move || {
                for _ in 0..1000 {
                    // Batches are always two entries, so any torn read shows up as odd.
                    assert_eq!(shared.snapshot().len() % 2, 0);
                }
            })
        };
        for i in 0..50 {
            shared
                .transaction(|s| -> Result<(), StoreError> {
                    s.append("a", emb(i as f32))?;
                    s.append("b", emb(i as f32))
                })
                .unwrap();
        }
        reader.join().unwrap();
        assert_eq!(shared.snapshot().len(), 100);
    }
}
