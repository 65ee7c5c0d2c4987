//! Gallery store: the single source of truth for registered identities.
//!
//! Entries are cached in memory behind an `Arc` so that a snapshot is a
//! pointer copy. Writers are serialized on the backend mutex, build the next
//! entry list outside the cache lock and swap it in once the new entry has
//! been persisted. Entries are shared between successive lists, never copied.

use crate::error::FaceError;
use crate::types::{default_display_name, Embedding, EntrySummary, FaceId, GalleryEntry};
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;

/// Point-in-time view of the gallery, in creation order.
pub type GallerySnapshot = Arc<Vec<Arc<GalleryEntry>>>;

/// Durable storage behind a [`GalleryStore`].
pub trait GalleryBackend: Send {
    /// Read every persisted entry, ordered by identity.
    fn scan(&mut self) -> Result<Vec<GalleryEntry>, FaceError>;

    /// Durably consume the next identity. A reserved identity is never
    /// handed out again, even if the subsequent insert fails.
    fn reserve_identity(&mut self) -> Result<FaceId, FaceError>;

    /// Persist a fully formed entry. Must not leave a partial row behind.
    fn insert(&mut self, entry: &GalleryEntry) -> Result<(), FaceError>;
}

/// Volatile backend. Contents are lost when the process exits.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    last_identity: FaceId,
    entries: Vec<GalleryEntry>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl GalleryBackend for MemoryBackend {
    fn scan(&mut self) -> Result<Vec<GalleryEntry>, FaceError> {
        Ok(self.entries.clone())
    }

    fn reserve_identity(&mut self) -> Result<FaceId, FaceError> {
        self.last_identity += 1;
        Ok(self.last_identity)
    }

    fn insert(&mut self, entry: &GalleryEntry) -> Result<(), FaceError> {
        self.entries.push(entry.clone());
        Ok(())
    }
}

/// Shared gallery. Open once at startup and pass around behind an `Arc`.
pub struct GalleryStore {
    backend: Mutex<Box<dyn GalleryBackend>>,
    entries: RwLock<GallerySnapshot>,
}

impl GalleryStore {
    /// Load all persisted entries from `backend` and take ownership of it.
    ///
    /// Fails with a storage error if the persisted entries disagree on the
    /// embedding dimensionality.
    pub fn open(mut backend: Box<dyn GalleryBackend>) -> Result<Self, FaceError> {
        let entries = backend.scan()?;
        if let Some(first) = entries.first() {
            let expected = first.embedding.dimension();
            if let Some(odd) = entries.iter().find(|e| e.embedding.dimension() != expected) {
                return Err(FaceError::Storage(format!(
                    "identity {} has a {}-dimensional embedding, identity {} has {expected}",
                    odd.identity,
                    odd.embedding.dimension(),
                    first.identity
                )));
            }
        }
        tracing::info!(entries = entries.len(), "gallery loaded");
        Ok(Self {
            backend: Mutex::new(backend),
            entries: RwLock::new(Arc::new(entries.into_iter().map(Arc::new).collect())),
        })
    }

    /// Volatile gallery backed by [`MemoryBackend`].
    pub fn in_memory() -> Self {
        Self {
            backend: Mutex::new(Box::new(MemoryBackend::new())),
            entries: RwLock::new(Arc::new(Vec::new())),
        }
    }

    /// Consistent view of all entries. Later appends are not visible in it.
    pub fn snapshot(&self) -> GallerySnapshot {
        Arc::clone(&self.entries.read())
    }

    /// Register a new identity.
    ///
    /// The entry becomes visible to snapshots only once it has been
    /// persisted, fully formed.
    pub fn append(
        &self,
        embedding: Embedding,
        representative_image: Vec<u8>,
    ) -> Result<Arc<GalleryEntry>, FaceError> {
        let mut backend = self.backend.lock();

        if !embedding.is_finite() {
            return Err(FaceError::InvalidInput(
                "embedding contains non-finite values".to_string(),
            ));
        }
        if let Some(expected) = self.dimension() {
            if embedding.dimension() != expected {
                return Err(FaceError::InvalidInput(format!(
                    "embedding has {} dimensions, gallery uses {expected}",
                    embedding.dimension()
                )));
            }
        }

        let identity = backend.reserve_identity()?;
        let entry = GalleryEntry {
            identity,
            display_name: default_display_name(identity),
            embedding,
            representative_image: representative_image.into(),
            created_at: Utc::now(),
        };

        if let Err(e) = backend.insert(&entry) {
            tracing::warn!(identity, error = %e, "gallery insert failed; identity discarded");
            return Err(e);
        }

        // Only writers replace the list and they hold the backend lock, so
        // the current list cannot change while the next one is built.
        let entry = Arc::new(entry);
        let current = self.snapshot();
        let mut next = Vec::with_capacity(current.len() + 1);
        next.extend(current.iter().cloned());
        next.push(Arc::clone(&entry));
        *self.entries.write() = Arc::new(next);

        tracing::debug!(identity, "gallery entry appended");
        Ok(entry)
    }

    pub fn get(&self, identity: FaceId) -> Result<Arc<GalleryEntry>, FaceError> {
        let snapshot = self.snapshot();
        // Identities are appended in increasing order.
        snapshot
            .binary_search_by_key(&identity, |e| e.identity)
            .map(|idx| Arc::clone(&snapshot[idx]))
            .map_err(|_| FaceError::NotFound(identity))
    }

    pub fn list(&self) -> Vec<EntrySummary> {
        self.snapshot().iter().map(|e| EntrySummary::from(&**e)).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Embedding dimensionality of the stored entries, if any.
    pub fn dimension(&self) -> Option<usize> {
        self.entries.read().first().map(|e| e.embedding.dimension())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Backend whose inserts fail while `failing` is set.
    struct FlakyBackend {
        inner: MemoryBackend,
        failing: Arc<AtomicBool>,
    }

    impl GalleryBackend for FlakyBackend {
        fn scan(&mut self) -> Result<Vec<GalleryEntry>, FaceError> {
            self.inner.scan()
        }

        fn reserve_identity(&mut self) -> Result<FaceId, FaceError> {
            self.inner.reserve_identity()
        }

        fn insert(&mut self, entry: &GalleryEntry) -> Result<(), FaceError> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(FaceError::Storage("disk unavailable".into()));
            }
            self.inner.insert(entry)
        }
    }

    fn emb(v: f32) -> Embedding {
        Embedding::new(vec![v, 0.0])
    }

    #[test]
    fn test_append_assigns_increasing_identities() {
        let store = GalleryStore::in_memory();
        let a = store.append(emb(0.1), vec![1]).unwrap();
        let b = store.append(emb(0.2), vec![2]).unwrap();
        assert_eq!(a.identity, 1);
        assert_eq!(b.identity, 2);
        assert_eq!(a.display_name, "Person_1");
        assert_eq!(b.display_name, "Person_2");
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_snapshot_is_isolated_from_later_appends() {
        let store = GalleryStore::in_memory();
        store.append(emb(0.1), vec![]).unwrap();
        let before = store.snapshot();
        store.append(emb(0.2), vec![]).unwrap();
        assert_eq!(before.len(), 1);
        assert_eq!(store.snapshot().len(), 2);
    }

    #[test]
    fn test_get_and_not_found() {
        let store = GalleryStore::in_memory();
        let a = store.append(emb(0.1), vec![9, 9]).unwrap();
        let got = store.get(a.identity).unwrap();
        assert_eq!(&*got.representative_image, &[9, 9]);
        assert_eq!(store.get(42).unwrap_err(), FaceError::NotFound(42));
    }

    #[test]
    fn test_failed_insert_burns_identity_and_leaves_no_entry() {
        let failing = Arc::new(AtomicBool::new(false));
        let store = GalleryStore::open(Box::new(FlakyBackend {
            inner: MemoryBackend::new(),
            failing: failing.clone(),
        }))
        .unwrap();

        assert_eq!(store.append(emb(0.1), vec![]).unwrap().identity, 1);
        failing.store(true, Ordering::SeqCst);
        let err = store.append(emb(0.2), vec![]).unwrap_err();
        assert!(err.is_storage());
        assert_eq!(store.len(), 1);

        failing.store(false, Ordering::SeqCst);
        assert_eq!(store.append(emb(0.3), vec![]).unwrap().identity, 3);
        let ids: Vec<FaceId> = store.snapshot().iter().map(|e| e.identity).collect();
        assert_eq!(ids, vec![1, 3]);
    }

    #[test]
    fn test_append_rejects_dimension_change() {
        let store = GalleryStore::in_memory();
        store.append(emb(0.1), vec![]).unwrap();
        let err = store
            .append(Embedding::new(vec![0.1, 0.2, 0.3]), vec![])
            .unwrap_err();
        assert!(matches!(err, FaceError::InvalidInput(_)));
        assert_eq!(store.dimension(), Some(2));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_append_shares_existing_entries_with_held_snapshot() {
        let store = GalleryStore::in_memory();
        for i in 0..3 {
            store
                .append(Embedding::new(vec![i as f32; 512]), vec![i as u8])
                .unwrap();
        }
        let held = store.snapshot();
        store.append(Embedding::new(vec![9.0; 512]), vec![9]).unwrap();

        let current = store.snapshot();
        assert_eq!(held.len(), 3);
        assert_eq!(current.len(), 4);
        for (old, new) in held.iter().zip(current.iter()) {
            assert!(Arc::ptr_eq(old, new));
        }
        assert_eq!(
            held[0].embedding.values.as_ptr(),
            current[0].embedding.values.as_ptr()
        );
    }

    #[test]
    fn test_append_rejects_non_finite_embedding() {
        let store = GalleryStore::in_memory();
        for bad in [f32::NAN, f32::INFINITY, f32::NEG_INFINITY] {
            let err = store.append(Embedding::new(vec![0.1, bad]), vec![]).unwrap_err();
            assert!(matches!(err, FaceError::InvalidInput(_)), "component {bad}");
        }
        assert!(store.is_empty());
        // Rejected before an identity was reserved.
        assert_eq!(store.append(emb(0.1), vec![]).unwrap().identity, 1);
    }

    #[test]
    fn test_open_rejects_mixed_dimensions() {
        let mut backend = MemoryBackend::new();
        for values in [vec![0.1, 0.2], vec![0.1, 0.2, 0.3]] {
            let id = backend.reserve_identity().unwrap();
            backend
                .insert(&GalleryEntry {
                    identity: id,
                    display_name: default_display_name(id),
                    embedding: Embedding::new(values),
                    representative_image: Vec::new().into(),
                    created_at: Utc::now(),
                })
                .unwrap();
        }
        let err = GalleryStore::open(Box::new(backend)).err().unwrap();
        assert!(matches!(err, FaceError::Storage(msg) if msg.contains("identity 2")));
    }

    #[test]
    fn test_open_loads_existing_entries() {
        let mut backend = MemoryBackend::new();
        let id = backend.reserve_identity().unwrap();
        backend
            .insert(&GalleryEntry {
                identity: id,
                display_name: default_display_name(id),
                embedding: emb(0.5),
                representative_image: Vec::new().into(),
                created_at: Utc::now(),
            })
            .unwrap();
        let store = GalleryStore::open(Box::new(backend)).unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.append(emb(0.6), vec![]).unwrap().identity, 2);
        assert_eq!(store.list()[0].display_name, "Person_1");
    }

    #[test]
    fn test_concurrent_appends_never_share_identities() {
        let store = Arc::new(GalleryStore::in_memory());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    (0..25)
                        .map(|i| store.append(emb(t as f32 + i as f32), vec![]).unwrap().identity)
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        let mut all: Vec<FaceId> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
        all.sort_unstable();
        assert_eq!(all, (1..=200).collect::<Vec<_>>());

        let snapshot = store.snapshot();
        assert!(snapshot.windows(2).all(|w| w[0].identity < w[1].identity));
    }
}
