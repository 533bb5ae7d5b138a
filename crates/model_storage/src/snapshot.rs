//! Frozen storage state.
//!
//! A [`Snapshot`] is immutable and cheap to clone. It can be shared across
//! threads and read concurrently; builders forked from it copy the parts they
//! write and never affect it.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::trace;

use crate::builder::Builder;
use crate::family::ImmutableEntitiesBarrel;
use crate::indexes::StorageIndexes;
use crate::refs::RefsTable;
use crate::storage::{EntityStorage, Sealed, StorageParts};

type CachedValue = Arc<dyn Any + Send + Sync>;

/// A derived value computed from a snapshot and cached on it.
///
/// ```rust
/// use model_storage::{EntityStorage, Snapshot, StorageQuery};
///
/// static ENTITY_TYPES: StorageQuery<usize> =
///     StorageQuery::new("entity-types", |snapshot| snapshot.entity_types().len());
///
/// let snapshot = Snapshot::empty();
/// assert_eq!(*snapshot.cached(&ENTITY_TYPES), 0);
/// ```
pub struct StorageQuery<R> {
    name: &'static str,
    compute: fn(&Snapshot) -> R,
}

impl<R> StorageQuery<R> {
    /// `name` must be unique among queries run against the same snapshot.
    #[must_use]
    pub const fn new(name: &'static str, compute: fn(&Snapshot) -> R) -> Self {
        Self { name, compute }
    }

    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }
}

struct SnapshotInner {
    barrel: ImmutableEntitiesBarrel,
    refs: RefsTable,
    indexes: StorageIndexes,
    query_cache: DashMap<&'static str, CachedValue>,
}

/// Immutable view of the workspace model.
#[derive(Clone)]
pub struct Snapshot {
    inner: Arc<SnapshotInner>,
}

impl Snapshot {
    pub(crate) fn new(barrel: ImmutableEntitiesBarrel, refs: RefsTable, indexes: StorageIndexes) -> Self {
        Self {
            inner: Arc::new(SnapshotInner {
                barrel,
                refs,
                indexes,
                query_cache: DashMap::new(),
            }),
        }
    }

    /// A snapshot with no entities.
    #[must_use]
    pub fn empty() -> Self {
        Self::new(
            ImmutableEntitiesBarrel::default(),
            RefsTable::default(),
            StorageIndexes::default(),
        )
    }

    /// Start a builder on top of this snapshot.
    #[must_use]
    pub fn to_builder(&self) -> Builder {
        Builder::from_snapshot(self)
    }

    pub(crate) fn barrel(&self) -> &ImmutableEntitiesBarrel {
        &self.inner.barrel
    }

    pub(crate) fn refs(&self) -> &RefsTable {
        &self.inner.refs
    }

    pub(crate) fn indexes(&self) -> &StorageIndexes {
        &self.inner.indexes
    }

    /// Returns `true` if both handles point at the same frozen state.
    #[must_use]
    pub fn ptr_eq(&self, other: &Snapshot) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Compute `query` once per snapshot and return the cached result on
    /// later calls.
    ///
    /// # Panics
    ///
    /// Panics if another query with the same name but a different result
    /// type already ran on this snapshot.
    pub fn cached<R: Send + Sync + 'static>(&self, query: &StorageQuery<R>) -> Arc<R> {
        let hit = self
            .inner
            .query_cache
            .get(query.name)
            .map(|entry| Arc::clone(entry.value()));
        if let Some(hit) = hit {
            return downcast_cached(hit, query.name);
        }

        // Compute without holding a shard lock so the query can read other
        // cached values.
        trace!(query = query.name, "computing cached query");
        let computed: CachedValue = Arc::new((query.compute)(self));
        let stored = Arc::clone(
            self.inner
                .query_cache
                .entry(query.name)
                .or_insert(computed)
                .value(),
        );
        downcast_cached(stored, query.name)
    }
}

fn downcast_cached<R: Send + Sync + 'static>(value: CachedValue, name: &str) -> Arc<R> {
    match value.downcast::<R>() {
        Ok(value) => value,
        Err(_) => panic!("cached query `{name}` was stored with a different result type"),
    }
}

impl Default for Snapshot {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Snapshot")
            .field("entity_types", &self.entity_types().len())
            .field("cached_queries", &self.inner.query_cache.len())
            .finish()
    }
}

impl Sealed for Snapshot {}

impl EntityStorage for Snapshot {
    fn parts(&self) -> StorageParts<'_> {
        StorageParts {
            families: &self.inner.barrel,
            refs: &self.inner.refs,
            indexes: &self.inner.indexes,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::test_entities::{ParentEntity, add_parent_entity};

    static PARENT_COUNT: StorageQuery<usize> =
        StorageQuery::new("parent-count", |snapshot| snapshot.entity_count::<ParentEntity>());

    #[test]
    fn test_empty_snapshot_has_no_entities() {
        let snapshot = Snapshot::empty();
        assert!(snapshot.is_empty());
        assert_eq!(snapshot.entities::<ParentEntity>().count(), 0);
    }

    #[test]
    fn test_cached_query_runs_once() {
        static CALLS: AtomicUsize = AtomicUsize::new(0);
        static COUNTED: StorageQuery<usize> = StorageQuery::new("counted", |snapshot| {
            CALLS.fetch_add(1, Ordering::SeqCst);
            snapshot.entity_count::<ParentEntity>()
        });

        let mut builder = Builder::new();
        add_parent_entity(&mut builder, "Parent");
        let snapshot = builder.to_snapshot();

        assert_eq!(*snapshot.cached(&COUNTED), 1);
        assert_eq!(*snapshot.cached(&COUNTED), 1);
        assert_eq!(CALLS.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_cache_is_per_snapshot() {
        let mut builder = Builder::new();
        add_parent_entity(&mut builder, "first");
        let first = builder.to_snapshot();
        assert_eq!(*first.cached(&PARENT_COUNT), 1);

        add_parent_entity(&mut builder, "second");
        let second = builder.to_snapshot();
        assert_eq!(*second.cached(&PARENT_COUNT), 2);
        assert_eq!(*first.cached(&PARENT_COUNT), 1);
    }

    #[test]
    #[should_panic(expected = "different result type")]
    fn test_cached_query_type_mismatch_panics() {
        static AS_STRING: StorageQuery<String> =
            StorageQuery::new("parent-count", |_| String::new());

        let snapshot = Snapshot::empty();
        snapshot.cached(&PARENT_COUNT);
        snapshot.cached(&AS_STRING);
    }

    #[test]
    fn test_snapshot_is_shared_across_threads() {
        let mut builder = Builder::new();
        add_parent_entity(&mut builder, "Parent");
        let snapshot = builder.to_snapshot();

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let snapshot = snapshot.clone();
                std::thread::spawn(move || *snapshot.cached(&PARENT_COUNT))
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.join().unwrap(), 1);
        }
    }
}
