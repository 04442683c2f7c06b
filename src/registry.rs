//! Bounded cache of open project indexes.
//!
//! Entries expire after a period without access and the least recently used
//! entry is dropped once the cache is full. A dropped entry moves to the
//! closing set and is closed under its project lock as soon as that lock is
//! free, so a lookup for one project never waits behind another project's
//! rebuild. While a project has a handle in the closing set no second
//! handle is created for it; a lookup takes the old one back instead.

use std::{
    collections::{HashMap, HashSet},
    num::NonZeroUsize,
    sync::{Arc, Mutex, MutexGuard},
    time::{Duration, Instant},
};

use lru::LruCache;
use tracing::{debug, warn};

use crate::{
    config::IndexConfig,
    error::Result,
    handle::{IndexHandle, IndexState},
    index_db::IndexDb,
    model::ProjectId,
    physical::IndexProvider,
};

struct Entry {
    handle: Arc<IndexHandle>,
    last_access: Instant,
}

struct Cache {
    entries: LruCache<ProjectId, Entry>,
    /// Dropped from `entries` but not closed yet.
    closing: HashMap<ProjectId, Arc<IndexHandle>>,
    /// Projects whose index was removed for good.
    removed: HashSet<ProjectId>,
}

impl Cache {
    fn is_closing(&self, handle: &Arc<IndexHandle>) -> bool {
        self.closing
            .get(&handle.project())
            .is_some_and(|pending| Arc::ptr_eq(pending, handle))
    }

    fn insert(&mut self, project: ProjectId, handle: Arc<IndexHandle>) {
        let entry = Entry {
            handle,
            last_access: Instant::now(),
        };
        if let Some((evicted, old)) = self.entries.push(project, entry)
            && evicted != project
        {
            debug!(project = %evicted, "evicting least recently used index");
            self.closing.insert(evicted, old.handle);
        }
    }
}

enum Lookup {
    Cached(Arc<IndexHandle>),
    Closing(Arc<IndexHandle>),
    Missing,
    Removed,
}

pub struct IndexRegistry {
    db: Arc<IndexDb>,
    provider: Option<Arc<dyn IndexProvider>>,
    idle_timeout: Duration,
    cache: Mutex<Cache>,
}

impl IndexRegistry {
    pub fn new(
        db: Arc<IndexDb>,
        provider: Option<Arc<dyn IndexProvider>>,
        config: &IndexConfig,
    ) -> Self {
        let capacity = NonZeroUsize::new(config.registry_capacity)
            .unwrap_or(NonZeroUsize::MIN);
        Self {
            db,
            provider,
            idle_timeout: config.idle_timeout,
            cache: Mutex::new(Cache {
                entries: LruCache::new(capacity),
                closing: HashMap::new(),
                removed: HashSet::new(),
            }),
        }
    }

    /// Whether a physical index provider is configured.
    pub fn is_supported(&self) -> bool {
        self.provider.is_some()
    }

    /// Return the project's handle, loading it if needed.
    ///
    /// Returns `None` when indexing is unsupported or the project was
    /// removed. Only ever waits on this project's own lock, and only when
    /// its previous handle is still waiting to be closed.
    pub fn get(&self, project: ProjectId) -> Result<Option<Arc<IndexHandle>>> {
        let Some(provider) = self.provider.clone() else {
            return Ok(None);
        };

        self.expire_idle();
        let handle = self.resolve(project, provider.as_ref());
        self.close_pending();
        handle
    }

    /// Look up a handle without loading it or refreshing its access time.
    pub fn peek(&self, project: ProjectId) -> Option<Arc<IndexHandle>> {
        let cache = self.lock();
        cache
            .entries
            .peek(&project)
            .filter(|entry| entry.last_access.elapsed() < self.idle_timeout)
            .map(|entry| entry.handle.clone())
            .or_else(|| cache.closing.get(&project).cloned())
    }

    /// Drop the project's handle from the cache. Its index is closed now
    /// if the project lock is free, otherwise once the lock is released.
    pub fn evict(&self, project: ProjectId) -> bool {
        let evicted = {
            let mut cache = self.lock();
            match cache.entries.pop(&project) {
                Some(entry) => {
                    cache.closing.insert(project, entry.handle);
                    true
                }
                None => false,
            }
        };
        self.close_pending();
        evicted
    }

    /// Remove the project for good. The returned handle (if it was cached)
    /// is left for the caller to delete; later lookups return `None`.
    pub fn remove(&self, project: ProjectId) -> Option<Arc<IndexHandle>> {
        let mut cache = self.lock();
        cache.removed.insert(project);
        match cache.entries.pop(&project) {
            Some(entry) => Some(entry.handle),
            None => cache.closing.remove(&project),
        }
    }

    /// Evict every entry idle for longer than the timeout and close what
    /// can be closed. Returns how many entries were evicted.
    pub fn evict_expired(&self) -> usize {
        let expired = self.expire_idle();
        self.close_pending();
        expired
    }

    /// Number of cached handles.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of evicted handles whose index is still waiting to be closed.
    pub fn pending_close(&self) -> usize {
        self.lock().closing.len()
    }

    fn resolve(
        &self,
        project: ProjectId,
        provider: &dyn IndexProvider,
    ) -> Result<Option<Arc<IndexHandle>>> {
        loop {
            match self.lookup(project) {
                Lookup::Cached(handle) => return Ok(Some(handle)),
                Lookup::Removed => return Ok(None),
                Lookup::Closing(old) => {
                    if let Some(handle) = self.reclaim(old) {
                        return Ok(Some(handle));
                    }
                }
                Lookup::Missing => {
                    let loaded = self.load(project, provider)?;
                    if let Some(handle) = self.install(project, loaded)? {
                        return Ok(Some(handle));
                    }
                }
            }
        }
    }

    fn lookup(&self, project: ProjectId) -> Lookup {
        let mut cache = self.lock();
        if cache.removed.contains(&project) {
            return Lookup::Removed;
        }
        if let Some(entry) = cache.entries.get_mut(&project) {
            entry.last_access = Instant::now();
            return Lookup::Cached(entry.handle.clone());
        }
        match cache.closing.get(&project) {
            Some(old) => Lookup::Closing(old.clone()),
            None => Lookup::Missing,
        }
    }

    /// Take an evicted handle back into the cache if it has not been
    /// closed yet. Returns `None` when the caller should look again.
    fn reclaim(&self, old: Arc<IndexHandle>) -> Option<Arc<IndexHandle>> {
        let project = old.project();
        let guard = old.lock();
        let mut cache = self.lock();

        if guard.is_retired() {
            if cache.is_closing(&old) {
                cache.closing.remove(&project);
            }
            return None;
        }
        if let Some(entry) = cache.entries.get_mut(&project) {
            entry.last_access = Instant::now();
            return Some(entry.handle.clone());
        }
        if !cache.is_closing(&old) || cache.removed.contains(&project) {
            return None;
        }

        debug!(project = %project, "reclaiming index before it was closed");
        cache.closing.remove(&project);
        cache.insert(project, old.clone());
        Some(old.clone())
    }

    /// Cache a freshly loaded handle unless another one for the project
    /// showed up meanwhile. Returns `Ok(None)` when the caller should look
    /// again.
    fn install(
        &self,
        project: ProjectId,
        loaded: Arc<IndexHandle>,
    ) -> Result<Option<Arc<IndexHandle>>> {
        let winner = {
            let mut cache = self.lock();
            if cache.removed.contains(&project) || cache.closing.contains_key(&project) {
                None
            } else if let Some(entry) = cache.entries.get_mut(&project) {
                // Another caller loaded it first; keep theirs.
                entry.last_access = Instant::now();
                Some(entry.handle.clone())
            } else {
                cache.insert(project, loaded.clone());
                return Ok(Some(loaded));
            }
        };

        // Nobody else has seen the loser, so closing it cannot block.
        if let Err(e) = loaded.close() {
            warn!(project = %project, error = %e, "failed to close unused index");
        }
        Ok(winner)
    }

    /// Move every expired entry to the closing set.
    fn expire_idle(&self) -> usize {
        let mut cache = self.lock();
        let stale: Vec<ProjectId> = cache
            .entries
            .iter()
            .filter(|(_, entry)| entry.last_access.elapsed() >= self.idle_timeout)
            .map(|(project, _)| *project)
            .collect();
        for project in &stale {
            if let Some(entry) = cache.entries.pop(project) {
                debug!(project = %project, "evicting idle index");
                cache.closing.insert(*project, entry.handle);
            }
        }
        stale.len()
    }

    /// Close every evicted handle whose project lock is free. Busy ones
    /// stay in the closing set for a later pass.
    fn close_pending(&self) {
        let pending: Vec<Arc<IndexHandle>> =
            self.lock().closing.values().cloned().collect();

        for handle in pending {
            let Some(mut guard) = handle.try_lock() else {
                debug!(project = %handle.project(), "index busy, deferring close");
                continue;
            };
            // Reclaimed or removed since the snapshot.
            if !self.lock().is_closing(&handle) {
                continue;
            }
            if let Err(e) = guard.retire() {
                warn!(project = %handle.project(), error = %e, "failed to close index");
            }
            let mut cache = self.lock();
            if cache.is_closing(&handle) {
                cache.closing.remove(&handle.project());
            }
        }
    }

    fn load(
        &self,
        project: ProjectId,
        provider: &dyn IndexProvider,
    ) -> Result<Arc<IndexHandle>> {
        let record = self.db.get_or_create_index(project, provider.id())?;
        let physical = provider.acquire(project)?;

        let mut invalid = record.invalid;
        if record.provider != provider.id() {
            warn!(
                project = %project,
                recorded = %record.provider,
                configured = provider.id(),
                "index was built by a different provider, treating as stale"
            );
            invalid = true;
        }

        let state = IndexState::from_persisted(invalid, physical.is_created());
        debug!(project = %project, state = %state, "loaded index handle");
        Ok(Arc::new(IndexHandle::new(project, state, physical)))
    }

    fn lock(&self) -> MutexGuard<'_, Cache> {
        match self.cache.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl std::fmt::Debug for IndexRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexRegistry")
            .field("idle_timeout", &self.idle_timeout)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;

    use super::*;
    use crate::tantivy_index::TantivyProvider;

    fn registry(
        config: IndexConfig,
    ) -> (tempfile::TempDir, Arc<IndexDb>, IndexRegistry) {
        let tmp = tempfile::tempdir().unwrap();
        let db = Arc::new(IndexDb::open(&tmp.path().join("index.redb")).unwrap());
        let provider: Arc<dyn IndexProvider> =
            Arc::new(TantivyProvider::on_disk(tmp.path().join("indexes"), &config));
        let registry = IndexRegistry::new(db.clone(), Some(provider), &config);
        (tmp, db, registry)
    }

    #[test]
    fn get_creates_record_and_caches_handle() {
        let (_tmp, db, registry) = registry(IndexConfig::default());
        let project = ProjectId(1);

        assert!(registry.peek(project).is_none());
        let first = registry.get(project).unwrap().unwrap();
        assert_eq!(first.state(), IndexState::Uncreated);
        assert!(db.get_index(project).unwrap().is_some());

        let second = registry.get(project).unwrap().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(registry.peek(project).is_some());
    }

    #[test]
    fn unsupported_without_provider() {
        let tmp = tempfile::tempdir().unwrap();
        let db = Arc::new(IndexDb::open(&tmp.path().join("index.redb")).unwrap());
        let registry = IndexRegistry::new(db.clone(), None, &IndexConfig::default());

        assert!(!registry.is_supported());
        assert!(registry.get(ProjectId(1)).unwrap().is_none());
        assert!(db.list_indexes().unwrap().is_empty());
    }

    #[test]
    fn capacity_evicts_least_recently_used() {
        let config = IndexConfig {
            registry_capacity: 2,
            ..IndexConfig::default()
        };
        let (_tmp, _db, registry) = registry(config);

        let a = registry.get(ProjectId(1)).unwrap().unwrap();
        registry.get(ProjectId(2)).unwrap();
        // Touch 1 so that 2 becomes the eviction candidate.
        registry.get(ProjectId(1)).unwrap();
        registry.get(ProjectId(3)).unwrap();

        assert_eq!(registry.len(), 2);
        assert!(registry.peek(ProjectId(1)).is_some());
        assert!(registry.peek(ProjectId(2)).is_none());
        assert!(!a.lock().is_retired());
    }

    #[test]
    fn idle_entries_expire() {
        let config = IndexConfig {
            idle_timeout: Duration::ZERO,
            ..IndexConfig::default()
        };
        let (_tmp, _db, registry) = registry(config);

        let handle = registry.get(ProjectId(1)).unwrap().unwrap();
        assert!(registry.peek(ProjectId(1)).is_none());
        assert_eq!(registry.evict_expired(), 1);
        assert!(registry.is_empty());
        assert!(handle.lock().is_retired());
    }

    #[test]
    fn eviction_retires_handle_and_reload_is_fresh() {
        let (_tmp, _db, registry) = registry(IndexConfig::default());
        let project = ProjectId(1);

        let first = registry.get(project).unwrap().unwrap();
        assert!(registry.evict(project));
        assert!(first.lock().is_retired());
        assert!(!registry.evict(project));

        let second = registry.get(project).unwrap().unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert!(!second.lock().is_retired());
    }

    #[test]
    fn removed_projects_stay_removed() {
        let (_tmp, _db, registry) = registry(IndexConfig::default());
        let project = ProjectId(1);

        registry.get(project).unwrap();
        assert!(registry.remove(project).is_some());
        assert!(registry.get(project).unwrap().is_none());
        assert!(registry.peek(project).is_none());
    }

    fn single_slot() -> IndexConfig {
        IndexConfig {
            registry_capacity: 1,
            ..IndexConfig::default()
        }
    }

    #[test]
    fn busy_index_does_not_block_other_projects() {
        let (_tmp, _db, registry) = registry(single_slot());
        let first = registry.get(ProjectId(1)).unwrap().unwrap();
        first.lock().physical().create().unwrap();

        let (locked_tx, locked_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        std::thread::scope(|scope| {
            let held = &first;
            scope.spawn(move || {
                let _guard = held.lock();
                locked_tx.send(()).unwrap();
                release_rx.recv().unwrap();
            });
            locked_rx.recv().unwrap();

            // Pushes project 1 out while a rebuild holds its lock.
            registry.get(ProjectId(2)).unwrap().unwrap();
            assert_eq!(registry.len(), 1);
            assert_eq!(registry.pending_close(), 1);
            release_tx.send(()).unwrap();
        });

        assert_eq!(registry.evict_expired(), 0);
        assert_eq!(registry.pending_close(), 0);
        let guard = first.lock();
        assert!(guard.is_retired());
        assert!(!guard.physical().is_open());
    }

    #[test]
    fn evicted_busy_index_is_reclaimed_instead_of_reopened() {
        let (_tmp, _db, registry) = registry(single_slot());
        let first = registry.get(ProjectId(1)).unwrap().unwrap();
        first.lock().physical().create().unwrap();

        let (locked_tx, locked_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let reclaimed = std::thread::scope(|scope| {
            let held = &first;
            scope.spawn(move || {
                let _guard = held.lock();
                locked_tx.send(()).unwrap();
                release_rx.recv().unwrap();
            });
            locked_rx.recv().unwrap();

            registry.get(ProjectId(2)).unwrap().unwrap();
            let again = scope.spawn(|| registry.get(ProjectId(1)).unwrap().unwrap());
            release_tx.send(()).unwrap();
            again.join().unwrap()
        });

        assert!(Arc::ptr_eq(&first, &reclaimed));
        let guard = reclaimed.lock();
        assert!(!guard.is_retired());
        assert!(guard.physical().is_open());
        guard.physical().open().unwrap();
        drop(guard);

        // Project 2 made room and had nothing holding it open.
        assert_eq!(registry.pending_close(), 0);
        assert!(registry.peek(ProjectId(2)).is_none());
    }

    #[test]
    fn removing_a_closing_project_hands_back_its_handle() {
        let (_tmp, _db, registry) = registry(IndexConfig::default());
        let project = ProjectId(1);
        let handle = registry.get(project).unwrap().unwrap();

        let guard = handle.lock();
        registry.evict(project);
        assert_eq!(registry.pending_close(), 1);
        drop(guard);

        let removed = registry.remove(project).unwrap();
        assert!(Arc::ptr_eq(&handle, &removed));
        assert_eq!(registry.pending_close(), 0);
        assert!(registry.get(project).unwrap().is_none());
    }
}
