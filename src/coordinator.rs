//! The search service: owns the lifecycle of every project's index.
//!
//! Callers never touch a physical index directly. Each operation resolves
//! the project's [`IndexHandle`](crate::handle::IndexHandle) through the
//! registry, takes its lock, and then decides from the handle's state
//! whether to write, query, or schedule a rebuild.

use std::sync::Arc;

use rayon::prelude::*;
use tracing::{debug, info, warn};

use crate::{
    cas,
    config::IndexConfig,
    error::{Error, Result},
    events::IndexEvent,
    handle::{HandleGuard, IndexState},
    index_db::{IndexDb, IndexRecord},
    model::{IndexedDocument, ProjectId, SourceDocument},
    physical::{GroupedResults, IndexProvider, PhysicalIndex, SearchQuery},
    registry::IndexRegistry,
    repository::DocumentRepository,
    scheduler::Scheduler,
};

/// How often a caller re-resolves a handle that was retired between lookup
/// and lock.
const HANDLE_ATTEMPTS: usize = 3;

/// Documents whose CAS is loaded in parallel before being written.
const REBUILD_BATCH: usize = 64;

/// Result of a query against an index that may still be building.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryOutcome<T> {
    Ready(T),
    /// The index is being (re)built. A rebuild has been scheduled; retry
    /// later.
    NotReady,
}

impl<T> QueryOutcome<T> {
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready(_))
    }

    pub fn ready(self) -> Option<T> {
        match self {
            Self::Ready(value) => Some(value),
            Self::NotReady => None,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> QueryOutcome<U> {
        match self {
            Self::Ready(value) => QueryOutcome::Ready(f(value)),
            Self::NotReady => QueryOutcome::NotReady,
        }
    }
}

/// Counts from a full rebuild.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RebuildStats {
    pub indexed: usize,
    pub failed: usize,
}

enum Readiness {
    Ready(Arc<dyn PhysicalIndex>),
    NotReady,
    /// The project was removed while the caller held an old handle.
    Gone,
}

pub struct SearchService {
    db: Arc<IndexDb>,
    registry: IndexRegistry,
    scheduler: Arc<dyn Scheduler>,
    repository: Arc<dyn DocumentRepository>,
}

impl SearchService {
    pub fn new(
        db: Arc<IndexDb>,
        provider: Option<Arc<dyn IndexProvider>>,
        scheduler: Arc<dyn Scheduler>,
        repository: Arc<dyn DocumentRepository>,
        config: &IndexConfig,
    ) -> Self {
        if provider.is_none() {
            info!("no index provider configured, search is disabled");
        }
        Self {
            registry: IndexRegistry::new(db.clone(), provider, config),
            db,
            scheduler,
            repository,
        }
    }

    /// Whether a physical index provider is configured.
    pub fn is_supported(&self) -> bool {
        self.registry.is_supported()
    }

    pub fn registry(&self) -> &IndexRegistry {
        &self.registry
    }

    /// Persisted index records, one per project that has been touched.
    pub fn list_indexes(&self) -> Result<Vec<IndexRecord>> {
        self.db.list_indexes()
    }

    // -- Writes --

    /// Write one source or annotation document into its project's index.
    ///
    /// If the project has no physical index yet, a full rebuild is
    /// scheduled instead; it will pick the document up. Write failures are
    /// logged and the document stays unindexed until the next rebuild.
    pub fn index_document(
        &self,
        document: &IndexedDocument,
        cas: &[u8],
    ) -> Result<()> {
        self.with_handle(document.project(), |guard| {
            if guard.state() == IndexState::Deleted {
                return Ok(());
            }

            let physical = guard.physical().clone();
            if guard.state() == IndexState::Uncreated || !physical.is_created() {
                debug!(document = %document, "index not created, deferring to rebuild");
                return self.schedule_rebuild(guard);
            }

            let written = physical
                .open()
                .and_then(|()| physical.index_document(document, cas));
            if let Err(e) = written {
                warn!(document = %document, error = %e, "failed to write document to index");
            }
            Ok(())
        })?;
        Ok(())
    }

    /// Rebuild the project's index from every document the repository
    /// knows about.
    ///
    /// Runs under the project lock for its whole duration. Documents that
    /// fail to load or write are logged and skipped.
    pub fn reindex(&self, project: ProjectId) -> Result<()> {
        let stats = self.with_handle(project, |guard| {
            let result = self.rebuild(guard);
            if result.is_err() && guard.state() == IndexState::Building {
                guard.set_state(IndexState::Stale);
            }
            result
        })?;

        match stats {
            Some(stats) => info!(
                project = %project,
                indexed = stats.indexed,
                failed = stats.failed,
                "rebuilt index"
            ),
            None => debug!(project = %project, "indexing unavailable, skipping rebuild"),
        }
        Ok(())
    }

    fn rebuild(&self, guard: &mut HandleGuard<'_>) -> Result<RebuildStats> {
        if guard.state() == IndexState::Deleted {
            return Ok(RebuildStats::default());
        }
        let project = guard.project();

        guard.set_state(IndexState::Building);
        self.db.set_invalid(project, true)?;

        let physical = guard.physical().clone();
        if physical.is_created() {
            physical.open()?;
            physical.clear()?;
        } else {
            physical.create()?;
        }

        let mut documents: Vec<IndexedDocument> = Vec::new();
        for user in self.repository.users_with_permissions(project)? {
            documents.extend(
                self.repository
                    .annotation_documents(project, &user)?
                    .into_iter()
                    .map(IndexedDocument::from),
            );
        }
        documents.extend(
            self.repository
                .source_documents(project)?
                .into_iter()
                .map(IndexedDocument::from),
        );
        debug!(project = %project, documents = documents.len(), "rebuilding index");

        let repository = &self.repository;
        let mut stats = RebuildStats::default();
        for batch in documents.chunks(REBUILD_BATCH) {
            // Load in parallel, write sequentially.
            let loaded: Vec<(&IndexedDocument, Result<Vec<u8>>)> = batch
                .par_iter()
                .map(|document| {
                    let bytes = repository
                        .read_cas(document)
                        .and_then(|cas| cas::to_bytes(&cas));
                    (document, bytes)
                })
                .collect();

            for (document, bytes) in loaded {
                match bytes.and_then(|bytes| physical.index_document(document, &bytes)) {
                    Ok(()) => stats.indexed += 1,
                    Err(e) => {
                        stats.failed += 1;
                        warn!(document = %document, error = %e, "skipping document during rebuild");
                    }
                }
            }
        }

        self.db.set_invalid(project, false)?;
        guard.set_state(IndexState::Valid);
        Ok(stats)
    }

    /// Remove a source document and all annotation documents derived from
    /// it from the project's index.
    ///
    /// The repository may already have forgotten the annotation copies by
    /// the time this runs, so they are matched by source id in the index.
    pub fn remove_document(&self, source: &SourceDocument) -> Result<()> {
        self.with_handle(source.project, |guard| {
            let physical = guard.physical().clone();
            if guard.state() == IndexState::Deleted || !physical.is_created() {
                return Ok(());
            }
            let removed = physical
                .open()
                .and_then(|()| physical.deindex_source(source.id));
            if let Err(e) = removed {
                warn!(
                    project = %source.project,
                    source = source.id,
                    error = %e,
                    "failed to remove document from index"
                );
            }
            Ok(())
        })?;
        Ok(())
    }

    /// Drop the project's index: close and delete it, forget its record,
    /// and refuse to recreate it afterwards.
    pub fn remove_project(&self, project: ProjectId) -> Result<()> {
        let loaded = self.registry.get(project)?;
        let handle = self.registry.remove(project).or(loaded);

        if let Some(handle) = handle {
            let deleted = handle.lock().delete();
            if let Err(e) = deleted {
                warn!(project = %project, error = %e, "failed to delete index");
            }
        }

        self.db.remove_index(project)?;
        info!(project = %project, "removed project index");
        Ok(())
    }

    // -- Queries --

    /// Run a query, or report that the index is not ready yet.
    ///
    /// Returns an empty result when indexing is unsupported.
    pub fn query(
        &self,
        project: ProjectId,
        query: &SearchQuery,
    ) -> Result<QueryOutcome<GroupedResults>> {
        self.run_when_ready(
            project,
            |physical| physical.execute_query(query),
            GroupedResults::new,
        )
    }

    /// Count the hits a query would return across all pages.
    pub fn number_of_results(
        &self,
        project: ProjectId,
        query: &SearchQuery,
    ) -> Result<QueryOutcome<u64>> {
        self.run_when_ready(
            project,
            |physical| physical.number_of_query_results(query),
            || 0,
        )
    }

    fn run_when_ready<T>(
        &self,
        project: ProjectId,
        run: impl Fn(&dyn PhysicalIndex) -> Result<T>,
        empty: impl FnOnce() -> T,
    ) -> Result<QueryOutcome<T>> {
        if !self.is_supported() {
            return Ok(QueryOutcome::Ready(empty()));
        }

        // A rebuild holds the project lock; answer without waiting for it.
        if let Some(handle) = self.registry.peek(project)
            && handle.state() == IndexState::Building
            && self.scheduler.is_index_in_progress(project)
        {
            return Ok(QueryOutcome::NotReady);
        }

        for attempt in 0..2 {
            let physical = match self.readiness(project)? {
                Readiness::Ready(physical) => physical,
                Readiness::NotReady => return Ok(QueryOutcome::NotReady),
                Readiness::Gone => return Ok(QueryOutcome::Ready(empty())),
            };

            // The lock is released here; the index may be evicted and
            // closed while the query runs.
            match run(physical.as_ref()) {
                Err(Error::IndexClosed) if attempt == 0 => {
                    debug!(project = %project, "index closed during query, retrying");
                }
                result => return result.map(QueryOutcome::Ready),
            }
        }
        Ok(QueryOutcome::NotReady)
    }

    fn readiness(&self, project: ProjectId) -> Result<Readiness> {
        let readiness = self.with_handle(project, |guard| {
            let physical = guard.physical().clone();
            match guard.state() {
                IndexState::Deleted => Ok(Readiness::Gone),
                IndexState::Valid if physical.is_created() => match physical.open() {
                    Ok(()) => Ok(Readiness::Ready(physical)),
                    Err(e) => {
                        warn!(project = %project, error = %e, "failed to open index, rebuilding");
                        self.schedule_rebuild(guard)?;
                        Ok(Readiness::NotReady)
                    }
                },
                IndexState::Building if self.scheduler.is_index_in_progress(project) => {
                    Ok(Readiness::NotReady)
                }
                _ => {
                    self.schedule_rebuild(guard)?;
                    Ok(Readiness::NotReady)
                }
            }
        })?;
        Ok(readiness.unwrap_or(Readiness::Gone))
    }

    // -- Status --

    /// Whether the project's index is loaded and current. A project whose
    /// handle is not cached reports `false`.
    pub fn is_index_valid(&self, project: ProjectId) -> bool {
        self.index_state(project) == Some(IndexState::Valid)
    }

    pub fn is_index_in_progress(&self, project: ProjectId) -> bool {
        self.scheduler.is_index_in_progress(project)
    }

    /// State of the cached handle, without loading one.
    pub fn index_state(&self, project: ProjectId) -> Option<IndexState> {
        self.registry.peek(project).map(|handle| handle.state())
    }

    // -- Events --

    pub fn handle_event(&self, event: IndexEvent) -> Result<()> {
        match event {
            IndexEvent::DocumentCreated { document, cas } => {
                self.enqueue_document(document.into(), cas)
            }
            IndexEvent::CasWritten { document, cas } => {
                self.enqueue_document(document, cas)
            }
            IndexEvent::LayerChanged { project } => self.invalidate(project),
            IndexEvent::DocumentRemoved { document } => {
                self.remove_document(&document)
            }
            IndexEvent::ProjectRemoved { project } => {
                self.remove_project(project)
            }
        }
    }

    fn enqueue_document(
        &self,
        document: IndexedDocument,
        cas: Vec<u8>,
    ) -> Result<()> {
        if !self.is_supported() {
            return Ok(());
        }
        self.scheduler.enqueue_index_document(document, cas)
    }

    /// Mark the project's index stale and queue a rebuild.
    pub fn invalidate(&self, project: ProjectId) -> Result<()> {
        self.with_handle(project, |guard| {
            if guard.state() == IndexState::Deleted {
                return Ok(());
            }
            guard.set_state(IndexState::Stale);
            self.db.set_invalid(project, true)?;
            self.scheduler.enqueue_reindex(project)?;
            guard.set_state(IndexState::Building);
            Ok(())
        })?;
        Ok(())
    }

    /// Close indexes that have been idle past the configured timeout.
    pub fn evict_idle(&self) -> usize {
        let evicted = self.registry.evict_expired();
        if evicted > 0 {
            debug!(evicted, "closed idle indexes");
        }
        evicted
    }

    // -- Internals --

    /// Persist the invalid flag and queue a rebuild unless one is already
    /// on its way.
    fn schedule_rebuild(&self, guard: &mut HandleGuard<'_>) -> Result<()> {
        let project = guard.project();
        self.db.set_invalid(project, true)?;
        if self.scheduler.is_index_in_progress(project) {
            debug!(project = %project, "rebuild already in progress");
        } else {
            self.scheduler.enqueue_reindex(project)?;
            info!(project = %project, "scheduled index rebuild");
        }
        guard.set_state(IndexState::Building);
        Ok(())
    }

    /// Run `f` under the project's lock.
    ///
    /// Returns `Ok(None)` when indexing is unsupported or the project was
    /// removed. A handle retired between lookup and lock is looked up
    /// again.
    fn with_handle<T>(
        &self,
        project: ProjectId,
        f: impl FnOnce(&mut HandleGuard<'_>) -> Result<T>,
    ) -> Result<Option<T>> {
        for _ in 0..HANDLE_ATTEMPTS {
            let Some(handle) = self.registry.get(project)? else {
                return Ok(None);
            };
            let mut guard = handle.lock();
            if guard.is_retired() {
                debug!(project = %project, "handle retired, retrying lookup");
                continue;
            }
            return f(&mut guard).map(Some);
        }
        Err(Error::IndexClosed)
    }
}

impl std::fmt::Debug for SearchService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SearchService")
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}
