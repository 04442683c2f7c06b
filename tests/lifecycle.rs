use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use annosearch::{
    BackgroundScheduler,
    IndexConfig,
    IndexDb,
    IndexState,
    ManualScheduler,
    MemoryRepository,
    QueryOutcome,
    SearchService,
    TantivyProvider,
    cas::{self, Annotation, Cas},
    error::Result,
    events::{self, IndexEvent},
    model::{AnnotationDocument, IndexedDocument, ProjectId, SourceDocument},
    physical::{
        GroupedResults,
        IndexProvider,
        PhysicalIndex,
        SearchQuery,
    },
};

const P: ProjectId = ProjectId(1);

/// Wraps a provider and counts `close()` calls on the indexes it hands out.
struct CountingProvider {
    inner: TantivyProvider,
    closes: Arc<AtomicUsize>,
}

struct CountingIndex {
    inner: Arc<dyn PhysicalIndex>,
    closes: Arc<AtomicUsize>,
}

impl IndexProvider for CountingProvider {
    fn id(&self) -> &'static str {
        self.inner.id()
    }

    fn acquire(&self, project: ProjectId) -> Result<Arc<dyn PhysicalIndex>> {
        Ok(Arc::new(CountingIndex {
            inner: self.inner.acquire(project)?,
            closes: self.closes.clone(),
        }))
    }
}

impl PhysicalIndex for CountingIndex {
    fn is_created(&self) -> bool {
        self.inner.is_created()
    }

    fn is_open(&self) -> bool {
        self.inner.is_open()
    }

    fn create(&self) -> Result<()> {
        self.inner.create()
    }

    fn open(&self) -> Result<()> {
        self.inner.open()
    }

    fn close(&self) -> Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.inner.close()
    }

    fn clear(&self) -> Result<()> {
        self.inner.clear()
    }

    fn delete(&self) -> Result<()> {
        self.inner.delete()
    }

    fn index_document(&self, document: &IndexedDocument, cas: &[u8]) -> Result<()> {
        self.inner.index_document(document, cas)
    }

    fn deindex_document(&self, document: &IndexedDocument) -> Result<()> {
        self.inner.deindex_document(document)
    }

    fn deindex_source(&self, source: u64) -> Result<()> {
        self.inner.deindex_source(source)
    }

    fn execute_query(&self, query: &SearchQuery) -> Result<GroupedResults> {
        self.inner.execute_query(query)
    }

    fn number_of_query_results(&self, query: &SearchQuery) -> Result<u64> {
        self.inner.number_of_query_results(query)
    }
}

struct Setup {
    _tmp: tempfile::TempDir,
    service: SearchService,
    scheduler: Arc<ManualScheduler>,
    repository: Arc<MemoryRepository>,
    closes: Arc<AtomicUsize>,
}

fn setup() -> Setup {
    let tmp = tempfile::tempdir().unwrap();
    let db = Arc::new(IndexDb::open(&tmp.path().join("index.redb")).unwrap());
    let config = IndexConfig::default();
    let closes = Arc::new(AtomicUsize::new(0));
    let provider = Arc::new(CountingProvider {
        inner: TantivyProvider::on_disk(tmp.path().join("indexes"), &config),
        closes: closes.clone(),
    });
    let scheduler = Arc::new(ManualScheduler::new());
    let repository = Arc::new(MemoryRepository::new());
    let service = SearchService::new(
        db,
        Some(provider),
        scheduler.clone(),
        repository.clone(),
        &config,
    );
    Setup {
        _tmp: tmp,
        service,
        scheduler,
        repository,
        closes,
    }
}

fn add_source(repo: &MemoryRepository, id: u64, name: &str, text: &str) -> SourceDocument {
    let doc = SourceDocument::new(id, P, name);
    repo.add_source(doc.clone(), Cas::new(text));
    doc
}

fn three_documents(repo: &MemoryRepository) -> Vec<SourceDocument> {
    vec![
        add_source(repo, 1, "first.txt", "cat sat"),
        add_source(repo, 2, "second.txt", "dog ran"),
        add_source(repo, 3, "third.txt", "cat ran"),
    ]
}

fn results(service: &SearchService, user: &str, text: &str) -> GroupedResults {
    match service.query(P, &SearchQuery::new(user, text)).unwrap() {
        QueryOutcome::Ready(results) => results,
        QueryOutcome::NotReady => panic!("index not ready"),
    }
}

fn titles(results: &GroupedResults) -> Vec<&str> {
    results.keys().map(String::as_str).collect()
}

#[test]
fn first_query_on_untouched_project_is_not_ready_once() {
    let s = setup();
    let query = SearchQuery::new("alice", "test");

    assert!(!s.service.is_index_valid(P));
    assert_eq!(s.service.query(P, &query).unwrap(), QueryOutcome::NotReady);
    assert_eq!(s.scheduler.pending_reindexes(P), 1);
    assert_eq!(s.scheduler.pending(), 1);

    assert_eq!(s.scheduler.run_pending(&s.service), 1);
    assert!(s.service.is_index_valid(P));
    assert_eq!(
        s.service.query(P, &query).unwrap(),
        QueryOutcome::Ready(GroupedResults::new())
    );
}

#[test]
fn indexing_before_creation_schedules_a_single_rebuild() {
    let s = setup();
    let doc = add_source(&s.repository, 1, "first.txt", "cat sat");
    let bytes = cas::to_bytes(&Cas::new("cat sat")).unwrap();

    s.service.index_document(&doc.clone().into(), &bytes).unwrap();
    assert_eq!(s.scheduler.pending_reindexes(P), 1);
    assert!(s.service.is_index_in_progress(P));

    s.scheduler.run_pending(&s.service);
    assert_eq!(titles(&results(&s.service, "alice", "cat")), vec!["first.txt"]);
}

#[test]
fn query_returns_matching_documents_grouped() {
    let s = setup();
    three_documents(&s.repository);

    let query = SearchQuery::new("alice", "cat");
    assert_eq!(s.service.query(P, &query).unwrap(), QueryOutcome::NotReady);
    s.scheduler.run_pending(&s.service);

    let grouped = results(&s.service, "alice", "cat");
    assert_eq!(titles(&grouped), vec!["first.txt", "third.txt"]);
    for hits in grouped.values() {
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].text, "cat");
        assert_eq!(hits[0].offset_start, 0);
        assert_eq!(hits[0].offset_end, 3);
    }
    assert_eq!(
        s.service.number_of_results(P, &query).unwrap(),
        QueryOutcome::Ready(2)
    );
}

#[test]
fn reindex_is_idempotent() {
    let s = setup();
    three_documents(&s.repository);

    s.service.reindex(P).unwrap();
    let first = results(&s.service, "alice", "cat ran");
    s.service.reindex(P).unwrap();
    let second = results(&s.service, "alice", "cat ran");

    assert_eq!(first, second);
    assert_eq!(titles(&first), vec!["first.txt", "second.txt", "third.txt"]);
}

#[test]
fn layer_change_invalidates_and_queues_one_rebuild() {
    let s = setup();
    three_documents(&s.repository);
    s.service.reindex(P).unwrap();
    assert!(s.service.is_index_valid(P));

    let (sender, mut receiver) = events::channel();
    let mut unit = sender.begin();
    unit.push(IndexEvent::LayerChanged { project: P });
    assert_eq!(receiver.drain(&s.service), 0);
    unit.commit().unwrap();
    assert_eq!(receiver.drain(&s.service), 1);

    assert!(!s.service.is_index_valid(P));
    assert_eq!(s.scheduler.pending_reindexes(P), 1);
    assert_eq!(s.service.index_state(P), Some(IndexState::Building));

    s.scheduler.run_pending(&s.service);
    assert!(s.service.is_index_valid(P));
}

#[test]
fn removing_a_document_drops_it_and_its_annotations() {
    let s = setup();
    let docs = three_documents(&s.repository);
    let annotated = Cas::new("cat sat").with_annotation(Annotation::new("pos", 0, 3));
    s.repository
        .add_annotation(AnnotationDocument::new(100, &docs[0], "alice"), annotated);
    s.service.reindex(P).unwrap();
    assert_eq!(
        titles(&results(&s.service, "alice", "cat")),
        vec!["first.txt", "third.txt"]
    );

    s.service
        .handle_event(IndexEvent::DocumentRemoved {
            document: docs[0].clone(),
        })
        .unwrap();

    for user in ["alice", "bob"] {
        assert_eq!(titles(&results(&s.service, user, "cat")), vec!["third.txt"]);
        assert_eq!(titles(&results(&s.service, user, "dog")), vec!["second.txt"]);
    }
}

#[test]
fn removal_reaches_copies_the_repository_already_dropped() {
    let s = setup();
    let docs = three_documents(&s.repository);
    s.repository.add_annotation(
        AnnotationDocument::new(100, &docs[0], "alice"),
        Cas::new("cat sat"),
    );
    s.service.reindex(P).unwrap();

    // The event is dispatched after the deletion has been committed.
    s.repository.remove_source(docs[0].id);
    s.service
        .handle_event(IndexEvent::DocumentRemoved {
            document: docs[0].clone(),
        })
        .unwrap();

    let query = SearchQuery::new("alice", "sat");
    assert_eq!(
        s.service.number_of_results(P, &query).unwrap(),
        QueryOutcome::Ready(0)
    );
    assert_eq!(titles(&results(&s.service, "alice", "cat")), vec!["third.txt"]);
}

#[test]
fn concurrent_writes_all_land() {
    const N: u64 = 16;
    let s = setup();
    s.service.reindex(P).unwrap();

    std::thread::scope(|scope| {
        for i in 0..N {
            let service = &s.service;
            scope.spawn(move || {
                let doc = SourceDocument::new(i + 1, P, format!("doc{i:02}.txt"));
                let bytes = cas::to_bytes(&Cas::new(format!("a cat number {i}"))).unwrap();
                service.index_document(&doc.into(), &bytes).unwrap();
            });
        }
    });

    assert_eq!(
        s.service
            .number_of_results(P, &SearchQuery::new("alice", "cat"))
            .unwrap(),
        QueryOutcome::Ready(N)
    );
    assert_eq!(results(&s.service, "alice", "cat").len(), N as usize);
    assert_eq!(s.scheduler.pending(), 0);
}

#[test]
fn eviction_closes_once_and_reload_matches_persisted_state() {
    let s = setup();
    three_documents(&s.repository);
    s.service.reindex(P).unwrap();
    let before = results(&s.service, "alice", "cat");

    assert!(s.service.registry().evict(P));
    assert_eq!(s.closes.load(Ordering::SeqCst), 1);
    assert_eq!(s.service.index_state(P), None);
    assert!(!s.service.is_index_valid(P));

    // The rebuilt index was persisted as valid, so the fresh handle can
    // answer straight away.
    let handle = s.service.registry().get(P).unwrap().unwrap();
    assert_eq!(handle.state(), IndexState::Valid);
    assert_eq!(results(&s.service, "alice", "cat"), before);
    assert_eq!(s.closes.load(Ordering::SeqCst), 1);
    assert_eq!(s.scheduler.pending(), 0);
}

#[test]
fn evicting_a_stale_index_reloads_it_stale() {
    let s = setup();
    s.service.reindex(P).unwrap();
    s.service.invalidate(P).unwrap();

    s.service.registry().evict(P);
    let handle = s.service.registry().get(P).unwrap().unwrap();
    assert_eq!(handle.state(), IndexState::Stale);
    assert!(!s.service.is_index_valid(P));
}

#[test]
fn removed_project_is_gone() {
    let s = setup();
    three_documents(&s.repository);
    s.service.reindex(P).unwrap();

    s.service
        .handle_event(IndexEvent::ProjectRemoved { project: P })
        .unwrap();

    assert_eq!(s.service.index_state(P), None);
    assert!(s.service.list_indexes().unwrap().is_empty());
    assert_eq!(results(&s.service, "alice", "cat"), GroupedResults::new());
    assert_eq!(s.scheduler.pending(), 0);
}

async fn wait_for<T>(mut check: impl FnMut() -> Option<T>) -> T {
    for _ in 0..500 {
        if let Some(value) = check() {
            return value;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for background indexing");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn background_worker_builds_and_updates_index() {
    let tmp = tempfile::tempdir().unwrap();
    let db = Arc::new(IndexDb::open(&tmp.path().join("index.redb")).unwrap());
    let config = IndexConfig::default();
    let provider = Arc::new(TantivyProvider::on_disk(tmp.path().join("indexes"), &config));
    let repository = Arc::new(MemoryRepository::new());
    three_documents(&repository);

    let (scheduler, worker) = BackgroundScheduler::new();
    let service = Arc::new(SearchService::new(
        db,
        Some(provider),
        Arc::new(scheduler),
        repository,
        &config,
    ));
    tokio::spawn(worker.run(Arc::downgrade(&service)));

    let (sender, receiver) = events::channel();
    tokio::spawn(receiver.run(service.clone()));

    let query = SearchQuery::new("alice", "cat");
    assert_eq!(service.query(P, &query).unwrap(), QueryOutcome::NotReady);

    let count = wait_for(|| service.number_of_results(P, &query).unwrap().ready()).await;
    assert_eq!(count, 2);
    assert!(service.is_index_valid(P));

    let doc = SourceDocument::new(4, P, "fourth.txt");
    let bytes = cas::to_bytes(&Cas::new("another cat")).unwrap();
    let mut unit = sender.begin();
    unit.push(IndexEvent::DocumentCreated {
        document: doc,
        cas: bytes,
    });
    unit.commit().unwrap();

    wait_for(|| {
        let count = service.number_of_results(P, &query).unwrap().ready()?;
        (count == 3).then_some(())
    })
    .await;
    assert!(!service.is_index_in_progress(P));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn background_worker_closes_idle_indexes() {
    let tmp = tempfile::tempdir().unwrap();
    let db = Arc::new(IndexDb::open(&tmp.path().join("index.redb")).unwrap());
    let config = IndexConfig {
        idle_timeout: Duration::from_millis(50),
        ..IndexConfig::default()
    };
    let closes = Arc::new(AtomicUsize::new(0));
    let provider = Arc::new(CountingProvider {
        inner: TantivyProvider::on_disk(tmp.path().join("indexes"), &config),
        closes: closes.clone(),
    });
    let repository = Arc::new(MemoryRepository::new());
    three_documents(&repository);

    let (scheduler, worker) = BackgroundScheduler::new();
    let service = Arc::new(SearchService::new(
        db,
        Some(provider),
        Arc::new(scheduler),
        repository,
        &config,
    ));
    service.reindex(P).unwrap();
    assert_eq!(service.registry().len(), 1);

    let worker = worker.sweep_every(Duration::from_millis(10));
    tokio::spawn(worker.run(Arc::downgrade(&service)));

    wait_for(|| {
        let registry = service.registry();
        let closed = closes.load(Ordering::SeqCst) == 1;
        (closed && registry.is_empty() && registry.pending_close() == 0).then_some(())
    })
    .await;
    assert_eq!(results(&service, "alice", "cat").len(), 2);
}
