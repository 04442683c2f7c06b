//! Deferred indexing work.
//!
//! Writes triggered by document events and full rebuilds are queued here
//! instead of running on the caller's thread. [`BackgroundScheduler`] hands
//! tasks to a tokio worker; [`ManualScheduler`] keeps them until the owner
//! drains the queue, which is what the CLI and the tests use.

use std::{
    collections::{HashSet, VecDeque},
    sync::{Arc, Mutex, MutexGuard, Weak},
    time::Duration,
};

use tokio::{sync::mpsc, time::MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::{
    coordinator::SearchService,
    error::{Error, Result},
    model::{IndexedDocument, ProjectId},
};

/// How often the worker closes indexes that have gone idle.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Task {
    /// Write one document into its project's index.
    IndexDocument {
        document: IndexedDocument,
        cas: Vec<u8>,
    },
    /// Rebuild a project's index from scratch.
    Reindex { project: ProjectId },
}

impl Task {
    pub fn project(&self) -> ProjectId {
        match self {
            Self::IndexDocument { document, .. } => document.project(),
            Self::Reindex { project } => *project,
        }
    }
}

pub trait Scheduler: Send + Sync {
    fn enqueue_index_document(
        &self,
        document: IndexedDocument,
        cas: Vec<u8>,
    ) -> Result<()>;

    /// Queue a rebuild. A rebuild already waiting for the same project
    /// absorbs the request.
    fn enqueue_reindex(&self, project: ProjectId) -> Result<()>;

    /// Whether a rebuild for the project is queued or running.
    fn is_index_in_progress(&self, project: ProjectId) -> bool;
}

/// Execute a task, logging instead of propagating failures.
pub(crate) fn run_task(service: &SearchService, task: Task) {
    match task {
        Task::IndexDocument { document, cas } => {
            if let Err(e) = service.index_document(&document, &cas) {
                warn!(document = %document, error = %e, "failed to index document");
            }
        }
        Task::Reindex { project } => {
            if let Err(e) = service.reindex(project) {
                warn!(project = %project, error = %e, "reindex failed");
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[derive(Debug, Default)]
struct Inflight {
    queued: HashSet<ProjectId>,
    running: HashSet<ProjectId>,
}

/// Scheduler backed by a tokio worker task.
#[derive(Debug, Clone)]
pub struct BackgroundScheduler {
    tx: mpsc::UnboundedSender<Task>,
    inflight: Arc<Mutex<Inflight>>,
}

impl BackgroundScheduler {
    /// Create the scheduler and the worker that drains it. The worker must
    /// be spawned with [`TaskWorker::run`] for queued tasks to execute.
    pub fn new() -> (Self, TaskWorker) {
        let (tx, rx) = mpsc::unbounded_channel();
        let inflight = Arc::new(Mutex::new(Inflight::default()));
        let worker = TaskWorker {
            rx,
            inflight: inflight.clone(),
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        };
        (Self { tx, inflight }, worker)
    }

    fn send(&self, task: Task) -> Result<()> {
        self.tx
            .send(task)
            .map_err(|_| Error::Scheduler("task worker has stopped".to_string()))
    }
}

impl Scheduler for BackgroundScheduler {
    fn enqueue_index_document(
        &self,
        document: IndexedDocument,
        cas: Vec<u8>,
    ) -> Result<()> {
        self.send(Task::IndexDocument { document, cas })
    }

    fn enqueue_reindex(&self, project: ProjectId) -> Result<()> {
        {
            let mut inflight = lock(&self.inflight);
            if !inflight.queued.insert(project) {
                debug!(project = %project, "reindex already queued");
                return Ok(());
            }
        }
        self.send(Task::Reindex { project }).inspect_err(|_| {
            lock(&self.inflight).queued.remove(&project);
        })
    }

    fn is_index_in_progress(&self, project: ProjectId) -> bool {
        let inflight = lock(&self.inflight);
        inflight.queued.contains(&project) || inflight.running.contains(&project)
    }
}

/// Receiving end of a [`BackgroundScheduler`].
#[derive(Debug)]
pub struct TaskWorker {
    rx: mpsc::UnboundedReceiver<Task>,
    inflight: Arc<Mutex<Inflight>>,
    sweep_interval: Duration,
}

impl TaskWorker {
    /// Change how often idle indexes are closed between tasks.
    pub fn sweep_every(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval.max(Duration::from_millis(1));
        self
    }

    /// Run queued tasks one at a time until every scheduler handle is
    /// dropped or the service goes away. Between tasks, indexes idle past
    /// the service's timeout are closed.
    pub async fn run(mut self, service: Weak<SearchService>) {
        let mut sweep = tokio::time::interval(self.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        sweep.tick().await;

        loop {
            tokio::select! {
                task = self.rx.recv() => {
                    let Some(task) = task else {
                        break;
                    };
                    let Some(service) = service.upgrade() else {
                        break;
                    };
                    self.execute(service, task).await;
                }
                _ = sweep.tick() => {
                    let Some(service) = service.upgrade() else {
                        break;
                    };
                    let joined =
                        tokio::task::spawn_blocking(move || service.evict_idle()).await;
                    if let Err(e) = joined {
                        warn!(error = %e, "idle sweep panicked");
                    }
                }
            }
        }
        info!("task worker stopped");
    }

    async fn execute(&self, service: Arc<SearchService>, task: Task) {
        let reindex = match &task {
            Task::Reindex { project } => Some(*project),
            Task::IndexDocument { .. } => None,
        };
        if let Some(project) = reindex {
            let mut inflight = lock(&self.inflight);
            inflight.queued.remove(&project);
            inflight.running.insert(project);
        }

        let joined =
            tokio::task::spawn_blocking(move || run_task(&service, task)).await;
        if let Err(e) = joined {
            warn!(error = %e, "indexing task panicked");
        }

        if let Some(project) = reindex {
            lock(&self.inflight).running.remove(&project);
        }
    }
}

#[derive(Debug, Default)]
struct ManualQueue {
    pending: VecDeque<Task>,
    running: HashSet<ProjectId>,
}

/// Scheduler whose tasks only run when [`ManualScheduler::run_pending`] is
/// called.
#[derive(Debug, Default)]
pub struct ManualScheduler {
    queue: Mutex<ManualQueue>,
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of tasks waiting to run.
    pub fn pending(&self) -> usize {
        lock(&self.queue).pending.len()
    }

    /// Number of queued rebuilds for the project.
    pub fn pending_reindexes(&self, project: ProjectId) -> usize {
        lock(&self.queue)
            .pending
            .iter()
            .filter(|task| matches!(task, Task::Reindex { project: p } if *p == project))
            .count()
    }

    /// Run tasks until the queue is empty, including any queued while
    /// draining. Returns how many ran.
    pub fn run_pending(&self, service: &SearchService) -> usize {
        let mut ran = 0;
        loop {
            let task = {
                let mut queue = lock(&self.queue);
                let Some(task) = queue.pending.pop_front() else {
                    break;
                };
                if let Task::Reindex { project } = &task {
                    queue.running.insert(*project);
                }
                task
            };

            let project = task.project();
            let is_reindex = matches!(task, Task::Reindex { .. });
            run_task(service, task);
            if is_reindex {
                lock(&self.queue).running.remove(&project);
            }
            ran += 1;
        }
        ran
    }
}

impl Scheduler for ManualScheduler {
    fn enqueue_index_document(
        &self,
        document: IndexedDocument,
        cas: Vec<u8>,
    ) -> Result<()> {
        lock(&self.queue)
            .pending
            .push_back(Task::IndexDocument { document, cas });
        Ok(())
    }

    fn enqueue_reindex(&self, project: ProjectId) -> Result<()> {
        let mut queue = lock(&self.queue);
        let already = queue
            .pending
            .iter()
            .any(|task| matches!(task, Task::Reindex { project: p } if *p == project));
        if already {
            debug!(project = %project, "reindex already queued");
        } else {
            queue.pending.push_back(Task::Reindex { project });
        }
        Ok(())
    }

    fn is_index_in_progress(&self, project: ProjectId) -> bool {
        let queue = lock(&self.queue);
        queue.running.contains(&project)
            || queue
                .pending
                .iter()
                .any(|task| matches!(task, Task::Reindex { project: p } if *p == project))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SourceDocument;

    #[test]
    fn manual_scheduler_dedupes_queued_reindexes() {
        let scheduler = ManualScheduler::new();
        let project = ProjectId(1);

        assert!(!scheduler.is_index_in_progress(project));
        scheduler.enqueue_reindex(project).unwrap();
        scheduler.enqueue_reindex(project).unwrap();
        scheduler.enqueue_reindex(ProjectId(2)).unwrap();

        assert_eq!(scheduler.pending(), 2);
        assert_eq!(scheduler.pending_reindexes(project), 1);
        assert!(scheduler.is_index_in_progress(project));
    }

    #[test]
    fn document_tasks_do_not_count_as_rebuilds() {
        let scheduler = ManualScheduler::new();
        let doc = SourceDocument::new(1, ProjectId(1), "a.txt");

        scheduler
            .enqueue_index_document(doc.clone().into(), Vec::new())
            .unwrap();
        scheduler.enqueue_index_document(doc.into(), Vec::new()).unwrap();

        assert_eq!(scheduler.pending(), 2);
        assert!(!scheduler.is_index_in_progress(ProjectId(1)));
    }

    #[test]
    fn background_scheduler_tracks_queued_reindex() {
        let (scheduler, worker) = BackgroundScheduler::new();
        let project = ProjectId(4);

        scheduler.enqueue_reindex(project).unwrap();
        scheduler.enqueue_reindex(project).unwrap();
        assert!(scheduler.is_index_in_progress(project));
        assert!(!scheduler.is_index_in_progress(ProjectId(5)));

        drop(worker);
        assert!(matches!(
            scheduler.enqueue_reindex(ProjectId(5)),
            Err(Error::Scheduler(_))
        ));
        assert!(!scheduler.is_index_in_progress(ProjectId(5)));
    }
}
