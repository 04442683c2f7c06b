//! Domain events that drive index maintenance.
//!
//! Producers raise events inside a unit of work through [`PendingEvents`];
//! nothing reaches the service until the unit of work commits.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::{
    coordinator::SearchService,
    error::{Error, Result},
    model::{IndexedDocument, ProjectId, SourceDocument},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexEvent {
    /// A source document was uploaded.
    DocumentCreated { document: SourceDocument, cas: Vec<u8> },
    /// A source or annotation document's content was saved.
    CasWritten { document: IndexedDocument, cas: Vec<u8> },
    /// The project's layer or feature configuration changed.
    LayerChanged { project: ProjectId },
    DocumentRemoved { document: SourceDocument },
    ProjectRemoved { project: ProjectId },
}

impl IndexEvent {
    pub fn project(&self) -> ProjectId {
        match self {
            Self::DocumentCreated { document, .. }
            | Self::DocumentRemoved { document } => document.project,
            Self::CasWritten { document, .. } => document.project(),
            Self::LayerChanged { project } | Self::ProjectRemoved { project } => {
                *project
            }
        }
    }
}

pub fn channel() -> (EventSender, EventReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EventSender { tx }, EventReceiver { rx })
}

#[derive(Debug, Clone)]
pub struct EventSender {
    tx: mpsc::UnboundedSender<IndexEvent>,
}

impl EventSender {
    /// Publish an event immediately.
    pub fn send(&self, event: IndexEvent) -> Result<()> {
        self.tx
            .send(event)
            .map_err(|_| Error::Scheduler("event receiver has stopped".to_string()))
    }

    /// Start buffering events for a unit of work.
    pub fn begin(&self) -> PendingEvents {
        PendingEvents {
            sender: self.clone(),
            events: Vec::new(),
        }
    }
}

/// Events held back until their unit of work commits. Dropping the buffer
/// without committing discards them.
#[derive(Debug)]
pub struct PendingEvents {
    sender: EventSender,
    events: Vec<IndexEvent>,
}

impl PendingEvents {
    pub fn push(&mut self, event: IndexEvent) {
        self.events.push(event);
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Publish the buffered events in the order they were raised.
    pub fn commit(mut self) -> Result<usize> {
        let events = std::mem::take(&mut self.events);
        let count = events.len();
        for event in events {
            self.sender.send(event)?;
        }
        Ok(count)
    }
}

impl Drop for PendingEvents {
    fn drop(&mut self) {
        if !self.events.is_empty() {
            debug!(discarded = self.events.len(), "unit of work rolled back, dropping events");
        }
    }
}

#[derive(Debug)]
pub struct EventReceiver {
    rx: mpsc::UnboundedReceiver<IndexEvent>,
}

impl EventReceiver {
    /// Take the next event if one is waiting.
    pub fn try_next(&mut self) -> Option<IndexEvent> {
        self.rx.try_recv().ok()
    }

    /// Apply every waiting event on the current thread. Returns how many
    /// were handled.
    pub fn drain(&mut self, service: &SearchService) -> usize {
        let mut handled = 0;
        while let Some(event) = self.try_next() {
            dispatch(service, event);
            handled += 1;
        }
        handled
    }

    /// Apply events as they arrive until every sender is dropped.
    pub async fn run(mut self, service: Arc<SearchService>) {
        while let Some(event) = self.rx.recv().await {
            let service = service.clone();
            let joined =
                tokio::task::spawn_blocking(move || dispatch(&service, event)).await;
            if let Err(e) = joined {
                warn!(error = %e, "event handler panicked");
            }
        }
        debug!("event receiver stopped");
    }
}

fn dispatch(service: &SearchService, event: IndexEvent) {
    let project = event.project();
    if let Err(e) = service.handle_event(event) {
        warn!(project = %project, error = %e, "failed to handle index event");
    }
}
