//! Per-project runtime state and the lock that serializes it.

use std::sync::{
    Arc,
    Mutex,
    MutexGuard,
    TryLockError,
    atomic::{AtomicU8, Ordering},
};

use tracing::{debug, warn};

use crate::{error::Result, model::ProjectId, physical::PhysicalIndex};

/// Lifecycle of a project's index.
///
/// Only [`IndexState::Valid`] maps to a persisted `invalid = false`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum IndexState {
    /// No physical index exists yet.
    Uncreated = 0,
    /// Invalid, with a rebuild outstanding.
    Building = 1,
    /// Created and current.
    Valid = 2,
    /// Created but out of date.
    Stale = 3,
    /// The project was removed. Terminal.
    Deleted = 4,
}

impl IndexState {
    /// Derive the state of a freshly loaded handle from the persisted flag
    /// and what the physical index reports.
    pub fn from_persisted(invalid: bool, created: bool) -> Self {
        match (created, invalid) {
            (false, _) => Self::Uncreated,
            (true, false) => Self::Valid,
            (true, true) => Self::Stale,
        }
    }

    /// Value of the persisted `invalid` flag for this state.
    pub fn is_invalid(self) -> bool {
        self != Self::Valid
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Uncreated,
            1 => Self::Building,
            2 => Self::Valid,
            3 => Self::Stale,
            _ => Self::Deleted,
        }
    }
}

impl std::fmt::Display for IndexState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Uncreated => "uncreated",
            Self::Building => "building",
            Self::Valid => "valid",
            Self::Stale => "stale",
            Self::Deleted => "deleted",
        };
        f.write_str(name)
    }
}

struct HandleInner {
    state: IndexState,
    physical: Arc<dyn PhysicalIndex>,
    /// Set once the handle has left the registry; a retired handle must not
    /// be used again.
    retired: bool,
}

/// Runtime state bundle for one project's index.
///
/// All mutations of the project's index go through [`IndexHandle::lock`].
/// The current state is also mirrored into an atomic so that status checks
/// never wait behind a long-running rebuild.
pub struct IndexHandle {
    project: ProjectId,
    state_mirror: AtomicU8,
    inner: Mutex<HandleInner>,
}

impl IndexHandle {
    pub fn new(
        project: ProjectId,
        state: IndexState,
        physical: Arc<dyn PhysicalIndex>,
    ) -> Self {
        Self {
            project,
            state_mirror: AtomicU8::new(state as u8),
            inner: Mutex::new(HandleInner {
                state,
                physical,
                retired: false,
            }),
        }
    }

    pub fn project(&self) -> ProjectId {
        self.project
    }

    /// Last published state, read without taking the lock.
    pub fn state(&self) -> IndexState {
        IndexState::from_u8(self.state_mirror.load(Ordering::Acquire))
    }

    pub fn lock(&self) -> HandleGuard<'_> {
        let inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        HandleGuard {
            handle: self,
            inner,
        }
    }

    /// Take the lock only if nobody holds it.
    pub fn try_lock(&self) -> Option<HandleGuard<'_>> {
        let inner = match self.inner.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => return None,
        };
        Some(HandleGuard {
            handle: self,
            inner,
        })
    }

    /// Retire the handle, closing its physical index if it is open.
    ///
    /// Runs under the project lock so an index is never closed in the
    /// middle of a write.
    pub fn close(&self) -> Result<()> {
        self.lock().retire()
    }
}

impl std::fmt::Debug for IndexHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexHandle")
            .field("project", &self.project)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Exclusive access to a project's index state.
pub struct HandleGuard<'a> {
    handle: &'a IndexHandle,
    inner: MutexGuard<'a, HandleInner>,
}

impl HandleGuard<'_> {
    pub fn project(&self) -> ProjectId {
        self.handle.project
    }

    pub fn state(&self) -> IndexState {
        self.inner.state
    }

    pub fn set_state(&mut self, state: IndexState) {
        if self.inner.state != state {
            debug!(
                project = %self.handle.project,
                from = %self.inner.state,
                to = %state,
                "index state changed"
            );
        }
        self.inner.state = state;
        self.handle
            .state_mirror
            .store(state as u8, Ordering::Release);
    }

    pub fn physical(&self) -> &Arc<dyn PhysicalIndex> {
        &self.inner.physical
    }

    pub fn is_retired(&self) -> bool {
        self.inner.retired
    }

    /// Close the physical index (if open) and mark the handle retired.
    /// Idempotent: the index is closed at most once.
    pub fn retire(&mut self) -> Result<()> {
        if self.inner.retired {
            return Ok(());
        }
        self.inner.retired = true;
        if self.inner.physical.is_open() {
            self.inner.physical.close()?;
            debug!(project = %self.handle.project, "closed evicted index");
        }
        Ok(())
    }

    /// Drop the physical index entirely and move to the terminal state.
    pub fn delete(&mut self) -> Result<()> {
        self.inner.retired = true;
        self.set_state(IndexState::Deleted);
        if let Err(e) = self.inner.physical.close() {
            warn!(project = %self.handle.project, error = %e, "failed to close index before deletion");
        }
        self.inner.physical.delete()
    }
}
