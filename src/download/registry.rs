use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

use super::JobId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum HandleKind {
    SegmentWorker,
    MuxingTool,
}

/// What a handle points at, and therefore how it is stopped.
#[derive(Debug, Clone)]
pub enum HandleTarget {
    /// An in-process worker task.
    Task(AbortHandle),
    /// An OS process id.
    Process(u32),
}

#[derive(Debug, Clone)]
pub struct ProcessHandle {
    pub id: u64,
    pub job_id: JobId,
    pub kind: HandleKind,
    pub target: HandleTarget,
    pub started_at: Instant,
}

impl ProcessHandle {
    pub fn pid(&self) -> Option<u32> {
        match self.target {
            HandleTarget::Process(pid) => Some(pid),
            HandleTarget::Task(_) => None,
        }
    }
}

/// Everything currently running on behalf of jobs, independent of job bookkeeping.
#[derive(Debug, Default)]
pub struct ProcessRegistry {
    next_id: AtomicU64,
    handles: Mutex<HashMap<u64, ProcessHandle>>,
}

impl ProcessRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn handles(&self) -> MutexGuard<'_, HashMap<u64, ProcessHandle>> {
        self.handles.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Track a unit of work until the returned guard is dropped.
    pub fn register(
        self: &Arc<Self>,
        job_id: JobId,
        kind: HandleKind,
        target: HandleTarget,
    ) -> RegistrationGuard {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut handles = self.handles();

        // A pid can only belong to one live job; an older entry for it is stale.
        if let HandleTarget::Process(pid) = target {
            let stale: Vec<u64> = handles
                .values()
                .filter(|h| h.pid() == Some(pid))
                .map(|h| h.id)
                .collect();
            for old in stale {
                if let Some(handle) = handles.remove(&old) {
                    warn!(
                        "Dropping stale registry entry for pid {} (job {})",
                        pid, handle.job_id
                    );
                }
            }
        }

        debug!("Registered {:?} #{} for job {}", kind, id, job_id);
        handles.insert(
            id,
            ProcessHandle {
                id,
                job_id,
                kind,
                target,
                started_at: Instant::now(),
            },
        );

        RegistrationGuard {
            registry: Arc::clone(self),
            id,
        }
    }

    pub fn unregister(&self, id: u64) -> Option<ProcessHandle> {
        self.handles().remove(&id)
    }

    pub fn snapshot(&self) -> Vec<ProcessHandle> {
        let mut handles: Vec<ProcessHandle> = self.handles().values().cloned().collect();
        handles.sort_by_key(|h| h.id);
        handles
    }

    pub fn handles_for(&self, job_id: &JobId) -> Vec<ProcessHandle> {
        self.snapshot()
            .into_iter()
            .filter(|h| &h.job_id == job_id)
            .collect()
    }

    pub fn tracked_pids(&self) -> HashSet<u32> {
        self.handles().values().filter_map(|h| h.pid()).collect()
    }

    pub fn len(&self) -> usize {
        self.handles().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles().is_empty()
    }
}

/// Removes its registry entry when the work it tracks ends.
#[derive(Debug)]
pub struct RegistrationGuard {
    registry: Arc<ProcessRegistry>,
    id: u64,
}

impl RegistrationGuard {
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for RegistrationGuard {
    fn drop(&mut self) {
        self.registry.unregister(self.id);
    }
}
