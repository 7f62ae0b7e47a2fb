use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use hubfly_model::ResourceStatus;
use parking_lot::Mutex;
use serde::Serialize;
use uuid::Uuid;

/// Finished job records kept for polling
const MAX_FINISHED_JOBS: usize = 1024;

/// Port allocator for auto-assigned stream listeners
///
/// Ports held by stored records are passed in by the caller; the allocator
/// only remembers ports handed out to creates that have not been saved yet.
pub struct PortAllocator {
    start: u16,
    end: u16,
    allocated: Mutex<HashSet<u16>>,
}

impl PortAllocator {
    pub fn new(start: u16, end: u16) -> Arc<Self> {
        Arc::new(Self {
            start,
            end,
            allocated: Mutex::new(HashSet::new()),
        })
    }

    pub fn range(&self) -> (u16, u16) {
        (self.start, self.end)
    }

    /// Allocate the first port that is neither in use nor already handed out
    pub fn allocate(&self, in_use: &HashSet<u16>) -> Option<u16> {
        let mut allocated = self.allocated.lock();
        for port in self.start..=self.end {
            if !allocated.contains(&port) && !in_use.contains(&port) {
                allocated.insert(port);
                return Some(port);
            }
        }
        None
    }

    /// Release a port once its record is saved (or the create failed)
    pub fn release(&self, port: u16) {
        let mut allocated = self.allocated.lock();
        allocated.remove(&port);
    }
}

/// Unit of serialization for provisioning work
///
/// Streams serialize per port: the port's listener is one artifact.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(tag = "kind", content = "key", rename_all = "lowercase")]
pub enum ResourceKey {
    Site(String),
    Port(u16),
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Site(id) => write!(f, "site {}", id),
            Self::Port(port) => write!(f, "port {}", port),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Queued,
    Running,
    /// The job ran to the end; `outcome` says where the resource settled
    Completed,
    /// The job itself could not finish (store or apply failure)
    Failed,
}

/// Status record for one queued provisioning job
#[derive(Debug, Clone, Serialize)]
pub struct JobRecord {
    pub id: Uuid,
    pub resource: ResourceKey,
    pub state: JobState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<ResourceStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub queued_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    pub fn is_finished(&self) -> bool {
        matches!(self.state, JobState::Completed | JobState::Failed)
    }
}

/// Shared registry of job records
/// Maps job id -> record
#[derive(Default)]
pub struct JobRegistry {
    jobs: DashMap<Uuid, JobRecord>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&self, resource: ResourceKey) -> Uuid {
        let id = Uuid::new_v4();
        self.jobs.insert(
            id,
            JobRecord {
                id,
                resource,
                state: JobState::Queued,
                outcome: None,
                message: None,
                queued_at: Utc::now(),
                finished_at: None,
            },
        );
        id
    }

    pub fn start(&self, id: Uuid) {
        if let Some(mut job) = self.jobs.get_mut(&id) {
            job.state = JobState::Running;
        }
    }

    pub fn finish(
        &self,
        id: Uuid,
        state: JobState,
        outcome: Option<ResourceStatus>,
        message: Option<String>,
    ) -> Option<JobRecord> {
        let record = self.jobs.get_mut(&id).map(|mut job| {
            job.state = state;
            job.outcome = outcome;
            job.message = message;
            job.finished_at = Some(Utc::now());
            job.clone()
        });
        self.prune();
        record
    }

    pub fn get(&self, id: &Uuid) -> Option<JobRecord> {
        self.jobs.get(id).map(|job| job.clone())
    }

    /// Whether a job for `resource` is queued or running
    pub fn is_pending(&self, resource: &ResourceKey) -> bool {
        self.jobs
            .iter()
            .any(|job| &job.resource == resource && !job.is_finished())
    }

    fn prune(&self) {
        let mut finished: Vec<(DateTime<Utc>, Uuid)> = self
            .jobs
            .iter()
            .filter_map(|job| job.finished_at.map(|at| (at, job.id)))
            .collect();
        if finished.len() <= MAX_FINISHED_JOBS {
            return;
        }
        finished.sort();
        let excess = finished.len() - MAX_FINISHED_JOBS;
        for (_, id) in finished.into_iter().take(excess) {
            self.jobs.remove(&id);
        }
    }
}
