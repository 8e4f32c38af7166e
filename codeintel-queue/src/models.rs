//! Records moved through the queue: work items, index job descriptors,
//! repository usage and package metadata.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkState {
    Queued,
    Processing,
    Completed,
    Errored,
}

impl WorkState {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkState::Queued => "queued",
            WorkState::Processing => "processing",
            WorkState::Completed => "completed",
            WorkState::Errored => "errored",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "queued" => Some(WorkState::Queued),
            "processing" => Some(WorkState::Processing),
            "completed" => Some(WorkState::Completed),
            "errored" => Some(WorkState::Errored),
            _ => None,
        }
    }

    /// Completed and errored items never change state again.
    pub fn is_terminal(self) -> bool {
        matches!(self, WorkState::Completed | WorkState::Errored)
    }
}

impl fmt::Display for WorkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One step executed inside a container before the indexer runs.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DockerStep {
    #[serde(default)]
    pub root: String,
    pub image: String,
    #[serde(default)]
    pub commands: Vec<String>,
}

/// A durable unit of indexing or upload-processing work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: i64,
    pub state: WorkState,
    pub repository_id: i64,
    pub commit: String,
    pub root: String,
    pub indexer: String,
    pub indexer_args: Vec<String>,
    pub outfile: String,
    pub docker_steps: Vec<DockerStep>,
    pub local_steps: Vec<String>,
    pub failure_message: Option<String>,
    pub num_resets: u32,
    pub num_failures: u32,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Earliest time the item may be dequeued again after a requeue.
    pub process_after: Option<DateTime<Utc>>,
}

impl WorkItem {
    /// Materialize a queued row from a descriptor.
    pub fn queued(id: i64, descriptor: NewWorkItem, queued_at: DateTime<Utc>) -> Self {
        Self {
            id,
            state: WorkState::Queued,
            repository_id: descriptor.repository_id,
            commit: descriptor.commit,
            root: descriptor.root,
            indexer: descriptor.indexer,
            indexer_args: descriptor.indexer_args,
            outfile: descriptor.outfile,
            docker_steps: descriptor.docker_steps,
            local_steps: descriptor.local_steps,
            failure_message: None,
            num_resets: 0,
            num_failures: 0,
            queued_at,
            started_at: None,
            finished_at: None,
            process_after: None,
        }
    }

    /// The time from which the item counts as waiting in the queue.
    pub fn visible_from(&self) -> DateTime<Utc> {
        match self.process_after {
            Some(after) if after > self.queued_at => after,
            _ => self.queued_at,
        }
    }

    /// Identity used by the replace-on-conflict policy.
    pub fn overlap_key(&self) -> (i64, &str, &str, &str) {
        (self.repository_id, &self.commit, &self.root, &self.indexer)
    }
}

/// Descriptor for a work item that has not been inserted yet.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NewWorkItem {
    pub repository_id: i64,
    pub commit: String,
    pub root: String,
    pub indexer: String,
    pub indexer_args: Vec<String>,
    pub outfile: String,
    pub docker_steps: Vec<DockerStep>,
    pub local_steps: Vec<String>,
}

/// Usage counters the scheduler uses to decide whether a repository is worth
/// indexing without explicit configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryUsage {
    pub repository_id: i64,
    pub search_count: u64,
    pub precise_count: u64,
    pub last_enqueued_at: Option<DateTime<Utc>>,
}

impl RepositoryUsage {
    pub fn new(repository_id: i64, search_count: u64, precise_count: u64) -> Self {
        Self {
            repository_id,
            search_count,
            precise_count,
            last_enqueued_at: None,
        }
    }

    /// Share of code-intel traffic served by search-based results.
    pub fn search_ratio(&self) -> f64 {
        let total = self.search_count.saturating_add(self.precise_count);
        if total == 0 {
            0.0
        } else {
            self.search_count as f64 / total as f64
        }
    }
}

/// A package an upload provides.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Package {
    pub scheme: String,
    pub name: String,
    pub version: String,
}

/// A package an upload depends on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PackageReference {
    pub package: Package,
}
