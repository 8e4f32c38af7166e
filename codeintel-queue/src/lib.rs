//! Lifecycle management for precise code-intel indexing and upload processing.
//!
//! The crate is organized around a transactional work store, backed by
//! SQLite ([`store::SqliteStore`]) in production and by
//! [`store::MemoryStore`] in tests:
//! - [`lease_manager`] hands items to remote agents under a bounded number of
//!   open transactions and reclaims work from agents that go quiet.
//! - [`scheduler`] decides which repositories get new index jobs.
//! - [`resetter`] returns stalled `processing` items to the queue.
//! - [`processor`] and [`worker`] process uploads in-process, holding their
//!   leases through the lease manager.
//!
//! Time is read through [`clock::Clock`] so every component can be driven
//! deterministically in tests.

pub mod clock;
pub mod config;
pub mod error;
pub mod gitserver;
pub mod index_configuration;
pub mod lease_manager;
pub mod metrics;
pub mod models;
pub mod object_store;
pub mod processor;
pub mod resetter;
pub mod scheduler;
pub mod store;
pub mod worker;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{LeaseManagerConfig, ResetterConfig, SchedulerConfig, WorkerConfig};
pub use error::{MultiError, QueueError, StoreError};
pub use gitserver::{Gitserver, GitserverError, LocalGitserver, StaticGitserver};
pub use index_configuration::{IndexConfiguration, IndexJob, IndexJobDefaults};
pub use lease_manager::{
    AgentStatus, CheckedOutLease, LeaseHandler, LeaseManager, LeaseManagerStatus,
};
pub use metrics::{QueueMetrics, QueueMetricsSnapshot};
pub use models::{
    DockerStep, NewWorkItem, Package, PackageReference, RepositoryUsage, WorkItem, WorkState,
};
pub use object_store::{FsObjectStore, ObjectStore, ObjectStoreError};
pub use processor::{CorrelatedBundle, Correlator, ProcessError, ProcessOutcome, Processor};
pub use resetter::Resetter;
pub use scheduler::{Scheduler, TickSummary};
pub use store::{
    done, DequeueConditions, Finalize, MemoryStore, QueueStats, ResetOutcome, ResetStore,
    SchedulerStore, SchedulerTransaction, SqliteStore, StoreConfig, WorkStore, WorkTransaction,
};
pub use worker::Worker;
