//! Upload processor
//!
//! Turns one dequeued upload into a stored bundle plus package metadata,
//! inside the transaction that holds the item:
//! 1. Confirm the commit resolves. A repository that is still cloning is
//!    requeued instead of failed. A missing repository or revision fails the
//!    item outright.
//! 2. Fetch and decompress the raw upload into a scratch directory.
//! 3. Correlate it into a bundle.
//! 4. Behind a savepoint, write packages and references, replace overlapping
//!    uploads, mark the item complete and store the bundle. If any of that
//!    fails the savepoint is rolled back and the item is reported errored.
//!
//! The raw upload is deleted whenever processing fails after it was fetched.

use async_trait::async_trait;
use flate2::read::GzDecoder;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::clock::{checked_after, Clock};
use crate::error::{QueueError, StoreError};
use crate::gitserver::{Gitserver, GitserverError};
use crate::models::{Package, PackageReference, WorkItem};
use crate::object_store::{ObjectStore, ObjectStoreError};
use crate::store::WorkTransaction;

/// Result of correlating a raw upload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CorrelatedBundle {
    pub packages: Vec<Package>,
    pub references: Vec<PackageReference>,
    /// Serialized bundle written to durable storage.
    pub payload: Vec<u8>,
}

#[async_trait]
pub trait Correlator: Send + Sync {
    async fn correlate(&self, item: &WorkItem, dump: &[u8]) -> anyhow::Result<CorrelatedBundle>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    Completed,
    /// Put back in the queue; not a failed attempt.
    Requeued,
    /// The item failed and should be recorded as errored.
    Errored(String),
}

/// Infrastructure failures. The whole transaction is rolled back.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Gitserver(#[from] GitserverError),

    #[error(transparent)]
    ObjectStore(#[from] ObjectStoreError),

    #[error("failed to correlate upload: {0}")]
    Correlation(anyhow::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("item {0} is no longer processing")]
    NotProcessing(i64),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

pub struct Processor {
    gitserver: Arc<dyn Gitserver>,
    objects: Arc<dyn ObjectStore>,
    correlator: Arc<dyn Correlator>,
    clock: Arc<dyn Clock>,
    clone_requeue_delay: std::time::Duration,
    scratch_root: Option<PathBuf>,
}

impl Processor {
    pub fn new(
        gitserver: Arc<dyn Gitserver>,
        objects: Arc<dyn ObjectStore>,
        correlator: Arc<dyn Correlator>,
        clock: Arc<dyn Clock>,
        clone_requeue_delay: std::time::Duration,
    ) -> Self {
        Self {
            gitserver,
            objects,
            correlator,
            clock,
            clone_requeue_delay,
            scratch_root: None,
        }
    }

    /// Create scratch directories under `root` instead of the system temp dir.
    pub fn with_scratch_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.scratch_root = Some(root.into());
        self
    }

    pub async fn process(
        &self,
        item: &WorkItem,
        tx: &mut dyn WorkTransaction,
    ) -> Result<ProcessOutcome, ProcessError> {
        match self
            .gitserver
            .resolve_commit(item.repository_id, &item.commit)
            .await
        {
            Ok(_) => {}
            Err(GitserverError::CloneInProgress(repository_id)) => {
                let visible_at = checked_after(self.clock.now(), self.clone_requeue_delay)?;
                debug!(
                    "Repository {} is still cloning, requeueing item {} until {}",
                    repository_id, item.id, visible_at
                );
                tx.requeue(item.id, visible_at).await?;
                return Ok(ProcessOutcome::Requeued);
            }
            Err(e @ GitserverError::RepositoryNotFound(_))
            | Err(e @ GitserverError::RevisionNotFound { .. }) => {
                // Retrying cannot help; record the failure so the item leaves the queue.
                return Ok(ProcessOutcome::Errored(e.to_string()));
            }
            Err(e) => return Err(e.into()),
        }

        let scratch = self.scratch_dir()?;

        let compressed = match self.objects.get_upload(item.id).await {
            Ok(data) => data,
            Err(ObjectStoreError::UploadNotFound(id)) => {
                return Ok(ProcessOutcome::Errored(format!("upload {id} not found")));
            }
            Err(e) => return Err(e.into()),
        };

        let result = self.process_upload(item, tx, &compressed, scratch.path()).await;
        if !matches!(result, Ok(ProcessOutcome::Completed)) {
            if let Err(e) = self.objects.delete_upload(item.id).await {
                warn!("Failed to delete upload {}: {}", item.id, e);
            }
        }
        result
    }

    fn scratch_dir(&self) -> Result<tempfile::TempDir, ProcessError> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("codeintel-upload-");
        let dir = match &self.scratch_root {
            Some(root) => builder.tempdir_in(root)?,
            None => builder.tempdir()?,
        };
        Ok(dir)
    }

    async fn process_upload(
        &self,
        item: &WorkItem,
        tx: &mut dyn WorkTransaction,
        compressed: &[u8],
        scratch: &Path,
    ) -> Result<ProcessOutcome, ProcessError> {
        let dump = decompress(compressed)?;
        let bundle = self
            .correlator
            .correlate(item, &dump)
            .await
            .map_err(ProcessError::Correlation)?;

        let bundle_path = scratch.join("bundle");
        tokio::fs::write(&bundle_path, &bundle.payload).await?;

        let savepoint = tx.savepoint().await?;
        match self.persist(item, tx, &bundle, &bundle_path).await {
            Ok(()) => {
                info!(
                    "Processed upload {} for repository {} at {}",
                    item.id, item.repository_id, item.commit
                );
                Ok(ProcessOutcome::Completed)
            }
            Err(e) => {
                warn!("Failed to store upload {}: {}", item.id, e);
                tx.rollback_to_savepoint(savepoint).await?;
                Ok(ProcessOutcome::Errored(e.to_string()))
            }
        }
    }

    async fn persist(
        &self,
        item: &WorkItem,
        tx: &mut dyn WorkTransaction,
        bundle: &CorrelatedBundle,
        bundle_path: &Path,
    ) -> Result<(), ProcessError> {
        tx.update_packages(item.id, &bundle.packages).await?;
        tx.update_references(item.id, &bundle.references).await?;

        let replaced = tx.delete_overlapping(item).await?;
        if replaced > 0 {
            debug!("Upload {} replaces {} older upload(s)", item.id, replaced);
        }

        if !tx.mark_complete(item.id).await? {
            return Err(ProcessError::NotProcessing(item.id));
        }
        tx.recompute_visibility(item.repository_id).await?;
        self.objects.put_bundle(item.id, bundle_path).await?;
        Ok(())
    }
}

fn decompress(compressed: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut dump = Vec::new();
    GzDecoder::new(compressed).read_to_end(&mut dump)?;
    Ok(dump)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::gitserver::StaticGitserver;
    use crate::models::{NewWorkItem, WorkState};
    use crate::object_store::FsObjectStore;
    use crate::store::{DequeueConditions, Finalize, MemoryStore, WorkStore};
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;
    use std::time::Duration;
    use tempfile::TempDir;

    struct LineCorrelator;

    /// Each line of the dump names a package.
    #[async_trait]
    impl Correlator for LineCorrelator {
        async fn correlate(
            &self,
            _item: &WorkItem,
            dump: &[u8],
        ) -> anyhow::Result<CorrelatedBundle> {
            let text = std::str::from_utf8(dump)?;
            let packages = text
                .lines()
                .map(|line| Package {
                    scheme: "gomod".to_string(),
                    name: line.to_string(),
                    version: "v1.0.0".to_string(),
                })
                .collect();
            Ok(CorrelatedBundle {
                packages,
                references: Vec::new(),
                payload: dump.to_vec(),
            })
        }
    }

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    struct Fixture {
        _dir: TempDir,
        store: MemoryStore,
        objects: FsObjectStore,
        gitserver: StaticGitserver,
        processor: Processor,
        item_id: i64,
    }

    async fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::default());
        let store = MemoryStore::new(clock.clone());
        let objects = FsObjectStore::new(dir.path().join("objects"));
        let gitserver = StaticGitserver::new();
        gitserver.set_head(50, "deadbeef");

        let item_id = store
            .insert_item(NewWorkItem {
                repository_id: 50,
                commit: "deadbeef".to_string(),
                indexer: "lsif-go".to_string(),
                ..Default::default()
            })
            .unwrap();

        let processor = Processor::new(
            Arc::new(gitserver.clone()),
            Arc::new(objects.clone()),
            Arc::new(LineCorrelator),
            clock,
            Duration::from_secs(10),
        );

        Fixture {
            _dir: dir,
            store,
            objects,
            gitserver,
            processor,
            item_id,
        }
    }

    #[tokio::test]
    async fn test_successful_upload() {
        let f = fixture().await;
        f.objects
            .put_upload(f.item_id, &gzip(b"github.com/a\ngithub.com/b"))
            .await
            .unwrap();

        let (item, mut tx) = f
            .store
            .dequeue(&DequeueConditions::default())
            .await
            .unwrap()
            .unwrap();
        let outcome = f.processor.process(&item, tx.as_mut()).await.unwrap();
        assert_eq!(outcome, ProcessOutcome::Completed);
        tx.commit().await.unwrap();

        let stored = f.store.item(f.item_id).unwrap().unwrap();
        assert_eq!(stored.state, WorkState::Completed);
        assert_eq!(f.store.packages(f.item_id).unwrap().len(), 2);
        assert_eq!(f.store.visible_uploads(50).unwrap(), vec![f.item_id]);
        assert!(f.objects.bundle_path(f.item_id).exists());
        assert!(f.objects.upload_path(f.item_id).exists());
    }

    #[tokio::test]
    async fn test_clone_in_progress_requeues() {
        let f = fixture().await;
        f.gitserver.set_cloning(50);

        let (item, mut tx) = f
            .store
            .dequeue(&DequeueConditions::default())
            .await
            .unwrap()
            .unwrap();
        let outcome = f.processor.process(&item, tx.as_mut()).await.unwrap();
        assert_eq!(outcome, ProcessOutcome::Requeued);
        tx.commit().await.unwrap();

        let stored = f.store.item(f.item_id).unwrap().unwrap();
        assert_eq!(stored.state, WorkState::Queued);
        assert_eq!(stored.num_failures, 0);
        assert!(stored.process_after.is_some());
    }

    #[tokio::test]
    async fn test_corrupt_upload_is_deleted() {
        let f = fixture().await;
        f.objects
            .put_upload(f.item_id, b"definitely not gzip")
            .await
            .unwrap();

        let (item, mut tx) = f
            .store
            .dequeue(&DequeueConditions::default())
            .await
            .unwrap()
            .unwrap();
        let err = f.processor.process(&item, tx.as_mut()).await.unwrap_err();
        assert!(matches!(err, ProcessError::Io(_)));
        tx.rollback().await.unwrap();

        assert!(!f.objects.upload_path(f.item_id).exists());
        assert_eq!(
            f.store.item(f.item_id).unwrap().unwrap().state,
            WorkState::Queued
        );
    }

    #[tokio::test]
    async fn test_store_failure_rolls_back_to_savepoint() {
        let f = fixture().await;
        f.objects
            .put_upload(f.item_id, &gzip(b"github.com/a"))
            .await
            .unwrap();
        // A file where the bundles directory should be makes put_bundle fail.
        std::fs::write(f.objects.bundle_path(f.item_id).parent().unwrap(), b"").unwrap();

        let (item, mut tx) = f
            .store
            .dequeue(&DequeueConditions::default())
            .await
            .unwrap()
            .unwrap();
        let outcome = f.processor.process(&item, tx.as_mut()).await.unwrap();
        let ProcessOutcome::Errored(message) = outcome else {
            panic!("expected errored outcome, got {outcome:?}");
        };
        assert!(tx.mark_errored(item.id, &message).await.unwrap());
        tx.commit().await.unwrap();

        let stored = f.store.item(f.item_id).unwrap().unwrap();
        assert_eq!(stored.state, WorkState::Errored);
        assert_eq!(stored.num_failures, 1);
        assert!(f.store.packages(f.item_id).unwrap().is_empty());
        assert!(f.store.visible_uploads(50).unwrap().is_empty());
        assert!(!f.objects.upload_path(f.item_id).exists());
    }

    #[tokio::test]
    async fn test_missing_upload_is_errored() {
        let f = fixture().await;
        let (item, mut tx) = f
            .store
            .dequeue(&DequeueConditions::default())
            .await
            .unwrap()
            .unwrap();
        let outcome = f.processor.process(&item, tx.as_mut()).await.unwrap();
        assert!(matches!(outcome, ProcessOutcome::Errored(ref msg) if msg.contains("not found")));
        tx.rollback().await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_repository_is_errored() {
        let f = fixture().await;
        let gitserver = StaticGitserver::new();
        let processor = Processor::new(
            Arc::new(gitserver),
            Arc::new(f.objects.clone()),
            Arc::new(LineCorrelator),
            Arc::new(ManualClock::default()),
            Duration::from_secs(10),
        );

        let (item, mut tx) = f
            .store
            .dequeue(&DequeueConditions::default())
            .await
            .unwrap()
            .unwrap();
        let outcome = processor.process(&item, tx.as_mut()).await.unwrap();
        assert_eq!(
            outcome,
            ProcessOutcome::Errored("repository 50 not found".to_string())
        );
        tx.rollback().await.unwrap();
    }

    #[tokio::test]
    async fn test_unbounded_clone_delay_is_an_error() {
        let f = fixture().await;
        f.gitserver.set_cloning(50);
        let processor = Processor::new(
            Arc::new(f.gitserver.clone()),
            Arc::new(f.objects.clone()),
            Arc::new(LineCorrelator),
            Arc::new(ManualClock::default()),
            Duration::from_secs(u64::MAX),
        );

        let (item, mut tx) = f
            .store
            .dequeue(&DequeueConditions::default())
            .await
            .unwrap()
            .unwrap();
        let err = processor.process(&item, tx.as_mut()).await.unwrap_err();
        assert!(matches!(err, ProcessError::Store(StoreError::TimeOutOfRange(_))));
        tx.rollback().await.unwrap();
        assert_eq!(
            f.store.item(f.item_id).unwrap().unwrap().state,
            WorkState::Queued
        );
    }
}
