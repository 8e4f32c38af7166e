//! Repository and commit resolution.
//!
//! The scheduler needs the head commit of each candidate repository and the
//! processor needs to confirm that the commit of an item still resolves. Both
//! go through [`Gitserver`]. Missing repositories and repositories that are
//! still cloning are reported as distinct variants so callers can treat them
//! as transient.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum GitserverError {
    #[error("repository {0} not found")]
    RepositoryNotFound(i64),

    #[error("repository {0} is still being cloned")]
    CloneInProgress(i64),

    #[error("revision {revision} not found in repository {repository_id}")]
    RevisionNotFound { repository_id: i64, revision: String },

    #[error("git error: {0}")]
    Git(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl GitserverError {
    /// Conditions that resolve themselves without intervention.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            GitserverError::RepositoryNotFound(_) | GitserverError::CloneInProgress(_)
        )
    }
}

#[async_trait]
pub trait Gitserver: Send + Sync {
    /// Current head commit of the repository's default branch.
    async fn head(&self, repository_id: i64) -> Result<String, GitserverError>;

    /// Resolve a revision to a full commit id.
    async fn resolve_commit(
        &self,
        repository_id: i64,
        revision: &str,
    ) -> Result<String, GitserverError>;
}

/// Serves repositories cloned under a single directory.
///
/// Repository `42` lives at `<repos_dir>/42`. While a clone is running the
/// cloner keeps a `<repos_dir>/42.cloning` marker file next to it.
#[derive(Debug, Clone)]
pub struct LocalGitserver {
    repos_dir: PathBuf,
}

impl LocalGitserver {
    pub fn new(repos_dir: impl Into<PathBuf>) -> Self {
        Self {
            repos_dir: repos_dir.into(),
        }
    }

    pub fn repos_dir(&self) -> &Path {
        &self.repos_dir
    }

    fn repository_path(&self, repository_id: i64) -> Result<PathBuf, GitserverError> {
        let marker = self.repos_dir.join(format!("{repository_id}.cloning"));
        if marker.exists() {
            return Err(GitserverError::CloneInProgress(repository_id));
        }

        let path = self.repos_dir.join(repository_id.to_string());
        if !path.exists() {
            return Err(GitserverError::RepositoryNotFound(repository_id));
        }
        Ok(path)
    }

    async fn with_repository<T, F>(&self, repository_id: i64, f: F) -> Result<T, GitserverError>
    where
        T: Send + 'static,
        F: FnOnce(gix::Repository) -> Result<T, GitserverError> + Send + 'static,
    {
        let path = self.repository_path(repository_id)?;
        tokio::task::spawn_blocking(move || {
            let repo = gix::open(&path).map_err(|e| GitserverError::Git(e.to_string()))?;
            f(repo)
        })
        .await
        .map_err(|e| GitserverError::Git(format!("git task failed: {e}")))?
    }
}

#[async_trait]
impl Gitserver for LocalGitserver {
    async fn head(&self, repository_id: i64) -> Result<String, GitserverError> {
        let commit = self
            .with_repository(repository_id, move |repo| {
                let not_found = || GitserverError::RevisionNotFound {
                    repository_id,
                    revision: "HEAD".to_string(),
                };
                let mut head = repo.head().map_err(|_| not_found())?;
                let commit = head.peel_to_commit_in_place().map_err(|_| not_found())?;
                Ok(commit.id().to_string())
            })
            .await?;

        debug!("Repository {} is at {}", repository_id, commit);
        Ok(commit)
    }

    async fn resolve_commit(
        &self,
        repository_id: i64,
        revision: &str,
    ) -> Result<String, GitserverError> {
        let revision = revision.to_string();
        self.with_repository(repository_id, move |repo| {
            let not_found = || GitserverError::RevisionNotFound {
                repository_id,
                revision: revision.clone(),
            };
            let id = repo
                .rev_parse_single(revision.as_str())
                .map_err(|_| not_found())?;
            let commit = id
                .object()
                .map_err(|e| GitserverError::Git(e.to_string()))?
                .peel_to_kind(gix::object::Kind::Commit)
                .map_err(|_| not_found())?;
            Ok(commit.id.to_string())
        })
        .await
    }
}

/// Answer for one repository in a [`StaticGitserver`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepositoryStatus {
    Cloned { head: String },
    Cloning,
}

/// Gitserver backed by a fixed table; repositories not in the table are
/// reported as not found.
#[derive(Debug, Clone, Default)]
pub struct StaticGitserver {
    repositories: Arc<Mutex<HashMap<i64, RepositoryStatus>>>,
}

impl StaticGitserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_head(&self, repository_id: i64, head: impl Into<String>) {
        if let Ok(mut repositories) = self.repositories.lock() {
            repositories.insert(repository_id, RepositoryStatus::Cloned { head: head.into() });
        }
    }

    pub fn set_cloning(&self, repository_id: i64) {
        if let Ok(mut repositories) = self.repositories.lock() {
            repositories.insert(repository_id, RepositoryStatus::Cloning);
        }
    }

    pub fn remove(&self, repository_id: i64) {
        if let Ok(mut repositories) = self.repositories.lock() {
            repositories.remove(&repository_id);
        }
    }

    fn status(&self, repository_id: i64) -> Result<RepositoryStatus, GitserverError> {
        let repositories = self
            .repositories
            .lock()
            .map_err(|_| GitserverError::Git("repository table poisoned".to_string()))?;
        repositories
            .get(&repository_id)
            .cloned()
            .ok_or(GitserverError::RepositoryNotFound(repository_id))
    }
}

#[async_trait]
impl Gitserver for StaticGitserver {
    async fn head(&self, repository_id: i64) -> Result<String, GitserverError> {
        match self.status(repository_id)? {
            RepositoryStatus::Cloned { head } => Ok(head),
            RepositoryStatus::Cloning => Err(GitserverError::CloneInProgress(repository_id)),
        }
    }

    /// Every revision resolves to itself once the repository is cloned.
    async fn resolve_commit(
        &self,
        repository_id: i64,
        revision: &str,
    ) -> Result<String, GitserverError> {
        match self.status(repository_id)? {
            RepositoryStatus::Cloned { .. } => Ok(revision.to_string()),
            RepositoryStatus::Cloning => Err(GitserverError::CloneInProgress(repository_id)),
        }
    }
}
