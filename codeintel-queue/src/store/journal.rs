//! Write set of a work transaction.
//!
//! Both stores buffer the changes made through a work transaction and apply
//! them atomically on commit. A savepoint is a mark in the journal; rolling
//! back to it truncates everything recorded after the mark.

use chrono::{DateTime, Utc};

use super::SavepointId;
use crate::error::StoreError;
use crate::models::{Package, PackageReference, WorkItem, WorkState};

#[derive(Debug, Clone)]
pub(crate) enum Change {
    Complete { id: i64, at: DateTime<Utc> },
    Errored { id: i64, message: String, at: DateTime<Utc> },
    Requeue { id: i64, visible_at: DateTime<Utc> },
    Packages { upload_id: i64, packages: Vec<Package> },
    References { upload_id: i64, references: Vec<PackageReference> },
    DeleteOverlapping { keep: WorkItem },
    RecomputeVisibility { repository_id: i64 },
}

#[derive(Debug, Default)]
pub(crate) struct Journal {
    changes: Vec<Change>,
    savepoints: Vec<(SavepointId, usize)>,
    next_savepoint: u64,
}

impl Journal {
    pub(crate) fn push(&mut self, change: Change) {
        self.changes.push(change);
    }

    /// State of the held row as the owning transaction currently sees it.
    pub(crate) fn pending_state(&self) -> WorkState {
        self.changes
            .iter()
            .rev()
            .find_map(|change| match change {
                Change::Complete { .. } => Some(WorkState::Completed),
                Change::Errored { .. } => Some(WorkState::Errored),
                Change::Requeue { .. } => Some(WorkState::Queued),
                _ => None,
            })
            .unwrap_or(WorkState::Processing)
    }

    pub(crate) fn savepoint(&mut self) -> SavepointId {
        self.next_savepoint += 1;
        let id = SavepointId(self.next_savepoint);
        self.savepoints.push((id, self.changes.len()));
        id
    }

    pub(crate) fn rollback_to(&mut self, savepoint: SavepointId) -> Result<(), StoreError> {
        let position = self
            .savepoints
            .iter()
            .position(|(id, _)| *id == savepoint)
            .ok_or(StoreError::UnknownSavepoint(savepoint.0))?;
        let (_, len) = self.savepoints[position];
        self.changes.truncate(len);
        // The savepoint itself survives, later ones do not.
        self.savepoints.truncate(position + 1);
        Ok(())
    }

    pub(crate) fn take(&mut self) -> Vec<Change> {
        self.savepoints.clear();
        std::mem::take(&mut self.changes)
    }

    pub(crate) fn clear(&mut self) {
        self.savepoints.clear();
        self.changes.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn complete(id: i64) -> Change {
        Change::Complete {
            id,
            at: Utc::now(),
        }
    }

    #[test]
    fn test_pending_state_follows_last_transition() {
        let mut journal = Journal::default();
        assert_eq!(journal.pending_state(), WorkState::Processing);

        journal.push(Change::RecomputeVisibility { repository_id: 1 });
        assert_eq!(journal.pending_state(), WorkState::Processing);

        journal.push(complete(1));
        assert_eq!(journal.pending_state(), WorkState::Completed);
    }

    #[test]
    fn test_nested_savepoints() {
        let mut journal = Journal::default();
        let outer = journal.savepoint();
        journal.push(complete(1));
        let inner = journal.savepoint();
        journal.push(Change::RecomputeVisibility { repository_id: 1 });

        journal.rollback_to(outer).unwrap();
        assert!(journal.take().is_empty());
        assert!(matches!(
            journal.rollback_to(inner),
            Err(StoreError::UnknownSavepoint(_))
        ));
    }
}
