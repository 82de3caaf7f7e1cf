//! Single-owner editing locks with timeout-based recovery.
//!
//! A reviewer must hold a record's lock to mutate its candidate text.
//! Acquisition is non-blocking: contention is reported back as a
//! denial naming the current owner, never awaited. A lock older than
//! the configured timeout is treated as abandoned — the next acquirer
//! reclaims it, and a periodic sweep force-releases it even if nobody
//! tries, so a reviewer who disappears mid-edit cannot stall a record
//! forever.

use crate::error::QueueError;
use crate::record::SharedState;
use crate::store::RecordStore;
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;

/// Outcome of a lock acquisition attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// The caller now owns the lock (fresh grant, or idempotent
    /// re-acquisition by the current owner).
    Acquired,
    /// The prior owner's lock had timed out and was reclaimed.
    Reacquired { previous_owner: String },
    /// Someone else holds a live lock.
    Denied { owner_name: String },
    /// No pending record with this id (absent or already decided).
    NotFound,
}

/// A stale lock cleared by the sweep, for coordinator follow-up:
/// clear the owner's edit session, restore everyone's controls, and
/// announce the timeout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForcedRelease {
    pub record_id: String,
    pub owner_id: String,
    pub owner_name: String,
}

pub struct LockManager {
    state: SharedState,
    store: Arc<dyn RecordStore>,
    timeout: Duration,
}

impl LockManager {
    pub fn new(state: SharedState, store: Arc<dyn RecordStore>, timeout_secs: u64) -> Self {
        Self {
            state,
            store,
            timeout: Duration::seconds(timeout_secs as i64),
        }
    }

    /// Try to take the editing lock on a record.
    pub fn try_acquire(
        &self,
        record_id: &str,
        reviewer_id: &str,
        reviewer_name: &str,
    ) -> Result<AcquireOutcome, QueueError> {
        self.try_acquire_at(record_id, reviewer_id, reviewer_name, Utc::now())
    }

    fn try_acquire_at(
        &self,
        record_id: &str,
        reviewer_id: &str,
        reviewer_name: &str,
        now: DateTime<Utc>,
    ) -> Result<AcquireOutcome, QueueError> {
        let snapshot = {
            let mut state = self.state.lock();
            let Some(record) = state.pending.get_mut(record_id) else {
                return Ok(AcquireOutcome::NotFound);
            };

            let outcome = match &record.lock {
                None => {
                    record.lock_for(reviewer_id, reviewer_name, now);
                    AcquireOutcome::Acquired
                }
                Some(lock) if lock.owner_id == reviewer_id => {
                    // Idempotent: refresh the clock for the owner.
                    record.lock_for(reviewer_id, reviewer_name, now);
                    AcquireOutcome::Acquired
                }
                Some(lock) if !lock.is_stale(now, self.timeout) => {
                    return Ok(AcquireOutcome::Denied {
                        owner_name: lock.owner_name.clone(),
                    });
                }
                Some(lock) => {
                    // Abandoned lock: automatic recovery, not an error.
                    let previous_owner = lock.owner_id.clone();
                    record.lock_for(reviewer_id, reviewer_name, now);
                    AcquireOutcome::Reacquired { previous_owner }
                }
            };

            tracing::info!(
                record_id,
                reviewer = reviewer_name,
                outcome = ?outcome,
                "editing lock acquired"
            );
            (outcome, state.clone())
        };

        let (outcome, persisted) = snapshot;
        self.store.save(&persisted)?;
        Ok(outcome)
    }

    /// Release a lock held by `reviewer_id`. No-op (returns false)
    /// when the record is absent, unlocked, or owned by someone else.
    pub fn release(&self, record_id: &str, reviewer_id: &str) -> Result<bool, QueueError> {
        let snapshot = {
            let mut state = self.state.lock();
            let Some(record) = state.pending.get_mut(record_id) else {
                return Ok(false);
            };
            match &record.lock {
                Some(lock) if lock.owner_id == reviewer_id => {
                    record.clear_lock();
                    state.clone()
                }
                _ => return Ok(false),
            }
        };

        self.store.save(&snapshot)?;
        tracing::info!(record_id, reviewer_id, "editing lock released");
        Ok(true)
    }

    /// Force-release every lock older than the timeout. Runs on a
    /// fixed interval independently of reviewer activity.
    pub fn sweep_stale(&self) -> Result<Vec<ForcedRelease>, QueueError> {
        self.sweep_stale_at(Utc::now())
    }

    fn sweep_stale_at(&self, now: DateTime<Utc>) -> Result<Vec<ForcedRelease>, QueueError> {
        let (released, snapshot) = {
            let mut state = self.state.lock();
            let mut released = Vec::new();

            for record in state.pending.values_mut() {
                let stale = record
                    .lock
                    .as_ref()
                    .is_some_and(|lock| lock.is_stale(now, self.timeout));
                if stale {
                    let lock = record.clear_lock().expect("checked above");
                    released.push(ForcedRelease {
                        record_id: record.id.clone(),
                        owner_id: lock.owner_id,
                        owner_name: lock.owner_name,
                    });
                }
            }

            if released.is_empty() {
                return Ok(released);
            }
            (released, state.clone())
        };

        self.store.save(&snapshot)?;
        for release in &released {
            tracing::warn!(
                record_id = %release.record_id,
                owner = %release.owner_name,
                "editing lock timed out, record reopened"
            );
        }
        Ok(released)
    }
}
