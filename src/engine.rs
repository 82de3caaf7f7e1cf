//! The moderation queue engine — aggregate root for record lifecycle.
//!
//! Owns every state transition of a [`ModerationRecord`]: enqueue,
//! approve, reject, candidate-text edits, bulk clear, and the
//! periodic sweep that expires overdue records and evaluates
//! escalating reminders. All mutation goes through this module (or
//! the lock manager) so the lifecycle invariants stay enforceable.
//!
//! Absent records are ordinary outcomes here, not errors: approving
//! an id that was already decided returns [`Decision::NotFound`] and
//! the caller treats it as "nothing to do".

use crate::error::QueueError;
use crate::record::{
    LockAttribution, ModerationRecord, QueueStatistics, RecordStatus, SharedState,
};
use crate::store::RecordStore;
use crate::traits::RecordSummary;
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use uuid::Uuid;

/// Cumulative reminder checkpoints measured from record creation.
const REMINDER_OFFSETS_SECS: [i64; 4] = [3600, 7200, 14400, 28800];

/// Records older than this count as overdue in statistics.
const OVERDUE_AFTER_SECS: i64 = 2 * 3600;

/// Records with less than this left count as expiring soon.
const EXPIRING_WITHIN_SECS: i64 = 2 * 3600;

// ── Inputs and outcomes ──────────────────────────────────────────

/// A freshly generated reply handed to the engine by an intake worker.
#[derive(Debug, Clone)]
pub struct CandidateReply {
    pub requester_chat: String,
    pub requester_user: String,
    pub requester_name: String,
    pub source_text: String,
    pub candidate_text: String,
    pub source_message_ref: Option<String>,
    pub conversation_label: Option<String>,
}

/// Outcome of an approve/reject attempt.
#[derive(Debug, Clone)]
pub enum Decision {
    /// The record moved to its terminal state; deliver downstream.
    Completed(Box<ModerationRecord>),
    /// Another reviewer holds the editing lock — informational denial.
    LockedBy { owner_name: String },
    /// Absent or already decided. Nothing to do.
    NotFound,
}

/// One reminder the sweep decided is due, ready for fan-out.
#[derive(Debug, Clone)]
pub struct ReminderNotice {
    pub summary: RecordSummary,
    /// 1-based count of this reminder (max 4).
    pub reminder_count: u32,
    pub urgency: &'static str,
    pub queue_age: String,
}

/// A record the sweep force-expired, with the lock owner it displaced
/// (if any) so the coordinator can clear that reviewer's session.
#[derive(Debug, Clone)]
pub struct ExpiredRecord {
    pub record: ModerationRecord,
    pub displaced_owner_id: Option<String>,
}

/// Everything one sweep pass produced for the coordinator to deliver.
#[derive(Debug, Clone, Default)]
pub struct SweepOutcome {
    pub expired: Vec<ExpiredRecord>,
    pub reminders: Vec<ReminderNotice>,
}

impl SweepOutcome {
    pub fn is_empty(&self) -> bool {
        self.expired.is_empty() && self.reminders.is_empty()
    }
}

fn urgency_text(reminder_count: u32) -> &'static str {
    match reminder_count {
        1 => "New reply awaiting review",
        2 => "Reply has been waiting 2+ hours",
        3 => "Urgent: reply waiting more than 4 hours",
        _ => "Critical: reply queued more than 8 hours",
    }
}

// ── Engine ───────────────────────────────────────────────────────

pub struct ModerationEngine {
    state: SharedState,
    store: Arc<dyn RecordStore>,
    default_expiry: Duration,
}

impl ModerationEngine {
    pub fn new(state: SharedState, store: Arc<dyn RecordStore>, expiry_hours: u64) -> Self {
        Self {
            state,
            store,
            default_expiry: Duration::hours(expiry_hours as i64),
        }
    }

    /// Create a Pending record for a candidate reply, persist it, and
    /// return it for broadcast. The id is never reused.
    pub fn enqueue(&self, candidate: CandidateReply) -> Result<ModerationRecord, QueueError> {
        let now = Utc::now();
        let id = short_id();

        let record = ModerationRecord {
            id: id.clone(),
            requester_chat: candidate.requester_chat,
            requester_user: candidate.requester_user,
            requester_name: candidate.requester_name,
            source_text: candidate.source_text,
            candidate_text: candidate.candidate_text,
            created_at: now,
            expires_at: now + self.default_expiry,
            decided_at: None,
            status: RecordStatus::Pending,
            rejection_reason: None,
            source_message_ref: candidate.source_message_ref,
            conversation_label: candidate.conversation_label,
            lock: None,
            reminder_count: 0,
            last_reminder_at: None,
        };

        let snapshot = {
            let mut state = self.state.lock();
            state.pending.insert(id.clone(), record.clone());
            state.clone()
        };

        if let Err(e) = self.store.save(&snapshot) {
            // Roll back the in-memory insert so state matches disk.
            self.state.lock().pending.remove(&id);
            return Err(e);
        }

        tracing::info!(
            record_id = %record.id,
            requester = %record.requester_name,
            expires_at = %record.expires_at,
            "candidate reply queued for review"
        );
        Ok(record)
    }

    /// Snapshot copy of one pending record.
    pub fn get(&self, record_id: &str) -> Option<ModerationRecord> {
        self.state.lock().pending.get(record_id).cloned()
    }

    /// Approve a pending record. Valid from Pending, or Locked when
    /// the caller owns the lock.
    pub fn approve(&self, record_id: &str, reviewer_id: &str) -> Result<Decision, QueueError> {
        self.decide(record_id, reviewer_id, RecordStatus::Approved, None)
    }

    /// Reject a pending record with an optional reason.
    pub fn reject(
        &self,
        record_id: &str,
        reviewer_id: &str,
        reason: Option<String>,
    ) -> Result<Decision, QueueError> {
        self.decide(record_id, reviewer_id, RecordStatus::Rejected, reason)
    }

    fn decide(
        &self,
        record_id: &str,
        reviewer_id: &str,
        status: RecordStatus,
        reason: Option<String>,
    ) -> Result<Decision, QueueError> {
        let now = Utc::now();
        let (original, record, snapshot) = {
            let mut state = self.state.lock();
            let Some(current) = state.pending.get(record_id) else {
                return Ok(Decision::NotFound);
            };
            if let Some(lock) = &current.lock {
                if lock.owner_id != reviewer_id {
                    return Ok(Decision::LockedBy {
                        owner_name: lock.owner_name.clone(),
                    });
                }
            }

            let original = state.pending.remove(record_id).expect("checked above");
            let mut record = original.clone();
            record.finish(status, now);
            record.rejection_reason = reason;
            match status {
                RecordStatus::Approved => state.approved.push(record.clone()),
                _ => state.rejected.push(record.clone()),
            }
            (original, record, state.clone())
        };

        if let Err(e) = self.store.save(&snapshot) {
            // Roll back by identity: the state mutex was released
            // during the save, so a concurrent decision may have
            // appended its own record to the archive in between.
            // Popping the tail could destroy that record; removing by
            // id cannot (ids are never reused).
            let mut state = self.state.lock();
            match status {
                RecordStatus::Approved => state.approved.retain(|r| r.id != record_id),
                _ => state.rejected.retain(|r| r.id != record_id),
            }
            // Restore the pre-call record, including any lock the
            // caller held on it.
            state.pending.insert(record_id.to_string(), original);
            return Err(e);
        }

        match status {
            RecordStatus::Approved => {
                tracing::info!(record_id, reviewer_id, "record approved")
            }
            _ => tracing::info!(
                record_id,
                reviewer_id,
                reason = record.rejection_reason.as_deref().unwrap_or(""),
                "record rejected"
            ),
        }
        Ok(Decision::Completed(Box::new(record)))
    }

    /// Replace the candidate text of a record the reviewer has locked.
    /// Returns the updated record, or `None` when the record is absent
    /// or the reviewer does not own its lock.
    pub fn update_candidate_text(
        &self,
        record_id: &str,
        reviewer_id: &str,
        new_text: &str,
    ) -> Result<Option<ModerationRecord>, QueueError> {
        let (record, snapshot) = {
            let mut state = self.state.lock();
            let Some(record) = state.pending.get_mut(record_id) else {
                return Ok(None);
            };
            match &record.lock {
                Some(lock) if lock.owner_id == reviewer_id => {}
                _ => return Ok(None),
            }
            record.candidate_text = new_text.to_string();
            (record.clone(), state.clone())
        };

        self.store.save(&snapshot)?;
        tracing::info!(record_id, reviewer_id, "candidate text updated");
        Ok(Some(record))
    }

    /// Extend a pending record's expiry. Returns false if absent.
    pub fn extend_expiry(&self, record_id: &str, additional_hours: u64) -> Result<bool, QueueError> {
        let snapshot = {
            let mut state = self.state.lock();
            let Some(record) = state.pending.get_mut(record_id) else {
                return Ok(false);
            };
            record.expires_at += Duration::hours(additional_hours as i64);
            state.clone()
        };
        self.store.save(&snapshot)?;
        tracing::info!(record_id, additional_hours, "expiry extended");
        Ok(true)
    }

    /// Administrative bulk clear: empty the pending set and wipe the
    /// persisted pending state. Returns the number removed.
    pub fn clear_all_pending(&self) -> Result<usize, QueueError> {
        let (count, snapshot) = {
            let mut state = self.state.lock();
            let count = state.pending.len();
            state.pending.clear();
            (count, state.clone())
        };
        self.store.save(&snapshot)?;
        tracing::info!(cleared = count, "all pending records cleared");
        Ok(count)
    }

    /// All non-terminal records, oldest first.
    pub fn pending_records(&self) -> Vec<ModerationRecord> {
        let state = self.state.lock();
        let mut records: Vec<ModerationRecord> = state.pending.values().cloned().collect();
        records.sort_by_key(|r| r.created_at);
        records
    }

    pub fn statistics(&self) -> QueueStatistics {
        self.statistics_at(Utc::now())
    }

    fn statistics_at(&self, now: DateTime<Utc>) -> QueueStatistics {
        let state = self.state.lock();

        let mut in_progress = Vec::new();
        let mut unlocked_pending = 0usize;
        let mut overdue = 0usize;
        let mut expiring_soon = 0usize;

        for record in state.pending.values() {
            match &record.lock {
                Some(lock) => in_progress.push(LockAttribution {
                    record_id: record.id.clone(),
                    owner_name: lock.owner_name.clone(),
                }),
                None => unlocked_pending += 1,
            }
            if (now - record.created_at).num_seconds() > OVERDUE_AFTER_SECS {
                overdue += 1;
            }
            if (record.expires_at - now).num_seconds() < EXPIRING_WITHIN_SECS {
                expiring_soon += 1;
            }
        }

        let approved = state.approved.len();
        let rejected = state.rejected.len();
        let decided = approved + rejected;
        let approval_pct = if decided == 0 {
            0.0
        } else {
            approved as f64 * 100.0 / decided as f64
        };

        QueueStatistics {
            pending: unlocked_pending,
            in_progress,
            approved,
            rejected,
            approval_pct,
            overdue,
            expiring_soon,
        }
    }

    /// Force a save of the current state (used during shutdown drain).
    pub fn persist(&self) -> Result<(), QueueError> {
        let snapshot = self.state.lock().clone();
        self.store.save(&snapshot)
    }

    // ── Periodic sweep ───────────────────────────────────────────

    /// One expiry-and-reminder pass. Expiry overrides an active lock:
    /// forward progress never depends on a reviewer coming back.
    pub fn sweep(&self) -> Result<SweepOutcome, QueueError> {
        self.sweep_at(Utc::now())
    }

    fn sweep_at(&self, now: DateTime<Utc>) -> Result<SweepOutcome, QueueError> {
        let (outcome, snapshot) = {
            let mut state = self.state.lock();
            let mut outcome = SweepOutcome::default();

            // Expiry first, so nothing gets a reminder and expires in
            // the same pass.
            let expired_ids: Vec<String> = state
                .pending
                .values()
                .filter(|r| r.is_expired(now))
                .map(|r| r.id.clone())
                .collect();
            for id in expired_ids {
                let mut record = state.pending.remove(&id).expect("id from same map");
                let displaced_owner_id = record.lock.as_ref().map(|l| l.owner_id.clone());
                record.finish(RecordStatus::Expired, now);
                state.rejected.push(record.clone());
                outcome.expired.push(ExpiredRecord {
                    record,
                    displaced_owner_id,
                });
            }

            // Escalating reminders: cumulative checkpoints from
            // creation, capped at four, never for locked records.
            for record in state.pending.values_mut() {
                if record.is_locked() || record.reminder_count >= 4 {
                    continue;
                }
                let due_at = record.created_at
                    + Duration::seconds(REMINDER_OFFSETS_SECS[record.reminder_count as usize]);
                if now < due_at {
                    continue;
                }
                record.reminder_count += 1;
                record.last_reminder_at = Some(now);
                outcome.reminders.push(ReminderNotice {
                    summary: RecordSummary::of(record),
                    reminder_count: record.reminder_count,
                    urgency: urgency_text(record.reminder_count),
                    queue_age: record.queue_age_text(now),
                });
            }

            if outcome.is_empty() {
                return Ok(outcome);
            }
            (outcome, state.clone())
        };

        self.store.save(&snapshot)?;
        if !outcome.expired.is_empty() {
            tracing::info!(expired = outcome.expired.len(), "expired overdue records");
        }
        if !outcome.reminders.is_empty() {
            tracing::info!(
                reminders = outcome.reminders.len(),
                "escalating reminders due"
            );
        }
        Ok(outcome)
    }
}

/// Short record id: the first 8 hex chars of a v4 UUID.
fn short_id() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_string()
}
