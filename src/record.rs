//! Data model for the moderation queue.
//!
//! A [`ModerationRecord`] is one AI-generated candidate reply waiting
//! for a reviewer decision. Records live in the pending map of a
//! [`QueueSnapshot`] until exactly one terminal transition (approve,
//! reject, expire) moves them into an archive.
//!
//! Lock ownership is tracked in a single place: `status == Locked`
//! if and only if `lock` is set, enforced by [`ModerationRecord::lock_for`]
//! and [`ModerationRecord::clear_lock`]. No other code writes these
//! fields directly.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Maximum characters shown in review-card previews.
const PREVIEW_CHARS: usize = 100;

/// Truncate text for a review card, respecting char boundaries.
pub fn preview(text: &str) -> String {
    if text.chars().count() <= PREVIEW_CHARS {
        text.to_string()
    } else {
        let cut: String = text.chars().take(PREVIEW_CHARS).collect();
        format!("{cut}...")
    }
}

// ── Record status ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    /// Awaiting a decision, no reviewer editing it.
    Pending,
    /// A reviewer holds the editing lock.
    Locked,
    /// Terminal: approved for delivery.
    Approved,
    /// Terminal: rejected by a reviewer.
    Rejected,
    /// Terminal: expired without a decision.
    Expired,
}

impl RecordStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Approved | Self::Rejected | Self::Expired)
    }
}

// ── Editing lock ─────────────────────────────────────────────────

/// Single-owner editing lock on a record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditLock {
    pub owner_id: String,
    pub owner_name: String,
    pub acquired_at: DateTime<Utc>,
}

impl EditLock {
    /// Whether this lock is older than `timeout` at `now`.
    pub fn is_stale(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        now - self.acquired_at >= timeout
    }
}

// ── Moderation record ────────────────────────────────────────────

/// One candidate reply awaiting a moderation decision.
///
/// Newer optional fields carry `#[serde(default)]` so snapshots
/// written by older versions still load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModerationRecord {
    /// Opaque unique token; never reused after removal.
    pub id: String,
    /// Transport reference of the originating chat.
    pub requester_chat: String,
    /// Transport reference of the requesting user.
    pub requester_user: String,
    /// Display name of the requester.
    pub requester_name: String,
    /// The original question.
    pub source_text: String,
    /// Current (possibly edited) candidate reply.
    pub candidate_text: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub decided_at: Option<DateTime<Utc>>,
    pub status: RecordStatus,
    #[serde(default)]
    pub rejection_reason: Option<String>,
    /// Transport message to reply-thread the delivery onto.
    #[serde(default)]
    pub source_message_ref: Option<String>,
    /// Human label of the originating chat.
    #[serde(default)]
    pub conversation_label: Option<String>,
    #[serde(default)]
    pub lock: Option<EditLock>,
    #[serde(default)]
    pub reminder_count: u32,
    #[serde(default)]
    pub last_reminder_at: Option<DateTime<Utc>>,
}

impl ModerationRecord {
    pub fn is_locked(&self) -> bool {
        self.lock.is_some()
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    /// Place the record under a reviewer's editing lock.
    pub fn lock_for(&mut self, owner_id: &str, owner_name: &str, now: DateTime<Utc>) {
        self.lock = Some(EditLock {
            owner_id: owner_id.to_string(),
            owner_name: owner_name.to_string(),
            acquired_at: now,
        });
        self.status = RecordStatus::Locked;
    }

    /// Release the editing lock and return the record to Pending.
    pub fn clear_lock(&mut self) -> Option<EditLock> {
        let prior = self.lock.take();
        if self.status == RecordStatus::Locked {
            self.status = RecordStatus::Pending;
        }
        prior
    }

    /// Move to a terminal status, stamping the decision time and
    /// dropping any lock.
    pub fn finish(&mut self, status: RecordStatus, now: DateTime<Utc>) {
        debug_assert!(status.is_terminal());
        self.lock = None;
        self.status = status;
        self.decided_at = Some(now);
    }

    /// How long the record has been in the queue at `now`, formatted
    /// as hours and minutes for reminder text.
    pub fn queue_age_text(&self, now: DateTime<Utc>) -> String {
        let secs = (now - self.created_at).num_seconds().max(0);
        format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
    }
}

// ── Persisted aggregate ──────────────────────────────────────────

/// Metadata stamped onto every saved snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotMeta {
    pub saved_at: DateTime<Utc>,
    pub format_version: u32,
}

impl Default for SnapshotMeta {
    fn default() -> Self {
        Self {
            saved_at: Utc::now(),
            format_version: 1,
        }
    }
}

/// Shared handle to the live queue state. Only the queue engine and
/// the lock manager mutate it, always through their public operations.
pub type SharedState = std::sync::Arc<parking_lot::Mutex<QueueSnapshot>>;

/// The whole persisted queue state: pending records plus decision
/// archives. This is the single shared mutable resource of the core.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueSnapshot {
    #[serde(default)]
    pub pending: HashMap<String, ModerationRecord>,
    #[serde(default)]
    pub approved: Vec<ModerationRecord>,
    #[serde(default)]
    pub rejected: Vec<ModerationRecord>,
    #[serde(default)]
    pub meta: SnapshotMeta,
}

// ── Statistics ───────────────────────────────────────────────────

/// A record currently being edited, attributed to its lock owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockAttribution {
    pub record_id: String,
    pub owner_name: String,
}

/// Queue statistics for reviewer-facing status output.
#[derive(Debug, Clone)]
pub struct QueueStatistics {
    /// Pending records excluding those under an editing lock.
    pub pending: usize,
    /// Records under an active editing lock, with owner names.
    pub in_progress: Vec<LockAttribution>,
    pub approved: usize,
    pub rejected: usize,
    /// approved / (approved + rejected) as a percentage; 0.0 when no
    /// decisions exist yet.
    pub approval_pct: f64,
    /// Pending records older than two hours.
    pub overdue: usize,
    /// Pending records expiring within two hours.
    pub expiring_soon: usize,
}
