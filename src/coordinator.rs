//! Reviewer session coordination and cross-reviewer view sync.
//!
//! Tracks, per reviewer, the single edit session they may hold and,
//! per record, the transport view delivered to each reviewer. When
//! one reviewer acts, every other reviewer's copy is updated to
//! reflect the new state — each target independently, so one
//! unreachable client never blocks the rest.
//!
//! The coordinator never mutates records directly: all record
//! mutation goes through the queue engine and the lock manager.

use crate::config::ReviewerConfig;
use crate::engine::{Decision, ExpiredRecord, ModerationEngine, ReminderNotice};
use crate::error::QueueError;
use crate::lock::{AcquireOutcome, ForcedRelease, LockManager};
use crate::record::ModerationRecord;
use crate::traits::{Controls, Notifier, RecordSummary, ResponseGenerator, ViewHandle};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

// ── Edit sessions ────────────────────────────────────────────────

/// Which kind of reviewer input the edit flow is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditPhase {
    /// Waiting for a correction instruction to feed the generator.
    AwaitingAiCorrection,
    /// Waiting for replacement text typed by the reviewer.
    AwaitingManualText,
}

/// Ephemeral, in-memory only. At most one per reviewer.
#[derive(Debug, Clone)]
pub struct ReviewerEditSession {
    pub reviewer_id: String,
    pub record_id: String,
    pub phase: EditPhase,
}

/// Outcome of a reviewer trying to start an edit flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartEditOutcome {
    Started,
    /// The reviewer is already mid-edit on another record: hard
    /// per-reviewer serialization, independent of the record lock.
    AlreadyEditingOther { record_id: String },
    /// Another reviewer holds a live lock on the record.
    DeniedLocked { owner_name: String },
    /// Record absent or already decided.
    NotFound,
    /// Caller is not on the reviewer allow-list.
    NotAuthorized,
}

/// Outcome of submitting edit text.
#[derive(Debug, Clone)]
pub enum EditSubmitOutcome {
    Applied(Box<ModerationRecord>),
    /// The reviewer has no edit session open.
    NoActiveSession,
    /// The target record vanished (decided, expired, or cleared).
    RecordGone,
    /// The generator failed to refine; the session stays open so the
    /// reviewer can retry or cancel.
    RefineFailed,
}

/// State transitions broadcast to every tracked view of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StateChange {
    Approved,
    Rejected,
    EditingAi,
    EditingManual,
    Reopened,
}

impl StateChange {
    fn text(self, actor_name: &str, summary: &RecordSummary) -> String {
        match self {
            Self::Approved => format!("Approved by {actor_name}"),
            Self::Rejected => format!("Rejected by {actor_name}"),
            Self::EditingAi => format!("Being edited by {actor_name} (AI-assisted)"),
            Self::EditingManual => format!("Being edited by {actor_name} (manual)"),
            Self::Reopened => summary.render(),
        }
    }

    fn controls(self) -> Option<Controls> {
        match self {
            // Strip action controls once the state is taken or terminal.
            Self::Approved | Self::Rejected | Self::EditingAi | Self::EditingManual => {
                Some(Controls::None)
            }
            Self::Reopened => Some(Controls::Moderation),
        }
    }
}

// ── Coordinator ──────────────────────────────────────────────────

pub struct ReviewerCoordinator {
    engine: Arc<ModerationEngine>,
    locks: Arc<LockManager>,
    notifier: Arc<dyn Notifier>,
    generator: Arc<dyn ResponseGenerator>,
    reviewers: Vec<ReviewerConfig>,
    /// reviewer id → their single active edit session.
    sessions: Mutex<HashMap<String, ReviewerEditSession>>,
    /// record id → reviewer id → delivered view.
    views: Mutex<HashMap<String, HashMap<String, ViewHandle>>>,
    /// Reviewers who muted reminder notifications.
    reminder_opt_outs: Mutex<HashSet<String>>,
}

impl ReviewerCoordinator {
    pub fn new(
        engine: Arc<ModerationEngine>,
        locks: Arc<LockManager>,
        notifier: Arc<dyn Notifier>,
        generator: Arc<dyn ResponseGenerator>,
        reviewers: Vec<ReviewerConfig>,
    ) -> Self {
        Self {
            engine,
            locks,
            notifier,
            generator,
            reviewers,
            sessions: Mutex::new(HashMap::new()),
            views: Mutex::new(HashMap::new()),
            reminder_opt_outs: Mutex::new(HashSet::new()),
        }
    }

    fn reviewer_name(&self, reviewer_id: &str) -> Option<String> {
        self.reviewers
            .iter()
            .find(|r| r.id == reviewer_id)
            .map(|r| r.name.clone())
    }

    // ── Fan-out ──────────────────────────────────────────────────

    /// First broadcast of a fresh record to every reviewer. Each
    /// target is delivered independently; failures are logged and the
    /// remaining reviewers still get their copy.
    pub async fn announce(&self, record: &ModerationRecord) {
        let summary = RecordSummary::of(record);
        let text = format!("New reply awaiting review\n{}", summary.render());

        let mut delivered = 0usize;
        for reviewer in &self.reviewers {
            match self
                .notifier
                .send(&reviewer.id, &text, Controls::Moderation)
                .await
            {
                Ok(handle) => {
                    self.views
                        .lock()
                        .entry(record.id.clone())
                        .or_default()
                        .insert(reviewer.id.clone(), handle);
                    delivered += 1;
                }
                Err(e) => {
                    tracing::error!(
                        record_id = %record.id,
                        reviewer = %reviewer.id,
                        "failed to deliver review card: {e:#}"
                    );
                }
            }
        }
        tracing::info!(
            record_id = %record.id,
            delivered,
            reviewers = self.reviewers.len(),
            "review card broadcast"
        );
    }

    /// Update every tracked view of a record, optionally skipping the
    /// acting reviewer's own copy.
    async fn broadcast_state_change(
        &self,
        record_id: &str,
        change: StateChange,
        actor_name: &str,
        exclude_reviewer: Option<&str>,
    ) {
        let targets: Vec<(String, ViewHandle)> = {
            let views = self.views.lock();
            match views.get(record_id) {
                Some(tracked) => tracked
                    .iter()
                    .filter(|(reviewer_id, _)| Some(reviewer_id.as_str()) != exclude_reviewer)
                    .map(|(r, h)| (r.clone(), h.clone()))
                    .collect(),
                None => {
                    tracing::warn!(record_id, "no tracked views to update");
                    return;
                }
            }
        };

        let summary = self
            .engine
            .get(record_id)
            .map(|r| RecordSummary::of(&r))
            .unwrap_or_else(|| RecordSummary {
                record_id: record_id.to_string(),
                conversation_label: String::new(),
                requester_name: String::new(),
                source_preview: String::new(),
                candidate_preview: String::new(),
            });
        let text = change.text(actor_name, &summary);

        let mut updated = 0usize;
        for (reviewer_id, handle) in &targets {
            match self
                .notifier
                .update(handle, &text, change.controls())
                .await
            {
                Ok(()) => updated += 1,
                Err(e) => {
                    tracing::error!(
                        record_id,
                        reviewer = %reviewer_id,
                        "failed to sync view: {e:#}"
                    );
                }
            }
        }
        tracing::debug!(record_id, updated, total = targets.len(), "views synced");
    }

    /// Remove every transport copy of a terminal record and release
    /// its tracking memory.
    async fn cleanup_record_views(&self, record_id: &str) {
        let tracked = self.views.lock().remove(record_id);
        let Some(tracked) = tracked else { return };
        for (reviewer_id, handle) in tracked {
            if let Err(e) = self.notifier.remove(&handle).await {
                tracing::warn!(
                    record_id,
                    reviewer = %reviewer_id,
                    "failed to remove stale view: {e:#}"
                );
            }
        }
    }

    // ── Decisions ────────────────────────────────────────────────

    /// Approve a record on behalf of a reviewer. On success the
    /// record is returned for downstream delivery by the caller.
    pub async fn approve(
        &self,
        record_id: &str,
        reviewer_id: &str,
    ) -> Result<Decision, QueueError> {
        let Some(actor_name) = self.reviewer_name(reviewer_id) else {
            tracing::warn!(reviewer_id, "approve attempt by unlisted reviewer ignored");
            return Ok(Decision::NotFound);
        };

        let decision = self.engine.approve(record_id, reviewer_id)?;
        if let Decision::Completed(record) = &decision {
            self.finish_record(&record.id, StateChange::Approved, &actor_name)
                .await;
        }
        Ok(decision)
    }

    /// Reject a record on behalf of a reviewer.
    pub async fn reject(
        &self,
        record_id: &str,
        reviewer_id: &str,
        reason: Option<String>,
    ) -> Result<Decision, QueueError> {
        let Some(actor_name) = self.reviewer_name(reviewer_id) else {
            tracing::warn!(reviewer_id, "reject attempt by unlisted reviewer ignored");
            return Ok(Decision::NotFound);
        };

        let decision = self.engine.reject(record_id, reviewer_id, reason)?;
        if let Decision::Completed(record) = &decision {
            self.finish_record(&record.id, StateChange::Rejected, &actor_name)
                .await;
        }
        Ok(decision)
    }

    /// Terminal-state housekeeping: drop edit sessions targeting the
    /// record, tell every reviewer what happened, then clean the
    /// transport surface.
    async fn finish_record(&self, record_id: &str, change: StateChange, actor_name: &str) {
        self.sessions
            .lock()
            .retain(|_, session| session.record_id != record_id);
        self.broadcast_state_change(record_id, change, actor_name, None)
            .await;
        self.cleanup_record_views(record_id).await;
    }

    // ── Edit flow ────────────────────────────────────────────────

    /// Begin an edit flow: take the record lock and open a session.
    pub async fn start_edit(
        &self,
        record_id: &str,
        reviewer_id: &str,
        phase: EditPhase,
    ) -> Result<StartEditOutcome, QueueError> {
        let Some(reviewer_name) = self.reviewer_name(reviewer_id) else {
            return Ok(StartEditOutcome::NotAuthorized);
        };

        // One edit at a time per reviewer, regardless of record locks.
        if let Some(existing) = self.sessions.lock().get(reviewer_id) {
            return Ok(StartEditOutcome::AlreadyEditingOther {
                record_id: existing.record_id.clone(),
            });
        }

        match self.locks.try_acquire(record_id, reviewer_id, &reviewer_name)? {
            AcquireOutcome::NotFound => return Ok(StartEditOutcome::NotFound),
            AcquireOutcome::Denied { owner_name } => {
                return Ok(StartEditOutcome::DeniedLocked { owner_name });
            }
            AcquireOutcome::Acquired => {}
            AcquireOutcome::Reacquired { previous_owner } => {
                // The abandoned owner's session targets a lock they no
                // longer hold; drop it.
                self.sessions.lock().remove(&previous_owner);
                tracing::warn!(
                    record_id,
                    previous_owner = %previous_owner,
                    "stale lock reclaimed, prior edit session dropped"
                );
            }
        }

        self.sessions.lock().insert(
            reviewer_id.to_string(),
            ReviewerEditSession {
                reviewer_id: reviewer_id.to_string(),
                record_id: record_id.to_string(),
                phase,
            },
        );

        let change = match phase {
            EditPhase::AwaitingAiCorrection => StateChange::EditingAi,
            EditPhase::AwaitingManualText => StateChange::EditingManual,
        };
        // Other reviewers see "being edited by X"; the actor's own
        // view is driven by their edit prompt instead.
        self.broadcast_state_change(record_id, change, &reviewer_name, Some(reviewer_id))
            .await;

        Ok(StartEditOutcome::Started)
    }

    /// Apply the text a reviewer sent for their open edit session.
    pub async fn submit_edited_text(
        &self,
        reviewer_id: &str,
        text: &str,
    ) -> Result<EditSubmitOutcome, QueueError> {
        let Some(session) = self.sessions.lock().get(reviewer_id).cloned() else {
            return Ok(EditSubmitOutcome::NoActiveSession);
        };

        let Some(record) = self.engine.get(&session.record_id) else {
            // Target vanished under the session (cleared or expired).
            self.sessions.lock().remove(reviewer_id);
            return Ok(EditSubmitOutcome::RecordGone);
        };

        let new_text = match session.phase {
            EditPhase::AwaitingManualText => text.to_string(),
            EditPhase::AwaitingAiCorrection => {
                match self.generator.refine(&record.candidate_text, text).await {
                    Ok(refined) => refined,
                    Err(e) => {
                        tracing::error!(
                            record_id = %session.record_id,
                            reviewer_id,
                            "correction generator failed: {e:#}"
                        );
                        return Ok(EditSubmitOutcome::RefineFailed);
                    }
                }
            }
        };

        let Some(updated) =
            self.engine
                .update_candidate_text(&session.record_id, reviewer_id, &new_text)?
        else {
            self.sessions.lock().remove(reviewer_id);
            return Ok(EditSubmitOutcome::RecordGone);
        };

        self.locks.release(&session.record_id, reviewer_id)?;
        self.sessions.lock().remove(reviewer_id);

        let actor_name = self.reviewer_name(reviewer_id).unwrap_or_default();
        self.broadcast_state_change(&session.record_id, StateChange::Reopened, &actor_name, None)
            .await;

        tracing::info!(
            record_id = %session.record_id,
            reviewer_id,
            "edit applied, record reopened for decision"
        );
        Ok(EditSubmitOutcome::Applied(Box::new(updated)))
    }

    /// Abandon the reviewer's open edit session, if any.
    pub async fn cancel_edit(&self, reviewer_id: &str) -> Result<bool, QueueError> {
        let Some(session) = self.sessions.lock().remove(reviewer_id) else {
            return Ok(false);
        };
        self.locks.release(&session.record_id, reviewer_id)?;

        let actor_name = self.reviewer_name(reviewer_id).unwrap_or_default();
        self.broadcast_state_change(&session.record_id, StateChange::Reopened, &actor_name, None)
            .await;
        tracing::info!(record_id = %session.record_id, reviewer_id, "edit cancelled");
        Ok(true)
    }

    /// Release a lock the reviewer holds without going through an
    /// edit session (e.g. after viewing the full record).
    pub async fn release_own_lock(
        &self,
        record_id: &str,
        reviewer_id: &str,
    ) -> Result<bool, QueueError> {
        let released = self.locks.release(record_id, reviewer_id)?;
        if released {
            let mut sessions = self.sessions.lock();
            if sessions
                .get(reviewer_id)
                .is_some_and(|s| s.record_id == record_id)
            {
                sessions.remove(reviewer_id);
            }
            drop(sessions);

            let actor_name = self.reviewer_name(reviewer_id).unwrap_or_default();
            self.broadcast_state_change(record_id, StateChange::Reopened, &actor_name, None)
                .await;
        }
        Ok(released)
    }

    // ── Sweep follow-up ──────────────────────────────────────────

    /// Handle locks the sweep force-released: drop the owner's
    /// session, restore default controls for everyone, and tell the
    /// reviewers (except opt-outs) whose lock timed out.
    pub async fn handle_forced_releases(&self, releases: &[ForcedRelease]) {
        for release in releases {
            self.sessions.lock().remove(&release.owner_id);

            self.broadcast_state_change(
                &release.record_id,
                StateChange::Reopened,
                &release.owner_name,
                None,
            )
            .await;

            let notice = format!(
                "Editing timeout expired for {}.\nRecord {} is available again.",
                release.owner_name, release.record_id
            );
            let opt_outs = self.reminder_opt_outs.lock().clone();
            for reviewer in &self.reviewers {
                if opt_outs.contains(&reviewer.id) {
                    continue;
                }
                if let Err(e) = self.notifier.send(&reviewer.id, &notice, Controls::None).await {
                    tracing::error!(
                        reviewer = %reviewer.id,
                        "failed to deliver timeout notice: {e:#}"
                    );
                }
            }
        }
    }

    /// Handle records the sweep force-expired: drop any displaced
    /// edit session and clean up every transport copy.
    pub async fn handle_expired(&self, expired: &[ExpiredRecord]) {
        for item in expired {
            if let Some(owner_id) = &item.displaced_owner_id {
                self.sessions.lock().remove(owner_id);
            }
            self.sessions
                .lock()
                .retain(|_, session| session.record_id != item.record.id);
            self.cleanup_record_views(&item.record.id).await;
        }
    }

    /// Fan out due reminders. Skips opted-out reviewers; the engine
    /// already guarantees locked records produce no reminders.
    pub async fn deliver_reminders(&self, reminders: &[ReminderNotice]) {
        for notice in reminders {
            let text = format!(
                "{}\nID: {}\nIn queue: {}\nReminder: {}/4\n\nFrom: {}\nQuestion: {}",
                notice.urgency,
                notice.summary.record_id,
                notice.queue_age,
                notice.reminder_count,
                notice.summary.requester_name,
                notice.summary.source_preview,
            );

            let opt_outs = self.reminder_opt_outs.lock().clone();
            let mut sent = 0usize;
            for reviewer in &self.reviewers {
                if opt_outs.contains(&reviewer.id) {
                    continue;
                }
                match self
                    .notifier
                    .send(&reviewer.id, &text, Controls::Reminder)
                    .await
                {
                    Ok(handle) => {
                        // Track the freshest view per reviewer; the
                        // superseded one is deleted, or its stale
                        // controls would outlive the record.
                        let replaced = self
                            .views
                            .lock()
                            .entry(notice.summary.record_id.clone())
                            .or_default()
                            .insert(reviewer.id.clone(), handle);
                        if let Some(old) = replaced {
                            if let Err(e) = self.notifier.remove(&old).await {
                                tracing::warn!(
                                    reviewer = %reviewer.id,
                                    record_id = %notice.summary.record_id,
                                    "failed to remove superseded view: {e:#}"
                                );
                            }
                        }
                        sent += 1;
                    }
                    Err(e) => {
                        tracing::error!(
                            reviewer = %reviewer.id,
                            record_id = %notice.summary.record_id,
                            "failed to deliver reminder: {e:#}"
                        );
                    }
                }
            }
            tracing::info!(
                record_id = %notice.summary.record_id,
                reminder = notice.reminder_count,
                sent,
                "escalating reminder delivered"
            );
        }
    }

    // ── Administration ───────────────────────────────────────────

    /// Bulk clear: empty the pending set, drop every edit session
    /// (their targets vanish), and clean the transport surface.
    pub async fn clear_all_pending(&self) -> Result<usize, QueueError> {
        let count = self.engine.clear_all_pending()?;
        self.sessions.lock().clear();

        let record_ids: Vec<String> = self.views.lock().keys().cloned().collect();
        for record_id in record_ids {
            self.cleanup_record_views(&record_id).await;
        }
        Ok(count)
    }

    /// Mute or unmute reminder notifications for a reviewer.
    pub fn set_reminder_opt_out(&self, reviewer_id: &str, muted: bool) {
        let mut opt_outs = self.reminder_opt_outs.lock();
        if muted {
            opt_outs.insert(reviewer_id.to_string());
        } else {
            opt_outs.remove(reviewer_id);
        }
        tracing::info!(reviewer_id, muted, "reminder preference updated");
    }

    /// The reviewer's open edit session, if any.
    pub fn active_session(&self, reviewer_id: &str) -> Option<ReviewerEditSession> {
        self.sessions.lock().get(reviewer_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::CandidateReply;
    use crate::record::{QueueSnapshot, RecordStatus, SharedState};
    use crate::store::RecordStore;
    use async_trait::async_trait;
    use chrono::Duration;

    struct NullStore;
    impl RecordStore for NullStore {
        fn load(&self) -> Result<QueueSnapshot, QueueError> {
            Ok(QueueSnapshot::default())
        }
        fn save(&self, _snapshot: &QueueSnapshot) -> Result<(), QueueError> {
            Ok(())
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Delivery {
        Sent { reviewer: String, text: String },
        Updated { reviewer: String, text: String },
        Removed { reviewer: String, message_ref: String },
    }

    /// Notifier fake that records deliveries and can fail per reviewer.
    struct FakeNotifier {
        log: Mutex<Vec<Delivery>>,
        unreachable: Mutex<HashSet<String>>,
        next_ref: Mutex<u64>,
    }

    impl FakeNotifier {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                log: Mutex::new(Vec::new()),
                unreachable: Mutex::new(HashSet::new()),
                next_ref: Mutex::new(0),
            })
        }

        fn sends_to(&self, reviewer: &str) -> Vec<String> {
            self.log
                .lock()
                .iter()
                .filter_map(|d| match d {
                    Delivery::Sent { reviewer: r, text } if r == reviewer => Some(text.clone()),
                    _ => None,
                })
                .collect()
        }

        fn updates_to(&self, reviewer: &str) -> Vec<String> {
            self.log
                .lock()
                .iter()
                .filter_map(|d| match d {
                    Delivery::Updated { reviewer: r, text } if r == reviewer => Some(text.clone()),
                    _ => None,
                })
                .collect()
        }

        fn removals(&self) -> usize {
            self.removed_refs().len()
        }

        fn removed_refs(&self) -> Vec<String> {
            self.log
                .lock()
                .iter()
                .filter_map(|d| match d {
                    Delivery::Removed { message_ref, .. } => Some(message_ref.clone()),
                    _ => None,
                })
                .collect()
        }
    }

    #[async_trait]
    impl Notifier for FakeNotifier {
        async fn send(
            &self,
            reviewer_id: &str,
            text: &str,
            _controls: Controls,
        ) -> anyhow::Result<ViewHandle> {
            if self.unreachable.lock().contains(reviewer_id) {
                anyhow::bail!("client unreachable");
            }
            let mut next = self.next_ref.lock();
            *next += 1;
            let handle = ViewHandle {
                reviewer_id: reviewer_id.to_string(),
                message_ref: next.to_string(),
            };
            self.log.lock().push(Delivery::Sent {
                reviewer: reviewer_id.to_string(),
                text: text.to_string(),
            });
            Ok(handle)
        }

        async fn update(
            &self,
            view: &ViewHandle,
            text: &str,
            _controls: Option<Controls>,
        ) -> anyhow::Result<()> {
            if self.unreachable.lock().contains(&view.reviewer_id) {
                anyhow::bail!("client unreachable");
            }
            self.log.lock().push(Delivery::Updated {
                reviewer: view.reviewer_id.clone(),
                text: text.to_string(),
            });
            Ok(())
        }

        async fn remove(&self, view: &ViewHandle) -> anyhow::Result<()> {
            self.log.lock().push(Delivery::Removed {
                reviewer: view.reviewer_id.clone(),
                message_ref: view.message_ref.clone(),
            });
            Ok(())
        }
    }

    /// Generator fake with an on/off refine failure switch.
    struct FakeGenerator {
        refine_fails: Mutex<bool>,
    }

    #[async_trait]
    impl ResponseGenerator for FakeGenerator {
        async fn generate(&self, source_text: &str) -> anyhow::Result<String> {
            Ok(format!("generated: {source_text}"))
        }
        async fn refine(&self, candidate: &str, instruction: &str) -> anyhow::Result<String> {
            if *self.refine_fails.lock() {
                anyhow::bail!("model overloaded");
            }
            Ok(format!("{candidate} [{instruction}]"))
        }
    }

    struct Harness {
        coordinator: ReviewerCoordinator,
        engine: Arc<ModerationEngine>,
        state: SharedState,
        notifier: Arc<FakeNotifier>,
        generator: Arc<FakeGenerator>,
    }

    fn reviewers() -> Vec<ReviewerConfig> {
        vec![
            ReviewerConfig {
                id: "rev-a".into(),
                name: "Anna".into(),
            },
            ReviewerConfig {
                id: "rev-b".into(),
                name: "Boris".into(),
            },
            ReviewerConfig {
                id: "rev-c".into(),
                name: "Clara".into(),
            },
        ]
    }

    fn harness() -> Harness {
        let state: SharedState = Arc::new(Mutex::new(QueueSnapshot::default()));
        let store: Arc<dyn RecordStore> = Arc::new(NullStore);
        let engine = Arc::new(ModerationEngine::new(state.clone(), store.clone(), 24));
        let locks = Arc::new(LockManager::new(state.clone(), store, 600));
        let notifier = FakeNotifier::new();
        let generator = Arc::new(FakeGenerator {
            refine_fails: Mutex::new(false),
        });
        let coordinator = ReviewerCoordinator::new(
            engine.clone(),
            locks,
            notifier.clone(),
            generator.clone(),
            reviewers(),
        );
        Harness {
            coordinator,
            engine,
            state,
            notifier,
            generator,
        }
    }

    fn candidate(source: &str) -> CandidateReply {
        CandidateReply {
            requester_chat: "chat-1".into(),
            requester_user: "user-1".into(),
            requester_name: "Uma".into(),
            source_text: source.into(),
            candidate_text: format!("reply: {source}"),
            source_message_ref: None,
            conversation_label: None,
        }
    }

    #[tokio::test]
    async fn announce_delivers_to_all_even_when_one_is_unreachable() {
        let h = harness();
        let record = h.engine.enqueue(candidate("Hello?")).unwrap();
        h.notifier.unreachable.lock().insert("rev-b".into());

        h.coordinator.announce(&record).await;

        assert_eq!(h.notifier.sends_to("rev-a").len(), 1);
        assert_eq!(h.notifier.sends_to("rev-b").len(), 0);
        assert_eq!(h.notifier.sends_to("rev-c").len(), 1);

        let views = h.coordinator.views.lock();
        let tracked = &views[&record.id];
        assert_eq!(tracked.len(), 2);
        assert!(!tracked.contains_key("rev-b"));
    }

    #[tokio::test]
    async fn start_edit_blocks_second_record_for_same_reviewer() {
        let h = harness();
        let first = h.engine.enqueue(candidate("q1")).unwrap();
        let second = h.engine.enqueue(candidate("q2")).unwrap();

        let started = h
            .coordinator
            .start_edit(&first.id, "rev-a", EditPhase::AwaitingManualText)
            .await
            .unwrap();
        assert_eq!(started, StartEditOutcome::Started);

        let blocked = h
            .coordinator
            .start_edit(&second.id, "rev-a", EditPhase::AwaitingManualText)
            .await
            .unwrap();
        assert_eq!(
            blocked,
            StartEditOutcome::AlreadyEditingOther {
                record_id: first.id.clone()
            }
        );
    }

    #[tokio::test]
    async fn start_edit_reports_current_lock_owner() {
        let h = harness();
        let record = h.engine.enqueue(candidate("q1")).unwrap();

        h.coordinator
            .start_edit(&record.id, "rev-a", EditPhase::AwaitingManualText)
            .await
            .unwrap();

        let denied = h
            .coordinator
            .start_edit(&record.id, "rev-b", EditPhase::AwaitingManualText)
            .await
            .unwrap();
        assert_eq!(
            denied,
            StartEditOutcome::DeniedLocked {
                owner_name: "Anna".into()
            }
        );
    }

    #[tokio::test]
    async fn stale_lock_reclaim_drops_prior_session() {
        let h = harness();
        let record = h.engine.enqueue(candidate("q1")).unwrap();

        h.coordinator
            .start_edit(&record.id, "rev-a", EditPhase::AwaitingManualText)
            .await
            .unwrap();

        // Age the lock past the 600 s timeout.
        {
            let mut state = h.state.lock();
            let lock = state
                .pending
                .get_mut(&record.id)
                .unwrap()
                .lock
                .as_mut()
                .unwrap();
            lock.acquired_at -= Duration::seconds(601);
        }

        let retried = h
            .coordinator
            .start_edit(&record.id, "rev-b", EditPhase::AwaitingManualText)
            .await
            .unwrap();
        assert_eq!(retried, StartEditOutcome::Started);

        assert!(h.coordinator.active_session("rev-a").is_none());
        assert!(h.coordinator.active_session("rev-b").is_some());
    }

    #[tokio::test]
    async fn start_edit_rejects_unlisted_reviewer() {
        let h = harness();
        let record = h.engine.enqueue(candidate("q1")).unwrap();
        let outcome = h
            .coordinator
            .start_edit(&record.id, "intruder", EditPhase::AwaitingManualText)
            .await
            .unwrap();
        assert_eq!(outcome, StartEditOutcome::NotAuthorized);
    }

    #[tokio::test]
    async fn manual_edit_applies_text_and_reopens_record() {
        let h = harness();
        let record = h.engine.enqueue(candidate("q1")).unwrap();
        h.coordinator.announce(&record).await;

        h.coordinator
            .start_edit(&record.id, "rev-a", EditPhase::AwaitingManualText)
            .await
            .unwrap();

        let outcome = h
            .coordinator
            .submit_edited_text("rev-a", "hand-written reply")
            .await
            .unwrap();
        let EditSubmitOutcome::Applied(updated) = outcome else {
            panic!("expected applied edit");
        };
        assert_eq!(updated.candidate_text, "hand-written reply");

        // Lock released, session gone, record decidable again.
        assert_eq!(
            h.state.lock().pending[&record.id].status,
            RecordStatus::Pending
        );
        assert!(h.coordinator.active_session("rev-a").is_none());
    }

    #[tokio::test]
    async fn ai_edit_routes_through_the_generator() {
        let h = harness();
        let record = h.engine.enqueue(candidate("q1")).unwrap();

        h.coordinator
            .start_edit(&record.id, "rev-a", EditPhase::AwaitingAiCorrection)
            .await
            .unwrap();

        let outcome = h
            .coordinator
            .submit_edited_text("rev-a", "make it shorter")
            .await
            .unwrap();
        let EditSubmitOutcome::Applied(updated) = outcome else {
            panic!("expected applied edit");
        };
        assert_eq!(updated.candidate_text, "reply: q1 [make it shorter]");
    }

    #[tokio::test]
    async fn refine_failure_keeps_the_session_open() {
        let h = harness();
        let record = h.engine.enqueue(candidate("q1")).unwrap();

        h.coordinator
            .start_edit(&record.id, "rev-a", EditPhase::AwaitingAiCorrection)
            .await
            .unwrap();
        *h.generator.refine_fails.lock() = true;

        let outcome = h
            .coordinator
            .submit_edited_text("rev-a", "make it shorter")
            .await
            .unwrap();
        assert!(matches!(outcome, EditSubmitOutcome::RefineFailed));

        // Session survives so the reviewer can retry.
        assert!(h.coordinator.active_session("rev-a").is_some());
        assert!(h.state.lock().pending[&record.id].is_locked());

        *h.generator.refine_fails.lock() = false;
        let retry = h
            .coordinator
            .submit_edited_text("rev-a", "make it shorter")
            .await
            .unwrap();
        assert!(matches!(retry, EditSubmitOutcome::Applied(_)));
    }

    #[tokio::test]
    async fn submit_without_session_reports_no_active_session() {
        let h = harness();
        let outcome = h.coordinator.submit_edited_text("rev-a", "text").await.unwrap();
        assert!(matches!(outcome, EditSubmitOutcome::NoActiveSession));
    }

    #[tokio::test]
    async fn cancel_edit_releases_the_lock() {
        let h = harness();
        let record = h.engine.enqueue(candidate("q1")).unwrap();
        h.coordinator
            .start_edit(&record.id, "rev-a", EditPhase::AwaitingManualText)
            .await
            .unwrap();

        assert!(h.coordinator.cancel_edit("rev-a").await.unwrap());
        assert!(!h.state.lock().pending[&record.id].is_locked());
        assert!(h.coordinator.active_session("rev-a").is_none());

        // Second cancel is a no-op.
        assert!(!h.coordinator.cancel_edit("rev-a").await.unwrap());
    }

    #[tokio::test]
    async fn approve_updates_other_views_and_cleans_up() {
        let h = harness();
        let record = h.engine.enqueue(candidate("q1")).unwrap();
        h.coordinator.announce(&record).await;

        let decision = h.coordinator.approve(&record.id, "rev-a").await.unwrap();
        assert!(matches!(decision, Decision::Completed(_)));

        // Every tracked view saw the status update and was removed.
        assert_eq!(h.notifier.updates_to("rev-b"), vec!["Approved by Anna"]);
        assert_eq!(h.notifier.updates_to("rev-c"), vec!["Approved by Anna"]);
        assert_eq!(h.notifier.removals(), 3);
        assert!(h.coordinator.views.lock().is_empty());
    }

    #[tokio::test]
    async fn approve_by_unlisted_reviewer_is_ignored() {
        let h = harness();
        let record = h.engine.enqueue(candidate("q1")).unwrap();

        let decision = h.coordinator.approve(&record.id, "intruder").await.unwrap();
        assert!(matches!(decision, Decision::NotFound));
        assert!(h.engine.get(&record.id).is_some());
    }

    #[tokio::test]
    async fn forced_release_notifies_everyone_except_opt_outs() {
        let h = harness();
        let record = h.engine.enqueue(candidate("q1")).unwrap();
        h.coordinator
            .start_edit(&record.id, "rev-a", EditPhase::AwaitingManualText)
            .await
            .unwrap();
        h.coordinator.set_reminder_opt_out("rev-c", true);

        let releases = vec![ForcedRelease {
            record_id: record.id.clone(),
            owner_id: "rev-a".into(),
            owner_name: "Anna".into(),
        }];
        h.coordinator.handle_forced_releases(&releases).await;

        assert!(h.coordinator.active_session("rev-a").is_none());
        let notice_count = |r: &str| {
            h.notifier
                .sends_to(r)
                .iter()
                .filter(|t| t.contains("Editing timeout expired for Anna"))
                .count()
        };
        assert_eq!(notice_count("rev-a"), 1);
        assert_eq!(notice_count("rev-b"), 1);
        assert_eq!(notice_count("rev-c"), 0);
    }

    #[tokio::test]
    async fn reminders_skip_opted_out_reviewers() {
        let h = harness();
        let record = h.engine.enqueue(candidate("q1")).unwrap();
        h.coordinator.set_reminder_opt_out("rev-b", true);

        let reminders = vec![ReminderNotice {
            summary: RecordSummary::of(&record),
            reminder_count: 2,
            urgency: "Reply has been waiting 2+ hours",
            queue_age: "2h 5m".into(),
        }];
        h.coordinator.deliver_reminders(&reminders).await;

        assert_eq!(h.notifier.sends_to("rev-a").len(), 1);
        assert_eq!(h.notifier.sends_to("rev-b").len(), 0);
        assert_eq!(h.notifier.sends_to("rev-c").len(), 1);
        assert!(h.notifier.sends_to("rev-a")[0].contains("Reminder: 2/4"));
    }

    #[tokio::test]
    async fn reminder_removes_the_view_it_supersedes() {
        let h = harness();
        let record = h.engine.enqueue(candidate("q1")).unwrap();
        h.coordinator.announce(&record).await;

        let mut announce_refs: Vec<String> = h.coordinator.views.lock()[&record.id]
            .values()
            .map(|v| v.message_ref.clone())
            .collect();
        announce_refs.sort();

        h.coordinator
            .deliver_reminders(&[ReminderNotice {
                summary: RecordSummary::of(&record),
                reminder_count: 1,
                urgency: "New reply awaiting review",
                queue_age: "1h 0m".into(),
            }])
            .await;

        // Every announce card was deleted in favor of its reminder.
        let mut removed = h.notifier.removed_refs();
        removed.sort();
        assert_eq!(removed, announce_refs);

        // Terminal cleanup now reaches the live views, so no copy
        // outlives the record with its controls still attached.
        h.coordinator.approve(&record.id, "rev-a").await.unwrap();
        assert!(h.coordinator.views.lock().is_empty());
        assert_eq!(h.notifier.removals(), 6);
    }

    #[tokio::test]
    async fn clear_all_pending_clears_sessions_and_views() {
        let h = harness();
        let mut first_id = None;
        for i in 0..5 {
            let record = h.engine.enqueue(candidate(&format!("q{i}"))).unwrap();
            h.coordinator.announce(&record).await;
            first_id.get_or_insert(record.id);
        }
        let first_id = first_id.unwrap();
        h.coordinator
            .start_edit(&first_id, "rev-a", EditPhase::AwaitingManualText)
            .await
            .unwrap();

        let cleared = h.coordinator.clear_all_pending().await.unwrap();
        assert_eq!(cleared, 5);
        assert!(h.coordinator.active_session("rev-a").is_none());
        assert!(h.coordinator.views.lock().is_empty());
        assert!(matches!(
            h.coordinator.approve(&first_id, "rev-a").await.unwrap(),
            Decision::NotFound
        ));
    }

    #[tokio::test]
    async fn expired_records_drop_sessions_and_views() {
        let h = harness();
        let record = h.engine.enqueue(candidate("q1")).unwrap();
        h.coordinator.announce(&record).await;
        h.coordinator
            .start_edit(&record.id, "rev-a", EditPhase::AwaitingManualText)
            .await
            .unwrap();

        let mut expired_record = record.clone();
        expired_record.finish(RecordStatus::Expired, chrono::Utc::now());
        let expired = vec![ExpiredRecord {
            record: expired_record,
            displaced_owner_id: Some("rev-a".into()),
        }];
        h.coordinator.handle_expired(&expired).await;

        assert!(h.coordinator.active_session("rev-a").is_none());
        assert!(h.coordinator.views.lock().is_empty());
    }

    #[tokio::test]
    async fn broadcast_skips_the_acting_reviewers_own_view() {
        let h = harness();
        let record = h.engine.enqueue(candidate("q1")).unwrap();
        h.coordinator.announce(&record).await;

        h.coordinator
            .start_edit(&record.id, "rev-a", EditPhase::AwaitingAiCorrection)
            .await
            .unwrap();

        // Others see the lock status; the actor's own view is not
        // overwritten by the coordination broadcast.
        assert!(h.notifier.updates_to("rev-a").is_empty());
        assert_eq!(
            h.notifier.updates_to("rev-b"),
            vec!["Being edited by Anna (AI-assisted)"]
        );
        assert_eq!(
            h.notifier.updates_to("rev-c"),
            vec!["Being edited by Anna (AI-assisted)"]
        );
    }
}
