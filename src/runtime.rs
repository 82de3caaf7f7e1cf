//! Wires the moderation core together and drives its background loops.
//!
//! [`ModerationContext`] owns the shared queue state, the engine, the
//! lock manager, the reviewer coordinator, and the intake pool. Two
//! periodic loops run alongside the intake workers: a lock sweep that
//! force-releases abandoned editing locks, and a queue sweep that
//! expires overdue records and fans out escalating reminders.

use crate::config::Config;
use crate::coordinator::ReviewerCoordinator;
use crate::engine::{CandidateReply, ModerationEngine};
use crate::error::QueueError;
use crate::intake::{IntakeHandler, IntakeQueue, IntakeRequest};
use crate::lock::LockManager;
use crate::record::SharedState;
use crate::store::RecordStore;
use crate::traits::{Notifier, ResponseGenerator};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

// ── Intake handler ───────────────────────────────────────────────

/// What a claimed intake request goes through: generate a candidate
/// reply, enqueue it as a pending record, broadcast it to reviewers.
struct GenerationHandler {
    engine: Arc<ModerationEngine>,
    coordinator: Arc<ReviewerCoordinator>,
    generator: Arc<dyn ResponseGenerator>,
}

#[async_trait]
impl IntakeHandler for GenerationHandler {
    async fn handle(&self, request: IntakeRequest) -> anyhow::Result<()> {
        let candidate_text = self.generator.generate(&request.source_text).await?;

        let record = self.engine.enqueue(CandidateReply {
            requester_chat: request.requester_chat,
            requester_user: request.requester_user,
            requester_name: request.requester_name,
            source_text: request.source_text,
            candidate_text,
            source_message_ref: request.source_message_ref,
            conversation_label: request.conversation_label,
        })?;

        self.coordinator.announce(&record).await;
        Ok(())
    }
}

// ── Context ──────────────────────────────────────────────────────

pub struct ModerationContext {
    pub config: Config,
    pub engine: Arc<ModerationEngine>,
    pub locks: Arc<LockManager>,
    pub coordinator: Arc<ReviewerCoordinator>,
    pub intake: Arc<IntakeQueue>,
    generator: Arc<dyn ResponseGenerator>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl ModerationContext {
    /// Build the full core from its collaborators, recovering queue
    /// state from the store.
    pub fn new(
        config: Config,
        store: Arc<dyn RecordStore>,
        notifier: Arc<dyn Notifier>,
        generator: Arc<dyn ResponseGenerator>,
    ) -> Result<Self, QueueError> {
        let snapshot = store.load()?;
        let state: SharedState = Arc::new(Mutex::new(snapshot));

        let engine = Arc::new(ModerationEngine::new(
            state.clone(),
            store.clone(),
            config.queue.expiry_hours,
        ));
        let locks = Arc::new(LockManager::new(
            state,
            store,
            config.locking.timeout_secs,
        ));
        let coordinator = Arc::new(ReviewerCoordinator::new(
            engine.clone(),
            locks.clone(),
            notifier,
            generator.clone(),
            config.reviewers.clone(),
        ));

        Ok(Self {
            config,
            engine,
            locks,
            coordinator,
            intake: Arc::new(IntakeQueue::new()),
            generator,
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Start the intake workers and both sweep loops.
    pub fn start(&self) {
        let handler = Arc::new(GenerationHandler {
            engine: self.engine.clone(),
            coordinator: self.coordinator.clone(),
            generator: self.generator.clone(),
        });
        self.intake.run_workers(self.config.intake.workers, handler);

        let mut tasks = self.tasks.lock();
        tasks.push(self.spawn_lock_sweep());
        tasks.push(self.spawn_queue_sweep());
        tracing::info!(
            reviewers = self.config.reviewers.len(),
            lock_sweep_secs = self.config.locking.sweep_secs,
            queue_sweep_secs = self.config.queue.sweep_secs,
            "moderation core running"
        );
    }

    fn spawn_lock_sweep(&self) -> tokio::task::JoinHandle<()> {
        let locks = self.locks.clone();
        let coordinator = self.coordinator.clone();
        let cancel = self.cancel.clone();
        let period = Duration::from_secs(self.config.locking.sweep_secs);

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {}
                }
                match locks.sweep_stale() {
                    Ok(released) if !released.is_empty() => {
                        coordinator.handle_forced_releases(&released).await;
                    }
                    Ok(_) => {}
                    Err(e) => tracing::error!("lock sweep failed: {e}"),
                }
            }
            tracing::debug!("lock sweep loop stopped");
        })
    }

    fn spawn_queue_sweep(&self) -> tokio::task::JoinHandle<()> {
        let engine = self.engine.clone();
        let coordinator = self.coordinator.clone();
        let cancel = self.cancel.clone();
        let period = Duration::from_secs(self.config.queue.sweep_secs);

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {}
                }
                match engine.sweep() {
                    Ok(outcome) if !outcome.is_empty() => {
                        coordinator.handle_expired(&outcome.expired).await;
                        coordinator.deliver_reminders(&outcome.reminders).await;
                    }
                    Ok(_) => {}
                    Err(e) => tracing::error!("queue sweep failed: {e}"),
                }
            }
            tracing::debug!("queue sweep loop stopped");
        })
    }

    /// Graceful shutdown: drain in-flight intake work, stop the sweep
    /// loops, and persist the final state.
    pub async fn shutdown(&self) {
        tracing::info!("shutting down moderation core");
        self.cancel.cancel();
        self.intake.shutdown().await;

        let tasks: Vec<_> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!("background task panicked during shutdown: {e}");
            }
        }

        if let Err(e) = self.engine.persist() {
            tracing::error!("failed to persist state on shutdown: {e}");
        }
        tracing::info!("moderation core stopped");
    }
}
