//! replygate — a moderation queue for AI-generated replies.
//!
//! Every generated reply is held as a pending record until a human
//! reviewer approves, rejects, or edits it. The crate provides the
//! coordination core: a priority-fair intake queue, a durable record
//! store with rolling backups, single-owner editing locks with
//! timeout recovery, the queue engine (decisions, expiry, escalating
//! reminders), and a coordinator that keeps every reviewer's view of
//! a record in sync.
//!
//! Transport and model integrations plug in through the [`Notifier`]
//! and [`ResponseGenerator`] traits.
//!
//! [`Notifier`]: traits::Notifier
//! [`ResponseGenerator`]: traits::ResponseGenerator

pub mod config;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod intake;
pub mod lock;
pub mod record;
pub mod runtime;
pub mod store;
pub mod traits;

pub use config::Config;
pub use coordinator::{EditPhase, ReviewerCoordinator, StartEditOutcome};
pub use engine::{CandidateReply, Decision, ModerationEngine, SweepOutcome};
pub use error::QueueError;
pub use intake::{IntakeQueue, IntakeRequest};
pub use lock::{AcquireOutcome, LockManager};
pub use record::{ModerationRecord, QueueSnapshot, QueueStatistics, RecordStatus};
pub use runtime::ModerationContext;
pub use store::{FileStore, RecordStore};
pub use traits::{Controls, Notifier, ResponseGenerator, ReviewAction, ReviewCommand};
