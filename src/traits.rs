//! Trait seams for the moderation core's external collaborators.
//!
//! The core never talks to a chat transport or a language model
//! directly: reviewer-facing delivery goes through [`Notifier`], and
//! candidate-reply generation goes through [`ResponseGenerator`].
//! Concrete implementations (Telegram, OpenAI, test fakes) live
//! outside this crate.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::record::{preview, ModerationRecord};

// ── Reviewer-facing view handles ─────────────────────────────────

/// Opaque handle to one transport-level copy of a record shown to
/// one reviewer. Used to edit or delete that specific view later.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewHandle {
    /// Reviewer the view was delivered to.
    pub reviewer_id: String,
    /// Transport-specific message reference (e.g. a chat message id).
    pub message_ref: String,
}

/// Which interactive controls a delivered view should carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Controls {
    /// Full moderation set: approve / reject / AI edit / manual edit.
    Moderation,
    /// Reduced reminder set: approve / reject / AI edit.
    Reminder,
    /// No interactive controls (plain notice or terminal state).
    None,
}

// ── Record summary ───────────────────────────────────────────────

/// Compact, display-ready projection of a [`ModerationRecord`] for
/// broadcasting to reviewers.
#[derive(Debug, Clone)]
pub struct RecordSummary {
    pub record_id: String,
    pub conversation_label: String,
    pub requester_name: String,
    pub source_preview: String,
    pub candidate_preview: String,
}

impl RecordSummary {
    pub fn of(record: &ModerationRecord) -> Self {
        Self {
            record_id: record.id.clone(),
            conversation_label: record
                .conversation_label
                .clone()
                .unwrap_or_else(|| "direct message".to_string()),
            requester_name: record.requester_name.clone(),
            source_preview: preview(&record.source_text),
            candidate_preview: preview(&record.candidate_text),
        }
    }

    /// Render the standard multi-line review card.
    pub fn render(&self) -> String {
        format!(
            "ID: {}\nChat: {}\nFrom: {}\nQuestion: {}\nReply: {}",
            self.record_id,
            self.conversation_label,
            self.requester_name,
            self.source_preview,
            self.candidate_preview
        )
    }
}

// ── Review commands ──────────────────────────────────────────────

/// Action a reviewer can take on a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewAction {
    Approve,
    Reject,
    EditAi,
    EditManual,
    ShowFull,
    CancelEdit,
}

impl ReviewAction {
    pub fn label(self) -> &'static str {
        match self {
            Self::Approve => "approve",
            Self::Reject => "reject",
            Self::EditAi => "edit_ai",
            Self::EditManual => "edit_manual",
            Self::ShowFull => "show_full",
            Self::CancelEdit => "cancel_edit",
        }
    }

    fn from_label(s: &str) -> Option<Self> {
        match s {
            "approve" => Some(Self::Approve),
            "reject" => Some(Self::Reject),
            "edit_ai" => Some(Self::EditAi),
            "edit_manual" => Some(Self::EditManual),
            "show_full" => Some(Self::ShowFull),
            "cancel_edit" => Some(Self::CancelEdit),
            _ => None,
        }
    }
}

/// A structured reviewer command, decoded exactly once at the
/// transport boundary instead of re-parsing action strings downstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReviewCommand {
    pub action: ReviewAction,
    pub record_id: String,
}

impl ReviewCommand {
    pub fn new(action: ReviewAction, record_id: impl Into<String>) -> Self {
        Self {
            action,
            record_id: record_id.into(),
        }
    }

    /// Wire encoding used in transport callback payloads.
    pub fn encode(&self) -> String {
        format!("{}:{}", self.action.label(), self.record_id)
    }

    /// Decode a callback payload. Returns `None` for anything that is
    /// not a known `action:record_id` pair.
    pub fn decode(payload: &str) -> Option<Self> {
        let (action, record_id) = payload.split_once(':')?;
        if record_id.is_empty() {
            return None;
        }
        Some(Self {
            action: ReviewAction::from_label(action)?,
            record_id: record_id.to_string(),
        })
    }
}

// ── Collaborator traits ──────────────────────────────────────────

/// Reviewer-facing transport. Delivery is best-effort per target:
/// the core never assumes every recipient is reachable.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver a new message to one reviewer, returning the handle
    /// needed to update or remove that view later.
    async fn send(
        &self,
        reviewer_id: &str,
        text: &str,
        controls: Controls,
    ) -> anyhow::Result<ViewHandle>;

    /// Replace the text (and optionally the controls) of an existing view.
    async fn update(
        &self,
        view: &ViewHandle,
        text: &str,
        controls: Option<Controls>,
    ) -> anyhow::Result<()>;

    /// Delete a view from the transport surface.
    async fn remove(&self, view: &ViewHandle) -> anyhow::Result<()>;
}

/// Language-generation collaborator.
#[async_trait]
pub trait ResponseGenerator: Send + Sync {
    /// Produce a candidate reply for an incoming question.
    async fn generate(&self, source_text: &str) -> anyhow::Result<String>;

    /// Rewrite an existing candidate according to a reviewer's
    /// correction instruction (the AI-assisted edit flow).
    async fn refine(&self, candidate: &str, instruction: &str) -> anyhow::Result<String>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_round_trips_through_wire_encoding() {
        let cmd = ReviewCommand::new(ReviewAction::EditManual, "a1b2c3d4");
        let decoded = ReviewCommand::decode(&cmd.encode()).unwrap();
        assert_eq!(decoded, cmd);
    }

    #[test]
    fn decode_rejects_malformed_payloads() {
        assert!(ReviewCommand::decode("approve").is_none());
        assert!(ReviewCommand::decode("approve:").is_none());
        assert!(ReviewCommand::decode("launch_missiles:a1b2").is_none());
        assert!(ReviewCommand::decode("").is_none());
    }

    #[test]
    fn decode_keeps_colons_inside_record_id() {
        let decoded = ReviewCommand::decode("reject:id:with:colons").unwrap();
        assert_eq!(decoded.record_id, "id:with:colons");
    }
}
