//! replygate daemon entrypoint.
//!
//! Runs the moderation core with logging collaborators so the queue,
//! locks, sweeps, and persistence can be operated and inspected
//! without a transport attached. Real deployments embed the library
//! and supply their own [`Notifier`] and [`ResponseGenerator`].
//!
//! [`Notifier`]: replygate::Notifier
//! [`ResponseGenerator`]: replygate::ResponseGenerator

use anyhow::{Context, Result};
use async_trait::async_trait;
use replygate::traits::{Controls, Notifier, ResponseGenerator, ViewHandle};
use replygate::{Config, FileStore, ModerationContext};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Notifier that writes every delivery to the log instead of a chat
/// transport. View handles are synthetic but stable, so update and
/// remove flows stay observable.
struct LogNotifier {
    next_ref: AtomicU64,
}

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(
        &self,
        reviewer_id: &str,
        text: &str,
        controls: Controls,
    ) -> Result<ViewHandle> {
        let message_ref = self.next_ref.fetch_add(1, Ordering::Relaxed).to_string();
        tracing::info!(reviewer_id, message_ref, ?controls, "deliver:\n{text}");
        Ok(ViewHandle {
            reviewer_id: reviewer_id.to_string(),
            message_ref,
        })
    }

    async fn update(
        &self,
        view: &ViewHandle,
        text: &str,
        controls: Option<Controls>,
    ) -> Result<()> {
        tracing::info!(
            reviewer_id = %view.reviewer_id,
            message_ref = %view.message_ref,
            ?controls,
            "update:\n{text}"
        );
        Ok(())
    }

    async fn remove(&self, view: &ViewHandle) -> Result<()> {
        tracing::info!(
            reviewer_id = %view.reviewer_id,
            message_ref = %view.message_ref,
            "remove view"
        );
        Ok(())
    }
}

/// Placeholder generator for transportless operation.
struct TemplateGenerator;

#[async_trait]
impl ResponseGenerator for TemplateGenerator {
    async fn generate(&self, source_text: &str) -> Result<String> {
        Ok(format!(
            "Thanks for reaching out. We received your message: \"{source_text}\". \
             A team member will follow up shortly."
        ))
    }

    async fn refine(&self, candidate: &str, instruction: &str) -> Result<String> {
        Ok(format!("{candidate}\n\n[revised per: {instruction}]"))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = Config::load(config_path.as_deref())?;
    if config.reviewers.is_empty() {
        tracing::warn!("reviewer allow-list is empty, nobody can moderate");
    }

    let store = Arc::new(FileStore::new(
        config.storage.path.clone(),
        config.storage.max_backups,
    ));
    let notifier = Arc::new(LogNotifier {
        next_ref: AtomicU64::new(1),
    });

    let context = ModerationContext::new(config, store, notifier, Arc::new(TemplateGenerator))
        .context("failed to initialize moderation core")?;
    context.start();

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    context.shutdown().await;
    Ok(())
}
