//! Idle-chat engagement scheduling.
//!
//! On a cron cadence the scheduler looks for chats that have been silent
//! past the inactivity threshold and were not serviced within that same
//! window, then sends each one a content item it has not seen before. A
//! chat that has exhausted the whole catalog gets a rate-limited scarcity
//! notice instead.

use crate::catalog::ContentCatalog;
use crate::config::Settings;
use crate::gateway::ChatGateway;
use crate::store::{Store, StoreError};
use crate::texts;
use chrono::{DateTime, Utc};
use cron::Schedule;
use rand::seq::SliceRandom;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use teloxide::types::ChatId;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Next instant the schedule fires after `now`, if any.
///
/// Kept as a pure function so the wake computation is testable without
/// real wall-clock sleeps.
#[must_use]
pub fn next_wake(schedule: &Schedule, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    schedule.after(&now).next()
}

/// Dispatches content to idle chats and records chat activity
pub struct EngagementScheduler {
    gateway: Arc<dyn ChatGateway>,
    store: Arc<Store>,
    catalog: Arc<ContentCatalog>,
    schedule: Schedule,
    inactivity_timeout: Duration,
    scarcity_interval: Duration,
}

impl EngagementScheduler {
    /// Create a scheduler from settings
    ///
    /// # Errors
    ///
    /// Returns an error if the configured cron expression is invalid.
    pub fn new(
        gateway: Arc<dyn ChatGateway>,
        store: Arc<Store>,
        catalog: Arc<ContentCatalog>,
        settings: &Settings,
    ) -> Result<Self, cron::error::Error> {
        let schedule = Schedule::from_str(&settings.dispatch_schedule)?;
        Ok(Self {
            gateway,
            store,
            catalog,
            schedule,
            inactivity_timeout: Duration::from_secs(settings.inactivity_timeout_secs),
            scarcity_interval: Duration::from_secs(settings.scarcity_interval_secs),
        })
    }

    /// Record a qualifying message as chat activity.
    ///
    /// The caller is responsible for qualification (public chat, non-bot
    /// sender, textual content); this just upserts the timestamp.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] on database failure.
    pub async fn record_activity(
        &self,
        chat: ChatId,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.store.record_activity(chat.0, at).await
    }

    /// One scheduler pass: service every idle chat. A failure for one chat
    /// is logged and does not abort the remaining chats.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the idle-chat query itself fails.
    pub async fn tick(&self) -> Result<(), StoreError> {
        let cutoff = Utc::now() - self.inactivity_timeout;
        let idle = self.store.idle_chats(cutoff).await?;

        for chat_id in idle {
            if let Err(e) = self.dispatch_or_notify(ChatId(chat_id)).await {
                error!("Servicing idle chat {chat_id} failed: {e}");
            }
        }
        Ok(())
    }

    /// Send the chat a content item it has not seen, or a rate-limited
    /// scarcity notice when the catalog is exhausted for it
    ///
    /// # Errors
    ///
    /// Returns an error if a platform call or a store operation fails.
    pub async fn dispatch_or_notify(&self, chat: ChatId) -> anyhow::Result<()> {
        let used = self.store.dispatched_hashes(chat.0).await?;
        let unused = self.catalog.unused_for(&used);

        // Bind the pick before awaiting so the thread-local RNG is dropped
        // here and the future stays Send
        let picked = unused.choose(&mut rand::thread_rng()).copied();
        if let Some((hash, item)) = picked {
            self.gateway.send_text(chat, item).await?;
            self.store.insert_dispatch(hash, chat.0, Utc::now()).await?;
            debug!("Dispatched content {hash} to idle chat {}", chat.0);
            return Ok(());
        }

        // Catalog exhausted for this chat; notify at most once per interval
        let cutoff = Utc::now() - self.scarcity_interval;
        if !self.store.scarcity_notified_since(chat.0, cutoff).await? {
            self.gateway
                .send_text(chat, texts::OUT_OF_CONTENT_MESSAGE)
                .await?;
            self.store.insert_scarcity_notice(chat.0, Utc::now()).await?;
            info!("Chat {} has exhausted the content catalog", chat.0);
        }
        Ok(())
    }

    /// Scheduler loop: tick, then sleep until the next cron fire; exits at
    /// the next suspension point once `cancel` fires
    pub async fn run(&self, cancel: CancellationToken) {
        info!("Engagement scheduler started");
        loop {
            if let Err(e) = self.tick().await {
                error!("Engagement tick failed: {e}");
            }

            let now = Utc::now();
            let Some(wake) = next_wake(&self.schedule, now) else {
                error!("Dispatch schedule has no future occurrence, stopping scheduler");
                break;
            };
            let delay = (wake - now).to_std().unwrap_or(Duration::ZERO);

            tokio::select! {
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(delay) => {}
            }
        }
        info!("Engagement scheduler stopped");
    }
}
