//! Captcha lifecycle for new chat members.
//!
//! Every joining member is muted and shown a four-button color captcha.
//! A challenge ends in exactly one of four ways: solved (correct button),
//! failed (wrong button, member is kicked), expired (sweep loop kicks the
//! member) or dismissed (member left on their own). The response handler
//! and the expiry sweep both consume challenges exclusively through the
//! store's atomic claim, so a challenge can never be resolved twice.
//!
//! Users pressing buttons on a captcha that is not theirs ("meddling") get
//! escalating replies tracked in a TTL cache; once the ladder is exhausted
//! they are temporarily muted.

use crate::config::{CAPTCHA_SWEEP_INTERVAL_SECS, MEDDLING_CACHE_CAPACITY};
use crate::gateway::ChatGateway;
use crate::store::{PendingChallenge, Store, StoreError};
use crate::texts;
use anyhow::Result;
use chrono::Utc;
use moka::future::Cache;
use rand::seq::SliceRandom;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use teloxide::types::{
    ChatId, ChatPermissions, InlineKeyboardButton, InlineKeyboardMarkup, MessageId, UserId,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Prefix of captcha callback data; the option id follows it
pub const CALLBACK_PREFIX: &str = "captcha:";

/// The selectable options: (option id, button label)
const CAPTCHA_OPTIONS: &[(&str, &str)] = &[
    ("red", "🟥"),
    ("yellow", "🟨"),
    ("green", "🟩"),
    ("blue", "🟦"),
];

/// Buttons per keyboard row
const KEYBOARD_ROW_WIDTH: usize = 2;

/// Issues, resolves, expires and dismisses captcha challenges
pub struct CaptchaManager {
    gateway: Arc<dyn ChatGateway>,
    store: Arc<Store>,
    /// Attempt counts keyed by "user:chat:message"; entries evaporate after
    /// the mute duration, which doubles as the escalation decay
    meddling_attempts: Cache<String, u32>,
    challenge_timeout: Duration,
    mute_duration: Duration,
}

impl CaptchaManager {
    /// Create a manager with the given challenge timeout and meddling mute
    /// duration
    #[must_use]
    pub fn new(
        gateway: Arc<dyn ChatGateway>,
        store: Arc<Store>,
        challenge_timeout: Duration,
        mute_duration: Duration,
    ) -> Self {
        let meddling_attempts = Cache::builder()
            .max_capacity(MEDDLING_CACHE_CAPACITY)
            .time_to_live(mute_duration)
            .build();
        Self {
            gateway,
            store,
            meddling_attempts,
            challenge_timeout,
            mute_duration,
        }
    }

    /// Mute a freshly joined member and post their challenge
    ///
    /// The member loses all permissions first, so a failure later in the
    /// sequence leaves them muted rather than unchallenged and writable.
    ///
    /// # Errors
    ///
    /// Returns an error if a platform call or the row insert fails.
    pub async fn issue_challenge(&self, chat: ChatId, user: UserId, mention: &str) -> Result<()> {
        // Claim any challenge left over from a redelivered join so the
        // (chat, user) pair never has two live rows
        if let Some(stale) = self
            .store
            .claim_challenge(chat.0, user.0.cast_signed())
            .await?
        {
            if let Err(e) = self
                .gateway
                .delete_message(chat, MessageId(stale.message_id))
                .await
            {
                error!(
                    "Deleting stale challenge message {} in chat {} failed: {e}",
                    stale.message_id, chat.0
                );
            }
        }

        self.gateway
            .restrict(chat, user, ChatPermissions::empty(), None)
            .await?;

        let (answer_id, keyboard) = build_challenge(&mut rand::thread_rng());
        let text = texts::challenge_text(mention, texts::option_label(answer_id));
        let message_id = self.gateway.send_with_keyboard(chat, &text, keyboard).await?;

        self.store
            .insert_challenge(
                chat.0,
                user.0.cast_signed(),
                message_id.0,
                answer_id,
                Utc::now(),
            )
            .await?;
        info!(
            "Issued challenge in chat {} for user {} (message {})",
            chat.0, user.0, message_id.0
        );
        Ok(())
    }

    /// Handle a captcha button press
    ///
    /// Claims the responder's pending challenge first; if there is none the
    /// press targets someone else's captcha (or one already resolved by the
    /// sweep) and is treated as meddling.
    ///
    /// # Errors
    ///
    /// Returns an error if a platform call or a store operation fails.
    pub async fn resolve_response(
        &self,
        chat: ChatId,
        message: MessageId,
        user: UserId,
        callback_id: &str,
        answer_id: &str,
    ) -> Result<()> {
        let claimed = self
            .store
            .claim_challenge(chat.0, user.0.cast_signed())
            .await?;
        let Some(challenge) = claimed else {
            return self.handle_meddling(chat, message, user, callback_id).await;
        };

        if challenge.answer_id == answer_id {
            self.gateway
                .restrict(chat, user, ChatPermissions::all(), None)
                .await?;
            self.gateway
                .answer_callback(callback_id, texts::SOLVED_REPLY)
                .await?;
            info!("User {} solved the challenge in chat {}", user.0, chat.0);
        } else {
            self.gateway.ban(chat, user).await?;
            self.gateway.unban(chat, user).await?;
            info!(
                "User {} failed the challenge in chat {} and was removed",
                user.0, chat.0
            );
        }

        self.gateway
            .delete_message(chat, MessageId(challenge.message_id))
            .await?;
        Ok(())
    }

    async fn handle_meddling(
        &self,
        chat: ChatId,
        message: MessageId,
        user: UserId,
        callback_id: &str,
    ) -> Result<()> {
        let key = format!("{}:{}:{}", user.0, chat.0, message.0);

        // Single atomic per-key upsert, so concurrent presses never collapse
        // an escalation step. The count is capped one past the ladder; once
        // there it stays put.
        let cap = u32::try_from(texts::MEDDLING_REPLIES.len())
            .unwrap_or(u32::MAX)
            .saturating_add(1);
        let attempt = self
            .meddling_attempts
            .entry(key)
            .and_upsert_with(|current| {
                let prior = current.map(moka::Entry::into_value).unwrap_or(0);
                std::future::ready(prior.saturating_add(1).min(cap))
            })
            .await
            .into_value();

        if let Some(reply) = texts::meddling_reply(attempt) {
            self.gateway.answer_callback(callback_id, reply).await?;
            return Ok(());
        }

        // Escalation exhausted: final reply plus a temporary mute; the
        // counter stays where it is
        self.gateway
            .answer_callback(callback_id, texts::MEDDLING_FINAL_REPLY)
            .await?;
        let until = Utc::now() + self.mute_duration;
        self.gateway
            .restrict(chat, user, ChatPermissions::empty(), Some(until))
            .await?;
        info!(
            "Muted user {} in chat {} for meddling with message {}",
            user.0, chat.0, message.0
        );
        Ok(())
    }

    /// One expiry pass: claim every overdue challenge and expel its member.
    /// Returns the number of claimed challenges. A platform failure for one
    /// row is logged and does not stop the remaining rows.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the claim itself fails.
    pub async fn sweep_expired(&self) -> Result<usize, StoreError> {
        let cutoff = Utc::now() - self.challenge_timeout;
        let expired = self.store.claim_expired_challenges(cutoff).await?;
        let count = expired.len();

        for challenge in expired {
            if let Err(e) = self.expel(&challenge).await {
                error!(
                    "Handling expired challenge for chat {}, user {} failed: {e}",
                    challenge.chat_id, challenge.user_id
                );
            }
        }
        Ok(count)
    }

    async fn expel(&self, challenge: &PendingChallenge) -> Result<()> {
        let chat = ChatId(challenge.chat_id);
        let user = UserId(challenge.user_id.cast_unsigned());
        self.gateway
            .delete_message(chat, MessageId(challenge.message_id))
            .await?;
        self.gateway.ban(chat, user).await?;
        self.gateway.unban(chat, user).await?;
        Ok(())
    }

    /// Expiry sweep loop; exits at the next suspension point once `cancel`
    /// fires
    pub async fn run_sweeper(&self, cancel: CancellationToken) {
        info!("Challenge expiry sweeper started");
        loop {
            match self.sweep_expired().await {
                Ok(0) => {}
                Ok(count) => info!("Expired {count} unsolved challenge(s)"),
                Err(e) => error!("Challenge expiry sweep failed: {e}"),
            }

            // Short fixed sleep to avoid busy-waiting
            tokio::select! {
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(Duration::from_secs(CAPTCHA_SWEEP_INTERVAL_SECS)) => {}
            }
        }
        info!("Challenge expiry sweeper stopped");
    }

    /// Drop the pending challenge of a departing member, if any
    ///
    /// Deletes the challenge message and restores the member's permissions
    /// so a later rejoin does not start muted. No-op when the member has no
    /// pending challenge.
    ///
    /// # Errors
    ///
    /// Returns an error if a platform call or the claim fails.
    pub async fn dismiss(&self, chat: ChatId, user: UserId) -> Result<()> {
        let claimed = self
            .store
            .claim_challenge(chat.0, user.0.cast_signed())
            .await?;
        let Some(challenge) = claimed else {
            return Ok(());
        };

        self.gateway
            .delete_message(chat, MessageId(challenge.message_id))
            .await?;
        self.gateway
            .restrict(chat, user, ChatPermissions::all(), None)
            .await?;
        info!(
            "Dismissed challenge in chat {} for departed user {}",
            chat.0, user.0
        );
        Ok(())
    }

    /// Whether the member currently has a pending challenge
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] on database failure.
    pub async fn has_pending(&self, chat: ChatId, user: UserId) -> Result<bool, StoreError> {
        self.store
            .has_challenge(chat.0, user.0.cast_signed())
            .await
    }
}

/// Build a shuffled challenge keyboard and pick the correct answer.
///
/// The answer is drawn uniformly from every position except the first of
/// the shuffled layout, so the visually first button is never correct.
fn build_challenge<R: Rng>(rng: &mut R) -> (&'static str, InlineKeyboardMarkup) {
    let mut options: Vec<(&'static str, &'static str)> = CAPTCHA_OPTIONS.to_vec();
    options.shuffle(rng);

    let answer_index = rng.gen_range(1..options.len());
    let answer_id = options[answer_index].0;

    let rows = options.chunks(KEYBOARD_ROW_WIDTH).map(|row| {
        row.iter()
            .map(|(id, label)| {
                InlineKeyboardButton::callback((*label).to_string(), format!("{CALLBACK_PREFIX}{id}"))
            })
            .collect::<Vec<_>>()
    });
    (answer_id, InlineKeyboardMarkup::new(rows))
}
