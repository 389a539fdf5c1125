//! Platform gateway abstraction over the Telegram API.
//!
//! The captcha and engagement components only ever talk to the platform
//! through [`ChatGateway`], so tests can swap in a recording mock while
//! production uses [`TelegramGateway`] wrapping a `teloxide::Bot`.
//!
//! Calls are never retried here: a failed call is reported to the caller,
//! which logs it and abandons that chat/user's action for the current tick.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use teloxide::prelude::*;
use teloxide::types::{
    CallbackQueryId, ChatId, ChatPermissions, InlineKeyboardMarkup, MessageId, UserId,
};
use teloxide::{ApiError, RequestError};
use tracing::debug;

/// Outbound platform operations used by the moderation flows
#[async_trait]
pub trait ChatGateway: Send + Sync {
    /// Send a plain text message, returning the new message's id
    async fn send_text(&self, chat: ChatId, text: &str) -> Result<MessageId>;

    /// Send a text message with an inline keyboard attached
    async fn send_with_keyboard(
        &self,
        chat: ChatId,
        text: &str,
        keyboard: InlineKeyboardMarkup,
    ) -> Result<MessageId>;

    /// Replace a member's permission set, optionally only until a deadline
    async fn restrict(
        &self,
        chat: ChatId,
        user: UserId,
        permissions: ChatPermissions,
        until: Option<DateTime<Utc>>,
    ) -> Result<()>;

    /// Ban a member. Paired with [`ChatGateway::unban`] this acts as an
    /// immediate kick rather than a permanent ban.
    async fn ban(&self, chat: ChatId, user: UserId) -> Result<()>;

    /// Lift a ban so the member may rejoin
    async fn unban(&self, chat: ChatId, user: UserId) -> Result<()>;

    /// Delete a message. Must be safe to call on an already-deleted message.
    async fn delete_message(&self, chat: ChatId, message: MessageId) -> Result<()>;

    /// Answer a callback query with a short notification text
    async fn answer_callback(&self, callback_id: &str, text: &str) -> Result<()>;
}

/// Production gateway backed by the Telegram Bot API
pub struct TelegramGateway {
    bot: Bot,
}

impl TelegramGateway {
    /// Wrap a bot handle
    #[must_use]
    pub const fn new(bot: Bot) -> Self {
        Self { bot }
    }
}

#[async_trait]
impl ChatGateway for TelegramGateway {
    async fn send_text(&self, chat: ChatId, text: &str) -> Result<MessageId> {
        let message = self
            .bot
            .send_message(chat, text)
            .await
            .map_err(|e| anyhow!("Telegram send error: {e}"))?;
        Ok(message.id)
    }

    async fn send_with_keyboard(
        &self,
        chat: ChatId,
        text: &str,
        keyboard: InlineKeyboardMarkup,
    ) -> Result<MessageId> {
        let message = self
            .bot
            .send_message(chat, text)
            .reply_markup(keyboard)
            .await
            .map_err(|e| anyhow!("Telegram send error: {e}"))?;
        Ok(message.id)
    }

    async fn restrict(
        &self,
        chat: ChatId,
        user: UserId,
        permissions: ChatPermissions,
        until: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let mut request = self.bot.restrict_chat_member(chat, user, permissions);
        if let Some(until) = until {
            request = request.until_date(until);
        }
        request
            .await
            .map_err(|e| anyhow!("Telegram restrict error: {e}"))?;
        Ok(())
    }

    async fn ban(&self, chat: ChatId, user: UserId) -> Result<()> {
        self.bot
            .ban_chat_member(chat, user)
            .await
            .map_err(|e| anyhow!("Telegram ban error: {e}"))?;
        Ok(())
    }

    async fn unban(&self, chat: ChatId, user: UserId) -> Result<()> {
        self.bot
            .unban_chat_member(chat, user)
            .await
            .map_err(|e| anyhow!("Telegram unban error: {e}"))?;
        Ok(())
    }

    async fn delete_message(&self, chat: ChatId, message: MessageId) -> Result<()> {
        match self.bot.delete_message(chat, message).await {
            Ok(_) => Ok(()),
            // The message is already gone; nothing left to do
            Err(RequestError::Api(ApiError::MessageToDeleteNotFound)) => {
                debug!("Message {} in chat {} was already deleted", message.0, chat.0);
                Ok(())
            }
            Err(e) => Err(anyhow!("Telegram delete error: {e}")),
        }
    }

    async fn answer_callback(&self, callback_id: &str, text: &str) -> Result<()> {
        self.bot
            .answer_callback_query(CallbackQueryId(callback_id.to_owned()))
            .text(text)
            .await
            .map_err(|e| anyhow!("Telegram callback answer error: {e}"))?;
        Ok(())
    }
}
