//! chat-warden - group chat moderation and engagement bot
//!
//! A Telegram bot that gates new group members behind a visual captcha
//! and keeps idle chats alive by dispatching deduplicated content items.

/// Captcha lifecycle for new chat members
pub mod captcha;
/// Content catalog loading and identity hashing
pub mod catalog;
/// Configuration management
pub mod config;
/// Idle-chat engagement scheduling
pub mod engagement;
/// Platform gateway abstraction over the Telegram API
pub mod gateway;
/// SQLite persistence layer
pub mod store;
/// User-facing message texts
pub mod texts;
