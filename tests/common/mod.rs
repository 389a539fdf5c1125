#![allow(dead_code)]

use anyhow::{bail, Result};
use async_trait::async_trait;
use chat_warden::gateway::ChatGateway;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use teloxide::types::{ChatId, ChatPermissions, InlineKeyboardMarkup, MessageId, UserId};
use tokio::sync::Mutex;

/// One recorded outbound platform operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayCall {
    SendText {
        chat: i64,
        text: String,
    },
    SendKeyboard {
        chat: i64,
        text: String,
    },
    Restrict {
        chat: i64,
        user: u64,
        writable: bool,
        timed: bool,
    },
    Ban {
        chat: i64,
        user: u64,
    },
    Unban {
        chat: i64,
        user: u64,
    },
    DeleteMessage {
        chat: i64,
        message: i32,
    },
    AnswerCallback {
        callback_id: String,
        text: String,
    },
}

/// In-memory gateway that records every call and hands out message ids
pub struct MockGateway {
    calls: Mutex<Vec<GatewayCall>>,
    next_message_id: AtomicI32,
    /// When set, `delete_message` fails; used to check per-row error
    /// tolerance in batch paths
    pub fail_deletes: AtomicBool,
}

impl MockGateway {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            next_message_id: AtomicI32::new(1000),
            fail_deletes: AtomicBool::new(false),
        }
    }

    pub async fn calls(&self) -> Vec<GatewayCall> {
        self.calls.lock().await.clone()
    }

    pub async fn count(&self, predicate: impl Fn(&GatewayCall) -> bool) -> usize {
        self.calls.lock().await.iter().filter(|c| predicate(c)).count()
    }

    async fn record(&self, call: GatewayCall) {
        self.calls.lock().await.push(call);
    }
}

#[async_trait]
impl ChatGateway for MockGateway {
    async fn send_text(&self, chat: ChatId, text: &str) -> Result<MessageId> {
        self.record(GatewayCall::SendText {
            chat: chat.0,
            text: text.to_string(),
        })
        .await;
        Ok(MessageId(self.next_message_id.fetch_add(1, Ordering::SeqCst)))
    }

    async fn send_with_keyboard(
        &self,
        chat: ChatId,
        text: &str,
        _keyboard: InlineKeyboardMarkup,
    ) -> Result<MessageId> {
        self.record(GatewayCall::SendKeyboard {
            chat: chat.0,
            text: text.to_string(),
        })
        .await;
        Ok(MessageId(self.next_message_id.fetch_add(1, Ordering::SeqCst)))
    }

    async fn restrict(
        &self,
        chat: ChatId,
        user: UserId,
        permissions: ChatPermissions,
        until: Option<DateTime<Utc>>,
    ) -> Result<()> {
        self.record(GatewayCall::Restrict {
            chat: chat.0,
            user: user.0,
            writable: !permissions.is_empty(),
            timed: until.is_some(),
        })
        .await;
        Ok(())
    }

    async fn ban(&self, chat: ChatId, user: UserId) -> Result<()> {
        self.record(GatewayCall::Ban {
            chat: chat.0,
            user: user.0,
        })
        .await;
        Ok(())
    }

    async fn unban(&self, chat: ChatId, user: UserId) -> Result<()> {
        self.record(GatewayCall::Unban {
            chat: chat.0,
            user: user.0,
        })
        .await;
        Ok(())
    }

    async fn delete_message(&self, chat: ChatId, message: MessageId) -> Result<()> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            bail!("injected delete failure");
        }
        self.record(GatewayCall::DeleteMessage {
            chat: chat.0,
            message: message.0,
        })
        .await;
        Ok(())
    }

    async fn answer_callback(&self, callback_id: &str, text: &str) -> Result<()> {
        self.record(GatewayCall::AnswerCallback {
            callback_id: callback_id.to_string(),
            text: text.to_string(),
        })
        .await;
        Ok(())
    }
}
