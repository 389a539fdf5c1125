use chat_warden::captcha::{self, CaptchaManager};
use chat_warden::catalog::ContentCatalog;
use chat_warden::config::Settings;
use chat_warden::engagement::EngagementScheduler;
use chat_warden::gateway::{ChatGateway, TelegramGateway};
use chat_warden::store::Store;
use chat_warden::texts;
use dotenvy::dotenv;
use regex::Regex;
use std::io::{self, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use teloxide::dispatching::UpdateHandler;
use teloxide::prelude::*;
use teloxide::types::{CallbackQuery, ChatMemberUpdated, User};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use tracing_subscriber::{prelude::*, EnvFilter};

/// Regex patterns for redacting the bot token from log output
struct RedactionPatterns {
    token_url: Regex,
    token_bare: Regex,
    token_prefixed: Regex,
}

impl RedactionPatterns {
    /// Initialize all regex patterns
    ///
    /// # Errors
    ///
    /// Returns an error if any regex pattern is invalid
    fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            token_url: Regex::new(r"(https?://[^/]+/bot)([0-9]+:[A-Za-z0-9_-]+)(/['\s]*)")?,
            token_bare: Regex::new(r"([0-9]{8,10}:[A-Za-z0-9_-]{35})")?,
            token_prefixed: Regex::new(r"(bot[0-9]{8,10}:)[A-Za-z0-9_-]+")?,
        })
    }

    fn redact(&self, input: &str) -> String {
        let mut output = input.to_string();
        output = self
            .token_url
            .replace_all(&output, "$1[TELEGRAM_TOKEN]$3")
            .to_string();
        output = self
            .token_bare
            .replace_all(&output, "[TELEGRAM_TOKEN]")
            .to_string();
        output = self
            .token_prefixed
            .replace_all(&output, "$1[TELEGRAM_TOKEN]")
            .to_string();
        output
    }
}

struct RedactingWriter<W: Write> {
    inner: W,
    patterns: Arc<RedactionPatterns>,
}

impl<W: Write> RedactingWriter<W> {
    const fn new(inner: W, patterns: Arc<RedactionPatterns>) -> Self {
        Self { inner, patterns }
    }
}

impl<W: Write> Write for RedactingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let s = String::from_utf8_lossy(buf);
        let redacted = self.patterns.redact(&s);
        self.inner.write_all(redacted.as_bytes())?;
        // We return the original buffer length to satisfy the contract,
        // even if the redacted string length differs.
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

struct RedactingMakeWriter<F> {
    make_inner: F,
    patterns: Arc<RedactionPatterns>,
}

impl<F> RedactingMakeWriter<F> {
    const fn new(make_inner: F, patterns: Arc<RedactionPatterns>) -> Self {
        Self {
            make_inner,
            patterns,
        }
    }
}

impl<'a, F, W> tracing_subscriber::fmt::MakeWriter<'a> for RedactingMakeWriter<F>
where
    F: Fn() -> W + 'static,
    W: Write,
{
    type Writer = RedactingWriter<W>;

    fn make_writer(&'a self) -> Self::Writer {
        RedactingWriter::new((self.make_inner)(), self.patterns.clone())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load .env file
    dotenv().ok();

    // Initialize redaction patterns early (before logging)
    let patterns = Arc::new(RedactionPatterns::new().map_err(|e| {
        eprintln!("Failed to compile regex patterns: {e}");
        e
    })?);

    // Setup logging with token redaction
    init_logging(patterns);

    info!("Starting chat-warden...");

    let settings = init_settings();
    let store = init_store(&settings);
    let catalog = init_catalog(&settings);

    let bot = Bot::new(settings.telegram_token.clone());
    let gateway: Arc<dyn ChatGateway> = Arc::new(TelegramGateway::new(bot.clone()));

    let captcha_manager = Arc::new(CaptchaManager::new(
        gateway.clone(),
        store.clone(),
        Duration::from_secs(settings.captcha_timeout_secs),
        Duration::from_secs(settings.meddling_mute_secs),
    ));
    let scheduler = init_scheduler(gateway.clone(), store, catalog, &settings);

    // Both background loops run until the shutdown token fires
    let cancel = CancellationToken::new();
    let sweeper_task = {
        let manager = captcha_manager.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { manager.run_sweeper(cancel).await })
    };
    let scheduler_task = {
        let scheduler = scheduler.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { scheduler.run(cancel).await })
    };

    info!("Bot is running...");

    Dispatcher::builder(bot, setup_handler())
        .dependencies(dptree::deps![gateway, captcha_manager, scheduler])
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;

    // Let both loops exit at their next suspension point
    cancel.cancel();
    let _ = tokio::join!(sweeper_task, scheduler_task);

    Ok(())
}

fn init_logging(patterns: Arc<RedactionPatterns>) {
    let make_writer = RedactingMakeWriter::new(io::stderr, patterns);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(make_writer))
        .init();
}

fn init_settings() -> Settings {
    match Settings::new() {
        Ok(s) => {
            info!("Configuration loaded successfully.");
            s
        }
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    }
}

fn init_store(settings: &Settings) -> Arc<Store> {
    match Store::open(Path::new(&settings.database_path)) {
        Ok(store) => {
            info!("Database opened at {}", settings.database_path);
            Arc::new(store)
        }
        Err(e) => {
            error!("Failed to open database {}: {}", settings.database_path, e);
            std::process::exit(1);
        }
    }
}

fn init_catalog(settings: &Settings) -> Arc<ContentCatalog> {
    match ContentCatalog::load(Path::new(&settings.content_path)) {
        Ok(catalog) => {
            info!(
                "Content catalog loaded from {} ({} items)",
                settings.content_path,
                catalog.len()
            );
            Arc::new(catalog)
        }
        Err(e) => {
            error!("Failed to load content catalog: {}", e);
            std::process::exit(1);
        }
    }
}

fn init_scheduler(
    gateway: Arc<dyn ChatGateway>,
    store: Arc<Store>,
    catalog: Arc<ContentCatalog>,
    settings: &Settings,
) -> Arc<EngagementScheduler> {
    match EngagementScheduler::new(gateway, store, catalog, settings) {
        Ok(scheduler) => Arc::new(scheduler),
        Err(e) => {
            error!(
                "Invalid dispatch schedule '{}': {}",
                settings.dispatch_schedule, e
            );
            std::process::exit(1);
        }
    }
}

fn setup_handler() -> UpdateHandler<teloxide::RequestError> {
    dptree::entry()
        .branch(Update::filter_chat_member().endpoint(handle_chat_member))
        .branch(
            Update::filter_callback_query()
                .filter(|q: CallbackQuery| {
                    q.data
                        .as_deref()
                        .is_some_and(|data| data.starts_with(captcha::CALLBACK_PREFIX))
                })
                .endpoint(handle_captcha_callback),
        )
        .branch(Update::filter_message().endpoint(handle_message))
}

fn mention_of(user: &User) -> String {
    user.mention().unwrap_or_else(|| user.full_name())
}

async fn handle_chat_member(
    update: ChatMemberUpdated,
    manager: Arc<CaptchaManager>,
    gateway: Arc<dyn ChatGateway>,
) -> Result<(), teloxide::RequestError> {
    let was_present = update.old_chat_member.is_present();
    let is_present = update.new_chat_member.is_present();

    if !was_present && is_present {
        let user = &update.new_chat_member.user;
        if let Err(e) = manager
            .issue_challenge(update.chat.id, user.id, &mention_of(user))
            .await
        {
            error!(
                "Issuing challenge in chat {} for user {} failed: {e}",
                update.chat.id, user.id
            );
        }
    } else if was_present && !is_present {
        handle_departure(&update, &manager, gateway.as_ref()).await;
    }

    respond(())
}

async fn handle_departure(
    update: &ChatMemberUpdated,
    manager: &CaptchaManager,
    gateway: &dyn ChatGateway,
) {
    let user = &update.old_chat_member.user;
    let kicked = update.new_chat_member.is_banned();

    // Voluntary departures of verified members get a goodbye; kicked users
    // and members who never solved their captcha do not
    match manager.has_pending(update.chat.id, user.id).await {
        Ok(false) if !kicked => {
            if let Err(e) = gateway
                .send_text(update.chat.id, &texts::goodbye_text(&mention_of(user)))
                .await
            {
                error!("Sending goodbye to chat {} failed: {e}", update.chat.id);
            }
        }
        Ok(_) => {}
        Err(e) => error!(
            "Checking pending challenge in chat {} failed: {e}",
            update.chat.id
        ),
    }

    if let Err(e) = manager.dismiss(update.chat.id, user.id).await {
        error!(
            "Dismissing challenge in chat {} for user {} failed: {e}",
            update.chat.id, user.id
        );
    }
}

async fn handle_captcha_callback(
    q: CallbackQuery,
    manager: Arc<CaptchaManager>,
) -> Result<(), teloxide::RequestError> {
    if let Err(e) = process_captcha_callback(&q, &manager).await {
        error!("Captcha callback error: {e}");
    }
    respond(())
}

async fn process_captcha_callback(
    q: &CallbackQuery,
    manager: &CaptchaManager,
) -> anyhow::Result<()> {
    let Some(data) = q.data.as_deref() else {
        return Ok(());
    };
    let Some(answer_id) = data.strip_prefix(captcha::CALLBACK_PREFIX) else {
        return Ok(());
    };

    // A captcha callback always originates from a challenge message we sent;
    // anything else is a contract violation, not user input
    let message = q
        .message
        .as_ref()
        .ok_or_else(|| anyhow::anyhow!("Captcha callback without an originating message"))?;

    manager
        .resolve_response(message.chat().id, message.id(), q.from.id, &q.id.0, answer_id)
        .await
}

async fn handle_message(
    bot: Bot,
    msg: Message,
    scheduler: Arc<EngagementScheduler>,
) -> Result<(), teloxide::RequestError> {
    // Delete the platform's join/leave service messages; the bot posts its
    // own flow for membership changes
    if msg.new_chat_members().is_some() || msg.left_chat_member().is_some() {
        if let Err(e) = bot.delete_message(msg.chat.id, msg.id).await {
            debug!("Deleting service message in chat {} failed: {e}", msg.chat.id);
        }
        return respond(());
    }

    if is_qualifying(&msg) {
        if let Err(e) = scheduler.record_activity(msg.chat.id, msg.date).await {
            error!("Recording activity for chat {} failed: {e}", msg.chat.id);
        }
    }

    respond(())
}

/// A message counts as chat activity only when it is textual, sent by a
/// human, and posted in a group chat
fn is_qualifying(msg: &Message) -> bool {
    !msg.chat.is_private()
        && msg.from.as_ref().is_some_and(|user| !user.is_bot)
        && msg.text().is_some()
}
