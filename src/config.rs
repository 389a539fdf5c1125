//! Configuration and settings management
//!
//! Loads settings from environment variables and defines process constants.

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};

/// Application settings loaded from environment variables
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Settings {
    /// Telegram Bot API token
    pub telegram_token: String,

    /// Path to the SQLite database file
    #[serde(default = "default_database_path")]
    pub database_path: String,

    /// Path to the content catalog file (items separated by `***`)
    #[serde(default = "default_content_path")]
    pub content_path: String,

    /// Seconds of silence after which a chat counts as idle
    #[serde(default = "default_inactivity_timeout_secs")]
    pub inactivity_timeout_secs: u64,

    /// Cron expression (seconds-resolution) for the engagement tick
    #[serde(default = "default_dispatch_schedule")]
    pub dispatch_schedule: String,

    /// Minimum seconds between "out of content" notices per chat
    #[serde(default = "default_scarcity_interval_secs")]
    pub scarcity_interval_secs: u64,

    /// Seconds a new member has to solve the captcha
    #[serde(default = "default_captcha_timeout_secs")]
    pub captcha_timeout_secs: u64,

    /// Mute duration applied when meddling escalation is exhausted
    #[serde(default = "default_meddling_mute_secs")]
    pub meddling_mute_secs: u64,
}

fn default_database_path() -> String {
    "warden.db".to_string()
}

fn default_content_path() -> String {
    "content.txt".to_string()
}

const fn default_inactivity_timeout_secs() -> u64 {
    86_400 // one day of silence
}

fn default_dispatch_schedule() -> String {
    "0 0 12 * * *".to_string()
}

const fn default_scarcity_interval_secs() -> u64 {
    604_800 // one week
}

const fn default_captcha_timeout_secs() -> u64 {
    90
}

const fn default_meddling_mute_secs() -> u64 {
    600
}

impl Settings {
    /// Create new settings by loading from environment and files
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if loading fails.
    pub fn new() -> Result<Self, ConfigError> {
        let run_mode = std::env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let s = Config::builder()
            // Start off by merging in the "default" configuration file
            .add_source(File::with_name("config/default").required(false))
            // Add in the current environment file
            .add_source(File::with_name(&format!("config/{run_mode}")).required(false))
            // Add in a local configuration file
            // This file shouldn't be checked into git
            .add_source(File::with_name("config/local").required(false))
            // Settings from environment variables directly.
            // Environment::default() auto-converts UPPER_SNAKE_CASE to snake_case;
            // try_parsing lets numeric values come from env strings;
            // ignore_empty treats empty env vars as unset
            .add_source(Environment::default().try_parsing(true).ignore_empty(true))
            .build()?;

        s.try_deserialize()
    }
}

/// Seconds between iterations of the captcha expiry sweep
pub const CAPTCHA_SWEEP_INTERVAL_SECS: u64 = 1;

/// Maximum number of tracked meddling counters
pub const MEDDLING_CACHE_CAPACITY: u64 = 1024;

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    // Single env test to avoid environment variable race conditions
    #[test]
    fn test_config_env_loading() -> Result<(), Box<dyn std::error::Error>> {
        env::set_var("TELEGRAM_TOKEN", "dummy_token");
        env::set_var("CAPTCHA_TIMEOUT_SECS", "45");

        let settings = Settings::new()?;
        assert_eq!(settings.telegram_token, "dummy_token");
        assert_eq!(settings.captcha_timeout_secs, 45);

        // Unset fields fall back to their defaults
        assert_eq!(settings.database_path, "warden.db");
        assert_eq!(settings.inactivity_timeout_secs, 86_400);
        assert_eq!(settings.dispatch_schedule, "0 0 12 * * *");

        env::remove_var("TELEGRAM_TOKEN");
        env::remove_var("CAPTCHA_TIMEOUT_SECS");
        Ok(())
    }
}
