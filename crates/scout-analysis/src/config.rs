use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use scout_core::ScoutError;
use scout_providers::{CaptchaPolicy, ProvidersConfig, BUILTIN_TAGS};
use scout_storage::PacingConfig;

pub const DEFAULT_DATABASE_URL: &str = "sqlite://scout.db?mode=rwc";

/// Process-wide settings read from the environment.
#[derive(Debug, Clone)]
pub struct ScoutConfig {
    pub database_url: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub provider_timeout_secs: u64,
    pub captcha_archive_dir: Option<PathBuf>,
    pub providers_file: Option<PathBuf>,
    pub captcha_confidence: Option<f64>,
    pub captcha_max_attempts: Option<u32>,
    /// Requests a provider may send back to back before pacing starts.
    pub rate_burst: u32,
    /// Minimum spacing between paced requests to one provider; unset disables pacing.
    pub rate_interval_ms: Option<u64>,
}

impl ScoutConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        Self {
            database_url: var("DATABASE_URL").unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string()),
            user_agent: var("SCOUT_USER_AGENT").unwrap_or_else(|| "market-scout/0.1".to_string()),
            http_timeout_secs: var("SCOUT_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            provider_timeout_secs: var("SCOUT_PROVIDER_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            captcha_archive_dir: var("SCOUT_CAPTCHA_ARCHIVE_DIR").map(PathBuf::from),
            providers_file: var("SCOUT_PROVIDERS_FILE").map(PathBuf::from),
            captcha_confidence: var("SCOUT_CAPTCHA_CONFIDENCE").and_then(|v| v.parse().ok()),
            captcha_max_attempts: var("SCOUT_CAPTCHA_MAX_ATTEMPTS").and_then(|v| v.parse().ok()),
            rate_burst: var("SCOUT_RATE_BURST")
                .and_then(|v| v.parse().ok())
                .unwrap_or(1),
            rate_interval_ms: var("SCOUT_RATE_INTERVAL_MS").and_then(|v| v.parse().ok()),
        }
    }

    /// Rejects settings that would make every request fail.
    pub fn validate(&self) -> Result<(), ScoutError> {
        if self.provider_timeout_secs == 0 {
            return Err(ScoutError::validation(
                "SCOUT_PROVIDER_TIMEOUT_SECS must be greater than zero",
            ));
        }
        if self.http_timeout_secs == 0 {
            return Err(ScoutError::validation(
                "SCOUT_HTTP_TIMEOUT_SECS must be greater than zero",
            ));
        }
        Ok(())
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn provider_timeout(&self) -> Duration {
        Duration::from_secs(self.provider_timeout_secs)
    }

    pub fn pacing(&self) -> Option<PacingConfig> {
        self.rate_interval_ms
            .filter(|ms| *ms > 0)
            .map(|ms| PacingConfig {
                burst: self.rate_burst.max(1),
                interval: Duration::from_millis(ms),
            })
    }

    /// Provider settings: the YAML file when configured, then `<TAG>_*` variables from
    /// `lookup`, then the CAPTCHA policy overrides.
    pub fn providers_config<F>(&self, lookup: F) -> Result<ProvidersConfig>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = match &self.providers_file {
            Some(path) => ProvidersConfig::load(path)
                .with_context(|| format!("loading provider settings from {}", path.display()))?,
            None => ProvidersConfig::default(),
        };
        config.apply_env_overrides(BUILTIN_TAGS, lookup);
        if let Some(confidence) = self.captcha_confidence {
            config.captcha.confidence_threshold = confidence.clamp(0.0, 1.0);
        }
        if let Some(max_attempts) = self.captcha_max_attempts {
            config.captcha.max_attempts = max_attempts.max(1);
        }
        Ok(config)
    }
}

impl Default for ScoutConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}
