use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Connection settings for one marketplace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderSettings {
    pub enabled: bool,
    pub base_url: Option<String>,
    pub access_token: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub api_key: Option<String>,
    pub marketplace_id: Option<String>,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            base_url: None,
            access_token: None,
            client_id: None,
            client_secret: None,
            api_key: None,
            marketplace_id: None,
        }
    }
}

impl ProviderSettings {
    pub fn base_url_or(&self, default: &str) -> String {
        self.base_url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .unwrap_or(default)
            .trim_end_matches('/')
            .to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptchaPolicy {
    /// Estimates below this are recorded as failed and never submitted.
    pub confidence_threshold: f64,
    pub max_attempts: u32,
}

impl Default for CaptchaPolicy {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.5,
            max_attempts: 3,
        }
    }
}

/// Contents of the optional providers YAML file.
///
/// ```yaml
/// captcha:
///   confidence_threshold: 0.6
/// providers:
///   ebay:
///     client_id: my-app
///     marketplace_id: EBAY_FR
///   leboncoin:
///     enabled: false
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvidersConfig {
    pub captcha: CaptchaPolicy,
    pub providers: BTreeMap<String, ProviderSettings>,
}

impl ProvidersConfig {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let mut config: Self = serde_yaml::from_str(text).context("parsing providers yaml")?;
        config.providers = config
            .providers
            .into_iter()
            .map(|(tag, settings)| (tag.trim().to_ascii_lowercase(), settings))
            .collect();
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("loading {}", path.display()))
    }

    pub fn settings(&self, tag: &str) -> ProviderSettings {
        self.providers.get(tag).cloned().unwrap_or_default()
    }

    pub fn is_enabled(&self, tag: &str) -> bool {
        self.providers.get(tag).map_or(true, |s| s.enabled)
    }

    /// Applies `<TAG>_BASE_URL`, `<TAG>_ACCESS_TOKEN`, `<TAG>_CLIENT_ID`, `<TAG>_CLIENT_SECRET`,
    /// `<TAG>_API_KEY` and `<TAG>_MARKETPLACE_ID` for every tag in `tags`.
    pub fn apply_env_overrides<F>(&mut self, tags: &[&str], lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        for tag in tags {
            let prefix = tag.to_ascii_uppercase();
            let var = |suffix: &str| {
                lookup(&format!("{prefix}_{suffix}")).filter(|value| !value.trim().is_empty())
            };
            let overrides = [
                var("BASE_URL"),
                var("ACCESS_TOKEN"),
                var("CLIENT_ID"),
                var("CLIENT_SECRET"),
                var("API_KEY"),
                var("MARKETPLACE_ID"),
            ];
            if overrides.iter().all(Option::is_none) {
                continue;
            }
            let [base_url, access_token, client_id, client_secret, api_key, marketplace_id] = overrides;
            let settings = self.providers.entry(tag.to_string()).or_default();
            settings.base_url = base_url.or(settings.base_url.take());
            settings.access_token = access_token.or(settings.access_token.take());
            settings.client_id = client_id.or(settings.client_id.take());
            settings.client_secret = client_secret.or(settings.client_secret.take());
            settings.api_key = api_key.or(settings.api_key.take());
            settings.marketplace_id = marketplace_id.or(settings.marketplace_id.take());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn yaml_sections_default_when_absent() {
        let config = ProvidersConfig::from_yaml_str(
            "providers:\n  EBay:\n    client_id: app\n  leboncoin:\n    enabled: false\n",
        )
        .unwrap();
        assert_eq!(config.captcha, CaptchaPolicy::default());
        assert_eq!(config.settings("ebay").client_id.as_deref(), Some("app"));
        assert!(config.is_enabled("ebay"));
        assert!(!config.is_enabled("leboncoin"));
        assert!(config.is_enabled("vinted"));
    }

    #[test]
    fn env_overrides_win_over_file_values() {
        let mut config = ProvidersConfig::from_yaml_str(
            "providers:\n  vinted:\n    base_url: https://file.test\n    access_token: from-file\n",
        )
        .unwrap();
        let env: HashMap<&str, &str> = [
            ("VINTED_ACCESS_TOKEN", "from-env"),
            ("EBAY_CLIENT_SECRET", "s3cret"),
            ("LEBONCOIN_API_KEY", " "),
        ]
        .into_iter()
        .collect();
        config.apply_env_overrides(&["vinted", "ebay", "leboncoin"], |name| {
            env.get(name).map(|v| v.to_string())
        });

        let vinted = config.settings("vinted");
        assert_eq!(vinted.access_token.as_deref(), Some("from-env"));
        assert_eq!(vinted.base_url_or("https://default.test"), "https://file.test");
        assert_eq!(config.settings("ebay").client_secret.as_deref(), Some("s3cret"));
        assert!(!config.providers.contains_key("leboncoin"));
    }

    #[test]
    fn base_url_falls_back_and_drops_trailing_slash() {
        let settings = ProviderSettings {
            base_url: Some("https://api.test/".into()),
            ..Default::default()
        };
        assert_eq!(settings.base_url_or("https://x.test"), "https://api.test");
        assert_eq!(ProviderSettings::default().base_url_or("https://x.test/"), "https://x.test");
    }

    #[test]
    fn load_reads_yaml_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("providers.yaml");
        std::fs::write(&path, "captcha:\n  max_attempts: 5\n").unwrap();
        let config = ProvidersConfig::load(&path).unwrap();
        assert_eq!(config.captcha.max_attempts, 5);
        assert_eq!(config.captcha.confidence_threshold, 0.5);
        assert!(ProvidersConfig::load(&dir.path().join("missing.yaml")).is_err());
    }
}
