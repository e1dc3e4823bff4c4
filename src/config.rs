//! Scanner configuration.
//!
//! One TOML file holds everything that used to be copy-pasted per scanner:
//! the target URL template, fetch timeouts, loop pacing, keyword lists and the
//! known-active slug set. Every field has a default, so an empty file (or no
//! file) is a valid configuration.

use crate::classify::ClassifierConfig;
use crate::known::default_known_slugs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const CONFIG_VERSION: u32 = 1;
pub const SLUG_PLACEHOLDER: &str = "{slug}";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    pub version: u32,
    pub known_slugs: Vec<String>,
    pub target: TargetSettings,
    pub http: HttpSettings,
    pub browser: BrowserSettings,
    pub hybrid: HybridSettings,
    pub scan: LoopSettings,
    pub classifier: ClassifierConfig,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            known_slugs: default_known_slugs(),
            target: TargetSettings::default(),
            http: HttpSettings::default(),
            browser: BrowserSettings::default(),
            hybrid: HybridSettings::default(),
            scan: LoopSettings::default(),
            classifier: ClassifierConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetSettings {
    /// Page URL with a `{slug}` placeholder, e.g. `https://host/widget-business/{slug}`.
    pub url_template: String,
}

impl Default for TargetSettings {
    fn default() -> Self {
        Self {
            url_template: "https://booking.example.com/widget-business/{slug}".to_string(),
        }
    }
}

impl TargetSettings {
    pub fn url_for(&self, slug: &str) -> String {
        self.url_template.replace(SLUG_PLACEHOLDER, slug)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpSettings {
    pub timeout_secs: u64,
    pub user_agent: String,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            timeout_secs: 10,
            user_agent: "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowserSettings {
    /// Fixed wait after navigation for client-side rendering.
    pub render_wait_ms: u64,
    pub page_timeout_secs: u64,
    pub headless: bool,
    /// Launch a fresh browser for every candidate instead of reusing one.
    pub relaunch_each: bool,
    pub chrome_path: Option<PathBuf>,
}

impl Default for BrowserSettings {
    fn default() -> Self {
        Self {
            render_wait_ms: 3_000,
            page_timeout_secs: 15,
            headless: true,
            relaunch_each: false,
            chrome_path: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HybridSettings {
    pub min_business_hits: u32,
    pub min_content_length: usize,
}

impl Default for HybridSettings {
    fn default() -> Self {
        Self {
            min_business_hits: 2,
            min_content_length: 15_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopSettings {
    /// Fetches in flight at once. Results are still committed in candidate order.
    pub workers: usize,
    /// Maximum fetch starts per second across all workers.
    pub rate_per_sec: f64,
    /// Processed candidates between checkpoints.
    pub checkpoint_every: u64,
    /// New results between sink flushes.
    pub flush_every: u64,
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self {
            workers: 1,
            rate_per_sec: 5.0,
            checkpoint_every: 50,
            flush_every: 25,
        }
    }
}

impl ScanConfig {
    pub fn load(path: &Path) -> ConfigResult<Self> {
        tracing::debug!("Loading config from {}", path.display());
        let contents = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path` when given, else defaults; then apply environment overrides.
    ///
    /// Supported variables:
    /// - `SLUG_SCAN_URL_TEMPLATE`
    /// - `SLUG_SCAN_RATE`
    /// - `SLUG_SCAN_WORKERS`
    pub fn load_with_env(path: Option<&Path>) -> ConfigResult<Self> {
        let mut config = match path {
            Some(p) => Self::load(p)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(val) = lookup("SLUG_SCAN_URL_TEMPLATE") {
            tracing::debug!("Override target.url_template from env: {}", val);
            self.target.url_template = val;
        }
        if let Some(rate) = lookup("SLUG_SCAN_RATE").and_then(|v| v.parse().ok()) {
            tracing::debug!("Override scan.rate_per_sec from env: {}", rate);
            self.scan.rate_per_sec = rate;
        }
        if let Some(workers) = lookup("SLUG_SCAN_WORKERS").and_then(|v| v.parse().ok()) {
            tracing::debug!("Override scan.workers from env: {}", workers);
            self.scan.workers = workers;
        }
    }

    pub fn validate(&self) -> ConfigResult<()> {
        let invalid = |field: &str, reason: &str| {
            Err(ConfigError::InvalidValue {
                field: field.to_string(),
                reason: reason.to_string(),
            })
        };
        if self.version != CONFIG_VERSION {
            return invalid("version", "unsupported config version");
        }
        if !self.target.url_template.contains(SLUG_PLACEHOLDER) {
            return invalid("target.url_template", "must contain {slug}");
        }
        if self.scan.workers == 0 {
            return invalid("scan.workers", "must be at least 1");
        }
        if !(self.scan.rate_per_sec.is_finite() && self.scan.rate_per_sec > 0.0) {
            return invalid("scan.rate_per_sec", "must be a positive number");
        }
        if self.scan.checkpoint_every == 0 {
            return invalid("scan.checkpoint_every", "must be at least 1");
        }
        if self.scan.flush_every == 0 {
            return invalid("scan.flush_every", "must be at least 1");
        }
        Ok(())
    }

    pub fn to_toml(&self) -> ConfigResult<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_is_defaults() {
        let config: ScanConfig = toml::from_str("").unwrap();
        assert_eq!(config, ScanConfig::default());
        assert!(config.validate().is_ok());
        assert_eq!(config.known_slugs.len(), 15);
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config: ScanConfig = toml::from_str(
            r#"
            known_slugs = ["ad31y"]

            [target]
            url_template = "https://widgets.example.net/b/{slug}"

            [classifier]
            active_min_hits = 2
            "#,
        )
        .unwrap();
        assert_eq!(config.known_slugs, vec!["ad31y"]);
        assert_eq!(config.target.url_for("MQ=="), "https://widgets.example.net/b/MQ==");
        assert_eq!(config.classifier.active_min_hits, 2);
        assert_eq!(config.classifier.active_min_length, 20_000);
        assert_eq!(config.scan.checkpoint_every, 50);
    }

    #[test]
    fn default_round_trips_through_toml() {
        let text = ScanConfig::default().to_toml().unwrap();
        let back: ScanConfig = toml::from_str(&text).unwrap();
        assert_eq!(back, ScanConfig::default());
    }

    #[test]
    fn env_overrides() {
        let mut config = ScanConfig::default();
        config.apply_env(|key| match key {
            "SLUG_SCAN_RATE" => Some("0.5".into()),
            "SLUG_SCAN_WORKERS" => Some("4".into()),
            "SLUG_SCAN_URL_TEMPLATE" => Some("https://h.example/x/{slug}".into()),
            _ => None,
        });
        assert_eq!(config.scan.rate_per_sec, 0.5);
        assert_eq!(config.scan.workers, 4);
        assert_eq!(config.target.url_for("ab"), "https://h.example/x/ab");
    }

    #[test]
    fn template_without_placeholder_is_rejected() {
        let mut config = ScanConfig::default();
        config.target.url_template = "https://h.example/".into();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { .. })
        ));
    }
}
