//! Layered configuration: struct defaults → `hub.toml` → `HUB_*` env vars.
//!
//! Env vars use double-underscore for nesting into sections:
//!   `HUB_BASE_API_URL=https://api.example.com`  →  `base_api_url`
//!   `HUB_RETRY__MAX_ATTEMPTS=5`  →  `retry.max_attempts = 5`
//!   `HUB_CHAT__URL=wss://edge/hubs/chat`  →  `chat.url`

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::backoff::{BackoffSchedule, DEFAULT_DELAYS_MS, RetryPolicy};
use crate::event::HubTargets;
use crate::manager::ManagerConfig;
use crate::transport::TransportKind;

pub const DEFAULT_CONFIG_FILE: &str = "hub.toml";

/// Which hub a manager talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Feature {
    Chat,
    Notifications,
}

impl Feature {
    pub fn default_path(&self) -> &'static str {
        match self {
            Feature::Chat => "/hubs/chat",
            Feature::Notifications => "/hubs/notifications",
        }
    }

    pub fn targets(&self) -> HubTargets {
        match self {
            Feature::Chat => HubTargets::chat(),
            Feature::Notifications => HubTargets::notifications(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeatureFileConfig {
    /// Full endpoint; wins over `base_api_url` + `path`.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryFileConfig {
    #[serde(default = "default_delays_ms")]
    pub delays_ms: Vec<u64>,
    /// Unset retries forever.
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

impl Default for RetryFileConfig {
    fn default() -> Self {
        Self {
            delays_ms: default_delays_ms(),
            max_attempts: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HubFileConfig {
    #[serde(default = "default_base_api_url")]
    pub base_api_url: String,
    #[serde(default)]
    pub chat: FeatureFileConfig,
    #[serde(default)]
    pub notifications: FeatureFileConfig,
    #[serde(default)]
    pub retry: RetryFileConfig,
    #[serde(default = "default_transports")]
    pub transports: Vec<TransportKind>,
    #[serde(default = "default_invoke_timeout_secs")]
    pub invoke_timeout_secs: u64,
    /// Empty disables the post-connect probe.
    #[serde(default = "default_liveness_probe")]
    pub liveness_probe: String,
}

impl Default for HubFileConfig {
    fn default() -> Self {
        Self {
            base_api_url: default_base_api_url(),
            chat: FeatureFileConfig::default(),
            notifications: FeatureFileConfig::default(),
            retry: RetryFileConfig::default(),
            transports: default_transports(),
            invoke_timeout_secs: default_invoke_timeout_secs(),
            liveness_probe: default_liveness_probe(),
        }
    }
}

fn default_base_api_url() -> String {
    "http://localhost:5000".to_string()
}

fn default_delays_ms() -> Vec<u64> {
    DEFAULT_DELAYS_MS.to_vec()
}

fn default_transports() -> Vec<TransportKind> {
    TransportKind::default_order()
}

fn default_invoke_timeout_secs() -> u64 {
    30
}

fn default_liveness_probe() -> String {
    "Ping".to_string()
}

/// Build a figment that layers: defaults → config file → HUB_* env vars.
pub fn load_config(path: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(HubFileConfig::default()))
        .merge(Toml::file(path))
        .merge(Env::prefixed("HUB_").split("__"))
}

impl HubFileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        load_config(path)
            .extract()
            .with_context(|| format!("failed to load hub config from {}", path.display()))
    }

    fn feature(&self, feature: Feature) -> &FeatureFileConfig {
        match feature {
            Feature::Chat => &self.chat,
            Feature::Notifications => &self.notifications,
        }
    }

    pub fn endpoint(&self, feature: Feature) -> String {
        let section = self.feature(feature);
        if let Some(url) = section.url.as_deref().filter(|u| !u.is_empty()) {
            return url.to_string();
        }
        let path = section.path.as_deref().unwrap_or(feature.default_path());
        format!("{}{}", self.base_api_url.trim_end_matches('/'), path)
    }

    /// Resolve into the runtime view for one feature.
    pub fn manager_config(&self, feature: Feature) -> Result<ManagerConfig> {
        let schedule = BackoffSchedule::from_millis(&self.retry.delays_ms)
            .context("invalid retry.delays_ms")?;
        if self.transports.is_empty() {
            bail!("transports must name at least one transport");
        }
        let probe = self.liveness_probe.trim();

        Ok(ManagerConfig {
            endpoint: self.endpoint(feature),
            transports: self.transports.clone(),
            retry: RetryPolicy::new(schedule, self.retry.max_attempts),
            invoke_timeout: Duration::from_secs(self.invoke_timeout_secs),
            targets: feature.targets(),
            liveness_probe: (!probe.is_empty()).then(|| probe.to_string()),
        })
    }
}
