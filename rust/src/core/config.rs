use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backend::{ChatServices, LocalBackend, RestBackend, RestBackendOptions};

use super::directory::SAMPLE_USERS;

pub(super) const CONFIG_FILE_NAME: &str = "simplechat_config.json";

const DEFAULT_REGION: &str = "us";
const DEFAULT_HISTORY_PAGE_SIZE: u32 = 50;
// Fetch generously so something survives the sample-user filter.
const DEFAULT_USER_PAGE_SIZE: u32 = 100;
const DEFAULT_GROUP_PAGE_SIZE: u32 = 50;
const DEFAULT_FEED_POLL_INTERVAL_MS: u64 = 2_000;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub(crate) struct AppConfig {
    pub(crate) disable_network: Option<bool>,
    pub(crate) app_id: Option<String>,
    pub(crate) region: Option<String>,
    pub(crate) api_key: Option<String>,
    pub(crate) api_base_url: Option<String>,
    pub(crate) history_page_size: Option<u32>,
    pub(crate) user_page_size: Option<u32>,
    pub(crate) group_page_size: Option<u32>,
    pub(crate) feed_poll_interval_ms: Option<u64>,
    // Replaces the built-in sample-user denylist when set.
    pub(crate) hidden_user_ids: Option<Vec<String>>,
    // tracing-subscriber directives, e.g. "simplechat_core=trace,info".
    pub(crate) log_filter: Option<String>,
}

pub(crate) fn load_app_config(data_dir: &str) -> AppConfig {
    let path = Path::new(data_dir).join(CONFIG_FILE_NAME);
    let Ok(bytes) = std::fs::read(&path) else {
        return AppConfig::default();
    };
    match serde_json::from_slice::<AppConfig>(&bytes) {
        Ok(config) => config,
        Err(e) => {
            tracing::warn!(err = %e, path = %path.display(), "invalid config, using defaults");
            AppConfig::default()
        }
    }
}

pub(crate) fn default_app_config_json() -> String {
    let defaults = AppConfig {
        disable_network: Some(false),
        app_id: None,
        region: Some(DEFAULT_REGION.to_string()),
        api_key: None,
        api_base_url: None,
        history_page_size: Some(DEFAULT_HISTORY_PAGE_SIZE),
        user_page_size: Some(DEFAULT_USER_PAGE_SIZE),
        group_page_size: Some(DEFAULT_GROUP_PAGE_SIZE),
        feed_poll_interval_ms: Some(DEFAULT_FEED_POLL_INTERVAL_MS),
        hidden_user_ids: None,
        log_filter: None,
    };
    serde_json::to_string_pretty(&defaults).unwrap_or_else(|_| "{}".to_string())
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(ToString::to_string)
}

impl AppConfig {
    pub(crate) fn network_enabled(&self) -> bool {
        // Used to keep Rust tests deterministic and offline.
        if let Some(disable) = self.disable_network {
            return !disable;
        }
        std::env::var("SIMPLECHAT_DISABLE_NETWORK").ok().as_deref() != Some("1")
    }

    pub(crate) fn history_page_size(&self) -> u32 {
        self.history_page_size
            .filter(|n| *n > 0)
            .unwrap_or(DEFAULT_HISTORY_PAGE_SIZE)
    }

    pub(crate) fn user_page_size(&self) -> u32 {
        self.user_page_size
            .filter(|n| *n > 0)
            .unwrap_or(DEFAULT_USER_PAGE_SIZE)
    }

    pub(crate) fn group_page_size(&self) -> u32 {
        self.group_page_size
            .filter(|n| *n > 0)
            .unwrap_or(DEFAULT_GROUP_PAGE_SIZE)
    }

    pub(crate) fn feed_poll_interval(&self) -> Duration {
        Duration::from_millis(
            self.feed_poll_interval_ms
                .filter(|ms| *ms > 0)
                .unwrap_or(DEFAULT_FEED_POLL_INTERVAL_MS),
        )
    }

    pub(crate) fn log_filter(&self) -> Option<String> {
        non_empty(&self.log_filter)
    }

    pub(crate) fn sample_user_denylist(&self) -> Vec<String> {
        match &self.hidden_user_ids {
            Some(ids) => ids.clone(),
            None => SAMPLE_USERS.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// REST credentials, when the config carries a complete set.
    pub(crate) fn rest_options(&self) -> Option<RestBackendOptions> {
        let app_id = non_empty(&self.app_id)?;
        let api_key = non_empty(&self.api_key)?;
        Some(RestBackendOptions {
            app_id,
            region: non_empty(&self.region).unwrap_or_else(|| DEFAULT_REGION.to_string()),
            api_key,
            api_base_url: non_empty(&self.api_base_url),
            feed_poll_interval: self.feed_poll_interval(),
        })
    }

    /// Hosted backend when online and configured, otherwise the in-process demo backend.
    pub(crate) fn build_services(&self) -> ChatServices {
        if self.network_enabled() {
            if let Some(options) = self.rest_options() {
                tracing::info!(base_url = %options.base_url(), "using hosted backend");
                return ChatServices::from_backend(Arc::new(RestBackend::new(options)));
            }
            tracing::warn!("app_id/api_key missing; falling back to local backend");
        }
        ChatServices::from_backend(Arc::new(LocalBackend::with_demo_users()))
    }
}
