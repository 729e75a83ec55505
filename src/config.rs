//! Environment and per-task configuration.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::EnvError;
use crate::observation::ObservationKind;

/// Delimiter between multiple start URLs in an instance config.
pub const START_URL_DELIMITER: &str = "|AND|";

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
        }
    }
}

/// Upstream proxy. Credentials come from configuration or the environment,
/// never from source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub server: String,
    pub username: Option<String>,
    #[serde(skip_serializing, default)]
    pub password: Option<String>,
}

impl ProxyConfig {
    /// Read `FORMSCOUT_PROXY_SERVER`, `FORMSCOUT_PROXY_USERNAME` and
    /// `FORMSCOUT_PROXY_PASSWORD`. Returns `None` when no server is set.
    pub fn from_env() -> Option<Self> {
        let server = std::env::var("FORMSCOUT_PROXY_SERVER").ok()?;
        if server.trim().is_empty() {
            return None;
        }
        Some(Self {
            server,
            username: std::env::var("FORMSCOUT_PROXY_USERNAME").ok(),
            password: std::env::var("FORMSCOUT_PROXY_PASSWORD").ok(),
        })
    }
}

/// Everything the environment needs to launch and observe a browser.
/// Built once and handed to `BrowserEnv::new`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvConfig {
    pub headless: bool,
    pub viewport: Viewport,
    pub observation_kind: ObservationKind,
    /// Only index elements that intersect the viewport.
    pub current_viewport_only: bool,
    pub capture_screenshot: bool,
    /// Apply the navigation and menu-item eliders to the text outline.
    pub elide_navigation: bool,
    /// Truncation length for the HTML text observation.
    pub max_page_length: usize,
    pub sleep_after_execution_ms: u64,
    /// Pause after dispatching an action, before re-observing.
    pub settle_ms: u64,
    pub navigation_timeout_ms: u64,
    pub element_timeout_ms: u64,
    /// Per-xpath click timeout while closing modals.
    pub modal_click_timeout_ms: u64,
    pub max_iframes_per_step: usize,
    pub user_agent: String,
    pub accept_language: String,
    pub extra_headers: BTreeMap<String, String>,
    pub ignore_https_errors: bool,
    pub proxy: Option<ProxyConfig>,
    pub chrome_path: Option<PathBuf>,
    pub user_data_dir: Option<PathBuf>,
    /// Attach to an already running Chrome instead of launching one.
    pub remote_debugging_url: Option<String>,
    pub extra_args: Vec<String>,
}

impl Default for EnvConfig {
    fn default() -> Self {
        let mut extra_headers = BTreeMap::new();
        extra_headers.insert("Referer".to_string(), "https://www.google.com".to_string());
        extra_headers.insert(
            "Accept".to_string(),
            "text/html,application/xhtml+xml,application/xml;q=0.9,image/webp,*/*;q=0.8"
                .to_string(),
        );

        Self {
            headless: true,
            viewport: Viewport::default(),
            observation_kind: ObservationKind::AccessibilityTree,
            current_viewport_only: false,
            capture_screenshot: true,
            elide_navigation: true,
            max_page_length: 8192,
            sleep_after_execution_ms: 0,
            settle_ms: 1000,
            navigation_timeout_ms: 30_000,
            element_timeout_ms: 5_000,
            modal_click_timeout_ms: 200,
            max_iframes_per_step: 4,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            accept_language: "en-GB".to_string(),
            extra_headers,
            ignore_https_errors: true,
            proxy: None,
            chrome_path: None,
            user_data_dir: None,
            remote_debugging_url: None,
            extra_args: Vec::new(),
        }
    }
}

impl EnvConfig {
    pub fn sleep_after_execution(&self) -> Duration {
        Duration::from_millis(self.sleep_after_execution_ms)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn navigation_timeout(&self) -> Duration {
        Duration::from_millis(self.navigation_timeout_ms)
    }

    pub fn element_timeout(&self) -> Duration {
        Duration::from_millis(self.element_timeout_ms)
    }

    pub fn modal_click_timeout(&self) -> Duration {
        Duration::from_millis(self.modal_click_timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Geolocation {
    #[serde(alias = "lat")]
    pub latitude: f64,
    #[serde(alias = "lng")]
    pub longitude: f64,
}

/// Per-task JSON config consumed at reset.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstanceConfig {
    #[serde(default)]
    pub storage_state: Option<PathBuf>,
    #[serde(default)]
    pub start_url: Option<String>,
    #[serde(default)]
    pub geolocation: Option<Geolocation>,
    #[serde(default)]
    pub intent: Option<String>,
    #[serde(default)]
    pub task_id: Option<serde_json::Value>,
}

impl InstanceConfig {
    pub fn load(path: &Path) -> Result<Self, EnvError> {
        if !path.exists() {
            return Err(EnvError::ConfigNotFound(path.to_path_buf()));
        }
        let raw = std::fs::read_to_string(path)?;
        serde_json::from_str(&raw).map_err(|source| EnvError::InvalidConfig {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Start URLs in order; the first one becomes the current page.
    pub fn start_urls(&self) -> Vec<String> {
        self.start_url
            .as_deref()
            .map(|s| {
                s.split(START_URL_DELIMITER)
                    .map(str::trim)
                    .filter(|u| !u.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn load_storage_state(&self) -> Result<Option<StorageState>, EnvError> {
        let Some(path) = &self.storage_state else {
            return Ok(None);
        };
        if !path.exists() {
            return Err(EnvError::ConfigNotFound(path.clone()));
        }
        let raw = std::fs::read_to_string(path)?;
        let state = serde_json::from_str(&raw).map_err(|source| EnvError::InvalidConfig {
            path: path.clone(),
            source,
        })?;
        Ok(Some(state))
    }
}

/// Saved browser state in the Playwright `storage_state` layout.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageState {
    #[serde(default)]
    pub cookies: Vec<StorageCookie>,
    #[serde(default)]
    pub origins: Vec<OriginStorage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageCookie {
    pub name: String,
    pub value: String,
    pub domain: String,
    #[serde(default = "root_path")]
    pub path: String,
    /// Seconds since the epoch; negative for session cookies.
    #[serde(default = "session_expiry")]
    pub expires: f64,
    #[serde(default)]
    pub http_only: bool,
    #[serde(default)]
    pub secure: bool,
    #[serde(default)]
    pub same_site: Option<String>,
}

fn root_path() -> String {
    "/".to_string()
}

fn session_expiry() -> f64 {
    -1.0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OriginStorage {
    pub origin: String,
    #[serde(default)]
    pub local_storage: Vec<NameValue>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NameValue {
    pub name: String,
    pub value: String,
}
