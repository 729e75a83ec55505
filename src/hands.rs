//! headless_chrome implementation of the browser seam.

use std::collections::{HashMap, HashSet};
use std::ffi::OsStr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use headless_chrome::browser::tab::ModifierKey;
use headless_chrome::protocol::cdp::{Network, Page};
use headless_chrome::{Browser, LaunchOptions, Tab};
use tracing::{debug, info, warn};

use crate::actions::{KeyCombo, Modifier};
use crate::config::{EnvConfig, InstanceConfig, ProxyConfig, StorageCookie};
use crate::driver::{BrowserDriver, BrowserLauncher, PageHandle};
use crate::error::{DriverError, DriverResult};

fn browser_err(e: anyhow::Error) -> DriverError {
    let msg = format!("{e:#}");
    if msg.to_lowercase().contains("timed out") {
        DriverError::Timeout(msg)
    } else {
        DriverError::Browser(msg)
    }
}

/// Settings applied to every tab, including tabs the page opens itself.
#[derive(Debug, Clone)]
struct TabSettings {
    user_agent: String,
    accept_language: String,
    extra_headers: Vec<(String, String)>,
    navigation_timeout: Duration,
    proxy: Option<ProxyConfig>,
}

impl TabSettings {
    fn from_config(config: &EnvConfig) -> Self {
        Self {
            user_agent: config.user_agent.clone(),
            accept_language: config.accept_language.clone(),
            extra_headers: config
                .extra_headers
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            navigation_timeout: config.navigation_timeout(),
            proxy: config.proxy.clone(),
        }
    }

    fn apply(&self, tab: &Tab) -> DriverResult<()> {
        tab.set_default_timeout(self.navigation_timeout);
        tab.set_user_agent(&self.user_agent, Some(&self.accept_language), None)
            .map_err(browser_err)?;
        let headers: HashMap<&str, &str> = self
            .extra_headers
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        tab.set_extra_http_headers(headers).map_err(browser_err)?;

        if let Some(proxy) = &self.proxy {
            if proxy.username.is_some() {
                tab.enable_fetch(None, Some(true)).map_err(browser_err)?;
                tab.authenticate(proxy.username.clone(), proxy.password.clone())
                    .map_err(browser_err)?;
            }
        }
        Ok(())
    }
}

/// Launches Chrome, or attaches to one when `remote_debugging_url` is set.
#[derive(Debug, Default)]
pub struct ChromeLauncher;

impl BrowserLauncher for ChromeLauncher {
    fn launch(
        &self,
        config: &EnvConfig,
        _instance: &InstanceConfig,
    ) -> DriverResult<Box<dyn BrowserDriver>> {
        let mut registry = TabRegistry::default();
        let browser = match &config.remote_debugging_url {
            Some(url) => {
                info!("Attaching to existing Chrome at {}", url);
                let browser = Browser::connect(url.clone())
                    .map_err(|e| DriverError::Launch(format!("{e:#}")))?;
                registry.kept = live_ids(&browser)?;
                debug!("Leaving {} existing tab(s) open on close", registry.kept.len());
                browser
            }
            None => launch_browser(config)?,
        };
        Ok(Box::new(ChromeBrowser {
            browser: Some(browser),
            settings: TabSettings::from_config(config),
            registry: Arc::new(Mutex::new(registry)),
        }))
    }
}

fn launch_browser(config: &EnvConfig) -> DriverResult<Browser> {
    let mut args: Vec<&OsStr> = vec![
        OsStr::new("--no-first-run"),
        OsStr::new("--no-default-browser-check"),
        OsStr::new("--disable-blink-features=AutomationControlled"),
        OsStr::new("--disable-infobars"),
        OsStr::new("--password-store=basic"),
    ];
    args.extend(config.extra_args.iter().map(OsStr::new));

    let options = LaunchOptions {
        headless: config.headless,
        path: config.chrome_path.clone().or_else(find_chrome),
        user_data_dir: config.user_data_dir.clone(),
        window_size: Some((config.viewport.width, config.viewport.height)),
        ignore_certificate_errors: config.ignore_https_errors,
        proxy_server: config.proxy.as_ref().map(|p| p.server.as_str()),
        args,
        idle_browser_timeout: Duration::from_secs(600),
        ..Default::default()
    };

    info!(
        "Launching Chrome (headless: {}, proxy: {})",
        config.headless,
        config.proxy.is_some()
    );
    Browser::new(options).map_err(|e| DriverError::Launch(format!("{e:#}")))
}

/// Well-known install locations. `None` leaves discovery to headless_chrome.
fn find_chrome() -> Option<PathBuf> {
    let mut candidates = vec![
        PathBuf::from(r"C:\Program Files\Google\Chrome\Application\chrome.exe"),
        PathBuf::from(r"C:\Program Files (x86)\Google\Chrome\Application\chrome.exe"),
        PathBuf::from("/Applications/Google Chrome.app/Contents/MacOS/Google Chrome"),
    ];
    if let Some(local) = dirs::data_local_dir() {
        candidates.push(
            local
                .join("Google")
                .join("Chrome")
                .join("Application")
                .join("chrome.exe"),
        );
    }
    candidates.into_iter().find(|p| p.exists())
}

fn live_ids(browser: &Browser) -> DriverResult<HashSet<String>> {
    let tabs = browser.get_tabs();
    let guard = tabs
        .lock()
        .map_err(|_| DriverError::Browser("tab list poisoned".to_string()))?;
    Ok(guard.iter().map(|t| t.get_target_id().clone()).collect())
}

/// Per-session bookkeeping by target id.
#[derive(Debug, Default)]
struct TabRegistry {
    /// Tab settings have been applied.
    configured: HashSet<String>,
    /// Closed through a `ChromePage`; the browser drops them from its list
    /// only once the target-destroyed event arrives.
    closed: HashSet<String>,
    /// Tabs that were already open when attaching. `close` leaves them alone.
    kept: HashSet<String>,
}

impl TabRegistry {
    /// Forget every id the browser no longer lists.
    fn retain_live(&mut self, live: &HashSet<String>) {
        self.configured.retain(|id| live.contains(id));
        self.closed.retain(|id| live.contains(id));
        self.kept.retain(|id| live.contains(id));
    }

    /// True the first time an id is seen.
    fn configure(&mut self, id: &str) -> bool {
        self.configured.insert(id.to_string())
    }

    fn is_closed(&self, id: &str) -> bool {
        self.closed.contains(id)
    }

    fn mark_closed(&mut self, id: &str) {
        self.configured.remove(id);
        self.closed.insert(id.to_string());
    }

    /// Tabs a session teardown should close, in the given order.
    fn closable<'a>(&self, ids: impl IntoIterator<Item = &'a str>) -> Vec<&'a str> {
        ids.into_iter().filter(|id| !self.kept.contains(*id)).collect()
    }
}

pub struct ChromeBrowser {
    browser: Option<Browser>,
    settings: TabSettings,
    registry: Arc<Mutex<TabRegistry>>,
}

impl ChromeBrowser {
    fn browser(&self) -> DriverResult<&Browser> {
        self.browser
            .as_ref()
            .ok_or_else(|| DriverError::PageClosed("browser already closed".to_string()))
    }

    fn registry(&self) -> DriverResult<MutexGuard<'_, TabRegistry>> {
        self.registry
            .lock()
            .map_err(|_| DriverError::Browser("tab registry poisoned".to_string()))
    }

    fn wrap(&self, tab: Arc<Tab>) -> DriverResult<Arc<dyn PageHandle>> {
        let id = tab.get_target_id().clone();
        let fresh = self.registry()?.configure(&id);
        if fresh {
            if let Err(e) = self.settings.apply(&tab) {
                warn!("Failed to configure tab {}: {}", id, e);
            }
        }
        Ok(Arc::new(ChromePage {
            id,
            tab,
            registry: Arc::clone(&self.registry),
        }))
    }
}

impl BrowserDriver for ChromeBrowser {
    fn new_page(&self) -> DriverResult<Arc<dyn PageHandle>> {
        let tab = self.browser()?.new_tab().map_err(browser_err)?;
        debug!("Opened tab {}", tab.get_target_id());
        self.wrap(tab)
    }

    fn pages(&self) -> DriverResult<Vec<Arc<dyn PageHandle>>> {
        let tabs: Vec<Arc<Tab>> = {
            let tabs = self.browser()?.get_tabs();
            let guard = tabs
                .lock()
                .map_err(|_| DriverError::Browser("tab list poisoned".to_string()))?;
            guard.clone()
        };
        let live: Vec<Arc<Tab>> = {
            let mut registry = self.registry()?;
            let ids: HashSet<String> = tabs.iter().map(|t| t.get_target_id().clone()).collect();
            registry.retain_live(&ids);
            tabs.into_iter()
                .filter(|t| !registry.is_closed(t.get_target_id()))
                .collect()
        };
        live.into_iter().map(|t| self.wrap(t)).collect()
    }

    fn close(&mut self) -> DriverResult<()> {
        let Some(browser) = self.browser.take() else {
            return Ok(());
        };
        let tabs: Vec<Arc<Tab>> = match browser.get_tabs().lock() {
            Ok(guard) => guard.clone(),
            Err(_) => Vec::new(),
        };
        let closable: HashSet<String> = match self.registry.lock() {
            Ok(registry) => registry
                .closable(tabs.iter().map(|t| t.get_target_id().as_str()))
                .into_iter()
                .map(str::to_string)
                .collect(),
            Err(_) => HashSet::new(),
        };
        for tab in tabs.iter().filter(|t| closable.contains(t.get_target_id())) {
            if let Err(e) = tab.close(false) {
                warn!("Failed to close tab {}: {:#}", tab.get_target_id(), e);
            }
        }
        // dropping the handle kills a launched process
        drop(browser);
        info!("Browser closed");
        Ok(())
    }
}

pub struct ChromePage {
    id: String,
    tab: Arc<Tab>,
    registry: Arc<Mutex<TabRegistry>>,
}

impl ChromePage {
    fn find(&self, xpath: &str, timeout: Duration) -> DriverResult<headless_chrome::Element<'_>> {
        self.tab
            .wait_for_xpath_with_custom_timeout(xpath, timeout)
            .map_err(|_| DriverError::ElementNotFound(xpath.to_string()))
    }
}

impl PageHandle for ChromePage {
    fn id(&self) -> &str {
        &self.id
    }

    fn goto(&self, url: &str) -> DriverResult<()> {
        debug!("Navigating {} to {}", self.id, url);
        self.tab
            .navigate_to(url)
            .and_then(|t| t.wait_until_navigated())
            .map_err(browser_err)?;
        Ok(())
    }

    fn url(&self) -> String {
        self.tab.get_url()
    }

    fn title(&self) -> DriverResult<String> {
        self.tab.get_title().map_err(browser_err)
    }

    fn content(&self) -> DriverResult<String> {
        self.tab.get_content().map_err(browser_err)
    }

    fn evaluate(&self, script: &str) -> DriverResult<serde_json::Value> {
        let result = self
            .tab
            .evaluate(script, false)
            .map_err(|e| DriverError::Script(format!("{e:#}")))?;
        Ok(result.value.unwrap_or(serde_json::Value::Null))
    }

    fn click_xpath(&self, xpath: &str, timeout: Duration) -> DriverResult<()> {
        self.find(xpath, timeout)?.click().map_err(browser_err)?;
        Ok(())
    }

    fn hover_xpath(&self, xpath: &str, timeout: Duration) -> DriverResult<()> {
        self.find(xpath, timeout)?
            .move_mouse_over()
            .map_err(browser_err)?;
        Ok(())
    }

    fn type_text(&self, text: &str) -> DriverResult<()> {
        self.tab.type_str(text).map_err(browser_err)?;
        Ok(())
    }

    fn press_key(&self, keys: &KeyCombo) -> DriverResult<()> {
        let modifiers: Vec<ModifierKey> = keys
            .modifiers
            .iter()
            .map(|m| match m {
                Modifier::Alt => ModifierKey::Alt,
                Modifier::Control => ModifierKey::Ctrl,
                Modifier::Meta => ModifierKey::Meta,
                Modifier::Shift => ModifierKey::Shift,
            })
            .collect();
        let modifiers = (!modifiers.is_empty()).then_some(modifiers.as_slice());
        self.tab
            .press_key_with_modifiers(&keys.key, modifiers)
            .map_err(browser_err)?;
        Ok(())
    }

    fn screenshot(&self) -> DriverResult<Vec<u8>> {
        self.tab
            .capture_screenshot(Page::CaptureScreenshotFormatOption::Png, None, None, true)
            .map_err(browser_err)
    }

    fn bring_to_front(&self) -> DriverResult<()> {
        self.tab.bring_to_front().map_err(browser_err)?;
        Ok(())
    }

    fn set_cookies(&self, cookies: &[StorageCookie]) -> DriverResult<()> {
        let params = cookies
            .iter()
            .map(cookie_param)
            .collect::<Result<Vec<_>, _>>()?;
        if params.is_empty() {
            return Ok(());
        }
        self.tab.set_cookies(params).map_err(browser_err)
    }

    fn close(&self) -> DriverResult<()> {
        self.tab.close(false).map_err(browser_err)?;
        if let Ok(mut registry) = self.registry.lock() {
            registry.mark_closed(&self.id);
        }
        debug!("Closed tab {}", self.id);
        Ok(())
    }
}

fn cookie_param(cookie: &StorageCookie) -> DriverResult<Network::CookieParam> {
    let mut value = serde_json::json!({
        "name": cookie.name,
        "value": cookie.value,
        "domain": cookie.domain,
        "path": cookie.path,
        "secure": cookie.secure,
        "httpOnly": cookie.http_only,
    });
    if cookie.expires >= 0.0 {
        value["expires"] = serde_json::json!(cookie.expires);
    }
    if let Some(same_site) = &cookie.same_site {
        value["sameSite"] = serde_json::json!(same_site);
    }
    Ok(serde_json::from_value(value)?)
}
