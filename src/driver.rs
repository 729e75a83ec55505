//! The seam between the environment and a concrete browser.
//!
//! The environment only talks to these traits. `hands` implements them on top
//! of headless_chrome; tests implement them with an in-memory page model.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::actions::KeyCombo;
use crate::config::{EnvConfig, InstanceConfig, StorageCookie};
use crate::error::{DriverError, DriverResult};

pub type PageId = String;

/// One open tab.
pub trait PageHandle: Send + Sync {
    fn id(&self) -> &str;

    /// Navigate and wait for the document to load, bounded by the
    /// navigation timeout the page was created with.
    fn goto(&self, url: &str) -> DriverResult<()>;

    fn url(&self) -> String;

    fn title(&self) -> DriverResult<String>;

    /// Serialized HTML of the current document.
    fn content(&self) -> DriverResult<String>;

    /// Evaluate an expression and return its primitive value. Objects must
    /// be returned as JSON strings.
    fn evaluate(&self, script: &str) -> DriverResult<serde_json::Value>;

    fn click_xpath(&self, xpath: &str, timeout: Duration) -> DriverResult<()>;

    fn hover_xpath(&self, xpath: &str, timeout: Duration) -> DriverResult<()>;

    /// Type into the focused element.
    fn type_text(&self, text: &str) -> DriverResult<()>;

    fn press_key(&self, keys: &KeyCombo) -> DriverResult<()>;

    /// PNG screenshot of the viewport.
    fn screenshot(&self) -> DriverResult<Vec<u8>>;

    fn bring_to_front(&self) -> DriverResult<()>;

    fn set_cookies(&self, cookies: &[StorageCookie]) -> DriverResult<()>;

    fn go_back(&self) -> DriverResult<()> {
        self.evaluate("history.back(); true").map(|_| ())
    }

    fn go_forward(&self) -> DriverResult<()> {
        self.evaluate("history.forward(); true").map(|_| ())
    }

    fn close(&self) -> DriverResult<()>;
}

/// One launched (or attached) browser.
pub trait BrowserDriver: Send {
    fn new_page(&self) -> DriverResult<Arc<dyn PageHandle>>;

    /// Every open tab in the order it was opened, including tabs the page
    /// opened on its own.
    fn pages(&self) -> DriverResult<Vec<Arc<dyn PageHandle>>>;

    /// Tear down the browsing context and the browser process.
    fn close(&mut self) -> DriverResult<()>;
}

/// Creates browsers for `BrowserEnv::reset`.
pub trait BrowserLauncher: Send {
    fn launch(
        &self,
        config: &EnvConfig,
        instance: &InstanceConfig,
    ) -> DriverResult<Box<dyn BrowserDriver>>;
}

/// Open pages of a session plus the pointer to the current one. The current
/// page is always resolved through the table, never held separately.
#[derive(Default)]
pub struct SessionHandle {
    current_page_id: Option<PageId>,
    page_table: HashMap<PageId, Arc<dyn PageHandle>>,
    order: Vec<PageId>,
}

impl SessionHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the table with the driver's current tab list. Returns true
    /// when a tab appeared that was not known before. A current page that
    /// disappeared falls back to the latest open one.
    pub fn sync(&mut self, pages: Vec<Arc<dyn PageHandle>>) -> bool {
        let mut opened = false;
        let mut table = HashMap::with_capacity(pages.len());
        let mut order = Vec::with_capacity(pages.len());
        for page in pages {
            let id = page.id().to_string();
            if !self.page_table.contains_key(&id) {
                opened = true;
            }
            order.push(id.clone());
            table.insert(id, page);
        }
        self.page_table = table;
        self.order = order;

        let current_gone = self
            .current_page_id
            .as_ref()
            .is_none_or(|id| !self.page_table.contains_key(id));
        if current_gone {
            self.current_page_id = self.order.last().cloned();
        }
        opened
    }

    pub fn insert(&mut self, page: Arc<dyn PageHandle>) -> PageId {
        let id = page.id().to_string();
        if !self.page_table.contains_key(&id) {
            self.order.push(id.clone());
        }
        self.page_table.insert(id.clone(), page);
        id
    }

    pub fn current(&self) -> DriverResult<Arc<dyn PageHandle>> {
        self.current_page_id
            .as_ref()
            .and_then(|id| self.page_table.get(id))
            .cloned()
            .ok_or_else(|| DriverError::PageClosed("no current page".to_string()))
    }

    pub fn current_id(&self) -> Option<&str> {
        self.current_page_id.as_deref()
    }

    pub fn current_index(&self) -> Option<usize> {
        let id = self.current_page_id.as_ref()?;
        self.order.iter().position(|p| p == id)
    }

    pub fn focus(&mut self, id: &str) -> DriverResult<Arc<dyn PageHandle>> {
        let page = self
            .page_table
            .get(id)
            .cloned()
            .ok_or_else(|| DriverError::PageClosed(id.to_string()))?;
        self.current_page_id = Some(id.to_string());
        Ok(page)
    }

    pub fn focus_index(&mut self, index: usize) -> DriverResult<Arc<dyn PageHandle>> {
        let id = self
            .order
            .get(index)
            .cloned()
            .ok_or_else(|| DriverError::PageClosed(format!("no tab at index {index}")))?;
        self.focus(&id)
    }

    pub fn focus_latest(&mut self) -> DriverResult<Arc<dyn PageHandle>> {
        let id = self
            .order
            .last()
            .cloned()
            .ok_or_else(|| DriverError::PageClosed("no open pages".to_string()))?;
        self.focus(&id)
    }

    pub fn remove(&mut self, id: &str) -> Option<Arc<dyn PageHandle>> {
        self.order.retain(|p| p != id);
        let page = self.page_table.remove(id);
        if self.current_page_id.as_deref() == Some(id) {
            self.current_page_id = self.order.last().cloned();
        }
        page
    }

    /// Pages in opening order.
    pub fn pages(&self) -> Vec<Arc<dyn PageHandle>> {
        self.order
            .iter()
            .filter_map(|id| self.page_table.get(id).cloned())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn clear(&mut self) {
        self.current_page_id = None;
        self.page_table.clear();
        self.order.clear();
    }
}

/// Closes a short-lived tab when dropped, on every exit path.
pub struct ScopedPage {
    page: Arc<dyn PageHandle>,
}

impl ScopedPage {
    pub fn open(driver: &dyn BrowserDriver) -> DriverResult<Self> {
        Ok(Self {
            page: driver.new_page()?,
        })
    }

    pub fn page(&self) -> &dyn PageHandle {
        self.page.as_ref()
    }
}

impl Drop for ScopedPage {
    fn drop(&mut self) {
        if let Err(e) = self.page.close() {
            tracing::warn!("Failed to close probe tab {}: {}", self.page.id(), e);
        }
    }
}
