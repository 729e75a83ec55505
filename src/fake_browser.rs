//! Scripted in-memory browser used by the environment and runner tests.

use std::collections::HashSet;
use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use crate::actions::KeyCombo;
use crate::config::{EnvConfig, InstanceConfig, StorageCookie};
use crate::driver::{BrowserDriver, BrowserLauncher, PageHandle};
use crate::env::BrowserEnv;
use crate::error::{DriverError, DriverResult};
use crate::resolver::{CLOSER_BUTTON_SELECTOR, DIALOG_SELECTOR, INPUT_SELECTOR};
use crate::types::AxNode;

/// In-memory document served by the fake browser.
#[derive(Clone, Default)]
pub(crate) struct FakeDom {
    pub(crate) url: String,
    pub(crate) title: String,
    pub(crate) html: String,
    pub(crate) nodes: Vec<AxNode>,
    pub(crate) links: Vec<(String, String)>,
    pub(crate) dialog: bool,
    pub(crate) dialog_probe_fails: bool,
    pub(crate) containers: Vec<(String, String)>,
    pub(crate) closers: Vec<(String, String)>,
    pub(crate) inputs: Vec<(String, String)>,
    pub(crate) clickable: HashSet<String>,
    /// Clicking this xpath dismisses the dialog.
    pub(crate) dismiss: Option<String>,
    /// Clicking the xpath opens the url in a new tab.
    pub(crate) opens_tab: Option<(String, String)>,
    /// Iframe `src` and, for same-origin frames, the frame's HTML.
    pub(crate) frames: Vec<(String, Option<String>)>,
}

pub(crate) fn ax(id: usize, role: &str, name: &str, children: &[usize], xpath: &str) -> AxNode {
    AxNode {
        node_id: id,
        role: role.to_string(),
        name: name.to_string(),
        properties: Vec::new(),
        children: children.to_vec(),
        xpath: xpath.to_string(),
        bounds: None,
        tag: String::new(),
    }
}

pub(crate) const SUBMIT: &str = "/html/body/form/button";
pub(crate) const CLOSER: &str = "/html/body/div[1]/button[2]";
/// Navigating here times out.
pub(crate) const UNREACHABLE: &str = "https://down.example/";

pub(crate) fn frame(src: &str, content: Option<&str>) -> (String, Option<String>) {
    (src.to_string(), content.map(str::to_string))
}

pub(crate) fn site(url: &str) -> FakeDom {
    let mut dom = FakeDom {
        url: url.to_string(),
        html: format!("<html><body>{url}</body></html>"),
        ..FakeDom::default()
    };
    match url {
        "https://shop.example/signup" => {
            dom.title = "Sign up".to_string();
            dom.html = "<html><body><form method=\"post\"><input name=\"email\"><button>Submit</button></form></body></html>".to_string();
            dom.nodes = vec![
                ax(0, "RootWebArea", "Sign up", &[1], "/html"),
                ax(1, "form", "", &[2, 3], "/html/body/form"),
                ax(2, "textbox", "Email", &[], "/html/body/form/input"),
                ax(3, "button", "Submit", &[], SUBMIT),
            ];
            dom.inputs = vec![
                ("/html/body/form/input".to_string(), "<input name=\"email\">".to_string()),
                (SUBMIT.to_string(), "<button>Submit</button>".to_string()),
            ];
            dom.clickable = [SUBMIT, "/html/body/form/input"]
                .iter()
                .map(|s| s.to_string())
                .collect();
            dom.links = vec![(
                "privacy policy".to_string(),
                "https://shop.example/privacy".to_string(),
            )];
        }
        "https://news.example/" => {
            dom.title = "News".to_string();
            dom.nodes = vec![
                ax(0, "RootWebArea", "News", &[1, 3], "/html"),
                ax(1, "dialog", "Cookies", &[2], "/html/body/div[1]"),
                ax(2, "button", "Close", &[], CLOSER),
                ax(3, "textbox", "Search", &[], "/html/body/input"),
            ];
            dom.dialog = true;
            dom.containers = vec![("/html/body/div[1]".to_string(), "<div class=\"modal\">".to_string())];
            dom.closers = vec![
                (CLOSER.to_string(), "<button class=\"close\">".to_string()),
                ("/html/body/div[2]/button[1]".to_string(), "<button class=\"close\">".to_string()),
            ];
            dom.clickable = [CLOSER.to_string()].into_iter().collect();
            dom.dismiss = Some(CLOSER.to_string());
        }
        "https://popup.example/" => {
            dom.title = "Popup".to_string();
            dom.nodes = vec![
                ax(0, "RootWebArea", "Popup", &[1], "/html"),
                ax(1, "link", "Open chat", &[], "/html/body/a"),
            ];
            dom.clickable = ["/html/body/a".to_string()].into_iter().collect();
            dom.opens_tab = Some((
                "/html/body/a".to_string(),
                "https://shop.example/signup".to_string(),
            ));
        }
        "https://forms.example/contact" => {
            dom.title = "Contact".to_string();
            dom.html = "<html><body><form><input name=\"message\"></form></body></html>".to_string();
            dom.nodes = vec![
                ax(0, "RootWebArea", "Contact", &[1], "/html"),
                ax(1, "textbox", "Message", &[], "/html/body/form/input"),
            ];
        }
        "https://ads.example/" => {
            dom.title = "Ads".to_string();
            dom.nodes = vec![ax(0, "RootWebArea", "Ads", &[], "/html")];
            dom.frames = vec![
                frame("about:blank", None),
                frame("https://ads.example/static", Some("<html><body>logo</body></html>")),
                frame("https://ad1.example/banner", None),
                frame("https://ad2.example/banner", None),
                frame("https://ad3.example/banner", None),
                frame("https://ad4.example/banner", None),
                frame("https://ad1.example/banner", None),
                frame(UNREACHABLE, None),
                frame("https://shop.example/signup", None),
            ];
        }
        _ => {
            dom.title = url.to_string();
            dom.nodes = vec![ax(0, "RootWebArea", url, &[], "/html")];
        }
    }
    dom
}

#[derive(Default)]
pub(crate) struct Shared {
    pub(crate) pages: Mutex<Vec<Arc<FakePage>>>,
    pub(crate) next_id: AtomicUsize,
    pub(crate) launches: AtomicUsize,
    pub(crate) closed: AtomicBool,
    pub(crate) dialog_probe_fails: AtomicBool,
    /// Listing tabs fails while set.
    pub(crate) pages_fail: AtomicBool,
    /// Bringing any tab to the front fails while set.
    pub(crate) front_fails: AtomicBool,
    pub(crate) cookies: Mutex<Vec<String>>,
}

impl Shared {
    pub(crate) fn open(self: &Arc<Self>, url: Option<&str>) -> Arc<FakePage> {
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut dom = site(url.unwrap_or("about:blank"));
        dom.dialog_probe_fails = self.dialog_probe_fails.load(Ordering::SeqCst);
        let page = Arc::new(FakePage {
            id: format!("tab-{n}"),
            dom: Mutex::new(dom),
            shared: Arc::downgrade(self),
            typed: Mutex::new(Vec::new()),
        });
        self.pages.lock().unwrap().push(Arc::clone(&page));
        page
    }

    pub(crate) fn page(&self, index: usize) -> Arc<FakePage> {
        Arc::clone(&self.pages.lock().unwrap()[index])
    }
}

pub(crate) struct FakePage {
    pub(crate) id: String,
    pub(crate) dom: Mutex<FakeDom>,
    pub(crate) shared: Weak<Shared>,
    pub(crate) typed: Mutex<Vec<String>>,
}

impl PageHandle for FakePage {
    fn id(&self) -> &str {
        &self.id
    }

    fn goto(&self, url: &str) -> DriverResult<()> {
        if url == UNREACHABLE {
            return Err(DriverError::Timeout(format!("navigating to {url}")));
        }
        let probe_fails = self.dom.lock().unwrap().dialog_probe_fails;
        let mut dom = site(url);
        dom.dialog_probe_fails = probe_fails;
        *self.dom.lock().unwrap() = dom;
        Ok(())
    }

    fn url(&self) -> String {
        self.dom.lock().unwrap().url.clone()
    }

    fn title(&self) -> DriverResult<String> {
        Ok(self.dom.lock().unwrap().title.clone())
    }

    fn content(&self) -> DriverResult<String> {
        Ok(self.dom.lock().unwrap().html.clone())
    }

    fn evaluate(&self, script: &str) -> DriverResult<serde_json::Value> {
        let mut dom = self.dom.lock().unwrap();
        if script.contains("const SKIP = new Set") {
            return Ok(json(&dom.nodes));
        }
        if script.contains("[role=\"dialog\"], [role=\"alertdialog\"]').length") {
            if dom.dialog_probe_fails {
                return Err(DriverError::Script("probe crashed".to_string()));
            }
            return Ok(serde_json::Value::Bool(dom.dialog));
        }
        if script.contains("querySelectorAll('a')") {
            return Ok(json(&dom.links));
        }
        if script.contains("querySelectorAll('iframe')") {
            let frames: Vec<serde_json::Value> = dom
                .frames
                .iter()
                .map(|(src, content)| {
                    serde_json::json!({ "src": src, "title": "", "name": "", "content": content })
                })
                .collect();
            return Ok(json(&frames));
        }
        if script.contains("el.outerHTML") {
            let found = if script.contains(DIALOG_SELECTOR) {
                dom.containers.clone()
            } else if script.contains(CLOSER_BUTTON_SELECTOR) {
                dom.closers.clone()
            } else if script.contains(INPUT_SELECTOR) {
                dom.inputs.clone()
            } else {
                Vec::new()
            };
            return Ok(json(&found));
        }
        if script.contains("d.remove()") {
            let removed = u64::from(dom.dialog);
            dismiss_dialog(&mut dom);
            return Ok(serde_json::Value::from(removed));
        }
        Ok(serde_json::Value::Bool(true))
    }

    fn click_xpath(&self, xpath: &str, _timeout: Duration) -> DriverResult<()> {
        let mut dom = self.dom.lock().unwrap();
        if !dom.clickable.contains(xpath) {
            return Err(DriverError::ElementNotFound(xpath.to_string()));
        }
        if dom.dismiss.as_deref() == Some(xpath) {
            dismiss_dialog(&mut dom);
        }
        if let Some((trigger, url)) = dom.opens_tab.clone() {
            if trigger == xpath {
                drop(dom);
                if let Some(shared) = self.shared.upgrade() {
                    shared.open(Some(&url));
                }
            }
        }
        Ok(())
    }

    fn hover_xpath(&self, xpath: &str, timeout: Duration) -> DriverResult<()> {
        let dom = self.dom.lock().unwrap();
        if dom.clickable.contains(xpath) {
            Ok(())
        } else {
            Err(DriverError::Timeout(format!("{xpath} after {timeout:?}")))
        }
    }

    fn type_text(&self, text: &str) -> DriverResult<()> {
        self.typed.lock().unwrap().push(text.to_string());
        Ok(())
    }

    fn press_key(&self, _keys: &KeyCombo) -> DriverResult<()> {
        Ok(())
    }

    fn screenshot(&self) -> DriverResult<Vec<u8>> {
        Ok(b"\x89PNG".to_vec())
    }

    fn bring_to_front(&self) -> DriverResult<()> {
        match self.shared.upgrade() {
            Some(shared) if shared.front_fails.load(Ordering::SeqCst) => {
                Err(DriverError::Browser("activate target failed".to_string()))
            }
            _ => Ok(()),
        }
    }

    fn set_cookies(&self, cookies: &[StorageCookie]) -> DriverResult<()> {
        if let Some(shared) = self.shared.upgrade() {
            let mut jar = shared.cookies.lock().unwrap();
            jar.extend(cookies.iter().map(|c| c.name.clone()));
        }
        Ok(())
    }

    fn close(&self) -> DriverResult<()> {
        if let Some(shared) = self.shared.upgrade() {
            shared.pages.lock().unwrap().retain(|p| p.id != self.id);
        }
        Ok(())
    }
}

pub(crate) fn dismiss_dialog(dom: &mut FakeDom) {
    dom.dialog = false;
    dom.containers.clear();
    dom.closers.clear();
    let dialog_ids: Vec<usize> = dom
        .nodes
        .iter()
        .filter(|n| n.role == "dialog")
        .map(|n| n.node_id)
        .collect();
    for node in &mut dom.nodes {
        node.children.retain(|c| !dialog_ids.contains(c));
    }
}

/// In-page probes hand structured results back as JSON strings.
pub(crate) fn json<T: serde::Serialize>(value: &T) -> serde_json::Value {
    serde_json::Value::String(serde_json::to_string(value).unwrap())
}

pub(crate) struct FakeBrowser {
    pub(crate) shared: Arc<Shared>,
}

impl BrowserDriver for FakeBrowser {
    fn new_page(&self) -> DriverResult<Arc<dyn PageHandle>> {
        Ok(self.shared.open(None))
    }

    fn pages(&self) -> DriverResult<Vec<Arc<dyn PageHandle>>> {
        if self.shared.pages_fail.load(Ordering::SeqCst) {
            return Err(DriverError::Browser("target list unavailable".to_string()));
        }
        Ok(self
            .shared
            .pages
            .lock()
            .unwrap()
            .iter()
            .map(|p| Arc::clone(p) as Arc<dyn PageHandle>)
            .collect())
    }

    fn close(&mut self) -> DriverResult<()> {
        self.shared.pages.lock().unwrap().clear();
        self.shared.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

pub(crate) struct FakeLauncher {
    pub(crate) shared: Arc<Shared>,
}

impl BrowserLauncher for FakeLauncher {
    fn launch(
        &self,
        _config: &EnvConfig,
        _instance: &InstanceConfig,
    ) -> DriverResult<Box<dyn BrowserDriver>> {
        self.shared.launches.fetch_add(1, Ordering::SeqCst);
        self.shared.closed.store(false, Ordering::SeqCst);
        Ok(Box::new(FakeBrowser {
            shared: Arc::clone(&self.shared),
        }))
    }
}

pub(crate) fn test_config() -> EnvConfig {
    EnvConfig {
        settle_ms: 0,
        capture_screenshot: false,
        ..EnvConfig::default()
    }
}

pub(crate) fn new_env() -> (BrowserEnv, Arc<Shared>) {
    let shared = Arc::new(Shared::default());
    let launcher = FakeLauncher {
        shared: Arc::clone(&shared),
    };
    (BrowserEnv::new(Box::new(launcher), test_config()), shared)
}

pub(crate) fn task_file(start_url: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"{{"storage_state": null, "start_url": "{start_url}", "geolocation": null}}"#
    )
    .unwrap();
    file
}
