//! The browser environment: `reset`, `step`, `modal_close`, `close`.
//!
//! ```text
//! Uninitialized --reset--> Ready --step--> Ready
//!                            |  \--reset--> Ready (fresh session)
//!                            \--close--> Closed
//! ```
//!
//! Configuration problems and `step` before `reset` are errors. Everything a
//! single action or resolver probe can go wrong with is reported inside the
//! returned `StepOutput` instead.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::actions::{Action, ClickTarget};
use crate::config::{EnvConfig, InstanceConfig};
use crate::dom;
use crate::driver::{BrowserDriver, BrowserLauncher, PageHandle, SessionHandle};
use crate::error::{DriverError, DriverResult, EnvError};
use crate::indexer::IndexedTree;
use crate::observation::ObservationBuilder;
use crate::resolver;
use crate::types::{Info, Observation, StepOutput};

#[derive(Debug, Clone, Default)]
pub struct ResetOptions {
    /// Per-task JSON config. When given it must exist.
    pub config_file: Option<PathBuf>,
}

/// A launched browser plus everything tied to its lifetime.
pub struct Session {
    driver: Box<dyn BrowserDriver>,
    pages: SessionHandle,
    /// Outline of the last observation; element ids resolve against it.
    tree: IndexedTree,
    /// Modal closers already attempted, in order.
    visited_xpaths: Vec<String>,
}

pub enum EnvState {
    Uninitialized,
    Ready(Session),
    Closed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModalCloseOutcome {
    /// XPaths whose click succeeded in this call.
    pub closed_xpaths: Vec<String>,
    /// Every xpath attempted in this session so far.
    pub visited_xpaths: Vec<String>,
    pub output: StepOutput,
}

pub struct BrowserEnv {
    launcher: Box<dyn BrowserLauncher>,
    config: EnvConfig,
    builder: ObservationBuilder,
    state: EnvState,
}

impl BrowserEnv {
    pub fn new(launcher: Box<dyn BrowserLauncher>, config: EnvConfig) -> Self {
        let builder = ObservationBuilder::new(&config);
        Self {
            launcher,
            config,
            builder,
            state: EnvState::Uninitialized,
        }
    }

    pub fn config(&self) -> &EnvConfig {
        &self.config
    }

    pub fn is_ready(&self) -> bool {
        matches!(self.state, EnvState::Ready(_))
    }

    /// The outline the next action's element ids refer to.
    pub fn current_tree(&self) -> Option<&IndexedTree> {
        match &self.state {
            EnvState::Ready(session) => Some(&session.tree),
            _ => None,
        }
    }

    /// Tear down any previous session and start a new one.
    pub fn reset(&mut self, options: &ResetOptions) -> Result<StepOutput, EnvError> {
        self.close();

        let instance = match &options.config_file {
            Some(path) => InstanceConfig::load(path)?,
            None => InstanceConfig::default(),
        };
        let storage = instance.load_storage_state()?;

        let driver = self.launcher.launch(&self.config, &instance)?;
        let mut session = Session {
            driver,
            pages: SessionHandle::new(),
            tree: IndexedTree::default(),
            visited_xpaths: Vec::new(),
        };

        let urls = instance.start_urls();
        let mut existing = session.driver.pages()?.into_iter();
        let mut first_id = None;
        if urls.is_empty() {
            let page = match existing.next() {
                Some(page) => page,
                None => session.driver.new_page()?,
            };
            first_id = Some(session.pages.insert(page));
        }
        for url in &urls {
            let page = match existing.next() {
                Some(page) => page,
                None => session.driver.new_page()?,
            };
            if let Some(state) = &storage {
                page.set_cookies(&state.cookies)?;
            }
            page.goto(url)?;
            if let Some(state) = &storage {
                dom::apply_local_storage(page.as_ref(), &state.origins)?;
            }
            if let Some(geo) = &instance.geolocation {
                dom::override_geolocation(page.as_ref(), geo)?;
            }
            let id = session.pages.insert(page);
            first_id.get_or_insert(id);
        }

        session.pages.sync(session.driver.pages()?);
        if let Some(id) = &first_id {
            let page = session.pages.focus(id)?;
            page.bring_to_front()?;
        }
        info!(
            "Environment reset with {} start page(s), task {:?}",
            urls.len(),
            instance.task_id
        );

        std::thread::sleep(self.config.settle());
        let output = build_output(&self.builder, &self.config, &mut session, 0.0, String::new());
        self.state = EnvState::Ready(session);
        Ok(output)
    }

    /// Execute one action and observe the result. Dispatch and tab-tracking
    /// failures are reported through `fail_error` and a zero reward.
    pub fn step(&mut self, action: &Action) -> Result<StepOutput, EnvError> {
        let EnvState::Ready(session) = &mut self.state else {
            return Err(EnvError::NotReady);
        };

        debug!("Dispatching {}", action);
        let mut fail_error = match session
            .pages
            .current()
            .and_then(|page| dispatch(&self.config, session, &page, action))
        {
            Ok(()) => String::new(),
            Err(e) => {
                warn!("Action {} failed: {}", action, e);
                e.to_string()
            }
        };

        std::thread::sleep(self.config.sleep_after_execution() + self.config.settle());
        if let Err(e) = refresh_pages(session) {
            warn!("Failed to refresh tabs after {}: {}", action, e);
            if fail_error.is_empty() {
                fail_error = format!("tab refresh failed: {e}");
            }
        }
        let reward = if fail_error.is_empty() { 1.0 } else { 0.0 };

        Ok(build_output(&self.builder, &self.config, session, reward, fail_error))
    }

    /// Click each not-yet-visited closer once, with a short timeout. A closer
    /// that cannot be clicked is skipped.
    pub fn modal_close(&mut self, xpaths: &[String]) -> Result<ModalCloseOutcome, EnvError> {
        let EnvState::Ready(session) = &mut self.state else {
            return Err(EnvError::NotReady);
        };

        let mut closed_xpaths = Vec::new();
        let page = match session.pages.current() {
            Ok(page) => page,
            Err(e) => {
                warn!("No page to close modals on: {}", e);
                let output = build_output(&self.builder, &self.config, session, 0.0, e.to_string());
                return Ok(ModalCloseOutcome {
                    closed_xpaths,
                    visited_xpaths: session.visited_xpaths.clone(),
                    output,
                });
            }
        };
        for xpath in xpaths {
            if session.visited_xpaths.contains(xpath) {
                continue;
            }
            session.visited_xpaths.push(xpath.clone());
            match page.click_xpath(xpath, self.config.modal_click_timeout()) {
                Ok(()) => {
                    info!("Closed modal via {}", xpath);
                    closed_xpaths.push(xpath.clone());
                }
                Err(e) => debug!("Modal closer {} not clickable: {}", xpath, e),
            }
        }

        let (mut reward, mut fail_error) = if closed_xpaths.is_empty() {
            (0.0, "no modal closer could be clicked".to_string())
        } else {
            std::thread::sleep(self.config.settle());
            (1.0, String::new())
        };
        if let Err(e) = refresh_pages(session) {
            warn!("Failed to refresh tabs after closing modals: {}", e);
            if fail_error.is_empty() {
                reward = 0.0;
                fail_error = format!("tab refresh failed: {e}");
            }
        }

        let output = build_output(&self.builder, &self.config, session, reward, fail_error);
        Ok(ModalCloseOutcome {
            closed_xpaths,
            visited_xpaths: session.visited_xpaths.clone(),
            output,
        })
    }

    /// Delete dialog nodes straight from the DOM. No application close
    /// handler runs, so scroll locks or overlays may stay behind.
    pub fn remove_popups(&mut self) -> Result<StepOutput, EnvError> {
        let EnvState::Ready(session) = &mut self.state else {
            return Err(EnvError::NotReady);
        };

        let removed = session
            .pages
            .current()
            .and_then(|page| Ok((dom::remove_dialogs(page.as_ref())?, page.url())));
        let (reward, fail_error) = match removed {
            Ok((0, _)) => (0.0, "no dialog to remove".to_string()),
            Ok((n, url)) => {
                warn!(
                    "Removed {} dialog node(s) from {} without clicking a closer",
                    n, url
                );
                (1.0, String::new())
            }
            Err(e) => {
                warn!("Dialog removal failed: {}", e);
                (0.0, e.to_string())
            }
        };

        Ok(build_output(&self.builder, &self.config, session, reward, fail_error))
    }

    /// Best-effort teardown. Never fails.
    pub fn close(&mut self) {
        match std::mem::replace(&mut self.state, EnvState::Closed) {
            EnvState::Ready(mut session) => {
                session.pages.clear();
                if let Err(e) = session.driver.close() {
                    warn!("Error while closing browser: {}", e);
                }
                info!("Environment closed");
            }
            EnvState::Uninitialized => self.state = EnvState::Uninitialized,
            EnvState::Closed => {}
        }
    }
}

impl Drop for BrowserEnv {
    fn drop(&mut self) {
        self.close();
    }
}

fn degrade<T>(check: &str, result: DriverResult<T>, default: T) -> T {
    result.unwrap_or_else(|e| {
        warn!("{} failed, assuming none: {}", check, e);
        default
    })
}

/// Pick up tabs opened or closed by the page. A newly opened tab becomes the
/// current page.
fn refresh_pages(session: &mut Session) -> DriverResult<()> {
    let opened = session.pages.sync(session.driver.pages()?);
    if session.pages.is_empty() {
        let page = session.driver.new_page()?;
        session.pages.insert(page);
        session.pages.focus_latest()?;
    } else if opened {
        let page = session.pages.focus_latest()?;
        debug!("Switched to new tab {}", page.id());
    }
    if let Err(e) = session.pages.current()?.bring_to_front() {
        warn!("Failed to bring current tab to front: {}", e);
    }
    Ok(())
}

fn element_xpath(session: &Session, element_id: usize) -> DriverResult<String> {
    session
        .tree
        .get(element_id)
        .map(|r| r.xpath.clone())
        .ok_or_else(|| {
            DriverError::ElementNotFound(format!(
                "element [{element_id}] is not in the current observation"
            ))
        })
}

fn dispatch(
    config: &EnvConfig,
    session: &mut Session,
    page: &Arc<dyn PageHandle>,
    action: &Action,
) -> DriverResult<()> {
    let timeout = config.element_timeout();
    match action {
        Action::Navigate { url } => page.goto(url),
        Action::Click { target } => match target {
            ClickTarget::Element(id) => page.click_xpath(&element_xpath(session, *id)?, timeout),
            ClickTarget::Xpaths(xpaths) => click_first(page.as_ref(), xpaths, config.modal_click_timeout()),
            ClickTarget::LinkText(text) => {
                let key = text.trim().to_lowercase();
                let url = dom::link_pairs(page.as_ref())?
                    .remove(&key)
                    .ok_or_else(|| DriverError::ElementNotFound(format!("link '{text}'")))?;
                page.goto(&url)
            }
        },
        Action::Type {
            element_id,
            text,
            clear_first,
        } => {
            let xpath = element_xpath(session, *element_id)?;
            page.click_xpath(&xpath, timeout)?;
            if *clear_first {
                dom::clear_value(page.as_ref(), &xpath)?;
            }
            page.type_text(text)
        }
        Action::Hover { element_id } => page.hover_xpath(&element_xpath(session, *element_id)?, timeout),
        Action::KeyPress { keys } => page.press_key(keys),
        Action::Scroll { direction } => dom::scroll(page.as_ref(), *direction),
        Action::SelectOption { element_id, value } => {
            dom::select_option(page.as_ref(), &element_xpath(session, *element_id)?, value)
        }
        Action::NewTab => {
            let page = session.driver.new_page()?;
            session.pages.insert(page);
            session.pages.focus_latest()?;
            Ok(())
        }
        Action::TabFocus { index } => session.pages.focus_index(*index)?.bring_to_front(),
        Action::PageClose => {
            page.close()?;
            session.pages.remove(page.id());
            Ok(())
        }
        Action::GoBack => page.go_back(),
        Action::GoForward => page.go_forward(),
        Action::Stop { .. } => Ok(()),
        Action::RawScript { script } => page.evaluate(script).map(|_| ()),
    }
}

fn click_first(page: &dyn PageHandle, xpaths: &[String], timeout: Duration) -> DriverResult<()> {
    let mut last_err = DriverError::ElementNotFound("empty xpath list".to_string());
    for xpath in xpaths {
        match page.click_xpath(xpath, timeout) {
            Ok(()) => return Ok(()),
            Err(e) => last_err = e,
        }
    }
    Err(last_err)
}

/// Observe the current page and run the resolver probes. Each probe that
/// fails falls back to "nothing found"; a missing page yields an empty
/// observation with the error in `fail_error`.
fn build_output(
    builder: &ObservationBuilder,
    config: &EnvConfig,
    session: &mut Session,
    reward: f64,
    mut fail_error: String,
) -> StepOutput {
    let page = match session.pages.current() {
        Ok(page) => page,
        Err(e) => {
            warn!("No current page to observe: {}", e);
            session.tree = IndexedTree::default();
            if fail_error.is_empty() {
                fail_error = e.to_string();
            }
            return StepOutput {
                observation: Observation::default(),
                reward: 0.0,
                terminated: false,
                truncated: false,
                info: Info {
                    fail_error,
                    timestamp: Utc::now(),
                    ..Info::default()
                },
            };
        }
    };
    let pages = session.pages.pages();
    let current = session.pages.current_index().unwrap_or(0);

    let (observation, mut info) = match builder.observe(&pages, current) {
        Ok(observed) => {
            let info = Info {
                page: observed.page,
                obs: observed.nodes,
                observation_metadata: observed.tree.metadata(),
                ..Info::default()
            };
            session.tree = observed.tree;
            (observed.observation, info)
        }
        Err(e) => {
            warn!("Observation failed on {}: {}", page.url(), e);
            if fail_error.is_empty() {
                fail_error = format!("observation failed: {e}");
            }
            session.tree = IndexedTree::default();
            let mut info = Info::default();
            info.page.url = page.url();
            (Observation::default(), info)
        }
    };

    info.popup = degrade("Popup check", resolver::check_popups(page.as_ref()), false);
    info.closes_ele = degrade(
        "Close element search",
        resolver::all_close_elements(page.as_ref()),
        Vec::new(),
    );
    info.xpaths_input = degrade(
        "Input listing",
        resolver::xpaths_input(page.as_ref()),
        BTreeMap::new(),
    );
    info.text_url_pairs = degrade("Link map", dom::link_pairs(page.as_ref()), BTreeMap::new());
    info.iframe = degrade(
        "Iframe check",
        resolver::find_iframes(
            session.driver.as_ref(),
            page.as_ref(),
            config.max_iframes_per_step,
        ),
        Vec::new(),
    );
    info.fail_error = fail_error;
    info.timestamp = Utc::now();

    StepOutput {
        observation,
        reward,
        terminated: false,
        truncated: false,
        info,
    }
}

#[cfg(test)]
#[path = "env_tests.rs"]
mod tests;
