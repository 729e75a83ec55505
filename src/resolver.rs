//! Popup, modal and iframe detection.
//!
//! Every probe returns a `DriverResult`; the environment decides how a failed
//! probe degrades. Outline helpers at the bottom work on observation text only.

use std::collections::{BTreeMap, HashSet};

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, warn};

use crate::dom::{self, FrameInfo};
use crate::driver::{BrowserDriver, PageHandle, ScopedPage};
use crate::error::DriverResult;
use crate::observation::{count_leading_tabs, role_token};
use crate::types::{CLOSE_KEYWORDS, IframeSnapshot};

/// Candidate modal containers.
pub const DIALOG_SELECTOR: &str = "[class*='dialog'], [class*='modal']";
/// Candidate close affordances.
pub const CLOSER_BUTTON_SELECTOR: &str = "button[class*='close'], button[class*='exit']";
pub const CLOSER_SPAN_SELECTOR: &str = "span[class*='close'], span[class*='exit']";
/// Elements listed in `Info::xpaths_input`.
pub const INPUT_SELECTOR: &str = "input, button, textarea, select";

static ELEMENT_ID: Lazy<Regex> = Lazy::new(|| Regex::new(r"\[(\d+)\]").expect("valid regex"));

/// Keep only xpaths that are not descendants of another xpath in the set.
pub fn filter_outer_xpaths(xpaths: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    let mut sorted: Vec<(&String, &String)> = xpaths.iter().collect();
    sorted.sort_by_key(|(xpath, _)| xpath.matches('/').count());

    let mut outer: Vec<(&String, &String)> = Vec::new();
    for (xpath, html) in sorted {
        let nested = outer
            .iter()
            .any(|(o, _)| xpath.starts_with(&format!("{o}/")));
        if !nested {
            outer.push((xpath, html));
        }
    }
    outer
        .into_iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// Outermost closers that sit inside an outermost container.
pub fn filter_close_xpaths(
    dialogs: &BTreeMap<String, String>,
    closes: &BTreeMap<String, String>,
) -> Vec<String> {
    let dialogs = filter_outer_xpaths(dialogs);
    let closes = filter_outer_xpaths(closes);
    closes
        .into_keys()
        .filter(|close| {
            dialogs
                .keys()
                .any(|dialog| close.starts_with(&format!("{dialog}/")))
        })
        .collect()
}

/// Whether a `dialog` or `alertdialog` is present.
pub fn check_popups(page: &dyn PageHandle) -> DriverResult<bool> {
    dom::has_dialog(page)
}

/// XPaths of close buttons nested in modal containers.
pub fn all_close_elements(page: &dyn PageHandle) -> DriverResult<Vec<String>> {
    let dialogs = dom::elements_by_selector(page, DIALOG_SELECTOR)?;
    if dialogs.is_empty() {
        return Ok(Vec::new());
    }
    let mut closes = dom::elements_by_selector(page, CLOSER_BUTTON_SELECTOR)?;
    closes.extend(dom::elements_by_selector(page, CLOSER_SPAN_SELECTOR)?);
    let found = filter_close_xpaths(&dialogs, &closes);
    debug!(
        "Found {} close elements in {} modal containers",
        found.len(),
        dialogs.len()
    );
    Ok(found)
}

pub fn xpaths_input(page: &dyn PageHandle) -> DriverResult<BTreeMap<String, String>> {
    dom::elements_by_selector(page, INPUT_SELECTOR)
}

/// Upper bound on temporary tabs opened for one page, form or not.
pub const MAX_FRAME_VISITS: usize = 12;

/// Snapshot iframes that hold an `<input`, each in a short-lived tab.
///
/// Same-origin frames are checked in place and skipped without opening a tab
/// when they have no input. Frames already known to hold an input are tried
/// before cross-origin ones, and each `src` is visited once. Collection stops
/// after `max_snapshots` form frames or `MAX_FRAME_VISITS` tabs. Focus is
/// handed back to `page` afterwards.
pub fn find_iframes(
    driver: &dyn BrowserDriver,
    page: &dyn PageHandle,
    max_snapshots: usize,
) -> DriverResult<Vec<IframeSnapshot>> {
    if max_snapshots == 0 {
        return Ok(Vec::new());
    }
    let mut seen = HashSet::new();
    let (known, unknown): (Vec<FrameInfo>, Vec<FrameInfo>) = dom::list_iframes(page)?
        .into_iter()
        .filter(|f| !f.src.is_empty() && !f.src.starts_with("about:"))
        .filter(|f| f.content.as_deref().is_none_or(|html| html.contains("<input")))
        .filter(|f| seen.insert(f.src.clone()))
        .partition(|f| f.content.is_some());

    let mut snapshots = Vec::new();
    let mut visits = 0;
    for frame in known.into_iter().chain(unknown) {
        if snapshots.len() >= max_snapshots {
            warn!(
                "Iframe limit ({}) reached on {}, skipping the rest",
                max_snapshots,
                page.url()
            );
            break;
        }
        if visits >= MAX_FRAME_VISITS {
            warn!(
                "Opened {} iframe tabs on {}, skipping the rest",
                visits,
                page.url()
            );
            break;
        }
        visits += 1;

        match probe_iframe(driver, &frame.src) {
            Ok(Some(mut snapshot)) => {
                if snapshot.title.is_empty() {
                    snapshot.title = frame.title.clone();
                }
                snapshots.push(snapshot);
            }
            Ok(None) => debug!("Iframe {} has no input, dropped", frame.src),
            Err(e) => warn!("Failed to probe iframe {}: {}", frame.src, e),
        }
    }

    if visits > 0 {
        // snapshots already taken stay valid if the page cannot be refocused
        if let Err(e) = dom::release_focus(page).and_then(|()| page.bring_to_front()) {
            warn!("Failed to refocus {} after iframe checks: {}", page.url(), e);
        }
    }
    Ok(snapshots)
}

fn probe_iframe(driver: &dyn BrowserDriver, src: &str) -> DriverResult<Option<IframeSnapshot>> {
    let probe = ScopedPage::open(driver)?;
    let tab = probe.page();
    tab.goto(src)?;
    let content = tab.content()?;
    if !content.contains("<input") {
        return Ok(None);
    }
    Ok(Some(IframeSnapshot {
        title: tab.title().unwrap_or_default(),
        url: tab.url(),
        obs: dom::capture_ax_snapshot(tab)?,
        content,
    }))
}

/// Button lines nested under a `dialog`/`alertdialog` line of an outline.
pub fn find_dialog_buttons(obs_text: &str) -> Vec<&str> {
    let mut buttons = Vec::new();
    let mut dialog_depth: Option<usize> = None;
    for line in obs_text.lines().skip(2) {
        let role = role_token(line);
        if role.contains("dialog") {
            dialog_depth = Some(count_leading_tabs(line));
            continue;
        }
        if let Some(depth) = dialog_depth {
            if count_leading_tabs(line) > depth {
                if role.contains("button") {
                    buttons.push(line);
                }
            } else {
                dialog_depth = None;
            }
        }
    }
    buttons
}

/// Id of the first dialog button that looks like a close, deny or accept-all
/// control.
pub fn close_button_id(obs_text: &str) -> Option<usize> {
    find_dialog_buttons(obs_text)
        .into_iter()
        .find(|line| {
            let lower = line.to_lowercase();
            CLOSE_KEYWORDS.iter().any(|k| lower.contains(k))
        })
        .and_then(|line| ELEMENT_ID.captures(line))
        .and_then(|caps| caps[1].parse().ok())
}
