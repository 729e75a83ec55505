//! Observation building: indexed outline, tab header, eliders and screenshot.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::EnvConfig;
use crate::dom;
use crate::driver::PageHandle;
use crate::error::DriverResult;
use crate::indexer::{self, IndexedTree};
use crate::types::{AxNode, Bounds, DetachedPage, Observation};

/// Number of leading lines (tab header + blank line) the eliders never touch.
const HEADER_LINES: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObservationKind {
    /// Raw page HTML, truncated.
    Text,
    AccessibilityTree,
    /// Screenshot only; the text is empty.
    Image,
}

/// Everything read from the page for one observation.
#[derive(Debug, Clone)]
pub struct PageObservation {
    pub observation: Observation,
    /// Indexed outline the observation's ids refer to.
    pub tree: IndexedTree,
    /// Raw snapshot, untruncated.
    pub nodes: Vec<AxNode>,
    pub page: DetachedPage,
}

pub struct ObservationBuilder {
    kind: ObservationKind,
    viewport: Option<Bounds>,
    capture_screenshot: bool,
    elide_navigation: bool,
    max_page_length: usize,
}

impl ObservationBuilder {
    pub fn new(config: &EnvConfig) -> Self {
        let viewport = config.current_viewport_only.then(|| Bounds {
            x: 0.0,
            y: 0.0,
            width: f64::from(config.viewport.width),
            height: f64::from(config.viewport.height),
        });
        Self {
            kind: config.observation_kind,
            viewport,
            capture_screenshot: config.capture_screenshot,
            elide_navigation: config.elide_navigation,
            max_page_length: config.max_page_length,
        }
    }

    pub fn kind(&self) -> ObservationKind {
        self.kind
    }

    /// Observe `pages[current]`. The other pages only contribute their titles
    /// to the header.
    pub fn observe(
        &self,
        pages: &[Arc<dyn PageHandle>],
        current: usize,
    ) -> DriverResult<PageObservation> {
        let page = pages
            .get(current)
            .ok_or_else(|| crate::error::DriverError::PageClosed(format!("tab {current}")))?;

        let nodes = dom::capture_ax_snapshot(page.as_ref())?;
        let tree = indexer::index_tree(&nodes, self.viewport.as_ref());
        let content = page.content()?;
        debug!(
            "Indexed {} elements from {} nodes on {}",
            tree.refs.len(),
            nodes.len(),
            page.url()
        );

        let text = match self.kind {
            ObservationKind::AccessibilityTree => {
                let titles: Vec<String> = pages
                    .iter()
                    .map(|p| p.title().unwrap_or_default())
                    .collect();
                let raw = format!("{}\n\n{}", tab_header(&titles, current), tree.text());
                if self.elide_navigation {
                    process_tree(&raw)
                } else {
                    raw
                }
            }
            ObservationKind::Text => truncate_chars(&content, self.max_page_length),
            ObservationKind::Image => String::new(),
        };

        let image = if self.capture_screenshot || self.kind == ObservationKind::Image {
            match page.screenshot() {
                Ok(png) => Some(png),
                Err(e) => {
                    warn!("Screenshot failed on {}: {}", page.url(), e);
                    None
                }
            }
        } else {
            None
        };

        Ok(PageObservation {
            observation: Observation { text, image },
            tree,
            nodes,
            page: DetachedPage {
                url: page.url(),
                content,
            },
        })
    }
}

/// `Tab 0 (current): Title\t\tTab 1: Other`
pub fn tab_header(titles: &[String], current: usize) -> String {
    titles
        .iter()
        .enumerate()
        .map(|(i, title)| {
            if i == current {
                format!("Tab {i} (current): {title}")
            } else {
                format!("Tab {i}: {title}")
            }
        })
        .collect::<Vec<_>>()
        .join("\t\t")
}

pub fn count_leading_tabs(line: &str) -> usize {
    line.chars().take_while(|c| *c == '\t').count()
}

/// The role of an outline line: the first word after the `[id]` group.
pub fn role_token(line: &str) -> &str {
    let line = line.trim_start_matches('\t');
    let rest = match line.strip_prefix('[') {
        Some(after) => after.split_once(']').map_or(after, |(_, r)| r),
        None => line,
    };
    rest.split_whitespace().next().unwrap_or("")
}

/// Drop every `navigation` line together with the lines nested under it.
pub fn remove_navigation_blocks(lines: &[&str]) -> Vec<String> {
    let mut out = Vec::with_capacity(lines.len());
    let mut skip_depth: Option<usize> = None;
    for line in lines {
        let depth = count_leading_tabs(line);
        if let Some(d) = skip_depth {
            if depth > d {
                continue;
            }
            skip_depth = None;
        }
        if role_token(line).contains("navigation") {
            skip_depth = Some(depth);
            continue;
        }
        out.push((*line).to_string());
    }
    out
}

pub fn remove_menu_items(lines: &[&str]) -> Vec<String> {
    lines
        .iter()
        .filter(|l| !role_token(l).contains("menuitem"))
        .map(|l| (*l).to_string())
        .collect()
}

/// Apply both eliders to an observation, leaving the header alone.
pub fn process_tree(text: &str) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let split = lines.len().min(HEADER_LINES);
    let (header, body) = lines.split_at(split);

    let without_nav = remove_navigation_blocks(body);
    let without_nav: Vec<&str> = without_nav.iter().map(String::as_str).collect();
    let body = remove_menu_items(&without_nav);

    header
        .iter()
        .map(|l| (*l).to_string())
        .chain(body)
        .collect::<Vec<_>>()
        .join("\n")
}

fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => s[..idx].to_string(),
        None => s.to_string(),
    }
}
