//! Structural comparison of observations and form-state selection.

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::actions::{Action, ActionKind};
use crate::observation::{count_leading_tabs, role_token};
use crate::error::TrajectoryError;
use crate::trajectory::TrajectoryEntry;
use crate::types::{IframeSnapshot, StateInfo};

static ELEMENT_ID: Lazy<Regex> = Lazy::new(|| Regex::new(r"\[\d+\]").expect("valid regex"));
static BRACKETED: Lazy<Regex> = Lazy::new(|| Regex::new(r"\[.*?\]").expect("valid regex"));
static SINGLE_QUOTED: Lazy<Regex> = Lazy::new(|| Regex::new(r"'[^']*'").expect("valid regex"));
static DOUBLE_QUOTED: Lazy<Regex> = Lazy::new(|| Regex::new(r#""[^"]*""#).expect("valid regex"));

/// Hosts whose pages are never collected as form states.
pub const DEFAULT_EXCLUDED_HOSTS: &[&str] = &[
    "googl", "youtu.be", "twitter", "instagram", "google", "microsoft", "youtube",
    "stackoverflow", "amazon", "x.com", "facebook", "github", "gitlab", "apple", "linkedin",
    "bing", "icloud", ".ru", ".jp", ".kz", ".tr", ".ua", ".pl", ".de", ".tw", ".az",
];

fn strip_annotations(line: &str) -> String {
    let line = BRACKETED.replace_all(line, "");
    let line = SINGLE_QUOTED.replace_all(&line, "");
    DOUBLE_QUOTED.replace_all(&line, "").into_owned()
}

/// One entry per outline line: indentation plus role, with ids, names and
/// bracketed annotations removed. The tab header is not part of it.
pub fn structural_fingerprint(obs_text: &str) -> Vec<String> {
    obs_text
        .lines()
        .skip(2)
        .map(|line| {
            let depth = count_leading_tabs(line);
            let stripped = strip_annotations(line);
            format!("{}{}", "\t".repeat(depth), role_token(&stripped))
        })
        .collect()
}

pub fn same_structure(a: &str, b: &str) -> bool {
    structural_fingerprint(a) == structural_fingerprint(b)
}

/// Observations with distinct structure, first occurrence kept, input order
/// preserved.
pub fn unique<S: AsRef<str>>(observations: &[S]) -> Vec<&S> {
    let mut seen = HashSet::new();
    observations
        .iter()
        .filter(|o| seen.insert(structural_fingerprint(o.as_ref())))
        .collect()
}

/// Keep one item per key. A repeated key replaces the earlier item and moves
/// to the position of the later one.
pub fn remove_duplicates_by_key<T, K, F>(items: Vec<T>, key: F) -> Vec<T>
where
    K: PartialEq,
    F: Fn(&T) -> K,
{
    let mut kept: Vec<(K, T)> = Vec::with_capacity(items.len());
    for item in items {
        let k = key(&item);
        kept.retain(|(existing, _)| *existing != k);
        kept.push((k, item));
    }
    kept.into_iter().map(|(_, item)| item).collect()
}

/// Outline body with element ids removed.
pub fn strip_element_ids(obs_text: &str) -> Vec<String> {
    obs_text
        .lines()
        .skip(2)
        .map(|line| ELEMENT_ID.replace_all(line, "").into_owned())
        .collect()
}

/// Shallow outline labels: lines at depth 0 or 1 with brackets and quoted
/// text removed.
pub fn extract_accessibility_label<S: AsRef<str>>(lines: &[S]) -> Vec<String> {
    lines
        .iter()
        .map(|l| l.as_ref())
        .filter(|line| !line.starts_with("\t\t"))
        .map(strip_annotations)
        .collect()
}

/// Textbox and iframe lines, without search boxes.
pub fn extract_textboxes<S: AsRef<str>>(lines: &[S]) -> Vec<String> {
    lines
        .iter()
        .map(|l| l.as_ref().trim_matches('\t'))
        .filter(|line| {
            let lower = line.to_lowercase();
            let search = line.contains("textbox") && lower.contains("search");
            !search && (line.contains("textbox") || lower.contains("iframe"))
        })
        .map(|line| line.trim().to_string())
        .collect()
}

/// A page state worth handing to form extraction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormState {
    pub url: String,
    pub html: String,
    pub image: Option<Vec<u8>>,
    pub ac_tree: String,
    pub ac_tree_label: String,
    pub textboxes: Vec<String>,
    /// Frames whose document contains a `<form`.
    pub iframes: Vec<IframeSnapshot>,
}

impl FormState {
    fn from_state(state: &StateInfo) -> Self {
        let lines = strip_element_ids(&state.observation.text);
        Self {
            url: state.info.page.url.clone(),
            html: state.info.page.content.clone(),
            image: state.observation.image.clone(),
            ac_tree_label: extract_accessibility_label(&lines).join("\n"),
            textboxes: extract_textboxes(&lines),
            ac_tree: lines.join("\n"),
            iframes: state
                .info
                .iframe
                .iter()
                .filter(|f| f.content.contains("<form"))
                .cloned()
                .collect(),
        }
    }

    pub fn has_form(&self) -> bool {
        self.ac_tree.contains("textbox") || !self.iframes.is_empty()
    }
}

/// Form-bearing states of a trajectory. States reached by typing are skipped
/// (they repeat the page before), as are pages on excluded hosts.
pub fn collect_form_states(trajectory: &[TrajectoryEntry], excluded_hosts: &[&str]) -> Vec<FormState> {
    let mut out = Vec::new();
    let mut previous_action: Option<&Action> = None;
    for entry in trajectory {
        match entry {
            TrajectoryEntry::Action(action) => previous_action = Some(action),
            TrajectoryEntry::State(state) => {
                let typed = previous_action.is_some_and(|a| a.kind() == ActionKind::Type);
                let url = &state.info.page.url;
                if typed || excluded_hosts.iter().any(|h| url.contains(h)) {
                    continue;
                }
                let form = FormState::from_state(state);
                if form.has_form() {
                    out.push(form);
                }
            }
            TrajectoryEntry::Unparsed { .. } => {}
        }
    }
    out
}

pub fn save_form_states(path: &Path, forms: &[FormState]) -> Result<(), TrajectoryError> {
    let bytes = bincode::serde::encode_to_vec(forms, bincode::config::standard())?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, bytes)?;
    Ok(())
}

pub fn load_form_states(path: &Path) -> Result<Vec<FormState>, TrajectoryError> {
    let bytes = fs::read(path)?;
    let (forms, _) = bincode::serde::decode_from_slice(&bytes, bincode::config::standard())?;
    Ok(forms)
}
