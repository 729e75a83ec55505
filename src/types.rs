use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Element bounding box in CSS pixels, relative to the viewport.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct Bounds {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl Bounds {
    pub fn intersects(&self, other: &Bounds) -> bool {
        self.x < other.x + other.width
            && self.x + self.width > other.x
            && self.y < other.y + other.height
            && self.y + self.height > other.y
    }
}

/// One node of the page's accessibility snapshot, as produced in-page.
/// Nodes form a flat list; `children` holds indices into that list and
/// node 0 is the document root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AxNode {
    pub node_id: usize,
    pub role: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub properties: Vec<(String, String)>,
    #[serde(default)]
    pub children: Vec<usize>,
    #[serde(default)]
    pub xpath: String,
    #[serde(default)]
    pub bounds: Option<Bounds>,
    #[serde(default)]
    pub tag: String,
}

/// Page URL and HTML at observation time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct DetachedPage {
    pub url: String,
    pub content: String,
}

/// An iframe that holds (or may hold) a form, fetched in its own tab.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IframeSnapshot {
    pub content: String,
    pub title: String,
    pub url: String,
    /// Accessibility snapshot of the frame document.
    pub obs: Vec<AxNode>,
}

/// Grounding data for one element id of an observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeInfo {
    /// The outline line without indentation.
    pub text: String,
    pub role: String,
    pub name: String,
    pub xpath: String,
    pub bounds: Option<Bounds>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ObservationMetadata {
    pub obs_nodes_info: BTreeMap<usize, NodeInfo>,
}

/// What the caller sees after `reset`/`step`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Observation {
    pub text: String,
    /// PNG bytes.
    pub image: Option<Vec<u8>>,
}

/// Side-channel data recomputed on every observation. Field names are the
/// keys the form-extraction pipeline reads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Info {
    pub page: DetachedPage,
    pub fail_error: String,
    /// Full, untruncated accessibility snapshot of the current page.
    pub obs: Vec<AxNode>,
    pub observation_metadata: ObservationMetadata,
    /// Lower-cased link text -> absolute URL.
    pub text_url_pairs: BTreeMap<String, String>,
    /// XPath -> outer HTML for every input, button, textarea and select.
    pub xpaths_input: BTreeMap<String, String>,
    /// XPaths of close affordances inside modal containers.
    pub closes_ele: Vec<String>,
    pub popup: bool,
    pub iframe: Vec<IframeSnapshot>,
    pub timestamp: DateTime<Utc>,
}

/// One state of a trajectory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateInfo {
    pub observation: Observation,
    pub info: Info,
}

/// Result of `reset`, `step` and the resolver's corrective calls.
#[derive(Debug, Clone, PartialEq)]
pub struct StepOutput {
    pub observation: Observation,
    /// 1.0 when the dispatched action succeeded, 0.0 otherwise.
    pub reward: f64,
    /// Always false; stopping is the caller's decision.
    pub terminated: bool,
    pub truncated: bool,
    pub info: Info,
}

impl StepOutput {
    pub fn into_tuple(self) -> (Observation, f64, bool, bool, Info) {
        (
            self.observation,
            self.reward,
            self.terminated,
            self.truncated,
            self.info,
        )
    }

    pub fn into_state(self) -> StateInfo {
        StateInfo {
            observation: self.observation,
            info: self.info,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.reward > 0.0
    }
}

/// Close keywords for dialog buttons found in the outline.
pub const CLOSE_KEYWORDS: &[&str] = &["close", "deny", "continu", "all", "decline", "reject"];

/// Roles an agent can act on; always indexed even without a name.
pub const INTERACTIVE_ROLES: &[&str] = &[
    "button",
    "checkbox",
    "combobox",
    "link",
    "listbox",
    "menuitem",
    "menuitemcheckbox",
    "menuitemradio",
    "option",
    "radio",
    "searchbox",
    "slider",
    "spinbutton",
    "switch",
    "tab",
    "textbox",
];
