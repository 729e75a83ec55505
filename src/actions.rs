use std::fmt;
use std::str::FromStr;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::ActionParseError;

/// Separator between bracket groups: `] [` with any amount of whitespace.
static GROUP_SEP: Lazy<Regex> = Lazy::new(|| Regex::new(r"\]\s*\[").expect("valid regex"));

/// A single primitive action issued against the current page.
///
/// Element ids refer to the observation that was current when the action was
/// chosen; they are reassigned on every observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Action {
    Navigate { url: String },
    Click { target: ClickTarget },
    Type { element_id: usize, text: String, clear_first: bool },
    Hover { element_id: usize },
    KeyPress { keys: KeyCombo },
    Scroll { direction: ScrollDirection },
    SelectOption { element_id: usize, value: String },
    NewTab,
    TabFocus { index: usize },
    PageClose,
    GoBack,
    GoForward,
    Stop { reason: String },
    /// One line of JavaScript evaluated in the current page.
    RawScript { script: String },
}

/// What a click is aimed at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClickTarget {
    Element(usize),
    /// Tried in order; used for modal closers found by the resolver.
    Xpaths(Vec<String>),
    /// Visible link text, resolved to the link's URL on the current page.
    LinkText(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScrollDirection {
    Up,
    Down,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Modifier {
    Alt,
    Control,
    Meta,
    Shift,
}

/// A key with optional modifiers, written `Control+a` or `Enter`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyCombo {
    pub modifiers: Vec<Modifier>,
    pub key: String,
}

/// Action tag without payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionKind {
    Navigate,
    Click,
    Type,
    Hover,
    KeyPress,
    Scroll,
    SelectOption,
    NewTab,
    TabFocus,
    PageClose,
    GoBack,
    GoForward,
    Stop,
    RawScript,
}

impl KeyCombo {
    pub fn parse(s: &str) -> Result<Self, ActionParseError> {
        let s = s.trim();
        // a trailing '+' that is not a separator is the plus key itself
        let (mods, key) = if s == "+" {
            ("", "+")
        } else if let Some(head) = s.strip_suffix("++") {
            (head, "+")
        } else {
            match s.rsplit_once('+') {
                Some((head, key)) => (head, key),
                None => ("", s),
            }
        };
        if key.is_empty() {
            return Err(ActionParseError::InvalidKey(s.to_string()));
        }

        let mut modifiers = Vec::new();
        for m in mods.split('+').filter(|m| !m.is_empty()) {
            let modifier = match m.to_ascii_lowercase().as_str() {
                "alt" | "option" => Modifier::Alt,
                "control" | "ctrl" => Modifier::Control,
                "meta" | "cmd" | "command" => Modifier::Meta,
                "shift" => Modifier::Shift,
                _ => return Err(ActionParseError::InvalidKey(s.to_string())),
            };
            if !modifiers.contains(&modifier) {
                modifiers.push(modifier);
            }
        }

        Ok(Self {
            modifiers,
            key: key.to_string(),
        })
    }
}

impl fmt::Display for KeyCombo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for m in &self.modifiers {
            let name = match m {
                Modifier::Alt => "Alt",
                Modifier::Control => "Control",
                Modifier::Meta => "Meta",
                Modifier::Shift => "Shift",
            };
            write!(f, "{name}+")?;
        }
        write!(f, "{}", self.key)
    }
}

impl Action {
    pub fn navigate(url: impl Into<String>) -> Self {
        Action::Navigate { url: url.into() }
    }

    pub fn click(element_id: usize) -> Self {
        Action::Click {
            target: ClickTarget::Element(element_id),
        }
    }

    pub fn click_xpaths(xpaths: Vec<String>) -> Self {
        Action::Click {
            target: ClickTarget::Xpaths(xpaths),
        }
    }

    /// The action recorded after closing modals by xpath.
    pub fn modal_close(closed_xpaths: Vec<String>) -> Self {
        Self::click_xpaths(closed_xpaths)
    }

    pub fn click_link(text: impl Into<String>) -> Self {
        Action::Click {
            target: ClickTarget::LinkText(text.into()),
        }
    }

    pub fn type_text(element_id: usize, text: impl Into<String>, clear_first: bool) -> Self {
        Action::Type {
            element_id,
            text: text.into(),
            clear_first,
        }
    }

    pub fn hover(element_id: usize) -> Self {
        Action::Hover { element_id }
    }

    pub fn key_press(combo: &str) -> Result<Self, ActionParseError> {
        Ok(Action::KeyPress {
            keys: KeyCombo::parse(combo)?,
        })
    }

    pub fn scroll(direction: ScrollDirection) -> Self {
        Action::Scroll { direction }
    }

    pub fn select_option(element_id: usize, value: impl Into<String>) -> Self {
        Action::SelectOption {
            element_id,
            value: value.into(),
        }
    }

    pub fn new_tab() -> Self {
        Action::NewTab
    }

    pub fn tab_focus(index: usize) -> Self {
        Action::TabFocus { index }
    }

    pub fn page_close() -> Self {
        Action::PageClose
    }

    pub fn go_back() -> Self {
        Action::GoBack
    }

    pub fn go_forward() -> Self {
        Action::GoForward
    }

    pub fn stop(reason: impl Into<String>) -> Self {
        Action::Stop {
            reason: reason.into(),
        }
    }

    pub fn raw_script(script: impl Into<String>) -> Self {
        Action::RawScript {
            script: script.into(),
        }
    }

    pub fn kind(&self) -> ActionKind {
        match self {
            Action::Navigate { .. } => ActionKind::Navigate,
            Action::Click { .. } => ActionKind::Click,
            Action::Type { .. } => ActionKind::Type,
            Action::Hover { .. } => ActionKind::Hover,
            Action::KeyPress { .. } => ActionKind::KeyPress,
            Action::Scroll { .. } => ActionKind::Scroll,
            Action::SelectOption { .. } => ActionKind::SelectOption,
            Action::NewTab => ActionKind::NewTab,
            Action::TabFocus { .. } => ActionKind::TabFocus,
            Action::PageClose => ActionKind::PageClose,
            Action::GoBack => ActionKind::GoBack,
            Action::GoForward => ActionKind::GoForward,
            Action::Stop { .. } => ActionKind::Stop,
            Action::RawScript { .. } => ActionKind::RawScript,
        }
    }

    /// Parse the text form, e.g. `click [12]` or `type [4] [jane@example.com] [1]`.
    pub fn parse(descriptor: &str) -> Result<Self, ActionParseError> {
        let descriptor = descriptor.trim();
        if descriptor.is_empty() {
            return Err(ActionParseError::Empty);
        }
        let (verb, rest) = match descriptor.split_once(char::is_whitespace) {
            Some((verb, rest)) => (verb, rest.trim()),
            None => (descriptor, ""),
        };
        let groups = bracket_groups(verb, rest)?;
        let malformed = |detail: &str| ActionParseError::Malformed {
            verb: verb.to_string(),
            detail: detail.to_string(),
        };

        match verb {
            "goto" => {
                let url = exactly_one(&groups)
                    .filter(|g| !g.is_empty())
                    .ok_or_else(|| malformed("expected one [url]"))?;
                Ok(Action::navigate(url.as_str()))
            }
            "click" => {
                if groups.is_empty() {
                    return Err(malformed("expected [id]"));
                }
                if groups.iter().all(|g| g.starts_with("xpath=")) {
                    let xpaths = groups
                        .iter()
                        .map(|g| g.trim_start_matches("xpath=").to_string())
                        .collect();
                    return Ok(Action::click_xpaths(xpaths));
                }
                let text = exactly_one(&groups)
                    .filter(|g| !g.is_empty())
                    .ok_or_else(|| malformed("expected one [id] or [link text]"))?;
                match text.parse::<usize>() {
                    Ok(id) => Ok(Action::click(id)),
                    Err(_) => Ok(Action::click_link(text.as_str())),
                }
            }
            "type" => {
                if groups.len() < 2 {
                    return Err(malformed("expected [id] [text] [clear:0|1]"));
                }
                let id = parse_id(&groups[0]).ok_or_else(|| malformed("element id must be a number"))?;
                let (text_groups, clear_first) = match groups.last().map(String::as_str) {
                    Some("0") if groups.len() >= 3 => (&groups[1..groups.len() - 1], false),
                    Some("1") if groups.len() >= 3 => (&groups[1..groups.len() - 1], true),
                    _ => (&groups[1..], true),
                };
                Ok(Action::type_text(id, text_groups.join("] ["), clear_first))
            }
            "hover" => {
                let id = exactly_one(&groups)
                    .and_then(|g| parse_id(g))
                    .ok_or_else(|| malformed("expected [id]"))?;
                Ok(Action::hover(id))
            }
            "press" => {
                let combo = exactly_one(&groups)
                    .filter(|g| !g.is_empty())
                    .ok_or_else(|| malformed("expected one [key-combo]"))?;
                Action::key_press(combo)
            }
            "scroll" => {
                let dir = exactly_one(&groups).ok_or_else(|| malformed("expected [up|down]"))?;
                match dir.trim_start_matches("direction=").to_ascii_lowercase().as_str() {
                    "up" => Ok(Action::scroll(ScrollDirection::Up)),
                    "down" => Ok(Action::scroll(ScrollDirection::Down)),
                    _ => Err(malformed("direction must be up or down")),
                }
            }
            "select_option" => {
                if groups.len() < 2 {
                    return Err(malformed("expected [id] [value]"));
                }
                let id = parse_id(&groups[0]).ok_or_else(|| malformed("element id must be a number"))?;
                Ok(Action::select_option(id, groups[1..].join("] [")))
            }
            "new_tab" | "close_tab" | "page_close" | "go_back" | "go_forward" => {
                if !groups.is_empty() {
                    return Err(malformed("takes no arguments"));
                }
                Ok(match verb {
                    "new_tab" => Action::new_tab(),
                    "go_back" => Action::go_back(),
                    "go_forward" => Action::go_forward(),
                    _ => Action::page_close(),
                })
            }
            "tab_focus" => {
                let index = exactly_one(&groups)
                    .and_then(|g| parse_id(g))
                    .ok_or_else(|| malformed("expected [index]"))?;
                Ok(Action::tab_focus(index))
            }
            "stop" => Ok(Action::stop(single_text(&groups).unwrap_or_default())),
            "script" => {
                let script = exactly_one(&groups)
                    .filter(|g| !g.is_empty())
                    .ok_or_else(|| malformed("expected one [script]"))?;
                Ok(Action::raw_script(script.as_str()))
            }
            other => Err(ActionParseError::UnknownVerb(other.to_string())),
        }
    }
}

impl FromStr for Action {
    type Err = ActionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Action::parse(s)
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Navigate { url } => write!(f, "goto [{url}]"),
            Action::Click { target } => match target {
                ClickTarget::Element(id) => write!(f, "click [{id}]"),
                ClickTarget::LinkText(text) => write!(f, "click [{text}]"),
                ClickTarget::Xpaths(xpaths) => {
                    write!(f, "click")?;
                    for xpath in xpaths {
                        write!(f, " [xpath={xpath}]")?;
                    }
                    Ok(())
                }
            },
            Action::Type {
                element_id,
                text,
                clear_first,
            } => write!(f, "type [{element_id}] [{text}] [{}]", u8::from(*clear_first)),
            Action::Hover { element_id } => write!(f, "hover [{element_id}]"),
            Action::KeyPress { keys } => write!(f, "press [{keys}]"),
            Action::Scroll { direction } => match direction {
                ScrollDirection::Up => write!(f, "scroll [up]"),
                ScrollDirection::Down => write!(f, "scroll [down]"),
            },
            Action::SelectOption { element_id, value } => {
                write!(f, "select_option [{element_id}] [{value}]")
            }
            Action::NewTab => write!(f, "new_tab"),
            Action::TabFocus { index } => write!(f, "tab_focus [{index}]"),
            Action::PageClose => write!(f, "close_tab"),
            Action::GoBack => write!(f, "go_back"),
            Action::GoForward => write!(f, "go_forward"),
            Action::Stop { reason } => write!(f, "stop [{reason}]"),
            Action::RawScript { script } => write!(f, "script [{script}]"),
        }
    }
}

/// True when two actions have the same tag and the same target. Typed text,
/// selected values and stop reasons are ignored. Only used for loop detection.
pub fn is_equivalent(a: &Action, b: &Action) -> bool {
    match (a, b) {
        (Action::Navigate { url: x }, Action::Navigate { url: y }) => x == y,
        (Action::Click { target: x }, Action::Click { target: y }) => x == y,
        (Action::Type { element_id: x, .. }, Action::Type { element_id: y, .. }) => x == y,
        (Action::Hover { element_id: x }, Action::Hover { element_id: y }) => x == y,
        (Action::KeyPress { keys: x }, Action::KeyPress { keys: y }) => x == y,
        (Action::Scroll { direction: x }, Action::Scroll { direction: y }) => x == y,
        (Action::SelectOption { element_id: x, .. }, Action::SelectOption { element_id: y, .. }) => {
            x == y
        }
        (Action::TabFocus { index: x }, Action::TabFocus { index: y }) => x == y,
        (Action::RawScript { script: x }, Action::RawScript { script: y }) => x == y,
        _ => a.kind() == b.kind() && matches!(
            a.kind(),
            ActionKind::NewTab
                | ActionKind::PageClose
                | ActionKind::GoBack
                | ActionKind::GoForward
                | ActionKind::Stop
        ),
    }
}

fn bracket_groups(verb: &str, rest: &str) -> Result<Vec<String>, ActionParseError> {
    if rest.is_empty() {
        return Ok(Vec::new());
    }
    if !rest.starts_with('[') || !rest.ends_with(']') || rest.len() < 2 {
        return Err(ActionParseError::Malformed {
            verb: verb.to_string(),
            detail: format!("arguments must be bracketed: {rest}"),
        });
    }
    let inner = &rest[1..rest.len() - 1];
    Ok(GROUP_SEP.split(inner).map(|g| g.trim().to_string()).collect())
}

/// Every group joined back together; for verbs whose only argument is free text.
fn single_text(groups: &[String]) -> Option<String> {
    if groups.is_empty() {
        return None;
    }
    let text = groups.join("] [");
    (!text.is_empty()).then_some(text)
}

fn exactly_one(groups: &[String]) -> Option<&String> {
    match groups {
        [one] => Some(one),
        _ => None,
    }
}

fn parse_id(s: &str) -> Option<usize> {
    s.trim().parse().ok()
}
