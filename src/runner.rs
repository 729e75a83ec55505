//! Task loop: reset, clear modals, ask the agent, step, persist.

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::actions::{Action, ActionKind, is_equivalent};
use crate::config::InstanceConfig;
use crate::dedup::unique;
use crate::env::{BrowserEnv, ResetOptions};
use crate::resolver::close_button_id;
use crate::trajectory::{
    TRAJECTORY_EXT, Trajectory, TrajectoryEntry, actions, load_trajectory, save_trajectory, states,
    url_process,
};
use crate::types::StateInfo;

/// Something that picks the next action from the trajectory so far.
pub trait Agent {
    /// Called once per task before the first action.
    fn start_task(&mut self, intent: &str);

    /// Raw action text, parsed by the runner. An `Err` ends the task.
    fn next_action(&mut self, trajectory: &[TrajectoryEntry], intent: &str) -> Result<String>;
}

/// Replays action lines from a file. Blank lines and `#` comments are
/// skipped; the task stops once the script runs out.
#[derive(Debug, Clone, Default)]
pub struct ScriptedAgent {
    script: Vec<String>,
    pending: VecDeque<String>,
}

impl ScriptedAgent {
    pub fn new<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let script: Vec<String> = lines
            .into_iter()
            .map(Into::into)
            .filter(|l| {
                let l = l.trim();
                !l.is_empty() && !l.starts_with('#')
            })
            .collect();
        Self {
            pending: script.iter().cloned().collect(),
            script,
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading action script {}", path.display()))?;
        Ok(Self::new(raw.lines()))
    }
}

impl Agent for ScriptedAgent {
    fn start_task(&mut self, _intent: &str) {
        self.pending = self.script.iter().cloned().collect();
    }

    fn next_action(&mut self, _trajectory: &[TrajectoryEntry], _intent: &str) -> Result<String> {
        Ok(self
            .pending
            .pop_front()
            .unwrap_or_else(|| "stop [script finished]".to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EarlyStopThresholds {
    pub max_steps: usize,
    pub parsing_failure: usize,
    pub repeating_action: usize,
    pub max_seconds_on_page: i64,
}

impl Default for EarlyStopThresholds {
    fn default() -> Self {
        Self {
            max_steps: 20,
            parsing_failure: 3,
            repeating_action: 5,
            max_seconds_on_page: 60,
        }
    }
}

/// Number of trailing states compared for a stalled page structure.
const SAME_STRUCTURE_WINDOW: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    MaxSteps(usize),
    ParseFailures(usize),
    StayedOnPage { url: String, seconds: i64 },
    VisitedLink,
    SameStructure(usize),
    RepeatedAction(usize),
    RepeatedTyping(usize),
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::MaxSteps(n) => write!(f, "Reach max steps {n}"),
            StopReason::ParseFailures(n) => write!(f, "Failed to parse actions for {n} times"),
            StopReason::StayedOnPage { url, seconds } => {
                write!(f, "Stayed on page {url} for more than {seconds} seconds")
            }
            StopReason::VisitedLink => write!(f, "The link has been visited"),
            StopReason::SameStructure(n) => write!(f, "Same page structure for {n} times"),
            StopReason::RepeatedAction(n) => write!(f, "Same action for {n} times"),
            StopReason::RepeatedTyping(n) => write!(f, "Same typing action for {n} times"),
        }
    }
}

/// First reason the run should stop, if any. `visited` holds query-less URLs
/// explored by earlier runs.
pub fn early_stop(
    trajectory: &[TrajectoryEntry],
    thresholds: &EarlyStopThresholds,
    visited: &HashSet<String>,
    now: DateTime<Utc>,
) -> Option<StopReason> {
    let slots: Vec<&TrajectoryEntry> = trajectory.iter().filter(|e| e.is_action_slot()).collect();
    if slots.len() >= thresholds.max_steps {
        return Some(StopReason::MaxSteps(thresholds.max_steps));
    }

    let k = thresholds.parsing_failure;
    if k > 0
        && slots.len() >= k
        && slots[slots.len() - k..]
            .iter()
            .all(|e| matches!(e, TrajectoryEntry::Unparsed { .. }))
    {
        return Some(StopReason::ParseFailures(k));
    }

    let all_states: Vec<&StateInfo> = states(trajectory).collect();
    if let Some(last) = all_states.last() {
        let url = &last.info.page.url;
        let arrived = all_states
            .iter()
            .rev()
            .take_while(|s| &s.info.page.url == url)
            .last()
            .map(|s| s.info.timestamp)
            .unwrap_or(last.info.timestamp);
        if now - arrived > Duration::seconds(thresholds.max_seconds_on_page) {
            return Some(StopReason::StayedOnPage {
                url: url.clone(),
                seconds: thresholds.max_seconds_on_page,
            });
        }

        if visited.contains(url_process(url)) {
            return Some(StopReason::VisitedLink);
        }
    }

    if all_states.len() >= SAME_STRUCTURE_WINDOW {
        let recent: Vec<&str> = all_states[all_states.len() - SAME_STRUCTURE_WINDOW..]
            .iter()
            .map(|s| s.observation.text.as_str())
            .collect();
        if unique(&recent).len() == 1 {
            return Some(StopReason::SameStructure(SAME_STRUCTURE_WINDOW));
        }
    }

    let actions: Vec<&Action> = actions(trajectory).collect();
    let k = thresholds.repeating_action;
    let last = actions.last()?;
    if k == 0 {
        return None;
    }
    if last.kind() == ActionKind::Type {
        let repeats = actions.iter().filter(|a| is_equivalent(a, last)).count();
        (repeats >= k).then_some(StopReason::RepeatedTyping(k))
    } else {
        let repeated = actions.len() >= k
            && actions[actions.len() - k..]
                .iter()
                .all(|a| is_equivalent(a, last));
        repeated.then_some(StopReason::RepeatedAction(k))
    }
}

/// JSON written next to each trajectory.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunMetadata {
    pub config_file: PathBuf,
    pub intent: String,
    pub action_history: Vec<String>,
    pub stop_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub trajectory_path: PathBuf,
    pub metadata_path: PathBuf,
    pub steps: usize,
    pub stop: String,
}

fn config_stem(config_file: &Path) -> String {
    config_file
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "task".to_string())
}

fn persist(
    trajectory: &[TrajectoryEntry],
    trajectory_path: &Path,
    metadata: &RunMetadata,
    metadata_path: &Path,
) -> Result<()> {
    save_trajectory(trajectory_path, trajectory)?;
    let json = serde_json::to_string_pretty(metadata)?;
    fs::write(metadata_path, json)
        .with_context(|| format!("writing {}", metadata_path.display()))?;
    Ok(())
}

fn replace_last_state(trajectory: &mut Trajectory, state: StateInfo) {
    if let Some(pos) = trajectory
        .iter()
        .rposition(|e| matches!(e, TrajectoryEntry::State(_)))
    {
        trajectory[pos] = TrajectoryEntry::State(state);
    }
}

fn last_state(trajectory: &[TrajectoryEntry]) -> Option<&StateInfo> {
    trajectory.iter().rev().find_map(TrajectoryEntry::as_state)
}

/// Run one task to completion. The trajectory and its metadata are
/// rewritten after every step.
pub fn run_task(
    env: &mut BrowserEnv,
    agent: &mut dyn Agent,
    config_file: &Path,
    result_dir: &Path,
    thresholds: &EarlyStopThresholds,
    visited: &HashSet<String>,
) -> Result<RunSummary> {
    let instance = InstanceConfig::load(config_file)?;
    let intent = instance.intent.clone().unwrap_or_default();
    let stem = config_stem(config_file);
    fs::create_dir_all(result_dir)
        .with_context(|| format!("creating {}", result_dir.display()))?;
    let trajectory_path = result_dir.join(format!("trajectory_{stem}.{TRAJECTORY_EXT}"));
    let metadata_path = result_dir.join(format!("metadata_{stem}.json"));

    info!("Running task {} ({})", config_file.display(), intent);
    agent.start_task(&intent);

    let first = env.reset(&ResetOptions {
        config_file: Some(config_file.to_path_buf()),
    })?;
    let mut trajectory: Trajectory = vec![TrajectoryEntry::State(first.into_state())];
    let mut metadata = RunMetadata {
        config_file: config_file.to_path_buf(),
        intent: intent.clone(),
        action_history: vec!["None".to_string()],
        stop_reason: None,
    };
    persist(&trajectory, &trajectory_path, &metadata, &metadata_path)?;

    let mut visited_closers: HashSet<String> = HashSet::new();
    let stop = loop {
        clear_modals(env, &mut trajectory, &mut metadata, &mut visited_closers)?;

        let action = match early_stop(&trajectory, thresholds, visited, Utc::now()) {
            Some(reason) => {
                info!("Early stop: {}", reason);
                Action::stop(format!("Early stop: {reason}"))
            }
            None => match agent.next_action(&trajectory, &intent) {
                Ok(raw) => match Action::parse(&raw) {
                    Ok(action) => action,
                    Err(e) => {
                        warn!("Could not parse action {:?}: {}", raw, e);
                        trajectory.push(TrajectoryEntry::Unparsed {
                            raw: raw.clone(),
                            error: e.to_string(),
                        });
                        metadata.action_history.push(raw);
                        if let Some(state) = last_state(&trajectory).cloned() {
                            trajectory.push(TrajectoryEntry::State(state));
                        }
                        persist(&trajectory, &trajectory_path, &metadata, &metadata_path)?;
                        continue;
                    }
                },
                Err(e) => {
                    error!("Agent failed: {:#}", e);
                    Action::stop(format!("ERROR: {e:#}"))
                }
            },
        };

        metadata.action_history.push(action.to_string());
        trajectory.push(TrajectoryEntry::Action(action.clone()));

        if let Action::Stop { reason } = &action {
            break reason.clone();
        }

        let output = env.step(&action)?;
        if !output.succeeded() {
            debug!("Action {} failed: {}", action, output.info.fail_error);
        }
        trajectory.push(TrajectoryEntry::State(output.into_state()));
        persist(&trajectory, &trajectory_path, &metadata, &metadata_path)?;
    };

    metadata.stop_reason = Some(stop.clone());
    persist(&trajectory, &trajectory_path, &metadata, &metadata_path)?;
    let steps = trajectory.iter().filter(|e| e.is_action_slot()).count();
    info!("Task {} finished after {} step(s): {}", stem, steps, stop);

    Ok(RunSummary {
        trajectory_path,
        metadata_path,
        steps,
        stop,
    })
}

/// Click unvisited modal closers, then fall back to a close button in the
/// outline or to removing the dialog outright. Each successful pass replaces
/// the last recorded state.
fn clear_modals(
    env: &mut BrowserEnv,
    trajectory: &mut Trajectory,
    metadata: &mut RunMetadata,
    visited_closers: &mut HashSet<String>,
) -> Result<()> {
    let Some(state) = last_state(trajectory) else {
        return Ok(());
    };

    let pending: Vec<String> = state
        .info
        .closes_ele
        .iter()
        .filter(|x| !visited_closers.contains(*x))
        .cloned()
        .collect();
    if !pending.is_empty() {
        let outcome = env.modal_close(&pending)?;
        visited_closers.extend(outcome.visited_xpaths);
        if !outcome.closed_xpaths.is_empty() {
            metadata
                .action_history
                .push(Action::modal_close(outcome.closed_xpaths).to_string());
            replace_last_state(trajectory, outcome.output.into_state());
        }
    }

    let Some(state) = last_state(trajectory) else {
        return Ok(());
    };
    if state.info.popup {
        let output = match close_button_id(&state.observation.text) {
            Some(id) => {
                debug!("Clicking dialog button [{}]", id);
                env.step(&Action::click(id))?
            }
            None => env.remove_popups()?,
        };
        replace_last_state(trajectory, output.into_state());
    }
    Ok(())
}

/// Run every config in order. A task that fails is logged to `error.txt`
/// in `result_dir` and the next one starts. URLs reached by a finished run
/// count as visited for the runs after it.
pub fn run_all(
    env: &mut BrowserEnv,
    agent: &mut dyn Agent,
    config_files: &[PathBuf],
    result_dir: &Path,
    thresholds: &EarlyStopThresholds,
    mut visited: HashSet<String>,
) -> Vec<RunSummary> {
    let mut summaries = Vec::new();
    for config_file in config_files {
        match run_task(env, agent, config_file, result_dir, thresholds, &visited) {
            Ok(summary) => {
                if let Ok(trajectory) = load_trajectory(&summary.trajectory_path) {
                    visited.extend(
                        states(&trajectory).map(|s| url_process(&s.info.page.url).to_string()),
                    );
                }
                summaries.push(summary);
            }
            Err(e) => {
                error!("Task {} failed: {:#}", config_file.display(), e);
                let line = format!(
                    "[Config file]: {}\n[Unhandled Error] {:#}\n",
                    config_file.display(),
                    e
                );
                let path = result_dir.join("error.txt");
                let appended = fs::create_dir_all(result_dir).and_then(|()| {
                    fs::OpenOptions::new()
                        .create(true)
                        .append(true)
                        .open(&path)
                        .and_then(|mut f| f.write_all(line.as_bytes()))
                });
                if let Err(io) = appended {
                    warn!("Could not record error in {}: {}", path.display(), io);
                }
            }
        }
    }
    env.close();
    summaries
}

#[cfg(test)]
#[path = "runner_tests.rs"]
mod tests;
