//! Trajectory persistence.
//!
//! A run is one bincode blob holding the alternating state/action list. It is
//! rewritten after every step so an interrupted run can still be analysed.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::actions::Action;
use crate::error::TrajectoryError;
use crate::types::StateInfo;

/// File extension of persisted trajectories.
pub const TRAJECTORY_EXT: &str = "bin";
/// File stem of the aggregated form-state file written next to trajectories.
pub const OVERALL_STEM: &str = "overall";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TrajectoryEntry {
    State(StateInfo),
    Action(Action),
    /// Agent output that did not parse as an action. Occupies an action slot.
    Unparsed { raw: String, error: String },
}

impl TrajectoryEntry {
    pub fn as_state(&self) -> Option<&StateInfo> {
        match self {
            TrajectoryEntry::State(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_action_slot(&self) -> bool {
        !matches!(self, TrajectoryEntry::State(_))
    }
}

pub type Trajectory = Vec<TrajectoryEntry>;

pub fn states(trajectory: &[TrajectoryEntry]) -> impl Iterator<Item = &StateInfo> {
    trajectory.iter().filter_map(TrajectoryEntry::as_state)
}

pub fn actions(trajectory: &[TrajectoryEntry]) -> impl Iterator<Item = &Action> {
    trajectory.iter().filter_map(|e| match e {
        TrajectoryEntry::Action(a) => Some(a),
        _ => None,
    })
}

/// Write through a temp file and rename, so readers never see a torn file.
pub fn save_trajectory(path: &Path, trajectory: &[TrajectoryEntry]) -> Result<(), TrajectoryError> {
    let bytes = bincode::serde::encode_to_vec(trajectory, bincode::config::standard())?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension(format!("{TRAJECTORY_EXT}.tmp"));
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)?;
    debug!("Saved {} trajectory entries to {}", trajectory.len(), path.display());
    Ok(())
}

pub fn load_trajectory(path: &Path) -> Result<Trajectory, TrajectoryError> {
    let bytes = fs::read(path)?;
    let (trajectory, _) = bincode::serde::decode_from_slice(&bytes, bincode::config::standard())?;
    Ok(trajectory)
}

/// URL without its query string.
pub fn url_process(url: &str) -> &str {
    url.split('?').next().unwrap_or(url)
}

/// Trajectory files directly in `dir` or one level below it.
pub fn trajectory_files(dir: &Path) -> Result<Vec<PathBuf>, TrajectoryError> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            for sub in fs::read_dir(&path)? {
                let sub = sub?.path();
                if is_trajectory_file(&sub) {
                    files.push(sub);
                }
            }
        } else if is_trajectory_file(&path) {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

fn is_trajectory_file(path: &Path) -> bool {
    path.extension().is_some_and(|e| e == TRAJECTORY_EXT)
        && path
            .file_stem()
            .is_some_and(|s| !s.to_string_lossy().contains(OVERALL_STEM))
}

/// Query-less URLs of every state in every readable trajectory under `dir`.
/// Unreadable files are skipped.
pub fn visited_links(dir: &Path) -> Result<Vec<String>, TrajectoryError> {
    let mut urls = Vec::new();
    for file in trajectory_files(dir)? {
        match load_trajectory(&file) {
            Ok(trajectory) => urls.extend(
                states(&trajectory).map(|s| url_process(&s.info.page.url).to_string()),
            ),
            Err(e) => debug!("Skipping unreadable trajectory {}: {}", file.display(), e),
        }
    }
    Ok(urls)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Info, Observation};

    fn state(url: &str) -> TrajectoryEntry {
        let mut info = Info::default();
        info.page.url = url.to_string();
        TrajectoryEntry::State(StateInfo {
            observation: Observation {
                text: format!("Tab 0 (current): {url}"),
                image: None,
            },
            info,
        })
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run_0.bin");
        let trajectory = vec![
            state("https://a.example/?q=1"),
            TrajectoryEntry::Action(Action::click(3)),
            state("https://a.example/signup"),
            TrajectoryEntry::Unparsed {
                raw: "clik [3]".to_string(),
                error: "unknown action".to_string(),
            },
            state("https://a.example/signup"),
        ];
        save_trajectory(&path, &trajectory).unwrap();

        let loaded = load_trajectory(&path).unwrap();
        assert_eq!(loaded, trajectory);
        assert_eq!(actions(&loaded).count(), 1);
        assert_eq!(loaded.iter().filter(|e| e.is_action_slot()).count(), 2);
        assert!(!dir.path().join("run_0.bin.tmp").exists());
    }

    #[test]
    fn test_overwrite_grows_incrementally() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.bin");
        let mut trajectory = vec![state("https://a.example/")];
        save_trajectory(&path, &trajectory).unwrap();
        trajectory.push(TrajectoryEntry::Action(Action::scroll(
            crate::actions::ScrollDirection::Down,
        )));
        trajectory.push(state("https://a.example/"));
        save_trajectory(&path, &trajectory).unwrap();

        assert_eq!(load_trajectory(&path).unwrap().len(), 3);
    }

    #[test]
    fn test_url_process() {
        assert_eq!(url_process("https://a.example/p?x=1&y=2"), "https://a.example/p");
        assert_eq!(url_process("https://a.example/p"), "https://a.example/p");
    }

    #[test]
    fn test_visited_links_walks_subfolders() {
        let dir = tempfile::tempdir().unwrap();
        save_trajectory(&dir.path().join("a.bin"), &[state("https://a.example/?ref=x")]).unwrap();
        save_trajectory(
            &dir.path().join("site_b").join("b.bin"),
            &[state("https://b.example/form")],
        )
        .unwrap();
        save_trajectory(&dir.path().join("overall.bin"), &[state("https://skip.example/")])
            .unwrap();
        fs::write(dir.path().join("broken.bin"), b"not bincode").unwrap();

        let links = visited_links(dir.path()).unwrap();
        assert_eq!(
            links,
            vec!["https://a.example/".to_string(), "https://b.example/form".to_string()]
        );
    }
}
