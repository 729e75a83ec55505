//! Browser environment for collecting web-form observations.
//!
//! A [`BrowserEnv`] drives Chrome through the [`driver`] seams, renders each
//! page as an indexed accessibility outline, resolves cookie banners, modals
//! and form iframes, and hands back one [`StepOutput`] per action. The
//! [`runner`] loop records trajectories; [`dedup`] selects form states from them.

pub mod actions;
pub mod config;
pub mod dedup;
pub mod dom;
pub mod driver;
pub mod env;
pub mod error;
pub mod hands;
pub mod indexer;
pub mod observation;
pub mod resolver;
pub mod runner;
pub mod trajectory;
pub mod types;

#[cfg(test)]
pub(crate) mod fake_browser;

pub use actions::Action;
pub use config::{EnvConfig, InstanceConfig};
pub use env::{BrowserEnv, ResetOptions};
pub use error::{DriverError, EnvError};
pub use hands::ChromeLauncher;
pub use observation::ObservationKind;
pub use runner::{Agent, EarlyStopThresholds, ScriptedAgent};
pub use types::{Info, Observation, StepOutput};
