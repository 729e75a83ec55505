use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand, ValueEnum};
use dotenvy::dotenv;
use serde::Serialize;
use tracing::{info, warn};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use formscout::config::{ProxyConfig, Viewport};
use formscout::dedup::{
    DEFAULT_EXCLUDED_HOSTS, collect_form_states, remove_duplicates_by_key, save_form_states,
};
use formscout::runner::{self, EarlyStopThresholds, ScriptedAgent};
use formscout::trajectory::{
    OVERALL_STEM, TRAJECTORY_EXT, load_trajectory, trajectory_files, visited_links,
};
use formscout::{BrowserEnv, ChromeLauncher, EnvConfig, ObservationKind};

#[derive(Parser)]
#[command(name = "formscout")]
#[command(about = "Explore websites and collect form observations")]
#[command(version)]
struct Cli {
    /// Directory for rolling log files
    #[arg(long, default_value = "log_files", global = true)]
    log_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run tasks and record a trajectory per task config
    Run(RunArgs),
    /// Gather deduplicated form states from recorded trajectories
    SelectForms {
        /// Folder holding trajectory files (one subfolder level is searched)
        folder: PathBuf,
    },
}

#[derive(Clone, Copy, Serialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
enum ObservationArg {
    AccessibilityTree,
    Html,
    Image,
}

impl From<ObservationArg> for ObservationKind {
    fn from(arg: ObservationArg) -> Self {
        match arg {
            ObservationArg::AccessibilityTree => ObservationKind::AccessibilityTree,
            ObservationArg::Html => ObservationKind::Text,
            ObservationArg::Image => ObservationKind::Image,
        }
    }
}

#[derive(Args, Serialize)]
struct RunArgs {
    /// Task config files, or directories of them
    #[arg(required = true)]
    configs: Vec<PathBuf>,

    #[arg(long, default_value = "results")]
    result_dir: PathBuf,

    /// Show the browser window
    #[arg(long)]
    render: bool,

    #[arg(long, value_enum, default_value = "accessibility-tree")]
    observation_type: ObservationArg,

    #[arg(long)]
    current_viewport_only: bool,

    #[arg(long, default_value_t = 1280)]
    viewport_width: u32,

    #[arg(long, default_value_t = 720)]
    viewport_height: u32,

    /// Seconds to wait after each action
    #[arg(long, default_value_t = 0.0)]
    sleep_after_execution: f64,

    #[arg(long, default_value_t = 20)]
    max_steps: usize,

    #[arg(long, default_value_t = 3)]
    parsing_failure_th: usize,

    #[arg(long, default_value_t = 5)]
    repeating_action_failure_th: usize,

    /// Action lines to replay for every task
    #[arg(long)]
    script: Option<PathBuf>,

    /// Chrome or Chromium binary
    #[arg(long, env = "CHROME_PATH")]
    chrome_path: Option<PathBuf>,

    /// Attach to a running browser instead of launching one
    #[arg(long, env = "FORMSCOUT_REMOTE_DEBUGGING_URL")]
    remote_debugging_url: Option<String>,
}

impl RunArgs {
    fn env_config(&self) -> EnvConfig {
        EnvConfig {
            headless: !self.render,
            viewport: Viewport {
                width: self.viewport_width,
                height: self.viewport_height,
            },
            observation_kind: self.observation_type.into(),
            current_viewport_only: self.current_viewport_only,
            sleep_after_execution_ms: (self.sleep_after_execution.max(0.0) * 1000.0) as u64,
            proxy: ProxyConfig::from_env(),
            chrome_path: self.chrome_path.clone(),
            remote_debugging_url: self.remote_debugging_url.clone(),
            ..EnvConfig::default()
        }
    }

    fn thresholds(&self) -> EarlyStopThresholds {
        EarlyStopThresholds {
            max_steps: self.max_steps,
            parsing_failure: self.parsing_failure_th,
            repeating_action: self.repeating_action_failure_th,
            ..EarlyStopThresholds::default()
        }
    }
}

/// Initialize tracing with console and file output.
fn init_tracing(log_dir: &Path) -> Result<()> {
    std::fs::create_dir_all(log_dir)?;

    let file_appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix("formscout")
        .filename_suffix("log")
        .max_log_files(30)
        .build(log_dir)?;
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    // The guard flushes the file writer on drop; keep it for the whole run.
    static GUARD: std::sync::OnceLock<tracing_appender::non_blocking::WorkerGuard> =
        std::sync::OnceLock::new();
    let _ = GUARD.set(guard);

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_target(true).with_ansi(true))
        .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
        .init();

    Ok(())
}

/// Expand directories into the `.json` files they contain, sorted.
fn task_configs(paths: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut configs = Vec::new();
    for path in paths {
        if path.is_dir() {
            let mut found: Vec<PathBuf> = std::fs::read_dir(path)
                .with_context(|| format!("listing {}", path.display()))?
                .filter_map(|e| e.ok().map(|e| e.path()))
                .filter(|p| p.extension().is_some_and(|e| e == "json"))
                .collect();
            found.sort();
            configs.extend(found);
        } else {
            configs.push(path.clone());
        }
    }
    Ok(configs)
}

fn run(args: RunArgs) -> Result<()> {
    let configs = task_configs(&args.configs)?;
    if configs.is_empty() {
        bail!("no task configs found");
    }
    std::fs::create_dir_all(&args.result_dir)
        .with_context(|| format!("creating {}", args.result_dir.display()))?;
    std::fs::write(
        args.result_dir.join("config.json"),
        serde_json::to_string_pretty(&args)?,
    )?;

    let visited: HashSet<String> = visited_links(&args.result_dir)?.into_iter().collect();
    info!(
        "{} task(s) to run, {} link(s) already visited",
        configs.len(),
        visited.len()
    );

    let mut agent = match &args.script {
        Some(path) => ScriptedAgent::from_file(path)?,
        None => ScriptedAgent::default(),
    };
    let mut env = BrowserEnv::new(Box::new(ChromeLauncher), args.env_config());
    let summaries = runner::run_all(
        &mut env,
        &mut agent,
        &configs,
        &args.result_dir,
        &args.thresholds(),
        visited,
    );

    info!("{} of {} task(s) finished", summaries.len(), configs.len());
    Ok(())
}

fn select_forms(folder: &Path) -> Result<()> {
    let mut forms = Vec::new();
    for file in trajectory_files(folder)? {
        match load_trajectory(&file) {
            Ok(trajectory) => forms.extend(collect_form_states(&trajectory, DEFAULT_EXCLUDED_HOSTS)),
            Err(e) => warn!("Skipping {}: {}", file.display(), e),
        }
    }
    let collected = forms.len();
    let forms = remove_duplicates_by_key(forms, |f| f.textboxes.clone());

    let out = folder.join(format!("{OVERALL_STEM}.{TRAJECTORY_EXT}"));
    save_form_states(&out, &forms)?;
    info!(
        "Kept {} of {} form state(s) in {}",
        forms.len(),
        collected,
        out.display()
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    let cli = Cli::parse();
    init_tracing(&cli.log_dir)?;

    // The browser driver is synchronous; keep it off the async workers.
    match cli.command {
        Commands::Run(args) => tokio::task::spawn_blocking(move || run(args)).await?,
        Commands::SelectForms { folder } => {
            tokio::task::spawn_blocking(move || select_forms(&folder)).await?
        }
    }
}
