//! Configuration for ezpipe paths and pipeline definitions.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (EZPIPE_HOME, EZPIPE_STATE_FILE, EZPIPE_LOG_DIR, EZPIPE_SECRET)
//! 2. Config file (ezpipe.yaml)
//! 3. Defaults (~/.ezpipe)
//!
//! Config file discovery:
//! - Searches current directory and parents for ezpipe.yaml
//! - Paths in the config file are relative to the config file's directory
//!
//! The resolved config is a plain value handed to the components that need
//! it; there is no ambient global.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigFile {
    pub version: String,
    #[serde(default)]
    pub paths: PathsConfig,
    /// Secret handed to activated services on their command line
    pub secret: Option<String>,
    #[serde(default)]
    pub pipelines: Vec<PipelineSpec>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// State directory (relative to the config file)
    pub home: Option<String>,
    /// Registry document path (defaults to <home>/pipeline_state.json)
    pub state_file: Option<String>,
    /// Build/run log directory (defaults to <home>/logs)
    pub log_dir: Option<String>,
}

/// Definition of one pipeline the orchestrator manages
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineSpec {
    /// Unique pipeline name
    pub name: String,

    /// What kind of artifact this pipeline produces
    pub kind: PipelineKind,

    /// Working copy the source-control puller checks out into
    pub repo: PathBuf,

    /// Where finished artifacts are placed/registered
    pub output_dir: PathBuf,

    /// Extra arguments appended when activating a service artifact
    #[serde(default)]
    pub run_args: Vec<String>,
}

/// Artifact flavor; decides the step chain and the activation path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineKind {
    /// Static web assets; activation just repoints the resources path
    Frontend,

    /// Packaged jar run as a child process
    JarService,
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// State directory
    pub home: PathBuf,
    /// Registry document path
    pub state_file: PathBuf,
    /// Build/run log directory
    pub log_dir: PathBuf,
    /// Secret passed to activated services
    pub secret: String,
    /// Managed pipelines
    pub pipelines: Vec<PipelineSpec>,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
}

impl ResolvedConfig {
    /// Look up a pipeline definition by name
    pub fn pipeline(&self, name: &str) -> Option<&PipelineSpec> {
        self.pipelines.iter().find(|p| p.name == name)
    }

    /// Path of the build log for a commit
    pub fn build_log_path(&self, commit_id: &str) -> PathBuf {
        self.log_dir.join(format!("{}.log", commit_id))
    }

    /// Path of the run log for an activated artifact
    pub fn run_log_path(&self, branch_name: &str) -> PathBuf {
        self.log_dir.join(format!("{}.run.log", branch_name))
    }
}

/// Find config file by searching current directory and parents
fn find_config_file() -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        let config_path = current.join("ezpipe.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to the config file's directory
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
    }
}

/// Load configuration from all sources
pub fn load_config() -> Result<ResolvedConfig> {
    let default_home = dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(".ezpipe");

    let config_file = find_config_file();

    let (home, state_file, log_dir, secret, pipelines) = if let Some(ref config_path) = config_file
    {
        let config = load_config_file(config_path)?;
        let base_dir = config_path.parent().unwrap_or(Path::new("."));

        let home = if let Ok(env_home) = std::env::var("EZPIPE_HOME") {
            PathBuf::from(env_home)
        } else if let Some(ref home_path) = config.paths.home {
            resolve_path(base_dir, home_path)
        } else {
            default_home
        };

        let state_file = if let Ok(env_state) = std::env::var("EZPIPE_STATE_FILE") {
            PathBuf::from(env_state)
        } else if let Some(ref state_path) = config.paths.state_file {
            resolve_path(base_dir, state_path)
        } else {
            home.join("pipeline_state.json")
        };

        let log_dir = if let Ok(env_logs) = std::env::var("EZPIPE_LOG_DIR") {
            PathBuf::from(env_logs)
        } else if let Some(ref log_path) = config.paths.log_dir {
            resolve_path(base_dir, log_path)
        } else {
            home.join("logs")
        };

        let secret = std::env::var("EZPIPE_SECRET")
            .ok()
            .or(config.secret)
            .unwrap_or_default();

        // Pipeline repo/output paths are relative to the config file too
        let pipelines = config
            .pipelines
            .into_iter()
            .map(|mut p| {
                p.repo = resolve_path(base_dir, &p.repo.to_string_lossy());
                p.output_dir = resolve_path(base_dir, &p.output_dir.to_string_lossy());
                p
            })
            .collect();

        (home, state_file, log_dir, secret, pipelines)
    } else {
        // No config file - env vars or defaults, no pipelines defined
        let home = std::env::var("EZPIPE_HOME")
            .map(PathBuf::from)
            .unwrap_or(default_home);

        let state_file = std::env::var("EZPIPE_STATE_FILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| home.join("pipeline_state.json"));

        let log_dir = std::env::var("EZPIPE_LOG_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| home.join("logs"));

        let secret = std::env::var("EZPIPE_SECRET").unwrap_or_default();

        (home, state_file, log_dir, secret, Vec::new())
    };

    Ok(ResolvedConfig {
        home,
        state_file,
        log_dir,
        secret,
        pipelines,
        config_file,
    })
}
