//! Command-line interface for ezpipe.
//!
//! Provides commands for triggering builds, activating built artifacts,
//! and inspecting pipeline status and logs. This is the in-process stand-in
//! for the HTTP layer: it validates, pulls the requested commit, then drives
//! the engine or the process manager.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;

use crate::adapters::GitPuller;
use crate::config::{load_config, PipelineSpec, ResolvedConfig};
use crate::core::{assemble_chain, BuildEngine, ProcessManager, Registry};

/// ezpipe - single-host build-and-deploy orchestrator
#[derive(Parser, Debug)]
#[command(name = "ezpipe")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Pull a commit and run the pipeline's build chain for it
    Trigger {
        /// Pipeline name (must exist in ezpipe.yaml)
        pipeline: String,

        /// Branch the commit belongs to
        branch: String,

        /// Commit id to build
        commit: String,

        /// Rebuild even if this commit was already built
        #[arg(long)]
        force: bool,

        /// Skip the source-control pull (working copy already prepared)
        #[arg(long)]
        no_pull: bool,
    },

    /// Make a previously built artifact the active instance
    Activate {
        /// Pipeline name
        pipeline: String,

        /// Commit id of the artifact to activate
        commit: String,
    },

    /// Print a pipeline's build status as JSON
    Status {
        /// Pipeline name
        pipeline: String,
    },

    /// Print the build log for a commit
    Log {
        /// Commit id
        commit: String,
    },

    /// Print the run log of a pipeline's active instance
    RunLog {
        /// Pipeline name
        pipeline: String,
    },

    /// List configured pipelines and their activation state
    Pipelines,

    /// Show resolved configuration (debug)
    Config,
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        let config = load_config()?;

        match self.command {
            Commands::Trigger {
                pipeline,
                branch,
                commit,
                force,
                no_pull,
            } => trigger_build(&config, &pipeline, &branch, &commit, force, no_pull).await,
            Commands::Activate { pipeline, commit } => {
                activate_artifact(&config, &pipeline, &commit).await
            }
            Commands::Status { pipeline } => show_status(&config, &pipeline).await,
            Commands::Log { commit } => print_file(&config.build_log_path(&commit)).await,
            Commands::RunLog { pipeline } => show_run_log(&config, &pipeline).await,
            Commands::Pipelines => list_pipelines(&config).await,
            Commands::Config => show_config(&config),
        }
    }
}

/// Open the shared registry seeded with the configured pipelines
async fn open_registry(config: &ResolvedConfig) -> Result<Arc<Registry>> {
    let names: Vec<String> = config.pipelines.iter().map(|p| p.name.clone()).collect();
    let registry = Registry::open(config.state_file.clone(), &names)
        .await
        .context("Failed to open pipeline registry")?;
    Ok(Arc::new(registry))
}

/// Resolve a pipeline definition or fail with the configured names
fn find_spec<'a>(config: &'a ResolvedConfig, name: &str) -> Result<&'a PipelineSpec> {
    config.pipeline(name).ok_or_else(|| {
        let known: Vec<&str> = config.pipelines.iter().map(|p| p.name.as_str()).collect();
        anyhow::anyhow!("Unknown pipeline '{}' (configured: {:?})", name, known)
    })
}

/// Pull the commit and run the build chain
async fn trigger_build(
    config: &ResolvedConfig,
    pipeline: &str,
    branch: &str,
    commit: &str,
    force: bool,
    no_pull: bool,
) -> Result<()> {
    let spec = find_spec(config, pipeline)?;
    let registry = open_registry(config).await?;

    if !no_pull {
        GitPuller::new()
            .pull(&spec.repo, commit)
            .await
            .with_context(|| format!("Failed to pull commit {} for {}", commit, pipeline))?;
    }

    let mut engine = BuildEngine::new(registry, config.log_dir.clone(), &spec.name);
    engine.init(commit, branch, force).await?;
    assemble_chain(&mut engine, spec);

    println!("triggered the build process for commit: {}", commit);
    engine.run().await?;

    Ok(())
}

/// Activate a built artifact, replacing the running instance if any
async fn activate_artifact(config: &ResolvedConfig, pipeline: &str, commit: &str) -> Result<()> {
    let spec = find_spec(config, pipeline)?;
    let registry = open_registry(config).await?;

    let manager = ProcessManager::new(registry, config.log_dir.clone(), config.secret.clone());
    let pid = manager.activate(spec, commit).await?;

    if pid > 0 {
        println!("The given branch is considered active (pid {})", pid);
    } else {
        println!("The given branch is considered active");
    }
    Ok(())
}

/// Print the status payload the dashboard consumes
async fn show_status(config: &ResolvedConfig, pipeline: &str) -> Result<()> {
    let registry = open_registry(config).await?;
    let record = registry.get(pipeline).await?;

    let payload = json!({
        "msg": "Return build status",
        "buildingStatus": record.build_status,
    });
    println!("{}", serde_json::to_string_pretty(&payload)?);
    Ok(())
}

/// Print the run log of the active instance
async fn show_run_log(config: &ResolvedConfig, pipeline: &str) -> Result<()> {
    let registry = open_registry(config).await?;
    let record = registry.get(pipeline).await?;

    if record.active_branch.is_empty() {
        anyhow::bail!("Pipeline '{}' has no active branch", pipeline);
    }
    print_file(&config.run_log_path(&record.active_branch)).await
}

async fn print_file(path: &std::path::Path) -> Result<()> {
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    println!("{}", text);
    Ok(())
}

/// List configured pipelines with their registry state
async fn list_pipelines(config: &ResolvedConfig) -> Result<()> {
    let registry = open_registry(config).await?;

    for spec in &config.pipelines {
        let record = registry.get(&spec.name).await?;
        let active = if record.active_branch.is_empty() {
            "-".to_string()
        } else if record.active_pid > 0 {
            format!("{} (pid {})", record.active_branch, record.active_pid)
        } else {
            record.active_branch.clone()
        };

        println!(
            "{:<24} {:?}  active: {}  artifacts: {}",
            spec.name,
            spec.kind,
            active,
            record.available_branches.len()
        );
    }
    Ok(())
}

/// Show resolved configuration
fn show_config(config: &ResolvedConfig) -> Result<()> {
    println!("home:       {}", config.home.display());
    println!("state file: {}", config.state_file.display());
    println!("log dir:    {}", config.log_dir.display());
    match &config.config_file {
        Some(path) => println!("config:     {}", path.display()),
        None => println!("config:     (none found)"),
    }
    println!("pipelines:  {}", config.pipelines.len());
    for spec in &config.pipelines {
        println!(
            "  - {} ({:?}) repo={}",
            spec.name,
            spec.kind,
            spec.repo.display()
        );
    }
    Ok(())
}
