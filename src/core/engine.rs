//! Build execution engine.
//!
//! Runs an ordered chain of steps for one (branch, commit) build. Each step
//! reports `StepOutcome::Continue` to advance or `StepOutcome::Halt` to stop
//! the chain; the engine closes the build log deterministically on both
//! paths, so a halted chain never leaks an open log stream.
//!
//! Steps own their failure reporting: a step that sees a non-zero exit code
//! writes `Failure` status itself and halts. The engine only routes errors a
//! step could not absorb to the configured error handler (default:
//! propagate to the caller).

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::domain::{BuildState, BuildStatus};

use super::build_log::BuildLog;
use super::registry::{Registry, RegistryError};

/// Progress written by `init` before any step runs
const INITIAL_PROGRESSION: u8 = 10;

/// Errors from engine misuse and initialization
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Commit {0} has already been built; pass force to rebuild")]
    DuplicateBuild(String),

    #[error("Engine was run before init")]
    NotInitialized,

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// What a step tells the engine to do next
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// Proceed to the next step
    Continue,

    /// Stop the chain here (the step has already written its status)
    Halt(String),
}

/// One unit of work in a build chain
#[async_trait]
pub trait BuildStep: Send + Sync {
    /// Step name for logs
    fn name(&self) -> &str;

    /// Execute the step
    async fn run(&self, ctx: &StepContext) -> Result<StepOutcome>;
}

/// Everything a step may touch during a build
pub struct StepContext {
    /// Status record for this build, committed through the registry
    pub status: StatusTracker,

    /// Per-build log sink
    pub log: BuildLog,

    /// Shared pipeline registry
    pub registry: Arc<Registry>,

    /// Name of the pipeline being built
    pub pipeline_name: String,
}

/// Mutable (commit, branch, status, progression) tuple for one build.
///
/// Every mutation is write-through: the registry's copy is the durable one.
#[derive(Clone)]
pub struct StatusTracker {
    registry: Arc<Registry>,
    pipeline_name: String,
    commit_id: String,
    branch_name: String,
}

impl StatusTracker {
    /// Commit id of the build this tracker belongs to
    pub fn commit_id(&self) -> &str {
        &self.commit_id
    }

    /// Branch the build was triggered for
    pub fn branch_name(&self) -> &str {
        &self.branch_name
    }

    /// Persist a new (status, progression) pair for this build
    pub async fn set(&self, status: BuildState, progression: u8) -> Result<(), RegistryError> {
        self.registry
            .upsert_build_status(
                &self.pipeline_name,
                BuildStatus::new(&self.commit_id, &self.branch_name, status, progression),
            )
            .await
    }
}

/// Handler invoked when a step returns an error the engine caught
pub type ErrorHandler = Box<dyn Fn(anyhow::Error) -> Result<()> + Send + Sync>;

/// Step-chain engine for one build
pub struct BuildEngine {
    registry: Arc<Registry>,
    log_dir: PathBuf,
    pipeline_name: String,
    steps: Vec<Box<dyn BuildStep>>,
    ctx: Option<StepContext>,
    on_error: ErrorHandler,
}

impl BuildEngine {
    /// Create an engine for one pipeline; call `init` before `run`
    pub fn new(registry: Arc<Registry>, log_dir: impl Into<PathBuf>, pipeline_name: impl Into<String>) -> Self {
        Self {
            registry,
            log_dir: log_dir.into(),
            pipeline_name: pipeline_name.into(),
            steps: Vec::new(),
            ctx: None,
            on_error: Box::new(|e| Err(e)),
        }
    }

    /// Replace the default propagate-to-caller error handler
    pub fn on_error(&mut self, handler: ErrorHandler) -> &mut Self {
        self.on_error = handler;
        self
    }

    /// Append a step; steps execute in registration order
    pub fn add_step(&mut self, step: impl BuildStep + 'static) -> &mut Self {
        self.steps.push(Box::new(step));
        self
    }

    /// Path of the build log this engine writes for a commit
    pub fn log_path(&self, commit_id: &str) -> PathBuf {
        self.log_dir.join(format!("{}.log", commit_id))
    }

    /// Prepare a build: idempotency guard, fresh log, initial status.
    ///
    /// The existing build log for a commit is the at-most-one-build-per-
    /// commit guard; `force` overrides it and truncates the old log.
    pub async fn init(
        &mut self,
        commit_id: &str,
        branch_name: &str,
        force: bool,
    ) -> Result<(), EngineError> {
        let log_path = self.log_path(commit_id);

        if tokio::fs::try_exists(&log_path).await? && !force {
            return Err(EngineError::DuplicateBuild(commit_id.to_string()));
        }

        let status = StatusTracker {
            registry: Arc::clone(&self.registry),
            pipeline_name: self.pipeline_name.clone(),
            commit_id: commit_id.to_string(),
            branch_name: branch_name.to_string(),
        };
        status.set(BuildState::InProgress, INITIAL_PROGRESSION).await?;

        let log = BuildLog::create(&log_path).await?;

        self.ctx = Some(StepContext {
            status,
            log,
            registry: Arc::clone(&self.registry),
            pipeline_name: self.pipeline_name.clone(),
        });

        Ok(())
    }

    /// Execute the step chain strictly in registration order.
    ///
    /// The build log is closed on every exit path: completion, halt, and
    /// step error.
    #[instrument(skip(self), fields(pipeline = %self.pipeline_name))]
    pub async fn run(&mut self) -> Result<()> {
        let ctx = self.ctx.take().ok_or(EngineError::NotInitialized)?;

        info!(
            commit = %ctx.status.commit_id(),
            branch = %ctx.status.branch_name(),
            steps = self.steps.len(),
            "Starting build"
        );

        for step in &self.steps {
            match step.run(&ctx).await {
                Ok(StepOutcome::Continue) => {}
                Ok(StepOutcome::Halt(reason)) => {
                    warn!(step = step.name(), %reason, "Build chain halted");
                    ctx.log.close().await?;
                    return Ok(());
                }
                Err(e) => {
                    // Close the log before delegating; the step has already
                    // written its own Failure status if it meant to.
                    let _ = ctx.log.close().await;
                    return (self.on_error)(
                        e.context(format!("step '{}' failed", step.name())),
                    );
                }
            }
        }

        info!(commit = %ctx.status.commit_id(), "Build chain complete");
        ctx.log.close().await?;
        Ok(())
    }
}
