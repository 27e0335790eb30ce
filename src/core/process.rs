//! Process lifecycle manager for activated artifacts.
//!
//! Enforces at most one running instance per pipeline: activation first
//! terminates the previously active process (interrupt, then liveness polls
//! on a fixed budget), then spawns the new artifact with its output
//! redirected to a dedicated run log, and finally records branch, resources
//! path and PID in the registry as one update.
//!
//! Only one activation may be in flight per pipeline; a concurrent request
//! is rejected rather than interleaved.
//!
//! The OS stays authoritative on liveness; the registry's PID is advisory.
//! Signalling and liveness checks shell out to `kill(1)`.

use std::collections::HashSet;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::process::Command;
use tracing::{info, instrument, warn};

use crate::config::{PipelineKind, PipelineSpec};
use crate::domain::BranchInfo;

use super::registry::{Registry, RegistryError};

/// How long a terminating process gets before activation gives up
const TERMINATE_BUDGET: Duration = Duration::from_millis(5000);

/// Interval between liveness polls while terminating
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Errors from activation and termination
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("No built artifact found for commit {0}")]
    UnknownBranch(String),

    #[error("Process {pid} did not exit within {budget_ms}ms")]
    TerminateTimeout { pid: u32, budget_ms: u64 },

    #[error("Failed to start artifact: {0}")]
    SpawnFailed(String),

    #[error("An activation for pipeline {0} is already in flight")]
    ActivationInFlight(String),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Releases the per-pipeline activation slot on drop
struct ActivationGuard {
    in_flight: Arc<Mutex<HashSet<String>>>,
    name: String,
}

impl Drop for ActivationGuard {
    fn drop(&mut self) {
        if let Ok(mut set) = self.in_flight.lock() {
            set.remove(&self.name);
        }
    }
}

/// Starts, tracks and terminates the active process of each pipeline
pub struct ProcessManager {
    registry: Arc<Registry>,
    log_dir: PathBuf,
    secret: String,

    /// Interpreter used to run jar artifacts
    interpreter: String,

    terminate_budget: Duration,
    poll_interval: Duration,

    /// Pipelines with an activation currently in flight
    in_flight: Arc<Mutex<HashSet<String>>>,
}

impl ProcessManager {
    pub fn new(registry: Arc<Registry>, log_dir: impl Into<PathBuf>, secret: impl Into<String>) -> Self {
        Self {
            registry,
            log_dir: log_dir.into(),
            secret: secret.into(),
            interpreter: "java".to_string(),
            terminate_budget: TERMINATE_BUDGET,
            poll_interval: POLL_INTERVAL,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Override the jar interpreter (tests substitute a stub script)
    pub fn with_interpreter(mut self, interpreter: impl Into<String>) -> Self {
        self.interpreter = interpreter.into();
        self
    }

    /// Shrink the termination budget (tests)
    pub fn with_terminate_budget(mut self, budget: Duration, poll: Duration) -> Self {
        self.terminate_budget = budget;
        self.poll_interval = poll;
        self
    }

    /// Make the artifact built for `commit_id` the active instance.
    ///
    /// Returns the new PID (0 for static pipelines). On any failure the
    /// registry's activation state is left untouched.
    #[instrument(skip(self, spec), fields(pipeline = %spec.name, commit = %commit_id))]
    pub async fn activate(&self, spec: &PipelineSpec, commit_id: &str) -> Result<u32, ProcessError> {
        let _guard = self.begin_activation(&spec.name)?;

        let pipeline = self.registry.get(&spec.name).await?;
        let branch = pipeline
            .branch_for_commit(commit_id)
            .cloned()
            .ok_or_else(|| ProcessError::UnknownBranch(commit_id.to_string()))?;

        // Static assets have no process dimension; just repoint the
        // resources path.
        if spec.kind == PipelineKind::Frontend {
            self.registry
                .set_active_resources(&spec.name, &branch.name, &branch.path)
                .await?;
            info!(branch = %branch.name, "Activated static resources");
            return Ok(0);
        }

        if pipeline.has_active_process() {
            // Old instance must be gone before the new one takes its
            // ports; on timeout the old process keeps running and the
            // registry is not touched.
            self.terminate(pipeline.active_pid).await?;
        }

        let run_log = self.log_dir.join(format!("{}.run.log", branch.name));
        let pid = self.spawn_artifact(&branch, &spec.run_args, &run_log).await?;

        self.registry
            .set_active(&spec.name, &branch.name, &branch.path, pid)
            .await?;

        info!(pid, branch = %branch.name, "Artifact activated");
        Ok(pid)
    }

    /// Gracefully stop a process: interrupt, then poll liveness until the
    /// budget runs out.
    pub async fn terminate(&self, pid: u32) -> Result<(), ProcessError> {
        info!(pid, "Terminating active process");
        send_interrupt(pid).await?;

        let started = Instant::now();
        loop {
            if !process_alive(pid).await? {
                return Ok(());
            }
            if started.elapsed() >= self.terminate_budget {
                warn!(pid, "Process survived the termination budget");
                return Err(ProcessError::TerminateTimeout {
                    pid,
                    budget_ms: self.terminate_budget.as_millis() as u64,
                });
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Claim the single activation slot for a pipeline
    fn begin_activation(&self, name: &str) -> Result<ActivationGuard, ProcessError> {
        let mut set = self
            .in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if !set.insert(name.to_string()) {
            return Err(ProcessError::ActivationInFlight(name.to_string()));
        }

        Ok(ActivationGuard {
            in_flight: Arc::clone(&self.in_flight),
            name: name.to_string(),
        })
    }

    /// Spawn the artifact with stdout/stderr redirected into its run log
    async fn spawn_artifact(
        &self,
        branch: &BranchInfo,
        extra_args: &[String],
        run_log: &PathBuf,
    ) -> Result<u32, ProcessError> {
        if let Some(parent) = run_log.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let stdout = std::fs::File::create(run_log)?;
        let stderr = stdout.try_clone()?;

        let mut child = Command::new(&self.interpreter)
            .arg("-jar")
            .arg(&branch.path)
            .arg(format!("--jasypt.encryptor.password={}", self.secret))
            .args(extra_args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .spawn()
            .map_err(|e| ProcessError::SpawnFailed(e.to_string()))?;

        let pid = child
            .id()
            .ok_or_else(|| ProcessError::SpawnFailed("no pid returned".to_string()))?;

        // Reap the child when it exits so the PID does not linger as a
        // zombie; the child outlives this call otherwise.
        tokio::spawn(async move {
            let _ = child.wait().await;
        });

        Ok(pid)
    }
}

/// Send SIGINT to a process we may not own
async fn send_interrupt(pid: u32) -> Result<(), ProcessError> {
    let status = Command::new("kill")
        .args(["-s", "INT", &pid.to_string()])
        .status()
        .await?;

    if !status.success() {
        // Already gone; the liveness poll will confirm.
        warn!(pid, "kill -s INT reported failure");
    }
    Ok(())
}

/// Check liveness via `kill -0`
async fn process_alive(pid: u32) -> Result<bool, ProcessError> {
    let status = Command::new("kill")
        .args(["-0", &pid.to_string()])
        .status()
        .await?;
    Ok(status.success())
}
