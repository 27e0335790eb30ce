//! Concrete build steps and per-pipeline-kind chain assembly.
//!
//! Every step follows the same authoring contract: forward the external
//! command's combined output to the build log first, then either advance
//! the status (monotonic percentage) and `Continue`, or write
//! `Failure`/0 and `Halt`. A non-zero exit code is absorbed here, never
//! propagated as an error.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{debug, error, info};

use crate::config::{PipelineKind, PipelineSpec};
use crate::domain::{BranchInfo, BuildState};

use super::build_log::BuildLog;
use super::engine::{BuildEngine, BuildStep, StepContext, StepOutcome};

/// A step that runs one external command in a working directory
pub struct CommandStep {
    /// Banner written to the build log before the command runs
    title: String,

    program: String,
    args: Vec<String>,
    cwd: PathBuf,

    /// Progression written on a zero exit code
    progress_on_success: u8,

    /// Optional per-step timeout; a hung tool hangs the build otherwise
    timeout: Option<Duration>,

    /// Env var pointing the tool at its per-commit output directory
    output_env: Option<(String, PathBuf)>,
}

impl CommandStep {
    pub fn new(
        title: impl Into<String>,
        program: impl Into<String>,
        args: &[&str],
        cwd: impl Into<PathBuf>,
        progress_on_success: u8,
    ) -> Self {
        Self {
            title: title.into(),
            program: program.into(),
            args: args.iter().map(|s| s.to_string()).collect(),
            cwd: cwd.into(),
            progress_on_success,
            timeout: None,
            output_env: None,
        }
    }

    /// Abort the command (and fail the build) after the given duration
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Export `key=<root>/<commit>` into the command's environment.
    ///
    /// The build tool writes its output there; the final step registers the
    /// same path as the branch location.
    pub fn with_output_env(mut self, key: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        self.output_env = Some((key.into(), root.into()));
        self
    }
}

#[async_trait]
impl BuildStep for CommandStep {
    fn name(&self) -> &str {
        &self.title
    }

    async fn run(&self, ctx: &StepContext) -> Result<StepOutcome> {
        ctx.log.section(&self.title).await?;
        info!(step = %self.title, program = %self.program, "Running build command");

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .current_dir(&self.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some((key, root)) = &self.output_env {
            cmd.env(key, root.join(ctx.status.commit_id()));
        }

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                // Could not even start the tool; own the failure status
                // before surfacing the error to the engine.
                ctx.status.set(BuildState::Failure, 0).await?;
                return Err(anyhow::Error::from(e)
                    .context(format!("failed to spawn '{}'", self.program)));
            }
        };

        let stdout = child.stdout.take().context("child has no stdout")?;
        let stderr = child.stderr.take().context("child has no stderr")?;
        let out_task = tokio::spawn(stream_to_log(stdout, ctx.log.clone()));
        let err_task = tokio::spawn(stream_to_log(stderr, ctx.log.clone()));

        let exit = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, child.wait()).await {
                Ok(status) => status?,
                Err(_) => {
                    child.kill().await.ok();
                    let _ = out_task.await;
                    let _ = err_task.await;
                    ctx.status.set(BuildState::Failure, 0).await?;
                    error!(step = %self.title, ?limit, "Build command timed out");
                    return Ok(StepOutcome::Halt(format!(
                        "'{}' timed out after {:?}",
                        self.program, limit
                    )));
                }
            },
            None => child.wait().await?,
        };

        // All output lands in the log before the success/failure decision.
        let _ = out_task.await;
        let _ = err_task.await;

        if !exit.success() {
            let code = exit.code().unwrap_or(-1);
            ctx.status.set(BuildState::Failure, 0).await?;
            error!(step = %self.title, code, "Build command failed");
            return Ok(StepOutcome::Halt(format!(
                "'{}' exited with code {}",
                self.program, code
            )));
        }

        ctx.status
            .set(BuildState::InProgress, self.progress_on_success)
            .await?;
        Ok(StepOutcome::Continue)
    }
}

/// Copy a child output stream into the build log
async fn stream_to_log<R>(mut reader: R, log: BuildLog)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut buf = [0u8; 8192];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if log.write(&buf[..n]).await.is_err() {
                    break;
                }
            }
        }
    }
}

/// Final step for jar services: pick up the packaged jar, place it in the
/// output directory and register it as an available branch.
pub struct CollectJarStep {
    /// Build output directory to search (e.g. the maven target dir)
    search_dir: PathBuf,

    /// Where activated artifacts live
    dest_dir: PathBuf,
}

impl CollectJarStep {
    pub fn new(search_dir: impl Into<PathBuf>, dest_dir: impl Into<PathBuf>) -> Self {
        Self {
            search_dir: search_dir.into(),
            dest_dir: dest_dir.into(),
        }
    }

    async fn find_jar(&self) -> Result<Option<PathBuf>> {
        let mut entries = tokio::fs::read_dir(&self.search_dir)
            .await
            .with_context(|| format!("failed to read {}", self.search_dir.display()))?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            debug!(file = %path.display(), "Checking build output");
            if path.extension().is_some_and(|ext| ext == "jar") {
                return Ok(Some(path));
            }
        }

        Ok(None)
    }
}

#[async_trait]
impl BuildStep for CollectJarStep {
    fn name(&self) -> &str {
        "collect jar artifact"
    }

    async fn run(&self, ctx: &StepContext) -> Result<StepOutcome> {
        ctx.log.section("Moving output resources to target dir").await?;

        let Some(jar) = self.find_jar().await? else {
            ctx.status.set(BuildState::Failure, 0).await?;
            ctx.log
                .write_line(&format!("no jar found in {}", self.search_dir.display()))
                .await?;
            return Ok(StepOutcome::Halt("no jar artifact produced".to_string()));
        };

        let commit_id = ctx.status.commit_id().to_string();
        let dest = self.dest_dir.join(format!("{}.jar", commit_id));
        tokio::fs::create_dir_all(&self.dest_dir).await?;
        tokio::fs::copy(&jar, &dest)
            .await
            .with_context(|| format!("failed to copy {} to {}", jar.display(), dest.display()))?;

        ctx.registry
            .push_branch(
                &ctx.pipeline_name,
                BranchInfo {
                    name: commit_id,
                    path: dest.to_string_lossy().to_string(),
                },
            )
            .await?;
        ctx.status.set(BuildState::Success, 100).await?;

        info!(artifact = %dest.display(), "Registered jar artifact");
        Ok(StepOutcome::Continue)
    }
}

/// Final step for frontends: register the built resources directory as an
/// available branch named `<branch>-<commit>`.
pub struct PublishAssetsStep {
    /// Root under which each commit's built assets are placed
    resources_root: PathBuf,
}

impl PublishAssetsStep {
    pub fn new(resources_root: impl Into<PathBuf>) -> Self {
        Self {
            resources_root: resources_root.into(),
        }
    }
}

#[async_trait]
impl BuildStep for PublishAssetsStep {
    fn name(&self) -> &str {
        "publish assets"
    }

    async fn run(&self, ctx: &StepContext) -> Result<StepOutcome> {
        let name = format!("{}-{}", ctx.status.branch_name(), ctx.status.commit_id());
        let path = self.resources_root.join(ctx.status.commit_id());

        ctx.registry
            .push_branch(
                &ctx.pipeline_name,
                BranchInfo {
                    name,
                    path: path.to_string_lossy().to_string(),
                },
            )
            .await?;
        ctx.status.set(BuildState::Success, 100).await?;

        info!(resources = %path.display(), "Published frontend assets");
        Ok(StepOutcome::Continue)
    }
}

/// Register the step chain for a pipeline according to its kind
pub fn assemble_chain(engine: &mut BuildEngine, spec: &PipelineSpec) {
    match spec.kind {
        PipelineKind::Frontend => {
            engine
                .add_step(CommandStep::new(
                    "Step 1: pnpm install",
                    "pnpm",
                    &["i"],
                    &spec.repo,
                    30,
                ))
                .add_step(CommandStep::new(
                    "Step 2: pnpm run lint",
                    "pnpm",
                    &["run", "lint"],
                    &spec.repo,
                    50,
                ))
                .add_step(
                    CommandStep::new(
                        "Step 3: pnpm run build",
                        "pnpm",
                        &["run", "build"],
                        &spec.repo,
                        90,
                    )
                    // The build emits into <output>/<commit>, the exact path
                    // the publish step registers below.
                    .with_output_env("EZ_PIPELINE_OUTPUT_PATH", &spec.output_dir),
                )
                .add_step(PublishAssetsStep::new(&spec.output_dir));
        }
        PipelineKind::JarService => {
            engine
                .add_step(CommandStep::new(
                    "Step 1: Spring Boot package",
                    "mvn",
                    &[
                        "clean",
                        "install",
                        "spring-boot:repackage",
                        "-DskipTests",
                        "-Denv.config=local",
                        "-Dspring.profiles=local",
                    ],
                    &spec.repo,
                    90,
                ))
                .add_step(CollectJarStep::new(
                    spec.repo.join("target"),
                    &spec.output_dir,
                ));
        }
    }
}
