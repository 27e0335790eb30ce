//! Build Flow Integration Tests
//!
//! End-to-end step-chain behavior: the demo build scenario, the
//! duplicate-build guard, and halt semantics.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use ezpipe::core::{
    BuildEngine, BuildStep, CollectJarStep, CommandStep, EngineError, Registry, StepContext,
    StepOutcome,
};
use ezpipe::domain::BuildState;
use tempfile::TempDir;

async fn open_demo(temp: &TempDir) -> Arc<Registry> {
    Arc::new(
        Registry::open(
            temp.path().join("pipeline_state.json"),
            &["demo".to_string()],
        )
        .await
        .unwrap(),
    )
}

fn log_dir(temp: &TempDir) -> PathBuf {
    temp.path().join("logs")
}

/// Step that records it ran by dropping a marker file
struct MarkerStep {
    marker: PathBuf,
    outcome: StepOutcome,
}

#[async_trait]
impl BuildStep for MarkerStep {
    fn name(&self) -> &str {
        "marker"
    }

    async fn run(&self, _ctx: &StepContext) -> Result<StepOutcome> {
        tokio::fs::write(&self.marker, b"ran").await?;
        Ok(self.outcome.clone())
    }
}

#[tokio::test]
async fn test_demo_build_scenario() {
    let temp = TempDir::new().unwrap();
    let registry = open_demo(&temp).await;

    // Fake maven output: a jar waiting in the target dir
    let target = temp.path().join("repo/target");
    tokio::fs::create_dir_all(&target).await.unwrap();
    tokio::fs::write(target.join("demo-1.0.jar"), b"jar").await.unwrap();
    let output = temp.path().join("artifacts");

    // Pipeline demo starts idle with no artifacts
    let pipeline = registry.get("demo").await.unwrap();
    assert_eq!(pipeline.active_pid, 0);
    assert!(pipeline.available_branches.is_empty());

    let mut engine = BuildEngine::new(Arc::clone(&registry), log_dir(&temp), "demo");
    engine.init("abc123", "main", false).await.unwrap();

    // Right after init the status record is InProgress at 10
    let pipeline = registry.get("demo").await.unwrap();
    let status = pipeline.status_for_commit("abc123").unwrap();
    assert_eq!(status.status, BuildState::InProgress);
    assert_eq!(status.progression, 10);

    engine
        .add_step(CommandStep::new(
            "Step 1: install",
            "sh",
            &["-c", "echo install"],
            temp.path(),
            30,
        ))
        .add_step(CommandStep::new(
            "Step 2: lint",
            "sh",
            &["-c", "echo lint"],
            temp.path(),
            50,
        ))
        .add_step(CommandStep::new(
            "Step 3: build",
            "sh",
            &["-c", "echo build"],
            temp.path(),
            90,
        ))
        .add_step(CollectJarStep::new(&target, &output));
    engine.run().await.unwrap();

    let pipeline = registry.get("demo").await.unwrap();
    let status = pipeline.status_for_commit("abc123").unwrap();
    assert_eq!(status.status, BuildState::Success);
    assert_eq!(status.progression, 100);

    assert_eq!(pipeline.available_branches.len(), 1);
    assert_eq!(pipeline.available_branches[0].name, "abc123");
    assert!(pipeline.available_branches[0].path.ends_with("abc123.jar"));

    // Build log carries every step banner
    let log = tokio::fs::read_to_string(log_dir(&temp).join("abc123.log"))
        .await
        .unwrap();
    assert!(log.contains("==============Step 1: install==========="));
    assert!(log.contains("==============Step 3: build==========="));
}

#[tokio::test]
async fn test_second_trigger_without_force_is_duplicate() {
    let temp = TempDir::new().unwrap();
    let registry = open_demo(&temp).await;

    let mut first = BuildEngine::new(Arc::clone(&registry), log_dir(&temp), "demo");
    first.init("abc123", "main", false).await.unwrap();
    first.add_step(CommandStep::new(
        "Step 1: build",
        "sh",
        &["-c", "true"],
        temp.path(),
        90,
    ));
    first.run().await.unwrap();

    let before = registry.get("demo").await.unwrap();

    let mut second = BuildEngine::new(Arc::clone(&registry), log_dir(&temp), "demo");
    let err = second.init("abc123", "main", false).await.unwrap_err();
    assert!(matches!(err, EngineError::DuplicateBuild(_)));

    // The first build's status record is untouched by the rejected trigger
    let after = registry.get("demo").await.unwrap();
    assert_eq!(
        before.status_for_commit("abc123"),
        after.status_for_commit("abc123")
    );
}

#[tokio::test]
async fn test_halt_skips_remaining_steps_and_closes_log() {
    let temp = TempDir::new().unwrap();
    let registry = open_demo(&temp).await;

    let ran = temp.path().join("ran.marker");
    let never = temp.path().join("never.marker");

    let mut engine = BuildEngine::new(Arc::clone(&registry), log_dir(&temp), "demo");
    engine.init("abc123", "main", false).await.unwrap();
    engine
        .add_step(MarkerStep {
            marker: ran.clone(),
            outcome: StepOutcome::Halt("stop here".to_string()),
        })
        .add_step(MarkerStep {
            marker: never.clone(),
            outcome: StepOutcome::Continue,
        });
    engine.run().await.unwrap();

    assert!(ran.exists());
    assert!(!never.exists());

    // The log was closed on halt: the file exists and is writable no more,
    // which a follow-up build (force) can safely truncate.
    assert!(log_dir(&temp).join("abc123.log").exists());
    let mut forced = BuildEngine::new(registry, log_dir(&temp), "demo");
    forced.init("abc123", "main", true).await.unwrap();
}

#[tokio::test]
async fn test_step_error_reaches_the_caller_by_default() {
    let temp = TempDir::new().unwrap();
    let registry = open_demo(&temp).await;

    struct ExplodingStep;

    #[async_trait]
    impl BuildStep for ExplodingStep {
        fn name(&self) -> &str {
            "explode"
        }

        async fn run(&self, ctx: &StepContext) -> Result<StepOutcome> {
            // Authoring contract: own the failure status before erroring
            ctx.status.set(BuildState::Failure, 0).await?;
            anyhow::bail!("unexpected tool state")
        }
    }

    let mut engine = BuildEngine::new(Arc::clone(&registry), log_dir(&temp), "demo");
    engine.init("abc123", "main", false).await.unwrap();
    engine.add_step(ExplodingStep);

    let err = engine.run().await.unwrap_err();
    assert!(err.to_string().contains("explode"));

    let pipeline = registry.get("demo").await.unwrap();
    assert_eq!(
        pipeline.status_for_commit("abc123").unwrap().status,
        BuildState::Failure
    );
}

#[tokio::test]
async fn test_custom_error_handler_swallows_step_errors() {
    let temp = TempDir::new().unwrap();
    let registry = open_demo(&temp).await;

    struct ExplodingStep;

    #[async_trait]
    impl BuildStep for ExplodingStep {
        fn name(&self) -> &str {
            "explode"
        }

        async fn run(&self, _ctx: &StepContext) -> Result<StepOutcome> {
            anyhow::bail!("boom")
        }
    }

    let mut engine = BuildEngine::new(registry, log_dir(&temp), "demo");
    engine.init("abc123", "main", false).await.unwrap();
    engine.on_error(Box::new(|_| Ok(())));
    engine.add_step(ExplodingStep);

    engine.run().await.unwrap();
}
