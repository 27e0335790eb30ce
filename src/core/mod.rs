//! Core orchestration logic.
//!
//! This module contains:
//! - Registry: the persistent pipeline-state store
//! - BuildEngine: the step-chain execution engine
//! - steps: concrete build steps and chain assembly
//! - ProcessManager: activation and termination of running artifacts
//! - BuildLog: the per-build log sink

pub mod build_log;
pub mod engine;
pub mod process;
pub mod registry;
pub mod steps;

// Re-export commonly used types
pub use build_log::BuildLog;
pub use engine::{BuildEngine, BuildStep, EngineError, StatusTracker, StepContext, StepOutcome};
pub use process::{ProcessError, ProcessManager};
pub use registry::{Registry, RegistryError};
pub use steps::{assemble_chain, CollectJarStep, CommandStep, PublishAssetsStep};
