//! ezpipe - single-host build-and-deploy orchestrator
//!
//! For each managed component ("pipeline") ezpipe pulls a specific commit,
//! runs the component's external build tool chain, records build progress in
//! a persistent registry, and can swap which previously built artifact is
//! the active running instance.
//!
//! # Architecture
//!
//! - All pipeline state lives in one JSON registry document; every update
//!   is serialized through a single writer and rewrites the whole document
//! - A build is an ordered step chain; each step shells out to an external
//!   tool, streams its output into the per-build log, and commits status
//!   changes through the registry
//! - Activation terminates the previous instance (bounded, polled) before
//!   spawning the new artifact and recording branch + path + PID together
//!
//! # Modules
//!
//! - `adapters`: External system boundaries (git puller)
//! - `core`: Registry, build engine, steps, process manager, log sink
//! - `domain`: Persisted data structures (Pipeline, BranchInfo, BuildStatus)
//! - `config`: Paths and pipeline definitions
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Build a commit
//! ezpipe trigger str-service main abc123
//!
//! # Make the built artifact the running instance
//! ezpipe activate str-service abc123
//!
//! # Poll build progress
//! ezpipe status str-service
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;

// Re-export main types at crate root for convenience
pub use crate::config::{PipelineKind, PipelineSpec, ResolvedConfig};
pub use crate::core::{BuildEngine, BuildLog, ProcessManager, Registry, StepOutcome};
pub use crate::domain::{BranchInfo, BuildState, BuildStatus, Pipeline};
