//! Domain types for the ezpipe orchestrator.
//!
//! This module contains the persisted data structures:
//! - Pipeline: one deployable component and its activation state
//! - BranchInfo: a built artifact available for activation
//! - BuildStatus: progress record for one build

pub mod pipeline;

// Re-export commonly used types
pub use pipeline::{BranchInfo, BuildState, BuildStatus, Pipeline};
