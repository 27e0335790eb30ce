//! Adapters for external collaborators.
//!
//! The core treats source control as an external system reached through a
//! narrow, typed boundary.

pub mod git;

// Re-export the git puller
pub use git::{GitPullError, GitPuller};
