//! Pipeline records as persisted in the registry document.
//!
//! One `Pipeline` per deployable component. Field names on the wire match
//! the historical state file (camelCase, `"In Progress"` status strings),
//! so an existing document stays readable.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One deployable component tracked by the orchestrator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pipeline {
    /// Unique pipeline name (lookup key, never located by index)
    pub pipeline_name: String,

    /// Name of the currently active artifact branch ("" = none)
    #[serde(default)]
    pub active_branch: String,

    /// Path to the resources of the active artifact
    #[serde(default)]
    pub active_resources_path: String,

    /// PID of the running instance (0 = nothing running)
    #[serde(default, rename = "activePID")]
    pub active_pid: u32,

    /// Built artifacts, insertion order = build order
    #[serde(default)]
    pub available_branches: Vec<BranchInfo>,

    /// One entry per distinct commit ever built, upserted by commit id
    #[serde(default)]
    pub build_status: Vec<BuildStatus>,
}

impl Pipeline {
    /// A fresh record for a pipeline that has never built anything
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            pipeline_name: name.into(),
            active_branch: String::new(),
            active_resources_path: String::new(),
            active_pid: 0,
            available_branches: Vec::new(),
            build_status: Vec::new(),
        }
    }

    /// Find an artifact branch whose name contains the given commit id
    pub fn branch_for_commit(&self, commit_id: &str) -> Option<&BranchInfo> {
        self.available_branches
            .iter()
            .find(|b| b.name.contains(commit_id))
    }

    /// Find the build status entry for a commit
    pub fn status_for_commit(&self, commit_id: &str) -> Option<&BuildStatus> {
        self.build_status.iter().find(|s| s.commit_id == commit_id)
    }

    /// Whether a process is currently recorded as running
    pub fn has_active_process(&self) -> bool {
        self.active_pid > 0
    }
}

/// A built artifact registered as available for activation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchInfo {
    /// Artifact name (commit id, or `<branch>-<commit>` for static assets)
    pub name: String,

    /// Where the artifact lives on disk
    pub path: String,
}

/// Progress record for one build of one commit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildStatus {
    /// Commit that was built
    pub commit_id: String,

    /// Branch the commit came from
    pub branch_name: String,

    /// Current state of the build
    pub status: BuildState,

    /// Progress percentage (monotonic while in progress, 0 on failure)
    pub progression: u8,

    /// When this entry was last written
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl BuildStatus {
    /// Create a status entry with the current timestamp
    pub fn new(
        commit_id: impl Into<String>,
        branch_name: impl Into<String>,
        status: BuildState,
        progression: u8,
    ) -> Self {
        Self {
            commit_id: commit_id.into(),
            branch_name: branch_name.into(),
            status,
            progression,
            updated_at: Utc::now(),
        }
    }
}

/// Lifecycle state of a build.
///
/// `Failure` can be set at any step and is terminal; `Success` is only
/// written by the final step of a chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BuildState {
    #[serde(rename = "In Progress")]
    InProgress,
    Success,
    Failure,
}

impl BuildState {
    /// Whether this state terminates the build lifecycle
    pub fn is_terminal(&self) -> bool {
        !matches!(self, BuildState::InProgress)
    }
}
