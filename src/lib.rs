//! Triggr - a minimal continuous-integration control plane for Kubernetes
//!
//! Triggr listens for GitHub webhook deliveries, starts one single-shot pod
//! per task declared in the repository's `.triggr.toml`, and mirrors each
//! pod's fate back to GitHub: a commit status per task plus a gist holding
//! the build record and the captured pod logs. Execution, isolation, and
//! lifecycle management are all delegated to the cluster; triggr is only the
//! translator between webhook deliveries and pods, and between pod phases
//! and commit statuses.
//!
//! # Modules
//!
//! - [`ingress`] - Webhook endpoint: HMAC validation, event decoding, gating
//! - [`events`] - Webhook payload types and the derived build request
//! - [`dispatch`] - Turns a build request into statuses, a gist, and pods
//! - [`manifest`] - The `.triggr.toml` task manifest
//! - [`workload`] - Pod construction for a single task
//! - [`reconciler`] - Watches pods and drives commit statuses to match
//! - [`github`] - GitHub REST client (statuses, contents, gists)
//! - [`orchestrator`] - Kubernetes operations used by dispatch and reconcile
//! - [`context`] - Shared application context (clients + settings)
//! - [`config`] - Runtime settings
//! - [`error`] - Error types

#![deny(missing_docs)]

pub mod config;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod github;
pub mod ingress;
pub mod manifest;
pub mod orchestrator;
pub mod reconciler;
pub mod workload;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Wire-format constants
// =============================================================================
// The annotation bundle is the reconciler's only source of truth: every pod
// triggr creates carries enough annotations to reconstruct its status call
// without consulting any external index.

/// Repository path of the task manifest, read at the build revision
pub const MANIFEST_PATH: &str = ".triggr.toml";

/// The only ref push events build from (the default branch policy)
pub const MASTER_REF: &str = "refs/heads/master";

/// Marker label set on every pod triggr creates
pub const MANAGED_LABEL: &str = "triggr";

/// GitHub's hard limit on commit status descriptions
pub const DESCRIPTION_LIMIT: usize = 140;

/// Annotation keys carried by every managed pod
pub mod annotations {
    /// Gist URL published as the details link on every status
    pub const TARGET_URL: &str = "triggr.crewjam.com/github-target-url";
    /// Last status accepted by GitHub; written only after the status call succeeded
    pub const LAST_STATUS: &str = "triggr.crewjam.com/github-last-status";
    /// Per-task status context; empty means the pod is not ours
    pub const STATUS_CONTEXT: &str = "triggr.crewjam.com/github-status-context";
    /// Repository owner login
    pub const OWNER: &str = "triggr.crewjam.com/github-owner";
    /// Repository short name
    pub const REPO: &str = "triggr.crewjam.com/github-repo";
    /// Commit SHA the status is attached to
    pub const REF: &str = "triggr.crewjam.com/github-ref";
    /// Task name from the manifest
    pub const TASK_NAME: &str = "triggr.crewjam.com/task-name";
    /// Gist id receiving the pod logs on terminal transitions
    pub const OUTPUT_GIST: &str = "triggr.crewjam.com/output-gist";
    /// File name for the log content inside the gist
    pub const OUTPUT_GIST_FILE_NAME: &str = "triggr.crewjam.com/output-gist-file-name";
}
