//! Runtime settings shared across components

/// Settings resolved from flags and the environment at startup.
///
/// Carried inside [`crate::context::AppContext`] so the dispatcher, task
/// specifier, and reconciler all see the same configuration.
#[derive(Clone, Debug)]
pub struct Settings {
    /// Personal access token used for every GitHub call and injected into
    /// build pods as `GITHUB_ACCESS_TOKEN`
    pub github_token: String,
    /// Base status context; each task publishes under `<base>-<task>`
    pub status_context: String,
    /// Kubernetes namespace holding build pods and build secrets
    pub namespace: String,
}

impl Settings {
    /// Status context for a single task within a build
    pub fn task_context(&self, task_name: &str) -> String {
        format!("{}-{}", self.status_context, task_name)
    }
}
