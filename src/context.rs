//! Shared application context
//!
//! The GitHub and Kubernetes clients are process-wide and safe for
//! concurrent use; the context carries them plus the resolved settings to
//! the dispatcher and reconciler at construction, so nothing reaches for
//! globals.

use std::sync::Arc;

use crate::config::Settings;
use crate::github::GithubApi;
use crate::orchestrator::Orchestrator;

/// Clients and settings shared by all components
pub struct AppContext {
    /// GitHub API client
    pub github: Arc<dyn GithubApi>,
    /// Kubernetes operations
    pub orchestrator: Arc<dyn Orchestrator>,
    /// Runtime settings
    pub settings: Settings,
}

impl AppContext {
    /// Create a context from clients and settings
    pub fn new(
        github: Arc<dyn GithubApi>,
        orchestrator: Arc<dyn Orchestrator>,
        settings: Settings,
    ) -> Self {
        Self {
            github,
            orchestrator,
            settings,
        }
    }
}
