//! Kubernetes operations used by the dispatcher and reconciler
//!
//! The [`Orchestrator`] trait is the seam between triggr's logic and the
//! cluster: pod submission and teardown, the last-status annotation patch,
//! build-secret lookup, and log capture. [`KubeOrchestrator`] is the real
//! implementation; tests substitute a mock.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Pod, Secret};
use kube::api::{Api, DeleteParams, ListParams, LogParams, Patch, PatchParams, PostParams};
use kube::{Client, ResourceExt};
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::events::BuildRequest;
use crate::github::CommitState;
use crate::workload::CONTAINER_NAME;
use crate::{annotations, Error, Result};

/// Build-secret applicability phase, matched against the `when` label
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SecretPhase {
    /// Builds triggered by a pull request
    PullRequest,
    /// Builds of the default branch
    Master,
    /// Matches only builds that are neither
    Never,
}

impl SecretPhase {
    /// The phase a build request falls into
    pub fn for_request(request: &BuildRequest) -> Self {
        if request.pull_request.is_some() {
            SecretPhase::PullRequest
        } else if request.git_ref == crate::MASTER_REF {
            SecretPhase::Master
        } else {
            SecretPhase::Never
        }
    }

    /// Label value form
    pub fn as_str(&self) -> &'static str {
        match self {
            SecretPhase::PullRequest => "pull-request",
            SecretPhase::Master => "master",
            SecretPhase::Never => "never",
        }
    }
}

impl std::fmt::Display for SecretPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cluster operations behind a mockable seam
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Orchestrator: Send + Sync {
    /// Submit a build pod; a name collision is [`Error::Conflict`]
    async fn create_workload(&self, pod: &Pod) -> Result<()>;

    /// Delete a build pod after its terminal status was accepted
    async fn delete_workload(&self, name: &str) -> Result<()>;

    /// Record the last successfully published status on the pod
    async fn annotate_last_status(&self, name: &str, state: CommitState) -> Result<()>;

    /// Find the build secret labeled for this owner/repo/phase.
    ///
    /// Zero matches is fine (no secret mounts); more than one is an error.
    async fn find_build_secret(
        &self,
        owner: &str,
        repo: &str,
        phase: SecretPhase,
    ) -> Result<Option<String>>;

    /// Read the exec container's logs to EOF
    async fn workload_logs(&self, name: &str) -> Result<String>;
}

/// Real orchestrator over the Kubernetes API, scoped to one namespace
pub struct KubeOrchestrator {
    pods: Api<Pod>,
    secrets: Api<Secret>,
}

impl KubeOrchestrator {
    /// Create an orchestrator managing pods in the given namespace
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            pods: Api::namespaced(client.clone(), namespace),
            secrets: Api::namespaced(client, namespace),
        }
    }
}

#[async_trait]
impl Orchestrator for KubeOrchestrator {
    async fn create_workload(&self, pod: &Pod) -> Result<()> {
        match self.pods.create(&PostParams::default(), pod).await {
            Ok(created) => {
                debug!(pod = %created.name_any(), "created pod");
                Ok(())
            }
            Err(kube::Error::Api(ae)) if ae.code == 409 => Err(Error::conflict(format!(
                "pod {} already exists",
                pod.name_any()
            ))),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_workload(&self, name: &str) -> Result<()> {
        self.pods.delete(name, &DeleteParams::default()).await?;
        Ok(())
    }

    async fn annotate_last_status(&self, name: &str, state: CommitState) -> Result<()> {
        let patch = serde_json::json!({
            "metadata": {
                "annotations": {
                    annotations::LAST_STATUS: state.as_str(),
                }
            }
        });
        self.pods
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn find_build_secret(
        &self,
        owner: &str,
        repo: &str,
        phase: SecretPhase,
    ) -> Result<Option<String>> {
        let selector = format!("owner={owner},repo={repo},when={phase}");
        let params = ListParams::default().labels(&selector);
        let list = self.secrets.list(&params).await?;
        match list.items.len() {
            0 => Ok(None),
            1 => Ok(Some(list.items[0].name_any())),
            n => Err(Error::internal(format!(
                "{n} secrets match labels {selector}, expected at most one"
            ))),
        }
    }

    async fn workload_logs(&self, name: &str) -> Result<String> {
        let params = LogParams {
            container: Some(CONTAINER_NAME.to_string()),
            ..Default::default()
        };
        Ok(self.pods.logs(name, &params).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::PullRequestRef;

    fn request(git_ref: &str, pr: bool) -> BuildRequest {
        BuildRequest {
            repo_full_name: "acme/widget".into(),
            repo_name: "widget".into(),
            owner: "acme".into(),
            sha: "0123456789abcdef".into(),
            git_ref: git_ref.into(),
            pull_request: pr.then(|| PullRequestRef {
                number: 7,
                title: "t".into(),
                html_url: "u".into(),
            }),
        }
    }

    #[test]
    fn pull_request_phase_wins_over_ref() {
        let req = request("refs/pull/7/merge", true);
        assert_eq!(SecretPhase::for_request(&req), SecretPhase::PullRequest);
    }

    #[test]
    fn master_push_selects_master_phase() {
        let req = request("refs/heads/master", false);
        assert_eq!(SecretPhase::for_request(&req), SecretPhase::Master);
    }

    #[test]
    fn anything_else_selects_never() {
        let req = request("refs/heads/feature", false);
        assert_eq!(SecretPhase::for_request(&req), SecretPhase::Never);
        assert_eq!(SecretPhase::Never.as_str(), "never");
    }
}
