//! Dispatcher: from build request to statuses, a gist, and pods
//!
//! One dispatch handles one webhook delivery. It reads the task manifest at
//! the build revision, writes the build-record gist whose URL becomes the
//! target URL of every status in this build, then walks the tasks in
//! manifest order: publish `pending`, build the pod, submit it. A task that
//! fails to submit gets an `error` status and does not abort its siblings.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::Arc;

use tracing::{info, warn};

use crate::context::AppContext;
use crate::events::BuildRequest;
use crate::github::{truncate_description, CommitState, Gist, GistFile, NewGist, RepoStatus};
use crate::manifest::{Manifest, TaskConfig};
use crate::orchestrator::SecretPhase;
use crate::workload::{build_pod, workload_name, WorkloadSpec};
use crate::{Error, Result, MANIFEST_PATH};

/// Turns validated build requests into cluster workloads
pub struct Dispatcher {
    ctx: Arc<AppContext>,
}

impl Dispatcher {
    /// Create a dispatcher over the shared context
    pub fn new(ctx: Arc<AppContext>) -> Self {
        Self { ctx }
    }

    /// Run one build request to completion.
    ///
    /// Fails fast before any state is created (manifest or gist trouble);
    /// after that, per-task failures are published on that task's status
    /// context and the remaining tasks still run.
    pub async fn dispatch(&self, request: &BuildRequest) -> Result<()> {
        info!(
            repo = %request.repo_full_name,
            sha = %request.sha,
            git_ref = %request.git_ref,
            "dispatching build"
        );

        let manifest = self.fetch_manifest(request).await?;
        let gist = self.create_build_record(request, &manifest).await?;

        for task in &manifest.tasks {
            self.start_task(request, &manifest, &gist, task).await;
        }
        Ok(())
    }

    async fn fetch_manifest(&self, request: &BuildRequest) -> Result<Manifest> {
        let raw = self
            .ctx
            .github
            .repo_contents(&request.owner, &request.repo_name, MANIFEST_PATH, &request.sha)
            .await
            .map_err(|e| Error::manifest(format!("cannot fetch {MANIFEST_PATH}: {e}")))?;
        Manifest::parse(&raw)
    }

    async fn create_build_record(
        &self,
        request: &BuildRequest,
        manifest: &Manifest,
    ) -> Result<Gist> {
        let markdown = build_record_markdown(request, manifest, &self.ctx.settings.namespace);
        let gist = NewGist {
            description: request.gist_description(),
            public: false,
            files: BTreeMap::from([("build.md".to_string(), GistFile::markdown(markdown))]),
        };
        self.ctx.github.create_gist(&gist).await
    }

    /// Publish `pending`, then submit the pod. A submission failure
    /// republishes the same context as `error` with the failure message.
    async fn start_task(
        &self,
        request: &BuildRequest,
        manifest: &Manifest,
        gist: &Gist,
        task: &TaskConfig,
    ) {
        let context = self.ctx.settings.task_context(&task.name);
        let mut status = RepoStatus {
            state: CommitState::Pending,
            target_url: gist.html_url.clone(),
            description: "started".to_string(),
            context,
        };

        if let Err(err) = self
            .ctx
            .github
            .create_status(&request.owner, &request.repo_name, &request.sha, &status)
            .await
        {
            warn!(task = %task.name, error = %err, "cannot publish pending status, skipping task");
            return;
        }

        if let Err(err) = self.run_task(request, manifest, gist, task).await {
            warn!(task = %task.name, error = %err, "task submission failed");
            status.state = CommitState::Error;
            status.description = truncate_description(&err.to_string());
            if let Err(err) = self
                .ctx
                .github
                .create_status(&request.owner, &request.repo_name, &request.sha, &status)
                .await
            {
                warn!(task = %task.name, error = %err, "cannot publish error status");
            }
        }
    }

    async fn run_task(
        &self,
        request: &BuildRequest,
        manifest: &Manifest,
        gist: &Gist,
        task: &TaskConfig,
    ) -> Result<()> {
        let image = manifest.resolve_image(task)?;
        let secret_name = self
            .ctx
            .orchestrator
            .find_build_secret(
                &request.owner,
                &request.repo_name,
                SecretPhase::for_request(request),
            )
            .await?;

        let pod = build_pod(&WorkloadSpec {
            request,
            task,
            image,
            target_url: &gist.html_url,
            gist_id: &gist.id,
            status_context: &self.ctx.settings.task_context(&task.name),
            github_token: &self.ctx.settings.github_token,
            secret_name: secret_name.as_deref(),
        });

        self.ctx.orchestrator.create_workload(&pod).await?;
        info!(task = %task.name, pod = ?pod.metadata.name, "submitted pod");
        Ok(())
    }
}

/// Render the `build.md` file for the build-record gist
fn build_record_markdown(request: &BuildRequest, manifest: &Manifest, namespace: &str) -> String {
    let mut md = String::new();
    let _ = writeln!(md, "# Build Record");
    let _ = writeln!(md);
    let _ = writeln!(
        md,
        "Repo: [{name}](https://github.com/{name})",
        name = request.repo_full_name
    );
    let _ = writeln!(md);
    if let Some(pr) = &request.pull_request {
        let _ = writeln!(md, "PR: [#{} {}]({})", pr.number, pr.title, pr.html_url);
        let _ = writeln!(md);
    }
    let _ = writeln!(
        md,
        "Commit: [{sha}](https://github.com/{name}/commit/{sha})",
        sha = request.sha,
        name = request.repo_full_name
    );
    let _ = writeln!(md);

    for task in &manifest.tasks {
        let pod = workload_name(&request.owner, &request.repo_name, &request.sha, &task.name);
        let _ = writeln!(md, "## Task {}", task.name);
        let _ = writeln!(md);
        let _ = writeln!(md, "- Pod `{pod}`");
        let _ = writeln!(
            md,
            "- Tail logs: `kubectl --namespace \"{namespace}\" logs \"{pod}\" -f`"
        );
        let _ = writeln!(
            md,
            "- Info: `kubectl --namespace \"{namespace}\" get pods \"{pod}\" -o yaml`"
        );
        let _ = writeln!(md);
    }
    md
}
