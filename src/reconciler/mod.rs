//! Reconciler: drives commit statuses from observed pod state
//!
//! A level-triggered controller over every pod in the managed namespace.
//! The watch stream keeps a reflector store (the indexer) current and
//! enqueues a key per change; a worker pulls keys and runs the sync
//! algorithm, which derives the desired commit status from the container's
//! terminated state and mirrors it out. The last-status annotation is the
//! commit point: it is written only after GitHub accepted the status, so a
//! re-run of the same observation short-circuits instead of re-publishing.
//!
//! Transiently failed syncs re-enter the queue under exponential backoff,
//! bounded at [`MAX_SYNC_ATTEMPTS`] per failure chain; permanent failures
//! are logged and dropped after one attempt. Errors never cross keys.

mod queue;

pub use queue::WorkQueue;

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::api::Api;
use kube::runtime::reflector::{self, ObjectRef, Store};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Client, ResourceExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::context::AppContext;
use crate::github::{CommitState, GistFile, RepoStatus};
use crate::{annotations, Error, Result};

/// Attempts per failure chain before a key is dropped from the queue
pub const MAX_SYNC_ATTEMPTS: u32 = 5;

/// The pod-watching controller
pub struct Reconciler {
    client: Client,
    namespace: String,
    ctx: Arc<AppContext>,
}

impl Reconciler {
    /// Create a reconciler for the managed namespace
    pub fn new(client: Client, namespace: impl Into<String>, ctx: Arc<AppContext>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            ctx,
        }
    }

    /// Run the informer stream and worker until shutdown.
    ///
    /// Cancellation halts new queue pulls and terminates the watch; the
    /// in-flight sync (if any) is drained before this returns.
    pub async fn run(self, shutdown: CancellationToken) {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &self.namespace);
        let (store, writer) = reflector::store::<Pod>();
        let queue = WorkQueue::new();

        let worker = tokio::spawn(run_worker(
            store.clone(),
            Arc::clone(&queue),
            Arc::clone(&self.ctx),
        ));

        info!(namespace = %self.namespace, "starting pod reconciler");
        let stream = reflector::reflector(
            writer,
            watcher(pods, watcher::Config::default()).default_backoff(),
        );
        tokio::pin!(stream);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("reconciler shutting down");
                    break;
                }
                event = stream.next() => match event {
                    Some(Ok(event)) => enqueue(&queue, &event),
                    Some(Err(err)) => warn!(error = %err, "watch stream error"),
                    None => {
                        warn!("watch stream ended");
                        break;
                    }
                }
            }
        }

        queue.shut_down();
        let _ = worker.await;
    }
}

/// Queue the key of every object an event touches
fn enqueue(queue: &WorkQueue, event: &watcher::Event<Pod>) {
    match event {
        watcher::Event::Apply(pod)
        | watcher::Event::InitApply(pod)
        | watcher::Event::Delete(pod) => queue.add(&pod_key(pod)),
        watcher::Event::Init | watcher::Event::InitDone => {}
    }
}

fn pod_key(pod: &Pod) -> String {
    format!("{}/{}", pod.namespace().unwrap_or_default(), pod.name_any())
}

/// Worker loop: pull, sync, account for the outcome, signal completion.
///
/// Only transient failures re-enter the queue; a permanent failure (4xx
/// from GitHub, a conflict, an invariant violation) cannot succeed on
/// retry and is logged and dropped at once.
async fn run_worker(store: Store<Pod>, queue: Arc<WorkQueue>, ctx: Arc<AppContext>) {
    while let Some(key) = queue.get().await {
        match sync_key(&store, &ctx, &key).await {
            Ok(()) => queue.forget(&key),
            Err(err) if !err.is_transient() => {
                error!(key = %key, error = %err, "sync failed permanently, dropping key");
                queue.forget(&key);
            }
            Err(err) => {
                if queue.num_requeues(&key) + 1 < MAX_SYNC_ATTEMPTS {
                    warn!(key = %key, error = %err, "sync failed, requeueing");
                    queue.add_rate_limited(&key);
                } else {
                    error!(key = %key, error = %err, "sync failed repeatedly, dropping key");
                    queue.forget(&key);
                }
            }
        }
        queue.done(&key);
    }
}

/// Look up a key in the store and sync the pod if it still exists.
///
/// A missing key means the cluster already reaped the pod; there is nothing
/// left to reconcile.
async fn sync_key(store: &Store<Pod>, ctx: &AppContext, key: &str) -> Result<()> {
    let (namespace, name) = key
        .split_once('/')
        .ok_or_else(|| Error::internal(format!("malformed queue key {key:?}")))?;
    match store.get(&ObjectRef::new(name).within(namespace)) {
        Some(pod) => sync(&pod, ctx).await,
        None => Ok(()),
    }
}

/// The sync algorithm for one observed pod.
///
/// Order matters: logs are saved before the status call so a terminal
/// status published upstream always implies the gist holds the output, and
/// the pod is deleted (or its last-status annotation written) only after
/// GitHub accepted the status.
pub async fn sync(pod: &Pod, ctx: &AppContext) -> Result<()> {
    let name = pod.name_any();
    let annotations = pod.annotations();

    let context = annotation(annotations, annotations::STATUS_CONTEXT);
    if context.is_empty() {
        // not managed by this controller
        return Ok(());
    }

    let desired = desired_state(pod);
    if annotation(annotations, annotations::LAST_STATUS) == desired.as_str() {
        debug!(pod = %name, state = %desired, "status unchanged");
        return Ok(());
    }

    if desired.is_terminal() {
        let gist_id = annotation(annotations, annotations::OUTPUT_GIST);
        if !gist_id.is_empty() {
            let file_name = match annotation(annotations, annotations::OUTPUT_GIST_FILE_NAME) {
                "" => format!("{name}.txt"),
                file_name => file_name.to_string(),
            };
            let logs = ctx.orchestrator.workload_logs(&name).await?;
            ctx.github
                .edit_gist(gist_id, BTreeMap::from([(file_name, GistFile::plain(logs))]))
                .await?;
            debug!(pod = %name, gist = %gist_id, "saved output to gist");
        }
    }

    let status = RepoStatus {
        state: desired,
        target_url: annotation(annotations, annotations::TARGET_URL).to_string(),
        description: desired.as_str().to_string(),
        context: context.to_string(),
    };
    ctx.github
        .create_status(
            annotation(annotations, annotations::OWNER),
            annotation(annotations, annotations::REPO),
            annotation(annotations, annotations::REF),
            &status,
        )
        .await?;
    info!(pod = %name, state = %desired, "published status");

    if desired.is_terminal() {
        ctx.orchestrator.delete_workload(&name).await?;
        info!(pod = %name, "deleted pod");
    } else {
        ctx.orchestrator.annotate_last_status(&name, desired).await?;
    }
    Ok(())
}

/// Desired commit status for a pod, from its first terminated container
fn desired_state(pod: &Pod) -> CommitState {
    let container_statuses = pod
        .status
        .as_ref()
        .and_then(|status| status.container_statuses.as_deref())
        .unwrap_or_default();
    for cs in container_statuses {
        let Some(terminated) = cs.state.as_ref().and_then(|s| s.terminated.as_ref()) else {
            continue;
        };
        return match terminated.reason.as_deref() {
            Some("Completed") => CommitState::Success,
            Some("Error") => CommitState::Failure,
            _ => CommitState::Error,
        };
    }
    CommitState::Pending
}

fn annotation<'a>(annotations: &'a BTreeMap<String, String>, key: &str) -> &'a str {
    annotations.get(key).map(String::as_str).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::github::MockGithubApi;
    use crate::orchestrator::MockOrchestrator;
    use k8s_openapi::api::core::v1::{
        ContainerState, ContainerStateTerminated, ContainerStatus, PodStatus,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use mockall::Sequence;

    fn app_context(github: MockGithubApi, orchestrator: MockOrchestrator) -> Arc<AppContext> {
        Arc::new(AppContext::new(
            Arc::new(github),
            Arc::new(orchestrator),
            Settings {
                github_token: "tok3n".into(),
                status_context: "triggr".into(),
                namespace: "builds".into(),
            },
        ))
    }

    /// A managed pod as the dispatcher creates it, optionally terminated
    fn managed_pod(last_status: &str, terminated_reason: Option<&str>) -> Pod {
        let annotations = BTreeMap::from([
            (annotations::TARGET_URL.to_string(), "https://gist.github.com/abc123".to_string()),
            (annotations::LAST_STATUS.to_string(), last_status.to_string()),
            (annotations::STATUS_CONTEXT.to_string(), "triggr-unit".to_string()),
            (annotations::OWNER.to_string(), "acme".to_string()),
            (annotations::REPO.to_string(), "widget".to_string()),
            (annotations::REF.to_string(), "0123456789abcdef".to_string()),
            (annotations::TASK_NAME.to_string(), "unit".to_string()),
            (annotations::OUTPUT_GIST.to_string(), "abc123".to_string()),
            (annotations::OUTPUT_GIST_FILE_NAME.to_string(), "output-unit.txt".to_string()),
        ]);

        let status = terminated_reason.map(|reason| PodStatus {
            container_statuses: Some(vec![ContainerStatus {
                name: "exec".to_string(),
                state: Some(ContainerState {
                    terminated: Some(ContainerStateTerminated {
                        exit_code: if reason == "Completed" { 0 } else { 1 },
                        reason: Some(reason.to_string()),
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            }]),
            ..Default::default()
        });

        Pod {
            metadata: ObjectMeta {
                name: Some("triggr-acme-widget-0123456789ab-unit".to_string()),
                namespace: Some("builds".to_string()),
                annotations: Some(annotations),
                ..Default::default()
            },
            status,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn unmanaged_pods_are_ignored() {
        let pod = Pod {
            metadata: ObjectMeta {
                name: Some("coredns-abc".to_string()),
                namespace: Some("builds".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        let mut github = MockGithubApi::new();
        github.expect_create_status().never();
        github.expect_edit_gist().never();
        let mut orchestrator = MockOrchestrator::new();
        orchestrator.expect_delete_workload().never();
        orchestrator.expect_workload_logs().never();

        sync(&pod, &app_context(github, orchestrator)).await.unwrap();
    }

    #[tokio::test]
    async fn unchanged_pending_state_short_circuits() {
        // dispatch already published pending and annotated it; observing the
        // still-running pod must not produce a second status call
        let pod = managed_pod("pending", None);
        let mut github = MockGithubApi::new();
        github.expect_create_status().never();
        let mut orchestrator = MockOrchestrator::new();
        orchestrator.expect_annotate_last_status().never();

        sync(&pod, &app_context(github, orchestrator)).await.unwrap();
    }

    #[tokio::test]
    async fn completed_pod_saves_logs_publishes_success_then_deletes() {
        let pod = managed_pod("pending", Some("Completed"));
        let mut github = MockGithubApi::new();
        let mut orchestrator = MockOrchestrator::new();
        let mut seq = Sequence::new();

        orchestrator
            .expect_workload_logs()
            .withf(|name| name == "triggr-acme-widget-0123456789ab-unit")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok("ok\nall tests passed\n".to_string()));
        github
            .expect_edit_gist()
            .withf(|id, files| {
                id == "abc123"
                    && files.get("output-unit.txt").map(|f| f.content.as_str())
                        == Some("ok\nall tests passed\n")
            })
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));
        github
            .expect_create_status()
            .withf(|owner, repo, sha, status| {
                owner == "acme"
                    && repo == "widget"
                    && sha == "0123456789abcdef"
                    && status.state == CommitState::Success
                    && status.description == "success"
                    && status.context == "triggr-unit"
            })
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _, _| Ok(()));
        orchestrator
            .expect_delete_workload()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));

        sync(&pod, &app_context(github, orchestrator)).await.unwrap();
    }

    #[tokio::test]
    async fn error_reason_maps_to_failure() {
        let pod = managed_pod("pending", Some("Error"));
        let mut github = MockGithubApi::new();
        let mut orchestrator = MockOrchestrator::new();

        orchestrator
            .expect_workload_logs()
            .returning(|_| Ok("test failed\n".to_string()));
        github.expect_edit_gist().returning(|_, _| Ok(()));
        github
            .expect_create_status()
            .withf(|_, _, _, status| status.state == CommitState::Failure)
            .times(1)
            .returning(|_, _, _, _| Ok(()));
        orchestrator.expect_delete_workload().returning(|_| Ok(()));

        sync(&pod, &app_context(github, orchestrator)).await.unwrap();
    }

    #[tokio::test]
    async fn oom_kill_maps_to_error() {
        let pod = managed_pod("pending", Some("OOMKilled"));
        let mut github = MockGithubApi::new();
        let mut orchestrator = MockOrchestrator::new();

        orchestrator.expect_workload_logs().returning(|_| Ok(String::new()));
        github.expect_edit_gist().returning(|_, _| Ok(()));
        github
            .expect_create_status()
            .withf(|_, _, _, status| status.state == CommitState::Error)
            .times(1)
            .returning(|_, _, _, _| Ok(()));
        orchestrator.expect_delete_workload().returning(|_| Ok(()));

        sync(&pod, &app_context(github, orchestrator)).await.unwrap();
    }

    #[tokio::test]
    async fn pod_without_gist_annotation_skips_log_capture() {
        let mut pod = managed_pod("pending", Some("Completed"));
        pod.metadata
            .annotations
            .as_mut()
            .unwrap()
            .remove(annotations::OUTPUT_GIST);

        let mut github = MockGithubApi::new();
        let mut orchestrator = MockOrchestrator::new();
        orchestrator.expect_workload_logs().never();
        github.expect_edit_gist().never();
        github
            .expect_create_status()
            .times(1)
            .returning(|_, _, _, _| Ok(()));
        orchestrator.expect_delete_workload().times(1).returning(|_| Ok(()));

        sync(&pod, &app_context(github, orchestrator)).await.unwrap();
    }

    #[tokio::test]
    async fn log_capture_failure_blocks_the_status_call() {
        // terminal status must imply logs are saved; a log read failure
        // leaves the status unpublished and surfaces as retryable
        let pod = managed_pod("pending", Some("Completed"));
        let mut github = MockGithubApi::new();
        let mut orchestrator = MockOrchestrator::new();

        orchestrator
            .expect_workload_logs()
            .returning(|_| Err(Error::github(reqwest::StatusCode::BAD_GATEWAY, "store it")));
        github.expect_edit_gist().never();
        github.expect_create_status().never();
        orchestrator.expect_delete_workload().never();

        let err = sync(&pod, &app_context(github, orchestrator)).await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn status_failure_leaves_the_pod_in_place() {
        let pod = managed_pod("pending", Some("Completed"));
        let mut github = MockGithubApi::new();
        let mut orchestrator = MockOrchestrator::new();

        orchestrator.expect_workload_logs().returning(|_| Ok("out".into()));
        github.expect_edit_gist().returning(|_, _| Ok(()));
        github
            .expect_create_status()
            .returning(|_, _, _, _| Err(Error::github(reqwest::StatusCode::BAD_GATEWAY, "502")));
        orchestrator.expect_delete_workload().never();
        orchestrator.expect_annotate_last_status().never();

        let err = sync(&pod, &app_context(github, orchestrator)).await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn fresh_pending_publishes_and_annotates_instead_of_deleting() {
        // a pod whose pending status was never recorded (dispatch raced or a
        // prior status call failed) publishes pending and writes the
        // annotation as the commit point
        let pod = managed_pod("", None);
        let mut github = MockGithubApi::new();
        let mut orchestrator = MockOrchestrator::new();

        github
            .expect_create_status()
            .withf(|_, _, _, status| status.state == CommitState::Pending)
            .times(1)
            .returning(|_, _, _, _| Ok(()));
        orchestrator.expect_workload_logs().never();
        orchestrator.expect_delete_workload().never();
        orchestrator
            .expect_annotate_last_status()
            .withf(|name, state| {
                name == "triggr-acme-widget-0123456789ab-unit" && *state == CommitState::Pending
            })
            .times(1)
            .returning(|_, _| Ok(()));

        sync(&pod, &app_context(github, orchestrator)).await.unwrap();
    }

    #[tokio::test]
    async fn terminal_state_already_published_is_a_noop() {
        // monotonicity: once success is recorded nothing more is sent
        let pod = managed_pod("success", Some("Completed"));
        let mut github = MockGithubApi::new();
        github.expect_create_status().never();
        github.expect_edit_gist().never();
        let mut orchestrator = MockOrchestrator::new();
        orchestrator.expect_delete_workload().never();

        sync(&pod, &app_context(github, orchestrator)).await.unwrap();
    }

    #[test]
    fn desired_state_without_terminated_container_is_pending() {
        assert_eq!(desired_state(&managed_pod("pending", None)), CommitState::Pending);
        assert_eq!(
            desired_state(&managed_pod("pending", Some("Completed"))),
            CommitState::Success
        );
        assert_eq!(
            desired_state(&managed_pod("pending", Some("Error"))),
            CommitState::Failure
        );
        assert_eq!(
            desired_state(&managed_pod("pending", Some("OOMKilled"))),
            CommitState::Error
        );
    }

    #[tokio::test]
    async fn missing_store_entry_is_a_noop() {
        let (store, _writer) = reflector::store::<Pod>();
        let ctx = app_context(MockGithubApi::new(), MockOrchestrator::new());
        sync_key(&store, &ctx, "builds/already-gone").await.unwrap();
    }

    #[tokio::test]
    async fn stored_pod_is_synced_by_key() {
        let (store, mut writer) = reflector::store::<Pod>();
        writer.apply_watcher_event(&watcher::Event::Apply(managed_pod(
            "pending",
            Some("Completed"),
        )));

        let mut github = MockGithubApi::new();
        let mut orchestrator = MockOrchestrator::new();
        orchestrator.expect_workload_logs().returning(|_| Ok("out".into()));
        github.expect_edit_gist().returning(|_, _| Ok(()));
        github.expect_create_status().times(1).returning(|_, _, _, _| Ok(()));
        orchestrator.expect_delete_workload().times(1).returning(|_| Ok(()));

        sync_key(
            &store,
            &app_context(github, orchestrator),
            "builds/triggr-acme-widget-0123456789ab-unit",
        )
        .await
        .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn worker_gives_up_after_bounded_attempts() {
        // every sync fails on the log read; the chain is bounded at
        // MAX_SYNC_ATTEMPTS and the key is dropped, not retried forever
        let (store, mut writer) = reflector::store::<Pod>();
        writer.apply_watcher_event(&watcher::Event::Apply(managed_pod(
            "pending",
            Some("Completed"),
        )));

        let mut github = MockGithubApi::new();
        github.expect_create_status().never();
        let mut orchestrator = MockOrchestrator::new();
        orchestrator
            .expect_workload_logs()
            .times(MAX_SYNC_ATTEMPTS as usize)
            .returning(|_| Err(Error::github(reqwest::StatusCode::BAD_GATEWAY, "502")));

        let queue = WorkQueue::new();
        queue.add("builds/triggr-acme-widget-0123456789ab-unit");
        let worker = tokio::spawn(run_worker(
            store,
            Arc::clone(&queue),
            app_context(github, orchestrator),
        ));

        // let the retries play out on the paused clock, then stop the worker
        tokio::time::sleep(std::time::Duration::from_secs(30)).await;
        queue.shut_down();
        worker.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_failures_are_surfaced_without_retry() {
        // a 422 from GitHub cannot succeed on retry; the key is dropped
        // after a single attempt instead of burning the retry budget
        let (store, mut writer) = reflector::store::<Pod>();
        writer.apply_watcher_event(&watcher::Event::Apply(managed_pod("", None)));

        let mut github = MockGithubApi::new();
        github.expect_create_status().times(1).returning(|_, _, _, _| {
            Err(Error::github(
                reqwest::StatusCode::UNPROCESSABLE_ENTITY,
                "No commit found for SHA",
            ))
        });
        let mut orchestrator = MockOrchestrator::new();
        orchestrator.expect_annotate_last_status().never();

        let queue = WorkQueue::new();
        queue.add("builds/triggr-acme-widget-0123456789ab-unit");
        let worker = tokio::spawn(run_worker(
            store,
            Arc::clone(&queue),
            app_context(github, orchestrator),
        ));

        tokio::time::sleep(std::time::Duration::from_secs(30)).await;
        assert_eq!(queue.num_requeues("builds/triggr-acme-widget-0123456789ab-unit"), 0);
        queue.shut_down();
        worker.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn transient_status_failures_retry_then_publish_once() {
        // two 502s from GitHub, then acceptance: one logical transition,
        // committed via the annotation after the successful call
        let (store, mut writer) = reflector::store::<Pod>();
        writer.apply_watcher_event(&watcher::Event::Apply(managed_pod("", None)));

        let mut github = MockGithubApi::new();
        let mut calls = 0u32;
        github
            .expect_create_status()
            .times(3)
            .returning(move |_, _, _, _| {
                calls += 1;
                if calls < 3 {
                    Err(Error::github(reqwest::StatusCode::BAD_GATEWAY, "502"))
                } else {
                    Ok(())
                }
            });
        let mut orchestrator = MockOrchestrator::new();
        orchestrator
            .expect_annotate_last_status()
            .withf(|_, state| *state == CommitState::Pending)
            .times(1)
            .returning(|_, _| Ok(()));

        let queue = WorkQueue::new();
        queue.add("builds/triggr-acme-widget-0123456789ab-unit");
        let worker = tokio::spawn(run_worker(
            store,
            Arc::clone(&queue),
            app_context(github, orchestrator),
        ));

        tokio::time::sleep(std::time::Duration::from_secs(30)).await;
        assert_eq!(queue.num_requeues("builds/triggr-acme-widget-0123456789ab-unit"), 0);
        queue.shut_down();
        worker.await.unwrap();
    }
}
