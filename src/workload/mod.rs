//! Task specifier: pod construction for a single task
//!
//! Everything here is pure. The dispatcher supplies all inputs (the build
//! request, the task, the resolved image, the gist coordinates, the secret
//! lookup result) and gets back a fully rendered `Pod`; no call in this
//! module touches the network.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    Container, EnvVar, HostPathVolumeSource, Pod, PodSpec, SecretVolumeSource, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use crate::annotations;
use crate::events::BuildRequest;
use crate::manifest::TaskConfig;

/// Name of the single container in every build pod
pub const CONTAINER_NAME: &str = "exec";

/// Mount path for build secrets inside the container
pub const SECRETS_MOUNT_PATH: &str = "/var/run/secret/build";

/// Host socket mounted when a task sets `map-docker-sock`
pub const DOCKER_SOCK_PATH: &str = "/var/run/docker.sock";

/// Inputs for building one task pod
pub struct WorkloadSpec<'a> {
    /// The build request this task belongs to
    pub request: &'a BuildRequest,
    /// The task declaration from the manifest
    pub task: &'a TaskConfig,
    /// Resolved container image
    pub image: &'a str,
    /// Gist URL published on every status for this build
    pub target_url: &'a str,
    /// Gist id receiving the task output
    pub gist_id: &'a str,
    /// Full per-task status context
    pub status_context: &'a str,
    /// Access token injected for the build script's own GitHub calls
    pub github_token: &'a str,
    /// Name of the matching build secret, when one exists
    pub secret_name: Option<&'a str>,
}

/// Deterministic pod name for a task: `triggr-<owner>-<repo>-<sha12>-<task>`,
/// sanitized to a DNS-1123 label.
///
/// Determinism is load-bearing: a duplicate dispatch for the same inputs
/// collides on this name and the second submission fails fast.
pub fn workload_name(owner: &str, repo: &str, sha: &str, task: &str) -> String {
    let sha12 = &sha[..sha.len().min(12)];
    sanitize_dns_label(&format!("triggr-{owner}-{repo}-{sha12}-{task}"))
}

/// File name inside the output gist for a task
pub fn output_file_name(task: &str) -> String {
    format!("output-{task}.txt")
}

/// Force a string into DNS-1123 label shape: lowercase alphanumerics and
/// dashes, runs of invalid characters collapsed to one dash, at most 63
/// characters, starting and ending alphanumeric.
pub fn sanitize_dns_label(raw: &str) -> String {
    let mut chars: Vec<char> = raw
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    chars.dedup_by(|a, b| *a == '-' && *b == '-');
    let mut out: String = chars.into_iter().collect();
    if out.len() > 63 {
        out.truncate(63);
    }
    out.trim_matches('-').to_string()
}

/// Build the pod for one task.
///
/// The pod is one-shot (restart policy `Never`) with exactly one container
/// and a pull-always image policy. Its annotations carry everything the
/// reconciler needs to publish statuses without any external index.
pub fn build_pod(spec: &WorkloadSpec) -> Pod {
    let request = spec.request;
    let task = spec.task;
    let name = workload_name(&request.owner, &request.repo_name, &request.sha, &task.name);
    let output_file = output_file_name(&task.name);

    let labels = BTreeMap::from([
        (crate::MANAGED_LABEL.to_string(), "true".to_string()),
        ("task".to_string(), sanitize_dns_label(&task.name)),
        ("repo".to_string(), sanitize_dns_label(&request.repo_name)),
        ("owner".to_string(), sanitize_dns_label(&request.owner)),
    ]);

    let annotations = BTreeMap::from([
        (annotations::TARGET_URL.to_string(), spec.target_url.to_string()),
        (annotations::LAST_STATUS.to_string(), "pending".to_string()),
        (annotations::STATUS_CONTEXT.to_string(), spec.status_context.to_string()),
        (annotations::OWNER.to_string(), request.owner.clone()),
        (annotations::REPO.to_string(), request.repo_name.clone()),
        (annotations::REF.to_string(), request.sha.clone()),
        (annotations::TASK_NAME.to_string(), task.name.clone()),
        (annotations::OUTPUT_GIST.to_string(), spec.gist_id.to_string()),
        (annotations::OUTPUT_GIST_FILE_NAME.to_string(), output_file.clone()),
    ]);

    let mut env = vec![
        env_var("TRIGGR", "true"),
        env_var(
            "GIT_CLONE_URL",
            format!(
                "https://{}:@github.com/{}.git",
                spec.github_token, request.repo_full_name
            ),
        ),
        env_var("GIT_REF", &request.git_ref),
        env_var("TASK_NAME", &task.name),
        env_var("GITHUB_OWNER", &request.owner),
        env_var("GITHUB_NAME", &request.repo_name),
        env_var("GITHUB_REPO", &request.repo_full_name),
        env_var("GIT_REVISION", &request.sha),
        env_var("GITHUB_STATUS_TARGET_URL", spec.target_url),
        env_var("GITHUB_STATUS_CONTEXT", spec.status_context),
        env_var("GITHUB_ACCESS_TOKEN", spec.github_token),
        env_var("GIST_ID", spec.gist_id),
        env_var("GIST_FILE_NAME", &output_file),
    ];
    if let Some(pr) = &request.pull_request {
        env.push(env_var("PULL_REQUEST", pr.number.to_string()));
    }

    let mut volumes = Vec::new();
    let mut volume_mounts = Vec::new();

    if let Some(secret_name) = spec.secret_name {
        env.push(env_var("BUILD_SECRETS", SECRETS_MOUNT_PATH));
        volumes.push(Volume {
            name: "build-secrets".to_string(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(secret_name.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        });
        volume_mounts.push(VolumeMount {
            name: "build-secrets".to_string(),
            mount_path: SECRETS_MOUNT_PATH.to_string(),
            ..Default::default()
        });
    }

    if task.map_docker_sock {
        volumes.push(Volume {
            name: "docker-sock".to_string(),
            host_path: Some(HostPathVolumeSource {
                path: DOCKER_SOCK_PATH.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        });
        volume_mounts.push(VolumeMount {
            name: "docker-sock".to_string(),
            mount_path: DOCKER_SOCK_PATH.to_string(),
            ..Default::default()
        });
    }

    Pod {
        metadata: ObjectMeta {
            name: Some(name),
            labels: Some(labels),
            annotations: Some(annotations),
            ..Default::default()
        },
        spec: Some(PodSpec {
            restart_policy: Some("Never".to_string()),
            containers: vec![Container {
                name: CONTAINER_NAME.to_string(),
                image: Some(spec.image.to_string()),
                args: Some(task.command.clone()),
                image_pull_policy: Some("Always".to_string()),
                env: Some(env),
                volume_mounts: if volume_mounts.is_empty() {
                    None
                } else {
                    Some(volume_mounts)
                },
                ..Default::default()
            }],
            volumes: if volumes.is_empty() { None } else { Some(volumes) },
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn env_var(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.into()),
        ..Default::default()
    }
}
