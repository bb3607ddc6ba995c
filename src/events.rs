//! Webhook payload types and the derived build request
//!
//! Push and pull-request deliveries carry repository descriptors of
//! different shapes, so each event keeps its own structs here and projects
//! into the common [`BuildRequest`] the dispatcher consumes.

use serde::Deserialize;

/// A push webhook delivery, reduced to the fields triggr reads
#[derive(Clone, Debug, Deserialize)]
pub struct PushEvent {
    /// Git ref that was pushed, e.g. `refs/heads/master`
    #[serde(rename = "ref")]
    pub git_ref: String,
    /// Head commit of the push; absent on branch deletions
    pub head_commit: Option<HeadCommit>,
    /// Repository the push landed in
    pub repository: PushRepository,
}

/// Head commit of a push
#[derive(Clone, Debug, Deserialize)]
pub struct HeadCommit {
    /// Commit SHA
    pub id: String,
}

/// Repository descriptor as push events carry it
#[derive(Clone, Debug, Deserialize)]
pub struct PushRepository {
    /// Short name, e.g. `triggr`
    pub name: String,
    /// Full name, e.g. `crewjam/triggr`
    pub full_name: String,
    /// Owner; push events use the git-author shape with a `name` field
    pub owner: PushOwner,
}

/// Owner descriptor on push events
#[derive(Clone, Debug, Deserialize)]
pub struct PushOwner {
    /// Owner name as push events report it
    pub name: Option<String>,
    /// Owner login, present on newer deliveries
    pub login: Option<String>,
}

/// A pull-request webhook delivery, reduced to the fields triggr reads
#[derive(Clone, Debug, Deserialize)]
pub struct PullRequestEvent {
    /// The pull request the delivery describes
    pub pull_request: PullRequest,
}

/// Pull request payload
#[derive(Clone, Debug, Deserialize)]
pub struct PullRequest {
    /// PR number
    pub number: u64,
    /// PR title
    pub title: String,
    /// PR page URL
    pub html_url: String,
    /// Head of the PR branch
    pub head: PullRequestHead,
    /// Base the PR merges into; its repository owns the statuses
    pub base: PullRequestBase,
}

/// Head descriptor of a pull request
#[derive(Clone, Debug, Deserialize)]
pub struct PullRequestHead {
    /// SHA of the head commit
    pub sha: String,
}

/// Base descriptor of a pull request
#[derive(Clone, Debug, Deserialize)]
pub struct PullRequestBase {
    /// The base repository
    pub repo: BaseRepository,
}

/// Repository descriptor as pull-request events carry it
#[derive(Clone, Debug, Deserialize)]
pub struct BaseRepository {
    /// Short name
    pub name: String,
    /// Full name
    pub full_name: String,
    /// Owner with a login field
    pub owner: BaseOwner,
}

/// Owner descriptor on pull-request events
#[derive(Clone, Debug, Deserialize)]
pub struct BaseOwner {
    /// Owner login
    pub login: String,
}

/// Pull-request fields that survive into the build request
#[derive(Clone, Debug)]
pub struct PullRequestRef {
    /// PR number
    pub number: u64,
    /// PR title
    pub title: String,
    /// PR page URL
    pub html_url: String,
}

/// A build request derived from a webhook event.
///
/// Transient: it exists only for the duration of one dispatch and carries
/// everything the dispatcher and task specifier need.
#[derive(Clone, Debug)]
pub struct BuildRequest {
    /// Repository full name, e.g. `crewjam/triggr`
    pub repo_full_name: String,
    /// Repository short name, e.g. `triggr`
    pub repo_name: String,
    /// Owner login the statuses are published under
    pub owner: String,
    /// Commit SHA the statuses attach to
    pub sha: String,
    /// Ref the build pods check out
    pub git_ref: String,
    /// Present when the build was triggered by a pull request
    pub pull_request: Option<PullRequestRef>,
}

impl BuildRequest {
    /// Derive a build request from a push event.
    ///
    /// Returns None when the push has no head commit (branch deletion).
    pub fn from_push(event: &PushEvent) -> Option<Self> {
        let head = event.head_commit.as_ref()?;
        let owner = event
            .repository
            .owner
            .name
            .clone()
            .or_else(|| event.repository.owner.login.clone())?;
        Some(Self {
            repo_full_name: event.repository.full_name.clone(),
            repo_name: event.repository.name.clone(),
            owner,
            sha: head.id.clone(),
            git_ref: event.git_ref.clone(),
            pull_request: None,
        })
    }

    /// Derive a build request from a pull-request event.
    ///
    /// The ref is the synthetic merge ref; the owner comes from the base
    /// repository so statuses land where the PR is reviewed.
    pub fn from_pull_request(event: &PullRequestEvent) -> Self {
        let pr = &event.pull_request;
        Self {
            repo_full_name: pr.base.repo.full_name.clone(),
            repo_name: pr.base.repo.name.clone(),
            owner: pr.base.repo.owner.login.clone(),
            sha: pr.head.sha.clone(),
            git_ref: format!("refs/pull/{}/merge", pr.number),
            pull_request: Some(PullRequestRef {
                number: pr.number,
                title: pr.title.clone(),
                html_url: pr.html_url.clone(),
            }),
        }
    }

    /// Description for the build-record gist
    pub fn gist_description(&self) -> String {
        match self.pull_request {
            Some(_) => format!("{} Build Status", self.repo_full_name),
            None => "Build Status".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push_payload() -> PushEvent {
        serde_json::from_value(serde_json::json!({
            "ref": "refs/heads/master",
            "head_commit": {"id": "0123456789abcdef0123456789abcdef01234567"},
            "repository": {
                "name": "widget",
                "full_name": "acme/widget",
                "owner": {"name": "acme"}
            }
        }))
        .unwrap()
    }

    fn pull_request_payload() -> PullRequestEvent {
        serde_json::from_value(serde_json::json!({
            "pull_request": {
                "number": 42,
                "title": "Add frobnicator",
                "html_url": "https://github.com/acme/widget/pull/42",
                "head": {"sha": "fedcba9876543210fedcba9876543210fedcba98"},
                "base": {
                    "repo": {
                        "name": "widget",
                        "full_name": "acme/widget",
                        "owner": {"login": "acme"}
                    }
                }
            }
        }))
        .unwrap()
    }

    #[test]
    fn push_projects_into_build_request() {
        let req = BuildRequest::from_push(&push_payload()).unwrap();
        assert_eq!(req.owner, "acme");
        assert_eq!(req.repo_name, "widget");
        assert_eq!(req.repo_full_name, "acme/widget");
        assert_eq!(req.git_ref, "refs/heads/master");
        assert_eq!(req.sha, "0123456789abcdef0123456789abcdef01234567");
        assert!(req.pull_request.is_none());
        assert_eq!(req.gist_description(), "Build Status");
    }

    #[test]
    fn push_without_head_commit_is_skipped() {
        let mut event = push_payload();
        event.head_commit = None;
        assert!(BuildRequest::from_push(&event).is_none());
    }

    #[test]
    fn pull_request_projects_with_merge_ref() {
        let req = BuildRequest::from_pull_request(&pull_request_payload());
        assert_eq!(req.owner, "acme");
        assert_eq!(req.git_ref, "refs/pull/42/merge");
        assert_eq!(req.sha, "fedcba9876543210fedcba9876543210fedcba98");
        let pr = req.pull_request.as_ref().unwrap();
        assert_eq!(pr.number, 42);
        assert_eq!(pr.title, "Add frobnicator");
        assert_eq!(req.gist_description(), "acme/widget Build Status");
    }
}
