//! GitHub REST client
//!
//! Covers the three GitHub surfaces triggr talks to: commit statuses,
//! repository contents, and gists. The [`GithubApi`] trait is the seam the
//! dispatcher and reconciler depend on; [`GithubClient`] is the real
//! implementation over reqwest.

use std::collections::BTreeMap;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, USER_AGENT};
use serde::{Deserialize, Serialize};

#[cfg(test)]
use mockall::automock;

use crate::{Error, Result, DESCRIPTION_LIMIT};

/// Commit status state as GitHub defines it
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CommitState {
    /// Build accepted, outcome not yet known
    Pending,
    /// Container terminated with reason `Completed`
    Success,
    /// Container terminated with reason `Error`
    Failure,
    /// Container terminated for any other reason, or dispatch failed
    Error,
}

impl CommitState {
    /// Wire representation, also used in the last-status annotation
    pub fn as_str(&self) -> &'static str {
        match self {
            CommitState::Pending => "pending",
            CommitState::Success => "success",
            CommitState::Failure => "failure",
            CommitState::Error => "error",
        }
    }

    /// Whether this state ends the workload's lifecycle
    pub fn is_terminal(&self) -> bool {
        !matches!(self, CommitState::Pending)
    }
}

impl std::fmt::Display for CommitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A commit status to publish
#[derive(Clone, Debug, Serialize)]
pub struct RepoStatus {
    /// Status state
    pub state: CommitState,
    /// Details link shown next to the status line
    pub target_url: String,
    /// Short human-readable description, at most 140 characters
    pub description: String,
    /// Context string namespacing this status line
    pub context: String,
}

/// One file inside a gist
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GistFile {
    /// Media type; `text/plain` or `text/markdown`
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    /// File content
    pub content: String,
}

impl GistFile {
    /// A markdown gist file
    pub fn markdown(content: impl Into<String>) -> Self {
        Self {
            media_type: Some("text/markdown".to_string()),
            content: content.into(),
        }
    }

    /// A plain-text gist file
    pub fn plain(content: impl Into<String>) -> Self {
        Self {
            media_type: Some("text/plain".to_string()),
            content: content.into(),
        }
    }
}

/// Request body for gist creation
#[derive(Clone, Debug, Serialize)]
pub struct NewGist {
    /// Gist description shown in the gist list
    pub description: String,
    /// Whether the gist is publicly listed
    pub public: bool,
    /// Files keyed by filename
    pub files: BTreeMap<String, GistFile>,
}

/// A created gist, reduced to the fields triggr uses
#[derive(Clone, Debug, Deserialize)]
pub struct Gist {
    /// Gist id, annotated onto pods for the reconciler
    pub id: String,
    /// Public URL, published as the status target URL
    pub html_url: String,
}

/// Truncate a status description to GitHub's 140-character limit.
///
/// Over-long messages keep their first 130 characters plus `...`.
pub fn truncate_description(message: &str) -> String {
    if message.chars().count() > DESCRIPTION_LIMIT {
        let mut out: String = message.chars().take(130).collect();
        out.push_str("...");
        out
    } else {
        message.to_string()
    }
}

/// GitHub operations used by the dispatcher and reconciler
#[cfg_attr(test, automock)]
#[async_trait]
pub trait GithubApi: Send + Sync {
    /// Publish a commit status
    async fn create_status(
        &self,
        owner: &str,
        repo: &str,
        sha: &str,
        status: &RepoStatus,
    ) -> Result<()>;

    /// Fetch a repository file's decoded bytes at the given ref
    async fn repo_contents(
        &self,
        owner: &str,
        repo: &str,
        path: &str,
        git_ref: &str,
    ) -> Result<Vec<u8>>;

    /// Create a gist and return its id and public URL
    async fn create_gist(&self, gist: &NewGist) -> Result<Gist>;

    /// Replace files in an existing gist
    async fn edit_gist(&self, id: &str, files: BTreeMap<String, GistFile>) -> Result<()>;
}

/// Real GitHub client over reqwest
pub struct GithubClient {
    http: reqwest::Client,
    base_url: String,
}

impl GithubClient {
    /// Create a client for the given API base URL, authenticating every
    /// request with the personal access token.
    pub fn new(base_url: impl Into<String>, token: &str) -> Result<Self> {
        let mut headers = HeaderMap::new();
        let mut auth = HeaderValue::from_str(&format!("token {token}"))
            .map_err(|e| Error::internal(format!("access token is not a valid header: {e}")))?;
        auth.set_sensitive(true);
        headers.insert(AUTHORIZATION, auth);
        headers.insert(ACCEPT, HeaderValue::from_static("application/vnd.github+json"));
        headers.insert(USER_AGENT, HeaderValue::from_static("triggr"));

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .build()
            .map_err(|e| Error::internal(format!("cannot build http client: {e}")))?;

        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Ok(Self { http, base_url })
    }

    /// Connectivity probe; fails fast at startup on bad credentials or DNS
    pub async fn zen(&self) -> Result<String> {
        let resp = self.http.get(format!("{}/zen", self.base_url)).send().await?;
        let resp = check(resp).await?;
        Ok(resp.text().await?)
    }
}

/// Map a non-success response into [`Error::GitHub`] with the body as detail
async fn check(resp: reqwest::Response) -> Result<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let message = resp.text().await.unwrap_or_default();
    Err(Error::github(status, message))
}

#[derive(Deserialize)]
struct ContentsResponse {
    content: Option<String>,
}

#[async_trait]
impl GithubApi for GithubClient {
    async fn create_status(
        &self,
        owner: &str,
        repo: &str,
        sha: &str,
        status: &RepoStatus,
    ) -> Result<()> {
        let url = format!("{}/repos/{owner}/{repo}/statuses/{sha}", self.base_url);
        let resp = self.http.post(url).json(status).send().await?;
        check(resp).await?;
        Ok(())
    }

    async fn repo_contents(
        &self,
        owner: &str,
        repo: &str,
        path: &str,
        git_ref: &str,
    ) -> Result<Vec<u8>> {
        let url = format!("{}/repos/{owner}/{repo}/contents/{path}", self.base_url);
        let resp = self
            .http
            .get(url)
            .query(&[("ref", git_ref)])
            .send()
            .await?;
        let resp = check(resp).await?;
        let body: ContentsResponse = resp.json().await?;

        // The contents API returns base64 broken into newline-separated chunks.
        let encoded: String = body
            .content
            .ok_or_else(|| Error::GitHub {
                status: None,
                message: format!("no content for {path}"),
            })?
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect();
        BASE64.decode(encoded.as_bytes()).map_err(|e| Error::GitHub {
            status: None,
            message: format!("contents of {path} are not base64: {e}"),
        })
    }

    async fn create_gist(&self, gist: &NewGist) -> Result<Gist> {
        let url = format!("{}/gists", self.base_url);
        let resp = self.http.post(url).json(gist).send().await?;
        let resp = check(resp).await?;
        Ok(resp.json().await?)
    }

    async fn edit_gist(&self, id: &str, files: BTreeMap<String, GistFile>) -> Result<()> {
        let url = format!("{}/gists/{id}", self.base_url);
        let body = serde_json::json!({ "files": files });
        let resp = self.http.patch(url).json(&body).send().await?;
        check(resp).await?;
        Ok(())
    }
}
