//! GitHub REST client and the feed abstraction the poller reads from.
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::fmt;
use thiserror::Error;
use tracing::debug;

const GITHUB_API_BASE: &str = "https://api.github.com/";
const GITHUB_API_VERSION: &str = "2022-11-28";

#[derive(Debug, Error)]
pub enum GitHubError {
    #[error("rate limited by GitHub: {0}")]
    RateLimited(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("GitHub error {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("failed to reach GitHub: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("invalid GitHub response: {0}")]
    Decode(String),
}

/// Read side of the source-repository API, as far as polling needs it.
/// Every list is newest-first and capped at `limit` items.
#[async_trait]
pub trait RepoFeed: Send + Sync {
    async fn list_recent_commits(
        &self,
        owner: &str,
        name: &str,
        since: Option<DateTime<Utc>>,
        limit: u8,
    ) -> Result<Vec<CommitRecord>, GitHubError>;

    async fn list_recent_releases(
        &self,
        owner: &str,
        name: &str,
        limit: u8,
    ) -> Result<Vec<ReleaseRecord>, GitHubError>;

    /// Issues of any state, newest created first. GitHub's `since` filters on
    /// the update time, so issues created earlier but closed later are kept.
    /// The result may include pull requests; see [`IssueRecord::is_pull_request`].
    async fn list_issues(
        &self,
        owner: &str,
        name: &str,
        since: Option<DateTime<Utc>>,
        limit: u8,
    ) -> Result<Vec<IssueRecord>, GitHubError>;

    async fn list_pull_requests(
        &self,
        owner: &str,
        name: &str,
        limit: u8,
    ) -> Result<Vec<PullRequestRecord>, GitHubError>;
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct Account {
    pub login: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct GitSignature {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub date: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct CommitDetail {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub author: Option<GitSignature>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct CommitRecord {
    pub sha: String,
    #[serde(default)]
    pub html_url: String,
    pub commit: CommitDetail,
    /// GitHub account of the author; absent when the email is not linked.
    #[serde(default)]
    pub author: Option<Account>,
}

impl CommitRecord {
    pub fn author_name(&self) -> String {
        self.author
            .as_ref()
            .map(|a| a.login.clone())
            .or_else(|| self.commit.author.as_ref().map(|a| a.name.clone()))
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ReleaseRecord {
    pub tag_name: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub draft: bool,
    #[serde(default)]
    pub prerelease: bool,
    #[serde(default)]
    pub html_url: String,
    #[serde(default)]
    pub published_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub author: Option<Account>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct Label {
    pub name: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct IssueRecord {
    pub number: u64,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub body: Option<String>,
    pub state: String,
    #[serde(default)]
    pub html_url: String,
    #[serde(default)]
    pub user: Option<Account>,
    #[serde(default)]
    pub labels: Vec<Label>,
    #[serde(default)]
    pub assignee: Option<Account>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub closed_at: Option<DateTime<Utc>>,
    /// Present only when the "issue" is really a pull request.
    #[serde(default)]
    pub pull_request: Option<serde_json::Value>,
}

impl IssueRecord {
    pub fn is_pull_request(&self) -> bool {
        self.pull_request.is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.state == "closed"
    }
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct BranchRef {
    #[serde(rename = "ref", default)]
    pub ref_name: String,
    #[serde(default)]
    pub sha: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct PullRequestRecord {
    pub number: u64,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub body: Option<String>,
    pub state: String,
    #[serde(default)]
    pub html_url: String,
    #[serde(default)]
    pub user: Option<Account>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub closed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub merged_at: Option<DateTime<Utc>>,
    /// Only the single-PR endpoint reports this; lists carry `merged_at`.
    #[serde(default)]
    pub merged: Option<bool>,
    #[serde(default)]
    pub base: BranchRef,
    #[serde(default)]
    pub head: BranchRef,
    #[serde(default)]
    pub additions: Option<u64>,
    #[serde(default)]
    pub deletions: Option<u64>,
    #[serde(default)]
    pub commits: Option<u64>,
}

impl PullRequestRecord {
    pub fn is_closed(&self) -> bool {
        self.state == "closed"
    }

    pub fn is_merged(&self) -> bool {
        self.merged.unwrap_or(false) || self.merged_at.is_some()
    }
}

/// The core REST quota.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
pub struct RateLimit {
    pub limit: u32,
    pub remaining: u32,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub reset: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct RateLimitResources {
    core: RateLimit,
}

#[derive(Debug, Deserialize)]
struct RateLimitResponse {
    resources: RateLimitResources,
}

#[derive(Clone)]
pub struct GitHubClient {
    http: Client,
    base_url: Url,
    token: Option<String>,
}

impl fmt::Debug for GitHubClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GitHubClient")
            .field("base_url", &self.base_url)
            .field("authenticated", &self.token.is_some())
            .finish_non_exhaustive()
    }
}

impl GitHubClient {
    /// Without a token requests are unauthenticated and share the low
    /// anonymous rate limit.
    pub fn new(token: Option<String>) -> Result<Self, GitHubError> {
        let base_url =
            Url::parse(GITHUB_API_BASE).map_err(|e| GitHubError::Decode(e.to_string()))?;
        Self::with_base_url(token, base_url)
    }

    pub fn with_base_url(token: Option<String>, base_url: Url) -> Result<Self, GitHubError> {
        let http = Client::builder()
            .user_agent(concat!("gh-watchbot/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            http,
            base_url,
            token,
        })
    }

    fn get(&self, path: &str) -> Result<RequestBuilder, GitHubError> {
        let url = self
            .base_url
            .join(path)
            .map_err(|e| GitHubError::Decode(format!("invalid URL {}: {}", path, e)))?;
        let mut req = self
            .http
            .get(url)
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", GITHUB_API_VERSION);
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }
        Ok(req)
    }

    async fn fetch<T: DeserializeOwned>(&self, req: RequestBuilder) -> Result<T, GitHubError> {
        let request = req.build()?;
        debug!(url = %request.url(), "github request");
        let what = request.url().path().to_string();
        let res = self.http.execute(request).await?;
        let status = res.status();

        let rate_exhausted = res
            .headers()
            .get("x-ratelimit-remaining")
            .and_then(|v| v.to_str().ok())
            .map(|v| v == "0")
            .unwrap_or(false);
        if status == StatusCode::TOO_MANY_REQUESTS
            || (status == StatusCode::FORBIDDEN && rate_exhausted)
        {
            let reset = res
                .headers()
                .get("x-ratelimit-reset")
                .and_then(|v| v.to_str().ok())
                .unwrap_or("unknown")
                .to_string();
            return Err(GitHubError::RateLimited(format!("resets at {}", reset)));
        }
        if status == StatusCode::NOT_FOUND {
            return Err(GitHubError::NotFound(what));
        }
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(GitHubError::Status { status, body });
        }

        let bytes = res.bytes().await?;
        serde_json::from_slice(&bytes).map_err(|e| GitHubError::Decode(e.to_string()))
    }

    /// `Ok(false)` for missing or private repositories.
    pub async fn repository_exists(&self, owner: &str, name: &str) -> Result<bool, GitHubError> {
        let req = self.get(&format!("repos/{}/{}", owner, name))?;
        match self.fetch::<serde_json::Value>(req).await {
            Ok(_) => Ok(true),
            Err(GitHubError::NotFound(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Current core quota. Does not count against it.
    pub async fn rate_limit(&self) -> Result<RateLimit, GitHubError> {
        let res: RateLimitResponse = self.fetch(self.get("rate_limit")?).await?;
        Ok(res.resources.core)
    }
}

#[async_trait]
impl RepoFeed for GitHubClient {
    async fn list_recent_commits(
        &self,
        owner: &str,
        name: &str,
        since: Option<DateTime<Utc>>,
        limit: u8,
    ) -> Result<Vec<CommitRecord>, GitHubError> {
        let mut req = self
            .get(&format!("repos/{}/{}/commits", owner, name))?
            .query(&[("per_page", limit.to_string())]);
        if let Some(since) = since {
            req = req.query(&[("since", since.to_rfc3339())]);
        }
        self.fetch(req).await
    }

    async fn list_recent_releases(
        &self,
        owner: &str,
        name: &str,
        limit: u8,
    ) -> Result<Vec<ReleaseRecord>, GitHubError> {
        let req = self
            .get(&format!("repos/{}/{}/releases", owner, name))?
            .query(&[("per_page", limit.to_string())]);
        self.fetch(req).await
    }

    async fn list_issues(
        &self,
        owner: &str,
        name: &str,
        since: Option<DateTime<Utc>>,
        limit: u8,
    ) -> Result<Vec<IssueRecord>, GitHubError> {
        let mut req = self
            .get(&format!("repos/{}/{}/issues", owner, name))?
            .query(&[
                ("state", "all".to_string()),
                ("sort", "created".to_string()),
                ("direction", "desc".to_string()),
                ("per_page", limit.to_string()),
            ]);
        if let Some(since) = since {
            req = req.query(&[("since", since.to_rfc3339())]);
        }
        self.fetch(req).await
    }

    async fn list_pull_requests(
        &self,
        owner: &str,
        name: &str,
        limit: u8,
    ) -> Result<Vec<PullRequestRecord>, GitHubError> {
        let req = self
            .get(&format!("repos/{}/{}/pulls", owner, name))?
            .query(&[
                ("state", "all".to_string()),
                ("sort", "created".to_string()),
                ("direction", "desc".to_string()),
                ("per_page", limit.to_string()),
            ]);
        self.fetch(req).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issue_list_entry_flags_pull_requests() {
        let json = r#"[
            {"number": 1, "title": "bug", "state": "open", "html_url": "u",
             "user": {"login": "alice"}, "labels": [{"name": "bug"}],
             "created_at": "2024-01-01T00:00:00Z", "closed_at": null},
            {"number": 2, "title": "pr", "state": "closed", "html_url": "u",
             "user": {"login": "bob"}, "labels": [],
             "created_at": "2024-01-01T00:00:00Z", "closed_at": "2024-01-02T00:00:00Z",
             "pull_request": {"url": "x"}}
        ]"#;
        let issues: Vec<IssueRecord> = serde_json::from_str(json).unwrap();
        assert!(!issues[0].is_pull_request());
        assert_eq!(issues[0].labels[0].name, "bug");
        assert!(issues[1].is_pull_request());
        assert!(issues[1].is_closed());
    }

    #[test]
    fn rate_limit_reads_core_quota() {
        let json = r#"{"resources": {
            "core": {"limit": 5000, "remaining": 4990, "reset": 1700000000, "used": 10},
            "search": {"limit": 30, "remaining": 30, "reset": 1700000000, "used": 0}
        }, "rate": {"limit": 5000, "remaining": 4990, "reset": 1700000000, "used": 10}}"#;
        let res: RateLimitResponse = serde_json::from_str(json).unwrap();
        assert_eq!(res.resources.core.limit, 5000);
        assert_eq!(res.resources.core.remaining, 4990);
        assert_eq!(res.resources.core.reset.timestamp(), 1_700_000_000);
    }

    #[test]
    fn pull_request_merge_detected_from_merged_at() {
        let json = r#"{"number": 5, "title": "t", "state": "closed", "html_url": "u",
            "created_at": "2024-01-01T00:00:00Z", "closed_at": "2024-01-02T00:00:00Z",
            "merged_at": "2024-01-02T00:00:00Z",
            "base": {"ref": "main", "sha": "a"}, "head": {"ref": "feature", "sha": "b"}}"#;
        let pr: PullRequestRecord = serde_json::from_str(json).unwrap();
        assert!(pr.is_merged());
        assert_eq!(pr.base.ref_name, "main");
        assert_eq!(pr.head.ref_name, "feature");
    }

    #[test]
    fn commit_author_prefers_account_login() {
        let json = r#"{"sha": "abc", "html_url": "u",
            "commit": {"message": "m", "author": {"name": "Alice A", "date": "2024-01-01T00:00:00Z"}},
            "author": null}"#;
        let commit: CommitRecord = serde_json::from_str(json).unwrap();
        assert_eq!(commit.author_name(), "Alice A");
    }

    #[test]
    fn requests_carry_auth_and_version_headers() {
        let client = GitHubClient::with_base_url(
            Some("tok".into()),
            Url::parse("http://localhost:9/").unwrap(),
        )
        .unwrap();
        let req = client.get("repos/acme/widgets").unwrap().build().unwrap();
        assert_eq!(req.url().as_str(), "http://localhost:9/repos/acme/widgets");
        assert_eq!(req.headers()["authorization"], "Bearer tok");
        assert_eq!(req.headers()["x-github-api-version"], GITHUB_API_VERSION);
    }
}
