//! Inbound GitHub webhook endpoint.
//!
//! A delivery moves through signature check, type recognition, action
//! allow-list and normalization before it is offered to the event channel.
//! Rejections answer with a client error; ignored deliveries answer 200 with
//! no event. A full channel drops the event but still answers 200 so GitHub
//! does not keep retrying against a slow consumer.
use crate::channel::{EventSender, SendOutcome};
use crate::model::{
    CommitSummary, EventKind, EventPayload, IssueAction, IssuePayload, NormalizedEvent,
    PullRequestAction, PullRequestPayload, PushPayload, ReleasePayload, RepoRef,
};
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use hmac::{Hmac, Mac};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use sha2::Sha256;
use std::sync::Arc;
use thiserror::Error;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

type HmacSha256 = Hmac<Sha256>;

const HEADER_EVENT: &str = "x-github-event";
const HEADER_SIGNATURE: &str = "x-hub-signature-256";

#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("missing required header: {0}")]
    MissingHeader(&'static str),
    #[error("invalid signature")]
    InvalidSignature,
    #[error("invalid JSON body: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("missing repository information in payload")]
    MissingRepository,
}

impl IntoResponse for WebhookError {
    fn into_response(self) -> Response {
        let status = match &self {
            WebhookError::InvalidSignature => StatusCode::UNAUTHORIZED,
            WebhookError::MissingHeader(_)
            | WebhookError::InvalidJson(_)
            | WebhookError::MissingRepository => StatusCode::BAD_REQUEST,
        };
        (status, self.to_string()).into_response()
    }
}

#[derive(Clone)]
pub struct WebhookState {
    secret: Option<Arc<[u8]>>,
    events: EventSender,
}

impl WebhookState {
    /// With no secret, signature verification is skipped and every delivery
    /// is trusted.
    pub fn new(secret: Option<&str>, events: EventSender) -> Self {
        Self {
            secret: secret.map(|s| Arc::from(s.as_bytes())),
            events,
        }
    }
}

/// Webhook routes plus the health check.
pub fn router(state: WebhookState) -> Router {
    Router::new()
        .route("/webhook", post(webhook_handler))
        .route("/webhook/github", post(webhook_handler))
        .route("/health", get(health_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Health check only, for processes that do not accept webhooks.
pub fn health_router() -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .layer(TraceLayer::new_for_http())
}

pub async fn health_handler() -> (StatusCode, &'static str) {
    (StatusCode::OK, "OK")
}

pub async fn webhook_handler(
    State(state): State<WebhookState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, &'static str), WebhookError> {
    if let Some(secret) = &state.secret {
        let header = headers
            .get(HEADER_SIGNATURE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if !verify_signature(&body, header, secret) {
            warn!("rejecting webhook with invalid signature");
            return Err(WebhookError::InvalidSignature);
        }
    }

    let event_type = headers
        .get(HEADER_EVENT)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .ok_or(WebhookError::MissingHeader(HEADER_EVENT))?;

    let event = match parse_event(event_type, &body) {
        Ok(Some(event)) => event,
        Ok(None) => {
            debug!(event_type, "ignoring webhook");
            return Ok((StatusCode::OK, "OK"));
        }
        Err(err) => {
            warn!(event_type, error = %err, "rejecting malformed webhook");
            return Err(err);
        }
    };

    let repo = event.repo.clone();
    let kind = event.kind();
    match state.events.send(event) {
        SendOutcome::Enqueued => info!(repo = %repo, kind = %kind, "webhook event received"),
        // Logged and counted by the channel.
        SendOutcome::Dropped | SendOutcome::Closed => {}
    }
    Ok((StatusCode::OK, "OK"))
}

/// Verify a `sha256=<hex>` header against the raw body. The comparison is
/// constant time.
pub fn verify_signature(payload: &[u8], signature_header: &str, secret: &[u8]) -> bool {
    let expected = match signature_header
        .strip_prefix("sha256=")
        .and_then(|h| hex::decode(h).ok())
    {
        Some(sig) => sig,
        None => return false,
    };
    let mut mac = match HmacSha256::new_from_slice(secret) {
        Ok(mac) => mac,
        Err(_) => return false,
    };
    mac.update(payload);
    mac.verify_slice(&expected).is_ok()
}

/// The header value GitHub would send for `payload`.
pub fn signature_header(payload: &[u8], secret: &[u8]) -> Option<String> {
    let mut mac = HmacSha256::new_from_slice(secret).ok()?;
    mac.update(payload);
    Some(format!("sha256={}", hex::encode(mac.finalize().into_bytes())))
}

#[derive(Debug, Deserialize)]
struct Actor {
    #[serde(default)]
    login: String,
}

#[derive(Debug, Deserialize)]
struct GitActor {
    #[serde(default)]
    name: String,
}

#[derive(Debug, Deserialize)]
struct PushCommit {
    id: String,
    #[serde(default)]
    message: String,
    #[serde(default)]
    url: String,
    author: Option<GitActor>,
}

#[derive(Debug, Deserialize)]
struct PushBody {
    #[serde(rename = "ref")]
    git_ref: String,
    #[serde(default)]
    before: Option<String>,
    after: String,
    #[serde(default)]
    compare: Option<String>,
    pusher: Option<GitActor>,
    #[serde(default)]
    commits: Vec<PushCommit>,
}

#[derive(Debug, Deserialize)]
struct ReleaseBody {
    action: String,
    release: ReleaseObject,
}

#[derive(Debug, Deserialize)]
struct ReleaseObject {
    tag_name: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    prerelease: bool,
    #[serde(default)]
    html_url: String,
    author: Option<Actor>,
}

#[derive(Debug, Deserialize)]
struct LabelObject {
    name: String,
}

#[derive(Debug, Deserialize)]
struct IssueBody {
    action: String,
    issue: IssueObject,
}

#[derive(Debug, Deserialize)]
struct IssueObject {
    number: u64,
    #[serde(default)]
    title: String,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    state: String,
    #[serde(default)]
    html_url: String,
    user: Option<Actor>,
    #[serde(default)]
    labels: Vec<LabelObject>,
    #[serde(default)]
    assignee: Option<Actor>,
}

#[derive(Debug, Deserialize)]
struct PullRequestBody {
    action: String,
    pull_request: PullRequestObject,
}

#[derive(Debug, Deserialize)]
struct BranchObject {
    #[serde(rename = "ref", default)]
    ref_name: String,
}

#[derive(Debug, Deserialize)]
struct PullRequestObject {
    number: u64,
    #[serde(default)]
    title: String,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    state: String,
    #[serde(default)]
    html_url: String,
    user: Option<Actor>,
    #[serde(default)]
    merged: bool,
    #[serde(default)]
    merged_by: Option<Actor>,
    base: BranchObject,
    head: BranchObject,
    #[serde(default)]
    additions: Option<u64>,
    #[serde(default)]
    deletions: Option<u64>,
    #[serde(default)]
    commits: Option<u64>,
}

fn login(actor: Option<Actor>) -> String {
    actor.map(|a| a.login).unwrap_or_default()
}

/// Normalize one delivery. `Ok(None)` means the delivery is valid but not
/// something subscribers are told about.
pub fn parse_event(event_type: &str, body: &[u8]) -> Result<Option<NormalizedEvent>, WebhookError> {
    let kind = match event_type {
        "push" => EventKind::Push,
        "release" => EventKind::Release,
        "issues" => EventKind::Issue,
        "pull_request" => EventKind::PullRequest,
        _ => return Ok(None),
    };

    let value: serde_json::Value = serde_json::from_slice(body)?;
    let payload = match kind {
        EventKind::Push => parse_push(&value)?,
        EventKind::Release => parse_release(&value)?,
        EventKind::Issue => parse_issue(&value)?,
        EventKind::PullRequest => parse_pull_request(&value)?,
    };
    let Some(payload) = payload else {
        return Ok(None);
    };
    let repo = extract_repository(&value)?;
    Ok(Some(NormalizedEvent::new(repo, payload)))
}

fn decode<T: DeserializeOwned>(value: &serde_json::Value) -> Result<T, WebhookError> {
    Ok(T::deserialize(value)?)
}

fn action_of(value: &serde_json::Value) -> &str {
    value
        .get("action")
        .and_then(|a| a.as_str())
        .unwrap_or_default()
}

fn parse_push(value: &serde_json::Value) -> Result<Option<EventPayload>, WebhookError> {
    let push: PushBody = decode(value)?;
    // Branch deletions all share the zero SHA and carry nothing to announce.
    if push.after.bytes().all(|b| b == b'0') {
        return Ok(None);
    }
    let commits = push
        .commits
        .into_iter()
        .map(|c| CommitSummary {
            sha: c.id,
            message: c.message,
            url: c.url,
            author: c.author.map(|a| a.name).unwrap_or_default(),
        })
        .collect();
    Ok(Some(EventPayload::Push(PushPayload {
        git_ref: Some(push.git_ref),
        before: push.before,
        after: push.after,
        compare_url: push.compare,
        pusher: push.pusher.map(|p| p.name).unwrap_or_default(),
        commits,
    })))
}

fn parse_release(value: &serde_json::Value) -> Result<Option<EventPayload>, WebhookError> {
    if action_of(value) != "published" {
        return Ok(None);
    }
    let release: ReleaseBody = decode(value)?;
    debug!(action = %release.action, "release webhook");
    let r = release.release;
    Ok(Some(EventPayload::Release(ReleasePayload {
        tag_name: r.tag_name,
        name: r.name,
        body: r.body,
        prerelease: r.prerelease,
        url: r.html_url,
        author: login(r.author),
    })))
}

fn parse_issue(value: &serde_json::Value) -> Result<Option<EventPayload>, WebhookError> {
    let Some(action) = IssueAction::parse(action_of(value)) else {
        return Ok(None);
    };
    let body: IssueBody = decode(value)?;
    debug!(action = %body.action, "issue webhook");
    let issue = body.issue;
    Ok(Some(EventPayload::Issue(IssuePayload {
        action,
        number: issue.number,
        title: issue.title,
        body: issue.body,
        state: issue.state,
        url: issue.html_url,
        author: login(issue.user),
        labels: issue.labels.into_iter().map(|l| l.name).collect(),
        assignee: issue.assignee.map(|a| a.login),
    })))
}

fn parse_pull_request(value: &serde_json::Value) -> Result<Option<EventPayload>, WebhookError> {
    let body: PullRequestBody = match action_of(value) {
        "opened" | "closed" | "reopened" => decode(value)?,
        _ => return Ok(None),
    };
    let pr = body.pull_request;
    let action = match body.action.as_str() {
        "opened" => PullRequestAction::Opened,
        "reopened" => PullRequestAction::Reopened,
        _ if pr.merged => PullRequestAction::Merged,
        _ => PullRequestAction::Closed,
    };
    Ok(Some(EventPayload::PullRequest(PullRequestPayload {
        action,
        number: pr.number,
        title: pr.title,
        body: pr.body,
        state: pr.state,
        url: pr.html_url,
        author: login(pr.user),
        merged: pr.merged,
        merged_by: pr.merged_by.map(|a| a.login),
        base_ref: pr.base.ref_name,
        head_ref: pr.head.ref_name,
        additions: pr.additions,
        deletions: pr.deletions,
        commits: pr.commits,
    })))
}

fn extract_repository(body: &serde_json::Value) -> Result<RepoRef, WebhookError> {
    let repository = body
        .get("repository")
        .ok_or(WebhookError::MissingRepository)?;
    let owner = repository
        .get("owner")
        .and_then(|o| o.get("login"))
        .and_then(|l| l.as_str())
        .filter(|s| !s.is_empty())
        .ok_or(WebhookError::MissingRepository)?;
    let name = repository
        .get("name")
        .and_then(|n| n.as_str())
        .filter(|s| !s.is_empty())
        .ok_or(WebhookError::MissingRepository)?;
    Ok(RepoRef::new(owner, name))
}
