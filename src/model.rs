//! Normalized repository events shared by both ingestors and the notifier.
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of repository activity a subscriber can opt into.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Push,
    Release,
    Issue,
    PullRequest,
}

impl EventKind {
    pub const ALL: [EventKind; 4] = [
        EventKind::Push,
        EventKind::Release,
        EventKind::Issue,
        EventKind::PullRequest,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Push => "push",
            EventKind::Release => "release",
            EventKind::Issue => "issue",
            EventKind::PullRequest => "pull_request",
        }
    }

    /// Accepts both our own spelling and GitHub's `X-GitHub-Event` names
    /// (`issues`, `pull_request`), case-insensitively. `pr` is a chat shorthand.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "push" => Some(EventKind::Push),
            "release" => Some(EventKind::Release),
            "issue" | "issues" => Some(EventKind::Issue),
            "pull_request" | "pr" => Some(EventKind::PullRequest),
            _ => None,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A watched repository, identified by owner and name.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct RepoRef {
    pub owner: String,
    pub name: String,
}

impl RepoRef {
    pub fn new(owner: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for RepoRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

/// Where an issue or pull request is in its life. Part of the dedup key so
/// that opening and closing the same item are distinct facts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecyclePhase {
    Created,
    Closed,
    Merged,
    Reopened,
}

impl LifecyclePhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecyclePhase::Created => "created",
            LifecyclePhase::Closed => "closed",
            LifecyclePhase::Merged => "merged",
            LifecyclePhase::Reopened => "reopened",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum IssueAction {
    Opened,
    Closed,
    Reopened,
}

impl IssueAction {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "opened" => Some(IssueAction::Opened),
            "closed" => Some(IssueAction::Closed),
            "reopened" => Some(IssueAction::Reopened),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            IssueAction::Opened => "opened",
            IssueAction::Closed => "closed",
            IssueAction::Reopened => "reopened",
        }
    }

    pub fn phase(&self) -> LifecyclePhase {
        match self {
            IssueAction::Opened => LifecyclePhase::Created,
            IssueAction::Closed => LifecyclePhase::Closed,
            IssueAction::Reopened => LifecyclePhase::Reopened,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PullRequestAction {
    Opened,
    Closed,
    Reopened,
    Merged,
}

impl PullRequestAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            PullRequestAction::Opened => "opened",
            PullRequestAction::Closed => "closed",
            PullRequestAction::Reopened => "reopened",
            PullRequestAction::Merged => "merged",
        }
    }

    pub fn phase(&self) -> LifecyclePhase {
        match self {
            PullRequestAction::Opened => LifecyclePhase::Created,
            PullRequestAction::Closed => LifecyclePhase::Closed,
            PullRequestAction::Reopened => LifecyclePhase::Reopened,
            PullRequestAction::Merged => LifecyclePhase::Merged,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitSummary {
    pub sha: String,
    pub message: String,
    pub url: String,
    pub author: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushPayload {
    /// Full ref (`refs/heads/main`). Unknown for commits discovered by polling.
    pub git_ref: Option<String>,
    pub before: Option<String>,
    pub after: String,
    pub compare_url: Option<String>,
    pub pusher: String,
    pub commits: Vec<CommitSummary>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleasePayload {
    pub tag_name: String,
    pub name: Option<String>,
    pub body: Option<String>,
    pub prerelease: bool,
    pub url: String,
    pub author: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuePayload {
    pub action: IssueAction,
    pub number: u64,
    pub title: String,
    pub body: Option<String>,
    pub state: String,
    pub url: String,
    pub author: String,
    pub labels: Vec<String>,
    pub assignee: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullRequestPayload {
    pub action: PullRequestAction,
    pub number: u64,
    pub title: String,
    pub body: Option<String>,
    pub state: String,
    pub url: String,
    pub author: String,
    pub merged: bool,
    pub merged_by: Option<String>,
    pub base_ref: String,
    pub head_ref: String,
    pub additions: Option<u64>,
    pub deletions: Option<u64>,
    pub commits: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventPayload {
    Push(PushPayload),
    Release(ReleasePayload),
    Issue(IssuePayload),
    PullRequest(PullRequestPayload),
}

/// One notifiable fact about one repository.
///
/// The kind is derived from the payload variant, so the two can never
/// disagree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedEvent {
    pub repo: RepoRef,
    pub payload: EventPayload,
    /// Set by a producer that already committed this event's key to the
    /// ledger with a winning insert.
    pub claimed: bool,
}

impl NormalizedEvent {
    pub fn new(repo: RepoRef, payload: EventPayload) -> Self {
        Self {
            repo,
            payload,
            claimed: false,
        }
    }

    pub fn into_claimed(mut self) -> Self {
        self.claimed = true;
        self
    }

    pub fn kind(&self) -> EventKind {
        match &self.payload {
            EventPayload::Push(_) => EventKind::Push,
            EventPayload::Release(_) => EventKind::Release,
            EventPayload::Issue(_) => EventKind::Issue,
            EventPayload::PullRequest(_) => EventKind::PullRequest,
        }
    }

    pub fn dedup_key(&self) -> DedupKey {
        let event_id = match &self.payload {
            EventPayload::Push(p) => p.after.clone(),
            EventPayload::Release(r) => release_event_id(&r.tag_name),
            EventPayload::Issue(i) => issue_event_id(i.number, i.action.phase()),
            EventPayload::PullRequest(pr) => pull_request_event_id(pr.number, pr.action.phase()),
        };
        DedupKey::new(&self.repo, self.kind(), event_id)
    }

    /// Extra keys made redundant once this event is delivered. A push covers
    /// every commit it carries, so polling must not announce them again.
    pub fn covered_keys(&self) -> Vec<DedupKey> {
        match &self.payload {
            EventPayload::Push(p) => p
                .commits
                .iter()
                .filter(|c| !c.sha.is_empty() && c.sha != p.after)
                .map(|c| DedupKey::new(&self.repo, EventKind::Push, c.sha.clone()))
                .collect(),
            EventPayload::Release(_) | EventPayload::Issue(_) | EventPayload::PullRequest(_) => {
                Vec::new()
            }
        }
    }
}

/// Ledger identity of a fact: `(owner, name, kind, event_id)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DedupKey {
    pub owner: String,
    pub name: String,
    pub kind: EventKind,
    pub event_id: String,
}

impl DedupKey {
    pub fn new(repo: &RepoRef, kind: EventKind, event_id: impl Into<String>) -> Self {
        Self {
            owner: repo.owner.clone(),
            name: repo.name.clone(),
            kind,
            event_id: event_id.into(),
        }
    }

    pub fn push(repo: &RepoRef, sha: &str) -> Self {
        Self::new(repo, EventKind::Push, sha)
    }

    pub fn release(repo: &RepoRef, tag_name: &str) -> Self {
        Self::new(repo, EventKind::Release, release_event_id(tag_name))
    }

    pub fn issue(repo: &RepoRef, number: u64, phase: LifecyclePhase) -> Self {
        Self::new(repo, EventKind::Issue, issue_event_id(number, phase))
    }

    pub fn pull_request(repo: &RepoRef, number: u64, phase: LifecyclePhase) -> Self {
        Self::new(repo, EventKind::PullRequest, pull_request_event_id(number, phase))
    }
}

impl fmt::Display for DedupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}:{}:{}",
            self.owner, self.name, self.kind, self.event_id
        )
    }
}

fn release_event_id(tag_name: &str) -> String {
    format!("release-{}", tag_name)
}

fn issue_event_id(number: u64, phase: LifecyclePhase) -> String {
    format!("issue-{}-{}", number, phase.as_str())
}

fn pull_request_event_id(number: u64, phase: LifecyclePhase) -> String {
    format!("pr-{}-{}", number, phase.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repo() -> RepoRef {
        RepoRef::new("acme", "widgets")
    }

    fn issue(action: IssueAction) -> NormalizedEvent {
        NormalizedEvent::new(
            repo(),
            EventPayload::Issue(IssuePayload {
                action,
                number: 42,
                title: "Broken".into(),
                body: None,
                state: "open".into(),
                url: "https://github.com/acme/widgets/issues/42".into(),
                author: "alice".into(),
                labels: vec![],
                assignee: None,
            }),
        )
    }

    fn pull_request(action: PullRequestAction) -> NormalizedEvent {
        NormalizedEvent::new(
            repo(),
            EventPayload::PullRequest(PullRequestPayload {
                action,
                number: 7,
                title: "Fix".into(),
                body: None,
                state: "closed".into(),
                url: "https://github.com/acme/widgets/pull/7".into(),
                author: "bob".into(),
                merged: action == PullRequestAction::Merged,
                merged_by: None,
                base_ref: "main".into(),
                head_ref: "fix".into(),
                additions: None,
                deletions: None,
                commits: None,
            }),
        )
    }

    #[test]
    fn event_ids_follow_kind_specific_rules() {
        assert_eq!(issue(IssueAction::Opened).dedup_key().event_id, "issue-42-created");
        assert_eq!(issue(IssueAction::Closed).dedup_key().event_id, "issue-42-closed");
        assert_eq!(
            pull_request(PullRequestAction::Merged).dedup_key().event_id,
            "pr-7-merged"
        );
        assert_eq!(
            pull_request(PullRequestAction::Opened).dedup_key().event_id,
            "pr-7-created"
        );
        assert_eq!(DedupKey::release(&repo(), "v1.2.0").event_id, "release-v1.2.0");
    }

    #[test]
    fn kind_matches_payload_variant() {
        let ev = issue(IssueAction::Opened);
        assert_eq!(ev.kind(), EventKind::Issue);
        assert_eq!(ev.dedup_key().kind, EventKind::Issue);
        assert_eq!(pull_request(PullRequestAction::Closed).kind(), EventKind::PullRequest);
    }

    #[test]
    fn push_covers_non_head_commits() {
        let commit = |sha: &str| CommitSummary {
            sha: sha.into(),
            message: "m".into(),
            url: String::new(),
            author: "a".into(),
        };
        let ev = NormalizedEvent::new(
            repo(),
            EventPayload::Push(PushPayload {
                git_ref: Some("refs/heads/main".into()),
                before: None,
                after: "ccc".into(),
                compare_url: None,
                pusher: "alice".into(),
                commits: vec![commit("aaa"), commit("bbb"), commit("ccc")],
            }),
        );
        assert_eq!(ev.dedup_key().event_id, "ccc");
        let covered: Vec<_> = ev.covered_keys().into_iter().map(|k| k.event_id).collect();
        assert_eq!(covered, vec!["aaa", "bbb"]);
    }

    #[test]
    fn kind_parsing_accepts_github_names() {
        assert_eq!(EventKind::parse("issues"), Some(EventKind::Issue));
        assert_eq!(EventKind::parse("PR"), Some(EventKind::PullRequest));
        assert_eq!(EventKind::parse("star"), None);
    }
}
