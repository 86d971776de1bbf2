//! Periodic scanner that turns repository snapshots into new events.
//!
//! The list endpoints offer no cursor, so novelty is decided by two signals:
//! the watch epoch (when this poller was created) filters out history, and
//! the ledger filters out anything already announced. On start the poller
//! seeds the ledger with a recent window of every feed so that nothing which
//! already existed is announced later.
use crate::channel::{EventSender, SendOutcome};
use crate::db::{self, Pool};
use crate::github::{
    CommitRecord, GitHubError, IssueRecord, PullRequestRecord, ReleaseRecord, RepoFeed,
};
use crate::ledger::{Ledger, RecordOutcome};
use crate::model::{
    CommitSummary, DedupKey, EventPayload, IssueAction, IssuePayload, LifecyclePhase,
    NormalizedEvent, PullRequestAction, PullRequestPayload, PushPayload, ReleasePayload, RepoRef,
};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Upstream rate limits make anything faster pointless.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_secs(60);
pub const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy)]
struct Windows {
    commits: u8,
    releases: u8,
    issues: u8,
    pull_requests: u8,
}

const SEED_WINDOWS: Windows = Windows {
    commits: 10,
    releases: 5,
    issues: 20,
    pull_requests: 20,
};

const SCAN_WINDOWS: Windows = Windows {
    commits: 10,
    releases: 5,
    issues: 10,
    pull_requests: 10,
};

#[derive(Debug, Error)]
pub enum ScanError {
    #[error(transparent)]
    Upstream(#[from] GitHubError),
    #[error("fetch timed out after {0:?}")]
    Timeout(Duration),
    #[error("scan cancelled")]
    Cancelled,
}

/// Outcome of one steady-state pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PassSummary {
    pub repositories: usize,
    pub emitted: usize,
    pub failed: usize,
}

pub struct Poller {
    feed: Arc<dyn RepoFeed>,
    pool: Pool,
    ledger: Ledger,
    events: EventSender,
    interval: Duration,
    concurrency: usize,
    epoch: DateTime<Utc>,
}

impl Poller {
    /// The watch epoch is the moment of construction. Intervals below
    /// [`MIN_POLL_INTERVAL`] are raised to it.
    pub fn new(
        feed: Arc<dyn RepoFeed>,
        pool: Pool,
        ledger: Ledger,
        events: EventSender,
        interval: Duration,
        concurrency: usize,
    ) -> Self {
        Self {
            feed,
            pool,
            ledger,
            events,
            interval: interval.max(MIN_POLL_INTERVAL),
            concurrency: concurrency.max(1),
            epoch: Utc::now(),
        }
    }

    pub fn with_epoch(mut self, epoch: DateTime<Utc>) -> Self {
        self.epoch = epoch;
        self
    }

    pub fn epoch(&self) -> DateTime<Utc> {
        self.epoch
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Seed, then scan every `interval` until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) {
        info!(interval = ?self.interval, epoch = %self.epoch, "poller started");
        self.initialize(&cancel).await;

        let mut ticker = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let summary = self.poll_once(&cancel).await;
                    debug!(?summary, "poll pass finished");
                }
            }
        }
        info!("poller stopped");
    }

    /// Record the recent window of every feed of every watched repository
    /// without emitting anything. Returns the number of keys newly recorded.
    #[instrument(skip_all)]
    pub async fn initialize(&self, cancel: &CancellationToken) -> usize {
        let repos = match db::list_repositories_with_subscribers(&self.pool).await {
            Ok(repos) => repos,
            Err(err) => {
                warn!(?err, "failed to list watched repositories");
                return 0;
            }
        };
        if repos.is_empty() {
            return 0;
        }
        info!(count = repos.len(), "seeding existing activity, no notifications");

        let seeded = AtomicUsize::new(0);
        let counter = &seeded;
        futures::stream::iter(repos)
            .for_each_concurrent(self.concurrency, move |repo| async move {
                if cancel.is_cancelled() {
                    return;
                }
                let n = self.seed_repo(&repo, cancel).await;
                debug!(repo = %repo, keys = n, "recorded existing activity");
                counter.fetch_add(n, Ordering::Relaxed);
            })
            .await;

        let seeded = seeded.into_inner();
        info!(keys = seeded, "seeding complete, only new activity is announced from now on");
        seeded
    }

    async fn seed_repo(&self, repo: &RepoRef, cancel: &CancellationToken) -> usize {
        let (owner, name) = (repo.owner.as_str(), repo.name.as_str());
        let mut keys = Vec::new();

        match self
            .fetch(cancel, self.feed.list_recent_commits(owner, name, None, SEED_WINDOWS.commits))
            .await
        {
            Ok(commits) => keys.extend(
                commits
                    .iter()
                    .filter(|c| !c.sha.is_empty())
                    .map(|c| DedupKey::push(repo, &c.sha)),
            ),
            Err(err) => warn!(repo = %repo, error = %err, "seeding commits failed"),
        }

        match self
            .fetch(cancel, self.feed.list_recent_releases(owner, name, SEED_WINDOWS.releases))
            .await
        {
            Ok(releases) => keys.extend(
                releases
                    .iter()
                    .filter(|r| !r.draft)
                    .map(|r| DedupKey::release(repo, &r.tag_name)),
            ),
            Err(err) => warn!(repo = %repo, error = %err, "seeding releases failed"),
        }

        match self
            .fetch(cancel, self.feed.list_issues(owner, name, None, SEED_WINDOWS.issues))
            .await
        {
            Ok(issues) => {
                for issue in issues.iter().filter(|i| !i.is_pull_request()) {
                    keys.push(DedupKey::issue(repo, issue.number, LifecyclePhase::Created));
                    if issue.is_closed() {
                        keys.push(DedupKey::issue(repo, issue.number, LifecyclePhase::Closed));
                    }
                }
            }
            Err(err) => warn!(repo = %repo, error = %err, "seeding issues failed"),
        }

        match self
            .fetch(cancel, self.feed.list_pull_requests(owner, name, SEED_WINDOWS.pull_requests))
            .await
        {
            Ok(prs) => {
                for pr in &prs {
                    keys.push(DedupKey::pull_request(repo, pr.number, LifecyclePhase::Created));
                    if pr.is_closed() {
                        let phase = if pr.is_merged() {
                            LifecyclePhase::Merged
                        } else {
                            LifecyclePhase::Closed
                        };
                        keys.push(DedupKey::pull_request(repo, pr.number, phase));
                    }
                }
            }
            Err(err) => warn!(repo = %repo, error = %err, "seeding pull requests failed"),
        }

        let mut recorded = 0;
        for key in &keys {
            match self.ledger.record_if_absent(key).await {
                Ok(RecordOutcome::Inserted) => recorded += 1,
                Ok(RecordOutcome::AlreadyPresent) => {}
                Err(err) => warn!(?err, key = %key, "failed to seed key"),
            }
        }
        recorded
    }

    /// One steady-state pass over every watched repository. A repository
    /// whose fetch fails is skipped until the next pass.
    #[instrument(skip_all)]
    pub async fn poll_once(&self, cancel: &CancellationToken) -> PassSummary {
        let repos = match db::list_repositories_with_subscribers(&self.pool).await {
            Ok(repos) => repos,
            Err(err) => {
                warn!(?err, "failed to list watched repositories");
                return PassSummary::default();
            }
        };
        let count = repos.len();
        debug!(count, "polling repositories");

        let emitted = AtomicUsize::new(0);
        let failed = AtomicUsize::new(0);
        let (emitted_ref, failed_ref) = (&emitted, &failed);
        futures::stream::iter(repos)
            .for_each_concurrent(self.concurrency, move |repo| async move {
                if cancel.is_cancelled() {
                    return;
                }
                match self.scan_repo(&repo, cancel).await {
                    Ok(n) => {
                        emitted_ref.fetch_add(n, Ordering::Relaxed);
                    }
                    Err(ScanError::Cancelled) => debug!(repo = %repo, "scan cancelled"),
                    Err(err) => {
                        warn!(repo = %repo, error = %err, "repository scan failed");
                        failed_ref.fetch_add(1, Ordering::Relaxed);
                    }
                }
            })
            .await;

        PassSummary {
            repositories: count,
            emitted: emitted.into_inner(),
            failed: failed.into_inner(),
        }
    }

    /// Scan the four feeds of one repository, emitting oldest first.
    #[instrument(skip_all, fields(repo = %repo))]
    async fn scan_repo(&self, repo: &RepoRef, cancel: &CancellationToken) -> Result<usize, ScanError> {
        let (owner, name) = (repo.owner.as_str(), repo.name.as_str());
        let mut emitted = 0;

        let commits = self
            .fetch(
                cancel,
                self.feed
                    .list_recent_commits(owner, name, Some(self.epoch), SCAN_WINDOWS.commits),
            )
            .await?;
        for commit in commits.iter().rev().filter(|c| !c.sha.is_empty()) {
            if self.emit(cancel, commit_event(repo, commit)).await? {
                emitted += 1;
            }
        }

        let releases = self
            .fetch(cancel, self.feed.list_recent_releases(owner, name, SCAN_WINDOWS.releases))
            .await?;
        for release in releases.iter().rev() {
            let published_after_epoch = release.published_at.is_some_and(|t| t >= self.epoch);
            if release.draft || !published_after_epoch {
                continue;
            }
            if self.emit(cancel, release_event(repo, release)).await? {
                emitted += 1;
            }
        }

        let issues = self
            .fetch(
                cancel,
                self.feed
                    .list_issues(owner, name, Some(self.epoch), SCAN_WINDOWS.issues),
            )
            .await?;
        for issue in issues.iter().rev().filter(|i| !i.is_pull_request()) {
            for action in issue_transitions(issue, self.epoch) {
                if self.emit(cancel, issue_event(repo, issue, action)).await? {
                    emitted += 1;
                }
            }
        }

        let prs = self
            .fetch(
                cancel,
                self.feed
                    .list_pull_requests(owner, name, SCAN_WINDOWS.pull_requests),
            )
            .await?;
        for pr in prs.iter().rev() {
            for action in pull_request_transitions(pr, self.epoch) {
                if self.emit(cancel, pull_request_event(repo, pr, action)).await? {
                    emitted += 1;
                }
            }
        }

        Ok(emitted)
    }

    /// Claim the event's key and enqueue it. Returns whether the event was
    /// enqueued. A ledger failure lets the event through unclaimed so the
    /// notifier decides. A claim whose event could not be enqueued is
    /// released so the next pass retries it.
    async fn emit(&self, cancel: &CancellationToken, event: NormalizedEvent) -> Result<bool, ScanError> {
        if cancel.is_cancelled() {
            return Err(ScanError::Cancelled);
        }
        let key = event.dedup_key();
        if self.ledger.contains(&key).await {
            return Ok(false);
        }
        let event = match self.ledger.record_if_absent(&key).await {
            Ok(RecordOutcome::Inserted) => event.into_claimed(),
            Ok(RecordOutcome::AlreadyPresent) => return Ok(false),
            Err(err) => {
                warn!(?err, key = %key, "failed to record event; sending unclaimed");
                event
            }
        };
        debug!(key = %key, "new activity detected");
        let claimed = event.claimed;
        match self.events.send(event) {
            SendOutcome::Enqueued => Ok(true),
            SendOutcome::Dropped | SendOutcome::Closed => {
                if claimed {
                    if let Err(err) = self.ledger.release(&key).await {
                        warn!(?err, key = %key, "failed to release claim of unsent event");
                    }
                }
                Ok(false)
            }
        }
    }

    async fn fetch<T, F>(&self, cancel: &CancellationToken, request: F) -> Result<T, ScanError>
    where
        F: Future<Output = Result<T, GitHubError>>,
    {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ScanError::Cancelled),
            res = tokio::time::timeout(FETCH_TIMEOUT, request) => match res {
                Ok(result) => result.map_err(ScanError::Upstream),
                Err(_) => Err(ScanError::Timeout(FETCH_TIMEOUT)),
            },
        }
    }
}

/// Transitions of an issue that happened after `epoch`. An issue created
/// after the epoch yields only `Opened`; one that existed before it can
/// only yield `Closed`.
pub fn issue_transitions(issue: &IssueRecord, epoch: DateTime<Utc>) -> Vec<IssueAction> {
    if issue.created_at >= epoch {
        vec![IssueAction::Opened]
    } else if issue.is_closed() && issue.closed_at.is_some_and(|t| t > epoch) {
        vec![IssueAction::Closed]
    } else {
        Vec::new()
    }
}

/// As [`issue_transitions`], with `Merged` replacing `Closed` for merged
/// pull requests.
pub fn pull_request_transitions(
    pr: &PullRequestRecord,
    epoch: DateTime<Utc>,
) -> Vec<PullRequestAction> {
    if pr.created_at >= epoch {
        return vec![PullRequestAction::Opened];
    }
    let ended_at = pr.closed_at.or(pr.merged_at);
    if pr.is_closed() && ended_at.is_some_and(|t| t > epoch) {
        vec![if pr.is_merged() {
            PullRequestAction::Merged
        } else {
            PullRequestAction::Closed
        }]
    } else {
        Vec::new()
    }
}

fn commit_event(repo: &RepoRef, commit: &CommitRecord) -> NormalizedEvent {
    let author = commit.author_name();
    NormalizedEvent::new(
        repo.clone(),
        EventPayload::Push(PushPayload {
            git_ref: None,
            before: None,
            after: commit.sha.clone(),
            compare_url: Some(commit.html_url.clone()).filter(|u| !u.is_empty()),
            pusher: author.clone(),
            commits: vec![CommitSummary {
                sha: commit.sha.clone(),
                message: commit.commit.message.clone(),
                url: commit.html_url.clone(),
                author,
            }],
        }),
    )
}

fn release_event(repo: &RepoRef, release: &ReleaseRecord) -> NormalizedEvent {
    NormalizedEvent::new(
        repo.clone(),
        EventPayload::Release(ReleasePayload {
            tag_name: release.tag_name.clone(),
            name: release.name.clone(),
            body: release.body.clone(),
            prerelease: release.prerelease,
            url: release.html_url.clone(),
            author: release
                .author
                .as_ref()
                .map(|a| a.login.clone())
                .unwrap_or_default(),
        }),
    )
}

fn issue_event(repo: &RepoRef, issue: &IssueRecord, action: IssueAction) -> NormalizedEvent {
    NormalizedEvent::new(
        repo.clone(),
        EventPayload::Issue(IssuePayload {
            action,
            number: issue.number,
            title: issue.title.clone(),
            body: issue.body.clone(),
            state: issue.state.clone(),
            url: issue.html_url.clone(),
            author: issue.user.as_ref().map(|u| u.login.clone()).unwrap_or_default(),
            labels: issue.labels.iter().map(|l| l.name.clone()).collect(),
            assignee: issue.assignee.as_ref().map(|a| a.login.clone()),
        }),
    )
}

fn pull_request_event(
    repo: &RepoRef,
    pr: &PullRequestRecord,
    action: PullRequestAction,
) -> NormalizedEvent {
    NormalizedEvent::new(
        repo.clone(),
        EventPayload::PullRequest(PullRequestPayload {
            action,
            number: pr.number,
            title: pr.title.clone(),
            body: pr.body.clone(),
            state: pr.state.clone(),
            url: pr.html_url.clone(),
            author: pr.user.as_ref().map(|u| u.login.clone()).unwrap_or_default(),
            merged: pr.is_merged(),
            merged_by: None,
            base_ref: pr.base.ref_name.clone(),
            head_ref: pr.head.ref_name.clone(),
            additions: pr.additions,
            deletions: pr.deletions,
            commits: pr.commits,
        }),
    )
}
