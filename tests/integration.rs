use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use gh_watchbot::channel::{event_channel, EventReceiver, EventSender};
use gh_watchbot::db;
use gh_watchbot::github::{
    Account, CommitDetail, CommitRecord, GitHubError, GitSignature, IssueRecord,
    PullRequestRecord, ReleaseRecord, RepoFeed,
};
use gh_watchbot::ledger::Ledger;
use gh_watchbot::model::{DedupKey, EventKind, RepoRef};
use gh_watchbot::notifier::{HandleOutcome, Messenger, Notifier};
use gh_watchbot::poller::Poller;
use gh_watchbot::webhook::parse_event;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Default)]
struct Snapshot {
    commits: Vec<CommitRecord>,
    releases: Vec<ReleaseRecord>,
    issues: Vec<IssueRecord>,
    prs: Vec<PullRequestRecord>,
}

/// Serves whatever snapshot the test last installed for a repository.
#[derive(Default)]
struct ScriptedFeed {
    snapshots: Mutex<HashMap<String, Snapshot>>,
}

impl ScriptedFeed {
    async fn set(&self, repo: &str, snapshot: Snapshot) {
        self.snapshots.lock().await.insert(repo.to_string(), snapshot);
    }

    async fn get(&self, owner: &str, name: &str) -> Snapshot {
        self.snapshots
            .lock()
            .await
            .get(&format!("{}/{}", owner, name))
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl RepoFeed for ScriptedFeed {
    async fn list_recent_commits(
        &self,
        owner: &str,
        name: &str,
        since: Option<DateTime<Utc>>,
        limit: u8,
    ) -> Result<Vec<CommitRecord>, GitHubError> {
        let snap = self.get(owner, name).await;
        Ok(snap
            .commits
            .into_iter()
            .filter(|c| {
                let date = c.commit.author.as_ref().and_then(|a| a.date);
                match (since, date) {
                    (Some(since), Some(date)) => date >= since,
                    _ => true,
                }
            })
            .take(limit as usize)
            .collect())
    }

    async fn list_recent_releases(
        &self,
        owner: &str,
        name: &str,
        limit: u8,
    ) -> Result<Vec<ReleaseRecord>, GitHubError> {
        let snap = self.get(owner, name).await;
        Ok(snap.releases.into_iter().take(limit as usize).collect())
    }

    async fn list_issues(
        &self,
        owner: &str,
        name: &str,
        _since: Option<DateTime<Utc>>,
        limit: u8,
    ) -> Result<Vec<IssueRecord>, GitHubError> {
        let snap = self.get(owner, name).await;
        Ok(snap.issues.into_iter().take(limit as usize).collect())
    }

    async fn list_pull_requests(
        &self,
        owner: &str,
        name: &str,
        limit: u8,
    ) -> Result<Vec<PullRequestRecord>, GitHubError> {
        let snap = self.get(owner, name).await;
        Ok(snap.prs.into_iter().take(limit as usize).collect())
    }
}

#[derive(Default)]
struct Inbox {
    sent: Mutex<Vec<(i64, String)>>,
    unreachable: Vec<i64>,
}

#[async_trait]
impl Messenger for Inbox {
    async fn deliver(&self, chat_id: i64, text: &str) -> Result<()> {
        if self.unreachable.contains(&chat_id) {
            anyhow::bail!("bot was blocked by the user");
        }
        self.sent.lock().await.push((chat_id, text.to_string()));
        Ok(())
    }
}

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
}

fn at(secs: i64) -> DateTime<Utc> {
    t0() + chrono::Duration::seconds(secs)
}

fn commit(sha: &str, when: DateTime<Utc>) -> CommitRecord {
    CommitRecord {
        sha: sha.into(),
        html_url: format!("https://github.com/acme/widgets/commit/{}", sha),
        commit: CommitDetail {
            message: format!("change {}", sha),
            author: Some(GitSignature {
                name: "Alice".into(),
                date: Some(when),
            }),
        },
        author: Some(Account {
            login: "alice".into(),
        }),
    }
}

fn issue(number: u64, created: DateTime<Utc>, closed: Option<DateTime<Utc>>) -> IssueRecord {
    IssueRecord {
        number,
        title: format!("Issue {}", number),
        body: None,
        state: if closed.is_some() { "closed" } else { "open" }.into(),
        html_url: format!("https://github.com/acme/widgets/issues/{}", number),
        user: Some(Account { login: "bob".into() }),
        labels: vec![],
        assignee: None,
        created_at: created,
        closed_at: closed,
        pull_request: None,
    }
}

struct World {
    pool: db::Pool,
    ledger: Ledger,
    feed: Arc<ScriptedFeed>,
    inbox: Arc<Inbox>,
    events: EventSender,
    rx: EventReceiver,
}

impl World {
    async fn new(capacity: usize, unreachable: Vec<i64>) -> Self {
        let pool = db::memory_pool().await.unwrap();
        let (events, rx) = event_channel(capacity);
        World {
            ledger: Ledger::new(pool.clone()),
            pool,
            feed: Arc::new(ScriptedFeed::default()),
            inbox: Arc::new(Inbox {
                unreachable,
                ..Default::default()
            }),
            events,
            rx,
        }
    }

    fn poller(&self) -> Poller {
        Poller::new(
            self.feed.clone(),
            self.pool.clone(),
            self.ledger.clone(),
            self.events.clone(),
            Duration::from_secs(60),
            2,
        )
        .with_epoch(t0())
    }

    fn notifier(&self) -> Notifier {
        Notifier::new(self.pool.clone(), self.ledger.clone(), self.inbox.clone())
    }

    /// Hand every queued event to the notifier.
    async fn deliver_pending(&mut self) -> Vec<HandleOutcome> {
        let notifier = self.notifier();
        let mut outcomes = Vec::new();
        while let Ok(event) = self.rx.try_recv() {
            outcomes.push(notifier.handle(&event).await.unwrap());
        }
        outcomes
    }

    async fn sent(&self) -> Vec<(i64, String)> {
        self.inbox.sent.lock().await.clone()
    }
}

fn widgets() -> RepoRef {
    RepoRef::new("acme", "widgets")
}

#[tokio::test]
async fn watch_scenario_closed_issue_then_new_issue() {
    let mut world = World::new(16, vec![]).await;
    db::subscribe(&world.pool, 100, &widgets(), &EventKind::ALL)
        .await
        .unwrap();
    world
        .feed
        .set(
            "acme/widgets",
            Snapshot {
                issues: vec![issue(42, at(-86_400), Some(at(-3_600)))],
                ..Default::default()
            },
        )
        .await;

    let poller = world.poller();
    let cancel = CancellationToken::new();
    poller.initialize(&cancel).await;
    let repo = widgets();
    assert!(world.ledger.contains(&DedupKey::issue(&repo, 42, gh_watchbot::model::LifecyclePhase::Created)).await);
    assert!(world.ledger.contains(&DedupKey::issue(&repo, 42, gh_watchbot::model::LifecyclePhase::Closed)).await);

    // Nothing changed upstream: nothing to say.
    let summary = poller.poll_once(&cancel).await;
    assert_eq!(summary.emitted, 0);
    assert!(world.deliver_pending().await.is_empty());

    world
        .feed
        .set(
            "acme/widgets",
            Snapshot {
                issues: vec![
                    issue(43, at(10), None),
                    issue(42, at(-86_400), Some(at(-3_600))),
                ],
                ..Default::default()
            },
        )
        .await;
    let summary = poller.poll_once(&cancel).await;
    assert_eq!(summary.emitted, 1);
    let outcomes = world.deliver_pending().await;
    assert_eq!(
        outcomes,
        vec![HandleOutcome::Delivered {
            delivered: 1,
            failed: 0
        }]
    );

    let sent = world.sent().await;
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, 100);
    assert!(sent[0].1.contains("Issue \\#43 opened"));
    assert!(world.ledger.contains(&DedupKey::issue(&repo, 43, gh_watchbot::model::LifecyclePhase::Created)).await);
}

#[tokio::test]
async fn webhook_push_suppresses_later_poll_of_same_commits() {
    let mut world = World::new(16, vec![]).await;
    db::subscribe(&world.pool, 7, &widgets(), &[EventKind::Push])
        .await
        .unwrap();
    let poller = world.poller();
    let cancel = CancellationToken::new();
    poller.initialize(&cancel).await;

    let body = serde_json::json!({
        "ref": "refs/heads/main",
        "before": "0000000",
        "after": "bbbbbbbbbb",
        "compare": "https://github.com/acme/widgets/compare/0000000...bbbbbbbbbb",
        "pusher": {"name": "alice"},
        "commits": [
            {"id": "aaaaaaaaaa", "message": "first", "url": "u1", "author": {"name": "alice"}},
            {"id": "bbbbbbbbbb", "message": "second", "url": "u2", "author": {"name": "alice"}}
        ],
        "repository": {"name": "widgets", "owner": {"login": "acme"}}
    });
    let event = parse_event("push", &serde_json::to_vec(&body).unwrap())
        .unwrap()
        .unwrap();
    world.events.send(event);
    world.deliver_pending().await;
    assert_eq!(world.sent().await.len(), 1);

    // The poller now sees both commits of that push.
    world
        .feed
        .set(
            "acme/widgets",
            Snapshot {
                commits: vec![commit("bbbbbbbbbb", at(20)), commit("aaaaaaaaaa", at(15))],
                ..Default::default()
            },
        )
        .await;
    let summary = poller.poll_once(&cancel).await;
    assert_eq!(summary.emitted, 0);
    assert!(world.deliver_pending().await.is_empty());
    assert_eq!(world.sent().await.len(), 1);
}

#[tokio::test]
async fn webhook_after_poll_is_a_duplicate() {
    let mut world = World::new(16, vec![]).await;
    db::subscribe(&world.pool, 7, &widgets(), &EventKind::ALL)
        .await
        .unwrap();
    let poller = world.poller();
    let cancel = CancellationToken::new();
    poller.initialize(&cancel).await;

    world
        .feed
        .set(
            "acme/widgets",
            Snapshot {
                issues: vec![issue(50, at(5), None)],
                ..Default::default()
            },
        )
        .await;
    poller.poll_once(&cancel).await;

    let body = serde_json::json!({
        "action": "opened",
        "issue": {"number": 50, "title": "Issue 50", "state": "open", "html_url": "u",
                  "user": {"login": "bob"}, "labels": []},
        "repository": {"name": "widgets", "owner": {"login": "acme"}}
    });
    let event = parse_event("issues", &serde_json::to_vec(&body).unwrap())
        .unwrap()
        .unwrap();
    world.events.send(event);

    let outcomes = world.deliver_pending().await;
    assert_eq!(
        outcomes,
        vec![
            HandleOutcome::Delivered {
                delivered: 1,
                failed: 0
            },
            HandleOutcome::Duplicate
        ]
    );
    assert_eq!(world.sent().await.len(), 1);
}

#[tokio::test]
async fn unreachable_subscriber_does_not_block_the_rest() {
    let mut world = World::new(16, vec![1]).await;
    for chat in [1, 2] {
        db::subscribe(&world.pool, chat, &widgets(), &EventKind::ALL)
            .await
            .unwrap();
    }
    let poller = world.poller();
    let cancel = CancellationToken::new();
    poller.initialize(&cancel).await;
    world
        .feed
        .set(
            "acme/widgets",
            Snapshot {
                commits: vec![commit("cafebabe00", at(30))],
                ..Default::default()
            },
        )
        .await;
    poller.poll_once(&cancel).await;

    let outcomes = world.deliver_pending().await;
    assert_eq!(
        outcomes,
        vec![HandleOutcome::Delivered {
            delivered: 1,
            failed: 1
        }]
    );
    let sent = world.sent().await;
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, 2);
    assert!(sent[0].1.contains("default branch"));
    assert!(world.ledger.contains(&DedupKey::push(&widgets(), "cafebabe00")).await);
}

#[tokio::test]
async fn saturated_channel_drops_instead_of_blocking() {
    let mut world = World::new(1, vec![]).await;
    db::subscribe(&world.pool, 1, &widgets(), &EventKind::ALL)
        .await
        .unwrap();
    let poller = world.poller();
    let cancel = CancellationToken::new();
    poller.initialize(&cancel).await;
    world
        .feed
        .set(
            "acme/widgets",
            Snapshot {
                commits: vec![
                    commit("c3c3c3c3c3", at(30)),
                    commit("c2c2c2c2c2", at(20)),
                    commit("c1c1c1c1c1", at(10)),
                ],
                ..Default::default()
            },
        )
        .await;

    let summary = tokio::time::timeout(Duration::from_secs(5), poller.poll_once(&cancel))
        .await
        .unwrap();
    assert_eq!(summary.emitted, 1);
    assert_eq!(world.events.dropped(), 2);
    assert_eq!(world.deliver_pending().await.len(), 1);

    // Dropped commits were not claimed, so later passes pick them up.
    for _ in 0..2 {
        let summary = poller.poll_once(&cancel).await;
        assert_eq!(summary.emitted, 1);
        assert_eq!(world.deliver_pending().await.len(), 1);
    }
    assert_eq!(poller.poll_once(&cancel).await.emitted, 0);
}

#[tokio::test]
async fn consumer_drains_after_producers_stop() {
    let world = World::new(16, vec![]).await;
    db::subscribe(&world.pool, 9, &widgets(), &EventKind::ALL)
        .await
        .unwrap();
    world
        .feed
        .set(
            "acme/widgets",
            Snapshot {
                commits: vec![commit("d1d1d1d1d1", at(-30))],
                ..Default::default()
            },
        )
        .await;

    let World {
        pool,
        ledger,
        feed,
        inbox,
        events,
        rx,
    } = world;
    let notifier = Notifier::new(pool.clone(), ledger.clone(), inbox.clone());
    let consumer = tokio::spawn(notifier.run(rx));

    let poller = Poller::new(feed.clone(), pool.clone(), ledger.clone(), events.clone(), Duration::from_secs(60), 1)
        .with_epoch(t0());
    poller.initialize(&CancellationToken::new()).await;
    feed.set(
        "acme/widgets",
        Snapshot {
            commits: vec![commit("d2d2d2d2d2", at(40)), commit("d1d1d1d1d1", at(-30))],
            ..Default::default()
        },
    )
    .await;
    poller.poll_once(&CancellationToken::new()).await;

    drop(poller);
    drop(events);
    tokio::time::timeout(Duration::from_secs(5), consumer)
        .await
        .unwrap()
        .unwrap();

    let sent = inbox.sent.lock().await;
    assert_eq!(sent.len(), 1);
    assert!(sent[0].1.contains("d2d2d2d"));
    ledger.close().await;
}
