//! Telegram MarkdownV2 rendering of normalized events.
use crate::model::{
    EventPayload, IssueAction, IssuePayload, NormalizedEvent, PullRequestAction,
    PullRequestPayload, PushPayload, ReleasePayload,
};

const MAX_LISTED_COMMITS: usize = 5;
const COMMIT_SUBJECT_LEN: usize = 50;
const RELEASE_BODY_LEN: usize = 300;

/// Escape text for MarkdownV2 outside of code and links.
pub fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(
            c,
            '_' | '*'
                | '['
                | ']'
                | '('
                | ')'
                | '~'
                | '`'
                | '>'
                | '#'
                | '+'
                | '-'
                | '='
                | '|'
                | '{'
                | '}'
                | '.'
                | '!'
                | '\\'
        ) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Escape the target of an inline link.
pub fn escape_url(s: &str) -> String {
    s.replace('\\', "\\\\").replace(')', "\\)")
}

/// Escape text inside an inline code span.
pub fn escape_code(s: &str) -> String {
    s.replace('\\', "\\\\").replace('`', "\\`")
}

/// Cut to at most `max` characters, ending with "..." when shortened.
pub fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let kept: String = s.chars().take(max.saturating_sub(3)).collect();
    format!("{}...", kept)
}

pub fn format_message(event: &NormalizedEvent) -> String {
    let header = format!("🔔 *{}*\n\n", escape(&event.repo.to_string()));
    let body = match &event.payload {
        EventPayload::Push(p) => format_push(p),
        EventPayload::Release(r) => format_release(r),
        EventPayload::Issue(i) => format_issue(i),
        EventPayload::PullRequest(pr) => format_pull_request(pr),
    };
    header + &body
}

fn branch_name(git_ref: Option<&str>) -> &str {
    match git_ref {
        Some(r) => r.strip_prefix("refs/heads/").unwrap_or(r),
        None => "default branch",
    }
}

fn format_push(p: &PushPayload) -> String {
    let count = p.commits.len();
    let noun = if count == 1 { "commit" } else { "commits" };
    let mut msg = format!(
        "🔨 *{}* pushed {} {} to `{}`\n\n",
        escape(&p.pusher),
        count,
        noun,
        escape_code(branch_name(p.git_ref.as_deref()))
    );

    for commit in p.commits.iter().take(MAX_LISTED_COMMITS) {
        let short: String = commit.sha.chars().take(7).collect();
        let subject = commit.message.lines().next().unwrap_or_default();
        msg.push_str(&format!(
            "• [`{}`]({}) {}\n",
            escape_code(&short),
            escape_url(&commit.url),
            escape(&truncate(subject, COMMIT_SUBJECT_LEN))
        ));
    }
    if count > MAX_LISTED_COMMITS {
        msg.push_str(&format!(
            "\n_\\.\\.\\.and {} more commits_\n",
            count - MAX_LISTED_COMMITS
        ));
    }
    if let Some(compare) = &p.compare_url {
        msg.push_str(&format!("\n[Compare changes]({})", escape_url(compare)));
    }
    msg
}

fn format_release(r: &ReleasePayload) -> String {
    let emoji = if r.prerelease { "🧪" } else { "🎉" };
    let name = r
        .name
        .as_deref()
        .filter(|n| !n.trim().is_empty())
        .unwrap_or(&r.tag_name);

    let mut msg = format!("{} *New Release: {}*\n\n", emoji, escape(name));
    msg.push_str(&format!("📦 Tag: `{}`\n", escape_code(&r.tag_name)));
    msg.push_str(&format!("👤 Author: {}\n", escape(&r.author)));
    if let Some(body) = r.body.as_deref().filter(|b| !b.trim().is_empty()) {
        msg.push_str(&format!("\n{}\n", escape(&truncate(body, RELEASE_BODY_LEN))));
    }
    msg.push_str(&format!("\n[View Release]({})", escape_url(&r.url)));
    msg
}

fn format_issue(i: &IssuePayload) -> String {
    let emoji = match i.action {
        IssueAction::Opened => "📝",
        IssueAction::Closed => "✅",
        IssueAction::Reopened => "🔄",
    };
    let mut msg = format!(
        "{} *Issue \\#{} {}*\n\n",
        emoji,
        i.number,
        i.action.as_str()
    );
    msg.push_str(&format!("📌 {}\n", escape(&i.title)));
    msg.push_str(&format!("👤 By: {}\n", escape(&i.author)));
    if !i.labels.is_empty() {
        msg.push_str(&format!("🏷️ Labels: {}\n", escape(&i.labels.join(", "))));
    }
    msg.push_str(&format!("\n[View Issue]({})", escape_url(&i.url)));
    msg
}

fn format_pull_request(pr: &PullRequestPayload) -> String {
    let emoji = match pr.action {
        PullRequestAction::Opened => "🔀",
        PullRequestAction::Closed => "❌",
        PullRequestAction::Merged => "🎊",
        PullRequestAction::Reopened => "🔄",
    };
    let mut msg = format!(
        "{} *PR \\#{} {}*\n\n",
        emoji,
        pr.number,
        pr.action.as_str()
    );
    msg.push_str(&format!("📌 {}\n", escape(&pr.title)));
    msg.push_str(&format!("👤 By: {}\n", escape(&pr.author)));
    if let Some(by) = pr.merged_by.as_deref().filter(|_| pr.merged) {
        msg.push_str(&format!("🤝 Merged by: {}\n", escape(by)));
    }
    msg.push_str(&format!(
        "🔀 {} → {}\n",
        escape(&pr.head_ref),
        escape(&pr.base_ref)
    ));
    if let Some(commits) = pr.commits.filter(|c| *c > 0) {
        msg.push_str(&format!(
            "📊 {} commits, \\+{}/\\-{} lines\n",
            commits,
            pr.additions.unwrap_or(0),
            pr.deletions.unwrap_or(0)
        ));
    }
    msg.push_str(&format!("\n[View PR]({})", escape_url(&pr.url)));
    msg
}
