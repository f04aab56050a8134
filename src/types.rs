//! Common types used throughout the mention bot.

use std::cmp::Ordering;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The bot's own account on the platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub id: String,
    pub handle: String,
}

/// A post as returned by the platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Post {
    pub id: String,
    pub author_id: String,
    /// Author handle without the leading `@`, falling back to the author id.
    pub author: String,
    pub text: String,
    pub created_at: DateTime<Utc>,
    /// Id of the post this one replies to, if any.
    pub in_reply_to: Option<String>,
}

/// A prior message in the thread a mention belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadMessage {
    pub author: String,
    pub text: String,
}

impl From<Post> for ThreadMessage {
    fn from(post: Post) -> Self {
        Self {
            author: post.author,
            text: post.text,
        }
    }
}

/// A post that references the bot's account and is eligible for a reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mention {
    pub id: String,
    pub author_id: String,
    pub author: String,
    pub text: String,
    pub created_at: DateTime<Utc>,
    pub in_reply_to: Option<String>,
    /// Prior thread messages, oldest first.
    pub context: Vec<ThreadMessage>,
}

impl From<Post> for Mention {
    fn from(post: Post) -> Self {
        Self {
            id: post.id,
            author_id: post.author_id,
            author: post.author,
            text: post.text,
            created_at: post.created_at,
            in_reply_to: post.in_reply_to,
            context: Vec::new(),
        }
    }
}

/// Terminal outcome of processing a mention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Outcome {
    Succeeded,
    Failed,
    Skipped,
}

/// Deduplication record for a single mention.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessingRecord {
    pub mention_id: String,
    /// `None` while the mention still has attempts left.
    pub outcome: Option<Outcome>,
    pub updated_at: DateTime<Utc>,
    pub attempts: u32,
}

/// A reply produced by the response generator, awaiting publication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedReply {
    pub mention_id: String,
    pub text: String,
    pub latency: Duration,
}

/// Boundary marking the mentions that have already been fetched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Newest mention id seen so far.
    pub after_id: Option<String>,
    /// Mentions created before this instant are never returned.
    pub not_before: DateTime<Utc>,
    /// Set while a backlog too large for one fetch is being worked through.
    #[serde(default)]
    pub backlog: Option<Backlog>,
}

/// Progress through a backlog that is fetched newest first across several cycles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backlog {
    /// Oldest id fetched so far. The next fetch continues strictly below it.
    pub until_id: String,
    /// Newest id fetched so far. Becomes `after_id` once the backlog is drained.
    pub newest_id: String,
}

impl Checkpoint {
    #[must_use]
    pub fn starting_at(not_before: DateTime<Utc>) -> Self {
        Self {
            after_id: None,
            not_before,
            backlog: None,
        }
    }

    /// Upper bound of the next fetch, while a backlog is pending.
    #[must_use]
    pub fn until_id(&self) -> Option<&str> {
        self.backlog.as_ref().map(|backlog| backlog.until_id.as_str())
    }

    /// Returns true if `post` lies past this checkpoint.
    #[must_use]
    pub fn admits(&self, post: &Post) -> bool {
        post.created_at >= self.not_before
            && self
                .after_id
                .as_deref()
                .is_none_or(|after| compare_ids(&post.id, after) == Ordering::Greater)
            && self
                .until_id()
                .is_none_or(|until| compare_ids(&post.id, until) == Ordering::Less)
    }

    /// The checkpoint after handling `mentions`. Never moves backwards.
    ///
    /// `resume_below` is the oldest id fetched when more mentions remain below
    /// it. In that case `after_id` holds still and the backlog records where the
    /// next fetch continues.
    #[must_use]
    pub fn advanced_past(&self, mentions: &[Mention], resume_below: Option<&str>) -> Self {
        let newest = mentions
            .iter()
            .map(|mention| mention.id.as_str())
            .chain(self.backlog.as_ref().map(|backlog| backlog.newest_id.as_str()))
            .chain(self.after_id.as_deref())
            .max_by(|a, b| compare_ids(a, b))
            .map(str::to_string);

        if let Some(until_id) = resume_below {
            return Self {
                after_id: self.after_id.clone(),
                not_before: self.not_before,
                backlog: Some(Backlog {
                    until_id: until_id.to_string(),
                    newest_id: newest.unwrap_or_else(|| until_id.to_string()),
                }),
            };
        }

        let not_before = mentions
            .iter()
            .map(|mention| mention.created_at)
            .fold(self.not_before, |latest, created| latest.max(created));
        Self {
            after_id: newest,
            not_before,
            backlog: None,
        }
    }
}

/// Mentions returned by one fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MentionBatch<T> {
    pub items: Vec<T>,
    /// Oldest id fetched, set when the fetch stopped with older mentions still pending.
    pub resume_below: Option<String>,
}

impl<T> MentionBatch<T> {
    pub fn complete(items: Vec<T>) -> Self {
        Self {
            items,
            resume_below: None,
        }
    }
}

/// Order platform ids numerically without parsing them.
///
/// Ids are decimal snowflakes, so a longer id is always the larger one.
#[must_use]
pub fn compare_ids(a: &str, b: &str) -> Ordering {
    a.len().cmp(&b.len()).then_with(|| a.cmp(b))
}

/// Rate-limit window reported by the platform alongside a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quota {
    pub remaining: u32,
    pub reset_at: DateTime<Utc>,
}

/// A platform response body together with the quota it reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiResponse<T> {
    pub body: T,
    pub quota: Option<Quota>,
}

impl<T> ApiResponse<T> {
    pub fn new(body: T, quota: Option<Quota>) -> Self {
        Self { body, quota }
    }
}
