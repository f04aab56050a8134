//! Social platform contract and the X API v2 client implementing it.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, TimeDelta, Utc};
use log::{debug, warn};
use reqwest::header::HeaderMap;
use reqwest::{RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::config::Config;
use crate::error::{BotError, Result};
use crate::types::{Account, ApiResponse, Checkpoint, MentionBatch, Post, Quota, compare_ids};

const TWEET_FIELDS: &str = "created_at,author_id,referenced_tweets";
const MAX_RESULTS: &str = "100";
const MAX_PAGES: usize = 5;

/// Assumed window length, in minutes, when a 429 arrives without a reset header.
const DEFAULT_RATE_LIMIT_WINDOW_MINUTES: i64 = 15;

/// The social platform the bot answers mentions on.
#[async_trait]
pub trait SocialApi: Send + Sync {
    /// The authenticated account.
    async fn me(&self) -> Result<Account>;

    /// Mentions of `user_id` past `since`, in any order.
    ///
    /// A batch cut short with older mentions still pending carries the oldest
    /// id it returned in `resume_below`.
    async fn list_mentions(
        &self,
        user_id: &str,
        since: &Checkpoint,
    ) -> Result<ApiResponse<MentionBatch<Post>>>;

    async fn get_post(&self, id: &str) -> Result<ApiResponse<Post>>;

    /// Publish `text` as a reply to `in_reply_to`, returning the new post id.
    async fn post_reply(&self, in_reply_to: &str, text: &str) -> Result<ApiResponse<String>>;
}

#[derive(Debug, Deserialize)]
struct DataResponse<T> {
    data: Option<T>,
    #[serde(default)]
    includes: Includes,
    #[serde(default)]
    meta: Meta,
    #[serde(default)]
    errors: Vec<ApiProblem>,
}

#[derive(Debug, Default, Deserialize)]
struct Includes {
    #[serde(default)]
    users: Vec<UserData>,
}

#[derive(Debug, Default, Deserialize)]
struct Meta {
    next_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiProblem {
    #[serde(default)]
    detail: String,
}

#[derive(Debug, Deserialize)]
struct UserData {
    id: String,
    username: String,
}

#[derive(Debug, Deserialize)]
struct TweetData {
    id: String,
    text: String,
    author_id: Option<String>,
    created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    referenced_tweets: Vec<ReferencedTweet>,
}

#[derive(Debug, Deserialize)]
struct ReferencedTweet {
    #[serde(rename = "type")]
    kind: String,
    id: String,
}

#[derive(Debug, Deserialize)]
struct CreatedTweet {
    id: String,
}

#[derive(Debug, Serialize)]
struct CreateTweetRequest<'a> {
    text: &'a str,
    reply: ReplySettings<'a>,
}

#[derive(Debug, Serialize)]
struct ReplySettings<'a> {
    in_reply_to_tweet_id: &'a str,
}

impl TweetData {
    fn into_post(self, users: &[UserData]) -> Post {
        let author_id = self.author_id.unwrap_or_default();
        let author = users
            .iter()
            .find(|user| user.id == author_id)
            .map_or_else(|| author_id.clone(), |user| user.username.clone());
        let in_reply_to = self
            .referenced_tweets
            .into_iter()
            .find(|reference| reference.kind == "replied_to")
            .map(|reference| reference.id);

        Post {
            id: self.id,
            author_id,
            author,
            text: self.text,
            created_at: self.created_at.unwrap_or_else(Utc::now),
            in_reply_to,
        }
    }
}

pub struct XClient {
    client: reqwest::Client,
    base_url: Url,
    access_token: String,
}

impl XClient {
    #[must_use]
    pub fn new(base_url: Url, access_token: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url,
            access_token,
        }
    }

    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self::new(config.x_api_base.clone(), config.x_access_token.clone())
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        Ok(self.base_url.join(path)?)
    }

    /// Send an authenticated request, turning error statuses into [`BotError`]s.
    async fn send(&self, request: RequestBuilder) -> Result<(reqwest::Response, Option<Quota>)> {
        let response = request.bearer_auth(&self.access_token).send().await?;
        let quota = parse_quota(response.headers());
        let status = response.status();

        if status == StatusCode::TOO_MANY_REQUESTS {
            let reset_at = quota.map_or_else(
                || Utc::now() + TimeDelta::minutes(DEFAULT_RATE_LIMIT_WINDOW_MINUTES),
                |quota| quota.reset_at,
            );
            return Err(BotError::RateLimited { reset_at });
        }

        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|e| format!("Failed to read error response: {e}"));
            return Err(BotError::SocialApi { status, message });
        }

        Ok((response, quota))
    }
}

#[async_trait]
impl SocialApi for XClient {
    async fn me(&self) -> Result<Account> {
        let (response, _) = self.send(self.client.get(self.endpoint("users/me")?)).await?;
        let body: DataResponse<UserData> = response.json().await?;
        let user = body.data.ok_or_else(|| missing_data(&body.errors))?;

        Ok(Account {
            id: user.id,
            handle: user.username,
        })
    }

    async fn list_mentions(
        &self,
        user_id: &str,
        since: &Checkpoint,
    ) -> Result<ApiResponse<MentionBatch<Post>>> {
        let url = self.endpoint(&format!("users/{user_id}/mentions"))?;
        let mut posts = Vec::new();
        let mut quota = None;
        let mut pagination_token: Option<String> = None;
        let mut resume_below = None;

        for page in 0..MAX_PAGES {
            let mut query = vec![
                ("max_results", MAX_RESULTS.to_string()),
                ("tweet.fields", TWEET_FIELDS.to_string()),
                ("expansions", "author_id".to_string()),
                ("user.fields", "username".to_string()),
            ];
            match &since.after_id {
                Some(after_id) => query.push(("since_id", after_id.clone())),
                None => query.push((
                    "start_time",
                    since.not_before.to_rfc3339_opts(SecondsFormat::Secs, true),
                )),
            }
            if let Some(until_id) = since.until_id() {
                query.push(("until_id", until_id.to_string()));
            }
            if let Some(token) = &pagination_token {
                query.push(("pagination_token", token.clone()));
            }

            let (response, page_quota) = self
                .send(self.client.get(url.clone()).query(&query))
                .await?;
            quota = page_quota.or(quota);

            let body: DataResponse<Vec<TweetData>> = response.json().await?;
            let users = body.includes.users;
            posts.extend(
                body.data
                    .unwrap_or_default()
                    .into_iter()
                    .map(|tweet| tweet.into_post(&users)),
            );
            debug!(
                "Fetched mentions page {}, {} posts so far",
                page + 1,
                posts.len()
            );

            let Some(token) = body.meta.next_token else {
                break;
            };
            if page + 1 == MAX_PAGES {
                resume_below = posts
                    .iter()
                    .map(|post| post.id.as_str())
                    .min_by(|a, b| compare_ids(a, b))
                    .map(str::to_string);
                warn!(
                    "More than {MAX_PAGES} pages of mentions pending, continuing below {} next cycle",
                    resume_below.as_deref().unwrap_or("the start")
                );
            } else {
                pagination_token = Some(token);
            }
        }

        let batch = MentionBatch {
            items: posts,
            resume_below,
        };
        Ok(ApiResponse::new(batch, quota))
    }

    async fn get_post(&self, id: &str) -> Result<ApiResponse<Post>> {
        let request = self
            .client
            .get(self.endpoint(&format!("tweets/{id}"))?)
            .query(&[
                ("tweet.fields", TWEET_FIELDS),
                ("expansions", "author_id"),
                ("user.fields", "username"),
            ]);
        let (response, quota) = self.send(request).await?;

        let body: DataResponse<TweetData> = response.json().await?;
        let tweet = body.data.ok_or_else(|| missing_data(&body.errors))?;
        Ok(ApiResponse::new(tweet.into_post(&body.includes.users), quota))
    }

    async fn post_reply(&self, in_reply_to: &str, text: &str) -> Result<ApiResponse<String>> {
        let request = CreateTweetRequest {
            text,
            reply: ReplySettings {
                in_reply_to_tweet_id: in_reply_to,
            },
        };
        let (response, quota) = self
            .send(self.client.post(self.endpoint("tweets")?).json(&request))
            .await?;

        let body: DataResponse<CreatedTweet> = response.json().await?;
        let created = body.data.ok_or_else(|| missing_data(&body.errors))?;
        Ok(ApiResponse::new(created.id, quota))
    }
}

fn parse_quota(headers: &HeaderMap) -> Option<Quota> {
    let header = |name: &str| headers.get(name)?.to_str().ok()?.trim().parse::<i64>().ok();
    let remaining = u32::try_from(header("x-rate-limit-remaining")?).ok()?;
    let reset_at = DateTime::from_timestamp(header("x-rate-limit-reset")?, 0)?;
    Some(Quota {
        remaining,
        reset_at,
    })
}

/// A 2xx response that carried `errors` instead of `data`.
fn missing_data(errors: &[ApiProblem]) -> BotError {
    let message = if errors.is_empty() {
        "response contained no data".to_string()
    } else {
        errors
            .iter()
            .map(|problem| problem.detail.as_str())
            .collect::<Vec<_>>()
            .join("; ")
    };
    BotError::SocialApi {
        status: StatusCode::NOT_FOUND,
        message,
    }
}
