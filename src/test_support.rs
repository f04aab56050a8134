//! Scripted fakes of the platform and inference backend for unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};

use crate::config::Config;
use crate::error::{BotError, Result};
use crate::ollama::InferenceBackend;
use crate::types::{Account, ApiResponse, Checkpoint, Mention, MentionBatch, Post};
use crate::x_api::SocialApi;

/// Start of the test epoch, 2026-01-01T00:00:00Z.
pub fn base_time() -> DateTime<Utc> {
    DateTime::from_timestamp(1_767_225_600, 0).unwrap_or_default()
}

pub fn account() -> Account {
    Account {
        id: "99".to_string(),
        handle: "mentionbot".to_string(),
    }
}

pub fn checkpoint() -> Checkpoint {
    Checkpoint::starting_at(base_time())
}

/// A post by `@alice`, created `offset_secs` after [`base_time`].
pub fn post(id: &str, offset_secs: i64) -> Post {
    Post {
        id: id.to_string(),
        author_id: "7".to_string(),
        author: "alice".to_string(),
        text: format!("@mentionbot what about {id}?"),
        created_at: base_time() + TimeDelta::seconds(offset_secs),
        in_reply_to: None,
    }
}

pub fn mention(id: &str, offset_secs: i64) -> Mention {
    Mention::from(post(id, offset_secs))
}

pub fn test_config(extra: &[(&str, &str)]) -> Config {
    let mut vars: HashMap<String, String> = [
        ("X_ACCESS_TOKEN", "test-token"),
        ("START_TIME", "2026-01-01T00:00:00Z"),
    ]
    .iter()
    .chain(extra)
    .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
    .collect();
    vars.retain(|_, v| !v.is_empty());
    Config::from_lookup(|key| vars.get(key).cloned()).unwrap_or_else(|e| panic!("{e}"))
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[derive(Default)]
struct SocialState {
    mentions: Vec<Post>,
    batches: VecDeque<MentionBatch<Post>>,
    list_errors: VecDeque<BotError>,
    me_errors: VecDeque<BotError>,
    posts: HashMap<String, Post>,
    post_results: VecDeque<Result<String>>,
    replies: Vec<(String, String)>,
    me_calls: usize,
    list_calls: usize,
    lookup_calls: usize,
    post_calls: usize,
}

/// In-memory platform. Replies succeed unless a result was scripted.
#[derive(Default)]
pub struct FakeSocial {
    state: Mutex<SocialState>,
    post_delay: Option<Duration>,
}

impl FakeSocial {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every reply by `delay` before it takes effect.
    pub fn with_post_delay(mut self, delay: Duration) -> Self {
        self.post_delay = Some(delay);
        self
    }

    pub fn set_mentions(&self, mentions: Vec<Post>) {
        lock(&self.state).mentions = mentions;
    }

    /// Serve `posts` from the next fetch instead of the full mention list.
    pub fn push_batch(&self, posts: Vec<Post>, resume_below: Option<&str>) {
        lock(&self.state).batches.push_back(MentionBatch {
            items: posts,
            resume_below: resume_below.map(str::to_string),
        });
    }

    pub fn push_me_error(&self, err: BotError) {
        lock(&self.state).me_errors.push_back(err);
    }

    pub fn push_list_error(&self, err: BotError) {
        lock(&self.state).list_errors.push_back(err);
    }

    pub fn add_post(&self, post: Post) {
        lock(&self.state).posts.insert(post.id.clone(), post);
    }

    pub fn push_post_result(&self, result: Result<String>) {
        lock(&self.state).post_results.push_back(result);
    }

    /// Successfully published `(in_reply_to, text)` pairs, in order.
    pub fn replies(&self) -> Vec<(String, String)> {
        lock(&self.state).replies.clone()
    }

    pub fn me_calls(&self) -> usize {
        lock(&self.state).me_calls
    }

    pub fn list_calls(&self) -> usize {
        lock(&self.state).list_calls
    }

    pub fn lookup_calls(&self) -> usize {
        lock(&self.state).lookup_calls
    }

    pub fn post_calls(&self) -> usize {
        lock(&self.state).post_calls
    }
}

#[async_trait]
impl SocialApi for FakeSocial {
    async fn me(&self) -> Result<Account> {
        let mut state = lock(&self.state);
        state.me_calls += 1;
        state.me_errors.pop_front().map_or_else(|| Ok(account()), Err)
    }

    async fn list_mentions(
        &self,
        _user_id: &str,
        _since: &Checkpoint,
    ) -> Result<ApiResponse<MentionBatch<Post>>> {
        let mut state = lock(&self.state);
        state.list_calls += 1;
        if let Some(err) = state.list_errors.pop_front() {
            return Err(err);
        }
        if let Some(batch) = state.batches.pop_front() {
            return Ok(ApiResponse::new(batch, None));
        }
        let mut mentions = state.mentions.clone();
        mentions.reverse();
        Ok(ApiResponse::new(MentionBatch::complete(mentions), None))
    }

    async fn get_post(&self, id: &str) -> Result<ApiResponse<Post>> {
        let mut state = lock(&self.state);
        state.lookup_calls += 1;
        state
            .posts
            .get(id)
            .cloned()
            .map(|post| ApiResponse::new(post, None))
            .ok_or_else(|| BotError::SocialApi {
                status: reqwest::StatusCode::NOT_FOUND,
                message: format!("no post {id}"),
            })
    }

    async fn post_reply(&self, in_reply_to: &str, text: &str) -> Result<ApiResponse<String>> {
        lock(&self.state).post_calls += 1;
        if let Some(delay) = self.post_delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = lock(&self.state);
        let result = state
            .post_results
            .pop_front()
            .unwrap_or_else(|| Ok(format!("reply-{}", state.replies.len() + 1)));
        if result.is_ok() {
            state
                .replies
                .push((in_reply_to.to_string(), text.to_string()));
        }
        result.map(|id| ApiResponse::new(id, None))
    }
}

#[derive(Default)]
struct BackendState {
    completions: VecDeque<Result<String>>,
    prompts: Vec<String>,
}

/// In-memory inference backend. Completions succeed unless scripted otherwise.
#[derive(Default)]
pub struct FakeBackend {
    state: Mutex<BackendState>,
    delay: Option<Duration>,
    always_fail: Option<fn() -> BotError>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Fail every completion with the error `make` builds.
    pub fn always_failing(make: fn() -> BotError) -> Self {
        Self {
            always_fail: Some(make),
            ..Self::default()
        }
    }

    pub fn push_completion(&self, result: Result<String>) {
        lock(&self.state).completions.push_back(result);
    }

    pub fn completions(&self) -> usize {
        lock(&self.state).prompts.len()
    }

    pub fn prompts(&self) -> Vec<String> {
        lock(&self.state).prompts.clone()
    }
}

#[async_trait]
impl InferenceBackend for FakeBackend {
    fn model(&self) -> &str {
        "fake-model"
    }

    async fn complete(&self, prompt: &str, _max_tokens: u32) -> Result<String> {
        lock(&self.state).prompts.push(prompt.to_string());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(make) = self.always_fail {
            return Err(make());
        }
        lock(&self.state)
            .completions
            .pop_front()
            .unwrap_or_else(|| Ok("Thanks for the mention!".to_string()))
    }

    async fn list_models(&self) -> Result<Vec<String>> {
        Ok(vec!["fake-model".to_string()])
    }
}
