//! Mention retrieval and reply-chain lookups.

use chrono::Utc;
use log::{debug, info, warn};
use reqwest::StatusCode;
use tokio_util::sync::CancellationToken;

use crate::error::{BotError, ErrorKind, Result};
use crate::rate_limit::{CallOutcome, RateLimiter};
use crate::types::{Account, ApiResponse, Checkpoint, Mention, MentionBatch, Post, compare_ids};
use crate::x_api::SocialApi;

pub struct MentionFetcher {
    account: Account,
}

impl MentionFetcher {
    #[must_use]
    pub fn new(account: Account) -> Self {
        Self { account }
    }

    #[must_use]
    pub fn account(&self) -> &Account {
        &self.account
    }

    /// Fetch mentions past `since`, oldest first.
    ///
    /// Mentions authored by the bot itself are dropped. When the platform cut
    /// the fetch short, `resume_below` says where the next one continues.
    ///
    /// # Errors
    ///
    /// - [`BotError::TransientFetch`] on transport or server failures
    /// - [`BotError::RateLimited`] when the platform refuses the call
    /// - [`BotError::FatalAuth`] when the credentials are rejected
    pub async fn fetch<S: SocialApi + ?Sized>(
        &self,
        api: &S,
        since: &Checkpoint,
    ) -> Result<ApiResponse<MentionBatch<Mention>>> {
        let response = api
            .list_mentions(&self.account.id, since)
            .await
            .map_err(|e| classify(e, Lookup::Mentions))?;

        let MentionBatch {
            items,
            resume_below,
        } = response.body;
        let mut posts: Vec<Post> = items
            .into_iter()
            .filter(|post| post.author_id != self.account.id && since.admits(post))
            .collect();
        posts.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| compare_ids(&a.id, &b.id))
        });
        posts.dedup_by(|a, b| a.id == b.id);

        if !posts.is_empty() {
            info!("Retrieved {} new mentions", posts.len());
        }
        debug!("Checkpoint after_id={:?}", since.after_id);

        let batch = MentionBatch {
            items: posts.into_iter().map(Mention::from).collect(),
            resume_below,
        };
        Ok(ApiResponse::new(batch, response.quota))
    }

    /// Look up a single post, used to walk a mention's reply chain.
    ///
    /// # Errors
    ///
    /// Same as [`MentionFetcher::fetch`], except a forbidden post is transient.
    pub async fn lookup<S: SocialApi + ?Sized>(
        &self,
        api: &S,
        id: &str,
    ) -> Result<ApiResponse<Post>> {
        api.get_post(id)
            .await
            .map_err(|e| classify(e, Lookup::Post))
    }
}

/// Resolve the bot's own account, retrying transient failures.
///
/// Rate limits are waited out without counting against `max_attempts`.
///
/// # Errors
///
/// - [`BotError::FatalAuth`] when the credentials are rejected
/// - [`BotError::Shutdown`] when shutdown is requested while waiting
/// - the last transient error once `max_attempts` calls have failed
pub async fn discover_account<S: SocialApi + ?Sized>(
    api: &S,
    limiter: &mut RateLimiter,
    max_attempts: u32,
    shutdown: &CancellationToken,
) -> Result<Account> {
    let mut attempts = 0;
    loop {
        let wait = limiter.admit(Utc::now());
        if !wait.is_zero() {
            debug!("Waiting {wait:?} before looking up the account");
            tokio::select! {
                () = shutdown.cancelled() => return Err(BotError::Shutdown),
                () = tokio::time::sleep(wait) => {}
            }
        }

        let err = match api.me().await {
            Ok(account) => {
                limiter.report(CallOutcome::Success, Utc::now());
                return Ok(account);
            }
            Err(e) => classify(e, Lookup::Account),
        };

        match err.kind() {
            ErrorKind::RateLimited(reset_at) => {
                warn!("Account lookup rate limited until {reset_at}");
                limiter.report(CallOutcome::RateLimited { reset_at }, Utc::now());
            }
            ErrorKind::Transient => {
                attempts += 1;
                if attempts >= max_attempts {
                    return Err(err);
                }
                warn!("Account lookup failed (attempt {attempts}/{max_attempts}): {err}");
                limiter.report(CallOutcome::TransientError, Utc::now());
            }
            ErrorKind::FatalMention | ErrorKind::FatalProcess => return Err(err),
        }
    }
}

#[derive(Clone, Copy)]
enum Lookup {
    Account,
    Mentions,
    Post,
}

fn classify(err: BotError, lookup: Lookup) -> BotError {
    match err {
        BotError::SocialApi { status, message } if status == StatusCode::UNAUTHORIZED => {
            BotError::FatalAuth(message)
        }
        BotError::SocialApi { status, message }
            if status == StatusCode::FORBIDDEN && !matches!(lookup, Lookup::Post) =>
        {
            BotError::FatalAuth(message)
        }
        BotError::SocialApi { status, message } => {
            BotError::TransientFetch(format!("{status}: {message}"))
        }
        BotError::Reqwest(e) => BotError::TransientFetch(e.to_string()),
        BotError::Json(e) => BotError::TransientFetch(format!("malformed response: {e}")),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::rate_limit::BackoffPolicy;
    use crate::test_support::{FakeSocial, account, checkpoint, post};

    #[tokio::test]
    async fn mentions_come_back_oldest_first() -> Result<()> {
        let social = FakeSocial::new();
        social.set_mentions(vec![post("103", 30), post("101", 10), post("102", 20)]);
        let fetcher = MentionFetcher::new(account());

        let mentions = fetcher.fetch(&social, &checkpoint()).await?.body.items;
        let ids: Vec<&str> = mentions.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, ["101", "102", "103"]);
        Ok(())
    }

    #[tokio::test]
    async fn own_posts_and_old_posts_are_dropped() -> Result<()> {
        let social = FakeSocial::new();
        let mut own = post("104", 40);
        own.author_id = account().id;
        social.set_mentions(vec![post("101", 10), own, post("90", -10)]);
        let fetcher = MentionFetcher::new(account());

        let mentions = fetcher.fetch(&social, &checkpoint()).await?.body.items;
        let ids: Vec<&str> = mentions.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, ["101"]);
        Ok(())
    }

    #[tokio::test]
    async fn unauthorized_is_fatal() {
        let social = FakeSocial::new();
        social.push_list_error(BotError::SocialApi {
            status: StatusCode::UNAUTHORIZED,
            message: "Unauthorized".to_string(),
        });
        let fetcher = MentionFetcher::new(account());

        let err = fetcher.fetch(&social, &checkpoint()).await.err();
        assert!(matches!(err, Some(BotError::FatalAuth(_))));
    }

    #[tokio::test]
    async fn server_errors_are_transient() {
        let social = FakeSocial::new();
        social.push_list_error(BotError::SocialApi {
            status: StatusCode::BAD_GATEWAY,
            message: "upstream".to_string(),
        });
        let fetcher = MentionFetcher::new(account());

        let err = fetcher.fetch(&social, &checkpoint()).await.err();
        assert!(matches!(err, Some(ref e) if e.kind() == ErrorKind::Transient));
    }

    #[test]
    fn forbidden_post_lookup_is_not_fatal() {
        let forbidden = || BotError::SocialApi {
            status: StatusCode::FORBIDDEN,
            message: "protected".to_string(),
        };
        assert!(matches!(
            classify(forbidden(), Lookup::Post),
            BotError::TransientFetch(_)
        ));
        assert!(matches!(
            classify(forbidden(), Lookup::Mentions),
            BotError::FatalAuth(_)
        ));
    }

    #[tokio::test]
    async fn cut_short_fetch_passes_resume_point_through() -> Result<()> {
        let social = FakeSocial::new();
        social.push_batch(vec![post("103", 30), post("102", 20)], Some("102"));
        let fetcher = MentionFetcher::new(account());

        let batch = fetcher.fetch(&social, &checkpoint()).await?.body;
        assert_eq!(batch.items.len(), 2);
        assert_eq!(batch.resume_below.as_deref(), Some("102"));
        Ok(())
    }

    fn account_limiter() -> RateLimiter {
        RateLimiter::new("platform", BackoffPolicy::default())
    }

    #[tokio::test(start_paused = true)]
    async fn account_lookup_retries_server_errors() -> Result<()> {
        let social = FakeSocial::new();
        for _ in 0..2 {
            social.push_me_error(BotError::SocialApi {
                status: StatusCode::SERVICE_UNAVAILABLE,
                message: "over capacity".to_string(),
            });
        }
        let mut limiter = account_limiter();

        let found = discover_account(&social, &mut limiter, 3, &CancellationToken::new()).await?;
        assert_eq!(found, account());
        assert_eq!(social.me_calls(), 3);
        assert_eq!(limiter.state().backoff, Duration::ZERO);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn account_lookup_gives_up_after_max_attempts() {
        let social = FakeSocial::new();
        for _ in 0..3 {
            social.push_me_error(BotError::SocialApi {
                status: StatusCode::BAD_GATEWAY,
                message: "upstream".to_string(),
            });
        }
        let mut limiter = account_limiter();

        let result = discover_account(&social, &mut limiter, 3, &CancellationToken::new()).await;
        assert!(matches!(result, Err(BotError::TransientFetch(_))));
        assert_eq!(social.me_calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn account_lookup_waits_out_rate_limits() -> Result<()> {
        let social = FakeSocial::new();
        for _ in 0..4 {
            social.push_me_error(BotError::RateLimited {
                reset_at: Utc::now() + chrono::TimeDelta::seconds(60),
            });
        }
        let mut limiter = account_limiter();

        discover_account(&social, &mut limiter, 1, &CancellationToken::new()).await?;
        assert_eq!(social.me_calls(), 5);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn forbidden_account_lookup_is_fatal() {
        let social = FakeSocial::new();
        social.push_me_error(BotError::SocialApi {
            status: StatusCode::FORBIDDEN,
            message: "suspended".to_string(),
        });
        let mut limiter = account_limiter();

        let result = discover_account(&social, &mut limiter, 3, &CancellationToken::new()).await;
        assert!(matches!(result, Err(BotError::FatalAuth(_))));
        assert_eq!(social.me_calls(), 1);
    }
}
