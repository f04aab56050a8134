//! Reply publication.
//!
//! The publisher does not deduplicate: publishing the same mention twice
//! posts two replies. Callers consult the dedup store first.

use log::info;
use reqwest::StatusCode;

use crate::error::{BotError, Result};
use crate::types::Quota;
use crate::x_api::SocialApi;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishResult {
    pub reply_id: String,
    pub quota: Option<Quota>,
}

pub struct Publisher {
    max_reply_chars: usize,
}

impl Publisher {
    #[must_use]
    pub fn new(max_reply_chars: usize) -> Self {
        Self { max_reply_chars }
    }

    /// Post `text` as a reply to `mention_id`.
    ///
    /// # Errors
    ///
    /// - [`BotError::RateLimited`] when the platform refuses the call
    /// - [`BotError::TransientPublish`] on transport or server failures
    /// - [`BotError::FatalPublish`] when the platform rejects the reply
    /// - [`BotError::FatalAuth`] when the credentials are rejected
    pub async fn publish<S: SocialApi + ?Sized>(
        &self,
        api: &S,
        mention_id: &str,
        text: &str,
    ) -> Result<PublishResult> {
        let length = text.chars().count();
        if length > self.max_reply_chars {
            return Err(BotError::FatalPublish(format!(
                "reply is {length} characters, limit is {}",
                self.max_reply_chars
            )));
        }

        let response = api
            .post_reply(mention_id, text)
            .await
            .map_err(classify)?;
        info!("Posted reply {} to mention {mention_id}", response.body);

        Ok(PublishResult {
            reply_id: response.body,
            quota: response.quota,
        })
    }
}

fn classify(err: BotError) -> BotError {
    match err {
        BotError::SocialApi { status, message } if status == StatusCode::UNAUTHORIZED => {
            BotError::FatalAuth(message)
        }
        BotError::SocialApi { status, message } if status.is_client_error() => {
            BotError::FatalPublish(format!("{status}: {message}"))
        }
        BotError::SocialApi { status, message } => {
            BotError::TransientPublish(format!("{status}: {message}"))
        }
        BotError::Reqwest(e) => BotError::TransientPublish(e.to_string()),
        BotError::Json(e) => BotError::TransientPublish(format!("malformed response: {e}")),
        other => other,
    }
}
