//! Prompt construction for mention replies.

use std::fmt::Write;

use crate::types::Mention;

/// Instruction preamble used when `SYSTEM_PROMPT` is not set.
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are an AI assistant responding to posts on X.com (Twitter). \
Provide a concise and engaging response that is relevant to the conversation.";

/// Strip the leading `@handle` run a reply starts with.
#[must_use]
pub fn mention_body(text: &str) -> &str {
    let mut rest = text.trim_start();
    while let Some(stripped) = rest.strip_prefix('@') {
        let end = stripped
            .find(char::is_whitespace)
            .unwrap_or(stripped.len());
        rest = stripped[end..].trim_start();
    }
    rest.trim_end()
}

/// Build the prompt for `mention`, keeping at most `max_context` of the newest
/// thread messages.
#[must_use]
pub fn build_prompt(
    system_prompt: &str,
    mention: &Mention,
    max_context: usize,
    max_reply_chars: usize,
) -> String {
    let mut prompt = String::from(system_prompt.trim());
    let _ = write!(
        prompt,
        "\nYour reply must fit within {max_reply_chars} characters."
    );

    let skip = mention.context.len().saturating_sub(max_context);
    let context = &mention.context[skip..];
    if !context.is_empty() {
        prompt.push_str("\n\nConversation so far:");
        for message in context {
            let _ = write!(
                prompt,
                "\n@{}: {}",
                message.author,
                mention_body(&message.text)
            );
        }
    }

    let body = mention_body(&mention.text);
    if body.is_empty() {
        let _ = write!(
            prompt,
            "\n\n@{} tagged you under the last message above. Respond to it.",
            mention.author
        );
    } else {
        let _ = write!(
            prompt,
            "\n\nPost to reply to, from @{}:\n{body}",
            mention.author
        );
    }
    prompt.push_str("\n\nReply:");

    prompt
}

#[cfg(test)]
mod tests {
    use chrono::DateTime;

    use super::*;
    use crate::types::ThreadMessage;

    fn mention(context: usize) -> Mention {
        Mention {
            id: "1".to_string(),
            author_id: "7".to_string(),
            author: "alice".to_string(),
            text: "@mentionbot @bob what do you think?".to_string(),
            created_at: DateTime::from_timestamp(0, 0).unwrap_or_default(),
            in_reply_to: None,
            context: (0..context)
                .map(|i| ThreadMessage {
                    author: format!("user{i}"),
                    text: format!("message {i}"),
                })
                .collect(),
        }
    }

    #[test]
    fn strips_leading_handles() {
        assert_eq!(mention_body("@a @b  hello @c there "), "hello @c there");
        assert_eq!(mention_body("@only"), "");
        assert_eq!(mention_body("plain"), "plain");
    }

    #[test]
    fn prompt_contains_post_and_limit() {
        let prompt = build_prompt("Be nice.", &mention(0), 5, 280);
        assert!(prompt.starts_with("Be nice."));
        assert!(prompt.contains("280 characters"));
        assert!(prompt.contains("from @alice:\nwhat do you think?"));
        assert!(!prompt.contains("Conversation so far"));
    }

    #[test]
    fn oldest_context_is_dropped_first() {
        let prompt = build_prompt("Be nice.", &mention(7), 5, 280);
        assert!(!prompt.contains("message 0"));
        assert!(!prompt.contains("message 1"));
        assert!(prompt.contains("@user2: message 2"));
        assert!(prompt.contains("@user6: message 6"));

        let first = prompt.find("message 2").unwrap_or(usize::MAX);
        let last = prompt.find("message 6").unwrap_or(0);
        assert!(first < last);
    }

    #[test]
    fn zero_context_limit_omits_thread() {
        let prompt = build_prompt("Be nice.", &mention(3), 0, 280);
        assert!(!prompt.contains("Conversation so far"));
    }

    #[test]
    fn bare_tag_asks_for_a_reply_to_the_thread() {
        let mut tagged = mention(1);
        tagged.text = "@mentionbot".to_string();
        let prompt = build_prompt("Be nice.", &tagged, 5, 280);

        assert!(prompt.contains("@user0: message 0"));
        assert!(prompt.contains("@alice tagged you under the last message above"));
        assert!(!prompt.contains("Post to reply to"));
    }
}
