//! Collaborator boundaries: the source feed, the translation model and one
//! publish client per destination. Executors only ever see these traits, so
//! tests substitute recording doubles for the HTTP implementations.

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::stream::BoxStream;
use reqwest::{Client, StatusCode};
use std::time::Duration;

use crate::failure::StageError;
use crate::model::{Destination, IdempotencyKey, Item};

pub mod translator;
pub mod twitter;
pub mod wechat;
pub mod xhs;

pub use translator::OpenAiTranslator;
pub use twitter::TwitterSource;
pub use wechat::WechatPublisher;
pub use xhs::XhsBridgePublisher;

const USER_AGENT: &str = "rednote-sync/0.1";

/// Source of new items for one monitored feed.
pub trait SourceClient: Send + Sync {
    /// Items newer than `since`, oldest first. The stream is finite and
    /// restartable: calling again with the id of the last consumed item
    /// resumes after it. Reading has no side effects.
    fn list_new_items<'a>(
        &'a self,
        feed: &'a str,
        since: Option<&'a str>,
    ) -> BoxStream<'a, Result<Item, StageError>>;
}

#[async_trait]
pub trait TranslationClient: Send + Sync {
    /// Transient on quota/timeout, Terminal on content rejection.
    async fn translate(&self, text: &str) -> Result<String, StageError>;
}

/// Everything a destination needs to create one post.
#[derive(Debug, Clone, Copy)]
pub struct PublishRequest<'a> {
    pub item: &'a Item,
    pub translated_text: &'a str,
    pub idempotency_key: &'a IdempotencyKey,
}

impl PublishRequest<'_> {
    pub fn title(&self, destination: Destination) -> String {
        derive_title(self.translated_text, destination.title_limit())
    }
}

#[async_trait]
pub trait PublishClient: Send + Sync {
    fn destination(&self) -> Destination;

    /// Reason this destination cannot accept `item` at all.
    fn skip_reason(&self, _item: &Item) -> Option<String> {
        None
    }

    /// Creates the remote post and returns its external reference.
    async fn publish(&self, request: &PublishRequest<'_>) -> Result<String, StageError>;

    /// Whether `find_existing` can answer for posts created by an
    /// interrupted dispatch.
    fn supports_reconciliation(&self) -> bool {
        false
    }

    async fn find_existing(
        &self,
        _request: &PublishRequest<'_>,
    ) -> Result<Option<String>, StageError> {
        Ok(None)
    }
}

/// Title from the first line of `text`, cut to `limit` chars. Texts longer
/// than `limit` get a `...` suffix within the limit.
pub fn derive_title(text: &str, limit: usize) -> String {
    let first_line = text.split('\n').next().unwrap_or_default();
    let title: String = first_line.chars().take(limit).collect();
    if text.chars().count() > limit {
        let kept: String = title.chars().take(limit.saturating_sub(3)).collect();
        format!("{}...", kept)
    } else {
        title
    }
}

/// Maps a non-success HTTP status to a stage error.
pub fn classify_status(status: StatusCode, body: &str) -> StageError {
    let msg = format!("http {}: {}", status.as_u16(), truncate(body, 300));
    match status.as_u16() {
        // Expired sessions and tokens recover after re-authentication.
        401 | 403 | 408 | 425 | 429 => StageError::Transient(msg),
        s if s >= 500 => StageError::Transient(msg),
        _ => StageError::Terminal(msg),
    }
}

pub fn classify_transport(err: &reqwest::Error) -> StageError {
    if err.is_timeout() {
        return StageError::transient("timeout");
    }
    if err.is_decode() {
        return StageError::terminal(format!("malformed response: {}", err));
    }
    StageError::transient(format!("transport: {}", err))
}

pub fn build_http_client(timeout: Duration) -> Result<Client> {
    Client::builder()
        .user_agent(USER_AGENT)
        .timeout(timeout)
        .build()
        .context("failed to build HTTP client")
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max).collect();
    out.push_str("...");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn title_uses_first_line() {
        assert_eq!(derive_title("标题\n正文内容", 50), "标题");
        assert_eq!(derive_title("", 50), "");
    }

    #[test]
    fn long_text_gets_ellipsis_within_limit() {
        let text = "a".repeat(80);
        let title = derive_title(&text, 50);
        assert_eq!(title.chars().count(), 50);
        assert!(title.ends_with("..."));

        // Short first line but long body still marks truncation.
        let title = derive_title(&format!("short\n{}", "b".repeat(70)), 60);
        assert_eq!(title, "short...");
    }

    #[test]
    fn title_counts_chars_not_bytes() {
        let text = "你".repeat(55);
        let title = derive_title(&text, 50);
        assert_eq!(title, format!("{}...", "你".repeat(47)));
    }

    #[test]
    fn status_classification() {
        assert!(classify_status(StatusCode::TOO_MANY_REQUESTS, "").is_transient());
        assert!(classify_status(StatusCode::BAD_GATEWAY, "").is_transient());
        assert!(classify_status(StatusCode::UNAUTHORIZED, "").is_transient());
        assert!(!classify_status(StatusCode::BAD_REQUEST, "bad").is_transient());
        assert!(!classify_status(StatusCode::UNPROCESSABLE_ENTITY, "").is_transient());
        let err = classify_status(StatusCode::NOT_FOUND, &"x".repeat(400));
        assert!(err.reason().len() < 330);
    }
}
