//! XHS (Xiaohongshu) publisher. Posting goes through a browser-automation
//! bridge that exposes a small HTTP API and remembers idempotency keys, so
//! an interrupted publish can be looked up instead of posted twice.
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde::Deserialize;
use serde_json::{json, Value};
use std::fmt;
use std::time::Duration;
use tracing::info;

use super::{
    build_http_client, classify_status, classify_transport, PublishClient, PublishRequest,
};
use crate::config;
use crate::failure::StageError;
use crate::model::{Destination, Item};

const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

pub struct XhsBridgePublisher {
    http: Client,
    base_url: Url,
    token: Option<String>,
    require_media: bool,
}

impl fmt::Debug for XhsBridgePublisher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("XhsBridgePublisher")
            .field("base_url", &self.base_url)
            .field("require_media", &self.require_media)
            .finish_non_exhaustive()
    }
}

/// Bridge reply for both create and lookup.
#[derive(Debug, Deserialize)]
pub struct BridgeReply {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub note_id: Option<String>,
    #[serde(default)]
    pub login_required: bool,
    #[serde(default)]
    pub error: Option<String>,
}

impl XhsBridgePublisher {
    pub fn from_config(cfg: &config::Xhs, timeout: Duration) -> Result<Self> {
        Ok(Self {
            http: build_http_client(timeout)?,
            base_url: Url::parse(&cfg.bridge_url).context("invalid destinations.xhs.bridge_url")?,
            token: cfg.token.clone(),
            require_media: cfg.require_media,
        })
    }

    pub fn note_body(request: &PublishRequest<'_>) -> Value {
        json!({
            "title": request.title(Destination::Xhs),
            "content": request.translated_text,
            "images": request.item.photo_urls(),
            "source_id": request.item.id,
        })
    }

    pub fn build_publish_request(&self, request: &PublishRequest<'_>) -> Result<reqwest::Request> {
        let endpoint = self
            .base_url
            .join("v1/notes")
            .context("invalid XHS bridge URL")?;
        let mut builder = self
            .http
            .post(endpoint)
            .header(IDEMPOTENCY_HEADER, request.idempotency_key.to_string())
            .json(&Self::note_body(request));
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token);
        }
        builder.build().context("failed to build XHS publish request")
    }

    pub fn build_lookup_request(&self, request: &PublishRequest<'_>) -> Result<reqwest::Request> {
        let mut endpoint = self
            .base_url
            .join("v1/notes")
            .context("invalid XHS bridge URL")?;
        endpoint
            .query_pairs_mut()
            .append_pair("idempotency_key", &request.idempotency_key.to_string());
        let mut builder = self.http.get(endpoint);
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token);
        }
        builder.build().context("failed to build XHS lookup request")
    }

    async fn send(&self, request: reqwest::Request) -> Result<(StatusCode, String), StageError> {
        let res = self
            .http
            .execute(request)
            .await
            .map_err(|e| classify_transport(&e))?;
        let status = res.status();
        let body = res.text().await.map_err(|e| classify_transport(&e))?;
        Ok((status, body))
    }
}

/// Interprets a create reply. The external reference is `xhs:<note id>`.
pub fn parse_publish_reply(body: &str) -> Result<String, StageError> {
    let reply: BridgeReply = serde_json::from_str(body)
        .map_err(|e| StageError::terminal(format!("malformed bridge response: {}", e)))?;
    if reply.login_required {
        return Err(StageError::transient("XHS login session expired"));
    }
    match (reply.success, reply.note_id) {
        (true, Some(id)) if !id.is_empty() => Ok(format!("xhs:{}", id)),
        (true, _) => Err(StageError::terminal("bridge reported success without a note id")),
        (false, _) => Err(StageError::Terminal(
            reply.error.unwrap_or_else(|| "publish rejected".into()),
        )),
    }
}

#[async_trait]
impl PublishClient for XhsBridgePublisher {
    fn destination(&self) -> Destination {
        Destination::Xhs
    }

    fn skip_reason(&self, item: &Item) -> Option<String> {
        if self.require_media && item.photo_urls().is_empty() {
            return Some("XHS notes require at least one image".into());
        }
        None
    }

    async fn publish(&self, request: &PublishRequest<'_>) -> Result<String, StageError> {
        let http_request = self
            .build_publish_request(request)
            .map_err(|e| StageError::terminal(format!("{:#}", e)))?;
        let (status, body) = self.send(http_request).await?;
        if !status.is_success() {
            return Err(classify_status(status, &body));
        }
        let external_ref = parse_publish_reply(&body)?;
        info!(key = %request.idempotency_key, external_ref = %external_ref, "published XHS note");
        Ok(external_ref)
    }

    fn supports_reconciliation(&self) -> bool {
        true
    }

    async fn find_existing(
        &self,
        request: &PublishRequest<'_>,
    ) -> Result<Option<String>, StageError> {
        let http_request = self
            .build_lookup_request(request)
            .map_err(|e| StageError::terminal(format!("{:#}", e)))?;
        let (status, body) = self.send(http_request).await?;
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(classify_status(status, &body));
        }
        parse_publish_reply(&body).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{IdempotencyKey, MediaRef, StageKey};
    use chrono::Utc;

    fn publisher(require_media: bool) -> XhsBridgePublisher {
        XhsBridgePublisher::from_config(
            &config::Xhs {
                bridge_url: "http://127.0.0.1:8931/".into(),
                token: Some("bridge-token".into()),
                require_media,
            },
            Duration::from_secs(5),
        )
        .unwrap()
    }

    fn item(media: Vec<MediaRef>) -> Item {
        Item {
            id: "X1".into(),
            feed: "42".into(),
            author_id: "42".into(),
            content: "Hello".into(),
            media,
            source_created_at: Utc::now(),
            first_seen_at: Utc::now(),
        }
    }

    #[test]
    fn publish_request_carries_idempotency_key() {
        let p = publisher(false);
        let item = item(vec![]);
        let key = IdempotencyKey::new("X1", StageKey::Publish(Destination::Xhs));
        let req = PublishRequest {
            item: &item,
            translated_text: "你好",
            idempotency_key: &key,
        };
        let http = p.build_publish_request(&req).unwrap();
        assert_eq!(http.url().as_str(), "http://127.0.0.1:8931/v1/notes");
        assert_eq!(
            http.headers().get(IDEMPOTENCY_HEADER).unwrap().to_str().unwrap(),
            "X1/publish:xhs"
        );
        assert_eq!(
            http.headers().get("authorization").unwrap().to_str().unwrap(),
            "Bearer bridge-token"
        );

        let body = XhsBridgePublisher::note_body(&req);
        assert_eq!(body["title"], "你好");
        assert_eq!(body["content"], "你好");

        let lookup = p.build_lookup_request(&req).unwrap();
        assert_eq!(
            lookup.url().as_str(),
            "http://127.0.0.1:8931/v1/notes?idempotency_key=X1%2Fpublish%3Axhs"
        );
    }

    #[test]
    fn reply_parsing() {
        assert_eq!(
            parse_publish_reply(r#"{"success":true,"note_id":"123"}"#).unwrap(),
            "xhs:123"
        );
        let login = parse_publish_reply(r#"{"success":false,"login_required":true}"#).unwrap_err();
        assert!(login.is_transient());
        let rejected =
            parse_publish_reply(r#"{"success":false,"error":"违规内容"}"#).unwrap_err();
        assert_eq!(rejected, StageError::terminal("违规内容"));
        assert!(parse_publish_reply(r#"{"success":true}"#).is_err());
    }

    #[test]
    fn items_without_photos_are_skipped_when_required() {
        let text_only = item(vec![]);
        assert!(publisher(true).skip_reason(&text_only).is_some());
        assert!(publisher(false).skip_reason(&text_only).is_none());

        let with_photo = item(vec![MediaRef {
            media_key: "3_1".into(),
            kind: "photo".into(),
            url: Some("https://pbs/1.jpg".into()),
            preview_url: None,
        }]);
        assert!(publisher(true).skip_reason(&with_photo).is_none());
    }
}
