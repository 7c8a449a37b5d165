//! WeChat Official Account publisher. Articles are created as drafts; the
//! account owner reviews and sends them manually.
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::Deserialize;
use serde_json::{json, Value};
use std::fmt;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{
    build_http_client, classify_status, classify_transport, PublishClient, PublishRequest,
};
use crate::config;
use crate::failure::StageError;
use crate::model::Destination;

const WECHAT_API_BASE: &str = "https://api.weixin.qq.com/";
/// Tokens are refreshed this long before WeChat expires them.
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(300);

/// Error codes meaning the access token is invalid or expired.
const TOKEN_ERRCODES: [i64; 3] = [40001, 40014, 42001];
/// System busy / API rate limit reached.
const BUSY_ERRCODES: [i64; 2] = [-1, 45009];

struct CachedToken {
    value: String,
    expires_at: Instant,
}

pub struct WechatPublisher {
    http: Client,
    base_url: Url,
    app_id: String,
    app_secret: String,
    author: Option<String>,
    thumb_media_id: Option<String>,
    token: Mutex<Option<CachedToken>>,
}

impl fmt::Debug for WechatPublisher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WechatPublisher")
            .field("base_url", &self.base_url)
            .field("app_id", &self.app_id)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Deserialize)]
struct WechatReply {
    #[serde(default)]
    errcode: i64,
    #[serde(default)]
    errmsg: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
    #[serde(default)]
    media_id: Option<String>,
}

impl WechatPublisher {
    pub fn from_config(cfg: &config::Wechat, timeout: Duration) -> Result<Self> {
        let base = cfg.api_base.as_deref().unwrap_or(WECHAT_API_BASE);
        Ok(Self {
            http: build_http_client(timeout)?,
            base_url: Url::parse(base).context("invalid destinations.wechat.api_base")?,
            app_id: cfg.app_id.clone(),
            app_secret: cfg.app_secret.clone(),
            author: cfg.author.clone(),
            thumb_media_id: cfg.thumb_media_id.clone(),
            token: Mutex::new(None),
        })
    }

    pub fn token_url(&self) -> Result<Url> {
        let mut url = self
            .base_url
            .join("cgi-bin/token")
            .context("invalid WeChat base URL")?;
        url.query_pairs_mut()
            .append_pair("grant_type", "client_credential")
            .append_pair("appid", &self.app_id)
            .append_pair("secret", &self.app_secret);
        Ok(url)
    }

    pub fn build_draft_request(
        &self,
        access_token: &str,
        request: &PublishRequest<'_>,
    ) -> Result<reqwest::Request> {
        let mut url = self
            .base_url
            .join("cgi-bin/draft/add")
            .context("invalid WeChat base URL")?;
        url.query_pairs_mut().append_pair("access_token", access_token);
        self.http
            .post(url)
            .json(&self.draft_body(request))
            .build()
            .context("failed to build draft request")
    }

    pub fn draft_body(&self, request: &PublishRequest<'_>) -> Value {
        let mut article = json!({
            "title": request.title(Destination::Wechat),
            "content": format_article(
                request.translated_text,
                &request.item.content,
                self.author.as_deref(),
            ),
            "content_source_url": "",
            "need_open_comment": 0,
            "only_fans_can_comment": 0,
        });
        if let Some(thumb) = &self.thumb_media_id {
            article["thumb_media_id"] = json!(thumb);
        }
        if let Some(author) = &self.author {
            article["author"] = json!(author);
        }
        json!({ "articles": [article] })
    }

    async fn access_token(&self) -> Result<String, StageError> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            if Instant::now() < token.expires_at {
                return Ok(token.value.clone());
            }
        }
        let url = self
            .token_url()
            .map_err(|e| StageError::terminal(format!("{:#}", e)))?;
        let request = self
            .http
            .get(url)
            .build()
            .map_err(|e| StageError::terminal(format!("failed to build token request: {}", e)))?;
        let reply = self.call(request).await?;
        let value = reply
            .access_token
            .ok_or_else(|| StageError::transient("token response without access_token"))?;
        let ttl = Duration::from_secs(reply.expires_in.unwrap_or(7200));
        *cached = Some(CachedToken {
            value: value.clone(),
            expires_at: Instant::now() + ttl.saturating_sub(TOKEN_REFRESH_MARGIN),
        });
        debug!("refreshed WeChat access token");
        Ok(value)
    }

    async fn invalidate_token(&self) {
        *self.token.lock().await = None;
    }

    async fn call(&self, request: reqwest::Request) -> Result<WechatReply, StageError> {
        let res = self
            .http
            .execute(request)
            .await
            .map_err(|e| classify_transport(&e))?;
        let status = res.status();
        let body = res.text().await.map_err(|e| classify_transport(&e))?;
        if !status.is_success() {
            return Err(classify_status(status, &body));
        }
        let reply: WechatReply = serde_json::from_str(&body)
            .map_err(|e| StageError::terminal(format!("malformed WeChat response: {}", e)))?;
        check_errcode(reply.errcode, reply.errmsg.as_deref())?;
        Ok(reply)
    }
}

/// WeChat reports failures in the body with HTTP 200.
fn check_errcode(errcode: i64, errmsg: Option<&str>) -> Result<(), StageError> {
    if errcode == 0 {
        return Ok(());
    }
    let msg = format!("wechat errcode {}: {}", errcode, errmsg.unwrap_or_default());
    if TOKEN_ERRCODES.contains(&errcode) || BUSY_ERRCODES.contains(&errcode) {
        Err(StageError::Transient(msg))
    } else {
        Err(StageError::Terminal(msg))
    }
}

fn is_token_error(err: &StageError) -> bool {
    TOKEN_ERRCODES
        .iter()
        .any(|code| err.reason().starts_with(&format!("wechat errcode {}:", code)))
}

/// Article HTML: translation, original text and an attribution footer.
pub fn format_article(translated: &str, original: &str, author: Option<&str>) -> String {
    let author_line = author
        .map(|a| format!("<p><strong>原作者：</strong>{}</p>", escape_html(a)))
        .unwrap_or_default();
    format!(
        "<section>\n{author_line}\n<h2>内容</h2>\n<p>{translated}</p>\n<hr/>\n\
         <h3>原文 (Original)</h3>\n<p style=\"color: #666; font-style: italic;\">{original}</p>\n<hr/>\n\
         <p style=\"font-size: 12px; color: #999;\">本文由 X (Twitter) 内容自动翻译同步。</p>\n</section>",
        author_line = author_line,
        translated = paragraph(translated),
        original = paragraph(original),
    )
}

fn paragraph(text: &str) -> String {
    escape_html(text.trim()).replace('\n', "<br/>")
}

fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}

#[async_trait]
impl PublishClient for WechatPublisher {
    fn destination(&self) -> Destination {
        Destination::Wechat
    }

    async fn publish(&self, request: &PublishRequest<'_>) -> Result<String, StageError> {
        let token = self.access_token().await?;
        let http_request = self
            .build_draft_request(&token, request)
            .map_err(|e| StageError::terminal(format!("{:#}", e)))?;
        let reply = match self.call(http_request).await {
            Ok(reply) => reply,
            Err(err) => {
                if is_token_error(&err) {
                    warn!(key = %request.idempotency_key, "WeChat token rejected; will refresh");
                    self.invalidate_token().await;
                }
                return Err(err);
            }
        };
        let media_id = reply
            .media_id
            .ok_or_else(|| StageError::terminal("draft response without media_id"))?;
        info!(key = %request.idempotency_key, media_id = %media_id, "created WeChat draft");
        Ok(format!("wechat:{}", media_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{IdempotencyKey, Item, StageKey};
    use chrono::Utc;

    fn publisher() -> WechatPublisher {
        WechatPublisher::from_config(
            &config::Wechat {
                app_id: "wx123".into(),
                app_secret: "secret".into(),
                author: Some("Bot".into()),
                thumb_media_id: Some("thumb-1".into()),
                api_base: Some("http://localhost:9/".into()),
            },
            Duration::from_secs(5),
        )
        .unwrap()
    }

    fn item() -> Item {
        Item {
            id: "X1".into(),
            feed: "42".into(),
            author_id: "42".into(),
            content: "Hello <world>".into(),
            media: vec![],
            source_created_at: Utc::now(),
            first_seen_at: Utc::now(),
        }
    }

    #[test]
    fn token_url_has_credentials() {
        let url = publisher().token_url().unwrap();
        assert_eq!(
            url.as_str(),
            "http://localhost:9/cgi-bin/token?grant_type=client_credential&appid=wx123&secret=secret"
        );
    }

    #[test]
    fn draft_request_shape() {
        let p = publisher();
        let item = item();
        let key = IdempotencyKey::new("X1", StageKey::Publish(Destination::Wechat));
        let req = PublishRequest {
            item: &item,
            translated_text: "你好\n世界",
            idempotency_key: &key,
        };
        let http = p.build_draft_request("tok", &req).unwrap();
        assert_eq!(
            http.url().as_str(),
            "http://localhost:9/cgi-bin/draft/add?access_token=tok"
        );

        let body = p.draft_body(&req);
        let article = &body["articles"][0];
        assert_eq!(article["title"], "你好");
        assert_eq!(article["thumb_media_id"], "thumb-1");
        assert_eq!(article["author"], "Bot");
        let content = article["content"].as_str().unwrap();
        assert!(content.contains("你好<br/>世界"));
        assert!(content.contains("Hello &lt;world&gt;"));
        assert!(content.contains("<strong>原作者：</strong>Bot"));
    }

    #[test]
    fn errcodes_are_classified() {
        assert!(check_errcode(0, None).is_ok());
        let expired = check_errcode(42001, Some("access_token expired")).unwrap_err();
        assert!(expired.is_transient());
        assert!(is_token_error(&expired));
        let busy = check_errcode(45009, Some("api freq out of limit")).unwrap_err();
        assert!(busy.is_transient());
        assert!(!is_token_error(&busy));
        assert!(!check_errcode(45003, Some("title size out of limit"))
            .unwrap_err()
            .is_transient());
    }
}
