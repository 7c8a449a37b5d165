//! OpenAI-compatible chat-completions translator (English to Chinese).
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::Deserialize;
use serde_json::{json, Value};
use std::fmt;
use std::time::Duration;
use tracing::debug;

use super::{build_http_client, classify_status, classify_transport, TranslationClient};
use crate::config;
use crate::failure::StageError;

const OPENAI_API_BASE: &str = "https://api.openai.com/v1/";

pub const SYSTEM_PROMPT: &str = "你是一个专业的翻译专家，专门将英文推文翻译成自然流畅的中文。

翻译要求：
1. 保持原文的语气和风格
2. 对于技术术语，保留英文并在括号中给出中文解释
3. 对于网络流行语和 meme，给出中文等效表达
4. 保留原文中的 @用户名 和 #话题标签
5. URL 链接保持原样
6. 表情符号保留

请直接输出翻译结果，不要添加任何解释。";

#[derive(Clone)]
pub struct OpenAiTranslator {
    http: Client,
    base_url: Url,
    api_key: String,
    model: String,
    temperature: f32,
    max_tokens: u32,
}

impl fmt::Debug for OpenAiTranslator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenAiTranslator")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Deserialize)]
pub struct ChatResponse {
    #[serde(default)]
    pub choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
pub struct Choice {
    pub message: ChatMessage,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ChatMessage {
    #[serde(default)]
    pub content: Option<String>,
}

impl OpenAiTranslator {
    pub fn from_config(cfg: &config::Translator, timeout: Duration) -> Result<Self> {
        let base = cfg.base_url.as_deref().unwrap_or(OPENAI_API_BASE);
        // Url::join drops the last path segment unless the base ends in '/'.
        let base = if base.ends_with('/') {
            base.to_string()
        } else {
            format!("{}/", base)
        };
        Ok(Self {
            http: build_http_client(timeout)?,
            base_url: Url::parse(&base).context("invalid translator.base_url")?,
            api_key: cfg.api_key.clone(),
            model: cfg.model.clone(),
            temperature: cfg.temperature,
            max_tokens: cfg.max_tokens,
        })
    }

    pub fn build_body(&self, text: &str) -> Value {
        json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": SYSTEM_PROMPT },
                { "role": "user", "content": text },
            ],
            "temperature": self.temperature,
            "max_tokens": self.max_tokens,
        })
    }

    pub fn build_request(&self, text: &str) -> Result<reqwest::Request> {
        let endpoint = self
            .base_url
            .join("chat/completions")
            .context("invalid translator base URL")?;
        self.http
            .post(endpoint)
            .bearer_auth(&self.api_key)
            .json(&self.build_body(text))
            .build()
            .context("failed to build translation request")
    }
}

/// Extracts the translation, rejecting filtered completions.
pub fn parse_completion(body: &str) -> Result<String, StageError> {
    let payload: ChatResponse = serde_json::from_str(body)
        .map_err(|e| StageError::terminal(format!("malformed completion: {}", e)))?;
    let Some(choice) = payload.choices.into_iter().next() else {
        return Err(StageError::terminal("completion has no choices"));
    };
    if choice.finish_reason.as_deref() == Some("content_filter") {
        return Err(StageError::terminal("rejected by content policy"));
    }
    Ok(choice.message.content.unwrap_or_default().trim().to_string())
}

#[async_trait]
impl TranslationClient for OpenAiTranslator {
    async fn translate(&self, text: &str) -> Result<String, StageError> {
        if text.trim().is_empty() {
            return Ok(String::new());
        }
        let request = self
            .build_request(text)
            .map_err(|e| StageError::terminal(format!("{:#}", e)))?;
        debug!(model = %self.model, chars = text.chars().count(), "requesting translation");
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
        parse_completion(&body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn translator(base_url: Option<&str>) -> OpenAiTranslator {
        OpenAiTranslator::from_config(
            &config::Translator {
                api_key: "sk-test".into(),
                model: "gpt-4o".into(),
                base_url: base_url.map(str::to_string),
                temperature: 0.3,
                max_tokens: 2000,
            },
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[test]
    fn request_targets_chat_completions() {
        let req = translator(Some("http://localhost:8080/v1")).build_request("hi").unwrap();
        assert_eq!(req.url().as_str(), "http://localhost:8080/v1/chat/completions");
        assert_eq!(
            req.headers().get("authorization").unwrap().to_str().unwrap(),
            "Bearer sk-test"
        );
    }

    #[test]
    fn body_includes_prompt_and_limits() {
        let body = translator(None).build_body("Hello world");
        assert_eq!(body["model"], "gpt-4o");
        assert_eq!(body["messages"][0]["role"], "system");
        assert!(body["messages"][0]["content"]
            .as_str()
            .unwrap()
            .contains("#话题标签"));
        assert_eq!(body["messages"][1]["content"], "Hello world");
        assert_eq!(body["max_tokens"], 2000);
    }

    #[test]
    fn parses_translation() {
        let body = r#"{"choices":[{"message":{"content":" 你好 \n"},"finish_reason":"stop"}]}"#;
        assert_eq!(parse_completion(body).unwrap(), "你好");
    }

    #[test]
    fn content_filter_is_terminal() {
        let body = r#"{"choices":[{"message":{"content":null},"finish_reason":"content_filter"}]}"#;
        let err = parse_completion(body).unwrap_err();
        assert!(!err.is_transient());
        assert!(parse_completion(r#"{"choices":[]}"#).is_err());
        assert!(parse_completion("<html>").is_err());
    }

    #[tokio::test]
    async fn empty_text_skips_the_model() {
        // Base URL is unroutable; reaching the network would fail the test.
        let t = translator(Some("http://127.0.0.1:9/v1/"));
        assert_eq!(t.translate("   ").await.unwrap(), "");
    }
}
