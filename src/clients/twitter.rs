//! X (Twitter) API v2 user timeline source.
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt};
use reqwest::{Client, Url};
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use tracing::{debug, info};

use super::{build_http_client, classify_status, classify_transport, SourceClient};
use crate::config;
use crate::failure::StageError;
use crate::model::{Item, MediaRef};

const TWITTER_API_BASE: &str = "https://api.twitter.com/";
/// Pages followed per poll when catching up from a cursor.
const MAX_PAGES: usize = 5;

#[derive(Clone)]
pub struct TwitterSource {
    http: Client,
    base_url: Url,
    bearer_token: String,
    max_results: u32,
}

impl fmt::Debug for TwitterSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TwitterSource")
            .field("base_url", &self.base_url)
            .field("max_results", &self.max_results)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Deserialize)]
pub struct TimelineResponse {
    #[serde(default)]
    pub data: Vec<Tweet>,
    #[serde(default)]
    pub includes: Option<Includes>,
    #[serde(default)]
    pub meta: Option<Meta>,
}

#[derive(Debug, Deserialize)]
pub struct Tweet {
    pub id: String,
    pub text: String,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub referenced_tweets: Vec<ReferencedTweet>,
    #[serde(default)]
    pub attachments: Option<Attachments>,
}

#[derive(Debug, Deserialize)]
pub struct ReferencedTweet {
    #[serde(rename = "type")]
    pub kind: String,
    pub id: String,
}

#[derive(Debug, Deserialize)]
pub struct Attachments {
    #[serde(default)]
    pub media_keys: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct Includes {
    #[serde(default)]
    pub media: Vec<Media>,
}

#[derive(Debug, Deserialize)]
pub struct Media {
    pub media_key: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub preview_image_url: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct Meta {
    #[serde(default)]
    pub next_token: Option<String>,
}

impl TwitterSource {
    pub fn from_config(cfg: &config::Source, timeout: Duration) -> Result<Self> {
        let base = cfg.api_base.as_deref().unwrap_or(TWITTER_API_BASE);
        let base_url = Url::parse(base).context("invalid source.api_base")?;
        Ok(Self {
            http: build_http_client(timeout)?,
            base_url,
            bearer_token: cfg.bearer_token.clone(),
            max_results: cfg.max_results,
        })
    }

    pub fn build_request(
        &self,
        user_id: &str,
        since_id: Option<&str>,
        pagination_token: Option<&str>,
    ) -> Result<reqwest::Request> {
        let mut endpoint = self
            .base_url
            .join(&format!("2/users/{}/tweets", user_id))
            .context("invalid source base URL")?;
        {
            let mut query = endpoint.query_pairs_mut();
            query
                .append_pair("max_results", &self.max_results.to_string())
                .append_pair("tweet.fields", "created_at,referenced_tweets,attachments")
                .append_pair("expansions", "attachments.media_keys")
                .append_pair("media.fields", "url,preview_image_url,type");
            if let Some(since) = since_id {
                query.append_pair("since_id", since);
            }
            if let Some(token) = pagination_token {
                query.append_pair("pagination_token", token);
            }
        }
        self.http
            .get(endpoint)
            .bearer_auth(&self.bearer_token)
            .build()
            .context("failed to build timeline request")
    }

    async fn fetch_page(
        &self,
        user_id: &str,
        since_id: Option<&str>,
        pagination_token: Option<&str>,
    ) -> Result<TimelineResponse, StageError> {
        let request = self
            .build_request(user_id, since_id, pagination_token)
            .map_err(|e| StageError::terminal(format!("{:#}", e)))?;
        debug!(url = %request.url(), "requesting timeline page");
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
        serde_json::from_str(&body)
            .map_err(|e| StageError::terminal(format!("malformed timeline response: {}", e)))
    }

    /// All original posts newer than `since_id`, oldest first. Without a
    /// cursor only the latest page is read so a new feed does not backfill
    /// its whole history.
    pub async fn fetch_new(
        &self,
        user_id: &str,
        since_id: Option<&str>,
    ) -> Result<Vec<Item>, StageError> {
        let mut items = Vec::new();
        let mut token: Option<String> = None;
        for _ in 0..MAX_PAGES {
            let page = self.fetch_page(user_id, since_id, token.as_deref()).await?;
            items.extend(page_items(user_id, &page));
            token = page.meta.and_then(|m| m.next_token);
            if token.is_none() || since_id.is_none() {
                break;
            }
        }
        items.sort_by(|a, b| compare_ids(&a.id, &b.id));
        items.dedup_by(|a, b| a.id == b.id);
        info!(user_id, count = items.len(), "fetched new posts");
        Ok(items)
    }
}

impl SourceClient for TwitterSource {
    fn list_new_items<'a>(
        &'a self,
        feed: &'a str,
        since: Option<&'a str>,
    ) -> BoxStream<'a, Result<Item, StageError>> {
        stream::once(self.fetch_new(feed, since))
            .flat_map(|res| {
                let batch: Vec<Result<Item, StageError>> = match res {
                    Ok(items) => items.into_iter().map(Ok).collect(),
                    Err(err) => vec![Err(err)],
                };
                stream::iter(batch)
            })
            .boxed()
    }
}

/// Converts one timeline page to items, dropping retweets.
pub fn page_items(user_id: &str, page: &TimelineResponse) -> Vec<Item> {
    let media_lookup: HashMap<&str, &Media> = page
        .includes
        .iter()
        .flat_map(|inc| inc.media.iter())
        .map(|m| (m.media_key.as_str(), m))
        .collect();
    let now = Utc::now();

    page.data
        .iter()
        .filter(|t| !t.referenced_tweets.iter().any(|r| r.kind == "retweeted"))
        .map(|t| {
            let media = t
                .attachments
                .iter()
                .flat_map(|a| a.media_keys.iter())
                .filter_map(|key| media_lookup.get(key.as_str()))
                .map(|m| MediaRef {
                    media_key: m.media_key.clone(),
                    kind: m.kind.clone(),
                    url: m.url.clone(),
                    preview_url: m.preview_image_url.clone(),
                })
                .collect();
            Item {
                id: t.id.clone(),
                feed: user_id.to_string(),
                author_id: user_id.to_string(),
                content: t.text.clone(),
                media,
                source_created_at: t.created_at.unwrap_or(now),
                first_seen_at: now,
            }
        })
        .collect()
}

/// Snowflake ids order numerically; compare by length first so no parse is needed.
fn compare_ids(a: &str, b: &str) -> std::cmp::Ordering {
    a.len().cmp(&b.len()).then_with(|| a.cmp(b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn source() -> TwitterSource {
        TwitterSource::from_config(
            &config::Source {
                bearer_token: "tok".into(),
                user_ids: vec!["42".into()],
                max_results: 10,
                api_base: Some("http://localhost:9/".into()),
            },
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[test]
    fn request_carries_cursor_and_fields() {
        let req = source().build_request("42", Some("1000"), Some("next")).unwrap();
        let url = req.url().as_str();
        assert!(url.starts_with("http://localhost:9/2/users/42/tweets?"));
        assert!(url.contains("since_id=1000"));
        assert!(url.contains("pagination_token=next"));
        assert!(url.contains("expansions=attachments.media_keys"));
        assert_eq!(
            req.headers().get("authorization").unwrap().to_str().unwrap(),
            "Bearer tok"
        );
    }

    #[test]
    fn first_poll_has_no_since_id() {
        let req = source().build_request("42", None, None).unwrap();
        assert!(!req.url().as_str().contains("since_id"));
    }

    #[test]
    fn page_drops_retweets_and_resolves_media() {
        let page: TimelineResponse = serde_json::from_value(json!({
            "data": [
                {
                    "id": "11",
                    "text": "hello",
                    "created_at": "2024-05-01T10:00:00Z",
                    "attachments": { "media_keys": ["3_1", "missing"] }
                },
                {
                    "id": "12",
                    "text": "RT @x: hi",
                    "referenced_tweets": [{ "type": "retweeted", "id": "5" }]
                },
                {
                    "id": "13",
                    "text": "quoting",
                    "referenced_tweets": [{ "type": "quoted", "id": "6" }]
                }
            ],
            "includes": {
                "media": [
                    { "media_key": "3_1", "type": "photo", "url": "https://pbs/1.jpg" }
                ]
            },
            "meta": { "result_count": 3 }
        }))
        .unwrap();

        let items = page_items("42", &page);
        let ids: Vec<&str> = items.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["11", "13"]);
        assert_eq!(items[0].media.len(), 1);
        assert_eq!(items[0].photo_urls(), vec!["https://pbs/1.jpg"]);
        assert_eq!(items[0].feed, "42");
    }

    #[test]
    fn empty_timeline_parses() {
        let page: TimelineResponse =
            serde_json::from_value(json!({ "meta": { "result_count": 0 } })).unwrap();
        assert!(page_items("42", &page).is_empty());
    }

    #[test]
    fn ids_order_numerically() {
        let mut ids = vec!["100", "99", "1000", "101"];
        ids.sort_by(|a, b| compare_ids(a, b));
        assert_eq!(ids, vec!["99", "100", "101", "1000"]);
    }
}
