use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Media attached to a source post.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MediaRef {
    pub media_key: String,
    /// `photo`, `video` or `animated_gif`.
    pub kind: String,
    pub url: Option<String>,
    pub preview_url: Option<String>,
}

impl MediaRef {
    pub fn is_photo(&self) -> bool {
        self.kind == "photo"
    }
}

/// A source-platform post. Immutable once recorded.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Item {
    /// Stable external ID, unique across feeds.
    pub id: String,
    /// The monitored account this item was fetched from.
    pub feed: String,
    pub author_id: String,
    pub content: String,
    pub media: Vec<MediaRef>,
    pub source_created_at: DateTime<Utc>,
    pub first_seen_at: DateTime<Utc>,
}

impl Item {
    /// Checks the item carries something that can be republished.
    pub fn validate(&self) -> Result<(), String> {
        if self.id.trim().is_empty() {
            return Err("item id is empty".into());
        }
        if self.content.trim().is_empty() && self.media.is_empty() {
            return Err(format!("item {} has neither text nor media", self.id));
        }
        Ok(())
    }

    pub fn photo_urls(&self) -> Vec<&str> {
        self.media
            .iter()
            .filter(|m| m.is_photo())
            .filter_map(|m| m.url.as_deref())
            .collect()
    }
}

/// Record-level pipeline stage. Only ever moves forward.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Stage {
    New,
    Fetched,
    Translating,
    Translated,
    Publishing,
    Done,
    Failed,
}

impl Stage {
    pub const ALL: [Stage; 7] = [
        Stage::New,
        Stage::Fetched,
        Stage::Translating,
        Stage::Translated,
        Stage::Publishing,
        Stage::Done,
        Stage::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::New => "NEW",
            Stage::Fetched => "FETCHED",
            Stage::Translating => "TRANSLATING",
            Stage::Translated => "TRANSLATED",
            Stage::Publishing => "PUBLISHING",
            Stage::Done => "DONE",
            Stage::Failed => "FAILED",
        }
    }

    pub fn parse_stage(s: &str) -> Option<Self> {
        Stage::ALL.into_iter().find(|stage| stage.as_str() == s)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Stage::Done | Stage::Failed)
    }

    /// The single stage that follows this one on the happy path.
    pub fn successor(&self) -> Option<Stage> {
        match self {
            Stage::New => Some(Stage::Fetched),
            Stage::Fetched => Some(Stage::Translating),
            Stage::Translating => Some(Stage::Translated),
            Stage::Translated => Some(Stage::Publishing),
            Stage::Publishing => Some(Stage::Done),
            Stage::Done | Stage::Failed => None,
        }
    }

    /// Whether `next` is a legal transition from `self`: the immediate
    /// successor, or `Failed` from any non-terminal stage.
    pub fn can_advance_to(&self, next: Stage) -> bool {
        if next == Stage::Failed {
            return !self.is_terminal();
        }
        self.successor() == Some(next)
    }

    /// Whether a translated text may be present in this stage.
    pub fn carries_translation(&self) -> bool {
        matches!(self, Stage::Translated | Stage::Publishing | Stage::Done)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A target platform translated content is republished to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Destination {
    Xhs,
    Wechat,
}

impl Destination {
    pub const ALL: [Destination; 2] = [Destination::Xhs, Destination::Wechat];

    pub fn as_str(&self) -> &'static str {
        match self {
            Destination::Xhs => "xhs",
            Destination::Wechat => "wechat",
        }
    }

    pub fn parse_destination(s: &str) -> Option<Self> {
        let s = s.trim();
        Destination::ALL
            .into_iter()
            .find(|d| d.as_str().eq_ignore_ascii_case(s))
    }

    /// Maximum title length (in chars) accepted by the platform.
    pub fn title_limit(&self) -> usize {
        match self {
            Destination::Xhs => 50,
            Destination::Wechat => 60,
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Destination::Xhs => f.write_str("XHS"),
            Destination::Wechat => f.write_str("WeChat"),
        }
    }
}

/// Per-destination publish lifecycle, independent of the other destinations.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "status", content = "detail", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DestinationStatus {
    Pending,
    Publishing,
    Published(String),
    Failed(String),
    Skipped(String),
}

impl DestinationStatus {
    pub fn label(&self) -> &'static str {
        match self {
            DestinationStatus::Pending => "PENDING",
            DestinationStatus::Publishing => "PUBLISHING",
            DestinationStatus::Published(_) => "PUBLISHED",
            DestinationStatus::Failed(_) => "FAILED",
            DestinationStatus::Skipped(_) => "SKIPPED",
        }
    }

    /// Rebuilds a status from its stored columns.
    pub fn from_columns(
        label: &str,
        external_ref: Option<String>,
        reason: Option<String>,
    ) -> Option<Self> {
        match label {
            "PENDING" => Some(DestinationStatus::Pending),
            "PUBLISHING" => Some(DestinationStatus::Publishing),
            "PUBLISHED" => Some(DestinationStatus::Published(external_ref.unwrap_or_default())),
            "FAILED" => Some(DestinationStatus::Failed(reason.unwrap_or_default())),
            "SKIPPED" => Some(DestinationStatus::Skipped(reason.unwrap_or_default())),
            _ => None,
        }
    }

    pub fn external_ref(&self) -> Option<&str> {
        match self {
            DestinationStatus::Published(r) => Some(r),
            _ => None,
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            DestinationStatus::Failed(r) | DestinationStatus::Skipped(r) => Some(r),
            _ => None,
        }
    }

    /// Still waiting on a publish result.
    pub fn is_open(&self) -> bool {
        matches!(self, DestinationStatus::Pending | DestinationStatus::Publishing)
    }
}

/// Outcome of one destination's publish task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishResult {
    Published(String),
    Failed(String),
    Skipped(String),
}

impl From<PublishResult> for DestinationStatus {
    fn from(result: PublishResult) -> Self {
        match result {
            PublishResult::Published(r) => DestinationStatus::Published(r),
            PublishResult::Failed(r) => DestinationStatus::Failed(r),
            PublishResult::Skipped(r) => DestinationStatus::Skipped(r),
        }
    }
}

/// Per-item pipeline state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncRecord {
    pub item_id: String,
    pub stage: Stage,
    pub translated_text: Option<String>,
    pub error_message: Option<String>,
    pub destination_statuses: BTreeMap<Destination, DestinationStatus>,
    /// Attempts per stage key (`translate`, `publish:<destination>`).
    pub retry_count: BTreeMap<String, i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SyncRecord {
    /// Every destination has reached PUBLISHED, FAILED or SKIPPED.
    pub fn all_destinations_settled(&self) -> bool {
        !self.destination_statuses.is_empty()
            && self.destination_statuses.values().all(|s| !s.is_open())
    }

    /// Needs manual intervention: the record or one of its destinations failed.
    pub fn needs_attention(&self) -> bool {
        self.stage == Stage::Failed
            || self
                .destination_statuses
                .values()
                .any(|s| matches!(s, DestinationStatus::Failed(_)))
    }
}

/// The stage component of an idempotency key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageKey {
    Translate,
    Publish(Destination),
}

impl StageKey {
    pub fn parse_key(s: &str) -> Option<Self> {
        if s == "translate" {
            return Some(StageKey::Translate);
        }
        s.strip_prefix("publish:")
            .and_then(Destination::parse_destination)
            .map(StageKey::Publish)
    }
}

impl fmt::Display for StageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageKey::Translate => f.write_str("translate"),
            StageKey::Publish(d) => write!(f, "publish:{}", d.as_str()),
        }
    }
}

/// Deterministic identifier of one externally visible side effect.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdempotencyKey {
    pub item_id: String,
    pub stage: StageKey,
}

impl IdempotencyKey {
    pub fn new(item_id: impl Into<String>, stage: StageKey) -> Self {
        Self {
            item_id: item_id.into(),
            stage,
        }
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.item_id, self.stage)
    }
}
