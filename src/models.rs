use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle status of a lead.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum LeadStatus {
    New,
    Contacted,
    Qualified,
    Disqualified,
}

impl LeadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "New",
            Self::Contacted => "Contacted",
            Self::Qualified => "Qualified",
            Self::Disqualified => "Disqualified",
        }
    }

    /// Case-insensitive parse. Returns `None` for unknown values.
    pub fn normalize(s: &str) -> Option<Self> {
        let s = s.trim();
        [Self::New, Self::Contacted, Self::Qualified, Self::Disqualified]
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s))
    }
}

impl std::fmt::Display for LeadStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LeadStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::normalize(s).ok_or_else(|| format!("Invalid lead status: {}", s))
    }
}

/// Lead lifecycle occurrences that produce an outbound webhook notification.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum EventType {
    LeadCreated,
    LeadScored,
    StatusChanged,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LeadCreated => "LeadCreated",
            Self::LeadScored => "LeadScored",
            Self::StatusChanged => "StatusChanged",
        }
    }

    pub fn normalize(s: &str) -> Option<Self> {
        let s = s.trim();
        [Self::LeadCreated, Self::LeadScored, Self::StatusChanged]
            .into_iter()
            .find(|ty| ty.as_str().eq_ignore_ascii_case(s))
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::normalize(s).ok_or_else(|| format!("Invalid event type: {}", s))
    }
}

/// Dispatch status of an automation event.
///
/// `Sent` and `Failed` are terminal for the dispatcher; a `Failed` event can
/// only re-enter the pool through the manual retry endpoint.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum EventStatus {
    Pending,
    Sent,
    Failed,
}

impl EventStatus {
    /// Legacy rows written by an earlier version carry this status value.
    pub const LEGACY_QUEUED: &'static str = "queued";

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::Sent => "Sent",
            Self::Failed => "Failed",
        }
    }

    /// Case-insensitive parse; the legacy alias "queued" maps to `Pending`.
    pub fn normalize(s: &str) -> Option<Self> {
        let s = s.trim();
        if s.eq_ignore_ascii_case(Self::LEGACY_QUEUED) {
            return Some(Self::Pending);
        }
        [Self::Pending, Self::Sent, Self::Failed]
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s))
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Sent | Self::Failed)
    }
}

impl std::fmt::Display for EventStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::normalize(s).ok_or_else(|| format!("Invalid event status: {}", s))
    }
}

/// Access role attached to a user record.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Role {
    Admin,
    Agent,
    ReadOnly,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Admin => "Admin",
            Self::Agent => "Agent",
            Self::ReadOnly => "ReadOnly",
        }
    }

    /// Case-insensitive parse; accepts the "read-only"/"read_only" spellings.
    pub fn normalize(s: &str) -> Option<Self> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("read-only") || s.eq_ignore_ascii_case("read_only") {
            return Some(Self::ReadOnly);
        }
        [Self::Admin, Self::Agent, Self::ReadOnly]
            .into_iter()
            .find(|role| role.as_str().eq_ignore_ascii_case(s))
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::normalize(s).ok_or_else(|| format!("Invalid role: {}", s))
    }
}

/// One rule that contributed to a lead's score.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScoreReason {
    pub rule: String,
    pub delta: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lead {
    pub id: Uuid,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub phone: Option<String>,
    pub company: Option<String>,
    pub source: String,
    pub status: LeadStatus,
    pub score: i32,
    pub score_reasons: Vec<ScoreReason>,
    pub message: Option<String>,
    pub tags: Vec<String>,
    pub metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Append-only audit row recorded against a lead.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeadActivity {
    pub id: Uuid,
    pub lead_id: Uuid,
    #[serde(rename = "type")]
    pub activity_type: String,
    pub notes: Option<String>,
    pub data: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

/// Well-known lead activity type strings.
pub mod activity_types {
    pub const STATUS_CHANGED: &str = "StatusChanged";
    pub const SCORED: &str = "Scored";
    pub const NOTE_ADDED: &str = "NoteAdded";
    pub const WEBHOOK_SKIPPED: &str = "WebhookSkipped";
    pub const WEBHOOK_RETRY_QUEUED: &str = "WebhookRetryQueued";
}

/// One attempt(s)-tracked outbound webhook notification for a lead lifecycle
/// occurrence. Never deleted; the dispatcher and the manual retry action are
/// the only writers after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutomationEvent {
    pub id: Uuid,
    pub lead_id: Uuid,
    pub event_type: EventType,
    pub payload: Option<String>,
    pub target_url: Option<String>,
    pub status: EventStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub scheduled_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: Uuid,
    pub email: String,
    pub name: String,
    pub role: Role,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookSettings {
    pub webhook_target_url: Option<String>,
    pub has_webhook_secret: bool,
}

/// Paged API response envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page<T> {
    pub items: Vec<T>,
    pub page: u32,
    pub page_size: u32,
    pub total_items: u64,
    pub total_pages: u32,
}

impl<T> Page<T> {
    pub fn new(items: Vec<T>, page: u32, page_size: u32, total_items: u64) -> Self {
        let total_pages = if total_items == 0 {
            1
        } else {
            total_items.div_ceil(page_size as u64) as u32
        };
        Self {
            items,
            page,
            page_size,
            total_items,
            total_pages,
        }
    }
}
