//! Row shapes written to the analytics store.
//!
//! ## Terminology
//!
//! | Term | Definition |
//! |------|------------|
//! | **Visitor** | A browser profile, identified by a durable pseudonymous id |
//! | **Session** | A burst of activity that ends after 30 minutes of inactivity |
//! | **Page view** | One load of one page; immutable once written |
//! | **Engagement** | The single mutable row tracking how a page view went |
//! | **Event** | A discrete interaction (share, subscribe, outbound link) |
//! | **Bounce** | A page view with both low scroll depth and little time spent |

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================
// Identity
// ============================================

/// Stored form of the session identity under the volatile `_sid` key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: String,
    /// Epoch milliseconds of the last keep-alive read
    #[serde(rename = "lastActive")]
    pub last_active: i64,
}

/// Visitor and session ids resolved once per page load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub visitor_id: String,
    pub session_id: String,
}

// ============================================
// Store tables
// ============================================

/// Remote resources the tracker writes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    /// Insert-only
    PageViews,
    /// Insert returning the row, then patch by id
    PageEngagement,
    /// Insert-only
    AnalyticsEvents,
}

impl Table {
    pub fn as_str(&self) -> &'static str {
        match self {
            Table::PageViews => "page_views",
            Table::PageEngagement => "page_engagement",
            Table::AnalyticsEvents => "analytics_events",
        }
    }
}

impl std::fmt::Display for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================
// Rows
// ============================================

/// One page load. Written once, never revised.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageView {
    pub page_path: String,
    pub page_title: String,
    pub referrer: Option<String>,
    pub visitor_id: String,
    pub session_id: String,
    pub user_agent: String,
    pub screen_width: u32,
    pub screen_height: u32,
}

/// Initial engagement insert. The store assigns the id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngagementRow {
    pub page_path: String,
    pub visitor_id: String,
    pub session_id: String,
    pub time_on_page: u64,
    pub max_scroll_depth: u8,
    pub read_complete: bool,
    pub bounced: bool,
}

impl EngagementRow {
    /// Row as created at page load, before any measurement.
    pub fn opening(page_path: &str, identity: &Identity) -> Self {
        Self {
            page_path: page_path.to_string(),
            visitor_id: identity.visitor_id.clone(),
            session_id: identity.session_id.clone(),
            time_on_page: 0,
            max_scroll_depth: 0,
            read_complete: false,
            bounced: true,
        }
    }
}

/// Derived engagement values computed at one instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngagementMetrics {
    pub time_on_page: u64,
    pub max_scroll_depth: u8,
    pub read_complete: bool,
    pub bounced: bool,
}

/// Partial update applied to an engagement row by id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngagementUpdate {
    #[serde(flatten)]
    pub metrics: EngagementMetrics,
    pub updated_at: DateTime<Utc>,
}

/// Row returned by the store for an insert with representation.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CreatedRow {
    #[serde(deserialize_with = "id_as_string")]
    pub id: String,
}

/// Store ids may be UUIDs or integers; both address the row the same way.
fn id_as_string<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "unsupported id value: {other}"
        ))),
    }
}

// ============================================
// Events
// ============================================

/// Closed set of discrete interaction kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Share,
    Subscribe,
    Click,
    ExternalLink,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Share => "share",
            EventKind::Subscribe => "subscribe",
            EventKind::Click => "click",
            EventKind::ExternalLink => "external_link",
        }
    }
}

impl std::str::FromStr for EventKind {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> crate::error::Result<Self> {
        match s {
            "share" => Ok(EventKind::Share),
            "subscribe" => Ok(EventKind::Subscribe),
            "click" => Ok(EventKind::Click),
            "external_link" => Ok(EventKind::ExternalLink),
            other => Err(crate::error::Error::Script(format!(
                "unknown event kind: {other}"
            ))),
        }
    }
}

/// A discrete interaction, written once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyticsEvent {
    pub event_type: EventKind,
    pub page_path: String,
    pub visitor_id: String,
    pub session_id: String,
    pub event_data: serde_json::Value,
}
