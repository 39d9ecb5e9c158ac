//! Delivery of rows to the analytics store.
//!
//! Three operations, none of which can fail the caller:
//! - `create`: insert a row, optionally reading back the created row
//! - `update`: patch a row addressed by id
//! - `flush`: hand a patch to the guaranteed-delivery path ([`Beacon`]) for
//!   delivery after the page is gone
//!
//! Every failure is logged and folded into a [`Delivery`] value so callers
//! can branch on degradation without any error reaching the host page.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};

use crate::config::StoreConfig;
use crate::env::{lock, Beacon};
use crate::error::{Error, Result};
use crate::types::{CreatedRow, Table};

const PREFER_REPRESENTATION: &str = "return=representation";
const PREFER_MINIMAL: &str = "return=minimal";

/// Outcome of one transport operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// Accepted by the store (or the beacon); carries the created row when
    /// one was requested and returned
    Delivered(Option<CreatedRow>),
    /// Accepted, but the expected row could not be read back
    Degraded(String),
    /// Network error, non-success status, or beacon refused
    Failed(String),
}

impl Delivery {
    pub fn is_delivered(&self) -> bool {
        matches!(self, Delivery::Delivered(_))
    }

    /// Server-assigned id of the created row, if any.
    pub fn created_id(&self) -> Option<&str> {
        match self {
            Delivery::Delivered(Some(row)) => Some(row.id.as_str()),
            _ => None,
        }
    }
}

/// Running tally of delivery outcomes.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryStats {
    pub delivered: usize,
    pub degraded: usize,
    pub failed: usize,
}

impl DeliveryStats {
    pub fn record(&mut self, delivery: &Delivery) {
        match delivery {
            Delivery::Delivered(_) => self.delivered += 1,
            Delivery::Degraded(_) => self.degraded += 1,
            Delivery::Failed(_) => self.failed += 1,
        }
    }

    pub fn merge(self, other: DeliveryStats) -> DeliveryStats {
        DeliveryStats {
            delivered: self.delivered + other.delivered,
            degraded: self.degraded + other.degraded,
            failed: self.failed + other.failed,
        }
    }

    pub fn total(&self) -> usize {
        self.delivered + self.degraded + self.failed
    }
}

/// Write path to the analytics store.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn create(&self, table: Table, payload: &serde_json::Value, expect_row: bool)
        -> Delivery;

    async fn update(&self, table: Table, id: &str, payload: &serde_json::Value) -> Delivery;

    /// Enqueue a patch that must survive page teardown. Never waits.
    fn flush(&self, table: Table, id: &str, payload: &serde_json::Value) -> Delivery;
}

/// What a successful (2xx) insert gave back.
#[derive(Debug)]
enum Created {
    /// Representation requested and a row came back
    Row(CreatedRow),
    /// Representation requested but the array was empty
    Empty,
    /// Representation requested but the body did not parse
    Unreadable(String),
    /// No representation requested
    Minimal,
}

/// HTTP transport for a PostgREST-style store.
pub struct RestTransport {
    http_client: reqwest::Client,
    base_url: String,
    beacon: Arc<dyn Beacon>,
}

impl RestTransport {
    /// Create a transport from store configuration.
    ///
    /// Returns an error if the configuration is incomplete or the key cannot
    /// be used as a header value.
    pub fn new(config: &StoreConfig, beacon: Arc<dyn Beacon>) -> Result<Self> {
        config.validate()?;

        let base_url = config
            .url
            .as_deref()
            .ok_or_else(|| Error::Config("store.url is required".to_string()))?
            .trim_end_matches('/')
            .to_string();
        let anon_key = config
            .anon_key
            .as_deref()
            .ok_or_else(|| Error::Config("store.anon_key is required".to_string()))?;

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            "apikey",
            HeaderValue::from_str(anon_key)
                .map_err(|e| Error::Config(format!("invalid anon_key: {}", e)))?,
        );
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", anon_key))
                .map_err(|e| Error::Config(format!("invalid anon_key: {}", e)))?,
        );

        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .default_headers(headers)
            .build()
            .map_err(|e| Error::Config(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http_client,
            base_url,
            beacon,
        })
    }

    /// `{base}/rest/v1/{table}`
    pub fn table_url(&self, table: Table) -> String {
        format!("{}/rest/v1/{}", self.base_url, table)
    }

    /// `{base}/rest/v1/{table}?id=eq.{id}`
    pub fn row_url(&self, table: Table, id: &str) -> String {
        format!("{}?id=eq.{}", self.table_url(table), urlencoding::encode(id))
    }

    async fn try_create(
        &self,
        table: Table,
        payload: &serde_json::Value,
        expect_row: bool,
    ) -> Result<Created> {
        let prefer = if expect_row {
            PREFER_REPRESENTATION
        } else {
            PREFER_MINIMAL
        };

        let response = self
            .http_client
            .post(self.table_url(table))
            .header("Prefer", prefer)
            .json(payload)
            .send()
            .await?;

        let response = check_status(response).await?;
        if !expect_row {
            return Ok(Created::Minimal);
        }

        match response.json::<Vec<CreatedRow>>().await {
            Ok(rows) => Ok(rows
                .into_iter()
                .next()
                .map_or(Created::Empty, Created::Row)),
            Err(e) => Ok(Created::Unreadable(format!("failed to parse response: {}", e))),
        }
    }

    async fn try_update(&self, table: Table, id: &str, payload: &serde_json::Value) -> Result<()> {
        let response = self
            .http_client
            .patch(self.row_url(table, id))
            .json(payload)
            .send()
            .await?;

        check_status(response).await?;
        Ok(())
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let error_text = response
        .text()
        .await
        .unwrap_or_else(|_| "unknown".to_string());
    Err(Error::Transport(format!("API error ({}): {}", status, error_text)))
}

/// Fold an insert outcome into a [`Delivery`], logging anything short of success.
fn insert_delivery(table: Table, outcome: Result<Created>) -> Delivery {
    match outcome {
        Ok(Created::Row(row)) => Delivery::Delivered(Some(row)),
        Ok(Created::Minimal) => Delivery::Delivered(None),
        Ok(Created::Empty) => {
            tracing::warn!(table = %table, "Store accepted insert but returned no row");
            Delivery::Degraded("no row returned".to_string())
        }
        // A body we could not read after a 2xx still means the row exists
        Ok(Created::Unreadable(msg)) => {
            tracing::warn!(table = %table, error = %msg, "Unreadable insert response");
            Delivery::Degraded(msg)
        }
        Err(e) => {
            tracing::warn!(table = %table, error = %e, "Analytics insert failed");
            Delivery::Failed(e.to_string())
        }
    }
}

#[async_trait]
impl Transport for RestTransport {
    async fn create(
        &self,
        table: Table,
        payload: &serde_json::Value,
        expect_row: bool,
    ) -> Delivery {
        insert_delivery(table, self.try_create(table, payload, expect_row).await)
    }

    async fn update(&self, table: Table, id: &str, payload: &serde_json::Value) -> Delivery {
        match self.try_update(table, id, payload).await {
            Ok(()) => Delivery::Delivered(None),
            Err(e) => {
                tracing::warn!(table = %table, id = %id, error = %e, "Analytics update failed");
                Delivery::Failed(e.to_string())
            }
        }
    }

    fn flush(&self, table: Table, id: &str, payload: &serde_json::Value) -> Delivery {
        let url = self.row_url(table, id);
        if self.beacon.send_beacon(&url, &payload.to_string()) {
            Delivery::Delivered(None)
        } else {
            tracing::warn!(table = %table, id = %id, "Beacon refused final flush");
            Delivery::Failed("beacon refused".to_string())
        }
    }
}

/// One call observed by [`RecordingTransport`].
#[derive(Debug, Clone, PartialEq)]
pub enum TransportCall {
    Create {
        table: Table,
        payload: serde_json::Value,
        expect_row: bool,
    },
    Update {
        table: Table,
        id: String,
        payload: serde_json::Value,
    },
    Flush {
        table: Table,
        id: String,
        payload: serde_json::Value,
    },
}

impl TransportCall {
    pub fn table(&self) -> Table {
        match self {
            TransportCall::Create { table, .. }
            | TransportCall::Update { table, .. }
            | TransportCall::Flush { table, .. } => *table,
        }
    }

    pub fn payload(&self) -> &serde_json::Value {
        match self {
            TransportCall::Create { payload, .. }
            | TransportCall::Update { payload, .. }
            | TransportCall::Flush { payload, .. } => payload,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            TransportCall::Create {
                table,
                payload,
                expect_row,
            } => serde_json::json!({
                "op": "create",
                "table": table.as_str(),
                "expect_row": expect_row,
                "payload": payload,
            }),
            TransportCall::Update { table, id, payload } => serde_json::json!({
                "op": "update",
                "table": table.as_str(),
                "id": id,
                "payload": payload,
            }),
            TransportCall::Flush { table, id, payload } => serde_json::json!({
                "op": "flush",
                "table": table.as_str(),
                "id": id,
                "payload": payload,
            }),
        }
    }
}

#[derive(Default)]
struct Recording {
    calls: Vec<TransportCall>,
    next_id: u64,
    fail_creates: bool,
    fail_updates: bool,
    omit_rows: bool,
}

/// In-process transport that records every call.
///
/// Created rows get sequential ids (`row-1`, `row-2`, ...). Used for dry
/// runs and as a test double.
#[derive(Default)]
pub struct RecordingTransport {
    inner: Mutex<Recording>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate a network failure on every insert.
    pub fn fail_creates(&self) {
        lock(&self.inner).fail_creates = true;
    }

    pub fn fail_updates(&self) {
        lock(&self.inner).fail_updates = true;
    }

    /// Accept inserts but return no representation.
    pub fn omit_rows(&self) {
        lock(&self.inner).omit_rows = true;
    }

    pub fn calls(&self) -> Vec<TransportCall> {
        lock(&self.inner).calls.clone()
    }

    pub fn creates(&self, table: Table) -> Vec<serde_json::Value> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                TransportCall::Create { table: t, payload, .. } if t == table => Some(payload),
                _ => None,
            })
            .collect()
    }

    pub fn updates(&self) -> Vec<(String, serde_json::Value)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                TransportCall::Update { id, payload, .. } => Some((id, payload)),
                _ => None,
            })
            .collect()
    }

    pub fn flushes(&self) -> Vec<(String, serde_json::Value)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                TransportCall::Flush { id, payload, .. } => Some((id, payload)),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn create(
        &self,
        table: Table,
        payload: &serde_json::Value,
        expect_row: bool,
    ) -> Delivery {
        let mut inner = lock(&self.inner);
        inner.calls.push(TransportCall::Create {
            table,
            payload: payload.clone(),
            expect_row,
        });

        if inner.fail_creates {
            return Delivery::Failed("HTTP request failed: connection refused".to_string());
        }
        if !expect_row {
            return Delivery::Delivered(None);
        }
        if inner.omit_rows {
            return Delivery::Degraded("no row returned".to_string());
        }

        inner.next_id += 1;
        Delivery::Delivered(Some(CreatedRow {
            id: format!("row-{}", inner.next_id),
        }))
    }

    async fn update(&self, table: Table, id: &str, payload: &serde_json::Value) -> Delivery {
        let mut inner = lock(&self.inner);
        inner.calls.push(TransportCall::Update {
            table,
            id: id.to_string(),
            payload: payload.clone(),
        });

        if inner.fail_updates {
            Delivery::Failed("API error (503): unavailable".to_string())
        } else {
            Delivery::Delivered(None)
        }
    }

    fn flush(&self, table: Table, id: &str, payload: &serde_json::Value) -> Delivery {
        lock(&self.inner).calls.push(TransportCall::Flush {
            table,
            id: id.to_string(),
            payload: payload.clone(),
        });
        Delivery::Delivered(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::{DeviceInfo, MemoryEnvironment, PageInfo};

    fn store_config() -> StoreConfig {
        StoreConfig {
            url: Some("https://store.example.co/".to_string()),
            anon_key: Some("anon-test".to_string()),
            ..Default::default()
        }
    }

    fn memory_env() -> Arc<MemoryEnvironment> {
        let page = PageInfo::new("https://blog.example.com/", "Home").unwrap();
        Arc::new(MemoryEnvironment::new(page, DeviceInfo::default(), 0))
    }

    #[test]
    fn test_rest_transport_requires_credentials() {
        let env = memory_env();
        assert!(RestTransport::new(&StoreConfig::default(), env.clone()).is_err());
        assert!(RestTransport::new(&store_config(), env).is_ok());
    }

    #[test]
    fn test_rest_transport_rejects_unprintable_key() {
        let config = StoreConfig {
            anon_key: Some("bad\nkey".to_string()),
            ..store_config()
        };
        assert!(matches!(
            RestTransport::new(&config, memory_env()),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_urls() {
        let transport = RestTransport::new(&store_config(), memory_env()).unwrap();
        assert_eq!(
            transport.table_url(Table::PageViews),
            "https://store.example.co/rest/v1/page_views"
        );
        assert_eq!(
            transport.row_url(Table::PageEngagement, "a b"),
            "https://store.example.co/rest/v1/page_engagement?id=eq.a%20b"
        );
    }

    #[test]
    fn test_flush_goes_through_beacon() {
        let env = memory_env();
        let transport = RestTransport::new(&store_config(), env.clone()).unwrap();
        let payload = serde_json::json!({"time_on_page": 5});

        let delivery = transport.flush(Table::PageEngagement, "42", &payload);
        assert!(delivery.is_delivered());

        let beacons = env.beacons();
        assert_eq!(beacons.len(), 1);
        assert_eq!(
            beacons[0].url,
            "https://store.example.co/rest/v1/page_engagement?id=eq.42"
        );
        assert_eq!(beacons[0].json(), payload);
    }

    #[test]
    fn test_flush_reports_refused_beacon() {
        let env = memory_env();
        env.refuse_beacons();
        let transport = RestTransport::new(&store_config(), env).unwrap();

        let delivery = transport.flush(Table::PageEngagement, "42", &serde_json::json!({}));
        assert!(matches!(delivery, Delivery::Failed(_)));
    }

    #[tokio::test]
    async fn test_create_against_unreachable_store_fails_quietly() {
        let config = StoreConfig {
            // Port 9 (discard) on localhost: connection refused, no network needed
            url: Some("http://127.0.0.1:9".to_string()),
            timeout_secs: 2,
            ..store_config()
        };
        let transport = RestTransport::new(&config, memory_env()).unwrap();

        let delivery = transport
            .create(Table::PageViews, &serde_json::json!({"page_path": "/"}), false)
            .await;
        assert!(matches!(delivery, Delivery::Failed(_)));

        let delivery = transport
            .update(Table::PageEngagement, "1", &serde_json::json!({}))
            .await;
        assert!(matches!(delivery, Delivery::Failed(_)));
    }

    #[tokio::test]
    async fn test_recording_transport_assigns_ids() {
        let transport = RecordingTransport::new();
        let payload = serde_json::json!({});

        let first = transport.create(Table::PageEngagement, &payload, true).await;
        let second = transport.create(Table::PageEngagement, &payload, true).await;
        let minimal = transport.create(Table::PageViews, &payload, false).await;

        assert_eq!(first.created_id(), Some("row-1"));
        assert_eq!(second.created_id(), Some("row-2"));
        assert_eq!(minimal, Delivery::Delivered(None));
        assert_eq!(transport.creates(Table::PageEngagement).len(), 2);
    }

    #[tokio::test]
    async fn test_recording_transport_failure_modes() {
        let transport = RecordingTransport::new();
        transport.omit_rows();
        let delivery = transport
            .create(Table::PageEngagement, &serde_json::json!({}), true)
            .await;
        assert!(matches!(delivery, Delivery::Degraded(_)));

        transport.fail_creates();
        let delivery = transport
            .create(Table::PageEngagement, &serde_json::json!({}), true)
            .await;
        assert!(matches!(delivery, Delivery::Failed(_)));
        assert_eq!(transport.calls().len(), 2);
    }

    #[test]
    fn test_insert_outcomes_map_by_kind() {
        let row = CreatedRow {
            id: "7".to_string(),
        };
        assert_eq!(
            insert_delivery(Table::PageEngagement, Ok(Created::Row(row.clone()))),
            Delivery::Delivered(Some(row))
        );
        assert_eq!(
            insert_delivery(Table::PageViews, Ok(Created::Minimal)),
            Delivery::Delivered(None)
        );
        assert!(matches!(
            insert_delivery(Table::PageEngagement, Ok(Created::Empty)),
            Delivery::Degraded(_)
        ));

        // Classification follows the outcome, not the wording of the message
        assert!(matches!(
            insert_delivery(Table::PageEngagement, Ok(Created::Unreadable("bad body".to_string()))),
            Delivery::Degraded(_)
        ));
        assert!(matches!(
            insert_delivery(
                Table::PageEngagement,
                Err(Error::Transport("failed to parse anything".to_string()))
            ),
            Delivery::Failed(_)
        ));
    }

    #[test]
    fn test_delivery_stats() {
        let mut stats = DeliveryStats::default();
        stats.record(&Delivery::Delivered(None));
        stats.record(&Delivery::Degraded("no row returned".to_string()));
        stats.record(&Delivery::Failed("timeout".to_string()));
        stats.record(&Delivery::Delivered(None));

        assert_eq!(stats.delivered, 2);
        assert_eq!(stats.total(), 4);
        assert_eq!(stats.merge(stats).failed, 2);
    }

    #[test]
    fn test_call_json() {
        let call = TransportCall::Update {
            table: Table::PageEngagement,
            id: "row-1".to_string(),
            payload: serde_json::json!({"bounced": false}),
        };
        let json = call.to_json();
        assert_eq!(json["op"], "update");
        assert_eq!(json["table"], "page_engagement");
        assert_eq!(json["payload"]["bounced"], false);
    }
}
