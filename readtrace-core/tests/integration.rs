//! End-to-end tests for the tracker over the HTTP transport.
//!
//! A minimal in-process HTTP server stands in for the analytics store so the
//! real `RestTransport` is exercised: headers, paths, status handling, and
//! the split between ordinary requests and the guaranteed-delivery path.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use readtrace_core::config::{Config, StoreConfig};
use readtrace_core::env::{DeviceInfo, Environment, MemoryEnvironment, PageInfo};
use readtrace_core::identity::IdentityProvider;
use readtrace_core::{AnalyticsTracker, ClickPath, Delivery, Phase, Visibility};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

const START_MS: i64 = 1_700_000_000_000;

// ============================================
// Fake store
// ============================================

#[derive(Debug, Clone)]
struct RecordedRequest {
    method: String,
    target: String,
    headers: HashMap<String, String>,
    body: serde_json::Value,
}

impl RecordedRequest {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }
}

type Responder = Arc<dyn Fn(&RecordedRequest) -> (u16, String) + Send + Sync>;

struct FakeStore {
    url: String,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
}

impl FakeStore {
    /// Store that returns `[{"id": 7}]` for inserts asking for representation.
    async fn healthy() -> Self {
        Self::start(Arc::new(|req: &RecordedRequest| {
            match (req.method.as_str(), req.header("prefer")) {
                ("POST", Some("return=representation")) => (201, r#"[{"id": 7}]"#.to_string()),
                ("POST", _) => (201, String::new()),
                _ => (204, String::new()),
            }
        }))
        .await
    }

    async fn failing(status: u16) -> Self {
        Self::start(Arc::new(move |_: &RecordedRequest| {
            (status, r#"{"message":"nope"}"#.to_string())
        }))
        .await
    }

    async fn start(responder: Responder) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        let requests = Arc::new(Mutex::new(Vec::new()));

        let recorded = requests.clone();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                let recorded = recorded.clone();
                let responder = responder.clone();
                tokio::spawn(async move {
                    let Some(request) = read_request(&mut socket).await else {
                        return;
                    };
                    let (status, body) = responder(&request);
                    recorded.lock().unwrap().push(request);

                    let response = format!(
                        "HTTP/1.1 {} X\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                        status,
                        body.len(),
                        body
                    );
                    let _ = socket.write_all(response.as_bytes()).await;
                    let _ = socket.shutdown().await;
                });
            }
        });

        Self { url, requests }
    }

    fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }

    fn with_method(&self, method: &str) -> Vec<RecordedRequest> {
        self.requests()
            .into_iter()
            .filter(|r| r.method == method)
            .collect()
    }

    fn config(&self) -> Config {
        Config {
            store: StoreConfig {
                url: Some(self.url.clone()),
                anon_key: Some("anon-key-123".to_string()),
                timeout_secs: 5,
            },
            ..Default::default()
        }
    }
}

async fn read_request(socket: &mut tokio::net::TcpStream) -> Option<RecordedRequest> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];

    let header_end = loop {
        let n = socket.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
    let mut lines = head.split("\r\n");
    let mut request_line = lines.next()?.split_whitespace();
    let method = request_line.next()?.to_string();
    let target = request_line.next()?.to_string();

    let headers: HashMap<String, String> = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(k, v)| (k.trim().to_ascii_lowercase(), v.trim().to_string()))
        .collect();

    let length: usize = headers
        .get("content-length")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    while buf.len() < header_end + length {
        let n = socket.read(&mut chunk).await.ok()?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }

    let body = serde_json::from_slice(&buf[header_end..]).unwrap_or(serde_json::Value::Null);
    Some(RecordedRequest {
        method,
        target,
        headers,
        body,
    })
}

fn memory_env() -> Arc<MemoryEnvironment> {
    let page = PageInfo::new("https://blog.example.com/posts/hello", "Hello").unwrap();
    Arc::new(MemoryEnvironment::new(page, DeviceInfo::default(), START_MS))
}

// ============================================
// Page lifecycle
// ============================================

#[tokio::test]
async fn test_init_writes_rows_with_credentials() {
    let store = FakeStore::healthy().await;
    let env = memory_env();
    let tracker = AnalyticsTracker::new(&store.config(), env.clone());

    assert!(tracker.init().await);

    let posts = store.with_method("POST");
    assert_eq!(posts.len(), 2);

    assert_eq!(posts[0].target, "/rest/v1/page_views");
    assert_eq!(posts[0].header("prefer"), Some("return=minimal"));
    assert_eq!(posts[0].body["page_title"], "Hello");

    assert_eq!(posts[1].target, "/rest/v1/page_engagement");
    assert_eq!(posts[1].header("prefer"), Some("return=representation"));
    assert_eq!(posts[1].body["bounced"], true);

    for request in &posts {
        assert_eq!(request.header("apikey"), Some("anon-key-123"));
        assert_eq!(request.header("authorization"), Some("Bearer anon-key-123"));
        assert_eq!(request.header("content-type"), Some("application/json"));
    }

    let engagement = tracker.engagement().unwrap();
    assert_eq!(engagement.engagement_id().as_deref(), Some("7"));
}

#[tokio::test]
async fn test_scroll_to_95_then_tick_updates_row() {
    let store = FakeStore::healthy().await;
    let env = memory_env();
    let tracker = AnalyticsTracker::new(&store.config(), env.clone());
    tracker.init().await;

    env.scroll_to_percent(95);
    tracker.on_scroll();
    env.advance(Duration::from_secs(10));

    let delivery = tracker.tick().await;
    assert_eq!(delivery, Some(Delivery::Delivered(None)));

    let patches = store.with_method("PATCH");
    assert_eq!(patches.len(), 1);
    assert_eq!(patches[0].target, "/rest/v1/page_engagement?id=eq.7");
    assert_eq!(patches[0].body["max_scroll_depth"], 95);
    assert_eq!(patches[0].body["read_complete"], true);
    assert_eq!(patches[0].body["bounced"], false);
    assert_eq!(patches[0].header("apikey"), Some("anon-key-123"));
}

#[tokio::test]
async fn test_hidden_after_five_seconds_uses_beacon() {
    let store = FakeStore::healthy().await;
    let env = memory_env();
    let tracker = AnalyticsTracker::new(&store.config(), env.clone());
    tracker.init().await;

    env.advance(Duration::from_secs(5));
    let delivery = tracker.on_visibility_change(Visibility::Hidden);
    assert_eq!(delivery, Some(Delivery::Delivered(None)));
    assert_eq!(tracker.phase(), Phase::Finalized);

    // Nothing on the ordinary path
    assert!(store.with_method("PATCH").is_empty());

    let beacons = env.beacons();
    assert_eq!(beacons.len(), 1);
    assert_eq!(
        beacons[0].url,
        format!("{}/rest/v1/page_engagement?id=eq.7", store.url)
    );
    let payload = beacons[0].json();
    assert_eq!(payload["time_on_page"], 5);
    assert_eq!(payload["max_scroll_depth"], 0);
    assert_eq!(payload["read_complete"], false);
    assert_eq!(payload["bounced"], true);
}

#[tokio::test]
async fn test_hide_then_unload_sends_twice() {
    let store = FakeStore::healthy().await;
    let env = memory_env();
    let tracker = AnalyticsTracker::new(&store.config(), env.clone());
    tracker.init().await;

    tracker.on_visibility_change(Visibility::Hidden);
    env.advance(Duration::from_secs(1));
    tracker.on_page_hide();

    assert_eq!(env.beacons().len(), 2);
}

// ============================================
// Degradation
// ============================================

#[tokio::test]
async fn test_store_errors_do_not_stop_tracking() {
    let store = FakeStore::failing(500).await;
    let env = memory_env();
    let tracker = AnalyticsTracker::new(&store.config(), env.clone());

    assert!(tracker.init().await);
    assert_eq!(tracker.phase(), Phase::ViewTracked);

    env.scroll_to_percent(50);
    tracker.on_scroll();
    assert!(tracker.tick().await.is_none());
    assert!(tracker.on_page_hide().is_none());
    assert!(env.beacons().is_empty());

    // Events still go out, and still fail quietly
    let delivery = tracker
        .track_event(readtrace_core::EventKind::Click, serde_json::json!({}))
        .await;
    assert!(matches!(delivery, Some(Delivery::Failed(_))));
    assert_eq!(tracker.stats().failed, 3);
}

#[tokio::test]
async fn test_insert_without_representation_is_degraded() {
    let store = FakeStore::start(Arc::new(|_: &RecordedRequest| (201, "[]".to_string()))).await;
    let env = memory_env();
    let tracker = AnalyticsTracker::new(&store.config(), env);

    tracker.init().await;
    assert_eq!(tracker.stats().degraded, 1);
    assert!(tracker.tick().await.is_none());
}

#[tokio::test]
async fn test_unreadable_insert_body_is_degraded() {
    let store =
        FakeStore::start(Arc::new(|_: &RecordedRequest| (201, "<html>ok</html>".to_string()))).await;
    let tracker = AnalyticsTracker::new(&store.config(), memory_env());

    tracker.init().await;
    let stats = tracker.stats();
    assert_eq!(stats.delivered, 1);
    assert_eq!(stats.degraded, 1);
    assert_eq!(stats.failed, 0);
}

#[tokio::test]
async fn test_unreachable_store_is_absorbed() {
    let config = Config {
        store: StoreConfig {
            url: Some("http://127.0.0.1:9".to_string()),
            anon_key: Some("anon".to_string()),
            timeout_secs: 2,
        },
        ..Default::default()
    };
    let tracker = AnalyticsTracker::new(&config, memory_env());

    assert!(tracker.init().await);
    assert!(tracker.tick().await.is_none());
    assert_eq!(tracker.stats().failed, 2);
}

// ============================================
// Events
// ============================================

#[tokio::test]
async fn test_outbound_click_is_posted() {
    let store = FakeStore::healthy().await;
    let env = memory_env();
    let tracker = AnalyticsTracker::new(&store.config(), env);
    tracker.init().await;

    let link = readtrace_core::env::Element::new("a").with_href("https://elsewhere.example.net/x");
    let deliveries = tracker.on_click(&ClickPath::new(link)).await;
    assert_eq!(deliveries.len(), 1);

    let events: Vec<_> = store
        .with_method("POST")
        .into_iter()
        .filter(|r| r.target == "/rest/v1/analytics_events")
        .collect();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].header("prefer"), Some("return=minimal"));
    assert_eq!(events[0].body["event_type"], "external_link");
    assert_eq!(events[0].body["event_data"]["url"], "https://elsewhere.example.net/x");
}

// ============================================
// Identity across page loads
// ============================================

#[test]
fn test_identity_across_page_loads() {
    let provider = IdentityProvider::new(30 * 60 * 1000, true);
    let first_page = memory_env();
    let first = provider.resolve(first_page.as_ref());

    // Next page 10 minutes later, same tab
    first_page.advance(Duration::from_secs(10 * 60));
    let second_page =
        first_page.navigate(PageInfo::new("https://blog.example.com/about", "About").unwrap());
    let second = provider.resolve(&second_page);
    assert_eq!(first, second);

    // Back after 31 minutes of nothing
    second_page.advance(Duration::from_secs(31 * 60));
    let third_page =
        second_page.navigate(PageInfo::new("https://blog.example.com/", "Home").unwrap());
    let third = provider.resolve(&third_page);
    assert_eq!(third.visitor_id, first.visitor_id);
    assert_ne!(third.session_id, first.session_id);
    assert!(third.session_id.starts_with(&third_page.now_ms().to_string()));
}
