//! Host environment capabilities.
//!
//! The tracker never touches platform globals directly. Storage, clock,
//! device metrics, page info, scroll geometry and the guaranteed-delivery
//! primitive all come through [`Environment`] and [`Beacon`], so a host can
//! back them with a real browsing context and tests can use
//! [`MemoryEnvironment`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use reqwest::Url;

use crate::error::{Error, Result};

/// Device signals used for the visitor fingerprint and the page-view row.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceInfo {
    pub user_agent: String,
    /// BCP 47 language tag (e.g. `en-US`)
    pub language: String,
    pub screen_width: u32,
    pub screen_height: u32,
    /// Minutes behind UTC, as browsers report it (UTC+1 is `-60`)
    pub timezone_offset_minutes: i32,
    /// Rendered-canvas data URL, when the platform can produce one
    pub canvas_signature: Option<String>,
}

impl Default for DeviceInfo {
    fn default() -> Self {
        Self {
            user_agent: "Mozilla/5.0 (X11; Linux x86_64)".to_string(),
            language: "en-US".to_string(),
            screen_width: 1920,
            screen_height: 1080,
            timezone_offset_minutes: 0,
            canvas_signature: None,
        }
    }
}

/// The page currently loaded in the browsing context.
#[derive(Debug, Clone, PartialEq)]
pub struct PageInfo {
    pub url: Url,
    pub title: String,
    pub referrer: Option<String>,
}

impl PageInfo {
    pub fn new(url: &str, title: &str) -> Result<Self> {
        let url = Url::parse(url).map_err(|e| Error::Config(format!("invalid page url {url}: {e}")))?;
        Ok(Self {
            url,
            title: title.to_string(),
            referrer: None,
        })
    }

    pub fn with_referrer(mut self, referrer: &str) -> Self {
        self.referrer = Some(referrer.to_string()).filter(|r| !r.is_empty());
        self
    }

    pub fn path(&self) -> &str {
        self.url.path()
    }

    pub fn host(&self) -> &str {
        self.url.host_str().unwrap_or_default()
    }
}

/// Scroll geometry of the document, in CSS pixels.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ScrollMetrics {
    pub scroll_top: f64,
    pub scroll_height: f64,
    pub viewport_height: f64,
}

impl ScrollMetrics {
    /// Percentage of the scrollable range covered, 0..=100.
    ///
    /// Pages shorter than the viewport have no scrollable range and report 0.
    pub fn percent(&self) -> u8 {
        let range = self.scroll_height - self.viewport_height;
        if range <= 0.0 || !range.is_finite() {
            return 0;
        }
        let percent = (self.scroll_top / range * 100.0).round();
        percent.clamp(0.0, 100.0) as u8
    }
}

/// The slice of a DOM element the event tracker inspects.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Element {
    /// Lowercase tag name
    pub tag: String,
    pub id: Option<String>,
    pub classes: Vec<String>,
    /// `type` attribute
    pub kind: Option<String>,
    /// `href` attribute as written (may be relative)
    pub href: Option<String>,
}

impl Element {
    pub fn new(tag: &str) -> Self {
        Self {
            tag: tag.to_ascii_lowercase(),
            ..Self::default()
        }
    }

    pub fn with_id(mut self, id: &str) -> Self {
        self.id = Some(id.to_string());
        self
    }

    pub fn with_class(mut self, class: &str) -> Self {
        self.classes.push(class.to_string());
        self
    }

    pub fn with_kind(mut self, kind: &str) -> Self {
        self.kind = Some(kind.to_string());
        self
    }

    pub fn with_href(mut self, href: &str) -> Self {
        self.href = Some(href.to_string());
        self
    }

    pub fn has_class(&self, class: &str) -> bool {
        self.classes.iter().any(|c| c == class)
    }

    pub fn is(&self, tag: &str) -> bool {
        self.tag == tag
    }
}

/// Platform capabilities the tracker reads from.
pub trait Environment: Send + Sync {
    /// Profile-scoped storage that survives restarts
    fn durable_get(&self, key: &str) -> Option<String>;
    fn durable_set(&self, key: &str, value: &str);

    /// Tab-scoped storage that dies with the tab
    fn volatile_get(&self, key: &str) -> Option<String>;
    fn volatile_set(&self, key: &str, value: &str);

    /// Wall clock in epoch milliseconds
    fn now_ms(&self) -> i64;

    fn device(&self) -> DeviceInfo;

    fn page(&self) -> PageInfo;

    fn scroll(&self) -> ScrollMetrics;

    /// Forms present in the document right now
    fn forms(&self) -> Vec<Element>;
}

/// Guaranteed-enqueue delivery that survives page teardown.
///
/// Returns whether the platform accepted the payload. Acceptance says
/// nothing about eventual delivery, which the caller cannot observe.
pub trait Beacon: Send + Sync {
    fn send_beacon(&self, url: &str, body: &str) -> bool;
}

/// A payload handed to the guaranteed-delivery path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BeaconRequest {
    pub url: String,
    pub body: String,
}

impl BeaconRequest {
    pub fn json(&self) -> serde_json::Value {
        serde_json::from_str(&self.body).unwrap_or(serde_json::Value::Null)
    }
}

type Storage = Arc<Mutex<HashMap<String, String>>>;

/// Lock, recovering the data from a poisoned mutex.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct MemoryState {
    now_ms: i64,
    device: DeviceInfo,
    page: PageInfo,
    scroll: ScrollMetrics,
    forms: Vec<Element>,
    beacons: Vec<BeaconRequest>,
    accept_beacons: bool,
}

/// In-memory environment with a manual clock.
///
/// Durable storage is shared between tabs opened with [`MemoryEnvironment::new_tab`];
/// volatile storage is shared only by page loads within one tab
/// ([`MemoryEnvironment::navigate`]).
pub struct MemoryEnvironment {
    durable: Storage,
    volatile: Storage,
    state: Mutex<MemoryState>,
}

impl MemoryEnvironment {
    pub fn new(page: PageInfo, device: DeviceInfo, now_ms: i64) -> Self {
        Self {
            durable: Storage::default(),
            volatile: Storage::default(),
            state: Mutex::new(MemoryState {
                now_ms,
                device,
                page,
                scroll: ScrollMetrics {
                    scroll_top: 0.0,
                    scroll_height: 3000.0,
                    viewport_height: 1000.0,
                },
                forms: Vec::new(),
                beacons: Vec::new(),
                accept_beacons: true,
            }),
        }
    }

    /// Next page load in the same tab: same storage, same clock.
    pub fn navigate(&self, page: PageInfo) -> Self {
        let state = lock(&self.state);
        Self {
            durable: Arc::clone(&self.durable),
            volatile: Arc::clone(&self.volatile),
            state: Mutex::new(MemoryState {
                now_ms: state.now_ms,
                device: state.device.clone(),
                page,
                scroll: ScrollMetrics {
                    scroll_top: 0.0,
                    ..state.scroll
                },
                forms: Vec::new(),
                beacons: Vec::new(),
                accept_beacons: state.accept_beacons,
            }),
        }
    }

    /// A fresh tab of the same browser profile: shared durable storage only.
    pub fn new_tab(&self, page: PageInfo) -> Self {
        let tab = self.navigate(page);
        Self {
            volatile: Storage::default(),
            ..tab
        }
    }

    pub fn advance(&self, by: Duration) {
        lock(&self.state).now_ms += by.as_millis() as i64;
    }

    pub fn set_now(&self, now_ms: i64) {
        lock(&self.state).now_ms = now_ms;
    }

    pub fn set_scroll(&self, scroll: ScrollMetrics) {
        lock(&self.state).scroll = scroll;
    }

    /// Position the viewport so the document reads as `percent` scrolled.
    pub fn scroll_to_percent(&self, percent: u8) {
        let mut state = lock(&self.state);
        let range = (state.scroll.scroll_height - state.scroll.viewport_height).max(0.0);
        state.scroll.scroll_top = range * f64::from(percent.min(100)) / 100.0;
    }

    pub fn add_form(&self, form: Element) {
        lock(&self.state).forms.push(form);
    }

    /// Make the guaranteed-delivery primitive refuse payloads.
    pub fn refuse_beacons(&self) {
        lock(&self.state).accept_beacons = false;
    }

    pub fn beacons(&self) -> Vec<BeaconRequest> {
        lock(&self.state).beacons.clone()
    }

    pub fn clear_durable(&self) {
        lock(&self.durable).clear();
    }
}

impl Environment for MemoryEnvironment {
    fn durable_get(&self, key: &str) -> Option<String> {
        lock(&self.durable).get(key).cloned()
    }

    fn durable_set(&self, key: &str, value: &str) {
        lock(&self.durable).insert(key.to_string(), value.to_string());
    }

    fn volatile_get(&self, key: &str) -> Option<String> {
        lock(&self.volatile).get(key).cloned()
    }

    fn volatile_set(&self, key: &str, value: &str) {
        lock(&self.volatile).insert(key.to_string(), value.to_string());
    }

    fn now_ms(&self) -> i64 {
        lock(&self.state).now_ms
    }

    fn device(&self) -> DeviceInfo {
        lock(&self.state).device.clone()
    }

    fn page(&self) -> PageInfo {
        lock(&self.state).page.clone()
    }

    fn scroll(&self) -> ScrollMetrics {
        lock(&self.state).scroll
    }

    fn forms(&self) -> Vec<Element> {
        lock(&self.state).forms.clone()
    }
}

impl Beacon for MemoryEnvironment {
    fn send_beacon(&self, url: &str, body: &str) -> bool {
        let mut state = lock(&self.state);
        if !state.accept_beacons {
            return false;
        }
        state.beacons.push(BeaconRequest {
            url: url.to_string(),
            body: body.to_string(),
        });
        true
    }
}
