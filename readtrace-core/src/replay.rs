//! Scripted page visits.
//!
//! A replay script describes one page load and what the reader did on it.
//! Running it drives a real [`AnalyticsTracker`] over a
//! [`MemoryEnvironment`] whose clock only moves when the script says so.
//!
//! ```toml
//! [page]
//! url = "https://blog.example.com/posts/hello"
//! title = "Hello"
//!
//! [[steps]]
//! action = "scroll"
//! percent = 40
//!
//! [[steps]]
//! action = "wait"
//! secs = 12
//!
//! [[steps]]
//! action = "click"
//! path = [{ tag = "a", href = "https://elsewhere.example.net/" }]
//!
//! [[steps]]
//! action = "hide"
//! ```
//!
//! While waiting, the engagement interval fires at each period boundary
//! unless `auto_tick = false`.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::config::Config;
use crate::engagement::{Phase, Visibility};
use crate::env::{DeviceInfo, Element, Environment, MemoryEnvironment, PageInfo, ScrollMetrics};
use crate::error::{Error, Result};
use crate::events::ClickPath;
use crate::tracker::AnalyticsTracker;
use crate::transport::{DeliveryStats, Transport};
use crate::types::{EngagementMetrics, EventKind, Identity};

/// Longest single `wait` a script may ask for (one day)
pub const MAX_WAIT_SECS: f64 = 86_400.0;

/// A scripted page visit.
#[derive(Debug, Clone, Deserialize)]
pub struct ReplayScript {
    pub page: PageSpec,

    #[serde(default)]
    pub device: Option<DeviceSpec>,

    #[serde(default)]
    pub layout: LayoutSpec,

    /// Forms present when the page finishes loading
    #[serde(default)]
    pub forms: Vec<ElementSpec>,

    /// Fire the engagement interval while waiting
    #[serde(default = "default_auto_tick")]
    pub auto_tick: bool,

    #[serde(default)]
    pub steps: Vec<Step>,
}

fn default_auto_tick() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct PageSpec {
    pub url: String,
    #[serde(default)]
    pub title: String,
    pub referrer: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeviceSpec {
    pub user_agent: Option<String>,
    pub language: Option<String>,
    pub screen_width: Option<u32>,
    pub screen_height: Option<u32>,
    pub timezone_offset_minutes: Option<i32>,
    pub canvas_signature: Option<String>,
}

impl DeviceSpec {
    fn into_device(self) -> DeviceInfo {
        let defaults = DeviceInfo::default();
        DeviceInfo {
            user_agent: self.user_agent.unwrap_or(defaults.user_agent),
            language: self.language.unwrap_or(defaults.language),
            screen_width: self.screen_width.unwrap_or(defaults.screen_width),
            screen_height: self.screen_height.unwrap_or(defaults.screen_height),
            timezone_offset_minutes: self
                .timezone_offset_minutes
                .unwrap_or(defaults.timezone_offset_minutes),
            canvas_signature: self.canvas_signature,
        }
    }
}

/// Document and viewport heights in CSS pixels.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct LayoutSpec {
    #[serde(default = "default_scroll_height")]
    pub scroll_height: f64,
    #[serde(default = "default_viewport_height")]
    pub viewport_height: f64,
}

impl Default for LayoutSpec {
    fn default() -> Self {
        Self {
            scroll_height: default_scroll_height(),
            viewport_height: default_viewport_height(),
        }
    }
}

fn default_scroll_height() -> f64 {
    3000.0
}

fn default_viewport_height() -> f64 {
    1000.0
}

#[derive(Debug, Clone, Deserialize)]
pub struct ElementSpec {
    pub tag: String,
    pub id: Option<String>,
    #[serde(default)]
    pub classes: Vec<String>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub href: Option<String>,
}

impl ElementSpec {
    fn to_element(&self) -> Element {
        Element {
            tag: self.tag.to_ascii_lowercase(),
            id: self.id.clone(),
            classes: self.classes.clone(),
            kind: self.kind.clone(),
            href: self.href.clone(),
        }
    }
}

/// One thing the reader (or the browser) does.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Step {
    /// Scroll so the document reads `percent` scrolled
    Scroll { percent: u8 },
    /// Let time pass
    Wait { secs: f64 },
    /// Fire the engagement interval once
    Tick,
    /// Tab hidden
    Hide,
    /// Tab visible again
    Show,
    /// Page hide / unload
    Unload,
    /// Click; `path` lists the target first, then its ancestors
    Click { path: Vec<ElementSpec> },
    Submit { form: ElementSpec },
    Event {
        kind: EventKind,
        #[serde(default = "empty_object")]
        data: serde_json::Value,
    },
}

fn empty_object() -> serde_json::Value {
    serde_json::json!({})
}

impl ReplayScript {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Script(format!("failed to read script {:?}: {}", path, e)))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let script: ReplayScript = toml::from_str(content)
            .map_err(|e| Error::Script(format!("failed to parse script: {}", e)))?;
        script.validate()?;
        Ok(script)
    }

    fn validate(&self) -> Result<()> {
        for (i, step) in self.steps.iter().enumerate() {
            match step {
                Step::Scroll { percent } if *percent > 100 => {
                    return Err(Error::Script(format!(
                        "step {}: scroll percent must be 0..=100",
                        i + 1
                    )));
                }
                Step::Wait { secs } if !secs.is_finite() || *secs < 0.0 => {
                    return Err(Error::Script(format!(
                        "step {}: wait must be a non-negative number of seconds",
                        i + 1
                    )));
                }
                Step::Wait { secs } if *secs > MAX_WAIT_SECS => {
                    return Err(Error::Script(format!(
                        "step {}: wait of {}s exceeds the {}s limit",
                        i + 1,
                        secs,
                        MAX_WAIT_SECS
                    )));
                }
                Step::Click { path } if path.is_empty() => {
                    return Err(Error::Script(format!("step {}: click path is empty", i + 1)));
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// The environment this script's page loads in, clock at `now_ms`.
    pub fn environment(&self, now_ms: i64) -> Result<MemoryEnvironment> {
        let mut page = PageInfo::new(&self.page.url, &self.page.title)?;
        if let Some(referrer) = &self.page.referrer {
            page = page.with_referrer(referrer);
        }

        let device = self
            .device
            .clone()
            .map(DeviceSpec::into_device)
            .unwrap_or_default();

        let env = MemoryEnvironment::new(page, device, now_ms);
        env.set_scroll(ScrollMetrics {
            scroll_top: 0.0,
            scroll_height: self.layout.scroll_height,
            viewport_height: self.layout.viewport_height,
        });
        for form in &self.forms {
            env.add_form(form.to_element());
        }
        Ok(env)
    }
}

/// What a replay did.
#[derive(Debug, Clone)]
pub struct ReplayReport {
    pub identity: Option<Identity>,
    pub steps: usize,
    pub ticks: usize,
    pub events: usize,
    pub flushes: usize,
    pub phase: Phase,
    pub metrics: Option<EngagementMetrics>,
    pub stats: DeliveryStats,
}

/// Run `script` against `env` and `transport`.
pub async fn run(
    script: &ReplayScript,
    config: &Config,
    env: Arc<MemoryEnvironment>,
    transport: Arc<dyn Transport>,
) -> ReplayReport {
    let tracker = AnalyticsTracker::with_transport(config, env.clone(), transport);
    let period_ms = config.tracking.update_interval().as_millis() as i64;

    let mut report = ReplayReport {
        identity: tracker.identity().cloned(),
        steps: 0,
        ticks: 0,
        events: 0,
        flushes: 0,
        phase: Phase::Uninitialized,
        metrics: None,
        stats: DeliveryStats::default(),
    };

    tracker.init().await;
    let mut next_tick_ms = env.now_ms() + period_ms;

    for step in &script.steps {
        tracing::debug!(step = ?step, "Replay step");
        match step {
            Step::Scroll { percent } => {
                env.scroll_to_percent(*percent);
                tracker.on_scroll();
            }
            Step::Wait { secs } => {
                let until = env.now_ms() + (secs * 1000.0).round() as i64;
                if script.auto_tick && period_ms > 0 {
                    while next_tick_ms <= until {
                        env.set_now(next_tick_ms);
                        if tracker.tick().await.is_some() {
                            report.ticks += 1;
                        }
                        next_tick_ms += period_ms;
                    }
                }
                env.set_now(until);
            }
            Step::Tick => {
                if tracker.tick().await.is_some() {
                    report.ticks += 1;
                }
            }
            Step::Hide => {
                if tracker.on_visibility_change(Visibility::Hidden).is_some() {
                    report.flushes += 1;
                }
            }
            Step::Show => {
                tracker.on_visibility_change(Visibility::Visible);
            }
            Step::Unload => {
                if tracker.on_page_hide().is_some() {
                    report.flushes += 1;
                }
            }
            Step::Click { path } => {
                let mut elements = path.iter().map(ElementSpec::to_element);
                if let Some(target) = elements.next() {
                    let click = elements.fold(ClickPath::new(target), ClickPath::within);
                    report.events += tracker.on_click(&click).await.len();
                }
            }
            Step::Submit { form } => {
                if tracker.on_submit(&form.to_element()).await.is_some() {
                    report.events += 1;
                }
            }
            Step::Event { kind, data } => {
                if tracker.track_event(*kind, data.clone()).await.is_some() {
                    report.events += 1;
                }
            }
        }
        report.steps += 1;
    }

    report.phase = tracker.phase();
    report.metrics = tracker.engagement().map(|engagement| engagement.metrics());
    report.stats = tracker.stats();
    report
}

/// Seconds a script's waits add up to.
pub fn scripted_duration(script: &ReplayScript) -> Duration {
    let secs: f64 = script
        .steps
        .iter()
        .map(|step| match step {
            Step::Wait { secs } => *secs,
            _ => 0.0,
        })
        .sum();
    Duration::try_from_secs_f64(secs.max(0.0)).unwrap_or(Duration::MAX)
}
