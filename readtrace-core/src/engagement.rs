//! Engagement tracking for a single page load.
//!
//! One [`EngagementTracker`] owns one engagement row:
//!
//! ```text
//! Uninitialized --init--> ViewTracked --(row id held) scroll/tick--> Engaging
//!                                                                      |
//!                                              hidden / page hide      v
//!                                                                  Finalized
//! ```
//!
//! `init` writes the page view and the opening engagement row. The scroll
//! handler raises the in-memory maximum depth, the interval pushes revisions
//! through [`Transport::update`], and hiding the page pushes one last revision
//! through [`Transport::flush`]. Revisions need the row id returned by the
//! store; without it they are skipped.
//!
//! All three producers share state behind a mutex that is never held across
//! an await. Remote writes are last-write-wins.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::TrackingConfig;
use crate::env::{lock, Environment};
use crate::transport::{Delivery, DeliveryStats, Transport};
use crate::types::{
    EngagementMetrics, EngagementRow, EngagementUpdate, Identity, PageView, Table,
};

/// Lifecycle of one page load's engagement record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Uninitialized,
    /// Page view written; no revisions pushed yet
    ViewTracked,
    Engaging,
    /// Final flush sent at least once
    Finalized,
}

/// Document visibility as reported by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Visible,
    Hidden,
}

/// Thresholds turning raw measurements into classifications.
#[derive(Debug, Clone, Copy)]
struct Thresholds {
    read_complete_depth: u8,
    bounce_depth: u8,
    bounce_secs: u64,
}

impl From<&TrackingConfig> for Thresholds {
    fn from(config: &TrackingConfig) -> Self {
        Self {
            read_complete_depth: config.read_complete_depth,
            bounce_depth: config.bounce_depth,
            bounce_secs: config.bounce_secs,
        }
    }
}

struct EngagementState {
    phase: Phase,
    started_at_ms: i64,
    max_scroll: u8,
    read_complete: bool,
    engagement_id: Option<String>,
    interval_started: bool,
    stats: DeliveryStats,
}

/// Tracks time-on-page and scroll depth for one page load.
pub struct EngagementTracker {
    env: Arc<dyn Environment>,
    transport: Arc<dyn Transport>,
    identity: Identity,
    thresholds: Thresholds,
    update_interval: Duration,
    state: Mutex<EngagementState>,
}

impl EngagementTracker {
    /// The page-load clock starts here, not at `init`.
    pub fn new(
        env: Arc<dyn Environment>,
        transport: Arc<dyn Transport>,
        identity: Identity,
        config: &TrackingConfig,
    ) -> Self {
        let started_at_ms = env.now_ms();
        Self {
            env,
            transport,
            identity,
            thresholds: Thresholds::from(config),
            update_interval: config.update_interval(),
            state: Mutex::new(EngagementState {
                phase: Phase::Uninitialized,
                started_at_ms,
                max_scroll: 0,
                read_complete: false,
                engagement_id: None,
                interval_started: false,
                stats: DeliveryStats::default(),
            }),
        }
    }

    /// Write the page view and the opening engagement row.
    ///
    /// Only the first call does anything; returns whether this call did.
    pub async fn init(&self) -> bool {
        {
            let mut state = lock(&self.state);
            if state.phase != Phase::Uninitialized {
                tracing::debug!("Engagement tracker already initialized");
                return false;
            }
            state.phase = Phase::ViewTracked;
        }

        self.on_scroll();

        let page = self.env.page();
        let device = self.env.device();

        let view = PageView {
            page_path: page.path().to_string(),
            page_title: page.title.clone(),
            referrer: page.referrer.clone(),
            visitor_id: self.identity.visitor_id.clone(),
            session_id: self.identity.session_id.clone(),
            user_agent: device.user_agent,
            screen_width: device.screen_width,
            screen_height: device.screen_height,
        };
        self.create(Table::PageViews, &view, false).await;

        let opening = EngagementRow::opening(page.path(), &self.identity);
        let delivery = self.create(Table::PageEngagement, &opening, true).await;

        match delivery.created_id() {
            Some(id) => {
                tracing::debug!(engagement_id = %id, page_path = %page.path(), "Engagement row created");
                lock(&self.state).engagement_id = Some(id.to_string());
            }
            None => {
                tracing::warn!(
                    page_path = %page.path(),
                    "No engagement row id returned; revisions disabled for this page"
                );
            }
        }

        true
    }

    /// Scroll handler: raise the maximum depth, never lower it.
    pub fn on_scroll(&self) {
        let percent = self.env.scroll().percent();
        let mut state = lock(&self.state);
        if state.phase == Phase::Uninitialized {
            return;
        }
        if percent > state.max_scroll {
            state.max_scroll = percent;
        }
        enter_engaging(&mut state);
    }

    /// Interval handler: push current metrics as a patch by row id.
    ///
    /// Returns `None` when there is no row to address.
    pub async fn tick(&self) -> Option<Delivery> {
        let (id, update) = {
            let mut state = lock(&self.state);
            let id = state.engagement_id.clone()?;
            enter_engaging(&mut state);
            (id, self.revision(&mut state))
        };

        let delivery = match serde_json::to_value(&update) {
            Ok(payload) => {
                self.transport
                    .update(Table::PageEngagement, &id, &payload)
                    .await
            }
            Err(e) => Delivery::Failed(e.to_string()),
        };

        tracing::trace!(engagement_id = %id, metrics = ?update.metrics, "Engagement revision");
        lock(&self.state).stats.record(&delivery);
        Some(delivery)
    }

    /// Visibility handler: finalize when the page becomes hidden.
    pub fn on_visibility_change(&self, visibility: Visibility) -> Option<Delivery> {
        match visibility {
            Visibility::Hidden => self.finalize(),
            Visibility::Visible => None,
        }
    }

    /// Page hide / unload handler.
    pub fn on_page_hide(&self) -> Option<Delivery> {
        self.finalize()
    }

    /// Send current metrics through the guaranteed-delivery path.
    ///
    /// Safe to call repeatedly; each call sends what is current then.
    pub fn finalize(&self) -> Option<Delivery> {
        let mut state = lock(&self.state);
        let id = state.engagement_id.clone()?;
        let update = self.revision(&mut state);
        state.phase = Phase::Finalized;

        let delivery = match serde_json::to_value(&update) {
            Ok(payload) => self.transport.flush(Table::PageEngagement, &id, &payload),
            Err(e) => Delivery::Failed(e.to_string()),
        };

        tracing::debug!(engagement_id = %id, metrics = ?update.metrics, "Final engagement flush");
        state.stats.record(&delivery);
        Some(delivery)
    }

    /// Start the revision interval on the current tokio runtime.
    ///
    /// One interval per page load: only the first call spawns, later calls
    /// return `None`. The first tick fires one full period after the call.
    /// The task runs until the handle is aborted or the runtime shuts down.
    pub fn spawn_interval(self: &Arc<Self>) -> Option<tokio::task::JoinHandle<()>> {
        {
            let mut state = lock(&self.state);
            if state.interval_started {
                tracing::debug!("Engagement interval already running");
                return None;
            }
            state.interval_started = true;
        }

        let tracker = Arc::clone(self);
        let period = self.update_interval;

        Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                interval.tick().await;
                tracker.tick().await;
            }
        }))
    }

    /// Metrics as of now, without sending anything.
    pub fn metrics(&self) -> EngagementMetrics {
        let mut state = lock(&self.state);
        self.compute(&mut state)
    }

    pub fn phase(&self) -> Phase {
        lock(&self.state).phase
    }

    pub fn max_scroll(&self) -> u8 {
        lock(&self.state).max_scroll
    }

    pub fn engagement_id(&self) -> Option<String> {
        lock(&self.state).engagement_id.clone()
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn stats(&self) -> DeliveryStats {
        lock(&self.state).stats
    }

    fn revision(&self, state: &mut EngagementState) -> EngagementUpdate {
        EngagementUpdate {
            metrics: self.compute(state),
            updated_at: timestamp(self.env.now_ms()),
        }
    }

    fn compute(&self, state: &mut EngagementState) -> EngagementMetrics {
        let elapsed_ms = (self.env.now_ms() - state.started_at_ms).max(0);
        let time_on_page = (elapsed_ms as f64 / 1000.0).round() as u64;

        if state.max_scroll >= self.thresholds.read_complete_depth {
            state.read_complete = true;
        }

        EngagementMetrics {
            time_on_page,
            max_scroll_depth: state.max_scroll,
            read_complete: state.read_complete,
            bounced: state.max_scroll < self.thresholds.bounce_depth
                && time_on_page < self.thresholds.bounce_secs,
        }
    }

    async fn create<T: Serialize>(&self, table: Table, row: &T, expect_row: bool) -> Delivery {
        let delivery = match serde_json::to_value(row) {
            Ok(payload) => self.transport.create(table, &payload, expect_row).await,
            Err(e) => {
                tracing::warn!(table = %table, error = %e, "Failed to encode row");
                Delivery::Failed(e.to_string())
            }
        };
        lock(&self.state).stats.record(&delivery);
        delivery
    }
}

/// Revisions only move the record along once there is a row to revise.
fn enter_engaging(state: &mut EngagementState) {
    if state.phase == Phase::ViewTracked && state.engagement_id.is_some() {
        state.phase = Phase::Engaging;
    }
}

fn timestamp(ms: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(ms).unwrap_or_else(Utc::now)
}
