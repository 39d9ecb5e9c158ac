//! The host-facing tracker.
//!
//! [`AnalyticsTracker`] wires identity, engagement and events together for
//! one page load. The host constructs it, calls [`AnalyticsTracker::init`],
//! and forwards platform signals (scroll, visibility, page hide, clicks,
//! submits) to it. When the store is not configured the tracker is inert and
//! every handler is a no-op.

use std::sync::Arc;

use crate::config::Config;
use crate::engagement::{EngagementTracker, Phase, Visibility};
use crate::env::{Beacon, Element, Environment};
use crate::events::{ClickPath, EventTracker};
use crate::identity::IdentityProvider;
use crate::transport::{Delivery, DeliveryStats, RestTransport, Transport};
use crate::types::{EventKind, Identity};

struct ActiveTracker {
    engagement: Arc<EngagementTracker>,
    events: EventTracker,
}

/// Engagement and event tracking for one page load.
pub struct AnalyticsTracker {
    active: Option<ActiveTracker>,
}

impl AnalyticsTracker {
    /// Build a tracker writing to the configured store.
    ///
    /// Missing store credentials (or an unusable key) yield an inert tracker.
    pub fn new<E>(config: &Config, env: Arc<E>) -> Self
    where
        E: Environment + Beacon + 'static,
    {
        if !config.store.is_ready() {
            tracing::warn!("Analytics not configured; tracking disabled");
            return Self::disabled();
        }

        match RestTransport::new(&config.store, env.clone()) {
            Ok(transport) => Self::with_transport(config, env, Arc::new(transport)),
            Err(e) => {
                tracing::warn!(error = %e, "Analytics transport unavailable; tracking disabled");
                Self::disabled()
            }
        }
    }

    /// Build an active tracker over an explicit transport.
    ///
    /// Resolves visitor and session identity immediately and starts the
    /// page-load clock.
    pub fn with_transport(
        config: &Config,
        env: Arc<dyn Environment>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let provider = IdentityProvider::new(
            config.tracking.session_timeout_ms(),
            config.tracking.canvas_fingerprint,
        );
        let identity = provider.resolve(env.as_ref());

        let engagement = Arc::new(EngagementTracker::new(
            env.clone(),
            transport.clone(),
            identity.clone(),
            &config.tracking,
        ));
        let events = EventTracker::new(env, transport, identity, config.selectors.clone());

        Self {
            active: Some(ActiveTracker { engagement, events }),
        }
    }

    /// A tracker that never records anything.
    pub fn disabled() -> Self {
        Self { active: None }
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    /// Write the page view and engagement row and start observing forms.
    ///
    /// Returns false when inert or already initialized.
    pub async fn init(&self) -> bool {
        let Some(active) = &self.active else {
            return false;
        };
        if !active.engagement.init().await {
            return false;
        }
        active.events.setup();
        true
    }

    /// Start the periodic engagement revisions on the current tokio runtime.
    ///
    /// `None` when inert or when the interval is already running.
    pub fn spawn_interval(&self) -> Option<tokio::task::JoinHandle<()>> {
        self.active
            .as_ref()
            .and_then(|active| active.engagement.spawn_interval())
    }

    pub fn on_scroll(&self) {
        if let Some(active) = &self.active {
            active.engagement.on_scroll();
        }
    }

    /// One revision, as the interval would send it.
    pub async fn tick(&self) -> Option<Delivery> {
        match &self.active {
            Some(active) => active.engagement.tick().await,
            None => None,
        }
    }

    pub fn on_visibility_change(&self, visibility: Visibility) -> Option<Delivery> {
        self.active
            .as_ref()
            .and_then(|active| active.engagement.on_visibility_change(visibility))
    }

    pub fn on_page_hide(&self) -> Option<Delivery> {
        self.active
            .as_ref()
            .and_then(|active| active.engagement.on_page_hide())
    }

    pub async fn on_click(&self, path: &ClickPath) -> Vec<(EventKind, Delivery)> {
        match &self.active {
            Some(active) => active.events.on_click(path).await,
            None => Vec::new(),
        }
    }

    pub async fn on_submit(&self, form: &Element) -> Option<Delivery> {
        match &self.active {
            Some(active) => active.events.on_submit(form).await,
            None => None,
        }
    }

    pub async fn track_event(&self, kind: EventKind, data: serde_json::Value) -> Option<Delivery> {
        match &self.active {
            Some(active) => Some(active.events.track_event(kind, data).await),
            None => None,
        }
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.active
            .as_ref()
            .map(|active| active.engagement.identity())
    }

    pub fn phase(&self) -> Phase {
        self.active
            .as_ref()
            .map_or(Phase::Uninitialized, |active| active.engagement.phase())
    }

    pub fn engagement(&self) -> Option<&Arc<EngagementTracker>> {
        self.active.as_ref().map(|active| &active.engagement)
    }

    /// Delivery outcomes across engagement and events.
    pub fn stats(&self) -> DeliveryStats {
        self.active.as_ref().map_or(DeliveryStats::default(), |active| {
            active.engagement.stats().merge(active.events.stats())
        })
    }
}
