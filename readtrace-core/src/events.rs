//! Discrete interaction events.
//!
//! A single delegated click handler classifies each click by walking the
//! target's ancestor chain. Rules are evaluated independently, so one click
//! can produce several events:
//!
//! 1. the share control (or something inside it) → `share`
//! 2. a submit button inside an inline subscribe form → `subscribe`
//! 3. a link to another host → `external_link`
//!
//! Subscribe forms present at [`EventTracker::setup`] also report their own
//! submits. A click on the submit button followed by the form's submit
//! therefore records `subscribe` twice; that is the established behavior.
//! Forms inserted after setup are not observed.

use std::sync::{Arc, Mutex};

use reqwest::Url;
use serde_json::json;

use crate::config::SelectorConfig;
use crate::env::{lock, Element, Environment};
use crate::transport::{Delivery, DeliveryStats, Transport};
use crate::types::{AnalyticsEvent, EventKind, Identity, Table};

/// Click target followed by its ancestors, innermost first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClickPath(pub Vec<Element>);

impl ClickPath {
    pub fn new(target: Element) -> Self {
        Self(vec![target])
    }

    /// Append the next ancestor outward.
    pub fn within(mut self, ancestor: Element) -> Self {
        self.0.push(ancestor);
        self
    }

    /// Index of the nearest element (target included) matching `pred`.
    fn closest(&self, pred: impl Fn(&Element) -> bool) -> Option<usize> {
        self.0.iter().position(pred)
    }
}

/// Turn a click into the events it should record, in rule order.
pub fn classify_click(
    path: &ClickPath,
    page_url: &Url,
    selectors: &SelectorConfig,
) -> Vec<(EventKind, serde_json::Value)> {
    let mut events = Vec::new();

    let is_share = |e: &Element| e.id.as_deref() == Some(selectors.share_button_id.as_str());
    if path.closest(is_share).is_some() {
        events.push((EventKind::Share, json!({ "platform": "twitter" })));
    }

    if is_subscribe_submit(path, &selectors.subscribe_form_class) {
        events.push((EventKind::Subscribe, json!({})));
    }

    if let Some(link) = path.closest(|e| e.is("a")).map(|i| &path.0[i]) {
        if let Some(target) = link.href.as_deref().and_then(|href| page_url.join(href).ok()) {
            if target.host_str().unwrap_or_default() != page_url.host_str().unwrap_or_default() {
                events.push((EventKind::ExternalLink, json!({ "url": target.as_str() })));
            }
        }
    }

    events
}

/// `.{form_class} button[type="submit"]`
fn is_subscribe_submit(path: &ClickPath, form_class: &str) -> bool {
    let is_submit_button = |e: &Element| e.is("button") && e.kind.as_deref() == Some("submit");
    match path.closest(is_submit_button) {
        Some(i) => path.0[i + 1..].iter().any(|e| e.has_class(form_class)),
        None => false,
    }
}

/// Reports discrete interactions for one page load.
pub struct EventTracker {
    env: Arc<dyn Environment>,
    transport: Arc<dyn Transport>,
    identity: Identity,
    selectors: SelectorConfig,
    observed_forms: Mutex<Vec<Element>>,
    stats: Mutex<DeliveryStats>,
}

impl EventTracker {
    pub fn new(
        env: Arc<dyn Environment>,
        transport: Arc<dyn Transport>,
        identity: Identity,
        selectors: SelectorConfig,
    ) -> Self {
        Self {
            env,
            transport,
            identity,
            selectors,
            observed_forms: Mutex::new(Vec::new()),
            stats: Mutex::new(DeliveryStats::default()),
        }
    }

    /// Capture the subscribe forms currently in the document.
    ///
    /// Returns how many forms are observed.
    pub fn setup(&self) -> usize {
        let forms: Vec<Element> = self
            .env
            .forms()
            .into_iter()
            .filter(|form| form.has_class(&self.selectors.subscribe_form_class))
            .collect();

        let count = forms.len();
        *lock(&self.observed_forms) = forms;
        tracing::debug!(forms = count, "Observing subscribe forms");
        count
    }

    /// Delegated click handler.
    pub async fn on_click(&self, path: &ClickPath) -> Vec<(EventKind, Delivery)> {
        let page = self.env.page();
        let mut deliveries = Vec::new();

        for (kind, data) in classify_click(path, &page.url, &self.selectors) {
            let delivery = self.track_event(kind, data).await;
            deliveries.push((kind, delivery));
        }

        deliveries
    }

    /// Submit handler; only forms captured at setup report.
    pub async fn on_submit(&self, form: &Element) -> Option<Delivery> {
        let observed = lock(&self.observed_forms).contains(form);
        if !observed {
            return None;
        }
        Some(self.track_event(EventKind::Subscribe, json!({})).await)
    }

    /// Record an event of any kind. Sent once, no retry.
    pub async fn track_event(&self, kind: EventKind, data: serde_json::Value) -> Delivery {
        let event = AnalyticsEvent {
            event_type: kind,
            page_path: self.env.page().path().to_string(),
            visitor_id: self.identity.visitor_id.clone(),
            session_id: self.identity.session_id.clone(),
            event_data: data,
        };

        let delivery = match serde_json::to_value(&event) {
            Ok(payload) => {
                self.transport
                    .create(Table::AnalyticsEvents, &payload, false)
                    .await
            }
            Err(e) => Delivery::Failed(e.to_string()),
        };

        tracing::debug!(event_type = kind.as_str(), delivered = delivery.is_delivered(), "Tracked event");
        lock(&self.stats).record(&delivery);
        delivery
    }

    pub fn stats(&self) -> DeliveryStats {
        *lock(&self.stats)
    }
}
