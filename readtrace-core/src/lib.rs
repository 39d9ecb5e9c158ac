//! # readtrace-core
//!
//! Reader engagement telemetry for a published site.
//!
//! This library provides:
//! - Anonymous visitor and session identity
//! - Page-view capture and a continuously revised engagement record
//!   (time on page, scroll depth, read-complete and bounce classification)
//! - Discrete event capture (shares, subscriptions, outbound links)
//! - Best-effort delivery to a REST analytics store, with a guaranteed-enqueue
//!   path for the final flush when the page goes away
//!
//! The host platform is reached only through [`env::Environment`] and
//! [`env::Beacon`]; nothing here can fail the host page.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use readtrace_core::env::{DeviceInfo, MemoryEnvironment, PageInfo};
//! use readtrace_core::{AnalyticsTracker, Config};
//!
//! # async fn run() -> readtrace_core::Result<()> {
//! let config = Config::load()?;
//! let page = PageInfo::new("https://blog.example.com/posts/hello", "Hello")?;
//! let env = Arc::new(MemoryEnvironment::new(page, DeviceInfo::default(), 0));
//!
//! let tracker = AnalyticsTracker::new(&config, env);
//! tracker.init().await;
//! let _interval = tracker.spawn_interval();
//! # Ok(())
//! # }
//! ```

// Re-export commonly used items at the crate root
pub use config::Config;
pub use engagement::{EngagementTracker, Phase, Visibility};
pub use error::{Error, Result};
pub use events::{ClickPath, EventTracker};
pub use tracker::AnalyticsTracker;
pub use transport::{Delivery, DeliveryStats, RecordingTransport, RestTransport, Transport};
pub use types::*;

// Public modules
pub mod config;
pub mod engagement;
pub mod env;
pub mod error;
pub mod events;
pub mod hash;
pub mod identity;
pub mod logging;
pub mod replay;
pub mod tracker;
pub mod transport;
pub mod types;
