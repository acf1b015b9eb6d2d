//! Service layer for media-allocator
//!
//! Services hold the business logic on top of the repository functions in
//! `db/*.rs`. Each one owns its transaction boundaries and emits events once
//! its work has committed.
//!
//! ## Architecture
//!
//! ```text
//! CLI / collaborators (notification, packaging, transport, admin)
//!     ↓
//! Service Layer (engines, links, feeds, admin)
//!     ↓
//! Repository Layer (db/*.rs)
//!     ↓
//! SQLite Database
//! ```

pub mod events;
pub mod ring;
pub mod distribution;
pub mod expiry;
pub mod links;
pub mod feeds;
pub mod admin;

// Re-exports
pub use events::{spawn_listener, AllocatorEvent, EventBus, EventListener, LoggingEventListener};
pub use ring::WeightedRing;
pub use distribution::{
    DistributionOptions, DistributionOutcome, DistributionReport, DistributionService,
    DistributionSummary, NothingToDo,
};
pub use expiry::{ExpiryOptions, ExpiryReport, ExpiryService, ExpirySummary};
pub use links::{LinkConfig, LinkService, MintedLink, PickupLink, PickupOutcome};
pub use feeds::{FeedService, NotificationBatch, PackagedAllocation};
pub use admin::AdminService;

use std::sync::Arc;

use crate::config::{Config, LINK_SECRET_ENV};
use crate::db::AllocatorDb;
use crate::error::AllocatorError;

/// Service container for dependency injection
///
/// Holds all services with a shared database and event bus.
pub struct Services {
    pub distribution: Arc<DistributionService>,
    pub expiry: Arc<ExpiryService>,
    pub links: Arc<LinkService>,
    pub feeds: Arc<FeedService>,
    pub admin: Arc<AdminService>,
    pub events: Arc<EventBus>,
}

impl Services {
    /// Create all services. Without `dev`, a signing secret must be configured.
    pub fn new(db: Arc<AllocatorDb>, config: &Config, dev: bool) -> Result<Self, AllocatorError> {
        let events = Arc::new(EventBus::new());

        let links = match (&config.link_signing_secret, dev) {
            (Some(secret), _) => LinkService::new(db.clone(), events.clone(), LinkConfig {
                signing_secret: secret.clone(),
                base_url: config.link_base_url.clone(),
                link_ttl: config.link_ttl(),
            })?,
            (None, true) => {
                LinkService::new_dev(db.clone(), events.clone(), &config.link_base_url, config.link_ttl())?
            }
            (None, false) => {
                return Err(AllocatorError::Config(format!(
                    "No link signing secret configured; set {} or run with --dev",
                    LINK_SECRET_ENV
                )));
            }
        };
        let links = Arc::new(links);

        Ok(Self {
            distribution: Arc::new(DistributionService::new(db.clone(), events.clone())),
            expiry: Arc::new(ExpiryService::new(db.clone(), events.clone())),
            feeds: Arc::new(FeedService::new(db.clone(), links.clone())),
            admin: Arc::new(AdminService::new(db, events.clone())),
            links,
            events,
        })
    }

    /// Services over an in-memory database with the dev signing secret (for testing)
    pub fn in_memory() -> Result<Self, AllocatorError> {
        let db = Arc::new(AllocatorDb::open_in_memory()?);
        Self::new(db, &Config::default(), true)
    }
}
