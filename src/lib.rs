//! Media Allocator - weighted, quota-bounded media distribution
//!
//! Hands ingested media items to a pool of weighted recipients, reclaims
//! allocations nobody picked up in time, and issues signed one-shot pickup
//! links.
//!
//! ## Lifecycle
//!
//! ```text
//! queued --mint--> notified --consume--> picked_up
//!   |                 |                      |
//!   |                 +--expiry sweep--> expired (+ cooldown exclusion)
//!   +-----------------+--admin reject--> rejected
//!                                            |
//!        queued <--admin return_to_pool------+
//! ```
//!
//! ## Storage Layout
//!
//! ```text
//! <data_local_dir>/media-allocator/
//! ├── allocator.db      # SQLite: items, recipients, runs, allocations, exclusions, receipts
//! └── config.toml       # Configuration
//! ```
//!
//! ## Engines
//!
//! - **Distribution** ([`services::DistributionService`]): one weighted ring walk
//!   per pool item, bounded to a single revolution, with the cursor carried
//!   across the whole run.
//! - **Expiry** ([`services::ExpiryService`]): paged sweep of overdue notified
//!   allocations.
//! - **Links** ([`services::LinkService`]): mint, authorize and consume pickup links.

pub mod config;
pub mod error;
pub mod db;
pub mod services;

// Re-exports
pub use config::Config;
pub use error::{AllocatorError, LinkError};
pub use db::AllocatorDb;
pub use services::Services;
