//! Feeds for the notification and packaging collaborators

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::debug;

use crate::db::{allocations, items, recipients};
use crate::db::{Allocation, AllocationQuery, AllocationStatus, AllocatorDb, Item, Recipient};
use crate::error::AllocatorError;

use super::links::{LinkService, MintedLink};

/// Queued allocations for one recipient
#[derive(Debug, Clone, Serialize)]
pub struct NotificationBatch {
    pub recipient: Recipient,
    pub allocations: Vec<Allocation>,
}

/// One deliverable row for packaging
#[derive(Debug, Clone)]
pub struct PackagedAllocation {
    pub item: Item,
    pub link: MintedLink,
}

pub struct FeedService {
    db: Arc<AllocatorDb>,
    links: Arc<LinkService>,
}

impl FeedService {
    pub fn new(db: Arc<AllocatorDb>, links: Arc<LinkService>) -> Self {
        Self { db, links }
    }

    /// Queued allocations grouped by recipient, in recipient id order
    pub fn notification_batches(&self) -> Result<Vec<NotificationBatch>, AllocatorError> {
        self.db.with_conn(|conn| {
            let grouped = allocations::queued_by_recipient(conn)?;
            let mut batches = Vec::with_capacity(grouped.len());

            for (recipient_id, allocations) in grouped {
                let recipient = recipients::get_recipient(conn, recipient_id)?
                    .ok_or_else(|| AllocatorError::NotFound(format!("recipient {}", recipient_id)))?;
                batches.push(NotificationBatch { recipient, allocations });
            }
            Ok(batches)
        })
    }

    pub fn package(
        &self,
        run_id: i64,
        recipient_id: i64,
        ttl: Duration,
    ) -> Result<Vec<PackagedAllocation>, AllocatorError> {
        self.package_at(run_id, recipient_id, ttl, Utc::now())
    }

    /// Queued and notified allocations of one (run, recipient), each with a
    /// freshly minted link. Queued rows become notified as a result.
    pub fn package_at(
        &self,
        run_id: i64,
        recipient_id: i64,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<PackagedAllocation>, AllocatorError> {
        let rows = self.db.with_conn(|conn| {
            let rows = allocations::list_allocations(conn, &AllocationQuery {
                run_id: Some(run_id),
                recipient_id: Some(recipient_id),
                statuses: vec![AllocationStatus::Queued, AllocationStatus::Notified],
                ..Default::default()
            })?;

            rows.into_iter()
                .map(|allocation| {
                    let item = items::get_item(conn, allocation.item_id)?
                        .ok_or_else(|| AllocatorError::NotFound(format!("item {}", allocation.item_id)))?;
                    Ok((allocation.id, item))
                })
                .collect::<Result<Vec<_>, AllocatorError>>()
        })?;

        debug!(run_id, recipient_id, count = rows.len(), "Packaging allocations");

        rows.into_iter()
            .map(|(allocation_id, item)| {
                let link = self.links.mint_at(allocation_id, ttl, now)?;
                Ok(PackagedAllocation { item, link })
            })
            .collect()
    }
}
