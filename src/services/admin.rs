//! Admin service - catalog writes, display reads and the external transitions

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::info;

use crate::db::{allocations, exclusions, items, receipts, recipients, runs};
use crate::db::{
    Allocation, AllocationQuery, AllocationStatus, AllocatorDb, DbStats, ExclusionEntry, Item,
    NewItem, NewRecipient, PickupReceipt, Recipient, Run, RunKind,
};
use crate::error::AllocatorError;

use super::events::{AllocatorEvent, EventBus};

pub struct AdminService {
    db: Arc<AllocatorDb>,
    events: Arc<EventBus>,
}

impl AdminService {
    pub fn new(db: Arc<AllocatorDb>, events: Arc<EventBus>) -> Self {
        Self { db, events }
    }

    // =========================================================================
    // Catalog
    // =========================================================================

    pub fn add_recipient(&self, input: &NewRecipient) -> Result<Recipient, AllocatorError> {
        let recipient = self.db.with_conn(|conn| recipients::insert_recipient(conn, input))?;
        info!(recipient_id = recipient.id, weight = recipient.weight, quota = recipient.weekly_quota, "Recipient added");
        Ok(recipient)
    }

    pub fn set_recipient_active(&self, recipient_id: i64, active: bool) -> Result<(), AllocatorError> {
        self.db.with_conn(|conn| recipients::set_active(conn, recipient_id, active))
    }

    pub fn add_item(&self, input: &NewItem) -> Result<Item, AllocatorError> {
        self.db.with_conn(|conn| items::insert_item(conn, input))
    }

    // =========================================================================
    // External transitions
    // =========================================================================

    pub fn reject(&self, allocation_id: i64) -> Result<Allocation, AllocatorError> {
        self.reject_at(allocation_id, Utc::now())
    }

    /// queued|notified -> rejected
    pub fn reject_at(&self, allocation_id: i64, now: DateTime<Utc>) -> Result<Allocation, AllocatorError> {
        let allocation = self.db.with_conn(|conn| {
            let current = require_allocation(conn, allocation_id)?;
            let from = current.status;

            let moved = matches!(from, AllocationStatus::Queued | AllocationStatus::Notified)
                && allocations::transition(conn, allocation_id, from, AllocationStatus::Rejected, now)?;
            if !moved {
                return Err(AllocatorError::InvalidTransition {
                    id: allocation_id,
                    from: from.to_string(),
                    to: AllocationStatus::Rejected.to_string(),
                });
            }
            require_allocation(conn, allocation_id)
        })?;

        info!(allocation_id, "Allocation rejected");
        self.events.emit(AllocatorEvent::AllocationRejected { allocation_id });
        Ok(allocation)
    }

    pub fn return_to_pool(&self, allocation_id: i64) -> Result<Allocation, AllocatorError> {
        self.return_to_pool_at(allocation_id, Utc::now())
    }

    /// picked_up -> queued, clearing token, deadline and notification stamp
    pub fn return_to_pool_at(&self, allocation_id: i64, now: DateTime<Utc>) -> Result<Allocation, AllocatorError> {
        let allocation = self.db.with_conn(|conn| {
            if !allocations::return_to_pool(conn, allocation_id, now)? {
                let current = require_allocation(conn, allocation_id)?;
                return Err(AllocatorError::InvalidTransition {
                    id: allocation_id,
                    from: current.status.to_string(),
                    to: AllocationStatus::Queued.to_string(),
                });
            }
            require_allocation(conn, allocation_id)
        })?;

        info!(allocation_id, "Allocation returned to pool");
        self.events.emit(AllocatorEvent::AllocationReturned { allocation_id });
        Ok(allocation)
    }

    // =========================================================================
    // Display reads
    // =========================================================================

    pub fn get_allocation(&self, allocation_id: i64) -> Result<Option<Allocation>, AllocatorError> {
        self.db.with_conn(|conn| allocations::get_allocation(conn, allocation_id))
    }

    pub fn list_allocations(&self, query: &AllocationQuery) -> Result<Vec<Allocation>, AllocatorError> {
        self.db.with_conn(|conn| allocations::list_allocations(conn, query))
    }

    pub fn get_run(&self, run_id: i64) -> Result<Option<Run>, AllocatorError> {
        self.db.with_conn(|conn| runs::get_run(conn, run_id))
    }

    pub fn last_completed_run(&self, kind: RunKind) -> Result<Option<Run>, AllocatorError> {
        self.db.with_conn(|conn| runs::last_completed_run(conn, kind))
    }

    /// Most recent first
    pub fn list_runs(&self, kind: Option<RunKind>, limit: u32) -> Result<Vec<Run>, AllocatorError> {
        self.db.with_conn(|conn| runs::list_runs(conn, kind, limit))
    }

    pub fn list_exclusions(&self, active_at: Option<DateTime<Utc>>) -> Result<Vec<ExclusionEntry>, AllocatorError> {
        self.db.with_conn(|conn| exclusions::list_exclusions(conn, active_at))
    }

    pub fn receipts(&self, allocation_id: i64) -> Result<Vec<PickupReceipt>, AllocatorError> {
        self.db.with_conn(|conn| receipts::receipts_for_allocation(conn, allocation_id))
    }

    pub fn stats(&self) -> Result<DbStats, AllocatorError> {
        self.db.stats()
    }
}

fn require_allocation(conn: &rusqlite::Connection, allocation_id: i64) -> Result<Allocation, AllocatorError> {
    allocations::get_allocation(conn, allocation_id)?
        .ok_or_else(|| AllocatorError::NotFound(format!("allocation {}", allocation_id)))
}
