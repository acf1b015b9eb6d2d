//! Expiry engine
//!
//! Reclaims notified allocations whose pickup deadline passed and bars the
//! same recipient from the item for a cooldown. Only `notified` rows are
//! touched. Each (recipient, item) upsert overwrites the previous bar, so a
//! repeated sweep is harmless.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rusqlite::{Connection, TransactionBehavior};
use serde::Serialize;
use serde_json::json;
use tracing::{debug, error, info, info_span};

use crate::db::{allocations, exclusions, runs};
use crate::db::{Allocation, AllocationStatus, AllocatorDb, Run, RunKind};
use crate::error::AllocatorError;

use super::events::{AllocatorEvent, EventBus};

#[derive(Debug, Clone, Copy)]
pub struct ExpiryOptions {
    pub cooldown: Duration,
    pub page_size: usize,
}

impl Default for ExpiryOptions {
    fn default() -> Self {
        Self {
            cooldown: Duration::days(14),
            page_size: 500,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ExpirySummary {
    pub expired: u64,
}

impl ExpirySummary {
    pub fn to_stats(&self) -> serde_json::Value {
        json!({ "expired": self.expired })
    }
}

#[derive(Debug, Clone)]
pub struct ExpiryReport {
    pub run: Run,
    pub summary: ExpirySummary,
    pub expired: Vec<Allocation>,
    /// End of the cooldown imposed on every expired pair
    pub exclusions_until: DateTime<Utc>,
}

/// Expiry engine service
pub struct ExpiryService {
    db: Arc<AllocatorDb>,
    events: Arc<EventBus>,
}

impl ExpiryService {
    pub fn new(db: Arc<AllocatorDb>, events: Arc<EventBus>) -> Self {
        Self { db, events }
    }

    pub fn run(&self, options: ExpiryOptions) -> Result<ExpiryReport, AllocatorError> {
        self.run_at(options, Utc::now())
    }

    /// Execute one sweep as of `now`
    pub fn run_at(&self, options: ExpiryOptions, now: DateTime<Utc>) -> Result<ExpiryReport, AllocatorError> {
        if options.page_size == 0 {
            return Err(AllocatorError::InvalidInput("expiry page size must be positive".into()));
        }

        let run = self.db.with_conn(|conn| runs::create_run(conn, RunKind::Expiry, now))?;

        let span = info_span!("expiry_run", run_id = run.id, correlation_id = %run.correlation_id);
        let _guard = span.enter();

        let result = self.db.with_conn_mut(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let expired = sweep(&tx, options, now)?;
            let summary = ExpirySummary {
                expired: expired.len() as u64,
            };
            let run = runs::finalize_run(&tx, run.id, now, &summary.to_stats(), None)?;
            tx.commit()?;
            Ok(ExpiryReport {
                run,
                summary,
                expired,
                exclusions_until: now + options.cooldown,
            })
        });

        let report = match result {
            Ok(report) => report,
            Err(e) => {
                error!(error = %e, "Expiry run failed; run left unfinalized");
                return Err(e);
            }
        };

        info!(expired = report.summary.expired, "Expiry run complete");

        for allocation in &report.expired {
            self.events.emit(AllocatorEvent::AllocationExpired {
                allocation_id: allocation.id,
                item_id: allocation.item_id,
                recipient_id: allocation.recipient_id,
            });
            self.events.emit(AllocatorEvent::ExclusionImposed {
                recipient_id: allocation.recipient_id,
                item_id: allocation.item_id,
                until: report.exclusions_until,
            });
        }
        self.events.emit(AllocatorEvent::RunFinished {
            run_id: report.run.id,
            kind: RunKind::Expiry,
            stats: report.summary.to_stats(),
        });

        Ok(report)
    }
}

fn sweep(conn: &Connection, options: ExpiryOptions, now: DateTime<Utc>) -> Result<Vec<Allocation>, AllocatorError> {
    let until = now + options.cooldown;
    let mut expired = Vec::new();
    let mut after_id = 0;

    loop {
        let page = allocations::overdue_page(conn, now, after_id, options.page_size)?;
        let page_len = page.len();

        for allocation in page {
            after_id = allocation.id;

            if !allocations::transition(conn, allocation.id, AllocationStatus::Notified, AllocationStatus::Expired, now)? {
                continue;
            }
            exclusions::upsert_exclusion(conn, allocation.recipient_id, allocation.item_id, until, now)?;
            debug!(
                allocation_id = allocation.id,
                recipient_id = allocation.recipient_id,
                item_id = allocation.item_id,
                "Allocation expired; exclusion imposed"
            );

            expired.push(Allocation {
                status: AllocationStatus::Expired,
                updated_at: now,
                ..allocation
            });
        }

        if page_len < options.page_size {
            break;
        }
    }

    Ok(expired)
}
