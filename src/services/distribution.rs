//! Distribution engine
//!
//! Places each pool item on at most one recipient by walking the weighted
//! ring under per-run quotas and active exclusions. A run is one `IMMEDIATE`
//! transaction: either every allocation and the finalized run row commit
//! together, or nothing does and the run row stays unfinalized.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, TransactionBehavior};
use serde::Serialize;
use serde_json::json;
use tracing::{debug, error, info, info_span};

use crate::db::runs::{self, PoolWatermark};
use crate::db::{allocations, exclusions, items, recipients};
use crate::db::{Allocation, AllocatorDb, Item, Recipient, Run, RunKind};
use crate::error::AllocatorError;

use super::events::{AllocatorEvent, EventBus};
use super::ring::WeightedRing;

/// Per-run knobs
#[derive(Debug, Clone, Copy, Default)]
pub struct DistributionOptions {
    /// Replace every recipient's weekly quota with this cap for one run
    pub quota_override: Option<u32>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DistributionSummary {
    pub assigned: u64,
    pub skipped: u64,
}

impl DistributionSummary {
    /// Stable run stats shape; keys may be added, never renamed
    pub fn to_stats(&self) -> serde_json::Value {
        json!({ "assigned": self.assigned, "skipped": self.skipped })
    }
}

/// Why a run had nothing to place
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NothingToDo {
    EmptyPool,
    NoRecipients,
}

#[derive(Debug, Clone)]
pub struct DistributionReport {
    pub run: Run,
    pub summary: DistributionSummary,
    pub allocations: Vec<Allocation>,
    /// Items no recipient could take this run; they are not requeued
    pub skipped_items: Vec<i64>,
    /// The run ended early because every quota reached zero
    pub stopped_on_quota: bool,
}

#[derive(Debug, Clone)]
pub enum DistributionOutcome {
    /// The run was recorded with a zero summary
    Idle { run: Run, reason: NothingToDo },
    Distributed(DistributionReport),
}

impl DistributionOutcome {
    pub fn run(&self) -> &Run {
        match self {
            DistributionOutcome::Idle { run, .. } => run,
            DistributionOutcome::Distributed(report) => &report.run,
        }
    }

    pub fn summary(&self) -> DistributionSummary {
        match self {
            DistributionOutcome::Idle { .. } => DistributionSummary::default(),
            DistributionOutcome::Distributed(report) => report.summary,
        }
    }
}

/// Run-scoped placement state: the ring cursor and remaining quotas.
/// Lives exactly as long as one distribution run.
struct RunPlacer<'a> {
    recipients: &'a [Recipient],
    remaining: Vec<i64>,
    ring: WeightedRing,
}

impl<'a> RunPlacer<'a> {
    fn new(recipients: &'a [Recipient], quota_override: Option<u32>) -> Self {
        let remaining = recipients
            .iter()
            .map(|r| i64::from(quota_override.unwrap_or(r.weekly_quota)))
            .collect();

        Self {
            recipients,
            remaining,
            ring: WeightedRing::build(recipients),
        }
    }

    /// Pick the recipient index for `item`, or None after a full revolution
    fn place(&mut self, conn: &Connection, item: &Item, now: DateTime<Utc>) -> Result<Option<usize>, AllocatorError> {
        let excluded = exclusions::active_for_item(conn, item.id, now)?;
        let holders = allocations::recipients_holding_item(conn, item.id)?;

        let recipients = self.recipients;
        let remaining = &self.remaining;
        let chosen = self.ring.next_accepted(|idx| {
            let recipient_id = recipients[idx].id;
            remaining[idx] > 0 && !excluded.contains(&recipient_id) && !holders.contains(&recipient_id)
        });

        Ok(chosen)
    }

    fn take(&mut self, idx: usize) {
        self.remaining[idx] -= 1;
    }

    fn exhausted(&self) -> bool {
        self.remaining.iter().all(|q| *q <= 0)
    }
}

/// Distribution engine service
pub struct DistributionService {
    db: Arc<AllocatorDb>,
    events: Arc<EventBus>,
}

impl DistributionService {
    pub fn new(db: Arc<AllocatorDb>, events: Arc<EventBus>) -> Self {
        Self { db, events }
    }

    pub fn run(&self, options: DistributionOptions) -> Result<DistributionOutcome, AllocatorError> {
        self.run_at(options, Utc::now())
    }

    /// Execute one distribution run as of `now`
    pub fn run_at(
        &self,
        options: DistributionOptions,
        now: DateTime<Utc>,
    ) -> Result<DistributionOutcome, AllocatorError> {
        // Committed on its own so a failed run remains visible as unfinalized
        let run = self.db.with_conn(|conn| runs::create_run(conn, RunKind::Distribution, now))?;

        let span = info_span!("distribution_run", run_id = run.id, correlation_id = %run.correlation_id);
        let _guard = span.enter();

        let result = self.db.with_conn_mut(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let outcome = distribute(&tx, &run, options, now)?;
            tx.commit()?;
            Ok(outcome)
        });

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(error = %e, "Distribution run failed; run left unfinalized");
                return Err(e);
            }
        };

        match &outcome {
            DistributionOutcome::Idle { reason, .. } => {
                info!(reason = ?reason, "Nothing to distribute");
            }
            DistributionOutcome::Distributed(report) => {
                info!(
                    assigned = report.summary.assigned,
                    skipped = report.summary.skipped,
                    stopped_on_quota = report.stopped_on_quota,
                    "Distribution run complete"
                );
                for allocation in &report.allocations {
                    self.events.emit(AllocatorEvent::AllocationQueued {
                        allocation_id: allocation.id,
                        item_id: allocation.item_id,
                        recipient_id: allocation.recipient_id,
                        run_id: report.run.id,
                    });
                }
            }
        }

        self.events.emit(AllocatorEvent::RunFinished {
            run_id: outcome.run().id,
            kind: RunKind::Distribution,
            stats: outcome.summary().to_stats(),
        });

        Ok(outcome)
    }
}

fn distribute(
    conn: &Connection,
    run: &Run,
    options: DistributionOptions,
    now: DateTime<Utc>,
) -> Result<DistributionOutcome, AllocatorError> {
    let watermark = runs::distribution_watermark(conn)?;
    let pool = items::pending_pool(conn, watermark, now)?;
    let recipients = recipients::list_active_recipients(conn)?;

    let idle = if recipients.is_empty() {
        Some(NothingToDo::NoRecipients)
    } else if pool.is_empty() {
        Some(NothingToDo::EmptyPool)
    } else {
        None
    };

    if let Some(reason) = idle {
        // No watermark: the next run still sees whatever this one did not walk
        let run = runs::finalize_run(conn, run.id, now, &DistributionSummary::default().to_stats(), None)?;
        return Ok(DistributionOutcome::Idle { run, reason });
    }

    debug!(pool = pool.len(), recipients = recipients.len(), "Walking pool");

    let mut placer = RunPlacer::new(&recipients, options.quota_override);
    let mut created = Vec::new();
    let mut skipped_items = Vec::new();
    let mut stopped_on_quota = false;

    for (pos, item) in pool.iter().enumerate() {
        match placer.place(conn, item, now)? {
            Some(idx) => {
                let allocation = allocations::insert_allocation(conn, item.id, recipients[idx].id, run.id, now)?;
                placer.take(idx);
                created.push(allocation);

                if placer.exhausted() {
                    // The rest of the pool is not walked but still counts as skipped
                    let rest = &pool[pos + 1..];
                    skipped_items.extend(rest.iter().map(|i| i.id));
                    stopped_on_quota = true;
                    debug!(item_id = item.id, unwalked = rest.len(), "All quotas exhausted; stopping");
                    break;
                }
            }
            None => {
                debug!(item_id = item.id, "No eligible recipient; skipping item");
                skipped_items.push(item.id);
            }
        }
    }

    let summary = DistributionSummary {
        assigned: created.len() as u64,
        skipped: skipped_items.len() as u64,
    };
    let mark = PoolWatermark {
        at: now,
        item_id: items::newest_item_id(conn, now)?.max(watermark.and_then(|w| w.item_id)),
    };
    let run = runs::finalize_run(conn, run.id, now, &summary.to_stats(), Some(mark))?;

    Ok(DistributionOutcome::Distributed(DistributionReport {
        run,
        summary,
        allocations: created,
        skipped_items,
        stopped_on_quota,
    }))
}
