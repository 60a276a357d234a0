use chrono::{DateTime, Duration, Utc};
use palq_core::temporal::{parse_timestamp, ttl_expired};
use palq_core::{Cell, CellRef, CellUpdate, LeaseStage, OutputColumns, Table};
use palq_ingest::{claim_at, normalize};

/// Cell writes that release every expired claim in one batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LeasePlan {
    pub updates: Vec<CellUpdate>,
    pub released_ids: Vec<String>,
}

/// Finds claimed, not completed rows whose claim time is older than `ttl`.
///
/// A table without claimed-by or claim-time columns has nothing to release.
/// Completed rows (new location or arrival time set) are never touched.
pub fn plan_release(
    table: &Table,
    columns: &OutputColumns,
    ttl: Duration,
    now: DateTime<Utc>,
) -> LeasePlan {
    let mut plan = LeasePlan::default();
    let (Some(claimed_by_col), Some(claim_time_col)) =
        (table.column(&columns.claimed_by), table.column(&columns.claim_time))
    else {
        return plan;
    };
    let id_col = table.column(&columns.id);
    let claimed_col = table.column(&columns.claimed);

    for row in 0..table.rows.len() {
        let claim = claim_at(table, row, columns.claim_columns());
        if claim.stage() != LeaseStage::Claimed {
            continue;
        }
        let Some(claimed_at) = parse_timestamp(&claim.claim_time) else {
            continue;
        };
        if !ttl_expired(claimed_at, now, ttl) {
            continue;
        }

        plan.updates.push(CellUpdate {
            at: CellRef::new(row, claimed_by_col),
            value: Cell::Empty,
        });
        plan.updates.push(CellUpdate {
            at: CellRef::new(row, claim_time_col),
            value: Cell::Empty,
        });
        if let Some(col) = claimed_col {
            plan.updates.push(CellUpdate {
                at: CellRef::new(row, col),
                value: Cell::Bool(false),
            });
        }
        let id = id_col
            .map(|c| normalize(&table.cell(row, c).as_text()))
            .unwrap_or_default();
        plan.released_ids.push(id);
    }
    plan
}
