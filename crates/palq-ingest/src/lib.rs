//! Table ingesters: the authoritative export, the manual override table and
//! the claim snapshot taken before a rebuild.

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};
use palq_core::temporal::{hours_until, parse_timestamp, ttl_expired};
use palq_core::{
    CellRef, ClaimColumns, ClaimState, ManualRecord, PreviousStateMap, ReconcileConfig,
    SourceRecord, Table, WorkQueueItem,
};
use regex::Regex;
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "palq-ingest";

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("table `{table}` is missing required columns: {}", .missing.join(", "))]
    MissingColumns { table: String, missing: Vec<String> },
    #[error("invalid scope pattern: {0}")]
    InvalidScopePattern(#[from] regex::Error),
}

/// Upper-cased, trimmed form used for identifiers and locations.
pub fn normalize(raw: &str) -> String {
    raw.trim().to_uppercase()
}

/// Decides which locations belong in the queue and how they are labelled.
#[derive(Debug, Clone)]
pub struct ScopeFilter {
    pattern: Regex,
    exceptions: BTreeMap<String, String>,
}

impl ScopeFilter {
    pub fn new(pattern: &str, exceptions: &BTreeMap<String, String>) -> Result<Self, IngestError> {
        Ok(Self {
            pattern: Regex::new(pattern)?,
            exceptions: exceptions
                .iter()
                .map(|(code, label)| (normalize(code), label.clone()))
                .collect(),
        })
    }

    pub fn from_config(config: &ReconcileConfig) -> Result<Self, IngestError> {
        Self::new(&config.scope_pattern, &config.exceptions)
    }

    pub fn accepts(&self, location: &str) -> bool {
        let location = normalize(location);
        self.exceptions.contains_key(&location) || self.pattern.is_match(&location)
    }

    /// Exception label, else `Line {n}` from the trailing numeric token, else
    /// the normalized location itself.
    pub fn origin_for(&self, location: &str) -> String {
        let location = normalize(location);
        if let Some(label) = self.exceptions.get(&location) {
            return label.clone();
        }
        location
            .split(|c: char| c == '-' || c.is_whitespace())
            .last()
            .and_then(|token| token.parse::<i64>().ok())
            .map(|n| format!("Line {n}"))
            .unwrap_or(location)
    }
}

/// Result of reading the authoritative export.
#[derive(Debug, Clone, Default)]
pub struct SourceBatch {
    pub items: Vec<WorkQueueItem>,
    /// Every in-scope identifier; the manual sweep treats these as superseded.
    pub accepted_ids: HashSet<String>,
    pub skipped_rows: usize,
    pub out_of_scope: usize,
}

pub struct SourceIngester<'a> {
    config: &'a ReconcileConfig,
    scope: &'a ScopeFilter,
}

impl<'a> SourceIngester<'a> {
    pub fn new(config: &'a ReconcileConfig, scope: &'a ScopeFilter) -> Self {
        Self { config, scope }
    }

    /// Fails without side effects when a required column is missing.
    pub fn ingest(&self, table: &Table, now: DateTime<Utc>) -> Result<SourceBatch, IngestError> {
        let columns = &self.config.source_columns;
        let mut missing = Vec::new();
        for name in self
            .config
            .required_source_columns
            .iter()
            .chain([&columns.id, &columns.location])
        {
            if table.column(name).is_none() && !missing.contains(name) {
                missing.push(name.clone());
            }
        }
        let (Some(id_col), Some(location_col)) =
            (table.column(&columns.id), table.column(&columns.location))
        else {
            return Err(self.missing(missing));
        };
        if !missing.is_empty() {
            return Err(self.missing(missing));
        }
        let due_col = table.column(&columns.due_at);
        let kind_col = table.column(&columns.kind);
        let shift_col = table.column(&columns.shift);

        let mut batch = SourceBatch::default();
        for row in 0..table.rows.len() {
            let id = normalize(&table.cell(row, id_col).as_text());
            let location = normalize(&table.cell(row, location_col).as_text());
            if id.is_empty() || location.is_empty() {
                batch.skipped_rows += 1;
                continue;
            }
            if !self.scope.accepts(&location) {
                batch.out_of_scope += 1;
                continue;
            }

            let text = |col: Option<usize>| {
                col.map(|c| table.cell(row, c).as_text().trim().to_string())
                    .unwrap_or_default()
            };
            let record = SourceRecord {
                id,
                location,
                due_at: due_col.and_then(|c| parse_timestamp(table.cell(row, c))),
                kind: text(kind_col),
                shift: text(shift_col),
            };
            batch.accepted_ids.insert(record.id.clone());
            batch.items.push(self.item_for(record, now));
        }

        debug!(
            accepted = batch.items.len(),
            skipped = batch.skipped_rows,
            out_of_scope = batch.out_of_scope,
            "source export ingested"
        );
        Ok(batch)
    }

    fn item_for(&self, record: SourceRecord, now: DateTime<Utc>) -> WorkQueueItem {
        WorkQueueItem {
            hours_remaining: record.due_at.map_or(0.0, |due| hours_until(due, now)),
            origin: self.scope.origin_for(&record.location),
            id: record.id,
            location: record.location,
            kind: record.kind,
            shift: record.shift,
            claim: ClaimState::default(),
        }
    }

    fn missing(&self, missing: Vec<String>) -> IngestError {
        IngestError::MissingColumns {
            table: self.config.tables.source.clone(),
            missing,
        }
    }
}

/// Why the manual table contributed nothing this run. Not an error: the
/// source sync still proceeds.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ManualSkip {
    #[error("manual table is absent")]
    Absent,
    #[error("manual table has no rows")]
    Empty,
    #[error("manual table is missing columns: {}", .0.join(", "))]
    MissingColumns(Vec<String>),
}

/// Every change the sweep wants to make, decided in one read pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ManualPlan {
    /// First-seen cells to stamp with the run time.
    pub stamps: Vec<CellRef>,
    /// Data-row indices to delete, highest first.
    pub deletions: Vec<usize>,
    pub items: Vec<WorkQueueItem>,
    pub superseded: usize,
    pub expired: usize,
}

pub struct ManualSweeper<'a> {
    config: &'a ReconcileConfig,
    scope: &'a ScopeFilter,
}

impl<'a> ManualSweeper<'a> {
    pub fn new(config: &'a ReconcileConfig, scope: &'a ScopeFilter) -> Self {
        Self { config, scope }
    }

    pub fn plan(
        &self,
        table: Option<&Table>,
        accepted_ids: &HashSet<String>,
        now: DateTime<Utc>,
    ) -> Result<ManualPlan, ManualSkip> {
        let table = table.ok_or(ManualSkip::Absent)?;
        let columns = &self.config.manual_columns;
        let id_col = table.column(&columns.id);
        let location_col = table.column(&columns.location);
        let (id_col, location_col) = match (id_col, location_col) {
            (Some(id), Some(location)) => (id, location),
            (id, location) => {
                let mut missing = Vec::new();
                if id.is_none() {
                    missing.push(columns.id.clone());
                }
                if location.is_none() {
                    missing.push(columns.location.clone());
                }
                return Err(ManualSkip::MissingColumns(missing));
            }
        };
        if table.is_empty() {
            return Err(ManualSkip::Empty);
        }
        let seen_col = table.column(&columns.first_seen_at);
        let ttl = self.config.manual_ttl();

        let mut plan = ManualPlan::default();
        for row in 0..table.rows.len() {
            let id = normalize(&table.cell(row, id_col).as_text());
            if id.is_empty() {
                continue;
            }
            if accepted_ids.contains(&id) {
                plan.deletions.push(row);
                plan.superseded += 1;
                continue;
            }

            let record = ManualRecord {
                row,
                id,
                location: normalize(&table.cell(row, location_col).as_text()),
                first_seen_at: seen_col.and_then(|c| parse_timestamp(table.cell(row, c))),
            };
            if let Some(col) = seen_col {
                match record.first_seen_at {
                    None => plan.stamps.push(CellRef::new(record.row, col)),
                    Some(seen) if ttl_expired(seen, now, ttl) => {
                        plan.deletions.push(record.row);
                        plan.expired += 1;
                        continue;
                    }
                    Some(_) => {}
                }
            }
            if !record.location.is_empty() {
                plan.items.push(self.item_for(record));
            }
        }
        plan.deletions.sort_unstable_by(|a, b| b.cmp(a));
        Ok(plan)
    }

    fn item_for(&self, record: ManualRecord) -> WorkQueueItem {
        WorkQueueItem {
            hours_remaining: self.config.manual_priority_score,
            kind: self.config.manual_type_label.clone(),
            shift: String::new(),
            origin: self.scope.origin_for(&record.location),
            id: record.id,
            location: record.location,
            claim: ClaimState::default(),
        }
    }
}

/// Claim fields of one data row; absent columns read as empty/false.
pub fn claim_at(table: &Table, row: usize, columns: ClaimColumns<'_>) -> ClaimState {
    let text = |name: &str| {
        table
            .column(name)
            .map(|c| table.cell(row, c).as_text().trim().to_string())
            .unwrap_or_default()
    };
    let raw = |name: &str| {
        table
            .column(name)
            .map(|c| table.cell(row, c).clone())
            .unwrap_or_default()
    };
    ClaimState {
        claimed_by: text(columns.claimed_by),
        claim_time: raw(columns.claim_time),
        new_location: text(columns.new_location),
        notes: text(columns.notes),
        claimed: raw(columns.claimed).as_bool(),
        arrival_time: raw(columns.arrival_time),
    }
}

/// Identifier-keyed claim state of a whole table. A table without an
/// identifier column yields an empty map.
pub fn extract_claims(table: &Table, columns: ClaimColumns<'_>) -> PreviousStateMap {
    let mut map = PreviousStateMap::new();
    let Some(id_col) = table.column(columns.id) else {
        return map;
    };
    for row in 0..table.rows.len() {
        let id = normalize(&table.cell(row, id_col).as_text());
        if !id.is_empty() {
            map.insert(id, claim_at(table, row, columns));
        }
    }
    map
}

/// Overlays the manual snapshot on the queue snapshot. Manual values win
/// field by field; a blank manual field keeps the queue's value. `claimed`
/// is left alone since ranking re-derives it.
pub fn merge_previous(queue: PreviousStateMap, manual: PreviousStateMap) -> PreviousStateMap {
    let mut merged = queue;
    for (id, top) in manual {
        let entry = merged.entry(id).or_default();
        if !top.claimed_by.is_empty() {
            entry.claimed_by = top.claimed_by;
        }
        if !top.claim_time.is_blank() {
            entry.claim_time = top.claim_time;
        }
        if !top.new_location.is_empty() {
            entry.new_location = top.new_location;
        }
        if !top.notes.is_empty() {
            entry.notes = top.notes;
        }
        if !top.arrival_time.is_blank() {
            entry.arrival_time = top.arrival_time;
        }
    }
    merged
}
