//! Core domain model for the pallet relocation queue: typed table cells,
//! queue items, claim state and the reconciliation configuration.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

pub mod temporal;

pub const CRATE_NAME: &str = "palq-core";

/// A single typed value in a tabular store.
///
/// Stored as plain JSON so workbook files stay hand-editable: `null`, `true`,
/// `1.5`, `"2026-10-19T08:00:00Z"` and `"LINE-1"` all round-trip. Datetimes
/// are written in one canonical UTC form, and only a string in exactly that
/// form reads back as a datetime; any other string stays text byte for byte.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Cell {
    #[default]
    Empty,
    Bool(bool),
    Number(f64),
    DateTime(DateTime<Utc>),
    Text(String),
}

static EMPTY_CELL: Cell = Cell::Empty;

impl Cell {
    /// Text cell, collapsing whitespace-only input to `Empty`.
    pub fn text(value: impl Into<String>) -> Self {
        let value = value.into();
        if value.trim().is_empty() {
            Self::Empty
        } else {
            Self::Text(value)
        }
    }

    pub fn is_blank(&self) -> bool {
        match self {
            Self::Empty => true,
            Self::Text(s) => s.trim().is_empty(),
            _ => false,
        }
    }

    /// Display form used for identifiers, locations and free-text fields.
    pub fn as_text(&self) -> String {
        match self {
            Self::Empty => String::new(),
            Self::Bool(true) => "TRUE".to_string(),
            Self::Bool(false) => "FALSE".to_string(),
            Self::Number(n) if n.fract() == 0.0 && n.abs() < 1e15 => format!("{}", *n as i64),
            Self::Number(n) => n.to_string(),
            Self::DateTime(ts) => ts.to_rfc3339_opts(SecondsFormat::Secs, true),
            Self::Text(s) => s.clone(),
        }
    }

    pub fn as_bool(&self) -> bool {
        match self {
            Self::Bool(b) => *b,
            Self::Number(n) => *n != 0.0,
            Self::Text(s) => matches!(
                s.trim().to_ascii_lowercase().as_str(),
                "true" | "1" | "yes" | "y"
            ),
            Self::Empty | Self::DateTime(_) => false,
        }
    }
}

fn canonical_datetime(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

impl Cell {
    /// Reads a stored string: a canonical UTC datetime becomes `DateTime`,
    /// anything else is kept as text.
    fn from_stored(raw: String) -> Self {
        match DateTime::parse_from_rfc3339(&raw) {
            Ok(ts) => {
                let ts = ts.with_timezone(&Utc);
                if canonical_datetime(&ts) == raw {
                    Self::DateTime(ts)
                } else {
                    Self::Text(raw)
                }
            }
            Err(_) => Self::Text(raw),
        }
    }
}

impl Serialize for Cell {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Empty => serializer.serialize_unit(),
            Self::Bool(b) => serializer.serialize_bool(*b),
            Self::Number(n) => serializer.serialize_f64(*n),
            Self::DateTime(ts) => serializer.serialize_str(&canonical_datetime(ts)),
            Self::Text(s) => serializer.serialize_str(s),
        }
    }
}

impl<'de> Deserialize<'de> for Cell {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct CellVisitor;

        impl<'de> Visitor<'de> for CellVisitor {
            type Value = Cell;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("null, a boolean, a number or a string")
            }

            fn visit_unit<E: de::Error>(self) -> Result<Cell, E> {
                Ok(Cell::Empty)
            }

            fn visit_none<E: de::Error>(self) -> Result<Cell, E> {
                Ok(Cell::Empty)
            }

            fn visit_bool<E: de::Error>(self, v: bool) -> Result<Cell, E> {
                Ok(Cell::Bool(v))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Cell, E> {
                Ok(Cell::Number(v as f64))
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Cell, E> {
                Ok(Cell::Number(v as f64))
            }

            fn visit_f64<E: de::Error>(self, v: f64) -> Result<Cell, E> {
                Ok(Cell::Number(v))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Cell, E> {
                Ok(Cell::from_stored(v.to_string()))
            }

            fn visit_string<E: de::Error>(self, v: String) -> Result<Cell, E> {
                Ok(Cell::from_stored(v))
            }
        }

        deserializer.deserialize_any(CellVisitor)
    }
}

/// Position of a data cell. `row` is 0-based and excludes the header row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CellRef {
    pub row: usize,
    pub col: usize,
}

impl CellRef {
    pub fn new(row: usize, col: usize) -> Self {
        Self { row, col }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellUpdate {
    pub at: CellRef,
    pub value: Cell,
}

/// Header row plus data rows, as read from or written to a store.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Table {
    pub header: Vec<String>,
    #[serde(default)]
    pub rows: Vec<Vec<Cell>>,
}

impl Table {
    pub fn new(header: Vec<String>, rows: Vec<Vec<Cell>>) -> Self {
        Self { header, rows }
    }

    /// Column position by name, compared trimmed and case-insensitively.
    pub fn column(&self, name: &str) -> Option<usize> {
        let wanted = name.trim();
        self.header
            .iter()
            .position(|h| h.trim().eq_ignore_ascii_case(wanted))
    }

    /// Cell at a position; ragged or out-of-range positions read as `Empty`.
    pub fn cell(&self, row: usize, col: usize) -> &Cell {
        self.rows
            .get(row)
            .and_then(|r| r.get(col))
            .unwrap_or(&EMPTY_CELL)
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Writes a cell, widening a ragged row if needed. Returns `false` when
    /// the row does not exist.
    pub fn set(&mut self, at: CellRef, value: Cell) -> bool {
        let Some(row) = self.rows.get_mut(at.row) else {
            return false;
        };
        if row.len() <= at.col {
            row.resize(at.col + 1, Cell::Empty);
        }
        row[at.col] = value;
        true
    }
}

/// Lifecycle of a queue row's current task cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseStage {
    Unclaimed,
    Claimed,
    Completed,
}

/// The operator-owned fields that must survive a destructive queue rebuild.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ClaimState {
    pub claimed_by: String,
    pub claim_time: Cell,
    pub new_location: String,
    pub notes: String,
    pub claimed: bool,
    pub arrival_time: Cell,
}

impl ClaimState {
    /// Derived claimed flag: someone holds it or it already moved.
    pub fn is_claimed(&self) -> bool {
        !self.claimed_by.trim().is_empty() || self.is_completed()
    }

    pub fn is_completed(&self) -> bool {
        !self.new_location.trim().is_empty() || !self.arrival_time.is_blank()
    }

    pub fn stage(&self) -> LeaseStage {
        if self.is_completed() {
            LeaseStage::Completed
        } else if !self.claimed_by.trim().is_empty() {
            LeaseStage::Claimed
        } else {
            LeaseStage::Unclaimed
        }
    }
}

/// Identifier → claim state captured before a rebuild.
pub type PreviousStateMap = HashMap<String, ClaimState>;

/// One in-scope row of the authoritative export.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceRecord {
    pub id: String,
    pub location: String,
    pub due_at: Option<DateTime<Utc>>,
    pub kind: String,
    pub shift: String,
}

/// One row of the manual override table, with its data-row index.
#[derive(Debug, Clone, PartialEq)]
pub struct ManualRecord {
    pub row: usize,
    pub id: String,
    pub location: String,
    pub first_seen_at: Option<DateTime<Utc>>,
}

/// A ranked row of the rebuilt output queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkQueueItem {
    pub id: String,
    pub location: String,
    pub hours_remaining: f64,
    pub kind: String,
    pub shift: String,
    pub origin: String,
    pub claim: ClaimState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TableNames {
    pub source: String,
    pub manual: String,
    pub output: String,
}

impl Default for TableNames {
    fn default() -> Self {
        Self {
            source: "source_export".to_string(),
            manual: "manual_input".to_string(),
            output: "work_queue".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceColumns {
    pub id: String,
    pub location: String,
    pub due_at: String,
    pub kind: String,
    pub shift: String,
}

impl Default for SourceColumns {
    fn default() -> Self {
        Self {
            id: "ID".to_string(),
            location: "LOCATION".to_string(),
            due_at: "DUE_DATETIME".to_string(),
            kind: "TYPE".to_string(),
            shift: "SHIFT".to_string(),
        }
    }
}

/// Column names shared by every table that carries claim state.
#[derive(Debug, Clone, Copy)]
pub struct ClaimColumns<'a> {
    pub id: &'a str,
    pub claimed_by: &'a str,
    pub claim_time: &'a str,
    pub new_location: &'a str,
    pub notes: &'a str,
    pub claimed: &'a str,
    pub arrival_time: &'a str,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManualColumns {
    pub id: String,
    pub location: String,
    pub claimed_by: String,
    pub new_location: String,
    pub arrival_time: String,
    pub notes: String,
    pub claim_time: String,
    pub claimed: String,
    pub first_seen_at: String,
    pub manual_record_id: String,
}

impl Default for ManualColumns {
    fn default() -> Self {
        Self {
            id: "ID".to_string(),
            location: "LOCATION".to_string(),
            claimed_by: "CLAIMED_BY".to_string(),
            new_location: "NEW_LOCATION".to_string(),
            arrival_time: "ARRIVAL_TIME".to_string(),
            notes: "NOTES".to_string(),
            claim_time: "CLAIM_TIME".to_string(),
            claimed: "CLAIMED".to_string(),
            first_seen_at: "FIRST_SEEN_AT".to_string(),
            manual_record_id: "MANUAL_RECORD_ID".to_string(),
        }
    }
}

impl ManualColumns {
    pub fn claim_columns(&self) -> ClaimColumns<'_> {
        ClaimColumns {
            id: &self.id,
            claimed_by: &self.claimed_by,
            claim_time: &self.claim_time,
            new_location: &self.new_location,
            notes: &self.notes,
            claimed: &self.claimed,
            arrival_time: &self.arrival_time,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputColumns {
    pub id: String,
    pub location: String,
    pub hours_remaining: String,
    pub kind: String,
    pub shift: String,
    pub origin: String,
    pub claimed_by: String,
    pub claim_time: String,
    pub new_location: String,
    pub notes: String,
    pub claimed: String,
    pub arrival_time: String,
}

impl Default for OutputColumns {
    fn default() -> Self {
        Self {
            id: "ID".to_string(),
            location: "LOCATION".to_string(),
            hours_remaining: "HOURS_REMAINING".to_string(),
            kind: "TYPE".to_string(),
            shift: "SHIFT".to_string(),
            origin: "ORIGIN".to_string(),
            claimed_by: "CLAIMED_BY".to_string(),
            claim_time: "CLAIM_TIME".to_string(),
            new_location: "NEW_LOCATION".to_string(),
            notes: "NOTES".to_string(),
            claimed: "CLAIMED".to_string(),
            arrival_time: "ARRIVAL_TIME".to_string(),
        }
    }
}

impl OutputColumns {
    pub fn claim_columns(&self) -> ClaimColumns<'_> {
        ClaimColumns {
            id: &self.id,
            claimed_by: &self.claimed_by,
            claim_time: &self.claim_time,
            new_location: &self.new_location,
            notes: &self.notes,
            claimed: &self.claimed,
            arrival_time: &self.arrival_time,
        }
    }

    /// Header in the fixed output order.
    pub fn header(&self) -> Vec<String> {
        vec![
            self.id.clone(),
            self.location.clone(),
            self.hours_remaining.clone(),
            self.kind.clone(),
            self.shift.clone(),
            self.origin.clone(),
            self.claimed_by.clone(),
            self.claim_time.clone(),
            self.new_location.clone(),
            self.notes.clone(),
            self.claimed.clone(),
            self.arrival_time.clone(),
        ]
    }

    /// Renders an item in the same order as [`OutputColumns::header`].
    pub fn render(&self, item: &WorkQueueItem) -> Vec<Cell> {
        vec![
            Cell::text(item.id.clone()),
            Cell::text(item.location.clone()),
            Cell::Number(item.hours_remaining),
            Cell::text(item.kind.clone()),
            Cell::text(item.shift.clone()),
            Cell::text(item.origin.clone()),
            Cell::text(item.claim.claimed_by.clone()),
            item.claim.claim_time.clone(),
            Cell::text(item.claim.new_location.clone()),
            Cell::text(item.claim.notes.clone()),
            Cell::Bool(item.claim.claimed),
            item.claim.arrival_time.clone(),
        ]
    }
}

/// A TTL in minutes as a duration, or `None` when negative or too large to
/// represent.
pub fn checked_ttl(minutes: i64) -> Option<Duration> {
    if minutes < 0 {
        return None;
    }
    Duration::try_minutes(minutes)
}

/// Immutable settings for one engine instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    pub tables: TableNames,
    /// Regular expression a normalized source location must match.
    pub scope_pattern: String,
    /// Raw location code → display label; listed codes are always in scope.
    pub exceptions: BTreeMap<String, String>,
    pub claim_ttl_minutes: i64,
    pub manual_ttl_minutes: i64,
    pub manual_priority_score: f64,
    pub manual_type_label: String,
    pub required_source_columns: Vec<String>,
    pub lock_wait_secs: u64,
    pub source_columns: SourceColumns,
    pub manual_columns: ManualColumns,
    pub output_columns: OutputColumns,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        let source_columns = SourceColumns::default();
        Self {
            tables: TableNames::default(),
            scope_pattern: r"^LINE[-\s]*\d+$".to_string(),
            exceptions: BTreeMap::new(),
            claim_ttl_minutes: 30,
            manual_ttl_minutes: 120,
            manual_priority_score: -9999.0,
            manual_type_label: "MANUAL".to_string(),
            required_source_columns: vec![
                source_columns.id.clone(),
                source_columns.location.clone(),
            ],
            lock_wait_secs: 30,
            source_columns,
            manual_columns: ManualColumns::default(),
            output_columns: OutputColumns::default(),
        }
    }
}

impl ReconcileConfig {
    /// Claim TTL; out-of-range values saturate instead of panicking.
    pub fn claim_ttl(&self) -> Duration {
        checked_ttl(self.claim_ttl_minutes).unwrap_or(Duration::MAX)
    }

    pub fn manual_ttl(&self) -> Duration {
        checked_ttl(self.manual_ttl_minutes).unwrap_or(Duration::MAX)
    }

    pub fn lock_wait(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.lock_wait_secs)
    }
}
