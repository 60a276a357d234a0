//! Queue reconciliation and lease release, run under the document lock.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Utc};
use palq_core::{checked_ttl, Cell, ReconcileConfig, Table};
use palq_ingest::{
    extract_claims, merge_previous, ManualPlan, ManualSkip, ManualSweeper, ScopeFilter,
    SourceIngester,
};
use palq_storage::{DocumentLock, FileLock, TabularStore, WorkbookStore};
use serde::Serialize;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

mod config;
mod lease;
mod rank;

pub use config::{load_reconcile_config, SyncConfig};
pub use lease::{plan_release, LeasePlan};
pub use rank::merge_and_rank;

pub const CRATE_NAME: &str = "palq-sync";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Reconcile,
    ReleaseLeases,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reconcile => f.write_str("reconcile"),
            Self::ReleaseLeases => f.write_str("release-leases"),
        }
    }
}

/// What the operator is told when an operation ends.
#[derive(Debug, Clone, PartialEq)]
pub enum Notice {
    Completed { operation: Operation, count: usize },
    Busy { operation: Operation },
    Failed { operation: Operation, message: String },
}

impl fmt::Display for Notice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed {
                operation: Operation::Reconcile,
                count,
            } => write!(f, "queue rebuilt: {count} tasks"),
            Self::Completed {
                operation: Operation::ReleaseLeases,
                count,
            } => write!(f, "released {count} stale claims"),
            Self::Busy { operation } => {
                write!(f, "{operation} skipped: another run holds the lock; try again shortly")
            }
            Self::Failed { operation, message } => write!(f, "{operation} failed: {message}"),
        }
    }
}

pub trait Notifier: Send + Sync {
    fn notify(&self, notice: &Notice);
}

#[derive(Debug, Default)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, notice: &Notice) {
        match notice {
            Notice::Completed { .. } => info!(%notice, "operation completed"),
            Notice::Busy { .. } => warn!(%notice, "operation skipped"),
            Notice::Failed { .. } => error!(%notice, "operation failed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome<T> {
    Completed(T),
    /// The lock was not acquired in time; nothing was read or written.
    Busy,
}

impl<T> RunOutcome<T> {
    pub fn completed(self) -> Option<T> {
        match self {
            Self::Completed(value) => Some(value),
            Self::Busy => None,
        }
    }
}

trait Counted {
    fn count(&self) -> usize;
}

#[derive(Debug, Clone, Serialize)]
pub struct ReconcileSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub tasks_written: usize,
    pub source_items: usize,
    pub manual_items: usize,
    pub superseded: usize,
    pub expired: usize,
    pub stamped: usize,
    pub skipped_rows: usize,
    pub out_of_scope: usize,
    /// Set when the manual table contributed nothing this run.
    pub manual_skipped: Option<String>,
}

impl Counted for ReconcileSummary {
    fn count(&self) -> usize {
        self.tasks_written
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ReleaseSummary {
    pub run_id: Uuid,
    pub released: usize,
    pub released_ids: Vec<String>,
}

impl Counted for ReleaseSummary {
    fn count(&self) -> usize {
        self.released
    }
}

pub struct QueueEngine {
    store: Arc<dyn TabularStore>,
    lock: Arc<dyn DocumentLock>,
    notifier: Box<dyn Notifier>,
    config: ReconcileConfig,
    scope: ScopeFilter,
}

impl QueueEngine {
    /// Rejects an invalid scope pattern or TTL up front.
    pub fn new(
        store: Arc<dyn TabularStore>,
        lock: Arc<dyn DocumentLock>,
        config: ReconcileConfig,
    ) -> Result<Self> {
        let scope = ScopeFilter::from_config(&config).context("compiling scope filter")?;
        for (name, minutes) in [
            ("claim_ttl_minutes", config.claim_ttl_minutes),
            ("manual_ttl_minutes", config.manual_ttl_minutes),
        ] {
            if checked_ttl(minutes).is_none() {
                bail!("{name} must be a non-negative number of minutes in range, got {minutes}");
            }
        }
        Ok(Self {
            store,
            lock,
            notifier: Box::<TracingNotifier>::default(),
            config,
            scope,
        })
    }

    pub fn with_notifier(mut self, notifier: Box<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn config(&self) -> &ReconcileConfig {
        &self.config
    }

    /// Current output table, read without taking the lock.
    pub async fn read_queue(&self) -> Result<Option<Table>> {
        self.store
            .read_table(&self.config.tables.output)
            .await
            .with_context(|| format!("reading table `{}`", self.config.tables.output))
    }

    pub async fn reconcile(&self) -> Result<RunOutcome<ReconcileSummary>> {
        self.reconcile_at(Utc::now()).await
    }

    pub async fn reconcile_at(&self, now: DateTime<Utc>) -> Result<RunOutcome<ReconcileSummary>> {
        self.guarded(Operation::Reconcile, self.run_reconcile(now)).await
    }

    pub async fn release_stale_leases(&self) -> Result<RunOutcome<ReleaseSummary>> {
        self.release_stale_leases_at(Utc::now()).await
    }

    pub async fn release_stale_leases_at(
        &self,
        now: DateTime<Utc>,
    ) -> Result<RunOutcome<ReleaseSummary>> {
        self.guarded(Operation::ReleaseLeases, self.run_release(now))
            .await
    }

    /// Runs `work` inside the document lock and reports the outcome. The
    /// guard is dropped on every exit path, including errors.
    async fn guarded<T, F>(&self, operation: Operation, work: F) -> Result<RunOutcome<T>>
    where
        T: Counted,
        F: Future<Output = Result<T>>,
    {
        let acquired = self
            .lock
            .try_acquire(self.config.lock_wait())
            .await
            .context("acquiring document lock");
        let guard = match acquired {
            Ok(Some(guard)) => guard,
            Ok(None) => {
                self.notifier.notify(&Notice::Busy { operation });
                return Ok(RunOutcome::Busy);
            }
            Err(err) => return Err(self.failed(operation, err)),
        };

        let result = work.await;
        guard.release();

        match result {
            Ok(summary) => {
                self.notifier.notify(&Notice::Completed {
                    operation,
                    count: summary.count(),
                });
                Ok(RunOutcome::Completed(summary))
            }
            Err(err) => Err(self.failed(operation, err)),
        }
    }

    fn failed(&self, operation: Operation, err: anyhow::Error) -> anyhow::Error {
        self.notifier.notify(&Notice::Failed {
            operation,
            message: format!("{err:#}"),
        });
        err
    }

    async fn run_reconcile(&self, now: DateTime<Utc>) -> Result<ReconcileSummary> {
        let run_id = Uuid::new_v4();
        let span = info_span!("reconcile", %run_id);
        async move {
            let started_at = Utc::now();
            let tables = &self.config.tables;

            // Snapshots come first: both tables are mutated later in this run.
            let queue_table = self.read(&tables.output).await?;
            let manual_table = self.read(&tables.manual).await?;
            let queue_claims = queue_table
                .as_ref()
                .map(|t| extract_claims(t, self.config.output_columns.claim_columns()))
                .unwrap_or_default();
            let manual_claims = manual_table
                .as_ref()
                .map(|t| extract_claims(t, self.config.manual_columns.claim_columns()))
                .unwrap_or_default();
            let previous = merge_previous(queue_claims, manual_claims);

            let source_table = self
                .read(&tables.source)
                .await?
                .ok_or_else(|| anyhow!("source table `{}` not found", tables.source))?;
            let source = SourceIngester::new(&self.config, &self.scope)
                .ingest(&source_table, now)
                .context("ingesting source export")?;

            let sweep = ManualSweeper::new(&self.config, &self.scope).plan(
                manual_table.as_ref(),
                &source.accepted_ids,
                now,
            );
            let (plan, manual_skipped) = match sweep {
                Ok(plan) => {
                    self.apply_manual_plan(&plan, now).await?;
                    (plan, None)
                }
                Err(skip) => {
                    match &skip {
                        ManualSkip::MissingColumns(_) => {
                            warn!(reason = %skip, "manual table ignored")
                        }
                        ManualSkip::Absent | ManualSkip::Empty => {
                            debug!(reason = %skip, "no manual rows")
                        }
                    }
                    (ManualPlan::default(), Some(skip.to_string()))
                }
            };

            let source_items = source.items.len();
            let manual_items = plan.items.len();
            let ranked = merge_and_rank(source.items, plan.items, &previous);

            let columns = &self.config.output_columns;
            let rows = ranked.iter().map(|item| columns.render(item)).collect::<Vec<_>>();
            self.store
                .write_table(&tables.output, &columns.header(), &rows)
                .await
                .with_context(|| format!("writing table `{}`", tables.output))?;

            info!(
                tasks = rows.len(),
                source_items,
                manual_items,
                superseded = plan.superseded,
                expired = plan.expired,
                "queue rebuilt"
            );
            Ok(ReconcileSummary {
                run_id,
                started_at,
                finished_at: Utc::now(),
                tasks_written: rows.len(),
                source_items,
                manual_items,
                superseded: plan.superseded,
                expired: plan.expired,
                stamped: plan.stamps.len(),
                skipped_rows: source.skipped_rows,
                out_of_scope: source.out_of_scope,
                manual_skipped,
            })
        }
        .instrument(span)
        .await
    }

    /// Sweep writes are applied as they go and are not rolled back if a
    /// later step fails.
    async fn apply_manual_plan(&self, plan: &ManualPlan, now: DateTime<Utc>) -> Result<()> {
        let manual = &self.config.tables.manual;
        // Stamps use pre-deletion row indices, so they go first.
        if !plan.stamps.is_empty() {
            self.store
                .batch_set(manual, &plan.stamps, Cell::DateTime(now))
                .await
                .with_context(|| format!("stamping first-seen times in `{manual}`"))?;
        }
        for &row in &plan.deletions {
            self.store
                .delete_row(manual, row)
                .await
                .with_context(|| format!("deleting row {row} of `{manual}`"))?;
        }
        Ok(())
    }

    async fn run_release(&self, now: DateTime<Utc>) -> Result<ReleaseSummary> {
        let run_id = Uuid::new_v4();
        let span = info_span!("release_leases", %run_id);
        async move {
            let output = &self.config.tables.output;
            let Some(table) = self.read(output).await? else {
                info!(table = %output, "no queue table yet; nothing to release");
                return Ok(ReleaseSummary {
                    run_id,
                    released: 0,
                    released_ids: Vec::new(),
                });
            };

            let plan = plan_release(
                &table,
                &self.config.output_columns,
                self.config.claim_ttl(),
                now,
            );
            if !plan.updates.is_empty() {
                self.store
                    .batch_update(output, &plan.updates)
                    .await
                    .with_context(|| format!("releasing claims in `{output}`"))?;
            }
            info!(released = plan.released_ids.len(), "stale claims released");
            Ok(ReleaseSummary {
                run_id,
                released: plan.released_ids.len(),
                released_ids: plan.released_ids,
            })
        }
        .instrument(span)
        .await
    }

    async fn read(&self, name: &str) -> Result<Option<Table>> {
        self.store
            .read_table(name)
            .await
            .with_context(|| format!("reading table `{name}`"))
    }
}

/// Engine over the on-disk workbook named by `config`, locked by a lock file
/// inside the workbook directory.
pub async fn engine_from_config(config: &SyncConfig) -> Result<QueueEngine> {
    let reconcile = load_reconcile_config(&config.config_path).await?;
    let store = Arc::new(WorkbookStore::new(config.workbook_dir.clone()));
    let lock = Arc::new(FileLock::new(config.lock_path()));
    QueueEngine::new(store, lock, reconcile)
}

/// Cron jobs for both passes, or `None` when scheduling is disabled.
pub async fn maybe_build_scheduler(
    engine: Arc<QueueEngine>,
    config: &SyncConfig,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;

    let reconcile_engine = Arc::clone(&engine);
    let reconcile = Job::new_async(config.reconcile_cron.as_str(), move |_uuid, _l| {
        let engine = Arc::clone(&reconcile_engine);
        Box::pin(async move {
            if let Err(err) = engine.reconcile().await {
                warn!(error = %format!("{err:#}"), "scheduled reconcile failed");
            }
        })
    })
    .with_context(|| format!("creating reconcile job for cron {}", config.reconcile_cron))?;
    sched.add(reconcile).await.context("adding reconcile job")?;

    let release_engine = Arc::clone(&engine);
    let release = Job::new_async(config.release_cron.as_str(), move |_uuid, _l| {
        let engine = Arc::clone(&release_engine);
        Box::pin(async move {
            if let Err(err) = engine.release_stale_leases().await {
                warn!(error = %format!("{err:#}"), "scheduled lease release failed");
            }
        })
    })
    .with_context(|| format!("creating release job for cron {}", config.release_cron))?;
    sched.add(release).await.context("adding release job")?;

    Ok(Some(sched))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    use chrono::TimeZone;
    use palq_storage::{MemoryLock, MemoryStore};

    #[derive(Default, Clone)]
    struct RecordingNotifier {
        notices: Arc<Mutex<Vec<Notice>>>,
    }

    impl Notifier for RecordingNotifier {
        fn notify(&self, notice: &Notice) {
            self.notices.lock().unwrap().push(notice.clone());
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 19, 10, 0, 0).single().unwrap()
    }

    fn source_table() -> Table {
        Table::new(
            vec!["ID".into(), "LOCATION".into(), "DUE_DATETIME".into()],
            vec![vec![
                Cell::text("A1"),
                Cell::text("LINE-1"),
                Cell::DateTime(now() + chrono::Duration::hours(2)),
            ]],
        )
    }

    fn engine(store: &MemoryStore, lock: &MemoryLock) -> (QueueEngine, RecordingNotifier) {
        let notifier = RecordingNotifier::default();
        let mut config = ReconcileConfig::default();
        config.lock_wait_secs = 0;
        let engine = QueueEngine::new(Arc::new(store.clone()), Arc::new(lock.clone()), config)
            .unwrap()
            .with_notifier(Box::new(notifier.clone()));
        (engine, notifier)
    }

    #[tokio::test]
    async fn reconcile_notifies_with_task_count() {
        let store = MemoryStore::from_tables([("source_export", source_table())]);
        let lock = MemoryLock::new();
        let (engine, notifier) = engine(&store, &lock);

        let summary = engine.reconcile_at(now()).await.unwrap().completed().unwrap();
        assert_eq!(summary.tasks_written, 1);
        assert_eq!(summary.manual_skipped.as_deref(), Some("manual table is absent"));
        assert_eq!(
            notifier.notices.lock().unwrap().as_slice(),
            &[Notice::Completed {
                operation: Operation::Reconcile,
                count: 1
            }]
        );
    }

    #[tokio::test]
    async fn contended_lock_is_busy_and_touches_nothing() {
        let store = MemoryStore::from_tables([("source_export", source_table())]);
        let lock = MemoryLock::new();
        let (engine, notifier) = engine(&store, &lock);

        let held = lock.try_acquire(Duration::from_millis(10)).await.unwrap();
        assert!(held.is_some());

        let outcome = engine.reconcile_at(now()).await.unwrap();
        assert!(matches!(outcome, RunOutcome::Busy));
        assert!(store.read_table("work_queue").await.unwrap().is_none());
        assert_eq!(
            notifier.notices.lock().unwrap().as_slice(),
            &[Notice::Busy {
                operation: Operation::Reconcile
            }]
        );
    }

    #[tokio::test]
    async fn missing_source_fails_and_releases_the_lock() {
        let store = MemoryStore::new();
        let lock = MemoryLock::new();
        let (engine, notifier) = engine(&store, &lock);

        let err = engine.reconcile_at(now()).await.unwrap_err();
        assert!(err.to_string().contains("source_export"));
        assert!(matches!(
            notifier.notices.lock().unwrap().last(),
            Some(Notice::Failed { operation: Operation::Reconcile, .. })
        ));
        assert!(lock
            .try_acquire(Duration::from_millis(10))
            .await
            .unwrap()
            .is_some());
    }

    #[test]
    fn invalid_scope_pattern_is_rejected_at_construction() {
        let config = ReconcileConfig {
            scope_pattern: "[unclosed".to_string(),
            ..ReconcileConfig::default()
        };
        let result = QueueEngine::new(
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryLock::new()),
            config,
        );
        assert!(result.is_err());
    }

    #[test]
    fn out_of_range_or_negative_ttls_are_rejected_at_construction() {
        let build = |config: ReconcileConfig| {
            QueueEngine::new(
                Arc::new(MemoryStore::new()),
                Arc::new(MemoryLock::new()),
                config,
            )
        };
        let huge = build(ReconcileConfig {
            claim_ttl_minutes: 1_000_000_000_000_000,
            ..ReconcileConfig::default()
        });
        let err = huge.err().expect("huge claim ttl rejected");
        assert!(format!("{err:#}").contains("claim_ttl_minutes"));

        let negative = build(ReconcileConfig {
            manual_ttl_minutes: -5,
            ..ReconcileConfig::default()
        });
        let err = negative.err().expect("negative manual ttl rejected");
        assert!(format!("{err:#}").contains("manual_ttl_minutes"));

        assert!(build(ReconcileConfig {
            claim_ttl_minutes: 0,
            ..ReconcileConfig::default()
        })
        .is_ok());
    }

    #[test]
    fn notices_read_as_operator_messages() {
        let done = Notice::Completed {
            operation: Operation::ReleaseLeases,
            count: 2,
        };
        assert_eq!(done.to_string(), "released 2 stale claims");
        let busy = Notice::Busy {
            operation: Operation::Reconcile,
        };
        assert!(busy.to_string().starts_with("reconcile skipped"));
    }
}
