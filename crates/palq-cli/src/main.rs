use std::env;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use palq_core::Table;
use palq_sync::{
    engine_from_config, maybe_build_scheduler, Notice, Notifier, Operation, QueueEngine,
    SyncConfig,
};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "palq")]
#[command(about = "Pallet relocation work queue")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Rebuild the work queue from the source export and manual input.
    Reconcile,
    /// Return stale claims to the pool.
    Release,
    /// Reconcile, then release stale claims.
    Run,
    /// Print the current work queue.
    Show {
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Run both passes on their cron schedules until Ctrl-C.
    Schedule,
    /// Serve the HTTP API.
    Serve {
        #[arg(long)]
        port: Option<u16>,
    },
}

/// Prints each outcome as a single line; failures go to stderr.
struct ConsoleNotifier;

impl Notifier for ConsoleNotifier {
    fn notify(&self, notice: &Notice) {
        match notice {
            Notice::Failed { .. } => eprintln!("{notice}"),
            _ => println!("{notice}"),
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("PALQ_LOG").unwrap_or_else(|_| {
        EnvFilter::new(if env::var("DEBUG").is_ok() {
            "palq=debug,info"
        } else {
            "palq=info,warn"
        })
    });

    let registry = tracing_subscriber::registry().with(filter);

    match env::var("PALQ_LOG_FORMAT").as_deref() {
        Ok("json") => registry
            .with(fmt::layer().json().with_ansi(false).with_writer(std::io::stderr))
            .init(),
        _ => registry
            .with(fmt::layer().compact().with_writer(std::io::stderr))
            .init(),
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    init_tracing();
    let cli = Cli::parse();
    let mut config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Reconcile) {
        Commands::Reconcile => {
            let engine = console_engine(&config).await?;
            return Ok(exit_code(run_operations(&engine, &[Operation::Reconcile]).await));
        }
        Commands::Release => {
            let engine = console_engine(&config).await?;
            return Ok(exit_code(run_operations(&engine, &[Operation::ReleaseLeases]).await));
        }
        Commands::Run => {
            let engine = console_engine(&config).await?;
            let ops = [Operation::Reconcile, Operation::ReleaseLeases];
            return Ok(exit_code(run_operations(&engine, &ops).await));
        }
        Commands::Show { limit } => {
            let engine = engine_from_config(&config).await?;
            match engine.read_queue().await? {
                Some(table) => print_table(&table, limit),
                None => println!("no work queue yet; run `palq reconcile` first"),
            }
        }
        Commands::Schedule => {
            config.scheduler_enabled = true;
            let engine = Arc::new(console_engine(&config).await?);
            let Some(mut sched) = maybe_build_scheduler(engine, &config).await? else {
                return Ok(ExitCode::SUCCESS);
            };
            sched.start().await.context("starting scheduler")?;
            info!(
                reconcile = %config.reconcile_cron,
                release = %config.release_cron,
                "scheduler running; Ctrl-C to stop"
            );
            tokio::signal::ctrl_c()
                .await
                .context("waiting for Ctrl-C")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::Serve { port } => {
            let engine = Arc::new(engine_from_config(&config).await?);
            let sched = maybe_build_scheduler(Arc::clone(&engine), &config).await?;
            if let Some(sched) = &sched {
                sched.start().await.context("starting scheduler")?;
            }
            palq_web::serve(engine, port.unwrap_or(config.web_port)).await?;
        }
    }

    Ok(ExitCode::SUCCESS)
}

/// Runs `operations` in order, stopping after a busy or failed one. Returns
/// `false` on failure. Outcomes reach the operator through the engine's
/// notifier only, so errors are not returned for `main` to print again.
async fn run_operations(engine: &QueueEngine, operations: &[Operation]) -> bool {
    for operation in operations {
        let outcome = match operation {
            Operation::Reconcile => engine.reconcile().await.map(|o| o.completed().is_some()),
            Operation::ReleaseLeases => engine
                .release_stale_leases()
                .await
                .map(|o| o.completed().is_some()),
        };
        match outcome {
            Ok(true) => {}
            Ok(false) => return true,
            Err(_) => return false,
        }
    }
    true
}

fn exit_code(succeeded: bool) -> ExitCode {
    if succeeded {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

async fn console_engine(config: &SyncConfig) -> Result<QueueEngine> {
    Ok(engine_from_config(config)
        .await?
        .with_notifier(Box::new(ConsoleNotifier)))
}

fn print_table(table: &Table, limit: Option<usize>) {
    println!("{}", table.header.join("\t"));
    for row in table.rows.iter().take(limit.unwrap_or(usize::MAX)) {
        let line = row.iter().map(|c| c.as_text()).collect::<Vec<_>>().join("\t");
        println!("{line}");
    }
    println!("({} rows)", table.rows.len());
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use palq_core::{Cell, ReconcileConfig};
    use palq_storage::{MemoryLock, MemoryStore};

    #[derive(Default, Clone)]
    struct Recorder {
        notices: Arc<Mutex<Vec<Notice>>>,
    }

    impl Notifier for Recorder {
        fn notify(&self, notice: &Notice) {
            self.notices.lock().unwrap().push(notice.clone());
        }
    }

    fn engine(store: MemoryStore, recorder: &Recorder) -> QueueEngine {
        QueueEngine::new(
            Arc::new(store),
            Arc::new(MemoryLock::new()),
            ReconcileConfig::default(),
        )
        .unwrap()
        .with_notifier(Box::new(recorder.clone()))
    }

    #[tokio::test]
    async fn failed_run_is_reported_once_and_stops_the_sequence() {
        let recorder = Recorder::default();
        let engine = engine(MemoryStore::new(), &recorder);

        let ops = [Operation::Reconcile, Operation::ReleaseLeases];
        assert!(!run_operations(&engine, &ops).await);

        let notices = recorder.notices.lock().unwrap();
        assert_eq!(notices.len(), 1);
        assert!(matches!(
            notices[0],
            Notice::Failed {
                operation: Operation::Reconcile,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn successful_run_reports_each_operation() {
        let source = Table::new(
            vec!["ID".into(), "LOCATION".into()],
            vec![vec![Cell::text("A1"), Cell::text("LINE-1")]],
        );
        let recorder = Recorder::default();
        let engine = engine(MemoryStore::from_tables([("source_export", source)]), &recorder);

        let ops = [Operation::Reconcile, Operation::ReleaseLeases];
        assert!(run_operations(&engine, &ops).await);
        assert_eq!(
            *recorder.notices.lock().unwrap(),
            vec![
                Notice::Completed {
                    operation: Operation::Reconcile,
                    count: 1,
                },
                Notice::Completed {
                    operation: Operation::ReleaseLeases,
                    count: 0,
                },
            ]
        );
    }
}
