//! Concurrent background write load against the target relation.
//!
//! Writers run as detached tasks, each with its own session as the owner
//! actor, issuing single-row updates with uniform-random identifiers until
//! the duration bound elapses or cancellation fires. The driver never
//! reads results; lock conflicts and missed rows are counted, not fatal.

use std::time::{Duration, Instant};

use rand::RngExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::actor::{Actor, CredentialRegistry};
use crate::config::WorkloadConfig;
use crate::error::{HarnessError, HarnessResult};

// ── Stats ────────────────────────────────────────────────────────────────

/// Per-writer counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct WriterStats {
    pub attempted: u64,
    pub succeeded: u64,
    pub failed: u64,
}

/// Aggregate over all writers, reported in the scenario summary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct WorkloadSummary {
    pub writers: u32,
    pub attempted: u64,
    pub succeeded: u64,
    pub failed: u64,
}

impl WorkloadSummary {
    pub fn merge(stats: &[WriterStats]) -> Self {
        let mut summary = Self {
            writers: stats.len() as u32,
            ..Self::default()
        };
        for s in stats {
            summary.attempted += s.attempted;
            summary.succeeded += s.succeeded;
            summary.failed += s.failed;
        }
        summary
    }
}

// ── Driver ───────────────────────────────────────────────────────────────

/// Handle over the detached writer tasks. The caller is never blocked
/// after launch; `shutdown` cancels and joins.
pub struct WorkloadHandle {
    cancel: watch::Sender<bool>,
    writers: Vec<JoinHandle<WriterStats>>,
}

impl WorkloadHandle {
    /// Signal cancellation, join every writer, and return the aggregate.
    pub async fn shutdown(self) -> WorkloadSummary {
        let _ = self.cancel.send(true);
        let mut stats = Vec::with_capacity(self.writers.len());
        for writer in self.writers {
            match writer.await {
                Ok(s) => stats.push(s),
                Err(e) => {
                    warn!("writer task did not complete cleanly: {e}");
                    stats.push(WriterStats::default());
                }
            }
        }
        let summary = WorkloadSummary::merge(&stats);
        info!(
            "workload done: {} writer(s), {} attempted, {} succeeded, {} failed",
            summary.writers, summary.attempted, summary.succeeded, summary.failed
        );
        summary
    }
}

/// Launches and supervises the write load.
pub struct WorkloadDriver;

impl WorkloadDriver {
    /// Start `writers` concurrent sessions as `actor` updating random rows
    /// of `target`. Every session must connect up front: a connection
    /// failure here is a setup error, before any update is issued.
    pub async fn launch(
        registry: &CredentialRegistry,
        actor: &Actor,
        target: &str,
        config: WorkloadConfig,
    ) -> HarnessResult<WorkloadHandle> {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let deadline = Instant::now() + config.duration();
        let update_sql =
            format!("UPDATE {target} SET padding = md5(random()::text) WHERE id = $1");

        let mut writers = Vec::with_capacity(config.writers as usize);
        for writer_id in 0..config.writers {
            let session = registry.connect(actor).await.map_err(|e| {
                HarnessError::Setup(format!(
                    "workload writer {writer_id} cannot connect as {}: {e}",
                    actor.name
                ))
            })?;
            let statement = session.client.prepare(&update_sql).await.map_err(|e| {
                HarnessError::Setup(format!("workload writer {writer_id} cannot prepare: {e}"))
            })?;

            let cancel = cancel_rx.clone();
            let row_domain = config.row_domain;
            writers.push(tokio::spawn(async move {
                writer_loop(writer_id, session, statement, row_domain, deadline, cancel).await
            }));
        }

        info!(
            "workload launched: {} writer(s), row domain [1, {}], bound {}",
            config.writers,
            config.row_domain,
            humantime::format_duration(config.duration()),
        );
        Ok(WorkloadHandle {
            cancel: cancel_tx,
            writers,
        })
    }
}

async fn writer_loop(
    writer_id: u32,
    session: crate::actor::PgSession,
    statement: tokio_postgres::Statement,
    row_domain: i64,
    deadline: Instant,
    cancel: watch::Receiver<bool>,
) -> WriterStats {
    let mut stats = WriterStats::default();
    loop {
        if *cancel.borrow() || Instant::now() >= deadline {
            break;
        }
        let id: i64 = rand::rng().random_range(1..=row_domain);
        stats.attempted += 1;
        match session.client.execute(&statement, &[&id]).await {
            Ok(_) => stats.succeeded += 1,
            Err(e) if e.is_closed() => {
                // Session gone (e.g. database dropped under us); the
                // writer cannot make further progress.
                stats.failed += 1;
                debug!("writer {writer_id} lost its session: {e}");
                break;
            }
            Err(e) => {
                // Lock conflicts and missed rows are tolerated.
                stats.failed += 1;
                debug!("writer {writer_id} update failed: {e}");
            }
        }
    }
    debug!(
        "writer {writer_id} finished: {} attempted, {} succeeded, {} failed",
        stats.attempted, stats.succeeded, stats.failed
    );
    stats
}

// ── Tests ────────────────────────────────────────────────────────────────
