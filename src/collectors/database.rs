use crate::collectors::Collector;
use crate::collectors::connection::DB_OP_TIMEOUT;
use crate::config::Target;
use anyhow::{Result, anyhow};
use futures::future::BoxFuture;
use prometheus::{GaugeVec, Opts, Registry};
use sqlx::PgConnection;
use tokio::time::timeout;
use tracing::instrument;

/// Transaction and block I/O counters plus the buffer cache hit ratio for
/// the connected database (`pg_stat_database`).
#[derive(Clone)]
pub struct DatabaseCollector {
    activity: GaugeVec,
    cache_hit_ratio: GaugeVec,
}

impl Default for DatabaseCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl DatabaseCollector {
    /// Creates a new `DatabaseCollector`
    ///
    /// # Panics
    ///
    /// Panics if metric creation fails (should never happen with valid metric names)
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn new() -> Self {
        let activity = GaugeVec::new(
            Opts::new(
                "pgtargets_database",
                "Gauge metric with commits/rollbacks/block reads and hits (pg_stat_database).",
            ),
            &["database", "dbinstance", "type"],
        )
        .expect("valid pgtargets_database metric opts");

        let cache_hit_ratio = GaugeVec::new(
            Opts::new(
                "pgtargets_cachehitratio",
                "Gauge metric with the buffer cache hit ratio in percent.",
            ),
            &["database", "dbinstance"],
        )
        .expect("valid pgtargets_cachehitratio metric opts");

        Self {
            activity,
            cache_hit_ratio,
        }
    }
}

impl Collector for DatabaseCollector {
    fn name(&self) -> &'static str {
        "database"
    }

    fn enabled_by_default(&self) -> bool {
        true
    }

    fn register_metrics(&self, registry: &Registry) -> Result<()> {
        registry.register(Box::new(self.activity.clone()))?;
        registry.register(Box::new(self.cache_hit_ratio.clone()))?;
        Ok(())
    }

    fn reset(&self) {
        self.activity.reset();
        self.cache_hit_ratio.reset();
    }

    #[instrument(skip(self, conn, target), level = "info", err, fields(collector = "database", target = %target.name))]
    fn collect<'a>(
        &'a self,
        conn: &'a mut PgConnection,
        target: &'a Target,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let (commits, rollbacks, blks_read, blks_hit): (f64, f64, f64, f64) = timeout(
                DB_OP_TIMEOUT,
                sqlx::query_as(
                    r"
                    SELECT xact_commit::float8,
                           xact_rollback::float8,
                           blks_read::float8,
                           blks_hit::float8
                    FROM pg_stat_database
                    WHERE datname = current_database()
                    ",
                )
                .fetch_one(&mut *conn),
            )
            .await
            .map_err(|_| anyhow!("database stats query timed out"))??;

            for (kind, value) in [
                ("commits", commits),
                ("rollbacks", rollbacks),
                ("blks_read", blks_read),
                ("blks_hit", blks_hit),
            ] {
                self.activity
                    .with_label_values(&[&target.name, &target.instance, kind])
                    .set(value);
            }

            let total = blks_read + blks_hit;
            if total > 0.0 {
                self.cache_hit_ratio
                    .with_label_values(&[&target.name, &target.instance])
                    .set(blks_hit / total * 100.0);
            }

            Ok(())
        })
    }
}
