use crate::collectors::Collector;
use crate::collectors::connection::DB_OP_TIMEOUT;
use crate::config::Target;
use anyhow::{Result, anyhow};
use futures::future::BoxFuture;
use prometheus::{GaugeVec, Opts, Registry};
use sqlx::PgConnection;
use tokio::time::timeout;
use tracing::instrument;

/// Held and awaited locks by mode (`pg_locks`).
#[derive(Clone)]
pub struct LocksCollector {
    locks: GaugeVec,
}

impl Default for LocksCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl LocksCollector {
    /// Creates a new `LocksCollector`
    ///
    /// # Panics
    ///
    /// Panics if metric creation fails (should never happen with valid metric names)
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn new() -> Self {
        let locks = GaugeVec::new(
            Opts::new(
                "pgtargets_locks",
                "Gauge metric with lock counts by mode and grant state (pg_locks).",
            ),
            &["database", "dbinstance", "mode", "granted"],
        )
        .expect("valid pgtargets_locks metric opts");

        Self { locks }
    }
}

impl Collector for LocksCollector {
    fn name(&self) -> &'static str {
        "locks"
    }

    fn enabled_by_default(&self) -> bool {
        true
    }

    fn register_metrics(&self, registry: &Registry) -> Result<()> {
        registry.register(Box::new(self.locks.clone()))?;
        Ok(())
    }

    fn reset(&self) {
        self.locks.reset();
    }

    #[instrument(skip(self, conn, target), level = "info", err, fields(collector = "locks", target = %target.name))]
    fn collect<'a>(
        &'a self,
        conn: &'a mut PgConnection,
        target: &'a Target,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let rows = timeout(
                DB_OP_TIMEOUT,
                sqlx::query_as::<_, (String, bool, f64)>(
                    r"
                    SELECT mode, granted, count(*)::float8
                    FROM pg_locks
                    GROUP BY mode, granted
                    ",
                )
                .fetch_all(&mut *conn),
            )
            .await
            .map_err(|_| anyhow!("locks query timed out"))??;

            for (mode, granted, count) in rows {
                let granted = if granted { "true" } else { "false" };
                self.locks
                    .with_label_values(&[&target.name, &target.instance, &mode, granted])
                    .set(count);
            }

            Ok(())
        })
    }
}
