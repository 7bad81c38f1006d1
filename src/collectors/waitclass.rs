use crate::collectors::Collector;
use crate::collectors::connection::DB_OP_TIMEOUT;
use crate::config::Target;
use anyhow::{Result, anyhow};
use futures::future::BoxFuture;
use prometheus::{GaugeVec, Opts, Registry};
use sqlx::PgConnection;
use tokio::time::timeout;
use tracing::instrument;

/// Backends currently waiting, grouped by wait event class
/// (`pg_stat_activity.wait_event_type`).
#[derive(Clone)]
pub struct WaitclassCollector {
    waitclass: GaugeVec,
}

impl Default for WaitclassCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl WaitclassCollector {
    /// Creates a new `WaitclassCollector`
    ///
    /// # Panics
    ///
    /// Panics if metric creation fails (should never happen with valid metric names)
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn new() -> Self {
        let waitclass = GaugeVec::new(
            Opts::new(
                "pgtargets_waitclass",
                "Gauge metric with waiting backends per wait event class.",
            ),
            &["database", "dbinstance", "type"],
        )
        .expect("valid pgtargets_waitclass metric opts");

        Self { waitclass }
    }
}

impl Collector for WaitclassCollector {
    fn name(&self) -> &'static str {
        "waitclass"
    }

    fn enabled_by_default(&self) -> bool {
        true
    }

    fn register_metrics(&self, registry: &Registry) -> Result<()> {
        registry.register(Box::new(self.waitclass.clone()))?;
        Ok(())
    }

    fn reset(&self) {
        self.waitclass.reset();
    }

    #[instrument(skip(self, conn, target), level = "info", err, fields(collector = "waitclass", target = %target.name))]
    fn collect<'a>(
        &'a self,
        conn: &'a mut PgConnection,
        target: &'a Target,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let rows = timeout(
                DB_OP_TIMEOUT,
                sqlx::query_as::<_, (String, f64)>(
                    r"
                    SELECT wait_event_type, count(*)::float8
                    FROM pg_stat_activity
                    WHERE wait_event_type IS NOT NULL
                    GROUP BY wait_event_type
                    ",
                )
                .fetch_all(&mut *conn),
            )
            .await
            .map_err(|_| anyhow!("waitclass query timed out"))??;

            for (class, count) in rows {
                self.waitclass
                    .with_label_values(&[&target.name, &target.instance, &class])
                    .set(count);
            }

            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registers_without_error() {
        let collector = WaitclassCollector::new();
        let registry = Registry::new();
        assert!(collector.register_metrics(&registry).is_ok());
    }
}
