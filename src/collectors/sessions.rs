use crate::collectors::Collector;
use crate::collectors::connection::DB_OP_TIMEOUT;
use crate::config::Target;
use anyhow::{Result, anyhow};
use futures::future::BoxFuture;
use prometheus::{GaugeVec, Opts, Registry};
use sqlx::PgConnection;
use tokio::time::timeout;
use tracing::instrument;

/// Backend session counts by user class and state (`pg_stat_activity`).
#[derive(Clone)]
pub struct SessionsCollector {
    sessions: GaugeVec,
}

impl Default for SessionsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionsCollector {
    /// Creates a new `SessionsCollector`
    ///
    /// # Panics
    ///
    /// Panics if metric creation fails (should never happen with valid metric names)
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn new() -> Self {
        let sessions = GaugeVec::new(
            Opts::new(
                "pgtargets_sessions",
                "Gauge metric with backend session counts by user class and state.",
            ),
            &["database", "dbinstance", "type", "state"],
        )
        .expect("valid pgtargets_sessions metric opts");

        Self { sessions }
    }
}

impl Collector for SessionsCollector {
    fn name(&self) -> &'static str {
        "sessions"
    }

    fn enabled_by_default(&self) -> bool {
        true
    }

    fn register_metrics(&self, registry: &Registry) -> Result<()> {
        registry.register(Box::new(self.sessions.clone()))?;
        Ok(())
    }

    fn reset(&self) {
        self.sessions.reset();
    }

    #[instrument(skip(self, conn, target), level = "info", err, fields(collector = "sessions", target = %target.name))]
    fn collect<'a>(
        &'a self,
        conn: &'a mut PgConnection,
        target: &'a Target,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let rows = timeout(
                DB_OP_TIMEOUT,
                sqlx::query_as::<_, (String, String, f64)>(
                    r"
                    SELECT CASE WHEN usename IS NULL THEN 'SYSTEM' ELSE 'USER' END AS class,
                           COALESCE(state, 'unknown') AS state,
                           count(*)::float8 AS sessions
                    FROM pg_stat_activity
                    GROUP BY 1, 2
                    ",
                )
                .fetch_all(&mut *conn),
            )
            .await
            .map_err(|_| anyhow!("sessions query timed out"))??;

            for (class, state, count) in rows {
                self.sessions
                    .with_label_values(&[&target.name, &target.instance, &class, &state])
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
        let collector = SessionsCollector::new();
        let registry = Registry::new();
        assert!(collector.register_metrics(&registry).is_ok());
    }

    #[test]
    fn test_reset_clears_series() {
        let collector = SessionsCollector::new();
        collector
            .sessions
            .with_label_values(&["orders", "primary", "USER", "active"])
            .set(3.0);
        collector.reset();

        let registry = Registry::new();
        collector.register_metrics(&registry).unwrap();
        let families = registry.gather();
        assert!(families.iter().all(|f| f.get_metric().is_empty()));
    }
}
