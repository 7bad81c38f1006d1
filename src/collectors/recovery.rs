use crate::collectors::Collector;
use crate::collectors::connection::DB_OP_TIMEOUT;
use crate::config::Target;
use anyhow::{Result, anyhow};
use futures::future::BoxFuture;
use prometheus::{GaugeVec, Opts, Registry};
use sqlx::PgConnection;
use tokio::time::timeout;
use tracing::instrument;

/// Recovery state and replay lag (`pg_is_in_recovery`,
/// `pg_last_xact_replay_timestamp`). Gated by the `recovery` flag.
#[derive(Clone)]
pub struct RecoveryCollector {
    recovery: GaugeVec,
}

impl Default for RecoveryCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl RecoveryCollector {
    /// Creates a new `RecoveryCollector`
    ///
    /// # Panics
    ///
    /// Panics if metric creation fails (should never happen with valid metric names)
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn new() -> Self {
        let recovery = GaugeVec::new(
            Opts::new(
                "pgtargets_recovery",
                "Gauge metric with recovery state (1 if in recovery) and replay lag seconds.",
            ),
            &["database", "dbinstance", "type"],
        )
        .expect("valid pgtargets_recovery metric opts");

        Self { recovery }
    }
}

impl Collector for RecoveryCollector {
    fn name(&self) -> &'static str {
        "recovery"
    }

    fn enabled_by_default(&self) -> bool {
        false
    }

    fn register_metrics(&self, registry: &Registry) -> Result<()> {
        registry.register(Box::new(self.recovery.clone()))?;
        Ok(())
    }

    fn reset(&self) {
        self.recovery.reset();
    }

    #[instrument(skip(self, conn, target), level = "info", err, fields(collector = "recovery", target = %target.name))]
    fn collect<'a>(
        &'a self,
        conn: &'a mut PgConnection,
        target: &'a Target,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let (in_recovery, replay_lag): (bool, f64) = timeout(
                DB_OP_TIMEOUT,
                sqlx::query_as(
                    r"
                    SELECT pg_is_in_recovery(),
                           CASE
                               WHEN pg_is_in_recovery()
                               THEN COALESCE(EXTRACT(EPOCH FROM now() - pg_last_xact_replay_timestamp())::float8, 0)
                               ELSE 0
                           END
                    ",
                )
                .fetch_one(&mut *conn),
            )
            .await
            .map_err(|_| anyhow!("recovery query timed out"))??;

            self.recovery
                .with_label_values(&[&target.name, &target.instance, "in_recovery"])
                .set(if in_recovery { 1.0 } else { 0.0 });

            self.recovery
                .with_label_values(&[&target.name, &target.instance, "replay_lag_seconds"])
                .set(replay_lag);

            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_enabled_by_default() {
        assert!(!RecoveryCollector::new().enabled_by_default());
    }
}
