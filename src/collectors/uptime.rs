use crate::collectors::Collector;
use crate::collectors::connection::DB_OP_TIMEOUT;
use crate::config::Target;
use anyhow::{Result, anyhow};
use futures::future::BoxFuture;
use prometheus::{GaugeVec, Opts, Registry};
use sqlx::PgConnection;
use tokio::time::timeout;
use tracing::instrument;

/// Seconds since postmaster start (`pg_postmaster_start_time()`).
#[derive(Clone)]
pub struct UptimeCollector {
    uptime: GaugeVec,
}

impl Default for UptimeCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl UptimeCollector {
    /// Creates a new `UptimeCollector`
    ///
    /// # Panics
    ///
    /// Panics if metric creation fails (should never happen with valid metric names)
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn new() -> Self {
        let uptime = GaugeVec::new(
            Opts::new(
                "pgtargets_uptime_seconds",
                "Gauge metric with uptime in seconds of the instance.",
            ),
            &["database", "dbinstance"],
        )
        .expect("valid pgtargets_uptime_seconds metric opts");

        Self { uptime }
    }
}

impl Collector for UptimeCollector {
    fn name(&self) -> &'static str {
        "uptime"
    }

    fn enabled_by_default(&self) -> bool {
        true
    }

    fn register_metrics(&self, registry: &Registry) -> Result<()> {
        registry.register(Box::new(self.uptime.clone()))?;
        Ok(())
    }

    fn reset(&self) {
        self.uptime.reset();
    }

    #[instrument(skip(self, conn, target), level = "info", err, fields(collector = "uptime", target = %target.name))]
    fn collect<'a>(
        &'a self,
        conn: &'a mut PgConnection,
        target: &'a Target,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let seconds: f64 = timeout(
                DB_OP_TIMEOUT,
                sqlx::query_scalar(
                    "SELECT EXTRACT(EPOCH FROM now() - pg_postmaster_start_time())::float8",
                )
                .fetch_one(&mut *conn),
            )
            .await
            .map_err(|_| anyhow!("uptime query timed out"))??;

            self.uptime
                .with_label_values(&[&target.name, &target.instance])
                .set(seconds);

            Ok(())
        })
    }
}
