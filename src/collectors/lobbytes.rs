use crate::collectors::Collector;
use crate::collectors::connection::DB_OP_TIMEOUT;
use crate::config::Target;
use anyhow::{Result, anyhow};
use futures::future::BoxFuture;
use prometheus::{GaugeVec, Opts, Registry};
use sqlx::PgConnection;
use tokio::time::timeout;
use tracing::instrument;

/// Total large-object bytes (`pg_largeobject`). Requires read access to the
/// system catalog and scans every LO page, so gated by the `lobbytes` flag.
#[derive(Clone)]
pub struct LobbytesCollector {
    lobbytes: GaugeVec,
}

impl Default for LobbytesCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl LobbytesCollector {
    /// Creates a new `LobbytesCollector`
    ///
    /// # Panics
    ///
    /// Panics if metric creation fails (should never happen with valid metric names)
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn new() -> Self {
        let lobbytes = GaugeVec::new(
            Opts::new(
                "pgtargets_lobbytes",
                "Gauge metric with total bytes stored in large objects.",
            ),
            &["database", "dbinstance"],
        )
        .expect("valid pgtargets_lobbytes metric opts");

        Self { lobbytes }
    }
}

impl Collector for LobbytesCollector {
    fn name(&self) -> &'static str {
        "lobbytes"
    }

    fn enabled_by_default(&self) -> bool {
        false
    }

    fn register_metrics(&self, registry: &Registry) -> Result<()> {
        registry.register(Box::new(self.lobbytes.clone()))?;
        Ok(())
    }

    fn reset(&self) {
        self.lobbytes.reset();
    }

    #[instrument(skip(self, conn, target), level = "info", err, fields(collector = "lobbytes", target = %target.name))]
    fn collect<'a>(
        &'a self,
        conn: &'a mut PgConnection,
        target: &'a Target,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let bytes: f64 = timeout(
                DB_OP_TIMEOUT,
                sqlx::query_scalar(
                    "SELECT COALESCE(sum(octet_length(data)), 0)::float8 FROM pg_largeobject",
                )
                .fetch_one(&mut *conn),
            )
            .await
            .map_err(|_| anyhow!("lobbytes query timed out"))??;

            self.lobbytes
                .with_label_values(&[&target.name, &target.instance])
                .set(bytes);

            Ok(())
        })
    }
}
