use crate::collectors::Collector;
use crate::collectors::connection::DB_OP_TIMEOUT;
use crate::config::Target;
use anyhow::{Result, anyhow};
use futures::future::BoxFuture;
use prometheus::{GaugeVec, Opts, Registry};
use sqlx::PgConnection;
use tokio::time::timeout;
use tracing::instrument;

/// Total index bytes per user table (`pg_indexes_size`).
/// Gated by the `indexbytes` flag.
#[derive(Clone)]
pub struct IndexbytesCollector {
    indexbytes: GaugeVec,
}

impl Default for IndexbytesCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl IndexbytesCollector {
    /// Creates a new `IndexbytesCollector`
    ///
    /// # Panics
    ///
    /// Panics if metric creation fails (should never happen with valid metric names)
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn new() -> Self {
        let indexbytes = GaugeVec::new(
            Opts::new(
                "pgtargets_indexbytes",
                "Gauge metric with index bytes of all user tables.",
            ),
            &["database", "dbinstance", "schema", "table_name"],
        )
        .expect("valid pgtargets_indexbytes metric opts");

        Self { indexbytes }
    }
}

impl Collector for IndexbytesCollector {
    fn name(&self) -> &'static str {
        "indexbytes"
    }

    fn enabled_by_default(&self) -> bool {
        false
    }

    fn register_metrics(&self, registry: &Registry) -> Result<()> {
        registry.register(Box::new(self.indexbytes.clone()))?;
        Ok(())
    }

    fn reset(&self) {
        self.indexbytes.reset();
    }

    #[instrument(skip(self, conn, target), level = "info", err, fields(collector = "indexbytes", target = %target.name))]
    fn collect<'a>(
        &'a self,
        conn: &'a mut PgConnection,
        target: &'a Target,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let rows = timeout(
                DB_OP_TIMEOUT,
                sqlx::query_as::<_, (String, String, f64)>(
                    "SELECT schemaname, relname, pg_indexes_size(relid)::float8 FROM pg_stat_user_tables",
                )
                .fetch_all(&mut *conn),
            )
            .await
            .map_err(|_| anyhow!("indexbytes query timed out"))??;

            for (schema, table, bytes) in rows {
                self.indexbytes
                    .with_label_values(&[&target.name, &target.instance, &schema, &table])
                    .set(bytes);
            }

            Ok(())
        })
    }
}
