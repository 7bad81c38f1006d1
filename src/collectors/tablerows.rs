use crate::collectors::Collector;
use crate::collectors::connection::DB_OP_TIMEOUT;
use crate::config::Target;
use anyhow::{Result, anyhow};
use futures::future::BoxFuture;
use prometheus::{GaugeVec, Opts, Registry};
use sqlx::PgConnection;
use tokio::time::timeout;
use tracing::instrument;

/// Live row estimates for every user table (`pg_stat_user_tables`).
/// Expensive on wide schemas, so gated by the `tablerows` flag.
#[derive(Clone)]
pub struct TablerowsCollector {
    tablerows: GaugeVec,
}

impl Default for TablerowsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl TablerowsCollector {
    /// Creates a new `TablerowsCollector`
    ///
    /// # Panics
    ///
    /// Panics if metric creation fails (should never happen with valid metric names)
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn new() -> Self {
        let tablerows = GaugeVec::new(
            Opts::new(
                "pgtargets_tablerows",
                "Gauge metric with live row estimates of all user tables.",
            ),
            &["database", "dbinstance", "schema", "table_name"],
        )
        .expect("valid pgtargets_tablerows metric opts");

        Self { tablerows }
    }
}

impl Collector for TablerowsCollector {
    fn name(&self) -> &'static str {
        "tablerows"
    }

    fn enabled_by_default(&self) -> bool {
        false
    }

    fn register_metrics(&self, registry: &Registry) -> Result<()> {
        registry.register(Box::new(self.tablerows.clone()))?;
        Ok(())
    }

    fn reset(&self) {
        self.tablerows.reset();
    }

    #[instrument(skip(self, conn, target), level = "info", err, fields(collector = "tablerows", target = %target.name))]
    fn collect<'a>(
        &'a self,
        conn: &'a mut PgConnection,
        target: &'a Target,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let rows = timeout(
                DB_OP_TIMEOUT,
                sqlx::query_as::<_, (String, String, f64)>(
                    "SELECT schemaname, relname, n_live_tup::float8 FROM pg_stat_user_tables",
                )
                .fetch_all(&mut *conn),
            )
            .await
            .map_err(|_| anyhow!("tablerows query timed out"))??;

            for (schema, table, count) in rows {
                self.tablerows
                    .with_label_values(&[&target.name, &target.instance, &schema, &table])
                    .set(count);
            }

            Ok(())
        })
    }
}
