use crate::collectors::Collector;
use crate::collectors::connection::DB_OP_TIMEOUT;
use crate::config::Target;
use anyhow::{Result, anyhow};
use futures::future::BoxFuture;
use prometheus::{GaugeVec, Opts, Registry};
use sqlx::PgConnection;
use tokio::time::timeout;
use tracing::instrument;

/// On-disk bytes per user table, excluding indexes (`pg_table_size`).
/// Gated by the `tablebytes` flag.
#[derive(Clone)]
pub struct TablebytesCollector {
    tablebytes: GaugeVec,
}

impl Default for TablebytesCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl TablebytesCollector {
    /// Creates a new `TablebytesCollector`
    ///
    /// # Panics
    ///
    /// Panics if metric creation fails (should never happen with valid metric names)
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn new() -> Self {
        let tablebytes = GaugeVec::new(
            Opts::new(
                "pgtargets_tablebytes",
                "Gauge metric with bytes of all user tables.",
            ),
            &["database", "dbinstance", "schema", "table_name"],
        )
        .expect("valid pgtargets_tablebytes metric opts");

        Self { tablebytes }
    }
}

impl Collector for TablebytesCollector {
    fn name(&self) -> &'static str {
        "tablebytes"
    }

    fn enabled_by_default(&self) -> bool {
        false
    }

    fn register_metrics(&self, registry: &Registry) -> Result<()> {
        registry.register(Box::new(self.tablebytes.clone()))?;
        Ok(())
    }

    fn reset(&self) {
        self.tablebytes.reset();
    }

    #[instrument(skip(self, conn, target), level = "info", err, fields(collector = "tablebytes", target = %target.name))]
    fn collect<'a>(
        &'a self,
        conn: &'a mut PgConnection,
        target: &'a Target,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let rows = timeout(
                DB_OP_TIMEOUT,
                sqlx::query_as::<_, (String, String, f64)>(
                    "SELECT schemaname, relname, pg_table_size(relid)::float8 FROM pg_stat_user_tables",
                )
                .fetch_all(&mut *conn),
            )
            .await
            .map_err(|_| anyhow!("tablebytes query timed out"))??;

            for (schema, table, bytes) in rows {
                self.tablebytes
                    .with_label_values(&[&target.name, &target.instance, &schema, &table])
                    .set(bytes);
            }

            Ok(())
        })
    }
}
