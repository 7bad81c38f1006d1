//! Per-cycle connection lifecycle.
//!
//! One connection per target per scrape cycle: opened at cycle start, probed
//! with a trivial liveness statement, closed before the cycle returns. Every
//! database operation carries a deadline; exceeding it counts as target-down.

use anyhow::{Context, Result, anyhow, bail};
use secrecy::ExposeSecret;
use sqlx::postgres::PgConnectOptions;
use sqlx::{Connection, PgConnection};
use std::str::FromStr;
use std::time::Duration;
use tokio::time::timeout;
use tracing::debug;

use crate::config::Target;

/// Deadline applied to every connect, probe and query execution.
pub const DB_OP_TIMEOUT: Duration = Duration::from_secs(5);

/// Open a driver-level connection for the target. Not retried within the
/// cycle; a failure here is reported as target-down by the caller.
pub async fn connect(target: &Target) -> Result<PgConnection> {
    let opts = PgConnectOptions::from_str(target.dsn.expose_secret()).with_context(|| {
        format!("invalid DSN for target {}/{}", target.name, target.instance)
    })?;

    match timeout(DB_OP_TIMEOUT, PgConnection::connect_with(&opts)).await {
        Ok(Ok(conn)) => {
            debug!(target = %target.name, instance = %target.instance, "opened connection");
            Ok(conn)
        }
        Ok(Err(e)) => Err(e).with_context(|| {
            format!("failed to connect to {}/{}", target.name, target.instance)
        }),
        Err(_) => Err(anyhow!(
            "connect to {}/{} timed out after {DB_OP_TIMEOUT:?}",
            target.name,
            target.instance
        )),
    }
}

/// Liveness probe: the statement must execute and return exactly one row.
pub async fn probe(conn: &mut PgConnection) -> Result<()> {
    let rows = timeout(
        DB_OP_TIMEOUT,
        sqlx::query_scalar::<_, i32>("SELECT 1").fetch_all(&mut *conn),
    )
    .await
    .map_err(|_| anyhow!("liveness probe timed out after {DB_OP_TIMEOUT:?}"))?
    .context("liveness probe failed")?;

    if rows.len() != 1 {
        bail!("liveness probe returned {} rows, expected 1", rows.len());
    }

    Ok(())
}

/// Close a connection slot. Idempotent: a slot already taken (or never
/// opened) is a no-op, so every exit path can call this unconditionally.
pub async fn close(slot: Option<PgConnection>) {
    if let Some(conn) = slot {
        if let Err(e) = conn.close().await {
            debug!(error = %e, "error while closing connection");
        }
    }
}
