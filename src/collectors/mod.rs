use anyhow::Result;
use futures::future::BoxFuture;
use prometheus::Registry;
use sqlx::PgConnection;
use std::collections::HashMap;

use crate::config::Target;

#[macro_use]
mod register_macro;

/// One fixed metric family: a static SQL statement mapped to a fixed label
/// tuple, run once per live target connection per scrape cycle.
pub trait Collector {
    fn name(&self) -> &'static str;

    /// Whether this collector belongs to the default metric set. Collectors
    /// returning false are gated by their per-request feature flag instead.
    fn enabled_by_default(&self) -> bool;

    fn register_metrics(&self, registry: &Registry) -> Result<()>;

    /// Clear all series emitted in the previous cycle.
    fn reset(&self);

    /// Collect against one target's live connection. Errors are reported to
    /// the orchestrator, which logs and moves on; they never abort the cycle.
    fn collect<'a>(
        &'a self,
        conn: &'a mut PgConnection,
        target: &'a Target,
    ) -> BoxFuture<'a, Result<()>>;
}

// THIS IS THE ONLY PLACE YOU NEED TO ADD NEW COLLECTORS ✨
register_collectors! {
    sessions => SessionsCollector,
    uptime => UptimeCollector,
    database => DatabaseCollector,
    waitclass => WaitclassCollector,
    locks => LocksCollector,
    tablerows => TablerowsCollector,
    tablebytes => TablebytesCollector,
    indexbytes => IndexbytesCollector,
    lobbytes => LobbytesCollector,
    recovery => RecoveryCollector,
}

// Other modules
pub mod cache;
pub mod connection;
pub mod custom;
pub mod instance;
