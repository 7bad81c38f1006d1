//! Per-request collector instance and scrape orchestration.
//!
//! A `CollectorInstance` owns everything one request shape needs: the subset
//! of configured targets matching the request's filter, the fixed collectors
//! enabled for it, one gauge family per declared custom query, and its own
//! Prometheus registry. The scrape cycle runs Connecting, Collecting and
//! Closing head-to-tail within one request, serialized per instance so two
//! concurrent scrapes of the same instance cannot interleave resets and
//! emissions.

use anyhow::{Context, Result};
use prometheus::{CounterVec, Gauge, GaugeVec, Opts, Registry, TextEncoder};
use sqlx::PgConnection;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::collectors::custom::{CustomQueryEngine, family_label_names, normalize_name};
use crate::collectors::{COLLECTOR_NAMES, Collector, CollectorType, all_factories, connection};
use crate::config::Target;

/// Per-request toggles for the optional, expensive fixed collectors.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ScrapeFlags {
    pub tablerows: bool,
    pub tablebytes: bool,
    pub indexbytes: bool,
    pub lobbytes: bool,
    pub recovery: bool,
}

impl ScrapeFlags {
    /// Combine request flags with the process-wide defaults; either side can
    /// turn a collector on.
    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self {
            tablerows: self.tablerows || other.tablerows,
            tablebytes: self.tablebytes || other.tablebytes,
            indexbytes: self.indexbytes || other.indexbytes,
            lobbytes: self.lobbytes || other.lobbytes,
            recovery: self.recovery || other.recovery,
        }
    }

    fn enables(self, collector: &str) -> bool {
        match collector {
            "tablerows" => self.tablerows,
            "tablebytes" => self.tablebytes,
            "indexbytes" => self.indexbytes,
            "lobbytes" => self.lobbytes,
            "recovery" => self.recovery,
            _ => false,
        }
    }
}

/// Process-wide behavior fixed at startup from CLI flags.
#[derive(Clone, Copy, Debug)]
pub struct ExporterSettings {
    /// Run the default fixed collector set on every scrape.
    pub default_metrics: bool,

    /// Attach the 1-based row counter label to custom query series.
    pub with_rownum: bool,

    /// Optional collectors enabled for every request.
    pub base_flags: ScrapeFlags,
}

impl Default for ExporterSettings {
    fn default() -> Self {
        Self {
            default_metrics: true,
            with_rownum: true,
            base_flags: ScrapeFlags::default(),
        }
    }
}

/// The per-request aggregate of targets, flags and metric families.
pub struct CollectorInstance {
    targets: Vec<Target>,
    fixed: Vec<CollectorType>,
    custom: HashMap<String, GaugeVec>,
    engine: CustomQueryEngine,
    registry: Registry,

    up: GaugeVec,
    scrapes_total: CounterVec,
    scrape_errors_total: CounterVec,
    last_scrape_error: GaugeVec,
    duration: Gauge,

    /// Serializes the Connecting/Collecting/Closing sequence; scrapes of
    /// distinct instances proceed in parallel.
    cycle: Mutex<()>,
}

impl CollectorInstance {
    /// Build an instance scoped to the given targets and flags, registering
    /// every metric family with a fresh registry.
    ///
    /// # Errors
    ///
    /// Returns an error if a metric family fails to register, which happens
    /// when two custom queries collapse to the same family name.
    pub fn new(
        targets: Vec<Target>,
        flags: ScrapeFlags,
        settings: &ExporterSettings,
    ) -> Result<Arc<Self>> {
        let registry = Registry::new();

        let up = GaugeVec::new(
            Opts::new("pgtargets_up", "Whether the target database is up."),
            &["database", "dbinstance"],
        )?;
        let scrapes_total = CounterVec::new(
            Opts::new(
                "pgtargets_exporter_scrapes_total",
                "Total number of times a target was scraped for metrics.",
            ),
            &["database", "dbinstance"],
        )?;
        let scrape_errors_total = CounterVec::new(
            Opts::new(
                "pgtargets_exporter_scrape_errors_total",
                "Total number of errors while scraping a target.",
            ),
            &["database", "dbinstance"],
        )?;
        let last_scrape_error = GaugeVec::new(
            Opts::new(
                "pgtargets_exporter_last_scrape_error",
                "Whether the last scrape of a target resulted in an error (1 for error, 0 for success).",
            ),
            &["database", "dbinstance"],
        )?;
        let duration = Gauge::new(
            "pgtargets_exporter_last_scrape_duration_seconds",
            "Duration of the last scrape of metrics from all targets.",
        )?;

        registry.register(Box::new(up.clone()))?;
        registry.register(Box::new(scrapes_total.clone()))?;
        registry.register(Box::new(scrape_errors_total.clone()))?;
        registry.register(Box::new(last_scrape_error.clone()))?;
        registry.register(Box::new(duration.clone()))?;

        let fixed = enabled_collectors(flags, settings);
        for collector in &fixed {
            collector
                .register_metrics(&registry)
                .with_context(|| format!("failed to register collector {}", collector.name()))?;
        }

        let custom = build_custom_families(&targets, settings.with_rownum, &registry)?;

        Ok(Arc::new(Self {
            targets,
            fixed,
            custom,
            engine: CustomQueryEngine::new(settings.with_rownum),
            registry,
            up,
            scrapes_total,
            scrape_errors_total,
            last_scrape_error,
            duration,
            cycle: Mutex::new(()),
        }))
    }

    #[must_use]
    pub fn target_count(&self) -> usize {
        self.targets.len()
    }

    #[must_use]
    pub fn collector_names(&self) -> Vec<&'static str> {
        self.fixed.iter().map(Collector::name).collect()
    }

    /// Run one full scrape cycle and return the encoded exposition body.
    ///
    /// Every cycle is an independent, best-effort attempt: per-target and
    /// per-query failures degrade the body, they never fail the cycle. The
    /// only hard error is exposition encoding itself.
    ///
    /// # Errors
    ///
    /// Returns an error if the gathered metrics cannot be encoded.
    pub async fn scrape(&self) -> Result<String> {
        let _cycle = self.cycle.lock().await;
        let begun = Instant::now();

        // Idle -> Connecting: drop every series from the prior cycle so a
        // target that disappeared from the filter leaves nothing stale.
        self.reset();

        // Connecting: one connection per target, declaration order,
        // per-target failures do not halt the loop.
        let mut conns: Vec<Option<PgConnection>> = Vec::with_capacity(self.targets.len());
        for target in &self.targets {
            self.scrapes_total
                .with_label_values(&[&target.name, &target.instance])
                .inc();
            self.last_scrape_error
                .with_label_values(&[&target.name, &target.instance])
                .set(0.0);

            conns.push(self.open_target(target).await);
        }

        // Collecting: fixed collectors first, then the custom query engine.
        for (target, slot) in self.targets.iter().zip(conns.iter_mut()) {
            let Some(conn) = slot.as_mut() else {
                // Target went down during Connecting; skip silently.
                continue;
            };

            for collector in &self.fixed {
                if let Err(e) = collector.collect(conn, target).await {
                    warn!(
                        collector = collector.name(),
                        target = %target.name,
                        error = %e,
                        "fixed collector failed"
                    );
                    self.record_error(target);
                }
            }

            for query in &target.queries {
                if let Some(family) = self.custom.get(&query.name) {
                    self.engine.run(conn, target, query, family).await;
                }
            }
        }

        // Closing: unconditional, even after partial failures.
        for slot in &mut conns {
            connection::close(slot.take()).await;
        }

        // Done
        self.duration.set(begun.elapsed().as_secs_f64());
        debug!(elapsed = ?begun.elapsed(), targets = self.targets.len(), "scrape cycle finished");

        self.encode()
    }

    /// Open and probe one target's connection, recording the `up` gauge.
    async fn open_target(&self, target: &Target) -> Option<PgConnection> {
        let up = self
            .up
            .with_label_values(&[&target.name, &target.instance]);

        match connection::connect(target).await {
            Ok(mut conn) => match connection::probe(&mut conn).await {
                Ok(()) => {
                    up.set(1.0);
                    Some(conn)
                }
                Err(e) => {
                    info!(target = %target.name, instance = %target.instance, error = %e, "liveness probe failed");
                    up.set(0.0);
                    self.record_error(target);
                    connection::close(Some(conn)).await;
                    None
                }
            },
            Err(e) => {
                info!(target = %target.name, instance = %target.instance, error = %e, "connect failed");
                up.set(0.0);
                self.record_error(target);
                None
            }
        }
    }

    /// Count one failure against the target and flag its current cycle.
    fn record_error(&self, target: &Target) {
        self.scrape_errors_total
            .with_label_values(&[&target.name, &target.instance])
            .inc();
        self.last_scrape_error
            .with_label_values(&[&target.name, &target.instance])
            .set(1.0);
    }

    fn reset(&self) {
        self.up.reset();
        self.last_scrape_error.reset();
        for collector in &self.fixed {
            collector.reset();
        }
        for family in self.custom.values() {
            family.reset();
        }
    }

    fn encode(&self) -> Result<String> {
        let mut buf = String::new();
        TextEncoder::new()
            .encode_utf8(&self.registry.gather(), &mut buf)
            .context("failed to encode metrics")?;
        Ok(buf)
    }
}

/// Resolve the fixed collector set for one instance: the default set when
/// default metrics are on, plus every flag-enabled optional collector, in
/// declaration order.
fn enabled_collectors(flags: ScrapeFlags, settings: &ExporterSettings) -> Vec<CollectorType> {
    let factories = all_factories();

    COLLECTOR_NAMES
        .iter()
        .filter_map(|name| factories.get(name).map(|f| f()))
        .filter(|collector| {
            (settings.default_metrics && collector.enabled_by_default())
                || flags.enables(collector.name())
        })
        .collect()
}

/// One gauge family per declared custom query, keyed by query name. Two
/// targets declaring the same query name share a family; the first
/// declaration fixes its label set.
fn build_custom_families(
    targets: &[Target],
    with_rownum: bool,
    registry: &Registry,
) -> Result<HashMap<String, GaugeVec>> {
    let mut families = HashMap::new();

    for target in targets {
        for query in &target.queries {
            if families.contains_key(&query.name) {
                continue;
            }

            let family_name = format!("pgtargets_custom_{}", normalize_name(&query.name));
            let help = if query.help.is_empty() {
                format!("Custom query {}", query.name)
            } else {
                query.help.clone()
            };

            let label_names = family_label_names(query, with_rownum);
            let label_refs: Vec<&str> = label_names.iter().map(String::as_str).collect();

            let family = GaugeVec::new(Opts::new(family_name, help), &label_refs)?;
            registry
                .register(Box::new(family.clone()))
                .with_context(|| format!("failed to register custom query {}", query.name))?;

            families.insert(query.name.clone(), family);
        }
    }

    Ok(families)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CustomQuery;
    use secrecy::SecretString;

    fn unreachable_target(name: &str, queries: Vec<CustomQuery>) -> Target {
        Target {
            name: name.to_string(),
            instance: "primary".to_string(),
            dsn: SecretString::from("postgres://scraper@127.0.0.1:1/postgres"),
            queries,
        }
    }

    fn query(name: &str) -> CustomQuery {
        CustomQuery {
            name: name.to_string(),
            help: "test query".to_string(),
            sql: "SELECT 1 AS value".to_string(),
            metrics: vec!["value".to_string()],
            labels: vec![],
        }
    }

    #[test]
    fn test_flags_union() {
        let a = ScrapeFlags {
            tablerows: true,
            ..ScrapeFlags::default()
        };
        let b = ScrapeFlags {
            recovery: true,
            ..ScrapeFlags::default()
        };
        let merged = a.union(b);
        assert!(merged.tablerows);
        assert!(merged.recovery);
        assert!(!merged.tablebytes);
    }

    #[test]
    fn test_default_collector_set() {
        let instance = CollectorInstance::new(
            vec![unreachable_target("orders", vec![])],
            ScrapeFlags::default(),
            &ExporterSettings::default(),
        )
        .unwrap();

        let names = instance.collector_names();
        assert!(names.contains(&"sessions"));
        assert!(names.contains(&"uptime"));
        assert!(!names.contains(&"tablerows"));
        assert!(!names.contains(&"recovery"));
    }

    #[test]
    fn test_flag_enables_optional_collector() {
        let flags = ScrapeFlags {
            tablerows: true,
            ..ScrapeFlags::default()
        };
        let instance = CollectorInstance::new(
            vec![unreachable_target("orders", vec![])],
            flags,
            &ExporterSettings::default(),
        )
        .unwrap();

        assert!(instance.collector_names().contains(&"tablerows"));
    }

    #[test]
    fn test_no_default_metrics_leaves_only_flagged() {
        let settings = ExporterSettings {
            default_metrics: false,
            ..ExporterSettings::default()
        };
        let flags = ScrapeFlags {
            recovery: true,
            ..ScrapeFlags::default()
        };
        let instance = CollectorInstance::new(
            vec![unreachable_target("orders", vec![])],
            flags,
            &settings,
        )
        .unwrap();

        assert_eq!(instance.collector_names(), vec!["recovery"]);
    }

    #[test]
    fn test_duplicate_query_names_share_family() {
        let targets = vec![
            unreachable_target("orders", vec![query("depth")]),
            unreachable_target("billing", vec![query("depth")]),
        ];
        let instance =
            CollectorInstance::new(targets, ScrapeFlags::default(), &ExporterSettings::default())
                .unwrap();

        assert_eq!(instance.custom.len(), 1);
    }

    #[tokio::test]
    async fn test_scrape_down_target_reports_up_zero() {
        let instance = CollectorInstance::new(
            vec![unreachable_target("down", vec![])],
            ScrapeFlags::default(),
            &ExporterSettings::default(),
        )
        .unwrap();

        let body = instance.scrape().await.unwrap();

        assert!(body.contains(r#"pgtargets_up{database="down",dbinstance="primary"} 0"#));
        assert!(body.contains("pgtargets_exporter_last_scrape_duration_seconds"));
        assert!(body.contains(r#"pgtargets_exporter_scrapes_total{database="down",dbinstance="primary"} 1"#));
    }

    #[tokio::test]
    async fn test_down_target_sets_last_scrape_error() {
        let instance = CollectorInstance::new(
            vec![unreachable_target("down", vec![])],
            ScrapeFlags::default(),
            &ExporterSettings::default(),
        )
        .unwrap();

        let body = instance.scrape().await.unwrap();

        assert!(body.contains(
            r#"pgtargets_exporter_last_scrape_error{database="down",dbinstance="primary"} 1"#
        ));
    }

    #[tokio::test]
    async fn test_scrape_counters_are_monotonic_across_cycles() {
        let instance = CollectorInstance::new(
            vec![unreachable_target("down", vec![])],
            ScrapeFlags::default(),
            &ExporterSettings::default(),
        )
        .unwrap();

        instance.scrape().await.unwrap();
        let body = instance.scrape().await.unwrap();

        assert!(body.contains(r#"pgtargets_exporter_scrapes_total{database="down",dbinstance="primary"} 2"#));
    }

    #[tokio::test]
    async fn test_scrape_partial_down_keeps_other_targets() {
        // Both targets are down here (no live database in unit tests), but
        // the loop must still visit and report every target independently.
        let instance = CollectorInstance::new(
            vec![
                unreachable_target("one", vec![]),
                unreachable_target("two", vec![]),
            ],
            ScrapeFlags::default(),
            &ExporterSettings::default(),
        )
        .unwrap();

        let body = instance.scrape().await.unwrap();

        assert!(body.contains(r#"pgtargets_up{database="one",dbinstance="primary"} 0"#));
        assert!(body.contains(r#"pgtargets_up{database="two",dbinstance="primary"} 0"#));
    }
}
