use crate::{
    cli::actions::Action,
    collectors::cache::DEFAULT_CACHE_CAPACITY,
    collectors::instance::{ExporterSettings, ScrapeFlags},
};
use anyhow::{Result, anyhow};
use clap::ArgMatches;
use std::path::PathBuf;

/// Turn parsed CLI matches into an [`Action`].
///
/// # Errors
///
/// Returns an error if a required argument is missing.
pub fn handler(matches: &ArgMatches) -> Result<Action> {
    // Get the port or return an error
    let port = matches
        .get_one::<u16>("port")
        .copied()
        .ok_or_else(|| anyhow!("Port is required. Please provide it using the --port flag."))?;

    // Get the listen address (None means auto-detect)
    let listen = matches.get_one::<String>("listen").map(|s| s.to_string());

    let config = matches
        .get_one::<String>("config")
        .map(PathBuf::from)
        .ok_or_else(|| {
            anyhow!("Config file is required. Please provide it using the --config flag.")
        })?;

    let cache_size = matches
        .get_one::<usize>("cache-size")
        .copied()
        .unwrap_or(DEFAULT_CACHE_CAPACITY);

    Ok(Action::Run {
        port,
        listen,
        config,
        settings: get_settings(matches),
        cache_size,
    })
}

/// Flags passed on the command line become the base of every scrape; request
/// parameters can only add to them.
fn get_settings(matches: &ArgMatches) -> ExporterSettings {
    ExporterSettings {
        default_metrics: !matches.get_flag("no-default-metrics"),
        with_rownum: !matches.get_flag("no-rownum"),
        base_flags: ScrapeFlags {
            tablerows: matches.get_flag("tablerows"),
            tablebytes: matches.get_flag("tablebytes"),
            indexbytes: matches.get_flag("indexbytes"),
            lobbytes: matches.get_flag("lobbytes"),
            recovery: matches.get_flag("recovery"),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::commands;

    #[test]
    fn test_handler_defaults() {
        let command = commands::new();
        let matches = command.get_matches_from(vec!["pgtargets_exporter"]);
        let action = handler(&matches).unwrap();

        let Action::Run {
            port,
            listen,
            config,
            settings,
            cache_size,
        } = action;

        assert_eq!(port, 9161);
        assert_eq!(listen, None);
        assert_eq!(config, PathBuf::from("targets.yml"));
        assert!(settings.default_metrics);
        assert!(settings.with_rownum);
        assert_eq!(settings.base_flags, ScrapeFlags::default());
        assert_eq!(cache_size, DEFAULT_CACHE_CAPACITY);
    }

    #[test]
    fn test_handler_base_flags() {
        let command = commands::new();
        let matches = command.get_matches_from(vec![
            "pgtargets_exporter",
            "--tablerows",
            "--lobbytes",
            "--no-rownum",
        ]);
        let action = handler(&matches).unwrap();

        let Action::Run { settings, .. } = action;

        assert!(settings.base_flags.tablerows);
        assert!(settings.base_flags.lobbytes);
        assert!(!settings.base_flags.recovery);
        assert!(!settings.with_rownum);
        assert!(settings.default_metrics);
    }

    #[test]
    fn test_handler_no_default_metrics() {
        let command = commands::new();
        let matches =
            command.get_matches_from(vec!["pgtargets_exporter", "--no-default-metrics"]);
        let action = handler(&matches).unwrap();

        let Action::Run { settings, .. } = action;

        assert!(!settings.default_metrics);
    }
}
