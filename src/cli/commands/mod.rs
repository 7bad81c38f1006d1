use clap::{
    Arg, ArgAction, ColorChoice, Command,
    builder::styling::{AnsiColor, Effects, Styles},
};

pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub fn new() -> Command {
    let styles = Styles::styled()
        .header(AnsiColor::Yellow.on_default() | Effects::BOLD)
        .usage(AnsiColor::Green.on_default() | Effects::BOLD)
        .literal(AnsiColor::Blue.on_default() | Effects::BOLD)
        .placeholder(AnsiColor::Green.on_default());

    Command::new("pgtargets_exporter")
        .about("Multi-target PostgreSQL metric exporter for Prometheus with declarative custom queries")
        .version(env!("CARGO_PKG_VERSION"))
        .long_version(built_info::GIT_COMMIT_HASH.to_owned())
        .color(ColorChoice::Auto)
        .styles(styles)
        .arg(
            Arg::new("port")
                .short('p')
                .long("port")
                .help("Port to listen on")
                .default_value("9161")
                .env("PGTARGETS_EXPORTER_PORT")
                .value_parser(clap::value_parser!(u16)),
        )
        .arg(
            Arg::new("listen")
                .long("listen")
                .help("IP address to bind, IPv4 or IPv6 (default: auto, IPv6 with IPv4 fallback)")
                .env("PGTARGETS_EXPORTER_LISTEN")
                .value_name("IP"),
        )
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .help("Path to the targets configuration file")
                .default_value("targets.yml")
                .env("PGTARGETS_EXPORTER_CONFIG")
                .value_name("FILE"),
        )
        .arg(
            Arg::new("no-default-metrics")
                .long("no-default-metrics")
                .help("Skip the default collector set, only flagged and custom metrics remain")
                .env("PGTARGETS_EXPORTER_NO_DEFAULT_METRICS")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("no-rownum")
                .long("no-rownum")
                .help("Omit the rownum label on custom query metrics")
                .env("PGTARGETS_EXPORTER_NO_ROWNUM")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("tablerows")
                .long("tablerows")
                .help("Always collect per-table row counts")
                .env("PGTARGETS_EXPORTER_TABLEROWS")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("tablebytes")
                .long("tablebytes")
                .help("Always collect per-table sizes in bytes")
                .env("PGTARGETS_EXPORTER_TABLEBYTES")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("indexbytes")
                .long("indexbytes")
                .help("Always collect per-table index sizes in bytes")
                .env("PGTARGETS_EXPORTER_INDEXBYTES")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("lobbytes")
                .long("lobbytes")
                .help("Always collect large-object sizes in bytes")
                .env("PGTARGETS_EXPORTER_LOBBYTES")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("recovery")
                .long("recovery")
                .help("Always collect recovery state and replay lag")
                .env("PGTARGETS_EXPORTER_RECOVERY")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("cache-size")
                .long("cache-size")
                .help("Maximum number of cached collector instances, one per request shape")
                .default_value("64")
                .env("PGTARGETS_EXPORTER_CACHE_SIZE")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Increase verbosity, -vv for debug")
                .action(ArgAction::Count),
        )
}
