pub mod run;

use crate::collectors::instance::ExporterSettings;
use std::path::PathBuf;

#[derive(Debug)]
pub enum Action {
    Run {
        port: u16,
        listen: Option<String>,
        config: PathBuf,
        settings: ExporterSettings,
        cache_size: usize,
    },
}
