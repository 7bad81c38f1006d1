use crate::cli::actions::Action;
use crate::collectors::cache::CollectorCache;
use crate::{config, exporter};
use anyhow::Result;

/// Handle the run action
///
/// # Errors
///
/// Returns an error if the configuration cannot be loaded or the server
/// fails to start.
pub async fn handle(action: Action) -> Result<()> {
    match action {
        Action::Run {
            port,
            listen,
            config: config_path,
            settings,
            cache_size,
        } => {
            let targets = config::load(&config_path)?;

            let cache = CollectorCache::new(targets, settings, cache_size);

            exporter::new(port, listen, cache).await?;
        }
    }

    Ok(())
}
