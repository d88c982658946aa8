//! CLI command implementations.

pub mod report;
pub mod work;

use anyhow::{Context, Result};
use std::path::Path;
use suiteq_config::Settings;
use tracing::debug;

const DEFAULT_CONFIG: &str = "suiteq.kdl";

/// Resolve settings from the optional settings file and global flags.
///
/// An explicit path must exist; the default file is only read if present.
pub fn load_settings(path: Option<&Path>, redis_url: Option<String>) -> Result<Settings> {
    let mut settings = match path {
        Some(path) => Settings::load(path)
            .with_context(|| format!("Failed to load settings: {}", path.display()))?,
        None if Path::new(DEFAULT_CONFIG).is_file() => Settings::load(Path::new(DEFAULT_CONFIG))
            .with_context(|| format!("Failed to load settings: {DEFAULT_CONFIG}"))?,
        None => {
            debug!("No settings file, using defaults");
            Settings::default()
        }
    };

    if let Some(url) = redis_url {
        settings.redis_url = url;
    }
    Ok(settings)
}
