use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while loading the YAML program catalog.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse YAML config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("no programs validated successfully; see prior warnings")]
    NoValidPrograms,
}
