//! Configuration file handling.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::info;

use crate::animation::AnimMode;
use crate::surface::MAX_BUFFERS;

/// Default DRM device.
pub const DEFAULT_DEVICE: &str = "/dev/dri/card0";

/// Configuration load failure.
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("unable to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid config {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("queue depth must be between 2 and {MAX_BUFFERS}, got {0}")]
    QueueDepth(usize),
}

/// User configuration.
#[derive(Deserialize, Clone, PartialEq, Debug)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// DRM device node.
    pub device: PathBuf,
    /// Overlay surface dimensions.
    pub overlay_size: (u32, u32),
    /// Wait for completion events before producing new frames.
    pub throttle: bool,
    /// Initial overlay animation.
    pub animation: AnimMode,
    /// Show the overlay at startup.
    pub overlay_enabled: bool,
    /// Number of platform buffers per surface.
    pub queue_depth: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device: PathBuf::from(DEFAULT_DEVICE),
            overlay_size: (960, 576),
            overlay_enabled: true,
            queue_depth: 3,
            animation: Default::default(),
            throttle: Default::default(),
        }
    }
}

impl Config {
    /// Load the configuration.
    ///
    /// Without an explicit path, a missing default config file is not an
    /// error.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let (path, required) = match path {
            Some(path) => (path.to_path_buf(), true),
            None => match default_path() {
                Some(path) => (path, false),
                None => return Ok(Self::default()),
            },
        };

        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(err) if !required && err.kind() == io::ErrorKind::NotFound => {
                return Ok(Self::default());
            },
            Err(source) => return Err(ConfigError::Read { path, source }),
        };

        let config = Self::parse(&content).map_err(|err| match err {
            ConfigError::Parse { source, .. } => ConfigError::Parse { path: path.clone(), source },
            err => err,
        })?;
        info!("Loaded config from {}", path.display());

        Ok(config)
    }

    fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(content)
            .map_err(|source| ConfigError::Parse { path: PathBuf::new(), source })?;

        if !(2..=MAX_BUFFERS).contains(&config.queue_depth) {
            return Err(ConfigError::QueueDepth(config.queue_depth));
        }

        Ok(config)
    }
}

/// `$XDG_CONFIG_HOME/planeflip/planeflip.json`.
fn default_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("planeflip").join("planeflip.json"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_is_default() {
        assert_eq!(Config::parse("{}").unwrap(), Config::default());
    }

    #[test]
    fn partial_config() {
        let config = Config::parse(
            r#"{ "device": "/dev/dri/card1", "overlay_size": [640, 480], "animation": "random" }"#,
        )
        .unwrap();

        assert_eq!(config.device, PathBuf::from("/dev/dri/card1"));
        assert_eq!(config.overlay_size, (640, 480));
        assert_eq!(config.animation, AnimMode::Random);
        assert_eq!(config.queue_depth, 3);
        assert!(config.overlay_enabled);
    }

    #[test]
    fn invalid_configs() {
        let result = Config::parse(r#"{ "queue_depth": 9 }"#);
        assert!(matches!(result, Err(ConfigError::QueueDepth(9))));
        assert!(matches!(Config::parse(r#"{ "colour": true }"#), Err(ConfigError::Parse { .. })));
        assert!(matches!(Config::parse("[]"), Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn explicit_missing_file_fails() {
        let result = Config::load(Some(Path::new("/nonexistent/planeflip.json")));
        assert!(matches!(result, Err(ConfigError::Read { .. })));
    }
}
