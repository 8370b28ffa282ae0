//! Runtime settings.
//!
//! Layered lowest to highest: compiled-in defaults, an optional
//! `config/local.toml`, then `DRAGNET_`-prefixed environment variables
//! with `__` separating nesting levels (`DRAGNET_SOURCE__PATH_PATTERN`
//! sets `source.path_pattern`). The binary applies its command-line
//! flags on top as overrides.

use std::path::PathBuf;

use config::{Config, Environment, File, FileFormat};
use serde::Deserialize;

const DEFAULTS: &str = include_str!("../config/default.toml");

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub source: SourceSettings,
    pub index: IndexSettings,
    pub pipeline: PipelineSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceSettings {
    /// Directory root the local datasource walks.
    pub root: PathBuf,
    /// Date pattern encoded in paths under the root, for pruning.
    pub path_pattern: Option<String>,
    /// Record field holding the timestamp.
    pub time_field: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IndexSettings {
    /// Directory where published index files live.
    pub dir: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineSettings {
    /// Bounded capacity of each inter-stage channel.
    pub channel_capacity: usize,
}

impl Settings {
    pub fn new() -> Result<Self, config::ConfigError> {
        Self::with_overrides(&[])
    }

    /// Loads settings with caller-supplied overrides (dotted keys such
    /// as `source.root`) applied above every other layer.
    pub fn with_overrides(overrides: &[(&str, String)]) -> Result<Self, config::ConfigError> {
        let mut builder = Config::builder()
            .add_source(File::from_str(DEFAULTS, FileFormat::Toml))
            .add_source(File::with_name("config/local").required(false))
            .add_source(
                Environment::with_prefix("DRAGNET")
                    .prefix_separator("_")
                    .separator("__"),
            );
        for (key, value) in overrides {
            builder = builder.set_override(*key, value.clone())?;
        }
        builder.build()?.try_deserialize()
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            source: SourceSettings {
                root: PathBuf::from("data"),
                path_pattern: None,
                time_field: None,
            },
            index: IndexSettings {
                dir: PathBuf::from("indexes"),
            },
            pipeline: PipelineSettings {
                channel_capacity: 64,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Once;

    static INIT: Once = Once::new();

    fn setup() {
        INIT.call_once(|| {
            std::env::set_var("DRAGNET_SOURCE__ROOT", "/srv/records");
            std::env::set_var("DRAGNET_SOURCE__PATH_PATTERN", "%Y/%m/%d");
        });
    }

    #[test]
    fn default_settings() {
        let settings = Settings::default();
        assert_eq!(settings.source.root, PathBuf::from("data"));
        assert_eq!(settings.pipeline.channel_capacity, 64);
    }

    #[test]
    fn environment_override() {
        setup();
        let settings = Settings::new().unwrap();
        assert_eq!(settings.source.root, PathBuf::from("/srv/records"));
    }

    #[test]
    fn environment_reaches_two_word_keys() {
        setup();
        let settings = Settings::new().unwrap();
        assert_eq!(settings.source.path_pattern.as_deref(), Some("%Y/%m/%d"));
    }

    #[test]
    fn explicit_override_wins() {
        setup();
        let settings =
            Settings::with_overrides(&[("source.root", "/var/records".to_string())]).unwrap();
        assert_eq!(settings.source.root, PathBuf::from("/var/records"));
    }
}
