//! # Configuration Module
//!
//! YAML configuration with two top-level sections:
//! - `filters`: ordered list of filter rules, each naming the exporters it feeds
//! - `exporters`: exporter name -> open-ended config block, deserialized by the exporter at init

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use log::debug;
use serde::Deserialize;

use crate::error::PipelineError;
use crate::filter::FilterConfig;

/// Configuration used when no config file is given.
pub const DEFAULT_CONFIG: &str = include_str!("../assets/default-config.yaml");

/// Raw, per-exporter config block. Each exporter deserializes its own shape.
pub type ExporterConfig = serde_yaml::Value;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub filters: Vec<FilterConfig>,
    pub exporters: HashMap<String, ExporterConfig>,
}

impl Config {
    /// Parses a YAML document.
    pub fn parse(content: &str) -> Result<Self, PipelineError> {
        let config: Config = serde_yaml::from_str(content)?;
        debug!(
            "parsed config with {} filters and {} exporters",
            config.filters.len(),
            config.exporters.len()
        );
        Ok(config)
    }

    /// Loads the config file at `path`, or the embedded default when `path` is `None`.
    pub fn load(path: Option<&Path>) -> Result<Self, PipelineError> {
        match path {
            Some(path) => {
                let content =
                    fs::read_to_string(path).map_err(|source| PipelineError::ConfigRead {
                        path: path.to_path_buf(),
                        source,
                    })?;
                Self::parse(&content)
            }
            None => Self::parse(DEFAULT_CONFIG),
        }
    }

    /// Returns the config block of the named exporter, if declared.
    pub fn exporter(&self, name: &str) -> Option<&ExporterConfig> {
        self.exporters.get(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_parses() {
        let config = Config::parse(DEFAULT_CONFIG).unwrap();
        assert_eq!(config.filters.len(), 1);
        assert_eq!(config.filters[0].exporters, vec!["skywalking".to_string()]);
        assert!(config.exporter("skywalking").is_some());
    }

    #[test]
    fn test_parse_filters_and_exporters() {
        let config = Config::parse(
            r#"
filters:
  - reason: "Killed|Killing"
    minCount: 2
    exporters: [console]
  - type: Warning
    exporters: [console, skywalking]
exporters:
  console: {}
  skywalking:
    address: "oap:11800"
"#,
        )
        .unwrap();

        assert_eq!(config.filters.len(), 2);
        assert_eq!(config.filters[0].reason, "Killed|Killing");
        assert_eq!(config.filters[0].min_count, 2);
        assert_eq!(config.filters[1].event_type, "Warning");
        assert_eq!(config.filters[1].exporters.len(), 2);
        assert_eq!(config.exporters.len(), 2);
    }

    #[test]
    fn test_empty_document_is_empty_config() {
        let config = Config::parse("{}").unwrap();
        assert!(config.filters.is_empty());
        assert!(config.exporters.is_empty());
    }

    #[test]
    fn test_load_from_file_and_missing_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "filters: []\nexporters:\n  console: {{}}").unwrap();

        let config = Config::load(Some(file.path())).unwrap();
        assert!(config.exporter("console").is_some());

        let err = Config::load(Some(Path::new("/nonexistent/config.yaml"))).unwrap_err();
        assert!(matches!(err, PipelineError::ConfigRead { .. }));
    }

    #[test]
    fn test_invalid_yaml_is_error() {
        assert!(matches!(
            Config::parse("filters: [").unwrap_err(),
            PipelineError::ConfigParse(_)
        ));
    }
}
