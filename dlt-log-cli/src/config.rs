//! Configuration loading and parsing

use anyhow::{bail, Context, Result};
use dlt_log_engine::{EcuNode, EngineConfig, FilterRule, NamedFilterSet};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::Path;

/// Main application configuration (loaded from config.toml)
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,

    /// ECUs the `receive` command connects to
    #[serde(default)]
    pub ecus: Vec<EcuNode>,

    /// Active filter rules, applied in order
    #[serde(default)]
    pub filters: Vec<FilterRule>,

    #[serde(default)]
    pub default_filters: Vec<NamedFilterSet>,
}

/// Load configuration from a TOML file
pub fn load_config(path: &Path) -> Result<AppConfig> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {:?}", path))?;

    let config: AppConfig = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {:?}", path))?;

    validate(&config).with_context(|| format!("Invalid config file: {:?}", path))?;
    Ok(config)
}

fn validate(config: &AppConfig) -> Result<()> {
    config.engine.validate()?;

    let mut ids = HashSet::new();
    for ecu in &config.ecus {
        if ecu.id.is_empty() {
            bail!("ECU with empty id");
        }
        if !ids.insert(ecu.id) {
            bail!("ECU {} configured twice", ecu.id);
        }
    }

    let mut names = HashSet::new();
    for set in &config.default_filters {
        if !names.insert(set.name.as_str()) {
            bail!("default filter '{}' configured twice", set.name);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use dlt_log_engine::filter::FilterKind;
    use dlt_log_engine::Interface;

    #[test]
    fn test_config_deserialization() {
        let toml_content = r#"
            [engine.indexer]
            sort_by_time = true

            [engine.connection]
            log_file = "live.dlt"
            max_file_size_mb = 50

            [[ecus]]
            id = "ECU1"
            interface = { type = "tcp", host = "192.168.0.10", port = 3490 }
            auto_reconnect = true

            [[ecus]]
            id = "ECU2"
            interface = { type = "serial", port = "/dev/ttyUSB0", baud_rate = 115200 }

            [[filters]]
            name = "errors"
            log_level_max = 2

            [[filters]]
            name = "hide heartbeat"
            kind = "negative"
            payload_text = "heartbeat"

            [[default_filters]]
            name = "ecu1"
            rules = [{ name = "ecu1", ecu_id = "ECU1" }]
        "#;

        let config: AppConfig = toml::from_str(toml_content).unwrap();
        assert!(validate(&config).is_ok());
        assert!(config.engine.indexer.sort_by_time);
        assert!(config.engine.indexer.filters_enabled);
        assert_eq!(config.engine.connection.max_file_size_mb, 50);
        assert_eq!(config.ecus.len(), 2);
        assert!(config.ecus[0].auto_reconnect);
        assert!(matches!(config.ecus[1].interface, Interface::Serial { baud_rate: 115200, .. }));
        assert_eq!(config.filters[1].kind, FilterKind::Negative);
        assert_eq!(config.default_filters[0].rules.len(), 1);
    }

    #[test]
    fn test_duplicate_ecu_is_rejected() {
        let toml_content = r#"
            [[ecus]]
            id = "ECU1"
            interface = { type = "tcp", host = "localhost", port = 3490 }

            [[ecus]]
            id = "ECU1"
            interface = { type = "tcp", host = "localhost", port = 3491 }
        "#;

        let config: AppConfig = toml::from_str(toml_content).unwrap();
        assert!(validate(&config).is_err());
    }
}
