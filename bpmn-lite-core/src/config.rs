//! Immutable process-wide configuration, loaded once at startup (§6, §9
//! "Global datasource / system-variable config" design note).

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use std::collections::BTreeMap;

/// One entry of the `DS` datasource map: a connector id resolves to an
/// HTTP base url (and a type tag, carried but not interpreted).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Datasource {
    #[serde(rename = "type")]
    pub kind: String,
    pub url: String,
}

/// Loaded once from the environment and wrapped in an `Arc`; never
/// mutated afterward.
#[derive(Clone, Debug)]
pub struct SystemConfig {
    pub port: u16,
    pub system_vars: Json,
    pub datasources: BTreeMap<String, Datasource>,
    pub models_dir: String,
}

impl SystemConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let port = std::env::var("PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(9000);

        let system_vars = match std::env::var("SYSTEM_VARS") {
            Ok(raw) => serde_json::from_str(&raw)?,
            Err(_) => Json::Object(Default::default()),
        };

        let datasources = match std::env::var("DS") {
            Ok(raw) => serde_json::from_str(&raw)?,
            Err(_) => BTreeMap::new(),
        };

        let models_dir =
            std::env::var("MODELS_DIR").unwrap_or_else(|_| "./models".to_string());

        Ok(Self {
            port,
            system_vars,
            datasources,
            models_dir,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_when_env_unset() {
        std::env::remove_var("PORT");
        std::env::remove_var("SYSTEM_VARS");
        std::env::remove_var("DS");
        std::env::remove_var("MODELS_DIR");

        let config = SystemConfig::from_env().unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.models_dir, "./models");
        assert!(config.datasources.is_empty());
    }

    #[test]
    fn parses_datasources_from_env() {
        std::env::set_var("DS", r#"{"crm":{"type":"http","url":"http://crm.local"}}"#);
        let config = SystemConfig::from_env().unwrap();
        assert_eq!(config.datasources["crm"].url, "http://crm.local");
        std::env::remove_var("DS");
    }
}
