use std::collections::{HashMap, HashSet};
use std::path::Path;

use serde::Deserialize;

use crate::live_object::error::ConfigError;
use crate::live_object::ChainId;
use crate::types::config::chain::{deserialize_chain_id, ChainConfig};
use crate::types::config::contract::{is_valid_group_name, ContractGroups};
use crate::types::config::runtime::RuntimeConfig;

/// Per-entity overrides.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LiveObjectConfig {
    /// Replaces the entity's built-in chain set. Empty means every chain.
    #[serde(default, deserialize_with = "deserialize_chain_ids")]
    pub chains: Option<Vec<ChainId>>,
}

fn deserialize_chain_ids<'de, D>(deserializer: D) -> Result<Option<Vec<ChainId>>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    struct Wrapped(#[serde(deserialize_with = "deserialize_chain_id")] ChainId);

    let ids = Option::<Vec<Wrapped>>::deserialize(deserializer)?;
    Ok(ids.map(|ids| ids.into_iter().map(|Wrapped(id)| id).collect()))
}

#[derive(Debug, Clone, Deserialize)]
pub struct IndexerConfig {
    pub chains: Vec<ChainConfig>,
    #[serde(default)]
    pub contract_groups: ContractGroups,
    #[serde(default)]
    pub live_objects: HashMap<String, LiveObjectConfig>,
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

impl IndexerConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidConfigFile {
            path: path.display().to_string(),
            reason,
        };
        let content = std::fs::read_to_string(path).map_err(|e| invalid(e.to_string()))?;
        let config: IndexerConfig = serde_json::from_str(&content).map_err(|e| invalid(e.to_string()))?;
        config.validate().map_err(invalid)?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), String> {
        let mut names = HashSet::new();
        let mut ids = HashSet::new();
        for chain in &self.chains {
            if !names.insert(chain.name.as_str()) {
                return Err(format!("chain name '{}' configured twice", chain.name));
            }
            if !ids.insert(chain.chain_id.as_str()) {
                return Err(format!("chain id '{}' configured twice", chain.chain_id));
            }
        }

        for (group, per_chain) in &self.contract_groups {
            if !is_valid_group_name(group) {
                return Err(format!(
                    "contract group '{}' is not of the form 'namespace.ContractGroup'",
                    group
                ));
            }
            for chain_id in per_chain.keys() {
                if !ids.contains(chain_id.as_str()) {
                    tracing::warn!(
                        "Contract group {} lists chain {} which is not configured",
                        group,
                        chain_id
                    );
                }
            }
        }
        Ok(())
    }

    /// Chain set overrides keyed by entity name.
    pub fn chain_overrides(&self) -> HashMap<String, Vec<ChainId>> {
        self.live_objects
            .iter()
            .filter_map(|(entity, config)| Some((entity.clone(), config.chains.clone()?)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"{
        "chains": [
            { "name": "eth", "chain_id": 1, "rpc_url_env_var": "ETH_RPC_URL" },
            { "name": "arbitrum", "chain_id": "42161" }
        ],
        "contract_groups": {
            "allo.Registry": { "1": "0x4aacca72145e1df2aec137e1f3c5e3d75db8b5f3" }
        },
        "live_objects": {
            "Project": { "chains": [1, "42161"] },
            "Pool": {}
        },
        "runtime": { "handler_concurrency": 8 }
    }"#;

    fn write_config(name: &str, content: &str) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(format!("live-object-indexer-{}-{}.json", name, std::process::id()));
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(content.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_load_sample_config() {
        let path = write_config("sample", SAMPLE);
        let config = IndexerConfig::load(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(config.chains.len(), 2);
        assert_eq!(config.runtime.handler_concurrency, 8);
        assert_eq!(
            config.chain_overrides().get("Project"),
            Some(&vec!["1".to_string(), "42161".to_string()])
        );
        assert!(!config.chain_overrides().contains_key("Pool"));
    }

    #[test]
    fn test_duplicate_chain_rejected() {
        let path = write_config(
            "dup",
            r#"{ "chains": [{ "name": "eth", "chain_id": 1 }, { "name": "mainnet", "chain_id": "1" }] }"#,
        );
        let err = IndexerConfig::load(&path).unwrap_err();
        std::fs::remove_file(&path).ok();

        assert!(matches!(err, ConfigError::InvalidConfigFile { reason, .. } if reason.contains("twice")));
    }

    #[test]
    fn test_malformed_group_rejected() {
        let path = write_config(
            "group",
            r#"{ "chains": [], "contract_groups": { "Registry": { "1": [] } } }"#,
        );
        let err = IndexerConfig::load(&path).unwrap_err();
        std::fs::remove_file(&path).ok();

        assert!(matches!(err, ConfigError::InvalidConfigFile { .. }));
    }

    #[test]
    fn test_missing_file_is_config_error() {
        let err = IndexerConfig::load(Path::new("/nonexistent/config.json")).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidConfigFile { .. }));
    }
}
