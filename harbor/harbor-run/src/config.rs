//! `harbor.toml`: engine limits, host capabilities and run policy.

use std::collections::BTreeMap;
use std::path::Path;

use harbor_wasm::{Capabilities, Capability, EngineConfig, HostConfig};
use serde::Deserialize;

use crate::RunError;

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct RunConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub host: HostSection,
    #[serde(default)]
    pub run: RunSection,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct HostSection {
    #[serde(default = "default_capabilities")]
    pub capabilities: Vec<Capability>,
    pub seed: Option<u64>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Pass the controller's own environment through, below `env`.
    #[serde(default)]
    pub inherit_env: bool,
}

fn default_capabilities() -> Vec<Capability> {
    Capability::ALL.to_vec()
}

impl Default for HostSection {
    fn default() -> Self {
        Self {
            capabilities: default_capabilities(),
            seed: None,
            env: BTreeMap::new(),
            inherit_env: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct RunSection {
    /// Wall-clock budget for the whole run; cancelled when it elapses.
    pub deadline_ms: Option<u64>,
}

impl RunConfig {
    pub fn from_file(path: &Path) -> Result<Self, RunError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| RunError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, RunError> {
        toml::from_str(content).map_err(|e| RunError::Config(format!("failed to parse config: {e}")))
    }

    pub fn capabilities(&self) -> Capabilities {
        self.host.capabilities.iter().copied().collect()
    }

    /// Host configuration for one run with the given module arguments.
    pub fn host_config(&self, args: Vec<String>) -> HostConfig {
        let mut env: BTreeMap<String, String> = if self.host.inherit_env {
            std::env::vars().collect()
        } else {
            BTreeMap::new()
        };
        env.extend(self.host.env.iter().map(|(k, v)| (k.clone(), v.clone())));
        HostConfig { args, env: env.into_iter().collect(), seed: self.host.seed }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let config = RunConfig::from_toml("").unwrap();
        assert_eq!(config.engine, EngineConfig::default());
        assert_eq!(config.capabilities(), Capabilities::all());
        assert_eq!(config.run.deadline_ms, None);
    }

    #[test]
    fn parses_full_config() {
        let toml_str = r#"
[engine]
entry = "main"
max_call_depth = 64
max_memory_pages = 16

[host]
capabilities = ["exit", "io"]
seed = 9
env = { B = "2", A = "1" }

[run]
deadline_ms = 1500
"#;
        let config = RunConfig::from_toml(toml_str).unwrap();
        assert_eq!(config.engine.entry, "main");
        assert_eq!(config.engine.max_call_depth, 64);
        assert_eq!(config.engine.max_memory_pages, 16);
        assert_eq!(config.engine.resume_export.as_deref(), Some("resume"));
        assert_eq!(config.capabilities(), Capabilities::EXIT | Capabilities::IO);
        assert_eq!(config.run.deadline_ms, Some(1500));

        let host = config.host_config(vec!["m.wasm".into()]);
        assert_eq!(host.seed, Some(9));
        assert_eq!(host.env, vec![("A".into(), "1".into()), ("B".into(), "2".into())]);
        assert_eq!(host.args, vec!["m.wasm".to_string()]);
    }

    #[test]
    fn rejects_unknown_capability() {
        let err = RunConfig::from_toml("[host]\ncapabilities = [\"network\"]\n").unwrap_err();
        assert!(matches!(err, RunError::Config(_)));
    }
}
