use std::collections::HashMap;

use thiserror::Error;

use crate::provider::{CommandConfig, Provider};

#[derive(Error, Debug, PartialEq, Eq)]
#[error("unknown provider `{name}`; available providers: {available}")]
pub struct UnknownProviderError {
    pub name: String,
    pub available: String,
}

/// Maps provider names to their `CommandConfig`. Built-in presets are always
/// present; callers may register additional named configs (e.g. from config
/// files describing other agent CLIs).
pub struct ProviderRegistry {
    configs: HashMap<String, CommandConfig>,
}

impl ProviderRegistry {
    pub fn with_builtins() -> Self {
        let mut configs = HashMap::new();
        for cfg in [CommandConfig::claude(), CommandConfig::kiro()] {
            configs.insert(cfg.name.clone(), cfg);
        }
        ProviderRegistry { configs }
    }

    pub fn register(&mut self, config: CommandConfig) {
        self.configs.insert(config.name.clone(), config);
    }

    pub fn get(&self, name: &str) -> Result<Provider, UnknownProviderError> {
        self.configs
            .get(name)
            .cloned()
            .map(Provider::new)
            .ok_or_else(|| UnknownProviderError {
                name: name.to_string(),
                available: self.available_names().join(", "),
            })
    }

    pub fn available_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.configs.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtins_resolve() {
        let registry = ProviderRegistry::with_builtins();
        assert_eq!(registry.get("claude").unwrap().name(), "claude");
        assert_eq!(registry.get("kiro").unwrap().name(), "kiro");
    }

    #[test]
    fn unknown_provider_lists_available_names() {
        let registry = ProviderRegistry::with_builtins();
        let err = registry.get("nonexistent").unwrap_err();
        assert_eq!(err.name, "nonexistent");
        assert_eq!(err.available, "claude, kiro");
    }

    #[test]
    fn register_adds_a_custom_preset() {
        let mut registry = ProviderRegistry::with_builtins();
        registry.register(CommandConfig {
            name: "custom".to_string(),
            binary: "custom-cli".to_string(),
            subcommand: None,
            prompt_flag: Some("--prompt".to_string()),
            permission_flags: vec![],
            extra_flags: vec![],
            strip_ansi: false,
        });
        assert!(registry.get("custom").is_ok());
    }
}
