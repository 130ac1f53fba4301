//! Layered configuration (§10): defaults → optional config file → environment
//! variable overrides, mirroring the donor agent framework's `AgentConfig`
//! load/validate/round-trip pattern.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};
use crate::ingestion::types::IngestionConfig;

/// OpenRouter-facing provider settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_completion_model")]
    pub completion_model: String,
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,
    #[serde(default = "default_enrichment_model")]
    pub enrichment_model: String,
}

fn default_base_url() -> String {
    "https://openrouter.ai/api/v1".to_string()
}

fn default_completion_model() -> String {
    "openai/gpt-4o-mini".to_string()
}

fn default_embedding_model() -> String {
    "text-embedding-3-small".to_string()
}

fn default_enrichment_model() -> String {
    "openai/gpt-4o-mini".to_string()
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: default_base_url(),
            completion_model: default_completion_model(),
            embedding_model: default_embedding_model(),
            enrichment_model: default_enrichment_model(),
        }
    }
}

/// On-disk layout and vector store backend selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_content_dir")]
    pub content_dir: String,
    #[serde(default)]
    pub use_vectra: bool,
}

fn default_content_dir() -> String {
    "content".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            content_dir: default_content_dir(),
            use_vectra: false,
        }
    }
}

/// Ingestion-pipeline knobs surfaced at the top level of the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestSettings {
    #[serde(default)]
    pub llm_augmented_chunking: bool,
    #[serde(default = "default_prompt_version")]
    pub enrichment_prompt_version: String,
}

fn default_prompt_version() -> String {
    "v1".to_string()
}

impl Default for IngestSettings {
    fn default() -> Self {
        Self {
            llm_augmented_chunking: false,
            enrichment_prompt_version: default_prompt_version(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub ingest: IngestSettings,
}

impl Config {
    /// Defaults overlaid with `path` (dispatched on extension), then
    /// environment variable overrides from §6's table.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) if p.exists() => Self::from_file(p)?,
            _ => Self::default(),
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let config = match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => {
                toml::from_str(&content).map_err(|e| CoreError::Validation(format!("invalid config file: {e}")))?
            }
            Some("yaml") | Some("yml") => {
                serde_yml::from_str(&content).map_err(|e| CoreError::Validation(format!("invalid config file: {e}")))?
            }
            Some("json") => serde_json::from_str(&content)?,
            other => {
                return Err(CoreError::Validation(format!(
                    "unsupported config file extension: {other:?}"
                )))
            }
        };
        Ok(config)
    }

    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let content = match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => toml::to_string_pretty(self).map_err(|e| CoreError::Validation(e.to_string()))?,
            Some("yaml") | Some("yml") => serde_yml::to_string(self).map_err(|e| CoreError::Validation(e.to_string()))?,
            _ => serde_json::to_string_pretty(self)?,
        };
        std::fs::write(path, content)?;
        Ok(())
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(key) = std::env::var("OPENROUTER_API_KEY") {
            self.provider.api_key = Some(key);
        }
        if let Ok(model) = std::env::var("OPENROUTER_EMBEDDING_MODEL") {
            self.provider.embedding_model = model;
        }
        if let Ok(model) = std::env::var("OPENROUTER_CHUNK_ENRICHMENT_MODEL") {
            self.provider.enrichment_model = model;
        }
        if let Ok(flag) = std::env::var("ZOEFLOW_LLM_AUGMENTED_CHUNKING") {
            self.ingest.llm_augmented_chunking = flag == "1";
        }
        if let Ok(version) = std::env::var("ZOEFLOW_CHUNK_ENRICHMENT_PROMPT_VERSION") {
            self.ingest.enrichment_prompt_version = version;
        }
        if let Ok(flag) = std::env::var("USE_VECTRA") {
            self.storage.use_vectra = flag == "true";
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.provider.base_url.is_empty() {
            return Err(CoreError::Validation("provider.base_url must not be empty".to_string()));
        }
        if self.provider.embedding_model.is_empty() {
            return Err(CoreError::Validation(
                "provider.embedding_model must not be empty".to_string(),
            ));
        }
        if self.storage.content_dir.is_empty() {
            return Err(CoreError::Validation("storage.content_dir must not be empty".to_string()));
        }
        Ok(())
    }

    /// Projects the provider/ingest settings onto the pipeline's config shape.
    pub fn ingestion_config(&self) -> IngestionConfig {
        IngestionConfig {
            llm_augmented_chunking: self.ingest.llm_augmented_chunking,
            enrichment_prompt_version: self.ingest.enrichment_prompt_version.clone(),
            embedding_model: self.provider.embedding_model.clone(),
            enrichment_model: self.provider.enrichment_model.clone(),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn default_config_validates() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn to_file_then_from_file_round_trips_toml() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("zoeflow.toml");
        let mut config = Config::default();
        config.provider.embedding_model = "custom-model".to_string();
        config.to_file(&path).unwrap();

        let loaded = Config::from_file(&path).unwrap();
        assert_eq!(loaded.provider.embedding_model, "custom-model");
    }

    #[test]
    fn to_file_then_from_file_round_trips_yaml() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("zoeflow.yaml");
        let config = Config::default();
        config.to_file(&path).unwrap();
        let loaded = Config::from_file(&path).unwrap();
        assert_eq!(loaded.storage.content_dir, config.storage.content_dir);
    }

    #[test]
    fn validate_rejects_empty_base_url() {
        let mut config = Config::default();
        config.provider.base_url = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn env_override_sets_api_key() {
        std::env::set_var("OPENROUTER_API_KEY", "test-key-123");
        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config.provider.api_key.as_deref(), Some("test-key-123"));
        std::env::remove_var("OPENROUTER_API_KEY");
    }
}
