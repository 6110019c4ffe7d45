use std::{collections::HashMap, fs, path::Path, sync::Arc};

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::error::ApiError;

/// Supported upstream providers. Adapter selection is a pure function of this
/// value.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Provider {
    Groq,
    Chutes,
    Cerebras,
    Openrouter,
    Ollama,
}

/// Static catalog entry. Loaded once at process start; never mutated at
/// runtime. Adding or removing a model is a configuration-deploy event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelDescriptor {
    pub id: String,
    pub name: String,
    pub provider: Provider,
    pub upstream_id: String,
    pub context_window: u32,
    pub max_output_tokens: u32,
    pub supports_streaming: bool,
    pub supports_reasoning: bool,
    #[serde(default)]
    pub price_per_1k_input_micro: i64,
    #[serde(default)]
    pub price_per_1k_output_micro: i64,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Deserialize)]
struct ModelCatalogFile {
    models: Vec<ModelDescriptor>,
}

pub struct ModelRegistry {
    models: Vec<Arc<ModelDescriptor>>,
    by_id: HashMap<String, Arc<ModelDescriptor>>,
}

const DEFAULT_CATALOG: &str = include_str!("../models.default.yaml");

impl ModelRegistry {
    pub fn from_yaml(yaml: &str) -> Result<Self, ApiError> {
        let catalog: ModelCatalogFile = serde_yaml::from_str(yaml)
            .map_err(|e| ApiError::Internal(format!("failed to parse model catalog: {}", e)))?;
        if catalog.models.is_empty() {
            return Err(ApiError::Internal("model catalog is empty".to_string()));
        }

        let models: Vec<Arc<ModelDescriptor>> =
            catalog.models.into_iter().map(Arc::new).collect();
        let mut by_id = HashMap::with_capacity(models.len());
        for model in &models {
            if by_id.insert(model.id.clone(), model.clone()).is_some() {
                return Err(ApiError::Internal(format!(
                    "duplicate model id '{}' in catalog",
                    model.id
                )));
            }
        }
        Ok(Self { models, by_id })
    }

    /// Loads the catalog from `path`, falling back to the catalog embedded at
    /// build time when the file is absent.
    pub fn load(path: &str) -> Result<Self, ApiError> {
        if Path::new(path).exists() {
            let yaml = fs::read_to_string(path)
                .map_err(|e| ApiError::Internal(format!("failed to read {}: {}", path, e)))?;
            Self::from_yaml(&yaml)
        } else {
            tracing::info!("model catalog {} not found, using built-in defaults", path);
            Self::from_yaml(DEFAULT_CATALOG)
        }
    }

    pub fn by_id(&self, id: &str) -> Option<Arc<ModelDescriptor>> {
        self.by_id.get(id).cloned()
    }

    pub fn by_provider(&self, provider: Provider) -> Vec<Arc<ModelDescriptor>> {
        self.models
            .iter()
            .filter(|m| m.provider == provider)
            .cloned()
            .collect()
    }

    pub fn reasoning_capable(&self) -> Vec<Arc<ModelDescriptor>> {
        self.models
            .iter()
            .filter(|m| m.supports_reasoning)
            .cloned()
            .collect()
    }

    pub fn all(&self) -> &[Arc<ModelDescriptor>] {
        &self.models
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_catalog_parses() {
        let registry = ModelRegistry::from_yaml(DEFAULT_CATALOG).unwrap();
        assert!(!registry.all().is_empty());

        let kimi = registry.by_id("kimi").unwrap();
        assert_eq!(kimi.provider, Provider::Groq);
        assert_eq!(kimi.upstream_id, "moonshotai/kimi-k2-instruct-0905");
        assert_eq!(kimi.price_per_1k_input_micro, 0);
    }

    #[test]
    fn unknown_model_is_none() {
        let registry = ModelRegistry::from_yaml(DEFAULT_CATALOG).unwrap();
        assert!(registry.by_id("no-such-model").is_none());
    }

    #[test]
    fn by_provider_filters() {
        let registry = ModelRegistry::from_yaml(DEFAULT_CATALOG).unwrap();
        let local = registry.by_provider(Provider::Ollama);
        assert!(!local.is_empty());
        assert!(local.iter().all(|m| m.provider == Provider::Ollama));
    }

    #[test]
    fn reasoning_capable_matches_flag() {
        let registry = ModelRegistry::from_yaml(DEFAULT_CATALOG).unwrap();
        let reasoning = registry.reasoning_capable();
        assert!(reasoning.iter().all(|m| m.supports_reasoning));
        assert!(reasoning.iter().any(|m| m.id == "qwen3"));
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let yaml = r#"
models:
  - { id: a, name: A, provider: groq, upstream_id: a, context_window: 1, max_output_tokens: 1, supports_streaming: true, supports_reasoning: false }
  - { id: a, name: A2, provider: groq, upstream_id: a2, context_window: 1, max_output_tokens: 1, supports_streaming: true, supports_reasoning: false }
"#;
        assert!(ModelRegistry::from_yaml(yaml).is_err());
    }
}
