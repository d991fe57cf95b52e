//! Static model descriptors and the fallback map.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

/// Coarse grouping of models by vendor characteristics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelFamily {
    Claude,
    Gemini,
    Other,
}

/// Quota groups reset independently upstream; kept as an open string so new
/// groups don't require a code change.
pub type QuotaGroup = String;

#[derive(Debug, Clone)]
pub struct ModelDescriptor {
    pub id: String,
    pub family: ModelFamily,
    pub is_thinking: bool,
    pub max_output_tokens: u32,
    pub fallback_to: Option<String>,
    pub quota_group: QuotaGroup,
}

impl ModelDescriptor {
    pub fn family_of(id: &str) -> ModelFamily {
        if id.starts_with("claude") {
            ModelFamily::Claude
        } else if id.starts_with("gemini") {
            ModelFamily::Gemini
        } else {
            ModelFamily::Other
        }
    }
}

/// Known model catalog plus fallback graph. Validated acyclic at construction.
#[derive(Debug, Clone)]
pub struct ModelCatalog {
    descriptors: HashMap<String, ModelDescriptor>,
}

#[derive(Debug, thiserror::Error)]
pub enum ModelCatalogError {
    #[error("fallback map contains a cycle starting at '{0}'")]
    FallbackCycle(String),
}

impl ModelCatalog {
    pub fn new(descriptors: Vec<ModelDescriptor>) -> Result<Self, ModelCatalogError> {
        let by_id: HashMap<String, ModelDescriptor> =
            descriptors.into_iter().map(|d| (d.id.clone(), d)).collect();
        let catalog = Self { descriptors: by_id };
        catalog.validate_acyclic()?;
        Ok(catalog)
    }

    pub fn default_catalog() -> Self {
        Self::new(vec![
            ModelDescriptor {
                id: "claude-opus-4-5".to_string(),
                family: ModelFamily::Claude,
                is_thinking: true,
                max_output_tokens: 32_000,
                fallback_to: Some("claude-sonnet-4-5".to_string()),
                quota_group: "claude".to_string(),
            },
            ModelDescriptor {
                id: "claude-sonnet-4-5".to_string(),
                family: ModelFamily::Claude,
                is_thinking: true,
                max_output_tokens: 64_000,
                fallback_to: None,
                quota_group: "claude".to_string(),
            },
            ModelDescriptor {
                id: "gemini-3-pro".to_string(),
                family: ModelFamily::Gemini,
                is_thinking: true,
                max_output_tokens: 65_536,
                fallback_to: Some("gemini-3-flash".to_string()),
                quota_group: "gemini".to_string(),
            },
            ModelDescriptor {
                id: "gemini-3-flash".to_string(),
                family: ModelFamily::Gemini,
                is_thinking: false,
                max_output_tokens: 32_768,
                fallback_to: None,
                quota_group: "gemini".to_string(),
            },
        ])
        .expect("built-in catalog is acyclic")
    }

    pub fn get(&self, id: &str) -> Option<&ModelDescriptor> {
        self.descriptors.get(id)
    }

    /// Descriptor for an unknown model id, treated as a non-thinking "other"
    /// family model so requests for custom/self-hosted models still route.
    pub fn get_or_default(&self, id: &str) -> ModelDescriptor {
        self.descriptors.get(id).cloned().unwrap_or_else(|| ModelDescriptor {
            id: id.to_string(),
            family: ModelDescriptor::family_of(id),
            is_thinking: false,
            max_output_tokens: 8192,
            fallback_to: None,
            quota_group: "other".to_string(),
        })
    }

    pub fn fallback_for(&self, id: &str) -> Option<&str> {
        self.descriptors.get(id).and_then(|d| d.fallback_to.as_deref())
    }

    pub fn ids(&self) -> Vec<String> {
        self.descriptors.keys().cloned().collect()
    }

    fn validate_acyclic(&self) -> Result<(), ModelCatalogError> {
        for start in self.descriptors.keys() {
            let mut visited = HashSet::new();
            let mut current = start.as_str();
            loop {
                if !visited.insert(current) {
                    return Err(ModelCatalogError::FallbackCycle(start.clone()));
                }
                match self.descriptors.get(current).and_then(|d| d.fallback_to.as_deref()) {
                    Some(next) => current = next,
                    None => break,
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_catalog_is_acyclic() {
        let _ = ModelCatalog::default_catalog();
    }

    #[test]
    fn rejects_two_cycle() {
        let result = ModelCatalog::new(vec![
            ModelDescriptor {
                id: "a".to_string(),
                family: ModelFamily::Other,
                is_thinking: false,
                max_output_tokens: 1000,
                fallback_to: Some("b".to_string()),
                quota_group: "x".to_string(),
            },
            ModelDescriptor {
                id: "b".to_string(),
                family: ModelFamily::Other,
                is_thinking: false,
                max_output_tokens: 1000,
                fallback_to: Some("a".to_string()),
                quota_group: "x".to_string(),
            },
        ]);
        assert!(matches!(result, Err(ModelCatalogError::FallbackCycle(_))));
    }

    #[test]
    fn family_inferred_from_id_prefix() {
        assert_eq!(ModelDescriptor::family_of("claude-sonnet-4-5"), ModelFamily::Claude);
        assert_eq!(ModelDescriptor::family_of("gemini-3-pro"), ModelFamily::Gemini);
        assert_eq!(ModelDescriptor::family_of("llama-3"), ModelFamily::Other);
    }
}
