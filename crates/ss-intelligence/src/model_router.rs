//! Maps the scorer's model tier to a concrete model id and credit cost.

use serde::{Deserialize, Serialize};

use ss_core::score::ModelTier;

use crate::llm::LlmConfig;

/// One routable model with its abstract credit cost per analysis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSpec {
    pub id: String,
    pub credit_cost: f64,
    pub max_tokens: u32,
}

/// The three-tier model catalog. Defaults approximate vendor pricing
/// ratios; credit costs are abstract units, not dollars.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelCatalog {
    pub high: ModelSpec,
    pub medium: ModelSpec,
    pub small: ModelSpec,
}

impl Default for ModelCatalog {
    fn default() -> Self {
        Self {
            high: ModelSpec {
                id: "claude-opus-4-20250514".into(),
                credit_cost: 5.0,
                max_tokens: 8192,
            },
            medium: ModelSpec {
                id: "claude-sonnet-4-20250514".into(),
                credit_cost: 2.0,
                max_tokens: 4096,
            },
            small: ModelSpec {
                id: "claude-haiku-4-20250514".into(),
                credit_cost: 1.0,
                max_tokens: 2048,
            },
        }
    }
}

impl ModelCatalog {
    pub fn spec_for(&self, tier: ModelTier) -> &ModelSpec {
        match tier {
            ModelTier::High => &self.high,
            ModelTier::Medium => &self.medium,
            ModelTier::Small => &self.small,
        }
    }

    /// Build the request config for an analysis at the given model tier.
    pub fn llm_config_for(&self, tier: ModelTier) -> LlmConfig {
        let spec = self.spec_for(tier);
        LlmConfig {
            model: spec.id.clone(),
            max_tokens: spec.max_tokens,
            temperature: 0.2,
            system_prompt: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn costs_decrease_down_the_catalog() {
        let catalog = ModelCatalog::default();
        assert!(catalog.high.credit_cost > catalog.medium.credit_cost);
        assert!(catalog.medium.credit_cost > catalog.small.credit_cost);
    }

    #[test]
    fn config_carries_the_tier_model() {
        let catalog = ModelCatalog::default();
        let config = catalog.llm_config_for(ModelTier::Small);
        assert_eq!(config.model, catalog.small.id);
        assert_eq!(config.max_tokens, catalog.small.max_tokens);
    }
}
