use serde::{Deserialize, Serialize};

use super::types::ModelTier;

pub const TOKENS_PER_MILLION: f64 = 1_000_000.0;

/// 档位到具体模型 id 的映射
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierModels {
    pub fast: String,
    pub smart: String,
    pub deep: String,
}

impl Default for TierModels {
    fn default() -> Self {
        Self {
            fast: "claude-3-5-haiku-latest".to_string(),
            smart: "claude-sonnet-4-20250514".to_string(),
            deep: "claude-opus-4-20250514".to_string(),
        }
    }
}

impl TierModels {
    pub fn model_for(&self, tier: ModelTier) -> &str {
        match tier {
            ModelTier::Fast => &self.fast,
            ModelTier::Smart => &self.smart,
            ModelTier::Deep => &self.deep,
        }
    }

    pub fn tier_of(&self, model: &str) -> Option<ModelTier> {
        ModelTier::ALL
            .into_iter()
            .find(|tier| self.model_for(*tier) == model)
    }
}

/// 每百万 token 的美元价格
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct TierRates {
    pub input_per_million: f64,
    pub output_per_million: f64,
}

impl TierRates {
    pub const fn new(input_per_million: f64, output_per_million: f64) -> Self {
        Self {
            input_per_million,
            output_per_million,
        }
    }

    pub fn cost(&self, tokens_in: u64, tokens_out: u64) -> f64 {
        (tokens_in as f64 * self.input_per_million + tokens_out as f64 * self.output_per_million)
            / TOKENS_PER_MILLION
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PricingTable {
    pub models: TierModels,
    pub fast: TierRates,
    pub smart: TierRates,
    pub deep: TierRates,
}

impl Default for PricingTable {
    fn default() -> Self {
        Self {
            models: TierModels::default(),
            fast: TierRates::new(0.80, 4.00),
            smart: TierRates::new(3.00, 15.00),
            deep: TierRates::new(15.00, 75.00),
        }
    }
}

impl PricingTable {
    pub fn with_models(models: TierModels) -> Self {
        Self {
            models,
            ..Self::default()
        }
    }

    pub fn rates(&self, tier: ModelTier) -> TierRates {
        match tier {
            ModelTier::Fast => self.fast,
            ModelTier::Smart => self.smart,
            ModelTier::Deep => self.deep,
        }
    }

    /// 未知模型按 smart 档计价
    pub fn rates_for_model(&self, model: &str) -> TierRates {
        let tier = self.models.tier_of(model).unwrap_or(ModelTier::Smart);
        self.rates(tier)
    }

    pub fn cost(&self, model: &str, tokens_in: u64, tokens_out: u64) -> f64 {
        self.rates_for_model(model).cost(tokens_in, tokens_out)
    }
}
