//! Model pricing and cost estimation.

use crate::types::Usage;
use serde::{Deserialize, Serialize};

/// Price list entry attached to a model-format profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelPricing {
    pub input_cost_per_1k: f64,
    pub output_cost_per_1k: f64,
    #[serde(default = "default_currency")]
    pub currency: String,
}

fn default_currency() -> String {
    "USD".into()
}

impl ModelPricing {
    pub fn new(input: f64, output: f64) -> Self {
        Self {
            input_cost_per_1k: input,
            output_cost_per_1k: output,
            currency: default_currency(),
        }
    }

    pub fn calculate_cost(&self, usage: &Usage) -> CostEstimate {
        let ic = (usage.input_tokens as f64 / 1000.0) * self.input_cost_per_1k;
        let oc = (usage.output_tokens as f64 / 1000.0) * self.output_cost_per_1k;
        CostEstimate {
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            input_cost: ic,
            output_cost: oc,
            total_cost: ic + oc,
            currency: self.currency.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostEstimate {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub input_cost: f64,
    pub output_cost: f64,
    pub total_cost: f64,
    pub currency: String,
}

impl CostEstimate {
    pub fn format(&self) -> String {
        format!("{} {:.6}", self.currency, self.total_cost)
    }
}
