//! Token 成本估算模块：按模型价格表计算调用成本。
//!
//! Pricing lives on each model-format profile in the catalog; the orchestrator attaches
//! a [`CostEstimate`] to every `usage` event when the profile carries a price.

pub mod pricing;

pub use pricing::{CostEstimate, ModelPricing};
