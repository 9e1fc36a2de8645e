//! Cost calculation from token counts
//!
//! `calculate` is deterministic and pure apart from the once-per-model
//! unknown-rate log. Rounding happens per component at 6 decimal places
//! and the total is the re-rounded sum of the rounded components, so the
//! breakdown always satisfies its own sum invariant exactly.

use std::collections::{HashMap, HashSet};

use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{GatewayError, GatewayResult};

/// Hard sanity ceiling; a single request costing more than this is a
/// calculation error, not a bill.
pub const MAX_REQUEST_COST_USD: f64 = 100.0;

const COST_EPSILON: f64 = 1e-6;

/// Per-1K-token rates for one model.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelRate {
    pub input_per_1k: f64,
    pub output_per_1k: f64,
}

impl ModelRate {
    pub const fn new(input_per_1k: f64, output_per_1k: f64) -> Self {
        Self {
            input_per_1k,
            output_per_1k,
        }
    }
}

/// Cost breakdown for a single request.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CostBreakdown {
    pub prompt_cost: f64,
    pub completion_cost: f64,
    pub cached_cost: f64,
    pub request_cost: f64,
    pub total_cost: f64,
    pub currency: &'static str,
}

impl CostBreakdown {
    pub fn zero() -> Self {
        Self {
            prompt_cost: 0.0,
            completion_cost: 0.0,
            cached_cost: 0.0,
            request_cost: 0.0,
            total_cost: 0.0,
            currency: "USD",
        }
    }

    /// Reject breakdowns with negative components, a drifting sum, or an
    /// implausible total.
    pub fn validate(&self) -> GatewayResult<()> {
        let components = [
            self.prompt_cost,
            self.completion_cost,
            self.cached_cost,
            self.request_cost,
        ];
        if components.iter().chain([&self.total_cost]).any(|c| *c < 0.0) {
            return Err(GatewayError::Internal(
                "cost breakdown has a negative component".into(),
            ));
        }
        let sum: f64 = components.iter().sum();
        if (sum - self.total_cost).abs() > COST_EPSILON {
            return Err(GatewayError::Internal(format!(
                "cost breakdown drift: components sum to {} but total is {}",
                sum, self.total_cost
            )));
        }
        if self.total_cost > MAX_REQUEST_COST_USD {
            return Err(GatewayError::Internal(format!(
                "cost breakdown total {} exceeds the {} ceiling",
                self.total_cost, MAX_REQUEST_COST_USD
            )));
        }
        Ok(())
    }
}

static DATE_SUFFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"-(\d{4}-\d{2}-\d{2}|latest|preview|stable)$").unwrap());

/// Normalize a model name for rate lookup: lowercase, drop any
/// `provider/` prefix, strip trailing date/channel suffixes. Idempotent.
pub fn normalize_model(model: &str) -> String {
    let lowered = model.to_ascii_lowercase();
    let base = lowered.rsplit_once('/').map(|(_, m)| m).unwrap_or(&lowered);
    let mut name = base.to_string();
    while let Some(m) = DATE_SUFFIX.find(&name) {
        name.truncate(m.start());
    }
    name
}

fn round6(value: f64) -> f64 {
    (value * 1_000_000.0).round() / 1_000_000.0
}

/// Rate table + calculation. The table is process-wide and read-mostly;
/// overrides arrive at construction or through `set_rate`.
pub struct CostCalculator {
    rates: RwLock<HashMap<String, ModelRate>>,
    fallback: ModelRate,
    unknown_logged: Mutex<HashSet<String>>,
}

impl CostCalculator {
    pub fn new() -> Self {
        Self::with_overrides(HashMap::new())
    }

    pub fn with_overrides(overrides: HashMap<String, ModelRate>) -> Self {
        let mut rates = seed_rates();
        for (model, rate) in overrides {
            rates.insert(normalize_model(&model), rate);
        }
        Self {
            rates: RwLock::new(rates),
            fallback: ModelRate::new(0.001, 0.002),
            unknown_logged: Mutex::new(HashSet::new()),
        }
    }

    /// Install or replace the rate for one model.
    pub fn set_rate(&self, model: &str, rate: ModelRate) {
        self.rates.write().insert(normalize_model(model), rate);
    }

    pub fn rate_for(&self, model: &str) -> Option<ModelRate> {
        self.rates.read().get(&normalize_model(model)).copied()
    }

    /// Compute the cost breakdown for one request.
    pub fn calculate(&self, model: &str, prompt_tokens: u32, completion_tokens: u32) -> CostBreakdown {
        let normalized = normalize_model(model);
        let rate = match self.rates.read().get(&normalized) {
            Some(rate) => *rate,
            None => {
                let mut logged = self.unknown_logged.lock();
                if logged.insert(normalized.clone()) {
                    warn!(model = %normalized, "no rate for model, using fallback rate");
                }
                self.fallback
            }
        };

        let prompt_cost = round6(prompt_tokens as f64 / 1000.0 * rate.input_per_1k);
        let completion_cost = round6(completion_tokens as f64 / 1000.0 * rate.output_per_1k);
        let cached_cost = 0.0;
        let request_cost = 0.0;
        let total_cost = round6(prompt_cost + completion_cost + cached_cost + request_cost);

        CostBreakdown {
            prompt_cost,
            completion_cost,
            cached_cost,
            request_cost,
            total_cost,
            currency: "USD",
        }
    }
}

impl Default for CostCalculator {
    fn default() -> Self {
        Self::new()
    }
}

/// Well-known rates for the supported model families, per 1K tokens.
fn seed_rates() -> HashMap<String, ModelRate> {
    let seed: &[(&str, ModelRate)] = &[
        // OpenAI GPT-4 family
        ("gpt-4", ModelRate::new(0.03, 0.06)),
        ("gpt-4-32k", ModelRate::new(0.06, 0.12)),
        ("gpt-4-turbo", ModelRate::new(0.01, 0.03)),
        ("gpt-4o", ModelRate::new(0.0025, 0.01)),
        ("gpt-4o-mini", ModelRate::new(0.00015, 0.0006)),
        ("gpt-3.5-turbo", ModelRate::new(0.0005, 0.0015)),
        // Anthropic Claude 3 family
        ("claude-3-opus", ModelRate::new(0.015, 0.075)),
        ("claude-3-sonnet", ModelRate::new(0.003, 0.015)),
        ("claude-3-haiku", ModelRate::new(0.00025, 0.00125)),
        ("claude-3-5-sonnet", ModelRate::new(0.003, 0.015)),
        ("claude-3-5-haiku", ModelRate::new(0.001, 0.005)),
        // Gemini 1.0 / 1.5 family
        ("gemini-1.0-pro", ModelRate::new(0.0005, 0.0015)),
        ("gemini-1.5-pro", ModelRate::new(0.00125, 0.005)),
        ("gemini-1.5-flash", ModelRate::new(0.000075, 0.0003)),
        // Embeddings
        ("text-embedding-3-small", ModelRate::new(0.00002, 0.0)),
        ("text-embedding-3-large", ModelRate::new(0.00013, 0.0)),
        ("text-embedding-ada-002", ModelRate::new(0.0001, 0.0)),
    ];
    seed.iter()
        .map(|(model, rate)| (model.to_string(), *rate))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_strips_provider_prefix() {
        assert_eq!(normalize_model("openai/gpt-4o"), "gpt-4o");
        assert_eq!(normalize_model("anthropic/claude-3-haiku"), "claude-3-haiku");
    }

    #[test]
    fn test_normalize_strips_date_suffix() {
        assert_eq!(normalize_model("claude-3-haiku-2024-03-07"), "claude-3-haiku");
        assert_eq!(normalize_model("gemini-1.5-flash-latest"), "gemini-1.5-flash");
        assert_eq!(normalize_model("gpt-4o-preview"), "gpt-4o");
        assert_eq!(normalize_model("gemini-1.0-pro-stable"), "gemini-1.0-pro");
    }

    #[test]
    fn test_normalize_is_idempotent() {
        for model in [
            "OpenAI/GPT-4o-2024-05-13",
            "claude-3-5-sonnet-latest",
            "gemini-1.5-pro",
            "models/gemini-1.5-flash-preview",
        ] {
            let once = normalize_model(model);
            assert_eq!(normalize_model(&once), once, "not idempotent for {}", model);
        }
    }

    #[test]
    fn test_zero_tokens_zero_cost() {
        let calc = CostCalculator::new();
        let breakdown = calc.calculate("gpt-4o", 0, 0);
        assert_eq!(breakdown.total_cost, 0.0);
        assert!(breakdown.validate().is_ok());
    }

    #[test]
    fn test_calculate_known_model() {
        let calc = CostCalculator::new();
        let breakdown = calc.calculate("claude-3-haiku-2024-03-07", 1000, 2000);
        assert_eq!(breakdown.prompt_cost, 0.00025);
        assert_eq!(breakdown.completion_cost, 0.0025);
        assert_eq!(breakdown.total_cost, 0.002750);
        assert!(breakdown.validate().is_ok());
    }

    #[test]
    fn test_calculate_is_deterministic() {
        let calc = CostCalculator::new();
        let a = calc.calculate("gpt-4o", 1234, 567);
        let b = calc.calculate("gpt-4o", 1234, 567);
        assert_eq!(a, b);
    }

    #[test]
    fn test_unknown_model_uses_fallback() {
        let calc = CostCalculator::new();
        let breakdown = calc.calculate("some-unheard-of-model", 1000, 1000);
        assert_eq!(breakdown.prompt_cost, 0.001);
        assert_eq!(breakdown.completion_cost, 0.002);
    }

    #[test]
    fn test_sum_invariant_holds_exactly() {
        let calc = CostCalculator::new();
        // Awkward token counts that produce sub-cent components.
        for (p, c) in [(1, 1), (3, 1), (999, 1001), (123_456, 7_891)] {
            let b = calc.calculate("gpt-4o-mini", p, c);
            let sum = b.prompt_cost + b.completion_cost + b.cached_cost + b.request_cost;
            assert!((sum - b.total_cost).abs() <= 1e-6);
            assert!(b.validate().is_ok());
        }
    }

    #[test]
    fn test_validate_rejects_negative_component() {
        let breakdown = CostBreakdown {
            prompt_cost: -0.1,
            completion_cost: 0.1,
            cached_cost: 0.0,
            request_cost: 0.0,
            total_cost: 0.0,
            currency: "USD",
        };
        assert!(breakdown.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_drift() {
        let breakdown = CostBreakdown {
            prompt_cost: 0.5,
            completion_cost: 0.5,
            cached_cost: 0.0,
            request_cost: 0.0,
            total_cost: 0.5,
            currency: "USD",
        };
        assert!(breakdown.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_absurd_total() {
        let breakdown = CostBreakdown {
            prompt_cost: 150.0,
            completion_cost: 0.0,
            cached_cost: 0.0,
            request_cost: 0.0,
            total_cost: 150.0,
            currency: "USD",
        };
        assert!(breakdown.validate().is_err());
    }

    #[test]
    fn test_override_wins_over_seed() {
        let mut overrides = HashMap::new();
        overrides.insert("gpt-4o".to_string(), ModelRate::new(1.0, 2.0));
        let calc = CostCalculator::with_overrides(overrides);
        let b = calc.calculate("gpt-4o", 1000, 1000);
        assert_eq!(b.prompt_cost, 1.0);
        assert_eq!(b.completion_cost, 2.0);
    }
}
