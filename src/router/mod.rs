//! Model routing
//!
//! Maps an incoming model name to an ordered attempt plan over weighted
//! candidates. The first attempt is a weighted draw (inverse CDF over the
//! weight prefix sums); later attempts walk the remaining candidates in
//! declared order. The table is read-only after startup; changing routes
//! means restarting the process.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{GatewayError, GatewayResult};

pub const DEFAULT_RETRY_BUDGET: u32 = 2;

/// One resolution target for a route.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    pub provider: String,
    pub upstream_model: String,
    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_weight() -> u32 {
    1
}

/// Process-wide map from incoming model name to candidate list.
#[derive(Debug, Default)]
pub struct RouteTable {
    routes: HashMap<String, Vec<Candidate>>,
}

impl RouteTable {
    pub fn new(routes: HashMap<String, Vec<Candidate>>) -> Self {
        Self { routes }
    }

    /// Load from a JSON object `{ "model": [{provider, upstream_model, weight}] }`.
    pub fn from_json(raw: &str) -> GatewayResult<Self> {
        let routes: HashMap<String, Vec<Candidate>> = serde_json::from_str(raw)
            .map_err(|e| GatewayError::Internal(format!("invalid route table: {}", e)))?;
        for (model, candidates) in &routes {
            if candidates.is_empty() {
                return Err(GatewayError::Internal(format!(
                    "route '{}' has no candidates",
                    model
                )));
            }
        }
        Ok(Self { routes })
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> GatewayResult<Self> {
        let raw = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            GatewayError::Internal(format!(
                "cannot read route table {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        let table = Self::from_json(&raw)?;
        info!(routes = table.routes.len(), path = %path.as_ref().display(), "loaded route table");
        Ok(table)
    }

    pub fn get(&self, model: &str) -> Option<&[Candidate]> {
        self.routes.get(model).map(|c| c.as_slice())
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

/// Candidate selection plus retry policy parameters.
pub struct Router {
    table: RouteTable,
    retry_budget: u32,
    rng: Mutex<StdRng>,
}

impl Router {
    pub fn new(table: RouteTable, retry_budget: u32) -> Self {
        Self {
            table,
            retry_budget,
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Deterministic variant for tests.
    pub fn with_seed(table: RouteTable, retry_budget: u32, seed: u64) -> Self {
        Self {
            table,
            retry_budget,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    pub fn retry_budget(&self) -> u32 {
        self.retry_budget
    }

    /// Build the ordered attempt plan for an incoming model.
    ///
    /// Without a route entry, a `provider/model` name falls through to
    /// that provider directly; anything else is `no_route`.
    pub fn plan(&self, model: &str) -> GatewayResult<Vec<Candidate>> {
        if let Some(candidates) = self.table.get(model) {
            let mut rng = self.rng.lock();
            return Ok(attempt_order(candidates, &mut *rng));
        }
        if let Some((provider, upstream_model)) = model.split_once('/') {
            if !provider.is_empty() && !upstream_model.is_empty() {
                return Ok(vec![Candidate {
                    provider: provider.to_string(),
                    upstream_model: upstream_model.to_string(),
                    weight: 1,
                }]);
            }
        }
        Err(GatewayError::NoRoute(model.to_string()))
    }

    /// How long to wait before the next attempt after `err`, given the
    /// remaining request budget. `None` means go immediately; an error
    /// return means the retry-after exceeds what is left and the failure
    /// should surface now.
    pub fn retry_delay(
        err: &GatewayError,
        remaining: Duration,
    ) -> Result<Option<Duration>, GatewayError> {
        match err.retry_after() {
            Some(wait) if wait > remaining => Err(GatewayError::RateLimited {
                retry_after: Some(wait),
            }),
            Some(wait) => Ok(Some(wait)),
            None => Ok(None),
        }
    }
}

/// Order candidates for attempts: weighted first pick, then declared
/// order. All-zero weights degrade to a uniform draw.
fn attempt_order<R: Rng>(candidates: &[Candidate], rng: &mut R) -> Vec<Candidate> {
    if candidates.len() <= 1 {
        return candidates.to_vec();
    }

    let total: u64 = candidates.iter().map(|c| c.weight as u64).sum();
    let first = if total == 0 {
        rng.gen_range(0..candidates.len())
    } else {
        let draw = rng.gen_range(0..total);
        let mut acc = 0u64;
        let mut picked = candidates.len() - 1;
        for (i, candidate) in candidates.iter().enumerate() {
            acc += candidate.weight as u64;
            if draw < acc {
                picked = i;
                break;
            }
        }
        picked
    };

    let mut order = Vec::with_capacity(candidates.len());
    order.push(candidates[first].clone());
    for (i, candidate) in candidates.iter().enumerate() {
        if i != first {
            order.push(candidate.clone());
        }
    }
    order
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidates(weights: &[u32]) -> Vec<Candidate> {
        weights
            .iter()
            .enumerate()
            .map(|(i, &weight)| Candidate {
                provider: format!("p{}", i),
                upstream_model: "m".into(),
                weight,
            })
            .collect()
    }

    fn table_with(model: &str, list: Vec<Candidate>) -> RouteTable {
        let mut routes = HashMap::new();
        routes.insert(model.to_string(), list);
        RouteTable::new(routes)
    }

    #[test]
    fn test_plan_no_route() {
        let router = Router::with_seed(RouteTable::default(), 2, 1);
        let err = router.plan("gpt-4o").unwrap_err();
        assert_eq!(err.kind(), "no_route");
    }

    #[test]
    fn test_plan_provider_slash_model_fallthrough() {
        let router = Router::with_seed(RouteTable::default(), 2, 1);
        let plan = router.plan("openai/gpt-4o").unwrap();
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].provider, "openai");
        assert_eq!(plan[0].upstream_model, "gpt-4o");
    }

    #[test]
    fn test_weighted_draw_respects_ratios() {
        // weight 3:1 over many draws lands near 75/25.
        let mut rng = StdRng::seed_from_u64(42);
        let list = candidates(&[3, 1]);
        let mut first_counts = [0u32; 2];
        for _ in 0..4000 {
            let order = attempt_order(&list, &mut rng);
            let idx = if order[0].provider == "p0" { 0 } else { 1 };
            first_counts[idx] += 1;
        }
        let ratio = first_counts[0] as f64 / 4000.0;
        assert!((0.70..0.80).contains(&ratio), "ratio was {}", ratio);
    }

    #[test]
    fn test_all_zero_weights_degrade_to_uniform() {
        let mut rng = StdRng::seed_from_u64(7);
        let list = candidates(&[0, 0, 0]);
        let mut seen = [false; 3];
        for _ in 0..300 {
            let order = attempt_order(&list, &mut rng);
            for (i, c) in list.iter().enumerate() {
                if c.provider == order[0].provider {
                    seen[i] = true;
                }
            }
        }
        assert!(seen.iter().all(|&s| s));
    }

    #[test]
    fn test_attempt_order_covers_all_candidates_once() {
        let mut rng = StdRng::seed_from_u64(3);
        let list = candidates(&[5, 10, 1]);
        let order = attempt_order(&list, &mut rng);
        assert_eq!(order.len(), 3);
        let mut providers: Vec<&str> = order.iter().map(|c| c.provider.as_str()).collect();
        providers.sort();
        assert_eq!(providers, vec!["p0", "p1", "p2"]);
    }

    #[test]
    fn test_remaining_candidates_keep_declared_order() {
        // Whatever the draw picks first, the rest must follow declared order.
        let mut rng = StdRng::seed_from_u64(11);
        let list = candidates(&[1, 1, 1, 1]);
        for _ in 0..50 {
            let order = attempt_order(&list, &mut rng);
            let rest: Vec<usize> = order[1..]
                .iter()
                .map(|c| c.provider[1..].parse::<usize>().unwrap())
                .collect();
            let mut sorted = rest.clone();
            sorted.sort();
            assert_eq!(rest, sorted);
        }
    }

    #[test]
    fn test_route_table_from_json() {
        let table = RouteTable::from_json(
            r#"{"gpt-4o-mini": [{"provider": "anthropic", "upstream_model": "claude-3-haiku", "weight": 100}]}"#,
        )
        .unwrap();
        let candidates = table.get("gpt-4o-mini").unwrap();
        assert_eq!(candidates[0].provider, "anthropic");
        assert_eq!(candidates[0].weight, 100);
    }

    #[test]
    fn test_route_table_rejects_empty_candidates() {
        assert!(RouteTable::from_json(r#"{"gpt-4o": []}"#).is_err());
    }

    #[test]
    fn test_route_table_default_weight() {
        let table = RouteTable::from_json(
            r#"{"m": [{"provider": "openai", "upstream_model": "gpt-4o"}]}"#,
        )
        .unwrap();
        assert_eq!(table.get("m").unwrap()[0].weight, 1);
    }

    #[test]
    fn test_retry_delay_respects_deadline() {
        let err = GatewayError::RateLimited {
            retry_after: Some(Duration::from_secs(1)),
        };
        // Fits in the remaining budget: sleep then retry.
        assert_eq!(
            Router::retry_delay(&err, Duration::from_secs(5)).unwrap(),
            Some(Duration::from_secs(1))
        );
        // Exceeds it: surface immediately.
        assert!(Router::retry_delay(&err, Duration::from_millis(100)).is_err());
        // Non-rate-limit errors retry without sleeping.
        let err = GatewayError::UpstreamError("503".into());
        assert_eq!(Router::retry_delay(&err, Duration::from_secs(5)).unwrap(), None);
    }
}
