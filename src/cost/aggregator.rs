//! Cost aggregation over the persistence adapter
//!
//! `process_batch` is the cost worker's unit of work: fetch rows with no
//! cost yet, price each with the calculator, write the results back in one
//! transaction. The store only performs `NULL -> value` writes, so running
//! a batch twice over the same rows is a no-op and concurrent workers
//! cannot double-write.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::cost::calculator::CostCalculator;
use crate::error::GatewayResult;
use crate::storage::{
    ModelUsageRow, ProviderUsageRow, Store, TimeBucket, TimeBucketRow, UsageSummary,
};
use crate::usage::{UsageFilter, UsageRecord};

pub const DEFAULT_BATCH_LIMIT: u32 = 200;

pub struct CostAggregator {
    store: Arc<dyn Store>,
    calculator: Arc<CostCalculator>,
}

impl CostAggregator {
    pub fn new(store: Arc<dyn Store>, calculator: Arc<CostCalculator>) -> Self {
        Self { store, calculator }
    }

    /// Usage rows still waiting for a cost, oldest first.
    pub async fn fetch_uncalculated(&self, limit: u32) -> GatewayResult<Vec<UsageRecord>> {
        self.store.fetch_uncosted(limit).await
    }

    /// Price one fetched batch and persist the results. Returns the number
    /// of rows updated.
    pub async fn process_batch(&self, limit: u32) -> GatewayResult<usize> {
        let rows = self.fetch_uncalculated(limit).await?;
        if rows.is_empty() {
            return Ok(0);
        }

        let updates: Vec<(String, f64)> = rows
            .iter()
            .map(|row| {
                let breakdown = self.calculator.calculate(
                    &row.selected_model,
                    row.prompt_tokens,
                    row.completion_tokens,
                );
                let cost = match breakdown.validate() {
                    Ok(()) => breakdown.total_cost,
                    Err(e) => {
                        // Store zero rather than a number we do not trust.
                        warn!(id = %row.id, model = %row.selected_model, error = %e,
                            "cost breakdown failed validation, storing zero");
                        0.0
                    }
                };
                (row.id.clone(), cost)
            })
            .collect();

        let updated = self.store.fill_costs(&updates).await?;
        debug!(fetched = rows.len(), updated, "cost batch processed");
        Ok(updated)
    }

    pub async fn summary(&self, filter: &UsageFilter) -> GatewayResult<UsageSummary> {
        self.store.usage_summary(filter).await
    }

    pub async fn by_model(&self, filter: &UsageFilter) -> GatewayResult<Vec<ModelUsageRow>> {
        self.store.usage_by_model(filter).await
    }

    pub async fn by_provider(&self, filter: &UsageFilter) -> GatewayResult<Vec<ProviderUsageRow>> {
        self.store.usage_by_provider(filter).await
    }

    pub async fn timeseries(
        &self,
        filter: &UsageFilter,
        bucket: TimeBucket,
    ) -> GatewayResult<Vec<TimeBucketRow>> {
        self.store.usage_timeseries(filter, bucket).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    use crate::storage::{SqliteStore, Workspace, WorkspaceStatus};
    use crate::usage::ResponseStatus;

    async fn seeded_store() -> Arc<dyn Store> {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .create_workspace(&Workspace {
                id: "ws-1".into(),
                slug: "default".into(),
                status: WorkspaceStatus::Active,
                created_at: Utc::now(),
            })
            .await
            .unwrap();
        Arc::new(store)
    }

    fn row(id: &str, model: &str, prompt: u32, completion: u32) -> UsageRecord {
        UsageRecord {
            id: id.to_string(),
            workspace_id: "ws-1".into(),
            request_id: format!("req-{}", id),
            trace_id: format!("trace-{}", id),
            api_key_id: "key-1".into(),
            provider_id: "openai".into(),
            incoming_model: model.to_string(),
            selected_model: model.to_string(),
            prompt_tokens: prompt,
            completion_tokens: completion,
            total_tokens: prompt + completion,
            cost_usd: None,
            duration_ms: 10,
            response_status: ResponseStatus::Success,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_process_batch_fills_costs() {
        let store = seeded_store().await;
        let calculator = Arc::new(CostCalculator::new());
        store
            .insert_usage(&[
                row("u1", "gpt-4o", 1000, 500),
                row("u2", "claude-3-haiku", 2000, 100),
                row("u3", "gemini-1.5-flash", 400, 400),
            ])
            .await
            .unwrap();

        let aggregator = CostAggregator::new(store.clone(), calculator.clone());
        assert_eq!(aggregator.process_batch(50).await.unwrap(), 3);

        // Each row carries exactly what the calculator says.
        let all = store
            .query_usage(&UsageFilter::default())
            .await
            .unwrap();
        for record in &all {
            let expected = calculator
                .calculate(&record.selected_model, record.prompt_tokens, record.completion_tokens)
                .total_cost;
            assert_eq!(record.cost_usd, Some(expected));
        }

        // Second run is a no-op: nothing left uncosted.
        assert_eq!(aggregator.process_batch(50).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_process_batch_empty_store() {
        let store = seeded_store().await;
        let aggregator = CostAggregator::new(store, Arc::new(CostCalculator::new()));
        assert_eq!(aggregator.process_batch(50).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_zero_token_rows_get_zero_cost() {
        let store = seeded_store().await;
        store.insert_usage(&[row("u1", "gpt-4o", 0, 0)]).await.unwrap();
        let aggregator = CostAggregator::new(store.clone(), Arc::new(CostCalculator::new()));
        assert_eq!(aggregator.process_batch(10).await.unwrap(), 1);
        let all = store.query_usage(&UsageFilter::default()).await.unwrap();
        assert_eq!(all[0].cost_usd, Some(0.0));
    }
}
