//! Cost accounting
//!
//! The calculator turns token counts into dollar breakdowns; the
//! aggregator reads and fills usage rows in the store; the worker drives
//! the aggregator on a fixed interval.

pub mod aggregator;
pub mod calculator;
pub mod worker;

pub use aggregator::CostAggregator;
pub use calculator::{normalize_model, CostBreakdown, CostCalculator, ModelRate};
pub use worker::{spawn_cost_worker, CostWorker};
