//! SQL Gateway library: a policy-enforcing review-and-execution surface in
//! front of SQL Server. Application state is a small bundle of `Arc`-wrapped
//! components; Rust's type system is the DI container, no service locator.

use std::sync::Arc;

pub mod analysis;
pub mod config;
pub mod error;
pub mod execution;
pub mod handlers;
pub mod model;
pub mod pool;
pub mod rewrite;

pub use config::Config;
pub use error::{GatewayError, GatewayResult};

use analysis::ReviewOrchestrator;
use execution::SafeExecutionEngine;
use pool::ConnectionPool;

/// Shared application state, wrapped in `Arc` for cheap cloning across axum
/// handlers. `pool` is shared (not duplicated) with `executor`, since both
/// must observe the same circuit-breaker/throttle state for a given
/// environment's credentials.
pub struct AppState {
    pub config: Config,
    pub pool: Arc<ConnectionPool>,
    pub orchestrator: ReviewOrchestrator,
    pub executor: SafeExecutionEngine,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        let pool = Arc::new(ConnectionPool::new(config.clone()));
        let orchestrator =
            ReviewOrchestrator::new(config.risk_weights.clone(), config.safety.allow_linked_servers);
        let executor = SafeExecutionEngine::new(config.clone(), Arc::clone(&pool));
        Self { config, pool, orchestrator, executor }
    }
}
