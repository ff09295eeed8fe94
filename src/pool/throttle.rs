//! Per-(environment, caller) concurrency ledger (§5). Two limits apply to
//! every admitted query: a global cap per environment and a tighter
//! per-caller cap, both enforced with [`tokio::sync::Semaphore`] permits
//! handed out as RAII guards.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

pub struct ThrottleGuard {
    _env_permit: OwnedSemaphorePermit,
    _caller_permit: OwnedSemaphorePermit,
}

struct EnvLedger {
    env_semaphore: Arc<Semaphore>,
    caller_semaphores: DashMap<String, Arc<Semaphore>>,
    max_per_caller: usize,
}

/// Tracks in-flight query counts so a single noisy caller cannot exhaust an
/// environment's pool; keyed by environment name.
pub struct ThrottleLedger {
    environments: DashMap<String, Arc<EnvLedger>>,
}

impl ThrottleLedger {
    pub fn new() -> Self {
        Self { environments: DashMap::new() }
    }

    fn ledger_for(&self, env: &str, max_per_env: usize, max_per_caller: usize) -> Arc<EnvLedger> {
        self.environments
            .entry(env.to_string())
            .or_insert_with(|| {
                Arc::new(EnvLedger {
                    env_semaphore: Arc::new(Semaphore::new(max_per_env)),
                    caller_semaphores: DashMap::new(),
                    max_per_caller,
                })
            })
            .clone()
    }

    /// Acquires both permits or returns `None` immediately (non-blocking; the
    /// executor maps a rejection to `TooManyConcurrent`, never queues).
    pub async fn try_acquire(
        &self,
        env: &str,
        caller: &str,
        max_per_env: usize,
        max_per_caller: usize,
    ) -> Option<ThrottleGuard> {
        let ledger = self.ledger_for(env, max_per_env, max_per_caller);
        let env_permit = Arc::clone(&ledger.env_semaphore).try_acquire_owned().ok()?;

        let caller_semaphore = ledger
            .caller_semaphores
            .entry(caller.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(ledger.max_per_caller)))
            .clone();
        let caller_permit = match Arc::clone(&caller_semaphore).try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => return None,
        };

        Some(ThrottleGuard { _env_permit: env_permit, _caller_permit: caller_permit })
    }
}

impl Default for ThrottleLedger {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rejects_past_per_caller_cap() {
        let ledger = ThrottleLedger::new();
        let g1 = ledger.try_acquire("Prd", "alice", 10, 1).await;
        assert!(g1.is_some());
        let g2 = ledger.try_acquire("Prd", "alice", 10, 1).await;
        assert!(g2.is_none());
    }

    #[tokio::test]
    async fn distinct_callers_do_not_contend() {
        let ledger = ThrottleLedger::new();
        let g1 = ledger.try_acquire("Prd", "alice", 10, 1).await;
        let g2 = ledger.try_acquire("Prd", "bob", 10, 1).await;
        assert!(g1.is_some());
        assert!(g2.is_some());
    }

    #[tokio::test]
    async fn env_cap_applies_across_callers() {
        let ledger = ThrottleLedger::new();
        let g1 = ledger.try_acquire("Prd", "alice", 1, 5).await;
        let g2 = ledger.try_acquire("Prd", "bob", 1, 5).await;
        assert!(g1.is_some());
        assert!(g2.is_none());
    }
}
