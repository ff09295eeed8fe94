//! Connection Pool (C2): one hand-rolled connection pool and one circuit
//! breaker per distinct credential fingerprint, shared across any logical
//! environment names that happen to point at the same server/database/user,
//! plus the per-(env, caller) concurrency throttle (§5).

pub mod circuit_breaker;
pub mod providers;
pub mod throttle;

use crate::config::{Config, ConnectionComponents};
use crate::error::{GatewayError, GatewayResult};
use circuit_breaker::{Admission, CircuitBreaker};
use dashmap::DashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
pub use throttle::ThrottleGuard;
use throttle::ThrottleLedger;
use tiberius::{AuthMethod, Client, Config as TiberiusConfig, EncryptionLevel};
use tokio::net::TcpStream;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};

pub type DbClient = Client<Compat<TcpStream>>;

const BREAKER_FAILURE_THRESHOLD: u32 = 5;
const BREAKER_COOLDOWN: Duration = Duration::from_secs(30);

/// Identifies a physical credential set, independent of which environment
/// alias(es) resolve to it, so two aliases sharing a server/database/user
/// share one pool and one breaker.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CredentialFingerprint(String);

fn fingerprint(c: &ConnectionComponents) -> CredentialFingerprint {
    CredentialFingerprint(format!(
        "{}/{}/{}",
        c.server.to_lowercase(),
        c.database.to_lowercase(),
        c.user.to_lowercase()
    ))
}

struct PoolEntry {
    clients: Arc<tokio::sync::Mutex<Vec<DbClient>>>,
    max_size: usize,
    in_use: std::sync::atomic::AtomicUsize,
    breaker: Arc<CircuitBreaker>,
    released: tokio::sync::Notify,
}

pub struct ConnectionPool {
    config: Config,
    entries: DashMap<CredentialFingerprint, Arc<PoolEntry>>,
    throttle: ThrottleLedger,
}

impl ConnectionPool {
    pub fn new(config: Config) -> Self {
        Self { config, entries: DashMap::new(), throttle: ThrottleLedger::new() }
    }

    fn components_for(&self, env: &str) -> GatewayResult<ConnectionComponents> {
        self.config
            .database
            .connection_components
            .get(env)
            .cloned()
            .ok_or_else(|| GatewayError::DbNotAllowed(format!("unknown environment '{env}'")))
    }

    fn entry_for(&self, _env: &str, components: &ConnectionComponents) -> Arc<PoolEntry> {
        let fp = fingerprint(components);
        self.entries
            .entry(fp)
            .or_insert_with(|| {
                Arc::new(PoolEntry {
                    clients: Arc::new(tokio::sync::Mutex::new(Vec::new())),
                    max_size: self.config.database.connection_pool_size,
                    in_use: std::sync::atomic::AtomicUsize::new(0),
                    breaker: Arc::new(CircuitBreaker::new(BREAKER_FAILURE_THRESHOLD, BREAKER_COOLDOWN)),
                    released: tokio::sync::Notify::new(),
                })
            })
            .clone()
    }

    async fn open_client(&self, components: &ConnectionComponents) -> GatewayResult<DbClient> {
        let mut tiberius_config = TiberiusConfig::new();
        tiberius_config.host(&components.server);
        tiberius_config.database(&components.database);
        tiberius_config.authentication(AuthMethod::sql_server(&components.user, components.password.reveal()));
        tiberius_config.application_name(&self.config.database.app_name);
        if components.is_local() {
            tiberius_config.trust_cert();
        } else {
            tiberius_config.encryption(EncryptionLevel::Required);
        }

        let tcp = TcpStream::connect(tiberius_config.get_addr())
            .await
            .map_err(|e| GatewayError::DbError(e.to_string()))?;
        tcp.set_nodelay(true).ok();
        Client::connect(tiberius_config, tcp.compat_write())
            .await
            .map_err(|e| GatewayError::DbError(e.to_string()))
    }

    /// Applies the mandatory session defaults in the fixed order required at
    /// the connection factory, every time a connection is checked out
    /// (pooled connections carry session state across uses). Lock timeout is
    /// pinned to the configured command timeout, not a per-environment value,
    /// since the statement timeout and lock timeout are meant to agree.
    async fn apply_session_defaults(&self, client: &mut DbClient, _env: &str) -> GatewayResult<()> {
        let lock_timeout_ms = self.config.database.command_timeout_seconds * 1000;
        let statements = [
            "SET NOCOUNT ON".to_string(),
            "SET XACT_ABORT ON".to_string(),
            format!("SET LOCK_TIMEOUT {lock_timeout_ms}"),
            "SET DEADLOCK_PRIORITY LOW".to_string(),
            "SET TRANSACTION ISOLATION LEVEL READ COMMITTED".to_string(),
            "SET ARITHABORT ON".to_string(),
        ];
        for stmt in statements {
            client
                .execute(stmt.as_str(), &[])
                .await
                .map_err(|e| GatewayError::DbError(e.to_string()))?;
        }
        Ok(())
    }

    /// Pops idle connections off the entry's pool one at a time, discarding
    /// any that fail a `SELECT 1` round-trip, until a live one is found or
    /// the idle set is exhausted.
    async fn reuse_validated(entry: &PoolEntry) -> Option<DbClient> {
        loop {
            let mut candidate = {
                let mut pooled = entry.clients.lock().await;
                pooled.pop()
            }?;
            if candidate.execute("SELECT 1", &[]).await.is_ok() {
                return Some(candidate);
            }
            // Connection died while idle (network blip, server-side KILL); drop it
            // and try the next one rather than handing a broken client to the caller.
        }
    }

    async fn checkout(&self, env: &str) -> GatewayResult<(DbClient, Arc<PoolEntry>, bool)> {
        let components = self.components_for(env)?;
        let entry = self.entry_for(env, &components);

        let admission = entry.breaker.admit();
        if admission == Admission::Reject {
            return Err(GatewayError::CircuitOpen);
        }
        let was_trial = admission == Admission::ProceedAsTrial;

        let deadline = tokio::time::Instant::now()
            + Duration::from_secs(self.config.database.connection_timeout_seconds);

        loop {
            if let Some(client) = Self::reuse_validated(&entry).await {
                entry.in_use.fetch_add(1, std::sync::atomic::Ordering::AcqRel);
                return Ok((client, entry, was_trial));
            }

            if entry.in_use.load(std::sync::atomic::Ordering::Acquire) < entry.max_size {
                return match self.open_client(&components).await {
                    Ok(client) => {
                        entry.in_use.fetch_add(1, std::sync::atomic::Ordering::AcqRel);
                        Ok((client, entry, was_trial))
                    },
                    Err(e) => {
                        entry.breaker.record_failure(was_trial);
                        Err(e)
                    },
                };
            }

            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Err(GatewayError::PoolExhausted);
            }
            // Block until a connection is released, then repeat validation from the top.
            let _ = tokio::time::timeout(remaining, entry.released.notified()).await;
        }
    }

    /// Rolls back any in-flight transaction, validates with a `SELECT 1`
    /// round-trip, and returns the connection to the idle set; discards it on
    /// either check's failure rather than trusting a possibly-broken
    /// connection back into circulation.
    async fn checkin(&self, entry: &Arc<PoolEntry>, mut client: DbClient) {
        entry.in_use.fetch_sub(1, std::sync::atomic::Ordering::AcqRel);
        let healthy = client.execute("IF @@TRANCOUNT > 0 ROLLBACK TRANSACTION", &[]).await.is_ok()
            && client.execute("SELECT 1", &[]).await.is_ok();
        if healthy {
            entry.clients.lock().await.push(client);
        }
        entry.released.notify_one();
    }

    /// Scoped, non-blocking acquisition from the per-(env, caller) throttle
    /// ledger (gate 2 of the execution engine's chain); the returned guard's
    /// `Drop` releases both permits on every exit path, including a
    /// panicking task.
    pub async fn try_throttle(&self, env: &str, caller: &str) -> Option<ThrottleGuard> {
        let safety = &self.config.safety;
        self.throttle.try_acquire(env, caller, safety.max_concurrent_queries, safety.max_concurrent_queries_per_user).await
    }

    /// Runs `f` against a checked-out, session-initialized connection for
    /// `env`, gated by the circuit breaker. Assumes the caller already holds
    /// a throttle permit (or doesn't need one, e.g. the plan/metadata side
    /// channels) — this is the gate-10 "execute & stream" leg of the chain,
    /// not the full gate sequence.
    pub async fn run_checked_out<F, Fut, T>(&self, env: &str, f: F) -> GatewayResult<T>
    where
        F: FnOnce(&mut DbClient) -> Fut,
        Fut: Future<Output = GatewayResult<T>>,
    {
        let (mut client, entry, was_trial) = self.checkout(env).await?;

        if let Err(e) = self.apply_session_defaults(&mut client, env).await {
            entry.breaker.record_failure(was_trial);
            entry.in_use.fetch_sub(1, std::sync::atomic::Ordering::AcqRel);
            entry.released.notify_one();
            return Err(e);
        }

        match f(&mut client).await {
            Ok(value) => {
                entry.breaker.record_success(was_trial);
                self.checkin(&entry, client).await;
                Ok(value)
            },
            Err(e) => {
                entry.breaker.record_failure(was_trial);
                entry.in_use.fetch_sub(1, std::sync::atomic::Ordering::AcqRel);
                // A connection that failed mid-query is not trusted back into the pool.
                drop(client);
                entry.released.notify_one();
                Err(e)
            },
        }
    }

    /// Convenience wrapper for callers (the plan/metadata side channels) that
    /// want throttle + breaker + checkout in one call, since they aren't
    /// threaded through the execution engine's explicit gate chain.
    pub async fn with_connection<F, Fut, T>(&self, env: &str, caller: &str, f: F) -> GatewayResult<T>
    where
        F: FnOnce(&mut DbClient) -> Fut,
        Fut: Future<Output = GatewayResult<T>>,
    {
        let _throttle_guard =
            self.try_throttle(env, caller).await.ok_or(GatewayError::TooManyConcurrent { retry_after_seconds: 1 })?;
        self.run_checked_out(env, f).await
    }
}
