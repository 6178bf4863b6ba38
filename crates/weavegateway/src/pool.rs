//! Per-`(user_id, server_id)` session pooling with bounded backpressure.

use crate::config::{ExhaustionPolicy, PoolConfig};
use crate::injector::InjectionMaterial;
use crate::transport::Transport;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use weavecore::TransportError;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PoolKey {
    pub user_id: String,
    pub server_id: String,
}

impl PoolKey {
    pub fn new(user_id: impl Into<String>, server_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            server_id: server_id.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub limit: usize,
    pub in_use: usize,
    pub idle: usize,
    pub waiting: usize,
}

struct IdleEntry {
    transport: Box<dyn Transport>,
    material: InjectionMaterial,
    since: Instant,
}

pub(crate) struct KeyPool {
    limit: usize,
    permits: Arc<Semaphore>,
    waiting: AtomicUsize,
    idle: Mutex<VecDeque<IdleEntry>>,
}

impl KeyPool {
    fn new(limit: usize) -> Self {
        Self {
            limit,
            permits: Arc::new(Semaphore::new(limit)),
            waiting: AtomicUsize::new(0),
            idle: Mutex::new(VecDeque::new()),
        }
    }

    fn take_expired(&self, idle_timeout: Duration) -> Vec<Box<dyn Transport>> {
        let Ok(mut idle) = self.idle.lock() else {
            return Vec::new();
        };
        let (fresh, stale): (VecDeque<_>, VecDeque<_>) = idle
            .drain(..)
            .partition(|e| e.since.elapsed() < idle_timeout && e.transport.is_connected());
        *idle = fresh;
        stale.into_iter().map(|e| e.transport).collect()
    }

    /// Most recently used matching session first. Idle sessions opened with
    /// other material are handed back for closing so they cannot outlive
    /// the connection limit.
    fn take_idle(
        &self,
        material: &InjectionMaterial,
    ) -> (Option<Box<dyn Transport>>, Vec<Box<dyn Transport>>) {
        let Ok(mut idle) = self.idle.lock() else {
            return (None, Vec::new());
        };
        let (matching, mismatched): (VecDeque<_>, VecDeque<_>) =
            idle.drain(..).partition(|e| &e.material == material);
        *idle = matching;
        let reused = idle.pop_back().map(|e| e.transport);
        (reused, mismatched.into_iter().map(|e| e.transport).collect())
    }

    fn put_idle(&self, transport: Box<dyn Transport>, material: InjectionMaterial) {
        if let Ok(mut idle) = self.idle.lock() {
            idle.push_back(IdleEntry {
                transport,
                material,
                since: Instant::now(),
            });
        }
    }

    fn idle_len(&self) -> usize {
        self.idle.lock().map(|i| i.len()).unwrap_or_default()
    }
}

struct WaitGuard<'a>(&'a AtomicUsize);

impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Capacity reserved in a key pool, possibly with a reusable idle session.
pub(crate) struct Checkout {
    pub pool: Arc<KeyPool>,
    pub permit: OwnedSemaphorePermit,
    pub reused: Option<Box<dyn Transport>>,
}

pub struct SessionPool {
    config: PoolConfig,
    pools: Mutex<HashMap<PoolKey, Arc<KeyPool>>>,
}

impl SessionPool {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            config,
            pools: Mutex::new(HashMap::new()),
        }
    }

    fn key_pool(&self, key: &PoolKey, limit: usize) -> Arc<KeyPool> {
        match self.pools.lock() {
            Ok(mut pools) => pools
                .entry(key.clone())
                .or_insert_with(|| Arc::new(KeyPool::new(limit.max(1))))
                .clone(),
            Err(_) => Arc::new(KeyPool::new(limit.max(1))),
        }
    }

    /// Reserve one connection slot for `key`, waiting FIFO or failing fast
    /// depending on the exhaustion policy.
    pub(crate) async fn acquire(
        &self,
        key: &PoolKey,
        limit: Option<usize>,
        material: &InjectionMaterial,
        cancel: &CancellationToken,
    ) -> Result<Checkout, TransportError> {
        let pool = self.key_pool(key, limit.unwrap_or(self.config.max_connections_per_server));
        let exhausted = || TransportError::PoolExhausted {
            server_id: key.server_id.clone(),
            limit: pool.limit,
        };

        let permit = match pool.permits.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => match self.config.on_exhausted {
                ExhaustionPolicy::Fail => return Err(exhausted()),
                ExhaustionPolicy::Queue {
                    max_waiters,
                    wait_timeout_ms,
                } => {
                    if pool.waiting.fetch_add(1, Ordering::SeqCst) >= max_waiters {
                        pool.waiting.fetch_sub(1, Ordering::SeqCst);
                        return Err(exhausted());
                    }
                    let _guard = WaitGuard(&pool.waiting);
                    tracing::debug!(user_id = %key.user_id, server_id = %key.server_id, "Waiting for pooled connection");
                    let wait = tokio::time::timeout(
                        Duration::from_millis(wait_timeout_ms),
                        pool.permits.clone().acquire_owned(),
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(TransportError::Cancelled),
                        acquired = wait => match acquired {
                            Ok(Ok(permit)) => permit,
                            _ => return Err(exhausted()),
                        },
                    }
                }
            },
        };

        for stale in pool.take_expired(self.config.idle_timeout()) {
            stale.disconnect().await;
        }
        let (reused, mismatched) = pool.take_idle(material);
        if !mismatched.is_empty() {
            tracing::debug!(
                user_id = %key.user_id,
                server_id = %key.server_id,
                closed = mismatched.len(),
                "Closing idle sessions opened with outdated credentials"
            );
        }
        for outdated in mismatched {
            outdated.disconnect().await;
        }

        Ok(Checkout {
            pool,
            permit,
            reused,
        })
    }

    /// Close idle sessions past the idle timeout. Returns how many were closed.
    pub async fn evict_idle(&self) -> usize {
        let pools: Vec<Arc<KeyPool>> = match self.pools.lock() {
            Ok(pools) => pools.values().cloned().collect(),
            Err(_) => return 0,
        };
        let mut evicted = 0;
        for pool in pools {
            for stale in pool.take_expired(self.config.idle_timeout()) {
                stale.disconnect().await;
                evicted += 1;
            }
        }
        if evicted > 0 {
            tracing::debug!(evicted, "Evicted idle sessions");
        }
        // Keys nobody holds a checkout or session for, with nothing idle.
        if let Ok(mut pools) = self.pools.lock() {
            pools.retain(|_, pool| Arc::strong_count(pool) > 1 || pool.idle_len() > 0);
        }
        evicted
    }

    pub fn stats(&self, key: &PoolKey) -> Option<PoolStats> {
        let pool = self.pools.lock().ok()?.get(key).cloned()?;
        Some(PoolStats {
            limit: pool.limit,
            in_use: pool.limit - pool.permits.available_permits(),
            idle: pool.idle_len(),
            waiting: pool.waiting.load(Ordering::SeqCst),
        })
    }

    /// Disconnect everything idle, regardless of age.
    pub async fn close_all(&self) {
        let pools: Vec<Arc<KeyPool>> = match self.pools.lock() {
            Ok(pools) => pools.values().cloned().collect(),
            Err(_) => return,
        };
        for pool in pools {
            for stale in pool.take_expired(Duration::ZERO) {
                stale.disconnect().await;
            }
        }
    }
}

/// An initialized session checked out of the pool.
///
/// Healthy transports go back to the idle list on drop; broken ones are
/// disconnected and never reused.
pub struct PooledSession {
    key: PoolKey,
    material: InjectionMaterial,
    pub(crate) transport: Option<Box<dyn Transport>>,
    pool: Arc<KeyPool>,
    _permit: OwnedSemaphorePermit,
}

impl PooledSession {
    pub(crate) fn new(
        key: PoolKey,
        material: InjectionMaterial,
        transport: Box<dyn Transport>,
        checkout: Checkout,
    ) -> Self {
        Self {
            key,
            material,
            transport: Some(transport),
            pool: checkout.pool,
            _permit: checkout.permit,
        }
    }

    pub fn key(&self) -> &PoolKey {
        &self.key
    }

    pub fn server_id(&self) -> &str {
        &self.key.server_id
    }

    pub(crate) fn material(&self) -> &InjectionMaterial {
        &self.material
    }

    pub fn is_healthy(&self) -> bool {
        self.transport.as_ref().is_some_and(|t| t.is_connected())
    }

    pub(crate) fn transport(&self) -> Result<&dyn Transport, TransportError> {
        self.transport
            .as_deref()
            .ok_or_else(|| TransportError::connection("session has no live transport"))
    }

    /// Close the session instead of returning it to the pool.
    pub async fn close(mut self) {
        if let Some(transport) = self.transport.take() {
            transport.disconnect().await;
        }
    }
}

impl Drop for PooledSession {
    fn drop(&mut self) {
        let Some(transport) = self.transport.take() else {
            return;
        };
        if transport.is_connected() {
            self.pool
                .put_idle(transport, std::mem::take(&mut self.material));
        } else if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move { transport.disconnect().await });
        }
    }
}
