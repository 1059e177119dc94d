//! Chain connection seam: request/response RPC plus push subscriptions, and the
//! timeout/retry policy every remote call goes through.

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_retry::strategy::ExponentialBackoff;
use tokio_retry::RetryIf;
use tracing::{debug, warn};

use crate::error::{SyncError, SyncResult};
use crate::metrics;
use crate::settings::Rpc;
use crate::types::ChainId;

pub type SubscriptionId = String;

/// One push delivered on a subscription.
#[derive(Debug, Clone)]
pub enum SubscriptionEvent {
    Update(Value),
    /// The subscription is dead (connection lost or server-side error).
    Failure(String),
}

/// Live subscription handle. Dropping `events` does not cancel it; call
/// [`ChainConnection::cancel`] with `id`.
#[derive(Debug)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub events: mpsc::UnboundedReceiver<SubscriptionEvent>,
}

#[async_trait]
pub trait ChainConnection: Send + Sync {
    async fn request(&self, method: &str, params: Value) -> SyncResult<Value>;

    async fn subscribe(
        &self,
        method: &str,
        params: Value,
        unsubscribe_method: &str,
    ) -> SyncResult<Subscription>;

    async fn cancel(&self, id: &SubscriptionId) -> SyncResult<()>;
}

/// Resolves the live connection for a chain.
pub trait ChainConnectionProvider: Send + Sync {
    fn connection(&self, chain: &ChainId) -> Option<Arc<dyn ChainConnection>>;

    fn require(&self, chain: &ChainId) -> SyncResult<Arc<dyn ChainConnection>> {
        self.connection(chain)
            .ok_or_else(|| SyncError::ConnectionUnavailable {
                chain_id: chain.clone(),
            })
    }
}

#[derive(Default)]
pub struct StaticConnectionProvider {
    connections: DashMap<ChainId, Arc<dyn ChainConnection>>,
}

impl StaticConnectionProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, chain: impl Into<ChainId>, connection: Arc<dyn ChainConnection>) {
        self.connections.insert(chain.into(), connection);
    }

    pub fn remove(&self, chain: &ChainId) {
        self.connections.remove(chain);
    }
}

impl ChainConnectionProvider for StaticConnectionProvider {
    fn connection(&self, chain: &ChainId) -> Option<Arc<dyn ChainConnection>> {
        self.connections.get(chain).map(|c| c.value().clone())
    }
}

/// Timeout and retry policy applied to each remote call.
#[derive(Debug, Clone)]
pub struct RequestPolicy {
    pub timeout: Duration,
    pub max_retries: usize,
    pub retry_base: Duration,
    pub max_retry_delay: Duration,
}

impl Default for RequestPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            max_retries: 2,
            retry_base: Duration::from_millis(200),
            max_retry_delay: Duration::from_secs(5),
        }
    }
}

impl RequestPolicy {
    pub fn from_settings(rpc: &Rpc) -> Self {
        Self {
            timeout: Duration::from_millis(rpc.request_timeout_ms),
            max_retries: rpc.max_retries,
            retry_base: Duration::from_millis(rpc.retry_base_ms),
            ..Self::default()
        }
    }

    fn backoff(&self) -> impl Iterator<Item = Duration> {
        // 2^n * factor ms: base, 2*base, 4*base, ...
        let factor = (self.retry_base.as_millis() as u64 / 2).max(1);
        ExponentialBackoff::from_millis(2)
            .factor(factor)
            .max_delay(self.max_retry_delay)
            .take(self.max_retries)
    }

    /// Issues `method` with a per-attempt timeout; retries timeouts and lost connections.
    pub async fn call(
        &self,
        connection: &dyn ChainConnection,
        method: &str,
        params: Value,
    ) -> SyncResult<Value> {
        let started = Instant::now();
        let result = RetryIf::spawn(
            self.backoff(),
            || {
                let params = params.clone();
                metrics::increment_rpc_call(method);
                async move { self.with_timeout(method, connection.request(method, params)).await }
            },
            |e: &SyncError| {
                let retry = e.is_retryable();
                if retry {
                    debug!(method, error = %e, "retrying chain request");
                }
                retry
            },
        )
        .await;

        metrics::record_rpc_call_latency(method, started.elapsed());
        if let Err(e) = &result {
            metrics::increment_rpc_error(method);
            warn!(method, error = %e, "chain request failed");
        }
        result
    }

    pub async fn subscribe(
        &self,
        connection: &dyn ChainConnection,
        method: &str,
        params: Value,
        unsubscribe_method: &str,
    ) -> SyncResult<Subscription> {
        metrics::increment_rpc_call(method);
        self.with_timeout(
            method,
            connection.subscribe(method, params, unsubscribe_method),
        )
        .await
    }

    async fn with_timeout<T>(
        &self,
        method: &str,
        fut: impl std::future::Future<Output = SyncResult<T>>,
    ) -> SyncResult<T> {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(SyncError::Timeout {
                method: method.to_string(),
                timeout_ms: self.timeout.as_millis() as u64,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FlakyConnection {
        calls: AtomicUsize,
        fail_first: usize,
        error: SyncError,
    }

    #[async_trait]
    impl ChainConnection for FlakyConnection {
        async fn request(&self, _method: &str, _params: Value) -> SyncResult<Value> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                return Err(self.error.clone());
            }
            Ok(json!("ok"))
        }

        async fn subscribe(&self, _: &str, _: Value, _: &str) -> SyncResult<Subscription> {
            Err(SyncError::Unexpected("not supported".into()))
        }

        async fn cancel(&self, _: &SubscriptionId) -> SyncResult<()> {
            Ok(())
        }
    }

    struct HangingConnection;

    #[async_trait]
    impl ChainConnection for HangingConnection {
        async fn request(&self, _method: &str, _params: Value) -> SyncResult<Value> {
            futures::future::pending::<()>().await;
            Ok(Value::Null)
        }

        async fn subscribe(&self, _: &str, _: Value, _: &str) -> SyncResult<Subscription> {
            futures::future::pending::<()>().await;
            Err(SyncError::Unexpected("unreachable".into()))
        }

        async fn cancel(&self, _: &SubscriptionId) -> SyncResult<()> {
            Ok(())
        }
    }

    fn fast_policy() -> RequestPolicy {
        RequestPolicy {
            timeout: Duration::from_millis(50),
            max_retries: 2,
            retry_base: Duration::from_millis(2),
            max_retry_delay: Duration::from_millis(10),
        }
    }

    #[tokio::test]
    async fn retries_lost_connections_then_succeeds() {
        let conn = FlakyConnection {
            calls: AtomicUsize::new(0),
            fail_first: 2,
            error: SyncError::ConnectionUnavailable {
                chain_id: "sora".into(),
            },
        };
        let value = fast_policy()
            .call(&conn, "state_getKeysPaged", json!([]))
            .await
            .unwrap();
        assert_eq!(value, json!("ok"));
        assert_eq!(conn.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn rpc_errors_are_not_retried() {
        let conn = FlakyConnection {
            calls: AtomicUsize::new(0),
            fail_first: 5,
            error: SyncError::Rpc {
                method: "state_queryStorageAt".into(),
                code: -32602,
                message: "invalid params".into(),
            },
        };
        let err = fast_policy()
            .call(&conn, "state_queryStorageAt", json!([]))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Rpc { .. }));
        assert_eq!(conn.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_requests_time_out() {
        let err = fast_policy()
            .call(&HangingConnection, "state_getKeysPaged", json!([]))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Timeout { timeout_ms: 50, .. }));
    }

    #[test]
    fn provider_reports_missing_connection() {
        let provider = StaticConnectionProvider::new();
        let err = provider.require(&"sora".to_string()).err().unwrap();
        assert!(matches!(err, SyncError::ConnectionUnavailable { .. }));
    }
}
