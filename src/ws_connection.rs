//! # WebSocket JSON-RPC Connection
//!
//! [`ChainConnection`] over a single JSON-RPC 2.0 WebSocket.
//!
//! ## Features
//!
//! - **Request correlation**: responses are matched to callers by request id; a caller that
//!   stops waiting (timeout, retry) takes its pending entry with it
//! - **Subscription routing**: notifications are routed by subscription id; notifications
//!   that race ahead of the subscribe response are buffered (bounded) and replayed
//! - **Late subscribes**: a subscribe answered after its caller gave up is unsubscribed on
//!   arrival; notifications for cancelled ids are dropped
//! - **Rate limiting**: optional per-connection QPS limit (`governor`)
//! - **Failure fan-out**: when the socket closes, pending requests fail with
//!   `ConnectionUnavailable` and every subscription receives a `Failure` event

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use indexmap::{IndexMap, IndexSet};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use url::Url;

use crate::connection::{ChainConnection, Subscription, SubscriptionEvent, SubscriptionId};
use crate::error::{SyncError, SyncResult};
use crate::types::ChainId;

/// Subscription ids with buffered notifications awaiting their subscribe response.
const MAX_EARLY_SUBSCRIPTIONS: usize = 32;
/// Buffered notifications kept per id; older ones are dropped first.
const MAX_EARLY_NOTIFICATIONS: usize = 16;
/// Recently cancelled ids whose late notifications are ignored.
const MAX_CANCELLED: usize = 256;

struct Route {
    sender: mpsc::UnboundedSender<SubscriptionEvent>,
    unsubscribe_method: String,
}

#[derive(Default)]
struct Routes {
    live: HashMap<SubscriptionId, Route>,
    early: IndexMap<SubscriptionId, Vec<Value>>,
    cancelled: IndexSet<SubscriptionId>,
}

impl Routes {
    /// Drops the route of `id` and ignores whatever still arrives for it.
    fn forget(&mut self, id: &SubscriptionId) -> Option<Route> {
        self.early.shift_remove(id);
        if self.cancelled.len() >= MAX_CANCELLED {
            self.cancelled.shift_remove_index(0);
        }
        self.cancelled.insert(id.clone());
        self.live.remove(id)
    }

    fn buffer(&mut self, id: SubscriptionId, result: Value) {
        if self.cancelled.contains(&id) {
            return;
        }
        if !self.early.contains_key(&id) && self.early.len() >= MAX_EARLY_SUBSCRIPTIONS {
            if let Some((dropped, _)) = self.early.shift_remove_index(0) {
                debug!(id = %dropped, "dropping unclaimed early notifications");
            }
        }
        let queue = self.early.entry(id).or_default();
        if queue.len() >= MAX_EARLY_NOTIFICATIONS {
            queue.remove(0);
        }
        queue.push(result);
    }
}

struct Shared {
    chain_id: ChainId,
    next_id: AtomicU64,
    pending: DashMap<u64, oneshot::Sender<SyncResult<Value>>>,
    /// Subscribe requests whose caller gave up, with their unsubscribe method.
    abandoned: DashMap<u64, String>,
    routes: Mutex<Routes>,
    closed: AtomicBool,
}

impl Shared {
    fn new(chain_id: ChainId) -> Self {
        Self {
            chain_id,
            next_id: AtomicU64::new(1),
            pending: DashMap::new(),
            abandoned: DashMap::new(),
            routes: Mutex::new(Routes::default()),
            closed: AtomicBool::new(false),
        }
    }

    fn unavailable(&self) -> SyncError {
        SyncError::ConnectionUnavailable {
            chain_id: self.chain_id.clone(),
        }
    }

    fn routes(&self) -> MutexGuard<'_, Routes> {
        match self.routes.lock() {
            Ok(r) => r,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn request_frame(&self, method: &str, params: Value) -> (u64, String) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params });
        (id, body.to_string())
    }

    /// Routes one inbound frame. Returns a frame to send back, if any.
    fn dispatch(&self, text: &str) -> Option<String> {
        let msg: Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "dropping non-JSON frame");
                return None;
            }
        };

        if let Some(id) = msg.get("id").and_then(Value::as_u64) {
            if let Some((_, tx)) = self.pending.remove(&id) {
                let _ = tx.send(parse_response(&msg));
                return None;
            }
            let (_, unsubscribe_method) = self.abandoned.remove(&id)?;
            let sub_id = msg.get("result").and_then(subscription_key)?;
            debug!(%sub_id, "releasing subscription answered after its caller gave up");
            self.routes().forget(&sub_id);
            let (_, frame) = self.request_frame(&unsubscribe_method, json!([sub_id]));
            return Some(frame);
        }

        let params = msg.get("params")?;
        let sub_id = params.get("subscription").and_then(subscription_key)?;
        let result = params.get("result").cloned().unwrap_or(Value::Null);

        let mut routes = self.routes();
        match routes.live.get(&sub_id) {
            Some(route) => {
                let _ = route.sender.send(SubscriptionEvent::Update(result));
            }
            None => routes.buffer(sub_id, result),
        }
        None
    }

    fn fail_all(&self, reason: &str) {
        self.closed.store(true, Ordering::SeqCst);

        let ids: Vec<u64> = self.pending.iter().map(|e| *e.key()).collect();
        for id in ids {
            if let Some((_, tx)) = self.pending.remove(&id) {
                let _ = tx.send(Err(self.unavailable()));
            }
        }
        self.abandoned.clear();

        let mut routes = self.routes();
        for (_, route) in routes.live.drain() {
            let _ = route
                .sender
                .send(SubscriptionEvent::Failure(reason.to_string()));
        }
        routes.early.clear();
    }
}

/// Removes an outstanding request when its caller stops waiting for the response.
struct PendingGuard<'a> {
    shared: &'a Shared,
    id: u64,
    /// Set for subscribe requests: a late subscription id is released on arrival.
    unsubscribe_method: Option<&'a str>,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.shared.pending.remove(&self.id).is_none() {
            return;
        }
        if let Some(method) = self.unsubscribe_method {
            self.shared.abandoned.insert(self.id, method.to_string());
        }
    }
}

fn subscription_key(v: &Value) -> Option<SubscriptionId> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn parse_response(msg: &Value) -> SyncResult<Value> {
    if let Some(err) = msg.get("error") {
        return Err(SyncError::Rpc {
            method: String::new(),
            code: err.get("code").and_then(Value::as_i64).unwrap_or_default(),
            message: err
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_string(),
        });
    }
    Ok(msg.get("result").cloned().unwrap_or(Value::Null))
}

pub struct WsConnection {
    shared: Arc<Shared>,
    outbound: mpsc::UnboundedSender<Message>,
    limiter: Option<DefaultDirectRateLimiter>,
}

impl WsConnection {
    /// Opens the socket and spawns its reader and writer tasks.
    pub async fn connect(
        url: &str,
        chain_id: impl Into<ChainId>,
        qps_limit: Option<u32>,
    ) -> SyncResult<Arc<Self>> {
        let chain_id = chain_id.into();
        let parsed = Url::parse(url)
            .map_err(|e| SyncError::Unexpected(format!("invalid ws url {url}: {e}")))?;
        if !matches!(parsed.scheme(), "ws" | "wss") {
            return Err(SyncError::Unexpected(format!(
                "unsupported scheme {} for chain connection",
                parsed.scheme()
            )));
        }

        info!(%chain_id, url, "connecting to chain node");
        let (socket, _) = connect_async(parsed.as_str()).await.map_err(|e| {
            warn!(%chain_id, error = %e, "websocket connect failed");
            SyncError::ConnectionUnavailable {
                chain_id: chain_id.clone(),
            }
        })?;
        let (mut sink, mut stream) = socket.split();

        let shared = Arc::new(Shared::new(chain_id));
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Message>();

        tokio::spawn(async move {
            while let Some(msg) = outbound_rx.recv().await {
                if let Err(e) = sink.send(msg).await {
                    warn!(error = %e, "websocket write failed");
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let reader_shared = shared.clone();
        let reader_outbound = outbound.clone();
        tokio::spawn(async move {
            let dispatch = |text: &str| {
                if let Some(reply) = reader_shared.dispatch(text) {
                    let _ = reader_outbound.send(Message::Text(reply));
                }
            };
            let reason = loop {
                match stream.next().await {
                    Some(Ok(Message::Text(text))) => dispatch(&text),
                    Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                        Ok(text) => dispatch(&text),
                        Err(_) => debug!("dropping non-UTF8 binary frame"),
                    },
                    Some(Ok(Message::Ping(payload))) => {
                        let _ = reader_outbound.send(Message::Pong(payload));
                    }
                    Some(Ok(Message::Close(_))) => break "closed by peer".to_string(),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break e.to_string(),
                    None => break "stream ended".to_string(),
                }
            };
            warn!(chain_id = %reader_shared.chain_id, %reason, "chain connection lost");
            reader_shared.fail_all(&reason);
        });

        let limiter = qps_limit
            .and_then(NonZeroU32::new)
            .map(|qps| RateLimiter::direct(Quota::per_second(qps)));

        Ok(Arc::new(Self {
            shared,
            outbound,
            limiter,
        }))
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    async fn send_request(
        &self,
        method: &str,
        params: Value,
        unsubscribe_method: Option<&str>,
    ) -> SyncResult<Value> {
        if self.is_closed() {
            return Err(self.shared.unavailable());
        }
        if let Some(limiter) = &self.limiter {
            limiter.until_ready().await;
        }

        let (id, frame) = self.shared.request_frame(method, params);
        let (tx, rx) = oneshot::channel();
        self.shared.pending.insert(id, tx);
        let mut guard = PendingGuard {
            shared: &self.shared,
            id,
            unsubscribe_method,
        };

        if self.outbound.send(Message::Text(frame)).is_err() {
            guard.unsubscribe_method = None;
            return Err(self.shared.unavailable());
        }

        match rx.await {
            Ok(Err(SyncError::Rpc { code, message, .. })) => Err(SyncError::Rpc {
                method: method.to_string(),
                code,
                message,
            }),
            Ok(result) => result,
            Err(_) => Err(self.shared.unavailable()),
        }
    }
}

#[async_trait]
impl ChainConnection for WsConnection {
    async fn request(&self, method: &str, params: Value) -> SyncResult<Value> {
        self.send_request(method, params, None).await
    }

    async fn subscribe(
        &self,
        method: &str,
        params: Value,
        unsubscribe_method: &str,
    ) -> SyncResult<Subscription> {
        let raw_id = self
            .send_request(method, params, Some(unsubscribe_method))
            .await?;
        let id = subscription_key(&raw_id).ok_or_else(|| {
            SyncError::decode("subscription id", format!("unexpected value {raw_id}"))
        })?;

        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut routes = self.shared.routes();
            routes.cancelled.shift_remove(&id);
            for early in routes.early.shift_remove(&id).unwrap_or_default() {
                let _ = tx.send(SubscriptionEvent::Update(early));
            }
            routes.live.insert(
                id.clone(),
                Route {
                    sender: tx,
                    unsubscribe_method: unsubscribe_method.to_string(),
                },
            );
        }
        debug!(%id, method, "subscription established");

        Ok(Subscription { id, events: rx })
    }

    async fn cancel(&self, id: &SubscriptionId) -> SyncResult<()> {
        let route = self.shared.routes().forget(id);

        let Some(route) = route else {
            return Ok(());
        };
        if self.is_closed() {
            return Ok(());
        }
        self.send_request(&route.unsubscribe_method, json!([id]), None)
            .await
            .map(|_| ())
    }
}
