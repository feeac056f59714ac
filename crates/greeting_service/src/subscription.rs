//! Connection and subscription registry.
//!
//! Every transport connection owns a parent cancellation token and an arena
//! mapping correlation ids to child tokens. Closing the connection cancels the
//! parent, which cancels every child at once; a child opened after close is
//! born cancelled. Each [`Subscription`] removes its own entry when dropped, so
//! the live count only reaches zero once every producer has exited.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use metrics::{counter, gauge};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

/// Unique connection identifier.
pub type ConnectionId = Uuid;

/// Subscription identifier, unique within one connection.
pub type CorrelationId = u64;

/// Wire binding a connection arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    PushStream,
    DuplexSocket,
    MultiplexedRpc,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::PushStream => "push_stream",
            TransportKind::DuplexSocket => "duplex_socket",
            TransportKind::MultiplexedRpc => "multiplexed_rpc",
        }
    }
}

/// State for a single transport connection.
pub struct ConnectionState {
    /// Unique connection identifier.
    pub id: ConnectionId,
    /// Binding this connection belongs to.
    pub kind: TransportKind,
    cancel: CancellationToken,
    subscriptions: DashMap<CorrelationId, CancellationToken>,
    next_id: AtomicU64,
    live: Arc<AtomicUsize>,
}

impl ConnectionState {
    fn new(kind: TransportKind, live: Arc<AtomicUsize>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            cancel: CancellationToken::new(),
            subscriptions: DashMap::new(),
            next_id: AtomicU64::new(1),
            live,
        }
    }

    /// Open a subscription under the next free local id.
    pub fn open(self: &Arc<Self>) -> Subscription {
        loop {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            if let Some(subscription) = self.open_with_id(id) {
                return subscription;
            }
        }
    }

    /// Open a subscription under a caller-chosen id.
    ///
    /// Returns `None` while another subscription with the same id is active.
    pub fn open_with_id(self: &Arc<Self>, id: CorrelationId) -> Option<Subscription> {
        match self.subscriptions.entry(id) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                let token = self.cancel.child_token();
                slot.insert(token.clone());
                let live = self.live.fetch_add(1, Ordering::AcqRel) + 1;
                gauge!("greeting_active_subscriptions").set(live as f64);
                debug!("Connection {} opened subscription {}", self.id, id);
                Some(Subscription {
                    id,
                    kind: self.kind,
                    token,
                    connection: Arc::clone(self),
                })
            }
        }
    }

    /// Cancel one subscription. Returns false if it is not active.
    pub fn cancel(&self, id: CorrelationId) -> bool {
        match self.subscriptions.get(&id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every subscription owned by this connection.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Number of subscriptions whose producers have not exited yet.
    pub fn active_subscriptions(&self) -> usize {
        self.subscriptions.len()
    }

    fn release(&self, id: CorrelationId) {
        if self.subscriptions.remove(&id).is_some() {
            let live = self.live.fetch_sub(1, Ordering::AcqRel) - 1;
            gauge!("greeting_active_subscriptions").set(live as f64);
            debug!("Connection {} released subscription {}", self.id, id);
        }
    }
}

/// Handle held by the task producing one subscription's events.
pub struct Subscription {
    id: CorrelationId,
    kind: TransportKind,
    token: CancellationToken,
    connection: Arc<ConnectionState>,
}

impl Subscription {
    pub fn id(&self) -> CorrelationId {
        self.id
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection.id
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the subscription or its connection is cancelled.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.connection.release(self.id);
    }
}

/// Registry of live connections across all bindings.
pub struct SubscriptionRegistry {
    connections: DashMap<ConnectionId, Arc<ConnectionState>>,
    live: Arc<AtomicUsize>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
            live: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Register a new connection.
    pub fn register(&self, kind: TransportKind) -> Arc<ConnectionState> {
        let connection = Arc::new(ConnectionState::new(kind, Arc::clone(&self.live)));
        self.connections.insert(connection.id, Arc::clone(&connection));

        counter!("greeting_connections_total", "transport" => kind.as_str()).increment(1);
        gauge!("greeting_active_connections").set(self.connections.len() as f64);
        info!("{} connection {} registered", kind.as_str(), connection.id);
        connection
    }

    /// Register a connection that is unregistered when the guard drops.
    pub fn connect(self: &Arc<Self>, kind: TransportKind) -> ConnectionGuard {
        ConnectionGuard {
            registry: Arc::clone(self),
            connection: self.register(kind),
        }
    }

    /// Unregister a connection and cancel all of its subscriptions.
    pub fn unregister(&self, id: &ConnectionId) {
        if let Some((_, connection)) = self.connections.remove(id) {
            connection.close();
            gauge!("greeting_active_connections").set(self.connections.len() as f64);
            info!(
                "{} connection {} unregistered ({} subscriptions cancelled)",
                connection.kind.as_str(),
                id,
                connection.active_subscriptions()
            );
        }
    }

    /// Cancel everything, used on shutdown.
    pub fn close_all(&self) {
        let ids: Vec<ConnectionId> = self.connections.iter().map(|e| *e.key()).collect();
        for id in ids {
            self.unregister(&id);
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Subscriptions whose producers are still running, across all connections.
    pub fn subscription_count(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }
}

/// Keeps a connection registered for as long as its handler runs.
///
/// Dropping the guard unregisters the connection, which cancels every
/// subscription it owns.
pub struct ConnectionGuard {
    registry: Arc<SubscriptionRegistry>,
    connection: Arc<ConnectionState>,
}

impl ConnectionGuard {
    pub fn connection(&self) -> &Arc<ConnectionState> {
        &self.connection
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.registry.unregister(&self.connection.id);
    }
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
