use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use murmur_core::UserId;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Unique per-connection identifier. Never persisted.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ClientId(pub String);

impl Default for ClientId {
    fn default() -> Self {
        Self(format!("client_{}", Uuid::now_v7()))
    }
}

impl ClientId {
    pub fn new() -> Self {
        Self::default()
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A connected WebSocket client.
pub struct Client {
    pub id: ClientId,
    tx: mpsc::Sender<String>,
    user_id: Mutex<Option<UserId>>,
    connected: AtomicBool,
    last_pong: AtomicU64,
    dropped: AtomicU64,
}

impl Client {
    fn new(id: ClientId, tx: mpsc::Sender<String>) -> Self {
        Self {
            id,
            tx,
            user_id: Mutex::new(None),
            connected: AtomicBool::new(true),
            last_pong: AtomicU64::new(now_secs()),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    pub fn user_id(&self) -> Option<UserId> {
        self.user_id.lock().clone()
    }

    pub fn record_pong(&self) {
        self.last_pong.store(now_secs(), Ordering::Relaxed);
    }

    pub fn is_alive(&self, timeout: Duration) -> bool {
        let last = self.last_pong.load(Ordering::Relaxed);
        now_secs().saturating_sub(last) < timeout.as_secs()
    }

    pub fn drop_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Queue a frame. Drops it when the queue is full or the writer is gone.
    fn send(&self, frame: String) -> bool {
        match self.tx.try_send(frame) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(frame)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    client_id = %self.id,
                    frame_len = frame.len(),
                    "Send queue full, dropping frame"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Live connections of this process, plus their delivery groups.
///
/// A delivery group is the set of connections subscribed to one userID.
/// Joining on connect and leaving on disconnect are its only mutations.
pub struct ClientRegistry {
    clients: DashMap<ClientId, Arc<Client>>,
    groups: DashMap<UserId, HashSet<ClientId>>,
    max_send_queue: usize,
}

impl ClientRegistry {
    pub fn new(max_send_queue: usize) -> Self {
        Self {
            clients: DashMap::new(),
            groups: DashMap::new(),
            max_send_queue,
        }
    }

    /// Register a new client and return its ID plus the receiving end of its queue.
    pub fn register(&self) -> (ClientId, mpsc::Receiver<String>) {
        self.insert(None)
    }

    /// Like [`register`](Self::register), but `initial_frame` is queued before
    /// the client becomes visible, so it is always the first frame delivered.
    pub fn register_with(&self, initial_frame: String) -> (ClientId, mpsc::Receiver<String>) {
        self.insert(Some(initial_frame))
    }

    fn insert(&self, initial_frame: Option<String>) -> (ClientId, mpsc::Receiver<String>) {
        let id = ClientId::new();
        let (tx, rx) = mpsc::channel(self.max_send_queue);
        let client = Client::new(id.clone(), tx);
        if let Some(frame) = initial_frame {
            client.send(frame);
        }
        self.clients.insert(id.clone(), Arc::new(client));
        (id, rx)
    }

    pub fn get(&self, id: &ClientId) -> Option<Arc<Client>> {
        self.clients.get(id).map(|c| Arc::clone(c.value()))
    }

    /// Subscribe a client to the delivery group of `user_id`.
    pub fn join_group(&self, client_id: &ClientId, user_id: &UserId) {
        let Some(client) = self.get(client_id) else {
            return;
        };
        *client.user_id.lock() = Some(user_id.clone());
        self.groups
            .entry(user_id.clone())
            .or_default()
            .insert(client_id.clone());

        // An unregister that ran between the lookup and the insert has already
        // swept the group, so undo the insert ourselves.
        if !self.clients.contains_key(client_id) {
            self.leave_group(user_id, client_id);
        }
    }

    /// Remove a client and release its delivery-group subscription.
    pub fn unregister(&self, id: &ClientId) {
        let Some((_, client)) = self.clients.remove(id) else {
            return;
        };
        client.connected.store(false, Ordering::Relaxed);

        if let Some(user_id) = client.user_id() {
            self.leave_group(&user_id, id);
        }
    }

    fn leave_group(&self, user_id: &UserId, id: &ClientId) {
        let now_empty = match self.groups.get_mut(user_id) {
            Some(mut members) => {
                members.remove(id);
                members.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.groups.remove_if(user_id, |_, members| members.is_empty());
        }
    }

    /// Send a frame to one client.
    pub fn send_to(&self, client_id: &ClientId, frame: String) -> bool {
        match self.get(client_id) {
            Some(client) => client.send(frame),
            None => false,
        }
    }

    /// Send a frame to every connection in the delivery group of `user_id`.
    /// Returns how many connections accepted it.
    pub fn send_to_user(&self, user_id: &UserId, frame: &str) -> usize {
        let members: Vec<ClientId> = match self.groups.get(user_id) {
            Some(members) => members.iter().cloned().collect(),
            None => return 0,
        };
        members
            .iter()
            .filter_map(|id| self.get(id))
            .filter(|c| c.is_connected() && c.send(frame.to_string()))
            .count()
    }

    /// Send a frame to every connection.
    pub fn broadcast_all(&self, frame: &str) -> usize {
        let clients: Vec<Arc<Client>> = self.clients.iter().map(|e| Arc::clone(e.value())).collect();
        clients
            .iter()
            .filter(|c| c.is_connected() && c.send(frame.to_string()))
            .count()
    }

    /// Number of connected clients.
    pub fn count(&self) -> usize {
        self.clients.len()
    }

    /// Number of live connections subscribed to `user_id`.
    pub fn group_size(&self, user_id: &UserId) -> usize {
        self.groups.get(user_id).map(|m| m.len()).unwrap_or(0)
    }

    pub fn record_pong(&self, client_id: &ClientId) {
        if let Some(client) = self.get(client_id) {
            client.record_pong();
        }
    }

    /// Remove clients that haven't responded to pings within the timeout.
    pub fn cleanup_dead_clients(&self, timeout: Duration) -> usize {
        let dead: Vec<ClientId> = self
            .clients
            .iter()
            .filter(|entry| !entry.value().is_alive(timeout))
            .map(|entry| entry.key().clone())
            .collect();

        for id in &dead {
            self.unregister(id);
            tracing::info!(client_id = %id, "Cleaned up dead client");
        }
        dead.len()
    }
}

/// Start a background task that periodically cleans up dead clients.
pub fn start_cleanup_task(
    registry: Arc<ClientRegistry>,
    interval: Duration,
    timeout: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let removed = registry.cleanup_dead_clients(timeout);
            if removed > 0 {
                tracing::info!(removed = removed, "Dead client cleanup");
            }
        }
    })
}
