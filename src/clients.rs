use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use log::{debug, warn};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use warp::ws::Message;

use crate::auth::Claims;
use crate::messages::{Role, ServerMessage};

/// One live socket. The registries and rooms hold it by `Arc`; the worker
/// pair owns the receiving half of `outbound`.
#[derive(Debug)]
pub struct Connection {
    pub id: String,
    pub account_id: String,
    pub name: String,
    pub role: Role,
    outbound: mpsc::Sender<Message>,
    closed: CancellationToken,
}

impl Connection {
    pub fn new(claims: &Claims, capacity: usize) -> (Self, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let connection = Connection {
            id: Uuid::new_v4().to_string(),
            account_id: claims.account_id.clone(),
            name: claims.name.clone(),
            role: claims.role,
            outbound: tx,
            closed: CancellationToken::new(),
        };
        (connection, rx)
    }

    /// Like `new`, but the worker pair also stops when `parent` is cancelled.
    pub fn with_parent(
        claims: &Claims,
        capacity: usize,
        parent: &CancellationToken,
    ) -> (Self, mpsc::Receiver<Message>) {
        let (mut connection, rx) = Self::new(claims, capacity);
        connection.closed = parent.child_token();
        (connection, rx)
    }

    /// Queues an event without waiting. A full queue drops the event.
    pub fn send(&self, message: &ServerMessage) -> bool {
        match message.encode() {
            Ok(text) => self.send_text(text),
            Err(e) => {
                warn!("Failed to encode outbound event for {}: {}", self.id, e);
                false
            }
        }
    }

    pub fn send_text(&self, text: String) -> bool {
        match self.outbound.try_send(Message::text(text)) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(
                    "Outbound queue full for connection {} ({}), dropping event",
                    self.id, self.account_id
                );
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!("Outbound queue closed for connection {}", self.id);
                false
            }
        }
    }

    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn closed(&self) -> &CancellationToken {
        &self.closed
    }
}

#[derive(Default)]
struct Clients {
    by_id: HashMap<String, Arc<Connection>>,
    by_account: HashMap<String, HashSet<String>>,
}

impl Clients {
    fn remove(&mut self, id: &str) -> Option<Arc<Connection>> {
        let connection = self.by_id.remove(id)?;
        if let Some(ids) = self.by_account.get_mut(&connection.account_id) {
            ids.remove(id);
            if ids.is_empty() {
                self.by_account.remove(&connection.account_id);
            }
        }
        Some(connection)
    }

    fn for_account(&self, account_id: &str) -> impl Iterator<Item = &Arc<Connection>> {
        self.by_account
            .get(account_id)
            .into_iter()
            .flatten()
            .filter_map(move |id| self.by_id.get(id))
    }
}

/// Directory of live connections, indexed by connection and by account.
#[derive(Default)]
pub struct ClientRegistry {
    clients: RwLock<Clients>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add(&self, connection: Arc<Connection>) {
        let mut clients = self.clients.write().await;
        clients
            .by_account
            .entry(connection.account_id.clone())
            .or_default()
            .insert(connection.id.clone());
        clients.by_id.insert(connection.id.clone(), connection);
    }

    pub async fn remove_by_id(&self, id: &str) -> Option<Arc<Connection>> {
        self.clients.write().await.remove(id)
    }

    pub async fn remove_all_for_account(&self, account_id: &str) -> Vec<Arc<Connection>> {
        let mut clients = self.clients.write().await;
        let ids: Vec<String> = clients
            .by_account
            .get(account_id)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default();
        ids.iter().filter_map(|id| clients.remove(id)).collect()
    }

    pub async fn get_by_id(&self, id: &str) -> Option<Arc<Connection>> {
        self.clients.read().await.by_id.get(id).cloned()
    }

    pub async fn get_all_for_account(&self, account_id: &str) -> Vec<Arc<Connection>> {
        self.clients
            .read()
            .await
            .for_account(account_id)
            .cloned()
            .collect()
    }

    /// The caller's sibling devices: same account, other connections.
    pub async fn get_others_for_account(&self, connection: &Connection) -> Vec<Arc<Connection>> {
        self.clients
            .read()
            .await
            .for_account(&connection.account_id)
            .filter(|c| c.id != connection.id)
            .cloned()
            .collect()
    }

    pub async fn has_account(&self, account_id: &str) -> bool {
        self.clients.read().await.by_account.contains_key(account_id)
    }

    pub async fn len(&self) -> usize {
        self.clients.read().await.by_id.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn drain(&self) -> Vec<Arc<Connection>> {
        let mut clients = self.clients.write().await;
        clients.by_account.clear();
        clients.by_id.drain().map(|(_, c)| c).collect()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn connection(account: &str) -> (Arc<Connection>, mpsc::Receiver<Message>) {
        let claims = Claims {
            account_id: account.to_string(),
            name: account.to_uppercase(),
            role: Role::User,
        };
        let (connection, rx) = Connection::new(&claims, 4);
        (Arc::new(connection), rx)
    }

    #[tokio::test]
    async fn indexes_connections_by_account() {
        let registry = ClientRegistry::new();
        let (a1, _rx1) = connection("a");
        let (a2, _rx2) = connection("a");
        let (b1, _rx3) = connection("b");
        registry.add(a1.clone()).await;
        registry.add(a2.clone()).await;
        registry.add(b1.clone()).await;

        assert_eq!(registry.len().await, 3);
        assert_eq!(registry.get_all_for_account("a").await.len(), 2);

        let others = registry.get_others_for_account(&a1).await;
        assert_eq!(others.len(), 1);
        assert_eq!(others[0].id, a2.id);

        assert!(registry.get_by_id(&b1.id).await.is_some());
        assert!(registry.get_by_id("missing").await.is_none());
    }

    #[tokio::test]
    async fn removal_keeps_account_index_consistent() {
        let registry = ClientRegistry::new();
        let (a1, _rx1) = connection("a");
        let (a2, _rx2) = connection("a");
        registry.add(a1.clone()).await;
        registry.add(a2.clone()).await;

        assert!(registry.remove_by_id(&a1.id).await.is_some());
        assert!(registry.remove_by_id(&a1.id).await.is_none());
        assert!(registry.has_account("a").await);

        let removed = registry.remove_all_for_account("a").await;
        assert_eq!(removed.len(), 1);
        assert!(!registry.has_account("a").await);
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn send_never_blocks_on_a_full_queue() {
        let (a, mut rx) = connection("a");
        let msg = ServerMessage::Error {
            code: 1,
            message: "x".into(),
        };
        for _ in 0..4 {
            assert!(a.send(&msg));
        }
        assert!(!a.send(&msg));
        assert!(rx.recv().await.is_some());
        assert!(a.send(&msg));
    }
}
