use std::collections::HashMap;
use std::sync::Arc;

use log::warn;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::clients::Connection;
use crate::messages::{Role, ServerMessage};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomInfo {
    pub id: String,
    pub name: String,
    pub description: String,
    pub invite_only: bool,
    pub private: bool,
}

impl RoomInfo {
    pub fn new(name: String, description: String, invite_only: bool, private: bool) -> Self {
        RoomInfo {
            id: Uuid::new_v4().to_string(),
            name,
            description,
            invite_only,
            private,
        }
    }
}

#[derive(Default)]
struct Members {
    connections: HashMap<String, Arc<Connection>>, // connection_id -> connection
    roles: HashMap<String, Role>,                  // account_id -> role
}

impl Members {
    fn account_connected(&self, account_id: &str) -> bool {
        self.connections
            .values()
            .any(|c| c.account_id == account_id)
    }
}

/// In-memory mirror of a persisted room. Roles are per account; a role entry
/// lives as long as at least one of the account's connections is joined.
pub struct Room {
    pub info: RoomInfo,
    members: RwLock<Members>,
}

impl Room {
    pub fn new(info: RoomInfo) -> Self {
        Room {
            info,
            members: RwLock::new(Members::default()),
        }
    }

    pub fn id(&self) -> &str {
        &self.info.id
    }

    pub async fn has_connection(&self, connection_id: &str) -> bool {
        self.members.read().await.connections.contains_key(connection_id)
    }

    pub async fn has_account(&self, account_id: &str) -> bool {
        self.members.read().await.roles.contains_key(account_id)
    }

    pub async fn role_of(&self, account_id: &str) -> Option<Role> {
        self.members.read().await.roles.get(account_id).copied()
    }

    /// Joins `connection`. An account that already holds a role keeps it.
    pub async fn add_connection(&self, connection: Arc<Connection>, role: Role) {
        let mut members = self.members.write().await;
        members
            .roles
            .entry(connection.account_id.clone())
            .or_insert(role);
        members.connections.insert(connection.id.clone(), connection);
    }

    pub async fn remove_connection(&self, connection_id: &str) -> Option<Arc<Connection>> {
        let mut members = self.members.write().await;
        let connection = members.connections.remove(connection_id)?;
        if !members.account_connected(&connection.account_id) {
            members.roles.remove(&connection.account_id);
        }
        Some(connection)
    }

    pub async fn remove_all_for_account(&self, account_id: &str) -> Vec<Arc<Connection>> {
        let mut members = self.members.write().await;
        members.roles.remove(account_id);
        let ids: Vec<String> = members
            .connections
            .values()
            .filter(|c| c.account_id == account_id)
            .map(|c| c.id.clone())
            .collect();
        ids.iter()
            .filter_map(|id| members.connections.remove(id))
            .collect()
    }

    pub async fn connection_count(&self) -> usize {
        self.members.read().await.connections.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.connection_count().await == 0
    }

    pub async fn connections(&self) -> Vec<Arc<Connection>> {
        self.members
            .read()
            .await
            .connections
            .values()
            .cloned()
            .collect()
    }

    /// Queues `message` on every joined connection except `exclude`. The
    /// membership is snapshotted first so no lock is held while enqueueing.
    pub async fn broadcast(&self, message: &ServerMessage, exclude: &[&str]) -> usize {
        let text = match message.encode() {
            Ok(text) => text,
            Err(e) => {
                warn!("Failed to encode broadcast for room {}: {}", self.info.id, e);
                return 0;
            }
        };

        self.connections()
            .await
            .into_iter()
            .filter(|c| !exclude.contains(&c.id.as_str()))
            .filter(|c| c.send_text(text.clone()))
            .count()
    }

    pub async fn broadcast_except_account(&self, message: &ServerMessage, account_id: &str) -> usize {
        let excluded: Vec<String> = self
            .connections()
            .await
            .into_iter()
            .filter(|c| c.account_id == account_id)
            .map(|c| c.id.clone())
            .collect();
        let excluded: Vec<&str> = excluded.iter().map(String::as_str).collect();
        self.broadcast(message, &excluded).await
    }
}

/// Directory of rooms that currently have live members.
#[derive(Default)]
pub struct RoomRegistry {
    rooms: RwLock<HashMap<String, Arc<Room>>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add(&self, room: Arc<Room>) {
        self.rooms.write().await.insert(room.info.id.clone(), room);
    }

    pub async fn get_by_id(&self, id: &str) -> Option<Arc<Room>> {
        self.rooms.read().await.get(id).cloned()
    }

    pub async fn get_by_name(&self, name: &str) -> Option<Arc<Room>> {
        self.rooms
            .read()
            .await
            .values()
            .find(|room| room.info.name == name)
            .cloned()
    }

    pub async fn remove_by_id(&self, id: &str) -> Option<Arc<Room>> {
        self.rooms.write().await.remove(id)
    }

    pub async fn snapshot(&self) -> Vec<Arc<Room>> {
        self.rooms.read().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn drain(&self) -> Vec<Arc<Room>> {
        self.rooms.write().await.drain().map(|(_, room)| room).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::tests::connection;

    fn room() -> Room {
        Room::new(RoomInfo::new("team".into(), String::new(), false, false))
    }

    #[tokio::test]
    async fn existing_role_is_not_overwritten() {
        let room = room();
        let (a1, _rx1) = connection("a");
        let (a2, _rx2) = connection("a");
        room.add_connection(a1.clone(), Role::Admin).await;
        room.add_connection(a2.clone(), Role::User).await;
        room.add_connection(a1.clone(), Role::User).await;

        assert_eq!(room.role_of("a").await, Some(Role::Admin));
        assert_eq!(room.connection_count().await, 2);
        assert!(room.has_account("a").await);
        assert!(!room.has_account("b").await);
    }

    #[tokio::test]
    async fn role_cleared_with_last_connection() {
        let room = room();
        let (a1, _rx1) = connection("a");
        let (a2, _rx2) = connection("a");
        room.add_connection(a1.clone(), Role::Admin).await;
        room.add_connection(a2.clone(), Role::Admin).await;

        assert!(room.remove_connection(&a1.id).await.is_some());
        assert!(room.has_account("a").await);
        assert!(!room.has_connection(&a1.id).await);

        assert!(room.remove_connection(&a2.id).await.is_some());
        assert!(!room.has_account("a").await);
        assert!(room.is_empty().await);
        assert!(room.remove_connection(&a2.id).await.is_none());
    }

    #[tokio::test]
    async fn remove_all_for_account_leaves_others() {
        let room = room();
        let (a1, _rx1) = connection("a");
        let (a2, _rx2) = connection("a");
        let (b1, _rx3) = connection("b");
        room.add_connection(a1, Role::User).await;
        room.add_connection(a2, Role::User).await;
        room.add_connection(b1.clone(), Role::Admin).await;

        assert_eq!(room.remove_all_for_account("a").await.len(), 2);
        assert!(!room.has_account("a").await);
        assert!(room.has_connection(&b1.id).await);
    }

    #[tokio::test]
    async fn broadcast_skips_excluded_and_full_peers() {
        let room = room();
        let (a, mut rx_a) = connection("a");
        let (b, mut rx_b) = connection("b");
        let (c, mut rx_c) = connection("c");
        room.add_connection(a.clone(), Role::User).await;
        room.add_connection(b.clone(), Role::User).await;
        room.add_connection(c.clone(), Role::User).await;

        let msg = ServerMessage::Error {
            code: 0,
            message: "ping".into(),
        };
        // Fill c's queue so it cannot accept more.
        for _ in 0..4 {
            assert!(c.send(&msg));
        }

        assert_eq!(room.broadcast(&msg, &[a.id.as_str()]).await, 1);
        assert!(rx_a.try_recv().is_err());
        assert!(rx_b.try_recv().is_ok());
        for _ in 0..4 {
            assert!(rx_c.try_recv().is_ok());
        }
        assert!(rx_c.try_recv().is_err());
    }

    #[tokio::test]
    async fn broadcast_except_account_skips_every_device() {
        let room = room();
        let (a1, mut rx1) = connection("a");
        let (a2, mut rx2) = connection("a");
        let (b, mut rx_b) = connection("b");
        room.add_connection(a1, Role::User).await;
        room.add_connection(a2, Role::User).await;
        room.add_connection(b, Role::User).await;

        let msg = ServerMessage::Error {
            code: 0,
            message: "typing".into(),
        };
        assert_eq!(room.broadcast_except_account(&msg, "a").await, 1);
        assert!(rx1.try_recv().is_err());
        assert!(rx2.try_recv().is_err());
        assert!(rx_b.try_recv().is_ok());
    }

    #[tokio::test]
    async fn registry_lookup_and_removal() {
        let registry = RoomRegistry::new();
        let room = Arc::new(room());
        let id = room.info.id.clone();
        registry.add(room).await;

        assert!(registry.get_by_id(&id).await.is_some());
        assert!(registry.get_by_name("team").await.is_some());
        assert!(registry.get_by_name("other").await.is_none());
        assert!(registry.remove_by_id(&id).await.is_some());
        assert!(registry.get_by_id(&id).await.is_none());
        assert!(registry.is_empty().await);
    }
}
