//! Persistence seams. The hub only talks to these traits; `MemoryStore`
//! backs all three for development and tests.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::StoreError;
use crate::messages::{ChatMessage, Notification, Role};
use crate::room::RoomInfo;

fn default_role() -> Role {
    Role::User
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    pub name: String,
    #[serde(default = "default_role")]
    pub role: Role,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Membership {
    pub room: RoomInfo,
    pub role: Role,
}

/// Message/notification history and online counters.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    async fn create_message(&self, message: &ChatMessage) -> Result<(), StoreError>;
    async fn create_notification(&self, notification: &Notification) -> Result<(), StoreError>;
    /// Messages with `from_ts <= ts <= to_ts`, oldest first. `None` reads to now.
    async fn find_room_messages(
        &self,
        room_id: &str,
        from_ts: i64,
        to_ts: Option<i64>,
    ) -> Result<Vec<ChatMessage>, StoreError>;
    async fn find_room_notifications(
        &self,
        room_id: &str,
        from_ts: i64,
        to_ts: Option<i64>,
    ) -> Result<Vec<Notification>, StoreError>;
    async fn mark_account_online(&self, account_id: &str) -> Result<(), StoreError>;
    async fn mark_account_offline(&self, account_id: &str) -> Result<(), StoreError>;
    async fn reset_all_presence(&self) -> Result<(), StoreError>;
    async fn online_count(&self, account_id: &str) -> Result<u32, StoreError>;
}

/// Rooms and who belongs to them.
#[async_trait]
pub trait MembershipStore: Send + Sync {
    async fn create_room(&self, room: &RoomInfo) -> Result<(), StoreError>;
    async fn find_room_by_id(&self, room_id: &str) -> Result<Option<RoomInfo>, StoreError>;
    async fn find_room_by_name(&self, name: &str) -> Result<Option<RoomInfo>, StoreError>;
    async fn find_rooms_by_account(&self, account_id: &str) -> Result<Vec<Membership>, StoreError>;
    async fn delete_room(&self, room_id: &str) -> Result<(), StoreError>;
    async fn add_membership(
        &self,
        room_id: &str,
        account_id: &str,
        role: Role,
    ) -> Result<(), StoreError>;
    async fn remove_membership(&self, room_id: &str, account_id: &str) -> Result<(), StoreError>;
    async fn find_role(&self, room_id: &str, account_id: &str) -> Result<Option<Role>, StoreError>;
    async fn count_members(&self, room_id: &str) -> Result<usize, StoreError>;
}

#[async_trait]
pub trait AccountDirectory: Send + Sync {
    async fn find_account(&self, account_id: &str) -> Result<Option<Account>, StoreError>;
    /// Case-insensitive substring match on the display name.
    async fn find_accounts_by_name(&self, fragment: &str) -> Result<Vec<Account>, StoreError>;
}

#[derive(Clone)]
pub struct Stores {
    pub history: Arc<dyn HistoryStore>,
    pub rooms: Arc<dyn MembershipStore>,
    pub accounts: Arc<dyn AccountDirectory>,
}

impl Stores {
    pub fn memory(store: Arc<MemoryStore>) -> Self {
        Stores {
            history: store.clone(),
            rooms: store.clone(),
            accounts: store,
        }
    }
}

#[derive(Default)]
pub struct MemoryStore {
    accounts: RwLock<HashMap<String, Account>>,
    rooms: RwLock<HashMap<String, RoomInfo>>,
    memberships: RwLock<HashMap<String, HashMap<String, Role>>>, // room_id -> account_id -> role
    messages: RwLock<Vec<ChatMessage>>,
    notifications: RwLock<Vec<Notification>>,
    presence: RwLock<HashMap<String, u32>>,
}

fn in_range(ts: i64, from_ts: i64, to_ts: Option<i64>) -> bool {
    ts >= from_ts && to_ts.map_or(true, |to| ts <= to)
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_accounts(accounts: impl IntoIterator<Item = Account>) -> Self {
        let accounts = accounts
            .into_iter()
            .map(|account| (account.id.clone(), account))
            .collect();
        MemoryStore {
            accounts: RwLock::new(accounts),
            ..Self::default()
        }
    }

    pub async fn add_account(&self, account: Account) {
        self.accounts
            .write()
            .await
            .insert(account.id.clone(), account);
    }
}

#[async_trait]
impl HistoryStore for MemoryStore {
    async fn create_message(&self, message: &ChatMessage) -> Result<(), StoreError> {
        self.messages.write().await.push(message.clone());
        Ok(())
    }

    async fn create_notification(&self, notification: &Notification) -> Result<(), StoreError> {
        self.notifications.write().await.push(notification.clone());
        Ok(())
    }

    async fn find_room_messages(
        &self,
        room_id: &str,
        from_ts: i64,
        to_ts: Option<i64>,
    ) -> Result<Vec<ChatMessage>, StoreError> {
        let mut found: Vec<ChatMessage> = self
            .messages
            .read()
            .await
            .iter()
            .filter(|m| m.room_id == room_id && in_range(m.ts, from_ts, to_ts))
            .cloned()
            .collect();
        found.sort_by_key(|m| m.ts);
        Ok(found)
    }

    async fn find_room_notifications(
        &self,
        room_id: &str,
        from_ts: i64,
        to_ts: Option<i64>,
    ) -> Result<Vec<Notification>, StoreError> {
        let mut found: Vec<Notification> = self
            .notifications
            .read()
            .await
            .iter()
            .filter(|n| n.room_id == room_id && in_range(n.ts, from_ts, to_ts))
            .cloned()
            .collect();
        found.sort_by_key(|n| n.ts);
        Ok(found)
    }

    async fn mark_account_online(&self, account_id: &str) -> Result<(), StoreError> {
        *self
            .presence
            .write()
            .await
            .entry(account_id.to_string())
            .or_insert(0) += 1;
        Ok(())
    }

    async fn mark_account_offline(&self, account_id: &str) -> Result<(), StoreError> {
        let mut presence = self.presence.write().await;
        if let Some(count) = presence.get_mut(account_id) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                presence.remove(account_id);
            }
        }
        Ok(())
    }

    async fn reset_all_presence(&self) -> Result<(), StoreError> {
        self.presence.write().await.clear();
        Ok(())
    }

    async fn online_count(&self, account_id: &str) -> Result<u32, StoreError> {
        Ok(self
            .presence
            .read()
            .await
            .get(account_id)
            .copied()
            .unwrap_or(0))
    }
}

#[async_trait]
impl MembershipStore for MemoryStore {
    async fn create_room(&self, room: &RoomInfo) -> Result<(), StoreError> {
        let mut rooms = self.rooms.write().await;
        if rooms.contains_key(&room.id) {
            return Err(StoreError::Conflict);
        }
        rooms.insert(room.id.clone(), room.clone());
        Ok(())
    }

    async fn find_room_by_id(&self, room_id: &str) -> Result<Option<RoomInfo>, StoreError> {
        Ok(self.rooms.read().await.get(room_id).cloned())
    }

    async fn find_room_by_name(&self, name: &str) -> Result<Option<RoomInfo>, StoreError> {
        Ok(self
            .rooms
            .read()
            .await
            .values()
            .find(|room| room.name == name)
            .cloned())
    }

    async fn find_rooms_by_account(&self, account_id: &str) -> Result<Vec<Membership>, StoreError> {
        let rooms = self.rooms.read().await;
        let memberships = self.memberships.read().await;
        let mut found: Vec<Membership> = memberships
            .iter()
            .filter_map(|(room_id, members)| {
                let role = *members.get(account_id)?;
                let room = rooms.get(room_id)?.clone();
                Some(Membership { room, role })
            })
            .collect();
        found.sort_by(|a, b| a.room.name.cmp(&b.room.name));
        Ok(found)
    }

    async fn delete_room(&self, room_id: &str) -> Result<(), StoreError> {
        self.memberships.write().await.remove(room_id);
        self.rooms
            .write()
            .await
            .remove(room_id)
            .map(|_| ())
            .ok_or(StoreError::NotFound)
    }

    async fn add_membership(
        &self,
        room_id: &str,
        account_id: &str,
        role: Role,
    ) -> Result<(), StoreError> {
        if !self.rooms.read().await.contains_key(room_id) {
            return Err(StoreError::NotFound);
        }
        let mut memberships = self.memberships.write().await;
        let members = memberships.entry(room_id.to_string()).or_default();
        if members.contains_key(account_id) {
            return Err(StoreError::Conflict);
        }
        members.insert(account_id.to_string(), role);
        Ok(())
    }

    async fn remove_membership(&self, room_id: &str, account_id: &str) -> Result<(), StoreError> {
        self.memberships
            .write()
            .await
            .get_mut(room_id)
            .and_then(|members| members.remove(account_id))
            .map(|_| ())
            .ok_or(StoreError::NotFound)
    }

    async fn find_role(&self, room_id: &str, account_id: &str) -> Result<Option<Role>, StoreError> {
        Ok(self
            .memberships
            .read()
            .await
            .get(room_id)
            .and_then(|members| members.get(account_id))
            .copied())
    }

    async fn count_members(&self, room_id: &str) -> Result<usize, StoreError> {
        Ok(self
            .memberships
            .read()
            .await
            .get(room_id)
            .map_or(0, HashMap::len))
    }
}

#[async_trait]
impl AccountDirectory for MemoryStore {
    async fn find_account(&self, account_id: &str) -> Result<Option<Account>, StoreError> {
        Ok(self.accounts.read().await.get(account_id).cloned())
    }

    async fn find_accounts_by_name(&self, fragment: &str) -> Result<Vec<Account>, StoreError> {
        let fragment = fragment.to_lowercase();
        let mut found: Vec<Account> = self
            .accounts
            .read()
            .await
            .values()
            .filter(|account| account.name.to_lowercase().contains(&fragment))
            .cloned()
            .collect();
        found.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(found)
    }
}
