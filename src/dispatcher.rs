//! Single consumer of the shared inbound queue.
//!
//! Every registry mutation goes through here, one event at a time, so the
//! client and room registries never need a cross-registry transaction.
//! Persistence happens before the in-memory state changes; a store failure
//! leaves the registries as they were.

use std::collections::HashSet;
use std::sync::Arc;

use log::{debug, error, info, warn};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::clients::{ClientRegistry, Connection};
use crate::error::{ChatError, StoreError};
use crate::messages::{
    ChatInput, ChatMessage, ChatView, ClientMessage, CreateRoomInput, Envelope, GetUsersInput,
    Notification, NotificationKind, NotificationView, RangeInput, Reply, Role, RoomRef,
    RoomUsersInput, ServerMessage, Target, TypingInput,
};
use crate::room::{Room, RoomInfo, RoomRegistry};
use crate::store::{Account, Membership, Stores};

pub enum Inbound {
    Register(Arc<Connection>),
    Event {
        connection: Arc<Connection>,
        envelope: Envelope,
    },
    /// A frame the read worker could not turn into an envelope. Answered in
    /// queue order like any other event.
    Malformed {
        connection: Arc<Connection>,
        error: ChatError,
    },
    Unregister(Arc<Connection>),
}

const PRIVATE_PREFIX: &str = "private:";

#[derive(Serialize)]
struct UserView {
    id: String,
    name: String,
    role: Role,
    online: bool,
}

fn dedupe(ids: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    ids.into_iter().filter(|id| seen.insert(id.clone())).collect()
}

fn presence(kind: NotificationKind, connection: &Connection, room_id: &str) -> ServerMessage {
    ServerMessage::Notification(NotificationView {
        notification: Notification::new(kind, &connection.account_id, room_id),
        sender: connection.name.clone(),
    })
}

fn private_room_name(a: &str, b: &str) -> String {
    let (first, second) = if a <= b { (a, b) } else { (b, a) };
    format!("{PRIVATE_PREFIX}{first}:{second}")
}

pub struct Dispatcher {
    clients: Arc<ClientRegistry>,
    rooms: Arc<RoomRegistry>,
    stores: Stores,
}

impl Dispatcher {
    pub fn new(clients: Arc<ClientRegistry>, rooms: Arc<RoomRegistry>, stores: Stores) -> Self {
        Dispatcher {
            clients,
            rooms,
            stores,
        }
    }

    /// Consumes `inbound` until every sender is gone.
    pub async fn run(self, mut inbound: mpsc::Receiver<Inbound>) {
        while let Some(item) = inbound.recv().await {
            self.handle(item).await;
        }
        debug!("Inbound queue closed, dispatcher stopping");
    }

    pub async fn handle(&self, inbound: Inbound) {
        match inbound {
            Inbound::Register(connection) => self.register(connection).await,
            Inbound::Unregister(connection) => self.unregister(&connection).await,
            Inbound::Malformed { connection, error } => {
                if self.clients.get_by_id(&connection.id).await.is_some() {
                    debug!("Malformed frame from {}: {}", connection.id, error);
                    connection.send(&ServerMessage::error(&error));
                }
            }
            Inbound::Event {
                connection,
                envelope,
            } => {
                if self.clients.get_by_id(&connection.id).await.is_none() {
                    debug!(
                        "Dropping {} event from unregistered connection {}",
                        envelope.kind, connection.id
                    );
                    return;
                }
                let result = match ClientMessage::decode(envelope) {
                    Ok(message) => {
                        debug!("Event {} from {}", message.event_name(), connection.id);
                        self.dispatch(&connection, message).await
                    }
                    Err(e) => Err(e),
                };
                if let Err(e) = result {
                    match &e {
                        ChatError::Store(cause) => {
                            error!("Store failure for {}: {}", connection.account_id, cause);
                        }
                        _ => debug!("Rejected event from {}: {}", connection.id, e),
                    }
                    connection.send(&ServerMessage::error(&e));
                }
            }
        }
    }

    async fn dispatch(
        &self,
        connection: &Arc<Connection>,
        message: ClientMessage,
    ) -> Result<(), ChatError> {
        match message {
            ClientMessage::Typing(input) => self.typing(connection, input).await,
            ClientMessage::Chat(input) => self.chat(connection, input).await,
            ClientMessage::CreateRoom(input) => self.create_room(connection, input).await,
            ClientMessage::JoinRoom(input) => self.join_room(connection, input).await,
            ClientMessage::LeaveRoom(input) => self.leave_room(connection, input).await,
            ClientMessage::InviteRoom(input) => self.invite_room(connection, input).await,
            ClientMessage::KickRoom(input) => self.kick_room(connection, input).await,
            ClientMessage::GetUsers(input) => self.get_users(connection, input).await,
            ClientMessage::GetChats(input) => self.get_chats(connection, input).await,
            ClientMessage::GetNotifications(input) => {
                self.get_notifications(connection, input).await
            }
            ClientMessage::UserRooms => self.user_rooms(connection).await,
        }
    }

    async fn register(&self, connection: Arc<Connection>) {
        let account_id = connection.account_id.clone();
        let first = !self.clients.has_account(&account_id).await;
        self.clients.add(connection.clone()).await;
        info!(
            "Registering client {} for account {} ({})",
            connection.id, account_id, connection.name
        );

        if let Err(e) = self.stores.history.mark_account_online(&account_id).await {
            error!("Failed to mark {} online: {}", account_id, e);
        }

        let memberships = match self.stores.rooms.find_rooms_by_account(&account_id).await {
            Ok(memberships) => memberships,
            Err(e) => {
                error!("Failed to load rooms for {}: {}", account_id, e);
                Vec::new()
            }
        };

        for Membership { room, role } in memberships {
            let room = match self.rooms.get_by_id(&room.id).await {
                Some(live) => live,
                None => {
                    let live = Arc::new(Room::new(room));
                    self.rooms.add(live.clone()).await;
                    live
                }
            };
            room.add_connection(connection.clone(), role).await;
            if first {
                let online = presence(NotificationKind::Online, &connection, room.id());
                room.broadcast_except_account(&online, &account_id).await;
            }
        }
    }

    async fn unregister(&self, connection: &Arc<Connection>) {
        if self.clients.remove_by_id(&connection.id).await.is_none() {
            return;
        }
        connection.close();
        info!(
            "Unregistering client {} for account {}",
            connection.id, connection.account_id
        );

        let last = !self.clients.has_account(&connection.account_id).await;
        for room in self.rooms.snapshot().await {
            if room.remove_connection(&connection.id).await.is_none() {
                continue;
            }
            if room.is_empty().await {
                self.rooms.remove_by_id(room.id()).await;
                continue;
            }
            if last {
                let offline = presence(NotificationKind::Offline, connection, room.id());
                room.broadcast(&offline, &[]).await;
            }
        }

        if let Err(e) = self
            .stores
            .history
            .mark_account_offline(&connection.account_id)
            .await
        {
            error!("Failed to mark {} offline: {}", connection.account_id, e);
        }
    }

    /// Looks a room up by id, then by name; live rooms first, then the store.
    /// A room loaded from the store is not registered until someone joins it.
    async fn resolve_room(&self, reference: &str) -> Result<Arc<Room>, ChatError> {
        if let Some(room) = self.rooms.get_by_id(reference).await {
            return Ok(room);
        }
        if let Some(room) = self.rooms.get_by_name(reference).await {
            return Ok(room);
        }
        let stored = match self.stores.rooms.find_room_by_id(reference).await? {
            Some(info) => Some(info),
            None => self.stores.rooms.find_room_by_name(reference).await?,
        };
        let info = stored.ok_or(ChatError::RoomNotFound)?;
        // The name lookup may land on a room that is live under its id.
        if let Some(room) = self.rooms.get_by_id(&info.id).await {
            return Ok(room);
        }
        Ok(Arc::new(Room::new(info)))
    }

    async fn member_room(
        &self,
        connection: &Connection,
        reference: &str,
    ) -> Result<Arc<Room>, ChatError> {
        let room = self.resolve_room(reference).await?;
        if !room.has_account(&connection.account_id).await {
            return Err(ChatError::NotMember);
        }
        Ok(room)
    }

    async fn ensure_registered(&self, room: &Arc<Room>) {
        if self.rooms.get_by_id(room.id()).await.is_none() && !room.is_empty().await {
            self.rooms.add(room.clone()).await;
        }
    }

    /// Eager cleanup after a leave or kick.
    async fn drop_if_empty(&self, room: &Room) {
        if !room.is_empty().await {
            return;
        }
        self.rooms.remove_by_id(room.id()).await;
        match self.stores.rooms.count_members(room.id()).await {
            Ok(0) => {
                if let Err(e) = self.stores.rooms.delete_room(room.id()).await {
                    error!("Failed to delete empty room {}: {}", room.id(), e);
                } else {
                    info!("Room {} ({}) removed", room.id(), room.info.name);
                }
            }
            Ok(_) => {}
            Err(e) => error!("Failed to count members of {}: {}", room.id(), e),
        }
    }

    /// Persists (best effort) and broadcasts a membership notification.
    async fn notify(
        &self,
        room: &Room,
        kind: NotificationKind,
        account_id: &str,
        name: &str,
    ) -> ServerMessage {
        let notification = Notification::new(kind, account_id, room.id());
        if let Err(e) = self.stores.history.create_notification(&notification).await {
            warn!("Failed to store {:?} notification for {}: {}", kind, room.id(), e);
        }
        let message = ServerMessage::Notification(NotificationView {
            notification,
            sender: name.to_string(),
        });
        room.broadcast(&message, &[]).await;
        message
    }

    async fn account_name(&self, account_id: &str) -> String {
        match self.stores.accounts.find_account(account_id).await {
            Ok(Some(account)) => account.name,
            _ => account_id.to_string(),
        }
    }

    fn reply(&self, origin: &Connection, event: &str, result: Value) {
        origin.send(&ServerMessage::Success(Reply {
            event: event.to_string(),
            result: Some(result),
        }));
    }

    /// Answers the origin and mirrors the answer to the account's other devices.
    async fn reply_and_forward(&self, origin: &Connection, event: &str, result: Value) {
        let reply = Reply {
            event: event.to_string(),
            result: Some(result),
        };
        let forward = ServerMessage::Forward(reply.clone());
        origin.send(&ServerMessage::Success(reply));
        for other in self.clients.get_others_for_account(origin).await {
            other.send(&forward);
        }
    }

    /// Typing never opens a direct room; it only reaches one that exists.
    async fn typing(&self, connection: &Connection, input: TypingInput) -> Result<(), ChatError> {
        let room = match input.target()? {
            Target::Room(reference) => self.member_room(connection, &reference).await?,
            Target::User(receiver) => self
                .find_direct_room(connection, &receiver)
                .await?
                .ok_or(ChatError::RoomNotFound)?,
        };
        let typing = presence(NotificationKind::Typing, connection, room.id());
        room.broadcast_except_account(&typing, &connection.account_id)
            .await;

        let forward = ServerMessage::Forward(Reply {
            event: "typing".to_string(),
            result: Some(json!({ "room_id": room.id() })),
        });
        for other in self.clients.get_others_for_account(connection).await {
            other.send(&forward);
        }
        Ok(())
    }

    /// The live private room shared with `receiver`, loading it from the
    /// store when neither side is joined to it yet.
    async fn find_direct_room(
        &self,
        connection: &Connection,
        receiver: &str,
    ) -> Result<Option<Arc<Room>>, ChatError> {
        if receiver == connection.account_id {
            return Err(ChatError::InvalidMembers(
                "direct messages need another account".into(),
            ));
        }
        let name = private_room_name(&connection.account_id, receiver);
        if let Some(room) = self.rooms.get_by_name(&name).await {
            return Ok(Some(room));
        }
        let Some(info) = self.stores.rooms.find_room_by_name(&name).await? else {
            return Ok(None);
        };
        let room = Arc::new(Room::new(info));
        for account_id in [connection.account_id.as_str(), receiver] {
            for live in self.clients.get_all_for_account(account_id).await {
                room.add_connection(live, Role::User).await;
            }
        }
        self.ensure_registered(&room).await;
        Ok(Some(room))
    }

    /// Opens the private room with `receiver` on the first direct message.
    async fn direct_room(
        &self,
        connection: &Connection,
        receiver: &str,
    ) -> Result<Arc<Room>, ChatError> {
        if let Some(room) = self.find_direct_room(connection, receiver).await? {
            return Ok(room);
        }
        if self.stores.accounts.find_account(receiver).await?.is_none() {
            return Err(ChatError::UserNotFound(receiver.to_string()));
        }
        let info = RoomInfo::new(
            private_room_name(&connection.account_id, receiver),
            String::new(),
            false,
            true,
        );
        let members = [receiver.to_string()];
        self.persist_room(&info, &connection.account_id, Role::User, &members)
            .await?;
        info!(
            "Direct room {} opened between {} and {}",
            info.id, connection.account_id, receiver
        );
        Ok(self
            .open_room(info, &connection.account_id, Role::User, &members)
            .await)
    }

    async fn chat(&self, connection: &Connection, input: ChatInput) -> Result<(), ChatError> {
        if input.message.is_empty() {
            return Err(ChatError::BadPayload("message is empty".into()));
        }
        let room = match input.target()? {
            Target::Room(reference) => self.member_room(connection, &reference).await?,
            Target::User(receiver) => self.direct_room(connection, &receiver).await?,
        };

        let message = ChatMessage::new(&connection.account_id, room.id(), input.message);
        self.stores.history.create_message(&message).await?;

        let view = ChatView {
            message,
            sender: connection.name.clone(),
        };
        room.broadcast_except_account(&ServerMessage::Chat(view.clone()), &connection.account_id)
            .await;
        self.reply_and_forward(connection, "chat", json!(view)).await;
        Ok(())
    }

    async fn create_room(
        &self,
        connection: &Connection,
        input: CreateRoomInput,
    ) -> Result<(), ChatError> {
        let creator = connection.account_id.as_str();
        let members = dedupe(input.members);
        if members.iter().any(|m| m == creator) {
            return Err(ChatError::InvalidMembers(
                "the creator cannot be listed as a member".into(),
            ));
        }
        if input.private && members.len() != 1 {
            return Err(ChatError::InvalidMembers(
                "a private room needs exactly one other member".into(),
            ));
        }
        for member in &members {
            if self.stores.accounts.find_account(member).await?.is_none() {
                return Err(ChatError::UserNotFound(member.clone()));
            }
        }

        let name = if input.private {
            private_room_name(creator, &members[0])
        } else {
            let name = input
                .name
                .filter(|name| !name.trim().is_empty())
                .ok_or_else(|| ChatError::BadPayload("room name is required".into()))?;
            if name.starts_with(PRIVATE_PREFIX) {
                return Err(ChatError::BadPayload(format!(
                    "room names starting with {PRIVATE_PREFIX} are reserved"
                )));
            }
            name
        };
        if self.stores.rooms.find_room_by_name(&name).await?.is_some() {
            return Err(ChatError::RoomNameTaken);
        }

        let info = RoomInfo::new(name, input.description, input.invite_only, input.private);
        let creator_role = if info.private { Role::User } else { Role::Admin };
        self.persist_room(&info, creator, creator_role, &members)
            .await?;
        info!("Room {} ({}) created by {}", info.id, info.name, creator);

        let result = json!(info);
        self.open_room(info, creator, creator_role, &members).await;
        self.reply_and_forward(connection, "create-room", result)
            .await;
        Ok(())
    }

    /// Writes the room and its initial memberships, deleting the room again
    /// if any membership fails.
    async fn persist_room(
        &self,
        info: &RoomInfo,
        creator: &str,
        creator_role: Role,
        members: &[String],
    ) -> Result<(), ChatError> {
        self.stores.rooms.create_room(info).await?;
        let initial = std::iter::once((creator, creator_role))
            .chain(members.iter().map(|m| (m.as_str(), Role::User)));
        for (account_id, role) in initial {
            if let Err(e) = self
                .stores
                .rooms
                .add_membership(&info.id, account_id, role)
                .await
            {
                if let Err(cleanup) = self.stores.rooms.delete_room(&info.id).await {
                    error!("Failed to roll back room {}: {}", info.id, cleanup);
                }
                return Err(e.into());
            }
        }
        Ok(())
    }

    /// Joins the live connections of a freshly persisted room and tells the
    /// members they were added.
    async fn open_room(
        &self,
        info: RoomInfo,
        creator: &str,
        creator_role: Role,
        members: &[String],
    ) -> Arc<Room> {
        let room = Arc::new(Room::new(info));
        for own in self.clients.get_all_for_account(creator).await {
            room.add_connection(own, creator_role).await;
        }
        let invited = ServerMessage::Invited(room.info.clone());
        for member in members {
            for live in self.clients.get_all_for_account(member).await {
                room.add_connection(live.clone(), Role::User).await;
                live.send(&invited);
            }
        }
        self.ensure_registered(&room).await;
        room
    }

    async fn join_room(&self, connection: &Connection, input: RoomRef) -> Result<(), ChatError> {
        let account_id = connection.account_id.as_str();
        let room = self.resolve_room(&input.room_id).await?;
        if room.info.private {
            return Err(ChatError::RoomPrivate);
        }
        if room.info.invite_only {
            return Err(ChatError::RoomInviteOnly);
        }
        if room.has_account(account_id).await
            || self
                .stores
                .rooms
                .find_role(room.id(), account_id)
                .await?
                .is_some()
        {
            return Err(ChatError::AlreadyMember);
        }

        self.stores
            .rooms
            .add_membership(room.id(), account_id, Role::User)
            .await?;

        for own in self.clients.get_all_for_account(account_id).await {
            room.add_connection(own, Role::User).await;
        }
        self.ensure_registered(&room).await;
        self.notify(&room, NotificationKind::Join, account_id, &connection.name)
            .await;

        self.reply_and_forward(connection, "join-room", json!(room.info))
            .await;
        Ok(())
    }

    async fn leave_room(&self, connection: &Connection, input: RoomRef) -> Result<(), ChatError> {
        let account_id = connection.account_id.as_str();
        let room = self.resolve_room(&input.room_id).await?;
        if room.info.private {
            return Err(ChatError::RoomPrivate);
        }
        if !room.has_account(account_id).await {
            return Err(ChatError::NotMember);
        }

        self.stores
            .rooms
            .remove_membership(room.id(), account_id)
            .await?;

        room.remove_all_for_account(account_id).await;
        self.notify(&room, NotificationKind::Leave, account_id, &connection.name)
            .await;
        self.drop_if_empty(&room).await;

        self.reply_and_forward(connection, "leave-room", json!({ "room_id": room.id() }))
            .await;
        Ok(())
    }

    async fn require_admin(&self, room: &Room, connection: &Connection) -> Result<(), ChatError> {
        if room.info.private {
            return Err(ChatError::RoomPrivate);
        }
        if room.role_of(&connection.account_id).await != Some(Role::Admin) {
            return Err(ChatError::NotAdmin);
        }
        Ok(())
    }

    async fn invite_room(
        &self,
        connection: &Connection,
        input: RoomUsersInput,
    ) -> Result<(), ChatError> {
        let room = self.resolve_room(&input.room_id).await?;
        self.require_admin(&room, connection).await?;

        let user_ids = dedupe(input.user_ids);
        if user_ids.is_empty() {
            return Err(ChatError::InvalidMembers("user_ids is empty".into()));
        }

        let mut invitees: Vec<Account> = Vec::new();
        for user_id in &user_ids {
            let account = self
                .stores
                .accounts
                .find_account(user_id)
                .await?
                .ok_or_else(|| ChatError::UserNotFound(user_id.clone()))?;
            if self
                .stores
                .rooms
                .find_role(room.id(), user_id)
                .await?
                .is_none()
            {
                invitees.push(account);
            }
        }
        if invitees.is_empty() {
            return Err(ChatError::AlreadyMember);
        }

        let mut added: Vec<&str> = Vec::with_capacity(invitees.len());
        for invitee in &invitees {
            if let Err(e) = self
                .stores
                .rooms
                .add_membership(room.id(), &invitee.id, Role::User)
                .await
            {
                for done in &added {
                    if let Err(cleanup) = self.stores.rooms.remove_membership(room.id(), done).await
                    {
                        error!("Failed to roll back invite of {}: {}", done, cleanup);
                    }
                }
                return Err(e.into());
            }
            added.push(&invitee.id);
        }

        for invitee in &invitees {
            for live in self.clients.get_all_for_account(&invitee.id).await {
                room.add_connection(live.clone(), Role::User).await;
                live.send(&ServerMessage::Invited(room.info.clone()));
            }
            self.notify(&room, NotificationKind::Join, &invitee.id, &invitee.name)
                .await;
        }
        self.ensure_registered(&room).await;

        self.reply_and_forward(
            connection,
            "invite-room",
            json!({ "room_id": room.id(), "user_ids": added }),
        )
        .await;
        Ok(())
    }

    async fn kick_room(
        &self,
        connection: &Connection,
        input: RoomUsersInput,
    ) -> Result<(), ChatError> {
        let room = self.resolve_room(&input.room_id).await?;
        self.require_admin(&room, connection).await?;

        let user_ids = dedupe(input.user_ids);
        if user_ids.is_empty() {
            return Err(ChatError::InvalidMembers("user_ids is empty".into()));
        }
        if user_ids.iter().any(|id| *id == connection.account_id) {
            return Err(ChatError::InvalidMembers(
                "use leave-room to leave a room".into(),
            ));
        }

        let mut targets: Vec<(String, Role)> = Vec::with_capacity(user_ids.len());
        for user_id in user_ids {
            let role = self
                .stores
                .rooms
                .find_role(room.id(), &user_id)
                .await?
                .ok_or(ChatError::NotMember)?;
            targets.push((user_id, role));
        }

        for (index, (user_id, _)) in targets.iter().enumerate() {
            if let Err(e) = self.stores.rooms.remove_membership(room.id(), user_id).await {
                self.restore_memberships(room.id(), &targets[..index]).await;
                return Err(e.into());
            }
        }

        for (user_id, _) in &targets {
            let removed = room.remove_all_for_account(user_id).await;
            let name = self.account_name(user_id).await;
            let leave = self
                .notify(&room, NotificationKind::Leave, user_id, &name)
                .await;
            for gone in removed {
                gone.send(&leave);
            }
        }
        self.drop_if_empty(&room).await;

        let kicked: Vec<&str> = targets.iter().map(|(id, _)| id.as_str()).collect();
        self.reply_and_forward(
            connection,
            "kick-room",
            json!({ "room_id": room.id(), "user_ids": kicked }),
        )
        .await;
        Ok(())
    }

    async fn restore_memberships(&self, room_id: &str, removed: &[(String, Role)]) {
        for (user_id, role) in removed {
            let restored: Result<(), StoreError> =
                self.stores.rooms.add_membership(room_id, user_id, *role).await;
            if let Err(e) = restored {
                error!("Failed to restore membership of {} in {}: {}", user_id, room_id, e);
            }
        }
    }

    async fn get_users(&self, connection: &Connection, input: GetUsersInput) -> Result<(), ChatError> {
        let accounts = self.stores.accounts.find_accounts_by_name(&input.name).await?;
        let mut users = Vec::with_capacity(accounts.len());
        for account in accounts {
            let online = self.stores.history.online_count(&account.id).await? > 0;
            users.push(UserView {
                id: account.id,
                name: account.name,
                role: account.role,
                online,
            });
        }
        self.reply(connection, "get-users", json!({ "users": users }));
        Ok(())
    }

    async fn get_chats(&self, connection: &Connection, input: RangeInput) -> Result<(), ChatError> {
        let room = self.member_room(connection, &input.room_id).await?;
        let messages = self
            .stores
            .history
            .find_room_messages(room.id(), input.from_ts, input.to_ts)
            .await?;
        self.reply(
            connection,
            "get-chats",
            json!({ "room_id": room.id(), "messages": messages }),
        );
        Ok(())
    }

    async fn get_notifications(
        &self,
        connection: &Connection,
        input: RangeInput,
    ) -> Result<(), ChatError> {
        let room = self.member_room(connection, &input.room_id).await?;
        let notifications = self
            .stores
            .history
            .find_room_notifications(room.id(), input.from_ts, input.to_ts)
            .await?;
        self.reply(
            connection,
            "get-notifs",
            json!({ "room_id": room.id(), "notifications": notifications }),
        );
        Ok(())
    }

    async fn user_rooms(&self, connection: &Connection) -> Result<(), ChatError> {
        let rooms = self
            .stores
            .rooms
            .find_rooms_by_account(&connection.account_id)
            .await?;
        self.reply(connection, "user-rooms", json!({ "rooms": rooms }));
        Ok(())
    }
}
