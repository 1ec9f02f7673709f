use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::ChatError;
use crate::room::RoomInfo;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Admin,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NotificationKind {
    Typing,
    Join,
    Leave,
    Online,
    Offline,
}

pub fn now_ts() -> i64 {
    chrono::Utc::now().timestamp()
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ChatMessage {
    pub id: String,
    pub sender_id: String,
    pub room_id: String,
    pub message: String,
    pub ts: i64,
}

impl ChatMessage {
    pub fn new(sender_id: &str, room_id: &str, message: String) -> Self {
        ChatMessage {
            id: Uuid::new_v4().to_string(),
            sender_id: sender_id.to_string(),
            room_id: room_id.to_string(),
            message,
            ts: now_ts(),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Notification {
    pub id: String,
    pub kind: NotificationKind,
    pub sender_id: String,
    pub room_id: String,
    pub ts: i64,
}

impl Notification {
    pub fn new(kind: NotificationKind, sender_id: &str, room_id: &str) -> Self {
        Notification {
            id: Uuid::new_v4().to_string(),
            kind,
            sender_id: sender_id.to_string(),
            room_id: room_id.to_string(),
            ts: now_ts(),
        }
    }
}

/// Raw inbound frame. `data` stays untyped until the dispatcher picks a shape.
#[derive(Deserialize, Clone, Debug)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Value,
}

impl Envelope {
    pub fn parse(text: &str) -> Result<Self, ChatError> {
        Ok(serde_json::from_str(text)?)
    }
}

#[derive(Deserialize, Clone, Debug)]
pub struct RoomRef {
    pub room_id: String,
}

/// Where a `chat` or `typing` event goes: a room, or one account directly.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Target {
    Room(String),
    User(String),
}

fn target(room_id: Option<&String>, user_id: Option<&String>) -> Result<Target, ChatError> {
    match (room_id, user_id) {
        (Some(room_id), None) => Ok(Target::Room(room_id.clone())),
        (None, Some(user_id)) => Ok(Target::User(user_id.clone())),
        _ => Err(ChatError::BadPayload(
            "exactly one of room_id or user_id is required".into(),
        )),
    }
}

#[derive(Deserialize, Clone, Debug)]
pub struct TypingInput {
    #[serde(default)]
    pub room_id: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
}

impl TypingInput {
    pub fn target(&self) -> Result<Target, ChatError> {
        target(self.room_id.as_ref(), self.user_id.as_ref())
    }
}

#[derive(Deserialize, Clone, Debug)]
pub struct ChatInput {
    #[serde(default)]
    pub room_id: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    pub message: String,
}

impl ChatInput {
    pub fn target(&self) -> Result<Target, ChatError> {
        target(self.room_id.as_ref(), self.user_id.as_ref())
    }
}

#[derive(Deserialize, Clone, Debug)]
pub struct CreateRoomInput {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, alias = "desc")]
    pub description: String,
    #[serde(default)]
    pub private: bool,
    #[serde(default)]
    pub invite_only: bool,
    #[serde(default)]
    pub members: Vec<String>,
}

#[derive(Deserialize, Clone, Debug)]
pub struct RoomUsersInput {
    pub room_id: String,
    pub user_ids: Vec<String>,
}

#[derive(Deserialize, Clone, Debug)]
pub struct GetUsersInput {
    #[serde(default)]
    pub name: String,
}

#[derive(Deserialize, Clone, Debug)]
pub struct RangeInput {
    pub room_id: String,
    #[serde(default)]
    pub from_ts: i64,
    #[serde(default)]
    pub to_ts: Option<i64>,
}

#[derive(Clone, Debug)]
pub enum ClientMessage {
    Typing(TypingInput),
    Chat(ChatInput),
    CreateRoom(CreateRoomInput),
    JoinRoom(RoomRef),
    LeaveRoom(RoomRef),
    InviteRoom(RoomUsersInput),
    KickRoom(RoomUsersInput),
    GetUsers(GetUsersInput),
    GetChats(RangeInput),
    GetNotifications(RangeInput),
    UserRooms,
}

impl ClientMessage {
    pub fn decode(envelope: Envelope) -> Result<Self, ChatError> {
        let Envelope { kind, data } = envelope;
        let message = match kind.as_str() {
            "typing" => ClientMessage::Typing(serde_json::from_value(data)?),
            "chat" => ClientMessage::Chat(serde_json::from_value(data)?),
            "create-room" => ClientMessage::CreateRoom(serde_json::from_value(data)?),
            "join-room" => ClientMessage::JoinRoom(serde_json::from_value(data)?),
            "leave-room" => ClientMessage::LeaveRoom(serde_json::from_value(data)?),
            "invite-room" => ClientMessage::InviteRoom(serde_json::from_value(data)?),
            "kick-room" => ClientMessage::KickRoom(serde_json::from_value(data)?),
            "get-users" => ClientMessage::GetUsers(serde_json::from_value(data)?),
            "get-chats" => ClientMessage::GetChats(serde_json::from_value(data)?),
            "get-notifs" => ClientMessage::GetNotifications(serde_json::from_value(data)?),
            "user-rooms" => ClientMessage::UserRooms,
            _ => return Err(ChatError::UnknownEvent(kind)),
        };
        Ok(message)
    }

    pub fn event_name(&self) -> &'static str {
        match self {
            ClientMessage::Typing(_) => "typing",
            ClientMessage::Chat(_) => "chat",
            ClientMessage::CreateRoom(_) => "create-room",
            ClientMessage::JoinRoom(_) => "join-room",
            ClientMessage::LeaveRoom(_) => "leave-room",
            ClientMessage::InviteRoom(_) => "invite-room",
            ClientMessage::KickRoom(_) => "kick-room",
            ClientMessage::GetUsers(_) => "get-users",
            ClientMessage::GetChats(_) => "get-chats",
            ClientMessage::GetNotifications(_) => "get-notifs",
            ClientMessage::UserRooms => "user-rooms",
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Reply {
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ChatView {
    #[serde(flatten)]
    pub message: ChatMessage,
    pub sender: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct NotificationView {
    #[serde(flatten)]
    pub notification: Notification,
    pub sender: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum ServerMessage {
    Error { code: u16, message: String },
    Success(Reply),
    Forward(Reply),
    Chat(ChatView),
    Notification(NotificationView),
    Invited(RoomInfo),
}

impl ServerMessage {
    pub fn error(err: &ChatError) -> Self {
        ServerMessage::Error {
            code: err.code(),
            message: err.to_string(),
        }
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn envelope(text: &str) -> Envelope {
        Envelope::parse(text).unwrap()
    }

    #[test]
    fn decodes_known_event_types() {
        let msg = ClientMessage::decode(envelope(
            r#"{"type":"chat","data":{"room_id":"r1","message":"hi"}}"#,
        ))
        .unwrap();
        match msg {
            ClientMessage::Chat(input) => {
                assert_eq!(input.target(), Ok(Target::Room("r1".into())));
                assert_eq!(input.message, "hi");
            }
            other => panic!("unexpected {other:?}"),
        }

        let msg = ClientMessage::decode(envelope(r#"{"type":"user-rooms"}"#)).unwrap();
        assert!(matches!(msg, ClientMessage::UserRooms));
    }

    #[test]
    fn chat_addresses_a_room_or_a_user() {
        let msg = ClientMessage::decode(envelope(
            r#"{"type":"chat","data":{"user_id":"bob","message":"hey"}}"#,
        ))
        .unwrap();
        let ClientMessage::Chat(input) = msg else {
            panic!("expected chat");
        };
        assert_eq!(input.target(), Ok(Target::User("bob".into())));

        let msg = ClientMessage::decode(envelope(
            r#"{"type":"typing","data":{"room_id":"r1","user_id":"bob"}}"#,
        ))
        .unwrap();
        let ClientMessage::Typing(input) = msg else {
            panic!("expected typing");
        };
        assert_eq!(input.target().unwrap_err().code(), 1);
    }

    #[test]
    fn create_room_defaults_optional_fields() {
        let msg = ClientMessage::decode(envelope(
            r#"{"type":"create-room","data":{"name":"team"}}"#,
        ))
        .unwrap();
        let ClientMessage::CreateRoom(input) = msg else {
            panic!("expected create-room");
        };
        assert_eq!(input.name.as_deref(), Some("team"));
        assert!(!input.private);
        assert!(!input.invite_only);
        assert!(input.members.is_empty());
    }

    #[test]
    fn rejects_unknown_type_and_bad_data() {
        let err = ClientMessage::decode(envelope(r#"{"type":"dance","data":{}}"#)).unwrap_err();
        assert_eq!(err, ChatError::UnknownEvent("dance".into()));

        let err =
            ClientMessage::decode(envelope(r#"{"type":"chat","data":{"room_id":7}}"#)).unwrap_err();
        assert_eq!(err.code(), 1);

        assert!(Envelope::parse("not json").is_err());
        assert!(Envelope::parse(r#"{"data":{}}"#).is_err());
    }

    #[test]
    fn outbound_envelope_shape() {
        let err = ServerMessage::error(&ChatError::RoomNotFound);
        let value = serde_json::to_value(&err).unwrap();
        assert_eq!(
            value,
            json!({"type": "error", "data": {"code": 10, "message": "Room does not exist"}})
        );

        let success = ServerMessage::Success(Reply {
            event: "leave-room".into(),
            result: None,
        });
        let value = serde_json::to_value(&success).unwrap();
        assert_eq!(value, json!({"type": "success", "data": {"event": "leave-room"}}));
    }

    #[test]
    fn chat_view_flattens_message_fields() {
        let view = ChatView {
            message: ChatMessage::new("a", "r", "hello".into()),
            sender: "Alice".into(),
        };
        let value = serde_json::to_value(ServerMessage::Chat(view)).unwrap();
        assert_eq!(value["type"], "chat");
        assert_eq!(value["data"]["sender"], "Alice");
        assert_eq!(value["data"]["sender_id"], "a");
        assert_eq!(value["data"]["room_id"], "r");
        assert_eq!(value["data"]["message"], "hello");
    }
}
