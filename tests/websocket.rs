use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use warp::http::StatusCode;
use warp::test::WsClient;

use chat_hub::auth::{Claims, StaticTokens};
use chat_hub::config::Config;
use chat_hub::error::StoreError;
use chat_hub::messages::Role;
use chat_hub::room::RoomInfo;
use chat_hub::server::{routes, Server};
use chat_hub::store::{Account, HistoryStore, Membership, MembershipStore, MemoryStore, Stores};

fn setup_with(
    config: Config,
    stores: impl FnOnce(Arc<MemoryStore>) -> Stores,
) -> (Arc<Server>, Arc<MemoryStore>, StaticTokens) {
    let alice = Account {
        id: "alice".into(),
        name: "Alice".into(),
        role: Role::User,
    };
    let store = Arc::new(MemoryStore::with_accounts([alice.clone()]));
    let mut tokens = StaticTokens::default();
    tokens.insert("alice-token", Claims::from(&alice));
    let server = Server::start(config, stores(store.clone()));
    (server, store, tokens)
}

fn setup() -> (Arc<Server>, Arc<MemoryStore>, StaticTokens) {
    setup_with(Config::default(), Stores::memory)
}

async fn connect(server: &Arc<Server>, tokens: StaticTokens) -> WsClient {
    let filter = routes(server.clone(), Arc::new(tokens));
    warp::test::ws()
        .path("/chat")
        .header("authorization", "Bearer alice-token")
        .handshake(filter)
        .await
        .expect("handshake")
}

async fn recv_json(client: &mut WsClient) -> Value {
    let message = client.recv().await.expect("websocket message");
    serde_json::from_str(message.to_str().expect("text frame")).unwrap()
}

/// Waits until the hub has forgotten every connection of alice.
async fn wait_for_unregister(server: &Server, store: &MemoryStore) {
    for _ in 0..60 {
        if server.clients().is_empty().await && store.online_count("alice").await.unwrap() == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("connection was never unregistered");
}

async fn wait_for_register(server: &Server) {
    for _ in 0..60 {
        if !server.clients().is_empty().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("connection was never registered");
}

/// Delegates to the memory store, but takes its time creating rooms.
struct SlowRooms(Arc<MemoryStore>);

#[async_trait]
impl MembershipStore for SlowRooms {
    async fn create_room(&self, room: &RoomInfo) -> Result<(), StoreError> {
        tokio::time::sleep(Duration::from_millis(300)).await;
        self.0.create_room(room).await
    }
    async fn find_room_by_id(&self, room_id: &str) -> Result<Option<RoomInfo>, StoreError> {
        self.0.find_room_by_id(room_id).await
    }
    async fn find_room_by_name(&self, name: &str) -> Result<Option<RoomInfo>, StoreError> {
        self.0.find_room_by_name(name).await
    }
    async fn find_rooms_by_account(&self, account_id: &str) -> Result<Vec<Membership>, StoreError> {
        self.0.find_rooms_by_account(account_id).await
    }
    async fn delete_room(&self, room_id: &str) -> Result<(), StoreError> {
        self.0.delete_room(room_id).await
    }
    async fn add_membership(
        &self,
        room_id: &str,
        account_id: &str,
        role: Role,
    ) -> Result<(), StoreError> {
        self.0.add_membership(room_id, account_id, role).await
    }
    async fn remove_membership(&self, room_id: &str, account_id: &str) -> Result<(), StoreError> {
        self.0.remove_membership(room_id, account_id).await
    }
    async fn find_role(&self, room_id: &str, account_id: &str) -> Result<Option<Role>, StoreError> {
        self.0.find_role(room_id, account_id).await
    }
    async fn count_members(&self, room_id: &str) -> Result<usize, StoreError> {
        self.0.count_members(room_id).await
    }
}

#[tokio::test]
async fn authenticated_client_can_create_a_room() {
    let (server, store, tokens) = setup();
    let filter = routes(server.clone(), Arc::new(tokens));

    let mut client = warp::test::ws()
        .path("/chat")
        .header("authorization", "Bearer alice-token")
        .handshake(filter)
        .await
        .expect("handshake");

    client.send_text("not json").await;
    let error = recv_json(&mut client).await;
    assert_eq!(error["type"], "error");
    assert_eq!(error["data"]["code"], 1);

    client
        .send_text(json!({ "type": "create-room", "data": { "name": "team" } }).to_string())
        .await;
    let reply = recv_json(&mut client).await;
    assert_eq!(reply["type"], "success");
    assert_eq!(reply["data"]["event"], "create-room");
    assert_eq!(reply["data"]["result"]["name"], "team");

    assert_eq!(server.clients().len().await, 1);
    assert_eq!(server.rooms().len().await, 1);
    assert_eq!(store.online_count("alice").await.unwrap(), 1);

    server.shutdown().await;
    assert!(server.clients().is_empty().await);
    assert!(server.rooms().is_empty().await);
    assert_eq!(store.online_count("alice").await.unwrap(), 0);
}

#[tokio::test]
async fn missing_or_unknown_token_is_unauthorized() {
    let (server, _store, tokens) = setup();
    let filter = routes(server, Arc::new(tokens));

    let response = warp::test::request()
        .path("/chat")
        .reply(&filter)
        .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body: Value = serde_json::from_slice(response.body()).unwrap();
    assert_eq!(body["code"], 401);

    let response = warp::test::request()
        .path("/chat")
        .header("authorization", "Bearer wrong")
        .reply(&filter)
        .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let rejected = warp::test::ws()
        .path("/chat")
        .handshake(filter)
        .await;
    assert!(rejected.is_err());
}

#[tokio::test]
async fn unknown_paths_are_not_found() {
    let (server, _store, tokens) = setup();
    let filter = routes(server, Arc::new(tokens));

    let response = warp::test::request()
        .path("/elsewhere")
        .reply(&filter)
        .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn replies_follow_frame_order_behind_a_slow_store() {
    let (server, _store, tokens) = setup_with(Config::default(), |store| Stores {
        history: store.clone(),
        rooms: Arc::new(SlowRooms(store.clone())),
        accounts: store,
    });
    let mut client = connect(&server, tokens).await;

    client
        .send_text(json!({ "type": "create-room", "data": { "name": "team" } }).to_string())
        .await;
    client.send_text("not json").await;

    let first = recv_json(&mut client).await;
    assert_eq!(first["type"], "success");
    assert_eq!(first["data"]["event"], "create-room");
    let second = recv_json(&mut client).await;
    assert_eq!(second["type"], "error");
    assert_eq!(second["data"]["code"], 1);
}

#[tokio::test]
async fn idle_connection_is_unregistered() {
    let config = Config {
        idle_timeout_secs: 1,
        ..Config::default()
    };
    let (server, store, tokens) = setup_with(config, Stores::memory);
    let _client = connect(&server, tokens).await;

    wait_for_register(&server).await;
    wait_for_unregister(&server, &store).await;
}

#[tokio::test]
async fn oversize_frame_drops_the_connection() {
    let config = Config {
        max_frame_size: 64,
        ..Config::default()
    };
    let (server, store, tokens) = setup_with(config, Stores::memory);
    let mut client = connect(&server, tokens).await;
    wait_for_register(&server).await;

    let message = "x".repeat(200);
    client
        .send_text(json!({ "type": "chat", "data": { "room_id": "r", "message": message } }).to_string())
        .await;

    wait_for_unregister(&server, &store).await;
    assert!(server.rooms().is_empty().await);
}

#[tokio::test]
async fn dropped_client_is_unregistered() {
    let (server, store, tokens) = setup();
    let mut client = connect(&server, tokens).await;

    client
        .send_text(json!({ "type": "create-room", "data": { "name": "team" } }).to_string())
        .await;
    assert_eq!(recv_json(&mut client).await["type"], "success");
    assert_eq!(server.rooms().len().await, 1);
    assert_eq!(store.online_count("alice").await.unwrap(), 1);

    drop(client);

    wait_for_unregister(&server, &store).await;
    assert!(server.rooms().is_empty().await);
    assert!(store.find_room_by_name("team").await.unwrap().is_some());
}
