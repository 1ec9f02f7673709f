use std::convert::Infallible;
use std::fmt::Display;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use log::{debug, error, info, warn};
use serde_json::json;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use warp::http::StatusCode;
use warp::ws::{Message, WebSocket};
use warp::{Filter, Rejection};

use crate::auth::{with_claims, Claims, TokenValidator};
use crate::clients::{ClientRegistry, Connection};
use crate::config::Config;
use crate::dispatcher::{Dispatcher, Inbound};
use crate::error::{AuthError, ChatError};
use crate::messages::Envelope;
use crate::room::RoomRegistry;
use crate::store::Stores;

/// The hub: registries, the dispatcher task and every connection's worker pair.
pub struct Server {
    config: Config,
    clients: Arc<ClientRegistry>,
    rooms: Arc<RoomRegistry>,
    stores: Stores,
    shutdown: CancellationToken,
    readers: TaskTracker,
    writers: TaskTracker,
    inbound: Mutex<Option<mpsc::Sender<Inbound>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    accepting: AtomicBool,
}

impl Server {
    pub fn start(config: Config, stores: Stores) -> Arc<Self> {
        let clients = Arc::new(ClientRegistry::new());
        let rooms = Arc::new(RoomRegistry::new());
        let (tx, rx) = mpsc::channel(config.inbound_capacity.max(1));

        let dispatcher = Dispatcher::new(clients.clone(), rooms.clone(), stores.clone());
        let handle = tokio::spawn(dispatcher.run(rx));

        Arc::new(Server {
            config,
            clients,
            rooms,
            stores,
            shutdown: CancellationToken::new(),
            readers: TaskTracker::new(),
            writers: TaskTracker::new(),
            inbound: Mutex::new(Some(tx)),
            dispatcher: Mutex::new(Some(handle)),
            accepting: AtomicBool::new(true),
        })
    }

    pub fn clients(&self) -> &Arc<ClientRegistry> {
        &self.clients
    }

    pub fn rooms(&self) -> &Arc<RoomRegistry> {
        &self.rooms
    }

    /// Registers the socket and spawns its reader and writer. Returns once
    /// both are running.
    pub async fn handle_connection(self: Arc<Self>, mut ws: WebSocket, claims: Claims) {
        let inbound = if self.accepting.load(Ordering::SeqCst) {
            self.inbound.lock().await.clone()
        } else {
            None
        };
        let Some(inbound) = inbound else {
            debug!("Refusing connection for {} during shutdown", claims.account_id);
            if let Err(e) = ws.close().await {
                debug!("Close during shutdown failed: {}", e);
            }
            return;
        };

        let (connection, outbound) =
            Connection::with_parent(&claims, self.config.outbound_capacity, &self.shutdown);
        let connection = Arc::new(connection);
        let (ws_tx, ws_rx) = ws.split();

        self.writers.spawn(write_loop(
            connection.id.clone(),
            connection.closed().clone(),
            ws_tx,
            outbound,
        ));

        // Register is queued before any event the reader could produce.
        if inbound
            .send(Inbound::Register(connection.clone()))
            .await
            .is_err()
        {
            connection.close();
            return;
        }

        self.readers.spawn(read_loop(
            connection,
            ws_rx,
            inbound,
            self.config.idle_timeout(),
        ));
    }

    /// Stops the hub. Readers go first, then the dispatcher drains whatever
    /// they queued, then writers flush and close their sockets.
    pub async fn shutdown(&self) {
        if !self.accepting.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("Shutting down chat hub");

        self.shutdown.cancel();
        self.readers.close();
        self.readers.wait().await;

        self.inbound.lock().await.take();
        if let Some(handle) = self.dispatcher.lock().await.take() {
            if let Err(e) = handle.await {
                error!("Dispatcher task failed: {}", e);
            }
        }

        let rooms = self.rooms.drain().await;
        let clients = self.clients.drain().await;
        debug!(
            "Released {} rooms and {} connections",
            rooms.len(),
            clients.len()
        );
        drop(rooms);
        drop(clients);

        self.writers.close();
        self.writers.wait().await;

        if let Err(e) = self.stores.history.reset_all_presence().await {
            error!("Failed to reset presence: {}", e);
        }
        info!("Chat hub stopped");
    }
}

/// Turns frames into inbound items. Never writes to the connection itself,
/// so every answer leaves in the order the dispatcher handled the frames.
async fn read_loop<S, E>(
    connection: Arc<Connection>,
    mut ws_rx: S,
    inbound: mpsc::Sender<Inbound>,
    idle_timeout: Duration,
) where
    S: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    let closed = connection.closed().clone();
    loop {
        let next = tokio::select! {
            () = closed.cancelled() => break,
            next = tokio::time::timeout(idle_timeout, ws_rx.next()) => next,
        };
        let message = match next {
            Err(_) => {
                info!(
                    "Connection {} idle for {}s, closing",
                    connection.id,
                    idle_timeout.as_secs()
                );
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(e))) => {
                warn!("WebSocket error on {}: {}", connection.id, e);
                break;
            }
            Ok(Some(Ok(message))) => message,
        };

        if message.is_close() {
            break;
        }
        if message.is_ping() || message.is_pong() {
            continue;
        }
        let parsed = match message.to_str() {
            Ok(text) => Envelope::parse(text),
            Err(()) => Err(ChatError::BadPayload(
                "binary frames are not supported".into(),
            )),
        };
        let item = match parsed {
            Ok(envelope) => Inbound::Event {
                connection: connection.clone(),
                envelope,
            },
            Err(error) => Inbound::Malformed {
                connection: connection.clone(),
                error,
            },
        };
        if inbound.send(item).await.is_err() {
            break;
        }
    }

    if inbound.send(Inbound::Unregister(connection)).await.is_err() {
        debug!("Dispatcher gone before unregister");
    }
}

/// Forwards queued events to the socket. Ends when every handle to the
/// connection is gone, or on the first failed write.
async fn write_loop<S>(
    connection_id: String,
    closed: CancellationToken,
    mut ws_tx: S,
    mut outbound: mpsc::Receiver<Message>,
) where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    while let Some(message) = outbound.recv().await {
        if let Err(e) = ws_tx.send(message).await {
            warn!("Failed to send to {}: {}", connection_id, e);
            closed.cancel();
            return;
        }
    }
    if let Err(e) = ws_tx.send(Message::close()).await {
        debug!("Close frame to {} failed: {}", connection_id, e);
    }
    if let Err(e) = ws_tx.close().await {
        debug!("Closing socket {} failed: {}", connection_id, e);
    }
    debug!("Writer for {} finished", connection_id);
}

/// `GET /chat` with a bearer token, upgraded to a WebSocket.
pub fn routes(
    server: Arc<Server>,
    validator: Arc<dyn TokenValidator>,
) -> impl Filter<Extract = (impl warp::Reply,), Error = Infallible> + Clone {
    let max_frame_size = server.config.max_frame_size;
    let server = warp::any().map(move || server.clone());

    warp::path("chat")
        .and(warp::path::end())
        .and(with_claims(validator))
        .and(warp::ws())
        .and(server)
        .map(move |claims: Claims, ws: warp::ws::Ws, server: Arc<Server>| {
            ws.max_message_size(max_frame_size)
                .max_frame_size(max_frame_size)
                .on_upgrade(move |socket| server.handle_connection(socket, claims))
        })
        .with(warp::cors().allow_any_origin())
        .recover(handle_rejection)
}

async fn handle_rejection(err: Rejection) -> Result<impl warp::Reply, Infallible> {
    let (status, message) = if let Some(e) = err.find::<AuthError>() {
        (StatusCode::UNAUTHORIZED, e.to_string())
    } else if err.is_not_found() {
        (StatusCode::NOT_FOUND, "Not found".to_string())
    } else {
        (StatusCode::BAD_REQUEST, "Bad request".to_string())
    };
    let body = warp::reply::json(&json!({ "code": status.as_u16(), "message": message }));
    Ok(warp::reply::with_status(body, status))
}
