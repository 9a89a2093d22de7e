//! WebSocket transport server using Axum.
//!
//! Handles HTTP upgrade to WebSocket, the optional token handshake,
//! heartbeat pings, outbox draining, and decoding frames into typed events
//! for the [`EventHandler`].

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::{
    Router,
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    http::{HeaderValue, Method, StatusCode},
    response::{IntoResponse, Json},
    routing::get,
};
use formsync_protocol::{
    AuthErrorCode, AuthRequiredParams, AuthState, ClientEvent, Connected, ErrorCode, Events,
    HandshakeParams, HandshakeResult, Inbound, Notification, RequestId, Response, RpcError,
    SERVER_VERSION, ServerEvent, jsonrpc::salvage_id,
};
use futures_util::{SinkExt, StreamExt, stream::SplitSink};
use secrecy::{ExposeSecret, SecretString};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::{debug, error, info, warn};

use crate::client::{ClientConnection, ConnectionHandle, ConnectionId};

/// Receives connection lifecycle and decoded events from the transport.
pub trait EventHandler: Send + Sync + 'static {
    /// A connection became usable (after the handshake, if one is required).
    fn on_connect(&self, connection: ConnectionHandle);

    /// A well-formed event arrived. Events from one connection are delivered
    /// one at a time, in arrival order.
    fn on_event(
        &self,
        connection: &ConnectionHandle,
        event: ClientEvent,
    ) -> impl std::future::Future<Output = ()> + Send;

    /// The connection is gone. Called exactly once per `on_connect`, however
    /// the socket ended.
    fn on_disconnect(&self, connection_id: &str);

    /// Extra fields for `/health`.
    fn stats(&self) -> Value {
        Value::Null
    }
}

/// Shared-token gate configuration.
#[derive(Debug)]
pub struct AuthConfig {
    pub token: SecretString,
    /// Time allowed to complete the handshake
    pub handshake_timeout: Duration,
}

impl AuthConfig {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: SecretString::from(token.into()),
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

/// Transport server configuration.
#[derive(Debug)]
pub struct TransportConfig {
    /// Port to listen on (0 for OS-assigned)
    pub port: u16,
    pub hostname: String,
    /// Token handshake; `None` accepts every connection immediately
    pub auth: Option<AuthConfig>,
    /// Origins allowed by CORS on the HTTP routes; empty disables the layer
    pub cors_origins: Vec<String>,
    pub max_connections: Option<usize>,
    /// Events buffered per connection before delivery starts dropping
    pub outbox_capacity: usize,
    /// Ping period; a client silent for two periods is dropped
    pub heartbeat_interval: Option<Duration>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            port: 3001,
            hostname: "127.0.0.1".into(),
            auth: None,
            cors_origins: Vec::new(),
            max_connections: Some(256),
            outbox_capacity: 256,
            heartbeat_interval: Some(Duration::from_secs(30)),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("invalid listen address: {0}")]
    Address(#[from] std::net::AddrParseError),

    #[error("failed to bind: {0}")]
    Bind(#[from] std::io::Error),
}

struct AppState<H: EventHandler> {
    handler: Arc<H>,
    config: TransportConfig,
    client_count: AtomicUsize,
}

/// The transport server. Owns the listener task.
pub struct TransportServer {
    shutdown_tx: Option<mpsc::Sender<()>>,
    handle: Option<tokio::task::JoinHandle<()>>,
    port: u16,
}

impl TransportServer {
    /// Bind and start serving. The handler is shared so the caller can keep
    /// using it (e.g. to shut it down after the transport stops).
    pub async fn start<H: EventHandler>(
        config: TransportConfig,
        handler: Arc<H>,
    ) -> Result<Self, TransportError> {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);

        let addr: SocketAddr = format!("{}:{}", config.hostname, config.port).parse()?;
        let listener = tokio::net::TcpListener::bind(addr).await?;
        let actual_port = listener.local_addr()?.port();

        let cors = cors_layer(&config.cors_origins);
        info!("Collaboration transport listening on ws://{}:{}/ws", config.hostname, actual_port);

        let state = Arc::new(AppState {
            handler,
            config,
            client_count: AtomicUsize::new(0),
        });

        let mut app = Router::new()
            .route("/ws", get(ws_upgrade_handler::<H>))
            .route("/health", get(health_handler::<H>))
            .with_state(state);
        if let Some(cors) = cors {
            app = app.layer(cors);
        }

        let handle = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.recv().await;
                })
                .await
                .ok();
        });

        Ok(Self {
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
            port: actual_port,
        })
    }

    /// Get the actual bound port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Stop accepting connections and wait for the server task.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(()).await;
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
        info!("Collaboration transport stopped");
    }
}

fn cors_layer(origins: &[String]) -> Option<CorsLayer> {
    if origins.is_empty() {
        return None;
    }
    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| match o.parse::<HeaderValue>() {
            Ok(v) => Some(v),
            Err(_) => {
                warn!("Ignoring invalid CORS origin: {o}");
                None
            }
        })
        .collect();
    Some(
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(allowed))
            .allow_methods([Method::GET])
            .allow_credentials(true),
    )
}

// ─────────────────────────────────────────────────────────────────────────────
// HTTP Handlers
// ─────────────────────────────────────────────────────────────────────────────

async fn ws_upgrade_handler<H: EventHandler>(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState<H>>>,
) -> impl IntoResponse {
    if let Some(max) = state.config.max_connections {
        let current = state.client_count.load(Ordering::Relaxed);
        if current >= max {
            warn!("Connection rejected: max connections reached ({max})");
            return StatusCode::SERVICE_UNAVAILABLE.into_response();
        }
    }

    ws.on_upgrade(move |socket| handle_ws_connection(socket, state))
        .into_response()
}

async fn health_handler<H: EventHandler>(
    State(state): State<Arc<AppState<H>>>,
) -> impl IntoResponse {
    let mut body = json!({
        "status": "ok",
        "clients": state.client_count.load(Ordering::Relaxed),
    });
    if let (Some(map), Value::Object(extra)) = (body.as_object_mut(), state.handler.stats()) {
        map.extend(extra);
    }
    Json(body)
}

// ─────────────────────────────────────────────────────────────────────────────
// WebSocket Connection Handler
// ─────────────────────────────────────────────────────────────────────────────

/// Keeps the live-client counter in step with connection tasks.
struct ClientCount<'a>(&'a AtomicUsize);

impl<'a> ClientCount<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self(counter)
    }
}

impl Drop for ClientCount<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Ties `on_connect` to exactly one `on_disconnect`.
struct Registration<H: EventHandler> {
    handler: Arc<H>,
    id: ConnectionId,
}

impl<H: EventHandler> Registration<H> {
    fn new(handler: &Arc<H>, connection: &ConnectionHandle) -> Self {
        handler.on_connect(connection.clone());
        Self {
            handler: handler.clone(),
            id: connection.shared_id(),
        }
    }
}

impl<H: EventHandler> Drop for Registration<H> {
    fn drop(&mut self) {
        self.handler.on_disconnect(&self.id);
    }
}

async fn handle_ws_connection<H: EventHandler>(socket: WebSocket, state: Arc<AppState<H>>) {
    let _count = ClientCount::enter(&state.client_count);
    let config = &state.config;

    let mut client = ClientConnection::new(uuid::Uuid::new_v4().to_string(), config.auth.is_some());
    info!("Client connected: {}", client.id);

    let (mut ws_tx, mut ws_rx) = socket.split();
    let (connection, mut outbox) = ConnectionHandle::channel(client.id.clone(), config.outbox_capacity);
    let mut registration: Option<Registration<H>> = None;

    match &config.auth {
        Some(auth) => {
            let required = Notification::new(
                Events::AUTH_REQUIRED,
                serde_json::to_value(AuthRequiredParams {
                    server_version: SERVER_VERSION.into(),
                    timeout: auth.handshake_timeout.as_millis() as u64,
                })
                .ok(),
            );
            let text = serde_json::to_string(&required).unwrap_or_default();
            if let Err(e) = ws_tx.send(Message::Text(text.into())).await {
                error!("Failed to send auth/required: {e}");
                return;
            }
        }
        None => {
            registration = Some(Registration::new(&state.handler, &connection));
            send_welcome(&mut ws_tx, &client.id).await;
        }
    }

    let auth_deadline = config
        .auth
        .as_ref()
        .map(|a| tokio::time::Instant::now() + a.handshake_timeout);
    let mut heartbeat = config.heartbeat_interval.map(|period| {
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        interval
    });

    loop {
        let auth_sleep = async {
            match auth_deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };
        let heartbeat_tick = async {
            match heartbeat.as_mut() {
                Some(interval) => {
                    interval.tick().await;
                }
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        client.touch();

                        if !client.is_authenticated() {
                            match handle_handshake(text.as_str(), config.auth.as_ref(), &client.id) {
                                HandshakeOutcome::Authenticated { response, client_name } => {
                                    client.auth_state = AuthState::Authenticated;
                                    client.client_name = client_name;
                                    let _ = ws_tx.send(Message::Text(response.into())).await;
                                    registration = Some(Registration::new(&state.handler, &connection));
                                    send_welcome(&mut ws_tx, &client.id).await;
                                    debug!(
                                        "Client authenticated: {} ({})",
                                        client.id,
                                        client.client_name.as_deref().unwrap_or("unnamed")
                                    );
                                }
                                HandshakeOutcome::Rejected(response) => {
                                    client.auth_state = AuthState::Rejected;
                                    let _ = ws_tx.send(Message::Text(response.into())).await;
                                    warn!("Client auth failed: {}", client.id);
                                    break;
                                }
                                HandshakeOutcome::NotHandshake(response) => {
                                    let _ = ws_tx.send(Message::Text(response.into())).await;
                                }
                            }
                            continue;
                        }

                        match decode_event(text.as_str()) {
                            Ok(event) => {
                                debug!("{} from {} (form {})", event.name(), client.id, event.form_id());
                                state.handler.on_event(&connection, event).await;
                            }
                            Err(response) => {
                                if let Err(e) = ws_tx.send(Message::Text(response.into())).await {
                                    error!("Failed to send error to {}: {e}", client.id);
                                    break;
                                }
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        client.touch();
                        let _ = ws_tx.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        debug!("Client closed: {}", client.id);
                        break;
                    }
                    Some(Err(e)) => {
                        warn!("WebSocket error for {}: {e}", client.id);
                        break;
                    }
                    Some(Ok(_)) => {
                        client.touch();
                    }
                }
            }

            Some(event) = outbox.recv() => {
                if let Err(e) = ws_tx.send(Message::Text(event.to_text().into())).await {
                    error!("Failed to deliver {} to {}: {e}", event.name(), client.id);
                    break;
                }
            }

            _ = heartbeat_tick => {
                let window = config.heartbeat_interval.unwrap_or_default() * 2;
                if client.is_stale(window) {
                    warn!("Dropping stale client {}", client.id);
                    let _ = ws_tx.send(Message::Close(None)).await;
                    break;
                }
                if ws_tx.send(Message::Ping(Default::default())).await.is_err() {
                    break;
                }
            }

            _ = auth_sleep, if !client.is_authenticated() => {
                warn!("Auth timeout for client {}", client.id);
                let err = Response::error(
                    None,
                    RpcError::new(
                        ErrorCode::Custom(AuthErrorCode::HandshakeTimeout.code()),
                        "Authentication timeout",
                    ),
                );
                let _ = ws_tx.send(Message::Text(err.to_text().into())).await;
                break;
            }
        }
    }

    // Runs on_disconnect before the connection count drops.
    drop(registration);
    info!(
        "Client disconnected: {} after {:?} (total: {})",
        client.id,
        client.connected_at.elapsed(),
        state.client_count.load(Ordering::Relaxed).saturating_sub(1)
    );
}

// ─────────────────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────────────────

async fn send_welcome(ws_tx: &mut SplitSink<WebSocket, Message>, connection_id: &str) {
    let welcome = ServerEvent::Connected(Connected {
        connection_id: connection_id.to_string(),
        server_version: SERVER_VERSION.into(),
    });
    let _ = ws_tx.send(Message::Text(welcome.to_text().into())).await;
}

/// Decode a text frame into a client event, or the error response to send back.
fn decode_event(text: &str) -> Result<ClientEvent, String> {
    let inbound = Inbound::parse(text)
        .map_err(|e| Response::error(salvage_id(text), RpcError::from(&e)).to_text())?;
    let Inbound { id, method, params, .. } = inbound;
    let method = method.unwrap_or_default();
    ClientEvent::decode(&method, params).map_err(|e| {
        debug!("Rejected {method} frame: {e}");
        Response::error(id, e.into()).to_text()
    })
}

enum HandshakeOutcome {
    Authenticated {
        response: String,
        client_name: Option<String>,
    },
    Rejected(String),
    NotHandshake(String),
}

fn handle_handshake(text: &str, auth: Option<&AuthConfig>, connection_id: &str) -> HandshakeOutcome {
    let inbound = match Inbound::parse(text) {
        Ok(inbound) => inbound,
        Err(e) => {
            let err = Response::error(salvage_id(text), RpcError::from(&e));
            return HandshakeOutcome::NotHandshake(err.to_text());
        }
    };

    if inbound.method() != Events::AUTH_HANDSHAKE {
        let err = Response::error(
            inbound.id,
            RpcError::new(
                ErrorCode::Custom(AuthErrorCode::NotAuthenticated.code()),
                "Not authenticated. Send auth/handshake first.",
            ),
        );
        return HandshakeOutcome::NotHandshake(err.to_text());
    }

    let id = inbound.id.unwrap_or(RequestId::Number(0));
    let params: Option<HandshakeParams> = inbound
        .params
        .and_then(|v| serde_json::from_value(v).ok());

    let accepted = match (auth, &params) {
        (None, _) => true,
        (Some(auth), Some(p)) => p.token == auth.token.expose_secret(),
        (Some(_), None) => false,
    };

    if !accepted {
        let err = Response::error(
            Some(id),
            RpcError::new(
                ErrorCode::Custom(AuthErrorCode::InvalidToken.code()),
                "Invalid authentication token",
            ),
        );
        return HandshakeOutcome::Rejected(err.to_text());
    }

    let result = HandshakeResult {
        connection_id: connection_id.to_string(),
        server_version: SERVER_VERSION.into(),
    };
    let response = Response::success(id, serde_json::to_value(result).unwrap_or_default());
    HandshakeOutcome::Authenticated {
        response: response.to_text(),
        client_name: params.and_then(|p| p.client),
    }
}
