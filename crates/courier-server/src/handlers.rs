//! HTTP surface of the Courier server.
//!
//! `/ws` upgrades client streams after the origin and credential checks,
//! `/relay` accepts gateway links on a peer hub.

use crate::auth::{credentials, origin_allowed, StaticAuthenticator};
use crate::config::{Config, Role};
use crate::metrics::{self, ConnectionMetricsGuard};
use crate::store::MemoryBackend;
use anyhow::{Context, Result};
use axum::{
    extract::{ws::WebSocket, Path, Query, State, WebSocketUpgrade},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use courier_core::chat::{default_dispatcher, TypingHandler};
use courier_core::relay::{
    ChatPushHandler, ChatRelayHandler, JoinRelayHandler, NotificationPushHandler, PublishingStore,
    ReactionRelayHandler, RelayAuthorizer, RelayMessageStore, TypingRelayHandler,
};
use courier_core::{
    run_connection, Authenticator, CallerId, CollaboratorError, Collaborators, ConnectionConfig,
    ConnectionHandle, Dispatcher, Hub, HubHandle, PushRouter, RelayClient, RelayPeers, RelayRouter,
    RelaySession, RelayState, TypingForwarder,
};
use courier_protocol::{kinds, relay_kinds};
use courier_transport::{split_axum, WebSocketConnector};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Header a gateway sets when dialing the peer's relay endpoint.
pub const GATEWAY_CLIENT_HEADER: &str = "x-gateway-client";

/// Shared server state.
pub struct AppState {
    pub config: Config,
    pub hub: HubHandle,
    pub dispatcher: Arc<Dispatcher>,
    pub authenticator: Arc<dyn Authenticator>,
    pub connection: ConnectionConfig,
    /// Gateway role with a configured peer.
    pub relay: Option<RelayClient>,
    /// Peer role.
    pub relay_session: Option<RelaySession>,
}

impl AppState {
    /// Spawn the hub and, depending on the role, the relay side, all tied to
    /// `shutdown`.
    #[must_use]
    pub fn new(config: Config, shutdown: &CancellationToken) -> Self {
        let (hub, _) = Hub::spawn_with_shutdown(config.hub.to_hub_config(), shutdown.clone());
        let backend = Arc::new(MemoryBackend::new(&config.conversations));
        let relay_config = config.relay.to_relay_config(&config.connection);

        let mut relay = None;
        let mut relay_session = None;
        let mut typing_forwarder: Option<Arc<dyn TypingForwarder>> = None;
        let collaborators = match (config.role, &config.relay.url) {
            (Role::Gateway, Some(url)) => {
                let connector =
                    WebSocketConnector::new(url.clone()).with_header(GATEWAY_CLIENT_HEADER, "true");
                let chat = Arc::new(ChatPushHandler::new(hub.clone(), backend.clone()));
                let push = PushRouter::new()
                    .with_handler(relay_kinds::CHAT_MESSAGE, chat.clone())
                    .with_handler(relay_kinds::REACTION_UPDATE, chat.clone())
                    .with_handler(relay_kinds::TYPING, chat)
                    .with_handler(
                        relay_kinds::NOTIFICATION,
                        Arc::new(NotificationPushHandler::new(hub.clone())),
                    );
                let (client, _) = RelayClient::spawn_with_shutdown(
                    relay_config,
                    Arc::new(connector),
                    Arc::new(push),
                    shutdown.clone(),
                );
                let store = Arc::new(RelayMessageStore::new(client.clone()));
                typing_forwarder = Some(Arc::new(client.clone()));
                relay = Some(client.clone());
                Collaborators {
                    authorizer: Arc::new(RelayAuthorizer::new(client)),
                    store: store.clone(),
                    reactions: store,
                    directory: backend,
                }
            }
            (Role::Gateway, None) => Collaborators {
                authorizer: backend.clone(),
                store: backend.clone(),
                reactions: backend.clone(),
                directory: backend,
            },
            (Role::Peer, _) => {
                let peers = RelayPeers::new();
                let reactions = ReactionRelayHandler::new(
                    hub.clone(),
                    backend.clone(),
                    backend.clone(),
                    peers.clone(),
                );
                let router = RelayRouter::new()
                    .with_handler(
                        relay_kinds::CHAT_MESSAGE,
                        ChatRelayHandler::new(hub.clone(), backend.clone(), backend.clone(), peers.clone()),
                    )
                    .with_handler(relay_kinds::REACTION_ADD, reactions.clone())
                    .with_handler(relay_kinds::REACTION_REMOVE, reactions)
                    .with_handler(
                        relay_kinds::JOIN_CONVERSATION,
                        JoinRelayHandler::new(backend.clone()),
                    )
                    .with_handler(
                        relay_kinds::TYPING,
                        TypingRelayHandler::new(hub.clone(), peers.clone()),
                    );
                relay_session = Some(RelaySession::new(Arc::new(router), peers.clone(), relay_config));
                typing_forwarder = Some(Arc::new(peers.clone()));
                let publishing = Arc::new(PublishingStore::new(backend.clone(), backend.clone(), peers));
                Collaborators {
                    authorizer: backend.clone(),
                    store: publishing.clone(),
                    reactions: publishing,
                    directory: backend,
                }
            }
        };

        let mut dispatcher = default_dispatcher(&collaborators);
        if let Some(forwarder) = typing_forwarder {
            dispatcher = dispatcher.with_handler(kinds::TYPING, TypingHandler::forwarding(forwarder));
        }

        Self {
            hub,
            dispatcher: Arc::new(dispatcher),
            authenticator: Arc::new(StaticAuthenticator::new(&config.auth)),
            connection: config.connection.to_connection_config(),
            relay,
            relay_session,
            config,
        }
    }
}

/// Build the HTTP router.
pub fn router(state: Arc<AppState>) -> Router {
    let mut app = Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/presence/:caller", get(presence_handler));
    if state.relay_session.is_some() {
        app = app.route("/relay", get(relay_handler));
    }
    app.with_state(state)
}

/// Run the HTTP/WebSocket server until `shutdown` is cancelled.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config, shutdown: CancellationToken) -> Result<()> {
    let state = Arc::new(AppState::new(config.clone(), &shutdown));

    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }
    tokio::spawn(metrics::refresh_gauges(
        state.hub.clone(),
        state.relay.clone(),
        state.relay_session.as_ref().map(|s| s.peers().clone()),
        shutdown.clone(),
    ));

    let app = router(state.clone());
    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    info!(role = ?config.role, "Courier server listening on {}", addr);
    info!("WebSocket endpoint: ws://{}/ws", addr);
    if state.relay_session.is_some() {
        info!("Relay endpoint: ws://{}/relay", addr);
    }

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.clone().cancelled_owned())
        .await?;

    state.hub.shutdown();
    info!("Courier server stopped");
    Ok(())
}

fn relay_state_label(state: RelayState) -> &'static str {
    match state {
        RelayState::Connecting => "connecting",
        RelayState::Connected => "connected",
        RelayState::Unavailable => "unavailable",
        RelayState::Stopped => "stopped",
    }
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = state.hub.stats();
    let status = if state.hub.is_shut_down() { "stopping" } else { "ok" };
    let relay = match (&state.relay, &state.relay_session) {
        (Some(client), _) => json!(relay_state_label(client.state())),
        (None, Some(session)) => json!({ "sessions": session.peers().len() }),
        (None, None) => json!(null),
    };

    Json(json!({
        "status": status,
        "version": env!("CARGO_PKG_VERSION"),
        "role": state.config.role,
        "connections": stats.connection_count,
        "topics": stats.topic_count,
        "relay": relay,
    }))
}

/// Presence of one caller.
async fn presence_handler(
    Path(caller): Path<String>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    Json(state.hub.presence(&CallerId::from(caller)))
}

/// WebSocket upgrade handler.
async fn ws_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> Response {
    if !origin_allowed(&state.config.allowed_origins, &headers) {
        metrics::record_rejected("origin");
        warn!(origin = ?headers.get(header::ORIGIN), "Rejected upgrade from disallowed origin");
        return StatusCode::FORBIDDEN.into_response();
    }

    let caller = match state
        .authenticator
        .authenticate(&credentials(&headers, &query))
        .await
    {
        Ok(caller) => caller,
        Err(CollaboratorError::InvalidCredentials) => {
            metrics::record_rejected("credentials");
            return StatusCode::UNAUTHORIZED.into_response();
        }
        Err(e) => {
            warn!(error = %e, "Authentication unavailable");
            return StatusCode::SERVICE_UNAVAILABLE.into_response();
        }
    };

    ws.on_upgrade(move |socket| handle_websocket(socket, caller, state))
}

/// Handle a client WebSocket until it closes.
async fn handle_websocket(socket: WebSocket, caller: CallerId, state: Arc<AppState>) {
    let _metrics_guard = ConnectionMetricsGuard::new();
    let (handle, outbound) = ConnectionHandle::new(caller, &state.connection);
    let (reader, writer) = split_axum(socket);

    debug!(caller = %handle.caller(), "WebSocket connected");
    run_connection(
        handle.clone(),
        outbound,
        reader,
        writer,
        state.hub.clone(),
        state.dispatcher.clone(),
    )
    .await;
    debug!(caller = %handle.caller(), "WebSocket disconnected");
}

fn is_gateway_client(headers: &HeaderMap) -> bool {
    headers
        .get(GATEWAY_CLIENT_HEADER)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("true"))
}

/// Relay upgrade handler, peer role only.
async fn relay_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(session) = state.relay_session.clone() else {
        return StatusCode::NOT_FOUND.into_response();
    };
    if !is_gateway_client(&headers) {
        metrics::record_rejected("relay");
        warn!("Rejected relay upgrade without gateway header");
        return StatusCode::FORBIDDEN.into_response();
    }

    ws.on_upgrade(move |socket| async move {
        let (reader, writer) = split_axum(socket);
        session.serve(reader, writer).await;
    })
}
