//! Connection handlers for the Ringline server.
//!
//! This module wires the core services together, accepts WebSocket clients
//! and drives each connection: handshake, inbound dispatch and the outbox
//! that carries relayed signals back onto the socket.

use crate::audit;
use crate::config::{Config, Listener};
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::{Context, Result};
use axum::{
    extract::{ws::WebSocketUpgrade, ConnectInfo, State},
    response::IntoResponse,
    routing::get,
    Router,
};
use ringline_core::{
    AuditSink, CallStore, ConnectionAdapter, ConnectionHandle, PresenceRegistry, RateLimiter,
    SignalingRouter, TrustedTokenVerifier,
};
use ringline_protocol::{ErrorCode, Frame};
use ringline_transport::{
    AxumConnection, Connection, Transport, TransportError, WebSocketConfig, WebSocketTransport,
};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const STATS_INTERVAL: Duration = Duration::from_secs(5);
const AUDIT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Shared server state.
pub struct AppState {
    /// Entry point for every connection.
    pub adapter: ConnectionAdapter,
    /// Server configuration.
    pub config: Config,
}

impl AppState {
    /// Assemble presence, rate limiting, the call store and the router.
    #[must_use]
    pub fn new(config: Config, audit: Arc<dyn AuditSink>) -> Self {
        let presence = Arc::new(PresenceRegistry::with_config(config.presence_config()));
        let limiter = Arc::new(RateLimiter::with_config(config.rate_limit_config()));
        let calls = Arc::new(CallStore::with_config(config.call_config(), audit));
        let router = Arc::new(SignalingRouter::new(
            presence,
            limiter,
            calls,
            config.router_config(),
        ));

        Self {
            adapter: ConnectionAdapter::new(router, Arc::new(TrustedTokenVerifier)),
            config,
        }
    }

    #[must_use]
    pub fn router(&self) -> &Arc<SignalingRouter> {
        self.adapter.router()
    }

    /// Start the background sweeps and the router's event loop.
    pub fn start(&self) {
        let router = self.router();
        router.presence().start();
        router.limiter().start();
        router.calls().start();
        router.start();
    }

    pub fn stop(&self) {
        let router = self.router();
        router.stop();
        router.calls().stop();
        router.limiter().stop();
        router.presence().stop();
    }
}

/// Run the signaling server until Ctrl-C.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {:#}", e);
        }
    }

    let addr = config.bind_addr()?;
    let (audit, audit_writer) = audit::open_sink(&config.audit).await?;
    let state = Arc::new(AppState::new(config.clone(), audit));
    state.start();
    let stats = spawn_stats_reporter(&state);

    let served = match config.transport.listener {
        Listener::Axum => serve_axum(state.clone(), addr, shutdown_signal()).await,
        Listener::Tungstenite => {
            let transport = WebSocketTransport::new(WebSocketConfig {
                bind_addr: addr,
                max_message_size: config.transport.max_message_size,
                upgrade_timeout: config.handshake_timeout(),
            })
            .await
            .context("Failed to bind WebSocket listener")?;
            info!("WebSocket endpoint: ws://{}", addr);
            serve_transport(Arc::new(transport), state.clone(), shutdown_signal()).await
        }
    };

    info!("Shutting down");
    stats.abort();
    state.stop();
    drop(state);

    // Records still queued are written once the last connection lets go.
    if let Some(writer) = audit_writer {
        if tokio::time::timeout(AUDIT_DRAIN_TIMEOUT, writer).await.is_err() {
            warn!("Audit log not drained before shutdown");
        }
    }

    served
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
}

/// Serve WebSocket upgrades on the configured path.
async fn serve_axum(
    state: Arc<AppState>,
    addr: SocketAddr,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let path = state.config.transport.websocket_path.clone();
    let app = Router::new()
        .route(&path, get(ws_handler))
        .with_state(state);

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    info!("Ringline server listening on {}", addr);
    info!("WebSocket endpoint: ws://{}{}", addr, path);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await?;

    Ok(())
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let max_message_size = state.config.transport.max_message_size;
    ws.max_message_size(max_message_size)
        .on_upgrade(move |socket| async move {
            let conn = AxumConnection::new(socket, Some(remote), max_message_size);
            drive_connection(Box::new(conn), state).await;
        })
}

/// Accept connections from `transport` until `shutdown` resolves.
///
/// # Errors
///
/// Returns an error if the transport stops accepting for good.
pub async fn serve_transport(
    transport: Arc<dyn Transport>,
    state: Arc<AppState>,
    shutdown: impl Future<Output = ()>,
) -> Result<()> {
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            () = &mut shutdown => break,
            accepted = transport.accept() => match accepted {
                Ok(conn) => {
                    tokio::spawn(drive_connection(conn, state.clone()));
                }
                Err(TransportError::ConnectionClosed) => {
                    anyhow::bail!("{} transport closed", transport.name());
                }
                // A failed upgrade only affects that one client.
                Err(e) => warn!(transport = transport.name(), error = %e, "Accept failed"),
            }
        }
    }

    Ok(())
}

/// Drive one connection from handshake to teardown.
pub async fn drive_connection(mut conn: Box<dyn Connection>, state: Arc<AppState>) {
    let _metrics_guard = ConnectionMetricsGuard::new();
    let connection_id = conn.id().clone();
    debug!(
        connection = %connection_id,
        remote = conn.remote_addr().as_deref().unwrap_or("unknown"),
        "Connection opened"
    );

    let (outbox_tx, mut outbox) = mpsc::unbounded_channel();
    let Some(handle) = handshake(&mut conn, &state, outbox_tx).await else {
        metrics::record_handshake_failure();
        let _ = conn.close().await;
        return;
    };

    loop {
        tokio::select! {
            biased;

            Some(frame) = outbox.recv() => {
                if let Err(e) = conn.send(frame).await {
                    debug!(connection = %connection_id, error = %e, "Send failed");
                    break;
                }
                metrics::record_frame("outbound");
            }

            () = handle.closed() => {
                // Superseded: flush the notice, then hang up.
                while let Ok(frame) = outbox.try_recv() {
                    if conn.send(frame).await.is_err() {
                        break;
                    }
                    metrics::record_frame("outbound");
                }
                break;
            }

            received = conn.recv() => match received {
                Ok(Some(frame)) => {
                    metrics::record_frame("inbound");
                    let start = Instant::now();
                    if let Err(e) = state.adapter.on_message(&handle, frame).await {
                        metrics::record_rejection(e.code());
                    }
                    metrics::record_latency(start.elapsed().as_secs_f64());
                }
                Ok(None) => break,
                Err(e) if e.is_protocol() => {
                    debug!(connection = %connection_id, error = %e, "Undecodable frame");
                    metrics::record_rejection(ErrorCode::Malformed);
                    let _ = handle.send(Frame::error(0, ErrorCode::Malformed.as_u16(), e.to_string()));
                }
                Err(e) => {
                    warn!(connection = %connection_id, error = %e, "Connection error");
                    break;
                }
            }
        }
    }

    state.adapter.on_close(&handle);
    let _ = conn.close().await;
    debug!(connection = %connection_id, "Connection closed");
}

/// Wait for the `connect` frame and register the client.
///
/// Returns `None` after telling the client why, if it could not be
/// registered.
async fn handshake(
    conn: &mut Box<dyn Connection>,
    state: &AppState,
    outbox: mpsc::UnboundedSender<Frame>,
) -> Option<ConnectionHandle> {
    let first = match tokio::time::timeout(state.config.handshake_timeout(), conn.recv()).await {
        Ok(Ok(Some(frame))) => frame,
        Ok(Ok(None)) => {
            debug!(connection = %conn.id(), "Closed before handshake");
            return None;
        }
        Ok(Err(e)) if e.is_protocol() => {
            let reply = Frame::error(0, ErrorCode::Malformed.as_u16(), e.to_string());
            let _ = conn.send(reply).await;
            return None;
        }
        Ok(Err(e)) => {
            debug!(connection = %conn.id(), error = %e, "Handshake read failed");
            return None;
        }
        Err(_) => {
            debug!(connection = %conn.id(), "Handshake timed out");
            let reply = Frame::error(0, ErrorCode::Handshake.as_u16(), "Handshake timed out");
            let _ = conn.send(reply).await;
            return None;
        }
    };
    metrics::record_frame("inbound");

    match state.adapter.handshake(conn.id().as_str(), first, outbox).await {
        Ok(handle) => Some(handle),
        Err(reply) => {
            let _ = conn.send(reply).await;
            None
        }
    }
}

/// Periodically publish router stats and count server-ended calls.
fn spawn_stats_reporter(state: &Arc<AppState>) -> JoinHandle<()> {
    let router = Arc::downgrade(state.router());
    let mut terminations = state.router().calls().subscribe_terminations();

    tokio::spawn(async move {
        let mut tick = tokio::time::interval(STATS_INTERVAL);
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    let Some(router) = router.upgrade() else { break };
                    metrics::set_router_stats(&router.stats());
                }
                termination = terminations.recv() => match termination {
                    Ok(termination) => metrics::record_call_ended(termination.reason),
                    Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => break,
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ringline_core::MemoryAuditSink;
    use ringline_protocol::{PeerStatus, SignalBody, SignalKind};
    use ringline_transport::{MemoryClient, MemoryTransport};
    use serde_json::json;
    use tokio::sync::oneshot;

    struct Server {
        transport: Arc<MemoryTransport>,
        state: Arc<AppState>,
        shutdown: oneshot::Sender<()>,
        task: JoinHandle<Result<()>>,
    }

    fn server(config: Config) -> Server {
        let state = Arc::new(AppState::new(config, Arc::new(MemoryAuditSink::new())));
        state.start();

        let transport = Arc::new(MemoryTransport::new());
        let (shutdown, stop) = oneshot::channel::<()>();
        let task = tokio::spawn(serve_transport(
            transport.clone() as Arc<dyn Transport>,
            state.clone(),
            async move {
                let _ = stop.await;
            },
        ));

        Server {
            transport,
            state,
            shutdown,
            task,
        }
    }

    fn quiet_config() -> Config {
        let mut config = Config::default();
        config.presence.broadcast = false;
        config
    }

    async fn login(server: &Server, identity: &str) -> MemoryClient {
        let mut client = server.transport.connect().unwrap();
        client
            .send(Frame::connect(1, Some(identity.to_string())))
            .unwrap();
        match client.recv().await {
            Some(Frame::Connected { identity: bound, .. }) => assert_eq!(bound, identity),
            other => panic!("Expected connected, got {:?}", other),
        }
        client
    }

    #[tokio::test]
    async fn test_call_initiate_is_relayed_and_acked() {
        let server = server(quiet_config());
        let mut alice = login(&server, "alice").await;
        let mut bob = login(&server, "bob").await;

        let body = SignalBody::initiate("bob", json!({"sdp": "v=0"})).with_id(7);
        alice
            .send(Frame::from_signal(SignalKind::CallInitiate, body))
            .unwrap();

        let call_id = match alice.recv().await {
            Some(Frame::Ack { id: 7, call_id }) => call_id.unwrap(),
            other => panic!("Expected ack, got {:?}", other),
        };
        match bob.recv().await {
            Some(Frame::CallInitiate(body)) => {
                assert_eq!(body.call_id.as_deref(), Some(call_id.as_str()));
                assert_eq!(body.from.as_deref(), Some("alice"));
                assert_eq!(body.payload, json!({"sdp": "v=0"}));
            }
            other => panic!("Expected call-initiate, got {:?}", other),
        }

        server.shutdown.send(()).unwrap();
        server.task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_ping_answered_with_pong() {
        let server = server(quiet_config());
        let mut alice = login(&server, "alice").await;

        alice.send(Frame::Ping { timestamp: Some(99) }).unwrap();
        assert_eq!(alice.recv().await, Some(Frame::pong(Some(99))));
    }

    #[tokio::test]
    async fn test_first_frame_must_be_connect() {
        let server = server(quiet_config());
        let mut client = server.transport.connect().unwrap();

        client.send(Frame::ping()).unwrap();
        match client.recv().await {
            Some(Frame::Error { code, .. }) => assert_eq!(code, ErrorCode::Handshake.as_u16()),
            other => panic!("Expected handshake error, got {:?}", other),
        }
        assert_eq!(client.recv().await, None);
        assert!(server.state.router().presence().is_empty());
    }

    #[tokio::test]
    async fn test_silent_client_times_out_handshake() {
        let mut config = quiet_config();
        config.transport.handshake_timeout_ms = 50;
        let server = server(config);
        let mut client = server.transport.connect().unwrap();

        match client.recv().await {
            Some(Frame::Error { code, message, .. }) => {
                assert_eq!(code, ErrorCode::Handshake.as_u16());
                assert_eq!(message, "Handshake timed out");
            }
            other => panic!("Expected handshake error, got {:?}", other),
        }
        assert_eq!(client.recv().await, None);
    }

    #[tokio::test]
    async fn test_reconnect_supersedes_previous_connection() {
        let server = server(quiet_config());
        let mut first = login(&server, "alice").await;
        let _second = login(&server, "alice").await;

        match first.recv().await {
            Some(Frame::Superseded { .. }) => {}
            other => panic!("Expected superseded, got {:?}", other),
        }
        assert_eq!(first.recv().await, None);
        assert_eq!(server.state.router().presence().len(), 1);
    }

    #[tokio::test]
    async fn test_disconnect_ends_call_for_peer() {
        let server = server(quiet_config());
        let mut alice = login(&server, "alice").await;
        let mut bob = login(&server, "bob").await;

        alice
            .send(Frame::from_signal(
                SignalKind::CallInitiate,
                SignalBody::initiate("bob", json!(null)),
            ))
            .unwrap();
        let Some(Frame::Ack { call_id, .. }) = alice.recv().await else {
            panic!("Expected ack");
        };
        let Some(Frame::CallInitiate(_)) = bob.recv().await else {
            panic!("Expected call-initiate");
        };

        alice.close();

        match bob.recv().await {
            Some(Frame::CallEnded { call_id: ended, reason }) => {
                assert_eq!(Some(ended), call_id);
                assert_eq!(reason, "peer_unreachable");
            }
            other => panic!("Expected call-ended, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_reconnect_during_call_resumes_it() {
        let server = server(quiet_config());
        let mut alice = login(&server, "alice").await;
        let mut bob = login(&server, "bob").await;

        alice
            .send(Frame::from_signal(
                SignalKind::CallInitiate,
                SignalBody::initiate("bob", json!(null)),
            ))
            .unwrap();
        let Some(Frame::Ack { call_id: Some(call_id), .. }) = alice.recv().await else {
            panic!("Expected ack");
        };
        let Some(Frame::CallInitiate(_)) = bob.recv().await else {
            panic!("Expected call-initiate");
        };

        let mut bob_again = login(&server, "bob").await;
        match bob_again.recv().await {
            Some(Frame::CallState(body)) => {
                assert_eq!(body.call_id, call_id);
                assert_eq!(body.state, "ringing");
            }
            other => panic!("Expected call-state, got {:?}", other),
        }
        assert_eq!(
            alice.recv().await,
            Some(Frame::peer_reconnected(call_id.clone(), "bob"))
        );

        // Closing the superseded socket leaves the call alone.
        let Some(Frame::Superseded { .. }) = bob.recv().await else {
            panic!("Expected superseded");
        };
        assert_eq!(bob.recv().await, None);

        bob_again
            .send(Frame::from_signal(
                SignalKind::Answer,
                SignalBody::for_call(call_id.clone(), json!(null)).with_id(3),
            ))
            .unwrap();
        assert_eq!(
            bob_again.recv().await,
            Some(Frame::ack(3, Some(call_id)))
        );
        assert!(matches!(alice.recv().await, Some(Frame::Answer(_))));
    }

    #[tokio::test]
    async fn test_presence_broadcast_reaches_other_clients() {
        let server = server(Config::default());
        let mut alice = login(&server, "alice").await;
        let _bob = login(&server, "bob").await;

        match alice.recv().await {
            Some(Frame::Presence { identity, status }) => {
                assert_eq!(identity, "bob");
                assert_eq!(status, PeerStatus::Online);
            }
            other => panic!("Expected presence, got {:?}", other),
        }
    }
}
