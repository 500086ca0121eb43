//! Connection adapter.
//!
//! Bridges transport connections to the core: runs the handshake, feeds
//! inbound frames to the router and turns every outcome into a reply frame
//! for the originating client.

use crate::call::CallId;
use crate::connection::ConnectionHandle;
use crate::error::SignalError;
use crate::presence::PresenceRegistry;
use crate::router::SignalingRouter;
use ringline_protocol::{ErrorCode, Frame, Version};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Authentication collaborator: turns a handshake token into an identity.
pub trait IdentityVerifier: Send + Sync {
    /// # Errors
    ///
    /// Returns [`SignalError::Unauthenticated`] if the token is not accepted.
    fn verify(&self, token: Option<&str>) -> Result<String, SignalError>;
}

/// Takes the handshake token as the identity, unchecked.
///
/// For deployments where an upstream proxy already authenticated the
/// client and forwards its identity.
#[derive(Debug, Default, Clone, Copy)]
pub struct TrustedTokenVerifier;

impl IdentityVerifier for TrustedTokenVerifier {
    fn verify(&self, token: Option<&str>) -> Result<String, SignalError> {
        match token {
            Some(token) if !token.is_empty() => Ok(token.to_string()),
            _ => Err(SignalError::Unauthenticated("missing identity token".into())),
        }
    }
}

/// Per-connection entry point into the core.
pub struct ConnectionAdapter {
    router: Arc<SignalingRouter>,
    verifier: Arc<dyn IdentityVerifier>,
    heartbeat_interval_ms: u32,
}

impl ConnectionAdapter {
    #[must_use]
    pub fn new(router: Arc<SignalingRouter>, verifier: Arc<dyn IdentityVerifier>) -> Self {
        // Clients heartbeat at a third of the grace period.
        let grace = router.presence().config().grace_period;
        let heartbeat_interval_ms = u32::try_from(grace.as_millis() / 3).unwrap_or(u32::MAX);
        Self {
            router,
            verifier,
            heartbeat_interval_ms,
        }
    }

    #[must_use]
    pub fn router(&self) -> &Arc<SignalingRouter> {
        &self.router
    }

    fn presence(&self) -> &PresenceRegistry {
        self.router.presence()
    }

    /// Process the first frame of a connection.
    ///
    /// On success the connection is registered, a `connected` frame is
    /// queued on `outbox` and the handle is returned. An identity that comes
    /// back while it still has live calls is resumed on them, see
    /// [`SignalingRouter::resume`].
    ///
    /// # Errors
    ///
    /// Returns the `error` frame to send before closing the connection.
    pub async fn handshake(
        &self,
        connection_id: &str,
        first: Frame,
        outbox: mpsc::UnboundedSender<Frame>,
    ) -> Result<ConnectionHandle, Frame> {
        let (version, token) = match first {
            Frame::Connect { version, token } => (version, token),
            other => {
                debug!(connection = %connection_id, frame = %other.frame_type(), "Expected connect frame");
                return Err(Frame::error(
                    0,
                    ErrorCode::Handshake.as_u16(),
                    "Handshake required",
                ));
            }
        };

        let negotiated = Version::negotiate(version).map_err(|e| {
            debug!(connection = %connection_id, "{}", e);
            Frame::error(0, ErrorCode::Handshake.as_u16(), e.to_string())
        })?;

        let identity = self
            .verifier
            .verify(token.as_deref())
            .map_err(|e| e.to_frame(0))?;

        let handle = self
            .presence()
            .register(&identity, connection_id, outbox)
            .map_err(|e| e.to_frame(0))?;

        info!(
            connection = %connection_id,
            identity = %handle.identity(),
            version = %negotiated,
            "Client connected"
        );

        let connected = Frame::connected(
            connection_id,
            handle.identity().as_str(),
            negotiated.major,
            self.heartbeat_interval_ms,
        );
        if handle.send(connected).is_err() {
            warn!(connection = %connection_id, "Connection closed during handshake");
            return Ok(handle);
        }

        self.router.resume(handle.identity()).await;
        Ok(handle)
    }

    /// Dispatch one inbound frame from an established connection.
    ///
    /// Replies (acks, errors, call state, pongs) are queued on the
    /// connection itself; the returned error is for logging and metrics.
    ///
    /// # Errors
    ///
    /// Returns the rejection that was reported to the client.
    pub async fn on_message(
        &self,
        handle: &ConnectionHandle,
        frame: Frame,
    ) -> Result<(), SignalError> {
        let request_id = frame.request_id();
        let result = self.dispatch(handle, frame).await;

        if let Err(e) = &result {
            debug!(
                identity = %handle.identity(),
                code = e.code().as_u16(),
                "Rejected: {}", e
            );
            self.reply(handle, e.to_frame(request_id));
        }
        result
    }

    async fn dispatch(&self, handle: &ConnectionHandle, frame: Frame) -> Result<(), SignalError> {
        let identity = handle.identity();
        match frame.into_signal() {
            Ok((kind, body)) => {
                let request_id = body.id.unwrap_or(0);
                let ack = self.router.relay(identity, kind, body).await?;
                self.reply(handle, ack.to_frame(request_id));
                Ok(())
            }
            Err(Frame::CallInfo { id, call_id }) => {
                let snapshot = self.router.call_info(identity, &CallId::from(call_id)).await?;
                self.reply(handle, snapshot.to_frame(id));
                Ok(())
            }
            Err(Frame::Ping { timestamp }) => {
                // A ping is as good as a heartbeat.
                self.presence().heartbeat(identity)?;
                self.reply(handle, Frame::pong(timestamp));
                Ok(())
            }
            Err(Frame::Connect { .. }) => Err(SignalError::Unauthenticated(
                "already connected".into(),
            )),
            Err(other) => Err(SignalError::Malformed(format!(
                "unexpected {} frame from client",
                other.frame_type()
            ))),
        }
    }

    fn reply(&self, handle: &ConnectionHandle, frame: Frame) {
        if handle.send(frame).is_err() {
            debug!(connection = %handle.connection_id(), "Reply dropped: connection closed");
        }
    }

    /// Tear down a closed connection.
    ///
    /// The presence entry is removed only if it still belongs to this
    /// connection, which in turn ends its calls.
    pub fn on_close(&self, handle: &ConnectionHandle) {
        handle.close();
        if self.presence().unregister_connection(handle) {
            info!(
                connection = %handle.connection_id(),
                identity = %handle.identity(),
                "Client disconnected"
            );
        } else {
            debug!(connection = %handle.connection_id(), "Superseded connection closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditSink;
    use crate::presence::PresenceConfig;
    use crate::rate_limit::RateLimiter;
    use crate::router::RouterConfig;
    use crate::store::CallStore;
    use ringline_protocol::{SignalBody, PROTOCOL_VERSION};
    use serde_json::json;

    fn adapter() -> ConnectionAdapter {
        let router = SignalingRouter::new(
            Arc::new(PresenceRegistry::with_config(PresenceConfig::default())),
            Arc::new(RateLimiter::new()),
            Arc::new(CallStore::new(Arc::new(MemoryAuditSink::new()))),
            RouterConfig {
                presence_broadcast: false,
            },
        );
        ConnectionAdapter::new(Arc::new(router), Arc::new(TrustedTokenVerifier))
    }

    async fn connect(
        adapter: &ConnectionAdapter,
        identity: &str,
    ) -> (ConnectionHandle, mpsc::UnboundedReceiver<Frame>) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = adapter
            .handshake(
                &format!("conn-{identity}"),
                Frame::connect(PROTOCOL_VERSION.major, Some(identity.into())),
                tx,
            )
            .await
            .unwrap();
        assert!(matches!(rx.try_recv(), Ok(Frame::Connected { .. })));
        (handle, rx)
    }

    #[tokio::test]
    async fn test_handshake_connected_frame() {
        let adapter = adapter();
        let (tx, mut rx) = mpsc::unbounded_channel();
        adapter
            .handshake(
                "conn-1",
                Frame::connect(PROTOCOL_VERSION.major, Some("alice".into())),
                tx,
            )
            .await
            .unwrap();

        assert_eq!(
            rx.try_recv().unwrap(),
            Frame::connected("conn-1", "alice", PROTOCOL_VERSION.major, 10_000)
        );
    }

    #[tokio::test]
    async fn test_handshake_rejections() {
        let adapter = adapter();
        let (tx, _rx) = mpsc::unbounded_channel();

        let not_connect = adapter.handshake("c", Frame::ping(), tx.clone()).await;
        assert!(matches!(not_connect, Err(Frame::Error { code: 1007, .. })));

        let bad_version = adapter
            .handshake("c", Frame::connect(99, Some("alice".into())), tx.clone())
            .await;
        assert!(matches!(bad_version, Err(Frame::Error { code: 1007, .. })));

        let no_token = adapter
            .handshake("c", Frame::connect(PROTOCOL_VERSION.major, None), tx.clone())
            .await;
        assert!(matches!(no_token, Err(Frame::Error { code: 1007, .. })));

        let bad_identity = adapter
            .handshake("c", Frame::connect(PROTOCOL_VERSION.major, Some("a b".into())), tx)
            .await;
        assert!(matches!(bad_identity, Err(Frame::Error { code: 1002, .. })));

        assert!(adapter.router().presence().is_empty());
    }

    #[tokio::test]
    async fn test_signal_acked_with_request_id() {
        let adapter = adapter();
        let (alice, mut alice_rx) = connect(&adapter, "alice").await;
        let (_bob, mut bob_rx) = connect(&adapter, "bob").await;

        adapter
            .on_message(
                &alice,
                Frame::CallInitiate(SignalBody::initiate("bob", json!(null)).with_id(41)),
            )
            .await
            .unwrap();

        let call_id = match alice_rx.try_recv().unwrap() {
            Frame::Ack { id: 41, call_id: Some(call_id) } => call_id,
            other => panic!("Expected ack, got {:?}", other),
        };
        assert!(matches!(bob_rx.try_recv(), Ok(Frame::CallInitiate(_))));

        adapter
            .on_message(&alice, Frame::CallInfo { id: 42, call_id: call_id.clone() })
            .await
            .unwrap();
        match alice_rx.try_recv().unwrap() {
            Frame::CallState(body) => {
                assert_eq!(body.id, 42);
                assert_eq!(body.call_id, call_id);
                assert_eq!(body.state, "ringing");
            }
            other => panic!("Expected call-state, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_rejection_becomes_error_frame() {
        let adapter = adapter();
        let (alice, mut rx) = connect(&adapter, "alice").await;

        let result = adapter
            .on_message(
                &alice,
                Frame::Answer(SignalBody::for_call("call_nope", json!(null)).with_id(7)),
            )
            .await;
        assert!(matches!(result, Err(SignalError::InvalidState { .. })));

        match rx.try_recv().unwrap() {
            Frame::Error { id, code, call_id, .. } => {
                assert_eq!(id, 7);
                assert_eq!(code, ErrorCode::InvalidState.as_u16());
                assert_eq!(call_id.as_deref(), Some("call_nope"));
            }
            other => panic!("Expected error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_ping_and_unexpected_frames() {
        let adapter = adapter();
        let (alice, mut rx) = connect(&adapter, "alice").await;

        adapter
            .on_message(&alice, Frame::Ping { timestamp: Some(5) })
            .await
            .unwrap();
        assert_eq!(rx.try_recv().unwrap(), Frame::pong(Some(5)));

        let result = adapter.on_message(&alice, Frame::pong(None)).await;
        assert!(matches!(result, Err(SignalError::Malformed(_))));
        assert!(matches!(rx.try_recv(), Ok(Frame::Error { code: 1001, .. })));

        let result = adapter
            .on_message(&alice, Frame::connect(1, Some("alice".into())))
            .await;
        assert!(matches!(result, Err(SignalError::Unauthenticated(_))));
    }

    #[tokio::test]
    async fn test_reconnect_resumes_live_call() {
        let adapter = adapter();
        let (alice, mut alice_rx) = connect(&adapter, "alice").await;
        let (_bob, mut bob_rx) = connect(&adapter, "bob").await;

        adapter
            .on_message(&alice, Frame::CallInitiate(SignalBody::initiate("bob", json!(null))))
            .await
            .unwrap();
        let call_id = match alice_rx.try_recv().unwrap() {
            Frame::Ack { call_id: Some(call_id), .. } => call_id,
            other => panic!("Expected ack, got {:?}", other),
        };
        assert!(matches!(bob_rx.try_recv(), Ok(Frame::CallInitiate(_))));

        // Bob comes back on a new connection before the old one is gone.
        let (bob_again, mut bob_rx2) = connect(&adapter, "bob").await;
        match bob_rx2.try_recv().unwrap() {
            Frame::CallState(body) => {
                assert_eq!(body.id, 0);
                assert_eq!(body.call_id, call_id);
                assert_eq!(body.caller, "alice");
                assert_eq!(body.state, "ringing");
            }
            other => panic!("Expected call-state, got {:?}", other),
        }
        assert_eq!(
            alice_rx.try_recv().unwrap(),
            Frame::peer_reconnected(call_id.clone(), "bob")
        );
        assert!(matches!(bob_rx.try_recv(), Ok(Frame::Superseded { .. })));

        // The call carries on over the new connection.
        adapter
            .on_message(&bob_again, Frame::Answer(SignalBody::for_call(call_id, json!(null))))
            .await
            .unwrap();
        assert!(matches!(alice_rx.try_recv(), Ok(Frame::Answer(_))));
    }

    #[tokio::test]
    async fn test_close_of_superseded_connection_keeps_replacement() {
        let adapter = adapter();
        let (first, _rx1) = connect(&adapter, "alice").await;
        let (second, _rx2) = connect(&adapter, "alice").await;

        adapter.on_close(&first);
        assert!(adapter.router().presence().is_online(second.identity()));

        adapter.on_close(&second);
        assert!(!adapter.router().presence().is_online(second.identity()));
    }
}
