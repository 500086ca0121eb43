//! Signaling router for Ringline.
//!
//! The router validates each signaling message against its call's state
//! machine, relays it to the other participant and commits the resulting
//! transition. Payloads are never inspected; only the message type drives
//! the state machine.

use crate::call::{CallId, CallSnapshot, CallState, EndReason, Role};
use crate::error::SignalError;
use crate::identity::Identity;
use crate::presence::{PresenceEvent, PresenceRegistry};
use crate::rate_limit::{ActionClass, RateLimiter};
use crate::store::{CallGuard, CallStore, Termination};
use crate::task::TaskSlot;
use ringline_protocol::{Frame, SignalBody, SignalKind};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, trace, warn};

/// Router configuration.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Fan presence changes out to every other online connection.
    pub presence_broadcast: bool,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            presence_broadcast: true,
        }
    }
}

/// Successful relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ack {
    /// Call the message belonged to; assigned by the server for `call-initiate`.
    pub call_id: Option<CallId>,
}

impl Ack {
    /// Build the `ack` frame answering request `request_id`.
    #[must_use]
    pub fn to_frame(&self, request_id: u64) -> Frame {
        Frame::ack(request_id, self.call_id.as_ref().map(ToString::to_string))
    }
}

/// What an accepted message does to its call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    /// Relay only; counts as activity.
    Activity,
    /// Relay, then move the call to a new state.
    Advance(CallState, Option<EndReason>),
}

/// Decide what `kind` from `role` does to a call in `state`.
///
/// # Errors
///
/// Returns a description of the violation when the message is not valid.
pub fn plan(kind: SignalKind, role: Role, state: CallState) -> Result<Effect, String> {
    use CallState::{Connected, Ended, Ringing};

    if state.is_terminal() {
        return Err(format!("call is {state}"));
    }

    match (kind, state) {
        (SignalKind::Offer | SignalKind::Candidate, Ringing | Connected) => Ok(Effect::Activity),
        (SignalKind::Answer, Ringing) if role == Role::Callee => Ok(Effect::Advance(Connected, None)),
        (SignalKind::Decline, Ringing) if role == Role::Callee => {
            Ok(Effect::Advance(Ended, Some(EndReason::Declined)))
        }
        (SignalKind::Hangup, Ringing | Connected) => {
            Ok(Effect::Advance(Ended, Some(EndReason::Hangup)))
        }
        (SignalKind::Answer | SignalKind::Decline, Ringing) => {
            Err(format!("only the callee may {kind}"))
        }
        _ => Err(format!("{kind} is not valid while {state}")),
    }
}

/// Router statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouterStats {
    pub online: usize,
    pub live_calls: usize,
    pub retained_calls: usize,
    pub invariant_violations: u64,
}

/// Routes signaling between the participants of a call.
pub struct SignalingRouter {
    presence: Arc<PresenceRegistry>,
    limiter: Arc<RateLimiter>,
    calls: Arc<CallStore>,
    config: RouterConfig,
    events: TaskSlot,
}

impl SignalingRouter {
    #[must_use]
    pub fn new(
        presence: Arc<PresenceRegistry>,
        limiter: Arc<RateLimiter>,
        calls: Arc<CallStore>,
        config: RouterConfig,
    ) -> Self {
        info!("Creating signaling router with config: {:?}", config);
        Self {
            presence,
            limiter,
            calls,
            config,
            events: TaskSlot::default(),
        }
    }

    #[must_use]
    pub fn presence(&self) -> &Arc<PresenceRegistry> {
        &self.presence
    }

    #[must_use]
    pub fn calls(&self) -> &Arc<CallStore> {
        &self.calls
    }

    #[must_use]
    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Relay a signaling message from `sender`.
    ///
    /// Returns an [`Ack`] only once the message was accepted by the call's
    /// state machine and delivered to the other participant.
    ///
    /// # Errors
    ///
    /// Returns the specific rejection otherwise; see [`SignalError`].
    pub async fn relay(
        &self,
        sender: &Identity,
        kind: SignalKind,
        body: SignalBody,
    ) -> Result<Ack, SignalError> {
        trace!(sender = %sender, %kind, "Relay");
        match kind {
            SignalKind::Heartbeat => {
                self.limiter.check(sender, ActionClass::Heartbeat)?;
                self.presence.heartbeat(sender)?;
                Ok(Ack { call_id: None })
            }
            SignalKind::CallInitiate => self.initiate(sender, body).await,
            _ => self.relay_in_call(sender, kind, body).await,
        }
    }

    async fn initiate(&self, caller: &Identity, body: SignalBody) -> Result<Ack, SignalError> {
        let target = body
            .target
            .as_deref()
            .ok_or_else(|| SignalError::Malformed("call-initiate requires a target".into()))?;
        let callee = Identity::parse(target)
            .map_err(|_| SignalError::Malformed(format!("invalid target {target:?}")))?;

        if callee == *caller {
            return Err(SignalError::invalid_state(None, "cannot call yourself"));
        }

        self.limiter.check(caller, ActionClass::CallInitiate)?;

        if !self.presence.is_online(caller) {
            return Err(SignalError::NotFound(format!("no connection for {caller}")));
        }

        let mut guard = self.calls.create(caller.clone(), callee.clone()).await;
        let call_id = guard.id().clone();

        let notice = Frame::CallInitiate(SignalBody {
            id: None,
            call_id: Some(call_id.to_string()),
            target: Some(callee.to_string()),
            from: Some(caller.to_string()),
            payload: body.payload,
        });

        if self.deliver(&callee, notice) {
            guard.transition(CallState::Ringing, None)?;
            info!(call_id = %call_id, caller = %caller, callee = %callee, "Call ringing");
            Ok(Ack {
                call_id: Some(call_id),
            })
        } else {
            guard.transition(CallState::Failed, Some(EndReason::CalleeUnreachable))?;
            info!(call_id = %call_id, callee = %callee, "Call failed: callee unreachable");
            Err(SignalError::UnreachablePeer {
                call_id: Some(call_id),
                identity: callee,
            })
        }
    }

    async fn relay_in_call(
        &self,
        sender: &Identity,
        kind: SignalKind,
        body: SignalBody,
    ) -> Result<Ack, SignalError> {
        let call_id = body
            .call_id
            .as_deref()
            .map(CallId::from)
            .ok_or_else(|| SignalError::Malformed(format!("{kind} requires a call_id")))?;

        // Non-participants see the same rejection as for an unknown call.
        let unknown = || SignalError::invalid_state(Some(&call_id), format!("unknown call {call_id}"));
        match self.calls.participants(&call_id) {
            Some((caller, callee)) if caller == *sender || callee == *sender => {}
            _ => return Err(unknown()),
        }

        self.limiter.check(sender, ActionClass::of(kind))?;
        self.limiter.check_call(&call_id)?;

        let mut guard = self.calls.lock(&call_id).await?;
        let role = guard.session().role_of(sender).ok_or_else(unknown)?;
        let effect = plan(kind, role, guard.state()).map_err(|message| {
            debug!(call_id = %call_id, sender = %sender, %kind, state = %guard.state(), "Rejected: {}", message);
            SignalError::invalid_state(Some(&call_id), message)
        })?;

        let peer = guard
            .session()
            .peer_of(sender)
            .cloned()
            .ok_or_else(unknown)?;

        let frame = Frame::from_signal(
            kind,
            SignalBody {
                id: None,
                call_id: Some(call_id.to_string()),
                target: None,
                from: Some(sender.to_string()),
                payload: body.payload,
            },
        );
        let delivered = self.deliver(&peer, frame);

        match effect {
            Effect::Advance(CallState::Ended, reason) => {
                guard.transition(CallState::Ended, reason)?;
            }
            Effect::Advance(to, reason) if delivered => {
                guard.transition(to, reason)?;
            }
            Effect::Activity if delivered => guard.touch(),
            Effect::Advance(..) | Effect::Activity => {
                self.peer_lost(&mut guard, &peer)?;
            }
        }

        if delivered {
            Ok(Ack {
                call_id: Some(call_id),
            })
        } else {
            Err(SignalError::UnreachablePeer {
                call_id: Some(call_id),
                identity: peer,
            })
        }
    }

    fn peer_lost(&self, guard: &mut CallGuard, peer: &Identity) -> Result<(), SignalError> {
        guard.transition(CallState::Ended, Some(EndReason::PeerUnreachable))?;
        info!(call_id = %guard.id(), peer = %peer, "Call ended: peer unreachable");
        Ok(())
    }

    /// Queue a frame for `identity`. Returns whether it was accepted.
    fn deliver(&self, identity: &Identity, frame: Frame) -> bool {
        let Some(connection) = self.presence.lookup(identity) else {
            debug!(identity = %identity, "Delivery failed: not present");
            return false;
        };
        match connection.send(frame) {
            Ok(()) => true,
            Err(e) => {
                debug!(identity = %identity, "{}", e);
                false
            }
        }
    }

    /// Snapshot of a call for one of its participants.
    ///
    /// # Errors
    ///
    /// Returns [`SignalError::InvalidState`] if the call is unknown to
    /// `identity`.
    pub async fn call_info(
        &self,
        identity: &Identity,
        call_id: &CallId,
    ) -> Result<CallSnapshot, SignalError> {
        let unknown = || SignalError::invalid_state(Some(call_id), format!("unknown call {call_id}"));
        match self.calls.participants(call_id) {
            Some((caller, callee)) if caller == *identity || callee == *identity => {}
            _ => return Err(unknown()),
        }
        self.calls.info(call_id).await.ok_or_else(unknown)
    }

    #[must_use]
    pub fn stats(&self) -> RouterStats {
        let store = self.calls.stats();
        RouterStats {
            online: self.presence.len(),
            live_calls: store.live,
            retained_calls: store.retained,
            invariant_violations: store.invariant_violations,
        }
    }

    /// Bring an identity that just registered up to date on its live calls.
    ///
    /// The new connection gets an unsolicited `call-state` snapshot of each
    /// call and the other participant a `peer-reconnected` notice. Frames
    /// relayed while the identity was away are not replayed. Returns how many
    /// calls were resumed.
    pub async fn resume(&self, identity: &Identity) -> usize {
        let mut resumed = 0;
        for call_id in self.calls.calls_for(identity) {
            let Ok(guard) = self.calls.lock(&call_id).await else {
                continue;
            };
            if guard.state().is_terminal() {
                continue;
            }
            let session = guard.session();
            self.deliver(identity, session.snapshot().to_frame(0));
            if let Some(peer) = session.peer_of(identity) {
                self.deliver(
                    peer,
                    Frame::peer_reconnected(call_id.to_string(), identity.to_string()),
                );
            }
            resumed += 1;
        }
        if resumed > 0 {
            info!(identity = %identity, calls = resumed, "Resumed live calls after reconnect");
        }
        resumed
    }

    /// React to a presence change.
    ///
    /// An `Offline` event for an identity that has registered again since is
    /// stale and ignored.
    pub async fn on_presence_event(&self, event: PresenceEvent) {
        if let PresenceEvent::Offline { identity, .. } = &event {
            if self.presence.is_online(identity) {
                debug!(identity = %identity, "Ignoring offline event: registered again");
                return;
            }
            for call_id in self.calls.calls_for(identity) {
                self.end_call(&call_id, identity).await;
            }
        }

        if self.config.presence_broadcast {
            let identity = event.identity();
            let frame = Frame::presence(identity.to_string(), event.peer_status());
            for connection in self.presence.connections() {
                if connection.identity() != identity {
                    let _ = connection.send(frame.clone());
                }
            }
        }
    }

    /// End `call_id` because `lost` is gone, and tell the other side.
    async fn end_call(&self, call_id: &CallId, lost: &Identity) {
        let Ok(mut guard) = self.calls.lock(call_id).await else {
            return;
        };
        if guard.state().is_terminal() {
            return;
        }
        let peer = guard.session().peer_of(lost).cloned();
        if self.peer_lost(&mut guard, lost).is_ok() {
            if let Some(peer) = peer {
                self.deliver(
                    &peer,
                    Frame::call_ended(call_id.to_string(), EndReason::PeerUnreachable.as_str()),
                );
            }
        }
    }

    /// Tell both participants about a store-initiated termination.
    pub fn on_termination(&self, termination: &Termination) {
        let frame = Frame::call_ended(
            termination.call_id.to_string(),
            termination.reason.as_str(),
        );
        self.deliver(&termination.caller, frame.clone());
        self.deliver(&termination.callee, frame);
    }

    /// End every live call with a participant that is no longer present.
    ///
    /// Used when presence events were missed.
    pub async fn reconcile(&self) -> usize {
        let mut ended = 0;
        for (call_id, caller, callee) in self.calls.live_calls() {
            for identity in [&caller, &callee] {
                if !self.presence.is_online(identity) {
                    self.end_call(&call_id, identity).await;
                    ended += 1;
                    break;
                }
            }
        }
        if ended > 0 {
            warn!(ended, "Reconciled calls with absent participants");
        }
        ended
    }

    /// Start consuming presence events and store terminations.
    pub fn start(self: &Arc<Self>) {
        let mut presence = self.presence.subscribe();
        let mut terminations = self.calls.subscribe_terminations();
        let router = Arc::downgrade(self);

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = presence.recv() => {
                        let Some(router) = router.upgrade() else { break };
                        match event {
                            Ok(event) => router.on_presence_event(event).await,
                            Err(RecvError::Lagged(missed)) => {
                                warn!(missed, "Presence events lagged, reconciling");
                                router.reconcile().await;
                            }
                            Err(RecvError::Closed) => break,
                        }
                    }
                    termination = terminations.recv() => {
                        let Some(router) = router.upgrade() else { break };
                        match termination {
                            Ok(termination) => router.on_termination(&termination),
                            Err(RecvError::Lagged(missed)) => {
                                warn!(missed, "Call terminations lagged, notices lost");
                            }
                            Err(RecvError::Closed) => break,
                        }
                    }
                }
            }
            debug!("Router event loop stopped");
        });
        self.events.replace(handle);
        info!("Signaling router started");
    }

    pub fn stop(&self) {
        self.events.abort();
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.events.is_running()
    }
}

impl Drop for SignalingRouter {
    fn drop(&mut self) {
        self.events.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditSink;
    use crate::connection::ConnectionHandle;
    use crate::presence::PresenceConfig;
    use crate::store::CallConfig;
    use serde_json::json;
    use tokio::sync::mpsc;

    struct Client {
        handle: ConnectionHandle,
        rx: mpsc::UnboundedReceiver<Frame>,
    }

    impl Client {
        fn identity(&self) -> &Identity {
            self.handle.identity()
        }

        fn frames(&mut self) -> Vec<Frame> {
            let mut frames = Vec::new();
            while let Ok(frame) = self.rx.try_recv() {
                frames.push(frame);
            }
            frames
        }
    }

    fn router(broadcast: bool) -> SignalingRouter {
        SignalingRouter::new(
            Arc::new(PresenceRegistry::with_config(PresenceConfig::default())),
            Arc::new(RateLimiter::new()),
            Arc::new(CallStore::with_config(
                CallConfig::default(),
                Arc::new(MemoryAuditSink::new()),
            )),
            RouterConfig {
                presence_broadcast: broadcast,
            },
        )
    }

    fn connect(router: &SignalingRouter, identity: &str) -> Client {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = router
            .presence()
            .register(identity, format!("conn-{identity}"), tx)
            .unwrap();
        Client { handle, rx }
    }

    async fn ringing(router: &SignalingRouter, caller: &Client, callee: &mut Client) -> CallId {
        let ack = router
            .relay(
                caller.identity(),
                SignalKind::CallInitiate,
                SignalBody::initiate(callee.identity().as_str(), json!(null)),
            )
            .await
            .unwrap();
        callee.frames();
        ack.call_id.unwrap()
    }

    #[test]
    fn test_plan_table() {
        use CallState::*;
        use Role::*;

        assert_eq!(plan(SignalKind::Offer, Caller, Ringing), Ok(Effect::Activity));
        assert_eq!(plan(SignalKind::Candidate, Callee, Connected), Ok(Effect::Activity));
        assert_eq!(
            plan(SignalKind::Answer, Callee, Ringing),
            Ok(Effect::Advance(Connected, None))
        );
        assert!(plan(SignalKind::Answer, Caller, Ringing).is_err());
        assert!(plan(SignalKind::Answer, Callee, Connected).is_err());
        assert_eq!(
            plan(SignalKind::Decline, Callee, Ringing),
            Ok(Effect::Advance(Ended, Some(EndReason::Declined)))
        );
        assert!(plan(SignalKind::Decline, Callee, Connected).is_err());
        assert_eq!(
            plan(SignalKind::Hangup, Caller, Connected),
            Ok(Effect::Advance(Ended, Some(EndReason::Hangup)))
        );
        assert!(plan(SignalKind::Hangup, Caller, Ended).is_err());
        assert!(plan(SignalKind::Offer, Callee, Failed).is_err());
    }

    #[tokio::test]
    async fn test_initiate_notifies_callee() {
        let router = router(false);
        let alice = connect(&router, "alice");
        let mut bob = connect(&router, "bob");

        let ack = router
            .relay(
                alice.identity(),
                SignalKind::CallInitiate,
                SignalBody::initiate("bob", json!({"video": true})).with_id(1),
            )
            .await
            .unwrap();
        let call_id = ack.call_id.unwrap();

        match bob.frames().as_slice() {
            [Frame::CallInitiate(body)] => {
                assert_eq!(body.call_id.as_deref(), Some(call_id.as_str()));
                assert_eq!(body.from.as_deref(), Some("alice"));
                assert_eq!(body.payload, json!({"video": true}));
            }
            other => panic!("Expected one call-initiate, got {:?}", other),
        }
        assert_eq!(
            router.calls().info(&call_id).await.unwrap().state,
            CallState::Ringing
        );
    }

    #[tokio::test]
    async fn test_initiate_offline_callee_fails() {
        let router = router(false);
        let alice = connect(&router, "alice");

        match router
            .relay(
                alice.identity(),
                SignalKind::CallInitiate,
                SignalBody::initiate("bob", json!(null)),
            )
            .await
        {
            Err(SignalError::UnreachablePeer {
                call_id: Some(call_id),
                identity,
            }) => {
                assert_eq!(identity.as_str(), "bob");
                let info = router.calls().info(&call_id).await.unwrap();
                assert_eq!(info.state, CallState::Failed);
                assert_eq!(info.reason, Some(EndReason::CalleeUnreachable));
            }
            other => panic!("Expected UnreachablePeer, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_initiate_rejections() {
        let router = router(false);
        let alice = connect(&router, "alice");

        let self_call = router
            .relay(
                alice.identity(),
                SignalKind::CallInitiate,
                SignalBody::initiate("alice", json!(null)),
            )
            .await;
        assert!(matches!(self_call, Err(SignalError::InvalidState { .. })));

        let no_target = router
            .relay(alice.identity(), SignalKind::CallInitiate, SignalBody::default())
            .await;
        assert!(matches!(no_target, Err(SignalError::Malformed(_))));

        assert!(router.calls().is_empty());
    }

    #[tokio::test]
    async fn test_non_participant_rejected() {
        let router = router(false);
        let alice = connect(&router, "alice");
        let mut bob = connect(&router, "bob");
        let mallory = connect(&router, "mallory");
        let call_id = ringing(&router, &alice, &mut bob).await;

        let result = router
            .relay(
                mallory.identity(),
                SignalKind::Hangup,
                SignalBody::for_call(call_id.as_str(), json!(null)),
            )
            .await;
        assert!(matches!(result, Err(SignalError::InvalidState { .. })));
        assert!(bob.frames().is_empty());
        assert!(router
            .call_info(mallory.identity(), &call_id)
            .await
            .is_err());
        assert_eq!(
            router.call_info(bob.identity(), &call_id).await.unwrap().state,
            CallState::Ringing
        );
    }

    #[tokio::test]
    async fn test_decline_by_callee() {
        let router = router(false);
        let mut alice = connect(&router, "alice");
        let mut bob = connect(&router, "bob");
        let call_id = ringing(&router, &alice, &mut bob).await;

        // The caller cannot decline its own call.
        let result = router
            .relay(
                alice.identity(),
                SignalKind::Decline,
                SignalBody::for_call(call_id.as_str(), json!(null)),
            )
            .await;
        assert!(matches!(result, Err(SignalError::InvalidState { .. })));

        router
            .relay(
                bob.identity(),
                SignalKind::Decline,
                SignalBody::for_call(call_id.as_str(), json!({"why": "busy"})),
            )
            .await
            .unwrap();

        assert!(matches!(alice.frames().as_slice(), [Frame::Decline(_)]));
        let info = router.calls().info(&call_id).await.unwrap();
        assert_eq!(info.reason, Some(EndReason::Declined));
    }

    #[tokio::test]
    async fn test_answer_to_departed_caller() {
        let router = router(false);
        let alice = connect(&router, "alice");
        let mut bob = connect(&router, "bob");
        let call_id = ringing(&router, &alice, &mut bob).await;

        // Drop the caller's driver without unregistering.
        drop(alice.rx);

        let result = router
            .relay(
                bob.identity(),
                SignalKind::Answer,
                SignalBody::for_call(call_id.as_str(), json!({"sdp": "answer"})),
            )
            .await;
        assert!(matches!(result, Err(SignalError::UnreachablePeer { .. })));

        let info = router.calls().info(&call_id).await.unwrap();
        assert_eq!(info.state, CallState::Ended);
        assert_eq!(info.reason, Some(EndReason::PeerUnreachable));
    }

    #[tokio::test]
    async fn test_hangup_commits_even_if_undelivered() {
        let router = router(false);
        let mut alice = connect(&router, "alice");
        let mut bob = connect(&router, "bob");
        let call_id = ringing(&router, &alice, &mut bob).await;
        alice.frames();

        drop(bob.rx);
        let result = router
            .relay(
                alice.identity(),
                SignalKind::Hangup,
                SignalBody::for_call(call_id.as_str(), json!(null)),
            )
            .await;
        assert!(matches!(result, Err(SignalError::UnreachablePeer { .. })));
        assert_eq!(
            router.calls().info(&call_id).await.unwrap().reason,
            Some(EndReason::Hangup)
        );
    }

    #[tokio::test]
    async fn test_heartbeat() {
        let router = router(false);
        let alice = connect(&router, "alice");

        let ack = router
            .relay(alice.identity(), SignalKind::Heartbeat, SignalBody::default())
            .await
            .unwrap();
        assert_eq!(ack, Ack { call_id: None });

        let ghost = Identity::parse("ghost").unwrap();
        let result = router
            .relay(&ghost, SignalKind::Heartbeat, SignalBody::default())
            .await;
        assert!(matches!(result, Err(SignalError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_offline_ends_calls_and_broadcasts() {
        let router = router(true);
        let alice = connect(&router, "alice");
        let mut bob = connect(&router, "bob");
        let call_id = ringing(&router, &alice, &mut bob).await;

        router.presence().unregister(alice.identity());
        router
            .on_presence_event(PresenceEvent::Offline {
                identity: alice.identity().clone(),
                reason: crate::presence::OfflineReason::Disconnected,
            })
            .await;

        let frames = bob.frames();
        assert!(frames.contains(&Frame::call_ended(call_id.as_str(), "peer_unreachable")));
        assert!(frames.contains(&Frame::presence(
            "alice",
            ringline_protocol::PeerStatus::Offline
        )));
        assert_eq!(router.stats().live_calls, 0);
    }

    #[tokio::test]
    async fn test_reconcile_ends_orphaned_calls() {
        let router = router(false);
        let alice = connect(&router, "alice");
        let mut bob = connect(&router, "bob");
        let call_id = ringing(&router, &alice, &mut bob).await;

        // Registry change without the event reaching the router.
        router.presence().unregister(alice.identity());
        assert_eq!(router.reconcile().await, 1);
        assert_eq!(
            bob.frames(),
            vec![Frame::call_ended(call_id.as_str(), "peer_unreachable")]
        );
    }

    #[tokio::test]
    async fn test_stale_offline_after_fast_reconnect() {
        let router = router(true);
        let mut alice = connect(&router, "alice");
        let mut bob = connect(&router, "bob");
        let call_id = ringing(&router, &alice, &mut bob).await;
        alice.frames();

        // Bob drops and is back before the offline event is handled.
        router.presence().unregister(bob.identity());
        let mut bob = connect(&router, "bob");
        assert_eq!(router.resume(bob.identity()).await, 1);

        router
            .on_presence_event(PresenceEvent::Offline {
                identity: bob.identity().clone(),
                reason: crate::presence::OfflineReason::Disconnected,
            })
            .await;

        assert_eq!(router.stats().live_calls, 1);
        assert_eq!(
            alice.frames(),
            vec![Frame::peer_reconnected(call_id.as_str(), "bob")]
        );
        match bob.frames().as_slice() {
            [Frame::CallState(body)] => {
                assert_eq!(body.call_id, call_id.as_str());
                assert_eq!(body.state, "ringing");
            }
            other => panic!("Expected one call-state, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_resume_without_calls() {
        let router = router(false);
        let mut alice = connect(&router, "alice");
        assert_eq!(router.resume(alice.identity()).await, 0);
        assert!(alice.frames().is_empty());
    }
}
