//! Sliding-window rate limiting.
//!
//! Each (subject, action class) pair owns an independent bucket holding the
//! instants of its admitted actions. An action is admitted while fewer than
//! `max` of them fall inside the trailing `window`, so no window of that
//! length ever holds more than `max` admitted actions.

use crate::call::CallId;
use crate::error::SignalError;
use crate::identity::Identity;
use crate::task::{ticker, TaskSlot};
use dashmap::DashMap;
use ringline_protocol::SignalKind;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

/// Class of action being limited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActionClass {
    CallInitiate,
    SignalingMessage,
    Heartbeat,
}

impl ActionClass {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionClass::CallInitiate => "call-initiate",
            ActionClass::SignalingMessage => "signaling-message",
            ActionClass::Heartbeat => "heartbeat",
        }
    }

    /// Class a signaling message is counted under.
    #[must_use]
    pub fn of(kind: SignalKind) -> Self {
        match kind {
            SignalKind::CallInitiate => ActionClass::CallInitiate,
            SignalKind::Heartbeat => ActionClass::Heartbeat,
            SignalKind::Offer
            | SignalKind::Answer
            | SignalKind::Candidate
            | SignalKind::Decline
            | SignalKind::Hangup => ActionClass::SignalingMessage,
        }
    }
}

impl fmt::Display for ActionClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who an action is counted against.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Subject {
    Identity(Identity),
    Call(CallId),
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Subject::Identity(identity) => write!(f, "{identity}"),
            Subject::Call(call_id) => write!(f, "call {call_id}"),
        }
    }
}

impl From<&Identity> for Subject {
    fn from(identity: &Identity) -> Self {
        Subject::Identity(identity.clone())
    }
}

impl From<&CallId> for Subject {
    fn from(call_id: &CallId) -> Self {
        Subject::Call(call_id.clone())
    }
}

/// At most `max` actions per `window`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateRule {
    pub window: Duration,
    pub max: u32,
}

impl RateRule {
    #[must_use]
    pub const fn new(max: u32, window: Duration) -> Self {
        Self { window, max }
    }
}

/// Rate limiter configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub call_initiate: RateRule,
    pub signaling_message: RateRule,
    pub heartbeat: RateRule,
    /// Signaling messages per call, across both participants.
    pub per_call: Option<RateRule>,
    /// Interval of the idle bucket purge.
    pub gc_interval: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            call_initiate: RateRule::new(5, Duration::from_secs(60)),
            signaling_message: RateRule::new(200, Duration::from_secs(10)),
            heartbeat: RateRule::new(20, Duration::from_secs(60)),
            per_call: Some(RateRule::new(400, Duration::from_secs(10))),
            gc_interval: Duration::from_secs(60),
        }
    }
}

impl RateLimitConfig {
    /// Rule for an action class.
    #[must_use]
    pub fn rule(&self, action: ActionClass) -> RateRule {
        match action {
            ActionClass::CallInitiate => self.call_initiate,
            ActionClass::SignalingMessage => self.signaling_message,
            ActionClass::Heartbeat => self.heartbeat,
        }
    }
}

/// Timestamps of the admitted actions still inside the window, oldest first.
#[derive(Debug, Default)]
struct Bucket {
    admitted: VecDeque<Instant>,
}

impl Bucket {
    /// Forget actions that fell out of the window ending at `now`.
    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(&oldest) = self.admitted.front() {
            if now.saturating_duration_since(oldest) < window {
                break;
            }
            self.admitted.pop_front();
        }
    }

    fn try_acquire(&mut self, now: Instant, rule: RateRule) -> bool {
        self.prune(now, rule.window);
        if self.admitted.len() >= rule.max as usize {
            return false;
        }
        self.admitted.push_back(now);
        true
    }
}

/// Per-subject sliding-window limiter.
pub struct RateLimiter {
    buckets: DashMap<(Subject, ActionClass), Bucket>,
    config: RateLimitConfig,
    gc: TaskSlot,
}

impl RateLimiter {
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(RateLimitConfig::default())
    }

    #[must_use]
    pub fn with_config(config: RateLimitConfig) -> Self {
        info!("Creating rate limiter with config: {:?}", config);
        Self {
            buckets: DashMap::new(),
            config,
            gc: TaskSlot::default(),
        }
    }

    #[must_use]
    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Count an action for `subject` under the class's configured rule.
    ///
    /// Returns `false` once the threshold is reached; the action is then
    /// not counted.
    pub fn allow(&self, subject: impl Into<Subject>, action: ActionClass) -> bool {
        self.allow_with(subject.into(), action, self.config.rule(action))
    }

    /// Count a signaling message against a call, if per-call limits are on.
    pub fn allow_call(&self, call_id: &CallId) -> bool {
        match self.config.per_call {
            Some(rule) => self.allow_with(Subject::from(call_id), ActionClass::SignalingMessage, rule),
            None => true,
        }
    }

    fn allow_with(&self, subject: Subject, action: ActionClass, rule: RateRule) -> bool {
        let now = Instant::now();
        let mut bucket = self
            .buckets
            .entry((subject, action))
            .or_default();
        let allowed = bucket.try_acquire(now, rule);
        if !allowed {
            debug!(subject = %bucket.key().0, %action, "Rate limit exceeded");
        }
        allowed
    }

    /// Like [`allow`](Self::allow), as a `Result`.
    ///
    /// # Errors
    ///
    /// Returns [`SignalError::RateLimited`] when the action is refused.
    pub fn check(&self, subject: impl Into<Subject>, action: ActionClass) -> Result<(), SignalError> {
        let subject = subject.into();
        if self.allow_with(subject.clone(), action, self.config.rule(action)) {
            Ok(())
        } else {
            Err(SignalError::RateLimited {
                subject: subject.to_string(),
                action,
            })
        }
    }

    /// Like [`allow_call`](Self::allow_call), as a `Result`.
    ///
    /// # Errors
    ///
    /// Returns [`SignalError::RateLimited`] when the call is over its limit.
    pub fn check_call(&self, call_id: &CallId) -> Result<(), SignalError> {
        if self.allow_call(call_id) {
            Ok(())
        } else {
            Err(SignalError::RateLimited {
                subject: Subject::from(call_id).to_string(),
                action: ActionClass::SignalingMessage,
            })
        }
    }

    /// Drop buckets with no admitted action left in their window. Returns
    /// how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.buckets.len();
        self.buckets.retain(|(subject, action), bucket| {
            let window = match subject {
                Subject::Call(_) => self
                    .config
                    .per_call
                    .map_or(self.config.signaling_message.window, |r| r.window),
                Subject::Identity(_) => self.config.rule(*action).window,
            };
            bucket.prune(now, window);
            !bucket.admitted.is_empty()
        });
        let purged = before.saturating_sub(self.buckets.len());
        if purged > 0 {
            debug!(purged, "Purged idle rate buckets");
        }
        purged
    }

    /// Number of live buckets.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Start the periodic purge.
    pub fn start(self: &Arc<Self>) {
        let limiter = Arc::downgrade(self);
        let period = self.config.gc_interval;
        let handle = tokio::spawn(async move {
            let mut interval = ticker(period);
            loop {
                interval.tick().await;
                let Some(limiter) = limiter.upgrade() else {
                    break;
                };
                limiter.purge_expired();
            }
        });
        self.gc.replace(handle);
    }

    pub fn stop(&self) {
        self.gc.abort();
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for RateLimiter {
    fn drop(&mut self) {
        self.gc.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(max: u32) -> RateLimiter {
        let rule = RateRule::new(max, Duration::from_secs(10));
        RateLimiter::with_config(RateLimitConfig {
            call_initiate: rule,
            signaling_message: rule,
            heartbeat: rule,
            per_call: Some(RateRule::new(3, Duration::from_secs(10))),
            gc_interval: Duration::from_secs(60),
        })
    }

    fn alice() -> Identity {
        Identity::parse("alice").unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_nth_allowed_next_refused() {
        let limiter = limiter(5);
        for _ in 0..5 {
            assert!(limiter.allow(&alice(), ActionClass::SignalingMessage));
        }
        assert!(!limiter.allow(&alice(), ActionClass::SignalingMessage));

        match limiter.check(&alice(), ActionClass::SignalingMessage) {
            Err(SignalError::RateLimited { subject, action }) => {
                assert_eq!(subject, "alice");
                assert_eq!(action, ActionClass::SignalingMessage);
            }
            other => panic!("Expected RateLimited, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_subjects_and_classes_are_independent() {
        let limiter = limiter(1);
        let bob = Identity::parse("bob").unwrap();

        assert!(limiter.allow(&alice(), ActionClass::SignalingMessage));
        assert!(!limiter.allow(&alice(), ActionClass::SignalingMessage));
        assert!(limiter.allow(&alice(), ActionClass::Heartbeat));
        assert!(limiter.allow(&bob, ActionClass::SignalingMessage));
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_slides() {
        let limiter = limiter(4);
        assert!(limiter.allow(&alice(), ActionClass::CallInitiate));
        tokio::time::advance(Duration::from_secs(4)).await;
        for _ in 0..3 {
            assert!(limiter.allow(&alice(), ActionClass::CallInitiate));
        }
        assert!(!limiter.allow(&alice(), ActionClass::CallInitiate));

        // The first action leaves the window; the other three are still in it.
        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(limiter.allow(&alice(), ActionClass::CallInitiate));
        assert!(!limiter.allow(&alice(), ActionClass::CallInitiate));

        tokio::time::advance(Duration::from_secs(10)).await;
        for _ in 0..4 {
            assert!(limiter.allow(&alice(), ActionClass::CallInitiate));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_across_window_boundary() {
        let limiter = limiter(10);
        let mut admitted = Vec::new();

        if limiter.allow(&alice(), ActionClass::SignalingMessage) {
            admitted.push(Instant::now());
        }
        tokio::time::advance(Duration::from_millis(9_900)).await;
        for _ in 0..9 {
            assert!(limiter.allow(&alice(), ActionClass::SignalingMessage));
            admitted.push(Instant::now());
        }

        tokio::time::advance(Duration::from_millis(9_100)).await;
        let start = Instant::now();
        for _ in 0..20 {
            if limiter.allow(&alice(), ActionClass::SignalingMessage) {
                admitted.push(Instant::now());
            }
        }

        // Only the slot freed by the action at t=0 is available at t=19s.
        let window = Duration::from_secs(10);
        let in_window = admitted
            .iter()
            .filter(|t| start.saturating_duration_since(**t) < window)
            .count();
        assert_eq!(in_window, 10);
        assert_eq!(admitted.len(), 11);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refused_actions_are_not_counted() {
        let limiter = limiter(2);
        assert!(limiter.allow(&alice(), ActionClass::Heartbeat));
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(limiter.allow(&alice(), ActionClass::Heartbeat));
        for _ in 0..10 {
            assert!(!limiter.allow(&alice(), ActionClass::Heartbeat));
        }

        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(limiter.allow(&alice(), ActionClass::Heartbeat));
    }

    #[tokio::test(start_paused = true)]
    async fn test_per_call_limit() {
        let limiter = limiter(100);
        let call = CallId::from("call_1");
        for _ in 0..3 {
            assert!(limiter.check_call(&call).is_ok());
        }
        assert!(matches!(
            limiter.check_call(&call),
            Err(SignalError::RateLimited { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_expired() {
        let limiter = limiter(5);
        limiter.allow(&alice(), ActionClass::Heartbeat);
        limiter.allow(&CallId::from("call_1"), ActionClass::SignalingMessage);
        assert_eq!(limiter.len(), 2);

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(limiter.purge_expired(), 0);
        assert_eq!(limiter.len(), 2);

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(limiter.purge_expired(), 2);
        assert!(limiter.is_empty());
    }

    #[test]
    fn test_action_classes() {
        assert_eq!(ActionClass::of(SignalKind::CallInitiate), ActionClass::CallInitiate);
        assert_eq!(ActionClass::of(SignalKind::Answer), ActionClass::SignalingMessage);
        assert_eq!(ActionClass::of(SignalKind::Heartbeat), ActionClass::Heartbeat);
        assert_eq!(ActionClass::CallInitiate.to_string(), "call-initiate");
    }
}
