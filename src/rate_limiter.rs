//! Rate Limiter - fixed-window counters in the key-value store
//!
//! Every request passes two scopes: the global one, then the scope of the
//! endpoint it targets. Counting happens in one atomic
//! [`check_and_increment`](KeyValueStore::check_and_increment) call per scope,
//! so concurrent requests never overshoot a limit.
//!
//! When the counter store itself is unreachable the limiter fails open by
//! default: the request proceeds and the failure is logged.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::Result;
use tracing::{debug, error, warn};

use crate::error::StakeError;
use crate::models::OwnerId;
use crate::traits::KeyValueStore;

/// A named limit bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RateLimitScope {
    /// Applied to every request before its endpoint scope
    Global,
    Auth,
    StakeCreate,
    StakeGet,
}

impl RateLimitScope {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Global => "global",
            Self::Auth => "auth",
            Self::StakeCreate => "stake-create",
            Self::StakeGet => "stake-get",
        }
    }

    /// Built-in limits: global 100, auth 10, stake-create 20, stake-get 60,
    /// each per 60 seconds
    #[must_use]
    pub fn default_rules() -> HashMap<Self, RateLimitRule> {
        let minute = Duration::from_secs(60);
        HashMap::from([
            (Self::Global, RateLimitRule::new(100, minute)),
            (Self::Auth, RateLimitRule::new(10, minute)),
            (Self::StakeCreate, RateLimitRule::new(20, minute)),
            (Self::StakeGet, RateLimitRule::new(60, minute)),
        ])
    }
}

impl fmt::Display for RateLimitScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Maximum requests per fixed window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitRule {
    pub limit: u64,
    pub window: Duration,
}

impl RateLimitRule {
    #[must_use]
    pub const fn new(limit: u64, window: Duration) -> Self {
        Self { limit, window }
    }
}

/// What a scope decides when the counter store errors
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LimiterFailurePolicy {
    /// Let the request through and log the failure
    #[default]
    FailOpen,
    /// Report the scope as exceeded
    FailClosed,
}

/// Who a counter belongs to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Subject {
    User(OwnerId),
    Origin(String),
}

impl Subject {
    /// Counter key segment: `user:<id>` or `ip:<origin>`
    #[must_use]
    pub fn key(&self) -> String {
        match self {
            Self::User(id) => format!("user:{id}"),
            Self::Origin(origin) => format!("ip:{origin}"),
        }
    }
}

/// Caller identity as seen by the limiter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    /// Authenticated user, if any
    pub user_id: Option<OwnerId>,
    /// Network origin of the request
    pub origin: String,
}

impl RequestContext {
    pub fn anonymous(origin: impl Into<String>) -> Self {
        Self {
            user_id: None,
            origin: origin.into(),
        }
    }

    pub fn authenticated(user_id: OwnerId, origin: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id),
            origin: origin.into(),
        }
    }

    /// The user when known, the origin otherwise
    #[must_use]
    pub fn subject(&self) -> Subject {
        match self.user_id {
            Some(id) => Subject::User(id),
            None => Subject::Origin(self.origin.clone()),
        }
    }
}

/// Outcome of one scope check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    pub scope: RateLimitScope,
    pub allowed: bool,
    /// Counter value after this check
    pub count: u64,
    pub limit: u64,
    /// Time until the window resets, when known
    pub resets_in: Option<Duration>,
    /// The counter store failed and the decision came from the failure policy
    pub degraded: bool,
}

impl RateDecision {
    /// Requests left in the current window
    #[must_use]
    pub fn remaining(&self) -> u64 {
        self.limit.saturating_sub(self.count)
    }

    /// Whole seconds until the window resets, at least 1
    #[must_use]
    pub fn retry_after_secs(&self) -> u64 {
        self.resets_in
            .map_or(1, |d| d.as_secs() + u64::from(d.subsec_nanos() > 0))
            .max(1)
    }
}

/// Decision counters
#[derive(Debug, Default)]
pub(crate) struct LimiterCounters {
    pub(crate) rejected: AtomicU64,
    pub(crate) fail_open: AtomicU64,
}

/// Fixed-window rate limiter
///
/// **Example**:
/// ```rust
/// use stake_cache::backends::MemoryStore;
/// use stake_cache::{RateLimitScope, RateLimiter, RequestContext};
/// use std::sync::Arc;
///
/// # async fn example() -> stake_cache::Result<()> {
/// let limiter = RateLimiter::new(Arc::new(MemoryStore::new()));
/// let ctx = RequestContext::authenticated(7, "10.0.0.1");
/// let decision = limiter.apply(&ctx, RateLimitScope::StakeGet).await?;
/// assert!(decision.allowed);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct RateLimiter {
    kv: Arc<dyn KeyValueStore>,
    rules: Arc<HashMap<RateLimitScope, RateLimitRule>>,
    failure_policy: LimiterFailurePolicy,
    counters: Arc<LimiterCounters>,
}

impl RateLimiter {
    /// Limiter with the built-in rules, failing open
    #[must_use]
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self::with_rules(kv, RateLimitScope::default_rules(), LimiterFailurePolicy::FailOpen)
    }

    #[must_use]
    pub fn with_rules(
        kv: Arc<dyn KeyValueStore>,
        rules: HashMap<RateLimitScope, RateLimitRule>,
        failure_policy: LimiterFailurePolicy,
    ) -> Self {
        Self {
            kv,
            rules: Arc::new(rules),
            failure_policy,
            counters: Arc::new(LimiterCounters::default()),
        }
    }

    /// Counter key for one scope and subject
    #[must_use]
    pub fn counter_key(scope: RateLimitScope, subject_key: &str) -> String {
        format!("ratelimit:{scope}:{subject_key}")
    }

    /// Count one request against `scope` for `subject_key`
    ///
    /// At or over `limit` nothing is mutated and the decision is not allowed.
    ///
    /// # Errors
    ///
    /// Returns the counter store's error unchanged; no failure policy is
    /// applied at this level.
    pub async fn check(
        &self,
        scope: RateLimitScope,
        subject_key: &str,
        limit: u64,
        window: Duration,
    ) -> Result<RateDecision> {
        let key = Self::counter_key(scope, subject_key);
        let state = self.kv.check_and_increment(&key, limit, window).await?;
        Ok(RateDecision {
            scope,
            allowed: state.allowed,
            count: state.count,
            limit,
            resets_in: state.resets_in,
            degraded: false,
        })
    }

    /// Check `scope` under the configured rule and failure policy
    async fn evaluate(&self, scope: RateLimitScope, subject_key: &str) -> Option<RateDecision> {
        let Some(rule) = self.rules.get(&scope).copied() else {
            debug!(scope = %scope, "No rule configured, scope unlimited");
            return None;
        };

        match self.check(scope, subject_key, rule.limit, rule.window).await {
            Ok(decision) => Some(decision),
            Err(e) => match self.failure_policy {
                LimiterFailurePolicy::FailOpen => {
                    self.counters.fail_open.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        scope = %scope,
                        subject = %subject_key,
                        error = %e,
                        "Rate limiter store failed, allowing request"
                    );
                    Some(RateDecision {
                        scope,
                        allowed: true,
                        count: 0,
                        limit: rule.limit,
                        resets_in: None,
                        degraded: true,
                    })
                }
                LimiterFailurePolicy::FailClosed => {
                    error!(
                        scope = %scope,
                        subject = %subject_key,
                        error = %e,
                        "Rate limiter store failed, rejecting request"
                    );
                    Some(RateDecision {
                        scope,
                        allowed: false,
                        count: rule.limit,
                        limit: rule.limit,
                        resets_in: Some(rule.window),
                        degraded: true,
                    })
                }
            },
        }
    }

    /// Evaluate the global scope, then `endpoint`, for the request's subject
    ///
    /// Returns the endpoint decision (or the global one when the endpoint has
    /// no rule) so callers can report remaining quota.
    ///
    /// # Errors
    ///
    /// [`StakeError::RateLimited`] naming the first exceeded scope.
    pub async fn apply(
        &self,
        ctx: &RequestContext,
        endpoint: RateLimitScope,
    ) -> crate::error::Result<RateDecision> {
        let subject_key = ctx.subject().key();

        let mut scopes = vec![RateLimitScope::Global];
        if endpoint != RateLimitScope::Global {
            scopes.push(endpoint);
        }

        let mut last = None;
        for scope in scopes {
            let Some(decision) = self.evaluate(scope, &subject_key).await else {
                continue;
            };
            if !decision.allowed {
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                debug!(scope = %scope, subject = %subject_key, count = decision.count, "Rate limit exceeded");
                return Err(StakeError::RateLimited {
                    scope,
                    retry_after_secs: decision.retry_after_secs(),
                });
            }
            last = Some(decision);
        }

        Ok(last.unwrap_or(RateDecision {
            scope: endpoint,
            allowed: true,
            count: 0,
            limit: u64::MAX,
            resets_in: None,
            degraded: false,
        }))
    }

    /// Requests rejected so far
    #[must_use]
    pub fn rejected(&self) -> u64 {
        self.counters.rejected.load(Ordering::Relaxed)
    }

    /// Decisions made by failing open so far
    #[must_use]
    pub fn fail_open_decisions(&self) -> u64 {
        self.counters.fail_open.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::MemoryStore;
    use crate::clock::ManualClock;

    const MINUTE: Duration = Duration::from_secs(60);

    fn setup() -> (RateLimiter, Arc<MemoryStore>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));
        (RateLimiter::new(store.clone()), store, clock)
    }

    #[test]
    fn test_subject_keys() {
        assert_eq!(RequestContext::authenticated(7, "10.0.0.1").subject().key(), "user:7");
        assert_eq!(RequestContext::anonymous("10.0.0.1").subject().key(), "ip:10.0.0.1");
        assert_eq!(
            RateLimiter::counter_key(RateLimitScope::StakeCreate, "user:7"),
            "ratelimit:stake-create:user:7"
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_checks_at_limit_minus_one() {
        let (limiter, store, _clock) = setup();
        for _ in 0..4 {
            assert!(limiter.check(RateLimitScope::Auth, "user:1", 5, MINUTE).await.unwrap().allowed);
        }

        let barrier = Arc::new(tokio::sync::Barrier::new(2));
        let handles: Vec<_> = (0..2)
            .map(|_| {
                let limiter = limiter.clone();
                let barrier = Arc::clone(&barrier);
                tokio::spawn(async move {
                    barrier.wait().await;
                    limiter.check(RateLimitScope::Auth, "user:1", 5, MINUTE).await
                })
            })
            .collect();

        let mut allowed = 0;
        for handle in handles {
            if handle.await.unwrap().unwrap().allowed {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 1);
        assert_eq!(store.counter_value("ratelimit:auth:user:1"), Some(5));
    }

    #[tokio::test]
    async fn test_window_expiry_resets_counter() {
        let (limiter, store, clock) = setup();
        for _ in 0..3 {
            limiter.check(RateLimitScope::Auth, "ip:a", 3, MINUTE).await.unwrap();
        }
        let exceeded = limiter.check(RateLimitScope::Auth, "ip:a", 3, MINUTE).await.unwrap();
        assert!(!exceeded.allowed);
        assert_eq!(exceeded.count, 3);

        clock.advance(MINUTE);
        let fresh = limiter.check(RateLimitScope::Auth, "ip:a", 3, MINUTE).await.unwrap();
        assert!(fresh.allowed);
        assert_eq!(fresh.count, 1);
        assert_eq!(store.ttl("ratelimit:auth:ip:a"), Some(MINUTE));
    }

    #[tokio::test]
    async fn test_expiry_is_not_extended_by_later_hits() {
        let (limiter, store, clock) = setup();
        limiter.check(RateLimitScope::Auth, "ip:a", 10, MINUTE).await.unwrap();
        clock.advance(Duration::from_secs(40));
        let decision = limiter.check(RateLimitScope::Auth, "ip:a", 10, MINUTE).await.unwrap();

        assert_eq!(decision.count, 2);
        assert_eq!(store.ttl("ratelimit:auth:ip:a"), Some(Duration::from_secs(20)));
    }

    #[tokio::test]
    async fn test_global_scope_wins_over_endpoint() {
        let clock = Arc::new(ManualClock::default());
        let store = Arc::new(MemoryStore::with_clock(clock));
        let mut rules = RateLimitScope::default_rules();
        rules.insert(RateLimitScope::Global, RateLimitRule::new(2, MINUTE));
        let limiter = RateLimiter::with_rules(store, rules, LimiterFailurePolicy::FailOpen);
        let ctx = RequestContext::authenticated(3, "10.0.0.9");

        limiter.apply(&ctx, RateLimitScope::StakeGet).await.unwrap();
        limiter.apply(&ctx, RateLimitScope::StakeCreate).await.unwrap();
        let err = limiter.apply(&ctx, RateLimitScope::StakeGet).await.unwrap_err();

        assert_eq!(err.rate_limited_scope(), Some(RateLimitScope::Global));
        assert_eq!(limiter.rejected(), 1);
    }

    #[tokio::test]
    async fn test_endpoint_scope_reported_when_exceeded() {
        let clock = Arc::new(ManualClock::default());
        let store = Arc::new(MemoryStore::with_clock(clock));
        let mut rules = RateLimitScope::default_rules();
        rules.insert(RateLimitScope::StakeCreate, RateLimitRule::new(1, MINUTE));
        let limiter = RateLimiter::with_rules(store, rules, LimiterFailurePolicy::FailOpen);
        let ctx = RequestContext::anonymous("192.0.2.4");

        let first = limiter.apply(&ctx, RateLimitScope::StakeCreate).await.unwrap();
        assert_eq!(first.remaining(), 0);

        let err = limiter.apply(&ctx, RateLimitScope::StakeCreate).await.unwrap_err();
        match err {
            StakeError::RateLimited { scope, retry_after_secs } => {
                assert_eq!(scope, RateLimitScope::StakeCreate);
                assert_eq!(retry_after_secs, 60);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_store_failure_fails_open() {
        let (limiter, store, _clock) = setup();
        store.set_unavailable(true);

        let decision = limiter
            .apply(&RequestContext::authenticated(1, "x"), RateLimitScope::StakeCreate)
            .await
            .unwrap();
        assert!(decision.allowed);
        assert!(decision.degraded);
        assert_eq!(limiter.fail_open_decisions(), 2);
    }

    #[tokio::test]
    async fn test_store_failure_fails_closed_when_configured() {
        let store = Arc::new(MemoryStore::new());
        store.set_unavailable(true);
        let limiter = RateLimiter::with_rules(
            store,
            RateLimitScope::default_rules(),
            LimiterFailurePolicy::FailClosed,
        );

        let err = limiter
            .apply(&RequestContext::anonymous("x"), RateLimitScope::StakeGet)
            .await
            .unwrap_err();
        assert_eq!(err.rate_limited_scope(), Some(RateLimitScope::Global));
        assert_eq!(limiter.fail_open_decisions(), 0);
    }

    #[test]
    fn test_retry_after_rounds_up() {
        let decision = RateDecision {
            scope: RateLimitScope::Auth,
            allowed: false,
            count: 10,
            limit: 10,
            resets_in: Some(Duration::from_millis(1500)),
            degraded: false,
        };
        assert_eq!(decision.retry_after_secs(), 2);
    }
}
