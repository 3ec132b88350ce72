use std::collections::HashMap;
use std::collections::VecDeque;
use std::time::Duration;

use chrono::DateTime;
use chrono::Utc;
use futures::FutureExt;
use futures::future::BoxFuture;
use opentelemetry::KeyValue;
use opentelemetry::global;
use opentelemetry::metrics::Counter;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio::time::Interval;
use tokio::time::MissedTickBehavior;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::Config;
use crate::GateError;
use crate::Policy;
use crate::RateLimiter;
use crate::Token;
use crate::TokenId;
use crate::policy::Admission;
use crate::window::one_period_from_now;

// Waiter count below which abandoned waiters are left for `serve` to skip.
const MIN_PRUNE_AT: usize = 64;

/// A point-in-time view of a coordinator's state.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Stats {
    /// Tokens granted and not yet released or reclaimed.
    pub active: usize,
    /// Callers waiting for a token.
    pub backlog: usize,
}

#[derive(Debug)]
enum Request {
    Acquire(oneshot::Sender<Token>),
    Stats(oneshot::Sender<Stats>),
}

#[derive(Debug)]
enum Signal {
    Release(Token),
    // A grant that reached a caller who had already given up.
    Withdraw(Token),
    Shutdown,
}

/// Why a token is leaving the active set.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Reclaim {
    Released,
    Withdrawn,
    WindowClosed,
    Reset,
}

/// Handle to a token coordinator.
///
/// All admission state lives in a single task spawned when the `Manager` is
/// built. Handles only send it messages, so cloning is cheap and every clone
/// talks to the same coordinator. The coordinator stops when [`shutdown`] is
/// called or when the last handle is dropped.
///
/// Build one with [`Manager::max_concurrency`], [`Manager::throttle`] or
/// [`Manager::fixed_window`], then use it through [`RateLimiter`].
///
/// # Panics
///
/// Every constructor panics if the current runtime was built without its time
/// driver (`enable_time` or `enable_all`; `#[tokio::main]` enables it). Outside
/// any runtime they return [`GateError::NoRuntime`] instead.
///
/// [`shutdown`]: Manager::shutdown
#[derive(Clone, Debug)]
pub struct Manager {
    policy: Policy,
    requests: mpsc::Sender<Request>,
    signals: mpsc::UnboundedSender<Signal>,
}

impl Manager {
    pub(crate) fn spawn(config: &Config, policy: Policy) -> Result<Self, GateError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| GateError::NoRuntime)?;
        // Registering a timer panics without a time driver. Do it here, in the
        // caller, rather than later inside the coordinator.
        drop(tokio::time::sleep(Duration::ZERO));

        let (requests, request_rx) = mpsc::channel(config.effective_queue_depth());
        let (signals, signal_rx) = mpsc::unbounded_channel();

        let coordinator = Coordinator::new(config, policy);
        runtime.spawn(coordinator.run(request_rx, signal_rx));

        Ok(Self {
            policy,
            requests,
            signals,
        })
    }

    pub fn policy(&self) -> Policy {
        self.policy
    }

    /// Asks the coordinator for its current state.
    pub async fn stats(&self) -> Result<Stats, GateError> {
        let (reply, stats) = oneshot::channel();
        self.requests
            .send(Request::Stats(reply))
            .await
            .map_err(|_| GateError::Closed)?;
        stats.await.map_err(|_| GateError::Closed)
    }

    /// Stops the coordinator. Callers waiting in `acquire` get
    /// [`GateError::Closed`], as does every later `acquire`.
    pub fn shutdown(&self) {
        let _ = self.signals.send(Signal::Shutdown);
    }

    async fn request_token(&self) -> Result<Token, GateError> {
        let (reply, receiver) = oneshot::channel();
        self.requests
            .send(Request::Acquire(reply))
            .await
            .map_err(|_| GateError::Closed)?;

        let mut pending = PendingGrant {
            receiver,
            signals: &self.signals,
        };
        (&mut pending.receiver)
            .await
            .map_err(|_| GateError::Closed)
    }
}

impl RateLimiter for Manager {
    fn acquire(&self) -> BoxFuture<'_, Result<Token, GateError>> {
        self.request_token().boxed()
    }

    fn release(&self, token: Token) {
        if let Err(mpsc::error::SendError(Signal::Release(token))) =
            self.signals.send(Signal::Release(token))
        {
            debug!(%token, "coordinator closed, release dropped");
        }
    }
}

// Hands back a token that was granted after its caller stopped waiting.
struct PendingGrant<'a> {
    receiver: oneshot::Receiver<Token>,
    signals: &'a mpsc::UnboundedSender<Signal>,
}

impl Drop for PendingGrant<'_> {
    fn drop(&mut self) {
        self.receiver.close();
        if let Ok(token) = self.receiver.try_recv() {
            let _ = self.signals.send(Signal::Withdraw(token));
        }
    }
}

#[derive(Clone, Debug)]
struct CoordinatorMetrics {
    granted: Counter<u64>,
    released: Counter<u64>,
    rejected: Counter<u64>,
    swept: Counter<u64>,
    attributes: [KeyValue; 1],
}

impl CoordinatorMetrics {
    fn new(policy: Policy) -> Self {
        let meter = global::meter("token_gate");
        Self {
            granted: meter.u64_counter("tokens_granted").build(),
            released: meter.u64_counter("tokens_released").build(),
            rejected: meter.u64_counter("releases_rejected").build(),
            swept: meter.u64_counter("tokens_swept").build(),
            attributes: [KeyValue::new("policy", policy.name())],
        }
    }
}

/// The single owner of the active token set and the waiter queue.
struct Coordinator {
    policy: Policy,
    capacity: usize,
    active: HashMap<TokenId, Token>,
    // Callers waiting for a token. Served front first, but no ordering is promised.
    waiters: VecDeque<oneshot::Sender<Token>>,
    // Queue length that triggers the next sweep of abandoned waiters.
    prune_at: usize,
    admission: Admission,
    reset: Option<(Duration, Interval)>,
    metrics: CoordinatorMetrics,
}

impl Coordinator {
    fn new(config: &Config, policy: Policy) -> Self {
        let reset = (!config.token_resets_after.is_zero()).then(|| {
            let max_age = config.token_resets_after;
            let mut ticker = tokio::time::interval_at(one_period_from_now(max_age), max_age);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            (max_age, ticker)
        });

        Self {
            policy,
            capacity: policy.capacity(config.limit),
            active: HashMap::new(),
            waiters: VecDeque::new(),
            prune_at: MIN_PRUNE_AT,
            admission: Admission::new(policy),
            reset,
            metrics: CoordinatorMetrics::new(policy),
        }
    }

    async fn run(
        mut self,
        mut requests: mpsc::Receiver<Request>,
        mut signals: mpsc::UnboundedReceiver<Signal>,
    ) {
        info!(policy = self.policy.name(), capacity = self.capacity, "coordinator started");

        loop {
            let pacing = if self.waiters.is_empty() {
                None
            } else {
                self.admission.pacing_deadline()
            };

            // Releases and sweeps go first so freed capacity is visible to the
            // requests queued behind them.
            tokio::select! {
                biased;

                signal = signals.recv() => match signal {
                    Some(Signal::Release(token)) => self.release(token),
                    Some(Signal::Withdraw(token)) => self.reclaim(token.id(), Reclaim::Withdrawn),
                    Some(Signal::Shutdown) | None => break,
                },
                cutoff = self.admission.boundary() => self.close_window(cutoff),
                max_age = reset_tick(&mut self.reset) => self.reset_stale(max_age),
                _ = paced(pacing) => self.serve(),
                request = requests.recv() => match request {
                    Some(Request::Acquire(reply)) => {
                        self.enqueue(reply);
                        self.serve();
                    }
                    Some(Request::Stats(reply)) => {
                        let _ = reply.send(self.stats());
                    }
                    None => break,
                },
            }
        }

        info!(
            policy = self.policy.name(),
            active = self.active.len(),
            waiting = self.waiters.len(),
            "coordinator stopped"
        );
        // Dropping the waiters fails their acquires with `GateError::Closed`.
    }

    fn stats(&mut self) -> Stats {
        self.prune();
        Stats {
            active: self.active.len(),
            backlog: self.waiters.len(),
        }
    }

    /// Queues a caller, first dropping abandoned waiters once the queue has
    /// doubled since the last sweep. Keeps the queue bounded by live callers
    /// while the limiter is saturated.
    fn enqueue(&mut self, reply: oneshot::Sender<Token>) {
        if self.waiters.len() >= self.prune_at {
            self.prune();
        }
        self.waiters.push_back(reply);
    }

    fn prune(&mut self) {
        self.waiters.retain(|waiter| !waiter.is_closed());
        self.prune_at = (self.waiters.len() * 2).max(MIN_PRUNE_AT);
    }

    /// Grants tokens to waiting callers while capacity and pacing allow.
    fn serve(&mut self) {
        while self.active.len() < self.capacity && self.admission.is_ready() {
            let Some(waiter) = self.waiters.pop_front() else {
                break;
            };
            if waiter.is_closed() {
                continue;
            }

            let token = self.admission.mint();
            match waiter.send(token.clone()) {
                Ok(()) => {
                    debug!(%token, active = self.active.len() + 1, "token granted");
                    self.active.insert(token.id(), token);
                    self.admission.record_grant();
                    self.metrics.granted.add(1, &self.metrics.attributes);
                }
                Err(_) => debug!(%token, "waiter gone before grant"),
            }
        }
    }

    /// An explicit release from a caller.
    fn release(&mut self, token: Token) {
        let Some(held) = self.active.get(&token.id()) else {
            warn!(%token, "unable to release token - not in use");
            self.metrics.rejected.add(1, &self.metrics.attributes);
            return;
        };

        if held.expires_at().is_some() && !held.is_expired() {
            warn!(%token, expires_at = ?held.expires_at(), "unable to release token - has not expired");
            self.metrics.rejected.add(1, &self.metrics.attributes);
            return;
        }

        self.reclaim(token.id(), Reclaim::Released);
    }

    fn reclaim(&mut self, id: TokenId, reason: Reclaim) {
        if self.active.remove(&id).is_none() {
            return;
        }
        debug!(token = %id, ?reason, active = self.active.len(), "token reclaimed");

        match reason {
            Reclaim::Released | Reclaim::Withdrawn => {
                self.metrics.released.add(1, &self.metrics.attributes)
            }
            Reclaim::WindowClosed | Reclaim::Reset => {
                self.metrics.swept.add(1, &self.metrics.attributes)
            }
        }

        self.serve();
    }

    fn close_window(&mut self, cutoff: DateTime<Utc>) {
        let expired = self.sweep(|token| token.is_expired_at(cutoff));
        debug!(%cutoff, expired = expired.len(), "window closed");
        self.sweep_into(Reclaim::WindowClosed, expired);
    }

    fn reset_stale(&mut self, max_age: Duration) {
        let now = Utc::now();
        let stale = self.sweep(|token| token.needs_reset_at(max_age, now));
        self.sweep_into(Reclaim::Reset, stale);
    }

    fn sweep(&self, due: impl Fn(&Token) -> bool) -> Vec<TokenId> {
        self.active
            .values()
            .filter(|token| due(token))
            .map(Token::id)
            .collect()
    }

    fn sweep_into(&mut self, reason: Reclaim, ids: Vec<TokenId>) {
        for id in ids {
            self.reclaim(id, reason);
        }
    }
}

async fn paced(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn reset_tick(reset: &mut Option<(Duration, Interval)>) -> Duration {
    match reset {
        Some((max_age, ticker)) => {
            ticker.tick().await;
            *max_age
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;

    use more_asserts::assert_ge;
    use more_asserts::assert_le;

    use super::*;

    fn concurrency(limit: usize) -> Manager {
        Manager::max_concurrency(&Config::default().with_limit(limit)).unwrap()
    }

    async fn assert_blocked(limiter: &Manager) {
        tokio::select! {
            _ = limiter.acquire() => panic!("acquire should be blocked"),
            _ = tokio::time::sleep(Duration::from_millis(10)) => {}
        }
    }

    #[tokio::test]
    async fn it_grants_distinct_tokens_up_to_the_limit() {
        let limiter = concurrency(2);

        let first = limiter.acquire().await.unwrap();
        let second = limiter.acquire().await.unwrap();

        assert_ne!(first.id(), second.id());
        assert_eq!(
            limiter.stats().await.unwrap(),
            Stats {
                active: 2,
                backlog: 0
            }
        );
    }

    #[tokio::test]
    async fn test_release_wakes_a_waiter() {
        let limiter = concurrency(2);
        let first = limiter.acquire().await.unwrap();
        let second = limiter.acquire().await.unwrap();

        let waiting = {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.acquire().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiting.is_finished());
        assert_eq!(limiter.stats().await.unwrap().backlog, 1);

        limiter.release(first.clone());
        let third = waiting.await.unwrap().unwrap();

        assert_ne!(third.id(), first.id());
        assert_ne!(third.id(), second.id());
        assert_eq!(limiter.stats().await.unwrap().active, 2);
    }

    #[tokio::test]
    async fn test_double_release_frees_capacity_once() {
        let limiter = concurrency(1);
        let token = limiter.acquire().await.unwrap();

        limiter.release(token.clone());
        limiter.release(token);

        let replacement = limiter.acquire().await.unwrap();
        assert_eq!(limiter.stats().await.unwrap().active, 1);
        assert_blocked(&limiter).await;

        limiter.release(replacement);
        assert_eq!(limiter.stats().await.unwrap().active, 0);
    }

    #[tokio::test]
    async fn test_foreign_tokens_are_ignored() {
        let limiter = concurrency(1);
        let _held = limiter.acquire().await.unwrap();

        limiter.release(Token::new());

        assert_eq!(limiter.stats().await.unwrap().active, 1);
        assert_blocked(&limiter).await;
    }

    #[tokio::test]
    async fn test_capacity_never_exceeded() {
        let limit = 3;
        let limiter = concurrency(limit);
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = vec![];
        for _ in 0..30 {
            let limiter = limiter.clone();
            let in_flight = in_flight.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                let token = limiter.acquire().await.unwrap();
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(2)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
                limiter.release(token);
            }));
        }

        for handle in futures::future::join_all(handles).await {
            handle.unwrap();
        }

        assert_le!(peak.load(Ordering::SeqCst), limit);
        assert_eq!(limiter.stats().await.unwrap().active, 0);
    }

    #[tokio::test]
    async fn test_shutdown_fails_waiters() {
        let limiter = concurrency(1);
        let _held = limiter.acquire().await.unwrap();

        let waiting = {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.acquire().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        limiter.shutdown();

        assert_eq!(waiting.await.unwrap(), Err(GateError::Closed));
        assert_eq!(limiter.acquire().await, Err(GateError::Closed));
        assert_eq!(limiter.stats().await, Err(GateError::Closed));
    }

    #[tokio::test]
    async fn test_timed_out_waiter_does_not_leak_capacity() {
        let limiter = concurrency(1);
        let held = limiter.acquire().await.unwrap();

        assert_eq!(
            limiter.acquire_timeout(Duration::from_millis(10)).await,
            Err(GateError::Timeout)
        );

        limiter.release(held);
        let next = limiter
            .acquire_timeout(Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(limiter.stats().await.unwrap().active, 1);
        limiter.release(next);
    }

    #[tokio::test]
    async fn test_grant_to_an_abandoned_acquire_is_withdrawn() {
        let limiter = concurrency(1);
        let held = limiter.acquire().await.unwrap();

        let mut acquire = limiter.acquire();
        assert!(futures::poll!(&mut acquire).is_pending());

        // The grant lands in the reply channel but is never picked up.
        limiter.release(held);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(
            limiter.stats().await.unwrap(),
            Stats {
                active: 1,
                backlog: 0
            }
        );

        drop(acquire);

        assert_eq!(
            limiter.stats().await.unwrap(),
            Stats {
                active: 0,
                backlog: 0
            }
        );
        limiter.acquire().await.unwrap();
    }

    #[tokio::test]
    async fn test_abandoned_waiters_are_pruned_while_saturated() {
        let mut coordinator =
            Coordinator::new(&Config::default().with_limit(1), Policy::MaxConcurrency);

        let (holder, _granted) = oneshot::channel();
        coordinator.enqueue(holder);
        coordinator.serve();
        assert_eq!(coordinator.active.len(), 1);

        let (live, _still_waiting) = oneshot::channel();
        coordinator.enqueue(live);

        for _ in 0..10_000 {
            let (reply, gave_up) = oneshot::channel();
            drop(gave_up);
            coordinator.enqueue(reply);
            coordinator.serve();
        }

        assert_le!(coordinator.waiters.len(), MIN_PRUNE_AT);
        assert_eq!(
            coordinator
                .waiters
                .iter()
                .filter(|waiter| !waiter.is_closed())
                .count(),
            1
        );
        assert_eq!(coordinator.stats().backlog, 1);
    }

    #[tokio::test]
    async fn test_timed_out_retries_against_a_full_limiter() {
        tokio::time::pause();

        let limiter = concurrency(1);
        let held = limiter.acquire().await.unwrap();

        for _ in 0..1_000 {
            assert_eq!(
                limiter.acquire_timeout(Duration::from_millis(1)).await,
                Err(GateError::Timeout)
            );
        }

        limiter.release(held);
        limiter.acquire().await.unwrap();
        assert_eq!(
            limiter.stats().await.unwrap(),
            Stats {
                active: 1,
                backlog: 0
            }
        );
    }

    #[tokio::test]
    async fn test_huge_reset_interval_does_not_tick_immediately() {
        tokio::time::pause();

        let config = Config::default()
            .with_limit(1)
            .with_token_resets_after(Duration::MAX);
        let mut coordinator = Coordinator::new(&config, Policy::MaxConcurrency);

        tokio::select! {
            _ = reset_tick(&mut coordinator.reset) => panic!("reset sweep fired early"),
            _ = tokio::time::sleep(Duration::from_secs(60)) => {}
        }
    }

    #[test]
    #[should_panic]
    fn test_constructors_require_a_time_driver() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        let _guard = runtime.enter();

        let _ = Manager::max_concurrency(&Config::default().with_limit(1));
    }

    #[tokio::test]
    async fn test_token_reset_reclaims_held_tokens() {
        let config = Config::default()
            .with_limit(1)
            .with_token_resets_after(Duration::from_millis(20));
        let limiter = Manager::max_concurrency(&config).unwrap();

        let stale = limiter.acquire().await.unwrap();
        let began = std::time::Instant::now();

        let next = limiter
            .acquire_timeout(Duration::from_secs(2))
            .await
            .expect("stale token should be reclaimed");

        assert_ge!(began.elapsed(), Duration::from_millis(15));
        assert!(next.created_at() > stale.created_at());
    }

    #[tokio::test]
    async fn test_coordinator_requires_a_runtime() {
        let config = Config::default().with_limit(1);
        let result = std::thread::spawn(move || Manager::max_concurrency(&config).map(|_| ()))
            .join()
            .unwrap();

        assert_eq!(result, Err(GateError::NoRuntime));
    }
}
