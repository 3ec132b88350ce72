use std::sync::Arc;
use std::time::Duration;

use token_gate::RateLimiter;
use tower::Layer;

use crate::service::TokenGateService;

/// Wraps services so every request holds a limiter token while it runs.
#[derive(Debug)]
pub struct TokenGateLayer<L>
where
    L: ?Sized,
{
    limiter: Arc<L>,
    timeout: Option<Duration>,
}

impl<L> Clone for TokenGateLayer<L>
where
    L: ?Sized,
{
    fn clone(&self) -> Self {
        Self {
            limiter: Arc::clone(&self.limiter),
            timeout: self.timeout,
        }
    }
}

impl<L> TokenGateLayer<L>
where
    L: RateLimiter + ?Sized,
{
    /// Create a TokenGateLayer
    pub fn new(limiter: Arc<L>) -> Self {
        TokenGateLayer {
            limiter,
            timeout: None,
        }
    }

    /// Set how long a request may wait for a token before failing with
    /// `GateError::Timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl<L, S> Layer<S> for TokenGateLayer<L>
where
    L: ?Sized,
{
    type Service = TokenGateService<L, S>;

    fn layer(&self, service: S) -> Self::Service {
        let svc = TokenGateService::new(service, self.limiter.clone());
        match self.timeout {
            Some(timeout) => svc.with_timeout(timeout),
            None => svc,
        }
    }
}
