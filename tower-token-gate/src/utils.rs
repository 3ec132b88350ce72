use std::sync::Arc;
use std::time::Duration;

use token_gate::RateLimiter;
use tower::ServiceBuilder;
use tower::layer::util::Stack;

use crate::TokenGateLayer;

/// Service Builder Extension with token gating for tower::ServiceBuilder.
pub trait ServiceBuilderExt<L> {
    /// Hold a token from `limiter` for each request, waiting as long as it takes.
    fn token_gate(
        self,
        limiter: Arc<dyn RateLimiter>,
    ) -> ServiceBuilder<Stack<TokenGateLayer<dyn RateLimiter>, L>>;

    /// Hold a token from `limiter` for each request, failing if none is granted within `timeout`.
    fn token_gate_with_timeout(
        self,
        limiter: Arc<dyn RateLimiter>,
        timeout: Duration,
    ) -> ServiceBuilder<Stack<TokenGateLayer<dyn RateLimiter>, L>>;
}

impl<L> ServiceBuilderExt<L> for ServiceBuilder<L> {
    fn token_gate(
        self,
        limiter: Arc<dyn RateLimiter>,
    ) -> ServiceBuilder<Stack<TokenGateLayer<dyn RateLimiter>, L>> {
        self.layer(TokenGateLayer::new(limiter))
    }

    fn token_gate_with_timeout(
        self,
        limiter: Arc<dyn RateLimiter>,
        timeout: Duration,
    ) -> ServiceBuilder<Stack<TokenGateLayer<dyn RateLimiter>, L>> {
        self.layer(TokenGateLayer::new(limiter).with_timeout(timeout))
    }
}
