use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::Context;
use std::task::Poll;
use std::task::ready;
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use pin_project_lite::pin_project;
use tower::BoxError;
use tower::Service;
use tracing::trace;

use token_gate::GateError;
use token_gate::RateLimiter;
use token_gate::Token;

/// A granted token that goes back to its limiter when dropped.
pub(crate) struct Permit {
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl Permit {
    fn new<L>(limiter: Arc<L>, token: Token) -> Self
    where
        L: RateLimiter + ?Sized + 'static,
    {
        Self {
            release: Some(Box::new(move || {
                trace!(%token, "releasing request token");
                limiter.release(token);
            })),
        }
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

pin_project! {
    /// Drives the inner service's future and releases the request's token once
    /// it finishes or is dropped.
    pub struct ResponseFuture<F> {
        #[pin]
        inner: F,
        permit: Option<Permit>,
    }
}

impl<F, T> Future for ResponseFuture<F>
where
    F: Future<Output = Result<T, BoxError>>,
{
    type Output = Result<T, BoxError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let output = ready!(this.inner.poll(cx));
        this.permit.take();
        Poll::Ready(output)
    }
}

/// Holds one limiter token for the lifetime of every request.
///
/// `poll_ready` waits for a token, `call` hands it to the response future.
/// If the service is dropped between the two, the token is released.
pub struct TokenGateService<L, S>
where
    L: ?Sized,
{
    inner: S,
    limiter: Arc<L>,
    timeout: Option<Duration>,
    acquiring: Option<BoxFuture<'static, Result<Token, GateError>>>,
    permit: Option<Permit>,
}

// Manually implement Clone because in-flight acquires and held tokens belong to one clone
impl<L, S> Clone for TokenGateService<L, S>
where
    L: ?Sized,
    S: Clone,
{
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            limiter: Arc::clone(&self.limiter),
            timeout: self.timeout,
            acquiring: None,
            permit: None,
        }
    }
}

impl<L, S> fmt::Debug for TokenGateService<L, S>
where
    L: fmt::Debug + ?Sized,
    S: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenGateService")
            .field("inner", &self.inner)
            .field("limiter", &self.limiter)
            .field("timeout", &self.timeout)
            .field("acquiring", &self.acquiring.is_some())
            .field("holds_token", &self.permit.is_some())
            .finish()
    }
}

impl<L, S, Req> Service<Req> for TokenGateService<L, S>
where
    L: RateLimiter + ?Sized + 'static,
    S: Service<Req, Error = BoxError>,
{
    type Response = S::Response;
    type Error = BoxError;
    type Future = ResponseFuture<S::Future>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        // Check inner service readiness first so we don't sit on a token while it is busy
        ready!(self.inner.poll_ready(cx))?;

        if self.permit.is_none() {
            let acquiring = self.acquiring.get_or_insert_with(|| {
                let limiter = Arc::clone(&self.limiter);
                let timeout = self.timeout;
                async move {
                    match timeout {
                        Some(wait) => limiter.acquire_timeout(wait).await,
                        None => limiter.acquire().await,
                    }
                }
                .boxed()
            });

            let result = ready!(acquiring.as_mut().poll(cx));
            self.acquiring = None;
            let token = result.map_err(BoxError::from)?;
            self.permit = Some(Permit::new(Arc::clone(&self.limiter), token));
        }

        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let permit = self
            .permit
            .take()
            .expect("token not acquired; poll_ready must be called first");

        ResponseFuture {
            inner: self.inner.call(req),
            permit: Some(permit),
        }
    }
}

impl<L, S> TokenGateService<L, S>
where
    L: ?Sized,
{
    pub fn new(inner: S, limiter: Arc<L>) -> Self {
        Self {
            inner,
            limiter,
            timeout: None,
            acquiring: None,
            permit: None,
        }
    }

    /// Bound how long `poll_ready` waits for a token.
    ///
    /// Past the bound, `poll_ready` fails with [`GateError::Timeout`].
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}
