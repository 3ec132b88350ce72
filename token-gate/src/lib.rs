//! # token-gate
//!
//! `token-gate` is in-process admission control. Callers ask for a [`Token`] before
//! doing protected work and hand it back afterwards; the limiter decides when a
//! token may be granted.
//!
//! ## Core Philosophy
//!
//! Every limiter is a [`Manager`]: a handle to one coordinator task that owns the
//! set of active tokens and the queue of waiting callers. Nothing else touches that
//! state. Callers, releases and timers all talk to the coordinator by message, so
//! there are no locks to contend on and no sweep can race a grant.
//!
//! ## Key Concepts
//!
//! * **Policies**: the same coordinator enforces one of three [`Policy`] variants.
//!   Max-concurrency caps outstanding tokens, throttle spaces grants apart, and
//!   fixed-window caps grants per recurring window.
//! * **Best-effort release**: [`RateLimiter::release`] never blocks and never fails.
//!   Unknown or not-yet-releasable tokens are logged and ignored.
//! * **Must-answer acquire**: [`RateLimiter::acquire`] either yields a token or an
//!   error. It never hangs on a coordinator that has gone away.
//! * **Forced expiry**: with [`Config::token_resets_after`] set, tokens held too long
//!   are reclaimed.
//!
//! ## Example
//!
//! ```rust
//! use token_gate::Config;
//! use token_gate::Manager;
//! use token_gate::RateLimiter;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), token_gate::GateError> {
//! let limiter = Manager::max_concurrency(&Config::default().with_limit(2))?;
//!
//! let token = limiter.acquire().await?;
//! // ... protected work ...
//! limiter.release(token);
//! # Ok(())
//! # }
//! ```

use std::fmt::Debug;
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;

mod config;
mod error;
mod manager;
mod policy;
mod token;
mod window;

pub use config::Config;
pub use error::GateError;
pub use manager::Manager;
pub use manager::Stats;
pub use policy::Policy;
pub use token::Token;
pub use token::TokenId;

/// The capability every limiter exposes, whatever its policy.
///
/// Object safe, so callers can hold an `Arc<dyn RateLimiter>`.
pub trait RateLimiter: Debug + Send + Sync {
    /// Waits until a token is granted.
    ///
    /// No ordering is promised between callers waiting at the same time.
    /// Dropping the returned future gives up the place in line; a token granted
    /// to an abandoned caller is returned to the limiter.
    ///
    /// # Errors
    ///
    /// [`GateError::Closed`] if the limiter has shut down.
    fn acquire(&self) -> BoxFuture<'_, Result<Token, GateError>>;

    /// Returns a token to the limiter.
    ///
    /// This never blocks. It is not guaranteed to have taken effect by the time
    /// it returns.
    fn release(&self, token: Token);

    /// Like [`acquire`](Self::acquire), but gives up after `wait`.
    ///
    /// # Errors
    ///
    /// [`GateError::Timeout`] if no token was granted in time, otherwise as `acquire`.
    fn acquire_timeout(&self, wait: Duration) -> BoxFuture<'_, Result<Token, GateError>> {
        async move {
            tokio::time::timeout(wait, self.acquire())
                .await
                .map_err(|_| GateError::Timeout)?
        }
        .boxed()
    }
}
