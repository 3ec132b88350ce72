//! # Tower Token Gate
//!
//! `tower-token-gate` puts a [`token_gate`] limiter in front of any
//! [Tower](https://github.com/tower-rs/tower) service.
//!
//! Each request holds one token from the limiter for as long as the inner service
//! is working on it:
//!
//! 1. **Admission**: `poll_ready` waits until the limiter grants a token. With a
//!    timeout set it fails with `GateError::Timeout` instead of waiting forever.
//! 2. **Release**: the token goes back when the response future completes or is
//!    dropped, so cancelled requests never leak capacity.
//! 3. **Errors**: limiter failures surface as a boxed [`token_gate::GateError`];
//!    errors from the inner service pass through untouched.
//!
//! This is the natural way to bound outbound calls to a backend: wrap the
//! client service and every query waits its turn.

mod layer;
mod service;
mod utils;


pub use layer::TokenGateLayer;
pub use service::ResponseFuture;
pub use service::TokenGateService;
pub use token_gate::GateError;
pub use utils::ServiceBuilderExt;
