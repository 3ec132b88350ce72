/// Errors produced by token-gate limiters.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum GateError {
    /// The configured limit is zero for a policy that needs one.
    #[error("invalid limit, must be greater than zero")]
    InvalidLimit,

    /// The throttle period is zero.
    #[error("invalid throttle duration, must be greater than zero")]
    InvalidThrottleDuration,

    /// The fixed window interval is zero.
    #[error("invalid fixed interval, must be greater than zero")]
    InvalidInterval,

    /// A limiter was constructed outside of a Tokio runtime, so its coordinator
    /// could not be started.
    #[error("no tokio runtime available to run the coordinator")]
    NoRuntime,

    /// The coordinator has shut down. Pending and future acquires fail with this.
    #[error("rate limiter coordinator is closed")]
    Closed,

    /// An acquire with a deadline gave up before a token was granted.
    #[error("timed out waiting for a rate limit token")]
    Timeout,
}
