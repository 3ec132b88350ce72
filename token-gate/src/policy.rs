use std::time::Duration;

use chrono::DateTime;
use chrono::Utc;
use tokio::time::Instant;

use crate::Config;
use crate::GateError;
use crate::Manager;
use crate::Token;
use crate::window::FixedWindowTimer;

/// The admission discipline a [`Manager`] enforces.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Policy {
    /// Cap the number of simultaneously active tokens.
    MaxConcurrency,
    /// Space grants at least `period` apart. Concurrency is unbounded.
    Throttle { period: Duration },
    /// Cap active tokens per recurring window. Tokens expire when their window ends.
    FixedWindow { interval: Duration },
}

impl Policy {
    /// A stable label for logs and metrics.
    pub fn name(&self) -> &'static str {
        match self {
            Policy::MaxConcurrency => "max_concurrency",
            Policy::Throttle { .. } => "throttle",
            Policy::FixedWindow { .. } => "fixed_window",
        }
    }

    /// The ceiling on active tokens under this policy.
    pub(crate) fn capacity(&self, limit: usize) -> usize {
        match self {
            Policy::Throttle { .. } => usize::MAX,
            _ if limit == 0 => usize::MAX,
            _ => limit,
        }
    }
}

impl Manager {
    /// Creates a limiter that allows at most `config.limit` tokens out at once.
    ///
    /// # Errors
    ///
    /// [`GateError::InvalidLimit`] if the limit is zero, [`GateError::NoRuntime`]
    /// if called outside a Tokio runtime.
    ///
    /// # Panics
    ///
    /// If the runtime has no time driver, see [`Manager`].
    pub fn max_concurrency(config: &Config) -> Result<Self, GateError> {
        if config.limit == 0 {
            return Err(GateError::InvalidLimit);
        }
        Manager::spawn(config, Policy::MaxConcurrency)
    }

    /// Creates a limiter that grants the first request immediately and every
    /// later one no sooner than `config.throttle` after the previous grant.
    ///
    /// `config.limit` is ignored; pacing is the only control.
    ///
    /// # Errors
    ///
    /// [`GateError::InvalidThrottleDuration`] if the throttle is zero,
    /// [`GateError::NoRuntime`] if called outside a Tokio runtime.
    ///
    /// # Panics
    ///
    /// If the runtime has no time driver, see [`Manager`].
    pub fn throttle(config: &Config) -> Result<Self, GateError> {
        if config.throttle.is_zero() {
            return Err(GateError::InvalidThrottleDuration);
        }
        Manager::spawn(
            config,
            Policy::Throttle {
                period: config.throttle,
            },
        )
    }

    /// Creates a limiter that allows `config.limit` tokens per window of
    /// `config.fixed_interval`.
    ///
    /// Every token expires at the end of the window it was granted in and is
    /// reclaimed at that boundary whether or not it was released. Releasing it
    /// earlier is ignored.
    ///
    /// # Errors
    ///
    /// [`GateError::InvalidInterval`] if the interval is zero,
    /// [`GateError::InvalidLimit`] if the limit is zero,
    /// [`GateError::NoRuntime`] if called outside a Tokio runtime.
    ///
    /// # Panics
    ///
    /// If the runtime has no time driver, see [`Manager`].
    pub fn fixed_window(config: &Config) -> Result<Self, GateError> {
        if config.fixed_interval.is_zero() {
            return Err(GateError::InvalidInterval);
        }
        if config.limit == 0 {
            return Err(GateError::InvalidLimit);
        }
        Manager::spawn(
            config,
            Policy::FixedWindow {
                interval: config.fixed_interval,
            },
        )
    }
}

/// Per-policy state owned by the coordinator: the token factory and any timer
/// that decides when a grant may happen.
#[derive(Debug)]
pub(crate) enum Admission {
    Concurrency,
    Throttle {
        period: Duration,
        next_grant: Option<Instant>,
    },
    Window(FixedWindowTimer),
}

impl Admission {
    pub(crate) fn new(policy: Policy) -> Self {
        match policy {
            Policy::MaxConcurrency => Admission::Concurrency,
            Policy::Throttle { period } => Admission::Throttle {
                period,
                next_grant: None,
            },
            Policy::FixedWindow { interval } => Admission::Window(FixedWindowTimer::new(interval)),
        }
    }

    pub(crate) fn mint(&self) -> Token {
        match self {
            Admission::Window(window) => Token::with_expiry(window.end()),
            _ => Token::new(),
        }
    }

    /// Whether pacing allows a grant right now.
    pub(crate) fn is_ready(&self) -> bool {
        match self {
            Admission::Throttle {
                next_grant: Some(at),
                ..
            } => Instant::now() >= *at,
            _ => true,
        }
    }

    pub(crate) fn record_grant(&mut self) {
        if let Admission::Throttle { period, next_grant } = self {
            let now = Instant::now();
            *next_grant = Some(now.checked_add(*period).unwrap_or(now));
        }
    }

    /// When the next paced grant becomes possible, if pacing is in effect.
    pub(crate) fn pacing_deadline(&self) -> Option<Instant> {
        match self {
            Admission::Throttle { next_grant, .. } => *next_grant,
            _ => None,
        }
    }

    /// Resolves at each window boundary with the end of the closed window.
    /// Never resolves for policies without windows.
    pub(crate) async fn boundary(&mut self) -> DateTime<Utc> {
        match self {
            Admission::Window(window) => window.tick().await,
            _ => std::future::pending().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity() {
        assert_eq!(Policy::MaxConcurrency.capacity(3), 3);
        assert_eq!(Policy::MaxConcurrency.capacity(0), usize::MAX);
        assert_eq!(
            Policy::Throttle {
                period: Duration::from_millis(10)
            }
            .capacity(3),
            usize::MAX
        );
        assert_eq!(
            Policy::FixedWindow {
                interval: Duration::from_secs(1)
            }
            .capacity(2),
            2
        );
    }

    #[tokio::test]
    async fn window_tokens_expire_with_their_window() {
        let admission = Admission::new(Policy::FixedWindow {
            interval: Duration::from_secs(15),
        });
        let Admission::Window(window) = &admission else {
            panic!("expected a window admission");
        };

        let token = admission.mint();
        assert_eq!(token.expires_at(), Some(window.end()));
    }

    #[tokio::test]
    async fn concurrency_tokens_never_expire() {
        let admission = Admission::new(Policy::MaxConcurrency);

        assert_eq!(admission.mint().expires_at(), None);
        assert!(admission.is_ready());
        assert_eq!(admission.pacing_deadline(), None);
    }

    #[tokio::test]
    async fn test_throttle_pacing() {
        tokio::time::pause();

        let period = Duration::from_millis(100);
        let mut admission = Admission::new(Policy::Throttle { period });

        // The first grant is never paced.
        assert!(admission.is_ready());
        admission.record_grant();
        assert!(!admission.is_ready());

        tokio::time::advance(period).await;
        assert!(admission.is_ready());
    }
}
