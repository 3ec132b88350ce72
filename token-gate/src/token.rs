use std::fmt;
use std::time::Duration;

use chrono::DateTime;
use chrono::TimeDelta;
use chrono::Utc;
use uuid::Uuid;

/// Identity of a [`Token`].
///
/// Backed by a UUIDv7, so ids are unique and sort in creation order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TokenId(Uuid);

impl TokenId {
    fn generate() -> Self {
        Self(Uuid::now_v7())
    }
}

impl fmt::Display for TokenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

/// One unit of granted admission.
///
/// Tokens are plain values. The [`Manager`](crate::Manager) that minted a token is
/// the only thing that tracks whether it is still active; handing a token back via
/// [`RateLimiter::release`](crate::RateLimiter::release) is what ends its life.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Token {
    id: TokenId,
    created_at: DateTime<Utc>,
    expires_at: Option<DateTime<Utc>>,
}

impl Token {
    /// Creates a token with a fresh id, stamped now, with no fixed expiry.
    pub fn new() -> Self {
        Self {
            id: TokenId::generate(),
            created_at: Utc::now(),
            expires_at: None,
        }
    }

    /// Creates a token that expires at `expires_at`.
    pub fn with_expiry(expires_at: DateTime<Utc>) -> Self {
        Self {
            expires_at: Some(expires_at),
            ..Self::new()
        }
    }

    pub fn id(&self) -> TokenId {
        self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    /// True if the token carries an expiry and it has passed.
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires_at| now >= expires_at)
    }

    /// True if the token has been alive for at least `max_age`.
    pub fn needs_reset(&self, max_age: Duration) -> bool {
        self.needs_reset_at(max_age, Utc::now())
    }

    pub fn needs_reset_at(&self, max_age: Duration, now: DateTime<Utc>) -> bool {
        // An age too large for chrono to represent is never reached.
        TimeDelta::from_std(max_age).is_ok_and(|max_age| now - self.created_at >= max_age)
    }
}

impl Default for Token {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id)
    }
}
