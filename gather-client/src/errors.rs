//! Error types for gather-client.
//!
//! The closed set of conditions a client implementation may surface. The
//! engine dispatches on these variants, never on error message text.

use std::fmt;

// ─── ClientError ──────────────────────────────────────────────────────────────

/// An error returned by any [`crate::ClientHandle`] operation.
///
/// Rate limits carry the server-requested wait so callers can back off by
/// exactly that much (plus a margin).
#[derive(Clone, Debug, PartialEq)]
pub enum ClientError {
    /// The server asked us to slow down for this many seconds.
    RateLimited { seconds: u64 },
    /// The target's privacy settings forbid adding them to a group.
    PrivacyRestricted,
    /// The target must be a mutual contact before it can be added.
    NotMutualContact,
    /// The target is already a member of the group.
    AlreadyParticipant,
    /// The session's authorization is no longer valid (revoked, expired).
    AuthorizationLost,
    /// The phone number does not resolve to any account.
    PhoneUnresolvable,
    /// The operation is impossible on a broadcast channel (no direct adds).
    BroadcastTarget,
    /// Network / transport failure.
    Network(String),
    /// Any other server-side rejection.
    Other(String),
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RateLimited { seconds } => write!(f, "rate limited for {seconds}s"),
            Self::PrivacyRestricted       => write!(f, "privacy settings forbid this operation"),
            Self::NotMutualContact        => write!(f, "target is not a mutual contact"),
            Self::AlreadyParticipant      => write!(f, "target is already a participant"),
            Self::AuthorizationLost       => write!(f, "session authorization lost"),
            Self::PhoneUnresolvable       => write!(f, "phone number does not resolve to an account"),
            Self::BroadcastTarget         => write!(f, "broadcast channels do not accept direct adds"),
            Self::Network(e)              => write!(f, "network error: {e}"),
            Self::Other(e)                => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for ClientError {}

impl ClientError {
    /// If this is a rate limit, how many seconds the server asked us to wait.
    pub fn flood_wait_seconds(&self) -> Option<u64> {
        match self {
            Self::RateLimited { seconds } => Some(*seconds),
            _                             => None,
        }
    }

    /// Whether retrying the same identifier can never succeed.
    ///
    /// Permanent failures are blacklist candidates; everything else (privacy
    /// settings, contact requirements, rate limits) can change over time.
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::PhoneUnresolvable)
    }

    /// Whether the owning session should be evicted rather than retried.
    pub fn is_authorization_loss(&self) -> bool {
        matches!(self, Self::AuthorizationLost)
    }
}
