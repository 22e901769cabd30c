//! Entity value types shared between the core and client implementations.

use std::fmt;

// ─── UserId ───────────────────────────────────────────────────────────────────

/// The network-wide unique id of an account.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UserId(pub i64);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ─── Identity ─────────────────────────────────────────────────────────────────

/// The authenticated account behind a handle (`get_me`).
#[derive(Clone, Debug, PartialEq)]
pub struct Identity {
    pub id:         UserId,
    pub username:   Option<String>,
    pub first_name: Option<String>,
}

// ─── GroupKind ────────────────────────────────────────────────────────────────

/// Which add primitive a group accepts.
///
/// | Variant | Direct add | Invite link |
/// |---------|-----------|-------------|
/// | `Chat` | add-to-chat | yes |
/// | `Megagroup` | invite-to-channel | yes |
/// | `Broadcast` | none | no |
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GroupKind {
    /// Small (legacy) group chat.
    Chat,
    /// Supergroup — channel infrastructure, group semantics.
    Megagroup,
    /// Broadcast channel — members cannot be added directly.
    Broadcast,
}

impl GroupKind {
    /// Broadcast channels accept neither direct adds nor invite links.
    pub fn accepts_members(&self) -> bool {
        !matches!(self, Self::Broadcast)
    }
}

// ─── GroupInfo ────────────────────────────────────────────────────────────────

/// A resolved group entity.
#[derive(Clone, Debug, PartialEq)]
pub struct GroupInfo {
    pub id:                i64,
    pub title:             String,
    pub username:          Option<String>,
    pub kind:              GroupKind,
    pub participant_count: i32,
}

impl GroupInfo {
    /// Whether any session can join on its own (public username present).
    pub fn publicly_joinable(&self) -> bool {
        self.username.as_deref().is_some_and(|u| !u.is_empty())
    }
}

// ─── ScanOutcome ──────────────────────────────────────────────────────────────

/// What a completed QR scan wait reports.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScanOutcome {
    /// The scan completed and the handle is fully authorized.
    Authorized,
    /// The account has 2FA enabled; a password must be supplied next.
    PasswordRequired,
}
