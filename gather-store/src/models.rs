//! Record types persisted by the store.

use std::fmt;

// ─── SessionRole ──────────────────────────────────────────────────────────────

/// Which partition a session belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionRole {
    User,
    Admin,
}

impl SessionRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User  => "user",
            Self::Admin => "admin",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user"  => Some(Self::User),
            "admin" => Some(Self::Admin),
            _       => None,
        }
    }
}

impl fmt::Display for SessionRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── SessionStatus ────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionStatus {
    Pending,
    Active,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active  => "active",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "active"  => Some(Self::Active),
            _         => None,
        }
    }
}

// ─── SessionRecord ────────────────────────────────────────────────────────────

/// A persisted session identity. The credential material itself lives in a
/// separate file; this row only names it.
#[derive(Clone, Debug)]
pub struct SessionRecord {
    pub name:       String,
    pub role:       SessionRole,
    pub status:     SessionStatus,
    pub user_id:    Option<i64>,
    pub created_at: String,
    pub last_used:  Option<String>,
}

// ─── TargetStatus ─────────────────────────────────────────────────────────────

/// Queue status of a target phone number.
///
/// Transitions are one-directional: `Pending` → {`Added`, `Invited`,
/// `Failed`}. Nothing leaves a terminal status without operator action.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TargetStatus {
    Pending,
    Added,
    Invited,
    Failed,
}

impl TargetStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Added   => "added",
            Self::Invited => "invited",
            Self::Failed  => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "added"   => Some(Self::Added),
            "invited" => Some(Self::Invited),
            "failed"  => Some(Self::Failed),
            _         => None,
        }
    }
}

impl fmt::Display for TargetStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── TargetRecord ─────────────────────────────────────────────────────────────

/// A queued phone number awaiting group addition.
#[derive(Clone, Debug)]
pub struct TargetRecord {
    pub phone:        String,
    pub status:       TargetStatus,
    pub added_at:     String,
    pub processed_at: Option<String>,
}

// ─── QueueStats ───────────────────────────────────────────────────────────────

/// Observability counters over the queue and session tables.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub pending_targets: u64,
    pub added_targets:   u64,
    pub invited_targets: u64,
    pub failed_targets:  u64,
    pub total_sessions:  u64,
    pub active_sessions: u64,
}
