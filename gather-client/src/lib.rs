//! # gather-client
//!
//! The contract between the gather core and the messaging-network client.
//!
//! The core never speaks the wire protocol itself; it drives a
//! [`ClientHandle`] — one authenticated connection — through this trait, and
//! obtains new handles from a [`ClientFactory`]. A production binary plugs in
//! an MTProto-backed implementation; tests plug in scripted fakes.
//!
//! Error conditions are a closed set ([`ClientError`]) so callers dispatch on
//! variants, never on message text.

#![deny(unsafe_code)]

mod errors;
mod types;

pub use errors::ClientError;
pub use types::{GroupInfo, GroupKind, Identity, ScanOutcome, UserId};

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;

// ─── QrChallenge ──────────────────────────────────────────────────────────────

/// One pending QR login challenge.
///
/// The login URL is an opaque string; rendering it to a scannable image is
/// the caller's concern. [`QrChallenge::wait`] resolves when the challenge is
/// scanned (or fails); callers bound it with their own timeout.
#[async_trait]
pub trait QrChallenge: Send + Sync {
    /// The `tg://login` URL to render as a QR code.
    fn url(&self) -> &str;

    /// Block until the challenge is scanned and accepted.
    async fn wait(&self) -> Result<ScanOutcome, ClientError>;
}

// ─── ClientHandle ─────────────────────────────────────────────────────────────

/// A live, authenticated (or authenticating) connection bound to one account.
#[async_trait]
pub trait ClientHandle: Send + Sync {
    async fn connect(&self) -> Result<(), ClientError>;
    async fn disconnect(&self);
    fn is_connected(&self) -> bool;
    async fn is_authorized(&self) -> Result<bool, ClientError>;

    /// Lightweight self-lookup; doubles as the health-check probe.
    async fn get_me(&self) -> Result<Identity, ClientError>;

    /// Begin a QR login, excluding accounts that are already signed in
    /// elsewhere in the pool.
    async fn qr_login(&self, ignored: &[UserId]) -> Result<Box<dyn QrChallenge>, ClientError>;

    /// Complete a 2FA login with the account password.
    async fn sign_in_password(&self, password: &str) -> Result<(), ClientError>;

    /// Resolve a group id to its entity.
    async fn resolve_group(&self, group_id: i64) -> Result<GroupInfo, ClientError>;

    /// Groups this account is currently a member of (broadcast channels
    /// excluded).
    async fn dialog_groups(&self) -> Result<Vec<GroupInfo>, ClientError>;

    /// Self-join a publicly joinable group by username.
    async fn join_by_username(&self, username: &str) -> Result<(), ClientError>;

    /// Add another account to a group, using the primitive `group.kind`
    /// requires. `Err(AlreadyParticipant)` means the add was redundant, not
    /// failed.
    async fn invite_to_group(&self, group: &GroupInfo, user: UserId) -> Result<(), ClientError>;

    /// Export an invite link for the group. `None` for broadcast channels.
    async fn export_invite_link(&self, group: &GroupInfo) -> Result<Option<String>, ClientError>;

    /// Resolve a phone number to the account behind it.
    async fn resolve_phone(&self, phone: &str) -> Result<Identity, ClientError>;

    /// Phone numbers currently in this account's contact list.
    async fn contact_phones(&self) -> Result<HashSet<String>, ClientError>;

    /// Add a phone number to the contact list. Returns `false` when the
    /// number was already present.
    async fn import_contact(&self, phone: &str) -> Result<bool, ClientError>;

    /// Remove a phone number from the contact list.
    async fn delete_contact(&self, phone: &str) -> Result<(), ClientError>;

    /// Send a direct message to the account behind a phone number.
    async fn send_message(&self, phone: &str, text: &str) -> Result<(), ClientError>;

    /// Opaque credential material for durable persistence; a later
    /// [`ClientFactory::open_stored`] with these bytes restores the session.
    async fn export_credentials(&self) -> Result<Vec<u8>, ClientError>;

    /// Invalidate the authorization server-side.
    async fn log_out(&self) -> Result<(), ClientError>;
}

// ─── ClientFactory ────────────────────────────────────────────────────────────

/// Produces [`ClientHandle`]s.
#[async_trait]
pub trait ClientFactory: Send + Sync {
    /// A fresh, unauthenticated, non-persisted handle (QR attempts start
    /// here — nothing touches disk until the login succeeds).
    async fn open_ephemeral(&self) -> Result<Arc<dyn ClientHandle>, ClientError>;

    /// Reconnect a previously persisted session from its credential bytes.
    async fn open_stored(&self, credentials: &[u8]) -> Result<Arc<dyn ClientHandle>, ClientError>;
}
