//! Dry-run client — logs the actions a live client would take.
//!
//! Stored sessions open successfully (identity derived from the credential
//! bytes), so queue drains can be rehearsed end to end without touching the
//! network. QR login is refused; authenticating new sessions needs a real
//! client.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tracing::info;

use gather_client::{
    ClientError, ClientFactory, ClientHandle, GroupInfo, GroupKind, Identity, QrChallenge, UserId,
};

pub struct DryRunHandle {
    id:        UserId,
    connected: AtomicBool,
}

#[async_trait]
impl ClientHandle for DryRunHandle {
    async fn connect(&self) -> Result<(), ClientError> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn is_authorized(&self) -> Result<bool, ClientError> {
        Ok(true)
    }

    async fn get_me(&self) -> Result<Identity, ClientError> {
        Ok(Identity {
            id:         self.id,
            username:   None,
            first_name: Some(format!("dry-run {}", self.id)),
        })
    }

    async fn qr_login(&self, _ignored: &[UserId]) -> Result<Box<dyn QrChallenge>, ClientError> {
        Err(ClientError::Other("dry-run client cannot issue QR challenges".into()))
    }

    async fn sign_in_password(&self, _password: &str) -> Result<(), ClientError> {
        Err(ClientError::Other("dry-run client cannot sign in".into()))
    }

    async fn resolve_group(&self, group_id: i64) -> Result<GroupInfo, ClientError> {
        Ok(GroupInfo {
            id:                group_id,
            title:             format!("dry-run group {group_id}"),
            username:          None,
            kind:              GroupKind::Megagroup,
            participant_count: 0,
        })
    }

    async fn dialog_groups(&self) -> Result<Vec<GroupInfo>, ClientError> {
        Ok(Vec::new())
    }

    async fn join_by_username(&self, username: &str) -> Result<(), ClientError> {
        info!(session = %self.id, username, "dry-run: would join group");
        Ok(())
    }

    async fn invite_to_group(&self, group: &GroupInfo, user: UserId) -> Result<(), ClientError> {
        info!(session = %self.id, group = group.id, user = %user, "dry-run: would add user");
        Ok(())
    }

    async fn export_invite_link(&self, group: &GroupInfo) -> Result<Option<String>, ClientError> {
        Ok(Some(format!("https://t.me/+dryrun{}", group.id)))
    }

    async fn resolve_phone(&self, phone: &str) -> Result<Identity, ClientError> {
        // Deterministic fake identity so repeated runs look the same.
        let id = phone.bytes().fold(0i64, |acc, b| acc.wrapping_mul(31).wrapping_add(b as i64));
        Ok(Identity { id: UserId(id.abs()), username: None, first_name: None })
    }

    async fn contact_phones(&self) -> Result<HashSet<String>, ClientError> {
        Ok(HashSet::new())
    }

    async fn import_contact(&self, phone: &str) -> Result<bool, ClientError> {
        info!(session = %self.id, phone, "dry-run: would import contact");
        Ok(true)
    }

    async fn delete_contact(&self, phone: &str) -> Result<(), ClientError> {
        info!(session = %self.id, phone, "dry-run: would delete contact");
        Ok(())
    }

    async fn send_message(&self, phone: &str, _text: &str) -> Result<(), ClientError> {
        info!(session = %self.id, phone, "dry-run: would send invite message");
        Ok(())
    }

    async fn export_credentials(&self) -> Result<Vec<u8>, ClientError> {
        Ok(self.id.0.to_le_bytes().to_vec())
    }

    async fn log_out(&self) -> Result<(), ClientError> {
        info!(session = %self.id, "dry-run: would log out");
        Ok(())
    }
}

#[derive(Default)]
pub struct DryRunFactory;

#[async_trait]
impl ClientFactory for DryRunFactory {
    async fn open_ephemeral(&self) -> Result<Arc<dyn ClientHandle>, ClientError> {
        Err(ClientError::Other("dry-run factory cannot open ephemeral clients".into()))
    }

    async fn open_stored(&self, credentials: &[u8]) -> Result<Arc<dyn ClientHandle>, ClientError> {
        let mut bytes = [0u8; 8];
        for (slot, b) in bytes.iter_mut().zip(credentials) {
            *slot = *b;
        }
        Ok(Arc::new(DryRunHandle {
            id:        UserId(i64::from_le_bytes(bytes)),
            connected: AtomicBool::new(false),
        }))
    }
}
