//! Scripted in-memory client doubles for driving the core without a network.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use gather_client::{
    ClientError, ClientFactory, ClientHandle, GroupInfo, GroupKind, Identity, QrChallenge,
    ScanOutcome, UserId,
};
use gather_core::SessionDirs;

static DIR_SEQ: AtomicU64 = AtomicU64::new(0);

/// Fresh credential directory under the system temp dir, unique per call.
pub fn temp_dirs(tag: &str) -> SessionDirs {
    let seq = DIR_SEQ.fetch_add(1, Ordering::Relaxed);
    let root: PathBuf = std::env::temp_dir().join(format!(
        "gather-test-{}-{tag}-{seq}",
        std::process::id()
    ));
    SessionDirs::new(root)
}

/// Deterministic identity for a phone number, mirroring what the fake
/// handle's `resolve_phone` computes.
pub fn phone_id(phone: &str) -> UserId {
    let id = phone
        .bytes()
        .fold(7i64, |acc, b| acc.wrapping_mul(31).wrapping_add(b as i64));
    UserId(id.abs())
}

// ─── Fake handle ──────────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    ImportContact(String),
    DeleteContact(String),
    Invite(UserId),
    Join(String),
    Send(String, String),
}

#[derive(Default)]
pub struct Script {
    /// Error returned when inviting this user id; consumed errors repeat.
    pub invite_errors: HashMap<i64, ClientError>,
    /// Error returned from every `send_message`.
    pub send_error:    Option<ClientError>,
    /// Phones that fail resolution.
    pub unresolvable:  HashSet<String>,
    /// Artificial latency inside `invite_to_group`.
    pub invite_delay:  Duration,
}

pub struct FakeHandle {
    pub id:         UserId,
    pub script:     Script,
    connected:      AtomicBool,
    authorized:     AtomicBool,
    contacts:       Mutex<HashSet<String>>,
    events:         Mutex<Vec<Event>>,
    group:          GroupInfo,
    scan:           Mutex<Option<Result<ScanOutcome, ClientError>>>,
}

pub fn group(id: i64, kind: GroupKind) -> GroupInfo {
    GroupInfo {
        id,
        title: format!("group {id}"),
        username: None,
        kind,
        participant_count: 10,
    }
}

impl FakeHandle {
    pub fn new(id: i64) -> Self {
        Self {
            id:         UserId(id),
            script:     Script::default(),
            connected:  AtomicBool::new(false),
            authorized: AtomicBool::new(true),
            contacts:   Mutex::new(HashSet::new()),
            events:     Mutex::new(Vec::new()),
            group:      group(1000, GroupKind::Megagroup),
            scan:       Mutex::new(None),
        }
    }

    pub fn with_group(mut self, group: GroupInfo) -> Self {
        self.group = group;
        self
    }

    pub fn with_contact(self, phone: &str) -> Self {
        self.contacts.lock().unwrap().insert(phone.to_string());
        self
    }

    /// Script the outcome delivered when the QR challenge is awaited.
    /// Unscripted challenges never complete.
    pub fn with_scan(self, outcome: Result<ScanOutcome, ClientError>) -> Self {
        *self.scan.lock().unwrap() = Some(outcome);
        self
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn invites(&self) -> Vec<UserId> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Invite(id) => Some(id),
                _ => None,
            })
            .collect()
    }

    pub fn contains_contact(&self, phone: &str) -> bool {
        self.contacts.lock().unwrap().contains(phone)
    }

    pub fn set_authorized(&self, value: bool) {
        self.authorized.store(value, Ordering::SeqCst);
    }

    fn record(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }
}

struct FakeChallenge {
    url:  String,
    scan: Mutex<Option<Result<ScanOutcome, ClientError>>>,
}

#[async_trait]
impl QrChallenge for FakeChallenge {
    fn url(&self) -> &str {
        &self.url
    }

    async fn wait(&self) -> Result<ScanOutcome, ClientError> {
        let scripted = self.scan.lock().unwrap().take();
        match scripted {
            Some(outcome) => outcome,
            None          => std::future::pending().await,
        }
    }
}

#[async_trait]
impl ClientHandle for FakeHandle {
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
        Ok(self.authorized.load(Ordering::SeqCst))
    }

    async fn get_me(&self) -> Result<Identity, ClientError> {
        if !self.authorized.load(Ordering::SeqCst) {
            return Err(ClientError::AuthorizationLost);
        }
        Ok(Identity { id: self.id, username: None, first_name: None })
    }

    async fn qr_login(&self, _ignored: &[UserId]) -> Result<Box<dyn QrChallenge>, ClientError> {
        Ok(Box::new(FakeChallenge {
            url:  format!("tg://login?token=fake-{}", self.id),
            scan: Mutex::new(self.scan.lock().unwrap().take()),
        }))
    }

    async fn sign_in_password(&self, password: &str) -> Result<(), ClientError> {
        if password == "correct horse" {
            Ok(())
        } else {
            Err(ClientError::Other("invalid password".into()))
        }
    }

    async fn resolve_group(&self, group_id: i64) -> Result<GroupInfo, ClientError> {
        if group_id == self.group.id {
            Ok(self.group.clone())
        } else {
            Err(ClientError::Other(format!("unknown group {group_id}")))
        }
    }

    async fn dialog_groups(&self) -> Result<Vec<GroupInfo>, ClientError> {
        Ok(vec![self.group.clone()])
    }

    async fn join_by_username(&self, username: &str) -> Result<(), ClientError> {
        self.record(Event::Join(username.to_string()));
        Ok(())
    }

    async fn invite_to_group(&self, _group: &GroupInfo, user: UserId) -> Result<(), ClientError> {
        if !self.script.invite_delay.is_zero() {
            tokio::time::sleep(self.script.invite_delay).await;
        }
        if let Some(err) = self.script.invite_errors.get(&user.0) {
            return Err(err.clone());
        }
        self.record(Event::Invite(user));
        Ok(())
    }

    async fn export_invite_link(&self, group: &GroupInfo) -> Result<Option<String>, ClientError> {
        if group.kind == GroupKind::Broadcast {
            return Ok(None);
        }
        Ok(Some(format!("https://t.me/+fake{}", group.id)))
    }

    async fn resolve_phone(&self, phone: &str) -> Result<Identity, ClientError> {
        if self.script.unresolvable.contains(phone) {
            return Err(ClientError::PhoneUnresolvable);
        }
        Ok(Identity { id: phone_id(phone), username: None, first_name: None })
    }

    async fn contact_phones(&self) -> Result<HashSet<String>, ClientError> {
        Ok(self.contacts.lock().unwrap().clone())
    }

    async fn import_contact(&self, phone: &str) -> Result<bool, ClientError> {
        self.record(Event::ImportContact(phone.to_string()));
        Ok(self.contacts.lock().unwrap().insert(phone.to_string()))
    }

    async fn delete_contact(&self, phone: &str) -> Result<(), ClientError> {
        self.record(Event::DeleteContact(phone.to_string()));
        self.contacts.lock().unwrap().remove(phone);
        Ok(())
    }

    async fn send_message(&self, phone: &str, text: &str) -> Result<(), ClientError> {
        if let Some(err) = &self.script.send_error {
            return Err(err.clone());
        }
        self.record(Event::Send(phone.to_string(), text.to_string()));
        Ok(())
    }

    async fn export_credentials(&self) -> Result<Vec<u8>, ClientError> {
        Ok(self.id.0.to_le_bytes().to_vec())
    }

    async fn log_out(&self) -> Result<(), ClientError> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }
}

// ─── Fake factory ─────────────────────────────────────────────────────────────

/// Hands out pre-scripted handles for ephemeral opens and rebuilds handles
/// from credential bytes for stored opens.
#[derive(Default)]
pub struct FakeFactory {
    ephemeral: Mutex<VecDeque<Arc<FakeHandle>>>,
}

impl FakeFactory {
    pub fn push_ephemeral(&self, handle: Arc<FakeHandle>) {
        self.ephemeral.lock().unwrap().push_back(handle);
    }
}

#[async_trait]
impl ClientFactory for FakeFactory {
    async fn open_ephemeral(&self) -> Result<Arc<dyn ClientHandle>, ClientError> {
        self.ephemeral
            .lock()
            .unwrap()
            .pop_front()
            .map(|h| h as Arc<dyn ClientHandle>)
            .ok_or_else(|| ClientError::Network("no scripted handle".into()))
    }

    async fn open_stored(&self, credentials: &[u8]) -> Result<Arc<dyn ClientHandle>, ClientError> {
        let mut bytes = [0u8; 8];
        for (slot, b) in bytes.iter_mut().zip(credentials) {
            *slot = *b;
        }
        Ok(Arc::new(FakeHandle::new(i64::from_le_bytes(bytes))))
    }
}
