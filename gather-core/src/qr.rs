//! QR auth state machine — drives one login attempt from issuance to a
//! terminal outcome.
//!
//! ```text
//! generating → waiting → scanned            → persisted
//!                      → password_required  → persisted | error
//!                      → duplicate | expired | error
//! ```
//!
//! `persisted`, `duplicate`, `expired` and `error` are terminal. A terminal
//! state is observed exactly once by the polling caller; after removal, a
//! persisted success is still reported via session existence in the store.
//!
//! The central invariant lives in the persistence step: a session is never
//! created for a network identity that already has one.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::json;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::timeout;
use tracing::{error, info, warn};

use gather_client::{ClientError, ClientFactory, ClientHandle, QrChallenge, ScanOutcome};
use gather_store::{SessionRole, SessionStatus, Store};

use crate::errors::CoreError;
use crate::registry::Registry;
use crate::settings::KEY_ADMIN_GROUPS;

/// Simultaneous QR challenge generations.
const ISSUE_CONCURRENCY: usize = 5;

// ─── Config ───────────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug)]
pub struct QrConfig {
    /// Hard deadline for the scan to arrive.
    pub scan_timeout: Duration,
    /// Attempts idle longer than this are reaped by the janitor.
    pub attempt_ttl:  Duration,
}

impl Default for QrConfig {
    fn default() -> Self {
        Self {
            scan_timeout: Duration::from_secs(300),
            attempt_ttl:  Duration::from_secs(600),
        }
    }
}

// ─── States ───────────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum QrState {
    Generating,
    Waiting,
    Scanned,
    PasswordRequired,
    Persisted,
    Duplicate,
    Expired,
    Error,
}

impl QrState {
    fn is_terminal(&self) -> bool {
        matches!(self, Self::Persisted | Self::Duplicate | Self::Expired | Self::Error)
    }

    fn as_str(&self) -> &'static str {
        match self {
            Self::Generating       => "generating",
            Self::Waiting          => "waiting",
            Self::Scanned          => "scanned",
            Self::PasswordRequired => "password_required",
            Self::Persisted        => "persisted",
            Self::Duplicate        => "duplicate",
            Self::Expired          => "expired",
            Self::Error            => "error",
        }
    }
}

/// What a status poll reports.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QrStatus {
    /// Challenge issued; no scan yet.
    Waiting,
    /// The account needs its 2FA password next.
    PasswordRequired,
    /// Session persisted and registered.
    Success,
    /// This identity already has a session; none was created.
    Duplicate,
    /// No scan arrived within the deadline.
    Expired,
    /// The attempt failed.
    Error,
    /// Unknown attempt (or already observed and reaped).
    NotFound,
}

/// Result of issuing a challenge — the URL is opaque; rendering it to a
/// scannable image is the caller's concern.
#[derive(Clone, Debug)]
pub struct IssuedQr {
    pub name: String,
    pub url:  String,
}

// ─── QrManager ────────────────────────────────────────────────────────────────

struct Attempt {
    role:         SessionRole,
    state:        QrState,
    created_at:   Instant,
    /// Held only while awaiting the second factor.
    handle:       Option<Arc<dyn ClientHandle>>,
    operation_id: Option<i64>,
}

struct Shared {
    store:    Arc<Store>,
    factory:  Arc<dyn ClientFactory>,
    registry: Arc<Registry>,
    config:   QrConfig,
    attempts: Mutex<HashMap<String, Attempt>>,
    limiter:  Semaphore,
    counter:  AtomicU64,
}

/// Cheaply cloneable front; spawned await tasks and the janitor share the
/// same state.
#[derive(Clone)]
pub struct QrManager {
    shared: Arc<Shared>,
}

impl QrManager {
    pub fn new(
        store: Arc<Store>,
        factory: Arc<dyn ClientFactory>,
        registry: Arc<Registry>,
        config: QrConfig,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                store,
                factory,
                registry,
                config,
                attempts: Mutex::new(HashMap::new()),
                limiter:  Semaphore::new(ISSUE_CONCURRENCY),
                counter:  AtomicU64::new(1),
            }),
        }
    }

    /// Start a login attempt: open a fresh in-memory handle, request a QR
    /// challenge, and spawn the scan waiter. Issuance is bounded by a
    /// fixed-size admission limiter.
    pub async fn issue(&self, role: SessionRole) -> Result<IssuedQr, CoreError> {
        Arc::clone(&self.shared).issue(role).await
    }

    /// Apply the second factor to the retained handle. Valid only from
    /// `password_required`; any failure discards the handle.
    pub async fn submit_password(&self, name: &str, password: &str) -> Result<QrStatus, CoreError> {
        self.shared.submit_password(name, password).await
    }

    /// Idempotent peek; the first observation of a terminal state removes
    /// the attempt. A later query for a persisted success is answered by
    /// session existence in the store.
    pub async fn status(&self, name: &str) -> Result<QrStatus, CoreError> {
        self.shared.status(name).await
    }

    /// Reap attempts idle past the TTL. Returns how many were reaped.
    pub async fn janitor_sweep(&self) -> usize {
        self.shared.janitor_sweep().await
    }

    /// Spawn the periodic janitor. The task runs until the process exits.
    pub fn spawn_janitor(&self, interval: Duration) {
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                shared.janitor_sweep().await;
            }
        });
    }
}

impl Shared {
    fn next_attempt_name(&self, role: SessionRole) -> String {
        let millis = Utc::now().timestamp_millis() % 1_000_000;
        let seq = self.counter.fetch_add(1, Ordering::Relaxed);
        match role {
            SessionRole::User  => format!("Session_{millis}_{seq:04}"),
            SessionRole::Admin => format!("Admin_Session_{millis}_{seq:04}"),
        }
    }

    // ─── Issue ────────────────────────────────────────────────────────────

    async fn issue(self: Arc<Self>, role: SessionRole) -> Result<IssuedQr, CoreError> {
        if role == SessionRole::Admin {
            self.guard_admin_attempt().await?;
        }

        let _permit = self
            .limiter
            .acquire()
            .await
            .map_err(|_| CoreError::Client(ClientError::Other("issuance closed".into())))?;

        let name = self.next_attempt_name(role);
        let op_kind = match role {
            SessionRole::User  => "qr_scanning",
            SessionRole::Admin => "admin_qr_scanning",
        };
        let operation_id = self
            .store
            .begin_operation(op_kind, &format!("QR login attempt {name}"))
            .ok();

        self.attempts.lock().await.insert(
            name.clone(),
            Attempt {
                role,
                state:      QrState::Generating,
                created_at: Instant::now(),
                handle:     None,
                operation_id,
            },
        );

        match Self::generate(&self, &name).await {
            Ok(url) => Ok(IssuedQr { name, url }),
            Err(e) => {
                error!(attempt = %name, error = %e, "QR generation failed");
                if let Some(a) = self.attempts.lock().await.remove(&name) {
                    if let Some(op) = a.operation_id {
                        let _ = self.store.finish_operation(op, "failed", None);
                    }
                }
                Err(e)
            }
        }
    }

    async fn generate(this: &Arc<Self>, name: &str) -> Result<String, CoreError> {
        let handle = this.factory.open_ephemeral().await?;
        handle.connect().await?;

        // Identities already in the pool must not log in twice.
        let ignored = this.registry.active_identities().await;
        let challenge = match handle.qr_login(&ignored).await {
            Ok(c)  => c,
            Err(e) => {
                handle.disconnect().await;
                return Err(e.into());
            }
        };
        let url = challenge.url().to_string();

        // The attempt must already read `waiting` before the waiter exists:
        // a fast scan can reach a terminal state before this function
        // returns, and terminal states are never overwritten.
        this.set_state(name, QrState::Waiting).await;

        let shared = Arc::clone(this);
        let attempt_name = name.to_string();
        tokio::spawn(async move {
            shared.await_scan(attempt_name, handle, challenge).await;
        });
        Ok(url)
    }

    async fn guard_admin_attempt(&self) -> Result<(), CoreError> {
        if self.store.admin_session()?.is_some() {
            return Err(CoreError::AdminAttemptRefused(
                "an admin session already exists; remove it first".into(),
            ));
        }
        let attempts = self.attempts.lock().await;
        let live = attempts
            .values()
            .any(|a| a.role == SessionRole::Admin && !a.state.is_terminal());
        if live {
            return Err(CoreError::AdminAttemptRefused(
                "an admin QR attempt is already in progress".into(),
            ));
        }
        Ok(())
    }

    // ─── Await ────────────────────────────────────────────────────────────

    async fn await_scan(
        self: Arc<Self>,
        name: String,
        handle: Arc<dyn ClientHandle>,
        challenge: Box<dyn QrChallenge>,
    ) {
        match timeout(self.config.scan_timeout, challenge.wait()).await {
            Ok(Ok(ScanOutcome::Authorized)) => {
                self.set_state(&name, QrState::Scanned).await;
                self.persist(&name, handle).await;
            }
            Ok(Ok(ScanOutcome::PasswordRequired)) => {
                info!(attempt = %name, "2FA required");
                let mut attempts = self.attempts.lock().await;
                if let Some(a) = attempts.get_mut(&name) {
                    a.state  = QrState::PasswordRequired;
                    a.handle = Some(handle);
                } else {
                    drop(attempts);
                    handle.disconnect().await;
                }
            }
            Ok(Err(e)) => {
                warn!(attempt = %name, error = %e, "QR scan failed");
                self.fail(&name, &handle, QrState::Error).await;
            }
            Err(_) => {
                info!(attempt = %name, "QR challenge expired");
                self.fail(&name, &handle, QrState::Expired).await;
            }
        }
    }

    // ─── Password submission ──────────────────────────────────────────────

    async fn submit_password(&self, name: &str, password: &str) -> Result<QrStatus, CoreError> {
        let handle = {
            let mut attempts = self.attempts.lock().await;
            let a = attempts
                .get_mut(name)
                .ok_or_else(|| CoreError::AttemptNotFound(name.to_string()))?;
            if a.state != QrState::PasswordRequired {
                return Err(CoreError::InvalidAttemptState {
                    name:  name.to_string(),
                    state: a.state.as_str(),
                });
            }
            a.handle
                .take()
                .ok_or_else(|| CoreError::AttemptNotFound(name.to_string()))?
        };

        match handle.sign_in_password(password).await {
            Ok(()) if handle.is_authorized().await.unwrap_or(false) => {
                self.persist(name, handle).await;
            }
            Ok(()) => {
                warn!(attempt = %name, "password accepted but handle unauthorized");
                self.fail(name, &handle, QrState::Error).await;
            }
            Err(e) => {
                warn!(attempt = %name, error = %e, "2FA password rejected");
                self.fail(name, &handle, QrState::Error).await;
            }
        }
        self.status(name).await
    }

    // ─── Persistence ──────────────────────────────────────────────────────

    /// Shared terminal path for the no-2FA and 2FA-complete flows: duplicate
    /// check against the live registry, credential write, store row,
    /// registration.
    async fn persist(&self, name: &str, handle: Arc<dyn ClientHandle>) {
        let role = match self.attempt_role(name).await {
            Some(r) => r,
            None => {
                // Reaped while we were scanning; nothing to persist into.
                handle.disconnect().await;
                return;
            }
        };

        let me = match handle.get_me().await {
            Ok(me) => me,
            Err(e) => {
                warn!(attempt = %name, error = %e, "self-lookup failed during persistence");
                self.fail(name, &handle, QrState::Error).await;
                return;
            }
        };

        // At most one session per network identity — ever.
        if let Some(existing) = self.registry.identity_of(me.id).await {
            info!(attempt = %name, user_id = %me.id, existing = %existing,
                  "identity already has a session");
            handle.disconnect().await;
            self.set_state(name, QrState::Duplicate).await;
            return;
        }

        let persisted: Result<(), CoreError> = async {
            let creds = handle.export_credentials().await?;
            self.registry
                .dirs()
                .write_credentials(role, name, &creds)?;
            self.store
                .create_session(name, role, SessionStatus::Active, Some(me.id.0))?;
            Ok(())
        }
        .await;

        if let Err(e) = persisted {
            error!(attempt = %name, error = %e, "session persistence failed");
            self.fail(name, &handle, QrState::Error).await;
            return;
        }

        self.registry
            .register(role, name, Arc::clone(&handle), me.id)
            .await;

        if role == SessionRole::Admin {
            self.cache_admin_groups(&*handle).await;
        }

        info!(attempt = %name, user_id = %me.id, "session persisted");
        self.set_state(name, QrState::Persisted).await;
    }

    /// One-time fetch of the admin identity's group memberships, cached for
    /// later target-group selection.
    async fn cache_admin_groups(&self, handle: &dyn ClientHandle) {
        match handle.dialog_groups().await {
            Ok(groups) => {
                let value = json!(
                    groups
                        .iter()
                        .map(|g| {
                            json!({
                                "id": g.id,
                                "title": g.title,
                                "username": g.username,
                                "participants_count": g.participant_count,
                            })
                        })
                        .collect::<Vec<_>>()
                );
                if let Err(e) = self.store.set_setting(KEY_ADMIN_GROUPS, &value) {
                    warn!(error = %e, "failed to cache admin groups");
                }
            }
            Err(e) => warn!(error = %e, "failed to fetch admin groups"),
        }
    }

    // ─── Status query ─────────────────────────────────────────────────────

    async fn status(&self, name: &str) -> Result<QrStatus, CoreError> {
        let mut attempts = self.attempts.lock().await;
        let Some(a) = attempts.get(name) else {
            drop(attempts);
            // Persisted successes outlive their attempt record.
            if let Some(row) = self.store.session(name)? {
                if row.status == SessionStatus::Active {
                    return Ok(QrStatus::Success);
                }
            }
            return Ok(QrStatus::NotFound);
        };

        let state = a.state;
        if !state.is_terminal() {
            return Ok(match state {
                QrState::PasswordRequired => QrStatus::PasswordRequired,
                _                         => QrStatus::Waiting,
            });
        }

        // Terminal: observed once, then gone.
        let Some(a) = attempts.remove(name) else {
            return Ok(QrStatus::NotFound);
        };
        drop(attempts);
        if let Some(op) = a.operation_id {
            let (op_status, detail) = match state {
                QrState::Persisted | QrState::Duplicate => ("completed", json!({"result": state.as_str()})),
                _ => ("failed", json!({"reason": state.as_str()})),
            };
            let _ = self.store.finish_operation(op, op_status, Some(&detail));
        }
        Ok(match state {
            QrState::Persisted => QrStatus::Success,
            QrState::Duplicate => QrStatus::Duplicate,
            QrState::Expired   => QrStatus::Expired,
            _                  => QrStatus::Error,
        })
    }

    // ─── Janitor ──────────────────────────────────────────────────────────

    /// Reap attempts idle past the TTL: disconnect any held handle, delete
    /// stray credential files, drop the record.
    async fn janitor_sweep(&self) -> usize {
        let ttl = self.config.attempt_ttl;
        let stale: Vec<(String, Attempt)> = {
            let mut attempts = self.attempts.lock().await;
            let names: Vec<String> = attempts
                .iter()
                .filter(|(_, a)| a.created_at.elapsed() > ttl)
                .map(|(n, _)| n.clone())
                .collect();
            names
                .into_iter()
                .filter_map(|n| attempts.remove(&n).map(|a| (n, a)))
                .collect()
        };

        let reaped = stale.len();
        for (name, attempt) in stale {
            info!(attempt = %name, state = attempt.state.as_str(), "reaping stale QR attempt");
            if let Some(handle) = attempt.handle {
                handle.disconnect().await;
            }
            // Only delete credential files that never became a session.
            if matches!(self.store.session(&name), Ok(None)) {
                self.registry.dirs().remove_credentials(&name);
            }
            if let Some(op) = attempt.operation_id {
                let _ = self.store.finish_operation(op, "failed", Some(&json!({"reason": "expired"})));
            }
        }
        reaped
    }

    // ─── Internals ────────────────────────────────────────────────────────

    async fn attempt_role(&self, name: &str) -> Option<SessionRole> {
        self.attempts.lock().await.get(name).map(|a| a.role)
    }

    async fn set_state(&self, name: &str, state: QrState) {
        if let Some(a) = self.attempts.lock().await.get_mut(name) {
            // Terminal states stay terminal until observed.
            if !a.state.is_terminal() {
                a.state = state;
            }
        }
    }

    /// Non-success terminal transition: disconnect the handle and delete any
    /// partially written credential material.
    async fn fail(&self, name: &str, handle: &Arc<dyn ClientHandle>, terminal: QrState) {
        handle.disconnect().await;
        if matches!(self.store.session(name), Ok(None)) {
            self.registry.dirs().remove_credentials(name);
        }
        self.set_state(name, terminal).await;
    }
}
