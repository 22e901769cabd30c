//! Session registry — the single source of truth for which sessions are
//! currently loaded as live client handles.
//!
//! Two partitions (`user` and `admin`), one mutex over all mutation. The
//! identity → session mapping is derived from the live registry contents on
//! every lookup, never maintained as a second map that could drift.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use gather_client::{ClientFactory, ClientHandle, UserId};
use gather_store::{SessionRole, Store};

use crate::errors::CoreError;
use crate::settings::KEY_USER_AS_ADMIN;

/// Concurrent connection attempts during load-all.
const LOAD_CONCURRENCY: usize = 5;

// ─── SessionDirs ──────────────────────────────────────────────────────────────

/// Layout of on-disk credential material: `<root>/users/<name>.session` and
/// `<root>/admins/<name>.session`.
#[derive(Clone, Debug)]
pub struct SessionDirs {
    root: PathBuf,
}

impl SessionDirs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn dir(&self, role: SessionRole) -> PathBuf {
        match role {
            SessionRole::User  => self.root.join("users"),
            SessionRole::Admin => self.root.join("admins"),
        }
    }

    pub fn credential_path(&self, role: SessionRole, name: &str) -> PathBuf {
        self.dir(role).join(format!("{name}.session"))
    }

    pub fn ensure(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(self.dir(SessionRole::User))?;
        std::fs::create_dir_all(self.dir(SessionRole::Admin))?;
        Ok(())
    }

    /// Write credential material; the parent directory is created on demand.
    pub fn write_credentials(
        &self,
        role: SessionRole,
        name: &str,
        bytes: &[u8],
    ) -> std::io::Result<()> {
        std::fs::create_dir_all(self.dir(role))?;
        std::fs::write(self.credential_path(role, name), bytes)
    }

    pub fn read_credentials(&self, role: SessionRole, name: &str) -> std::io::Result<Vec<u8>> {
        std::fs::read(self.credential_path(role, name))
    }

    /// Delete credential files in both partitions, best-effort.
    pub fn remove_credentials(&self, name: &str) {
        for role in [SessionRole::User, SessionRole::Admin] {
            let path = self.credential_path(role, name);
            if path.exists() {
                if let Err(e) = std::fs::remove_file(&path) {
                    warn!(session = name, error = %e, "failed to remove credential file");
                }
            }
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

// ─── Registry ─────────────────────────────────────────────────────────────────

struct Loaded {
    handle:  Arc<dyn ClientHandle>,
    user_id: UserId,
}

#[derive(Default)]
struct Inner {
    users:  HashMap<String, Loaded>,
    admins: HashMap<String, Loaded>,
}

pub struct Registry {
    store:      Arc<Store>,
    factory:    Arc<dyn ClientFactory>,
    dirs:       SessionDirs,
    inner:      Mutex<Inner>,
    load_limit: Arc<Semaphore>,
}

enum LoadOutcome {
    Loaded { name: String, handle: Arc<dyn ClientHandle>, user_id: UserId },
    MissingFile { name: String },
    Unauthorized { name: String, handle: Arc<dyn ClientHandle> },
    Failed { name: String },
}

impl Registry {
    pub fn new(store: Arc<Store>, factory: Arc<dyn ClientFactory>, dirs: SessionDirs) -> Self {
        Self {
            store,
            factory,
            dirs,
            inner:      Mutex::new(Inner::default()),
            load_limit: Arc::new(Semaphore::new(LOAD_CONCURRENCY)),
        }
    }

    pub fn dirs(&self) -> &SessionDirs {
        &self.dirs
    }

    // ─── Load-all ─────────────────────────────────────────────────────────

    /// Load every `active` user session from durable storage that is not
    /// already live. Sessions with a missing credential file are skipped;
    /// sessions that fail authorization are scheduled for removal.
    pub async fn load_all(&self) -> Result<usize, CoreError> {
        let rows = self.store.active_sessions(SessionRole::User)?;
        let to_load: Vec<String> = {
            let inner = self.inner.lock().await;
            rows.iter()
                .map(|r| r.name.clone())
                .filter(|name| !inner.users.contains_key(name))
                .collect()
        };
        if to_load.is_empty() {
            return Ok(0);
        }
        debug!(count = to_load.len(), "loading sessions from storage");

        let mut set = JoinSet::new();
        for name in to_load {
            let factory = Arc::clone(&self.factory);
            let limiter = Arc::clone(&self.load_limit);
            let dirs    = self.dirs.clone();
            set.spawn(async move {
                let Ok(_permit) = limiter.acquire_owned().await else {
                    return LoadOutcome::Failed { name };
                };
                load_one(&*factory, &dirs, name).await
            });
        }

        let mut loaded = 0;
        let mut to_remove = Vec::new();
        while let Some(res) = set.join_next().await {
            let outcome = match res {
                Ok(o)  => o,
                Err(e) => {
                    warn!(error = %e, "session load task failed");
                    continue;
                }
            };
            match outcome {
                LoadOutcome::Loaded { name, handle, user_id } => {
                    let mut inner = self.inner.lock().await;
                    inner.users.insert(name.clone(), Loaded { handle, user_id });
                    loaded += 1;
                    info!(session = %name, "session loaded");
                }
                LoadOutcome::MissingFile { name } => {
                    warn!(session = %name, "credential file missing, skipping");
                }
                LoadOutcome::Unauthorized { name, handle } => {
                    warn!(session = %name, "session no longer authorized, removing");
                    handle.disconnect().await;
                    to_remove.push(name);
                }
                LoadOutcome::Failed { name } => {
                    warn!(session = %name, "session failed to load");
                }
            }
        }
        for name in to_remove {
            self.remove(&name).await?;
        }
        Ok(loaded)
    }

    // ─── Registration (called by the QR state machine) ───────────────────

    pub async fn register(
        &self,
        role: SessionRole,
        name: &str,
        handle: Arc<dyn ClientHandle>,
        user_id: UserId,
    ) {
        let mut inner = self.inner.lock().await;
        let map = match role {
            SessionRole::User  => &mut inner.users,
            SessionRole::Admin => &mut inner.admins,
        };
        map.insert(name.to_string(), Loaded { handle, user_id });
    }

    // ─── Lookups ──────────────────────────────────────────────────────────

    /// The session name bound to a network identity, if any. Derived from
    /// live registry contents on every call.
    pub async fn identity_of(&self, user_id: UserId) -> Option<String> {
        let inner = self.inner.lock().await;
        inner
            .users
            .iter()
            .chain(inner.admins.iter())
            .find(|(_, l)| l.user_id == user_id)
            .map(|(name, _)| name.clone())
    }

    /// Identities of every live handle — the QR ignore set.
    pub async fn active_identities(&self) -> Vec<UserId> {
        let inner = self.inner.lock().await;
        inner
            .users
            .values()
            .chain(inner.admins.values())
            .map(|l| l.user_id)
            .collect()
    }

    pub async fn get_user(&self, name: &str) -> Option<(Arc<dyn ClientHandle>, UserId)> {
        let inner = self.inner.lock().await;
        inner
            .users
            .get(name)
            .map(|l| (Arc::clone(&l.handle), l.user_id))
    }

    pub async fn loaded_user_count(&self) -> usize {
        self.inner.lock().await.users.len()
    }

    // ─── Admin handle ─────────────────────────────────────────────────────

    /// The privileged handle: cached if healthy, loaded from storage
    /// otherwise, falling back to the first healthy user handle when the
    /// `use_user_as_admin` flag is set. `None` when nothing qualifies.
    pub async fn admin_handle(&self) -> Result<Option<(String, Arc<dyn ClientHandle>)>, CoreError> {
        // 1. Cached admin, if still healthy.
        let cached = {
            let inner = self.inner.lock().await;
            inner
                .admins
                .iter()
                .next()
                .map(|(name, l)| (name.clone(), Arc::clone(&l.handle)))
        };
        if let Some((name, handle)) = cached {
            if handle_is_healthy(&*handle).await {
                return Ok(Some((name, handle)));
            }
            warn!(session = %name, "cached admin handle unhealthy, dropping");
            self.inner.lock().await.admins.remove(&name);
        }

        // 2. Load the admin session from storage.
        if let Some(row) = self.store.admin_session()? {
            match self.dirs.read_credentials(SessionRole::Admin, &row.name) {
                Ok(bytes) => match self.factory.open_stored(&bytes).await {
                    Ok(handle) => {
                        if handle.connect().await.is_ok()
                            && handle.is_authorized().await.unwrap_or(false)
                        {
                            if let Ok(me) = handle.get_me().await {
                                self.register(SessionRole::Admin, &row.name, Arc::clone(&handle), me.id)
                                    .await;
                                info!(session = %row.name, "admin session loaded");
                                return Ok(Some((row.name, handle)));
                            }
                        }
                        handle.disconnect().await;
                        warn!(session = %row.name, "admin session failed authorization");
                    }
                    Err(e) => warn!(session = %row.name, error = %e, "admin session open failed"),
                },
                Err(e) => warn!(session = %row.name, error = %e, "admin credential file unreadable"),
            }
        }

        // 3. Operator fallback: first healthy user handle stands in.
        let use_user = self
            .store
            .get_setting(KEY_USER_AS_ADMIN)?
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        if use_user {
            let users: Vec<(String, Arc<dyn ClientHandle>)> = {
                let inner = self.inner.lock().await;
                inner
                    .users
                    .iter()
                    .map(|(n, l)| (n.clone(), Arc::clone(&l.handle)))
                    .collect()
            };
            for (name, handle) in users {
                if handle_is_healthy(&*handle).await {
                    info!(session = %name, "using user session as admin");
                    return Ok(Some((name, handle)));
                }
            }
        }
        Ok(None)
    }

    // ─── Health check ─────────────────────────────────────────────────────

    /// Reconnect and re-verify every loaded handle; evict (memory + row +
    /// credential file) any that fail. Returns the number evicted.
    pub async fn health_check(&self) -> Result<usize, CoreError> {
        let snapshot: Vec<(String, Arc<dyn ClientHandle>)> = {
            let inner = self.inner.lock().await;
            inner
                .users
                .iter()
                .chain(inner.admins.iter())
                .map(|(n, l)| (n.clone(), Arc::clone(&l.handle)))
                .collect()
        };

        let mut evicted = 0;
        for (name, handle) in snapshot {
            if handle_is_healthy(&*handle).await {
                debug!(session = %name, "health check passed");
                continue;
            }
            warn!(session = %name, "health check failed, evicting");
            {
                let mut inner = self.inner.lock().await;
                inner.users.remove(&name);
                inner.admins.remove(&name);
            }
            handle.disconnect().await;
            self.store.delete_session(&name)?;
            self.dirs.remove_credentials(&name);
            evicted += 1;
        }
        if evicted > 0 {
            info!(evicted, "evicted unhealthy sessions");
        }
        Ok(evicted)
    }

    /// Spawn the periodic health check. The task runs until the process
    /// exits; eviction failures are logged and the next tick proceeds.
    pub fn spawn_health_check(self: Arc<Self>, interval: Duration) {
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if let Err(e) = self.health_check().await {
                    warn!(error = %e, "periodic health check failed");
                }
            }
        });
    }

    // ─── Removal ──────────────────────────────────────────────────────────

    /// Remove a session: best-effort log-out (falling back to disconnect),
    /// credential files in both partitions, and the durable row. Each step
    /// proceeds regardless of earlier failures.
    pub async fn remove(&self, name: &str) -> Result<(), CoreError> {
        let handle = {
            let mut inner = self.inner.lock().await;
            inner
                .users
                .remove(name)
                .or_else(|| inner.admins.remove(name))
                .map(|l| l.handle)
        };
        if let Some(handle) = handle {
            match handle.log_out().await {
                Ok(()) => info!(session = name, "session logged out"),
                Err(e) => {
                    warn!(session = name, error = %e, "log-out failed, disconnecting");
                    handle.disconnect().await;
                }
            }
        }
        self.dirs.remove_credentials(name);
        if let Err(e) = self.store.delete_session(name) {
            warn!(session = name, error = %e, "failed to delete session row");
        }
        Ok(())
    }

    /// Remove every user session (the admin partition is untouched).
    pub async fn remove_all_users(&self) -> Result<usize, CoreError> {
        let names: Vec<String> = {
            let inner = self.inner.lock().await;
            inner.users.keys().cloned().collect()
        };
        let mut removed = 0;
        for name in &names {
            self.remove(name).await?;
            removed += 1;
        }
        // Rows without a live handle still need to go.
        for row in self.store.sessions(SessionRole::User)? {
            self.dirs.remove_credentials(&row.name);
            self.store.delete_session(&row.name)?;
        }
        Ok(removed)
    }
}

// ─── Helpers ──────────────────────────────────────────────────────────────────

/// Reconnect if needed, then probe with a lightweight self-lookup.
async fn handle_is_healthy(handle: &dyn ClientHandle) -> bool {
    if !handle.is_connected() && handle.connect().await.is_err() {
        return false;
    }
    match handle.is_authorized().await {
        Ok(true) => handle.get_me().await.is_ok(),
        _        => false,
    }
}

async fn load_one(factory: &dyn ClientFactory, dirs: &SessionDirs, name: String) -> LoadOutcome {
    let bytes = match dirs.read_credentials(SessionRole::User, &name) {
        Ok(b)  => b,
        Err(_) => return LoadOutcome::MissingFile { name },
    };
    let handle = match factory.open_stored(&bytes).await {
        Ok(h)  => h,
        Err(e) => {
            warn!(session = %name, error = %e, "open_stored failed");
            return LoadOutcome::Failed { name };
        }
    };
    if handle.connect().await.is_err() {
        return LoadOutcome::Failed { name };
    }
    match handle.is_authorized().await {
        Ok(true)  => match handle.get_me().await {
            Ok(me) => LoadOutcome::Loaded { name, handle, user_id: me.id },
            Err(_) => LoadOutcome::Unauthorized { name, handle },
        },
        Ok(false) => LoadOutcome::Unauthorized { name, handle },
        Err(_)    => LoadOutcome::Failed { name },
    }
}
