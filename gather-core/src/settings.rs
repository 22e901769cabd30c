//! Automation settings — the flat key/value snapshot read at the top of
//! every Supervisor cycle and handed to the Distribution Engine.
//!
//! Mutated only by the administrative surface; the core only reads it
//! (plus the run markers the Supervisor itself maintains).

use chrono::{DateTime, Utc};
use serde_json::{Value, json};

use gather_store::Store;

use crate::errors::CoreError;

// ─── Setting keys ─────────────────────────────────────────────────────────────

pub const KEY_ENABLED:          &str = "auto_add_enabled";
pub const KEY_TARGET_GROUP:     &str = "target_group_id";
pub const KEY_DAILY_START:      &str = "daily_start_time";
pub const KEY_DAILY_CAP:        &str = "max_users_per_session";
pub const KEY_DELAY:            &str = "delay_between_adds";
pub const KEY_BATCH_SIZE:       &str = "batch_size";
pub const KEY_INVITE_MESSAGE:   &str = "invite_message";
pub const KEY_USER_AS_ADMIN:    &str = "use_user_as_admin";
pub const KEY_ADMIN_AS_USER:    &str = "use_admin_as_user";
pub const KEY_LAST_RUN:         &str = "auto_add_last_run";
pub const KEY_LAST_RESULT:      &str = "auto_add_last_result";
pub const KEY_FORCED_WAKEUP:    &str = "auto_add_forced_wakeup";
pub const KEY_RUNNING:          &str = "auto_add_running";
pub const KEY_ADMIN_GROUPS:     &str = "admin_groups";

const DEFAULT_INVITE_MESSAGE: &str =
    "You're invited to join our group! Tap the link below to join:\n\n{invite_link}";

// ─── AutomationSettings ───────────────────────────────────────────────────────

/// Typed view of the automation settings, with the original defaults.
#[derive(Clone, Debug)]
pub struct AutomationSettings {
    pub enabled:          bool,
    pub target_group_id:  Option<i64>,
    /// `"HH:MM"` UTC, or `None` for interval-based scheduling.
    pub daily_start_time: Option<String>,
    pub daily_cap:        u32,
    pub delay_secs:       u64,
    pub batch_size:       usize,
    pub invite_message:   String,
    pub use_user_as_admin: bool,
    pub use_admin_as_user: bool,
}

impl Default for AutomationSettings {
    fn default() -> Self {
        Self {
            enabled:          false,
            target_group_id:  None,
            daily_start_time: None,
            daily_cap:        50,
            delay_secs:       10,
            batch_size:       3,
            invite_message:   DEFAULT_INVITE_MESSAGE.to_string(),
            use_user_as_admin: false,
            use_admin_as_user: false,
        }
    }
}

impl AutomationSettings {
    /// Read the current snapshot, falling back to defaults per key.
    pub fn load(store: &Store) -> Result<Self, CoreError> {
        let mut s = Self::default();
        if let Some(v) = store.get_setting(KEY_ENABLED)? {
            s.enabled = v.as_bool().unwrap_or(false);
        }
        if let Some(v) = store.get_setting(KEY_TARGET_GROUP)? {
            // Tolerate both numeric and stringified ids.
            s.target_group_id = v.as_i64().or_else(|| v.as_str().and_then(|t| t.parse().ok()));
        }
        if let Some(v) = store.get_setting(KEY_DAILY_START)? {
            s.daily_start_time = v.as_str().map(str::to_string);
        }
        if let Some(v) = store.get_setting(KEY_DAILY_CAP)? {
            if let Some(n) = v.as_u64() {
                s.daily_cap = n as u32;
            }
        }
        if let Some(v) = store.get_setting(KEY_DELAY)? {
            if let Some(n) = v.as_u64() {
                s.delay_secs = n;
            }
        }
        if let Some(v) = store.get_setting(KEY_BATCH_SIZE)? {
            if let Some(n) = v.as_u64() {
                s.batch_size = (n as usize).max(1);
            }
        }
        if let Some(v) = store.get_setting(KEY_INVITE_MESSAGE)? {
            if let Some(m) = v.as_str() {
                if !m.is_empty() {
                    s.invite_message = m.to_string();
                }
            }
        }
        if let Some(v) = store.get_setting(KEY_USER_AS_ADMIN)? {
            s.use_user_as_admin = v.as_bool().unwrap_or(false);
        }
        if let Some(v) = store.get_setting(KEY_ADMIN_AS_USER)? {
            s.use_admin_as_user = v.as_bool().unwrap_or(false);
        }
        Ok(s)
    }
}

// ─── Run markers ──────────────────────────────────────────────────────────────

/// The Supervisor's last completed run, if any.
pub fn last_run(store: &Store) -> Result<Option<DateTime<Utc>>, CoreError> {
    let v = store.get_setting(KEY_LAST_RUN)?;
    Ok(v.and_then(|v| v.as_str().and_then(|s| s.parse().ok())))
}

pub fn set_last_run(store: &Store, at: DateTime<Utc>) -> Result<(), CoreError> {
    store.set_setting(KEY_LAST_RUN, &json!(at.to_rfc3339()))?;
    Ok(())
}

/// Consume the forced-wakeup flag; returns whether it was set.
pub fn take_forced_wakeup(store: &Store) -> Result<bool, CoreError> {
    let forced = store.get_setting(KEY_FORCED_WAKEUP)?.is_some();
    if forced {
        store.clear_setting(KEY_FORCED_WAKEUP)?;
    }
    Ok(forced)
}

pub fn request_forced_wakeup(store: &Store) -> Result<(), CoreError> {
    store.set_setting(KEY_FORCED_WAKEUP, &json!(Utc::now().to_rfc3339()))?;
    Ok(())
}

pub fn set_last_result(store: &Store, result: &Value) -> Result<(), CoreError> {
    store.set_setting(KEY_LAST_RESULT, result)?;
    Ok(())
}
