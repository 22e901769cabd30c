//! Distribution engine — one run drains pending targets into the configured
//! group, spreading work round-robin across sessions with remaining quota.
//!
//! A run never returns `Err`: setup failures (no targets, no sessions, no
//! admin handle, unresolvable group) abort without touching the queue and
//! are reported as an unsuccessful [`RunReport`]. Per-target failures are
//! contained to that target.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use gather_client::{ClientError, ClientHandle, GroupInfo, Identity, UserId};
use gather_store::{SessionRole, Store, TargetStatus};

use crate::errors::CoreError;
use crate::quota::QuotaLedger;
use crate::registry::Registry;
use crate::settings::{self, AutomationSettings, KEY_ADMIN_GROUPS};

/// Extra seconds slept on top of a server-requested rate-limit wait.
const FLOOD_MARGIN_SETUP:  u64 = 1;
const FLOOD_MARGIN_TARGET: u64 = 5;

/// Cap on errors carried in a persisted report.
const MAX_REPORTED_ERRORS: usize = 20;

// ─── RunReport ────────────────────────────────────────────────────────────────

/// Outcome of one engine invocation. Persisted as the last result for
/// observability; never used as control input to future runs.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RunReport {
    pub total:   u32,
    pub added:   u32,
    pub invited: u32,
    pub failed:  u32,
    pub skipped: u32,
    pub errors:  Vec<String>,
    pub success: bool,
    pub message: String,
}

impl RunReport {
    fn failure(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            success: false,
            errors:  vec![message.clone()],
            message,
            ..Self::default()
        }
    }

    fn push_error(&mut self, error: String) {
        if self.errors.len() < MAX_REPORTED_ERRORS {
            self.errors.push(error);
        }
    }
}

// ─── RunParams ────────────────────────────────────────────────────────────────

/// Everything one run needs, captured up front so a settings change mid-run
/// cannot shift the parameters under it.
#[derive(Clone, Debug)]
pub struct RunParams {
    pub group_id:       i64,
    pub delay_secs:     u64,
    pub batch_size:     usize,
    pub daily_cap:      u32,
    pub invite_message: String,
    pub use_admin_as_user: bool,
}

impl RunParams {
    /// `None` when no target group is configured.
    pub fn from_settings(s: &AutomationSettings) -> Option<Self> {
        Some(Self {
            group_id:          s.target_group_id?,
            delay_secs:        s.delay_secs,
            batch_size:        s.batch_size.max(1),
            daily_cap:         s.daily_cap,
            invite_message:    s.invite_message.clone(),
            use_admin_as_user: s.use_admin_as_user,
        })
    }
}

// ─── Engine ───────────────────────────────────────────────────────────────────

struct Candidate {
    name:   String,
    handle: Arc<dyn ClientHandle>,
    id:     UserId,
}

/// What happened to a single target.
enum TargetOutcome {
    Added { counted: bool },
    Invited,
    Failed,
    /// Left `pending`; the session handling it lost authorization.
    Deferred,
}

pub struct Engine {
    store:    Arc<Store>,
    registry: Arc<Registry>,
    quota:    QuotaLedger,
}

impl Engine {
    pub fn new(store: Arc<Store>, registry: Arc<Registry>) -> Self {
        let quota = QuotaLedger::new(Arc::clone(&store));
        Self { store, registry, quota }
    }

    /// Execute one distribution run.
    pub async fn run(&self, params: &RunParams) -> RunReport {
        let op = self
            .store
            .begin_operation("auto_add", &format!("distribution run into group {}", params.group_id))
            .ok();

        let report = match self.run_inner(params).await {
            Ok(report) => report,
            Err(e)     => {
                warn!(error = %e, "distribution run aborted");
                RunReport::failure(format!("run aborted: {e}"))
            }
        };

        info!(
            added   = report.added,
            invited = report.invited,
            failed  = report.failed,
            skipped = report.skipped,
            success = report.success,
            "distribution run finished"
        );
        if let Ok(value) = serde_json::to_value(&report) {
            if let Err(e) = settings::set_last_result(&self.store, &value) {
                warn!(error = %e, "failed to persist run result");
            }
            if let Some(op) = op {
                let status = if report.success { "completed" } else { "failed" };
                let _ = self.store.finish_operation(op, status, Some(&value));
            }
        }
        report
    }

    async fn run_inner(&self, params: &RunParams) -> Result<RunReport, CoreError> {
        // Newly authenticated sessions must be visible, dead ones gone.
        self.registry.load_all().await?;
        self.registry.health_check().await?;

        let pending = self.store.pending_targets()?;
        if pending.is_empty() {
            return Ok(RunReport::failure("no pending targets"));
        }

        let Some((admin_name, admin)) = self.registry.admin_handle().await? else {
            return Ok(RunReport::failure("no usable admin handle"));
        };

        let mut candidates = self
            .candidates(params, &admin_name, &admin)
            .await?;
        if candidates.is_empty() {
            return Ok(RunReport::failure("no sessions with remaining quota"));
        }

        // Group resolution failure aborts the whole run.
        let group = admin.resolve_group(params.group_id).await?;
        if !group.kind.accepts_members() {
            return Ok(RunReport::failure(format!(
                "group {} is a broadcast channel and cannot accept members",
                group.id
            )));
        }
        self.refresh_member_count(&group);

        let mut report = RunReport {
            total: pending.len() as u32,
            ..RunReport::default()
        };

        self.ensure_membership(&group, &admin, &mut candidates, &mut report)
            .await;
        if candidates.is_empty() {
            report.message = "no candidate session could join the group".into();
            return Ok(report);
        }

        let invite_link = match admin.export_invite_link(&group).await {
            Ok(link) => link,
            Err(e)   => {
                warn!(error = %e, "invite link creation failed; fallback delivery disabled");
                report.push_error(format!("invite link: {e}"));
                None
            }
        };

        self.process_targets(params, &group, invite_link.as_deref(), candidates, &pending, &mut report)
            .await;

        // Setup and queue processing completed: the run succeeded even when
        // individual targets failed. Only fail-fast aborts report failure.
        report.success = true;
        report.message = format!(
            "{} added, {} invited, {} failed, {} skipped of {}",
            report.added, report.invited, report.failed, report.skipped, report.total
        );
        Ok(report)
    }

    // ─── Candidate selection ──────────────────────────────────────────────

    /// Loaded user handles with remaining quota, in durable-store row order
    /// so selection is deterministic. The admin handle is appended when the
    /// operator allows it to double as a worker.
    async fn candidates(
        &self,
        params: &RunParams,
        admin_name: &str,
        admin: &Arc<dyn ClientHandle>,
    ) -> Result<Vec<Candidate>, CoreError> {
        let mut out = Vec::new();
        for row in self.store.active_sessions(SessionRole::User)? {
            let Some((handle, id)) = self.registry.get_user(&row.name).await else {
                continue;
            };
            if self.quota.remaining(&row.name, params.daily_cap)? > 0 {
                out.push(Candidate { name: row.name, handle, id });
            }
        }
        if params.use_admin_as_user
            && !out.iter().any(|c| c.name == admin_name)
            && self.quota.remaining(admin_name, params.daily_cap)? > 0
        {
            if let Ok(me) = admin.get_me().await {
                out.push(Candidate {
                    name:   admin_name.to_string(),
                    handle: Arc::clone(admin),
                    id:     me.id,
                });
            }
        }
        Ok(out)
    }

    // ─── Group setup ──────────────────────────────────────────────────────

    /// Make sure every candidate is a member of the target group: self-join
    /// when the group is public, admin-driven invite otherwise. Already a
    /// participant counts as success; a candidate that cannot join is
    /// dropped from the run.
    async fn ensure_membership(
        &self,
        group: &GroupInfo,
        admin: &Arc<dyn ClientHandle>,
        candidates: &mut Vec<Candidate>,
        report: &mut RunReport,
    ) {
        let mut keep = Vec::with_capacity(candidates.len());
        for candidate in candidates.drain(..) {
            let joined = self.join_candidate(group, admin, &candidate).await;
            match joined {
                Ok(())  => keep.push(candidate),
                Err(e)  => {
                    warn!(session = %candidate.name, error = %e, "session could not join group");
                    report.push_error(format!("{}: join failed: {e}", candidate.name));
                }
            }
        }
        *candidates = keep;
    }

    async fn join_candidate(
        &self,
        group: &GroupInfo,
        admin: &Arc<dyn ClientHandle>,
        candidate: &Candidate,
    ) -> Result<(), ClientError> {
        let attempt = |retry: bool| async move {
            let result = match group.username.as_deref() {
                Some(username) if group.publicly_joinable() => {
                    candidate.handle.join_by_username(username).await
                }
                _ => admin.invite_to_group(group, candidate.id).await,
            };
            match result {
                Ok(()) | Err(ClientError::AlreadyParticipant) => Ok(()),
                Err(ClientError::RateLimited { seconds }) if retry => {
                    debug!(session = %candidate.name, seconds, "rate limited during group setup");
                    sleep(Duration::from_secs(seconds + FLOOD_MARGIN_SETUP)).await;
                    Err(ClientError::RateLimited { seconds })
                }
                Err(e) => Err(e),
            }
        };
        match attempt(true).await {
            Ok(())                               => Ok(()),
            Err(ClientError::RateLimited { .. }) => attempt(false).await,
            Err(e)                               => Err(e),
        }
    }

    // ─── Target processing ────────────────────────────────────────────────

    async fn process_targets(
        &self,
        params: &RunParams,
        group: &GroupInfo,
        invite_link: Option<&str>,
        mut candidates: Vec<Candidate>,
        pending: &[gather_store::TargetRecord],
        report: &mut RunReport,
    ) {
        let mut cursor = 0usize;
        let batch_size = params.batch_size;
        let total = pending.len();

        for (index, target) in pending.iter().enumerate() {
            let Some(slot) = self
                .next_candidate(&candidates, &mut cursor, params.daily_cap)
                .await
            else {
                // Quota exhausted everywhere: the rest stays pending for the
                // next run.
                report.skipped += (total - index) as u32;
                info!(remaining = total - index, "all session quotas exhausted, stopping run");
                break;
            };

            let outcome = self
                .process_one(params, group, invite_link, &candidates[slot], &target.phone, report)
                .await;
            match outcome {
                TargetOutcome::Added { counted } => {
                    report.added += 1;
                    let name = &candidates[slot].name;
                    if counted {
                        if let Err(e) = self.quota.record_add(name) {
                            warn!(session = %name, error = %e, "quota increment failed");
                        }
                    }
                    let _ = self.store.touch_session(name);
                }
                TargetOutcome::Invited  => report.invited += 1,
                TargetOutcome::Failed   => report.failed += 1,
                TargetOutcome::Deferred => {
                    report.skipped += 1;
                    let lost = candidates.remove(slot);
                    warn!(session = %lost.name, "session lost authorization mid-run, evicting");
                    if let Err(e) = self.registry.remove(&lost.name).await {
                        warn!(session = %lost.name, error = %e, "eviction failed");
                    }
                    if candidates.is_empty() {
                        report.skipped += (total - index - 1) as u32;
                        break;
                    }
                    continue;
                }
            }
            cursor = slot + 1;

            let last = index + 1 == total;
            if !last {
                sleep(Duration::from_secs(params.delay_secs)).await;
                if (index + 1) % batch_size == 0 {
                    sleep(Duration::from_secs(params.delay_secs * 2)).await;
                }
            }
        }
    }

    /// Next round-robin slot with remaining quota, scanning at most one full
    /// lap from the cursor.
    async fn next_candidate(
        &self,
        candidates: &[Candidate],
        cursor: &mut usize,
        cap: u32,
    ) -> Option<usize> {
        let len = candidates.len();
        for step in 0..len {
            let slot = (*cursor + step) % len;
            match self.quota.remaining(&candidates[slot].name, cap) {
                Ok(n) if n > 0 => return Some(slot),
                Ok(_)          => continue,
                Err(e)         => {
                    warn!(session = %candidates[slot].name, error = %e, "quota lookup failed");
                    continue;
                }
            }
        }
        None
    }

    /// One target, end to end: temporary-contact bracketing, phone
    /// resolution, direct add, invite-link fallback. The contact cleanup
    /// happens on every exit path.
    async fn process_one(
        &self,
        params: &RunParams,
        group: &GroupInfo,
        invite_link: Option<&str>,
        candidate: &Candidate,
        phone: &str,
        report: &mut RunReport,
    ) -> TargetOutcome {
        let handle = &candidate.handle;

        let was_contact = match handle.contact_phones().await {
            Ok(phones) => phones.contains(phone),
            Err(e)     => {
                debug!(phone, error = %e, "contact listing failed, assuming absent");
                false
            }
        };
        if !was_contact {
            if let Err(e) = handle.import_contact(phone).await {
                debug!(phone, error = %e, "temporary contact import failed");
            }
        }

        let outcome = self
            .deliver(params, group, invite_link, candidate, phone, report)
            .await;

        if !was_contact {
            if let Err(e) = handle.delete_contact(phone).await {
                debug!(phone, error = %e, "temporary contact removal failed");
            }
        }
        outcome
    }

    async fn deliver(
        &self,
        params: &RunParams,
        group: &GroupInfo,
        invite_link: Option<&str>,
        candidate: &Candidate,
        phone: &str,
        report: &mut RunReport,
    ) -> TargetOutcome {
        let handle = &candidate.handle;

        let identity = match handle.resolve_phone(phone).await {
            Ok(id) => Some(id),
            Err(e) if e.is_permanent() => {
                return self.fail_permanently(phone, &e, report);
            }
            Err(e) => {
                debug!(phone, error = %e, "phone resolution failed, trying invite fallback");
                None
            }
        };

        if let Some(identity) = &identity {
            match self.direct_add(group, candidate, identity).await {
                Ok(counted) => {
                    self.mark(phone, TargetStatus::Added);
                    info!(phone, session = %candidate.name, "target added");
                    return TargetOutcome::Added { counted };
                }
                Err(e) if e.is_authorization_loss() => {
                    report.push_error(format!("{phone}: {e}"));
                    return TargetOutcome::Deferred;
                }
                Err(e) => {
                    debug!(phone, error = %e, "direct add failed, trying invite fallback");
                }
            }
        }

        match self.invite_fallback(params, invite_link, handle, phone).await {
            Ok(())  => {
                self.mark(phone, TargetStatus::Invited);
                info!(phone, session = %candidate.name, "invite link delivered");
                TargetOutcome::Invited
            }
            Err(e) => {
                self.mark(phone, TargetStatus::Failed);
                report.push_error(format!("{phone}: {e}"));
                TargetOutcome::Failed
            }
        }
    }

    /// Direct add, absorbing one rate-limit pause. Returns whether the add
    /// counts against quota (an already-present member does not).
    async fn direct_add(
        &self,
        group: &GroupInfo,
        candidate: &Candidate,
        identity: &Identity,
    ) -> Result<bool, ClientError> {
        match candidate.handle.invite_to_group(group, identity.id).await {
            Ok(())                                 => Ok(true),
            Err(ClientError::AlreadyParticipant)   => Ok(false),
            Err(ClientError::RateLimited { seconds }) => {
                debug!(session = %candidate.name, seconds, "rate limited during add");
                sleep(Duration::from_secs(seconds + FLOOD_MARGIN_TARGET)).await;
                match candidate.handle.invite_to_group(group, identity.id).await {
                    Ok(())                               => Ok(true),
                    Err(ClientError::AlreadyParticipant) => Ok(false),
                    Err(e)                               => Err(e),
                }
            }
            Err(e) => Err(e),
        }
    }

    async fn invite_fallback(
        &self,
        params: &RunParams,
        invite_link: Option<&str>,
        handle: &Arc<dyn ClientHandle>,
        phone: &str,
    ) -> Result<(), ClientError> {
        let Some(link) = invite_link else {
            return Err(ClientError::Other("no invite link available".into()));
        };
        let text = params.invite_message.replace("{invite_link}", link);
        handle.send_message(phone, &text).await
    }

    fn fail_permanently(
        &self,
        phone: &str,
        error: &ClientError,
        report: &mut RunReport,
    ) -> TargetOutcome {
        info!(phone, error = %error, "permanent failure, blacklisting");
        if let Err(e) = self.store.blacklist_add(phone) {
            warn!(phone, error = %e, "blacklist insert failed");
        }
        self.mark(phone, TargetStatus::Failed);
        report.push_error(format!("{phone}: {error}"));
        TargetOutcome::Failed
    }

    fn mark(&self, phone: &str, status: TargetStatus) {
        match self.store.mark_target(phone, status) {
            Ok(true)  => {}
            Ok(false) => warn!(phone, "target no longer pending, status not changed"),
            Err(e)    => warn!(phone, error = %e, "target status update failed"),
        }
    }

    /// Keep the cached admin-group listing's member count fresh for the
    /// group we just resolved.
    fn refresh_member_count(&self, group: &GroupInfo) {
        let cached = match self.store.get_setting(KEY_ADMIN_GROUPS) {
            Ok(Some(v)) => v,
            _           => return,
        };
        let Some(entries) = cached.as_array() else { return };
        let updated: Vec<_> = entries
            .iter()
            .map(|entry| {
                if entry.get("id").and_then(|v| v.as_i64()) == Some(group.id) {
                    let mut entry = entry.clone();
                    if let Some(obj) = entry.as_object_mut() {
                        obj.insert("participants_count".into(), json!(group.participant_count));
                    }
                    entry
                } else {
                    entry.clone()
                }
            })
            .collect();
        if let Err(e) = self.store.set_setting(KEY_ADMIN_GROUPS, &json!(updated)) {
            warn!(error = %e, "failed to refresh cached member count");
        }
    }
}
