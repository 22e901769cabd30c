//! # gather-core
//!
//! Pooled-session group enrollment: QR-authenticated sessions feed a
//! registry, a quota-aware distribution engine drains a queue of phone
//! numbers into a target group, and a supervisor decides when runs happen.
//!
//! ## Pieces
//! - QR auth state machine — ephemeral login attempts, 2FA, duplicate
//!   prevention, credential persistence
//! - Session registry — live client handles in user/admin partitions,
//!   health checks, eviction
//! - Quota ledger — per-session, per-day addition caps
//! - Distribution engine — round-robin target processing with an
//!   add → invite-link fallback chain
//! - Supervisor — scheduling loop (daily start time or minimum interval,
//!   forced wake, stop-aware waits)
//!
//! Network access goes through the `gather-client` traits; persistence
//! through `gather-store`. Both are injected, so the whole core runs
//! against in-memory fakes in tests.

#![deny(unsafe_code)]

pub mod engine;
pub mod errors;
pub mod qr;
pub mod quota;
pub mod registry;
pub mod settings;
pub mod supervisor;

pub use engine::{Engine, RunParams, RunReport};
pub use errors::CoreError;
pub use qr::{IssuedQr, QrConfig, QrManager, QrStatus};
pub use quota::QuotaLedger;
pub use registry::{Registry, SessionDirs};
pub use settings::AutomationSettings;
pub use supervisor::{Supervisor, SupervisorConfig, SupervisorStatus, compute_next_run};
