//! Quota ledger — per-session, per-calendar-day addition counters.
//!
//! `remaining(session) = cap − count(session, today)`. Counts only move
//! forward within a day and reset implicitly on day rollover (a new
//! `(session, day)` record starts at zero).

use std::sync::Arc;

use chrono::Utc;

use gather_store::Store;

use crate::errors::CoreError;

// ─── QuotaLedger ──────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct QuotaLedger {
    store: Arc<Store>,
}

impl QuotaLedger {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// How many additions `session` may still perform today. Never negative;
    /// zero excludes the session from selection until the next calendar day.
    pub fn remaining(&self, session: &str, cap: u32) -> Result<u32, CoreError> {
        let added = self.store.added_on(session, Utc::now().date_naive())?;
        Ok(cap.saturating_sub(added))
    }

    /// Record one confirmed successful addition. Call only after the add
    /// actually happened.
    pub fn record_add(&self, session: &str) -> Result<(), CoreError> {
        self.store.increment_added(session, Utc::now().date_naive())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remaining_is_cap_minus_count_and_never_negative() {
        let store = Arc::new(Store::in_memory().unwrap());
        let ledger = QuotaLedger::new(store.clone());

        assert_eq!(ledger.remaining("s1", 3).unwrap(), 3);
        ledger.record_add("s1").unwrap();
        assert_eq!(ledger.remaining("s1", 3).unwrap(), 2);
        ledger.record_add("s1").unwrap();
        ledger.record_add("s1").unwrap();
        assert_eq!(ledger.remaining("s1", 3).unwrap(), 0);

        // Over-counting (cap lowered mid-day) still reports zero, not
        // a negative value.
        assert_eq!(ledger.remaining("s1", 2).unwrap(), 0);
    }
}
