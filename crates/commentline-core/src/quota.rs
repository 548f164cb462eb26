//! Daily quota budget for the comment source API

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Context;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Cumulative cost counter checked before every source call.
///
/// Reservations are compare-and-swap updates, so concurrent readers can
/// never overshoot the limit together.
#[derive(Debug)]
pub struct QuotaBudget {
    limit: u64,
    used: AtomicU64,
}

/// Returned when a reservation would exceed the budget
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaExceeded {
    pub used: u64,
    pub cost: u64,
    pub limit: u64,
}

impl std::fmt::Display for QuotaExceeded {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} of {} units used, next call costs {}",
            self.used, self.limit, self.cost
        )
    }
}

impl std::error::Error for QuotaExceeded {}

impl QuotaBudget {
    pub fn new(limit: u64) -> Self {
        Self::with_used(limit, 0)
    }

    /// Budget that already has `used` units spent (carried over from the ledger)
    pub fn with_used(limit: u64, used: u64) -> Self {
        Self {
            limit,
            used: AtomicU64::new(used),
        }
    }

    /// Claim `cost` units, failing if the budget would be exceeded.
    pub fn try_reserve(&self, cost: u64) -> Result<(), QuotaExceeded> {
        let mut used = self.used.load(Ordering::Acquire);
        loop {
            let next = used.saturating_add(cost);
            if next > self.limit {
                return Err(QuotaExceeded {
                    used,
                    cost,
                    limit: self.limit,
                });
            }
            match self
                .used
                .compare_exchange_weak(used, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return Ok(()),
                Err(actual) => used = actual,
            }
        }
    }

    /// Replace a reservation with the cost the server actually charged.
    pub fn settle(&self, reserved: u64, actual: u64) {
        if actual > reserved {
            self.used.fetch_add(actual - reserved, Ordering::AcqRel);
        } else if reserved > actual {
            let refund = reserved - actual;
            let _ = self
                .used
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |u| {
                    Some(u.saturating_sub(refund))
                });
        }
    }

    /// Mark the budget as fully spent (server reported its own quota exhausted)
    pub fn exhaust(&self) {
        self.used.fetch_max(self.limit, Ordering::AcqRel);
    }

    pub fn used(&self) -> u64 {
        self.used.load(Ordering::Acquire)
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn remaining(&self) -> u64 {
        self.limit.saturating_sub(self.used())
    }
}

/// Units spent on one UTC day, persisted across runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaLedger {
    pub date: NaiveDate,
    pub used: u64,
}

impl QuotaLedger {
    fn path(state_dir: &Path) -> PathBuf {
        state_dir.join("quota.json")
    }

    /// Units already spent on `today`; a ledger from another day counts as zero.
    pub fn load(state_dir: &Path, today: NaiveDate) -> anyhow::Result<u64> {
        let path = Self::path(state_dir);
        if !path.exists() {
            return Ok(0);
        }
        let json = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let ledger: Self = serde_json::from_str(&json)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        Ok(if ledger.date == today { ledger.used } else { 0 })
    }

    /// Atomically record usage for `today` (tmp + rename).
    pub fn save(state_dir: &Path, today: NaiveDate, used: u64) -> anyhow::Result<()> {
        std::fs::create_dir_all(state_dir)
            .with_context(|| format!("failed to create {}", state_dir.display()))?;
        let path = Self::path(state_dir);
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(&Self { date: today, used })?;
        std::fs::write(&tmp, json).with_context(|| format!("failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, &path)
            .with_context(|| format!("failed to rename {}", tmp.display()))?;
        Ok(())
    }
}
