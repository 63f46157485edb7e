//! Database-backed quota tracking. This crate does not ship a SQL driver —
//! persistence is a `UsageTracker` trait seam implemented by an external
//! database layer. An in-memory implementation ships for tests and
//! single-process operation.

use crate::error::PipelineError;
use chrono::{DateTime, Datelike, Utc};
use std::sync::{Arc, Mutex};
use tracing::warn;

#[derive(Debug, Clone)]
pub struct UsageRecord {
    pub request_id: String,
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_nano_usd: u64,
    pub status: String,
    pub timestamp: DateTime<Utc>,
}

/// Seam implemented by the out-of-scope database/persistence layer
/// One row per completed request, enough to reconstruct daily/monthly usage.
#[async_trait::async_trait]
pub trait UsageTracker: Send + Sync {
    async fn record(&self, record: UsageRecord) -> Result<(), PipelineError>;
    async fn tokens_used_today(&self) -> Result<u64, PipelineError>;
    async fn cost_used_this_month_nano_usd(&self) -> Result<u64, PipelineError>;
}

/// In-memory `UsageTracker`, used when no database is configured.
#[derive(Default)]
pub struct InMemoryUsageTracker {
    records: Mutex<Vec<UsageRecord>>,
}

#[async_trait::async_trait]
impl UsageTracker for InMemoryUsageTracker {
    async fn record(&self, record: UsageRecord) -> Result<(), PipelineError> {
        self.records.lock().expect("usage tracker mutex poisoned").push(record);
        Ok(())
    }

    async fn tokens_used_today(&self) -> Result<u64, PipelineError> {
        let now = Utc::now();
        let records = self.records.lock().expect("usage tracker mutex poisoned");
        Ok(records
            .iter()
            .filter(|r| r.timestamp.date_naive() == now.date_naive())
            .map(|r| r.input_tokens + r.output_tokens)
            .sum())
    }

    async fn cost_used_this_month_nano_usd(&self) -> Result<u64, PipelineError> {
        let now = Utc::now();
        let records = self.records.lock().expect("usage tracker mutex poisoned");
        Ok(records
            .iter()
            .filter(|r| r.timestamp.year() == now.year() && r.timestamp.month() == now.month())
            .map(|r| r.cost_nano_usd)
            .sum())
    }
}

/// Tracks which (day, threshold) and (month, threshold) alert pairs have
/// already fired, so each threshold fires at most once per period
/// Fires each threshold at most once per period.
#[derive(Default)]
pub struct AlertTracker {
    fired_daily: Mutex<std::collections::HashSet<(chrono::NaiveDate, u8)>>,
    fired_monthly: Mutex<std::collections::HashSet<(i32, u32, u8)>>,
}

pub const ALERT_THRESHOLDS_PERCENT: [u8; 3] = [50, 80, 90];

impl AlertTracker {
    /// Returns newly-crossed thresholds (not previously fired today) for
    /// the given `used/quota` ratio.
    pub fn check_daily(&self, used: u64, quota: u64) -> Vec<u8> {
        if quota == 0 {
            return Vec::new();
        }
        let today = Utc::now().date_naive();
        let pct = ((used as f64 / quota as f64) * 100.0) as u8;
        let mut fired = self.fired_daily.lock().expect("alert tracker mutex poisoned");
        ALERT_THRESHOLDS_PERCENT
            .iter()
            .filter(|&&threshold| pct >= threshold && fired.insert((today, threshold)))
            .copied()
            .collect()
    }

    pub fn check_monthly(&self, used_nano_usd: u64, budget_usd: f64) -> Vec<u8> {
        if budget_usd <= 0.0 {
            return Vec::new();
        }
        let now = Utc::now();
        let budget_nano_usd = (budget_usd * 1_000_000_000.0) as u64;
        if budget_nano_usd == 0 {
            return Vec::new();
        }
        let pct = ((used_nano_usd as f64 / budget_nano_usd as f64) * 100.0) as u8;
        let mut fired = self.fired_monthly.lock().expect("alert tracker mutex poisoned");
        ALERT_THRESHOLDS_PERCENT
            .iter()
            .filter(|&&threshold| pct >= threshold && fired.insert((now.year(), now.month(), threshold)))
            .copied()
            .collect()
    }
}

/// Seconds until the next UTC midnight.
pub fn seconds_until_next_day() -> u64 {
    let now = Utc::now();
    let tomorrow = (now + chrono::Duration::days(1))
        .date_naive()
        .and_hms_opt(0, 0, 0)
        .expect("midnight always valid");
    let tomorrow = tomorrow.and_utc();
    (tomorrow - now).num_seconds().max(0) as u64
}

/// Seconds until the first of next month, UTC.
pub fn seconds_until_next_month() -> u64 {
    let now = Utc::now();
    let (year, month) = if now.month() == 12 {
        (now.year() + 1, 1)
    } else {
        (now.year(), now.month() + 1)
    };
    let first_of_next = chrono::NaiveDate::from_ymd_opt(year, month, 1)
        .expect("valid calendar date")
        .and_hms_opt(0, 0, 0)
        .expect("midnight always valid")
        .and_utc();
    (first_of_next - now).num_seconds().max(0) as u64
}

/// Enforces daily-token and monthly-USD quotas before the next call is
/// granted, backed by a `UsageTracker`. Unlike the composite limiter's
/// cost tier (billed pre-call against an estimate), this checks
/// already-recorded usage — a kill switch for future calls, not a
/// per-call admission estimate (see DESIGN.md).
pub struct QuotaLimiter {
    daily_token_quota: Option<u64>,
    monthly_budget_usd: Option<f64>,
    tracker: Arc<dyn UsageTracker>,
    alerts: AlertTracker,
}

impl QuotaLimiter {
    pub fn new(
        daily_token_quota: Option<u64>,
        monthly_budget_usd: Option<f64>,
        tracker: Arc<dyn UsageTracker>,
    ) -> Self {
        Self {
            daily_token_quota,
            monthly_budget_usd,
            tracker,
            alerts: AlertTracker::default(),
        }
    }

    /// Convenience constructor for single-process operation with no
    /// external database layer.
    pub fn with_in_memory_tracker(daily_token_quota: Option<u64>, monthly_budget_usd: Option<f64>) -> Self {
        Self::new(daily_token_quota, monthly_budget_usd, Arc::new(InMemoryUsageTracker::default()))
    }

    /// Denies the next call with `PipelineError::RateLimit` if either
    /// configured quota is already exhausted, carrying `retry_after_secs`
    /// until the quota resets. Fires any newly-crossed alert thresholds
    /// along the way, regardless of whether the quota itself is breached.
    pub async fn check_before_grant(&self) -> Result<(), PipelineError> {
        if let Some(limit) = self.daily_token_quota {
            let used = self.tracker.tokens_used_today().await?;
            for threshold in self.alerts.check_daily(used, limit) {
                warn!(threshold, used, limit, "daily token quota alert threshold crossed");
            }
            if used >= limit {
                return Err(PipelineError::RateLimit {
                    message: format!("daily token quota of {limit} tokens exhausted"),
                    retry_after_secs: seconds_until_next_day().max(1),
                });
            }
        }

        if let Some(budget_usd) = self.monthly_budget_usd {
            let used_nano_usd = self.tracker.cost_used_this_month_nano_usd().await?;
            for threshold in self.alerts.check_monthly(used_nano_usd, budget_usd) {
                warn!(threshold, budget_usd, "monthly budget alert threshold crossed");
            }
            let budget_nano_usd = (budget_usd * 1_000_000_000.0) as u64;
            if used_nano_usd >= budget_nano_usd {
                return Err(PipelineError::RateLimit {
                    message: format!("monthly budget of ${budget_usd:.2} exhausted"),
                    retry_after_secs: seconds_until_next_month().max(1),
                });
            }
        }

        Ok(())
    }

    /// Records a completed call's usage so subsequent `check_before_grant`
    /// calls see it.
    pub async fn record_usage(&self, record: UsageRecord) -> Result<(), PipelineError> {
        self.tracker.record(record).await
    }
}
