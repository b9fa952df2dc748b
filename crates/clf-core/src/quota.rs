//! Token-quota accounting for chat API spend.
//!
//! Three ceilings apply to every request: a per-request cap, a calendar-day
//! budget, and a calendar-month budget. The windowed counters reset when
//! their calendar window advances. Both the clock and the persistence
//! backend are injected, so window rollovers are testable without waiting
//! for real time to pass.

use std::{fmt, sync::Arc};

use chrono::{DateTime, Datelike, Local, NaiveDate};
use tokio::sync::Mutex;
use tracing::warn;

use crate::{
    errors::Error,
    store::{StatsStore, UsageEvent, UsageStats},
};

/// Number of spend events kept in the persisted history.
const HISTORY_CAP: usize = 1_000;

/// Accounting window a limit applies to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Scope {
    Request,
    Daily,
    Monthly,
}

impl Scope {
    pub fn as_str(self) -> &'static str {
        match self {
            Scope::Request => "request",
            Scope::Daily => "daily",
            Scope::Monthly => "monthly",
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Recoverable quota failures, surfaced to the caller so it can skip the
/// request or wait for the next window.
#[derive(Debug, thiserror::Error)]
pub enum QuotaError {
    #[error("{scope} token limit exceeded: requested {requested}, {remaining} of {limit} remaining")]
    Exceeded {
        scope: Scope,
        requested: u64,
        remaining: u64,
        limit: u64,
    },

    /// A negative token count is a caller bug, never silently ignored.
    #[error("invalid token count: {0}")]
    InvalidTokenCount(i64),
}

/// Token ceilings per scope.
#[derive(Clone, Copy, Debug)]
pub struct Limits {
    pub request: u64,
    pub daily: u64,
    pub monthly: u64,
}

/// Warning thresholds as percentages of a window's limit.
#[derive(Clone, Copy, Debug)]
pub struct Thresholds {
    pub warning_percent: u32,
    pub critical_percent: u32,
}

/// Injectable time source. Window rollovers only care about the local date;
/// history filtering uses the full timestamp.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Local>;

    fn today(&self) -> NaiveDate {
        self.now().date_naive()
    }
}

/// Wall-clock time in the local timezone.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Local> {
        Local::now()
    }
}

/// Usage snapshot for one windowed scope.
#[derive(Clone, Copy, Debug)]
pub struct WindowUsage {
    pub used: u64,
    pub limit: u64,
}

impl WindowUsage {
    pub fn remaining(&self) -> u64 {
        self.limit.saturating_sub(self.used)
    }

    pub fn percent(&self) -> f64 {
        self.used as f64 * 100.0 / self.limit as f64
    }
}

#[derive(Clone, Copy, Debug)]
pub struct QuotaStats {
    pub daily: WindowUsage,
    pub monthly: WindowUsage,
}

/// Stateful counter deciding whether a request may spend tokens.
///
/// All operations take the internal lock once and run check + mutation as a
/// single sequence, so interleaved callers cannot lose updates.
pub struct QuotaTracker {
    limits: Limits,
    thresholds: Thresholds,
    clock: Arc<dyn Clock>,
    store: Arc<dyn StatsStore>,
    state: Mutex<UsageStats>,
}

impl QuotaTracker {
    /// Build a tracker, restoring persisted counters when the store has any.
    pub fn new(
        limits: Limits,
        thresholds: Thresholds,
        clock: Arc<dyn Clock>,
        store: Arc<dyn StatsStore>,
    ) -> crate::Result<Self> {
        if limits.request == 0 || limits.daily == 0 || limits.monthly == 0 {
            return Err(Error::Config("token limits must be positive".to_string()));
        }

        let stats = store
            .load()?
            .unwrap_or_else(|| UsageStats::empty(clock.today()));

        Ok(Self {
            limits,
            thresholds,
            clock,
            store,
            state: Mutex::new(stats),
        })
    }

    pub fn limits(&self) -> Limits {
        self.limits
    }

    /// May `tokens` be spent right now? Performs no mutation.
    pub async fn can_spend(&self, tokens: i64) -> bool {
        self.check(tokens).await.is_ok()
    }

    /// Like [`can_spend`](Self::can_spend), but names the violated scope.
    pub async fn check(&self, tokens: i64) -> std::result::Result<(), QuotaError> {
        let tokens = validate_token_count(tokens)?;
        let mut st = self.state.lock().await;
        self.reset_elapsed_windows(&mut st);
        match self.first_violation(&st, tokens) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Record an actual spend against the daily and monthly windows.
    ///
    /// Re-validates every ceiling first; a spend that would cross any of them
    /// is rejected without touching the counters, naming the first violated
    /// scope in request, daily, monthly order.
    pub async fn record(&self, tokens: i64, kind: &str) -> std::result::Result<(), QuotaError> {
        let tokens = validate_token_count(tokens)?;
        let mut st = self.state.lock().await;
        self.reset_elapsed_windows(&mut st);

        if let Some(err) = self.first_violation(&st, tokens) {
            return Err(err);
        }

        st.daily_tokens += tokens;
        st.monthly_tokens += tokens;

        st.usage_history.push(UsageEvent {
            timestamp: self.clock.now().to_rfc3339(),
            tokens,
            kind: kind.to_string(),
        });
        if st.usage_history.len() > HISTORY_CAP {
            let excess = st.usage_history.len() - HISTORY_CAP;
            st.usage_history.drain(..excess);
        }

        self.warn_on_thresholds(&st);
        self.persist(&st);
        Ok(())
    }

    /// Current usage per windowed scope, after any pending window rollover.
    pub async fn stats(&self) -> QuotaStats {
        let mut st = self.state.lock().await;
        self.reset_elapsed_windows(&mut st);
        QuotaStats {
            daily: WindowUsage {
                used: st.daily_tokens,
                limit: self.limits.daily,
            },
            monthly: WindowUsage {
                used: st.monthly_tokens,
                limit: self.limits.monthly,
            },
        }
    }

    /// Spend events from the last `days` days, oldest first.
    pub async fn history_since(&self, days: i64) -> Vec<UsageEvent> {
        let cutoff = self.clock.now() - chrono::Duration::days(days);
        let st = self.state.lock().await;
        st.usage_history
            .iter()
            .filter(|e| {
                DateTime::parse_from_rfc3339(&e.timestamp)
                    .map(|t| t.with_timezone(&Local) > cutoff)
                    .unwrap_or(false)
            })
            .cloned()
            .collect()
    }

    /// Zero any counter whose calendar window has elapsed. The daily and
    /// monthly windows are independent: a month rollover does not touch the
    /// daily counter, and vice versa.
    fn reset_elapsed_windows(&self, st: &mut UsageStats) {
        let today = self.clock.today();
        let mut changed = false;

        if today != st.last_reset_date {
            st.daily_tokens = 0;
            st.last_reset_date = today;
            changed = true;
        }

        if (today.year(), today.month())
            != (st.monthly_reset_date.year(), st.monthly_reset_date.month())
        {
            st.monthly_tokens = 0;
            st.monthly_reset_date = today.with_day(1).unwrap_or(today);
            changed = true;
        }

        if changed {
            self.persist(st);
        }
    }

    /// Ordered ceiling check: request, then daily, then monthly.
    fn first_violation(&self, st: &UsageStats, tokens: u64) -> Option<QuotaError> {
        let checks = [
            (Scope::Request, 0u64, self.limits.request),
            (Scope::Daily, st.daily_tokens, self.limits.daily),
            (Scope::Monthly, st.monthly_tokens, self.limits.monthly),
        ];

        for (scope, used, limit) in checks {
            if used.saturating_add(tokens) > limit {
                return Some(QuotaError::Exceeded {
                    scope,
                    requested: tokens,
                    remaining: limit.saturating_sub(used),
                    limit,
                });
            }
        }
        None
    }

    fn warn_on_thresholds(&self, st: &UsageStats) {
        let windows = [
            (Scope::Daily, st.daily_tokens, self.limits.daily),
            (Scope::Monthly, st.monthly_tokens, self.limits.monthly),
        ];

        for (scope, used, limit) in windows {
            let percent = used as f64 * 100.0 / limit as f64;
            if percent >= self.thresholds.critical_percent as f64 {
                warn!("critical: {scope} token usage at {percent:.1}% of limit");
            } else if percent >= self.thresholds.warning_percent as f64 {
                warn!("{scope} token usage at {percent:.1}% of limit");
            }
        }
    }

    /// Counter state stays authoritative in memory; a failing store is
    /// reported but never blocks accounting.
    fn persist(&self, st: &UsageStats) {
        if let Err(e) = self.store.save(st) {
            warn!("failed to persist token stats: {e}");
        }
    }
}

fn validate_token_count(tokens: i64) -> std::result::Result<u64, QuotaError> {
    u64::try_from(tokens).map_err(|_| QuotaError::InvalidTokenCount(tokens))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeClock {
        now: std::sync::Mutex<DateTime<Local>>,
    }

    impl FakeClock {
        fn at(date: NaiveDate) -> Arc<Self> {
            Arc::new(Self {
                now: std::sync::Mutex::new(local_noon(date)),
            })
        }

        fn advance_to(&self, date: NaiveDate) {
            *self.now.lock().unwrap() = local_noon(date);
        }
    }

    impl Clock for FakeClock {
        fn now(&self) -> DateTime<Local> {
            *self.now.lock().unwrap()
        }
    }

    fn local_noon(date: NaiveDate) -> DateTime<Local> {
        date.and_hms_opt(12, 0, 0)
            .unwrap()
            .and_local_timezone(Local)
            .unwrap()
    }

    #[derive(Default)]
    struct MemoryStore {
        saved: std::sync::Mutex<Option<UsageStats>>,
    }

    impl MemoryStore {
        fn snapshot(&self) -> Option<UsageStats> {
            self.saved.lock().unwrap().clone()
        }
    }

    impl StatsStore for MemoryStore {
        fn load(&self) -> crate::Result<Option<UsageStats>> {
            Ok(self.saved.lock().unwrap().clone())
        }

        fn save(&self, stats: &UsageStats) -> crate::Result<()> {
            *self.saved.lock().unwrap() = Some(stats.clone());
            Ok(())
        }
    }

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn product_limits() -> Limits {
        Limits {
            request: 2_000,
            daily: 10_000,
            monthly: 100_000,
        }
    }

    fn thresholds() -> Thresholds {
        Thresholds {
            warning_percent: 80,
            critical_percent: 90,
        }
    }

    fn tracker(clock: Arc<FakeClock>, store: Arc<MemoryStore>) -> QuotaTracker {
        QuotaTracker::new(product_limits(), thresholds(), clock, store).unwrap()
    }

    fn fresh_tracker() -> QuotaTracker {
        tracker(
            FakeClock::at(day(2026, 3, 15)),
            Arc::new(MemoryStore::default()),
        )
    }

    #[tokio::test]
    async fn allows_spend_within_all_ceilings() {
        let t = fresh_tracker();
        assert!(t.can_spend(1).await);
        assert!(t.can_spend(2_000).await);
    }

    #[tokio::test]
    async fn request_ceiling_applies_regardless_of_remaining_budget() {
        let t = fresh_tracker();
        // Daily and monthly windows are completely empty.
        assert!(!t.can_spend(2_001).await);

        let err = t.check(2_001).await.unwrap_err();
        match err {
            QuotaError::Exceeded { scope, limit, .. } => {
                assert_eq!(scope, Scope::Request);
                assert_eq!(limit, 2_000);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn record_increments_both_windows_by_exactly_the_spend() {
        let t = fresh_tracker();
        t.record(500, "text_formatting").await.unwrap();

        let stats = t.stats().await;
        assert_eq!(stats.daily.used, 500);
        assert_eq!(stats.monthly.used, 500);
        assert_eq!(stats.daily.remaining(), 9_500);
        assert_eq!(stats.monthly.remaining(), 99_500);
    }

    #[tokio::test]
    async fn rejected_record_leaves_all_counters_unchanged() {
        let t = fresh_tracker();
        t.record(1_500, "text_formatting").await.unwrap();

        let err = t.record(3_000, "text_formatting").await.unwrap_err();
        assert!(matches!(
            err,
            QuotaError::Exceeded {
                scope: Scope::Request,
                ..
            }
        ));

        let stats = t.stats().await;
        assert_eq!(stats.daily.used, 1_500);
        assert_eq!(stats.monthly.used, 1_500);
    }

    #[tokio::test]
    async fn violations_are_named_in_request_daily_monthly_order() {
        // Daily tighter than monthly: daily is named first.
        let clock = FakeClock::at(day(2026, 3, 15));
        let t = QuotaTracker::new(
            Limits {
                request: 2_000,
                daily: 300,
                monthly: 300,
            },
            thresholds(),
            clock,
            Arc::new(MemoryStore::default()),
        )
        .unwrap();

        let err = t.record(400, "text_formatting").await.unwrap_err();
        assert!(matches!(
            err,
            QuotaError::Exceeded {
                scope: Scope::Daily,
                ..
            }
        ));

        // Monthly alone exhausted: monthly is named.
        let clock = FakeClock::at(day(2026, 3, 15));
        let t = QuotaTracker::new(
            Limits {
                request: 2_000,
                daily: 10_000,
                monthly: 300,
            },
            thresholds(),
            clock,
            Arc::new(MemoryStore::default()),
        )
        .unwrap();

        let err = t.record(400, "text_formatting").await.unwrap_err();
        assert!(matches!(
            err,
            QuotaError::Exceeded {
                scope: Scope::Monthly,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn daily_budget_scenario_at_product_limits() {
        let t = fresh_tracker();
        for _ in 0..5 {
            t.record(1_900, "text_formatting").await.unwrap();
        }
        assert_eq!(t.stats().await.daily.used, 9_500);

        // 600 would overshoot the daily budget by 100.
        assert!(!t.can_spend(600).await);
        assert!(t.can_spend(500).await);

        t.record(500, "text_formatting").await.unwrap();
        assert_eq!(t.stats().await.daily.used, 10_000);
        assert!(!t.can_spend(1).await);
    }

    #[tokio::test]
    async fn day_rollover_resets_daily_counter_only() {
        let clock = FakeClock::at(day(2026, 3, 15));
        let store = Arc::new(MemoryStore::default());
        let t = tracker(clock.clone(), store.clone());

        t.record(500, "text_formatting").await.unwrap();
        clock.advance_to(day(2026, 3, 16));

        let stats = t.stats().await;
        assert_eq!(stats.daily.used, 0);
        assert_eq!(stats.monthly.used, 500);

        let saved = store.snapshot().unwrap();
        assert_eq!(saved.last_reset_date, day(2026, 3, 16));
        assert_eq!(saved.monthly_reset_date, day(2026, 3, 1));
    }

    #[tokio::test]
    async fn month_rollover_resets_both_windows() {
        let clock = FakeClock::at(day(2026, 1, 31));
        let store = Arc::new(MemoryStore::default());
        let t = tracker(clock.clone(), store.clone());

        t.record(500, "text_formatting").await.unwrap();
        clock.advance_to(day(2026, 2, 1));

        let stats = t.stats().await;
        assert_eq!(stats.daily.used, 0);
        assert_eq!(stats.monthly.used, 0);

        let saved = store.snapshot().unwrap();
        assert_eq!(saved.last_reset_date, day(2026, 2, 1));
        assert_eq!(saved.monthly_reset_date, day(2026, 2, 1));
    }

    #[tokio::test]
    async fn negative_token_counts_are_rejected() {
        let t = fresh_tracker();
        assert!(!t.can_spend(-1).await);

        let err = t.record(-5, "text_formatting").await.unwrap_err();
        assert!(matches!(err, QuotaError::InvalidTokenCount(-5)));
        assert_eq!(t.stats().await.daily.used, 0);
    }

    #[tokio::test]
    async fn persisted_counters_survive_a_restart() {
        let store = Arc::new(MemoryStore::default());
        {
            let t = tracker(FakeClock::at(day(2026, 3, 15)), store.clone());
            for _ in 0..5 {
                t.record(1_900, "text_formatting").await.unwrap();
            }
        }

        // Same day, new process: counters pick up where they left off.
        let t = tracker(FakeClock::at(day(2026, 3, 15)), store);
        assert_eq!(t.stats().await.daily.used, 9_500);
        assert!(!t.can_spend(600).await);
        assert!(t.can_spend(500).await);
    }

    #[tokio::test]
    async fn stale_persisted_windows_reset_on_first_use() {
        let store = Arc::new(MemoryStore::default());
        {
            let t = tracker(FakeClock::at(day(2026, 3, 15)), store.clone());
            t.record(500, "text_formatting").await.unwrap();
        }

        let t = tracker(FakeClock::at(day(2026, 4, 2)), store);
        let stats = t.stats().await;
        assert_eq!(stats.daily.used, 0);
        assert_eq!(stats.monthly.used, 0);
    }

    #[tokio::test]
    async fn history_is_capped_and_filtered_by_age() {
        let clock = FakeClock::at(day(2026, 3, 1));
        let store = Arc::new(MemoryStore::default());
        let t = tracker(clock.clone(), store);

        t.record(100, "text_formatting").await.unwrap();
        clock.advance_to(day(2026, 3, 20));
        t.record(200, "text_formatting").await.unwrap();
        t.record(300, "text_formatting").await.unwrap();

        let recent = t.history_since(7).await;
        assert_eq!(recent.len(), 2);
        assert_eq!(recent.iter().map(|e| e.tokens).sum::<u64>(), 500);

        // Cap: only the newest HISTORY_CAP events are kept.
        for _ in 0..(HISTORY_CAP + 10) {
            t.record(1, "text_formatting").await.unwrap();
        }
        let st = t.state.lock().await;
        assert_eq!(st.usage_history.len(), HISTORY_CAP);
    }

    #[tokio::test]
    async fn zero_limits_are_rejected_at_construction() {
        let res = QuotaTracker::new(
            Limits {
                request: 0,
                daily: 10_000,
                monthly: 100_000,
            },
            thresholds(),
            FakeClock::at(day(2026, 3, 15)),
            Arc::new(MemoryStore::default()),
        );
        assert!(matches!(res, Err(Error::Config(_))));
    }
}
