//! Time source used by every orchestration decision.

use chrono::{DateTime, Utc};

/// Source of "now" for sweeps, locks and worker reports.
///
/// Timers still run on tokio; only the decisions read this clock.
pub trait Clock: Send + Sync {
    /// Current wall-clock time.
    fn now(&self) -> DateTime<Utc>;
}

/// Clock backed by the system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// `secs` seconds, saturating at the largest representable duration.
pub fn seconds(secs: i64) -> chrono::Duration {
    chrono::Duration::try_seconds(secs).unwrap_or(if secs < 0 {
        chrono::Duration::MIN
    } else {
        chrono::Duration::MAX
    })
}

/// `now - window`, or `None` when the window reaches past the earliest
/// representable time.
pub fn before(now: DateTime<Utc>, window: chrono::Duration) -> Option<DateTime<Utc>> {
    now.checked_sub_signed(window)
}

/// `now + window`, saturating at the latest representable time.
pub fn after(now: DateTime<Utc>, window: chrono::Duration) -> DateTime<Utc> {
    now.checked_add_signed(window).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Whole-second age of `since` at `now`. Negative ages clamp to zero.
pub fn age(since: DateTime<Utc>, now: DateTime<Utc>) -> chrono::Duration {
    let elapsed = now - since;
    if elapsed < chrono::Duration::zero() {
        chrono::Duration::zero()
    } else {
        elapsed
    }
}
