use std::time::Duration;

use chrono::DateTime;
use chrono::TimeDelta;
use chrono::Utc;
use tokio::time::Instant;
use tokio::time::Interval;
use tokio::time::MissedTickBehavior;

// Roughly 30 years, the same horizon tokio uses for "never".
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// The instant one `period` from now, or the far future if that overflows.
pub(crate) fn one_period_from_now(period: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(period).unwrap_or_else(|| now + FAR_FUTURE)
}

/// Tracks the current `[start, end)` window and ticks at each boundary.
///
/// The timer owns no admission state. The coordinator awaits [`tick`](Self::tick)
/// and sweeps whatever expired in the window that just closed.
#[derive(Debug)]
pub(crate) struct FixedWindowTimer {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    interval: Duration,
    ticker: Interval,
}

impl FixedWindowTimer {
    /// Opens the first window now. Must be called from within a Tokio runtime.
    pub(crate) fn new(interval: Duration) -> Self {
        let mut ticker = tokio::time::interval_at(one_period_from_now(interval), interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let (start, end) = bounds(interval);
        Self {
            start,
            end,
            interval,
            ticker,
        }
    }

    pub(crate) fn start(&self) -> DateTime<Utc> {
        self.start
    }

    pub(crate) fn end(&self) -> DateTime<Utc> {
        self.end
    }

    /// Waits for the next boundary, opens the next window and returns the end of
    /// the window that closed.
    ///
    /// Cancel safe: nothing changes unless the boundary has been reached.
    pub(crate) async fn tick(&mut self) -> DateTime<Utc> {
        self.ticker.tick().await;
        let closed = self.end;
        (self.start, self.end) = bounds(self.interval);
        closed
    }
}

fn bounds(interval: Duration) -> (DateTime<Utc>, DateTime<Utc>) {
    let start = Utc::now();
    let end = TimeDelta::from_std(interval)
        .ok()
        .and_then(|interval| start.checked_add_signed(interval))
        .unwrap_or(DateTime::<Utc>::MAX_UTC);
    (start, end)
}
