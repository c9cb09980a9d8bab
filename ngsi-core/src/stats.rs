//! Request counters exposed on `/health`

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

/// How a forwarded request resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
    /// Successful token revocation (token proxy only)
    Revoke,
}

#[derive(Debug, Default, Clone, Copy)]
struct Counters {
    time_sent: i64,
    success: i64,
    failure: i64,
    revoke: i64,
}

/// Thread-safe request counters for one running proxy.
///
/// The counters sit behind their own lock so that recording an outcome never
/// waits on anything else a handler may be holding.
#[derive(Debug)]
pub struct ProxyStats {
    start_time: DateTime<Utc>,
    counters: Mutex<Counters>,
}

/// Point-in-time copy of [`ProxyStats`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub uptime: String,
    pub time_sent: i64,
    pub success: i64,
    pub failure: i64,
    pub revoke: i64,
}

impl ProxyStats {
    pub fn new() -> Self {
        Self::started_at(Utc::now())
    }

    pub fn started_at(start_time: DateTime<Utc>) -> Self {
        Self {
            start_time,
            counters: Mutex::new(Counters::default()),
        }
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    /// Count one resolved request
    pub fn record(&self, outcome: Outcome) {
        let mut counters = self.counters.lock();
        counters.time_sent += 1;
        match outcome {
            Outcome::Success => counters.success += 1,
            Outcome::Failure => counters.failure += 1,
            Outcome::Revoke => counters.revoke += 1,
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        self.snapshot_at(Utc::now())
    }

    pub fn snapshot_at(&self, now: DateTime<Utc>) -> StatsSnapshot {
        let uptime = (now.timestamp() - self.start_time.timestamp()).max(0);
        let counters = *self.counters.lock();

        StatsSnapshot {
            uptime: humanize_uptime(uptime),
            time_sent: counters.time_sent,
            success: counters.success,
            failure: counters.failure,
            revoke: counters.revoke,
        }
    }
}

impl Default for ProxyStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Render seconds as `"D d, H h, M m, S s"`
pub fn humanize_uptime(secs: i64) -> String {
    format!(
        "{} d, {} h, {} m, {} s",
        (secs / 3600) / 24,
        (secs / 3600) % 24,
        (secs / 60) % 60,
        secs % 60
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_humanize_uptime() {
        assert_eq!(humanize_uptime(0), "0 d, 0 h, 0 m, 0 s");
        assert_eq!(humanize_uptime(10141), "0 d, 2 h, 49 m, 1 s");
        assert_eq!(humanize_uptime(86400 + 3600 + 61), "1 d, 1 h, 1 m, 1 s");
    }

    #[test]
    fn test_record_keeps_total_in_step() {
        let stats = ProxyStats::new();
        stats.record(Outcome::Success);
        stats.record(Outcome::Failure);
        stats.record(Outcome::Revoke);
        stats.record(Outcome::Success);

        let snap = stats.snapshot();
        assert_eq!(snap.time_sent, 4);
        assert_eq!(snap.success, 2);
        assert_eq!(snap.failure, 1);
        assert_eq!(snap.revoke, 1);
    }

    #[test]
    fn test_snapshot_uptime() {
        let start = Utc::now();
        let stats = ProxyStats::started_at(start);
        let snap = stats.snapshot_at(start + Duration::seconds(6939));
        assert_eq!(snap.uptime, "0 d, 1 h, 55 m, 39 s");
    }

    #[test]
    fn test_concurrent_records() {
        let stats = ProxyStats::new();

        std::thread::scope(|s| {
            for i in 0..8 {
                let stats = &stats;
                s.spawn(move || {
                    for _ in 0..250 {
                        if i % 2 == 0 {
                            stats.record(Outcome::Success);
                        } else {
                            stats.record(Outcome::Failure);
                        }
                    }
                });
            }
        });

        let snap = stats.snapshot();
        assert_eq!(snap.time_sent, 2000);
        assert_eq!(snap.success, 1000);
        assert_eq!(snap.failure, 1000);
        assert_eq!(snap.time_sent, snap.success + snap.failure + snap.revoke);
    }
}
