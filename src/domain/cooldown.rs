//! Pool Cooldowns
//!
//! After a close, the pool sits out a mandatory idle interval before it can
//! be a scan candidate again. Entries older than the window are pruned on
//! load and on every filter pass.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;

#[derive(Debug)]
pub struct CooldownTracker {
    window_minutes: i64,
    exits: HashMap<String, DateTime<Utc>>,
}

impl CooldownTracker {
    pub fn new(window_minutes: i64) -> Self {
        Self {
            window_minutes,
            exits: HashMap::new(),
        }
    }

    /// Seed from persisted exits, dropping anything already outside the
    /// window.
    pub fn load(&mut self, entries: impl IntoIterator<Item = (String, DateTime<Utc>)>) {
        let now = Utc::now();
        self.load_at(entries, now);
    }

    pub fn load_at(
        &mut self,
        entries: impl IntoIterator<Item = (String, DateTime<Utc>)>,
        now: DateTime<Utc>,
    ) {
        for (pool, exited_at) in entries {
            if now - exited_at < Duration::minutes(self.window_minutes) {
                self.exits.insert(pool, exited_at);
            }
        }
    }

    pub fn record_exit(&mut self, pool_address: &str) {
        self.record_exit_at(pool_address, Utc::now());
    }

    pub fn record_exit_at(&mut self, pool_address: &str, at: DateTime<Utc>) {
        self.exits.insert(pool_address.to_string(), at);
    }

    pub fn is_cooling(&self, pool_address: &str) -> bool {
        self.is_cooling_at(pool_address, Utc::now())
    }

    pub fn is_cooling_at(&self, pool_address: &str, now: DateTime<Utc>) -> bool {
        match self.exits.get(pool_address) {
            Some(exited_at) => now - *exited_at < Duration::minutes(self.window_minutes),
            None => false,
        }
    }

    pub fn prune(&mut self, now: DateTime<Utc>) {
        let window = Duration::minutes(self.window_minutes);
        self.exits.retain(|_, exited_at| now - *exited_at < window);
    }

    pub fn len(&self) -> usize {
        self.exits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exits.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(mins: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_770_000_000 + mins * 60, 0).unwrap()
    }

    #[test]
    fn test_cooldown_boundary() {
        let mut tracker = CooldownTracker::new(30);
        tracker.record_exit_at("pool-a", at(0));

        assert!(tracker.is_cooling_at("pool-a", at(0)));
        assert!(tracker.is_cooling_at("pool-a", at(29)));
        // Exactly at the boundary the pool becomes eligible again
        assert!(!tracker.is_cooling_at("pool-a", at(30)));
    }

    #[test]
    fn test_unknown_pool_not_cooling() {
        let tracker = CooldownTracker::new(30);
        assert!(!tracker.is_cooling_at("pool-z", at(0)));
    }

    #[test]
    fn test_load_drops_stale_entries() {
        let mut tracker = CooldownTracker::new(30);
        tracker.load_at(
            vec![
                ("fresh".to_string(), at(-10)),
                ("stale".to_string(), at(-45)),
            ],
            at(0),
        );

        assert_eq!(tracker.len(), 1);
        assert!(tracker.is_cooling_at("fresh", at(0)));
        assert!(!tracker.is_cooling_at("stale", at(0)));
    }

    #[test]
    fn test_prune() {
        let mut tracker = CooldownTracker::new(30);
        tracker.record_exit_at("a", at(0));
        tracker.record_exit_at("b", at(20));
        tracker.prune(at(35));

        assert_eq!(tracker.len(), 1);
        assert!(tracker.is_cooling_at("b", at(35)));
    }
}
