// IP ban registry.
//
// A session whose invalid-share ratio crosses the configured threshold
// (after a minimum sample) gets its source IP banned for a fixed
// duration. Lookups clean expired entries lazily; a periodic sweep
// removes the rest so the map cannot grow without bound.

use std::net::IpAddr;

use dashmap::DashMap;
use log::debug;
use metrics::counter;
use minepool_common::time::{get_current_time_in_millis, TimestampMillis};

use crate::config::BanConfig;

pub struct BanRegistry {
    config: BanConfig,
    // ip -> expiry timestamp
    banned: DashMap<IpAddr, TimestampMillis>,
}

impl BanRegistry {
    pub fn new(config: BanConfig) -> Self {
        Self {
            config,
            banned: DashMap::new(),
        }
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn purge_interval_secs(&self) -> u64 {
        self.config.purge_interval_secs
    }

    /// Ban the IP for the configured duration; returns the expiry
    pub fn ban(&self, ip: IpAddr) -> TimestampMillis {
        let until = get_current_time_in_millis() + self.config.time_secs * 1000;
        self.banned.insert(ip, until);
        counter!("minepool_ips_banned").increment(1);
        until
    }

    /// Whether the IP is currently banned. Expired entries are removed
    /// on the way out.
    pub fn is_banned(&self, ip: &IpAddr) -> bool {
        let Some(entry) = self.banned.get(ip) else {
            return false;
        };
        if get_current_time_in_millis() > *entry {
            drop(entry);
            self.banned.remove(ip);
            return false;
        }
        true
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = get_current_time_in_millis();
        let before = self.banned.len();
        self.banned.retain(|_, until| *until >= now);
        let removed = before.saturating_sub(self.banned.len());
        if removed > 0 {
            debug!("purged {} expired ban(s)", removed);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.banned.len()
    }

    pub fn is_empty(&self) -> bool {
        self.banned.is_empty()
    }

    /// Ratio check for one session's counters. Only evaluated once the
    /// session has produced the minimum sample.
    pub fn should_ban(&self, valid: u64, invalid: u64) -> bool {
        if !self.config.enabled {
            return false;
        }
        let total = valid + invalid;
        if total < self.config.check_threshold {
            return false;
        }
        (invalid as f64 / total as f64) * 100.0 > self.config.invalid_percent
    }
}
