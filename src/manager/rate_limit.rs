//! Audit log rate limiting.
//!
//! Exchange errors are attacker-triggerable (anyone can address a
//! datagram at a route SPI), so the per-event log lines they produce are
//! rate-limited per route while the error counters keep exact totals.

use std::collections::HashMap;

/// Rate limiter for per-route audit log lines.
///
/// Tracks the last time a line was emitted for each route and enforces a
/// minimum interval between lines for the same route.
pub(super) struct AuditRateLimiter {
    /// Maps route id to the last time we logged about it.
    last_logged: HashMap<String, u64>,
    /// Minimum interval between lines for the same route, in ms.
    min_interval: u64,
    /// Maximum age of entries before cleanup, in ms.
    max_age: u64,
}

impl AuditRateLimiter {
    /// Default: at most one line per route per second.
    pub(super) fn new() -> Self {
        Self {
            last_logged: HashMap::new(),
            min_interval: 1_000,
            max_age: 60_000,
        }
    }

    /// Check if a line should be emitted for this route.
    ///
    /// Returns true if enough time has passed since the last line for the
    /// route, or if this is the first one. Updates internal state when
    /// returning true.
    pub(super) fn should_log(&mut self, route_id: &str, now_ms: u64) -> bool {
        if let Some(&last) = self.last_logged.get(route_id) {
            if now_ms.saturating_sub(last) < self.min_interval {
                return false;
            }
        }

        self.last_logged.insert(route_id.to_string(), now_ms);
        self.cleanup(now_ms);
        true
    }

    /// Remove entries older than max_age.
    fn cleanup(&mut self, now_ms: u64) {
        self.last_logged
            .retain(|_, &mut last| now_ms.saturating_sub(last) < self.max_age);
    }

    #[cfg(test)]
    pub(super) fn len(&self) -> usize {
        self.last_logged.len()
    }
}
