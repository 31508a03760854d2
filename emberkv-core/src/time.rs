// SPDX-License-Identifier: AGPL-3.0-or-later
// EmberKV - Eventually-Persistent Partitioned Key-Value Store
// Copyright (C) 2026 Sushanth Reddy Vanagala (https://github.com/sushanthpy)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Engine-relative clock.
//!
//! Expiry and lock deadlines are stored as seconds relative to engine
//! start, which keeps them in 32 bits. The clock is an explicit object
//! (not process state) so embedders can run several engines and tests can
//! move time without touching each other.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Instant;

/// Seconds since the owning engine started.
pub type RelTime = u32;

/// Monotonic second-resolution clock with a test-advance offset.
#[derive(Debug)]
pub struct Clock {
    start: Instant,
    offset: AtomicU32,
}

impl Clock {
    pub fn new() -> Self {
        Clock {
            start: Instant::now(),
            offset: AtomicU32::new(0),
        }
    }

    /// Current engine-relative time in seconds.
    pub fn now(&self) -> RelTime {
        self.start.elapsed().as_secs() as RelTime + self.offset.load(Ordering::Relaxed)
    }

    /// Jump the clock forward. Only ever forward; expiry logic relies on
    /// monotonicity.
    pub fn advance(&self, secs: RelTime) {
        self.offset.fetch_add(secs, Ordering::Relaxed);
    }
}

impl Default for Clock {
    fn default() -> Self {
        Clock::new()
    }
}

/// True when `exptime` names a deadline that has passed at `now`.
/// An `exptime` of 0 never expires.
pub fn is_expired(exptime: RelTime, now: RelTime) -> bool {
    exptime != 0 && exptime < now
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_starts_near_zero() {
        let clock = Clock::new();
        assert!(clock.now() < 2);
    }

    #[test]
    fn test_advance_moves_forward() {
        let clock = Clock::new();
        let before = clock.now();
        clock.advance(100);
        assert!(clock.now() >= before + 100);
    }

    #[test]
    fn test_expiry_predicate() {
        assert!(!is_expired(0, 1_000_000));
        assert!(!is_expired(50, 50));
        assert!(is_expired(49, 50));
    }
}
