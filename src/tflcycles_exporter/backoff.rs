// tflcycles_exporter - Prometheus metrics exporter for TfL Santander Cycles
//
// Copyright 2024 Nick Pillitteri
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.
//

use rand::Rng;
use std::time::Duration;

/// Exponential backoff policy with randomized intervals.
///
/// Each wait is picked uniformly from `[interval * (1 - randomization), interval * (1 + randomization)]`
/// after which the interval grows by `multiplier`, up to `max_interval`. There is no limit on the
/// number of intervals, callers bound retries by a deadline instead.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExponentialBackoff {
    pub initial_interval: Duration,
    pub multiplier: f64,
    pub randomization: f64,
    pub max_interval: Duration,
}

impl ExponentialBackoff {
    pub fn new(initial_interval: Duration, max_interval: Duration) -> Self {
        ExponentialBackoff {
            initial_interval,
            max_interval,
            ..Default::default()
        }
    }

    /// Iterator over successive wait durations, starting from the initial interval.
    pub fn intervals(&self) -> Intervals {
        Intervals {
            policy: *self,
            current: self.initial_interval,
        }
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        ExponentialBackoff {
            initial_interval: Duration::from_millis(500),
            multiplier: 1.5,
            randomization: 0.5,
            max_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Debug)]
pub struct Intervals {
    policy: ExponentialBackoff,
    current: Duration,
}

impl Iterator for Intervals {
    type Item = Duration;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.current.as_secs_f64();
        let delta = current * self.policy.randomization;
        let wait = if delta > 0.0 {
            rand::thread_rng().gen_range((current - delta)..=(current + delta))
        } else {
            current
        };

        let max = self.policy.max_interval.as_secs_f64();
        self.current = Duration::from_secs_f64((current * self.policy.multiplier).min(max));

        Some(Duration::from_secs_f64(wait.max(0.0)))
    }
}
