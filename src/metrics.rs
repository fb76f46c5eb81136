// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.

//! Metrics for recording information about a fan-in

use std::fmt::{self, Display};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A counter (number of batches, rows, parts)
///
/// Note `clone` counters update the same underlying value
#[derive(Debug, Clone, Default)]
pub struct Count {
    value: Arc<AtomicUsize>,
}

impl Count {
    /// create a new counter starting at zero
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `n` to the counter's value
    pub fn add(&self, n: usize) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    /// Get the current value
    pub fn value(&self) -> usize {
        self.value.load(Ordering::Relaxed)
    }
}

/// Elapsed time, recorded in nanoseconds
#[derive(Debug, Clone, Default)]
pub struct Time {
    nanos: Arc<AtomicUsize>,
}

impl Time {
    /// Create a new [`Time`] starting at zero
    pub fn new() -> Self {
        Self::default()
    }

    /// Add elapsed nanoseconds since `start` to self
    pub fn add_elapsed(&self, start: Instant) {
        let nanos = start.elapsed().as_nanos() as usize;
        self.nanos.fetch_add(nanos, Ordering::Relaxed);
    }

    /// return a scoped guard that adds the amount of time elapsed
    /// between its creation and its drop or call to `stop` to the
    /// underlying metric.
    pub fn timer(&self) -> ScopedTimerGuard<'_> {
        ScopedTimerGuard {
            inner: self,
            start: Some(Instant::now()),
        }
    }

    /// Total recorded time
    pub fn value(&self) -> Duration {
        Duration::from_nanos(self.nanos.load(Ordering::Relaxed) as u64)
    }
}

/// RAII structure that adds all time between its construction and
/// destruction to the underlying [`Time`], or up to the first call to
/// `stop`, whichever comes first
pub struct ScopedTimerGuard<'a> {
    inner: &'a Time,
    start: Option<Instant>,
}

impl<'a> ScopedTimerGuard<'a> {
    /// Stop the timer timing and record the time taken
    pub fn stop(&mut self) {
        if let Some(start) = self.start.take() {
            self.inner.add_elapsed(start)
        }
    }
}

impl<'a> Drop for ScopedTimerGuard<'a> {
    fn drop(&mut self) {
        self.stop()
    }
}

/// Counters shared by every subscription of one
/// [`StreamSource`](crate::StreamSource)
#[derive(Debug, Clone, Default)]
pub struct FanInMetrics {
    /// Batches forwarded to a subscriber
    pub output_batches: Count,
    /// Rows forwarded to a subscriber
    pub output_rows: Count,
    /// Parts driven to exhaustion
    pub parts_completed: Count,
    /// Parts that stopped because of a read error or panic, or could not
    /// be scheduled at all
    pub parts_failed: Count,
    /// Parts that stopped because cancellation was requested
    pub parts_cancelled: Count,
    /// Time spent in the draining loop, including subscriber callbacks
    pub elapsed_drain: Time,
}

impl FanInMetrics {
    /// Create a new set of metrics, all zero
    pub fn new() -> Self {
        Self::default()
    }
}

impl Display for FanInMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "output_batches={}, output_rows={}, parts_completed={}, parts_failed={}, \
             parts_cancelled={}, elapsed_drain={:?}",
            self.output_batches.value(),
            self.output_rows.value(),
            self.parts_completed.value(),
            self.parts_failed.value(),
            self.parts_cancelled.value(),
            self.elapsed_drain.value(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_counts() {
        let count = Count::new();
        let other = count.clone();
        count.add(2);
        other.add(3);
        assert_eq!(count.value(), 5);
    }

    #[test]
    fn timer_records_on_drop() {
        let time = Time::new();
        {
            let _timer = time.timer();
            std::thread::sleep(Duration::from_millis(2));
        }
        let recorded = time.value();
        assert!(recorded >= Duration::from_millis(2));

        // stopping twice only records once
        let mut timer = time.timer();
        timer.stop();
        let after_stop = time.value();
        timer.stop();
        drop(timer);
        assert_eq!(time.value(), after_stop);
    }

    #[test]
    fn display() {
        let metrics = FanInMetrics::new();
        metrics.output_batches.add(6);
        metrics.output_rows.add(6);
        metrics.parts_completed.add(2);
        let s = metrics.to_string();
        assert!(s.starts_with(
            "output_batches=6, output_rows=6, parts_completed=2, parts_failed=0, parts_cancelled=0"
        ));
    }
}
