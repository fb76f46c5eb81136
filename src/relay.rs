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

//! Bounded relay between many part runners and a single consumer
//!
//! The relay is a bounded [`tokio::sync::mpsc`] channel plus an
//! [`OutstandingCounter`] of part runners that have not finished yet.
//! The runner that brings the counter to zero enqueues the single
//! [`RelayItem::Terminal`] marker, which tells the draining loop that
//! no more batches will arrive.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use arrow::record_batch::RecordBatch;
use log::{debug, warn};
use thiserror::Error;
use tokio::sync::mpsc::{self, Receiver, Sender};

use crate::cancel::Cancel;
use crate::error::Result;
use crate::internal_err;

/// An item travelling through the relay
#[derive(Debug)]
pub enum RelayItem {
    /// A batch produced by one of the parts
    Batch(RecordBatch),
    /// End of stream. Enqueued at most once per subscription.
    Terminal,
}

/// Returned by [`RelaySender::put`] once the consumer side is gone
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("relay receiver was dropped")]
pub struct RelayClosed;

/// Number of part runners that have not terminated yet
#[derive(Debug)]
pub struct OutstandingCounter {
    remaining: AtomicUsize,
    short_circuited: AtomicBool,
}

impl OutstandingCounter {
    /// Create a counter for `parts` runners
    pub fn new(parts: usize) -> Self {
        Self {
            remaining: AtomicUsize::new(parts),
            short_circuited: AtomicBool::new(false),
        }
    }

    /// Current number of outstanding runners
    pub fn remaining(&self) -> usize {
        self.remaining.load(Ordering::Acquire)
    }

    /// Decrement unless already zero. Returns true only for the call that
    /// took the counter from one to zero.
    pub fn decrement(&self) -> bool {
        self.remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .map(|prev| prev == 1)
            .unwrap_or(false)
    }

    /// Force the counter to zero. Returns true if it was not zero yet,
    /// i.e. this call is the one that ends the subscription.
    pub fn clear(&self) -> bool {
        let won = self.remaining.swap(0, Ordering::AcqRel) > 0;
        if won {
            self.short_circuited.store(true, Ordering::Release);
        }
        won
    }

    /// Was the counter forced to zero by [`Self::clear`] rather than
    /// counted down?
    pub fn is_short_circuited(&self) -> bool {
        self.short_circuited.load(Ordering::Acquire)
    }
}

/// Producer side of the relay. Each part runner holds a clone.
#[derive(Debug, Clone)]
pub struct RelaySender {
    tx: Sender<RelayItem>,
    outstanding: Arc<OutstandingCounter>,
}

impl RelaySender {
    /// Enqueue a batch, suspending while the relay is full
    pub async fn put(&self, batch: RecordBatch) -> std::result::Result<(), RelayClosed> {
        self.tx
            .send(RelayItem::Batch(batch))
            .await
            .map_err(|_| RelayClosed)
    }

    /// Record that one part runner has terminated normally. The call that
    /// brings the outstanding count to zero enqueues the terminal marker
    /// and returns true.
    pub async fn finish_part(&self) -> bool {
        if !self.outstanding.decrement() {
            return false;
        }
        self.send_terminal().await;
        true
    }

    /// End the subscription now, regardless of how many parts are still
    /// outstanding, and stop the remaining parts through `cancel`.
    /// Returns true if this call enqueued the terminal marker, false if
    /// the subscription had already been ended.
    ///
    /// The relay is marked short-circuited before `cancel` runs, so the
    /// consumer can tell this apart from its own cancellation and keep
    /// delivering batches enqueued before the failure.
    pub async fn short_circuit(&self, cancel: &dyn Cancel) -> bool {
        if !self.outstanding.clear() {
            return false;
        }
        cancel.cancel();
        self.send_terminal().await;
        true
    }

    /// Non-suspending variant of [`Self::short_circuit`], for callers that
    /// cannot await before the consumer starts draining. Only succeeds in
    /// enqueueing the marker if the relay has a free slot.
    pub fn try_short_circuit(&self) -> bool {
        if !self.outstanding.clear() {
            return false;
        }
        match self.tx.try_send(RelayItem::Terminal) {
            Ok(()) => true,
            Err(e) => {
                warn!("Could not enqueue terminal marker: {e}");
                false
            }
        }
    }

    /// Number of items currently buffered in the relay
    pub fn in_flight(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    /// Number of part runners that have not terminated yet
    pub fn outstanding(&self) -> usize {
        self.outstanding.remaining()
    }

    async fn send_terminal(&self) {
        // The only way this fails is a consumer that already went away,
        // in which case nobody is waiting for the marker
        if self.tx.send(RelayItem::Terminal).await.is_err() {
            debug!("Terminal marker not delivered: relay receiver dropped");
        }
    }
}

/// Consumer side of the relay, owned by the draining loop
#[derive(Debug)]
pub struct RelayReceiver {
    rx: Receiver<RelayItem>,
    outstanding: Arc<OutstandingCounter>,
    terminated: bool,
}

impl RelayReceiver {
    /// Wait for the next batch. Returns `None` once the terminal marker
    /// has been dequeued; the marker itself is never returned.
    pub async fn take(&mut self) -> Option<RecordBatch> {
        if self.terminated {
            return None;
        }
        match self.rx.recv().await {
            Some(RelayItem::Batch(batch)) => Some(batch),
            Some(RelayItem::Terminal) => {
                self.terminated = true;
                None
            }
            None => {
                // every sender is gone without a marker: a runner exited
                // without reporting, treat it as the end of the stream
                warn!("Relay closed without a terminal marker");
                self.terminated = true;
                None
            }
        }
    }

    /// Has the terminal marker been dequeued?
    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    /// Was the subscription ended early by a failing part?
    pub fn is_short_circuited(&self) -> bool {
        self.outstanding.is_short_circuited()
    }
}

/// Create a relay holding at most `capacity` items, for `parts` part
/// runners
pub fn relay(capacity: usize, parts: usize) -> Result<(RelaySender, RelayReceiver)> {
    if capacity == 0 {
        return internal_err!("Relay capacity must be greater than zero");
    }
    let (tx, rx) = mpsc::channel(capacity);
    let outstanding = Arc::new(OutstandingCounter::new(parts));
    let sender = RelaySender {
        tx,
        outstanding: Arc::clone(&outstanding),
    };
    let receiver = RelayReceiver {
        rx,
        outstanding,
        terminated: false,
    };
    Ok((sender, receiver))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancellationToken;
    use crate::test_util::make_batch;
    use std::time::Duration;

    #[test]
    fn counter_reaches_zero_once() {
        let counter = OutstandingCounter::new(2);
        assert!(!counter.decrement());
        assert!(counter.decrement());
        assert!(!counter.decrement());
        assert_eq!(counter.remaining(), 0);
    }

    #[test]
    fn counter_clear_wins_once() {
        let counter = OutstandingCounter::new(3);
        assert!(!counter.decrement());
        assert!(!counter.is_short_circuited());
        assert!(counter.clear());
        assert!(!counter.clear());
        assert!(!counter.decrement());
        assert!(counter.is_short_circuited());
    }

    #[test]
    fn counted_down_is_not_short_circuited() {
        let counter = OutstandingCounter::new(1);
        assert!(counter.decrement());
        assert!(!counter.clear());
        assert!(!counter.is_short_circuited());
    }

    #[test]
    fn zero_capacity_rejected() {
        assert!(relay(0, 1).is_err());
    }

    #[tokio::test]
    async fn terminal_after_last_part() -> Result<()> {
        let (tx, mut rx) = relay(4, 2)?;
        tx.put(make_batch(0, 1)).await.unwrap();
        assert!(!tx.finish_part().await);
        tx.put(make_batch(1, 1)).await.unwrap();
        assert!(tx.finish_part().await);

        assert!(rx.take().await.is_some());
        assert!(rx.take().await.is_some());
        assert!(rx.take().await.is_none());
        assert!(rx.is_terminated());
        // stays terminated
        assert!(rx.take().await.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn short_circuit_emits_single_marker() -> Result<()> {
        let (tx, mut rx) = relay(4, 3)?;
        let token = CancellationToken::new();
        assert!(tx.short_circuit(&token).await);
        assert!(token.is_cancelled());
        assert!(!tx.short_circuit(&token).await);
        assert!(!tx.finish_part().await);
        assert!(!tx.finish_part().await);
        assert_eq!(tx.in_flight(), 1);

        assert!(rx.is_short_circuited());
        assert!(rx.take().await.is_none());
        drop(tx);
        assert!(rx.take().await.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn batches_before_short_circuit_still_delivered() -> Result<()> {
        let (tx, mut rx) = relay(4, 2)?;
        let token = CancellationToken::new();
        tx.put(make_batch(0, 1)).await.unwrap();
        tx.put(make_batch(1, 1)).await.unwrap();
        assert!(tx.short_circuit(&token).await);

        assert!(rx.take().await.is_some());
        assert!(rx.take().await.is_some());
        assert!(rx.take().await.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn try_short_circuit_on_empty_relay() -> Result<()> {
        let (tx, mut rx) = relay(1, 5)?;
        assert!(tx.try_short_circuit());
        assert!(!tx.try_short_circuit());
        assert!(rx.take().await.is_none());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_finish_emits_one_marker() -> Result<()> {
        let parts = 32;
        let (tx, mut rx) = relay(parts, parts)?;
        let handles: Vec<_> = (0..parts)
            .map(|_| {
                let tx = tx.clone();
                tokio::spawn(async move { tx.finish_part().await })
            })
            .collect();
        drop(tx);

        let mut emitted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                emitted += 1;
            }
        }
        assert_eq!(emitted, 1);
        assert!(rx.take().await.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn put_suspends_while_full() -> Result<()> {
        let (tx, mut rx) = relay(2, 1)?;
        tx.put(make_batch(0, 1)).await.unwrap();
        tx.put(make_batch(1, 1)).await.unwrap();
        assert_eq!(tx.in_flight(), 2);

        let blocked = tokio::time::timeout(Duration::from_millis(50), tx.put(make_batch(2, 1)));
        assert!(blocked.await.is_err(), "put should suspend on a full relay");

        assert!(rx.take().await.is_some());
        assert_eq!(tx.in_flight(), 1);
        tx.put(make_batch(3, 1)).await.unwrap();
        assert_eq!(tx.in_flight(), 2);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn in_flight_never_exceeds_capacity() -> Result<()> {
        let capacity = 3;
        let producers = 6;
        let per_producer = 50;
        let (tx, mut rx) = relay(capacity, producers)?;

        for p in 0..producers {
            let tx = tx.clone();
            tokio::spawn(async move {
                for i in 0..per_producer {
                    if tx.put(make_batch((p * 1000 + i) as i32, 1)).await.is_err() {
                        return;
                    }
                }
                tx.finish_part().await;
            });
        }

        let mut received = 0;
        loop {
            assert!(tx.in_flight() <= capacity, "{} in flight", tx.in_flight());
            match rx.take().await {
                Some(_) => received += 1,
                None => break,
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(received, producers * per_producer);
        Ok(())
    }

    #[tokio::test]
    async fn put_fails_once_receiver_dropped() -> Result<()> {
        let (tx, rx) = relay(2, 1)?;
        drop(rx);
        assert_eq!(tx.put(make_batch(0, 1)).await, Err(RelayClosed));
        // the marker has nowhere to go but the call still reports it
        assert!(tx.finish_part().await);
        Ok(())
    }

    #[tokio::test]
    async fn senders_dropped_without_marker() -> Result<()> {
        let (tx, mut rx) = relay(2, 1)?;
        drop(tx);
        assert!(rx.take().await.is_none());
        assert!(rx.is_terminated());
        Ok(())
    }
}
