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

//! Reads every part of a source in parallel and merges the results into
//! a single stream. No guarantees are made about the order of batches
//! from different parts.

use std::fmt::{self, Display};
use std::sync::Arc;

use arrow::record_batch::RecordBatch;
use log::{debug, error, warn};
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::JoinSet;

use crate::cancel::CancellationToken;
use crate::config::FanInConfig;
use crate::error::{FanInError, Result};
use crate::metrics::FanInMetrics;
use crate::part::PartSource;
use crate::relay::{relay, RelayReceiver};
use crate::runner::{PartOutcome, PartRunner};
use crate::subscriber::{CollectingSubscriber, Subscriber};

/// Lifecycle of a subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    /// No subscription has been made yet
    Idle,
    /// Parts are being enumerated and runners scheduled
    Starting,
    /// Batches are being forwarded to the subscriber
    Draining,
    /// The subscriber was told `completed`
    Completed,
    /// The subscriber was told `error`
    Errored,
}

impl Display for SubscriptionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "Idle",
            Self::Starting => "Starting",
            Self::Draining => "Draining",
            Self::Completed => "Completed",
            Self::Errored => "Errored",
        };
        write!(f, "{s}")
    }
}

/// Fans the parts of a [`PartSource`] into one subscriber.
///
/// Every call to [`Self::subscribe`] is an independent run, a fresh
/// [`Subscription`] with its own relay, outstanding count, cancellation
/// token and state. One task is spawned per part on the current tokio
/// runtime; the number of concurrently running parts is not limited
/// here.
#[derive(Debug)]
pub struct StreamSource {
    source: Arc<dyn PartSource>,
    config: FanInConfig,
    metrics: FanInMetrics,
}

impl StreamSource {
    /// Create a new StreamSource with default options
    pub fn new(source: Arc<dyn PartSource>) -> Self {
        Self {
            source,
            config: FanInConfig::default(),
            metrics: FanInMetrics::new(),
        }
    }

    /// Use the given options for subsequent subscriptions
    pub fn with_config(mut self, config: FanInConfig) -> Self {
        self.config = config;
        self
    }

    /// The source whose parts are read
    pub fn source(&self) -> &Arc<dyn PartSource> {
        &self.source
    }

    /// Options in use
    pub fn config(&self) -> &FanInConfig {
        &self.config
    }

    /// Metrics accumulated over every subscription
    pub fn metrics(&self) -> &FanInMetrics {
        &self.metrics
    }

    /// Create a new, not yet started, run over this source
    pub fn subscription(&self) -> Subscription {
        Subscription {
            source: Arc::clone(&self.source),
            config: self.config.clone(),
            metrics: self.metrics.clone(),
            state: Mutex::new(SubscriptionState::Idle),
        }
    }

    /// Read every part and deliver the batches to `subscriber`.
    ///
    /// Returns the terminal state once the subscriber has been told
    /// `completed` or `error`. Dropping the returned future aborts every
    /// part runner it started.
    pub async fn subscribe(&self, subscriber: &mut dyn Subscriber) -> SubscriptionState {
        self.subscription().run(subscriber).await
    }
}

/// A single run of a [`StreamSource`].
///
/// A subscription runs at most once; once it reaches
/// [`SubscriptionState::Completed`] or [`SubscriptionState::Errored`] it
/// stays there.
#[derive(Debug)]
pub struct Subscription {
    source: Arc<dyn PartSource>,
    config: FanInConfig,
    metrics: FanInMetrics,
    state: Mutex<SubscriptionState>,
}

impl Subscription {
    /// Current state of this run
    pub fn state(&self) -> SubscriptionState {
        *self.state.lock()
    }

    fn set_state(&self, state: SubscriptionState) {
        *self.state.lock() = state;
    }

    /// Drive the subscription protocol against `subscriber` and return
    /// the terminal state.
    ///
    /// Calling this on a subscription that has already started tells
    /// `subscriber` `starting` then `error`, and leaves this
    /// subscription's state untouched.
    pub async fn run(&self, subscriber: &mut dyn Subscriber) -> SubscriptionState {
        let previous = {
            let mut state = self.state.lock();
            let previous = *state;
            if previous == SubscriptionState::Idle {
                *state = SubscriptionState::Starting;
            }
            previous
        };
        if previous != SubscriptionState::Idle {
            subscriber.starting(CancellationToken::noop());
            subscriber.error(FanInError::Execution(format!(
                "Subscription already ran, state is {previous}"
            )));
            return previous;
        }

        let parts = match self.source.parts() {
            Ok(parts) => parts,
            Err(e) => return self.fail_before_start(subscriber, e),
        };

        if parts.is_empty() {
            debug!("Source {:?} has no parts", self.source);
            subscriber.starting(CancellationToken::noop());
            self.set_state(SubscriptionState::Completed);
            subscriber.completed();
            return SubscriptionState::Completed;
        }

        let num_parts = parts.len();
        let (tx, mut rx) = match relay(self.config.relay_capacity, num_parts) {
            Ok(relay) => relay,
            Err(e) => return self.fail_before_start(subscriber, e),
        };

        let token = CancellationToken::new();
        // aborts any runner still alive when the subscription ends
        let mut runners: JoinSet<PartOutcome> = JoinSet::new();
        match Handle::try_current() {
            Ok(handle) => {
                for (index, part) in parts.into_iter().enumerate() {
                    let runner = PartRunner::new(
                        index,
                        part,
                        tx.clone(),
                        token.clone(),
                        self.metrics.clone(),
                    );
                    token.register(runner.cancel_handle());
                    runners.spawn_on(runner.run(), &handle);
                }
                debug!(
                    "Started {num_parts} part runners, relay capacity {}",
                    self.config.relay_capacity
                );
            }
            Err(e) => {
                let e = FanInError::ResourcesExhausted(format!(
                    "Could not schedule {num_parts} part runners: {e}"
                ));
                warn!("Stopping execution: {e}");
                self.metrics.parts_failed.add(num_parts);
                // nothing was sent yet, so the marker always fits
                tx.try_short_circuit();
            }
        }
        // runners hold the only senders from here on
        drop(tx);

        subscriber.starting(token.clone());
        self.set_state(SubscriptionState::Draining);

        match self.drain(&mut rx, &token, subscriber).await {
            Ok(()) => {
                debug!("Subscription completed: {}", self.metrics);
                self.set_state(SubscriptionState::Completed);
                subscriber.completed();
                SubscriptionState::Completed
            }
            Err(e) => {
                error!("Subscription failed, cancelling {num_parts} parts: {e}");
                token.cancel();
                self.set_state(SubscriptionState::Errored);
                subscriber.error(e);
                SubscriptionState::Errored
            }
        }
    }

    /// Forward batches until the terminal marker is dequeued
    async fn drain(
        &self,
        rx: &mut RelayReceiver,
        token: &CancellationToken,
        subscriber: &mut dyn Subscriber,
    ) -> Result<()> {
        let elapsed_drain = self.metrics.elapsed_drain.clone();
        let _timer = elapsed_drain.timer();

        while let Some(batch) = rx.take().await {
            // a failing part also cancels the token, but what it left
            // in the relay is still delivered
            if self.config.drop_in_flight_on_cancel
                && token.is_cancelled()
                && !rx.is_short_circuited()
            {
                continue;
            }
            let num_rows = batch.num_rows();
            subscriber.next(batch)?;
            self.metrics.output_batches.add(1);
            self.metrics.output_rows.add(num_rows);
        }
        Ok(())
    }

    fn fail_before_start(
        &self,
        subscriber: &mut dyn Subscriber,
        e: FanInError,
    ) -> SubscriptionState {
        error!("Could not start subscription on {:?}: {e}", self.source);
        subscriber.starting(CancellationToken::noop());
        self.set_state(SubscriptionState::Errored);
        subscriber.error(e);
        SubscriptionState::Errored
    }
}

/// Read every part of `source` and return all the batches
pub async fn collect(
    source: Arc<dyn PartSource>,
    config: FanInConfig,
) -> Result<Vec<RecordBatch>> {
    let mut subscriber = CollectingSubscriber::new();
    StreamSource::new(source)
        .with_config(config)
        .subscribe(&mut subscriber)
        .await;
    subscriber.into_result()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::part::{MemorySource, Part};
    use crate::test_util::{
        assert_is_pending, make_batch, test_schema, BlockingPart, Event, PartList,
        RecordingSubscriber,
    };
    use futures::FutureExt;

    fn two_by_three() -> Arc<dyn PartSource> {
        let partitions = (0..2)
            .map(|p| (0..3).map(|b| make_batch(p * 10 + b, 1)).collect())
            .collect();
        Arc::new(MemorySource::try_new(partitions, test_schema()).unwrap())
    }

    #[tokio::test]
    async fn merge() -> Result<()> {
        let source = StreamSource::new(two_by_three())
            .with_config(FanInConfig::new().with_relay_capacity(2));
        let subscription = source.subscription();
        assert_eq!(subscription.state(), SubscriptionState::Idle);

        let mut sub = RecordingSubscriber::new();
        let state = subscription.run(&mut sub).await;

        assert_eq!(sub.num_batches(), 6);
        assert_eq!(sub.events().first(), Some(&Event::Starting));
        assert_eq!(sub.events().last(), Some(&Event::Completed));
        assert_eq!(state, SubscriptionState::Completed);
        assert_eq!(subscription.state(), SubscriptionState::Completed);
        assert_eq!(source.metrics().output_batches.value(), 6);
        assert_eq!(source.metrics().output_rows.value(), 6);
        assert_eq!(source.metrics().parts_completed.value(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn resubscribe_is_independent() -> Result<()> {
        let source = StreamSource::new(two_by_three());
        for _ in 0..3 {
            let mut sub = RecordingSubscriber::new();
            source.subscribe(&mut sub).await;
            assert_eq!(sub.num_batches(), 6);
            assert!(sub.is_completed());
        }
        assert_eq!(source.metrics().output_batches.value(), 18);
        Ok(())
    }

    #[tokio::test]
    async fn empty_source() -> Result<()> {
        let empty = MemorySource::try_new(vec![], test_schema())?;
        let source = StreamSource::new(Arc::new(empty));

        let mut sub = RecordingSubscriber::new();
        let state = source.subscribe(&mut sub).await;

        assert_eq!(sub.events(), &[Event::Starting, Event::Completed]);
        assert!(sub.cancel_token().is_some());
        assert_eq!(state, SubscriptionState::Completed);
        Ok(())
    }

    #[tokio::test]
    async fn consumer_error_surfaces_as_error() -> Result<()> {
        let source = StreamSource::new(two_by_three());
        let mut sub = RecordingSubscriber::new().with_fail_on_batch(2);
        let state = source.subscribe(&mut sub).await;

        assert_eq!(sub.num_batches(), 1);
        match sub.events().last() {
            Some(Event::Error(msg)) => assert_eq!(msg, "Execution error: subscriber failed"),
            other => panic!("unexpected last event {other:?}"),
        }
        assert!(sub.cancel_token().unwrap().is_cancelled());
        assert_eq!(state, SubscriptionState::Errored);
        Ok(())
    }

    #[tokio::test]
    async fn terminal_state_is_final() -> Result<()> {
        let source = StreamSource::new(two_by_three());
        let first = source.subscription();
        let mut sub = RecordingSubscriber::new();
        first.run(&mut sub).await;
        assert_eq!(first.state(), SubscriptionState::Completed);

        // running the same subscription again is refused
        let mut again = RecordingSubscriber::new();
        assert_eq!(first.run(&mut again).await, SubscriptionState::Completed);
        assert_eq!(
            again.events(),
            &[
                Event::Starting,
                Event::Error(
                    "Execution error: Subscription already ran, state is Completed"
                        .to_string()
                )
            ]
        );
        assert_eq!(first.state(), SubscriptionState::Completed);
        assert_eq!(source.metrics().output_batches.value(), 6);
        Ok(())
    }

    #[tokio::test]
    async fn later_run_does_not_touch_earlier_state() -> Result<()> {
        let parts: Vec<Arc<dyn Part>> = vec![Arc::new(BlockingPart::new(test_schema()))];
        let source = StreamSource::new(Arc::new(PartList::new(parts)));

        let first = source.subscription();
        let mut sub = RecordingSubscriber::new().with_cancel_after(0);
        assert_eq!(first.run(&mut sub).await, SubscriptionState::Completed);

        let second = source.subscription();
        let mut sub = RecordingSubscriber::new();
        let mut fut = second.run(&mut sub).boxed();
        assert_is_pending(&mut fut);

        assert_eq!(second.state(), SubscriptionState::Draining);
        assert_eq!(first.state(), SubscriptionState::Completed);
        drop(fut);
        Ok(())
    }

    #[tokio::test]
    async fn collect_all() -> Result<()> {
        let batches = collect(two_by_three(), FanInConfig::default()).await?;
        let rows: usize = batches.iter().map(|b| b.num_rows()).sum();
        assert_eq!(rows, 6);
        Ok(())
    }

    #[test]
    fn display_state() {
        assert_eq!(SubscriptionState::Draining.to_string(), "Draining");
    }
}
