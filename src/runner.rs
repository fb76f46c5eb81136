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

//! Drives a single part into the relay

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::{FutureExt, StreamExt};
use log::{debug, warn};

use crate::cancel::{CancellationToken, PartCancelHandle};
use crate::error::FanInError;
use crate::metrics::FanInMetrics;
use crate::part::Part;
use crate::relay::RelaySender;

/// How a part runner terminated
#[derive(Debug)]
pub enum PartOutcome {
    /// The part was driven to exhaustion
    Exhausted,
    /// Cancellation was observed at a checkpoint
    Cancelled,
    /// The part failed to open, yielded an error, or panicked. The whole
    /// subscription was ended early and its other parts cancelled.
    Failed(FanInError),
    /// The consumer went away while a batch was being delivered
    Detached,
}

/// Runs one [`Part`] to completion, forwarding every batch it produces
/// to the relay.
///
/// Whatever way the runner exits, it either decrements the relay's
/// outstanding count or ends the subscription outright, so the draining
/// loop always sees a terminal marker.
#[derive(Debug)]
pub struct PartRunner {
    index: usize,
    part: Arc<dyn Part>,
    relay: RelaySender,
    cancel: Arc<PartCancelHandle>,
    subscription: CancellationToken,
    metrics: FanInMetrics,
}

impl PartRunner {
    /// Create a runner for the `index`th part of a subscription.
    ///
    /// `subscription` is the token handed to the subscriber; a failing
    /// part cancels it to stop its siblings.
    pub fn new(
        index: usize,
        part: Arc<dyn Part>,
        relay: RelaySender,
        subscription: CancellationToken,
        metrics: FanInMetrics,
    ) -> Self {
        Self {
            index,
            part,
            relay,
            cancel: Arc::new(PartCancelHandle::new()),
            subscription,
            metrics,
        }
    }

    /// Handle that stops this runner at its next checkpoint
    pub fn cancel_handle(&self) -> Arc<PartCancelHandle> {
        Arc::clone(&self.cancel)
    }

    /// Drive the part until it is exhausted, fails, is cancelled, or the
    /// consumer goes away
    pub async fn run(self) -> PartOutcome {
        let Self {
            index,
            part,
            relay,
            cancel,
            subscription,
            metrics,
        } = self;

        let outcome = AssertUnwindSafe(drive(part.as_ref(), &relay, &cancel))
            .catch_unwind()
            .await
            .unwrap_or_else(|payload| PartOutcome::Failed(FanInError::from_panic(payload)));

        match &outcome {
            PartOutcome::Exhausted => {
                debug!("Part {index} ({}) exhausted", part.name());
                metrics.parts_completed.add(1);
                relay.finish_part().await;
            }
            PartOutcome::Cancelled => {
                debug!("Part {index} ({}) cancelled", part.name());
                metrics.parts_cancelled.add(1);
                relay.finish_part().await;
            }
            PartOutcome::Failed(e) => {
                // not surfaced to the subscriber: the stream just ends early
                warn!(
                    "Stopping execution: part {index} ({}) failed: {e}",
                    part.name()
                );
                metrics.parts_failed.add(1);
                relay.short_circuit(&subscription).await;
            }
            PartOutcome::Detached => {
                debug!(
                    "Stopping execution: output is gone, part {index} ({}) detached",
                    part.name()
                );
                relay.finish_part().await;
            }
        }
        outcome
    }
}

async fn drive(part: &dyn Part, relay: &RelaySender, cancel: &PartCancelHandle) -> PartOutcome {
    if cancel.is_cancelled() {
        return PartOutcome::Cancelled;
    }

    let mut stream = match part.open() {
        Ok(stream) => stream,
        Err(e) => return PartOutcome::Failed(e),
    };

    loop {
        let item = tokio::select! {
            biased;
            _ = cancel.cancelled() => return PartOutcome::Cancelled,
            item = stream.next() => item,
        };

        let batch = match item {
            None => return PartOutcome::Exhausted,
            Some(Err(e)) => return PartOutcome::Failed(e),
            Some(Ok(batch)) => batch,
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return PartOutcome::Cancelled,
            sent = relay.put(batch) => {
                if sent.is_err() {
                    return PartOutcome::Detached;
                }
            }
        }
    }
}
