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

//! The consumer side of a subscription

use arrow::record_batch::RecordBatch;

use crate::cancel::CancellationToken;
use crate::error::{FanInError, Result};
use crate::internal_err;

/// Receives the output of a [`StreamSource`](crate::StreamSource)
/// subscription.
///
/// For every subscription `starting` is called exactly once, first,
/// followed by zero or more `next` calls and finally exactly one of
/// `completed` or `error`.
///
/// Note that a part that fails to read does not produce an `error`
/// call: the stream simply completes early and the failure is logged.
/// `error` is only called when the subscription itself faults, e.g.
/// when `next` returns an error.
pub trait Subscriber: Send {
    /// The subscription has started. `cancel` stops every part still
    /// being read.
    fn starting(&mut self, cancel: CancellationToken);

    /// A batch from one of the parts. Returning an error cancels the
    /// subscription and ends it with [`Self::error`].
    fn next(&mut self, batch: RecordBatch) -> Result<()>;

    /// Every part has terminated
    fn completed(&mut self);

    /// The subscription failed
    fn error(&mut self, error: FanInError);
}

/// A [`Subscriber`] that buffers every batch in memory
#[derive(Debug, Default)]
pub struct CollectingSubscriber {
    batches: Vec<RecordBatch>,
    completed: bool,
    error: Option<FanInError>,
}

impl CollectingSubscriber {
    /// Create an empty collector
    pub fn new() -> Self {
        Self::default()
    }

    /// Batches received so far
    pub fn batches(&self) -> &[RecordBatch] {
        &self.batches
    }

    /// Consume the collector, returning the batches if the subscription
    /// completed or the error it ended with
    pub fn into_result(self) -> Result<Vec<RecordBatch>> {
        match (self.error, self.completed) {
            (Some(e), _) => Err(e),
            (None, true) => Ok(self.batches),
            (None, false) => internal_err!("Subscription has not terminated"),
        }
    }
}

impl Subscriber for CollectingSubscriber {
    fn starting(&mut self, _cancel: CancellationToken) {}

    fn next(&mut self, batch: RecordBatch) -> Result<()> {
        self.batches.push(batch);
        Ok(())
    }

    fn completed(&mut self) {
        self.completed = true;
    }

    fn error(&mut self, error: FanInError) {
        self.error = Some(error);
    }
}
