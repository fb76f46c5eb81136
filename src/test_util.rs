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

//! Utilities for testing fan-in behaviour: parts that block, fail,
//! panic or never end, and a subscriber that records the protocol.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use arrow::array::Int32Array;
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::record_batch::RecordBatch;
use futures::{FutureExt, Stream, StreamExt};
use tokio::sync::Notify;

use crate::cancel::CancellationToken;
use crate::error::{FanInError, Result};
use crate::exec_err;
use crate::part::{Part, PartSource, SendableRecordBatchStream};
use crate::subscriber::Subscriber;

/// Single column schema used throughout the tests
pub fn test_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![Field::new("a", DataType::Int32, false)]))
}

/// A batch of `rows` consecutive values starting at `start`
pub fn make_batch(start: i32, rows: usize) -> RecordBatch {
    let values: Vec<i32> = (0..rows as i32).map(|i| start + i).collect();
    // the schema has a single non-null Int32 column, which always matches
    RecordBatch::try_new(test_schema(), vec![Arc::new(Int32Array::from(values))])
        .unwrap()
}

/// Asserts that given future is pending.
pub fn assert_is_pending<'a, T>(fut: &mut Pin<Box<dyn Future<Output = T> + Send + 'a>>) {
    let waker = futures::task::noop_waker();
    let mut cx = Context::from_waker(&waker);
    let poll = fut.poll_unpin(&mut cx);

    assert!(poll.is_pending());
}

/// Asserts that the strong count of `refs` drops to zero within ten
/// seconds, i.e. that whatever held the references was released
pub async fn assert_strong_count_converges_to_zero<T>(refs: Weak<T>) {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if Weak::strong_count(&refs) == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
}

/// A part whose stream never yields anything
#[derive(Debug)]
pub struct BlockingPart {
    schema: SchemaRef,
    /// Ref-counting helper to check if the part and its streams are
    /// released
    refs: Arc<()>,
}

impl BlockingPart {
    /// Create a new blocking part
    pub fn new(schema: SchemaRef) -> Self {
        Self {
            schema,
            refs: Default::default(),
        }
    }

    /// Weak pointer that can be used for ref-counting this part and its
    /// streams
    pub fn refs(&self) -> Weak<()> {
        Arc::downgrade(&self.refs)
    }
}

impl Part for BlockingPart {
    fn name(&self) -> String {
        "blocking".to_string()
    }

    fn schema(&self) -> SchemaRef {
        Arc::clone(&self.schema)
    }

    fn open(&self) -> Result<SendableRecordBatchStream> {
        Ok(Box::pin(BlockingStream {
            _refs: Arc::clone(&self.refs),
        }))
    }
}

/// A stream that is always pending
#[derive(Debug)]
struct BlockingStream {
    _refs: Arc<()>,
}

impl Stream for BlockingStream {
    type Item = Result<RecordBatch>;

    fn poll_next(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Poll::Pending
    }
}

/// A part that yields `batches` batches and then an error
#[derive(Debug)]
pub struct FailingPart {
    schema: SchemaRef,
    batches: usize,
}

impl FailingPart {
    /// Create a part failing after `batches` good batches
    pub fn new(schema: SchemaRef, batches: usize) -> Self {
        Self { schema, batches }
    }
}

impl Part for FailingPart {
    fn name(&self) -> String {
        "failing".to_string()
    }

    fn schema(&self) -> SchemaRef {
        Arc::clone(&self.schema)
    }

    fn open(&self) -> Result<SendableRecordBatchStream> {
        let batches = self.batches;
        let items = (0..=batches).map(move |i| {
            if i == batches {
                exec_err!("FailingPart failed after {batches} batches")
            } else {
                Ok(make_batch(i as i32, 1))
            }
        });
        Ok(futures::stream::iter(items).boxed())
    }
}

/// A part that cannot even be opened
#[derive(Debug)]
pub struct UnopenablePart {
    schema: SchemaRef,
}

impl UnopenablePart {
    /// Create a new unopenable part
    pub fn new(schema: SchemaRef) -> Self {
        Self { schema }
    }
}

impl Part for UnopenablePart {
    fn name(&self) -> String {
        "unopenable".to_string()
    }

    fn schema(&self) -> SchemaRef {
        Arc::clone(&self.schema)
    }

    fn open(&self) -> Result<SendableRecordBatchStream> {
        Err(FanInError::IoError(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "no such part",
        )))
    }
}

/// A part that yields `batches` batches and then panics
#[derive(Debug)]
pub struct PanicPart {
    schema: SchemaRef,
    batches: usize,
}

impl PanicPart {
    /// Create a part panicking after `batches` good batches
    pub fn new(schema: SchemaRef, batches: usize) -> Self {
        Self { schema, batches }
    }
}

impl Part for PanicPart {
    fn name(&self) -> String {
        "panicking".to_string()
    }

    fn schema(&self) -> SchemaRef {
        Arc::clone(&self.schema)
    }

    fn open(&self) -> Result<SendableRecordBatchStream> {
        let batches = self.batches;
        let items = (0..=batches).map(move |i| -> Result<RecordBatch> {
            if i == batches {
                panic!("PanicPart did panic after {batches} batches")
            }
            Ok(make_batch(i as i32, 1))
        });
        Ok(futures::stream::iter(items).boxed())
    }
}

/// A part that produces batches forever, counting how many it made
#[derive(Debug)]
pub struct UnboundedPart {
    schema: SchemaRef,
    produced: Arc<AtomicUsize>,
}

impl UnboundedPart {
    /// Create a new unbounded part with its own counter
    pub fn new(schema: SchemaRef) -> Self {
        Self::with_counter(schema, Default::default())
    }

    /// Create a new unbounded part counting into `produced`, which may
    /// be shared with other parts
    pub fn with_counter(schema: SchemaRef, produced: Arc<AtomicUsize>) -> Self {
        Self { schema, produced }
    }

    /// Number of batches produced so far
    pub fn produced(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.produced)
    }
}

impl Part for UnboundedPart {
    fn name(&self) -> String {
        "unbounded".to_string()
    }

    fn schema(&self) -> SchemaRef {
        Arc::clone(&self.schema)
    }

    fn open(&self) -> Result<SendableRecordBatchStream> {
        let produced = Arc::clone(&self.produced);
        Ok(futures::stream::repeat_with(move || -> Result<RecordBatch> {
            let i = produced.fetch_add(1, Ordering::SeqCst);
            Ok(make_batch(i as i32, 1))
        })
        .boxed())
    }
}

/// Wraps another part; its stream yields nothing until `gate` is
/// notified
#[derive(Debug)]
pub struct GatedPart {
    inner: Arc<dyn Part>,
    gate: Arc<Notify>,
}

impl GatedPart {
    /// Create a part that reads `inner` once `gate` is notified
    pub fn new(inner: Arc<dyn Part>, gate: Arc<Notify>) -> Self {
        Self { inner, gate }
    }
}

impl Part for GatedPart {
    fn name(&self) -> String {
        format!("gated {}", self.inner.name())
    }

    fn schema(&self) -> SchemaRef {
        self.inner.schema()
    }

    fn open(&self) -> Result<SendableRecordBatchStream> {
        let gate = Arc::clone(&self.gate);
        let inner = self.inner.open()?;
        Ok(futures::stream::once(async move {
            gate.notified().await;
            inner
        })
        .flatten()
        .boxed())
    }
}

/// A source over a fixed list of parts
#[derive(Debug, Default)]
pub struct PartList {
    parts: Vec<Arc<dyn Part>>,
}

impl PartList {
    /// Create a source returning `parts`
    pub fn new(parts: Vec<Arc<dyn Part>>) -> Self {
        Self { parts }
    }
}

impl PartSource for PartList {
    fn schema(&self) -> SchemaRef {
        test_schema()
    }

    fn parts(&self) -> Result<Vec<Arc<dyn Part>>> {
        Ok(self.parts.clone())
    }
}

/// A source whose enumeration fails
#[derive(Debug, Default)]
pub struct BrokenSource;

impl PartSource for BrokenSource {
    fn schema(&self) -> SchemaRef {
        test_schema()
    }

    fn parts(&self) -> Result<Vec<Arc<dyn Part>>> {
        exec_err!("cannot list parts")
    }
}

/// A callback observed by [`RecordingSubscriber`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// `starting` was called
    Starting,
    /// `next` was called with a batch of this many rows
    Next(usize),
    /// `completed` was called
    Completed,
    /// `error` was called with this message
    Error(String),
}

/// A [`Subscriber`] that records every callback and panics on protocol
/// violations, e.g. `next` after `completed`
#[derive(Debug, Default)]
pub struct RecordingSubscriber {
    events: Vec<Event>,
    token: Option<CancellationToken>,
    calls: usize,
    fail_on_batch: Option<usize>,
    cancel_after: Option<usize>,
}

impl RecordingSubscriber {
    /// Create a subscriber that accepts every batch
    pub fn new() -> Self {
        Self::default()
    }

    /// Return an error from the `n`th call to `next` (1-based)
    pub fn with_fail_on_batch(mut self, n: usize) -> Self {
        self.fail_on_batch = Some(n);
        self
    }

    /// Cancel the subscription from within the `n`th call to `next`
    /// (1-based). With `0` it cancels from `starting`.
    pub fn with_cancel_after(mut self, n: usize) -> Self {
        self.cancel_after = Some(n);
        self
    }

    /// Every callback so far
    pub fn events(&self) -> &[Event] {
        &self.events
    }

    /// Number of batches accepted
    pub fn num_batches(&self) -> usize {
        self.events
            .iter()
            .filter(|e| matches!(e, Event::Next(_)))
            .count()
    }

    /// Did the subscription end with `completed`?
    pub fn is_completed(&self) -> bool {
        matches!(self.events.last(), Some(Event::Completed))
    }

    /// Did the subscription end with `error`?
    pub fn is_errored(&self) -> bool {
        matches!(self.events.last(), Some(Event::Error(_)))
    }

    /// The token handed over in `starting`
    pub fn cancel_token(&self) -> Option<&CancellationToken> {
        self.token.as_ref()
    }

    fn is_terminated(&self) -> bool {
        self.is_completed() || self.is_errored()
    }

    fn assert_running(&self, callback: &str) {
        assert_eq!(
            self.events.first(),
            Some(&Event::Starting),
            "{callback} called before starting"
        );
        assert!(!self.is_terminated(), "{callback} called after termination");
    }
}

impl Subscriber for RecordingSubscriber {
    fn starting(&mut self, cancel: CancellationToken) {
        assert!(self.events.is_empty(), "starting called twice");
        self.events.push(Event::Starting);
        if self.cancel_after == Some(0) {
            cancel.cancel();
        }
        self.token = Some(cancel);
    }

    fn next(&mut self, batch: RecordBatch) -> Result<()> {
        self.assert_running("next");
        self.calls += 1;
        if self.fail_on_batch == Some(self.calls) {
            return exec_err!("subscriber failed");
        }
        self.events.push(Event::Next(batch.num_rows()));
        if self.cancel_after == Some(self.calls) {
            if let Some(token) = &self.token {
                token.cancel();
            }
        }
        Ok(())
    }

    fn completed(&mut self) {
        self.assert_running("completed");
        self.events.push(Event::Completed);
    }

    fn error(&mut self, error: FanInError) {
        self.assert_running("error");
        self.events.push(Event::Error(error.to_string()));
    }
}
