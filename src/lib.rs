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

#![warn(missing_docs)]

//! Parallel fan-in of independently readable parts into one stream of
//! Arrow [`RecordBatch`](arrow::record_batch::RecordBatch)es.
//!
//! A [`StreamSource`] enumerates the [`Part`]s of a [`PartSource`], runs
//! each on its own tokio task and forwards every batch, through a bounded
//! relay, to a single [`Subscriber`]:
//!
//! ```
//! # use std::sync::Arc;
//! # use partition_fanin::test_util::{make_batch, test_schema};
//! use partition_fanin::{collect, FanInConfig, MemorySource};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> partition_fanin::Result<()> {
//! let partitions = vec![
//!     vec![make_batch(0, 3), make_batch(3, 3)],
//!     vec![make_batch(6, 4)],
//! ];
//! let source = Arc::new(MemorySource::try_new(partitions, test_schema())?);
//!
//! let batches = collect(source, FanInConfig::default()).await?;
//! let rows: usize = batches.iter().map(|b| b.num_rows()).sum();
//! assert_eq!(rows, 10);
//! # Ok(())
//! # }
//! ```
//!
//! Batches from different parts interleave in no particular order. A part
//! that fails to read ends the whole stream early but is only logged; the
//! subscriber still sees `completed`.

pub mod cancel;
pub mod config;
pub mod error;
pub mod metrics;
pub mod part;
pub mod relay;
pub mod runner;
pub mod source;
pub mod subscriber;
pub mod test_util;

pub use cancel::{Cancel, CancellationToken, PartCancelHandle};
pub use config::FanInConfig;
pub use error::{FanInError, Result};
pub use metrics::FanInMetrics;
pub use part::{MemoryPart, MemorySource, Part, PartSource, SendableRecordBatchStream};
pub use source::{collect, StreamSource, Subscription, SubscriptionState};
pub use subscriber::{CollectingSubscriber, Subscriber};
