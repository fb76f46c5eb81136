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

//! Parts: independently readable slices of a logical data source

use std::fmt::Debug;
use std::pin::Pin;
use std::sync::Arc;

use arrow::datatypes::SchemaRef;
use arrow::record_batch::RecordBatch;
use futures::{Stream, StreamExt};

use crate::error::{FanInError, Result};
use crate::plan_err;

/// Trait for a stream of record batches produced by a part.
///
/// Dropping the stream releases whatever the part holds open.
pub type SendableRecordBatchStream = Pin<Box<dyn Stream<Item = Result<RecordBatch>> + Send>>;

/// One independently readable slice of a logical data source, such as a
/// single file of a partitioned table.
pub trait Part: Debug + Send + Sync {
    /// Name used in log messages and errors
    fn name(&self) -> String;

    /// Schema of the batches this part produces
    fn schema(&self) -> SchemaRef;

    /// Begin reading this part.
    ///
    /// The returned stream is lazy: no batch is produced until it is
    /// polled. An error returned here, or yielded by the stream, is a
    /// read error for this part.
    fn open(&self) -> Result<SendableRecordBatchStream>;
}

/// Enumerates the parts of a logical data source
pub trait PartSource: Debug + Send + Sync {
    /// Schema shared by every part
    fn schema(&self) -> SchemaRef;

    /// Returns the parts of this source, possibly none
    fn parts(&self) -> Result<Vec<Arc<dyn Part>>>;
}

/// A part whose batches are held in memory
#[derive(Debug, Clone)]
pub struct MemoryPart {
    name: String,
    schema: SchemaRef,
    batches: Vec<RecordBatch>,
}

impl MemoryPart {
    /// Create a part that replays `batches` in order
    pub fn new(name: impl Into<String>, schema: SchemaRef, batches: Vec<RecordBatch>) -> Self {
        Self {
            name: name.into(),
            schema,
            batches,
        }
    }

    /// The batches this part replays
    pub fn batches(&self) -> &[RecordBatch] {
        &self.batches
    }
}

impl Part for MemoryPart {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn schema(&self) -> SchemaRef {
        Arc::clone(&self.schema)
    }

    fn open(&self) -> Result<SendableRecordBatchStream> {
        let batches = self.batches.clone();
        Ok(futures::stream::iter(batches.into_iter().map(Ok::<_, FanInError>)).boxed())
    }
}

/// A partitioned in-memory table: one [`MemoryPart`] per partition
#[derive(Debug, Clone)]
pub struct MemorySource {
    schema: SchemaRef,
    partitions: Vec<Vec<RecordBatch>>,
}

impl MemorySource {
    /// Create a source over `partitions`, checking every batch against
    /// `schema`
    pub fn try_new(partitions: Vec<Vec<RecordBatch>>, schema: SchemaRef) -> Result<Self> {
        for (i, partition) in partitions.iter().enumerate() {
            for batch in partition {
                if batch.schema() != schema {
                    return plan_err!(
                        "Mismatch between schema and batches in partition {}: {:?} != {:?}",
                        i,
                        batch.schema(),
                        schema
                    );
                }
            }
        }
        Ok(Self { schema, partitions })
    }

    /// Number of partitions (and so parts)
    pub fn num_partitions(&self) -> usize {
        self.partitions.len()
    }
}

impl PartSource for MemorySource {
    fn schema(&self) -> SchemaRef {
        Arc::clone(&self.schema)
    }

    fn parts(&self) -> Result<Vec<Arc<dyn Part>>> {
        Ok(self
            .partitions
            .iter()
            .enumerate()
            .map(|(i, batches)| {
                Arc::new(MemoryPart::new(
                    format!("memory-{i}"),
                    Arc::clone(&self.schema),
                    batches.clone(),
                )) as Arc<dyn Part>
            })
            .collect())
    }
}
