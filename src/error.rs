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

//! Fan-in error types

use std::error;
use std::io;
use std::result;

use arrow::error::ArrowError;
use thiserror::Error;

/// Result type for operations that could result in a [FanInError]
pub type Result<T> = result::Result<T, FanInError>;

/// Error type for generic operations that could result in FanInError::External
pub type GenericError = Box<dyn error::Error + Send + Sync>;

/// Fan-in error
#[derive(Debug, Error)]
pub enum FanInError {
    /// Error returned by arrow.
    #[error("Arrow error: {0}")]
    ArrowError(#[from] ArrowError),
    /// Error associated to I/O operations and associated traits.
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
    /// The partitions handed to a source are not consistent with each
    /// other, e.g. a batch does not match the declared schema.
    #[error("Error during planning: {0}")]
    Plan(String),
    /// Error returned while reading a part or delivering its batches.
    #[error("Execution error: {0}")]
    Execution(String),
    /// An internal invariant was violated. This should not happen in
    /// normal usage.
    #[error("Internal error: {0}. This was likely caused by a bug in the fan-in code")]
    Internal(String),
    /// A part runner could not be scheduled, e.g. no runtime is available.
    #[error("Resources exhausted: {0}")]
    ResourcesExhausted(String),
    /// A part panicked while being opened or polled.
    #[error("Part panicked: {0}")]
    Panic(String),
    /// Errors originating from outside this crate, typically from a
    /// format-specific part reader.
    #[error("External error: {0}")]
    External(#[from] GenericError),
}

impl FanInError {
    /// Builds a [`FanInError::Panic`] from the payload of a caught panic
    pub fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let msg = if let Some(s) = payload.downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_string()
        };
        FanInError::Panic(msg)
    }
}

impl From<FanInError> for ArrowError {
    fn from(e: FanInError) -> Self {
        match e {
            FanInError::ArrowError(e) => e,
            FanInError::External(e) => ArrowError::ExternalError(e),
            other => ArrowError::ExternalError(Box::new(other)),
        }
    }
}

/// Returns an `Err(FanInError::Execution)` built from a format string
#[macro_export]
macro_rules! exec_err {
    ($($args:expr),* $(,)?) => {
        Err($crate::error::FanInError::Execution(format!($($args),*)))
    };
}

/// Returns an `Err(FanInError::Internal)` built from a format string
#[macro_export]
macro_rules! internal_err {
    ($($args:expr),* $(,)?) => {
        Err($crate::error::FanInError::Internal(format!($($args),*)))
    };
}

/// Returns an `Err(FanInError::Plan)` built from a format string
#[macro_export]
macro_rules! plan_err {
    ($($args:expr),* $(,)?) => {
        Err($crate::error::FanInError::Plan(format!($($args),*)))
    };
}
