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

//! Cooperative cancellation of part runners
//!
//! A [`CancellationToken`] is handed to the consumer when a subscription
//! starts. Cancelling it fans out to the [`PartCancelHandle`] of every
//! part runner of that subscription. Cancellation is best effort: a
//! runner only observes it at its next checkpoint.

use std::fmt::{self, Debug};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

/// Something that can be asked to stop
pub trait Cancel: Send + Sync {
    /// Request cancellation. Must be idempotent.
    fn cancel(&self);
}

/// Cancel handle owned by a single part runner
#[derive(Debug, Default)]
pub struct PartCancelHandle {
    cancelled: AtomicBool,
    notify: Notify,
}

impl PartCancelHandle {
    /// Create a new, not yet cancelled, handle
    pub fn new() -> Self {
        Self::default()
    }

    /// Has cancellation been requested?
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Completes once cancellation has been requested.
    ///
    /// Meant to be raced against a suspension point with `tokio::select!`.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

impl Cancel for PartCancelHandle {
    fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::AcqRel) {
            self.notify.notify_waiters();
        }
    }
}

#[derive(Default)]
struct TokenInner {
    cancelled: AtomicBool,
    children: Mutex<Vec<Arc<dyn Cancel>>>,
}

/// Composite cancel handle for one subscription.
///
/// Clones share state: cancelling any clone cancels them all.
#[derive(Clone, Default)]
pub struct CancellationToken {
    inner: Arc<TokenInner>,
}

impl CancellationToken {
    /// Create a token with no children
    pub fn new() -> Self {
        Self::default()
    }

    /// A token that is never populated. Used when there is nothing to
    /// cancel, e.g. for a source without parts.
    pub fn noop() -> Self {
        Self::default()
    }

    /// Register a child to be cancelled along with this token.
    ///
    /// A child registered after the token was cancelled is cancelled
    /// immediately.
    pub fn register(&self, child: Arc<dyn Cancel>) {
        {
            let mut children = self.inner.children.lock();
            if !self.is_cancelled() {
                children.push(child);
                return;
            }
        }
        child.cancel();
    }

    /// Cancel every registered child. Calling this more than once has no
    /// further effect.
    pub fn cancel(&self) {
        // taken under the lock so a concurrent `register` either lands
        // before the drain or observes the flag
        let children = {
            let mut children = self.inner.children.lock();
            if self.inner.cancelled.swap(true, Ordering::AcqRel) {
                return;
            }
            std::mem::take(&mut *children)
        };
        for child in children {
            child.cancel();
        }
    }

    /// Has [`Self::cancel`] been called?
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Number of children still registered
    pub fn num_children(&self) -> usize {
        self.inner.children.lock().len()
    }
}

impl Cancel for CancellationToken {
    fn cancel(&self) {
        CancellationToken::cancel(self)
    }
}

impl Debug for CancellationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .field("children", &self.num_children())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[derive(Default)]
    struct CountingCancel(AtomicUsize);

    impl Cancel for CountingCancel {
        fn cancel(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn cancel_fans_out_once() {
        let token = CancellationToken::new();
        let a = Arc::new(CountingCancel::default());
        let b = Arc::new(CountingCancel::default());
        token.register(Arc::clone(&a) as _);
        token.register(Arc::clone(&b) as _);
        assert_eq!(token.num_children(), 2);

        token.cancel();
        token.clone().cancel();

        assert!(token.is_cancelled());
        assert_eq!(a.0.load(Ordering::SeqCst), 1);
        assert_eq!(b.0.load(Ordering::SeqCst), 1);
        assert_eq!(token.num_children(), 0);
    }

    #[test]
    fn late_registration_is_cancelled() {
        let token = CancellationToken::new();
        token.cancel();

        let child = Arc::new(CountingCancel::default());
        token.register(Arc::clone(&child) as _);
        assert_eq!(child.0.load(Ordering::SeqCst), 1);
        assert_eq!(token.num_children(), 0);
    }

    #[test]
    fn noop_token() {
        let token = CancellationToken::noop();
        assert!(!token.is_cancelled());
        token.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn part_handle_is_idempotent() {
        let handle = PartCancelHandle::new();
        assert!(!handle.is_cancelled());
        handle.cancel();
        handle.cancel();
        assert!(handle.is_cancelled());
    }

    #[tokio::test]
    async fn part_handle_wakes_waiter() {
        let handle = Arc::new(PartCancelHandle::new());
        let waiter = {
            let handle = Arc::clone(&handle);
            tokio::spawn(async move { handle.cancelled().await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        handle.cancel();

        tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .expect("waiter did not observe cancellation")
            .unwrap();

        // already cancelled: returns immediately
        handle.cancelled().await;
    }
}
