//! Bounded FIFO channel with a one-way `closed` state.
//!
//! A [`CancelableChannel`] sits between a producer and a consumer that may
//! disappear at any time, typically the two flows of the serial transport and
//! the tasks of the bridge. Closing the channel wakes every blocked `put` and
//! `get` immediately, so nobody stays parked on a queue whose other end is
//! gone.
//!
//! Closing does not throw away buffered data. After the channel is closed:
//!
//! * `put` always fails with [`ChannelClosed`],
//! * `get` keeps returning the buffered items in FIFO order and fails only
//!   once the queue has been drained.
//!
//! ```text
//!            put (waits while full)            get (waits while empty)
//!  producer ------------------------> [ queue ] ------------------------> consumer
//!                                         |
//!                           close(cause) -'  wakes everybody, one-way
//! ```

use std::collections::VecDeque;
use std::error::Error as StdError;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use thiserror::Error;
use tokio::sync::Notify;

// =============================================================================
// Public Interface
// =============================================================================

/// The reason attached to a channel closure, shared by every caller that
/// observes it.
pub type CloseCause = Arc<dyn StdError + Send + Sync>;

/// Returned by any operation on a closed channel.
#[derive(Debug, Clone, Error)]
#[error("channel closed{}", .cause.as_ref().map(|c| format!(": {}", c)).unwrap_or_default())]
pub struct ChannelClosed {
    /// The cause given to [`CancelableChannel::close`], if any.
    pub cause: Option<CloseCause>,
}

/// Error of the non-blocking [`CancelableChannel::try_put`].
#[derive(Debug, Error)]
pub enum TryPutError<T> {
    #[error("channel is full")]
    Full(T),
    #[error(transparent)]
    Closed(#[from] ChannelClosed),
}

/// Error of the non-blocking [`CancelableChannel::try_get`].
#[derive(Debug, Clone, Error)]
pub enum TryGetError {
    #[error("channel is empty")]
    Empty,
    #[error(transparent)]
    Closed(#[from] ChannelClosed),
}

/// A bounded FIFO queue that can be irreversibly closed.
///
/// The channel is meant to be shared (`Arc<CancelableChannel<T>>`) between
/// any number of producers and consumers. All waiting is done
/// asynchronously; blocking threads can drive the futures with
/// [`tokio::runtime::Handle::block_on`].
pub struct CancelableChannel<T> {
    state: Mutex<State<T>>,
    /// Signalled whenever an item is added or the channel is closed.
    readable: Notify,
    /// Signalled whenever an item is removed or the channel is closed.
    writable: Notify,
}

impl<T> CancelableChannel<T> {
    /// Create a new channel holding at most `capacity` items.
    ///
    /// # Panics
    ///
    /// When `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "channel capacity must be at least 1");
        CancelableChannel {
            state: Mutex::new(State {
                queue: VecDeque::with_capacity(capacity.min(1024)),
                capacity,
                closed: false,
                cause: None,
            }),
            readable: Notify::new(),
            writable: Notify::new(),
        }
    }

    /// Enqueue `item`, waiting for room if the channel is full.
    ///
    /// Fails if the channel is closed when called or gets closed while
    /// waiting. In the latter case the item is dropped.
    pub async fn put(&self, item: T) -> Result<(), ChannelClosed> {
        let mut item = item;
        loop {
            // Register interest before checking the state so that a wake-up
            // happening between the check and the await is not lost.
            let notified = self.writable.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.try_put(item) {
                Ok(()) => return Ok(()),
                Err(TryPutError::Closed(closed)) => return Err(closed),
                Err(TryPutError::Full(back)) => item = back,
            }

            notified.await;
        }
    }

    /// Enqueue `item` without waiting.
    pub fn try_put(&self, item: T) -> Result<(), TryPutError<T>> {
        let mut state = self.lock();
        if state.closed {
            return Err(TryPutError::Closed(state.closed_error()));
        }
        if state.queue.len() >= state.capacity {
            return Err(TryPutError::Full(item));
        }
        state.queue.push_back(item);
        drop(state);
        self.readable.notify_waiters();
        Ok(())
    }

    /// Take the oldest item, waiting for one if the channel is empty.
    ///
    /// Buffered items are still handed out after the channel is closed; the
    /// error only surfaces once the queue is empty.
    pub async fn get(&self) -> Result<T, ChannelClosed> {
        loop {
            let notified = self.readable.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.try_get() {
                Ok(item) => return Ok(item),
                Err(TryGetError::Closed(closed)) => return Err(closed),
                Err(TryGetError::Empty) => {}
            }

            notified.await;
        }
    }

    /// Take the oldest item without waiting.
    pub fn try_get(&self) -> Result<T, TryGetError> {
        let mut state = self.lock();
        let front = state.queue.pop_front();
        match front {
            Some(item) => {
                drop(state);
                self.writable.notify_waiters();
                Ok(item)
            }
            None if state.closed => Err(TryGetError::Closed(state.closed_error())),
            None => Err(TryGetError::Empty),
        }
    }

    /// Close the channel and wake up every waiter.
    ///
    /// Only the first call has an effect; the cause given then is the one
    /// reported by all later failures.
    pub fn close(&self, cause: Option<CloseCause>) {
        let mut state = self.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        state.cause = cause;
        drop(state);
        self.readable.notify_waiters();
        self.writable.notify_waiters();
    }

    /// Drop every buffered item. Returns the number of items dropped.
    pub fn clear(&self) -> usize {
        let mut state = self.lock();
        let dropped = state.queue.len();
        state.queue.clear();
        drop(state);
        if dropped > 0 {
            self.writable.notify_waiters();
        }
        dropped
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().queue.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.lock().capacity
    }

    fn lock(&self) -> MutexGuard<'_, State<T>> {
        // The state is always left consistent, a panic elsewhere while holding
        // the lock does not invalidate it.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<T> fmt::Debug for CancelableChannel<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("CancelableChannel")
            .field("len", &state.queue.len())
            .field("capacity", &state.capacity)
            .field("closed", &state.closed)
            .finish()
    }
}

// =============================================================================
// Private stuff
// =============================================================================

struct State<T> {
    queue: VecDeque<T>,
    capacity: usize,
    closed: bool,
    cause: Option<CloseCause>,
}

impl<T> State<T> {
    fn closed_error(&self) -> ChannelClosed {
        ChannelClosed {
            cause: self.cause.clone(),
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
