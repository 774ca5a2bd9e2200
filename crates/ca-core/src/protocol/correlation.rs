//! Correlation id allocation for search requests.
//!
//! A search request carries an opaque 32-bit id in `parameter2`; the server
//! echoes it in its response so the client can pair the two.  Ids only need
//! to be unique among a session's *outstanding* searches, so the allocator is
//! a wrapping counter and the session skips any value still in flight.

use std::sync::atomic::{AtomicU32, Ordering};

/// Opaque token pairing a search request with its eventual response.
pub type CorrelationId = u32;

/// A thread-safe, wrapping counter handing out [`CorrelationId`]s.
///
/// # Examples
///
/// ```rust
/// use ca_core::protocol::CorrelationIdAllocator;
///
/// let ids = CorrelationIdAllocator::new();
/// assert_eq!(ids.next(), 1);
/// assert_eq!(ids.next(), 2);
/// ```
#[derive(Debug)]
pub struct CorrelationIdAllocator {
    inner: AtomicU32,
}

impl CorrelationIdAllocator {
    /// Creates an allocator whose first id is 1.
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    /// Creates an allocator whose first id is `first`.
    pub fn starting_at(first: CorrelationId) -> Self {
        Self {
            inner: AtomicU32::new(first),
        }
    }

    /// Returns the next id, wrapping from `u32::MAX` back to 0.
    ///
    /// `Relaxed` is enough: ids carry no memory-ordering obligations, they
    /// only have to be distinct.
    pub fn next(&self) -> CorrelationId {
        self.inner.fetch_add(1, Ordering::Relaxed)
    }

    /// Returns the id the next call to [`next`](Self::next) would hand out.
    pub fn peek(&self) -> CorrelationId {
        self.inner.load(Ordering::Relaxed)
    }
}

impl Default for CorrelationIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}
