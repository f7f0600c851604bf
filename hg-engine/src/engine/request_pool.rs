//! Unexpected-Request Buffer Pool
//!
//! A listening engine pre-posts receive buffers so inbound requests can land
//! before anything has been matched to them. The pool starts with
//! `request_post_init` buffers and, once those are all taken, grows by the
//! configured increment.
//!
//! An increment of zero disables growth: [`RequestPool::take`] reports
//! exhaustion and inbound requests wait at the NA layer until a buffer is
//! reposted. How the NA layer holds them is up to the plugin.

use std::collections::VecDeque;
use tracing::{debug, info, warn};

use crate::error::NaError;

/// A posted receive buffer for one unexpected request.
#[derive(Debug)]
pub struct RequestBuffer {
    data: Vec<u8>,
    len: usize,
}

impl RequestBuffer {
    fn with_capacity(capacity: usize) -> Result<Self, NaError> {
        let mut data = Vec::new();
        data.try_reserve_exact(capacity)
            .map_err(|e| NaError::NoMemory(format!("request buffer of {capacity} bytes: {e}")))?;
        Ok(Self { data, len: 0 })
    }

    /// Store a received message, replacing previous contents.
    pub fn fill(&mut self, src: &[u8]) {
        self.data.clear();
        self.data.extend_from_slice(src);
        self.len = src.len();
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }

    fn reset(&mut self) {
        self.data.clear();
        self.len = 0;
    }
}

/// Runtime statistics for a [`RequestPool`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestPoolStats {
    /// Buffers currently posted and free.
    pub posted: usize,
    /// Total buffers allocated since creation.
    pub total_allocations: usize,
    /// Number of times the pool grew past its initial size.
    pub growths: usize,
    /// Buffers handed out and not yet reposted.
    pub active_count: usize,
}

pub struct RequestPool {
    buffer_size: usize,
    increment: u32,
    posted: VecDeque<RequestBuffer>,
    total_allocations: usize,
    growths: usize,
    active_count: usize,
}

impl RequestPool {
    /// Create an empty pool of `buffer_size`-byte buffers. `increment` is
    /// the growth step; zero disables growth.
    pub fn new(buffer_size: usize, increment: u32) -> Self {
        debug!(buffer_size, increment, "Creating RequestPool");
        Self {
            buffer_size,
            increment,
            posted: VecDeque::new(),
            total_allocations: 0,
            growths: 0,
            active_count: 0,
        }
    }

    /// Allocate and post `count` buffers. Fails without posting the rest if
    /// an allocation fails.
    pub fn post(&mut self, count: u32) -> Result<(), NaError> {
        self.posted.try_reserve(count as usize).map_err(|e| {
            NaError::NoMemory(format!("posting {count} request buffers: {e}"))
        })?;
        for _ in 0..count {
            let buf = RequestBuffer::with_capacity(self.buffer_size)?;
            self.posted.push_back(buf);
            self.total_allocations += 1;
        }
        info!(
            count,
            buffer_size = self.buffer_size,
            posted = self.posted.len(),
            "Posted unexpected-request buffers"
        );
        Ok(())
    }

    /// Take a posted buffer for an inbound request.
    ///
    /// When the pool is empty it grows by the increment. Returns `None` when
    /// growth is disabled (or fails) and nothing is posted.
    pub fn take(&mut self) -> Option<RequestBuffer> {
        if self.posted.is_empty() && self.increment > 0 {
            match self.post(self.increment) {
                Ok(()) => self.growths += 1,
                Err(e) => warn!("RequestPool growth failed: {}", e),
            }
        }
        let buf = self.posted.pop_front();
        if buf.is_some() {
            self.active_count += 1;
        } else {
            debug!("RequestPool exhausted; inbound requests stay queued at the NA layer");
        }
        buf
    }

    /// Return a buffer to the pool once its request has been consumed.
    pub fn repost(&mut self, mut buf: RequestBuffer) {
        buf.reset();
        self.active_count = self.active_count.saturating_sub(1);
        self.posted.push_back(buf);
    }

    pub fn increment(&self) -> u32 {
        self.increment
    }

    pub fn get_stats(&self) -> RequestPoolStats {
        RequestPoolStats {
            posted: self.posted.len(),
            total_allocations: self.total_allocations,
            growths: self.growths,
            active_count: self.active_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_post_initial() {
        let mut pool = RequestPool::new(256, 4);
        pool.post(8).unwrap();
        let stats = pool.get_stats();
        assert_eq!(stats.posted, 8);
        assert_eq!(stats.total_allocations, 8);
        assert_eq!(stats.growths, 0);
    }

    #[test]
    fn test_take_and_repost() {
        let mut pool = RequestPool::new(64, 4);
        pool.post(1).unwrap();

        let mut buf = pool.take().unwrap();
        assert!(buf.capacity() >= 64);
        buf.fill(b"rpc header");
        assert_eq!(buf.as_slice(), b"rpc header");
        assert_eq!(pool.get_stats().active_count, 1);

        pool.repost(buf);
        let stats = pool.get_stats();
        assert_eq!(stats.posted, 1);
        assert_eq!(stats.active_count, 0);

        let reused = pool.take().unwrap();
        assert!(reused.is_empty(), "reposted buffer should be cleared");
    }

    #[test]
    fn test_grows_when_exhausted() {
        let mut pool = RequestPool::new(32, 3);
        pool.post(1).unwrap();
        let _a = pool.take().unwrap();
        let _b = pool.take().unwrap();

        let stats = pool.get_stats();
        assert_eq!(stats.growths, 1);
        assert_eq!(stats.total_allocations, 4);
        assert_eq!(stats.posted, 2);
        assert_eq!(stats.active_count, 2);
    }

    #[test]
    fn test_growth_disabled() {
        let mut pool = RequestPool::new(32, 0);
        pool.post(2).unwrap();
        assert!(pool.take().is_some());
        assert!(pool.take().is_some());
        assert!(pool.take().is_none());

        let stats = pool.get_stats();
        assert_eq!(stats.growths, 0);
        assert_eq!(stats.total_allocations, 2);
    }

    #[test]
    fn test_huge_buffer_fails_cleanly() {
        let mut pool = RequestPool::new(usize::MAX, 0);
        assert!(matches!(pool.post(1), Err(NaError::NoMemory(_))));
        assert_eq!(pool.get_stats().posted, 0);
    }
}
