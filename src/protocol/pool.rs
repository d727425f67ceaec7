//! Bounded id allocator with recycling.

use std::collections::HashSet;

use crate::error::{Gtp3Error, Result};

/// Monotonic id allocator that recycles released ids.
///
/// Ids start at 1 and grow up to `limit` inclusive. Released ids are reused
/// before the high-water mark advances, most recently freed first, so the id
/// space stays dense under churn. Used for channel ids on the connection and
/// request ids on each channel.
pub struct NumberPool {
    limit: u16,
    max: u16,
    allocated: HashSet<u16>,
    released: Vec<u16>,
}

impl NumberPool {
    /// Create a pool allocating ids in `1..=limit`.
    pub fn new(limit: u16) -> Self {
        Self {
            limit,
            max: 0,
            allocated: HashSet::new(),
            released: Vec::new(),
        }
    }

    /// True if a subsequent [`allocate`](Self::allocate) would succeed.
    pub fn can_allocate(&self) -> bool {
        !self.released.is_empty() || self.max < self.limit
    }

    /// Number of ids currently live.
    pub fn allocated(&self) -> usize {
        self.allocated.len()
    }

    /// Allocate the next id, reusing a released one when available.
    pub fn allocate(&mut self) -> Result<u16> {
        let n = if let Some(n) = self.released.pop() {
            n
        } else if self.max < self.limit {
            self.max += 1;
            self.max
        } else {
            return Err(Gtp3Error::PoolExhausted);
        };

        self.allocated.insert(n);
        Ok(n)
    }

    /// Return `n` to the pool. Releasing an id that is not currently
    /// allocated is a tolerated no-op.
    pub fn release(&mut self, n: u16) {
        if self.allocated.remove(&n) {
            self.released.push(n);
        }
    }

    /// Reset the pool to its initial state.
    pub fn clear(&mut self) {
        self.max = 0;
        self.allocated.clear();
        self.released.clear();
    }
}
