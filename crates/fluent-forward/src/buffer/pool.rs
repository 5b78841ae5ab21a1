// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Bounded pool of reusable memory regions.
//!
//! Region sizes follow the geometric series `initial_size * expand_ratio^k`, so only a handful
//! of size classes circulate and released regions are likely to be reused. The pool tracks
//! the bytes currently checked out and refuses any request that would push that total past
//! `max_size`. Idle regions kept for reuse are capped at `max_size` as well.

use bytes::BytesMut;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::trace;

/// Returned when a request cannot be granted without exceeding the pool's maximum size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("buffer pool is full: allocated={allocated}, requested={requested}, max={max}")]
pub struct PoolFull {
    pub allocated: usize,
    pub requested: usize,
    pub max: usize,
}

/// A fixed-size byte area checked out from a [`BufferPool`].
#[derive(Debug)]
pub struct Region {
    data: BytesMut,
    size: usize,
}

impl Region {
    /// Capacity of the region. Writes never exceed it.
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Bytes written so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[must_use]
    pub fn remaining(&self) -> usize {
        self.size - self.data.len()
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Appends `bytes`. Callers check [`Region::remaining`] first.
    pub(crate) fn put(&mut self, bytes: &[u8]) {
        debug_assert!(bytes.len() <= self.remaining());
        self.data.extend_from_slice(bytes);
    }
}

#[derive(Debug, Default)]
struct PoolState {
    /// Bytes currently checked out.
    allocated: usize,
    idle: HashMap<usize, Vec<BytesMut>>,
    idle_bytes: usize,
}

impl PoolState {
    fn take_idle(&mut self, size: usize) -> BytesMut {
        match self.idle.get_mut(&size).and_then(Vec::pop) {
            Some(data) => {
                self.idle_bytes -= size;
                data
            }
            None => BytesMut::with_capacity(size),
        }
    }

    fn put_idle(&mut self, mut region: Region, max_size: usize) {
        if self.idle_bytes + region.size > max_size {
            trace!("Dropping released region of {} bytes", region.size);
            return;
        }
        region.data.clear();
        self.idle_bytes += region.size;
        self.idle.entry(region.size).or_default().push(region.data);
    }
}

#[derive(Debug)]
pub struct BufferPool {
    initial_size: usize,
    expand_ratio: f64,
    max_size: usize,
    state: Mutex<PoolState>,
}

impl BufferPool {
    #[must_use]
    pub fn new(initial_size: usize, expand_ratio: f64, max_size: usize) -> Self {
        BufferPool {
            initial_size: initial_size.max(1),
            expand_ratio,
            max_size,
            state: Mutex::new(PoolState::default()),
        }
    }

    /// Smallest size in the geometric series that holds `min_size` bytes.
    #[must_use]
    pub fn size_class(&self, min_size: usize) -> usize {
        let mut size = self.initial_size;
        while size < min_size {
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            let next = (size as f64 * self.expand_ratio) as usize;
            // a ratio at or below 1.0 must still make progress
            size = next.max(size + 1);
        }
        size
    }

    /// Checks out a region of at least `min_size` bytes.
    pub fn acquire(&self, min_size: usize) -> Result<Region, PoolFull> {
        let size = self.size_class(min_size);
        let mut state = self.lock();
        if state.allocated + size > self.max_size {
            return Err(PoolFull {
                allocated: state.allocated,
                requested: size,
                max: self.max_size,
            });
        }
        state.allocated += size;
        let data = state.take_idle(size);
        Ok(Region { data, size })
    }

    /// Replaces `region` with a larger one holding at least `min_size` bytes, carrying the
    /// written bytes over. The swap is accounted as one step: only the size difference has
    /// to fit under the maximum. On failure `region` is left untouched.
    pub fn grow(&self, region: &mut Region, min_size: usize) -> Result<(), PoolFull> {
        let size = self.size_class(min_size.max(region.size + 1));
        let mut state = self.lock();
        let allocated = state.allocated - region.size + size;
        if allocated > self.max_size {
            return Err(PoolFull {
                allocated: state.allocated,
                requested: size - region.size,
                max: self.max_size,
            });
        }
        state.allocated = allocated;

        let mut data = state.take_idle(size);
        data.extend_from_slice(&region.data);
        let old = std::mem::replace(region, Region { data, size });
        state.put_idle(old, self.max_size);
        Ok(())
    }

    /// Returns a region to the pool.
    pub fn release(&self, region: Region) {
        let mut state = self.lock();
        state.allocated -= region.size;
        state.put_idle(region, self.max_size);
    }

    /// Bytes currently checked out.
    #[must_use]
    pub fn allocated_size(&self) -> usize {
        self.lock().allocated
    }

    #[must_use]
    pub fn max_size(&self) -> usize {
        self.max_size
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PoolState> {
        #[allow(clippy::expect_used)]
        self.state.lock().expect("lock poisoned")
    }
}
