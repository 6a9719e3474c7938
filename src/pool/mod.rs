// Fixed-capacity object pool.
//
// Objects live in a vector that only ever grows, up to `capacity`, so the
// index inside a handle stays valid for the pool's lifetime. Free slots sit
// on a LIFO stack: the most recently released object is handed out first,
// which keeps warm connections in use. Released objects are not reset;
// their state carries over to the next holder.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::error::PgPollError;

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

/// Proof of holding one pooled object.
///
/// Not `Clone`: a handle is held by at most one caller, and giving it back
/// through [`ObjectPool::release`] consumes it.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct PoolHandle {
    pool_id: u64,
    index: usize,
}

impl PoolHandle {
    /// Slot index inside the owning pool.
    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }
}

/// Occupancy snapshot of an [`ObjectPool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub capacity: usize,
    pub allocated: usize,
    pub idle: usize,
    pub in_use: usize,
}

/// Bounded arena with a free list of indices.
pub struct ObjectPool<T> {
    id: u64,
    capacity: usize,
    storage: Vec<T>,
    free_list: Vec<usize>,
}

impl<T> std::fmt::Debug for ObjectPool<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectPool")
            .field("id", &self.id)
            .field("capacity", &self.capacity)
            .field("allocated", &self.storage.len())
            .field("free_list", &self.free_list)
            .finish_non_exhaustive()
    }
}

impl<T> ObjectPool<T> {
    /// An empty pool that will hold at most `capacity` objects.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            capacity,
            storage: Vec::with_capacity(capacity),
            free_list: Vec::with_capacity(capacity),
        }
    }

    /// Hand out a free object, creating one with `make` if the pool has not
    /// reached capacity yet. `None` means every object is in use.
    pub fn acquire_with(&mut self, make: impl FnOnce() -> T) -> Option<PoolHandle> {
        let index = match self.free_list.pop() {
            Some(index) => index,
            None if self.storage.len() < self.capacity => {
                self.storage.push(make());
                self.storage.len() - 1
            }
            None => return None,
        };
        Some(PoolHandle {
            pool_id: self.id,
            index,
        })
    }

    /// Give an object back. It is not reset.
    ///
    /// # Errors
    /// Returns `PgPollError::UnreleasedHandle` carrying `handle` if it came
    /// from another pool.
    pub fn release(&mut self, handle: PoolHandle) -> Result<(), PgPollError> {
        if self.check(&handle).is_err() {
            return Err(PgPollError::UnreleasedHandle(handle));
        }
        self.free_list.push(handle.index);
        Ok(())
    }

    /// # Errors
    /// Returns `PgPollError::ForeignHandle` if `handle` came from another pool.
    pub fn get(&self, handle: &PoolHandle) -> Result<&T, PgPollError> {
        self.check(handle)?;
        self.storage.get(handle.index).ok_or(PgPollError::ForeignHandle)
    }

    /// # Errors
    /// Returns `PgPollError::ForeignHandle` if `handle` came from another pool.
    pub fn get_mut(&mut self, handle: &PoolHandle) -> Result<&mut T, PgPollError> {
        self.check(handle)?;
        self.storage
            .get_mut(handle.index)
            .ok_or(PgPollError::ForeignHandle)
    }

    /// Every object created so far, in use or not.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut T> {
        self.storage.iter_mut()
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[must_use]
    pub fn allocated(&self) -> usize {
        self.storage.len()
    }

    #[must_use]
    pub fn idle(&self) -> usize {
        self.free_list.len()
    }

    #[must_use]
    pub fn in_use(&self) -> usize {
        self.storage.len() - self.free_list.len()
    }

    #[must_use]
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            capacity: self.capacity,
            allocated: self.allocated(),
            idle: self.idle(),
            in_use: self.in_use(),
        }
    }

    fn check(&self, handle: &PoolHandle) -> Result<(), PgPollError> {
        if handle.pool_id == self.id {
            Ok(())
        } else {
            Err(PgPollError::ForeignHandle)
        }
    }
}

impl<T: Default> ObjectPool<T> {
    /// [`ObjectPool::acquire_with`] using `T::default()`.
    pub fn acquire(&mut self) -> Option<PoolHandle> {
        self.acquire_with(T::default)
    }
}
