use super::error::PoolError;

/// A buffer handed out by the [`BufferPool`].
///
/// `Pool` handles refer to a preallocated slot and are only valid until the next
/// [`BufferPool::reset_cycle`]. `Heap` handles own their memory; release them with
/// [`BufferPool::release`] (or simply drop them) once the record has been sent.
#[derive(Debug, PartialEq, Eq)]
pub enum BufferHandle {
    Pool { slot: usize, cycle: u64 },
    Heap(Vec<u32>),
}

impl BufferHandle {
    pub fn is_heap(&self) -> bool {
        matches!(self, Self::Heap(_))
    }
}

/// Fixed set of preallocated word buffers, checked out once per event and returned
/// wholesale at the start of every processing cycle.
#[derive(Debug)]
pub struct BufferPool {
    slots: Vec<Box<[u32]>>,
    slot_words: usize,
    num_used: usize,
    cycle: u64,
}

impl BufferPool {
    /// Allocate `num_buffers` zeroed buffers of `slot_words` words each
    pub fn new(num_buffers: usize, slot_words: usize) -> Self {
        let slots = (0..num_buffers)
            .map(|_| vec![0u32; slot_words].into_boxed_slice())
            .collect();
        Self {
            slots,
            slot_words,
            num_used: 0,
            cycle: 0,
        }
    }

    /// Hand out the next unused slot of this cycle
    pub fn checkout(&mut self) -> Result<BufferHandle, PoolError> {
        if self.num_used >= self.slots.len() {
            return Err(PoolError::Exhausted {
                capacity: self.slots.len(),
            });
        }
        let slot = self.num_used;
        self.num_used += 1;
        Ok(BufferHandle::Pool {
            slot,
            cycle: self.cycle,
        })
    }

    /// Get a buffer able to hold `n_words`.
    ///
    /// Records larger than a slot get their own heap allocation; everything else
    /// comes from the pool.
    pub fn acquire_sized(&mut self, n_words: usize) -> Result<BufferHandle, PoolError> {
        if n_words > self.slot_words {
            spdlog::debug!(
                "Record of {} words exceeds pool slot size {}; allocating on the heap",
                n_words,
                self.slot_words
            );
            Ok(BufferHandle::Heap(vec![0u32; n_words]))
        } else {
            self.checkout()
        }
    }

    /// Return every pool slot. Must be called once per processing iteration.
    pub fn reset_cycle(&mut self) {
        self.num_used = 0;
        self.cycle += 1;
    }

    /// Give back every slot handed out after the pool had `num_used` in use. For a receive
    /// that failed before its record was complete; earlier handles of the cycle stay valid.
    pub fn unwind_to(&mut self, num_used: usize) {
        self.num_used = self.num_used.min(num_used);
    }

    /// Explicitly release a handle. Heap memory is freed; pool slots come back on the next reset.
    pub fn release(&mut self, handle: BufferHandle) {
        drop(handle);
    }

    pub fn buffer<'a>(&'a self, handle: &'a BufferHandle) -> Result<&'a [u32], PoolError> {
        match handle {
            BufferHandle::Pool { slot, cycle } => {
                self.check_cycle(*cycle)?;
                Ok(&self.slots[*slot][..])
            }
            BufferHandle::Heap(buf) => Ok(buf.as_slice()),
        }
    }

    pub fn buffer_mut<'a>(
        &'a mut self,
        handle: &'a mut BufferHandle,
    ) -> Result<&'a mut [u32], PoolError> {
        match handle {
            BufferHandle::Pool { slot, cycle } => {
                self.check_cycle(*cycle)?;
                Ok(&mut self.slots[*slot][..])
            }
            BufferHandle::Heap(buf) => Ok(buf.as_mut_slice()),
        }
    }

    fn check_cycle(&self, cycle: u64) -> Result<(), PoolError> {
        if cycle != self.cycle {
            Err(PoolError::StaleHandle {
                handle: cycle,
                current: self.cycle,
            })
        } else {
            Ok(())
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn slot_words(&self) -> usize {
        self.slot_words
    }

    pub fn num_used(&self) -> usize {
        self.num_used
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exhaustion_and_reset() {
        let mut pool = BufferPool::new(3, 16);
        for _ in 0..3 {
            assert!(pool.checkout().is_ok());
        }
        assert_eq!(pool.checkout(), Err(PoolError::Exhausted { capacity: 3 }));

        pool.reset_cycle();
        for _ in 0..3 {
            assert!(pool.checkout().is_ok());
        }
        assert_eq!(pool.num_used(), 3);
    }

    #[test]
    fn test_acquire_sized() {
        let mut pool = BufferPool::new(1, 16);
        let big = pool.acquire_sized(17).unwrap();
        assert!(big.is_heap());
        assert_eq!(pool.buffer(&big).unwrap().len(), 17);
        assert_eq!(pool.num_used(), 0);

        let small = pool.acquire_sized(16).unwrap();
        assert!(!small.is_heap());
        assert_eq!(pool.buffer(&small).unwrap().len(), 16);
        pool.release(big);
        assert!(pool.acquire_sized(4).is_err());
    }

    #[test]
    fn test_unwind_keeps_earlier_handles() {
        let mut pool = BufferPool::new(2, 8);
        let mut kept = pool.checkout().unwrap();
        pool.buffer_mut(&mut kept).unwrap()[0] = 7;

        let mark = pool.num_used();
        let _failed = pool.checkout().unwrap();
        pool.unwind_to(mark);
        assert_eq!(pool.num_used(), 1);

        let mut again = pool.checkout().unwrap();
        pool.buffer_mut(&mut again).unwrap()[0] = 9;
        assert_eq!(pool.buffer(&kept).unwrap()[0], 7);
        assert!(pool.checkout().is_err());
    }

    #[test]
    fn test_stale_handle() {
        let mut pool = BufferPool::new(2, 8);
        let mut handle = pool.checkout().unwrap();
        pool.buffer_mut(&mut handle).unwrap()[0] = 42;
        assert_eq!(pool.buffer(&handle).unwrap()[0], 42);
        pool.reset_cycle();
        assert_eq!(
            pool.buffer(&handle),
            Err(PoolError::StaleHandle {
                handle: 0,
                current: 1
            })
        );
    }
}
