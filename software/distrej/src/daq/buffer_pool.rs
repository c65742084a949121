//! Recycled sample blocks passed between a task handle and its driver thread.

use std::sync::Arc;

use crossbeam::channel::{Receiver, Sender, bounded};

/// One block of channel-grouped samples
pub(crate) type Block = Vec<f64>;

/// Bounded free-list of sample blocks.
///
/// Blocks are taken on one thread and returned on another, so steady-state
/// operation does not allocate once the pool has warmed up.
pub(crate) struct BlockPool {
    inner: Arc<BlockPoolInner>,
}

struct BlockPoolInner {
    tx: Sender<Block>,
    rx: Receiver<Block>,
}

impl BlockPool {
    /// Create a pool prefilled with `capacity` zeroed blocks of length `len`.
    pub(crate) fn with_blocks(capacity: usize, len: usize) -> Self {
        let (tx, rx) = bounded(capacity);
        for _ in 0..capacity {
            let _ = tx.try_send(vec![0.0; len]);
        }
        Self {
            inner: Arc::new(BlockPoolInner { tx, rx }),
        }
    }

    /// Take a block holding a copy of `data`, allocating if the pool is empty.
    pub(crate) fn take_copy(&self, data: &[f64]) -> Block {
        match self.inner.rx.try_recv() {
            Ok(mut block) => {
                block.clear();
                block.extend_from_slice(data);
                block
            }
            Err(_) => data.to_vec(),
        }
    }

    /// Take a zeroed block of length `len`, allocating if the pool is empty.
    pub(crate) fn take_zeroed(&self, len: usize) -> Block {
        match self.inner.rx.try_recv() {
            Ok(mut block) => {
                block.clear();
                block.resize(len, 0.0);
                block
            }
            Err(_) => vec![0.0; len],
        }
    }

    /// Return a block. Dropped if the pool is already full.
    pub(crate) fn put(&self, block: Block) {
        let _ = self.inner.tx.try_send(block);
    }

    #[cfg(test)]
    fn available(&self) -> usize {
        self.inner.rx.len()
    }
}

impl std::fmt::Debug for BlockPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockPool")
            .field("available", &self.inner.rx.len())
            .finish()
    }
}

impl Clone for BlockPool {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blocks_are_recycled() {
        let pool = BlockPool::with_blocks(2, 4);
        assert_eq!(pool.available(), 2);

        let a = pool.take_copy(&[1.0, 2.0, 3.0]);
        assert_eq!(a, vec![1.0, 2.0, 3.0]);
        assert_eq!(pool.available(), 1);

        let other = pool.clone();
        other.put(a);
        assert_eq!(pool.available(), 2);

        let z = pool.take_zeroed(5);
        assert_eq!(z, vec![0.0; 5]);
    }

    #[test]
    fn test_empty_pool_allocates_and_full_pool_drops() {
        let pool = BlockPool::with_blocks(1, 2);
        let a = pool.take_zeroed(2);
        let b = pool.take_copy(&[4.0]);
        assert_eq!(b, vec![4.0]);
        assert_eq!(pool.available(), 0);

        pool.put(a);
        pool.put(b);
        assert_eq!(pool.available(), 1);
    }
}
