//! Frame buffer pool.
//!
//! Frames are read into and built out of pooled buffers so that a busy
//! connection does not allocate per frame. Buffers return to the pool when
//! dropped, which is also what makes release-exactly-once hold: the send loop
//! (or whoever drops the frame last) releases it, and nothing else can.
//!
//! The protected variant scribbles every released buffer so that code keeping
//! a copy of released frame contents reads garbage instead of stale data.

use object_pool::Pool;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, OnceLock};

use crate::MAX_FRAME_SIZE;

/// Default number of buffers kept in the pool.
const DEFAULT_POOL_CAPACITY: usize = 128;

/// Byte written over released buffers in protected pools.
pub const SCRIBBLE_BYTE: u8 = 0xDE;

/// A thread-safe pool of frame-sized buffers.
#[derive(Clone)]
pub struct FramePool {
    pool: Arc<Pool<Vec<u8>>>,
    protect: bool,
}

impl FramePool {
    /// Create a pool with the default capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_POOL_CAPACITY)
    }

    /// Create a pool keeping up to `capacity` buffers.
    pub fn with_capacity(capacity: usize) -> Self {
        let pool = Pool::new(capacity, || Vec::with_capacity(MAX_FRAME_SIZE));
        Self {
            pool: Arc::new(pool),
            protect: false,
        }
    }

    /// Create a pool that scribbles `SCRIBBLE_BYTE` over released buffers.
    ///
    /// Intended for tests that need to catch use-after-release of frame data.
    pub fn protected() -> Self {
        let mut pool = Self::new();
        pool.protect = true;
        pool
    }

    /// The process-wide default pool.
    pub fn global() -> &'static FramePool {
        static GLOBAL: OnceLock<FramePool> = OnceLock::new();
        GLOBAL.get_or_init(FramePool::new)
    }

    /// Get an empty buffer from the pool.
    pub fn get(&self) -> PooledBuf {
        let mut reusable = self.pool.pull_owned(|| Vec::with_capacity(MAX_FRAME_SIZE));
        // Buffers come back in whatever state they were dropped.
        reusable.clear();
        PooledBuf {
            inner: Some(reusable),
            protect: self.protect,
        }
    }

    /// Copy `data` into a fresh pooled buffer.
    pub fn buf_from_slice(&self, data: &[u8]) -> PooledBuf {
        let mut buf = self.get();
        buf.extend_from_slice(data);
        buf
    }

    /// Drop every buffer currently held by the pool. Test hook.
    pub fn drain(&self) {
        while let Some(reusable) = self.pool.try_pull() {
            let (_pool, _buf) = reusable.detach();
        }
    }
}

impl Default for FramePool {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for FramePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FramePool")
            .field("protect", &self.protect)
            .finish_non_exhaustive()
    }
}

/// A pooled buffer that returns to its pool on drop.
pub struct PooledBuf {
    inner: Option<object_pool::ReusableOwned<Vec<u8>>>,
    protect: bool,
}

impl PooledBuf {
    fn vec(&self) -> &Vec<u8> {
        self.inner.as_ref().expect("buffer present until drop")
    }

    fn vec_mut(&mut self) -> &mut Vec<u8> {
        self.inner.as_mut().expect("buffer present until drop")
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        if self.protect {
            if let Some(buf) = self.inner.as_mut() {
                for byte in buf.iter_mut() {
                    *byte = SCRIBBLE_BYTE;
                }
            }
        }
        // The inner Reusable returns itself to the pool when it drops.
    }
}

impl Deref for PooledBuf {
    type Target = Vec<u8>;

    fn deref(&self) -> &Self::Target {
        self.vec()
    }
}

impl DerefMut for PooledBuf {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.vec_mut()
    }
}

impl AsRef<[u8]> for PooledBuf {
    fn as_ref(&self) -> &[u8] {
        self.vec().as_slice()
    }
}

impl std::fmt::Debug for PooledBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledBuf")
            .field("len", &self.vec().len())
            .field("protect", &self.protect)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_returns_empty_buffer() {
        let pool = FramePool::new();
        let mut buf = pool.get();
        assert_eq!(buf.len(), 0);
        buf.extend_from_slice(b"hello");
        assert_eq!(&buf[..], b"hello");
    }

    #[test]
    fn reuse_clears_previous_contents() {
        let pool = FramePool::with_capacity(4);
        {
            let mut buf = pool.get();
            buf.extend_from_slice(b"first use");
        }
        let buf = pool.get();
        assert_eq!(buf.len(), 0);
    }

    #[test]
    fn protected_pool_scribbles_on_release() {
        let pool = FramePool::protected();
        {
            let mut buf = pool.get();
            buf.extend_from_slice(b"live data");
        }
        // The same buffer comes back; its discarded region must be scribbled.
        let mut buf = pool.get();
        let spare = buf.vec_mut().spare_capacity_mut();
        assert!(spare.len() >= 9);
        for slot in spare.iter().take(9) {
            // Safe to read: the previous use initialized these bytes.
            let value = unsafe { slot.assume_init() };
            assert_eq!(value, SCRIBBLE_BYTE);
        }
    }

    #[test]
    fn drain_empties_the_pool() {
        let pool = FramePool::with_capacity(2);
        drop(pool.get());
        drop(pool.get());
        pool.drain();
        // Still usable after a drain; buffers are created on demand.
        let buf = pool.get();
        assert_eq!(buf.len(), 0);
    }
}
