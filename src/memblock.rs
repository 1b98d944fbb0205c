//! Refcounted sample buffers and the per-context pool.
//!
//! The pool does not implement an actual shared-memory data path; it only
//! tracks whether its blocks *could* be shared with a local peer, which is
//! what the connection handshake negotiates on.

use bytes::Bytes;

/// Size of one pool slot. Blocks never exceed this.
pub const SLOT_SIZE: usize = 64 * 1024;

/// Default total pool size.
pub const DEFAULT_POOL_SIZE: usize = 64 * 1024 * 1024;

/// A refcounted run of sample bytes.
///
/// Cloning is cheap; the payload is shared.
#[derive(Debug, Clone, Default)]
pub struct Memblock {
    data: Bytes,
}

impl Memblock {
    pub fn from_bytes(data: Bytes) -> Self {
        Self { data }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_bytes(&self) -> &Bytes {
        &self.data
    }
}

/// The per-context block pool.
#[derive(Debug)]
pub struct Mempool {
    shared: bool,
    slot_count: usize,
}

impl Mempool {
    /// Create a pool. `shared` records whether blocks are eligible for
    /// zero-copy transfer to a same-uid local peer; `pool_size` bounds the
    /// total sample memory.
    pub fn new(shared: bool, pool_size: usize) -> Self {
        let slot_count = (pool_size / SLOT_SIZE).max(1);
        Self { shared, slot_count }
    }

    /// Whether blocks from this pool may be shared with a local peer.
    pub fn is_shared(&self) -> bool {
        self.shared
    }

    /// The largest single block this pool hands out.
    pub fn block_size_max(&self) -> usize {
        SLOT_SIZE
    }

    pub fn slot_count(&self) -> usize {
        self.slot_count
    }

    /// Wrap inbound payload bytes as a block, splitting is the caller's
    /// concern; payloads above the slot size are refused.
    pub fn import(&self, data: Bytes) -> Option<Memblock> {
        if data.len() > self.block_size_max() {
            return None;
        }
        Some(Memblock::from_bytes(data))
    }
}

impl Default for Mempool {
    fn default() -> Self {
        Self::new(false, DEFAULT_POOL_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_bounds_block_size() {
        let pool = Mempool::new(true, DEFAULT_POOL_SIZE);
        assert!(pool.is_shared());
        assert_eq!(pool.block_size_max(), SLOT_SIZE);
        assert!(pool.import(Bytes::from(vec![0u8; SLOT_SIZE])).is_some());
        assert!(pool.import(Bytes::from(vec![0u8; SLOT_SIZE + 1])).is_none());
    }

    #[test]
    fn tiny_pool_still_has_a_slot() {
        let pool = Mempool::new(false, 1);
        assert_eq!(pool.slot_count(), 1);
    }
}
