//! Fixed-capacity byte arena between the producer stages and the upload
//! driver.
//!
//! Producer output (raw file blocks, or archive bytes when encrypting)
//! accumulates until the next write would cross the chunk boundary; the
//! filled prefix is then handed to the driver as one chunk and the arena is
//! reclaimed. The arena carries headroom above the chunk size so the archive
//! framing around a full read block never forces a flush mid-write.

/// Default chunk boundary, matching the read-buffer size
pub const DEFAULT_CHUNK_SIZE: usize = 90 * 1024 * 1024;
/// Default arena capacity: chunk size plus framing headroom
pub const DEFAULT_CAPACITY: usize = 99 * 1024 * 1024;

pub struct ChunkAccumulator {
    arena: Vec<u8>,
    chunk_size: usize,
    capacity: usize,
}

impl ChunkAccumulator {
    pub fn new(chunk_size: usize, capacity: usize) -> Self {
        assert!(capacity >= chunk_size);
        Self {
            arena: Vec::with_capacity(capacity),
            chunk_size,
            capacity,
        }
    }

    /// Whether appending `len` more bytes would cross the chunk boundary,
    /// i.e. the current fill must be emitted first
    pub fn should_emit_before(&self, len: usize) -> bool {
        !self.arena.is_empty() && self.arena.len() + len > self.chunk_size
    }

    /// Append bytes and return a mutable view of the appended region so the
    /// encrypt stage can apply its keystream in place.
    ///
    /// The caller must have drained the arena via [`should_emit_before`]
    /// first; a write can only overrun the hard capacity if that protocol was
    /// skipped.
    pub fn append(&mut self, data: &[u8]) -> &mut [u8] {
        assert!(
            self.arena.len() + data.len() <= self.capacity,
            "accumulator overrun: {} + {} exceeds capacity {}",
            self.arena.len(),
            data.len(),
            self.capacity
        );
        let start = self.arena.len();
        self.arena.extend_from_slice(data);
        &mut self.arena[start..]
    }

    /// View of the filled prefix (one chunk's worth at emission time)
    pub fn filled(&self) -> &[u8] {
        &self.arena
    }

    pub fn len(&self) -> usize {
        self.arena.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arena.is_empty()
    }

    /// Reclaim the arena after the driver is done with the emitted chunk
    pub fn clear(&mut self) {
        self.arena.clear();
    }

    /// Take the remaining fill for the final flush at end-of-file
    pub fn take_remaining(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.arena)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emits_at_chunk_boundary_not_before() {
        let mut acc = ChunkAccumulator::new(100, 120);

        // 100-byte writes against a 100-byte chunk: each write forces the
        // previous fill out first, mirroring the three-chunk upload flow
        assert!(!acc.should_emit_before(100));
        acc.append(&[1u8; 100]);

        assert!(acc.should_emit_before(100));
        assert_eq!(acc.filled().len(), 100);
        acc.clear();

        acc.append(&[2u8; 100]);
        assert!(acc.should_emit_before(100));
    }

    #[test]
    fn small_writes_pack_until_boundary() {
        let mut acc = ChunkAccumulator::new(100, 120);
        acc.append(&[0u8; 40]);
        assert!(!acc.should_emit_before(40));
        acc.append(&[0u8; 40]);
        // 80 + 40 would cross 100
        assert!(acc.should_emit_before(40));
        assert_eq!(acc.len(), 80);
    }

    #[test]
    fn headroom_accepts_oversized_single_write() {
        let mut acc = ChunkAccumulator::new(100, 120);
        // an empty arena takes a write larger than the chunk size, up to the
        // hard capacity; the next write flushes it as one oversized chunk
        assert!(!acc.should_emit_before(110));
        acc.append(&[0u8; 110]);
        assert!(acc.should_emit_before(1));
        assert_eq!(acc.filled().len(), 110);
    }

    #[test]
    fn append_returns_writable_region() {
        let mut acc = ChunkAccumulator::new(100, 120);
        acc.append(&[0xAA; 4]);
        let region = acc.append(&[0u8; 4]);
        region.copy_from_slice(&[0xBB; 4]);
        assert_eq!(acc.filled(), &[0xAA, 0xAA, 0xAA, 0xAA, 0xBB, 0xBB, 0xBB, 0xBB]);
    }

    #[test]
    fn take_remaining_resets_the_arena() {
        let mut acc = ChunkAccumulator::new(100, 120);
        acc.append(&[5u8; 30]);
        let rest = acc.take_remaining();
        assert_eq!(rest, vec![5u8; 30]);
        assert!(acc.is_empty());
    }
}
