/// Received-chunk tracking for one session using a compact bitfield.
///
/// One bit per chunk index in `[0, total_chunks)`. A 1 GB file at 1 KB chunks
/// needs 128 KB of bits.

/// Bitfield of chunk indices received so far.
#[derive(Debug, Clone)]
pub struct ChunkBitfield {
    bits: Vec<u64>,
    total: u64,
    received: u64,
}

impl ChunkBitfield {
    /// Create an empty bitfield for `total` chunks.
    pub fn new(total: u64) -> Self {
        Self {
            bits: vec![0u64; total.div_ceil(64) as usize],
            total,
            received: 0,
        }
    }

    /// Mark a chunk as received. Returns true if it was newly received (not
    /// a duplicate and within range).
    #[inline]
    pub fn set(&mut self, index: u64) -> bool {
        if index >= self.total {
            return false;
        }
        let (word, mask) = Self::locate(index);
        if self.bits[word] & mask != 0 {
            return false;
        }
        self.bits[word] |= mask;
        self.received += 1;
        true
    }

    /// Check if a chunk has been received.
    #[inline]
    pub fn get(&self, index: u64) -> bool {
        if index >= self.total {
            return false;
        }
        let (word, mask) = Self::locate(index);
        self.bits[word] & mask != 0
    }

    #[inline]
    pub fn is_complete(&self) -> bool {
        self.received == self.total
    }

    #[inline]
    pub fn received(&self) -> u64 {
        self.received
    }

    #[inline]
    pub fn total(&self) -> u64 {
        self.total
    }

    /// All indices not yet received, ascending.
    pub fn missing(&self) -> Vec<u64> {
        let mut missing = Vec::new();
        for (w, &word) in self.bits.iter().enumerate() {
            if word == u64::MAX {
                continue;
            }
            for bit in 0..64 {
                let index = w as u64 * 64 + bit;
                if index >= self.total {
                    break;
                }
                if word & (1u64 << bit) == 0 {
                    missing.push(index);
                }
            }
        }
        missing
    }

    #[inline]
    fn locate(index: u64) -> (usize, u64) {
        ((index / 64) as usize, 1u64 << (index % 64))
    }
}
