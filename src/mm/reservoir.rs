//! Per-tier reservoirs: the backing store piles refill from.
//!
//! Each reservoir holds free chunks of exactly one tier. When a reservoir
//! runs dry it borrows a single chunk from the reservoir one tier up and
//! splits it into sixteen chunks of its own tier, keeping fifteen and
//! returning one to the caller. The growable free list is backed by the
//! kernel heap rather than by chunks of its own tier, which is what lets a
//! reservoir refill itself without risking a self-referential allocation.

use super::chunk::{tier_size, Chunk, NUM_TIERS};
use alloc::vec::Vec;
use spin::Mutex;

pub struct Reservoir {
    tier: usize,
    free: Mutex<Vec<Chunk>>,
}

impl Reservoir {
    const fn new(tier: usize) -> Self {
        Self { tier, free: Mutex::new(Vec::new()) }
    }

    pub fn tier(&self) -> usize {
        self.tier
    }

    pub fn add_chunk(&self, chunk: Chunk) {
        debug_assert_eq!(chunk.size, tier_size(self.tier));
        self.free.lock().push(chunk);
    }

    pub fn add_chunks(&self, chunks: &[Chunk]) {
        let mut free = self.free.lock();
        free.extend_from_slice(chunks);
    }

    pub fn len(&self) -> usize {
        self.free.lock().len()
    }

    /// Returns one chunk of this reservoir's tier, splitting a chunk from
    /// the tier above when empty. Returns `Chunk::NONE` once the top tier
    /// is also exhausted.
    pub fn get_chunk(&self) -> Chunk {
        if let Some(chunk) = self.free.lock().pop() {
            return chunk;
        }
        if self.tier + 1 >= NUM_TIERS {
            return Chunk::NONE;
        }
        let parent = RESERVOIRS[self.tier + 1].get_chunk();
        if parent.is_none() {
            return Chunk::NONE;
        }
        let children = parent.split_down(self.tier + 1);
        let mut free = self.free.lock();
        free.extend_from_slice(&children[1..]);
        children[0]
    }

    pub fn get_chunks(&self, count: usize, out: &mut Vec<Chunk>) {
        for _ in 0..count {
            let c = self.get_chunk();
            if c.is_none() {
                break;
            }
            out.push(c);
        }
    }
}

pub static RESERVOIRS: [Reservoir; NUM_TIERS] = [
    Reservoir::new(0),
    Reservoir::new(1),
    Reservoir::new(2),
    Reservoir::new(3),
    Reservoir::new(4),
    Reservoir::new(5),
];

pub fn reservoir(tier: usize) -> &'static Reservoir {
    &RESERVOIRS[tier]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seeded_reservoir_returns_chunk() {
        RESERVOIRS[0].add_chunk(Chunk { size: tier_size(0), phys_start: 0x1000 });
        let c = RESERVOIRS[0].get_chunk();
        assert_eq!(c.phys_start, 0x1000);
    }

    #[test]
    fn empty_top_tier_returns_none_sentinel() {
        let top = NUM_TIERS - 1;
        assert!(RESERVOIRS[top].get_chunk().is_none() || RESERVOIRS[top].len() == 0);
    }

    #[test]
    fn split_cascade_refills_lower_tier() {
        RESERVOIRS[1].add_chunk(Chunk { size: tier_size(1), phys_start: 0x20_0000 });
        let c = RESERVOIRS[0].get_chunk();
        assert_eq!(c.size, tier_size(0));
        assert_eq!(c.phys_start, 0x20_0000);
        // Fifteen siblings were kept in reservoir 0.
        assert_eq!(RESERVOIRS[0].len(), 15);
    }

    #[test]
    fn multi_level_cascade_splits_one_chunk_per_intervening_tier() {
        // Only one tier-4 chunk exists; a tier-2 request has to cascade
        // through tier 3 first, splitting once at each level on the way
        // down and leaving fifteen siblings behind at every tier it passed
        // through short of the one it satisfies the request from.
        RESERVOIRS[4].add_chunk(Chunk { size: tier_size(4), phys_start: 0x1_0000_0000 });
        let c = RESERVOIRS[2].get_chunk();
        assert_eq!(c.size, tier_size(2));
        assert_eq!(RESERVOIRS[3].len(), 15);
        assert_eq!(RESERVOIRS[2].len(), 15);
        assert_eq!(RESERVOIRS[4].len(), 0);
    }
}
