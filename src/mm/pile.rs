//! Piles: small fixed-capacity per-tier caches sitting in front of the
//! reservoirs so the common allocation path never has to touch the
//! reservoir's growable free list.
//!
//! A pile holds up to [`CHUNKS_PER_PILE`] chunks of one tier, handed out
//! LIFO. Once a pile drops below a quarter full it kicks off an
//! asynchronous refill back up to capacity rather than refilling inline on
//! the allocating thread. Piles are per-logical-CPU: each CPU keeps its own
//! row of [`NUM_TIERS`] piles, so the common path never contends with other
//! cores, and a CPU whose own pile and the shared reservoirs both run dry
//! falls back to scanning its siblings' piles before giving up.

use super::chunk::{tier_size, Chunk, CHUNKS_PER_PILE, NUM_TIERS};
use super::reservoir::reservoir;
use core::sync::atomic::{AtomicBool, Ordering};
use spin::Mutex;

/// Upper bound on logical CPUs, matching `percpu`'s BSP + `MAX_APS` budget.
pub const MAX_CPUS: usize = 16;

struct PileInner {
    chunks: [Chunk; CHUNKS_PER_PILE],
    next_free: usize,
}

pub struct Pile {
    tier: usize,
    inner: Mutex<PileInner>,
    refilling: AtomicBool,
}

impl Pile {
    const fn new(tier: usize) -> Self {
        Self {
            tier,
            inner: Mutex::new(PileInner { chunks: [Chunk::NONE; CHUNKS_PER_PILE], next_free: 0 }),
            refilling: AtomicBool::new(false),
        }
    }

    pub fn tier(&self) -> usize {
        self.tier
    }

    /// Draws chunks from the reservoir in one batch until the pile is full.
    /// Called at boot to prime piles and re-entered asynchronously once a
    /// pile runs low.
    pub fn refill(&self) {
        let res = reservoir(self.tier);
        let mut inner = self.inner.lock();
        let want = CHUNKS_PER_PILE - inner.next_free;
        let mut drawn = alloc::vec::Vec::with_capacity(want);
        res.get_chunks(want, &mut drawn);
        for c in drawn {
            let idx = inner.next_free;
            inner.chunks[idx] = c;
            inner.next_free += 1;
        }
        self.refilling.store(false, Ordering::Release);
    }

    fn maybe_trigger_refill(&self, next_free: usize, cpu: usize) {
        if next_free < CHUNKS_PER_PILE / 4
            && self.refilling.compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed).is_ok()
        {
            crate::sched::system::request_pile_refill(cpu, self.tier);
        }
    }

    /// Pops one chunk from this pile, falling through to the reservoir and
    /// then to sibling CPUs' piles of the same tier on total local exhaustion.
    fn get_chunk_on(&self, cpu: usize) -> Chunk {
        {
            let mut inner = self.inner.lock();
            if inner.next_free > 0 {
                inner.next_free -= 1;
                let c = inner.chunks[inner.next_free];
                let remaining = inner.next_free;
                drop(inner);
                self.maybe_trigger_refill(remaining, cpu);
                return c;
            }
        }
        let c = reservoir(self.tier).get_chunk();
        if !c.is_none() {
            return c;
        }
        for set in PILE_SETS.iter() {
            let sibling = &set[self.tier];
            if !core::ptr::eq(sibling, self) {
                let c = sibling.steal_one();
                if !c.is_none() {
                    return c;
                }
            }
        }
        Chunk::NONE
    }

    /// Pops one chunk from the current CPU's pile of this tier.
    pub fn get_chunk(&self) -> Chunk {
        self.get_chunk_on(current_cpu_index())
    }

    fn steal_one(&self) -> Chunk {
        let mut inner = self.inner.lock();
        if inner.next_free == 0 {
            return Chunk::NONE;
        }
        inner.next_free -= 1;
        inner.chunks[inner.next_free]
    }

    pub fn get_chunks(&self, count: usize, out: &mut alloc::vec::Vec<Chunk>) {
        for _ in 0..count {
            let c = self.get_chunk();
            if c.is_none() {
                break;
            }
            out.push(c);
        }
    }
}

const fn piles_row() -> [Pile; NUM_TIERS] {
    [Pile::new(0), Pile::new(1), Pile::new(2), Pile::new(3), Pile::new(4), Pile::new(5)]
}

pub static PILE_SETS: [[Pile; NUM_TIERS]; MAX_CPUS] = [
    piles_row(),
    piles_row(),
    piles_row(),
    piles_row(),
    piles_row(),
    piles_row(),
    piles_row(),
    piles_row(),
    piles_row(),
    piles_row(),
    piles_row(),
    piles_row(),
    piles_row(),
    piles_row(),
    piles_row(),
    piles_row(),
];

/// The running CPU's logical index, clamped into the static pile table.
/// Tests run on the host with no GS base installed, so they pin to CPU 0
/// rather than reading `gs:[0]` (mirrors the hardware-avoidance already used
/// by the `paging`/`address_space` tests).
#[cfg(not(test))]
fn current_cpu_index() -> usize {
    let id = crate::arch::x86_64::percpu::CpuLocal::current().cpu_id as usize;
    if id < MAX_CPUS { id } else { 0 }
}

#[cfg(test)]
fn current_cpu_index() -> usize {
    0
}

/// Returns the current CPU's pile for `tier`.
pub fn pile(tier: usize) -> &'static Pile {
    &PILE_SETS[current_cpu_index()][tier]
}

/// Returns CPU `cpu`'s pile for `tier`, for the deferred-refill queue which
/// already knows which CPU's pile ran low.
pub fn pile_on(cpu: usize, tier: usize) -> &'static Pile {
    &PILE_SETS[if cpu < MAX_CPUS { cpu } else { 0 }][tier]
}

/// Seeds the tier-0 reservoir from a usable physical memory region, then
/// primes every tier of the current CPU's pile row. `region` must already
/// exclude the kernel image, boot structures, and anything the caller has
/// reserved. Application processors prime their own rows the first time one
/// of their piles runs dry and falls through to the (already seeded)
/// reservoirs.
pub fn init_from_region(base: u64, len: u64) {
    let mut addr = base;
    let end = base + len;
    // Greedily carve the region into the largest aligned tier that fits,
    // seeding reservoirs top-down so piles can borrow from them immediately.
    let mut tier = NUM_TIERS - 1;
    loop {
        let size = tier_size(tier) as u64;
        while addr + size <= end && addr % size == 0 {
            reservoir(tier).add_chunk(Chunk { size: size as usize, phys_start: addr });
            addr += size;
        }
        if tier == 0 {
            break;
        }
        tier -= 1;
    }
    for p in PILE_SETS[current_cpu_index()].iter() {
        p.refill();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refill_tops_up_to_capacity() {
        reservoir(0).add_chunks(&alloc::vec![Chunk { size: tier_size(0), phys_start: 0x4000 }; CHUNKS_PER_PILE]);
        PILE_SETS[0][0].refill();
        assert_eq!(PILE_SETS[0][0].inner.lock().next_free, CHUNKS_PER_PILE);
    }

    #[test]
    fn exhausted_pile_and_reservoir_returns_none() {
        let top = NUM_TIERS - 1;
        while !PILE_SETS[0][top].get_chunk().is_none() {}
        assert!(PILE_SETS[0][top].get_chunk().is_none());
    }

    #[test]
    fn sibling_scan_finds_chunk_on_another_cpu() {
        let tier = 2;
        // Tier 2's pile and reservoir both start empty, so CPU 0's own
        // reservoir fallback can't quietly satisfy the draw.
        // Seed CPU 1's pile directly, bypassing the reservoir, then confirm
        // CPU 0 finds it via the sibling scan rather than returning NONE.
        {
            let mut inner = PILE_SETS[1][tier].inner.lock();
            inner.chunks[0] = Chunk { size: tier_size(tier), phys_start: 0x9000 };
            inner.next_free = 1;
        }
        let found = PILE_SETS[0][tier].get_chunk_on(0);
        assert_eq!(found.phys_start, 0x9000);
    }
}
