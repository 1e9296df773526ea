//! Memory collaborator for Aegis
//!
//! The kernel core does not manage physical or virtual memory itself. It asks
//! a [`MemoryManager`] for address spaces and page regions and hands them
//! back exactly once. [`BumpMemory`] is a simple bump-pointer implementation
//! for early boot and hosted runs.

use spin::Mutex;

use crate::error::{KernelError, KernelResult};
use crate::types::PAGE_SIZE;

/// Owned handle to an address space
///
/// Not `Clone`: the process holding it is the only owner and gives it back
/// through [`MemoryManager::destroy_address_space`].
#[derive(Debug, PartialEq, Eq)]
pub struct AddressSpace {
    /// Address space identifier
    pub asid: u64,
    /// Physical address of the top-level page table
    pub root: usize,
}

/// Owned run of contiguous pages
#[derive(Debug, PartialEq, Eq)]
pub struct PageRegion {
    /// Lowest address of the region
    pub base: usize,
    /// Length in pages
    pub pages: usize,
}

impl PageRegion {
    /// Size in bytes
    pub fn size(&self) -> usize {
        self.pages * PAGE_SIZE
    }

    /// One past the highest address; the initial stack pointer for stacks
    pub fn top(&self) -> usize {
        self.base + self.size()
    }
}

/// Allocator interface consumed by the process manager
pub trait MemoryManager: Send + Sync {
    /// Create an empty address space
    fn create_address_space(&self) -> KernelResult<AddressSpace>;

    /// Tear down an address space
    fn destroy_address_space(&self, space: AddressSpace);

    /// Allocate `count` contiguous pages
    fn alloc_pages(&self, count: usize) -> KernelResult<PageRegion>;

    /// Return a region obtained from [`MemoryManager::alloc_pages`]
    fn free(&self, region: PageRegion);
}

// ============================================================================
// Bump Allocator
// ============================================================================

/// Allocation statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStats {
    /// Pages currently handed out (address space roots included)
    pub live_pages: usize,
    /// Regions currently handed out
    pub live_regions: usize,
    /// Address spaces currently alive
    pub live_address_spaces: usize,
    /// Successful region allocations since creation
    pub total_allocs: u64,
    /// Region frees since creation
    pub total_frees: u64,
    /// Allocations refused
    pub failures: u64,
}

struct BumpState {
    next: usize,
    end: usize,
    next_asid: u64,
    budget: Option<usize>,
    stats: MemoryStats,
}

impl BumpState {
    fn take(&mut self, pages: usize) -> KernelResult<usize> {
        if pages == 0 {
            return Err(KernelError::InvalidArgument);
        }
        let over_budget = self
            .budget
            .is_some_and(|budget| self.stats.live_pages + pages > budget);
        let size = pages.checked_mul(PAGE_SIZE).unwrap_or(usize::MAX);
        if over_budget || self.end - self.next < size {
            self.stats.failures += 1;
            return Err(KernelError::OutOfResources);
        }
        let base = self.next;
        self.next += size;
        self.stats.live_pages += pages;
        Ok(base)
    }
}

/// Bump-pointer page allocator
///
/// Freed pages are accounted but never reused. Each address space consumes
/// one page for its root table. An optional page budget caps the number of
/// live pages, which makes allocation failure reproducible.
pub struct BumpMemory {
    state: Mutex<BumpState>,
}

impl BumpMemory {
    /// Default arena base
    pub const DEFAULT_BASE: usize = 0x1000_0000;

    /// Allocator over `[base, base + size)`
    pub fn new(base: usize, size: usize) -> Self {
        Self {
            state: Mutex::new(BumpState {
                next: base,
                end: base + size,
                next_asid: 1,
                budget: None,
                stats: MemoryStats::default(),
            }),
        }
    }

    /// Allocator with a 1 GiB arena at [`BumpMemory::DEFAULT_BASE`]
    pub fn with_default_arena() -> Self {
        Self::new(Self::DEFAULT_BASE, 1 << 30)
    }

    /// Cap the number of live pages
    pub fn set_page_budget(&self, budget: Option<usize>) {
        self.state.lock().budget = budget;
    }

    pub fn stats(&self) -> MemoryStats {
        self.state.lock().stats
    }
}

impl MemoryManager for BumpMemory {
    fn create_address_space(&self) -> KernelResult<AddressSpace> {
        let mut state = self.state.lock();
        let root = state.take(1)?;
        let asid = state.next_asid;
        state.next_asid += 1;
        state.stats.live_address_spaces += 1;
        Ok(AddressSpace { asid, root })
    }

    fn destroy_address_space(&self, space: AddressSpace) {
        let mut state = self.state.lock();
        log::trace!("releasing address space {}", space.asid);
        state.stats.live_pages -= 1;
        state.stats.live_address_spaces -= 1;
    }

    fn alloc_pages(&self, count: usize) -> KernelResult<PageRegion> {
        let mut state = self.state.lock();
        let base = state.take(count)?;
        state.stats.live_regions += 1;
        state.stats.total_allocs += 1;
        Ok(PageRegion { base, pages: count })
    }

    fn free(&self, region: PageRegion) {
        let mut state = self.state.lock();
        state.stats.live_pages -= region.pages;
        state.stats.live_regions -= 1;
        state.stats.total_frees += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_and_free() {
        let mem = BumpMemory::with_default_arena();
        let a = mem.alloc_pages(2).unwrap();
        let b = mem.alloc_pages(4).unwrap();
        assert_eq!(a.base, BumpMemory::DEFAULT_BASE);
        assert_eq!(b.base, a.top());
        assert_eq!(b.size(), 4 * PAGE_SIZE);

        let stats = mem.stats();
        assert_eq!(stats.live_pages, 6);
        assert_eq!(stats.live_regions, 2);

        mem.free(a);
        mem.free(b);
        let stats = mem.stats();
        assert_eq!(stats.live_pages, 0);
        assert_eq!(stats.total_frees, 2);
    }

    #[test]
    fn test_address_space_ids_unique() {
        let mem = BumpMemory::with_default_arena();
        let a = mem.create_address_space().unwrap();
        let b = mem.create_address_space().unwrap();
        assert_ne!(a.asid, b.asid);
        assert_eq!(mem.stats().live_address_spaces, 2);
        mem.destroy_address_space(a);
        mem.destroy_address_space(b);
        assert_eq!(mem.stats().live_pages, 0);
    }

    #[test]
    fn test_budget_refuses_allocation() {
        let mem = BumpMemory::with_default_arena();
        mem.set_page_budget(Some(3));
        let a = mem.alloc_pages(2).unwrap();
        assert_eq!(mem.alloc_pages(2), Err(KernelError::OutOfResources));
        assert_eq!(mem.stats().failures, 1);
        mem.free(a);
        assert!(mem.alloc_pages(3).is_ok());
    }

    #[test]
    fn test_arena_exhaustion() {
        let mem = BumpMemory::new(0x1000, 4 * PAGE_SIZE);
        assert!(mem.alloc_pages(4).is_ok());
        assert_eq!(mem.alloc_pages(1), Err(KernelError::OutOfResources));
    }

    #[test]
    fn test_zero_pages_rejected() {
        let mem = BumpMemory::with_default_arena();
        assert_eq!(mem.alloc_pages(0), Err(KernelError::InvalidArgument));
    }
}
