use crate::utils::{
    addresses::PhysicalAddress,
    alloc::{PageAllocator, PhysicalMemory, PAGE_SIZE},
};
use alloc::{
    alloc::{alloc_zeroed, dealloc, Layout},
    collections::BTreeMap,
    sync::Arc,
};
use core::ptr::NonNull;
use spin::Mutex;

/// Where the fake physical address space starts.
const PHYSICAL_BASE: u64 = 0x10_0000;

struct Region {
    va: NonNull<u8>,
    page_count: usize,
}

// Only reached through the allocator lock.
unsafe impl Send for Region {}

#[derive(Default)]
struct Inner {
    next_pa: u64,
    regions: BTreeMap<u64, Region>,
    allocations: usize,
    frees: usize,
    outstanding_pages: usize,
    remaining: Option<usize>,
}

/// Page allocator backed by the heap, handing out made-up physical addresses.
///
/// Counts allocations, can be told to fail and panics on double or foreign frees.
/// Physical addresses are never reused.
pub struct StubMemory {
    inner: Mutex<Inner>,
}

impl StubMemory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                next_pa: PHYSICAL_BASE,
                ..Default::default()
            }),
        })
    }

    /// Lets `count` more allocations succeed, failing every one after.
    pub fn fail_after(&self, count: usize) {
        self.inner.lock().remaining = Some(count);
    }

    pub fn reset_failures(&self) {
        self.inner.lock().remaining = None;
    }

    pub fn allocations(&self) -> usize {
        self.inner.lock().allocations
    }

    pub fn frees(&self) -> usize {
        self.inner.lock().frees
    }

    /// Number of allocations not freed yet.
    pub fn outstanding(&self) -> usize {
        self.inner.lock().regions.len()
    }

    pub fn outstanding_pages(&self) -> usize {
        self.inner.lock().outstanding_pages
    }

    /// Resolves a physical address handed out by this allocator.
    pub fn phys_to_virt(&self, pa: u64) -> Option<NonNull<u8>> {
        let inner = self.inner.lock();
        let (start, region) = inner.regions.range(..=pa).next_back()?;

        let offset = (pa - start) as usize;
        if offset >= region.page_count * PAGE_SIZE {
            return None;
        }

        NonNull::new(unsafe { region.va.as_ptr().add(offset) })
    }

    fn layout(page_count: usize) -> Option<Layout> {
        Layout::from_size_align(page_count * PAGE_SIZE, PAGE_SIZE).ok()
    }
}

impl PageAllocator for StubMemory {
    fn allocate_pages(&self, page_count: usize) -> Option<PhysicalMemory> {
        let mut inner = self.inner.lock();

        if let Some(remaining) = inner.remaining.as_mut() {
            if *remaining == 0 {
                log::warn!("Failing allocation of {} pages", page_count);
                return None;
            }
            *remaining -= 1;
        }

        let va = NonNull::new(unsafe { alloc_zeroed(Self::layout(page_count)?) })?;
        let pa = inner.next_pa;
        inner.next_pa += (page_count * PAGE_SIZE) as u64;

        inner.regions.insert(pa, Region { va, page_count });
        inner.allocations += 1;
        inner.outstanding_pages += page_count;

        Some(unsafe { PhysicalMemory::new(PhysicalAddress::from_pa(pa), va, page_count) })
    }

    unsafe fn free_pages(&self, memory: PhysicalMemory) {
        let mut inner = self.inner.lock();

        let Some(region) = inner.regions.remove(&memory.pa().as_u64()) else {
            panic!("freeing {:#x}, which is not allocated", memory.pa());
        };
        assert_eq!(region.va.as_ptr(), memory.as_ptr());
        assert_eq!(region.page_count, memory.page_count());

        if let Some(layout) = Self::layout(region.page_count) {
            dealloc(region.va.as_ptr(), layout);
        }

        inner.frees += 1;
        inner.outstanding_pages -= region.page_count;
    }
}

impl Drop for StubMemory {
    fn drop(&mut self) {
        for region in core::mem::take(&mut self.inner.get_mut().regions).into_values() {
            if let Some(layout) = Self::layout(region.page_count) {
                unsafe { dealloc(region.va.as_ptr(), layout) };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_translation() {
        let memory = StubMemory::new();

        let first = memory.allocate_pages(3).unwrap();
        let second = memory.allocate_pages(1).unwrap();
        assert_eq!(first.pa().as_u64(), PHYSICAL_BASE);
        assert_eq!(second.pa().as_u64(), PHYSICAL_BASE + 0x3000);

        let va = memory.phys_to_virt(PHYSICAL_BASE + 0x2010).unwrap();
        assert_eq!(va.as_ptr(), unsafe { first.as_ptr().add(0x2010) });
        assert!(memory.phys_to_virt(PHYSICAL_BASE + 0x4000).is_none());
        assert!(memory.phys_to_virt(0x1000).is_none());

        unsafe { memory.free_pages(first) };
        assert!(memory.phys_to_virt(PHYSICAL_BASE).is_none());
        assert_eq!(memory.outstanding(), 1);
        assert_eq!(memory.outstanding_pages(), 1);
    }

    #[test]
    #[should_panic(expected = "which is not allocated")]
    fn test_double_free() {
        let memory = StubMemory::new();

        let page = memory.allocate_pages(1).unwrap();
        let copy = unsafe { PhysicalMemory::new(page.pa(), NonNull::new(page.as_ptr()).unwrap(), 1) };

        unsafe {
            memory.free_pages(page);
            memory.free_pages(copy);
        }
    }
}
