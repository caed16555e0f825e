//! Physically contiguous page allocation.
//!
//! Everything the processor reads by physical address (control blocks, the host
//! save area, the I/O permission map, nested page tables) lives in memory handed out
//! by a [`PageAllocator`]. [`PhysicalBox`] owns such an allocation and gives it
//! back when dropped.

use crate::utils::addresses::PhysicalAddress;
use alloc::sync::Arc;
use core::{
    marker::PhantomData,
    mem::ManuallyDrop,
    ops::{Deref, DerefMut},
    ptr::NonNull,
};
use x86::bits64::paging::BASE_PAGE_SIZE;

pub const PAGE_SIZE: usize = BASE_PAGE_SIZE;

/// Number of pages needed to hold `size` bytes.
pub const fn pages_for(size: usize) -> usize {
    (size + PAGE_SIZE - 1) / PAGE_SIZE
}

/// A run of physically contiguous pages and the kernel mapping of it.
#[derive(Debug)]
pub struct PhysicalMemory {
    pa: PhysicalAddress,
    va: NonNull<u8>,
    page_count: usize,
}

// Only an address pair. Access goes through the owner.
unsafe impl Send for PhysicalMemory {}
unsafe impl Sync for PhysicalMemory {}

impl PhysicalMemory {
    /// # Safety
    ///
    /// `va` must map `page_count` page aligned pages starting at `pa`, and stay
    /// valid until the memory is returned to the allocator.
    pub unsafe fn new(pa: PhysicalAddress, va: NonNull<u8>, page_count: usize) -> Self {
        Self { pa, va, page_count }
    }

    pub fn pa(&self) -> PhysicalAddress {
        self.pa
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.va.as_ptr()
    }

    pub fn page_count(&self) -> usize {
        self.page_count
    }

    pub fn size(&self) -> usize {
        self.page_count * PAGE_SIZE
    }
}

/// Source of zeroed, page aligned, physically contiguous memory.
pub trait PageAllocator: Send + Sync {
    /// Returns `None` when physical memory is exhausted.
    fn allocate_pages(&self, page_count: usize) -> Option<PhysicalMemory>;

    /// # Safety
    ///
    /// `memory` must come from this allocator and nothing may reference it anymore.
    unsafe fn free_pages(&self, memory: PhysicalMemory);
}

/// Types for which the all-zero bit pattern is a valid value.
///
/// # Safety
///
/// Implementors must not contain references, non-nullable pointers or enums
/// without a zero discriminant.
pub unsafe trait Zeroable {}

/// Owning pointer to a `T` that lives in memory from a [`PageAllocator`].
pub struct PhysicalBox<T> {
    memory: ManuallyDrop<PhysicalMemory>,
    allocator: Arc<dyn PageAllocator>,
    _marker: PhantomData<T>,
}

unsafe impl<T: Send> Send for PhysicalBox<T> {}
unsafe impl<T: Sync> Sync for PhysicalBox<T> {}

impl<T: Zeroable> PhysicalBox<T> {
    pub fn new_zeroed(allocator: &Arc<dyn PageAllocator>) -> Option<Self> {
        let memory = allocator.allocate_pages(pages_for(core::mem::size_of::<T>()))?;
        debug_assert_eq!(memory.as_ptr() as usize % core::mem::align_of::<T>(), 0);

        Some(Self {
            memory: ManuallyDrop::new(memory),
            allocator: Arc::clone(allocator),
            _marker: PhantomData,
        })
    }
}

impl<T> PhysicalBox<T> {
    pub fn pa(&self) -> PhysicalAddress {
        self.memory.pa()
    }

    pub fn as_ptr(&self) -> *mut T {
        self.memory.as_ptr() as *mut T
    }

    pub fn page_count(&self) -> usize {
        self.memory.page_count()
    }
}

impl<T> Deref for PhysicalBox<T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.as_ptr() }
    }
}

impl<T> DerefMut for PhysicalBox<T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.as_ptr() }
    }
}

impl<T> Drop for PhysicalBox<T> {
    fn drop(&mut self) {
        let memory = unsafe { ManuallyDrop::take(&mut self.memory) };
        unsafe { self.allocator.free_pages(memory) };
    }
}
