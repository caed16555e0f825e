//! Guest physical to host physical translation, built on demand.
//!
//! Every table and every data page is a [`PhysicalBox`] owned by one of two
//! arenas, keyed by its physical address. Parents refer to children only through
//! the address in their entries, so tearing down the tree is a walk that removes
//! each child from the arena before its parent.

use crate::{
    error::{AddressOutOfRangeSnafu, AlreadyMappedSnafu, NotMappedSnafu, NotMmioSnafu, OutOfMemorySnafu, Result},
    svm::paging::{EntryFlags, Level, NptEntry, Page, PageTable, GUEST_PHYSICAL_LIMIT},
    utils::{
        addresses::PhysicalAddress,
        alloc::{PageAllocator, PhysicalBox},
    },
};
use alloc::{sync::Arc, vec::Vec};
use core::ptr::NonNull;
use fnv::FnvBuildHasher;
use hashbrown::HashMap;
use snafu::prelude::*;

type Arena<T> = HashMap<PhysicalAddress, PhysicalBox<T>, FnvBuildHasher>;

const TABLE_FLAGS: EntryFlags = EntryFlags::from_bits_truncate(
    EntryFlags::PRESENT.bits() | EntryFlags::WRITABLE.bits() | EntryFlags::USER.bits(),
);

pub struct NestedPageTable {
    allocator: Arc<dyn PageAllocator>,
    root: PhysicalAddress,
    tables: Arena<PageTable>,
    pages: Arena<Page>,
}

impl NestedPageTable {
    pub fn new(allocator: &Arc<dyn PageAllocator>) -> Result<Self> {
        let root = PhysicalBox::<PageTable>::new_zeroed(allocator).context(OutOfMemorySnafu {
            object: "nested page table root",
        })?;

        let mut tables = Arena::default();
        let root_pa = root.pa();
        tables.insert(root_pa, root);

        Ok(Self {
            allocator: Arc::clone(allocator),
            root: root_pa,
            tables,
            pages: Arena::default(),
        })
    }

    /// Physical address of the PML4, the value for `nCR3`.
    pub fn root(&self) -> PhysicalAddress {
        self.root
    }

    /// Makes sure the page containing `gpa` is backed by a host page and returns
    /// the host page.
    ///
    /// With `mmio`, the new leaf is installed with `present` cleared so every
    /// access faults. Asking again for an MMIO page that is already one returns
    /// it unchanged.
    pub fn ensure_mapped(&mut self, gpa: u64, mmio: bool) -> Result<PhysicalAddress> {
        ensure!(gpa < GUEST_PHYSICAL_LIMIT, AddressOutOfRangeSnafu { gpa });
        let gpa = PhysicalAddress::from_pa(gpa).align_down_to_base_page();

        let mut created = Vec::new();
        let result = self.walk_and_map(gpa, mmio, &mut created);
        if result.is_err() {
            // Unlink what this walk added, deepest first.
            //
            for (parent, index, child) in created.into_iter().rev() {
                if let Some(table) = self.tables.get_mut(&parent) {
                    table.entries[index] = NptEntry::default();
                }
                self.tables.remove(&child);
            }
        }

        result
    }

    fn walk_and_map(
        &mut self, gpa: PhysicalAddress, mmio: bool,
        created: &mut Vec<(PhysicalAddress, usize, PhysicalAddress)>,
    ) -> Result<PhysicalAddress> {
        let mut table = self.root;
        let mut level = Level::Pml4;

        while let Some(next) = level.next() {
            let index = level.index(gpa.as_u64());
            let entry = self.entry(table, index, gpa)?;

            table = if entry.is_unused() {
                let child = PhysicalBox::<PageTable>::new_zeroed(&self.allocator)
                    .context(OutOfMemorySnafu { object: "nested page table" })?;
                let child_pa = child.pa();

                self.tables.insert(child_pa, child);
                self.set_entry(table, index, NptEntry::new(child_pa, TABLE_FLAGS), gpa)?;
                created.push((table, index, child_pa));

                child_pa
            } else {
                entry.address()
            };
            level = next;
        }

        let index = Level::Pt.index(gpa.as_u64());
        let entry = self.entry(table, index, gpa)?;
        if !entry.is_unused() {
            if mmio && entry.flags().contains(EntryFlags::MMIO) {
                return Ok(entry.address());
            }

            return AlreadyMappedSnafu { gpa: gpa.as_u64() }.fail();
        }

        let page = PhysicalBox::<Page>::new_zeroed(&self.allocator)
            .context(OutOfMemorySnafu { object: "guest page" })?;
        let page_pa = page.pa();
        self.pages.insert(page_pa, page);

        let flags = if mmio {
            EntryFlags::WRITABLE | EntryFlags::USER | EntryFlags::MMIO
        } else {
            TABLE_FLAGS
        };
        self.set_entry(table, index, NptEntry::new(page_pa, flags), gpa)?;

        log::trace!("Mapped gpa {:#x} to {:#x} (mmio: {})", gpa, page_pa, mmio);

        Ok(page_pa)
    }

    /// Clears the present bit of an MMIO leaf again, so the next access traps.
    pub fn rearm_mmio(&mut self, gpa: u64) -> Result<()> {
        ensure!(gpa < GUEST_PHYSICAL_LIMIT, AddressOutOfRangeSnafu { gpa });
        let gpa = PhysicalAddress::from_pa(gpa).align_down_to_base_page();

        let (table, index) = self.leaf(gpa).context(NotMappedSnafu { gpa: gpa.as_u64() })?;
        let mut entry = self.entry(table, index, gpa)?;
        ensure!(!entry.is_unused(), NotMappedSnafu { gpa: gpa.as_u64() });
        ensure!(
            entry.flags().contains(EntryFlags::MMIO),
            NotMmioSnafu { gpa: gpa.as_u64() }
        );

        entry.set_present(false);
        self.set_entry(table, index, entry, gpa)
    }

    /// The leaf entry translating `gpa`, if one is populated.
    pub fn translate(&self, gpa: u64) -> Option<NptEntry> {
        if gpa >= GUEST_PHYSICAL_LIMIT {
            return None;
        }

        let (table, index) = self.leaf(PhysicalAddress::from_pa(gpa))?;
        let entry = self.tables.get(&table)?.entries[index];

        (!entry.is_unused()).then_some(entry)
    }

    /// Host pointer to the present data page containing `gpa`.
    pub fn host_page(&self, gpa: u64) -> Option<NonNull<u8>> {
        let entry = self.translate(gpa).filter(|entry| entry.is_present())?;
        let page = self.pages.get(&entry.address())?;

        NonNull::new(page.as_ptr() as *mut u8)
    }

    /// Number of table pages currently owned, including the root.
    pub fn table_count(&self) -> usize {
        self.tables.len()
    }

    /// Number of data pages currently owned.
    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    /// Frees the whole tree, children before their parents. Calling this again is
    /// a no-op.
    pub fn destroy(&mut self) {
        if self.tables.is_empty() {
            return;
        }

        let (tables, pages) = (self.tables.len(), self.pages.len());
        self.free_table(self.root, Level::Pml4);
        debug_assert!(self.tables.is_empty() && self.pages.is_empty());

        log::trace!("Freed {} nested page tables and {} guest pages", tables, pages);
    }

    fn free_table(&mut self, pa: PhysicalAddress, level: Level) {
        let Some(table) = self.tables.remove(&pa) else { return };

        for entry in table.entries.iter().filter(|entry| !entry.is_unused()) {
            match level.next() {
                Some(next) => self.free_table(entry.address(), next),
                None => {
                    self.pages.remove(&entry.address());
                }
            }
        }
    }

    /// Position of the leaf entry for `gpa`, `None` if an intermediate level is
    /// missing.
    fn leaf(&self, gpa: PhysicalAddress) -> Option<(PhysicalAddress, usize)> {
        let mut table = self.root;
        let mut level = Level::Pml4;

        while let Some(next) = level.next() {
            let entry = self.tables.get(&table)?.entries[level.index(gpa.as_u64())];
            if entry.is_unused() {
                return None;
            }

            table = entry.address();
            level = next;
        }

        Some((table, Level::Pt.index(gpa.as_u64())))
    }

    fn entry(&self, table: PhysicalAddress, index: usize, gpa: PhysicalAddress) -> Result<NptEntry> {
        let table = self.tables.get(&table).context(NotMappedSnafu { gpa: gpa.as_u64() })?;

        Ok(table.entries[index])
    }

    fn set_entry(
        &mut self, table: PhysicalAddress, index: usize, entry: NptEntry, gpa: PhysicalAddress,
    ) -> Result<()> {
        let table = self
            .tables
            .get_mut(&table)
            .context(NotMappedSnafu { gpa: gpa.as_u64() })?;
        table.entries[index] = entry;

        Ok(())
    }
}

impl Drop for NestedPageTable {
    fn drop(&mut self) {
        self.destroy();
    }
}
