//! Nested page table entry format. Nested tables use the regular long mode
//! 4-level layout with 4KiB leaves.

use crate::utils::{
    addresses::PhysicalAddress,
    alloc::{Zeroable, PAGE_SIZE},
};
use bitflags::bitflags;
use x86::bits64::paging::MAXPHYADDR;

pub const PAGE_SHIFT: u64 = 12;
pub const PFN_MASK: u64 = ((1 << MAXPHYADDR) - 1) & !0xfff;
pub const ENTRY_COUNT: usize = 512;

/// First guest physical address four levels can't translate.
pub const GUEST_PHYSICAL_LIMIT: u64 = 1 << 48;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Pml4,
    Pdpt,
    Pd,
    Pt,
}

impl Level {
    pub const fn shift(self) -> u64 {
        match self {
            Level::Pml4 => 39,
            Level::Pdpt => 30,
            Level::Pd => 21,
            Level::Pt => PAGE_SHIFT,
        }
    }

    /// Index of the entry translating `gpa` in a table of this level.
    pub const fn index(self, gpa: u64) -> usize {
        ((gpa >> self.shift()) & (ENTRY_COUNT as u64 - 1)) as usize
    }

    /// The level the entries of this level point to, `None` for leaves.
    pub const fn next(self) -> Option<Level> {
        match self {
            Level::Pml4 => Some(Level::Pdpt),
            Level::Pdpt => Some(Level::Pd),
            Level::Pd => Some(Level::Pt),
            Level::Pt => None,
        }
    }
}

bitflags! {
    pub struct EntryFlags: u64 {
        const PRESENT  = 1 << 0;
        const WRITABLE = 1 << 1;
        /// Nested walks are user accesses, so every level needs this.
        const USER     = 1 << 2;
        /// Available to software: the page traps accesses for emulation.
        const MMIO     = 1 << 9;
    }
}

#[repr(transparent)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NptEntry(u64);

impl NptEntry {
    pub fn new(address: PhysicalAddress, flags: EntryFlags) -> Self {
        Self((address.as_u64() & PFN_MASK) | flags.bits())
    }

    pub const fn bits(self) -> u64 {
        self.0
    }

    pub const fn is_unused(self) -> bool {
        self.0 == 0
    }

    pub fn is_present(self) -> bool {
        self.flags().contains(EntryFlags::PRESENT)
    }

    pub fn address(self) -> PhysicalAddress {
        PhysicalAddress::from_pa(self.0 & PFN_MASK)
    }

    pub fn flags(self) -> EntryFlags {
        EntryFlags::from_bits_truncate(self.0)
    }

    pub fn set_present(&mut self, present: bool) {
        if present {
            self.0 |= EntryFlags::PRESENT.bits();
        } else {
            self.0 &= !EntryFlags::PRESENT.bits();
        }
    }
}

#[repr(C, align(4096))]
pub struct PageTable {
    pub entries: [NptEntry; ENTRY_COUNT],
}
const_assert_eq!(core::mem::size_of::<PageTable>(), PAGE_SIZE);

unsafe impl Zeroable for PageTable {}

/// A page of guest memory.
#[repr(C, align(4096))]
pub struct Page(pub [u8; PAGE_SIZE]);
const_assert_eq!(core::mem::size_of::<Page>(), PAGE_SIZE);

unsafe impl Zeroable for Page {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_indices() {
        let gpa = 0xffff_fff0;

        assert_eq!(Level::Pml4.index(gpa), 0);
        assert_eq!(Level::Pdpt.index(gpa), 3);
        assert_eq!(Level::Pd.index(gpa), 511);
        assert_eq!(Level::Pt.index(gpa), 511);
        assert_eq!(Level::Pd.next(), Some(Level::Pt));
        assert_eq!(Level::Pt.next(), None);
    }

    #[test]
    fn test_entry() {
        let mut entry = NptEntry::new(
            PhysicalAddress::from_pa(0x12_3000),
            EntryFlags::PRESENT | EntryFlags::WRITABLE | EntryFlags::USER,
        );
        assert_eq!(entry.bits(), 0x12_3007);
        assert!(entry.is_present());

        entry.set_present(false);
        assert!(!entry.is_present());
        assert!(!entry.is_unused());
        assert_eq!(entry.address().as_u64(), 0x12_3000);
    }
}
