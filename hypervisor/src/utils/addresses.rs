use core::fmt;
use x86::bits64::paging::{BASE_PAGE_SHIFT, BASE_PAGE_SIZE};

/// A host physical address.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct PhysicalAddress(u64);

impl PhysicalAddress {
    pub const fn from_pa(pa: u64) -> Self {
        Self(pa)
    }

    pub const fn from_pfn(pfn: u64) -> Self {
        Self(pfn << BASE_PAGE_SHIFT)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }

    pub const fn pfn(self) -> u64 {
        self.0 >> BASE_PAGE_SHIFT
    }

    pub const fn page_offset(self) -> u64 {
        self.0 & (BASE_PAGE_SIZE as u64 - 1)
    }

    pub const fn align_down_to_base_page(self) -> Self {
        Self(self.0 & !(BASE_PAGE_SIZE as u64 - 1))
    }

    pub const fn is_page_aligned(self) -> bool {
        self.page_offset() == 0
    }
}

impl fmt::LowerHex for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_helpers() {
        let pa = PhysicalAddress::from_pa(0x1234_5678);

        assert_eq!(pa.pfn(), 0x12345);
        assert_eq!(pa.page_offset(), 0x678);
        assert_eq!(pa.align_down_to_base_page().as_u64(), 0x1234_5000);
        assert_eq!(PhysicalAddress::from_pfn(0x12345), pa.align_down_to_base_page());
        assert!(!pa.is_page_aligned());
        assert_eq!(format!("{:#x}", pa), "0x12345678");
    }
}
