use core::sync::atomic::{AtomicU32, Ordering};

/// Hands out address space identifiers, one per vcpu, never reused.
///
/// ASID 0 belongs to the host, so the counter starts at 1.
pub struct AsidAllocator {
    next: AtomicU32,
    limit: u32,
}

impl AsidAllocator {
    /// `limit` is the number of ASIDs the processor supports.
    pub const fn new(limit: u32) -> Self {
        Self {
            next: AtomicU32::new(1),
            limit,
        }
    }

    /// Returns the next free ASID.
    ///
    /// Running out is fatal: guests would share TLB entries.
    pub fn allocate(&self) -> u32 {
        let asid = self.next.fetch_add(1, Ordering::Relaxed);
        assert!(
            asid < self.limit,
            "ran out of address space identifiers (limit {})",
            self.limit
        );

        asid
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate() {
        let asids = AsidAllocator::new(4);

        assert_eq!(asids.allocate(), 1);
        assert_eq!(asids.allocate(), 2);
        assert_eq!(asids.allocate(), 3);
    }

    #[test]
    #[should_panic(expected = "ran out of address space identifiers")]
    fn test_allocate_past_limit() {
        let asids = AsidAllocator::new(2);

        asids.allocate();
        asids.allocate();
    }
}
