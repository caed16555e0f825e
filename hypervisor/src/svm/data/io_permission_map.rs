use crate::utils::alloc::{Zeroable, PAGE_SIZE};

const CHAR_BIT: usize = 8;

/// One bit per I/O port. See `15.10.1 I/O Permissions Map`.
///
/// The map is 12KiB although only 64K bits are used: a multi-byte access at
/// port 0xffff checks bits past the first 8KiB.
#[repr(C, align(4096))]
pub struct IoPermissionMap {
    pub bitmap: [u8; 3 * PAGE_SIZE],
}
const_assert_eq!(core::mem::size_of::<IoPermissionMap>(), 3 * PAGE_SIZE);

unsafe impl Zeroable for IoPermissionMap {}

impl IoPermissionMap {
    /// Intercepts every port.
    pub fn intercept_all(&mut self) {
        self.bitmap.fill(0xff);
    }

    pub fn intercept(&mut self, port: u16) {
        let (byte, mask) = Self::position(port);
        self.bitmap[byte] |= mask;
    }

    pub fn is_intercepted(&self, port: u16) -> bool {
        let (byte, mask) = Self::position(port);
        self.bitmap[byte] & mask != 0
    }

    fn position(port: u16) -> (usize, u8) {
        let port = port as usize;
        (port / CHAR_BIT, 1 << (port % CHAR_BIT))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intercept() {
        let mut map: IoPermissionMap = unsafe { core::mem::zeroed() };

        map.intercept(0x10);
        assert_eq!(map.bitmap[2], 1);
        assert!(map.is_intercepted(0x10));
        assert!(!map.is_intercepted(0x11));

        map.intercept_all();
        assert!(map.is_intercepted(0xffff));
        assert!(map.bitmap.iter().all(|byte| *byte == 0xff));
    }
}
