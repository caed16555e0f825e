//! The two test registers the guest can reach.

/// A single byte register.
pub trait Device {
    fn read(&self) -> u8;

    fn write(&mut self, value: u8);
}

/// Byte register on [`PIO_HAWK_PORT`](hypervisor::ioctl::PIO_HAWK_PORT). Reads
/// return the last value written plus one.
#[derive(Debug, Default)]
pub struct PioHawk {
    value: u8,
}

impl Device for PioHawk {
    fn read(&self) -> u8 {
        self.value.wrapping_add(1)
    }

    fn write(&mut self, value: u8) {
        self.value = value;
    }
}

/// Byte register at [`MMIO_HAWK_ADDRESS`](hypervisor::ioctl::MMIO_HAWK_ADDRESS).
/// Reads return the last value written minus one.
#[derive(Debug, Default)]
pub struct MmioHawk {
    value: u8,
}

impl Device for MmioHawk {
    fn read(&self) -> u8 {
        self.value.wrapping_sub(1)
    }

    fn write(&mut self, value: u8) {
        self.value = value;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pio_hawk() {
        let mut hawk = PioHawk::default();
        assert_eq!(hawk.read(), 1);

        hawk.write(1);
        assert_eq!(hawk.read(), 2);

        hawk.write(0xff);
        assert_eq!(hawk.read(), 0);
    }

    #[test]
    fn test_mmio_hawk() {
        let mut hawk = MmioHawk::default();
        assert_eq!(hawk.read(), 0xff);

        hawk.write(5);
        assert_eq!(hawk.read(), 4);
    }
}
