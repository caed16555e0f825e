//! Command numbers of the control device and the fixed addresses of the guest ABI.

#![allow(missing_docs)]

use crate::{
    error::{Error, UnknownCommandSnafu},
    svm::data::guest::Registers,
};
use snafu::prelude::*;

pub const IOC_NRSHIFT: u32 = 0;
pub const IOC_TYPESHIFT: u32 = 8;
pub const IOC_SIZESHIFT: u32 = 16;
pub const IOC_DIRSHIFT: u32 = 30;

pub const IOC_NONE: u32 = 0;
pub const IOC_WRITE: u32 = 1;
pub const IOC_READ: u32 = 2;

/// Magic number of every command of the device.
pub const HYPERVISOR_IOC_TYPE: u32 = 0x29;

/// Creates a command number from the parameters.
pub const fn ioc(dir: u32, nr: u32, size: usize) -> u32 {
    dir << IOC_DIRSHIFT
        | (size as u32) << IOC_SIZESHIFT
        | HYPERVISOR_IOC_TYPE << IOC_TYPESHIFT
        | nr << IOC_NRSHIFT
}

/// Creates a command number for a command without argument.
#[macro_export]
macro_rules! io {
    ($nr:expr) => {
        $crate::ioctl::ioc($crate::ioctl::IOC_NONE, $nr, 0)
    };
}

/// Creates a command number for a command that copies a `$ty` out.
#[macro_export]
macro_rules! ior {
    ($nr:expr, $ty:ty) => {
        $crate::ioctl::ioc($crate::ioctl::IOC_READ, $nr, core::mem::size_of::<$ty>())
    };
}

/// Creates a command number for a command that copies a `$ty` in.
#[macro_export]
macro_rules! iow {
    ($nr:expr, $ty:ty) => {
        $crate::ioctl::ioc($crate::ioctl::IOC_WRITE, $nr, core::mem::size_of::<$ty>())
    };
}

// Device
pub const HYPERVISOR_CREATE_VM: u32 = io!(0x00);

// Vm
pub const HYPERVISOR_CREATE_VCPU: u32 = io!(0x10);
pub const HYPERVISOR_MAP_PAGE: u32 = io!(0x11);
pub const HYPERVISOR_MAP_MMIO: u32 = io!(0x12);
pub const HYPERVISOR_REARM_MMIO: u32 = io!(0x13);

// Vcpu
pub const HYPERVISOR_RUN: u32 = io!(0x20);
pub const HYPERVISOR_GET_REGS: u32 = ior!(0x21, Registers);
pub const HYPERVISOR_SET_REGS: u32 = iow!(0x22, Registers);

/// Port of the PIO test register.
pub const PIO_HAWK_PORT: u16 = 0x10;

/// Guest physical address of the MMIO test register.
pub const MMIO_HAWK_ADDRESS: u64 = 0x1000;

/// Where the guest code is loaded and where the stack starts.
pub const GUEST_ENTRY: u64 = 0x1_0000;
pub const GUEST_STACK: u64 = 0x2_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceCommand {
    CreateVm,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmCommand {
    CreateVcpu,
    MapPage,
    MapMmio,
    RearmMmio,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VcpuCommand {
    Run,
    GetRegs,
    SetRegs,
}

impl TryFrom<u32> for DeviceCommand {
    type Error = Error;

    fn try_from(command: u32) -> Result<Self, Self::Error> {
        match command {
            HYPERVISOR_CREATE_VM => Ok(Self::CreateVm),
            _ => UnknownCommandSnafu { command }.fail(),
        }
    }
}

impl TryFrom<u32> for VmCommand {
    type Error = Error;

    fn try_from(command: u32) -> Result<Self, Self::Error> {
        match command {
            HYPERVISOR_CREATE_VCPU => Ok(Self::CreateVcpu),
            HYPERVISOR_MAP_PAGE => Ok(Self::MapPage),
            HYPERVISOR_MAP_MMIO => Ok(Self::MapMmio),
            HYPERVISOR_REARM_MMIO => Ok(Self::RearmMmio),
            _ => UnknownCommandSnafu { command }.fail(),
        }
    }
}

impl TryFrom<u32> for VcpuCommand {
    type Error = Error;

    fn try_from(command: u32) -> Result<Self, Self::Error> {
        match command {
            HYPERVISOR_RUN => Ok(Self::Run),
            HYPERVISOR_GET_REGS => Ok(Self::GetRegs),
            HYPERVISOR_SET_REGS => Ok(Self::SetRegs),
            _ => UnknownCommandSnafu { command }.fail(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_numbers() {
        assert_eq!(HYPERVISOR_CREATE_VM, 0x2900);
        assert_eq!(HYPERVISOR_CREATE_VCPU, 0x2910);
        assert_eq!(HYPERVISOR_MAP_PAGE, 0x2911);
        assert_eq!(HYPERVISOR_RUN, 0x2920);
        assert_eq!(HYPERVISOR_GET_REGS, 0x80c0_2921);
        assert_eq!(HYPERVISOR_SET_REGS, 0x40c0_2922);
    }

    #[test]
    fn test_decode() {
        assert_eq!(DeviceCommand::try_from(0x2900).unwrap(), DeviceCommand::CreateVm);
        assert_eq!(VmCommand::try_from(0x2913).unwrap(), VmCommand::RearmMmio);
        assert_eq!(VcpuCommand::try_from(HYPERVISOR_GET_REGS).unwrap(), VcpuCommand::GetRegs);

        // Commands only make sense on their own handle.
        //
        assert!(matches!(
            VmCommand::try_from(HYPERVISOR_RUN),
            Err(Error::UnknownCommand { command: 0x2920 })
        ));
        assert!(VcpuCommand::try_from(HYPERVISOR_CREATE_VM).is_err());
        assert!(DeviceCommand::try_from(0xdead_beef).is_err());
    }
}
