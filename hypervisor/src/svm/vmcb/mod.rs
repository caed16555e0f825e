//! See `Appendix B - Layout of VMCB` in AMD64 Architecture Programmer’s Manual Volume 2: System Programming.

use crate::{
    svm::vmcb::{control_area::ControlArea, save_area::SaveArea},
    utils::alloc::{Zeroable, PAGE_SIZE},
};

pub mod control_area;
pub mod save_area;

const VMCB_RESERVED_SIZE: usize =
    PAGE_SIZE - core::mem::size_of::<ControlArea>() - core::mem::size_of::<SaveArea>();

/// # Layout
///
/// The control area is padded to 1024 bytes and the save area follows it. All
/// unused bytes must be zero, so control blocks are only ever created from zeroed
/// pages.
#[repr(C, align(4096))]
pub struct Vmcb {
    pub control_area: ControlArea,
    pub save_area: SaveArea,
    pub reserved: [u8; VMCB_RESERVED_SIZE],
}
const_assert_eq!(core::mem::size_of::<Vmcb>(), PAGE_SIZE);
const_assert_eq!(core::mem::offset_of!(Vmcb, save_area), 0x400);
const_assert_eq!(core::mem::offset_of!(ControlArea, iopm_base_pa), 0x040);
const_assert_eq!(core::mem::offset_of!(ControlArea, guest_asid), 0x058);
const_assert_eq!(core::mem::offset_of!(ControlArea, exit_code), 0x070);
const_assert_eq!(core::mem::offset_of!(ControlArea, np_enable), 0x090);
const_assert_eq!(core::mem::offset_of!(ControlArea, ncr3), 0x0b0);
const_assert_eq!(core::mem::offset_of!(ControlArea, nrip), 0x0c8);
const_assert_eq!(core::mem::offset_of!(ControlArea, vmcb_save_state_pointer), 0x108);

unsafe impl Zeroable for Vmcb {}

/// Page the processor stores host state to on `vmrun`. Its format is
/// implementation specific.
#[repr(C, align(4096))]
pub struct HostSaveArea(pub [u8; PAGE_SIZE]);
const_assert_eq!(core::mem::size_of::<HostSaveArea>(), PAGE_SIZE);

unsafe impl Zeroable for HostSaveArea {}
