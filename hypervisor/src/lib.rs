#![cfg_attr(not(test), no_std)]

extern crate alloc;

#[macro_use] extern crate static_assertions;

pub mod error;
pub mod ioctl;
pub mod platform;
#[cfg(any(test, feature = "stub"))]
pub mod stub;
pub mod svm;
pub mod utils;

pub use error::{Error, Result};
