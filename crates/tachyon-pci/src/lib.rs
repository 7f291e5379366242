//! Claiming PCI devices from user space.
//!
//! Linux hands a PCI NIC to a user-space driver through sysfs: detach the
//! kernel driver via `driver/unbind`, then memory-map the `resource<N>` BAR
//! files for direct register access. [`DeviceHandle::acquire`] performs that
//! sequence as an all-or-nothing claim, rolling the device back to its
//! previous driver on partial failure, and the returned handle owns every
//! mapping until [`DeviceHandle::release`] or drop.
//!
//! Requires ambient privilege on the sysfs files involved; without it,
//! operations fail cleanly with a permission error.

pub mod addr;
pub mod bind;
pub mod config;
pub mod device;
pub mod error;
pub mod map;
pub mod sysfs;

pub use addr::PciAddress;
pub use bind::BindingState;
pub use device::{AcquireOptions, DeviceHandle};
pub use error::{AcquireError, BindError, LocateError, MapError, ReleaseDiagnostic};
pub use map::{Access, MappedRegion};
pub use sysfs::DevicePaths;
