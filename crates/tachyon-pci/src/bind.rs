//! Kernel driver binding control.
//!
//! Detaches a device from its kernel driver by writing the bus id to the
//! `driver/unbind` control, and reattaches it by writing the driver name to
//! `driver_override` followed by the bus id to `drivers_probe`.
//!
//! Binding is kernel-owned state that an administrator, another process, or a
//! hot-unplug event can change at any time, so it is re-read from sysfs on
//! every probe and never cached across operations.

use std::fs::OpenOptions;
use std::io::{self, Write as _};
use std::path::Path;

use crate::error::BindError;
use crate::sysfs::DevicePaths;

/// Who, if anyone, holds the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindingState {
    /// Not yet probed.
    Unknown,
    /// A kernel driver holds the device.
    BoundToKernelDriver(String),
    /// No driver holds the device.
    Unbound,
    /// This process holds the device through mapped BARs.
    BoundToUserDriver,
}

/// Returns the name of the currently bound kernel driver, or `None` if the
/// device is unbound. Always reads the `driver` symlink fresh.
pub fn current_driver(paths: &DevicePaths) -> Result<Option<String>, BindError> {
    match std::fs::read_link(paths.driver_link()) {
        Ok(target) => Ok(target
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(BindError::from_io(paths.driver_link(), e)),
    }
}

/// Probes the kernel-visible binding state.
pub fn probe(paths: &DevicePaths) -> Result<BindingState, BindError> {
    Ok(match current_driver(paths)? {
        Some(driver) => BindingState::BoundToKernelDriver(driver),
        None => BindingState::Unbound,
    })
}

/// Detaches the device from its kernel driver.
///
/// Idempotent: when the device is already unbound the `driver/unbind` control
/// does not exist and the call succeeds as a no-op.
pub fn unbind(paths: &DevicePaths) -> Result<(), BindError> {
    let bus_id = paths.addr().to_string();
    match write_control(paths.unbind_file(), &bus_id) {
        Ok(()) => {
            log::debug!("{bus_id}: detached from kernel driver");
            Ok(())
        }
        Err(BindError::Io(e)) if e.kind() == io::ErrorKind::NotFound => {
            log::debug!("{bus_id}: already unbound");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// Reattaches the device to the named kernel driver.
///
/// Writes the driver name to `driver_override`, then asks the kernel to
/// re-run driver matching through `drivers_probe`.
pub fn rebind(paths: &DevicePaths, driver: &str) -> Result<(), BindError> {
    let bus_id = paths.addr().to_string();
    write_control(paths.override_file(), driver)?;
    write_control(paths.probe_file(), &bus_id)?;
    log::debug!("{bus_id}: reattached to `{driver}`");
    Ok(())
}

/// Writes one value to a sysfs control file.
///
/// Sysfs consumes control writes whole; a short count means the kernel
/// rejected part of the value, which is surfaced as
/// [`BindError::WriteIncomplete`] rather than retried.
fn write_control(path: &Path, value: &str) -> Result<(), BindError> {
    let mut file = OpenOptions::new()
        .write(true)
        .open(path)
        .map_err(|e| BindError::from_io(path, e))?;
    let written = file
        .write(value.as_bytes())
        .map_err(|e| BindError::from_io(path, e))?;
    if written != value.len() {
        return Err(BindError::WriteIncomplete {
            written,
            expected: value.len(),
        });
    }
    Ok(())
}
