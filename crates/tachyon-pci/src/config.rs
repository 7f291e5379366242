//! Configuration-space access through the sysfs `config` file.
//!
//! Enough of the standard type-0 header to identify a claimed device and to
//! grant it bus mastering before the packet-I/O layer programs DMA. The
//! kernel mediates all accesses; no raw port I/O is involved.

use std::fs::{File, OpenOptions};
use std::io::{self, Read as _, Seek as _, SeekFrom, Write as _};

use crate::sysfs::DevicePaths;

/// Standard configuration-space offsets used here.
mod regs {
    /// Command register (16-bit, offset 0x04).
    pub const COMMAND: u64 = 0x04;
}

/// Bus-master enable bit of the command register.
pub const COMMAND_BUS_MASTER: u16 = 1 << 2;

/// Identification fields from the configuration header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PciDeviceInfo {
    /// Vendor ID.
    pub vendor_id: u16,
    /// Device ID.
    pub device_id: u16,
    /// Revision ID.
    pub revision: u8,
    /// Programming interface.
    pub prog_if: u8,
    /// Subclass code.
    pub subclass: u8,
    /// Class code.
    pub class: u8,
}

/// Reads the device's identification header.
pub fn read_device_info(paths: &DevicePaths) -> io::Result<PciDeviceInfo> {
    let mut file = File::open(paths.config_file())?;
    let mut header = [0u8; 12];
    file.read_exact(&mut header)?;
    Ok(PciDeviceInfo {
        vendor_id: u16::from_le_bytes([header[0], header[1]]),
        device_id: u16::from_le_bytes([header[2], header[3]]),
        revision: header[8],
        prog_if: header[9],
        subclass: header[10],
        class: header[11],
    })
}

/// Sets the bus-master bit of the command register.
///
/// Without it the device cannot initiate DMA. A no-op when the bit is
/// already set.
pub fn enable_bus_master(paths: &DevicePaths) -> io::Result<()> {
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(paths.config_file())?;

    let mut raw = [0u8; 2];
    file.seek(SeekFrom::Start(regs::COMMAND))?;
    file.read_exact(&mut raw)?;

    let command = u16::from_le_bytes(raw);
    if command & COMMAND_BUS_MASTER != 0 {
        return Ok(());
    }

    file.seek(SeekFrom::Start(regs::COMMAND))?;
    file.write_all(&(command | COMMAND_BUS_MASTER).to_le_bytes())?;
    log::debug!("{}: bus mastering enabled", paths.addr());
    Ok(())
}
