//! Sysfs path resolution for PCI devices.
//!
//! Resolves a [`PciAddress`] into the bundle of files the kernel exposes for
//! that device: the `driver` symlink and its `unbind` control, the
//! `driver_override`/`drivers_probe` rebind controls, the `config` space
//! file, and one `resource<N>` file per implemented BAR. Resolution is pure
//! path construction plus existence checks; nothing here mutates the device.

use std::path::{Path, PathBuf};

use crate::addr::PciAddress;
use crate::error::LocateError;

/// Default sysfs root for the PCI bus.
pub const SYSFS_PCI_ROOT: &str = "/sys/bus/pci";

/// A type-0 PCI header implements at most six BARs.
const MAX_BARS: usize = 6;

/// Paths for one BAR resource file.
#[derive(Debug, Clone)]
pub struct ResourcePaths {
    /// BAR index.
    pub index: usize,
    /// The `resource<N>` file.
    pub path: PathBuf,
    /// The `resource<N>_wc` write-combining variant, present only for
    /// prefetchable BARs.
    pub wc: Option<PathBuf>,
}

/// The sysfs file bundle for one PCI device.
#[derive(Debug, Clone)]
pub struct DevicePaths {
    addr: PciAddress,
    device_dir: PathBuf,
    driver_link: PathBuf,
    unbind_file: PathBuf,
    override_file: PathBuf,
    probe_file: PathBuf,
    config_file: PathBuf,
    resources: Vec<ResourcePaths>,
}

impl DevicePaths {
    /// Resolves a device under the real sysfs root.
    pub fn locate(addr: PciAddress) -> Result<Self, LocateError> {
        Self::locate_under(Path::new(SYSFS_PCI_ROOT), addr)
    }

    /// Resolves a device under an arbitrary sysfs root.
    ///
    /// The root must contain `devices/<bdf>/` and `drivers_probe`, laid out
    /// the way the kernel lays out `/sys/bus/pci`. Fails with
    /// [`LocateError::DeviceNotFound`] if the device directory is absent.
    pub fn locate_under(root: &Path, addr: PciAddress) -> Result<Self, LocateError> {
        let device_dir = root.join("devices").join(addr.to_string());
        if !device_dir.is_dir() {
            return Err(LocateError::DeviceNotFound(device_dir));
        }

        let mut resources = Vec::new();
        for index in 0..MAX_BARS {
            let path = device_dir.join(format!("resource{index}"));
            if !path.is_file() {
                continue;
            }
            let wc_path = device_dir.join(format!("resource{index}_wc"));
            resources.push(ResourcePaths {
                index,
                path,
                wc: wc_path.is_file().then_some(wc_path),
            });
        }

        log::debug!(
            "located {addr}: {} BAR resource file(s) under {}",
            resources.len(),
            device_dir.display()
        );

        Ok(Self {
            addr,
            driver_link: device_dir.join("driver"),
            unbind_file: device_dir.join("driver/unbind"),
            override_file: device_dir.join("driver_override"),
            probe_file: root.join("drivers_probe"),
            config_file: device_dir.join("config"),
            device_dir,
            resources,
        })
    }

    /// The device's address.
    #[must_use]
    pub fn addr(&self) -> PciAddress {
        self.addr
    }

    /// The device's sysfs directory.
    #[must_use]
    pub fn device_dir(&self) -> &Path {
        &self.device_dir
    }

    /// The `driver` symlink (present only while a driver is bound).
    #[must_use]
    pub fn driver_link(&self) -> &Path {
        &self.driver_link
    }

    /// The `driver/unbind` control file.
    #[must_use]
    pub fn unbind_file(&self) -> &Path {
        &self.unbind_file
    }

    /// The `driver_override` control file.
    #[must_use]
    pub fn override_file(&self) -> &Path {
        &self.override_file
    }

    /// The bus-wide `drivers_probe` control file.
    #[must_use]
    pub fn probe_file(&self) -> &Path {
        &self.probe_file
    }

    /// The configuration-space file.
    #[must_use]
    pub fn config_file(&self) -> &Path {
        &self.config_file
    }

    /// All BAR resource files the device exposes, in index order.
    #[must_use]
    pub fn resources(&self) -> &[ResourcePaths] {
        &self.resources
    }

    /// The resource file for one BAR index, if the device implements it.
    #[must_use]
    pub fn resource(&self, index: usize) -> Option<&ResourcePaths> {
        self.resources.iter().find(|r| r.index == index)
    }
}
