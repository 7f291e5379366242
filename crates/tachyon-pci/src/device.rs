//! Device acquisition and the owning handle.
//!
//! [`DeviceHandle::acquire`] runs the claim sequence in strict order: resolve
//! sysfs paths, probe the current driver, unbind it, then open and map each
//! requested BAR. Every resource is recorded in the handle the moment it is
//! created, so a failure at any later step can roll the whole claim back and
//! hand the device back to the kernel. Release walks the same resources in
//! reverse, attempting every step and collecting failures instead of
//! stopping at the first one.

use std::io;
use std::path::PathBuf;

use crate::addr::InvalidAddress;
use crate::bind::{self, BindingState};
use crate::config::{self, PciDeviceInfo};
use crate::error::{AcquireError, AcquireStep, MapError, ReleaseDiagnostic};
use crate::map::{self, Access, MappedRegion};
use crate::sysfs::{DevicePaths, SYSFS_PCI_ROOT};

/// Policy knobs for [`DeviceHandle::acquire`].
#[derive(Debug, Clone)]
pub struct AcquireOptions {
    sysfs_root: PathBuf,
    access: Access,
    prefer_write_combining: bool,
    rebind_on_release: bool,
}

impl Default for AcquireOptions {
    fn default() -> Self {
        Self {
            sysfs_root: PathBuf::from(SYSFS_PCI_ROOT),
            access: Access::ReadWrite,
            prefer_write_combining: false,
            rebind_on_release: true,
        }
    }
}

impl AcquireOptions {
    /// Default options: real sysfs, read-write mappings, no write
    /// combining, rebind on release.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Overrides the sysfs PCI root, e.g. to point tests at a fixture tree.
    #[must_use]
    pub fn sysfs_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.sysfs_root = root.into();
        self
    }

    /// Access mode for all mapped BARs.
    #[must_use]
    pub fn access(mut self, access: Access) -> Self {
        self.access = access;
        self
    }

    /// Maps prefetchable BARs through their write-combining variant when the
    /// device exposes one.
    #[must_use]
    pub fn prefer_write_combining(mut self, yes: bool) -> Self {
        self.prefer_write_combining = yes;
        self
    }

    /// Whether release hands the device back to its previous kernel driver.
    /// Off leaves the device unbound. Rollback after a failed acquisition
    /// always rebinds, since the caller never received a handle.
    #[must_use]
    pub fn rebind_on_release(mut self, yes: bool) -> Self {
        self.rebind_on_release = yes;
        self
    }
}

/// Exclusive owner of one claimed PCI device.
///
/// Holds the device's binding state and every mapped BAR region. Explicit
/// [`release`](Self::release) reports teardown diagnostics; dropping the
/// handle runs the same teardown and logs them instead. Either way each
/// owned resource is released exactly once, in reverse acquisition order.
#[derive(Debug)]
pub struct DeviceHandle {
    paths: DevicePaths,
    state: BindingState,
    previous_driver: Option<String>,
    regions: Vec<MappedRegion>,
    rebind_on_release: bool,
    released: bool,
}

impl DeviceHandle {
    /// Claims the device named by `bdf` and maps the given BAR indices.
    ///
    /// `bdf` must be the kernel's `dddd:bb:dd.f` form; malformed input fails
    /// before any filesystem access. On any failure past the unbind, every
    /// region mapped so far is unmapped and a rebind to the previous driver
    /// is attempted before [`AcquireError::Partial`] is returned; a
    /// half-claimed device is never observable.
    ///
    /// An empty `indices` list is a bind-only claim: the kernel driver is
    /// detached but no BAR is mapped, the handle stays in
    /// [`BindingState::Unbound`], and release (or drop) still restores the
    /// previous driver under the default options. Callers that need register
    /// access must request at least one BAR.
    pub fn acquire(
        bdf: &str,
        indices: &[usize],
        options: AcquireOptions,
    ) -> Result<Self, AcquireError> {
        let addr = bdf
            .parse()
            .map_err(|e: InvalidAddress| AcquireError::Locate(e.into()))?;
        let paths = DevicePaths::locate_under(&options.sysfs_root, addr)?;

        let previous_driver = bind::current_driver(&paths).map_err(AcquireError::Unbind)?;
        bind::unbind(&paths).map_err(AcquireError::Unbind)?;

        let mut handle = Self {
            paths,
            state: BindingState::Unbound,
            previous_driver,
            regions: Vec::with_capacity(indices.len()),
            rebind_on_release: options.rebind_on_release,
            released: false,
        };

        for &index in indices {
            let file = match map::open_resource(
                &handle.paths,
                index,
                options.access,
                options.prefer_write_combining,
            ) {
                Ok(file) => file,
                Err(e) => return Err(handle.roll_back(AcquireStep::OpenResource(index), e)),
            };
            match map::map_resource(file, index, options.access) {
                Ok(region) => handle.regions.push(region),
                Err(e) => return Err(handle.roll_back(AcquireStep::MapResource(index), e)),
            }
        }

        if !handle.regions.is_empty() {
            handle.state = BindingState::BoundToUserDriver;
        }
        log::debug!(
            "{addr}: acquired with {} mapped region(s), previous driver {:?}",
            handle.regions.len(),
            handle.previous_driver
        );
        Ok(handle)
    }

    /// Undoes a partial acquisition and wraps the originating error.
    fn roll_back(mut self, step: AcquireStep, source: MapError) -> AcquireError {
        log::warn!(
            "{}: rolling back acquisition failed at `{step}`: {source}",
            self.paths.addr()
        );
        // The caller never saw a handle, so always try to hand the device
        // back to its previous driver.
        self.rebind_on_release = true;
        for diag in self.teardown() {
            log::warn!("{}: during rollback: {diag}", self.paths.addr());
        }
        AcquireError::Partial { step, source }
    }

    /// Releases every owned resource and reports non-fatal failures.
    ///
    /// Unmaps all regions in reverse acquisition order, then rebinds to the
    /// previous kernel driver when one was recorded and the options asked
    /// for it. Every step is attempted even if earlier ones fail.
    pub fn release(mut self) -> Vec<ReleaseDiagnostic> {
        self.teardown()
    }

    fn teardown(&mut self) -> Vec<ReleaseDiagnostic> {
        if self.released {
            return Vec::new();
        }
        self.released = true;

        let mut diagnostics = Vec::new();
        while let Some(mut region) = self.regions.pop() {
            if let Err(error) = region.unmap() {
                diagnostics.push(ReleaseDiagnostic::Unmap {
                    index: region.index(),
                    error,
                });
            }
        }

        if self.rebind_on_release {
            if let Some(driver) = self.previous_driver.take() {
                if let Err(error) = bind::rebind(&self.paths, &driver) {
                    diagnostics.push(ReleaseDiagnostic::Rebind { driver, error });
                }
            }
        }

        // Re-read rather than assume: the rebind may have failed, or an
        // external actor may have raced us.
        self.state = bind::probe(&self.paths).unwrap_or(BindingState::Unknown);
        diagnostics
    }

    /// The device's sysfs path bundle.
    #[must_use]
    pub fn paths(&self) -> &DevicePaths {
        &self.paths
    }

    /// Binding state as of the last kernel probe.
    #[must_use]
    pub fn state(&self) -> &BindingState {
        &self.state
    }

    /// The kernel driver the device was bound to before acquisition.
    #[must_use]
    pub fn previous_driver(&self) -> Option<&str> {
        self.previous_driver.as_deref()
    }

    /// All mapped regions, in acquisition order.
    #[must_use]
    pub fn regions(&self) -> &[MappedRegion] {
        &self.regions
    }

    /// The mapped region for one BAR index.
    #[must_use]
    pub fn region(&self, index: usize) -> Option<&MappedRegion> {
        self.regions.iter().find(|r| r.index() == index)
    }

    /// Reads the device's configuration-space identification.
    pub fn device_info(&self) -> io::Result<PciDeviceInfo> {
        config::read_device_info(&self.paths)
    }

    /// Grants the device bus mastering so it can initiate DMA.
    pub fn enable_bus_master(&self) -> io::Result<()> {
        config::enable_bus_master(&self.paths)
    }
}

impl Drop for DeviceHandle {
    fn drop(&mut self) {
        for diag in self.teardown() {
            log::warn!("{}: during teardown: {diag}", self.paths.addr());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LocateError;
    use std::fs;
    use std::path::{Path, PathBuf};

    /// Private scratch directory, removed on drop.
    struct TempTree(PathBuf);

    impl TempTree {
        fn new(tag: &str) -> Self {
            let path = std::env::temp_dir().join(format!("tachyon-dev-{tag}-{}", std::process::id()));
            let _ = fs::remove_dir_all(&path);
            fs::create_dir_all(&path).unwrap();
            Self(path)
        }
    }

    impl Drop for TempTree {
        fn drop(&mut self) {
            let _ = fs::remove_dir_all(&self.0);
        }
    }

    const BDF: &str = "0000:00:08.0";
    const DRIVER: &str = "virtio-pci";

    /// Sysfs-shaped fixture: device bound to virtio-pci, 4 KiB `resource<N>`
    /// files for each index in `bars`.
    fn fixture(tree: &TempTree, bars: &[usize]) -> PathBuf {
        let dev = tree.0.join("devices").join(BDF);
        let drv = tree.0.join("drivers").join(DRIVER);
        fs::create_dir_all(&dev).unwrap();
        fs::create_dir_all(&drv).unwrap();
        fs::write(drv.join("unbind"), b"").unwrap();
        fs::write(dev.join("driver_override"), b"").unwrap();
        fs::write(tree.0.join("drivers_probe"), b"").unwrap();
        std::os::unix::fs::symlink(format!("../../drivers/{DRIVER}"), dev.join("driver")).unwrap();
        for &bar in bars {
            fs::write(dev.join(format!("resource{bar}")), vec![0u8; 4096]).unwrap();
        }
        tree.0.clone()
    }

    fn probe_fresh(root: &Path) -> BindingState {
        let paths = DevicePaths::locate_under(root, BDF.parse().unwrap()).unwrap();
        bind::probe(&paths).unwrap()
    }

    #[test]
    fn acquire_then_release_restores_the_kernel_driver() {
        let tree = TempTree::new("roundtrip");
        let root = fixture(&tree, &[0]);
        let before = probe_fresh(&root);

        let handle = DeviceHandle::acquire(
            BDF,
            &[0],
            AcquireOptions::new().sysfs_root(&root),
        )
        .unwrap();
        assert_eq!(*handle.state(), BindingState::BoundToUserDriver);
        assert_eq!(handle.previous_driver(), Some(DRIVER));

        let region = handle.region(0).unwrap();
        assert_eq!(region.len(), 4096);
        region.write32(0, 0xdead_beef);

        // The unbind control received the bus id.
        let unbind = root.join("drivers").join(DRIVER).join("unbind");
        assert_eq!(fs::read_to_string(unbind).unwrap(), BDF);

        let diagnostics = handle.release();
        assert!(diagnostics.is_empty(), "{diagnostics:?}");

        // Rebind went through override + probe, and the kernel-visible state
        // matches what it was before acquisition.
        assert_eq!(
            fs::read_to_string(root.join("devices").join(BDF).join("driver_override")).unwrap(),
            DRIVER
        );
        assert_eq!(fs::read_to_string(root.join("drivers_probe")).unwrap(), BDF);
        assert_eq!(probe_fresh(&root), before);

        // The register write went through the shared mapping.
        let bytes = fs::read(root.join("devices").join(BDF).join("resource0")).unwrap();
        assert_eq!(u32::from_le_bytes(bytes[0..4].try_into().unwrap()), 0xdead_beef);
    }

    #[test]
    fn failed_second_mapping_rolls_the_claim_back() {
        let tree = TempTree::new("partial");
        // resource3 does not exist, so the second step must fail.
        let root = fixture(&tree, &[0]);

        let err = DeviceHandle::acquire(
            BDF,
            &[0, 3],
            AcquireOptions::new().sysfs_root(&root),
        )
        .unwrap_err();
        match err {
            AcquireError::Partial { step, source } => {
                assert_eq!(step, AcquireStep::OpenResource(3));
                assert!(matches!(source, MapError::NotFound { index: 3 }));
            }
            other => panic!("expected Partial, got {other}"),
        }

        // Rollback unbound then rebound: both controls saw the device.
        let dev = root.join("devices").join(BDF);
        assert_eq!(fs::read_to_string(dev.join("driver_override")).unwrap(), DRIVER);
        assert_eq!(fs::read_to_string(root.join("drivers_probe")).unwrap(), BDF);
    }

    #[test]
    fn failure_at_the_map_step_names_it() {
        let tree = TempTree::new("mapstep");
        let root = fixture(&tree, &[0, 1]);
        // Zero-length resource files cannot be mapped.
        fs::write(root.join("devices").join(BDF).join("resource1"), b"").unwrap();

        let err = DeviceHandle::acquire(
            BDF,
            &[0, 1],
            AcquireOptions::new().sysfs_root(&root),
        )
        .unwrap_err();
        match err {
            AcquireError::Partial { step, source } => {
                assert_eq!(step, AcquireStep::MapResource(1));
                assert!(matches!(source, MapError::MappingFailed(_)));
            }
            other => panic!("expected Partial, got {other}"),
        }
    }

    #[test]
    fn malformed_identifier_fails_before_any_filesystem_access() {
        // A root that does not exist: only the parser can reject first.
        let err = DeviceHandle::acquire(
            "00:08.0",
            &[0],
            AcquireOptions::new().sysfs_root("/nonexistent/sysfs"),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            AcquireError::Locate(LocateError::InvalidIdentifier(_))
        ));
    }

    #[test]
    fn unknown_device_is_not_found() {
        let tree = TempTree::new("unknown");
        let root = fixture(&tree, &[0]);

        let err = DeviceHandle::acquire(
            "0000:00:09.0",
            &[0],
            AcquireOptions::new().sysfs_root(&root),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            AcquireError::Locate(LocateError::DeviceNotFound(_))
        ));
    }

    #[test]
    fn release_without_rebind_leaves_the_device_unbound() {
        let tree = TempTree::new("norebind");
        let root = fixture(&tree, &[0]);

        let handle = DeviceHandle::acquire(
            BDF,
            &[0],
            AcquireOptions::new().sysfs_root(&root).rebind_on_release(false),
        )
        .unwrap();
        let diagnostics = handle.release();
        assert!(diagnostics.is_empty(), "{diagnostics:?}");

        // No rebind: the override control was never written.
        let dev = root.join("devices").join(BDF);
        assert_eq!(fs::read_to_string(dev.join("driver_override")).unwrap(), "");
        assert_eq!(fs::read_to_string(root.join("drivers_probe")).unwrap(), "");
    }

    #[test]
    fn acquiring_an_unbound_device_records_no_previous_driver() {
        let tree = TempTree::new("unbound");
        let root = fixture(&tree, &[0]);
        let dev = root.join("devices").join(BDF);
        fs::remove_file(dev.join("driver")).unwrap();

        let handle = DeviceHandle::acquire(
            BDF,
            &[0],
            AcquireOptions::new().sysfs_root(&root),
        )
        .unwrap();
        assert_eq!(handle.previous_driver(), None);

        let diagnostics = handle.release();
        assert!(diagnostics.is_empty(), "{diagnostics:?}");
        // Nothing to rebind to: the device stays unbound.
        assert_eq!(probe_fresh(&root), BindingState::Unbound);
    }

    #[test]
    fn empty_index_list_is_a_bind_only_claim() {
        let tree = TempTree::new("bindonly");
        let root = fixture(&tree, &[0]);

        let handle = DeviceHandle::acquire(
            BDF,
            &[],
            AcquireOptions::new().sysfs_root(&root),
        )
        .unwrap();
        // Nothing mapped, so the handle never enters the user-driver state.
        assert_eq!(*handle.state(), BindingState::Unbound);
        assert!(handle.regions().is_empty());
        assert_eq!(handle.previous_driver(), Some(DRIVER));

        // The unbind went through, and release still restores the driver.
        let unbind = root.join("drivers").join(DRIVER).join("unbind");
        assert_eq!(fs::read_to_string(unbind).unwrap(), BDF);
        let diagnostics = handle.release();
        assert!(diagnostics.is_empty(), "{diagnostics:?}");
        assert_eq!(
            fs::read_to_string(root.join("devices").join(BDF).join("driver_override")).unwrap(),
            DRIVER
        );
    }

    #[test]
    fn drop_runs_the_same_teardown() {
        let tree = TempTree::new("drop");
        let root = fixture(&tree, &[0]);

        {
            let _handle = DeviceHandle::acquire(
                BDF,
                &[0],
                AcquireOptions::new().sysfs_root(&root),
            )
            .unwrap();
        }

        // Scope exit rebound the device.
        assert_eq!(
            fs::read_to_string(root.join("devices").join(BDF).join("driver_override")).unwrap(),
            DRIVER
        );
    }
}
