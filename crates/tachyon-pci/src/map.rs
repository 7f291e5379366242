//! BAR resource mapping.
//!
//! Opens a device's `resource<N>` file and maps it into the process, giving
//! the packet-I/O layer direct access to the device's register space. The
//! kernel exposes these mappings uncached, and x86-64 store ordering keeps
//! register accesses in program order; all accesses go through volatile
//! reads/writes so the compiler cannot reorder or elide them.
//!
//! Target platform is Linux. Closing the resource file descriptor would not
//! tear down an established mapping there, but the open descriptor is what
//! signals the kernel-level BAR claim to other would-be mappers, so the
//! region keeps its `File` until unmap.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::AsRawFd as _;
use std::ptr;

use crate::error::MapError;
use crate::sysfs::DevicePaths;

/// Access mode for a mapped BAR.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// Registers may only be read.
    ReadOnly,
    /// Registers may be read and written.
    ReadWrite,
}

/// Opens the `resource<N>` file for one BAR.
///
/// With `prefer_wc` set, the write-combining variant is used when the device
/// exposes one; WC weakens store ordering, so it is opt-in. Fails with
/// [`MapError::NotFound`] when the device implements no such BAR.
pub fn open_resource(
    paths: &DevicePaths,
    index: usize,
    access: Access,
    prefer_wc: bool,
) -> Result<File, MapError> {
    let resource = paths.resource(index).ok_or(MapError::NotFound { index })?;
    let path = match (&resource.wc, prefer_wc) {
        (Some(wc), true) => wc.as_path(),
        _ => resource.path.as_path(),
    };

    let mut options = OpenOptions::new();
    options.read(true);
    if access == Access::ReadWrite {
        options.write(true);
    }
    options.open(path).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => MapError::NotFound { index },
        io::ErrorKind::PermissionDenied => MapError::PermissionDenied(path.to_owned()),
        _ => MapError::MappingFailed(e),
    })
}

/// Maps an opened resource file over its declared length.
///
/// Ownership of the file moves into the returned region. A kernel refusal
/// because another process already holds the BAR surfaces as
/// [`MapError::Busy`]; other rejections as [`MapError::MappingFailed`].
pub fn map_resource(file: File, index: usize, access: Access) -> Result<MappedRegion, MapError> {
    let len = file
        .metadata()
        .map_err(MapError::MappingFailed)?
        .len()
        .try_into()
        .map_err(|_| {
            MapError::MappingFailed(io::Error::new(
                io::ErrorKind::InvalidInput,
                "resource length exceeds the address space",
            ))
        })?;
    if len == 0 {
        // Port-I/O BARs expose zero-length resource files; they cannot be
        // memory-mapped.
        return Err(MapError::MappingFailed(io::Error::new(
            io::ErrorKind::InvalidInput,
            "resource has no mappable length",
        )));
    }

    let prot = match access {
        Access::ReadOnly => libc::PROT_READ,
        Access::ReadWrite => libc::PROT_READ | libc::PROT_WRITE,
    };
    let base = unsafe {
        libc::mmap(
            ptr::null_mut(),
            len,
            prot,
            libc::MAP_SHARED,
            file.as_raw_fd(),
            0,
        )
    };
    if base == libc::MAP_FAILED {
        let e = io::Error::last_os_error();
        return Err(match e.raw_os_error() {
            Some(libc::EBUSY | libc::EAGAIN) => MapError::Busy { index },
            _ => MapError::MappingFailed(e),
        });
    }

    log::debug!("mapped resource{index}: {len} bytes, {access:?}");
    Ok(MappedRegion {
        base: base.cast(),
        len,
        index,
        access,
        file: Some(file),
    })
}

/// One mapped BAR region, exclusively owned.
///
/// The region is the sole owner of its mapping and backing descriptor; after
/// [`unmap`](Self::unmap) the base pointer is gone and accessors panic.
/// Dropping an unmapped region is a no-op; dropping a still-mapped one
/// unmaps it as a safety net.
#[derive(Debug)]
pub struct MappedRegion {
    base: *mut u8,
    len: usize,
    index: usize,
    access: Access,
    file: Option<File>,
}

impl MappedRegion {
    /// Base address of the mapping.
    ///
    /// # Panics
    ///
    /// Panics if the region was already unmapped.
    #[must_use]
    pub fn as_ptr(&self) -> *mut u8 {
        assert!(!self.base.is_null(), "region resource{} is unmapped", self.index);
        self.base
    }

    /// Mapped length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the region maps zero bytes. Never true for a live mapping.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// BAR index this region maps.
    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }

    /// Access mode the region was mapped with.
    #[must_use]
    pub fn access(&self) -> Access {
        self.access
    }

    /// Whether the mapping is still established.
    #[must_use]
    pub fn is_mapped(&self) -> bool {
        !self.base.is_null()
    }

    /// The backing resource file, held open while the mapping is established.
    #[must_use]
    pub fn file(&self) -> Option<&File> {
        self.file.as_ref()
    }

    /// Reads a 32-bit register at `offset`.
    ///
    /// # Panics
    ///
    /// Panics if the region is unmapped or `offset` is unaligned or out of
    /// bounds.
    #[must_use]
    #[inline]
    pub fn read32(&self, offset: usize) -> u32 {
        self.check_access(offset, Access::ReadOnly);
        unsafe { self.base.add(offset).cast::<u32>().read_volatile() }
    }

    /// Writes a 32-bit register at `offset`.
    ///
    /// # Panics
    ///
    /// Panics if the region is unmapped, read-only, or `offset` is unaligned
    /// or out of bounds.
    #[inline]
    pub fn write32(&self, offset: usize, value: u32) {
        self.check_access(offset, Access::ReadWrite);
        unsafe { self.base.add(offset).cast::<u32>().write_volatile(value) };
    }

    fn check_access(&self, offset: usize, needed: Access) {
        assert!(!self.base.is_null(), "region resource{} is unmapped", self.index);
        // Checked add: a wrapping `offset + 4` near usize::MAX would pass a
        // naive comparison and turn the access into out-of-bounds UB.
        assert!(
            offset % 4 == 0
                && offset
                    .checked_add(4)
                    .is_some_and(|end| end <= self.len),
            "register offset {offset:#x} outside resource{} ({} bytes)",
            self.index,
            self.len
        );
        assert!(
            needed == Access::ReadOnly || self.access == Access::ReadWrite,
            "write to read-only resource{}",
            self.index
        );
    }

    /// Releases the mapping and the backing descriptor.
    ///
    /// Idempotent: unmapping an already-unmapped region is a no-op. The
    /// descriptor is released even if the unmap itself fails, since the
    /// claim is gone either way.
    pub fn unmap(&mut self) -> Result<(), MapError> {
        if self.base.is_null() {
            return Ok(());
        }
        let rc = unsafe { libc::munmap(self.base.cast(), self.len) };
        self.base = ptr::null_mut();
        self.file = None;
        if rc != 0 {
            return Err(MapError::MappingFailed(io::Error::last_os_error()));
        }
        log::debug!("unmapped resource{}", self.index);
        Ok(())
    }
}

impl Drop for MappedRegion {
    fn drop(&mut self) {
        if let Err(e) = self.unmap() {
            log::warn!("leaking mapping of resource{}: {e}", self.index);
        }
    }
}
