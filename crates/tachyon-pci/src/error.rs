//! Error types for device claiming.
//!
//! Every fallible step reports a typed error; the only silent successes are
//! the deliberately idempotent ones (unbinding an already-unbound device,
//! unmapping an already-unmapped region).

use std::fmt;
use std::io;
use std::path::PathBuf;

use crate::addr::InvalidAddress;

/// Errors from resolving a device address into sysfs paths.
#[derive(Debug)]
pub enum LocateError {
    /// The identifier string does not match the kernel's `dddd:bb:dd.f` form.
    InvalidIdentifier(InvalidAddress),
    /// The device's sysfs directory does not exist.
    DeviceNotFound(PathBuf),
}

impl fmt::Display for LocateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidIdentifier(e) => write!(f, "{e}"),
            Self::DeviceNotFound(path) => {
                write!(f, "no PCI device at {}", path.display())
            }
        }
    }
}

impl std::error::Error for LocateError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::InvalidIdentifier(e) => Some(e),
            Self::DeviceNotFound(_) => None,
        }
    }
}

impl From<InvalidAddress> for LocateError {
    fn from(e: InvalidAddress) -> Self {
        Self::InvalidIdentifier(e)
    }
}

/// Errors from driver unbind/rebind via sysfs control files.
#[derive(Debug)]
pub enum BindError {
    /// Ambient privilege is insufficient for the sysfs file.
    PermissionDenied(PathBuf),
    /// The kernel accepted fewer bytes than the full control string, i.e. it
    /// rejected part of the write.
    WriteIncomplete {
        /// Bytes the kernel accepted.
        written: usize,
        /// Bytes in the control string.
        expected: usize,
    },
    /// Any other I/O failure.
    Io(io::Error),
}

impl BindError {
    /// Classifies an I/O error from a sysfs control file, keeping the path
    /// for permission failures.
    pub(crate) fn from_io(path: &std::path::Path, e: io::Error) -> Self {
        if e.kind() == io::ErrorKind::PermissionDenied {
            Self::PermissionDenied(path.to_owned())
        } else {
            Self::Io(e)
        }
    }
}

impl fmt::Display for BindError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PermissionDenied(path) => {
                write!(f, "permission denied writing {}", path.display())
            }
            Self::WriteIncomplete { written, expected } => {
                write!(f, "kernel accepted {written} of {expected} bytes")
            }
            Self::Io(e) => write!(f, "driver control I/O error: {e}"),
        }
    }
}

impl std::error::Error for BindError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

/// Errors from opening or memory-mapping a BAR resource file.
#[derive(Debug)]
pub enum MapError {
    /// The device exposes no resource file with the requested index.
    NotFound {
        /// The requested BAR index.
        index: usize,
    },
    /// Ambient privilege is insufficient for the resource file.
    PermissionDenied(PathBuf),
    /// The kernel refused the mapping because another process holds the BAR.
    Busy {
        /// The requested BAR index.
        index: usize,
    },
    /// The mapping primitive rejected the request for any other reason.
    MappingFailed(io::Error),
}

impl fmt::Display for MapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound { index } => write!(f, "device has no resource{index}"),
            Self::PermissionDenied(path) => {
                write!(f, "permission denied opening {}", path.display())
            }
            Self::Busy { index } => {
                write!(f, "resource{index} is claimed by another process")
            }
            Self::MappingFailed(e) => write!(f, "resource mapping failed: {e}"),
        }
    }
}

impl std::error::Error for MapError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::MappingFailed(e) => Some(e),
            _ => None,
        }
    }
}

/// The acquisition step that failed after the device was already unbound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireStep {
    /// Opening `resource<N>`.
    OpenResource(usize),
    /// Memory-mapping `resource<N>`.
    MapResource(usize),
}

impl fmt::Display for AcquireStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OpenResource(i) => write!(f, "open resource{i}"),
            Self::MapResource(i) => write!(f, "map resource{i}"),
        }
    }
}

/// Errors from [`DeviceHandle::acquire`](crate::device::DeviceHandle::acquire).
///
/// `Locate` and `Unbind` fire before the device's state was changed.
/// `Partial` fires after the unbind succeeded; by the time the caller sees
/// it, every region mapped so far has been unmapped and a rebind to the
/// previous driver has been attempted.
#[derive(Debug)]
pub enum AcquireError {
    /// Address parsing or sysfs path resolution failed.
    Locate(LocateError),
    /// Detaching the kernel driver failed.
    Unbind(BindError),
    /// A post-unbind step failed and the claim was rolled back.
    Partial {
        /// The step that failed.
        step: AcquireStep,
        /// The underlying failure.
        source: MapError,
    },
}

impl fmt::Display for AcquireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Locate(e) => write!(f, "{e}"),
            Self::Unbind(e) => write!(f, "failed to unbind kernel driver: {e}"),
            Self::Partial { step, source } => {
                write!(f, "acquisition rolled back at `{step}`: {source}")
            }
        }
    }
}

impl std::error::Error for AcquireError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Locate(e) => Some(e),
            Self::Unbind(e) => Some(e),
            Self::Partial { source, .. } => Some(source),
        }
    }
}

impl From<LocateError> for AcquireError {
    fn from(e: LocateError) -> Self {
        Self::Locate(e)
    }
}

/// A non-fatal failure collected during handle release.
///
/// Release always attempts every remaining teardown step; failures are
/// reported through these instead of aborting the sequence.
#[derive(Debug)]
pub enum ReleaseDiagnostic {
    /// Unmapping one region failed.
    Unmap {
        /// BAR index of the region.
        index: usize,
        /// The underlying failure.
        error: MapError,
    },
    /// Best-effort rebind to the previous kernel driver failed.
    Rebind {
        /// Driver the device was bound to before acquisition.
        driver: String,
        /// The underlying failure.
        error: BindError,
    },
}

impl fmt::Display for ReleaseDiagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unmap { index, error } => {
                write!(f, "failed to unmap resource{index}: {error}")
            }
            Self::Rebind { driver, error } => {
                write!(f, "failed to rebind to `{driver}`: {error}")
            }
        }
    }
}
