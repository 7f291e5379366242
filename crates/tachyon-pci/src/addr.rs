//! PCI device addressing.
//!
//! The kernel names PCI devices in sysfs as `dddd:bb:dd.f` (domain, bus,
//! device, function, fixed-width hexadecimal). Every path this crate touches
//! is derived from such an address.

use std::fmt;
use std::str::FromStr;

/// PCI domain/bus/device/function address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PciAddress {
    /// PCI domain (segment) number.
    pub domain: u16,
    /// Bus number (0-255).
    pub bus: u8,
    /// Device number (0-31).
    pub device: u8,
    /// Function number (0-7).
    pub function: u8,
}

impl PciAddress {
    /// Creates an address, returning `None` if device or function is out of
    /// range.
    #[must_use]
    pub const fn new(domain: u16, bus: u8, device: u8, function: u8) -> Option<Self> {
        if device >= 32 || function >= 8 {
            return None;
        }
        Some(Self {
            domain,
            bus,
            device,
            function,
        })
    }
}

impl fmt::Display for PciAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04x}:{:02x}:{:02x}.{:x}",
            self.domain, self.bus, self.device, self.function
        )
    }
}

/// Error returned when a PCI address string does not match `dddd:bb:dd.f`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidAddress {
    given: String,
}

impl InvalidAddress {
    /// The rejected input string.
    #[must_use]
    pub fn given(&self) -> &str {
        &self.given
    }
}

impl fmt::Display for InvalidAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invalid PCI address `{}`: expected dddd:bb:dd.f (e.g. 0000:00:08.0)",
            self.given
        )
    }
}

impl std::error::Error for InvalidAddress {}

impl FromStr for PciAddress {
    type Err = InvalidAddress;

    /// Parses the exact kernel form: four hex digits, colon, two, colon,
    /// two, dot, one. No shorthand without the domain is accepted.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || InvalidAddress {
            given: s.to_owned(),
        };

        let b = s.as_bytes();
        if b.len() != 12 || b[4] != b':' || b[7] != b':' || b[10] != b'.' {
            return Err(err());
        }
        // `from_str_radix` tolerates a leading sign; the kernel form is hex
        // digits only, so every field byte is checked first.
        const DIGITS: [usize; 9] = [0, 1, 2, 3, 5, 6, 8, 9, 11];
        if !DIGITS.iter().all(|&i| b[i].is_ascii_hexdigit()) {
            return Err(err());
        }

        let domain = u16::from_str_radix(&s[0..4], 16).map_err(|_| err())?;
        let bus = u8::from_str_radix(&s[5..7], 16).map_err(|_| err())?;
        let device = u8::from_str_radix(&s[8..10], 16).map_err(|_| err())?;
        let function = u8::from_str_radix(&s[11..12], 16).map_err(|_| err())?;

        PciAddress::new(domain, bus, device, function).ok_or_else(err)
    }
}
