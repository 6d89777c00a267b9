// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Host PCI address model.
//!
//! A [`PciAddress`] identifies a single PCI function on the host by its
//! domain:bus:slot.function tuple, with an optional multi-function marker and
//! optional zPCI (s390x) extended addressing. The canonical string form is
//! the fixed-width `DDDD:BB:SS.F` format used throughout sysfs, and
//! `to_string` / `parse` round-trip exactly for every valid address.

use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Highest slot (device) number encodable in a PCI requester ID.
pub const MAX_SLOT: u8 = 0x1f;
/// Highest function number encodable in a PCI requester ID.
pub const MAX_FUNCTION: u8 = 7;

/// Failure to parse or validate a [`PciAddress`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AddressParseError {
    /// The string is not in `DDDD:BB:SS.F` form.
    #[error("malformed PCI address '{0}', expected DDDD:BB:SS.F")]
    Malformed(String),
    /// A parsed field exceeds its hardware range.
    #[error("PCI address {0} out of range: slot <= 0x1f, function <= 0x7")]
    OutOfRange(String),
}

/// zPCI extended addressing, used for PCI devices on s390x hosts.
///
/// Both identifiers are optional; a device description may carry either, both,
/// or neither. Carrying exactly one is an incomplete (unusable) description.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ZpciAddress {
    /// User-defined identifier, 16 bits.
    pub uid: Option<u16>,
    /// Function identifier, 32 bits.
    pub fid: Option<u32>,
}

impl ZpciAddress {
    /// Returns true if exactly one of uid/fid is set.
    pub fn is_incomplete(&self) -> bool {
        self.uid.is_some() != self.fid.is_some()
    }

    /// Returns true if at least one of uid/fid is set.
    pub fn is_present(&self) -> bool {
        self.uid.is_some() || self.fid.is_some()
    }
}

/// A PCI domain:bus:slot.function address.
///
/// Equality, ordering and hashing are structural over all fields, including
/// the multi-function marker and the zPCI extension.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PciAddress {
    /// PCI domain (segment), 0-65535.
    pub domain: u16,
    /// Bus number.
    pub bus: u8,
    /// Slot (device) number, 0-31.
    pub slot: u8,
    /// Function number, 0-7.
    pub function: u8,
    /// Whether the device was flagged as part of a multi-function device.
    /// `None` means unspecified.
    pub multifunction: Option<bool>,
    /// zPCI extended addressing.
    pub zpci: ZpciAddress,
}

impl PciAddress {
    /// Creates an address from the requester ID tuple, leaving the
    /// multi-function marker unspecified and no zPCI extension.
    pub fn new(
        domain: u16,
        bus: u8,
        slot: u8,
        function: u8,
    ) -> Result<Self, AddressParseError> {
        let addr = Self {
            domain,
            bus,
            slot,
            function,
            multifunction: None,
            zpci: ZpciAddress::default(),
        };
        addr.validate()?;
        Ok(addr)
    }

    /// Checks that all fields are within their hardware ranges.
    ///
    /// Domain and bus are range-constrained by their types; only slot and
    /// function can be out of range.
    pub fn validate(&self) -> Result<(), AddressParseError> {
        if self.slot > MAX_SLOT || self.function > MAX_FUNCTION {
            return Err(AddressParseError::OutOfRange(format!(
                "{:04x}:{:02x}:{:02x}.{:x}",
                self.domain, self.bus, self.slot, self.function
            )));
        }
        Ok(())
    }

    /// Non-reporting form of [`Self::validate`].
    pub fn is_valid(&self) -> bool {
        self.validate().is_ok()
    }

    /// Returns true if every numeric field is zero and neither the
    /// multi-function marker nor any zPCI identifier is set.
    ///
    /// Note that the all-zero tuple `0000:00:00.0` is itself a valid address
    /// (typically the host bridge); emptiness is a distinct concept used to
    /// detect "no address was ever filled in".
    pub fn is_empty(&self) -> bool {
        self.domain == 0
            && self.bus == 0
            && self.slot == 0
            && self.function == 0
            && self.multifunction.is_none()
            && !self.zpci.is_present()
    }
}

impl fmt::Display for PciAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04x}:{:02x}:{:02x}.{:x}",
            self.domain, self.bus, self.slot, self.function
        )
    }
}

impl FromStr for PciAddress {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || AddressParseError::Malformed(s.to_owned());

        let (domain, rest) = s.split_once(':').ok_or_else(malformed)?;
        let (bus, rest) = rest.split_once(':').ok_or_else(malformed)?;
        let (slot, function) = rest.split_once('.').ok_or_else(malformed)?;

        for field in [domain, bus, slot, function] {
            if field.is_empty() || field.chars().any(|c| !c.is_ascii_hexdigit()) {
                return Err(malformed());
            }
        }
        // Reject fields wider than their canonical print width so that
        // parse(to_string(a)) is an exact inverse.
        if domain.len() > 4 || bus.len() > 2 || slot.len() > 2 || function.len() > 1 {
            return Err(malformed());
        }

        let addr = Self {
            domain: u16::from_str_radix(domain, 16).map_err(|_| malformed())?,
            bus: u8::from_str_radix(bus, 16).map_err(|_| malformed())?,
            slot: u8::from_str_radix(slot, 16).map_err(|_| malformed())?,
            function: u8::from_str_radix(function, 16).map_err(|_| malformed())?,
            multifunction: None,
            zpci: ZpciAddress::default(),
        };
        addr.validate()?;
        Ok(addr)
    }
}
