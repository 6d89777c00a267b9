// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Error taxonomy for host PCI device management.

use pci_addr::AddressParseError;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, PciError>;

/// Failures surfaced by host PCI topology queries and lifecycle operations.
///
/// Multi-step sequences (detach/reattach) roll back registry membership and,
/// where feasible, binding state before returning one of these; nothing is
/// swallowed.
#[derive(Debug, Error)]
pub enum PciError {
    /// Malformed input or a violated operation precondition.
    #[error("validation failed: {0}")]
    Validation(String),

    /// A sysfs entry, driver, or device that was expected to exist does not.
    #[error("{what} not found for device {device}")]
    NotFound {
        /// What was being looked for.
        what: &'static str,
        /// Canonical name of the device involved.
        device: String,
    },

    /// A sysfs path could not be read or written.
    #[error("failed to {op} {}", path.display())]
    Io {
        /// The filesystem operation that failed.
        op: &'static str,
        /// The path involved.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        err: io::Error,
    },

    /// The kernel rejected an unbind/bind request, or the device is in an
    /// unexpected binding state.
    #[error("driver error on device {device}: {detail}")]
    Driver {
        /// Canonical name of the device involved.
        device: String,
        /// Human-readable description of the rejection.
        detail: String,
    },

    /// The operation would disturb a device outside the caller's authority.
    #[error("device {device} is in use: {detail}")]
    InUse {
        /// Canonical name of the device involved.
        device: String,
        /// Why the device cannot be touched.
        detail: String,
    },

    /// No usable reset method, or the chosen reset primitive failed.
    #[error("unable to reset device {device}: {detail}")]
    Reset {
        /// Canonical name of the device involved.
        device: String,
        /// What went wrong.
        detail: String,
    },

    /// A duplicate address was inserted into a uniqueness-constrained
    /// registry.
    #[error("device {device} is already present in the list")]
    Conflict {
        /// Canonical name of the device involved.
        device: String,
    },
}

impl From<AddressParseError> for PciError {
    fn from(err: AddressParseError) -> Self {
        PciError::Validation(err.to_string())
    }
}

impl PciError {
    pub(crate) fn io(op: &'static str, path: impl Into<PathBuf>, err: io::Error) -> Self {
        PciError::Io {
            op,
            path: path.into(),
            err,
        }
    }
}
