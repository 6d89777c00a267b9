// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Host PCI device management for passthrough.
//!
//! This crate discovers PCI devices through the Linux sysfs tree, moves them
//! between host drivers and passthrough stub drivers (`vfio-pci`, Xen's
//! `pciback`), resets them, and tracks which devices are assigned to guests.
//! [`PciLifecycle`] is the main entry point: it coordinates detach, reattach,
//! and reset across [`DeviceRegistry`] pools while honoring IOMMU group
//! isolation boundaries.

pub mod cfg_space;
pub mod device;
pub mod error;
pub mod lifecycle;
pub mod registry;
pub mod reset;
pub mod spec;
pub mod sysfs;
#[cfg(test)]
mod testutil;

pub use device::PciDevice;
pub use device::StubDriver;
pub use error::PciError;
pub use error::Result;
pub use lifecycle::PciLifecycle;
pub use pci_addr::PciAddress;
pub use registry::DeviceRegistry;
pub use sysfs::SysfsContext;
