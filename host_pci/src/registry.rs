// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Address-keyed device collections.
//!
//! A registry owns its devices for its lifetime; `steal` transfers ownership
//! of a device back to the caller. Two registries conventionally represent
//! the "active" (assigned to a guest) and "inactive" (available) pools, and
//! the lifecycle operations maintain the invariant that an address lives in
//! exactly one of the two.

use crate::device::PciDevice;
use crate::error::{PciError, Result};
use parking_lot::Mutex;
use pci_addr::PciAddress;

/// An ordered set of devices, keyed by address.
///
/// Insertion order is preserved and addresses are unique. Interior locking
/// makes the registry shareable between threads; individual operations are
/// atomic, while multi-step lifecycle sequences are serialized by the
/// coordinator's per-group locks.
#[derive(Default)]
pub struct DeviceRegistry {
    devices: Mutex<Vec<PciDevice>>,
}

impl DeviceRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a device, taking ownership. Fails with [`PciError::Conflict`]
    /// if a device with the same address is already present.
    pub fn add(&self, dev: PciDevice) -> Result<()> {
        let mut devices = self.devices.lock();
        if devices.iter().any(|d| d.address() == dev.address()) {
            return Err(PciError::Conflict {
                device: dev.name().to_owned(),
            });
        }
        devices.push(dev);
        Ok(())
    }

    /// Appends a copy of a device the caller keeps.
    pub fn add_copy(&self, dev: &PciDevice) -> Result<()> {
        self.add(dev.clone())
    }

    /// Number of devices in the registry.
    pub fn len(&self) -> usize {
        self.devices.lock().len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.devices.lock().is_empty()
    }

    /// A copy of the device at `idx` in insertion order.
    pub fn get(&self, idx: usize) -> Option<PciDevice> {
        self.devices.lock().get(idx).cloned()
    }

    /// A copy of the device with this address.
    pub fn find(&self, addr: &PciAddress) -> Option<PciDevice> {
        self.devices.lock().iter().find(|d| d.address() == addr).cloned()
    }

    /// The insertion-order position of this address.
    pub fn find_index(&self, addr: &PciAddress) -> Option<usize> {
        self.devices.lock().iter().position(|d| d.address() == addr)
    }

    /// Whether a device with this address is present.
    pub fn contains(&self, addr: &PciAddress) -> bool {
        self.find_index(addr).is_some()
    }

    /// Removes the device with this address and transfers ownership to the
    /// caller.
    pub fn steal(&self, addr: &PciAddress) -> Option<PciDevice> {
        let mut devices = self.devices.lock();
        let idx = devices.iter().position(|d| d.address() == addr)?;
        Some(devices.remove(idx))
    }

    /// Removes the device at `idx` and transfers ownership to the caller.
    pub fn steal_index(&self, idx: usize) -> Option<PciDevice> {
        let mut devices = self.devices.lock();
        if idx < devices.len() {
            Some(devices.remove(idx))
        } else {
            None
        }
    }

    /// Drops the device with this address. Returns whether one was present.
    pub fn remove(&self, addr: &PciAddress) -> bool {
        self.steal(addr).is_some()
    }

    /// Addresses of all contained devices, in insertion order.
    pub fn addresses(&self) -> Vec<PciAddress> {
        self.devices.lock().iter().map(|d| *d.address()).collect()
    }
}
