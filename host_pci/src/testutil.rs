// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Synthetic sysfs trees and config-space images for tests.
//!
//! The kernel is not present in unit tests, so state transitions it would
//! perform (flipping a `driver` symlink after a probe write, for example) are
//! emulated explicitly through [`FakeSysfs`] methods.

use crate::spec::cfg_space::{
    CAP_PTR, CONFIG_SPACE_SIZE, EXT_CONFIG_SPACE_SIZE, HEADER_TYPE, HEADER_TYPE_MULTI,
    SECONDARY_BUS, STATUS, STATUS_CAP_LIST,
};
use crate::spec::caps::id;
use crate::sysfs::SysfsContext;
use std::os::unix::fs::symlink;
use std::path::PathBuf;
use tempfile::TempDir;

/// Builds a 256-byte config space image.
pub(crate) struct ConfigBuilder {
    bytes: Vec<u8>,
    // Offset of the byte that links in the next capability: initially the
    // capabilities pointer, then the previous capability's "next" byte.
    link_from: usize,
}

impl ConfigBuilder {
    fn with_header(header: u8) -> Self {
        let mut bytes = vec![0u8; CONFIG_SPACE_SIZE];
        bytes[HEADER_TYPE as usize] = header;
        bytes[STATUS as usize] = STATUS_CAP_LIST as u8;
        Self {
            bytes,
            link_from: CAP_PTR as usize,
        }
    }

    /// A type 00h endpoint with an (empty) capability list.
    pub fn endpoint() -> Self {
        Self::with_header(0x00)
    }

    /// A type 00h endpoint with the multi-function bit set.
    pub fn multifunction_endpoint() -> Self {
        Self::with_header(HEADER_TYPE_MULTI)
    }

    /// A type 01h PCI-to-PCI bridge with the given secondary bus number.
    pub fn bridge(secondary_bus: u8) -> Self {
        let mut b = Self::with_header(0x01);
        b.bytes[SECONDARY_BUS as usize] = secondary_bus;
        b
    }

    /// Drops the capability list entirely (conventional PCI device).
    pub fn without_cap_list(mut self) -> Self {
        self.bytes[STATUS as usize] = 0;
        self.bytes[CAP_PTR as usize] = 0;
        self
    }

    /// Appends a capability at `offset`; `body` is the bytes following the
    /// id/next pair.
    pub fn with_capability(mut self, offset: u16, cap_id: u8, body: &[u8]) -> Self {
        let off = offset as usize;
        self.bytes[self.link_from] = offset as u8;
        self.bytes[off] = cap_id;
        self.bytes[off + 1] = 0;
        self.bytes[off + 2..off + 2 + body.len()].copy_from_slice(body);
        self.link_from = off + 1;
        self
    }

    /// Appends a PCI Express capability at offset 0x60 with the given
    /// DEVCAP, LNKCAP and LNKSTA register values.
    pub fn with_pcie(self, devcap: u32, lnkcap: u32, lnksta: u16) -> Self {
        let mut body = [0u8; 0x3a];
        body[0x02..0x06].copy_from_slice(&devcap.to_le_bytes());
        body[0x0a..0x0e].copy_from_slice(&lnkcap.to_le_bytes());
        body[0x10..0x12].copy_from_slice(&lnksta.to_le_bytes());
        self.with_capability(0x60, id::PCI_EXPRESS, &body)
    }

    /// Appends a Power Management capability at offset 0x40 with the given
    /// control/status register value.
    pub fn with_pm(self, ctrl: u16) -> Self {
        let mut body = [0u8; 6];
        body[2..4].copy_from_slice(&ctrl.to_le_bytes());
        self.with_capability(0x40, id::POWER_MANAGEMENT, &body)
    }

    /// Appends a PCI Express capability at offset 0x60 whose capabilities
    /// register marks the device as a switch downstream port.
    pub fn downstream_port(self) -> Self {
        let flags = crate::spec::caps::pci_express::TYPE_DOWNSTREAM_PORT << 4;
        let mut body = [0u8; 0x3a];
        body[0..2].copy_from_slice(&flags.to_le_bytes());
        self.with_capability(0x60, id::PCI_EXPRESS, &body)
    }

    /// Appends an ACS extended capability at offset 0x100 with the given
    /// control register value, growing the image to extended size.
    pub fn with_acs(mut self, ctrl: u16) -> Self {
        self.bytes.resize(EXT_CONFIG_SPACE_SIZE, 0);
        // Capability id, version 1, no next pointer.
        let header = (1u32 << 16) | u32::from(crate::spec::caps::ext::id::ACS);
        self.bytes[0x100..0x104].copy_from_slice(&header.to_le_bytes());
        self.bytes[0x106..0x108].copy_from_slice(&ctrl.to_le_bytes());
        self
    }

    /// Appends an Advanced Features capability at offset 0x50.
    pub fn with_af(self, flr: bool) -> Self {
        let mut body = [0u8; 6];
        body[0] = 6; // structure length
        body[1] = if flr { crate::spec::caps::advanced_features::AF_CAP_FLR } else { 0 };
        self.with_capability(0x50, id::ADVANCED_FEATURES, &body)
    }

    pub fn build(self) -> Vec<u8> {
        self.bytes
    }
}

/// A throwaway sysfs PCI tree rooted in a temp directory.
pub(crate) struct FakeSysfs {
    dir: TempDir,
}

impl FakeSysfs {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("pci");
        std::fs::create_dir_all(root.join("devices")).unwrap();
        std::fs::create_dir_all(root.join("drivers")).unwrap();
        std::fs::write(root.join("drivers_probe"), "").unwrap();
        std::fs::create_dir_all(dir.path().join("iommu_groups")).unwrap();
        Self { dir }
    }

    pub fn root(&self) -> PathBuf {
        self.dir.path().join("pci")
    }

    pub fn ctx(&self) -> SysfsContext {
        SysfsContext::with_root(self.root())
    }

    fn device_dir(&self, addr: &str) -> PathBuf {
        self.root().join("devices").join(addr)
    }

    /// Creates a device directory with the given config image. Returns the
    /// device's sysfs path.
    pub fn add_device(&self, addr: &str, config: ConfigBuilder) -> PathBuf {
        let dir = self.device_dir(addr);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("config"), config.build()).unwrap();
        std::fs::write(dir.join("driver_override"), "").unwrap();
        dir
    }

    /// Creates a driver directory with its bind/unbind/remove_slot files.
    pub fn add_driver(&self, name: &str) {
        let dir = self.root().join("drivers").join(name);
        std::fs::create_dir_all(&dir).unwrap();
        for f in ["bind", "unbind", "remove_slot"] {
            std::fs::write(dir.join(f), "").unwrap();
        }
    }

    /// Points the device's `driver` symlink at a driver, as the kernel does
    /// after a successful probe.
    pub fn bind(&self, addr: &str, driver: &str) {
        let link = self.device_dir(addr).join("driver");
        let _ = std::fs::remove_file(&link);
        symlink(format!("../../drivers/{driver}"), link).unwrap();
    }

    /// Removes the device's `driver` symlink, as the kernel does on unbind.
    pub fn kernel_unbind(&self, addr: &str) {
        let _ = std::fs::remove_file(self.device_dir(addr).join("driver"));
    }

    /// Places the listed devices into one IOMMU group.
    pub fn set_iommu_group(&self, group: u32, members: &[&str]) {
        let gdir = self.dir.path().join("iommu_groups").join(group.to_string());
        std::fs::create_dir_all(gdir.join("devices")).unwrap();
        for m in members {
            symlink(self.device_dir(m), gdir.join("devices").join(m)).unwrap();
            symlink(&gdir, self.device_dir(m).join("iommu_group")).unwrap();
        }
    }

    /// Wires up an SR-IOV PF/VF pair (both device dirs must already exist).
    pub fn add_vf(&self, pf: &str, idx: u32, vf: &str) {
        symlink(self.device_dir(vf), self.device_dir(pf).join(format!("virtfn{idx}"))).unwrap();
        let physfn = self.device_dir(vf).join("physfn");
        if physfn.symlink_metadata().is_err() {
            symlink(self.device_dir(pf), physfn).unwrap();
        }
    }

    pub fn set_totalvfs(&self, pf: &str, n: u32) {
        std::fs::write(self.device_dir(pf).join("sriov_totalvfs"), n.to_string()).unwrap();
    }

    /// Adds a network interface under the device, with optional switchdev
    /// attributes. Values get a trailing newline, as sysfs would produce.
    pub fn add_net(
        &self,
        addr: &str,
        ifname: &str,
        phys_port_name: Option<&str>,
        phys_port_id: Option<&str>,
    ) {
        let dir = self.device_dir(addr).join("net").join(ifname);
        std::fs::create_dir_all(&dir).unwrap();
        if let Some(name) = phys_port_name {
            std::fs::write(dir.join("phys_port_name"), format!("{name}\n")).unwrap();
        }
        if let Some(id) = phys_port_id {
            std::fs::write(dir.join("phys_port_id"), format!("{id}\n")).unwrap();
        }
    }

    /// Reads a file relative to the sysfs root, for asserting on writes the
    /// code under test performed.
    pub fn read(&self, rel: &str) -> String {
        std::fs::read_to_string(self.root().join(rel)).unwrap()
    }
}
