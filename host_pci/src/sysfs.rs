// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Read-only discovery of host PCI topology from sysfs.
//!
//! Every query re-derives its answer from the kernel's sysfs tree rather than
//! consulting a cache: sysfs is the sole source of truth, and hot-plug or
//! other management tools may change it between calls. Nothing in this module
//! mutates kernel state.

use crate::cfg_space::ConfigSpace;
use crate::error::{PciError, Result};
use crate::spec::caps::ext;
use crate::spec::caps::id;
use crate::spec::caps::pci_express::{
    FLAGS, FLAGS_TYPE_MASK, LNKCAP, LNKSTA, LinkCapabilities, LinkStatus, TYPE_DOWNSTREAM_PORT,
};
use crate::spec::cfg_space::{HEADER_TYPE, SECONDARY_BUS};
use crate::spec::{HeaderType, PcieDeviceInfo, PcieLink, PcieLinkSpeed};
use pci_addr::PciAddress;
use std::io;
use std::path::{Path, PathBuf};

/// Handle to a host's PCI sysfs tree.
///
/// The root defaults to `/sys/bus/pci` and can be overridden, which both
/// supports containerized hosts with relocated sysfs mounts and lets tests
/// run against a synthetic tree.
#[derive(Debug, Clone)]
pub struct SysfsContext {
    root: PathBuf,
}

impl Default for SysfsContext {
    fn default() -> Self {
        Self::with_root("/sys/bus/pci")
    }
}

impl SysfsContext {
    /// Creates a context over the running kernel's `/sys/bus/pci`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a context over an alternate sysfs PCI root.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The sysfs directory for a device address.
    pub fn device_dir(&self, addr: &PciAddress) -> PathBuf {
        self.root.join("devices").join(addr.to_string())
    }

    /// The device's binary config space file.
    pub fn device_config_path(&self, addr: &PciAddress) -> PathBuf {
        self.device_dir(addr).join("config")
    }

    /// The sysfs directory for a named driver.
    pub fn driver_dir(&self, name: &str) -> PathBuf {
        self.root.join("drivers").join(name)
    }

    /// The bus-level `drivers_probe` trigger file.
    pub fn drivers_probe_path(&self) -> PathBuf {
        self.root.join("drivers_probe")
    }

    /// Whether a device with this address currently exists on the host.
    pub fn device_exists(&self, addr: &PciAddress) -> bool {
        self.device_dir(addr).exists()
    }

    /// Addresses of every PCI device on the host, in sorted order.
    ///
    /// Entries that do not parse as PCI addresses are skipped.
    pub fn devices(&self) -> Result<Vec<PciAddress>> {
        let dir = self.root.join("devices");
        let entries = fs_err::read_dir(&dir).map_err(|err| PciError::io("readdir", &dir, err))?;
        let mut addrs = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| PciError::io("readdir", &dir, err))?;
            if let Ok(addr) = entry.file_name().to_string_lossy().parse::<PciAddress>() {
                addrs.push(addr);
            }
        }
        addrs.sort();
        Ok(addrs)
    }

    /// The type 1 bridge whose secondary bus is the device's bus, if any.
    ///
    /// Devices on the root bus have no parent bridge. Siblings whose config
    /// space cannot be read are skipped rather than failing the search.
    pub fn parent_bridge(&self, addr: &PciAddress) -> Result<Option<PciAddress>> {
        if addr.bus == 0 {
            return Ok(None);
        }
        for candidate in self.devices()? {
            if candidate == *addr || candidate.domain != addr.domain {
                continue;
            }
            let Ok(cfg) = ConfigSpace::open(self.device_config_path(&candidate)) else {
                continue;
            };
            let Ok(header) = cfg.read_u8(HEADER_TYPE) else {
                continue;
            };
            if HeaderType::from_register(header) != Some(HeaderType::PciBridge) {
                continue;
            }
            if cfg.read_u8(SECONDARY_BUS).unwrap_or(0) == addr.bus {
                return Ok(Some(candidate));
            }
        }
        Ok(None)
    }

    /// Whether the device can be safely assigned to a guest.
    ///
    /// Every switch downstream port between the device and the root must
    /// have its ACS isolation controls enabled, or peer-to-peer traffic
    /// from the device could bypass the IOMMU and reach a host-owned
    /// sibling.
    pub fn is_assignable(&self, addr: &PciAddress) -> Result<bool> {
        let mut current = *addr;
        // Bus numbers bound the depth of any valid bridge chain.
        for _ in 0..=u8::MAX {
            let Some(parent) = self.parent_bridge(&current)? else {
                return Ok(true);
            };
            if self.downstream_port_lacks_acs(&parent)? {
                tracing::warn!(
                    device = %addr,
                    port = %parent,
                    "downstream port lacks ACS isolation"
                );
                return Ok(false);
            }
            current = parent;
        }
        Ok(true)
    }

    fn downstream_port_lacks_acs(&self, addr: &PciAddress) -> Result<bool> {
        let cfg = ConfigSpace::open(self.device_config_path(addr))?;
        let Some(pos) = cfg.find_capability(id::PCI_EXPRESS)? else {
            // Conventional bridges have no ACS to check.
            return Ok(false);
        };
        if (cfg.read_u16(pos + FLAGS)? & FLAGS_TYPE_MASK) >> 4 != TYPE_DOWNSTREAM_PORT {
            return Ok(false);
        }
        let Some(acs) = cfg.find_ext_capability(ext::id::ACS)? else {
            return Ok(true);
        };
        let ctrl = cfg.read_u16(acs + ext::acs::ACS_CTRL)?;
        Ok(ctrl & ext::acs::ACS_CTRL_ISOLATION != ext::acs::ACS_CTRL_ISOLATION)
    }

    /// Resolves the physical function backing an SR-IOV virtual function.
    ///
    /// Fails with [`PciError::NotFound`] if the device at `vf_path` is not a
    /// virtual function.
    pub fn physical_function(&self, vf_path: &Path) -> Result<PciAddress> {
        let link = vf_path.join("physfn");
        match fs_err::read_link(&link) {
            Ok(target) => address_from_link_target(&target),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Err(PciError::NotFound {
                what: "SR-IOV physical function",
                device: vf_path.display().to_string(),
            }),
            Err(err) => Err(PciError::io("readlink", link, err)),
        }
    }

    /// Whether the device at this sysfs path is an SR-IOV virtual function.
    pub fn is_virtual_function(&self, dev_path: &Path) -> bool {
        dev_path.join("physfn").symlink_metadata().is_ok()
    }

    /// Enumerates the virtual functions currently enabled on a physical
    /// function, in `virtfn` index order, along with the device's VF
    /// capacity.
    ///
    /// The capacity (`sriov_totalvfs`) may exceed the number of VFs
    /// currently enabled; when the file is absent the enabled count is
    /// reported instead.
    pub fn virtual_functions(&self, pf_path: &Path) -> Result<(Vec<PciAddress>, u32)> {
        let mut vfs = Vec::new();
        loop {
            let link = pf_path.join(format!("virtfn{}", vfs.len()));
            match fs_err::read_link(&link) {
                Ok(target) => vfs.push(address_from_link_target(&target)?),
                Err(err) if err.kind() == io::ErrorKind::NotFound => break,
                Err(err) => return Err(PciError::io("readlink", link, err)),
            }
        }

        let total_path = pf_path.join("sriov_totalvfs");
        let max = match fs_err::read_to_string(&total_path) {
            Ok(s) => s
                .trim()
                .parse()
                .map_err(|_| PciError::Validation(format!("malformed {}", total_path.display())))?,
            Err(err) if err.kind() == io::ErrorKind::NotFound => vfs.len() as u32,
            Err(err) => return Err(PciError::io("read", total_path, err)),
        };
        Ok((vfs, max))
    }

    /// 0-based position of a VF within its PF's enumeration order,
    /// consistent with [`Self::virtual_functions`].
    pub fn virtual_function_index(&self, pf_path: &Path, vf_path: &Path) -> Result<usize> {
        // Confirms vf_path really is a VF before searching the PF's table.
        self.physical_function(vf_path)?;
        let vf_addr = address_from_device_path(vf_path)?;
        let (vfs, _) = self.virtual_functions(pf_path)?;
        vfs.iter()
            .position(|a| *a == vf_addr)
            .ok_or_else(|| PciError::NotFound {
                what: "virtual function index",
                device: vf_path.display().to_string(),
            })
    }

    /// Resolves a virtual function to its physical function's
    /// `pf_netdev_idx`-th host interface name and the VF's 0-based index
    /// within the PF's enumeration.
    ///
    /// Callers use the pair to configure the VF's representor on the PF.
    pub fn virtual_function_info(
        &self,
        vf_path: &Path,
        pf_netdev_idx: usize,
    ) -> Result<(String, usize)> {
        let pf = self.physical_function(vf_path)?;
        let pf_path = self.device_dir(&pf);
        let idx = self.virtual_function_index(&pf_path, vf_path)?;
        let netdev = self.net_name(&pf_path, pf_netdev_idx, None)?;
        Ok((netdev, idx))
    }

    /// Resolves a PCI network device to a host interface name.
    ///
    /// When `phys_port_id` is given, the interface whose `phys_port_id`
    /// matches is returned. Otherwise the `idx`-th interface whose
    /// `phys_port_name` matches the switchdev PF format (`p<N>` or
    /// `p<N>s<M>`) is returned, falling back to the plain `idx`-th interface
    /// when no name matches; switchdev-mode SR-IOV NICs do not name their
    /// interfaces positionally.
    pub fn net_name(
        &self,
        dev_path: &Path,
        idx: usize,
        phys_port_id: Option<&str>,
    ) -> Result<String> {
        let net_dir = dev_path.join("net");
        let mut names = Vec::new();
        let entries = fs_err::read_dir(&net_dir)
            .map_err(|err| PciError::io("readdir", &net_dir, err))?;
        for entry in entries {
            let entry = entry.map_err(|err| PciError::io("readdir", &net_dir, err))?;
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort();

        let not_found = || PciError::NotFound {
            what: "network interface name",
            device: dev_path.display().to_string(),
        };

        if let Some(want_id) = phys_port_id {
            for name in &names {
                if let Some(this_id) = read_optional(&net_dir.join(name).join("phys_port_id"))? {
                    if this_id == want_id {
                        return Ok(name.clone());
                    }
                }
            }
            return Err(not_found());
        }

        let mut switchdev = Vec::new();
        for name in &names {
            if let Some(port_name) = read_optional(&net_dir.join(name).join("phys_port_name"))? {
                if is_switchdev_pf_name(&port_name) {
                    switchdev.push(name.clone());
                }
            }
        }
        if !switchdev.is_empty() {
            return switchdev.into_iter().nth(idx).ok_or_else(not_found);
        }
        names.into_iter().nth(idx).ok_or_else(not_found)
    }

    /// The device's IOMMU group number, or `None` when the host reports no
    /// IOMMU grouping for it (which is not an error).
    pub fn iommu_group_num(&self, addr: &PciAddress) -> Result<Option<u32>> {
        let link = self.device_dir(addr).join("iommu_group");
        let target = match fs_err::read_link(&link) {
            Ok(target) => target,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(PciError::io("readlink", link, err)),
        };
        let group = target
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| n.parse().ok())
            .ok_or_else(|| {
                PciError::Validation(format!(
                    "malformed iommu_group link for device {addr}: {}",
                    target.display()
                ))
            })?;
        Ok(Some(group))
    }

    /// All addresses sharing the device's IOMMU group, in sorted order.
    ///
    /// The result always contains `addr` itself; for a device without a
    /// sysfs-reported group it is the singleton set. Devices sharing a group
    /// cannot be DMA-isolated from each other, so any operation affecting
    /// isolation must consider the whole set.
    pub fn iommu_group_addresses(&self, addr: &PciAddress) -> Result<Vec<PciAddress>> {
        let group_devs = self.device_dir(addr).join("iommu_group").join("devices");
        let entries = match fs_err::read_dir(&group_devs) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(vec![*addr]),
            Err(err) => return Err(PciError::io("readdir", group_devs, err)),
        };

        let mut addrs = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| PciError::io("readdir", &group_devs, err))?;
            addrs.push(entry.file_name().to_string_lossy().parse::<PciAddress>()?);
        }
        if !addrs.contains(addr) {
            addrs.push(*addr);
        }
        addrs.sort();
        Ok(addrs)
    }

    /// Invokes `actor` once per address sharing `addr`'s IOMMU group
    /// (including `addr` itself), aborting on the first failure.
    pub fn for_each_group_address(
        &self,
        addr: &PciAddress,
        mut actor: impl FnMut(&PciAddress) -> Result<()>,
    ) -> Result<()> {
        for member in self.iommu_group_addresses(addr)? {
            actor(&member)?;
        }
        Ok(())
    }

    /// Parses the device's config space header type.
    pub fn header_type(&self, addr: &PciAddress) -> Result<HeaderType> {
        let cfg = ConfigSpace::open(self.device_config_path(addr))?;
        let raw = cfg.read_u8(HEADER_TYPE)?;
        HeaderType::from_register(raw)
            .ok_or_else(|| PciError::Validation(format!("unknown PCI header type {raw:#x} on {addr}")))
    }

    /// Whether the device's config header type register has the
    /// multi-function bit set.
    pub fn is_multifunction(&self, addr: &PciAddress) -> Result<bool> {
        let cfg = ConfigSpace::open(self.device_config_path(addr))?;
        Ok(cfg.read_u8(HEADER_TYPE)? & crate::spec::cfg_space::HEADER_TYPE_MULTI != 0)
    }

    /// Whether the device carries a PCI Express capability.
    pub fn is_pci_express(&self, addr: &PciAddress) -> Result<bool> {
        let cfg = ConfigSpace::open(self.device_config_path(addr))?;
        Ok(cfg.find_capability(id::PCI_EXPRESS)?.is_some())
    }

    /// Whether the device's PCI Express capability reports a link.
    pub fn has_pci_express_link(&self, addr: &PciAddress) -> Result<bool> {
        Ok(self
            .link_cap_sta(addr)?
            .is_some_and(|info| info.link_cap.is_some()))
    }

    /// Reads the device's PCIe link capability and negotiated link status.
    ///
    /// Returns `None` for conventional PCI devices.
    pub fn link_cap_sta(&self, addr: &PciAddress) -> Result<Option<PcieDeviceInfo>> {
        let cfg = ConfigSpace::open(self.device_config_path(addr))?;
        let Some(pos) = cfg.find_capability(id::PCI_EXPRESS)? else {
            return Ok(None);
        };

        let lnkcap = LinkCapabilities::from_bits(cfg.read_u32(pos + LNKCAP)?);
        let lnksta = LinkStatus::from_bits(cfg.read_u16(pos + LNKSTA)?);
        let link_cap = (lnkcap.into_bits() != 0).then(|| PcieLink {
            port: lnkcap.port_number(),
            speed: PcieLinkSpeed::from_encoding(lnkcap.max_link_speed()),
            width: lnkcap.max_link_width(),
        });
        let link_sta = (lnksta.into_bits() != 0).then(|| PcieLink {
            port: 0,
            speed: PcieLinkSpeed::from_encoding(lnksta.current_link_speed()),
            width: lnksta.negotiated_link_width(),
        });
        Ok(Some(PcieDeviceInfo { link_cap, link_sta }))
    }
}

/// Parses a device address out of a sysfs device symlink target
/// (`.../0000:03:00.0`).
fn address_from_link_target(target: &Path) -> Result<PciAddress> {
    address_from_device_path(target)
}

/// Parses a device address from the final component of a sysfs device path.
pub fn address_from_device_path(path: &Path) -> Result<PciAddress> {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| PciError::Validation(format!("no device name in {}", path.display())))?;
    Ok(name.parse()?)
}

/// Reads and trims a single-value sysfs attribute, mapping a missing file to
/// `None`.
fn read_optional(path: &Path) -> Result<Option<String>> {
    match fs_err::read_to_string(path) {
        Ok(s) => Ok(Some(s.trim_end().to_owned())),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(PciError::io("read", path, err)),
    }
}

/// Matches the switchdev-mode format of a PF's `phys_port_name`: `p<N>` or
/// `p<N>s<M>`. The value is read from sysfs, so trailing whitespace has
/// already been trimmed by the caller.
fn is_switchdev_pf_name(name: &str) -> bool {
    let Some(rest) = name.strip_prefix('p') else {
        return false;
    };
    let digits = rest.chars().take_while(|c| c.is_ascii_digit()).count();
    if digits == 0 {
        return false;
    }
    let rest = &rest[digits..];
    if rest.is_empty() {
        return true;
    }
    let Some(sub) = rest.strip_prefix('s') else {
        return false;
    };
    !sub.is_empty() && sub.chars().all(|c| c.is_ascii_digit())
}
