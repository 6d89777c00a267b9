// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Host PCI device model and driver binding control.
//!
//! A [`PciDevice`] caches only immutable facts queried at construction
//! (header type, PCIe link info). Binding state is deliberately never
//! cached: the `driver` symlink is re-read from sysfs on every query, so the
//! answer stays correct across hot-plug and interference from other
//! management tools.

use crate::error::{PciError, Result};
use crate::spec::{HeaderType, PcieDeviceInfo};
use crate::sysfs::SysfsContext;
use pci_addr::PciAddress;
use std::io;
use std::path::{Path, PathBuf};

/// Host drivers that claim a device only to hand it to a guest.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub enum StubDriver {
    /// No stub driver configured; the device cannot be detached in managed
    /// mode.
    #[default]
    None,
    /// Xen's `pciback`.
    Xen,
    /// `vfio-pci`.
    Vfio,
}

impl StubDriver {
    /// The kernel driver name, or `None` when no stub is configured.
    pub fn driver_name(&self) -> Option<&'static str> {
        match self {
            StubDriver::None => None,
            StubDriver::Xen => Some("pciback"),
            StubDriver::Vfio => Some("vfio-pci"),
        }
    }
}

/// A host PCI device and its passthrough bookkeeping.
#[derive(Debug, Clone)]
pub struct PciDevice {
    ctx: SysfsContext,
    address: PciAddress,
    name: String,
    config_path: PathBuf,
    header_type: HeaderType,
    multifunction: bool,
    pcie_capable: bool,
    pcie: Option<PcieDeviceInfo>,

    managed: bool,
    stub_driver: StubDriver,
    used_by: Option<(String, String)>,
    unbind_from_stub: bool,
    remove_slot: bool,
    reprobe: bool,
    allow_pm_reset: bool,
}

impl PciDevice {
    /// Constructs a device from its address, querying sysfs once for header
    /// type and PCIe link facts.
    pub fn new(ctx: &SysfsContext, address: PciAddress) -> Result<Self> {
        address.validate()?;
        let name = address.to_string();
        if !ctx.device_exists(&address) {
            return Err(PciError::NotFound {
                what: "device",
                device: name,
            });
        }

        let header_type = ctx.header_type(&address)?;
        // Kept out of the address: sysfs-derived facts must not change the
        // key callers use for registry lookups.
        let multifunction = ctx.is_multifunction(&address)?;
        let pcie = ctx.link_cap_sta(&address)?;

        Ok(Self {
            ctx: ctx.clone(),
            config_path: ctx.device_config_path(&address),
            name: address.to_string(),
            address,
            header_type,
            multifunction,
            pcie_capable: pcie.is_some(),
            pcie,
            managed: false,
            stub_driver: StubDriver::None,
            used_by: None,
            unbind_from_stub: false,
            remove_slot: false,
            reprobe: false,
            allow_pm_reset: false,
        })
    }

    /// The device's address.
    pub fn address(&self) -> &PciAddress {
        &self.address
    }

    /// Canonical `DDDD:BB:SS.F` name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Path of the device's binary config space file.
    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Config space header type.
    pub fn header_type(&self) -> HeaderType {
        self.header_type
    }

    /// Whether the config header marks this as one function of a
    /// multi-function device.
    pub fn multifunction(&self) -> bool {
        self.multifunction
    }

    /// Whether the device carries a PCI Express capability.
    pub fn is_pci_express(&self) -> bool {
        self.pcie_capable
    }

    /// PCIe link capability and status captured at construction, if any.
    pub fn pcie_info(&self) -> Option<&PcieDeviceInfo> {
        self.pcie.as_ref()
    }

    /// Whether this controller performs the full unbind/rebind cycle around
    /// detach/reattach. Unmanaged devices are pre-staged by an external
    /// orchestrator and only validated here.
    pub fn managed(&self) -> bool {
        self.managed
    }

    /// See [`Self::managed`].
    pub fn set_managed(&mut self, managed: bool) {
        self.managed = managed;
    }

    /// The configured passthrough stub driver.
    pub fn stub_driver(&self) -> StubDriver {
        self.stub_driver
    }

    /// Selects which passthrough driver governs bind/unbind for this device.
    pub fn set_stub_driver(&mut self, stub: StubDriver) {
        self.stub_driver = stub;
    }

    /// The recorded claimant as a (driver name, owner name) pair.
    pub fn used_by(&self) -> Option<(&str, &str)> {
        self.used_by
            .as_ref()
            .map(|(drv, owner)| (drv.as_str(), owner.as_str()))
    }

    /// Records the current claimant. Unconditionally overwrites; a change of
    /// claimant is traced since it can indicate a double assignment bug in
    /// the caller.
    pub fn set_used_by(&mut self, driver: impl Into<String>, owner: impl Into<String>) {
        let new = (driver.into(), owner.into());
        if let Some(old) = &self.used_by {
            if *old != new {
                tracing::warn!(
                    device = %self.name,
                    old_driver = %old.0,
                    old_owner = %old.1,
                    new_driver = %new.0,
                    new_owner = %new.1,
                    "replacing recorded claimant"
                );
            }
        }
        self.used_by = Some(new);
    }

    /// Whether reattach must explicitly unbind the device from the stub
    /// driver. Set automatically when this controller bound the stub.
    pub fn unbind_from_stub(&self) -> bool {
        self.unbind_from_stub
    }

    /// See [`Self::unbind_from_stub`].
    pub fn set_unbind_from_stub(&mut self, unbind: bool) {
        self.unbind_from_stub = unbind;
    }

    /// Whether reattach performs full slot removal/reinsertion rather than a
    /// plain driver unbind.
    pub fn remove_slot(&self) -> bool {
        self.remove_slot
    }

    /// See [`Self::remove_slot`].
    pub fn set_remove_slot(&mut self, remove_slot: bool) {
        self.remove_slot = remove_slot;
    }

    /// Whether rebinding triggers kernel driver auto-discovery.
    pub fn reprobe(&self) -> bool {
        self.reprobe
    }

    /// See [`Self::reprobe`].
    pub fn set_reprobe(&mut self, reprobe: bool) {
        self.reprobe = reprobe;
    }

    /// Whether a PM D3hot power cycle may be used to reset this device.
    pub fn allow_pm_reset(&self) -> bool {
        self.allow_pm_reset
    }

    /// See [`Self::allow_pm_reset`].
    pub fn set_allow_pm_reset(&mut self, allow: bool) {
        self.allow_pm_reset = allow;
    }

    fn device_dir(&self) -> PathBuf {
        self.ctx.device_dir(&self.address)
    }

    /// The path and name of the driver currently bound to the device.
    ///
    /// Always re-read from sysfs; fails with [`PciError::NotFound`] when the
    /// device is unbound.
    pub fn driver_path_and_name(&self) -> Result<(PathBuf, String)> {
        let link = self.device_dir().join("driver");
        match fs_err::canonicalize(&link) {
            Ok(path) => {
                let name = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .ok_or_else(|| {
                        PciError::Validation(format!("malformed driver link {}", path.display()))
                    })?
                    .to_owned();
                Ok((path, name))
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Err(PciError::NotFound {
                what: "bound driver",
                device: self.name.clone(),
            }),
            Err(err) => Err(PciError::io("readlink", link, err)),
        }
    }

    fn write_driver_ctl(&self, path: &Path, value: &str, what: &str) -> Result<()> {
        fs_err::write(path, value).map_err(|err| PciError::Driver {
            device: self.name.clone(),
            detail: format!("failed to {what} via {}: {err}", path.display()),
        })
    }

    fn set_driver_override(&self, value: &str) -> Result<()> {
        let path = self.device_dir().join("driver_override");
        fs_err::write(&path, value).map_err(|err| PciError::io("write", path, err))
    }

    fn probe(&self) -> Result<()> {
        self.write_driver_ctl(&self.ctx.drivers_probe_path(), &self.name, "probe drivers")
    }

    /// Requests the currently bound driver release the device. A no-op when
    /// already unbound.
    pub fn unbind(&self) -> Result<()> {
        let (driver_path, driver_name) = match self.driver_path_and_name() {
            Ok(found) => found,
            Err(PciError::NotFound { .. }) => {
                tracing::debug!(device = %self.name, "already unbound");
                return Ok(());
            }
            Err(err) => return Err(err),
        };
        tracing::debug!(device = %self.name, driver = %driver_name, "unbinding");
        self.write_driver_ctl(&driver_path.join("unbind"), &self.name, "unbind")
    }

    /// Requests a driver claim the device. When `reprobe` is not set the
    /// device is left unbound rather than forcing kernel auto-discovery.
    pub fn rebind(&self) -> Result<()> {
        self.set_driver_override("\n")?;
        if !self.reprobe {
            tracing::debug!(device = %self.name, "reprobe not requested, leaving unbound");
            return Ok(());
        }
        tracing::debug!(device = %self.name, "reprobing host driver");
        self.probe()
    }

    /// Unbinds the device from its host driver and binds the configured stub
    /// driver via `driver_override`.
    pub fn bind_to_stub(&mut self) -> Result<()> {
        let stub_name = self.stub_driver.driver_name().ok_or_else(|| {
            PciError::Validation(format!("no stub driver configured for device {}", self.name))
        })?;

        if let Ok((_, current)) = self.driver_path_and_name() {
            if current == stub_name {
                tracing::debug!(device = %self.name, stub = %stub_name, "already bound to stub");
                self.unbind_from_stub = true;
                return Ok(());
            }
        }

        tracing::debug!(device = %self.name, stub = %stub_name, "binding to stub driver");
        self.set_driver_override(stub_name)?;
        if let Err(err) = self.unbind().and_then(|()| self.probe()) {
            // Leave no stale override behind; the original error is the one
            // that matters.
            if let Err(clear_err) = self.set_driver_override("\n") {
                tracing::error!(
                    device = %self.name,
                    error = %clear_err,
                    "failed to clear driver_override while recovering"
                );
            }
            return Err(err);
        }
        self.unbind_from_stub = true;
        Ok(())
    }

    /// Confirms the device is already bound to the configured stub driver,
    /// for unmanaged detach.
    pub fn verify_stub_bound(&self) -> Result<()> {
        let stub_name = self.stub_driver.driver_name().ok_or_else(|| {
            PciError::Validation(format!("no stub driver configured for device {}", self.name))
        })?;
        match self.driver_path_and_name() {
            Ok((_, name)) if name == stub_name => Ok(()),
            Ok((_, name)) => Err(PciError::Driver {
                device: self.name.clone(),
                detail: format!("bound to {name}, expected stub driver {stub_name}"),
            }),
            Err(PciError::NotFound { .. }) => Err(PciError::Driver {
                device: self.name.clone(),
                detail: format!("unbound, expected stub driver {stub_name}"),
            }),
            Err(err) => Err(err),
        }
    }

    /// Releases the device from the stub driver on reattach: unbind (unless
    /// another driver unexpectedly holds the device), optional slot removal,
    /// and clearing `driver_override`.
    pub fn unbind_from_stub_driver(&mut self) -> Result<()> {
        let stub_name = self.stub_driver.driver_name();
        match self.driver_path_and_name() {
            Ok((_, current)) if stub_name.is_some_and(|s| s != current) => {
                // Some other driver claimed the device behind our back; it is
                // not ours to unbind.
                tracing::warn!(
                    device = %self.name,
                    driver = %current,
                    "not bound to the expected stub driver, skipping unbind"
                );
            }
            Ok(_) => self.unbind()?,
            Err(PciError::NotFound { .. }) => {
                tracing::debug!(device = %self.name, "already unbound from stub");
            }
            Err(err) => return Err(err),
        }

        if self.remove_slot {
            if let Some(stub) = stub_name {
                let path = self.ctx.driver_dir(stub).join("remove_slot");
                tracing::debug!(device = %self.name, stub = %stub, "removing slot");
                self.write_driver_ctl(&path, &self.name, "remove slot")?;
            }
        }

        self.set_driver_override("\n")?;
        self.unbind_from_stub = false;
        Ok(())
    }

    /// Best-effort restoration of the host driver binding after a failed
    /// detach: release the stub and let the kernel reprobe.
    pub(crate) fn restore_host_binding(&mut self) -> Result<()> {
        self.unbind()?;
        self.set_driver_override("\n")?;
        self.unbind_from_stub = false;
        self.probe()
    }

    /// Invokes `actor` once for each file associated with access to this
    /// device (config, resources, ROM, reset control), aborting on the first
    /// failure. Callers use this to grant or revoke filesystem permissions
    /// without this crate knowing the sandboxing policy.
    pub fn for_each_file(&self, mut actor: impl FnMut(&Path) -> Result<()>) -> Result<()> {
        let dir = self.device_dir();
        let entries =
            fs_err::read_dir(&dir).map_err(|err| PciError::io("readdir", &dir, err))?;
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| PciError::io("readdir", &dir, err))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name == "config"
                || name == "rom"
                || name == "reset"
                || name.starts_with("resource")
            {
                names.push(name);
            }
        }
        names.sort();
        for name in names {
            actor(&dir.join(name))?;
        }
        Ok(())
    }
}
