// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Reset method selection and execution.
//!
//! Resets are electrically disruptive to every device in the IOMMU group, so
//! the orchestrator refuses to run while any other group member is assigned
//! to a guest. Methods are tried strongest-first: a function-level reset
//! affects only the target function, a secondary bus reset disturbs the whole
//! bus behind the parent bridge, and a PM power cycle is only used when the
//! caller explicitly permitted it. Reset never changes driver binding or pool
//! membership.

use crate::cfg_space::ConfigSpace;
use crate::device::PciDevice;
use crate::error::{PciError, Result};
use crate::registry::DeviceRegistry;
use crate::spec::caps::advanced_features as af;
use crate::spec::caps::id;
use crate::spec::caps::pci_express as pe;
use crate::spec::caps::power_management as pm;
use crate::spec::cfg_space::{BRIDGE_CONTROL, BRIDGE_CTL_RESET};
use crate::sysfs::SysfsContext;
use std::thread::sleep;
use std::time::Duration;

/// Settle time after initiating a function level reset.
const FLR_SETTLE: Duration = Duration::from_millis(100);
/// Settle time for each edge of a secondary bus reset.
const SBR_SETTLE: Duration = Duration::from_millis(200);
/// Settle time for each PM power state transition.
const PM_SETTLE: Duration = Duration::from_millis(10);

enum FlrKind {
    /// PCIe function level reset via the device control register at this
    /// capability offset.
    Pcie(u16),
    /// Conventional PCI FLR via the Advanced Features capability.
    Af(u16),
    /// SR-IOV virtual functions always support FLR; the PF driver performs
    /// it when the VF is released, so there is nothing to write here.
    VirtualFunction,
}

/// Resets `dev` using the strongest method it supports.
///
/// Fails with [`PciError::InUse`] if any other member of the device's IOMMU
/// group is present in the active pool, and with [`PciError::Reset`] when no
/// usable method exists or the chosen primitive fails.
pub fn reset_device(ctx: &SysfsContext, dev: &PciDevice, active: &DeviceRegistry) -> Result<()> {
    let group = ctx.iommu_group_addresses(dev.address())?;
    for other in &group {
        if other != dev.address() && active.contains(other) {
            return Err(PciError::InUse {
                device: dev.name().to_owned(),
                detail: format!("IOMMU group sibling {other} is assigned to a guest"),
            });
        }
    }

    // vfio-pci resets the device itself around guest attach/release.
    if let Ok((_, driver)) = dev.driver_path_and_name() {
        if driver == "vfio-pci" {
            tracing::debug!(device = %dev.name(), "bound to vfio-pci, which handles reset");
            return Ok(());
        }
    }

    let cfg = ConfigSpace::open_rw(dev.config_path())?;
    let mut reasons: Vec<String> = Vec::new();

    match detect_flr(ctx, dev, &cfg)? {
        Some(kind) => return execute_flr(dev, &cfg, kind),
        None => reasons.push("no function-level reset support".to_owned()),
    }

    match try_secondary_bus_reset(ctx, dev, &cfg, active)? {
        None => return Ok(()),
        Some(reason) => reasons.push(reason),
    }

    if !dev.allow_pm_reset() {
        reasons.push("power management reset not permitted".to_owned());
    } else {
        match detect_pm_reset(&cfg)? {
            Some(pos) => return execute_pm_reset(dev, &cfg, pos),
            None => reasons.push("no power management reset support".to_owned()),
        }
    }

    Err(PciError::Reset {
        device: dev.name().to_owned(),
        detail: reasons.join("; "),
    })
}

fn detect_flr(ctx: &SysfsContext, dev: &PciDevice, cfg: &ConfigSpace) -> Result<Option<FlrKind>> {
    if let Some(pos) = cfg.find_capability(id::PCI_EXPRESS)? {
        if cfg.read_u32(pos + pe::DEVCAP)? & pe::DEVCAP_FLR != 0 {
            return Ok(Some(FlrKind::Pcie(pos)));
        }
    }
    if let Some(pos) = cfg.find_capability(id::ADVANCED_FEATURES)? {
        if cfg.read_u8(pos + af::AF_CAP)? & af::AF_CAP_FLR != 0 {
            return Ok(Some(FlrKind::Af(pos)));
        }
    }
    if ctx.is_virtual_function(&ctx.device_dir(dev.address())) {
        return Ok(Some(FlrKind::VirtualFunction));
    }
    Ok(None)
}

fn execute_flr(dev: &PciDevice, cfg: &ConfigSpace, kind: FlrKind) -> Result<()> {
    let reset_err = |err: PciError| PciError::Reset {
        device: dev.name().to_owned(),
        detail: err.to_string(),
    };
    match kind {
        FlrKind::Pcie(pos) => {
            tracing::debug!(device = %dev.name(), "initiating PCIe function level reset");
            let devctl = cfg.read_u16(pos + pe::DEVCTL).map_err(reset_err)?;
            cfg.write_u16(pos + pe::DEVCTL, devctl | pe::DEVCTL_INITIATE_FLR)
                .map_err(reset_err)?;
            sleep(FLR_SETTLE);
        }
        FlrKind::Af(pos) => {
            tracing::debug!(device = %dev.name(), "initiating advanced features reset");
            cfg.write_u8(pos + af::AF_CTRL, af::AF_CTRL_FLR)
                .map_err(reset_err)?;
            sleep(FLR_SETTLE);
        }
        FlrKind::VirtualFunction => {
            tracing::debug!(
                device = %dev.name(),
                "virtual function is reset by its physical function's driver"
            );
        }
    }
    Ok(())
}

/// Attempts a secondary bus reset through the parent bridge.
///
/// Returns `Ok(None)` on success and `Ok(Some(reason))` when the method is
/// not applicable; execution failures are [`PciError::Reset`].
fn try_secondary_bus_reset(
    ctx: &SysfsContext,
    dev: &PciDevice,
    cfg: &ConfigSpace,
    active: &DeviceRegistry,
) -> Result<Option<String>> {
    let addr = dev.address();
    if addr.bus == 0 {
        return Ok(Some("device is on the root bus".to_owned()));
    }
    if let Some(other) = active
        .addresses()
        .into_iter()
        .find(|a| a != addr && a.domain == addr.domain && a.bus == addr.bus)
    {
        return Ok(Some(format!("active device {other} shares the bus")));
    }
    let Some(bridge) = ctx.parent_bridge(addr)? else {
        return Ok(Some("no parent bridge found".to_owned()));
    };

    let reset_err = |err: PciError| PciError::Reset {
        device: dev.name().to_owned(),
        detail: err.to_string(),
    };
    tracing::debug!(device = %dev.name(), "initiating secondary bus reset");
    let parent = ConfigSpace::open_rw(ctx.device_config_path(&bridge)).map_err(reset_err)?;
    let saved = cfg.save().map_err(reset_err)?;
    let ctl = parent.read_u16(BRIDGE_CONTROL).map_err(reset_err)?;
    parent
        .write_u16(BRIDGE_CONTROL, ctl | BRIDGE_CTL_RESET)
        .map_err(reset_err)?;
    sleep(SBR_SETTLE);
    parent.write_u16(BRIDGE_CONTROL, ctl).map_err(reset_err)?;
    sleep(SBR_SETTLE);
    cfg.restore(&saved).map_err(reset_err)?;
    Ok(None)
}

/// Finds a PM capability whose control register permits a soft reset.
fn detect_pm_reset(cfg: &ConfigSpace) -> Result<Option<u16>> {
    let Some(pos) = cfg.find_capability(id::POWER_MANAGEMENT)? else {
        return Ok(None);
    };
    let ctrl = cfg.read_u16(pos + pm::PM_CTRL)?;
    if ctrl & pm::PM_CTRL_NO_SOFT_RESET != 0 {
        return Ok(None);
    }
    Ok(Some(pos))
}

fn execute_pm_reset(dev: &PciDevice, cfg: &ConfigSpace, pos: u16) -> Result<()> {
    let reset_err = |err: PciError| PciError::Reset {
        device: dev.name().to_owned(),
        detail: err.to_string(),
    };
    tracing::debug!(device = %dev.name(), "initiating power management reset");
    let saved = cfg.save().map_err(reset_err)?;
    let ctrl = cfg.read_u16(pos + pm::PM_CTRL).map_err(reset_err)? & !pm::PM_CTRL_STATE_MASK;
    cfg.write_u16(pos + pm::PM_CTRL, ctrl | pm::PM_CTRL_STATE_D3HOT)
        .map_err(reset_err)?;
    sleep(PM_SETTLE);
    cfg.write_u16(pos + pm::PM_CTRL, ctrl | pm::PM_CTRL_STATE_D0)
        .map_err(reset_err)?;
    sleep(PM_SETTLE);
    cfg.restore(&saved).map_err(reset_err)?;
    Ok(())
}
