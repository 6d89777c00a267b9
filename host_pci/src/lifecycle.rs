// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Detach/reattach/reset coordination across device pools.
//!
//! Devices sharing an IOMMU group cannot be DMA-isolated from each other, so
//! detach and reattach move the whole group between the inactive and active
//! pools as a unit, rolling driver bindings back if any member fails.
//! Operations on the same group are serialized by a per-group lock; the two
//! pools jointly maintain the invariant that an address lives in at most one
//! of them.

use crate::device::PciDevice;
use crate::error::{PciError, Result};
use crate::registry::DeviceRegistry;
use crate::reset;
use crate::sysfs::SysfsContext;
use parking_lot::Mutex;
use pci_addr::PciAddress;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum GroupKey {
    Group(u32),
    /// Devices without a sysfs-reported IOMMU group are serialized per
    /// address.
    Ungrouped(PciAddress),
}

/// Coordinates passthrough lifecycle transitions for a host.
pub struct PciLifecycle {
    ctx: SysfsContext,
    group_locks: Mutex<HashMap<GroupKey, Arc<Mutex<()>>>>,
}

impl PciLifecycle {
    /// Creates a coordinator over the given sysfs tree.
    pub fn new(ctx: SysfsContext) -> Self {
        Self {
            ctx,
            group_locks: Mutex::new(HashMap::new()),
        }
    }

    fn group_lock(&self, addr: &PciAddress) -> Result<Arc<Mutex<()>>> {
        let key = match self.ctx.iommu_group_num(addr)? {
            Some(group) => GroupKey::Group(group),
            None => GroupKey::Ungrouped(*addr),
        };
        Ok(self.group_locks.lock().entry(key).or_default().clone())
    }

    /// Group members currently present in `pool`, in sorted address order.
    fn group_members(
        &self,
        addr: &PciAddress,
        pool: &DeviceRegistry,
    ) -> Result<Vec<PciAddress>> {
        Ok(self
            .ctx
            .iommu_group_addresses(addr)?
            .into_iter()
            .filter(|a| pool.contains(a))
            .collect())
    }

    /// Detaches a device (and its IOMMU group siblings) from the host,
    /// moving them from the inactive to the active pool.
    ///
    /// Managed devices are unbound from their host driver and bound to the
    /// configured stub driver; unmanaged devices must already be stub-bound.
    /// On any member's failure the bindings of already-processed members are
    /// restored and the pools are left unchanged.
    pub fn detach(
        &self,
        addr: &PciAddress,
        active: &DeviceRegistry,
        inactive: &DeviceRegistry,
    ) -> Result<()> {
        let lock = self.group_lock(addr)?;
        let _guard = lock.lock();

        if active.contains(addr) {
            return Err(PciError::Validation(format!(
                "device {addr} is already detached"
            )));
        }
        if !inactive.contains(addr) {
            return Err(PciError::Validation(format!(
                "device {addr} is not registered for detach"
            )));
        }

        let members = self.group_members(addr, inactive)?;
        let mut devices: Vec<PciDevice> = members
            .iter()
            .map(|a| {
                inactive.steal(a).ok_or_else(|| PciError::NotFound {
                    what: "device",
                    device: a.to_string(),
                })
            })
            .collect::<Result<_>>()?;

        let mut failure = None;
        let mut done = 0;
        for dev in &mut devices {
            let res = if dev.managed() {
                dev.bind_to_stub()
            } else {
                dev.verify_stub_bound()
            };
            if let Err(err) = res {
                failure = Some(err);
                break;
            }
            done += 1;
        }

        if let Some(err) = failure {
            tracing::warn!(device = %addr, error = %err, "detach failed, restoring bindings");
            for dev in devices.iter_mut().take(done) {
                if dev.managed() {
                    if let Err(restore_err) = dev.restore_host_binding() {
                        // The device is left unbound; nothing safer remains.
                        tracing::error!(
                            device = %dev.name(),
                            error = %restore_err,
                            "failed to restore host driver binding"
                        );
                    }
                }
            }
            for dev in devices {
                let name = dev.name().to_owned();
                if let Err(add_err) = inactive.add(dev) {
                    // The device is now in neither pool; manual intervention
                    // is required.
                    tracing::error!(
                        device = %name,
                        error = %add_err,
                        "failed to return device to the inactive pool during rollback"
                    );
                }
            }
            return Err(err);
        }

        for dev in devices {
            active.add(dev)?;
        }
        tracing::info!(device = %addr, "detached from host");
        Ok(())
    }

    /// Reattaches a device (and its IOMMU group siblings) to the host,
    /// moving them from the active to the inactive pool.
    ///
    /// Managed devices are released from the stub driver and, when reprobe is
    /// requested, handed back to kernel driver discovery. On any member's
    /// failure the stub bindings of already-processed members are restored
    /// and the pools are left unchanged.
    pub fn reattach(
        &self,
        addr: &PciAddress,
        active: &DeviceRegistry,
        inactive: &DeviceRegistry,
    ) -> Result<()> {
        let lock = self.group_lock(addr)?;
        let _guard = lock.lock();

        if inactive.contains(addr) {
            return Err(PciError::Validation(format!(
                "device {addr} is already attached to the host"
            )));
        }
        if !active.contains(addr) {
            return Err(PciError::Validation(format!(
                "device {addr} is not detached"
            )));
        }

        let members = self.group_members(addr, active)?;
        let mut devices: Vec<PciDevice> = members
            .iter()
            .map(|a| {
                active.steal(a).ok_or_else(|| PciError::NotFound {
                    what: "device",
                    device: a.to_string(),
                })
            })
            .collect::<Result<_>>()?;

        let mut failure = None;
        let mut done = 0;
        for dev in &mut devices {
            let res = reattach_one(dev);
            if let Err(err) = res {
                failure = Some(err);
                break;
            }
            done += 1;
        }

        if let Some(err) = failure {
            tracing::warn!(device = %addr, error = %err, "reattach failed, restoring stub bindings");
            for dev in devices.iter_mut().take(done) {
                if dev.managed() {
                    if let Err(restore_err) = dev.bind_to_stub() {
                        tracing::error!(
                            device = %dev.name(),
                            error = %restore_err,
                            "failed to restore stub driver binding"
                        );
                    }
                }
            }
            for dev in devices {
                let name = dev.name().to_owned();
                if let Err(add_err) = active.add(dev) {
                    // The device is now in neither pool; manual intervention
                    // is required.
                    tracing::error!(
                        device = %name,
                        error = %add_err,
                        "failed to return device to the active pool during rollback"
                    );
                }
            }
            return Err(err);
        }

        for dev in devices {
            inactive.add(dev)?;
        }
        tracing::info!(device = %addr, "reattached to host");
        Ok(())
    }

    /// Resets a device registered in either pool.
    ///
    /// The device's driver binding and pool membership are unaffected; the
    /// reset is refused while any other member of its IOMMU group is in the
    /// active pool.
    pub fn reset(
        &self,
        addr: &PciAddress,
        active: &DeviceRegistry,
        inactive: &DeviceRegistry,
    ) -> Result<()> {
        let dev = active
            .find(addr)
            .or_else(|| inactive.find(addr))
            .ok_or_else(|| PciError::NotFound {
                what: "device",
                device: addr.to_string(),
            })?;
        let lock = self.group_lock(addr)?;
        let _guard = lock.lock();
        reset::reset_device(&self.ctx, &dev, active)
    }
}

fn reattach_one(dev: &mut PciDevice) -> Result<()> {
    if dev.managed() || dev.unbind_from_stub() {
        dev.unbind_from_stub_driver()?;
    }
    if dev.managed() {
        dev.rebind()?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::StubDriver;
    use crate::testutil::{ConfigBuilder, FakeSysfs};

    fn addr(s: &str) -> PciAddress {
        s.parse().unwrap()
    }

    fn managed_vfio_device(env: &FakeSysfs, a: &str) -> PciDevice {
        let mut dev = PciDevice::new(&env.ctx(), addr(a)).unwrap();
        dev.set_managed(true);
        dev.set_stub_driver(StubDriver::Vfio);
        dev
    }

    struct Host {
        lifecycle: PciLifecycle,
        active: DeviceRegistry,
        inactive: DeviceRegistry,
    }

    impl Host {
        fn new(env: &FakeSysfs) -> Self {
            Self {
                lifecycle: PciLifecycle::new(env.ctx()),
                active: DeviceRegistry::new(),
                inactive: DeviceRegistry::new(),
            }
        }

        fn detach(&self, a: &str) -> Result<()> {
            self.lifecycle.detach(&addr(a), &self.active, &self.inactive)
        }

        fn reattach(&self, a: &str) -> Result<()> {
            self.lifecycle
                .reattach(&addr(a), &self.active, &self.inactive)
        }
    }

    #[test]
    fn managed_detach_moves_group_to_active() {
        let env = FakeSysfs::new();
        env.add_device("0000:03:00.0", ConfigBuilder::endpoint());
        env.add_device("0000:03:00.1", ConfigBuilder::endpoint());
        env.set_iommu_group(7, &["0000:03:00.0", "0000:03:00.1"]);
        env.add_driver("vfio-pci");

        let host = Host::new(&env);
        host.inactive
            .add(managed_vfio_device(&env, "0000:03:00.0"))
            .unwrap();
        host.inactive
            .add(managed_vfio_device(&env, "0000:03:00.1"))
            .unwrap();

        host.detach("0000:03:00.0").unwrap();

        assert_eq!(
            host.active.addresses(),
            vec![addr("0000:03:00.0"), addr("0000:03:00.1")]
        );
        assert!(host.inactive.is_empty());
        assert_eq!(env.read("devices/0000:03:00.0/driver_override"), "vfio-pci");
        assert_eq!(env.read("devices/0000:03:00.1/driver_override"), "vfio-pci");
        assert_eq!(env.read("drivers_probe"), "0000:03:00.1");
    }

    #[test]
    fn detach_preconditions() {
        let env = FakeSysfs::new();
        env.add_device("0000:03:00.0", ConfigBuilder::endpoint());
        env.add_driver("vfio-pci");
        let host = Host::new(&env);

        // Not registered at all.
        assert!(matches!(
            host.detach("0000:03:00.0"),
            Err(PciError::Validation(_))
        ));

        host.inactive
            .add(managed_vfio_device(&env, "0000:03:00.0"))
            .unwrap();
        host.detach("0000:03:00.0").unwrap();

        // Already detached.
        assert!(matches!(
            host.detach("0000:03:00.0"),
            Err(PciError::Validation(_))
        ));
    }

    #[test]
    fn unmanaged_detach_verifies_stub_binding() {
        let env = FakeSysfs::new();
        env.add_device("0000:03:00.0", ConfigBuilder::endpoint());
        env.add_driver("vfio-pci");
        env.bind("0000:03:00.0", "vfio-pci");

        let host = Host::new(&env);
        let mut dev = PciDevice::new(&env.ctx(), addr("0000:03:00.0")).unwrap();
        dev.set_stub_driver(StubDriver::Vfio);
        host.inactive.add(dev).unwrap();

        host.detach("0000:03:00.0").unwrap();
        assert!(host.active.contains(&addr("0000:03:00.0")));
        // The controller did not rebind anything.
        assert_eq!(env.read("drivers_probe"), "");
    }

    #[test]
    fn unmanaged_detach_rejects_foreign_binding() {
        let env = FakeSysfs::new();
        env.add_device("0000:03:00.0", ConfigBuilder::endpoint());
        env.add_driver("igb");
        env.bind("0000:03:00.0", "igb");

        let host = Host::new(&env);
        let mut dev = PciDevice::new(&env.ctx(), addr("0000:03:00.0")).unwrap();
        dev.set_stub_driver(StubDriver::Vfio);
        host.inactive.add(dev).unwrap();

        assert!(matches!(
            host.detach("0000:03:00.0"),
            Err(PciError::Driver { .. })
        ));
        assert!(host.active.is_empty());
        assert!(host.inactive.contains(&addr("0000:03:00.0")));
    }

    #[test]
    fn detach_rolls_back_on_sibling_failure() {
        let env = FakeSysfs::new();
        env.add_device("0000:03:00.0", ConfigBuilder::endpoint());
        env.add_device("0000:03:00.1", ConfigBuilder::endpoint());
        env.set_iommu_group(7, &["0000:03:00.0", "0000:03:00.1"]);
        env.add_driver("vfio-pci");

        let host = Host::new(&env);
        host.inactive
            .add(managed_vfio_device(&env, "0000:03:00.0"))
            .unwrap();
        // The sibling is managed but has no stub driver configured, so its
        // bind must fail after the primary already succeeded.
        let mut sibling = PciDevice::new(&env.ctx(), addr("0000:03:00.1")).unwrap();
        sibling.set_managed(true);
        host.inactive.add(sibling).unwrap();

        assert!(matches!(
            host.detach("0000:03:00.0"),
            Err(PciError::Validation(_))
        ));

        // Pools are unchanged and the primary's binding was restored.
        assert!(host.active.is_empty());
        assert_eq!(host.inactive.len(), 2);
        assert_eq!(env.read("devices/0000:03:00.0/driver_override"), "\n");
        assert_eq!(env.read("drivers_probe"), "0000:03:00.0");
    }

    #[test]
    fn detach_reattach_roundtrip() {
        let env = FakeSysfs::new();
        env.add_device("0000:03:00.0", ConfigBuilder::endpoint());
        env.add_driver("igb");
        env.add_driver("vfio-pci");
        env.bind("0000:03:00.0", "igb");

        let host = Host::new(&env);
        let mut dev = managed_vfio_device(&env, "0000:03:00.0");
        dev.set_reprobe(true);
        host.inactive.add(dev).unwrap();

        host.detach("0000:03:00.0").unwrap();
        assert_eq!(env.read("drivers/igb/unbind"), "0000:03:00.0");
        // The kernel honors the probe request and binds the stub.
        env.bind("0000:03:00.0", "vfio-pci");

        host.reattach("0000:03:00.0").unwrap();
        assert!(host.active.is_empty());
        assert!(host.inactive.contains(&addr("0000:03:00.0")));
        assert_eq!(env.read("drivers/vfio-pci/unbind"), "0000:03:00.0");
        assert_eq!(env.read("devices/0000:03:00.0/driver_override"), "\n");
        assert_eq!(env.read("drivers_probe"), "0000:03:00.0");
    }

    #[test]
    fn reattach_preconditions() {
        let env = FakeSysfs::new();
        env.add_device("0000:03:00.0", ConfigBuilder::endpoint());
        let host = Host::new(&env);

        assert!(matches!(
            host.reattach("0000:03:00.0"),
            Err(PciError::Validation(_))
        ));

        host.inactive
            .add(PciDevice::new(&env.ctx(), addr("0000:03:00.0")).unwrap())
            .unwrap();
        assert!(matches!(
            host.reattach("0000:03:00.0"),
            Err(PciError::Validation(_))
        ));
    }

    #[test]
    fn reattach_rolls_back_on_sibling_failure() {
        let env = FakeSysfs::new();
        env.add_device("0000:03:00.0", ConfigBuilder::endpoint());
        env.add_device("0000:03:00.1", ConfigBuilder::endpoint());
        env.set_iommu_group(7, &["0000:03:00.0", "0000:03:00.1"]);
        env.add_driver("vfio-pci");
        env.bind("0000:03:00.0", "vfio-pci");

        let host = Host::new(&env);
        host.active
            .add(managed_vfio_device(&env, "0000:03:00.0"))
            .unwrap();
        // The sibling requires slot removal through a stub driver that is
        // not loaded, so its release must fail after the primary's.
        let mut sibling = PciDevice::new(&env.ctx(), addr("0000:03:00.1")).unwrap();
        sibling.set_managed(true);
        sibling.set_stub_driver(StubDriver::Xen);
        sibling.set_remove_slot(true);
        host.active.add(sibling).unwrap();

        assert!(matches!(
            host.reattach("0000:03:00.0"),
            Err(PciError::Driver { .. })
        ));

        // Pools are unchanged and the primary is still stub-bound.
        assert_eq!(host.active.len(), 2);
        assert!(host.inactive.is_empty());
        let primary = host.active.find(&addr("0000:03:00.0")).unwrap();
        let (_, driver) = primary.driver_path_and_name().unwrap();
        assert_eq!(driver, "vfio-pci");
    }

    #[test]
    fn reset_finds_device_in_either_pool() {
        let env = FakeSysfs::new();
        env.add_device(
            "0000:03:00.0",
            ConfigBuilder::endpoint()
                .with_pcie(crate::spec::caps::pci_express::DEVCAP_FLR, 0, 0),
        );
        let host = Host::new(&env);

        assert!(matches!(
            host.lifecycle
                .reset(&addr("0000:03:00.0"), &host.active, &host.inactive),
            Err(PciError::NotFound { .. })
        ));

        host.inactive
            .add(PciDevice::new(&env.ctx(), addr("0000:03:00.0")).unwrap())
            .unwrap();
        host.lifecycle
            .reset(&addr("0000:03:00.0"), &host.active, &host.inactive)
            .unwrap();
        // Pool membership is untouched by reset.
        assert!(host.inactive.contains(&addr("0000:03:00.0")));
        assert!(host.active.is_empty());
    }

    #[test]
    fn reset_blocked_by_active_group_sibling() {
        let env = FakeSysfs::new();
        env.add_device("0000:03:00.0", ConfigBuilder::endpoint());
        env.add_device("0000:03:00.1", ConfigBuilder::endpoint());
        env.set_iommu_group(7, &["0000:03:00.0", "0000:03:00.1"]);

        let host = Host::new(&env);
        host.inactive
            .add(PciDevice::new(&env.ctx(), addr("0000:03:00.0")).unwrap())
            .unwrap();
        host.active
            .add(PciDevice::new(&env.ctx(), addr("0000:03:00.1")).unwrap())
            .unwrap();

        assert!(matches!(
            host.lifecycle
                .reset(&addr("0000:03:00.0"), &host.active, &host.inactive),
            Err(PciError::InUse { .. })
        ));
    }

    #[test]
    fn concurrent_detach_has_a_single_winner() {
        let env = FakeSysfs::new();
        env.add_device("0000:03:00.0", ConfigBuilder::endpoint());
        env.add_driver("vfio-pci");

        let host = Host::new(&env);
        host.inactive
            .add(managed_vfio_device(&env, "0000:03:00.0"))
            .unwrap();

        let results: Vec<Result<()>> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..2)
                .map(|_| s.spawn(|| host.detach("0000:03:00.0")))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let wins = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(wins, 1, "exactly one detach must win: {results:?}");
        assert!(results
            .iter()
            .any(|r| matches!(r, Err(PciError::Validation(_)))));
        assert_eq!(host.active.len(), 1);
        assert!(host.inactive.is_empty());
    }
}
