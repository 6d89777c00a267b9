// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Raw access to a device's PCI configuration space via its sysfs `config`
//! file.
//!
//! All reads are little-endian, matching the layout of the sysfs file. Short
//! reads are zero-filled: the kernel exposes only the first 64 bytes of
//! config space to unprivileged readers, and a zeroed capability pointer
//! simply terminates any capability walk.

use crate::error::{PciError, Result};
use crate::spec::cfg_space::{
    CAP_PTR, CONFIG_SPACE_SIZE, EXT_CAP_START, EXT_CONFIG_SPACE_SIZE, STATUS, STATUS_CAP_LIST,
};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

/// An open handle to a device's configuration space.
///
/// The handle is scoped to a single query or reset operation and released on
/// every exit path.
pub struct ConfigSpace {
    file: File,
    path: PathBuf,
}

impl ConfigSpace {
    /// Opens the config file read-only, for topology queries.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|err| PciError::io("open", path, err))?;
        Ok(Self {
            file,
            path: path.to_owned(),
        })
    }

    /// Opens the config file read-write, for reset primitives.
    pub fn open_rw(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|err| PciError::io("open", path, err))?;
        Ok(Self {
            file,
            path: path.to_owned(),
        })
    }

    fn read_exact_or_zero(&self, offset: u16, buf: &mut [u8]) -> Result<()> {
        buf.fill(0);
        let mut done = 0;
        while done < buf.len() {
            let n = self
                .file
                .read_at(&mut buf[done..], offset as u64 + done as u64)
                .map_err(|err| PciError::io("read", &self.path, err))?;
            if n == 0 {
                // Past the readable portion; the zero fill stands.
                break;
            }
            done += n;
        }
        Ok(())
    }

    /// Reads one byte at `offset`.
    pub fn read_u8(&self, offset: u16) -> Result<u8> {
        let mut buf = [0; 1];
        self.read_exact_or_zero(offset, &mut buf)?;
        Ok(buf[0])
    }

    /// Reads a 16-bit register at `offset`.
    pub fn read_u16(&self, offset: u16) -> Result<u16> {
        let mut buf = [0; 2];
        self.read_exact_or_zero(offset, &mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    /// Reads a 32-bit register at `offset`.
    pub fn read_u32(&self, offset: u16) -> Result<u32> {
        let mut buf = [0; 4];
        self.read_exact_or_zero(offset, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    fn write_all_at(&self, offset: u16, buf: &[u8]) -> Result<()> {
        let mut done = 0;
        while done < buf.len() {
            let n = self
                .file
                .write_at(&buf[done..], offset as u64 + done as u64)
                .map_err(|err| PciError::io("write", &self.path, err))?;
            if n == 0 {
                return Err(PciError::io(
                    "write",
                    &self.path,
                    std::io::Error::from(std::io::ErrorKind::WriteZero),
                ));
            }
            done += n;
        }
        Ok(())
    }

    /// Writes one byte at `offset`.
    pub fn write_u8(&self, offset: u16, val: u8) -> Result<()> {
        self.write_all_at(offset, &[val])
    }

    /// Writes a 16-bit register at `offset`.
    pub fn write_u16(&self, offset: u16, val: u16) -> Result<()> {
        self.write_all_at(offset, &val.to_le_bytes())
    }

    /// Snapshots the entire legacy config space, for restoring after a
    /// disruptive reset.
    pub fn save(&self) -> Result<[u8; CONFIG_SPACE_SIZE]> {
        let mut buf = [0; CONFIG_SPACE_SIZE];
        self.read_exact_or_zero(0, &mut buf)?;
        Ok(buf)
    }

    /// Writes back a previously saved snapshot.
    pub fn restore(&self, saved: &[u8; CONFIG_SPACE_SIZE]) -> Result<()> {
        self.write_all_at(0, saved)
    }

    /// Walks the capability list looking for capability `id`, returning its
    /// offset if present.
    pub fn find_capability(&self, id: u8) -> Result<Option<u16>> {
        if self.read_u16(STATUS)? & STATUS_CAP_LIST == 0 {
            return Ok(None);
        }
        let mut pos = (self.read_u8(CAP_PTR)? & 0xfc) as u16;
        // A malformed chain could loop; 256 bytes of config space bounds the
        // number of distinct capability positions.
        let mut remaining = CONFIG_SPACE_SIZE / 4;
        while pos >= 0x40 && remaining > 0 {
            if self.read_u8(pos)? == id {
                return Ok(Some(pos));
            }
            pos = (self.read_u8(pos + 1)? & 0xfc) as u16;
            remaining -= 1;
        }
        Ok(None)
    }

    /// Walks the extended capability list (config space at 0x100 and up)
    /// looking for extended capability `id`, returning its offset if present.
    ///
    /// Conventional devices and unprivileged 64-byte views read as zero past
    /// their end, which terminates the walk immediately.
    pub fn find_ext_capability(&self, id: u16) -> Result<Option<u16>> {
        let mut pos = EXT_CAP_START;
        let mut remaining = (EXT_CONFIG_SPACE_SIZE - EXT_CAP_START as usize) / 4;
        while remaining > 0 {
            let header = self.read_u32(pos)?;
            if header == 0 {
                return Ok(None);
            }
            if (header & 0xffff) as u16 == id {
                return Ok(Some(pos));
            }
            pos = ((header >> 20) as u16) & 0xffc;
            if pos < EXT_CAP_START {
                return Ok(None);
            }
            remaining -= 1;
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::caps::id;
    use crate::testutil::ConfigBuilder;
    use tempfile::TempDir;

    fn write_config(dir: &TempDir, builder: ConfigBuilder) -> PathBuf {
        let path = dir.path().join("config");
        std::fs::write(&path, builder.build()).unwrap();
        path
    }

    #[test]
    fn capability_walk() {
        let dir = TempDir::new().unwrap();
        let path = write_config(
            &dir,
            ConfigBuilder::endpoint()
                .with_capability(0x40, id::POWER_MANAGEMENT, &[0; 6])
                .with_capability(0x50, id::PCI_EXPRESS, &[0; 0x3c]),
        );
        let cfg = ConfigSpace::open(&path).unwrap();
        assert_eq!(cfg.find_capability(id::POWER_MANAGEMENT).unwrap(), Some(0x40));
        assert_eq!(cfg.find_capability(id::PCI_EXPRESS).unwrap(), Some(0x50));
        assert_eq!(cfg.find_capability(id::ADVANCED_FEATURES).unwrap(), None);
    }

    #[test]
    fn no_capability_list() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, ConfigBuilder::endpoint().without_cap_list());
        let cfg = ConfigSpace::open(&path).unwrap();
        assert_eq!(cfg.find_capability(id::PCI_EXPRESS).unwrap(), None);
    }

    #[test]
    fn extended_capability_walk() {
        let dir = TempDir::new().unwrap();
        let path = write_config(
            &dir,
            ConfigBuilder::endpoint().with_acs(crate::spec::caps::ext::acs::ACS_CTRL_ISOLATION),
        );
        let cfg = ConfigSpace::open(&path).unwrap();
        assert_eq!(
            cfg.find_ext_capability(crate::spec::caps::ext::id::ACS).unwrap(),
            Some(0x100)
        );
        assert_eq!(cfg.find_ext_capability(0x0001).unwrap(), None);
    }

    #[test]
    fn extended_walk_terminates_on_legacy_image() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, ConfigBuilder::endpoint());
        let cfg = ConfigSpace::open(&path).unwrap();
        // A 256-byte image reads as zero past its end.
        assert_eq!(
            cfg.find_ext_capability(crate::spec::caps::ext::id::ACS).unwrap(),
            None
        );
    }

    #[test]
    fn short_file_reads_as_zero() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config");
        std::fs::write(&path, [0xffu8; 0x40]).unwrap();
        let cfg = ConfigSpace::open(&path).unwrap();
        assert_eq!(cfg.read_u8(0x3f).unwrap(), 0xff);
        assert_eq!(cfg.read_u32(0x40).unwrap(), 0);
        // A u16 straddling the end is half data, half fill.
        assert_eq!(cfg.read_u16(0x3f).unwrap(), 0x00ff);
    }

    #[test]
    fn save_restore_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, ConfigBuilder::endpoint());
        let cfg = ConfigSpace::open_rw(&path).unwrap();
        let saved = cfg.save().unwrap();
        cfg.write_u16(0x3e, 0x1234).unwrap();
        assert_eq!(cfg.read_u16(0x3e).unwrap(), 0x1234);
        cfg.restore(&saved).unwrap();
        assert_eq!(cfg.save().unwrap(), saved);
    }
}
