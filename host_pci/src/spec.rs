// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Types and constants specified by the PCI spec.
//!
//! This module MUST NOT contain any vendor-specific constants!

use std::fmt;

/// Configuration Space
///
/// Sources: PCI 2.3 Spec - Chapter 6
pub mod cfg_space {
    /// Total size of a device's legacy configuration space.
    pub const CONFIG_SPACE_SIZE: usize = 256;
    /// Total size of PCIe extended configuration space.
    pub const EXT_CONFIG_SPACE_SIZE: usize = 4096;
    /// Offset of the first extended capability header.
    pub const EXT_CAP_START: u16 = 0x100;

    /// Status register (16 bits).
    pub const STATUS: u16 = 0x06;
    /// Status bit: a capability list hangs off offset 0x34.
    pub const STATUS_CAP_LIST: u16 = 1 << 4;

    /// Header type register (8 bits).
    pub const HEADER_TYPE: u16 = 0x0e;
    /// Mask selecting the layout bits of the header type register.
    pub const HEADER_TYPE_MASK: u8 = 0x7f;
    /// Multi-function bit of the header type register.
    pub const HEADER_TYPE_MULTI: u8 = 0x80;

    /// Capabilities pointer register (8 bits).
    pub const CAP_PTR: u16 = 0x34;

    /// Type 1 header: secondary bus number (8 bits).
    pub const SECONDARY_BUS: u16 = 0x19;
    /// Type 1 header: bridge control register (16 bits).
    pub const BRIDGE_CONTROL: u16 = 0x3e;
    /// Bridge control bit: assert secondary bus reset.
    pub const BRIDGE_CTL_RESET: u16 = 0x40;
}

/// Capabilities
///
/// Sources: PCI 2.3 Spec - Appendix H, PCIe 4.0 Spec - 7.5.3
pub mod caps {
    /// Capability IDs used by this crate (non-exhaustive).
    pub mod id {
        /// Power Management.
        pub const POWER_MANAGEMENT: u8 = 0x01;
        /// PCI Express.
        pub const PCI_EXPRESS: u8 = 0x10;
        /// Advanced Features (conventional PCI FLR).
        pub const ADVANCED_FEATURES: u8 = 0x13;
    }

    /// PCI Express capability registers, offsets relative to the capability
    /// header.
    pub mod pci_express {
        use bitfield_struct::bitfield;

        /// PCI Express Capabilities register.
        pub const FLAGS: u16 = 0x02;
        /// Device/port type field of the capabilities register.
        pub const FLAGS_TYPE_MASK: u16 = 0x00f0;
        /// Device/port type: switch downstream port.
        pub const TYPE_DOWNSTREAM_PORT: u16 = 0x6;

        /// Device Capabilities register.
        pub const DEVCAP: u16 = 0x04;
        /// FLR bit is the 28th bit in the Device Capabilities register
        /// (0 indexed).
        pub const DEVCAP_FLR: u32 = 1 << 28;

        /// Device Control register.
        pub const DEVCTL: u16 = 0x08;
        /// Device Control bit: initiate function level reset.
        pub const DEVCTL_INITIATE_FLR: u16 = 1 << 15;

        /// Link Capabilities register.
        pub const LNKCAP: u16 = 0x0c;
        /// Link Status register.
        pub const LNKSTA: u16 = 0x12;

        /// Link Capabilities register layout.
        #[bitfield(u32)]
        pub struct LinkCapabilities {
            /// Maximum link speed, encoded as in [`super::super::PcieLinkSpeed`].
            #[bits(4)]
            pub max_link_speed: u8,
            /// Maximum link width in lanes.
            #[bits(6)]
            pub max_link_width: u8,
            #[bits(14)]
            _reserved: u32,
            /// Port number.
            pub port_number: u8,
        }

        /// Link Status register layout.
        #[bitfield(u16)]
        pub struct LinkStatus {
            /// Negotiated link speed, same encoding as the capability field.
            #[bits(4)]
            pub current_link_speed: u8,
            /// Negotiated link width in lanes.
            #[bits(6)]
            pub negotiated_link_width: u8,
            #[bits(6)]
            _reserved: u16,
        }
    }

    /// Power Management capability registers.
    pub mod power_management {
        /// PM Control/Status register.
        pub const PM_CTRL: u16 = 0x04;
        /// Power state bits of the control register.
        pub const PM_CTRL_STATE_MASK: u16 = 0x3;
        /// Fully-on power state.
        pub const PM_CTRL_STATE_D0: u16 = 0x0;
        /// Software-accessible low power state.
        pub const PM_CTRL_STATE_D3HOT: u16 = 0x3;
        /// Set when the device does not perform an internal reset on the
        /// D3hot -> D0 transition, making a PM-based reset ineffective.
        pub const PM_CTRL_NO_SOFT_RESET: u16 = 1 << 3;
    }

    /// Extended capabilities, found in config space at 0x100 and up.
    pub mod ext {
        /// Extended capability IDs used by this crate (non-exhaustive).
        pub mod id {
            /// Access Control Services.
            pub const ACS: u16 = 0x000d;
        }

        /// ACS capability registers.
        pub mod acs {
            /// ACS control register.
            pub const ACS_CTRL: u16 = 0x06;
            /// Source validation.
            pub const ACS_CTRL_SV: u16 = 0x01;
            /// Request redirect.
            pub const ACS_CTRL_RR: u16 = 0x04;
            /// Completion redirect.
            pub const ACS_CTRL_CR: u16 = 0x08;
            /// Upstream forwarding.
            pub const ACS_CTRL_UF: u16 = 0x10;
            /// Controls a downstream port must enable for devices below it
            /// to be isolated from peer-to-peer traffic.
            pub const ACS_CTRL_ISOLATION: u16 =
                ACS_CTRL_SV | ACS_CTRL_RR | ACS_CTRL_CR | ACS_CTRL_UF;
        }
    }

    /// Advanced Features capability registers.
    pub mod advanced_features {
        /// AF capabilities byte.
        pub const AF_CAP: u16 = 0x03;
        /// AF capabilities bit: function level reset supported.
        pub const AF_CAP_FLR: u8 = 0x02;
        /// AF control byte.
        pub const AF_CTRL: u16 = 0x04;
        /// AF control bit: initiate function level reset.
        pub const AF_CTRL_FLR: u8 = 0x01;
    }
}

/// Config space header layouts, from the header type register.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum HeaderType {
    /// Type 00h: a regular endpoint.
    Endpoint,
    /// Type 01h: a PCI-to-PCI bridge.
    PciBridge,
    /// Type 02h: a CardBus bridge.
    CardbusBridge,
}

impl HeaderType {
    /// Decodes the layout bits of the header type register.
    pub fn from_register(val: u8) -> Option<Self> {
        match val & cfg_space::HEADER_TYPE_MASK {
            0x00 => Some(HeaderType::Endpoint),
            0x01 => Some(HeaderType::PciBridge),
            0x02 => Some(HeaderType::CardbusBridge),
            _ => None,
        }
    }
}

/// PCIe link speed, from the 4-bit speed encoding shared by the link
/// capability and link status registers.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub enum PcieLinkSpeed {
    /// No link, or an encoding this crate does not know about.
    #[default]
    Unknown,
    /// 2.5 GT/s (gen 1).
    Speed2_5GtS,
    /// 5 GT/s (gen 2).
    Speed5GtS,
    /// 8 GT/s (gen 3).
    Speed8GtS,
    /// 16 GT/s (gen 4).
    Speed16GtS,
}

impl PcieLinkSpeed {
    /// Decodes the register encoding.
    pub fn from_encoding(val: u8) -> Self {
        match val {
            1 => PcieLinkSpeed::Speed2_5GtS,
            2 => PcieLinkSpeed::Speed5GtS,
            3 => PcieLinkSpeed::Speed8GtS,
            4 => PcieLinkSpeed::Speed16GtS,
            _ => PcieLinkSpeed::Unknown,
        }
    }
}

impl fmt::Display for PcieLinkSpeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PcieLinkSpeed::Unknown => "unknown",
            PcieLinkSpeed::Speed2_5GtS => "2.5",
            PcieLinkSpeed::Speed5GtS => "5",
            PcieLinkSpeed::Speed8GtS => "8",
            PcieLinkSpeed::Speed16GtS => "16",
        };
        f.write_str(s)
    }
}

/// One direction of PCIe link information: either what the device is capable
/// of, or what was actually negotiated.
///
/// Not all PCI Express devices have a link. For example 'Root Complex
/// Integrated Endpoint' and 'Root Complex Event Collector' don't have one.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct PcieLink {
    /// Port number (only meaningful for the capability side).
    pub port: u8,
    /// Link speed.
    pub speed: PcieLinkSpeed,
    /// Link width in lanes.
    pub width: u8,
}

/// PCIe facts queried once at device construction.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct PcieDeviceInfo {
    /// Link capabilities.
    pub link_cap: Option<PcieLink>,
    /// Actually negotiated link state.
    pub link_sta: Option<PcieLink>,
}
