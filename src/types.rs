//! Hardware-facing value types shared across the crate.
//!
//! The small-integer encodings (MTU, port states, link layer) mirror the
//! verbs ABI, but every `from_raw` conversion is total: any value the wire
//! or a driver can produce maps to a variant, with an explicit
//! unknown/unsupported arm instead of an unhandled case.

use std::ops::BitOr;

/// Transport kind of an enumerated device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Infiniband,
    Iwarp,
    Unspecified,
}

impl Transport {
    pub fn from_raw(raw: i32) -> Self {
        match raw {
            0 => Transport::Infiniband,
            1 => Transport::Iwarp,
            _ => Transport::Unspecified,
        }
    }
}

impl std::fmt::Display for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Transport::Infiniband => f.write_str("infiniband"),
            Transport::Iwarp => f.write_str("iwarp"),
            Transport::Unspecified => f.write_str("unspecified"),
        }
    }
}

/// Path MTU for the RTR transition and port reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mtu {
    Mtu256,
    Mtu512,
    Mtu1024,
    Mtu2048,
    Mtu4096,
    /// A value outside the defined encodings. Reported by `from_raw` for
    /// anything a device hands back that this crate does not model; it
    /// encodes to 0, which no transport accepts.
    Unsupported,
}

impl Mtu {
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            1 => Mtu::Mtu256,
            2 => Mtu::Mtu512,
            3 => Mtu::Mtu1024,
            4 => Mtu::Mtu2048,
            5 => Mtu::Mtu4096,
            _ => Mtu::Unsupported,
        }
    }

    pub fn as_raw(self) -> u32 {
        match self {
            Mtu::Mtu256 => 1,
            Mtu::Mtu512 => 2,
            Mtu::Mtu1024 => 3,
            Mtu::Mtu2048 => 4,
            Mtu::Mtu4096 => 5,
            Mtu::Unsupported => 0,
        }
    }

    /// MTU in bytes, `None` for `Unsupported`.
    pub fn bytes(self) -> Option<u32> {
        match self {
            Mtu::Mtu256 => Some(256),
            Mtu::Mtu512 => Some(512),
            Mtu::Mtu1024 => Some(1024),
            Mtu::Mtu2048 => Some(2048),
            Mtu::Mtu4096 => Some(4096),
            Mtu::Unsupported => None,
        }
    }
}

impl std::fmt::Display for Mtu {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.bytes() {
            Some(n) => write!(f, "{n}"),
            None => f.write_str("unsupported"),
        }
    }
}

/// Logical state of a device port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortState {
    Nop,
    Down,
    Init,
    Armed,
    Active,
    ActiveDefer,
    Unknown,
}

impl PortState {
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            0 => PortState::Nop,
            1 => PortState::Down,
            2 => PortState::Init,
            3 => PortState::Armed,
            4 => PortState::Active,
            5 => PortState::ActiveDefer,
            _ => PortState::Unknown,
        }
    }
}

impl std::fmt::Display for PortState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PortState::Nop => f.write_str("NOP"),
            PortState::Down => f.write_str("DOWN"),
            PortState::Init => f.write_str("INIT"),
            PortState::Armed => f.write_str("ARMED"),
            PortState::Active => f.write_str("ACTIVE"),
            PortState::ActiveDefer => f.write_str("ACTIVE_DEFER"),
            PortState::Unknown => f.write_str("UNKNOWN"),
        }
    }
}

/// Physical state of a device port. `LinkUp` gates bring-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortPhysicalState {
    Sleep,
    Polling,
    Disabled,
    PortConfigurationTraining,
    LinkUp,
    LinkErrorRecovery,
    PhyTest,
    Unknown,
}

impl PortPhysicalState {
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            1 => PortPhysicalState::Sleep,
            2 => PortPhysicalState::Polling,
            3 => PortPhysicalState::Disabled,
            4 => PortPhysicalState::PortConfigurationTraining,
            5 => PortPhysicalState::LinkUp,
            6 => PortPhysicalState::LinkErrorRecovery,
            7 => PortPhysicalState::PhyTest,
            _ => PortPhysicalState::Unknown,
        }
    }
}

impl std::fmt::Display for PortPhysicalState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PortPhysicalState::Sleep => f.write_str("SLEEP"),
            PortPhysicalState::Polling => f.write_str("POLLING"),
            PortPhysicalState::Disabled => f.write_str("DISABLED"),
            PortPhysicalState::PortConfigurationTraining => f.write_str("CONFIG_TRAINING"),
            PortPhysicalState::LinkUp => f.write_str("LINK_UP"),
            PortPhysicalState::LinkErrorRecovery => f.write_str("LINK_ERROR_RECOVERY"),
            PortPhysicalState::PhyTest => f.write_str("PHY_TEST"),
            PortPhysicalState::Unknown => f.write_str("UNKNOWN"),
        }
    }
}

/// Link layer carried by a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkLayer {
    Infiniband,
    Ethernet,
    Unspecified,
}

impl LinkLayer {
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            1 => LinkLayer::Infiniband,
            2 => LinkLayer::Ethernet,
            _ => LinkLayer::Unspecified,
        }
    }
}

impl std::fmt::Display for LinkLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkLayer::Infiniband => f.write_str("INFINIBAND"),
            LinkLayer::Ethernet => f.write_str("ETHERNET"),
            LinkLayer::Unspecified => f.write_str("UNSPECIFIED"),
        }
    }
}

/// Memory/queue-pair access permission bits, verbs-ABI encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessFlags(pub u32);

impl AccessFlags {
    pub const LOCAL_WRITE: AccessFlags = AccessFlags(0x1);
    pub const REMOTE_WRITE: AccessFlags = AccessFlags(0x2);
    pub const REMOTE_READ: AccessFlags = AccessFlags(0x4);
    pub const REMOTE_ATOMIC: AccessFlags = AccessFlags(0x8);

    pub const fn contains(self, other: AccessFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn bits(self) -> u32 {
        self.0
    }
}

impl BitOr for AccessFlags {
    type Output = AccessFlags;

    fn bitor(self, rhs: AccessFlags) -> AccessFlags {
        AccessFlags(self.0 | rhs.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mtu_raw_roundtrip() {
        for mtu in [Mtu::Mtu256, Mtu::Mtu512, Mtu::Mtu1024, Mtu::Mtu2048, Mtu::Mtu4096] {
            assert_eq!(Mtu::from_raw(mtu.as_raw()), mtu);
        }
    }

    #[test]
    fn mtu_mapping_is_total() {
        // Any raw value a device could hand back maps to a variant.
        for raw in 0..=255u32 {
            let mtu = Mtu::from_raw(raw);
            if !(1..=5).contains(&raw) {
                assert_eq!(mtu, Mtu::Unsupported);
                assert_eq!(mtu.to_string(), "unsupported");
            }
        }
    }

    #[test]
    fn phys_state_mapping_is_total() {
        for raw in 0..=255u32 {
            let _ = PortPhysicalState::from_raw(raw).to_string();
        }
        assert_eq!(PortPhysicalState::from_raw(5), PortPhysicalState::LinkUp);
        assert_eq!(PortPhysicalState::from_raw(42), PortPhysicalState::Unknown);
    }

    #[test]
    fn access_flags_compose() {
        let access = AccessFlags::LOCAL_WRITE | AccessFlags::REMOTE_READ | AccessFlags::REMOTE_WRITE;
        assert_eq!(access.bits(), 0x7);
        assert!(access.contains(AccessFlags::REMOTE_READ));
        assert!(!access.contains(AccessFlags::REMOTE_ATOMIC));
    }
}
