//! Port registry: interface endpoints and their classification metadata.
//!
//! Ports are pre-allocated per slot at startup in an undefined state and
//! transition to a concrete class on registration. The driver handle is
//! set exactly once, when the flush protocol instantiates the back-end.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Port registry errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PortError {
    #[error("port {0} not found")]
    NotFound(PortKey),

    #[error("port {0} is already in use")]
    AlreadyInUse(PortKey),

    #[error("port {0} already has driver handle {1}")]
    HandleAlreadySet(PortKey, u32),

    #[error("port {0} has no driver handle")]
    NotInstantiated(PortKey),

    #[error("invalid port name: {0}")]
    InvalidPortName(String),

    #[error("invalid MAC address: {0}")]
    InvalidMacAddress(String),
}

pub type Result<T> = std::result::Result<T, PortError>;

/// Interface class of a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortKind {
    /// Physical NIC.
    Phy,
    /// Virtual-machine-facing endpoint.
    Vhost,
    /// In-memory ring channel.
    Ring,
}

impl PortKind {
    /// All classes, in registry order.
    pub const ALL: [PortKind; 3] = [PortKind::Phy, PortKind::Vhost, PortKind::Ring];

    pub fn as_str(&self) -> &'static str {
        match self {
            PortKind::Phy => "phy",
            PortKind::Vhost => "vhost",
            PortKind::Ring => "ring",
        }
    }
}

impl fmt::Display for PortKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PortKind {
    type Err = PortError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "phy" => Ok(PortKind::Phy),
            "vhost" => Ok(PortKind::Vhost),
            "ring" => Ok(PortKind::Ring),
            _ => Err(PortError::InvalidPortName(s.to_string())),
        }
    }
}

/// Direction in which a component attaches a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Rx,
    Tx,
}

impl Direction {
    pub const BOTH: [Direction; 2] = [Direction::Rx, Direction::Tx];

    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Rx => "rx",
            Direction::Tx => "tx",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Class plus index within the class. Unique and stable for the process
/// lifetime; rendered and parsed as `phy:0`, `vhost:2`, `ring:1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortKey {
    pub kind: PortKind,
    pub index: usize,
}

impl PortKey {
    pub fn new(kind: PortKind, index: usize) -> Self {
        Self { kind, index }
    }
}

impl fmt::Display for PortKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.index)
    }
}

impl FromStr for PortKey {
    type Err = PortError;

    fn from_str(s: &str) -> Result<Self> {
        let (kind, index) = s
            .split_once(':')
            .ok_or_else(|| PortError::InvalidPortName(s.to_string()))?;
        let kind = kind.parse()?;
        let index = index
            .parse()
            .map_err(|_| PortError::InvalidPortName(s.to_string()))?;
        Ok(PortKey { kind, index })
    }
}

/// MAC address used as the classification key of a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacAddr([u8; 6]);

impl MacAddr {
    pub fn new(octets: [u8; 6]) -> Self {
        Self(octets)
    }

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }

    /// Numeric form: octet i occupies bits 8i..8i+8.
    pub fn value(&self) -> u64 {
        self.0
            .iter()
            .enumerate()
            .fold(0u64, |acc, (i, b)| acc | (u64::from(*b) << (i * 8)))
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

impl FromStr for MacAddr {
    type Err = PortError;

    fn from_str(s: &str) -> Result<Self> {
        let mut octets = [0u8; 6];
        let mut count = 0;
        for part in s.split(':') {
            if count >= 6 {
                return Err(PortError::InvalidMacAddress(s.to_string()));
            }
            octets[count] = u8::from_str_radix(part, 16)
                .map_err(|_| PortError::InvalidMacAddress(s.to_string()))?;
            count += 1;
        }
        if count != 6 {
            return Err(PortError::InvalidMacAddress(s.to_string()));
        }
        Ok(MacAddr(octets))
    }
}

/// Lifecycle state of a port slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortState {
    /// Slot allocated but not registered with any class yet.
    Undefined,
    /// Registered; back-end may or may not be instantiated.
    Defined,
}

/// One interface endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortEntry {
    pub key: PortKey,
    pub state: PortState,
    /// Opaque driver handle, set once at flush-time instantiation.
    pub handle: Option<u32>,
    /// Classification key.
    pub mac: Option<MacAddr>,
    /// Optional VLAN tag.
    pub vlan: Option<u16>,
}

impl PortEntry {
    fn undefined(key: PortKey) -> Self {
        Self {
            key,
            state: PortState::Undefined,
            handle: None,
            mac: None,
            vlan: None,
        }
    }
}

/// Fixed per-class arenas of port slots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortRegistry {
    phy: Vec<PortEntry>,
    vhost: Vec<PortEntry>,
    ring: Vec<PortEntry>,
}

impl PortRegistry {
    /// Pre-allocate `capacity` slots per class. The first `phy_ports`
    /// physical slots are defined immediately with their driver handle
    /// equal to their index, mirroring the NICs present at startup.
    pub fn new(capacity: usize, phy_ports: usize) -> Self {
        let make = |kind: PortKind| -> Vec<PortEntry> {
            (0..capacity)
                .map(|i| PortEntry::undefined(PortKey::new(kind, i)))
                .collect()
        };
        let mut phy = make(PortKind::Phy);
        for entry in phy.iter_mut().take(phy_ports.min(capacity)) {
            entry.state = PortState::Defined;
            entry.handle = Some(entry.key.index as u32);
        }
        Self {
            phy,
            vhost: make(PortKind::Vhost),
            ring: make(PortKind::Ring),
        }
    }

    pub fn capacity(&self) -> usize {
        self.phy.len()
    }

    fn table(&self, kind: PortKind) -> &[PortEntry] {
        match kind {
            PortKind::Phy => &self.phy,
            PortKind::Vhost => &self.vhost,
            PortKind::Ring => &self.ring,
        }
    }

    fn table_mut(&mut self, kind: PortKind) -> &mut [PortEntry] {
        match kind {
            PortKind::Phy => &mut self.phy,
            PortKind::Vhost => &mut self.vhost,
            PortKind::Ring => &mut self.ring,
        }
    }

    /// Look up a defined port. `NotFound` when the index is out of
    /// range or the slot has not been registered.
    pub fn lookup(&self, key: PortKey) -> Result<&PortEntry> {
        self.table(key.kind)
            .get(key.index)
            .filter(|e| e.state == PortState::Defined)
            .ok_or(PortError::NotFound(key))
    }

    /// Register a port, transitioning its slot from undefined to
    /// defined and recording its classification metadata.
    pub fn register(&mut self, key: PortKey, mac: Option<MacAddr>, vlan: Option<u16>) -> Result<()> {
        let entry = self
            .table_mut(key.kind)
            .get_mut(key.index)
            .ok_or(PortError::NotFound(key))?;
        if entry.state == PortState::Defined {
            return Err(PortError::AlreadyInUse(key));
        }
        entry.state = PortState::Defined;
        entry.mac = mac;
        entry.vlan = vlan;
        Ok(())
    }

    /// Record the driver handle of a freshly instantiated port.
    pub fn set_handle(&mut self, key: PortKey, handle: u32) -> Result<()> {
        let entry = self
            .table_mut(key.kind)
            .get_mut(key.index)
            .filter(|e| e.state == PortState::Defined)
            .ok_or(PortError::NotFound(key))?;
        if let Some(existing) = entry.handle {
            return Err(PortError::HandleAlreadySet(key, existing));
        }
        entry.handle = Some(handle);
        Ok(())
    }

    /// Defined ports that still lack a driver handle, in registry
    /// order: phy, vhost, ring, ascending index.
    pub fn uninstantiated(&self) -> Vec<PortKey> {
        PortKind::ALL
            .iter()
            .flat_map(|kind| self.table(*kind))
            .filter(|e| e.state == PortState::Defined && e.handle.is_none())
            .map(|e| e.key)
            .collect()
    }

    /// All defined ports, in registry order.
    pub fn iter_defined(&self) -> impl Iterator<Item = &PortEntry> {
        PortKind::ALL
            .iter()
            .flat_map(|kind| self.table(*kind))
            .filter(|e| e.state == PortState::Defined)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_key_roundtrip() {
        for s in ["phy:0", "vhost:2", "ring:15"] {
            let key: PortKey = s.parse().unwrap();
            assert_eq!(key.to_string(), s);
        }
        assert!("nic:0".parse::<PortKey>().is_err());
        assert!("phy".parse::<PortKey>().is_err());
        assert!("phy:x".parse::<PortKey>().is_err());
    }

    #[test]
    fn test_mac_parse_and_value() {
        let mac: MacAddr = "52:54:00:12:34:56".parse().unwrap();
        assert_eq!(mac.to_string(), "52:54:00:12:34:56");
        // Octet 0 sits in the low byte
        assert_eq!(mac.value() & 0xff, 0x52);
        assert_eq!((mac.value() >> 40) & 0xff, 0x56);

        assert!("52:54:00:12:34".parse::<MacAddr>().is_err());
        assert!("52:54:00:12:34:56:78".parse::<MacAddr>().is_err());
        assert!("gg:54:00:12:34:56".parse::<MacAddr>().is_err());
    }

    #[test]
    fn test_phy_ports_predefined() {
        let reg = PortRegistry::new(8, 2);
        let p0 = reg.lookup(PortKey::new(PortKind::Phy, 0)).unwrap();
        assert_eq!(p0.handle, Some(0));
        let p1 = reg.lookup(PortKey::new(PortKind::Phy, 1)).unwrap();
        assert_eq!(p1.handle, Some(1));
        assert!(reg.lookup(PortKey::new(PortKind::Phy, 2)).is_err());
    }

    #[test]
    fn test_register_and_lookup() {
        let mut reg = PortRegistry::new(4, 0);
        let key = PortKey::new(PortKind::Vhost, 0);
        assert_eq!(reg.lookup(key), Err(PortError::NotFound(key)));

        reg.register(key, "52:54:00:00:00:01".parse().ok(), Some(100))
            .unwrap();
        let entry = reg.lookup(key).unwrap();
        assert_eq!(entry.vlan, Some(100));
        assert!(entry.handle.is_none());

        assert_eq!(
            reg.register(key, None, None),
            Err(PortError::AlreadyInUse(key))
        );
    }

    #[test]
    fn test_register_out_of_range() {
        let mut reg = PortRegistry::new(4, 0);
        let key = PortKey::new(PortKind::Ring, 4);
        assert_eq!(reg.register(key, None, None), Err(PortError::NotFound(key)));
    }

    #[test]
    fn test_handle_set_once() {
        let mut reg = PortRegistry::new(4, 0);
        let key = PortKey::new(PortKind::Ring, 1);
        reg.register(key, None, None).unwrap();
        assert_eq!(reg.uninstantiated(), vec![key]);

        reg.set_handle(key, 7).unwrap();
        assert!(reg.uninstantiated().is_empty());
        assert_eq!(
            reg.set_handle(key, 8),
            Err(PortError::HandleAlreadySet(key, 7))
        );
    }

    #[test]
    fn test_uninstantiated_registry_order() {
        let mut reg = PortRegistry::new(4, 1);
        reg.register(PortKey::new(PortKind::Ring, 0), None, None)
            .unwrap();
        reg.register(PortKey::new(PortKind::Vhost, 1), None, None)
            .unwrap();
        reg.register(PortKey::new(PortKind::Vhost, 0), None, None)
            .unwrap();
        let keys = reg.uninstantiated();
        assert_eq!(
            keys,
            vec![
                PortKey::new(PortKind::Vhost, 0),
                PortKey::new(PortKind::Vhost, 1),
                PortKey::new(PortKind::Ring, 0),
            ]
        );
    }
}
