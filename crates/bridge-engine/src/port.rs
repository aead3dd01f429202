//! Ports, interfaces, and per-port bond state.

use crate::config::InterfaceConfig;
use crate::netdev::Netdev;
use bridge_types::{Tag, VlanId, VlanSet};

/// Mask applied to the bond source-MAC hash: 256 buckets.
pub const BOND_MASK: u8 = 0xff;

/// VLAN behavior of a port: exactly one of the two is active.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VlanMode {
    /// Implicitly-tagged access port: accepts only untagged frames, which
    /// belong to this VLAN.
    Access(VlanId),
    /// Trunk port: passes tagged frames for any VLAN in the set.
    Trunk(VlanSet),
}

/// One interface of a port. A port with more than one interface is a bond
/// and each interface is one of its slaves.
pub struct Iface {
    /// Host network device name.
    pub name: String,
    /// Index within the owning port; kept equal to the vector position.
    pub port_ifidx: usize,
    /// Kernel datapath port number; `None` until bound.
    pub dp_ifidx: Option<u16>,
    /// Revalidation tag for flows that chose this interface.
    pub tag: Tag,
    /// May this interface carry flows right now?
    pub enabled: bool,
    /// Deadline after which `enabled` may flip; `None` means no pending
    /// transition.
    pub delay_expires: Option<u64>,
    /// Open device handle, when the device could be opened.
    pub netdev: Option<Box<dyn Netdev>>,
    /// The configuration this interface was built from.
    pub cfg: InterfaceConfig,
}

impl Iface {
    /// Creates an unbound interface from its configuration.
    pub fn new(port_ifidx: usize, cfg: InterfaceConfig) -> Self {
        Iface {
            name: cfg.name.clone(),
            port_ifidx,
            dp_ifidx: None,
            tag: Tag::random(),
            enabled: false,
            delay_expires: None,
            netdev: None,
            cfg,
        }
    }
}

/// One bucket of a bond's source-MAC hash table.
#[derive(Debug, Clone)]
pub struct BondEntry {
    /// Index of the assigned slave, or `None` if unassigned.
    pub iface: Option<usize>,
    /// Bytes recently transmitted via this bucket (EWMA-decayed).
    pub tx_bytes: u64,
    /// Revalidation tag for flows that used this bucket's assignment.
    pub tag: Tag,
}

/// Bond state, present iff the port has more than one interface.
pub struct Bond {
    /// The 256-bucket sticky hash table.
    pub hash: Vec<BondEntry>,
    /// Slave on which broadcast/multicast is accepted, or `None`.
    pub active_iface: Option<usize>,
    /// Revalidation tag for broadcast flows pinned to the active slave.
    pub active_tag: Tag,
    /// Revalidation tag for flows refused because no slave was usable.
    pub no_ifaces_tag: Tag,
    /// The bond's externally visible status needs recomputing.
    pub compat_stale: bool,
}

impl Bond {
    /// Creates a bond with every bucket unassigned.
    pub fn new() -> Self {
        Bond {
            hash: (0..=BOND_MASK as usize)
                .map(|_| BondEntry {
                    iface: None,
                    tx_bytes: 0,
                    tag: Tag::random(),
                })
                .collect(),
            active_iface: None,
            active_tag: Tag::random(),
            no_ifaces_tag: Tag::random(),
            compat_stale: true,
        }
    }
}

impl Default for Bond {
    fn default() -> Self {
        Self::new()
    }
}

/// One bridge port.
pub struct Port {
    /// Port name.
    pub name: String,
    /// Index within the owning bridge; kept equal to the vector position.
    pub port_idx: usize,
    /// Access VLAN or trunk set.
    pub vlan_mode: VlanMode,
    /// Member interfaces (≥ 1; > 1 means bonded).
    pub ifaces: Vec<Iface>,
    /// Bond state; `Some` iff the port is bonded.
    pub bond: Option<Bond>,
    /// Milliseconds of carrier before a slave is enabled.
    pub updelay_ms: u64,
    /// Milliseconds without carrier before a slave is disabled.
    pub downdelay_ms: u64,
    /// Maintain an internal device named after the bond.
    pub fake_iface: bool,
    /// Configured MAC representing the port in bridge-address selection.
    pub cfg_mac: Option<bridge_types::MacAddress>,
    /// Mirrors picking up traffic received on this port (bit per mirror).
    pub src_mirrors: u32,
    /// Mirrors picking up traffic sent out this port (bit per mirror).
    pub dst_mirrors: u32,
    /// This port is a mirror's SPAN output; it never carries ordinary
    /// forwarded traffic.
    pub is_mirror_output_port: bool,
}

impl Port {
    /// Creates a port trunking every VLAN, with no interfaces yet.
    pub fn new(port_idx: usize, name: impl Into<String>) -> Self {
        Port {
            name: name.into(),
            port_idx,
            vlan_mode: VlanMode::Trunk(VlanSet::full()),
            ifaces: Vec::new(),
            bond: None,
            updelay_ms: 0,
            downdelay_ms: 0,
            fake_iface: false,
            cfg_mac: None,
            src_mirrors: 0,
            dst_mirrors: 0,
            is_mirror_output_port: false,
        }
    }

    /// True if the port aggregates more than one interface.
    pub fn is_bonded(&self) -> bool {
        self.ifaces.len() > 1
    }

    /// The port's access VLAN, if it is an access port.
    pub fn access_vlan(&self) -> Option<u16> {
        match &self.vlan_mode {
            VlanMode::Access(v) => Some(v.as_u16()),
            VlanMode::Trunk(_) => None,
        }
    }

    /// True if the port trunks `vlan` (access ports never trunk).
    pub fn trunks_vlan(&self, vlan: u16) -> bool {
        match &self.vlan_mode {
            VlanMode::Access(_) => false,
            VlanMode::Trunk(set) => set.contains(vlan),
        }
    }

    /// True if traffic on `vlan` belongs on this port.
    pub fn includes_vlan(&self, vlan: u16) -> bool {
        match &self.vlan_mode {
            VlanMode::Access(v) => v.as_u16() == vlan,
            VlanMode::Trunk(set) => set.contains(vlan),
        }
    }

    /// Finds a member interface by name.
    pub fn iface_index(&self, name: &str) -> Option<usize> {
        self.ifaces.iter().position(|i| i.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn access(vlan: u16) -> Port {
        let mut p = Port::new(0, "p");
        p.vlan_mode = VlanMode::Access(VlanId::new(vlan).unwrap());
        p
    }

    fn trunk(vlans: &[u16]) -> Port {
        let mut p = Port::new(0, "p");
        p.vlan_mode = VlanMode::Trunk(
            vlans
                .iter()
                .map(|&v| VlanId::new(v).unwrap())
                .collect::<VlanSet>(),
        );
        p
    }

    #[test]
    fn test_access_vlan_membership() {
        let p = access(10);
        assert_eq!(p.access_vlan(), Some(10));
        assert!(p.includes_vlan(10));
        assert!(!p.includes_vlan(20));
        assert!(!p.trunks_vlan(10));
    }

    #[test]
    fn test_trunk_membership() {
        let p = trunk(&[10, 20]);
        assert_eq!(p.access_vlan(), None);
        assert!(p.includes_vlan(10));
        assert!(p.trunks_vlan(20));
        assert!(!p.includes_vlan(30));
    }

    #[test]
    fn test_default_port_trunks_everything() {
        let p = Port::new(0, "p");
        assert!(p.includes_vlan(0));
        assert!(p.includes_vlan(4095));
    }

    #[test]
    fn test_bond_starts_unassigned() {
        let bond = Bond::new();
        assert_eq!(bond.hash.len(), 256);
        assert!(bond.hash.iter().all(|e| e.iface.is_none() && e.tx_bytes == 0));
        assert_eq!(bond.active_iface, None);
    }

    #[test]
    fn test_bonded() {
        let mut p = Port::new(0, "p");
        p.ifaces.push(Iface::new(0, crate::config::InterfaceConfig::named("a")));
        assert!(!p.is_bonded());
        p.ifaces.push(Iface::new(1, crate::config::InterfaceConfig::named("b")));
        assert!(p.is_bonded());
    }
}
