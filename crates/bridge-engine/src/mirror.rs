//! Port mirroring.
//!
//! A bridge carries up to 32 mirrors. Each one selects traffic by source
//! port, destination port, and/or VLAN, and copies it either to a local
//! output port (SPAN) or onto a VLAN (RSPAN). Reconciliation recomputes,
//! for every port, the bitmask of mirrors that pick up its ingress
//! (`src_mirrors`) and egress (`dst_mirrors`) traffic, so the forwarding
//! hot path only ever reads two words per port.

use crate::config::BridgeConfig;
use crate::mac_learning::MacLearningTable;
use crate::port::Port;
use bridge_types::{VlanId, VlanSet};
use std::collections::BTreeSet;
use tracing::{error, info, warn};

/// Maximum number of mirrors per bridge.
pub const MAX_MIRRORS: usize = 32;

/// Where a mirror copies selected traffic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MirrorOutput {
    /// SPAN: copy to a local port (by port index).
    Port(usize),
    /// RSPAN: copy onto a VLAN.
    Vlan(VlanId),
}

/// One mirror rule.
#[derive(Debug, Clone)]
pub struct Mirror {
    /// Mirror name.
    pub name: String,
    /// Slot index; the per-port masks use bit `idx`.
    pub idx: usize,
    /// Selected source (ingress) port names.
    pub src_ports: BTreeSet<String>,
    /// Selected destination (egress) port names.
    pub dst_ports: BTreeSet<String>,
    /// Selected VLANs; empty selects any VLAN.
    pub vlans: Vec<VlanId>,
    /// SPAN or RSPAN output.
    pub out: MirrorOutput,
}

impl Mirror {
    /// True if the mirror selects `vlan` (an empty VLAN list selects
    /// everything; an invalid effective VLAN matches nothing specific).
    pub fn vlan_is_mirrored(&self, vlan: Option<u16>) -> bool {
        match vlan {
            Some(v) => self.vlans.iter().any(|sel| sel.as_u16() == v),
            None => false,
        }
    }

    /// With neither ports nor VLANs specified, the mirror matches every
    /// port.
    fn matches_all(&self) -> bool {
        self.src_ports.is_empty() && self.dst_ports.is_empty() && self.vlans.is_empty()
    }
}

/// The per-bridge mirror table.
pub struct MirrorSet {
    slots: Vec<Option<Mirror>>,
}

impl MirrorSet {
    /// Creates an empty set.
    pub fn new() -> Self {
        MirrorSet {
            slots: (0..MAX_MIRRORS).map(|_| None).collect(),
        }
    }

    /// The mirror in slot `idx`, if any.
    pub fn get(&self, idx: usize) -> Option<&Mirror> {
        self.slots.get(idx).and_then(Option::as_ref)
    }

    /// Iterates live mirrors in slot order.
    pub fn iter(&self) -> impl Iterator<Item = &Mirror> + '_ {
        self.slots.iter().filter_map(Option::as_ref)
    }

    /// Number of live mirrors.
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// True when no mirror is configured.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn index_of(&self, name: &str) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| s.as_ref().is_some_and(|m| m.name == name))
    }

    fn first_free(&self) -> Option<usize> {
        self.slots.iter().position(Option::is_none)
    }
}

impl Default for MirrorSet {
    fn default() -> Self {
        Self::new()
    }
}

/// Removes a mirror and clears its bit from every port's masks.
pub(crate) fn destroy_mirror(mirrors: &mut MirrorSet, ports: &mut [Port], idx: usize) {
    if mirrors.slots[idx].take().is_some() {
        let bit = !(1u32 << idx);
        for port in ports.iter_mut() {
            port.src_mirrors &= bit;
            port.dst_mirrors &= bit;
        }
    }
}

/// Destroys every mirror whose SPAN output is `port_idx` (called when the
/// port goes away). Returns true if anything was destroyed.
pub(crate) fn destroy_mirrors_with_output_port(
    mirrors: &mut MirrorSet,
    ports: &mut [Port],
    port_idx: usize,
) -> bool {
    let doomed: Vec<usize> = mirrors
        .iter()
        .filter(|m| m.out == MirrorOutput::Port(port_idx))
        .map(|m| m.idx)
        .collect();
    for idx in &doomed {
        destroy_mirror(mirrors, ports, *idx);
    }
    !doomed.is_empty()
}

/// Rewrites SPAN output references after a port moved from `old_idx` to
/// `new_idx` (the swap-with-tail removal idiom).
pub(crate) fn fix_output_port_index(mirrors: &mut MirrorSet, old_idx: usize, new_idx: usize) {
    for slot in mirrors.slots.iter_mut().flatten() {
        if slot.out == MirrorOutput::Port(old_idx) {
            slot.out = MirrorOutput::Port(new_idx);
        }
    }
}

fn port_trunks_any_mirrored_vlan(vlans: &[VlanId], port: &Port) -> bool {
    vlans.iter().any(|v| port.trunks_vlan(v.as_u16()))
}

/// Recomputes a mirror's bit in every port's src/dst masks.
fn update_port_masks(ports: &mut [Port], m: &Mirror) {
    let bit = 1u32 << m.idx;
    let mirror_all = m.matches_all();
    for port in ports.iter_mut() {
        let src_selected = mirror_all
            || m.src_ports.contains(&port.name)
            || (!m.vlans.is_empty()
                && match port.access_vlan() {
                    Some(v) => m.vlan_is_mirrored(Some(v)),
                    None => port_trunks_any_mirrored_vlan(&m.vlans, port),
                });
        if src_selected {
            port.src_mirrors |= bit;
        } else {
            port.src_mirrors &= !bit;
        }

        if mirror_all || m.dst_ports.contains(&port.name) {
            port.dst_mirrors |= bit;
        } else {
            port.dst_mirrors &= !bit;
        }
    }
}

/// Converges the mirror set onto the configuration. Returns true if
/// anything changed that invalidates cached flows.
pub(crate) fn reconfigure(
    bridge_name: &str,
    ports: &mut [Port],
    mirrors: &mut MirrorSet,
    ml: &mut MacLearningTable,
    cfg: &BridgeConfig,
) -> bool {
    let mut flush = false;

    // Drop mirrors absent from the configuration.
    let stale: Vec<usize> = mirrors
        .iter()
        .filter(|m| !cfg.mirrors.iter().any(|mc| mc.name == m.name))
        .map(|m| m.idx)
        .collect();
    for idx in stale {
        destroy_mirror(mirrors, ports, idx);
        flush = true;
    }

    // Create or update each configured mirror.
    let mut seen: BTreeSet<&str> = BTreeSet::new();
    for mc in &cfg.mirrors {
        if !seen.insert(mc.name.as_str()) {
            warn!(bridge = %bridge_name, mirror = %mc.name, "mirror specified twice");
            continue;
        }

        let idx = match mirrors.index_of(&mc.name) {
            Some(idx) => idx,
            None => match mirrors.first_free() {
                Some(idx) => {
                    info!(bridge = %bridge_name, mirror = %mc.name, "created port mirror");
                    mirrors.slots[idx] = Some(Mirror {
                        name: mc.name.clone(),
                        idx,
                        src_ports: BTreeSet::new(),
                        dst_ports: BTreeSet::new(),
                        vlans: Vec::new(),
                        out: MirrorOutput::Vlan(VlanId::new(0).unwrap()),
                    });
                    flush = true;
                    idx
                }
                None => {
                    warn!(
                        bridge = %bridge_name,
                        mirror = %mc.name,
                        max = MAX_MIRRORS,
                        "maximum number of port mirrors reached"
                    );
                    break;
                }
            },
        };

        // Resolve the output.
        let out = if let Some(out_name) = &mc.output_port {
            if mc.output_vlan.is_some() {
                error!(
                    bridge = %bridge_name,
                    mirror = %mc.name,
                    "mirror specifies both output port and output vlan; ignoring output vlan"
                );
            }
            match ports.iter().position(|p| p.name == *out_name) {
                Some(p) => MirrorOutput::Port(p),
                None => {
                    error!(
                        bridge = %bridge_name,
                        mirror = %mc.name,
                        port = %out_name,
                        "mirror outputs to port not on bridge"
                    );
                    destroy_mirror(mirrors, ports, idx);
                    flush = true;
                    continue;
                }
            }
        } else if let Some(v) = mc.output_vlan {
            match VlanId::new(v) {
                Ok(vid) => MirrorOutput::Vlan(vid),
                Err(_) => {
                    error!(bridge = %bridge_name, mirror = %mc.name, vlan = v, "invalid output vlan");
                    destroy_mirror(mirrors, ports, idx);
                    flush = true;
                    continue;
                }
            }
        } else {
            error!(bridge = %bridge_name, mirror = %mc.name, "mirror does not specify output; ignoring");
            destroy_mirror(mirrors, ports, idx);
            flush = true;
            continue;
        };

        // Selected ports, dropping names that do not exist.
        let collect_ports = |names: &[String]| -> BTreeSet<String> {
            let mut set = BTreeSet::new();
            for name in names {
                if ports.iter().any(|p| p.name == *name) {
                    set.insert(name.clone());
                } else {
                    warn!(
                        bridge = %bridge_name,
                        mirror = %mc.name,
                        port = %name,
                        "mirror cannot match on nonexistent port"
                    );
                }
            }
            set
        };
        let src_ports = collect_ports(&mc.select_src_ports);
        let dst_ports = collect_ports(&mc.select_dst_ports);
        let any_ports_specified =
            !mc.select_src_ports.is_empty() || !mc.select_dst_ports.is_empty();
        if any_ports_specified && src_ports.is_empty() && dst_ports.is_empty() {
            error!(
                bridge = %bridge_name,
                mirror = %mc.name,
                "disabling mirror: none of the specified selection ports exists"
            );
            destroy_mirror(mirrors, ports, idx);
            flush = true;
            continue;
        }

        // Selected VLANs, dropping invalid values.
        let mut vlans = Vec::new();
        for &v in &mc.select_vlans {
            match VlanId::new(v) {
                Ok(vid) => vlans.push(vid),
                Err(_) => warn!(
                    bridge = %bridge_name,
                    mirror = %mc.name,
                    vlan = v,
                    "mirror selects invalid VLAN"
                ),
            }
        }
        let any_vlans_specified = !mc.select_vlans.is_empty();
        if any_vlans_specified && vlans.is_empty() {
            error!(
                bridge = %bridge_name,
                mirror = %mc.name,
                "disabling mirror: none of the specified VLANs is valid"
            );
            destroy_mirror(mirrors, ports, idx);
            flush = true;
            continue;
        }

        // Apply, flushing if anything effective changed.
        let slot = mirrors.slots[idx].as_mut().unwrap();
        if slot.src_ports != src_ports
            || slot.dst_ports != dst_ports
            || slot.vlans != vlans
            || slot.out != out
        {
            flush = true;
        }
        slot.src_ports = src_ports;
        slot.dst_ports = dst_ports;
        slot.vlans = vlans;
        slot.out = out;

        let snapshot = mirrors.slots[idx].as_ref().unwrap().clone();
        update_port_masks(ports, &snapshot);
    }

    // Recompute the output-port reservation from scratch.
    for port in ports.iter_mut() {
        port.is_mirror_output_port = false;
    }
    let outputs: Vec<usize> = mirrors
        .iter()
        .filter_map(|m| match m.out {
            MirrorOutput::Port(p) => Some(p),
            MirrorOutput::Vlan(_) => None,
        })
        .collect();
    for p in outputs {
        if let Some(port) = ports.get_mut(p) {
            port.is_mirror_output_port = true;
        }
    }

    // Flood VLANs (RSPAN): learning is disabled on these.
    let flood = if cfg.flood_vlans.is_empty() {
        None
    } else {
        let mut set = VlanSet::new();
        for &v in &cfg.flood_vlans {
            match VlanId::new(v) {
                Ok(vid) => {
                    info!(bridge = %bridge_name, vlan = v, "disabling learning on flood vlan");
                    set.insert(vid);
                }
                Err(_) => error!(bridge = %bridge_name, vlan = v, "invalid flood VLAN"),
            }
        }
        Some(set)
    };
    if ml.set_flood_vlans(flood) {
        flush = true;
    }

    flush
}
