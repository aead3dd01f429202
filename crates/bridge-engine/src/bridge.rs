//! The bridge: owner of ports, learning table, mirrors, and the handles
//! to its datapath and OpenFlow switch.
//!
//! Cross-references inside the bridge are indices, never pointers: ports
//! know their position in the bridge's vector, interfaces their position
//! in the port's vector, and the learning table and bond hash buckets
//! refer to both by index. Removal swap-fills from the tail and rewrites
//! the displaced element's index, so stored indices stay *valid*; the
//! accompanying flush invalidates any cached decision that depended on
//! the old identity of a slot.

use crate::bond;
use crate::datapath::{Datapath, DP_LOCAL_PORT};
use crate::error::EngineError;
use crate::flow::{DpAction, Flow};
use crate::forward;
use crate::mac_learning::MacLearningTable;
use crate::mirror::{self, MirrorSet};
use crate::netdev::NetdevProvider;
use crate::ofswitch::{OfError, OfSwitch};
use crate::port::Port;
use bridge_common::RateLimiter;
use bridge_types::{MacAddress, TagSet};
use std::collections::HashMap;
use tracing::{info, warn};

/// Why the datapath reported a port change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortChangeReason {
    /// A port appeared.
    Add,
    /// A port disappeared.
    Delete,
    /// A port's status (e.g. link) changed.
    Modify,
}

/// Datapath port status accompanying a change notification.
#[derive(Debug, Clone)]
pub struct PortStatus {
    /// Datapath port number.
    pub dp_ifidx: u16,
    /// Device name.
    pub name: String,
    /// Link (carrier) state.
    pub link_up: bool,
}

/// One bridge and everything it owns.
pub struct Bridge {
    pub(crate) name: String,
    /// Fallback Ethernet address, used when no port supplies one.
    pub(crate) default_ea: MacAddress,
    pub(crate) datapath_id: u64,
    pub(crate) ml: MacLearningTable,
    pub(crate) mirrors: MirrorSet,
    pub(crate) ports: Vec<Port>,
    /// dp_ifidx → (port index, interface index).
    pub(crate) dp_map: HashMap<u16, (usize, usize)>,
    pub(crate) dp: Box<dyn Datapath>,
    pub(crate) ofproto: Box<dyn OfSwitch>,
    pub(crate) controller: Option<String>,
    /// Cached flows must be purged on the next run.
    pub(crate) flush: bool,
    pub(crate) has_bonded_ports: bool,
    pub(crate) next_rebalance_ms: u64,
    pub(crate) fwd_rl: RateLimiter,
}

impl Bridge {
    pub(crate) fn new(
        name: &str,
        dp: Box<dyn Datapath>,
        ofproto: Box<dyn OfSwitch>,
        now_ms: u64,
    ) -> Self {
        info!(bridge = %name, "created bridge");
        Bridge {
            name: name.to_string(),
            default_ea: MacAddress::random_local(),
            datapath_id: 0,
            ml: MacLearningTable::new(),
            mirrors: MirrorSet::new(),
            ports: Vec::new(),
            dp_map: HashMap::new(),
            dp,
            ofproto,
            controller: None,
            flush: false,
            has_bonded_ports: false,
            next_rebalance_ms: now_ms + bond::REBALANCE_INTERVAL_MS,
            fwd_rl: RateLimiter::new(1, 5),
        }
    }

    /// The bridge name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The chosen 64-bit datapath ID.
    pub fn datapath_id(&self) -> u64 {
        self.datapath_id
    }

    /// The learning table.
    pub fn ml(&self) -> &MacLearningTable {
        &self.ml
    }

    /// The ports, indexed by `port_idx`.
    pub fn ports(&self) -> &[Port] {
        &self.ports
    }

    /// The mirror set.
    pub fn mirrors(&self) -> &MirrorSet {
        &self.mirrors
    }

    /// True if a flow flush is pending for the next run.
    pub fn flush_pending(&self) -> bool {
        self.flush
    }

    /// Resolves a datapath port number to `(port_idx, iface_idx)`.
    pub fn iface_from_dp_ifidx(&self, dp_ifidx: u16) -> Option<(usize, usize)> {
        self.dp_map.get(&dp_ifidx).copied()
    }

    pub(crate) fn port_index(&self, name: &str) -> Option<usize> {
        self.ports.iter().position(|p| p.name == name)
    }

    pub(crate) fn iface_lookup(&self, name: &str) -> Option<(usize, usize)> {
        for (i, port) in self.ports.iter().enumerate() {
            if let Some(j) = port.iface_index(name) {
                return Some((i, j));
            }
        }
        None
    }

    /// The interface bound to the local datapath port, if any.
    pub(crate) fn local_iface(&self) -> Option<(usize, usize)> {
        self.iface_from_dp_ifidx(DP_LOCAL_PORT)
    }

    /// Schedules a flow flush and empties the learning table. Appropriate
    /// after any configuration change that can invalidate cached flows.
    pub(crate) fn mark_flush(&mut self) {
        self.flush = true;
        self.ml.flush();
    }

    pub(crate) fn create_port(&mut self, name: &str) -> usize {
        let idx = self.ports.len();
        self.ports.push(Port::new(idx, name));
        info!(bridge = %self.name, port = %name, "created port");
        self.mark_flush();
        idx
    }

    /// Removes an interface, keeping indices dense: the tail interface
    /// fills the vacated slot and its index references are rewritten.
    pub(crate) fn remove_iface(&mut self, port_idx: usize, iface_idx: usize) {
        if let Some(dp) = self.ports[port_idx].ifaces[iface_idx].dp_ifidx {
            self.dp_map.remove(&dp);
        }
        let was_active = self.ports[port_idx]
            .bond
            .as_ref()
            .is_some_and(|b| b.active_iface == Some(iface_idx));

        let last = self.ports[port_idx].ifaces.len() - 1;
        self.ports[port_idx].ifaces.swap_remove(iface_idx);
        if iface_idx < self.ports[port_idx].ifaces.len() {
            self.ports[port_idx].ifaces[iface_idx].port_ifidx = iface_idx;
            if let Some(dp) = self.ports[port_idx].ifaces[iface_idx].dp_ifidx {
                self.dp_map.insert(dp, (port_idx, iface_idx));
            }
            if let Some(bond) = self.ports[port_idx].bond.as_mut() {
                if bond.active_iface == Some(last) {
                    bond.active_iface = Some(iface_idx);
                }
                for entry in bond.hash.iter_mut() {
                    if entry.iface == Some(last) {
                        entry.iface = Some(iface_idx);
                    }
                }
            }
        }

        if was_active {
            let Bridge {
                ports, ml, ofproto, ..
            } = self;
            if let Some(bond) = ports[port_idx].bond.as_ref() {
                ofproto.revalidate(bond.active_tag);
            }
            bond::choose_active_iface(&mut ports[port_idx], false, ml, ofproto.as_mut());
            bond::send_learning_packets(&mut ports[port_idx], ml, ofproto.as_mut());
        }

        self.mark_flush();
    }

    /// Removes a port (and its interfaces and dependent mirrors), keeping
    /// port indices dense via the same swap-with-tail idiom.
    pub(crate) fn remove_port(&mut self, port_idx: usize) {
        mirror::destroy_mirrors_with_output_port(&mut self.mirrors, &mut self.ports, port_idx);

        while !self.ports[port_idx].ifaces.is_empty() {
            let last = self.ports[port_idx].ifaces.len() - 1;
            self.remove_iface(port_idx, last);
        }

        let last = self.ports.len() - 1;
        self.ports.swap_remove(port_idx);
        if port_idx < self.ports.len() {
            self.ports[port_idx].port_idx = port_idx;
            for (j, iface) in self.ports[port_idx].ifaces.iter().enumerate() {
                if let Some(dp) = iface.dp_ifidx {
                    self.dp_map.insert(dp, (port_idx, j));
                }
            }
            mirror::fix_output_port_index(&mut self.mirrors, last, port_idx);
        }
        self.mark_flush();
    }

    /// One non-blocking tick for this bridge.
    pub(crate) fn run_one(
        &mut self,
        now_ms: u64,
        net: &mut dyn NetdevProvider,
    ) -> Result<(), EngineError> {
        self.ofproto.run1().map_err(|e| match e {
            OfError::DatapathGone => EngineError::DatapathVanished(self.name.clone()),
            other => EngineError::OpenFlow(other),
        })?;

        {
            let Bridge { ml, ofproto, .. } = self;
            ml.run(now_ms, &mut |tag| ofproto.revalidate(tag));
        }

        {
            let Bridge {
                ports, ml, ofproto, ..
            } = self;
            for port in ports.iter_mut() {
                bond::run_delays(port, now_ms, ml, ofproto.as_mut());
            }
        }

        for port in self.ports.iter_mut() {
            if let Some(b) = port.bond.as_mut() {
                if b.compat_stale {
                    b.compat_stale = false;
                    bond::refresh_status(port, net);
                }
            }
        }

        let flush = std::mem::take(&mut self.flush);
        self.ofproto.run2(flush).map_err(|e| match e {
            OfError::DatapathGone => EngineError::DatapathVanished(self.name.clone()),
            other => EngineError::OpenFlow(other),
        })?;
        Ok(())
    }

    /// The earliest deadline this bridge needs to be run again for.
    pub(crate) fn next_wake(&self) -> Option<u64> {
        let mut deadline = self.ml.next_expiry();
        for port in &self.ports {
            deadline = match (deadline, bond::next_delay_expiry(port)) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
        }
        if self.has_bonded_ports {
            deadline = Some(match deadline {
                Some(d) => d.min(self.next_rebalance_ms),
                None => self.next_rebalance_ms,
            });
        }
        deadline
    }

    /// True if `name` refers to a device simulated inside the datapath:
    /// the local port, an interface declared internal, or a fake bond
    /// interface.
    pub(crate) fn iface_is_internal(&self, name: &str) -> bool {
        if name == self.name {
            return true;
        }
        if let Some((pi, ii)) = self.iface_lookup(name) {
            if self.ports[pi].ifaces[ii].cfg.is_internal() {
                return true;
            }
        }
        if let Some(pi) = self.port_index(name) {
            let port = &self.ports[pi];
            if port.ifaces.len() > 1 && port.fake_iface {
                return true;
            }
        }
        false
    }

    // ------------------------------------------------------------------
    // OpenFlow hooks: invoked synchronously by the OpenFlow collaborator.

    /// A datapath port appeared, disappeared, or changed status.
    pub fn on_port_change(&mut self, reason: PortChangeReason, status: &PortStatus, now_ms: u64) {
        let Some((pi, ii)) = self.iface_from_dp_ifidx(status.dp_ifidx) else {
            return;
        };

        match reason {
            PortChangeReason::Delete => {
                warn!(
                    bridge = %self.name,
                    iface = %self.ports[pi].ifaces[ii].name,
                    "interface deleted unexpectedly"
                );
                self.remove_iface(pi, ii);
                if self.ports[pi].ifaces.is_empty() {
                    warn!(bridge = %self.name, port = %self.ports[pi].name, "port has no interfaces, dropping");
                    self.remove_port(pi);
                }
            }
            PortChangeReason::Add | PortChangeReason::Modify => {
                if self.ports[pi].ifaces.len() > 1 {
                    let Bridge {
                        ports, ml, ofproto, ..
                    } = self;
                    bond::link_status_update(
                        &mut ports[pi],
                        ii,
                        status.link_up,
                        now_ms,
                        ml,
                        ofproto.as_mut(),
                    );
                }
            }
        }
    }

    /// The forwarding pipeline: decides the action list for a flow.
    ///
    /// Returns false when the decision must not be installed as a flow
    /// (a unicast revalidation miss).
    pub fn on_normal_flow(
        &mut self,
        flow: &Flow,
        packet: Option<&[u8]>,
        tags: &mut TagSet,
        actions: &mut Vec<DpAction>,
        nf_output_iface: &mut u16,
        now_ms: u64,
    ) -> bool {
        forward::process_flow(self, flow, packet, tags, actions, nf_output_iface, now_ms)
    }

    /// Byte-count feedback for a flow that matched in the datapath.
    pub fn on_account(&mut self, flow: &Flow, actions: &[DpAction], n_bytes: u64, now_ms: u64) {
        forward::account_flow(self, flow, actions, n_bytes, now_ms);
    }

    /// Periodic opportunity to rebalance bonds.
    pub fn on_checkpoint(&mut self, now_ms: u64) {
        forward::account_checkpoint(self, now_ms);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InterfaceConfig;
    use crate::port::{Bond, Iface, VlanMode};
    use crate::sim::Sim;
    use bridge_types::VlanId;
    use pretty_assertions::assert_eq;

    fn test_bridge() -> (Sim, Bridge) {
        let sim = Sim::new();
        let (mut dps, _, mut ofs) = sim.providers();
        let dp = dps.create_or_open("br0").unwrap();
        let sw = ofs.create("br0").unwrap();
        (sim.clone(), Bridge::new("br0", dp, sw, 0))
    }

    fn add_port(br: &mut Bridge, name: &str, ifaces: &[(&str, u16)]) -> usize {
        let idx = br.create_port(name);
        for (j, (iname, dp)) in ifaces.iter().enumerate() {
            let mut iface = Iface::new(j, InterfaceConfig::named(*iname));
            iface.enabled = true;
            iface.dp_ifidx = Some(*dp);
            br.dp_map.insert(*dp, (idx, j));
            br.ports[idx].ifaces.push(iface);
        }
        if br.ports[idx].ifaces.len() > 1 {
            br.ports[idx].bond = Some(Bond::new());
            br.has_bonded_ports = true;
            let Bridge {
                ports, ml, ofproto, ..
            } = br;
            bond::choose_active_iface(&mut ports[idx], false, ml, ofproto.as_mut());
        }
        idx
    }

    fn assert_indices_consistent(br: &Bridge) {
        for (i, port) in br.ports.iter().enumerate() {
            assert_eq!(port.port_idx, i, "port {} has stale port_idx", port.name);
            for (j, iface) in port.ifaces.iter().enumerate() {
                assert_eq!(iface.port_ifidx, j, "iface {} stale", iface.name);
                if let Some(dp) = iface.dp_ifidx {
                    assert_eq!(br.dp_map.get(&dp), Some(&(i, j)));
                }
            }
        }
    }

    #[test]
    fn test_indices_stable_across_removal() {
        let (_sim, mut br) = test_bridge();
        add_port(&mut br, "p1", &[("eth1", 1)]);
        add_port(&mut br, "p2", &[("eth2", 2)]);
        add_port(&mut br, "p3", &[("eth3a", 3), ("eth3b", 4)]);
        assert_indices_consistent(&br);

        // Removing the middle port moves p3 into slot 1.
        br.remove_port(1);
        assert_eq!(br.ports.len(), 2);
        assert_eq!(br.ports[1].name, "p3");
        assert_indices_consistent(&br);
        assert!(br.flush_pending());
        assert_eq!(br.iface_from_dp_ifidx(2), None);
        assert_eq!(br.iface_from_dp_ifidx(4), Some((1, 1)));
    }

    #[test]
    fn test_iface_removal_swaps_tail_and_remaps_bond() {
        let (_sim, mut br) = test_bridge();
        let p = add_port(&mut br, "p3", &[("a", 3), ("b", 4), ("c", 5)]);
        {
            let bond = br.ports[p].bond.as_mut().unwrap();
            bond.active_iface = Some(2);
            bond.hash[7].iface = Some(2);
        }

        br.remove_iface(p, 0);
        assert_indices_consistent(&br);
        assert_eq!(br.ports[p].ifaces[0].name, "c");
        // References to the moved tail slave follow it to its new slot.
        let bond = br.ports[p].bond.as_ref().unwrap();
        assert_eq!(bond.active_iface, Some(0));
        assert_eq!(bond.hash[7].iface, Some(0));
    }

    #[test]
    fn test_removing_active_slave_reelects_and_relearns() {
        let (sim, mut br) = test_bridge();
        let p = add_port(&mut br, "p3", &[("a", 3), ("b", 4)]);
        assert_eq!(br.ports[p].bond.as_ref().unwrap().active_iface, Some(0));
        br.ml.learn(MacAddress::new([0, 0, 0, 0, 0, 9]), 0, 5, 0);

        sim.clear_sent_packets("br0");
        br.remove_iface(p, 0);
        assert_eq!(br.ports[p].bond.as_ref().unwrap().active_iface, Some(0));
        assert_eq!(br.ports[p].ifaces[0].name, "b");
        // The gratuitous frames went out before the flush emptied the
        // learning table.
        assert!(!sim.sent_packets("br0").is_empty());
        assert!(br.ml.is_empty());
    }

    #[test]
    fn test_port_change_delete_destroys_iface_and_port() {
        let (_sim, mut br) = test_bridge();
        add_port(&mut br, "p1", &[("eth1", 1)]);
        add_port(&mut br, "p2", &[("eth2", 2)]);

        br.on_port_change(
            PortChangeReason::Delete,
            &PortStatus {
                dp_ifidx: 1,
                name: "eth1".into(),
                link_up: false,
            },
            0,
        );
        assert_eq!(br.ports.len(), 1);
        assert_eq!(br.ports[0].name, "p2");
        assert_indices_consistent(&br);
        assert!(br.flush_pending());
    }

    #[test]
    fn test_port_change_modify_feeds_bond() {
        let (_sim, mut br) = test_bridge();
        let p = add_port(&mut br, "p3", &[("a", 3), ("b", 4)]);
        br.ports[p].downdelay_ms = 200;

        br.on_port_change(
            PortChangeReason::Modify,
            &PortStatus {
                dp_ifidx: 3,
                name: "a".into(),
                link_up: false,
            },
            1000,
        );
        assert_eq!(br.ports[p].ifaces[0].delay_expires, Some(1200));
    }

    #[test]
    fn test_run_one_consumes_flush() {
        let (sim, mut br) = test_bridge();
        let (_, mut nets, _) = sim.providers();
        br.mark_flush();
        assert!(br.flush_pending());
        br.run_one(0, nets.as_mut()).unwrap();
        assert!(!br.flush_pending());
        assert_eq!(sim.run2_flush_count("br0"), 1);
    }

    #[test]
    fn test_run_one_reports_vanished_datapath() {
        let (sim, mut br) = test_bridge();
        let (_, mut nets, _) = sim.providers();
        sim.kill_datapath("br0");
        let err = br.run_one(0, nets.as_mut()).unwrap_err();
        assert!(matches!(err, EngineError::DatapathVanished(name) if name == "br0"));
    }

    #[test]
    fn test_next_wake_takes_earliest_deadline() {
        let (_sim, mut br) = test_bridge();
        assert_eq!(br.next_wake(), None);

        let p = add_port(&mut br, "p3", &[("a", 3), ("b", 4)]);
        // Rebalance deadline exists as soon as a bond does.
        assert_eq!(br.next_wake(), Some(br.next_rebalance_ms));

        br.ports[p].ifaces[0].delay_expires = Some(50);
        assert_eq!(br.next_wake(), Some(50));

        br.ml.learn(MacAddress::new([0, 0, 0, 0, 0, 1]), 0, 0, 0);
        assert_eq!(br.next_wake(), Some(50));
        br.ports[p].ifaces[0].delay_expires = None;
        assert_eq!(br.next_wake(), Some(br.ml.next_expiry().unwrap()));
    }

    #[test]
    fn test_iface_is_internal() {
        let (_sim, mut br) = test_bridge();
        assert!(br.iface_is_internal("br0"));

        let p = add_port(&mut br, "p1", &[("eth1", 1)]);
        assert!(!br.iface_is_internal("eth1"));
        br.ports[p].ifaces[0].cfg.kind = "internal".into();
        assert!(br.iface_is_internal("eth1"));

        let b = add_port(&mut br, "bond0", &[("x", 3), ("y", 4)]);
        assert!(!br.iface_is_internal("bond0"));
        br.ports[b].fake_iface = true;
        assert!(br.iface_is_internal("bond0"));
    }

    #[test]
    fn test_mirror_output_follows_swapped_port() {
        let (_sim, mut br) = test_bridge();
        add_port(&mut br, "p1", &[("eth1", 1)]);
        add_port(&mut br, "p2", &[("eth2", 2)]);
        add_port(&mut br, "p3", &[("eth3", 3)]);
        // Mirror m0 outputs to p3 (index 2).
        br.mirrors = MirrorSet::new();
        let cfg = crate::config::BridgeConfig {
            name: "br0".into(),
            mirrors: vec![crate::config::MirrorConfig {
                name: "m0".into(),
                select_src_ports: vec!["p1".into()],
                output_port: Some("p3".into()),
                ..Default::default()
            }],
            ..Default::default()
        };
        let Bridge {
            ports, mirrors, ml, ..
        } = &mut br;
        mirror::reconfigure("br0", ports, mirrors, ml, &cfg);
        assert_eq!(
            br.mirrors.get(0).unwrap().out,
            crate::mirror::MirrorOutput::Port(2)
        );

        br.remove_port(1); // p3 moves into slot 1
        assert_eq!(
            br.mirrors.get(0).unwrap().out,
            crate::mirror::MirrorOutput::Port(1)
        );
    }

    #[test]
    fn test_port_change_unknown_port_ignored() {
        let (_sim, mut br) = test_bridge();
        br.on_port_change(
            PortChangeReason::Delete,
            &PortStatus {
                dp_ifidx: 99,
                name: "ghost".into(),
                link_up: false,
            },
            0,
        );
        assert!(br.ports.is_empty());
    }

    #[test]
    fn test_vlan_mode_helpers_via_bridge() {
        let (_sim, mut br) = test_bridge();
        let p = add_port(&mut br, "p1", &[("eth1", 1)]);
        br.ports[p].vlan_mode = VlanMode::Access(VlanId::new(10).unwrap());
        assert!(br.ports[p].includes_vlan(10));
        assert!(!br.ports[p].includes_vlan(11));
    }
}
