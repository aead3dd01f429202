//! Configuration reconciliation.
//!
//! `reconfigure` makes the live topology equal the configuration record
//! with minimum churn. The phases run in strict order because each one
//! depends on invariants the previous one established: bridges must
//! exist before their ports are diffed, datapath ports must be settled
//! before interfaces can be bound, interfaces must be bound before the
//! bridge address can be chosen, and so on.

use crate::bond;
use crate::bridge::Bridge;
use crate::config::{BridgeConfig, ControllerConfig, InterfaceConfig, NetworkConfig, PortConfig};
use crate::datapath::{DpError, DP_LOCAL_PORT};
use crate::engine::BridgeEngine;
use crate::flow::{DpAction, Flow, OFPP_NORMAL};
use crate::mirror;
use crate::netdev::NetdevProvider;
use crate::ofswitch::{NetflowOptions, FLOW_WILDCARD_ALL};
use crate::port::{Bond, Iface, VlanMode};
use bridge_types::{MacAddress, VlanId, VlanSet};
use std::collections::{BTreeMap, HashSet};
use std::net::Ipv4Addr;
use tracing::{debug, error, info, warn};

impl BridgeEngine {
    /// Converges the live topology onto `cfg`.
    pub fn reconfigure(&mut self, cfg: &NetworkConfig, now_ms: u64) {
        debug!("reconfiguring");

        // Controller TLS settings are process-wide; passing the current
        // config every time means dropping the stanza un-configures them.
        self.of_provider.set_ssl(cfg.ssl.as_ref());

        // Phase 1: bridge diff.
        let mut wanted: Vec<&BridgeConfig> = Vec::new();
        for bcfg in &cfg.bridges {
            if wanted.iter().any(|b| b.name == bcfg.name) {
                warn!(bridge = %bcfg.name, "more than one bridge with this name");
            } else {
                wanted.push(bcfg);
            }
        }
        let doomed: Vec<usize> = self
            .bridges
            .iter()
            .enumerate()
            .filter(|(_, br)| !wanted.iter().any(|b| b.name == br.name))
            .map(|(i, _)| i)
            .collect();
        for idx in doomed.into_iter().rev() {
            self.destroy_bridge(idx);
        }
        for bcfg in &wanted {
            if self.bridge_index(&bcfg.name).is_none() {
                self.create_bridge(&bcfg.name, now_ms);
            }
        }

        // Phase 2: port/interface diff inside every bridge.
        let mgmt_id = cfg
            .management_id
            .as_deref()
            .and_then(parse_dpid)
            .unwrap_or(0);
        {
            let BridgeEngine {
                bridges,
                net_provider,
                ..
            } = self;
            for br in bridges.iter_mut() {
                if let Some(bcfg) = cfg.bridge(&br.name) {
                    reconfigure_bridge_ports(br, cfg, bcfg, mgmt_id, net_provider.as_mut());
                }
            }
        }

        // Phase 3: datapath port reconciliation. All deletions run before
        // any addition: a device can only join a datapath after leaving
        // its old one.
        for br in self.bridges.iter_mut() {
            delete_extra_dp_ports(br);
        }
        {
            let BridgeEngine { bridges, .. } = self;
            for br in bridges.iter_mut() {
                add_missing_dp_ports(br);
            }
        }

        // Phases 4-7 per bridge.
        let BridgeEngine {
            bridges,
            net_provider,
            host_uuid,
            ..
        } = self;
        for br in bridges.iter_mut() {
            let Some(bcfg) = cfg.bridge(&br.name) else {
                continue;
            };

            // Phase 4: bind interfaces to datapath port numbers, then
            // prune what cannot work this cycle.
            fetch_dp_ifaces(br);
            prune_unopenable_ifaces(br, net_provider.as_mut());
            prune_unbound_ifaces(br);

            // Phase 5: bridge address and datapath ID.
            let (ea, hw_addr_iface) = pick_local_hw_addr(br, bcfg);
            if let Some((pi, ii)) = br.local_iface() {
                if let Some(nd) = br.ports[pi].ifaces[ii].netdev.as_mut() {
                    if let Err(e) = nd.set_ether_addr(ea) {
                        error!(bridge = %br.name, error = %e, "failed to set bridge Ethernet address");
                    }
                }
            }
            let dpid = pick_datapath_id(br, bcfg, ea, hw_addr_iface, host_uuid.as_deref());
            br.datapath_id = dpid;
            br.ofproto.set_datapath_id(dpid);

            // Phase 6: NetFlow, controller, mirrors, bonding.
            configure_netflow(br, bcfg);
            reconfigure_controller(br, get_controller(cfg, bcfg));
            {
                let Bridge {
                    ports,
                    mirrors,
                    ml,
                    name,
                    ..
                } = br;
                if mirror::reconfigure(name, ports, mirrors, ml, bcfg) {
                    br.mark_flush();
                }
            }
            for pi in 0..br.ports.len() {
                update_bonding(br, pi);
            }

            // Phase 7: final per-interface properties.
            apply_iface_properties(br);
        }
    }

    fn create_bridge(&mut self, name: &str, now_ms: u64) {
        let mut dp = match self.dp_provider.create_or_open(name) {
            Ok(dp) => dp,
            Err(e) => {
                error!(bridge = %name, error = %e, "failed to create datapath");
                return;
            }
        };
        let _ = dp.flow_flush();
        let ofproto = match self.of_provider.create(name) {
            Ok(o) => o,
            Err(e) => {
                error!(bridge = %name, error = %e, "failed to create switch");
                let _ = dp.delete();
                return;
            }
        };
        self.bridges.push(Bridge::new(name, dp, ofproto, now_ms));
    }

    fn destroy_bridge(&mut self, idx: usize) {
        let mut br = self.bridges.remove(idx);
        info!(bridge = %br.name, "destroying bridge");
        while !br.ports.is_empty() {
            let last = br.ports.len() - 1;
            br.remove_port(last);
        }
        match br.dp.delete() {
            Ok(()) | Err(DpError::NoSuchDatapath) | Err(DpError::Vanished) => {}
            Err(e) => error!(bridge = %br.name, error = %e, "failed to delete datapath"),
        }
    }
}

/// Parses a 12-hex-digit datapath/management ID; zero is invalid.
fn parse_dpid(s: &str) -> Option<u64> {
    if s.len() == 12 && s.chars().all(|c| c.is_ascii_hexdigit()) {
        match u64::from_str_radix(s, 16) {
            Ok(0) => None,
            Ok(v) => Some(v),
            Err(_) => None,
        }
    } else {
        None
    }
}

/// Derives a datapath ID from arbitrary bytes: SHA-1, then mark the
/// leading octet unicast + locally administered.
fn dpid_from_hash(data: &[u8]) -> u64 {
    use sha1::{Digest, Sha1};
    let digest = Sha1::digest(data);
    let mut ea = [0u8; 6];
    ea.copy_from_slice(&digest[..6]);
    MacAddress::marked_local(ea).to_u64()
}

fn get_controller<'a>(
    cfg: &'a NetworkConfig,
    bcfg: &'a BridgeConfig,
) -> Option<&'a ControllerConfig> {
    let c = bcfg.controller.as_ref().or(cfg.controller.as_ref())?;
    if c.target == "none" {
        None
    } else {
        Some(c)
    }
}

/// Phase 2 for one bridge: ports and interfaces diffed by name.
fn reconfigure_bridge_ports(
    br: &mut Bridge,
    cfg: &NetworkConfig,
    bcfg: &BridgeConfig,
    mgmt_id: u64,
    net: &mut dyn NetdevProvider,
) {
    br.ofproto.set_mgmt_id(mgmt_id);

    // A controller needs a local port for in-band traffic.
    if get_controller(cfg, bcfg).is_some() {
        if let Ok(local_name) = br.dp.port_get_name(DP_LOCAL_PORT) {
            if !bcfg.ports.iter().any(|p| p.name == local_name) {
                warn!(
                    bridge = %br.name,
                    local = %local_name,
                    "controller specified but no local port defined"
                );
            }
        }
    }

    // Deduplicate configured port names.
    let mut port_cfgs: Vec<&PortConfig> = Vec::new();
    for pcfg in &bcfg.ports {
        if port_cfgs.iter().any(|p| p.name == pcfg.name) {
            warn!(bridge = %br.name, port = %pcfg.name, "port specified twice");
        } else {
            port_cfgs.push(pcfg);
        }
    }

    // Destroy removed ports.
    while let Some(idx) = br
        .ports
        .iter()
        .position(|p| !port_cfgs.iter().any(|c| c.name == p.name))
    {
        info!(bridge = %br.name, port = %br.ports[idx].name, "removing port");
        br.remove_port(idx);
    }

    // Create missing ports and rewrite every surviving one.
    for pcfg in &port_cfgs {
        let idx = match br.port_index(&pcfg.name) {
            Some(idx) => idx,
            None => br.create_port(&pcfg.name),
        };
        port_reconfigure(br, idx, pcfg, net);
    }

    // An interface name may appear on only one port bridge-wide; the
    // later-visited port loses its copy.
    let mut seen: HashSet<String> = HashSet::new();
    let mut i = 0;
    while i < br.ports.len() {
        let mut j = 0;
        while j < br.ports[i].ifaces.len() {
            let name = br.ports[i].ifaces[j].name.clone();
            if seen.insert(name.clone()) {
                j += 1;
            } else {
                error!(
                    bridge = %br.name,
                    iface = %name,
                    port = %br.ports[i].name,
                    "interface is on multiple ports, removing"
                );
                br.remove_iface(i, j);
            }
        }
        if br.ports[i].ifaces.is_empty() {
            error!(bridge = %br.name, port = %br.ports[i].name, "port has no interfaces, dropping");
            br.remove_port(i);
        } else {
            i += 1;
        }
    }
}

/// Rewrites one port's interfaces, VLAN mode, and bond settings.
fn port_reconfigure(br: &mut Bridge, idx: usize, pcfg: &PortConfig, net: &mut dyn NetdevProvider) {
    // Deduplicate configured interface names.
    let mut iface_cfgs: Vec<&InterfaceConfig> = Vec::new();
    for icfg in &pcfg.interfaces {
        if iface_cfgs.iter().any(|c| c.name == icfg.name) {
            warn!(port = %pcfg.name, iface = %icfg.name, "interface specified twice");
        } else {
            iface_cfgs.push(icfg);
        }
    }

    // Drop interfaces no longer configured.
    while let Some(j) = br.ports[idx]
        .ifaces
        .iter()
        .position(|i| !iface_cfgs.iter().any(|c| c.name == i.name))
    {
        br.remove_iface(idx, j);
    }

    // Add new interfaces, refresh surviving ones.
    for icfg in &iface_cfgs {
        match br.ports[idx].iface_index(&icfg.name) {
            Some(j) => br.ports[idx].ifaces[j].cfg = (*icfg).clone(),
            None => iface_create(br, idx, icfg, net),
        }
    }

    // updelay and downdelay are independent settings.
    br.ports[idx].updelay_ms = pcfg.bond_updelay;
    br.ports[idx].downdelay_ms = pcfg.bond_downdelay;
    br.ports[idx].fake_iface = pcfg.bond_fake_iface;
    br.ports[idx].cfg_mac = pcfg.mac.as_deref().and_then(|s| s.parse().ok());

    // Access VLAN vs. trunk set.
    let mut access = None;
    if let Some(tag) = pcfg.tag {
        if br.ports[idx].ifaces.len() < 2 {
            match VlanId::new(tag) {
                Ok(v) => {
                    debug!(port = %pcfg.name, vlan = tag, "assigning access VLAN");
                    access = Some(v);
                }
                Err(_) => warn!(port = %pcfg.name, vlan = tag, "invalid access VLAN"),
            }
        } else {
            warn!(port = %pcfg.name, "VLAN tags not supported on bonded ports");
        }
    }

    let new_mode = match access {
        Some(v) => {
            if !pcfg.trunks.is_empty() {
                error!(port = %pcfg.name, "ignoring trunks in favor of implicit vlan");
            }
            VlanMode::Access(v)
        }
        None => {
            let mut trunks = VlanSet::new();
            let mut n_errors = 0usize;
            for &t in &pcfg.trunks {
                match VlanId::new(t) {
                    Ok(v) => trunks.insert(v),
                    Err(_) => n_errors += 1,
                }
            }
            if n_errors > 0 {
                error!(port = %pcfg.name, errors = n_errors, "invalid trunk VLAN values");
            }
            if trunks.is_empty() {
                if n_errors > 0 {
                    error!(port = %pcfg.name, "no valid trunks, trunking all VLANs");
                }
                trunks = VlanSet::full();
            }
            VlanMode::Trunk(trunks)
        }
    };
    if br.ports[idx].vlan_mode != new_mode {
        br.ports[idx].vlan_mode = new_mode;
        br.mark_flush();
    }
}

fn iface_create(br: &mut Bridge, port_idx: usize, icfg: &InterfaceConfig, net: &mut dyn NetdevProvider) {
    let internal = icfg.is_internal() || br.iface_is_internal(&icfg.name);
    let j = br.ports[port_idx].ifaces.len();
    let mut iface = Iface::new(j, icfg.clone());

    // Non-internal devices can be set up right away; internal ones only
    // exist after the datapath port is added.
    if !internal {
        match net.open(&icfg.name, &icfg.kind, &icfg.options, true, false) {
            Ok(nd) => {
                if let Ok(carrier) = nd.carrier() {
                    iface.enabled = carrier;
                }
                iface.netdev = Some(nd);
            }
            Err(e) => warn!(iface = %icfg.name, error = %e, "could not create interface"),
        }
    }

    debug!(iface = %icfg.name, port = %br.ports[port_idx].name, "attached network device");
    br.ports[port_idx].ifaces.push(iface);
    if br.ports[port_idx].ifaces.len() > 1 {
        br.has_bonded_ports = true;
    }
    br.mark_flush();
}

/// Every device name this bridge wants in its datapath, with the
/// internal flag to create it with.
fn wanted_dp_ports(br: &Bridge) -> BTreeMap<String, bool> {
    let mut want = BTreeMap::new();
    for port in &br.ports {
        for iface in &port.ifaces {
            let internal = iface.cfg.is_internal() || br.iface_is_internal(&iface.name);
            want.entry(iface.name.clone()).or_insert(internal);
        }
        if port.ifaces.len() > 1 && port.fake_iface {
            want.entry(port.name.clone()).or_insert(true);
        }
    }
    want
}

/// Phase 3a: delete datapath ports nothing wants any more (never the
/// local port).
fn delete_extra_dp_ports(br: &mut Bridge) {
    let dp_ports = match br.dp.port_list() {
        Ok(list) => list,
        Err(e) => {
            error!(bridge = %br.name, error = %e, "failed to list datapath ports");
            return;
        }
    };
    let want = wanted_dp_ports(br);
    for p in dp_ports {
        if !want.contains_key(&p.devname) && p.devname != br.name {
            match br.dp.port_del(p.dp_ifidx) {
                Ok(()) | Err(DpError::NoSuchPort) => {}
                Err(e) => {
                    error!(bridge = %br.name, device = %p.devname, error = %e, "failed to remove datapath port")
                }
            }
        }
    }
}

/// Phase 3b: add wanted devices that are missing; reconfigure options on
/// the ones already present.
fn add_missing_dp_ports(br: &mut Bridge) {
    let dp_ports = match br.dp.port_list() {
        Ok(list) => list,
        Err(e) => {
            error!(bridge = %br.name, error = %e, "failed to list datapath ports");
            return;
        }
    };
    let current: HashSet<String> = dp_ports.into_iter().map(|p| p.devname).collect();

    for (name, internal) in wanted_dp_ports(br) {
        if current.contains(&name) {
            if let Some((pi, ii)) = br.iface_lookup(&name) {
                let options = br.ports[pi].ifaces[ii].cfg.options.clone();
                if let Some(nd) = br.ports[pi].ifaces[ii].netdev.as_mut() {
                    if let Err(e) = nd.reconfigure(&options) {
                        warn!(iface = %name, error = %e, "failed to reconfigure device");
                    }
                }
            }
        } else {
            match br.dp.port_add(&name, internal) {
                Ok(_) => {}
                Err(DpError::PortSpaceExhausted) => {
                    error!(bridge = %br.name, "ran out of valid port numbers");
                    break;
                }
                Err(e) => {
                    error!(bridge = %br.name, device = %name, error = %e, "failed to add datapath port")
                }
            }
        }
    }
}

/// Phase 4a: re-read the datapath port table and rebind every
/// interface's dp_ifidx from scratch.
fn fetch_dp_ifaces(br: &mut Bridge) {
    for port in br.ports.iter_mut() {
        for iface in port.ifaces.iter_mut() {
            iface.dp_ifidx = None;
        }
    }
    br.dp_map.clear();

    let dp_ports = match br.dp.port_list() {
        Ok(list) => list,
        Err(e) => {
            error!(bridge = %br.name, error = %e, "failed to list datapath ports");
            return;
        }
    };
    for p in dp_ports {
        let Some((pi, ii)) = br.iface_lookup(&p.devname) else {
            continue;
        };
        if br.ports[pi].ifaces[ii].dp_ifidx.is_some() {
            warn!(bridge = %br.name, device = %p.devname, "datapath reported interface twice");
        } else if br.dp_map.contains_key(&p.dp_ifidx) {
            warn!(bridge = %br.name, dp_ifidx = p.dp_ifidx, "datapath reported port number twice");
        } else {
            br.ports[pi].ifaces[ii].dp_ifidx = Some(p.dp_ifidx);
            br.dp_map.insert(p.dp_ifidx, (pi, ii));
        }
    }
}

/// Phase 4b: open netdevs that are still missing; interfaces whose
/// device cannot be opened are dropped for this cycle.
fn prune_unopenable_ifaces(br: &mut Bridge, net: &mut dyn NetdevProvider) {
    let mut i = 0;
    while i < br.ports.len() {
        let mut j = 0;
        while j < br.ports[i].ifaces.len() {
            if br.ports[i].ifaces[j].netdev.is_some() {
                j += 1;
                continue;
            }
            let name = br.ports[i].ifaces[j].name.clone();
            let kind = br.ports[i].ifaces[j].cfg.kind.clone();
            let options = br.ports[i].ifaces[j].cfg.options.clone();
            let internal = br.iface_is_internal(&name);
            match net.open(&name, &kind, &options, true, internal) {
                Ok(nd) => {
                    if let Ok(carrier) = nd.carrier() {
                        br.ports[i].ifaces[j].enabled = carrier;
                    }
                    br.ports[i].ifaces[j].netdev = Some(nd);
                    j += 1;
                }
                Err(e) => {
                    warn!(iface = %name, error = %e, "could not open network device, dropping");
                    br.remove_iface(i, j);
                }
            }
        }
        if br.ports[i].ifaces.is_empty() {
            error!(bridge = %br.name, port = %br.ports[i].name, "port has no interfaces, dropping");
            br.remove_port(i);
        } else {
            i += 1;
        }
    }
}

/// Phase 4c: interfaces the datapath does not know cannot forward;
/// they are dropped for this cycle and retried on the next reconfigure.
fn prune_unbound_ifaces(br: &mut Bridge) {
    let mut i = 0;
    while i < br.ports.len() {
        let mut j = 0;
        while j < br.ports[i].ifaces.len() {
            if br.ports[i].ifaces[j].dp_ifidx.is_some() {
                j += 1;
            } else {
                error!(
                    bridge = %br.name,
                    iface = %br.ports[i].ifaces[j].name,
                    "interface not in datapath, dropping"
                );
                br.remove_iface(i, j);
            }
        }
        if br.ports[i].ifaces.is_empty() {
            error!(bridge = %br.name, port = %br.ports[i].name, "port has no interfaces, dropping");
            br.remove_port(i);
        } else {
            i += 1;
        }
    }
}

/// Phase 5: choose the bridge Ethernet address. A configured `hwaddr`
/// wins; otherwise the lexicographically smallest qualifying MAC among
/// the ports; otherwise the bridge's random default.
fn pick_local_hw_addr(br: &Bridge, bcfg: &BridgeConfig) -> (MacAddress, Option<(usize, usize)>) {
    if let Some(hwaddr) = bcfg.other_config("hwaddr") {
        match hwaddr.parse::<MacAddress>() {
            Ok(ea) if ea.is_multicast() => {
                error!(bridge = %br.name, %ea, "cannot set MAC address to a multicast address");
            }
            Ok(ea) if ea.is_zero() => {
                error!(bridge = %br.name, "cannot set MAC address to zero");
            }
            Ok(ea) => return (ea, None),
            Err(_) => error!(bridge = %br.name, hwaddr, "invalid hwaddr"),
        }
    }

    let mut best: Option<(MacAddress, Option<(usize, usize)>)> = None;
    for (pi, port) in br.ports.iter().enumerate() {
        // Mirror output ports don't participate.
        if port.is_mirror_output_port {
            continue;
        }

        let (iface_ea, iface_loc) = if let Some(cfg_ea) = port.cfg_mac {
            // Find the interface carrying the configured address, so the
            // datapath-ID derivation can consult its device.
            let loc = port
                .ifaces
                .iter()
                .enumerate()
                .find(|(_, i)| {
                    i.netdev
                        .as_ref()
                        .and_then(|nd| nd.ether_addr().ok())
                        .is_some_and(|ea| ea == cfg_ea)
                })
                .map(|(j, _)| (pi, j));
            (cfg_ea, loc)
        } else {
            // The kernel bonding driver uses the first slave's address and
            // slaves are conventionally attached in name order, so the
            // alphabetically first interface represents the port.
            let Some((j, iface)) = port
                .ifaces
                .iter()
                .enumerate()
                .min_by(|(_, a), (_, b)| a.name.cmp(&b.name))
            else {
                continue;
            };
            if iface.dp_ifidx == Some(DP_LOCAL_PORT) {
                // The local port is the one we are choosing an address for.
                continue;
            }
            let Some(ea) = iface.netdev.as_ref().and_then(|nd| nd.ether_addr().ok()) else {
                warn!(iface = %iface.name, "failed to obtain Ethernet address");
                continue;
            };
            (ea, Some((pi, j)))
        };

        if iface_ea.is_multicast()
            || iface_ea.is_local()
            || iface_ea.is_reserved()
            || iface_ea.is_zero()
        {
            continue;
        }
        if best.as_ref().map_or(true, |(ea, _)| iface_ea < *ea) {
            best = Some((iface_ea, iface_loc));
        }
    }

    match best {
        Some((ea, loc)) => {
            debug!(bridge = %br.name, %ea, "using bridge Ethernet address");
            (ea, loc)
        }
        None => {
            warn!(bridge = %br.name, ea = %br.default_ea, "using default bridge Ethernet address");
            (br.default_ea, None)
        }
    }
}

/// Phase 5: choose the datapath ID.
fn pick_datapath_id(
    br: &Bridge,
    bcfg: &BridgeConfig,
    ea: MacAddress,
    hw_addr_iface: Option<(usize, usize)>,
    host_uuid: Option<&str>,
) -> u64 {
    if let Some(id) = bcfg.other_config("datapath-id") {
        if let Some(dpid) = parse_dpid(id) {
            return dpid;
        }
        warn!(bridge = %br.name, id, "invalid datapath-id");
    }

    if let Some((pi, ii)) = hw_addr_iface {
        let vlan = br.ports[pi].ifaces[ii]
            .netdev
            .as_ref()
            .and_then(|nd| nd.vlan_vid());
        if let Some(vlan) = vlan {
            // The address belongs to a VLAN sub-interface, so another
            // bridge on the underlying device has the same MAC. Mix the
            // VLAN in to stay unique.
            let mut buf = Vec::with_capacity(8);
            buf.extend_from_slice(ea.as_bytes());
            buf.extend_from_slice(&vlan.as_u16().to_be_bytes());
            return dpid_from_hash(&buf);
        }
        ea.to_u64()
    } else if let Some(uuid) = host_uuid {
        // A purely internal bridge has no natural identity; hash the
        // host identity with the bridge name, which is stable across
        // restarts.
        dpid_from_hash(format!("{uuid},{}", br.name).as_bytes())
    } else {
        ea.to_u64()
    }
}

/// Phase 6: NetFlow settings through to the switch.
fn configure_netflow(br: &mut Bridge, bcfg: &BridgeConfig) {
    let Some(nf) = &bcfg.netflow else {
        let _ = br.ofproto.set_netflow(None);
        return;
    };

    let (mut engine_type, mut engine_id) = br.dp.netflow_ids();
    if let Some(t) = nf.engine_type {
        engine_type = t;
    }
    if let Some(id) = nf.engine_id {
        engine_id = id;
    }

    let mut active_timeout = nf.active_timeout.unwrap_or(0);
    if active_timeout == 0 {
        active_timeout = -1;
    } else if active_timeout < 0 {
        warn!(bridge = %br.name, "negative NetFlow active timeout, using default");
        active_timeout = -1;
    }

    if nf.add_id_to_interface {
        if engine_id > 0x7f {
            warn!(
                bridge = %br.name,
                "NetFlow port mangling may conflict with another vswitch, choose an engine id below 128"
            );
        }
        if br.ports.len() > 508 {
            warn!(
                bridge = %br.name,
                "NetFlow port mangling will conflict when more than 508 ports are used"
            );
        }
    }

    let opts = NetflowOptions {
        engine_type,
        engine_id,
        active_timeout,
        add_id_to_iface: nf.add_id_to_interface,
        collectors: nf.targets.clone(),
    };
    if br.ofproto.set_netflow(Some(&opts)).is_err() {
        error!(bridge = %br.name, "problem setting netflow collectors");
    }
}

/// Classful netmask guess for in-band local addresses configured
/// without one.
fn guess_netmask(ip: Ipv4Addr) -> Ipv4Addr {
    match ip.octets()[0] {
        0..=127 => Ipv4Addr::new(255, 0, 0, 0),
        128..=191 => Ipv4Addr::new(255, 255, 0, 0),
        192..=223 => Ipv4Addr::new(255, 255, 255, 0),
        _ => Ipv4Addr::new(255, 255, 255, 255),
    }
}

/// Phase 6: controller attachment (or standalone operation).
fn reconfigure_controller(br: &mut Bridge, c: Option<&ControllerConfig>) {
    // Crossing between controlled and standalone invalidates the whole
    // flow table.
    if br.controller.is_some() != c.is_some() {
        br.ofproto.flush_flows();
    }
    br.controller = c.map(|c| c.target.clone());

    let Some(c) = c else {
        // Standalone: one catch-all flow that sends everything through
        // the NORMAL (learning switch) path, i.e. back into this engine.
        br.ofproto.add_flow(
            &Flow::default(),
            FLOW_WILDCARD_ALL,
            0,
            &[DpAction::Output(OFPP_NORMAL)],
            0,
        );
        br.ofproto.set_in_band(false);
        br.ofproto.set_max_backoff(1);
        br.ofproto.set_probe_interval(5);
        br.ofproto.set_failure_open(false);
        br.ofproto.set_controller(None);
        return;
    };

    if c.target == "discover" {
        br.ofproto.set_discovery(
            true,
            c.discover_accept_regex.as_deref(),
            c.discover_update_resolv_conf,
        );
    } else {
        let in_band = c
            .connection_mode
            .as_deref()
            .map_or(true, |mode| mode != "out-of-band");
        br.ofproto.set_discovery(false, None, false);
        br.ofproto.set_in_band(in_band);

        if let Some((pi, ii)) = br.local_iface() {
            if let Some(ip) = c.local_ip.as_deref().and_then(|s| s.parse::<Ipv4Addr>().ok()) {
                let mask = c
                    .local_netmask
                    .as_deref()
                    .and_then(|s| s.parse::<Ipv4Addr>().ok())
                    .unwrap_or_else(|| guess_netmask(ip));
                let gateway = c
                    .local_gateway
                    .as_deref()
                    .and_then(|s| s.parse::<Ipv4Addr>().ok());
                let name = br.name.clone();
                if let Some(nd) = br.ports[pi].ifaces[ii].netdev.as_mut() {
                    let _ = nd.set_up(true);
                    if nd.set_in4(ip, mask).is_ok() {
                        info!(bridge = %name, %ip, %mask, "configured local IP address");
                    }
                    if let Some(gw) = gateway {
                        if nd.add_router(gw).is_ok() {
                            info!(bridge = %name, gateway = %gw, "configured gateway");
                        }
                    }
                }
            }
        }
    }

    let fail_open = c
        .fail_mode
        .as_deref()
        .map_or(true, |mode| mode == "standalone" || mode == "open");
    br.ofproto.set_failure_open(fail_open);

    let probe_secs = c.inactivity_probe.map_or(5, |ms| ms / 1000);
    br.ofproto.set_probe_interval(probe_secs);

    let backoff_secs = c.max_backoff.map_or(8, |ms| ms / 1000);
    br.ofproto.set_max_backoff(backoff_secs);

    let rate = c.controller_rate_limit.unwrap_or(0);
    let burst = c.controller_burst_limit.unwrap_or(0);
    br.ofproto.set_rate_limit(rate, burst);

    br.ofproto.set_controller(Some(&c.target));
}

/// Phase 6: bond state follows the interface count across the
/// one-or-many boundary.
fn update_bonding(br: &mut Bridge, port_idx: usize) {
    if br.ports[port_idx].ifaces.len() < 2 {
        if br.ports[port_idx].bond.take().is_some() {
            br.ports[port_idx].fake_iface = false;
        }
    } else {
        if br.ports[port_idx].bond.is_none() {
            br.ports[port_idx].bond = Some(Bond::new());
            let Bridge {
                ports, ml, ofproto, ..
            } = br;
            bond::choose_active_iface(&mut ports[port_idx], false, ml, ofproto.as_mut());
        }
        if let Some(bond) = br.ports[port_idx].bond.as_mut() {
            bond.compat_stale = true;
        }
    }
}

/// Phase 7: policing and configured MACs.
fn apply_iface_properties(br: &mut Bridge) {
    let mut internal_flags: Vec<(usize, usize, bool)> = Vec::new();
    for (pi, port) in br.ports.iter().enumerate() {
        for (ii, iface) in port.ifaces.iter().enumerate() {
            internal_flags.push((pi, ii, br.iface_is_internal(&iface.name)));
        }
    }

    for (pi, ii, internal) in internal_flags {
        let iface = &mut br.ports[pi].ifaces[ii];
        let rate = iface.cfg.ingress_policing_rate;
        let burst = iface.cfg.ingress_policing_burst;
        let cfg_mac = iface.cfg.mac.clone();
        let is_local = iface.dp_ifidx == Some(DP_LOCAL_PORT);
        let Some(nd) = iface.netdev.as_mut() else {
            continue;
        };
        let _ = nd.set_policing(rate, burst);

        if internal && !is_local {
            if let Some(mac) = cfg_mac.as_deref().and_then(|s| s.parse::<MacAddress>().ok()) {
                if mac.is_multicast() {
                    error!(iface = %nd.name(), "cannot set MAC to a multicast address");
                } else if let Err(e) = nd.set_ether_addr(mac) {
                    error!(iface = %nd.name(), error = %e, "setting MAC failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MirrorConfig, SslConfig};
    use crate::sim::Sim;
    use pretty_assertions::assert_eq;

    /// A universally administered (globally unique) address, eligible
    /// for bridge-address selection.
    fn global_mac(last: u8) -> MacAddress {
        MacAddress::new([0x00, 0x10, 0x20, 0x30, 0x40, last])
    }

    fn engine(sim: &Sim) -> BridgeEngine {
        let (dp, net, of) = sim.providers();
        BridgeEngine::new(dp, net, of)
    }

    fn standard_config() -> NetworkConfig {
        NetworkConfig {
            bridges: vec![BridgeConfig {
                name: "br0".into(),
                ports: vec![
                    PortConfig {
                        name: "p1".into(),
                        interfaces: vec![InterfaceConfig::named("eth1")],
                        tag: Some(10),
                        ..Default::default()
                    },
                    PortConfig {
                        name: "p2".into(),
                        interfaces: vec![InterfaceConfig::named("eth2")],
                        tag: Some(10),
                        ..Default::default()
                    },
                    PortConfig {
                        name: "p3".into(),
                        interfaces: vec![
                            InterfaceConfig::named("eth3a"),
                            InterfaceConfig::named("eth3b"),
                        ],
                        trunks: vec![10, 20],
                        bond_updelay: 100,
                        bond_downdelay: 200,
                        ..Default::default()
                    },
                ],
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    fn standard_sim() -> Sim {
        let sim = Sim::new();
        sim.add_netdev("eth1", global_mac(0x11), true);
        sim.add_netdev("eth2", global_mac(0x12), true);
        sim.add_netdev("eth3a", global_mac(0x13), true);
        sim.add_netdev("eth3b", global_mac(0x14), true);
        sim
    }

    #[test]
    fn test_initial_convergence() {
        let sim = standard_sim();
        let mut eng = engine(&sim);
        eng.init(&standard_config(), 0);

        assert!(eng.exists("br0"));
        let br = eng.bridge("br0").unwrap();
        assert_eq!(br.ports().len(), 3);

        // Datapath ports were added in name order after the local port.
        let dp_ports = sim.dp_ports("br0");
        assert_eq!(
            dp_ports,
            vec![
                (0, "br0".to_string()),
                (1, "eth1".to_string()),
                (2, "eth2".to_string()),
                (3, "eth3a".to_string()),
                (4, "eth3b".to_string()),
            ]
        );

        // Interfaces are bound and indexed.
        assert_eq!(br.iface_from_dp_ifidx(1).map(|(p, _)| p), br.ports().iter().position(|p| p.name == "p1"));
        for (i, port) in br.ports().iter().enumerate() {
            assert_eq!(port.port_idx, i);
            for (j, iface) in port.ifaces.iter().enumerate() {
                assert_eq!(iface.port_ifidx, j);
                assert!(iface.dp_ifidx.is_some());
                assert!(iface.netdev.is_some());
            }
        }

        // The bonded port got its bond state and an active slave.
        let p3 = br.ports().iter().find(|p| p.name == "p3").unwrap();
        assert!(p3.bond.is_some());
        assert!(p3.bond.as_ref().unwrap().active_iface.is_some());
        assert_eq!(p3.updelay_ms, 100);
        assert_eq!(p3.downdelay_ms, 200);

        // Bridge address is the minimum interface MAC, and the DPID its
        // promotion.
        assert_eq!(br.datapath_id(), global_mac(0x11).to_u64());
        assert_eq!(sim.switch_datapath_id("br0"), Some(br.datapath_id()));

        // Standalone operation installed the catch-all NORMAL flow.
        let flows = sim.installed_flows("br0");
        assert_eq!(flows.len(), 1);
        assert_eq!(flows[0].actions, vec![DpAction::Output(OFPP_NORMAL)]);
        assert_eq!(sim.switch_controller("br0"), None);
    }

    #[test]
    fn test_port_removal_deletes_dp_port_and_flushes() {
        let sim = standard_sim();
        let mut eng = engine(&sim);
        eng.init(&standard_config(), 0);

        let mut cfg = standard_config();
        cfg.bridges[0].ports.retain(|p| p.name != "p2");
        eng.reconfigure(&cfg, 1000);

        let br = eng.bridge("br0").unwrap();
        assert_eq!(br.ports().len(), 2);
        assert!(br.flush_pending());
        assert!(sim.dp_deleted_ports("br0").contains(&"eth2".to_string()));
        assert_eq!(br.iface_from_dp_ifidx(2), None);
        // Indices still dense.
        for (i, port) in br.ports().iter().enumerate() {
            assert_eq!(port.port_idx, i);
        }
    }

    #[test]
    fn test_bridge_removal_deletes_datapath() {
        let sim = standard_sim();
        let mut eng = engine(&sim);
        eng.init(&standard_config(), 0);
        assert_eq!(sim.datapath_names(), vec!["br0".to_string()]);

        eng.reconfigure(&NetworkConfig::default(), 1000);
        assert!(!eng.exists("br0"));
        assert!(sim.datapath_names().is_empty());
    }

    #[test]
    fn test_init_deletes_stale_datapaths() {
        let sim = standard_sim();
        sim.add_stale_datapath("br-old");
        let mut eng = engine(&sim);
        eng.init(&standard_config(), 0);
        assert_eq!(sim.datapath_names(), vec!["br0".to_string()]);
    }

    #[test]
    fn test_configured_hwaddr_wins() {
        let sim = standard_sim();
        let mut eng = engine(&sim);
        let mut cfg = standard_config();
        // A local port so the chosen address lands on a device.
        cfg.bridges[0].ports.push(PortConfig {
            name: "br0".into(),
            interfaces: vec![InterfaceConfig {
                name: "br0".into(),
                kind: "internal".into(),
                ..Default::default()
            }],
            ..Default::default()
        });
        cfg.bridges[0]
            .other_config
            .insert("hwaddr".into(), "00:11:22:33:44:55".into());
        eng.init(&cfg, 0);
        let br = eng.bridge("br0").unwrap();
        assert_eq!(br.datapath_id(), 0x0000_0011_2233_4455);
        // The local port's device carries the chosen address.
        assert_eq!(
            sim.netdev_mac("br0"),
            Some("00:11:22:33:44:55".parse().unwrap())
        );
    }

    #[test]
    fn test_configured_datapath_id_wins() {
        let sim = standard_sim();
        let mut eng = engine(&sim);
        let mut cfg = standard_config();
        cfg.bridges[0]
            .other_config
            .insert("datapath-id".into(), "00000000fe01".into());
        eng.init(&cfg, 0);
        assert_eq!(eng.get_datapath_id("br0"), Some(0xfe01));
    }

    #[test]
    fn test_dpid_from_vlan_subinterface_is_hashed() {
        let sim = Sim::new();
        sim.add_vlan_netdev("eth1.5", global_mac(0x11), true, VlanId::new(5).unwrap());
        let mut eng = engine(&sim);
        let cfg = NetworkConfig {
            bridges: vec![BridgeConfig {
                name: "br0".into(),
                ports: vec![PortConfig {
                    name: "p1".into(),
                    interfaces: vec![InterfaceConfig::named("eth1.5")],
                    ..Default::default()
                }],
                ..Default::default()
            }],
            ..Default::default()
        };
        eng.init(&cfg, 0);
        let dpid = eng.get_datapath_id("br0").unwrap();
        assert_ne!(dpid, global_mac(0x11).to_u64());
        // The hash-derived address is unicast and locally administered.
        let first_octet = (dpid >> 40) as u8;
        assert_eq!(first_octet & 0x01, 0);
        assert_eq!(first_octet & 0x02, 0x02);
    }

    #[test]
    fn test_host_uuid_feeds_internal_bridge_dpid() {
        let sim = Sim::new();
        let mut eng = engine(&sim).with_host_uuid("host-1234");
        let cfg = NetworkConfig {
            bridges: vec![BridgeConfig {
                name: "br0".into(),
                ..Default::default()
            }],
            ..Default::default()
        };
        eng.init(&cfg, 0);
        let dpid_a = eng.get_datapath_id("br0").unwrap();

        // Deterministic: same uuid and name hash to the same ID.
        let sim2 = Sim::new();
        let mut eng2 = engine(&sim2).with_host_uuid("host-1234");
        eng2.init(&cfg, 0);
        assert_eq!(eng2.get_datapath_id("br0"), Some(dpid_a));
    }

    #[test]
    fn test_duplicate_iface_across_ports_dropped() {
        let sim = standard_sim();
        let mut eng = engine(&sim);
        let mut cfg = standard_config();
        // eth1 is also claimed by p2 (visited after p1).
        cfg.bridges[0].ports[1].interfaces = vec![InterfaceConfig::named("eth1")];
        eng.init(&cfg, 0);

        let br = eng.bridge("br0").unwrap();
        // p2 lost its only interface and was pruned.
        assert!(br.ports().iter().all(|p| p.name != "p2"));
        assert!(br.ports().iter().any(|p| p.name == "p1"));
    }

    #[test]
    fn test_missing_netdev_prunes_iface_and_port() {
        let sim = standard_sim();
        sim.remove_netdev("eth2");
        let mut eng = engine(&sim);
        eng.init(&standard_config(), 0);

        let br = eng.bridge("br0").unwrap();
        assert!(br.ports().iter().all(|p| p.name != "p2"));
        assert_eq!(br.ports().len(), 2);
    }

    #[test]
    fn test_ssl_set_and_cleared() {
        let sim = standard_sim();
        let mut eng = engine(&sim);
        let mut cfg = standard_config();
        cfg.ssl = Some(SslConfig {
            private_key: "/etc/key.pem".into(),
            certificate: "/etc/cert.pem".into(),
            ca_cert: "/etc/ca.pem".into(),
            bootstrap_ca_cert: false,
        });
        eng.init(&cfg, 0);
        assert_eq!(sim.ssl().unwrap().private_key, "/etc/key.pem");

        cfg.ssl = None;
        eng.reconfigure(&cfg, 1000);
        assert!(sim.ssl().is_none());
    }

    #[test]
    fn test_controller_configuration() {
        let sim = standard_sim();
        let mut eng = engine(&sim);
        let mut cfg = standard_config();
        cfg.bridges[0].controller = Some(ControllerConfig {
            target: "tcp:10.0.0.1:6633".into(),
            connection_mode: Some("out-of-band".into()),
            inactivity_probe: Some(30_000),
            max_backoff: Some(15_000),
            fail_mode: Some("secure".into()),
            ..Default::default()
        });
        eng.init(&cfg, 0);
        assert_eq!(
            sim.switch_controller("br0"),
            Some("tcp:10.0.0.1:6633".to_string())
        );
        // No catch-all flow in controlled mode.
        assert!(sim.installed_flows("br0").is_empty());

        // Dropping the controller flushes flows and installs the
        // catch-all again.
        cfg.bridges[0].controller = None;
        eng.reconfigure(&cfg, 1000);
        assert_eq!(sim.switch_controller("br0"), None);
        assert_eq!(sim.installed_flows("br0").len(), 1);
    }

    #[test]
    fn test_policing_applied() {
        let sim = standard_sim();
        let mut eng = engine(&sim);
        let mut cfg = standard_config();
        cfg.bridges[0].ports[0].interfaces[0].ingress_policing_rate = 1000;
        cfg.bridges[0].ports[0].interfaces[0].ingress_policing_burst = 100;
        eng.init(&cfg, 0);
        assert_eq!(sim.netdev_policing("eth1"), Some((1000, 100)));
    }

    #[test]
    fn test_bond_collapses_when_iface_removed_from_config() {
        let sim = standard_sim();
        let mut eng = engine(&sim);
        eng.init(&standard_config(), 0);

        let mut cfg = standard_config();
        cfg.bridges[0].ports[2].interfaces.truncate(1);
        eng.reconfigure(&cfg, 1000);

        let br = eng.bridge("br0").unwrap();
        let p3 = br.ports().iter().find(|p| p.name == "p3").unwrap();
        assert_eq!(p3.ifaces.len(), 1);
        assert!(p3.bond.is_none());
        assert!(sim.dp_deleted_ports("br0").contains(&"eth3b".to_string()));
    }

    #[test]
    fn test_fake_iface_bond_gets_internal_port() {
        let sim = standard_sim();
        let mut eng = engine(&sim);
        let mut cfg = standard_config();
        cfg.bridges[0].ports[2].bond_fake_iface = true;
        eng.init(&cfg, 0);
        let names: Vec<String> = sim.dp_ports("br0").into_iter().map(|(_, n)| n).collect();
        assert!(names.contains(&"p3".to_string()));
    }

    #[test]
    fn test_mirror_set_reconciled_with_topology() {
        let sim = standard_sim();
        let mut eng = engine(&sim);
        let mut cfg = standard_config();
        cfg.bridges[0].mirrors = vec![MirrorConfig {
            name: "m1".into(),
            select_src_ports: vec!["p1".into()],
            output_port: Some("p2".into()),
            ..Default::default()
        }];
        eng.init(&cfg, 0);

        let br = eng.bridge("br0").unwrap();
        let p1 = br.ports().iter().find(|p| p.name == "p1").unwrap();
        let p2 = br.ports().iter().find(|p| p.name == "p2").unwrap();
        assert_eq!(p1.src_mirrors, 1);
        assert!(p2.is_mirror_output_port);
    }

    #[test]
    fn test_parse_dpid() {
        assert_eq!(parse_dpid("00000000fe01"), Some(0xfe01));
        assert_eq!(parse_dpid("000000000000"), None);
        assert_eq!(parse_dpid("fe01"), None);
        assert_eq!(parse_dpid("00000000fg01"), None);
    }

    #[test]
    fn test_guess_netmask() {
        assert_eq!(
            guess_netmask(Ipv4Addr::new(10, 0, 0, 1)),
            Ipv4Addr::new(255, 0, 0, 0)
        );
        assert_eq!(
            guess_netmask(Ipv4Addr::new(172, 16, 0, 1)),
            Ipv4Addr::new(255, 255, 0, 0)
        );
        assert_eq!(
            guess_netmask(Ipv4Addr::new(192, 168, 1, 1)),
            Ipv4Addr::new(255, 255, 255, 0)
        );
    }

    #[test]
    fn test_vanished_datapath_recovered_by_reconfigure() {
        let sim = standard_sim();
        let mut eng = engine(&sim);
        let cfg = standard_config();
        eng.init(&cfg, 0);

        sim.kill_datapath("br0");
        assert!(eng.run(1000).is_err());
        assert!(!eng.exists("br0"));

        eng.reconfigure(&cfg, 2000);
        assert!(eng.exists("br0"));
        assert_eq!(eng.bridge("br0").unwrap().ports().len(), 3);
    }
}
