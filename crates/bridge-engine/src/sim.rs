//! In-memory collaborators.
//!
//! [`Sim`] is a process-local stand-in for the three external interfaces
//! the engine drives: the kernel datapath, host network devices, and the
//! OpenFlow switch. It records everything the engine does to it (deleted
//! ports, revalidated tags, sent packets, installed flows) so tests can
//! assert on observable behavior, and it backs the standalone daemon when
//! no real adapters are wired in.

use crate::config::SslConfig;
use crate::datapath::{Datapath, DatapathProvider, DpError, DpPort, DpResult, DP_LOCAL_PORT};
use crate::flow::{DpAction, Flow};
use crate::netdev::{NetError, NetResult, Netdev, NetdevProvider};
use crate::ofswitch::{NetflowOptions, OfError, OfResult, OfSwitch, OfSwitchProvider};
use bridge_types::{MacAddress, Tag, VlanId};
use std::collections::{BTreeMap, HashMap};
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, MutexGuard};

/// Highest assignable datapath port number.
const DP_MAX_PORT: u16 = 255;

/// A packet the engine asked the OpenFlow switch to send.
#[derive(Debug, Clone)]
pub struct SentPacket {
    /// The flow describing the packet.
    pub flow: Flow,
    /// The action list it was sent with.
    pub actions: Vec<DpAction>,
    /// Raw frame bytes.
    pub packet: Vec<u8>,
}

/// A flow the engine installed directly.
#[derive(Debug, Clone)]
pub struct InstalledFlow {
    /// Match fields.
    pub flow: Flow,
    /// Wildcard mask.
    pub wildcards: u32,
    /// Priority.
    pub priority: u16,
    /// Actions.
    pub actions: Vec<DpAction>,
    /// Idle timeout, seconds.
    pub idle_timeout: u16,
}

#[derive(Debug, Clone)]
struct DpPortRec {
    devname: String,
    internal: bool,
}

#[derive(Default)]
struct DpState {
    alive: bool,
    next_ifidx: u16,
    ports: BTreeMap<u16, DpPortRec>,
    deleted: Vec<String>,
    flow_flushes: u32,
}

struct NetState {
    kind: String,
    carrier: bool,
    mac: MacAddress,
    vlan_vid: Option<VlanId>,
    up: bool,
    policing: (u32, u32),
    in4: Option<(Ipv4Addr, Ipv4Addr)>,
    routers: Vec<Ipv4Addr>,
    options: HashMap<String, String>,
}

#[derive(Default)]
struct OfState {
    datapath_id: u64,
    mgmt_id: u64,
    controller: Option<String>,
    in_band: bool,
    discovery: bool,
    fail_open: bool,
    probe_interval: u32,
    max_backoff: u32,
    rate_limit: (u32, u32),
    netflow: Option<NetflowOptions>,
    flows: Vec<InstalledFlow>,
    flow_flushes: u32,
    revalidated: Vec<Tag>,
    sent: Vec<SentPacket>,
    run2_flushes: u32,
}

#[derive(Default)]
struct World {
    datapaths: HashMap<String, DpState>,
    netdevs: HashMap<String, NetState>,
    switches: HashMap<String, OfState>,
    ssl: Option<SslConfig>,
}

/// Handle to the simulated host. Clones share the same world.
#[derive(Clone, Default)]
pub struct Sim {
    world: Arc<Mutex<World>>,
}

impl Sim {
    /// Creates an empty simulated host.
    pub fn new() -> Self {
        Sim::default()
    }

    fn lock(&self) -> MutexGuard<'_, World> {
        self.world.lock().expect("sim world poisoned")
    }

    /// The three provider handles to build an engine with.
    pub fn providers(
        &self,
    ) -> (
        Box<dyn DatapathProvider>,
        Box<dyn NetdevProvider>,
        Box<dyn OfSwitchProvider>,
    ) {
        (
            Box::new(SimDatapathProvider { sim: self.clone() }),
            Box::new(SimNetdevProvider { sim: self.clone() }),
            Box::new(SimOfSwitchProvider { sim: self.clone() }),
        )
    }

    /// Registers a host network device.
    pub fn add_netdev(&self, name: &str, mac: MacAddress, carrier: bool) {
        self.lock().netdevs.insert(
            name.to_string(),
            NetState {
                kind: String::new(),
                carrier,
                mac,
                vlan_vid: None,
                up: false,
                policing: (0, 0),
                in4: None,
                routers: Vec::new(),
                options: HashMap::new(),
            },
        );
    }

    /// Registers a VLAN sub-interface device.
    pub fn add_vlan_netdev(&self, name: &str, mac: MacAddress, carrier: bool, vlan: VlanId) {
        self.add_netdev(name, mac, carrier);
        self.lock().netdevs.get_mut(name).unwrap().vlan_vid = Some(vlan);
    }

    /// Removes a host network device.
    pub fn remove_netdev(&self, name: &str) {
        self.lock().netdevs.remove(name);
    }

    /// Changes a device's carrier state.
    pub fn set_carrier(&self, name: &str, carrier: bool) {
        if let Some(nd) = self.lock().netdevs.get_mut(name) {
            nd.carrier = carrier;
        }
    }

    /// The device's current MAC, if the device exists.
    pub fn netdev_mac(&self, name: &str) -> Option<MacAddress> {
        self.lock().netdevs.get(name).map(|n| n.mac)
    }

    /// The device's admin-up flag.
    pub fn netdev_up(&self, name: &str) -> Option<bool> {
        self.lock().netdevs.get(name).map(|n| n.up)
    }

    /// The device's ingress policing settings.
    pub fn netdev_policing(&self, name: &str) -> Option<(u32, u32)> {
        self.lock().netdevs.get(name).map(|n| n.policing)
    }

    /// The device's configured IPv4 address and mask.
    pub fn netdev_in4(&self, name: &str) -> Option<(Ipv4Addr, Ipv4Addr)> {
        self.lock().netdevs.get(name).and_then(|n| n.in4)
    }

    /// The device's configured gateways.
    pub fn netdev_routers(&self, name: &str) -> Vec<Ipv4Addr> {
        self.lock()
            .netdevs
            .get(name)
            .map(|n| n.routers.clone())
            .unwrap_or_default()
    }

    /// Names of the live datapaths.
    pub fn datapath_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .lock()
            .datapaths
            .iter()
            .filter(|(_, dp)| dp.alive)
            .map(|(n, _)| n.clone())
            .collect();
        names.sort();
        names
    }

    /// Pre-creates a datapath (as if left over from an earlier run).
    pub fn add_stale_datapath(&self, name: &str) {
        let mut world = self.lock();
        let dp = world.datapaths.entry(name.to_string()).or_default();
        dp.alive = true;
        if dp.ports.is_empty() {
            dp.ports.insert(
                DP_LOCAL_PORT,
                DpPortRec {
                    devname: name.to_string(),
                    internal: true,
                },
            );
            dp.next_ifidx = 1;
        }
    }

    /// Destroys a datapath behind the engine's back.
    pub fn kill_datapath(&self, name: &str) {
        if let Some(dp) = self.lock().datapaths.get_mut(name) {
            dp.alive = false;
        }
    }

    /// The datapath's port table as `(dp_ifidx, devname)` pairs.
    pub fn dp_ports(&self, name: &str) -> Vec<(u16, String)> {
        self.lock()
            .datapaths
            .get(name)
            .map(|dp| {
                dp.ports
                    .iter()
                    .map(|(&idx, rec)| (idx, rec.devname.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Device names deleted from the datapath, in order.
    pub fn dp_deleted_ports(&self, name: &str) -> Vec<String> {
        self.lock()
            .datapaths
            .get(name)
            .map(|dp| dp.deleted.clone())
            .unwrap_or_default()
    }

    /// Tags revalidated on a switch since the last clear.
    pub fn revalidations(&self, switch: &str) -> Vec<Tag> {
        self.lock()
            .switches
            .get(switch)
            .map(|s| s.revalidated.clone())
            .unwrap_or_default()
    }

    /// Forgets recorded revalidations.
    pub fn clear_revalidations(&self, switch: &str) {
        if let Some(s) = self.lock().switches.get_mut(switch) {
            s.revalidated.clear();
        }
    }

    /// Packets sent through a switch since the last clear.
    pub fn sent_packets(&self, switch: &str) -> Vec<SentPacket> {
        self.lock()
            .switches
            .get(switch)
            .map(|s| s.sent.clone())
            .unwrap_or_default()
    }

    /// Forgets recorded sent packets.
    pub fn clear_sent_packets(&self, switch: &str) {
        if let Some(s) = self.lock().switches.get_mut(switch) {
            s.sent.clear();
        }
    }

    /// Flows installed directly on a switch.
    pub fn installed_flows(&self, switch: &str) -> Vec<InstalledFlow> {
        self.lock()
            .switches
            .get(switch)
            .map(|s| s.flows.clone())
            .unwrap_or_default()
    }

    /// The switch's controller target.
    pub fn switch_controller(&self, switch: &str) -> Option<String> {
        self.lock()
            .switches
            .get(switch)
            .and_then(|s| s.controller.clone())
    }

    /// The switch's datapath ID.
    pub fn switch_datapath_id(&self, switch: &str) -> Option<u64> {
        self.lock().switches.get(switch).map(|s| s.datapath_id)
    }

    /// The switch's NetFlow settings.
    pub fn switch_netflow(&self, switch: &str) -> Option<NetflowOptions> {
        self.lock()
            .switches
            .get(switch)
            .and_then(|s| s.netflow.clone())
    }

    /// How many times `run2` was entered with the flush flag set.
    pub fn run2_flush_count(&self, switch: &str) -> u32 {
        self.lock()
            .switches
            .get(switch)
            .map(|s| s.run2_flushes)
            .unwrap_or(0)
    }

    /// The process-wide SSL settings last applied.
    pub fn ssl(&self) -> Option<SslConfig> {
        self.lock().ssl.clone()
    }

    /// A standalone switch handle for unit tests that drive engine
    /// internals without a full bridge.
    pub fn make_switch(&self, name: &str) -> Box<dyn OfSwitch> {
        self.lock()
            .switches
            .entry(name.to_string())
            .or_default();
        // The switch outlives a missing datapath in unit tests; run1 is
        // the only operation that checks.
        Box::new(SimOfSwitch {
            name: name.to_string(),
            sim: self.clone(),
        })
    }
}

// ---------------------------------------------------------------------------
// Datapath

struct SimDatapathProvider {
    sim: Sim,
}

struct SimDatapath {
    name: String,
    sim: Sim,
}

impl DatapathProvider for SimDatapathProvider {
    fn create_or_open(&mut self, name: &str) -> DpResult<Box<dyn Datapath>> {
        {
            let mut world = self.sim.lock();
            let dp = world.datapaths.entry(name.to_string()).or_default();
            if !dp.alive {
                dp.ports.clear();
                dp.deleted.clear();
                dp.next_ifidx = 0;
            }
            dp.alive = true;
            if dp.ports.is_empty() {
                dp.ports.insert(
                    DP_LOCAL_PORT,
                    DpPortRec {
                        devname: name.to_string(),
                        internal: true,
                    },
                );
                dp.next_ifidx = 1;
            }
            // The local port is an internal device.
            world.netdevs.entry(name.to_string()).or_insert(NetState {
                kind: "internal".to_string(),
                carrier: true,
                mac: MacAddress::random_local(),
                vlan_vid: None,
                up: false,
                policing: (0, 0),
                in4: None,
                routers: Vec::new(),
                options: HashMap::new(),
            });
        }
        Ok(Box::new(SimDatapath {
            name: name.to_string(),
            sim: self.sim.clone(),
        }))
    }

    fn open(&mut self, name: &str) -> DpResult<Box<dyn Datapath>> {
        let world = self.sim.lock();
        match world.datapaths.get(name) {
            Some(dp) if dp.alive => Ok(()),
            _ => Err(DpError::NoSuchDatapath),
        }?;
        drop(world);
        Ok(Box::new(SimDatapath {
            name: name.to_string(),
            sim: self.sim.clone(),
        }))
    }

    fn enumerate(&self) -> DpResult<Vec<String>> {
        Ok(self.sim.datapath_names())
    }
}

impl SimDatapath {
    fn with_state<T>(&self, f: impl FnOnce(&mut DpState, &mut World) -> DpResult<T>) -> DpResult<T> {
        let mut world = self.sim.lock();
        // Take the datapath out to sidestep aliasing with the rest of the
        // world (port_add touches the netdev table too).
        let mut dp = world
            .datapaths
            .remove(&self.name)
            .ok_or(DpError::NoSuchDatapath)?;
        if !dp.alive {
            world.datapaths.insert(self.name.clone(), dp);
            return Err(DpError::Vanished);
        }
        let result = f(&mut dp, &mut world);
        world.datapaths.insert(self.name.clone(), dp);
        result
    }
}

impl Datapath for SimDatapath {
    fn name(&self) -> &str {
        &self.name
    }

    fn port_list(&self) -> DpResult<Vec<DpPort>> {
        self.with_state(|dp, _| {
            Ok(dp
                .ports
                .iter()
                .map(|(&idx, rec)| DpPort {
                    dp_ifidx: idx,
                    devname: rec.devname.clone(),
                    internal: rec.internal,
                })
                .collect())
        })
    }

    fn port_add(&mut self, devname: &str, internal: bool) -> DpResult<u16> {
        self.with_state(|dp, world| {
            if dp.ports.values().any(|rec| rec.devname == devname) {
                return Err(DpError::Other(format!("{devname} already attached")));
            }
            if dp.next_ifidx > DP_MAX_PORT {
                return Err(DpError::PortSpaceExhausted);
            }
            if internal {
                world.netdevs.entry(devname.to_string()).or_insert(NetState {
                    kind: "internal".to_string(),
                    carrier: true,
                    mac: MacAddress::random_local(),
                    vlan_vid: None,
                    up: false,
                    policing: (0, 0),
                    in4: None,
                    routers: Vec::new(),
                    options: HashMap::new(),
                });
            } else if !world.netdevs.contains_key(devname) {
                return Err(DpError::Other(format!("no such device {devname}")));
            }
            let idx = dp.next_ifidx;
            dp.next_ifidx += 1;
            dp.ports.insert(
                idx,
                DpPortRec {
                    devname: devname.to_string(),
                    internal,
                },
            );
            Ok(idx)
        })
    }

    fn port_del(&mut self, dp_ifidx: u16) -> DpResult<()> {
        self.with_state(|dp, _| match dp.ports.remove(&dp_ifidx) {
            Some(rec) => {
                dp.deleted.push(rec.devname);
                Ok(())
            }
            None => Err(DpError::NoSuchPort),
        })
    }

    fn port_get_name(&self, dp_ifidx: u16) -> DpResult<String> {
        self.with_state(|dp, _| {
            dp.ports
                .get(&dp_ifidx)
                .map(|rec| rec.devname.clone())
                .ok_or(DpError::NoSuchPort)
        })
    }

    fn flow_flush(&mut self) -> DpResult<()> {
        self.with_state(|dp, _| {
            dp.flow_flushes += 1;
            Ok(())
        })
    }

    fn netflow_ids(&self) -> (u8, u8) {
        // Engine type/id derived from the datapath identity.
        let sum: u32 = self.name.bytes().map(u32::from).sum();
        (0, (sum & 0x7f) as u8)
    }

    fn delete(&mut self) -> DpResult<()> {
        let mut world = self.sim.lock();
        match world.datapaths.get_mut(&self.name) {
            Some(dp) if dp.alive => {
                dp.alive = false;
                Ok(())
            }
            _ => Err(DpError::NoSuchDatapath),
        }
    }
}

// ---------------------------------------------------------------------------
// Netdev

struct SimNetdevProvider {
    sim: Sim,
}

struct SimNetdev {
    name: String,
    sim: Sim,
}

impl NetdevProvider for SimNetdevProvider {
    fn open(
        &mut self,
        name: &str,
        kind: &str,
        options: &HashMap<String, String>,
        may_create: bool,
        may_open: bool,
    ) -> NetResult<Box<dyn Netdev>> {
        let mut world = self.sim.lock();
        match world.netdevs.get_mut(name) {
            Some(existing) => {
                if existing.kind == "internal" && !may_open && kind != "internal" {
                    return Err(NetError::NoSuchDevice(name.to_string()));
                }
                if !kind.is_empty() && !existing.kind.is_empty() && existing.kind != kind {
                    return Err(NetError::TypeMismatch(name.to_string()));
                }
                existing.options = options.clone();
            }
            None => {
                // Only virtual device types can be conjured into existence.
                if !(may_create && !kind.is_empty() && kind != "system") {
                    return Err(NetError::NoSuchDevice(name.to_string()));
                }
                world.netdevs.insert(
                    name.to_string(),
                    NetState {
                        kind: kind.to_string(),
                        carrier: true,
                        mac: MacAddress::random_local(),
                        vlan_vid: None,
                        up: false,
                        policing: (0, 0),
                        in4: None,
                        routers: Vec::new(),
                        options: options.clone(),
                    },
                );
            }
        }
        drop(world);
        Ok(Box::new(SimNetdev {
            name: name.to_string(),
            sim: self.sim.clone(),
        }))
    }
}

impl SimNetdev {
    fn with_state<T>(&self, f: impl FnOnce(&mut NetState) -> T) -> NetResult<T> {
        let mut world = self.sim.lock();
        world
            .netdevs
            .get_mut(&self.name)
            .map(f)
            .ok_or_else(|| NetError::NoSuchDevice(self.name.clone()))
    }
}

impl Netdev for SimNetdev {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &str {
        "system"
    }

    fn reconfigure(&mut self, options: &HashMap<String, String>) -> NetResult<()> {
        self.with_state(|nd| nd.options = options.clone())
    }

    fn carrier(&self) -> NetResult<bool> {
        self.with_state(|nd| nd.carrier)
    }

    fn ether_addr(&self) -> NetResult<MacAddress> {
        self.with_state(|nd| nd.mac)
    }

    fn set_ether_addr(&mut self, mac: MacAddress) -> NetResult<()> {
        self.with_state(|nd| nd.mac = mac)
    }

    fn vlan_vid(&self) -> Option<VlanId> {
        self.with_state(|nd| nd.vlan_vid).ok().flatten()
    }

    fn set_policing(&mut self, rate_kbps: u32, burst_kb: u32) -> NetResult<()> {
        self.with_state(|nd| nd.policing = (rate_kbps, burst_kb))
    }

    fn set_up(&mut self, up: bool) -> NetResult<()> {
        self.with_state(|nd| nd.up = up)
    }

    fn set_in4(&mut self, addr: Ipv4Addr, mask: Ipv4Addr) -> NetResult<()> {
        self.with_state(|nd| nd.in4 = Some((addr, mask)))
    }

    fn add_router(&mut self, gateway: Ipv4Addr) -> NetResult<()> {
        self.with_state(|nd| nd.routers.push(gateway))
    }
}

// ---------------------------------------------------------------------------
// OpenFlow switch

struct SimOfSwitchProvider {
    sim: Sim,
}

struct SimOfSwitch {
    name: String,
    sim: Sim,
}

impl OfSwitchProvider for SimOfSwitchProvider {
    fn create(&mut self, name: &str) -> OfResult<Box<dyn OfSwitch>> {
        self.sim
            .lock()
            .switches
            .insert(name.to_string(), OfState::default());
        Ok(Box::new(SimOfSwitch {
            name: name.to_string(),
            sim: self.sim.clone(),
        }))
    }

    fn set_ssl(&mut self, ssl: Option<&SslConfig>) {
        self.sim.lock().ssl = ssl.cloned();
    }
}

impl SimOfSwitch {
    fn with_state<T>(&self, f: impl FnOnce(&mut OfState) -> T) -> T {
        let mut world = self.sim.lock();
        let state = world.switches.entry(self.name.clone()).or_default();
        f(state)
    }
}

impl OfSwitch for SimOfSwitch {
    fn run1(&mut self) -> OfResult<()> {
        let world = self.sim.lock();
        match world.datapaths.get(&self.name) {
            Some(dp) if dp.alive => Ok(()),
            Some(_) => Err(OfError::DatapathGone),
            // Unit tests drive a switch without a datapath; that is fine.
            None => Ok(()),
        }
    }

    fn run2(&mut self, flush: bool) -> OfResult<()> {
        self.with_state(|s| {
            if flush {
                s.run2_flushes += 1;
            }
        });
        Ok(())
    }

    fn wait(&self) {}

    fn set_datapath_id(&mut self, dpid: u64) {
        self.with_state(|s| s.datapath_id = dpid);
    }

    fn datapath_id(&self) -> u64 {
        self.with_state(|s| s.datapath_id)
    }

    fn set_mgmt_id(&mut self, mgmt_id: u64) {
        self.with_state(|s| s.mgmt_id = mgmt_id);
    }

    fn set_controller(&mut self, target: Option<&str>) {
        self.with_state(|s| s.controller = target.map(str::to_string));
    }

    fn set_in_band(&mut self, in_band: bool) {
        self.with_state(|s| s.in_band = in_band);
    }

    fn set_discovery(&mut self, discover: bool, _accept_regex: Option<&str>, _update_resolv: bool) {
        self.with_state(|s| s.discovery = discover);
    }

    fn set_failure_open(&mut self, fail_open: bool) {
        self.with_state(|s| s.fail_open = fail_open);
    }

    fn set_probe_interval(&mut self, secs: u32) {
        self.with_state(|s| s.probe_interval = secs);
    }

    fn set_max_backoff(&mut self, secs: u32) {
        self.with_state(|s| s.max_backoff = secs);
    }

    fn set_rate_limit(&mut self, rate: u32, burst: u32) {
        self.with_state(|s| s.rate_limit = (rate, burst));
    }

    fn set_netflow(&mut self, options: Option<&NetflowOptions>) -> OfResult<()> {
        self.with_state(|s| s.netflow = options.cloned());
        Ok(())
    }

    fn add_flow(
        &mut self,
        flow: &Flow,
        wildcards: u32,
        priority: u16,
        actions: &[DpAction],
        idle_timeout: u16,
    ) {
        self.with_state(|s| {
            s.flows.push(InstalledFlow {
                flow: flow.clone(),
                wildcards,
                priority,
                actions: actions.to_vec(),
                idle_timeout,
            })
        });
    }

    fn flush_flows(&mut self) {
        self.with_state(|s| {
            s.flows.clear();
            s.flow_flushes += 1;
        });
    }

    fn revalidate(&mut self, tag: Tag) {
        self.with_state(|s| s.revalidated.push(tag));
    }

    fn dump_flows(&self) -> String {
        self.with_state(|s| {
            let mut out = String::new();
            for f in &s.flows {
                out.push_str(&format!(
                    "priority={} in_port={} dl_src={} dl_dst={} actions={:?}\n",
                    f.priority, f.flow.in_port, f.flow.dl_src, f.flow.dl_dst, f.actions
                ));
            }
            out
        })
    }

    fn send_packet(&mut self, flow: &Flow, actions: &[DpAction], packet: &[u8]) -> OfResult<()> {
        self.with_state(|s| {
            s.sent.push(SentPacket {
                flow: flow.clone(),
                actions: actions.to_vec(),
                packet: packet.to_vec(),
            })
        });
        Ok(())
    }
}
