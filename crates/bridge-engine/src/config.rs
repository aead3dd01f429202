//! Declarative configuration records.
//!
//! The engine converges live state onto one of these snapshots on every
//! [`crate::BridgeEngine::reconfigure`]. The records are serde-derived so
//! the daemon can load them straight from JSON; every field that can be
//! absent has a default, so partial documents stay valid.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Top-level configuration: the set of bridges plus process-wide settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Desired bridges.
    pub bridges: Vec<BridgeConfig>,
    /// TLS material for controller connections; `None` clears any
    /// previously applied settings.
    pub ssl: Option<SslConfig>,
    /// Default controller, used by bridges that do not set their own.
    pub controller: Option<ControllerConfig>,
    /// OpenFlow management ID, 12 hex digits.
    pub management_id: Option<String>,
}

impl NetworkConfig {
    /// Looks up a bridge stanza by name.
    pub fn bridge(&self, name: &str) -> Option<&BridgeConfig> {
        self.bridges.iter().find(|b| b.name == name)
    }
}

/// One bridge: ports, mirrors, and bridge-scoped settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Bridge (and datapath) name.
    pub name: String,
    /// Desired ports.
    pub ports: Vec<PortConfig>,
    /// Desired mirrors.
    pub mirrors: Vec<MirrorConfig>,
    /// Bridge-specific controller, overriding the global one.
    pub controller: Option<ControllerConfig>,
    /// NetFlow export settings.
    pub netflow: Option<NetflowConfig>,
    /// VLANs on which learning is disabled and traffic always floods
    /// (RSPAN VLANs).
    pub flood_vlans: Vec<u16>,
    /// Free-form settings: `hwaddr`, `datapath-id`.
    pub other_config: HashMap<String, String>,
}

impl BridgeConfig {
    /// Reads an `other_config` key.
    pub fn other_config(&self, key: &str) -> Option<&str> {
        self.other_config.get(key).map(String::as_str)
    }
}

/// One port: its interfaces and VLAN/bond settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PortConfig {
    /// Port name.
    pub name: String,
    /// Member interfaces; more than one makes the port a bond.
    pub interfaces: Vec<InterfaceConfig>,
    /// Access VLAN; absent means the port trunks.
    pub tag: Option<u16>,
    /// Trunked VLANs; empty means "trunk everything".
    pub trunks: Vec<u16>,
    /// MAC address to represent the port in bridge-address selection.
    pub mac: Option<String>,
    /// Milliseconds a slave must hold carrier before being enabled.
    pub bond_updelay: u64,
    /// Milliseconds a slave may lack carrier before being disabled.
    pub bond_downdelay: u64,
    /// Create an internal device named after the bond, for tooling that
    /// expects one netdev per aggregate.
    pub bond_fake_iface: bool,
}

/// One interface of a port.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct InterfaceConfig {
    /// Host network device name.
    pub name: String,
    /// Device type; `"internal"` asks the datapath for a virtual device.
    pub kind: String,
    /// Device-type-specific options.
    pub options: HashMap<String, String>,
    /// MAC to assign (internal interfaces only).
    pub mac: Option<String>,
    /// Ingress policing rate in kbit/s; 0 disables.
    pub ingress_policing_rate: u32,
    /// Ingress policing burst in kbit; 0 picks the device default.
    pub ingress_policing_burst: u32,
}

impl InterfaceConfig {
    /// Convenience constructor for a plain system interface.
    pub fn named(name: impl Into<String>) -> Self {
        InterfaceConfig {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Returns true if this interface is declared internal.
    pub fn is_internal(&self) -> bool {
        self.kind == "internal"
    }
}

/// One mirror rule.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MirrorConfig {
    /// Mirror name.
    pub name: String,
    /// Ports whose ingress traffic is selected.
    pub select_src_ports: Vec<String>,
    /// Ports whose egress traffic is selected.
    pub select_dst_ports: Vec<String>,
    /// VLANs selected; empty means any VLAN.
    pub select_vlans: Vec<u16>,
    /// SPAN: mirror to this local port.
    pub output_port: Option<String>,
    /// RSPAN: mirror onto this VLAN.
    pub output_vlan: Option<u16>,
}

/// Controller connection settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Connection target, `"discover"`, or `"none"`.
    pub target: String,
    /// `"in-band"` or `"out-of-band"`; absent means in-band.
    pub connection_mode: Option<String>,
    /// IP to configure on the local port for in-band control.
    pub local_ip: Option<String>,
    /// Netmask for `local_ip`; absent is guessed classfully.
    pub local_netmask: Option<String>,
    /// Default gateway for the local port.
    pub local_gateway: Option<String>,
    /// Inactivity probe interval in milliseconds.
    pub inactivity_probe: Option<u32>,
    /// Maximum reconnection backoff in milliseconds.
    pub max_backoff: Option<u32>,
    /// Controller rate limit, packets per second.
    pub controller_rate_limit: Option<u32>,
    /// Controller burst limit, packets.
    pub controller_burst_limit: Option<u32>,
    /// `"standalone"`/`"open"` (default) or `"secure"`.
    pub fail_mode: Option<String>,
    /// Regex restricting discovered controllers.
    pub discover_accept_regex: Option<String>,
    /// Whether discovery may rewrite resolv.conf.
    pub discover_update_resolv_conf: bool,
}

/// NetFlow export settings, passed through to the OpenFlow switch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NetflowConfig {
    /// Collector addresses.
    pub targets: Vec<String>,
    /// Engine type; absent uses the datapath's value.
    pub engine_type: Option<u8>,
    /// Engine ID; absent uses the datapath's value.
    pub engine_id: Option<u8>,
    /// Active-flow timeout in seconds; 0 or absent means the default.
    pub active_timeout: Option<i32>,
    /// Encode the engine ID into the output interface field.
    pub add_id_to_interface: bool,
}

/// TLS material for controller connections.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SslConfig {
    /// PEM private key file.
    pub private_key: String,
    /// PEM certificate file.
    pub certificate: String,
    /// CA certificate file.
    pub ca_cert: String,
    /// Accept and store the peer CA certificate on first connection.
    pub bootstrap_ca_cert: bool,
}
