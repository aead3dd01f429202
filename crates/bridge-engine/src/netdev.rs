//! The network-device interface.

use bridge_types::{MacAddress, VlanId};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use thiserror::Error;

/// Result type for netdev operations.
pub type NetResult<T> = Result<T, NetError>;

/// Network-device operation failures. These are all transient from the
/// engine's point of view: the interface is pruned for this cycle and
/// retried on the next reconfigure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NetError {
    /// The device does not exist and may not be created.
    #[error("no such network device: {0}")]
    NoSuchDevice(String),
    /// The requested device type conflicts with the existing device.
    #[error("device {0}: type mismatch")]
    TypeMismatch(String),
    /// The operation is not supported by this device.
    #[error("operation not supported")]
    NotSupported,
    /// Anything else.
    #[error("netdev error: {0}")]
    Other(String),
}

/// A handle to one host network device.
pub trait Netdev: Send {
    /// Device name.
    fn name(&self) -> &str;

    /// Device type (`"system"`, `"internal"`, ...).
    fn kind(&self) -> &str;

    /// Re-applies device-type-specific options.
    fn reconfigure(&mut self, options: &HashMap<String, String>) -> NetResult<()>;

    /// Current carrier (link) state.
    fn carrier(&self) -> NetResult<bool>;

    /// The device's Ethernet address.
    fn ether_addr(&self) -> NetResult<MacAddress>;

    /// Sets the device's Ethernet address.
    fn set_ether_addr(&mut self, mac: MacAddress) -> NetResult<()>;

    /// If the device is a VLAN sub-interface, the VLAN it carries.
    fn vlan_vid(&self) -> Option<VlanId>;

    /// Configures ingress policing; a rate of 0 disables it.
    fn set_policing(&mut self, rate_kbps: u32, burst_kb: u32) -> NetResult<()>;

    /// Brings the device administratively up or down.
    fn set_up(&mut self, up: bool) -> NetResult<()>;

    /// Assigns an IPv4 address and netmask.
    fn set_in4(&mut self, addr: Ipv4Addr, mask: Ipv4Addr) -> NetResult<()>;

    /// Adds a default route through `gateway`.
    fn add_router(&mut self, gateway: Ipv4Addr) -> NetResult<()>;
}

/// Factory for netdev handles.
pub trait NetdevProvider: Send {
    /// Opens a device. `may_create` permits creating a device of the given
    /// `kind`; `may_open` additionally permits opening datapath-internal
    /// devices that already exist.
    fn open(
        &mut self,
        name: &str,
        kind: &str,
        options: &HashMap<String, String>,
        may_create: bool,
        may_open: bool,
    ) -> NetResult<Box<dyn Netdev>>;
}
