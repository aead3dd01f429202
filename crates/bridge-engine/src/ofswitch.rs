//! The OpenFlow switch interface.
//!
//! The OpenFlow side (controller client, flow table, TLS) is an external
//! collaborator; the engine drives it through this trait and receives the
//! hook calls (`on_normal_flow` and friends) in return.

use crate::config::SslConfig;
use crate::flow::{DpAction, Flow};
use bridge_types::Tag;
use thiserror::Error;

/// Result type for OpenFlow operations.
pub type OfResult<T> = Result<T, OfError>;

/// OpenFlow switch failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OfError {
    /// The underlying datapath went away; the caller should reconfigure.
    #[error("datapath gone")]
    DatapathGone,
    /// Anything else.
    #[error("openflow error: {0}")]
    Other(String),
}

/// Wildcard mask matching every flow field.
pub const FLOW_WILDCARD_ALL: u32 = u32::MAX;

/// NetFlow settings handed to the switch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetflowOptions {
    /// NetFlow engine type.
    pub engine_type: u8,
    /// NetFlow engine ID.
    pub engine_id: u8,
    /// Active-flow timeout in seconds; -1 means the collector default.
    pub active_timeout: i32,
    /// Encode the engine ID into the output interface field.
    pub add_id_to_iface: bool,
    /// Collector addresses.
    pub collectors: Vec<String>,
}

/// A handle to one bridge's OpenFlow switch.
pub trait OfSwitch: Send {
    /// First half of the per-tick work (datapath upcall processing). An
    /// error here means the datapath vanished.
    fn run1(&mut self) -> OfResult<()>;

    /// Second half of the per-tick work. `flush` purges every cached flow
    /// first (set after configuration changes invalidated them wholesale).
    fn run2(&mut self, flush: bool) -> OfResult<()>;

    /// Registers wakeups with the poll loop.
    fn wait(&self);

    /// Sets the 64-bit datapath ID.
    fn set_datapath_id(&mut self, dpid: u64);

    /// The current datapath ID.
    fn datapath_id(&self) -> u64;

    /// Sets the management ID.
    fn set_mgmt_id(&mut self, mgmt_id: u64);

    /// Points the switch at a controller, or detaches it.
    fn set_controller(&mut self, target: Option<&str>);

    /// Selects in-band or out-of-band control.
    fn set_in_band(&mut self, in_band: bool);

    /// Enables or disables controller discovery.
    fn set_discovery(&mut self, discover: bool, accept_regex: Option<&str>, update_resolv: bool);

    /// Selects fail-open (standalone) behavior on controller loss.
    fn set_failure_open(&mut self, fail_open: bool);

    /// Controller inactivity probe interval, seconds.
    fn set_probe_interval(&mut self, secs: u32);

    /// Maximum controller reconnection backoff, seconds.
    fn set_max_backoff(&mut self, secs: u32);

    /// Controller packet-in rate limiting.
    fn set_rate_limit(&mut self, rate: u32, burst: u32);

    /// Applies or clears NetFlow export settings.
    fn set_netflow(&mut self, options: Option<&NetflowOptions>) -> OfResult<()>;

    /// Installs a flow directly (bypassing the controller).
    fn add_flow(
        &mut self,
        flow: &Flow,
        wildcards: u32,
        priority: u16,
        actions: &[DpAction],
        idle_timeout: u16,
    );

    /// Removes every installed flow.
    fn flush_flows(&mut self);

    /// Invalidates every cached flow decision that consulted `tag`.
    fn revalidate(&mut self, tag: Tag);

    /// Renders the full flow table for diagnostics.
    fn dump_flows(&self) -> String;

    /// Sends a packet with an explicit action list.
    fn send_packet(&mut self, flow: &Flow, actions: &[DpAction], packet: &[u8]) -> OfResult<()>;
}

/// Factory for OpenFlow switch handles, plus process-wide TLS settings.
pub trait OfSwitchProvider: Send {
    /// Creates the switch for a bridge.
    fn create(&mut self, name: &str) -> OfResult<Box<dyn OfSwitch>>;

    /// Applies TLS settings for controller connections. `None` clears any
    /// previously applied settings.
    fn set_ssl(&mut self, ssl: Option<&SslConfig>);
}
