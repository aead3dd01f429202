//! The kernel datapath interface.
//!
//! The datapath is the fast-path packet mover: a numbered port table plus a
//! flow cache. The engine only ever talks to it through this trait; the
//! real kernel adapter lives outside this crate, and [`crate::sim`]
//! provides the in-memory stand-in.

use thiserror::Error;

/// The datapath port number of the local (bridge-named) port.
pub const DP_LOCAL_PORT: u16 = 0;

/// Result type for datapath operations.
pub type DpResult<T> = Result<T, DpError>;

/// Datapath operation failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DpError {
    /// The port number space is exhausted; the caller should abort its
    /// port-add loop for this datapath but keep running.
    #[error("datapath port number space exhausted")]
    PortSpaceExhausted,
    /// No port with the given number. Non-fatal on delete.
    #[error("no such datapath port")]
    NoSuchPort,
    /// No datapath with the given name.
    #[error("no such datapath")]
    NoSuchDatapath,
    /// The datapath disappeared underneath us.
    #[error("datapath disappeared")]
    Vanished,
    /// Anything else.
    #[error("datapath error: {0}")]
    Other(String),
}

/// One row of the datapath's port table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DpPort {
    /// Kernel port number, stable for the life of the datapath port.
    pub dp_ifidx: u16,
    /// Host device name.
    pub devname: String,
    /// Whether the device is simulated entirely inside the datapath.
    pub internal: bool,
}

/// A handle to one datapath instance.
pub trait Datapath: Send {
    /// The datapath name (same as the bridge name).
    fn name(&self) -> &str;

    /// Lists the current port table.
    fn port_list(&self) -> DpResult<Vec<DpPort>>;

    /// Attaches a device, returning its assigned port number. `internal`
    /// asks the datapath to create a virtual device of that name.
    fn port_add(&mut self, devname: &str, internal: bool) -> DpResult<u16>;

    /// Detaches a port.
    fn port_del(&mut self, dp_ifidx: u16) -> DpResult<()>;

    /// Resolves a port number to its device name.
    fn port_get_name(&self, dp_ifidx: u16) -> DpResult<String>;

    /// Drops every cached flow.
    fn flow_flush(&mut self) -> DpResult<()>;

    /// NetFlow engine type and ID derived from this datapath.
    fn netflow_ids(&self) -> (u8, u8);

    /// Destroys the datapath itself.
    fn delete(&mut self) -> DpResult<()>;
}

/// Factory for datapath handles.
pub trait DatapathProvider: Send {
    /// Opens the named datapath, creating it if necessary.
    fn create_or_open(&mut self, name: &str) -> DpResult<Box<dyn Datapath>>;

    /// Opens an existing datapath.
    fn open(&mut self, name: &str) -> DpResult<Box<dyn Datapath>>;

    /// Names of every datapath present on the host.
    fn enumerate(&self) -> DpResult<Vec<String>>;
}
