//! Parse errors for the domain value types.

use thiserror::Error;

/// Errors produced when parsing domain types from text or raw values.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    /// The string is not a valid MAC address.
    #[error("invalid MAC address: {0}")]
    InvalidMacAddress(String),
    /// The value is outside the VLAN ID space.
    #[error("invalid VLAN ID: {0}")]
    InvalidVlanId(u32),
    /// The string is not a valid datapath ID.
    #[error("invalid datapath ID: {0}")]
    InvalidDatapathId(String),
}
