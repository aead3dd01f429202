//! Engine-level errors.

use crate::datapath::DpError;
use crate::ofswitch::OfError;
use thiserror::Error;

/// Errors surfaced by [`crate::BridgeEngine::run`].
///
/// Almost everything below `run` is logged and swallowed; the engine is a
/// control loop whose job is eventual convergence. The one condition worth
/// reporting upward is a datapath that disappeared underneath a bridge,
/// which the caller should answer with a fresh `reconfigure`.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A bridge's datapath was destroyed externally.
    #[error("bridge {0}: datapath was destroyed externally")]
    DatapathVanished(String),
    /// A datapath operation failed in a way the engine cannot absorb.
    #[error("datapath: {0}")]
    Datapath(#[from] DpError),
    /// The OpenFlow switch failed in a way the engine cannot absorb.
    #[error("openflow: {0}")]
    OpenFlow(#[from] OfError),
}
