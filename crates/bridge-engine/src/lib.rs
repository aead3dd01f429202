//! The bridge forwarding engine.
//!
//! This crate turns a kernel-style datapath (a fast-path packet mover with
//! a numbered port table) into a full Layer-2 switch: VLAN-aware
//! forwarding, MAC learning, link aggregation with failover and
//! rebalancing, port mirroring, and reconciliation of a declarative
//! configuration record onto live bridge/port/interface/mirror state.
//!
//! # Architecture
//!
//! ```text
//! [NetworkConfig] ──> [BridgeEngine::reconfigure] ──> bridges/ports/ifaces
//!                                                        │
//! [datapath] ──flow──> [Bridge::on_normal_flow] ──> [DpAction list]
//!            ──bytes─> [Bridge::on_account] ───────> bond hash counters
//!            ──tick──> [Bridge::on_checkpoint] ────> bond rebalance
//! ```
//!
//! The engine is single-threaded cooperative: one owner drives
//! [`BridgeEngine::run`] from a poll loop, and the OpenFlow hook methods
//! execute synchronously on the same thread. External collaborators (the
//! kernel datapath, network devices, the OpenFlow switch) are reached
//! through the [`Datapath`], [`Netdev`] and [`OfSwitch`] trait families;
//! [`sim`] provides in-memory implementations used by the test suite and
//! the standalone daemon.

mod admin;
mod bond;
mod bridge;
pub mod config;
mod datapath;
mod engine;
mod error;
mod flow;
mod forward;
mod mac_learning;
mod mirror;
mod netdev;
mod ofswitch;
mod port;
mod reconcile;
pub mod sim;

pub use bridge::{Bridge, PortChangeReason, PortStatus};
pub use datapath::{Datapath, DatapathProvider, DpError, DpPort, DpResult, DP_LOCAL_PORT};
pub use engine::BridgeEngine;
pub use error::EngineError;
pub use flow::{
    benign_learning_packet, DpAction, Flow, ARP_OP_REPLY, ETH_TYPE_ARP, ETH_TYPE_GRATUITOUS_LEARN,
    NF_OUT_DROP, NF_OUT_FLOOD, OFPP_NORMAL,
};
pub use mac_learning::{MacEntry, MacLearningTable, MAC_TABLE_CAPACITY};
pub use mirror::{Mirror, MirrorOutput, MirrorSet, MAX_MIRRORS};
pub use netdev::{NetError, NetResult, Netdev, NetdevProvider};
pub use ofswitch::{NetflowOptions, OfError, OfResult, OfSwitch, OfSwitchProvider};
pub use port::{Bond, BondEntry, Iface, Port, VlanMode, BOND_MASK};
