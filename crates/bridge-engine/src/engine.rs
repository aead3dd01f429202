//! The engine facade: owns every bridge and the collaborator providers.

use crate::bridge::Bridge;
use crate::config::NetworkConfig;
use crate::datapath::DatapathProvider;
use crate::error::EngineError;
use crate::netdev::NetdevProvider;
use crate::ofswitch::OfSwitchProvider;
use tracing::{error, warn};

/// The process-wide bridge registry and control loop.
///
/// Single-threaded cooperative: one owner calls [`reconfigure`]
/// (which runs to completion) and [`run`] (a non-blocking tick); the
/// OpenFlow hook methods on [`Bridge`] execute synchronously between
/// those calls. Nothing here blocks.
///
/// [`reconfigure`]: BridgeEngine::reconfigure
/// [`run`]: BridgeEngine::run
pub struct BridgeEngine {
    pub(crate) dp_provider: Box<dyn DatapathProvider>,
    pub(crate) net_provider: Box<dyn NetdevProvider>,
    pub(crate) of_provider: Box<dyn OfSwitchProvider>,
    pub(crate) bridges: Vec<Bridge>,
    /// Stable host identity for datapath-ID derivation on bridges with
    /// no physical interface.
    pub(crate) host_uuid: Option<String>,
}

impl BridgeEngine {
    /// Creates an engine over the given collaborators.
    pub fn new(
        dp_provider: Box<dyn DatapathProvider>,
        net_provider: Box<dyn NetdevProvider>,
        of_provider: Box<dyn OfSwitchProvider>,
    ) -> Self {
        BridgeEngine {
            dp_provider,
            net_provider,
            of_provider,
            bridges: Vec::new(),
            host_uuid: None,
        }
    }

    /// Supplies a stable host identity used when deriving datapath IDs
    /// for purely internal bridges.
    pub fn with_host_uuid(mut self, uuid: impl Into<String>) -> Self {
        self.host_uuid = Some(uuid.into());
        self
    }

    /// First-time initialisation: deletes datapaths left over from an
    /// earlier run that no configured bridge claims, then converges on
    /// the configuration.
    pub fn init(&mut self, cfg: &NetworkConfig, now_ms: u64) {
        match self.dp_provider.enumerate() {
            Ok(names) => {
                for name in names {
                    if cfg.bridge(&name).is_none() {
                        match self.dp_provider.open(&name) {
                            Ok(mut dp) => {
                                warn!(datapath = %name, "deleting stale datapath");
                                if let Err(e) = dp.delete() {
                                    error!(datapath = %name, error = %e, "failed to delete stale datapath");
                                }
                            }
                            Err(e) => {
                                error!(datapath = %name, error = %e, "failed to open stale datapath")
                            }
                        }
                    }
                }
            }
            Err(e) => error!(error = %e, "failed to enumerate datapaths"),
        }
        self.reconfigure(cfg, now_ms);
    }

    /// One non-blocking tick over every bridge.
    ///
    /// A bridge whose datapath disappeared is torn down and reported;
    /// the caller should respond with a fresh [`reconfigure`], which
    /// recreates it.
    ///
    /// [`reconfigure`]: BridgeEngine::reconfigure
    pub fn run(&mut self, now_ms: u64) -> Result<(), EngineError> {
        let mut first_error = None;
        let mut i = 0;
        while i < self.bridges.len() {
            match self.bridges[i].run_one(now_ms, self.net_provider.as_mut()) {
                Ok(()) => i += 1,
                Err(e) => {
                    error!(
                        bridge = %self.bridges[i].name,
                        error = %e,
                        "datapath was destroyed externally, forcing reconfiguration"
                    );
                    self.teardown_bridge(i);
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// The earliest deadline at which [`run`] should be called again,
    /// if any timer is pending. Also gives every OpenFlow switch the
    /// chance to register its own wakeups.
    ///
    /// [`run`]: BridgeEngine::run
    pub fn wait(&self) -> Option<u64> {
        let mut deadline: Option<u64> = None;
        for br in &self.bridges {
            br.ofproto.wait();
            if br.controller.is_some() {
                // A remote controller owns the flow table; learning and
                // bond timers do not apply.
                continue;
            }
            deadline = match (deadline, br.next_wake()) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
        }
        deadline
    }

    /// Names of the current bridges.
    pub fn bridge_names(&self) -> Vec<String> {
        self.bridges.iter().map(|br| br.name.clone()).collect()
    }

    /// Names of every interface on every bridge, sorted.
    pub fn get_interfaces(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .bridges
            .iter()
            .flat_map(|br| br.ports.iter())
            .flat_map(|p| p.ifaces.iter())
            .map(|i| i.name.clone())
            .collect();
        names.sort();
        names
    }

    /// True if a bridge with this name exists.
    pub fn exists(&self, name: &str) -> bool {
        self.bridge_index(name).is_some()
    }

    /// The datapath ID chosen for a bridge.
    pub fn get_datapath_id(&self, name: &str) -> Option<u64> {
        self.bridge(name).map(|br| br.ofproto.datapath_id())
    }

    /// Borrows a bridge by name.
    pub fn bridge(&self, name: &str) -> Option<&Bridge> {
        self.bridges.iter().find(|br| br.name == name)
    }

    /// Mutably borrows a bridge by name (hook dispatch, tests).
    pub fn bridge_mut(&mut self, name: &str) -> Option<&mut Bridge> {
        self.bridges.iter_mut().find(|br| br.name == name)
    }

    pub(crate) fn bridge_index(&self, name: &str) -> Option<usize> {
        self.bridges.iter().position(|br| br.name == name)
    }

    /// Drops a bridge whose datapath is already gone: no datapath
    /// deletion, just structure teardown.
    fn teardown_bridge(&mut self, idx: usize) {
        let mut br = self.bridges.remove(idx);
        while !br.ports.is_empty() {
            let last = br.ports.len() - 1;
            br.remove_port(last);
        }
    }
}
