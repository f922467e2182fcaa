//! Commit protocol: pushes accumulated registry edits onto the cores.
//!
//! A flush runs in three passes over the dirty sets: instantiate any
//! registered ports that still lack a back-end, re-stage the
//! configuration of every dirty core and wait for adoption, then let
//! the component updater react to every dirty component. Only a fully
//! successful flush clears the change tracker; a failed flush keeps it
//! so a corrective edit plus re-flush picks up where it stopped.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::component::{ComponentEntry, ComponentRegistry};
use crate::core_state::{CoreConfig, CoreStateError, CoreStateManager, ResolvedPort};
use crate::port::{PortEntry, PortError, PortKey, PortRegistry};
use crate::tracker::ChangeTracker;

/// Back-end failure while instantiating a port.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct DriverError(pub String);

/// Back-end failure while applying a component update.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct UpdateError(pub String);

#[derive(Debug, Error)]
pub enum FlushError {
    #[error("failed to instantiate port {port}: {source}")]
    Driver {
        port: PortKey,
        source: DriverError,
    },

    #[error("failed to update component '{name}' (id {id}): {source}")]
    ComponentUpdate {
        name: String,
        id: usize,
        source: UpdateError,
    },

    #[error("failed to resolve core configuration: {0}")]
    Resolve(#[from] PortError),

    #[error(transparent)]
    Convergence(#[from] CoreStateError),
}

pub type Result<T> = std::result::Result<T, FlushError>;

/// Instantiates port back-ends. Called once per registered port, the
/// first time a flush runs with that port defined.
pub trait PortDriver {
    fn instantiate(&mut self, entry: &PortEntry) -> std::result::Result<u32, DriverError>;
}

/// Receives component-level change notifications during a flush, after
/// the affected cores have adopted their new configuration.
pub trait ComponentUpdater {
    fn update(&mut self, entry: &ComponentEntry) -> std::result::Result<(), UpdateError>;
}

/// Read-only image of one core's cell at backup time.
#[derive(Debug, Clone)]
pub struct CoreImage {
    pub status: crate::core_state::CoreStatus,
    pub ref_index: usize,
    pub upd_index: usize,
    pub active: Arc<CoreConfig>,
}

/// Point-in-time copy of both registries plus a read-only image of the
/// core cells, taken by `backup`. `cancel` plays back the registries;
/// the core image is informational only, since edits never reach the
/// cells before a flush.
#[derive(Debug, Clone)]
pub struct Snapshot {
    ports: PortRegistry,
    components: ComponentRegistry,
    cores: Vec<CoreImage>,
}

impl Snapshot {
    fn capture(
        cores: &CoreStateManager,
        ports: &PortRegistry,
        components: &ComponentRegistry,
    ) -> Self {
        Self {
            ports: ports.clone(),
            components: components.clone(),
            cores: (0..cores.num_cores())
                .map(|core| {
                    let (ref_index, upd_index) = cores.indices(core);
                    CoreImage {
                        status: cores.status(core),
                        ref_index,
                        upd_index,
                        active: cores.active(core),
                    }
                })
                .collect(),
        }
    }

    pub fn core_images(&self) -> &[CoreImage] {
        &self.cores
    }
}

/// Drives flush, backup and cancel over the registries and the per-core
/// hand-off cells.
pub struct TxnCoordinator {
    cores: Arc<CoreStateManager>,
    adopt_retries: usize,
    adopt_interval: Duration,
    /// Last committed state, restored by `cancel`.
    backup: Snapshot,
}

impl TxnCoordinator {
    pub fn new(
        cores: Arc<CoreStateManager>,
        ports: &PortRegistry,
        components: &ComponentRegistry,
        adopt_retries: usize,
        adopt_interval: Duration,
    ) -> Self {
        let backup = Snapshot::capture(&cores, ports, components);
        Self {
            cores,
            adopt_retries,
            adopt_interval,
            backup,
        }
    }

    /// Commit every tracked edit.
    ///
    /// Passes run in a fixed order: ports, cores (ascending index),
    /// components (ascending id). On error the flush stops where it is;
    /// already-applied steps stay applied and the tracker keeps its
    /// dirty sets, so the caller can correct and flush again.
    pub fn flush(
        &mut self,
        ports: &mut PortRegistry,
        components: &ComponentRegistry,
        tracker: &mut ChangeTracker,
        driver: &mut dyn PortDriver,
        updater: &mut dyn ComponentUpdater,
    ) -> Result<()> {
        self.flush_ports(ports, driver)?;
        self.flush_cores(ports, components, tracker)?;
        self.flush_components(components, tracker, updater)?;
        tracker.clear();
        info!("flush committed");
        Ok(())
    }

    fn flush_ports(&self, ports: &mut PortRegistry, driver: &mut dyn PortDriver) -> Result<()> {
        for key in ports.uninstantiated() {
            let entry = ports.lookup(key)?.clone();
            let handle = driver
                .instantiate(&entry)
                .map_err(|source| FlushError::Driver { port: key, source })?;
            ports.set_handle(key, handle)?;
            info!(port = %key, handle = handle, "port instantiated");
        }
        Ok(())
    }

    fn flush_cores(
        &self,
        ports: &PortRegistry,
        components: &ComponentRegistry,
        tracker: &ChangeTracker,
    ) -> Result<()> {
        for core in tracker.dirty_cores() {
            let config = resolve_core(core, ports, components)?;
            debug!(
                core = core,
                kind = %config.kind,
                name = %config.name,
                "staging core configuration"
            );
            self.cores.stage(core, config);
            self.cores
                .wait_adopted(core, self.adopt_retries, self.adopt_interval)?;
            info!(core = core, "core adopted configuration");
        }
        Ok(())
    }

    fn flush_components(
        &self,
        components: &ComponentRegistry,
        tracker: &ChangeTracker,
        updater: &mut dyn ComponentUpdater,
    ) -> Result<()> {
        for id in tracker.dirty_components() {
            // Deleted components have no entry left; the vacated core
            // was already handled by the core pass.
            let Some(entry) = components.get(id) else {
                debug!(id = id, "skipping update for deleted component");
                continue;
            };
            updater
                .update(entry)
                .map_err(|source| FlushError::ComponentUpdate {
                    name: entry.name.clone(),
                    id,
                    source,
                })?;
            debug!(id = id, name = %entry.name, "component updated");
        }
        Ok(())
    }

    /// Record the current state as the committed baseline and drop the
    /// dirty sets.
    pub fn backup(
        &mut self,
        ports: &PortRegistry,
        components: &ComponentRegistry,
        tracker: &mut ChangeTracker,
    ) {
        self.backup = Snapshot::capture(&self.cores, ports, components);
        tracker.clear();
        debug!("registries backed up");
    }

    /// The baseline recorded by the last `backup`.
    pub fn last_backup(&self) -> &Snapshot {
        &self.backup
    }

    /// Discard uncommitted edits: restore both registries from the last
    /// backup and drop the dirty sets. Core cells are untouched, since
    /// edits only reach them through a flush.
    pub fn cancel(
        &self,
        ports: &mut PortRegistry,
        components: &mut ComponentRegistry,
        tracker: &mut ChangeTracker,
    ) {
        *ports = self.backup.ports.clone();
        *components = self.backup.components.clone();
        tracker.clear();
        warn!("uncommitted changes cancelled");
    }
}

/// Build the execution payload for one core from the registries.
///
/// A core with no scheduled component resolves to the unused
/// configuration, which tells its worker to go idle. Every attached
/// port must already carry a driver handle.
pub fn resolve_core(
    core: usize,
    ports: &PortRegistry,
    components: &ComponentRegistry,
) -> Result<CoreConfig> {
    let Some(entry) = components.on_core(core) else {
        return Ok(CoreConfig::unused());
    };
    Ok(CoreConfig {
        kind: entry.kind,
        component: Some(entry.id),
        name: entry.name.clone(),
        rx: resolve_ports(&entry.rx, ports)?,
        tx: resolve_ports(&entry.tx, ports)?,
    })
}

fn resolve_ports(keys: &[PortKey], ports: &PortRegistry) -> Result<Vec<ResolvedPort>> {
    keys.iter()
        .map(|key| {
            let entry = ports.lookup(*key)?;
            let handle = entry.handle.ok_or(PortError::NotInstantiated(*key))?;
            Ok(ResolvedPort {
                key: *key,
                handle,
                vlan: entry.vlan,
            })
        })
        .collect()
}
