//! Operator surface of the switch: validated mutations over the
//! registries with dirty-set bookkeeping, plus the transaction verbs.
//!
//! Every request validates fully before mutating anything, so a
//! rejected request leaves no partial edit behind. Accepted edits stay
//! registry-local until `flush` pushes them onto the cores.

use std::sync::Arc;

use thiserror::Error;
use tracing::{Level, debug, info};

use crate::component::{ComponentError, ComponentKind, ComponentRegistry};
use crate::config::SwitchConfig;
use crate::core_state::{CoreStateError, CoreStateManager, CoreStatus, WorkerView};
use crate::flush::{ComponentUpdater, FlushError, PortDriver, TxnCoordinator};
use crate::port::{Direction, MacAddr, PortError, PortKey, PortRegistry};
use crate::tracker::ChangeTracker;

/// Operator request errors.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error(transparent)]
    Port(#[from] PortError),

    #[error(transparent)]
    Component(#[from] ComponentError),

    #[error(transparent)]
    Flush(#[from] FlushError),

    #[error(transparent)]
    Core(#[from] CoreStateError),

    #[error("core {0} is out of range")]
    InvalidCore(usize),
}

pub type Result<T> = std::result::Result<T, RequestError>;

/// Owns the registries, the change tracker and the commit machinery.
/// Shares the per-core cells with the workers through an `Arc`.
pub struct SwitchState {
    config: SwitchConfig,
    ports: PortRegistry,
    components: ComponentRegistry,
    tracker: ChangeTracker,
    cores: Arc<CoreStateManager>,
    coordinator: TxnCoordinator,
}

impl SwitchState {
    pub fn new(config: SwitchConfig) -> Self {
        let ports = PortRegistry::new(config.port_capacity, config.phy_ports);
        let components = ComponentRegistry::new(config.component_capacity, config.port_capacity);
        let tracker = ChangeTracker::new(config.worker_cores, config.component_capacity);
        let cores = Arc::new(CoreStateManager::new(config.worker_cores));
        let coordinator = TxnCoordinator::new(
            Arc::clone(&cores),
            &ports,
            &components,
            config.adopt_retries,
            config.adopt_interval(),
        );
        Self {
            config,
            ports,
            components,
            tracker,
            cores,
            coordinator,
        }
    }

    pub fn ports(&self) -> &PortRegistry {
        &self.ports
    }

    pub fn components(&self) -> &ComponentRegistry {
        &self.components
    }

    pub fn tracker(&self) -> &ChangeTracker {
        &self.tracker
    }

    pub fn cores(&self) -> &Arc<CoreStateManager> {
        &self.cores
    }

    pub fn config(&self) -> &SwitchConfig {
        &self.config
    }

    /// Worker-side view for one core, handed to `spawn_worker`.
    pub fn worker_view(&self, core: usize) -> Result<WorkerView> {
        if core >= self.cores.num_cores() {
            return Err(RequestError::InvalidCore(core));
        }
        Ok(self.cores.worker(core))
    }

    /// Register an interface endpoint. The back-end is instantiated by
    /// the next flush.
    pub fn register_port(
        &mut self,
        key: PortKey,
        mac: Option<MacAddr>,
        vlan: Option<u16>,
    ) -> Result<()> {
        self.ports.register(key, mac, vlan)?;
        info!(port = %key, "port registered");
        Ok(())
    }

    /// Create a component, optionally scheduling it on a core.
    pub fn add_component(
        &mut self,
        name: &str,
        kind: ComponentKind,
        core: Option<usize>,
    ) -> Result<()> {
        // Validate the core up front so a rejected schedule does not
        // leave a half-created component behind.
        if let Some(core) = core {
            self.check_core(core)?;
            if let Some(user) = self.components.on_core(core) {
                return Err(ComponentError::CoreInUse {
                    core,
                    user: user.name.clone(),
                }
                .into());
            }
        }
        let id = self.components.allocate(name, kind)?;
        self.tracker.mark_component(id);
        if let Some(core) = core {
            self.components.assign_core(id, core)?;
            self.tracker.mark_core(core);
        }
        info!(name = name, kind = %kind, id = id, "component added");
        Ok(())
    }

    /// Delete a component. Both port lists must be empty; the vacated
    /// core is marked dirty so the next flush idles its worker.
    pub fn remove_component(&mut self, name: &str) -> Result<()> {
        let id = self.find(name)?;
        let core = self.components.get(id).and_then(|e| e.core);
        self.components.delete(id)?;
        self.tracker.mark_component(id);
        if let Some(core) = core {
            self.tracker.mark_core(core);
        }
        info!(name = name, id = id, "component removed");
        Ok(())
    }

    /// Schedule a component on a worker core.
    pub fn assign_core(&mut self, name: &str, core: usize) -> Result<()> {
        self.check_core(core)?;
        let id = self.find(name)?;
        let previous = self.components.get(id).and_then(|e| e.core);
        self.components.assign_core(id, core)?;
        self.tracker.mark_component(id);
        self.tracker.mark_core(core);
        // The old core loses its component and must be re-staged too
        if let Some(previous) = previous
            && previous != core
        {
            self.tracker.mark_core(previous);
        }
        info!(name = name, core = core, "component scheduled");
        Ok(())
    }

    /// Attach a registered port to a component's ordered list.
    pub fn add_port(&mut self, name: &str, dir: Direction, key: PortKey) -> Result<()> {
        // The port must exist before any component may reference it
        self.ports.lookup(key)?;
        let id = self.find(name)?;
        self.components.add_port(id, dir, key)?;
        self.mark_component(id);
        info!(name = name, dir = %dir, port = %key, "port attached");
        Ok(())
    }

    /// Detach a port from a component's list, preserving the order of
    /// the remaining entries.
    pub fn remove_port(&mut self, name: &str, dir: Direction, key: PortKey) -> Result<()> {
        let id = self.find(name)?;
        self.components.remove_port(id, dir, key)?;
        self.mark_component(id);
        info!(name = name, dir = %dir, port = %key, "port detached");
        Ok(())
    }

    /// Put the component's worker into the forwarding state. The
    /// component must be scheduled and its configuration flushed.
    pub fn start_component(&mut self, name: &str) -> Result<()> {
        let core = self.scheduled_core(name)?;
        self.cores.set_status(core, CoreStatus::Forward);
        info!(name = name, core = core, "component started");
        Ok(())
    }

    /// Ask the component's worker to drop back to idle.
    pub fn stop_component(&mut self, name: &str) -> Result<()> {
        let core = self.scheduled_core(name)?;
        self.cores.set_status(core, CoreStatus::IdleRequested);
        info!(name = name, core = core, "component stop requested");
        Ok(())
    }

    /// Commit every tracked edit. A successful flush becomes the new
    /// baseline for `cancel`.
    pub fn flush(
        &mut self,
        driver: &mut dyn PortDriver,
        updater: &mut dyn ComponentUpdater,
    ) -> Result<()> {
        self.coordinator.flush(
            &mut self.ports,
            &self.components,
            &mut self.tracker,
            driver,
            updater,
        )?;
        self.coordinator
            .backup(&self.ports, &self.components, &mut self.tracker);
        Ok(())
    }

    /// Record the current state as the baseline for `cancel`.
    pub fn backup(&mut self) {
        self.coordinator
            .backup(&self.ports, &self.components, &mut self.tracker);
    }

    /// Discard every edit since the last committed baseline.
    pub fn cancel(&mut self) {
        self.coordinator
            .cancel(&mut self.ports, &mut self.components, &mut self.tracker);
    }

    /// Stop every worker and wait for the sweep to converge.
    pub fn shutdown(&mut self) -> Result<()> {
        self.cores.request_stop_all();
        self.cores.wait_all_status(
            CoreStatus::Stopped,
            self.config.status_retries,
            self.config.status_interval(),
        )?;
        info!("all workers stopped");
        Ok(())
    }

    /// Emit the full management state as debug records. Free when the
    /// debug level is filtered out.
    pub fn dump(&self) {
        if !tracing::enabled!(Level::DEBUG) {
            return;
        }
        for entry in self.ports.iter_defined() {
            debug!(
                port = %entry.key,
                handle = ?entry.handle,
                mac = ?entry.mac.map(|m| m.to_string()),
                vlan = ?entry.vlan,
                "port"
            );
        }
        for entry in self.components.iter() {
            debug!(
                id = entry.id,
                name = %entry.name,
                kind = %entry.kind,
                core = ?entry.core,
                rx = ?entry.rx.iter().map(|k| k.to_string()).collect::<Vec<_>>(),
                tx = ?entry.tx.iter().map(|k| k.to_string()).collect::<Vec<_>>(),
                "component"
            );
        }
        for core in 0..self.cores.num_cores() {
            let (ref_index, upd_index) = self.cores.indices(core);
            let active = self.cores.active(core);
            debug!(
                core = core,
                status = %self.cores.status(core),
                ref_index = ref_index,
                upd_index = upd_index,
                kind = %active.kind,
                component = %active.name,
                "core"
            );
        }
    }

    fn find(&self, name: &str) -> Result<usize> {
        self.components
            .find(name)
            .ok_or_else(|| ComponentError::NotFound(name.to_string()).into())
    }

    fn scheduled_core(&self, name: &str) -> Result<usize> {
        let id = self.find(name)?;
        self.components
            .get(id)
            .and_then(|e| e.core)
            .ok_or_else(|| ComponentError::NotScheduled(name.to_string()).into())
    }

    fn check_core(&self, core: usize) -> Result<()> {
        if core >= self.cores.num_cores() {
            return Err(RequestError::InvalidCore(core));
        }
        Ok(())
    }

    fn mark_component(&mut self, id: usize) {
        self.tracker.mark_component(id);
        if let Some(core) = self.components.get(id).and_then(|e| e.core) {
            self.tracker.mark_core(core);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::PortKind;
    use crate::test_util::{MockDriver, MockUpdater};

    fn state() -> SwitchState {
        SwitchState::new(SwitchConfig {
            worker_cores: 2,
            port_capacity: 8,
            phy_ports: 1,
            component_capacity: 4,
            adopt_interval_us: 10,
            adopt_retries: 100_000,
            status_interval_ms: 1,
            status_retries: 10,
        })
    }

    fn vhost(i: usize) -> PortKey {
        PortKey::new(PortKind::Vhost, i)
    }

    #[test]
    fn test_add_component_marks_dirty() {
        let mut state = state();
        state
            .add_component("fwd0", ComponentKind::Forward, Some(1))
            .unwrap();
        assert!(state.tracker().is_core_dirty(1));
        assert!(state.tracker().is_component_dirty(0));
    }

    #[test]
    fn test_add_component_core_validation_is_atomic() {
        let mut state = state();
        let err = state
            .add_component("fwd0", ComponentKind::Forward, Some(9))
            .unwrap_err();
        assert!(matches!(err, RequestError::InvalidCore(9)));
        // Nothing was created
        assert!(state.components().find("fwd0").is_none());

        state
            .add_component("fwd0", ComponentKind::Forward, Some(0))
            .unwrap();
        let err = state
            .add_component("fwd1", ComponentKind::Forward, Some(0))
            .unwrap_err();
        assert!(matches!(
            err,
            RequestError::Component(ComponentError::CoreInUse { core: 0, .. })
        ));
        assert!(state.components().find("fwd1").is_none());
    }

    #[test]
    fn test_add_port_requires_registered_port() {
        let mut state = state();
        state
            .add_component("fwd0", ComponentKind::Forward, Some(0))
            .unwrap();
        let err = state
            .add_port("fwd0", Direction::Rx, vhost(0))
            .unwrap_err();
        assert!(matches!(
            err,
            RequestError::Port(PortError::NotFound(_))
        ));

        state.register_port(vhost(0), None, None).unwrap();
        state.add_port("fwd0", Direction::Rx, vhost(0)).unwrap();
        assert!(state.tracker().is_core_dirty(0));
    }

    #[test]
    fn test_dirty_core_stays_synced_until_staged() {
        let mut state = state();
        // Consume the initial pending commit
        let view = state.worker_view(0).unwrap();
        view.adopt();
        assert!(state.cores().is_synced(0));

        // Registry edits never reach the cells before a flush
        state
            .add_component("fwd0", ComponentKind::Forward, Some(0))
            .unwrap();
        assert!(state.tracker().is_core_dirty(0));
        assert!(state.cores().is_synced(0));
    }

    #[test]
    fn test_reassign_core_marks_both_cores() {
        let mut state = state();
        state
            .add_component("fwd0", ComponentKind::Forward, Some(0))
            .unwrap();
        state.backup();
        assert!(state.tracker().is_clean());

        state.assign_core("fwd0", 1).unwrap();
        assert!(state.tracker().is_core_dirty(0));
        assert!(state.tracker().is_core_dirty(1));
    }

    #[test]
    fn test_start_requires_schedule() {
        let mut state = state();
        state
            .add_component("fwd0", ComponentKind::Forward, None)
            .unwrap();
        let err = state.start_component("fwd0").unwrap_err();
        assert!(matches!(
            err,
            RequestError::Component(ComponentError::NotScheduled(_))
        ));

        state.assign_core("fwd0", 1).unwrap();
        state.start_component("fwd0").unwrap();
        assert_eq!(state.cores().status(1), CoreStatus::Forward);
        state.stop_component("fwd0").unwrap();
        assert_eq!(state.cores().status(1), CoreStatus::IdleRequested);
    }

    #[test]
    fn test_flush_becomes_cancel_baseline() {
        let mut state = state();
        state.register_port(vhost(0), None, None).unwrap();
        state
            .add_component("fwd0", ComponentKind::Forward, Some(0))
            .unwrap();
        state.add_port("fwd0", Direction::Rx, vhost(0)).unwrap();

        let view = state.worker_view(0).unwrap();
        // One adoption for the initial pending commit, one for the flush
        let worker = std::thread::spawn(move || {
            let mut adopted = 0;
            while adopted < 2 {
                if view.adopt() {
                    adopted += 1;
                }
                std::thread::yield_now();
            }
        });
        let mut driver = MockDriver::new();
        let mut updater = MockUpdater::default();
        state.flush(&mut driver, &mut updater).unwrap();
        worker.join().unwrap();
        assert!(state.tracker().is_clean());

        // Post-flush edits roll back to the flushed state, not further
        state.register_port(vhost(1), None, None).unwrap();
        state
            .add_component("fwd1", ComponentKind::Forward, Some(1))
            .unwrap();
        state.cancel();
        assert!(state.components().find("fwd1").is_none());
        assert_eq!(state.components().find("fwd0"), Some(0));
        assert!(state.ports().lookup(vhost(1)).is_err());
        assert!(state.ports().lookup(vhost(0)).unwrap().handle.is_some());
    }

    #[test]
    fn test_shutdown_sweep() {
        let mut state = state();
        state.cores().set_status(0, CoreStatus::Forward);
        let view = state.worker_view(0).unwrap();
        let worker = std::thread::spawn(move || {
            loop {
                if view.transition(CoreStatus::StopRequested, CoreStatus::Stopped) {
                    return;
                }
                std::thread::yield_now();
            }
        });
        state.shutdown().unwrap();
        worker.join().unwrap();
        assert!(state.cores().all_in_status(CoreStatus::Stopped));
    }
}
