//! Per-core double-buffered configuration hand-off.
//!
//! Each worker core owns two configuration slots and two indices. The
//! worker executes against the slot named by its reference index; the
//! controller stages new configuration into the other slot and then
//! publishes the update index to point at it. The worker converges by
//! copying the update index into its reference index, once per loop
//! iteration, whenever the two differ.
//!
//! Both indices are single-writer: only the controller stores the
//! update index, only the worker stores its reference index. The
//! correctness of the whole mechanism rests on one invariant: the
//! controller never writes the slot currently named by the worker's
//! reference index. No lock is involved anywhere on this path.
//!
//! The indices diverge only between `stage` and the worker's adoption.
//! Registry edits do not touch the cells, so a core that is dirty in
//! the change tracker still reads as synced here until a flush stages
//! its new configuration.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::time::Duration;

use arc_swap::ArcSwap;
use thiserror::Error;

use crate::component::{ComponentId, ComponentKind};
use crate::port::PortKey;

/// Hand-off errors. Both are bounded-poll timeouts.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CoreStateError {
    #[error("core {core} did not adopt the staged configuration")]
    ConvergenceTimeout { core: usize },

    #[error("cores did not reach status {want} in time")]
    StatusTimeout { want: CoreStatus },
}

/// Execution status of a worker core.
///
/// Unused -> Stopped -> Idle <-> Forward. StopRequested and
/// IdleRequested are controller-set transient targets, cleared by the
/// worker once it quiesces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CoreStatus {
    Unused = 0,
    Stopped = 1,
    Idle = 2,
    Forward = 3,
    StopRequested = 4,
    IdleRequested = 5,
}

impl CoreStatus {
    fn from_u8(v: u8) -> CoreStatus {
        match v {
            1 => CoreStatus::Stopped,
            2 => CoreStatus::Idle,
            3 => CoreStatus::Forward,
            4 => CoreStatus::StopRequested,
            5 => CoreStatus::IdleRequested,
            _ => CoreStatus::Unused,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CoreStatus::Unused => "unused",
            CoreStatus::Stopped => "stopped",
            CoreStatus::Idle => "idle",
            CoreStatus::Forward => "forward",
            CoreStatus::StopRequested => "stop-requested",
            CoreStatus::IdleRequested => "idle-requested",
        }
    }
}

impl std::fmt::Display for CoreStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A port reference resolved for execution: lookup key, driver handle
/// and VLAN tag. Self-contained so workers never touch the registries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedPort {
    pub key: PortKey,
    pub handle: u32,
    pub vlan: Option<u16>,
}

/// The configuration payload a worker core executes against.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CoreConfig {
    pub kind: ComponentKind,
    /// Id of the component this configuration was resolved from.
    pub component: Option<ComponentId>,
    pub name: String,
    pub rx: Vec<ResolvedPort>,
    pub tx: Vec<ResolvedPort>,
}

impl CoreConfig {
    /// The empty configuration staged for a vacated core.
    pub fn unused() -> Self {
        Self::default()
    }

    pub fn is_unused(&self) -> bool {
        self.kind == ComponentKind::Unused
    }
}

/// Per-core cell: two slots plus the two single-writer indices and the
/// status word.
struct CoreCell {
    slots: [ArcSwap<CoreConfig>; 2],
    /// Written only by the worker.
    ref_index: AtomicUsize,
    /// Written only by the controller.
    upd_index: AtomicUsize,
    status: AtomicU8,
}

impl CoreCell {
    fn new() -> Self {
        Self {
            slots: [
                ArcSwap::from_pointee(CoreConfig::unused()),
                ArcSwap::from_pointee(CoreConfig::unused()),
            ],
            // Mismatched at startup: the initial commit is pending
            // until the worker's first adoption.
            ref_index: AtomicUsize::new(0),
            upd_index: AtomicUsize::new(1),
            status: AtomicU8::new(CoreStatus::Stopped as u8),
        }
    }
}

/// Owns the per-core cells. The controller holds this through an `Arc`
/// shared with every worker's [`WorkerView`].
///
/// Core ids are dense indices below [`num_cores`](Self::num_cores);
/// methods taking a core id panic on an out-of-range value. Callers
/// accepting ids from outside must validate first, as
/// `SwitchState::check_core` does for operator requests.
pub struct CoreStateManager {
    cells: Vec<CoreCell>,
}

impl CoreStateManager {
    pub fn new(num_cores: usize) -> Self {
        Self {
            cells: (0..num_cores).map(|_| CoreCell::new()).collect(),
        }
    }

    pub fn num_cores(&self) -> usize {
        self.cells.len()
    }

    pub fn status(&self, core: usize) -> CoreStatus {
        CoreStatus::from_u8(self.cells[core].status.load(Ordering::Acquire))
    }

    /// Controller-side status write.
    pub fn set_status(&self, core: usize, status: CoreStatus) {
        self.cells[core].status.store(status as u8, Ordering::Release);
    }

    /// Request one core to stop, unless it never ran or already did.
    pub fn request_stop(&self, core: usize) {
        match self.status(core) {
            CoreStatus::Unused | CoreStatus::Stopped => {}
            _ => self.set_status(core, CoreStatus::StopRequested),
        }
    }

    /// One sweep setting StopRequested on every scheduled core.
    pub fn request_stop_all(&self) {
        for core in 0..self.cells.len() {
            self.request_stop(core);
        }
    }

    /// True when every core outside Unused sits in `want`.
    pub fn all_in_status(&self, want: CoreStatus) -> bool {
        (0..self.cells.len()).all(|core| {
            let status = self.status(core);
            status == CoreStatus::Unused || status == want
        })
    }

    /// Bounded barrier: poll until every scheduled core reaches `want`.
    pub fn wait_all_status(
        &self,
        want: CoreStatus,
        retries: usize,
        interval: Duration,
    ) -> Result<(), CoreStateError> {
        for _ in 0..retries {
            if self.all_in_status(want) {
                return Ok(());
            }
            std::thread::sleep(interval);
        }
        if self.all_in_status(want) {
            return Ok(());
        }
        Err(CoreStateError::StatusTimeout { want })
    }

    /// Stage a configuration for a core and publish it.
    ///
    /// The target is always the slot the worker's reference index does
    /// not name, so the worker can keep reading its current slot while
    /// the store happens. The update index is published last; a worker
    /// that loads it observes the fully written slot.
    pub fn stage(&self, core: usize, config: CoreConfig) {
        let cell = &self.cells[core];
        let target = 1 - cell.ref_index.load(Ordering::Acquire);
        cell.slots[target].store(Arc::new(config));
        cell.upd_index.store(target, Ordering::Release);
    }

    /// Bounded poll until the worker's reference index converges with
    /// the update index.
    pub fn wait_adopted(
        &self,
        core: usize,
        retries: usize,
        interval: Duration,
    ) -> Result<(), CoreStateError> {
        for _ in 0..retries {
            if self.is_synced(core) {
                return Ok(());
            }
            std::thread::sleep(interval);
        }
        if self.is_synced(core) {
            return Ok(());
        }
        Err(CoreStateError::ConvergenceTimeout { core })
    }

    /// Indices equal: the last staged configuration has been adopted.
    pub fn is_synced(&self, core: usize) -> bool {
        let cell = &self.cells[core];
        cell.ref_index.load(Ordering::Acquire) == cell.upd_index.load(Ordering::Acquire)
    }

    /// The configuration the worker currently executes against.
    pub fn active(&self, core: usize) -> Arc<CoreConfig> {
        let cell = &self.cells[core];
        cell.slots[cell.ref_index.load(Ordering::Acquire)].load_full()
    }

    /// The configuration named by the update index.
    pub fn staged(&self, core: usize) -> Arc<CoreConfig> {
        let cell = &self.cells[core];
        cell.slots[cell.upd_index.load(Ordering::Acquire)].load_full()
    }

    /// Current (reference, update) index pair, for introspection.
    pub fn indices(&self, core: usize) -> (usize, usize) {
        let cell = &self.cells[core];
        (
            cell.ref_index.load(Ordering::Acquire),
            cell.upd_index.load(Ordering::Acquire),
        )
    }

    /// Narrow worker-side accessor for one core.
    pub fn worker(self: &Arc<Self>, core: usize) -> WorkerView {
        WorkerView {
            mgr: Arc::clone(self),
            core,
        }
    }
}

/// The only touch-point a worker has with the hand-off mechanism.
///
/// A worker reads its published slot and its own status; the only
/// fields it writes are its reference index (during adoption) and its
/// own status (when acknowledging a quiesce request). It never blocks.
#[derive(Clone)]
pub struct WorkerView {
    mgr: Arc<CoreStateManager>,
    core: usize,
}

impl WorkerView {
    pub fn core(&self) -> usize {
        self.core
    }

    /// Copy the update index into the reference index if they differ.
    /// Returns true when a new configuration was adopted.
    pub fn adopt(&self) -> bool {
        let cell = &self.mgr.cells[self.core];
        let upd = cell.upd_index.load(Ordering::Acquire);
        if upd != cell.ref_index.load(Ordering::Relaxed) {
            cell.ref_index.store(upd, Ordering::Release);
            true
        } else {
            false
        }
    }

    /// The adopted configuration.
    pub fn config(&self) -> Arc<CoreConfig> {
        self.mgr.active(self.core)
    }

    pub fn status(&self) -> CoreStatus {
        self.mgr.status(self.core)
    }

    /// Acknowledge a status transition. Compare-and-swap so a
    /// controller request arriving in between is not lost.
    pub fn transition(&self, from: CoreStatus, to: CoreStatus) -> bool {
        self.mgr.cells[self.core]
            .status
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::PortKind;

    fn config_with(name: &str) -> CoreConfig {
        CoreConfig {
            kind: ComponentKind::Forward,
            component: Some(0),
            name: name.to_string(),
            rx: vec![ResolvedPort {
                key: PortKey::new(PortKind::Vhost, 0),
                handle: 100,
                vlan: None,
            }],
            tx: vec![],
        }
    }

    #[test]
    #[should_panic]
    fn test_out_of_range_core_panics() {
        let mgr = CoreStateManager::new(2);
        mgr.status(2);
    }

    #[test]
    fn test_initial_indices_mismatched() {
        let mgr = CoreStateManager::new(2);
        assert!(!mgr.is_synced(0));
        assert_eq!(mgr.indices(0), (0, 1));
        assert_eq!(mgr.status(0), CoreStatus::Stopped);
    }

    #[test]
    fn test_stage_never_touches_referenced_slot() {
        let mgr = Arc::new(CoreStateManager::new(1));
        let view = mgr.worker(0);
        view.adopt();
        assert!(mgr.is_synced(0));

        let running = mgr.active(0);
        mgr.stage(0, config_with("fwd0"));
        // The worker's slot is untouched until it adopts
        assert_eq!(*mgr.active(0), *running);
        assert!(!mgr.is_synced(0));
        assert_eq!(mgr.staged(0).name, "fwd0");

        let (r, u) = mgr.indices(0);
        assert_ne!(r, u);
    }

    #[test]
    fn test_adopt_converges_and_roundtrips() {
        let mgr = Arc::new(CoreStateManager::new(1));
        let view = mgr.worker(0);
        view.adopt();

        let staged = config_with("fwd0");
        mgr.stage(0, staged.clone());
        assert!(view.adopt());
        assert!(mgr.is_synced(0));
        assert_eq!(*mgr.active(0), staged);
        assert_eq!(*view.config(), staged);
        // Nothing further to adopt
        assert!(!view.adopt());
    }

    #[test]
    fn test_successive_stages_alternate_slots() {
        let mgr = Arc::new(CoreStateManager::new(1));
        let view = mgr.worker(0);
        view.adopt();

        for i in 0..4 {
            let name = format!("cfg{i}");
            let mut cfg = config_with(&name);
            cfg.rx.clear();
            mgr.stage(0, cfg);
            assert!(view.adopt());
            assert_eq!(mgr.active(0).name, name);
        }
    }

    #[test]
    fn test_wait_adopted_times_out_without_worker() {
        let mgr = CoreStateManager::new(1);
        mgr.stage(0, config_with("fwd0"));
        let err = mgr
            .wait_adopted(0, 3, Duration::from_micros(10))
            .unwrap_err();
        assert_eq!(err, CoreStateError::ConvergenceTimeout { core: 0 });
    }

    #[test]
    fn test_wait_adopted_with_concurrent_worker() {
        let mgr = Arc::new(CoreStateManager::new(1));
        let view = mgr.worker(0);
        view.adopt();

        mgr.stage(0, config_with("fwd0"));
        let handle = std::thread::spawn(move || {
            // Worker-style poll-and-continue loop
            for _ in 0..10_000 {
                if view.adopt() {
                    return true;
                }
                std::thread::yield_now();
            }
            false
        });
        mgr.wait_adopted(0, 10_000, Duration::from_micros(50))
            .unwrap();
        assert!(handle.join().unwrap());
        assert_eq!(mgr.active(0).name, "fwd0");
    }

    #[test]
    fn test_stop_sweep_and_barrier() {
        let mgr = Arc::new(CoreStateManager::new(3));
        mgr.set_status(0, CoreStatus::Forward);
        mgr.set_status(1, CoreStatus::Idle);
        mgr.set_status(2, CoreStatus::Unused);

        mgr.request_stop_all();
        assert_eq!(mgr.status(0), CoreStatus::StopRequested);
        assert_eq!(mgr.status(1), CoreStatus::StopRequested);
        // Unused cores are left alone
        assert_eq!(mgr.status(2), CoreStatus::Unused);

        let view0 = mgr.worker(0);
        let view1 = mgr.worker(1);
        assert!(view0.transition(CoreStatus::StopRequested, CoreStatus::Stopped));
        assert!(view1.transition(CoreStatus::StopRequested, CoreStatus::Stopped));
        mgr.wait_all_status(CoreStatus::Stopped, 3, Duration::from_micros(10))
            .unwrap();
    }

    #[test]
    fn test_transition_refuses_stale_ack() {
        let mgr = Arc::new(CoreStateManager::new(1));
        let view = mgr.worker(0);
        mgr.set_status(0, CoreStatus::StopRequested);
        // An idle ack must not overwrite a pending stop request
        assert!(!view.transition(CoreStatus::IdleRequested, CoreStatus::Idle));
        assert_eq!(view.status(), CoreStatus::StopRequested);
    }

    #[test]
    fn test_status_barrier_timeout() {
        let mgr = CoreStateManager::new(1);
        mgr.set_status(0, CoreStatus::Forward);
        let err = mgr
            .wait_all_status(CoreStatus::Stopped, 2, Duration::from_micros(10))
            .unwrap_err();
        assert_eq!(
            err,
            CoreStateError::StatusTimeout {
                want: CoreStatus::Stopped
            }
        );
    }
}
