//! Worker threads: pinned loops executing adopted core configurations.
//!
//! A worker never blocks. Each loop iteration checks its status word,
//! adopts any newly published configuration, and when forwarding runs
//! one bounded iteration of the packet loop against the adopted
//! payload. Quiesce requests are acknowledged with compare-and-swap
//! transitions so a concurrent controller request is never overwritten.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::{info, warn};

use crate::core_state::{CoreConfig, CoreStateManager, CoreStatus, WorkerView};

/// One bounded iteration of per-packet work.
///
/// Implementations must not block; the surrounding loop owns status
/// handling and configuration adoption.
pub trait PacketLoop: Send + 'static {
    fn iterate(&mut self, config: &CoreConfig);
}

/// Spawn the worker thread for one core.
///
/// The thread is named `core-N` and, when `cpu` is given, pinned to
/// that processor. It acknowledges startup by moving its status from
/// Stopped to Idle and exits once a stop request is acknowledged.
pub fn spawn_worker<L: PacketLoop>(
    mgr: &Arc<CoreStateManager>,
    core: usize,
    cpu: Option<usize>,
    loop_impl: L,
) -> std::io::Result<WorkerHandle> {
    let view = mgr.worker(core);
    let handle = thread::Builder::new()
        .name(format!("core-{core}"))
        .spawn(move || run(view, loop_impl, cpu))?;
    Ok(WorkerHandle {
        mgr: Arc::clone(mgr),
        core,
        handle: Some(handle),
    })
}

fn run<L: PacketLoop>(view: WorkerView, mut loop_impl: L, cpu: Option<usize>) {
    if let Some(id) = cpu
        && !core_affinity::set_for_current(core_affinity::CoreId { id })
    {
        warn!(core = view.core(), cpu = id, "failed to pin worker thread");
    }
    view.transition(CoreStatus::Stopped, CoreStatus::Idle);
    info!(core = view.core(), "worker running");
    loop {
        view.adopt();
        match view.status() {
            CoreStatus::StopRequested => {
                view.transition(CoreStatus::StopRequested, CoreStatus::Stopped);
                break;
            }
            CoreStatus::IdleRequested => {
                view.transition(CoreStatus::IdleRequested, CoreStatus::Idle);
            }
            CoreStatus::Forward => {
                let config = view.config();
                loop_impl.iterate(&config);
                // Hot path: straight back to the next iteration
                continue;
            }
            CoreStatus::Idle | CoreStatus::Stopped | CoreStatus::Unused => {}
        }
        thread::yield_now();
    }
    info!(core = view.core(), "worker stopped");
}

/// Owner of a spawned worker thread. Dropping the handle requests a
/// stop and joins.
pub struct WorkerHandle {
    mgr: Arc<CoreStateManager>,
    core: usize,
    handle: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    pub fn core(&self) -> usize {
        self.core
    }

    /// Request the worker to stop and wait for the thread to exit.
    pub fn stop(mut self) {
        self.stop_and_join();
    }

    fn stop_and_join(&mut self) {
        if let Some(handle) = self.handle.take() {
            // Unconditional: the thread exists, so a conditional
            // request would drop a stop arriving before the worker's
            // startup ack and leave join() waiting forever. The
            // startup transition tolerates this; a failed Stopped->Idle
            // swap falls into the loop, which sees the request and
            // exits.
            self.mgr
                .set_status(self.core, CoreStatus::StopRequested);
            if handle.join().is_err() {
                warn!(core = self.core, "worker thread panicked");
            }
            // The thread is gone; the cell is controller-owned again.
            // Clears the request in case the worker had already
            // stopped and could not ack it.
            self.mgr.set_status(self.core, CoreStatus::Stopped);
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}
