//! Shared doubles for unit and integration tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::component::ComponentEntry;
use crate::core_state::CoreConfig;
use crate::flush::{ComponentUpdater, DriverError, PortDriver, UpdateError};
use crate::port::{PortEntry, PortKey};
use crate::worker::PacketLoop;

/// Driver double handing out sequential handles starting at 100, so
/// driver-assigned handles are distinguishable from pre-defined
/// physical ones.
pub struct MockDriver {
    next: u32,
    pub calls: Vec<PortKey>,
    pub fail_on: Option<PortKey>,
}

impl MockDriver {
    pub fn new() -> Self {
        Self {
            next: 100,
            calls: Vec::new(),
            fail_on: None,
        }
    }
}

impl Default for MockDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl PortDriver for MockDriver {
    fn instantiate(&mut self, entry: &PortEntry) -> Result<u32, DriverError> {
        if self.fail_on == Some(entry.key) {
            return Err(DriverError(format!("refusing to instantiate {}", entry.key)));
        }
        self.calls.push(entry.key);
        let handle = self.next;
        self.next += 1;
        Ok(handle)
    }
}

/// Updater double recording the names it was invoked with.
#[derive(Default)]
pub struct MockUpdater {
    pub updated: Vec<String>,
    pub fail_on: Option<String>,
}

impl ComponentUpdater for MockUpdater {
    fn update(&mut self, entry: &ComponentEntry) -> Result<(), UpdateError> {
        if self.fail_on.as_deref() == Some(entry.name.as_str()) {
            return Err(UpdateError(format!("refusing to update '{}'", entry.name)));
        }
        self.updated.push(entry.name.clone());
        Ok(())
    }
}

/// Packet loop double counting forwarding iterations.
pub struct CountingLoop {
    counter: Arc<AtomicU64>,
}

impl CountingLoop {
    pub fn counter() -> Arc<AtomicU64> {
        Arc::new(AtomicU64::new(0))
    }

    pub fn new(counter: Arc<AtomicU64>) -> Self {
        Self { counter }
    }
}

impl PacketLoop for CountingLoop {
    fn iterate(&mut self, config: &CoreConfig) {
        if !config.is_unused() {
            self.counter.fetch_add(1, Ordering::Relaxed);
        }
        // Keep the spin polite in tests
        std::thread::yield_now();
    }
}

/// Packet loop double that does nothing.
pub struct NoopLoop;

impl PacketLoop for NoopLoop {
    fn iterate(&mut self, _config: &CoreConfig) {
        std::thread::yield_now();
    }
}
