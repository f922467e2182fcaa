//! Engine configuration: table capacities and reconfiguration timing.

use serde::Deserialize;

/// Tunables for the switch control plane.
///
/// Embedding programs deserialize this from their own configuration
/// source; all fields have defaults suitable for small deployments.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SwitchConfig {
    /// Number of worker cores managed by the switch.
    pub worker_cores: usize,
    /// Capacity of each per-class port table (phy, vhost, ring).
    ///
    /// Also the ceiling for a component's rx and tx port lists.
    pub port_capacity: usize,
    /// Number of physical ports present at startup. Physical ports are
    /// pre-defined with their driver handles; they are never
    /// instantiated at flush time.
    pub phy_ports: usize,
    /// Capacity of the component table.
    pub component_capacity: usize,
    /// Delay between adoption polls while waiting for a worker to pick
    /// up a staged configuration, in microseconds.
    pub adopt_interval_us: u64,
    /// Number of adoption polls before a flush gives up on a core.
    pub adopt_retries: usize,
    /// Delay between checks of the all-cores status barrier, in
    /// milliseconds.
    pub status_interval_ms: u64,
    /// Number of status barrier checks before timing out.
    pub status_retries: usize,
}

impl Default for SwitchConfig {
    fn default() -> Self {
        Self {
            worker_cores: 4,
            port_capacity: 32,
            phy_ports: 0,
            component_capacity: 16,
            adopt_interval_us: 10,
            adopt_retries: 100_000,
            status_interval_ms: 100,
            status_retries: 50,
        }
    }
}

impl SwitchConfig {
    /// Interval between adoption polls.
    pub fn adopt_interval(&self) -> std::time::Duration {
        std::time::Duration::from_micros(self.adopt_interval_us)
    }

    /// Interval between status barrier checks.
    pub fn status_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.status_interval_ms)
    }
}
