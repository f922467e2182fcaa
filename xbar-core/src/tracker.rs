//! Tracks which cores and components carry edits since the last flush.

use crate::component::ComponentId;

/// Two membership sets over the fixed tables. Marking is idempotent;
/// a successful flush clears both sets in one sweep.
#[derive(Debug, Clone)]
pub struct ChangeTracker {
    cores: Vec<bool>,
    components: Vec<bool>,
}

impl ChangeTracker {
    pub fn new(num_cores: usize, num_components: usize) -> Self {
        Self {
            cores: vec![false; num_cores],
            components: vec![false; num_components],
        }
    }

    pub fn mark_core(&mut self, core: usize) {
        if let Some(flag) = self.cores.get_mut(core) {
            *flag = true;
        }
    }

    pub fn mark_component(&mut self, id: ComponentId) {
        if let Some(flag) = self.components.get_mut(id) {
            *flag = true;
        }
    }

    pub fn is_core_dirty(&self, core: usize) -> bool {
        self.cores.get(core).copied().unwrap_or(false)
    }

    pub fn is_component_dirty(&self, id: ComponentId) -> bool {
        self.components.get(id).copied().unwrap_or(false)
    }

    /// Dirty cores in ascending index order.
    pub fn dirty_cores(&self) -> Vec<usize> {
        self.cores
            .iter()
            .enumerate()
            .filter_map(|(i, dirty)| dirty.then_some(i))
            .collect()
    }

    /// Dirty components in ascending id order.
    pub fn dirty_components(&self) -> Vec<ComponentId> {
        self.components
            .iter()
            .enumerate()
            .filter_map(|(i, dirty)| dirty.then_some(i))
            .collect()
    }

    /// All-or-nothing sweep of both sets.
    pub fn clear(&mut self) {
        self.cores.fill(false);
        self.components.fill(false);
    }

    pub fn is_clean(&self) -> bool {
        !self.cores.iter().any(|d| *d) && !self.components.iter().any(|d| *d)
    }
}
