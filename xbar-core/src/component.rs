//! Component registry: logical processing units bound to worker cores.
//!
//! Components live in a fixed table; the slot index is the component id
//! and is reused first-fit after deletion. Port attachments are stored
//! as lookup keys, resolved through the port registry at flush time.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

use crate::port::{Direction, PortKey};

/// Component id, equal to the component's fixed-table slot.
pub type ComponentId = usize;

/// Component registry errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ComponentError {
    #[error("component table is full")]
    NoFreeSlot,

    #[error("component name '{0}' is already in use")]
    NameInUse(String),

    #[error("component '{0}' not found")]
    NotFound(String),

    #[error("component name must not be empty")]
    EmptyName,

    #[error("cannot allocate a component of the unused kind")]
    InvalidKind,

    #[error("component '{name}' already has {dir} port {port}")]
    DuplicatePort {
        name: String,
        dir: Direction,
        port: PortKey,
    },

    #[error("{dir} port list of component '{name}' is full")]
    CapacityExceeded { name: String, dir: Direction },

    #[error("port {port} is already used by component '{user}' for {dir}")]
    PortInUse {
        port: PortKey,
        user: String,
        dir: Direction,
    },

    #[error("{dir} port {port} is not on component '{name}'")]
    PortNotFound {
        name: String,
        dir: Direction,
        port: PortKey,
    },

    #[error("core {core} already hosts component '{user}'")]
    CoreInUse { core: usize, user: String },

    #[error("component '{0}' still has ports attached")]
    NotEmpty(String),

    #[error("component '{0}' is not scheduled on a core")]
    NotScheduled(String),
}

pub type Result<T> = std::result::Result<T, ComponentError>;

/// Kind of processing a component performs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ComponentKind {
    /// Free table slot.
    #[default]
    Unused,
    /// Classifies packets by destination address onto tx ports.
    Classifier,
    /// Merges several rx ports onto one tx port.
    Merge,
    /// Forwards one rx port to one tx port.
    Forward,
}

impl ComponentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ComponentKind::Unused => "unused",
            ComponentKind::Classifier => "classifier",
            ComponentKind::Merge => "merge",
            ComponentKind::Forward => "forward",
        }
    }
}

impl fmt::Display for ComponentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ComponentKind {
    type Err = ComponentError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "unused" => Ok(ComponentKind::Unused),
            "classifier" => Ok(ComponentKind::Classifier),
            "merge" => Ok(ComponentKind::Merge),
            "forward" => Ok(ComponentKind::Forward),
            _ => Err(ComponentError::NotFound(s.to_string())),
        }
    }
}

/// One component table slot.
///
/// Invariant: `kind == Unused` implies both port lists are empty and no
/// core is assigned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComponentEntry {
    pub id: ComponentId,
    pub name: String,
    pub kind: ComponentKind,
    /// Worker core the component is scheduled on, if any.
    pub core: Option<usize>,
    /// Ordered rx port list.
    pub rx: Vec<PortKey>,
    /// Ordered tx port list.
    pub tx: Vec<PortKey>,
}

impl ComponentEntry {
    fn unused(id: ComponentId) -> Self {
        Self {
            id,
            name: String::new(),
            kind: ComponentKind::Unused,
            core: None,
            rx: Vec::new(),
            tx: Vec::new(),
        }
    }

    pub fn is_unused(&self) -> bool {
        self.kind == ComponentKind::Unused
    }

    pub fn ports(&self, dir: Direction) -> &[PortKey] {
        match dir {
            Direction::Rx => &self.rx,
            Direction::Tx => &self.tx,
        }
    }

    fn ports_mut(&mut self, dir: Direction) -> &mut Vec<PortKey> {
        match dir {
            Direction::Rx => &mut self.rx,
            Direction::Tx => &mut self.tx,
        }
    }
}

/// Fixed table of components with first-fit slot reuse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComponentRegistry {
    slots: Vec<ComponentEntry>,
    /// Per-direction port list ceiling, equal to the port table capacity.
    list_capacity: usize,
}

impl ComponentRegistry {
    pub fn new(capacity: usize, list_capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(ComponentEntry::unused).collect(),
            list_capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn get(&self, id: ComponentId) -> Option<&ComponentEntry> {
        self.slots.get(id).filter(|e| !e.is_unused())
    }

    /// Find a component id by name.
    pub fn find(&self, name: &str) -> Option<ComponentId> {
        if name.is_empty() {
            return None;
        }
        self.slots
            .iter()
            .find(|e| !e.is_unused() && e.name == name)
            .map(|e| e.id)
    }

    /// Allocate the first unused slot for a new component.
    pub fn allocate(&mut self, name: &str, kind: ComponentKind) -> Result<ComponentId> {
        if name.is_empty() {
            return Err(ComponentError::EmptyName);
        }
        if kind == ComponentKind::Unused {
            return Err(ComponentError::InvalidKind);
        }
        if self.find(name).is_some() {
            return Err(ComponentError::NameInUse(name.to_string()));
        }
        let entry = self
            .slots
            .iter_mut()
            .find(|e| e.is_unused())
            .ok_or(ComponentError::NoFreeSlot)?;
        entry.name = name.to_string();
        entry.kind = kind;
        Ok(entry.id)
    }

    /// Schedule a component on a worker core. One component per core.
    pub fn assign_core(&mut self, id: ComponentId, core: usize) -> Result<()> {
        if let Some(user) = self.on_core(core)
            && user.id != id
        {
            return Err(ComponentError::CoreInUse {
                core,
                user: user.name.clone(),
            });
        }
        let entry = self.entry_mut(id)?;
        entry.core = Some(core);
        Ok(())
    }

    /// Append a port to the component's ordered list for `dir`.
    pub fn add_port(&mut self, id: ComponentId, dir: Direction, key: PortKey) -> Result<()> {
        if let Some(user) = self.find_user(key, dir)
            && user != id
        {
            let user = self.slots[user].name.clone();
            return Err(ComponentError::PortInUse {
                port: key,
                user,
                dir,
            });
        }
        let cap = self.list_capacity;
        let entry = self.entry_mut(id)?;
        if entry.ports(dir).contains(&key) {
            return Err(ComponentError::DuplicatePort {
                name: entry.name.clone(),
                dir,
                port: key,
            });
        }
        if entry.ports(dir).len() >= cap {
            return Err(ComponentError::CapacityExceeded {
                name: entry.name.clone(),
                dir,
            });
        }
        entry.ports_mut(dir).push(key);
        Ok(())
    }

    /// Remove a port by identity, preserving the relative order of the
    /// remaining entries.
    pub fn remove_port(&mut self, id: ComponentId, dir: Direction, key: PortKey) -> Result<()> {
        let entry = self.entry_mut(id)?;
        let Some(pos) = entry.ports(dir).iter().position(|k| *k == key) else {
            return Err(ComponentError::PortNotFound {
                name: entry.name.clone(),
                dir,
                port: key,
            });
        };
        entry.ports_mut(dir).remove(pos);
        Ok(())
    }

    /// Delete a component, freeing its slot for first-fit reuse. Only
    /// allowed once both port lists are empty.
    pub fn delete(&mut self, id: ComponentId) -> Result<()> {
        let entry = self.entry_mut(id)?;
        if !entry.rx.is_empty() || !entry.tx.is_empty() {
            return Err(ComponentError::NotEmpty(entry.name.clone()));
        }
        *entry = ComponentEntry::unused(id);
        Ok(())
    }

    /// Component currently referencing `key` in direction `dir`.
    pub fn find_user(&self, key: PortKey, dir: Direction) -> Option<ComponentId> {
        self.slots
            .iter()
            .find(|e| !e.is_unused() && e.ports(dir).contains(&key))
            .map(|e| e.id)
    }

    /// Component scheduled on the given core.
    pub fn on_core(&self, core: usize) -> Option<&ComponentEntry> {
        self.slots
            .iter()
            .find(|e| !e.is_unused() && e.core == Some(core))
    }

    /// All allocated components, in table order.
    pub fn iter(&self) -> impl Iterator<Item = &ComponentEntry> {
        self.slots.iter().filter(|e| !e.is_unused())
    }

    fn entry_mut(&mut self, id: ComponentId) -> Result<&mut ComponentEntry> {
        self.slots
            .get_mut(id)
            .filter(|e| !e.is_unused())
            .ok_or_else(|| ComponentError::NotFound(format!("id {id}")))
    }
}
