//! Managers known to the admin API, by node name
use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;

use super::Manager;

#[derive(Clone, Debug, Default)]
pub struct ManagerRegistry {
    managers: Arc<RwLock<BTreeMap<String, Manager>>>,
}

impl ManagerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `manager` under its node name, replacing any previous entry
    pub fn add(&self, manager: Manager) {
        self.managers
            .write()
            .insert(manager.name().to_string(), manager);
    }

    pub fn remove(&self, name: &str) -> Option<Manager> {
        self.managers.write().remove(name)
    }

    pub fn get(&self, name: &str) -> Option<Manager> {
        self.managers.read().get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.managers.read().keys().cloned().collect()
    }
}
