//! [`LifecycleTable`] – per-plugin lifecycle state shared between the
//! capability pumps, the worker monitors and read-only observers.

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};

use robohub_types::{HubError, ModuleLifecycleState};

#[derive(Clone, Debug, Default)]
pub struct LifecycleTable {
    states: Arc<RwLock<BTreeMap<String, ModuleLifecycleState>>>,
}

impl LifecycleTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `module_id` in [`ModuleLifecycleState::Starting`].
    pub fn insert(&self, module_id: &str) {
        self.states
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(module_id.to_string(), ModuleLifecycleState::Starting);
    }

    /// Move `module_id` forward to `next`.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::InvalidTransition`] for a backward move or a move
    /// out of a terminal state, and [`HubError::UnknownModule`] when
    /// `module_id` was never inserted.
    pub fn advance(&self, module_id: &str, next: ModuleLifecycleState) -> Result<(), HubError> {
        let mut states = self.states.write().unwrap_or_else(PoisonError::into_inner);
        match states.get_mut(module_id) {
            Some(state) => state.advance(next),
            None => Err(HubError::UnknownModule(module_id.to_string())),
        }
    }

    pub fn get(&self, module_id: &str) -> Option<ModuleLifecycleState> {
        self.states
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(module_id)
            .copied()
    }

    pub fn snapshot(&self) -> BTreeMap<String, ModuleLifecycleState> {
        self.states
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_module_starts_in_starting() {
        let table = LifecycleTable::new();
        table.insert("weather");
        assert_eq!(table.get("weather"), Some(ModuleLifecycleState::Starting));
        assert_eq!(table.get("other"), None);
    }

    #[test]
    fn forward_moves_succeed_and_skips_are_allowed() {
        let table = LifecycleTable::new();
        table.insert("weather");
        table
            .advance("weather", ModuleLifecycleState::Loading)
            .unwrap();
        table
            .advance("weather", ModuleLifecycleState::Running)
            .unwrap();
        assert_eq!(table.get("weather"), Some(ModuleLifecycleState::Running));
    }

    #[test]
    fn backward_and_terminal_moves_are_rejected() {
        let table = LifecycleTable::new();
        table.insert("weather");
        table
            .advance("weather", ModuleLifecycleState::Running)
            .unwrap();
        assert!(table
            .advance("weather", ModuleLifecycleState::Loading)
            .is_err());

        table
            .advance("weather", ModuleLifecycleState::Errored)
            .unwrap();
        assert!(table
            .advance("weather", ModuleLifecycleState::Errored)
            .is_err());
        assert_eq!(table.get("weather"), Some(ModuleLifecycleState::Errored));
    }

    #[test]
    fn unknown_module_cannot_advance() {
        let table = LifecycleTable::new();
        assert!(matches!(
            table.advance("ghost", ModuleLifecycleState::Running),
            Err(HubError::UnknownModule(id)) if id == "ghost"
        ));
        assert_eq!(table.get("ghost"), None);
    }
}
