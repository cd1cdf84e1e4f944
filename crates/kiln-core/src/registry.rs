//! Registry for actions.

use crate::action::{Action, ActionDecl};
use indexmap::IndexMap;
use std::sync::Arc;

/// A registered action and its staleness flag.
#[derive(Clone)]
pub struct RegisteredAction {
    pub implementation: Arc<dyn Action>,
    /// True until a cache proves the same version already ran.
    pub modified: bool,
}

impl RegisteredAction {
    pub fn decl(&self) -> &ActionDecl {
        self.implementation.decl()
    }
}

impl std::fmt::Debug for RegisteredAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredAction")
            .field("decl", self.decl())
            .field("modified", &self.modified)
            .finish()
    }
}

/// Registry of available actions, keyed by name.
#[derive(Clone, Debug, Default)]
pub struct Registry {
    actions: IndexMap<String, RegisteredAction>,
}

impl Registry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an action implementation.
    ///
    /// Registering a name twice replaces the implementation. A new
    /// registration counts as modified until a cache says otherwise.
    pub fn register(&mut self, action: impl Action + 'static) {
        self.register_arc(Arc::new(action));
    }

    /// Register a shared action implementation.
    pub fn register_arc(&mut self, action: Arc<dyn Action>) {
        let name = action.decl().name.clone();
        self.actions.insert(
            name,
            RegisteredAction {
                implementation: action,
                modified: true,
            },
        );
    }

    /// Get an action by name.
    pub fn get(&self, name: &str) -> Option<&RegisteredAction> {
        self.actions.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.actions.contains_key(name)
    }

    /// Whether the named action counts as modified. Unknown actions do.
    pub fn is_modified(&self, name: &str) -> bool {
        self.actions.get(name).is_none_or(|a| a.modified)
    }

    /// Compare a cached version against the registered one.
    ///
    /// Returns `None` if no action of that name is registered, otherwise
    /// whether the action is now considered modified.
    pub fn reconcile_version(&mut self, name: &str, cached_version: &str) -> Option<bool> {
        let action = self.actions.get_mut(name)?;
        action.modified = action.decl().version != cached_version;
        Some(action.modified)
    }

    /// Mark every action as matching the cache.
    pub(crate) fn clear_modified(&mut self) {
        for action in self.actions.values_mut() {
            action.modified = false;
        }
    }

    /// Iterate over all declarations.
    pub fn declarations(&self) -> impl Iterator<Item = &ActionDecl> {
        self.actions.values().map(RegisteredAction::decl)
    }

    /// Number of registered actions.
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    /// Check if registry is empty.
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}
