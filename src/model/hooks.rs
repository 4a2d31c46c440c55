//! Lifecycle hooks.

use crate::error::DbResult;
use crate::model::instance::ModelInstance;
use std::collections::HashMap;
use std::sync::Arc;

/// Points in the write pipeline where hooks run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookEvent {
    BeforeValidate,
    AfterValidate,
    BeforeCreate,
    AfterCreate,
    BeforeUpdate,
    AfterUpdate,
    BeforeSave,
    AfterSave,
    BeforeDelete,
    AfterDelete,
    BeforeRestore,
    AfterRestore,
}

impl HookEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BeforeValidate => "beforeValidate",
            Self::AfterValidate => "afterValidate",
            Self::BeforeCreate => "beforeCreate",
            Self::AfterCreate => "afterCreate",
            Self::BeforeUpdate => "beforeUpdate",
            Self::AfterUpdate => "afterUpdate",
            Self::BeforeSave => "beforeSave",
            Self::AfterSave => "afterSave",
            Self::BeforeDelete => "beforeDelete",
            Self::AfterDelete => "afterDelete",
            Self::BeforeRestore => "beforeRestore",
            Self::AfterRestore => "afterRestore",
        }
    }
}

/// A hook. Returning `Err` aborts the operation.
pub type Hook = Arc<dyn Fn(&mut ModelInstance) -> DbResult<()> + Send + Sync>;

/// Hooks per event, run in registration order.
#[derive(Clone, Default)]
pub struct HookRegistry {
    hooks: HashMap<HookEvent, Vec<Hook>>,
}

impl std::fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut counts: Vec<(&str, usize)> = self
            .hooks
            .iter()
            .map(|(event, hooks)| (event.as_str(), hooks.len()))
            .collect();
        counts.sort();
        f.debug_struct("HookRegistry").field("hooks", &counts).finish()
    }
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on<F>(&mut self, event: HookEvent, hook: F)
    where
        F: Fn(&mut ModelInstance) -> DbResult<()> + Send + Sync + 'static,
    {
        self.hooks.entry(event).or_default().push(Arc::new(hook));
    }

    pub fn count(&self, event: HookEvent) -> usize {
        self.hooks.get(&event).map_or(0, Vec::len)
    }

    pub fn has(&self, event: HookEvent) -> bool {
        self.count(event) > 0
    }

    /// Run the hooks for `event`, stopping at the first error.
    pub fn run(&self, event: HookEvent, instance: &mut ModelInstance) -> DbResult<()> {
        if let Some(hooks) = self.hooks.get(&event) {
            for hook in hooks {
                hook(instance)?;
            }
        }
        Ok(())
    }
}
