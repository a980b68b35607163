use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::error::{Reason, RegistryError};
use crate::event_loop::WorkerScope;

/// The entry point of a worker.
///
/// `init` runs on the new worker's own thread, once per spawn. Everything it builds
/// (handler closures and their captured state) belongs to that worker alone, so two
/// workers spawned from the same module never share mutable state. Configuration goes
/// through the module value itself, which is shared read-only.
pub trait Module: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Installs handlers and timers. An `Err` (or a panic) fails the spawn.
    fn init(&self, scope: &mut WorkerScope<'_>) -> Result<(), Reason>;
}

/// A module backed by a closure. Built with [`module_fn`].
pub struct FnModule<F> {
    name: String,
    init: F,
}

impl<F> Module for FnModule<F>
where
    F: Fn(&mut WorkerScope<'_>) -> Result<(), Reason> + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn init(&self, scope: &mut WorkerScope<'_>) -> Result<(), Reason> {
        (self.init)(scope)
    }
}

/// Wraps a closure as a module.
pub fn module_fn<F>(name: impl Into<String>, init: F) -> Arc<dyn Module>
where
    F: Fn(&mut WorkerScope<'_>) -> Result<(), Reason> + Send + Sync + 'static,
{
    Arc::new(FnModule {
        name: name.into(),
        init,
    })
}

/// Registry of modules (name -> module).
///
/// Built during initialization (mutable), then shared read-only by the runtime, so
/// lookups need no lock.
#[derive(Default)]
pub struct ModuleRegistry {
    modules: HashMap<String, Arc<dyn Module>>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self {
            modules: HashMap::new(),
        }
    }

    /// Adds `module`. Names must be unique.
    pub fn register(&mut self, module: Arc<dyn Module>) -> Result<(), RegistryError> {
        let name = module.name().to_string();
        if self.modules.contains_key(&name) {
            return Err(RegistryError::AlreadyRegistered(name));
        }
        self.modules.insert(name, module);
        Ok(())
    }

    /// Builder-style [`ModuleRegistry::register`].
    pub fn with(mut self, module: Arc<dyn Module>) -> Result<Self, RegistryError> {
        self.register(module)?;
        Ok(self)
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Module>> {
        self.modules.get(name).cloned()
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.modules.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}

impl fmt::Debug for ModuleRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleRegistry")
            .field("modules", &self.names())
            .finish()
    }
}
