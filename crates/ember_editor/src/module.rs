// module.rs - Module-supplied callbacks
//
// A module contributes component types (registered in the reflection
// registry) and code: build functions that derive a component from its
// siblings, and optional custom link conversions. The code may be missing
// (module registered but not compiled yet) and may panic; every call site
// goes through `catch_unwind` and marks the entry crashed on failure.

use crate::gpu_lock::{GpuLock, GpuLockGuard};
use crate::events::EventQueue;
use crate::sandbox::SandboxIndex;
use ember_core::ecs::{ComponentData, ComponentId, Entity};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

/// Snapshot handed to a build function: the component being built and the
/// current values of the components it depends on.
#[derive(Debug, Clone)]
pub struct BuildInput {
    pub sandbox: SandboxIndex,
    pub entity: Entity,
    pub component: ComponentId,
    pub data: ComponentData,
    pub dependencies: Vec<(ComponentId, ComponentData)>,
}

impl BuildInput {
    pub fn dependency(&self, component: ComponentId) -> Option<&ComponentData> {
        self.dependencies
            .iter()
            .find(|(id, _)| *id == component)
            .map(|(_, data)| data)
    }
}

/// Services available to a build task on a worker thread.
pub struct BackgroundContext {
    pub(crate) gpu_lock: Arc<GpuLock>,
    pub(crate) events: EventQueue,
}

impl BackgroundContext {
    /// Block until the main thread hands over the GPU lock.
    pub fn lock_gpu(&self) -> GpuLockGuard<'_> {
        self.gpu_lock.acquire(&self.events)
    }
}

/// Work continued on a background thread. Returns the built value.
pub type BuildTask = Box<dyn FnOnce(BuildInput, &BackgroundContext) -> ComponentData + Send>;

pub enum BuildOutcome {
    /// Built inline; the value is written back immediately.
    Done(ComponentData),
    /// Nothing to write.
    Unchanged,
    /// Continue on a worker thread.
    Deferred(BuildTask),
}

impl fmt::Debug for BuildOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuildOutcome::Done(data) => f.debug_tuple("Done").field(data).finish(),
            BuildOutcome::Unchanged => f.write_str("Unchanged"),
            BuildOutcome::Deferred(_) => f.write_str("Deferred(..)"),
        }
    }
}

pub type BuildFunction = Arc<dyn Fn(&BuildInput) -> BuildOutcome + Send + Sync>;

pub struct ComponentBuildEntry {
    pub function: BuildFunction,
    /// Components whose values the build reads.
    pub component_dependencies: Vec<ComponentId>,
    has_crashed: AtomicBool,
}

impl ComponentBuildEntry {
    pub fn new(function: BuildFunction, component_dependencies: Vec<ComponentId>) -> Self {
        Self {
            function,
            component_dependencies,
            has_crashed: AtomicBool::new(false),
        }
    }

    pub fn has_crashed(&self) -> bool {
        self.has_crashed.load(Ordering::Acquire)
    }

    pub(crate) fn mark_crashed(&self) {
        self.has_crashed.store(true, Ordering::Release);
    }
}

impl fmt::Debug for ComponentBuildEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentBuildEntry")
            .field("component_dependencies", &self.component_dependencies)
            .field("has_crashed", &self.has_crashed())
            .finish()
    }
}

/// Values available to a custom modifier function.
#[derive(Debug, Clone, Copy)]
pub struct ModifierInput<'a> {
    pub link: &'a ComponentData,
    pub previous_link: &'a ComponentData,
    /// Target value captured when the gesture started.
    pub baseline_target: &'a ComponentData,
}

pub type LinkToTargetFn = Arc<dyn Fn(&ComponentData, &mut ComponentData) + Send + Sync>;
pub type TargetToLinkFn = Arc<dyn Fn(&ComponentData, &mut ComponentData) + Send + Sync>;
pub type ApplyModifierFn = Arc<dyn Fn(&ModifierInput<'_>, &mut ComponentData) + Send + Sync>;

/// Custom conversions for one link component. Missing functions fall back
/// to the field-by-field mapping.
#[derive(Default)]
pub struct ModuleLinkFunctions {
    pub to_target: Option<LinkToTargetFn>,
    pub to_link: Option<TargetToLinkFn>,
    pub apply_modifier: Option<ApplyModifierFn>,
    pub(crate) has_crashed: AtomicBool,
}

impl ModuleLinkFunctions {
    pub fn has_crashed(&self) -> bool {
        self.has_crashed.load(Ordering::Acquire)
    }

    pub(crate) fn mark_crashed(&self) {
        self.has_crashed.store(true, Ordering::Release);
    }
}

impl fmt::Debug for ModuleLinkFunctions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleLinkFunctions")
            .field("to_target", &self.to_target.is_some())
            .field("to_link", &self.to_link.is_some())
            .field("apply_modifier", &self.apply_modifier.is_some())
            .field("has_crashed", &self.has_crashed())
            .finish()
    }
}

/// Code a module provides, keyed by component id.
#[derive(Debug, Default)]
pub struct EditorModule {
    pub name: String,
    pub(crate) build_entries: HashMap<ComponentId, Arc<ComponentBuildEntry>>,
    pub(crate) link_functions: HashMap<ComponentId, Arc<ModuleLinkFunctions>>,
    loaded: bool,
    /// Background builds currently running module code.
    lock_count: Arc<AtomicU32>,
}

impl EditorModule {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_build_function(
        mut self,
        component: ComponentId,
        dependencies: Vec<ComponentId>,
        function: impl Fn(&BuildInput) -> BuildOutcome + Send + Sync + 'static,
    ) -> Self {
        self.build_entries.insert(
            component,
            Arc::new(ComponentBuildEntry::new(Arc::new(function), dependencies)),
        );
        self
    }

    pub fn with_link_functions(mut self, link: ComponentId, functions: ModuleLinkFunctions) -> Self {
        self.link_functions.insert(link, Arc::new(functions));
        self
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    pub(crate) fn set_loaded(&mut self, loaded: bool) {
        self.loaded = loaded;
    }

    pub fn lock_count(&self) -> u32 {
        self.lock_count.load(Ordering::Acquire)
    }

    pub(crate) fn lock_counter(&self) -> Arc<AtomicU32> {
        Arc::clone(&self.lock_count)
    }

    pub fn build_entry(&self, component: ComponentId) -> Option<&Arc<ComponentBuildEntry>> {
        self.build_entries.get(&component)
    }

    pub fn link_entry(&self, link: ComponentId) -> Option<&Arc<ModuleLinkFunctions>> {
        self.link_functions.get(&link)
    }
}
