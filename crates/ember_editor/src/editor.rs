// editor.rs - Editor state shared by every panel
//
// Owns the reflection registry, the asset database, the sandboxes and the
// loaded modules. Everything in here is main-thread only; background
// builds talk back through the event queue.

use crate::build::SharedSplitJob;
use crate::console::Console;
use crate::events::{EditorEvent, EventQueue};
use crate::gpu_lock::GpuLock;
use crate::link::{validate_link_layout, LinkContext};
use crate::module::{ComponentBuildEntry, EditorModule};
use crate::sandbox::{Sandbox, SandboxIndex};
use crate::settings::EditorSettings;
use crate::tasks::TaskRunner;
use crate::EditorError;
use ember_asset::AssetDatabase;
use ember_core::ecs::{ComponentId, ComponentKind};
use ember_core::reflect::{ComponentMeta, ComponentMetaBuilder, ComponentRegistry};
use std::collections::HashMap;
use std::sync::atomic::AtomicU32;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// A build entry resolved for dispatch.
pub(crate) struct ResolvedBuildEntry {
    pub module: String,
    pub entry: Arc<ComponentBuildEntry>,
    pub lock_count: Arc<AtomicU32>,
}

pub struct EditorState {
    pub(crate) settings: EditorSettings,
    pub(crate) registry: ComponentRegistry,
    pub(crate) assets: AssetDatabase,
    pub(crate) sandboxes: Vec<Sandbox>,
    pub(crate) modules: HashMap<String, EditorModule>,
    pub(crate) console: Console,
    pub(crate) events: EventQueue,
    pub(crate) gpu_lock: Arc<GpuLock>,
    pub(crate) tasks: TaskRunner,
    pub(crate) split_jobs: Vec<SharedSplitJob>,
}

impl EditorState {
    pub fn new(settings: EditorSettings) -> Result<Self, EditorError> {
        let tasks = TaskRunner::new(settings.worker_threads)?;
        info!(workers = tasks.thread_count(), "editor state created");
        Ok(Self {
            settings,
            registry: ComponentRegistry::new(),
            assets: AssetDatabase::new(),
            sandboxes: Vec::new(),
            modules: HashMap::new(),
            console: Console::new(),
            events: EventQueue::new(),
            gpu_lock: Arc::new(GpuLock::new()),
            tasks,
            split_jobs: Vec::new(),
        })
    }

    pub fn settings(&self) -> &EditorSettings {
        &self.settings
    }

    pub fn registry(&self) -> &ComponentRegistry {
        &self.registry
    }

    pub fn assets(&self) -> &AssetDatabase {
        &self.assets
    }

    pub fn assets_mut(&mut self) -> &mut AssetDatabase {
        &mut self.assets
    }

    pub fn console(&self) -> &Console {
        &self.console
    }

    pub fn console_mut(&mut self) -> &mut Console {
        &mut self.console
    }

    pub fn events(&self) -> &EventQueue {
        &self.events
    }

    pub fn gpu_lock(&self) -> &Arc<GpuLock> {
        &self.gpu_lock
    }

    pub(crate) fn link_context(&self) -> LinkContext<'_> {
        LinkContext {
            registry: &self.registry,
            assets: &self.assets,
            modules: &self.modules,
        }
    }

    // ------------------------------------------------------------------
    // Sandboxes
    // ------------------------------------------------------------------

    pub fn create_sandbox(&mut self, name: impl Into<String>) -> Result<SandboxIndex, EditorError> {
        let index = self.sandboxes.len() as SandboxIndex;
        let mut sandbox = Sandbox::new(index, name, self.settings.locked_component_capacity);
        for meta in self.registry.components() {
            sandbox.register_component(&meta.info())?;
        }
        info!(sandbox = %sandbox.name, index, "sandbox created");
        self.sandboxes.push(sandbox);
        Ok(index)
    }

    pub fn sandbox(&self, index: SandboxIndex) -> Result<&Sandbox, EditorError> {
        self.sandboxes
            .get(index as usize)
            .ok_or(EditorError::UnknownSandbox(index))
    }

    pub fn sandbox_mut(&mut self, index: SandboxIndex) -> Result<&mut Sandbox, EditorError> {
        self.sandboxes
            .get_mut(index as usize)
            .ok_or(EditorError::UnknownSandbox(index))
    }

    pub fn sandbox_count(&self) -> usize {
        self.sandboxes.len()
    }

    pub fn start_sandbox_runtime(&mut self, index: SandboxIndex) -> Result<(), EditorError> {
        self.sandbox_mut(index)?.start_runtime();
        Ok(())
    }

    pub fn stop_sandbox_runtime(&mut self, index: SandboxIndex) -> Result<(), EditorError> {
        self.sandbox_mut(index)?.stop_runtime();
        Ok(())
    }

    /// Number of background builds in flight for a sandbox.
    pub fn sandbox_background_build_count(&self, index: SandboxIndex) -> u32 {
        self.sandbox(index).map_or(0, Sandbox::background_build_count)
    }

    // ------------------------------------------------------------------
    // Components
    // ------------------------------------------------------------------

    /// Register a component type and make every sandbox able to store it.
    pub fn register_component(&mut self, builder: ComponentMetaBuilder) -> Result<ComponentId, EditorError> {
        let id = self.registry.register(builder)?;
        let meta = self
            .registry
            .meta(id)
            .ok_or_else(|| EditorError::UnknownComponent(id.to_string()))?;
        if meta.is_link() {
            if let Err(err) = validate_link_layout(&self.link_context(), meta) {
                let message = format!("link component {} cannot be converted: {err}", meta.name);
                self.console.warn(message);
            }
        }
        let info = meta.info();
        for sandbox in &mut self.sandboxes {
            sandbox.register_component(&info)?;
        }
        Ok(id)
    }

    pub fn component_id(&self, name: &str) -> Result<ComponentId, EditorError> {
        self.registry
            .id_of(name)
            .ok_or_else(|| EditorError::UnknownComponent(name.to_string()))
    }

    /// Reflection data of `name`, checked against the expected kind.
    pub(crate) fn meta_of_kind(&self, name: &str, kind: ComponentKind) -> Result<ComponentMeta, EditorError> {
        let meta = self
            .registry
            .meta_by_name(name)
            .ok_or_else(|| EditorError::UnknownComponent(name.to_string()))?;
        if meta.kind != kind {
            return Err(EditorError::WrongKind {
                component: name.to_string(),
                expected: kind,
                actual: meta.kind,
            });
        }
        Ok(meta.clone())
    }

    pub(crate) fn component_name(&self, id: ComponentId) -> String {
        self.registry
            .meta(id)
            .map_or_else(|| format!("component {id}"), |m| m.name.clone())
    }

    // ------------------------------------------------------------------
    // Modules
    // ------------------------------------------------------------------

    /// Register a module whose code is not loaded yet.
    pub fn register_module(&mut self, module: EditorModule) {
        debug!(module = %module.name, "module registered");
        self.modules.insert(module.name.clone(), module);
    }

    pub fn module(&self, name: &str) -> Option<&EditorModule> {
        self.modules.get(name)
    }

    pub fn load_module(&mut self, name: &str) -> Result<(), EditorError> {
        let module = self
            .modules
            .get_mut(name)
            .ok_or_else(|| EditorError::UnknownModule(name.to_string()))?;
        module.set_loaded(true);
        info!(module = name, "module loaded");
        Ok(())
    }

    fn ensure_unlocked(&self, name: &str) -> Result<(), EditorError> {
        let module = self
            .modules
            .get(name)
            .ok_or_else(|| EditorError::UnknownModule(name.to_string()))?;
        let locks = module.lock_count();
        if locks > 0 {
            return Err(EditorError::ModuleLocked {
                module: name.to_string(),
                locks,
            });
        }
        Ok(())
    }

    pub fn unload_module(&mut self, name: &str) -> Result<(), EditorError> {
        self.ensure_unlocked(name)?;
        if let Some(module) = self.modules.get_mut(name) {
            module.set_loaded(false);
        }
        info!(module = name, "module unloaded");
        Ok(())
    }

    /// Replace a module's code. Crash flags start over with the new entries.
    pub fn reload_module(&mut self, mut module: EditorModule) -> Result<(), EditorError> {
        if self.modules.contains_key(&module.name) {
            self.ensure_unlocked(&module.name)?;
        }
        module.set_loaded(true);
        self.console.reset_once(&format!("crashed-build:{}:", module.name));
        info!(module = %module.name, "module reloaded");
        self.modules.insert(module.name.clone(), module);
        Ok(())
    }

    /// Drop a module together with the component types it registered.
    pub fn remove_module(&mut self, name: &str) -> Result<Vec<ComponentId>, EditorError> {
        self.ensure_unlocked(name)?;
        self.modules.remove(name);
        Ok(self.registry.unregister_module(name))
    }

    /// Build entry of `component` among the loaded modules.
    pub(crate) fn resolve_build_entry(&self, component: ComponentId) -> Option<ResolvedBuildEntry> {
        self.modules
            .values()
            .filter(|m| m.is_loaded())
            .find_map(|m| {
                m.build_entry(component).map(|entry| ResolvedBuildEntry {
                    module: m.name.clone(),
                    entry: Arc::clone(entry),
                    lock_count: m.lock_counter(),
                })
            })
    }

    // ------------------------------------------------------------------
    // Frame
    // ------------------------------------------------------------------

    /// Handle events posted since the last frame, then advance split jobs.
    ///
    /// This is the only place where background builds are committed and
    /// GPU lock requests are granted.
    pub fn process_events(&mut self) {
        let mut retry = Vec::new();
        for event in self.events.drain() {
            match event {
                EditorEvent::BuildCompleted(completion) => self.commit_build(completion),
                EditorEvent::GpuLockRequest { thread } => {
                    if !self.gpu_lock.grant(thread) {
                        retry.push(EditorEvent::GpuLockRequest { thread });
                    }
                }
                EditorEvent::DeferredDelete {
                    sandbox,
                    viewport,
                    entity,
                } => {
                    if self.sandbox_background_build_count(sandbox) > 0 {
                        retry.push(EditorEvent::DeferredDelete {
                            sandbox,
                            viewport,
                            entity,
                        });
                    } else if let Err(err) = self.delete_sandbox_entity_now(sandbox, viewport, entity) {
                        self.console.error(format!("deferred delete of {entity} failed: {err}"));
                    }
                }
            }
        }
        for event in retry {
            self.events.push(event);
        }
        self.step_split_jobs();
    }

    /// Whether no background work or queued event is left.
    pub fn is_idle(&self) -> bool {
        self.events.is_empty()
            && self.split_jobs.is_empty()
            && self.sandboxes.iter().all(|s| s.background_build_count() == 0)
    }

    /// Pump events until everything settles or `timeout` passes.
    pub fn pump_until_idle(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            self.process_events();
            if self.is_idle() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }
}

impl std::fmt::Debug for EditorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EditorState")
            .field("sandboxes", &self.sandboxes.len())
            .field("modules", &self.modules.len())
            .field("split_jobs", &self.split_jobs.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::BuildOutcome;
    use ember_core::reflect::FieldType;

    fn editor() -> EditorState {
        EditorState::new(EditorSettings {
            worker_threads: 1,
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn components_reach_existing_and_new_sandboxes() {
        let mut editor = editor();
        let first = editor.create_sandbox("first").unwrap();
        let id = editor
            .register_component(ComponentMetaBuilder::new("Health", ComponentKind::Unique).field("hp", FieldType::U32))
            .unwrap();
        let second = editor.create_sandbox("second").unwrap();
        for index in [first, second] {
            let sandbox = editor.sandbox(index).unwrap();
            assert!(sandbox.scene.is_component_registered(id));
        }
        assert!(matches!(editor.sandbox(7), Err(EditorError::UnknownSandbox(7))));
    }

    #[test]
    fn modules_resolve_only_when_loaded() {
        let mut editor = editor();
        editor.register_module(EditorModule::new("physics").with_build_function(4, vec![], |_| BuildOutcome::Unchanged));
        assert!(editor.resolve_build_entry(4).is_none());
        editor.load_module("physics").unwrap();
        assert_eq!(editor.resolve_build_entry(4).unwrap().module, "physics");
        editor.unload_module("physics").unwrap();
        assert!(editor.resolve_build_entry(4).is_none());
        assert!(matches!(editor.load_module("audio"), Err(EditorError::UnknownModule(_))));
    }

    #[test]
    fn invalid_link_layout_warns_on_registration() {
        let mut editor = editor();
        editor
            .register_component(ComponentMetaBuilder::new("Light", ComponentKind::Unique).field("power", FieldType::F32))
            .unwrap();
        editor
            .register_component(
                ComponentMetaBuilder::new("LightLink", ComponentKind::Unique)
                    .field("power", FieldType::U32)
                    .link_to("Light"),
            )
            .unwrap();
        assert_eq!(editor.console().count(crate::console::ConsoleLevel::Warning), 1);
    }
}
