// sandbox.rs - One editable scene plus its optional running copy

use crate::locks::LockedComponents;
use ember_core::ecs::{ComponentInfo, Entity, EntityManager, EntityManagerError};
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

pub use ember_asset::SandboxIndex;

/// Which entity manager of a sandbox an operation targets.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Viewport {
    /// The edited scene. Asset references are counted here.
    Scene,
    /// The simulation copy. Its asset lifetime follows the scene snapshot
    /// it was created from.
    Runtime,
}

impl fmt::Display for Viewport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Viewport::Scene => "scene",
            Viewport::Runtime => "runtime",
        })
    }
}

#[derive(Debug)]
pub struct Sandbox {
    pub index: SandboxIndex,
    pub name: String,
    pub(crate) scene: EntityManager,
    pub(crate) runtime: Option<EntityManager>,
    /// Bumped every time the runtime world is created or torn down.
    runtime_session: u64,
    pub(crate) selection: Vec<Entity>,
    dirty: bool,
    render_requested: bool,
    pub(crate) pending_builds: Arc<AtomicU32>,
    pub(crate) locked: Arc<LockedComponents>,
}

impl Sandbox {
    pub(crate) fn new(index: SandboxIndex, name: impl Into<String>, locked_capacity: usize) -> Self {
        Self {
            index,
            name: name.into(),
            scene: EntityManager::new(),
            runtime: None,
            runtime_session: 0,
            selection: Vec::new(),
            dirty: false,
            render_requested: false,
            pending_builds: Arc::new(AtomicU32::new(0)),
            locked: Arc::new(LockedComponents::new(locked_capacity)),
        }
    }

    pub fn entity_manager(&self, viewport: Viewport) -> Option<&EntityManager> {
        match viewport {
            Viewport::Scene => Some(&self.scene),
            Viewport::Runtime => self.runtime.as_ref(),
        }
    }

    pub fn entity_manager_mut(&mut self, viewport: Viewport) -> Option<&mut EntityManager> {
        match viewport {
            Viewport::Scene => Some(&mut self.scene),
            Viewport::Runtime => self.runtime.as_mut(),
        }
    }

    pub(crate) fn register_component(&mut self, info: &ComponentInfo) -> Result<(), EntityManagerError> {
        self.scene.register_component(info.clone())?;
        if let Some(runtime) = self.runtime.as_mut() {
            runtime.register_component(info.clone())?;
        }
        Ok(())
    }

    /// Start simulating: the runtime world becomes a copy of the scene.
    pub fn start_runtime(&mut self) {
        self.runtime = Some(self.scene.duplicate());
        self.runtime_session += 1;
        tracing::info!(sandbox = %self.name, "runtime started");
    }

    /// Tear the runtime world down. Every handle into it becomes invalid.
    pub fn stop_runtime(&mut self) {
        if self.runtime.take().is_some() {
            self.runtime_session += 1;
            tracing::info!(sandbox = %self.name, "runtime stopped");
        }
    }

    pub fn is_runtime_running(&self) -> bool {
        self.runtime.is_some()
    }

    pub fn runtime_session(&self) -> u64 {
        self.runtime_session
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub(crate) fn mark_dirty(&mut self, viewport: Viewport) {
        if viewport == Viewport::Scene {
            self.dirty = true;
        }
        self.render_requested = true;
    }

    pub fn clear_dirty(&mut self) {
        self.dirty = false;
    }

    /// Returns and clears the re-render request.
    pub fn take_render_request(&mut self) -> bool {
        std::mem::take(&mut self.render_requested)
    }

    /// Background builds in flight for this sandbox.
    pub fn background_build_count(&self) -> u32 {
        self.pending_builds.load(Ordering::Acquire)
    }

    pub fn locked_components(&self) -> &LockedComponents {
        &self.locked
    }

    pub fn selection(&self) -> &[Entity] {
        &self.selection
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runtime_session_changes_on_start_and_stop() {
        let mut sandbox = Sandbox::new(0, "main", 8);
        assert!(sandbox.entity_manager(Viewport::Runtime).is_none());
        sandbox.start_runtime();
        let running = sandbox.runtime_session();
        assert!(sandbox.is_runtime_running());
        sandbox.stop_runtime();
        assert_ne!(sandbox.runtime_session(), running);
        // Stopping twice changes nothing.
        let stopped = sandbox.runtime_session();
        sandbox.stop_runtime();
        assert_eq!(sandbox.runtime_session(), stopped);
    }

    #[test]
    fn runtime_edits_do_not_dirty_the_scene() {
        let mut sandbox = Sandbox::new(0, "main", 8);
        sandbox.mark_dirty(Viewport::Runtime);
        assert!(!sandbox.is_dirty());
        assert!(sandbox.take_render_request());
        assert!(!sandbox.take_render_request());
        sandbox.mark_dirty(Viewport::Scene);
        assert!(sandbox.is_dirty());
    }
}
