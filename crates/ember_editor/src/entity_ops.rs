// entity_ops.rs - Sandbox entity operations
//
// The façade panels use to edit a sandbox. Every operation keeps asset
// reference counts, selection, dirty flags and shared instance hygiene
// consistent with the entity manager.
//
// Stale entities are an expected race (simulation or another panel may
// have deleted them earlier in the frame): those calls return `Ok(false)`
// or `None`. Asset references are only counted for the scene; the runtime
// world lives off the snapshot it was created from.

use crate::editor::EditorState;
use crate::link::{convert_link_to_target, convert_target_to_link, link_target_meta, LinkError};
use crate::sandbox::{SandboxIndex, Viewport};
use crate::EditorError;
use ember_asset::editor_component_assets;
use ember_core::asset::AssetTypedHandle;
use ember_core::ecs::{
    ArchetypeId, ComponentData, ComponentId, ComponentKind, Entity, EntityManager, SharedInstance,
};
use ember_core::reflect::ComponentMeta;
use std::collections::HashMap;
use tracing::debug;

/// Result of `delete_sandbox_entity`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DeleteStatus {
    Deleted,
    /// Background builds are pending; the delete runs once they finish.
    Deferred,
    /// Entity (or runtime world) does not exist.
    Missing,
}

fn destroy_if_empty(manager: &mut EntityManager, archetype: Option<ArchetypeId>) {
    if let Some(archetype) = archetype {
        manager.destroy_archetype_if_empty(archetype);
    }
}

impl EditorState {
    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    pub(crate) fn manager(&self, sandbox: SandboxIndex, viewport: Viewport) -> Result<Option<&EntityManager>, EditorError> {
        Ok(self.sandbox(sandbox)?.entity_manager(viewport))
    }

    pub(crate) fn manager_mut(
        &mut self,
        sandbox: SandboxIndex,
        viewport: Viewport,
    ) -> Result<Option<&mut EntityManager>, EditorError> {
        Ok(self.sandbox_mut(sandbox)?.entity_manager_mut(viewport))
    }

    fn live_manager(&self, sandbox: SandboxIndex, viewport: Viewport, entity: Entity) -> Result<Option<&EntityManager>, EditorError> {
        Ok(self
            .manager(sandbox, viewport)?
            .filter(|manager| manager.exists_entity(entity)))
    }

    fn mark_dirty(&mut self, sandbox: SandboxIndex, viewport: Viewport) -> Result<(), EditorError> {
        self.sandbox_mut(sandbox)?.mark_dirty(viewport);
        Ok(())
    }

    pub(crate) fn is_locked(
        &self,
        sandbox: SandboxIndex,
        viewport: Viewport,
        entity: Entity,
        component: ComponentId,
        is_shared: bool,
    ) -> bool {
        self.sandbox(sandbox)
            .map_or(false, |s| s.locked.is_component_locked(viewport, entity, component, is_shared))
    }

    fn refuse_locked(&mut self, sandbox: SandboxIndex, viewport: Viewport, entity: Entity, meta: &ComponentMeta) -> bool {
        let is_shared = meta.kind == ComponentKind::Shared;
        if !self.is_locked(sandbox, viewport, entity, meta.id, is_shared) {
            return false;
        }
        self.console.warn(format!(
            "{} on {entity} is locked by a background build and cannot be changed",
            meta.name
        ));
        true
    }

    pub(crate) fn value_assets(&self, meta: &ComponentMeta, data: &ComponentData) -> Vec<AssetTypedHandle> {
        editor_component_assets(meta, data, &self.assets)
    }

    pub(crate) fn register_assets(&mut self, sandbox: SandboxIndex, viewport: Viewport, assets: &[AssetTypedHandle], count: u32) {
        if viewport != Viewport::Scene || count == 0 {
            return;
        }
        for &asset in assets {
            if let Err(err) = self.assets.increment_asset_reference_in_sandbox(asset, sandbox, count) {
                self.console.warn(format!("could not reference {asset}: {err}"));
            }
        }
    }

    pub(crate) fn unregister_assets(&mut self, sandbox: SandboxIndex, viewport: Viewport, assets: &[AssetTypedHandle]) {
        if viewport == Viewport::Scene {
            self.assets.unregister_sandbox_assets(assets, sandbox);
        }
    }

    /// Move asset references from `old` to `new`. New references are taken
    /// first so an asset present in both never unloads in between.
    pub(crate) fn rebalance_assets(
        &mut self,
        sandbox: SandboxIndex,
        viewport: Viewport,
        meta: &ComponentMeta,
        old: &ComponentData,
        new: &ComponentData,
    ) {
        if viewport != Viewport::Scene {
            return;
        }
        let added = self.value_assets(meta, new);
        let removed = self.value_assets(meta, old);
        self.register_assets(sandbox, viewport, &added, 1);
        self.unregister_assets(sandbox, viewport, &removed);
    }

    /// Every asset an entity references through its unique and shared
    /// components, one entry per reference.
    pub(crate) fn entity_assets(&self, sandbox: SandboxIndex, viewport: Viewport, entity: Entity) -> Vec<AssetTypedHandle> {
        let Ok(Some(manager)) = self.live_manager(sandbox, viewport, entity) else {
            return Vec::new();
        };
        let mut assets = Vec::new();
        for id in manager.entity_signature(entity).unwrap_or_default() {
            if let (Some(meta), Some(value)) = (self.registry.meta(id), manager.component_value(entity, id)) {
                assets.extend(self.value_assets(meta, &value));
            }
        }
        for (id, instance) in manager.entity_shared_signature(entity).unwrap_or_default() {
            if let (Some(meta), Some(value)) = (self.registry.meta(id), manager.shared_value(id, instance)) {
                assets.extend(self.value_assets(meta, &value));
            }
        }
        assets
    }

    /// Current value of a unique component or of the entity's shared instance.
    pub(crate) fn entity_component_value(
        &self,
        sandbox: SandboxIndex,
        viewport: Viewport,
        entity: Entity,
        meta: &ComponentMeta,
    ) -> Option<ComponentData> {
        let manager = self.live_manager(sandbox, viewport, entity).ok()??;
        match meta.kind {
            ComponentKind::Unique => manager.component_value(entity, meta.id),
            ComponentKind::Shared => {
                let instance = manager.entity_shared_instance(entity, meta.id)?;
                manager.shared_value(meta.id, instance)
            }
            ComponentKind::Global => manager.global_value(meta.id),
        }
    }

    fn report_link_error(&mut self, sandbox: SandboxIndex, entity: Entity, link: &str, err: LinkError) -> EditorError {
        let sandbox_name = self
            .sandbox(sandbox)
            .map_or_else(|_| sandbox.to_string(), |s| s.name.clone());
        self.console.error(format!(
            "converting {link} of {entity} in sandbox {sandbox_name} failed: {err}"
        ));
        EditorError::Link(err)
    }

    fn link_meta(&self, name: &str) -> Result<ComponentMeta, EditorError> {
        let meta = self
            .registry
            .meta_by_name(name)
            .ok_or_else(|| EditorError::UnknownComponent(name.to_string()))?;
        if !meta.is_link() {
            return Err(EditorError::Link(LinkError::NotALinkType {
                component: name.to_string(),
            }));
        }
        Ok(meta.clone())
    }

    // ------------------------------------------------------------------
    // Entities
    // ------------------------------------------------------------------

    pub fn create_sandbox_entity(&mut self, sandbox: SandboxIndex, viewport: Viewport) -> Result<Option<Entity>, EditorError> {
        let Some(manager) = self.manager_mut(sandbox, viewport)? else {
            return Ok(None);
        };
        let entity = manager.create_entity();
        self.mark_dirty(sandbox, viewport)?;
        Ok(Some(entity))
    }

    /// Create an entity with default-valued unique components and default
    /// shared instances, then run their build functions.
    pub fn create_sandbox_entity_with(
        &mut self,
        sandbox: SandboxIndex,
        viewport: Viewport,
        unique: &[&str],
        shared: &[&str],
    ) -> Result<Option<Entity>, EditorError> {
        let unique_metas = unique
            .iter()
            .map(|name| self.meta_of_kind(name, ComponentKind::Unique))
            .collect::<Result<Vec<_>, _>>()?;
        let shared_metas = shared
            .iter()
            .map(|name| self.meta_of_kind(name, ComponentKind::Shared))
            .collect::<Result<Vec<_>, _>>()?;
        if self.manager(sandbox, viewport)?.is_none() {
            return Ok(None);
        }

        let mut shared_instances = Vec::with_capacity(shared_metas.len());
        for meta in &shared_metas {
            if let Some(instance) = self.find_or_create_shared_instance(sandbox, viewport, meta, &meta.default)? {
                shared_instances.push((meta.id, instance));
            }
        }
        let unique_values: Vec<(ComponentId, ComponentData)> =
            unique_metas.iter().map(|m| (m.id, m.default.clone())).collect();

        let Some(manager) = self.manager_mut(sandbox, viewport)? else {
            return Ok(None);
        };
        let entity = manager.create_entity_with(&unique_values, &shared_instances)?;

        let mut assets = Vec::new();
        for meta in unique_metas.iter().chain(&shared_metas) {
            assets.extend(self.value_assets(meta, &meta.default));
        }
        self.register_assets(sandbox, viewport, &assets, 1);
        self.mark_dirty(sandbox, viewport)?;

        for meta in unique_metas.iter().chain(&shared_metas) {
            self.call_sandbox_component_build_function(sandbox, viewport, entity, meta.id)?;
        }
        Ok(Some(entity))
    }

    /// Duplicate an entity `count` times. Each copy holds its own reference
    /// on every asset of the source.
    pub fn copy_sandbox_entity(
        &mut self,
        sandbox: SandboxIndex,
        viewport: Viewport,
        entity: Entity,
        count: usize,
    ) -> Result<Vec<Entity>, EditorError> {
        if count == 0 || self.live_manager(sandbox, viewport, entity)?.is_none() {
            return Ok(Vec::new());
        }
        let assets = self.entity_assets(sandbox, viewport, entity);
        let Some(manager) = self.manager_mut(sandbox, viewport)? else {
            return Ok(Vec::new());
        };
        let copies = manager.copy_entity(entity, count)?;
        self.register_assets(sandbox, viewport, &assets, count as u32);
        self.mark_dirty(sandbox, viewport)?;
        debug!(%entity, count, "copied sandbox entity");
        Ok(copies)
    }

    /// Delete an entity, or postpone it while background builds are running
    /// against this sandbox.
    pub fn delete_sandbox_entity(
        &mut self,
        sandbox: SandboxIndex,
        viewport: Viewport,
        entity: Entity,
    ) -> Result<DeleteStatus, EditorError> {
        if self.live_manager(sandbox, viewport, entity)?.is_none() {
            return Ok(DeleteStatus::Missing);
        }
        if self.sandbox(sandbox)?.background_build_count() > 0 {
            self.events.push(crate::events::EditorEvent::DeferredDelete {
                sandbox,
                viewport,
                entity,
            });
            debug!(%entity, "delete deferred until background builds finish");
            return Ok(DeleteStatus::Deferred);
        }
        if self.delete_sandbox_entity_now(sandbox, viewport, entity)? {
            Ok(DeleteStatus::Deleted)
        } else {
            Ok(DeleteStatus::Missing)
        }
    }

    pub(crate) fn delete_sandbox_entity_now(
        &mut self,
        sandbox: SandboxIndex,
        viewport: Viewport,
        entity: Entity,
    ) -> Result<bool, EditorError> {
        if self.live_manager(sandbox, viewport, entity)?.is_none() {
            return Ok(false);
        }
        let assets = self.entity_assets(sandbox, viewport, entity);
        self.unregister_assets(sandbox, viewport, &assets);

        let Some(manager) = self.manager_mut(sandbox, viewport)? else {
            return Ok(false);
        };
        let shared = manager.entity_shared_signature(entity).unwrap_or_default();
        let archetype = manager.entity_location(entity).map(|loc| loc.archetype);
        manager.delete_entity(entity)?;
        for (component, instance) in shared {
            manager.unregister_unreferenced_shared_instance(component, instance);
        }
        destroy_if_empty(manager, archetype);

        let sandbox_state = self.sandbox_mut(sandbox)?;
        sandbox_state.selection.retain(|e| *e != entity);
        sandbox_state.mark_dirty(viewport);
        debug!(%entity, "deleted sandbox entity");
        Ok(true)
    }

    /// Parent `child` under `parent`, or unparent it with `None`.
    pub fn parent_sandbox_entity(
        &mut self,
        sandbox: SandboxIndex,
        viewport: Viewport,
        child: Entity,
        parent: Option<Entity>,
    ) -> Result<bool, EditorError> {
        let Some(manager) = self.manager_mut(sandbox, viewport)? else {
            return Ok(false);
        };
        if !manager.exists_entity(child) || parent.map_or(false, |p| !manager.exists_entity(p)) {
            return Ok(false);
        }
        if let Err(err) = manager.set_parent(child, parent) {
            self.console.warn(err.to_string());
            return Ok(false);
        }
        self.mark_dirty(sandbox, viewport)?;
        Ok(true)
    }

    // ------------------------------------------------------------------
    // Unique components
    // ------------------------------------------------------------------

    pub fn add_sandbox_entity_component(
        &mut self,
        sandbox: SandboxIndex,
        viewport: Viewport,
        entity: Entity,
        component: &str,
    ) -> Result<bool, EditorError> {
        let meta = self.meta_of_kind(component, ComponentKind::Unique)?;
        let Some(manager) = self.manager_mut(sandbox, viewport)? else {
            return Ok(false);
        };
        if !manager.exists_entity(entity) || manager.has_component(entity, meta.id) {
            return Ok(false);
        }
        let previous = manager.entity_location(entity).map(|loc| loc.archetype);
        manager.add_component(entity, meta.id, &meta.default)?;
        destroy_if_empty(manager, previous);

        let assets = self.value_assets(&meta, &meta.default);
        self.register_assets(sandbox, viewport, &assets, 1);
        self.mark_dirty(sandbox, viewport)?;
        self.call_sandbox_component_build_function(sandbox, viewport, entity, meta.id)?;
        Ok(true)
    }

    pub fn remove_sandbox_entity_component(
        &mut self,
        sandbox: SandboxIndex,
        viewport: Viewport,
        entity: Entity,
        component: &str,
    ) -> Result<bool, EditorError> {
        let meta = self.meta_of_kind(component, ComponentKind::Unique)?;
        let Some(value) = self.entity_component_value(sandbox, viewport, entity, &meta) else {
            return Ok(false);
        };
        if self.refuse_locked(sandbox, viewport, entity, &meta) {
            return Ok(false);
        }
        let assets = self.value_assets(&meta, &value);
        self.unregister_assets(sandbox, viewport, &assets);

        let Some(manager) = self.manager_mut(sandbox, viewport)? else {
            return Ok(false);
        };
        let previous = manager.entity_location(entity).map(|loc| loc.archetype);
        manager.remove_component(entity, meta.id)?;
        destroy_if_empty(manager, previous);
        self.mark_dirty(sandbox, viewport)?;
        Ok(true)
    }

    /// Restore a unique component's default value in place.
    pub fn reset_sandbox_entity_component(
        &mut self,
        sandbox: SandboxIndex,
        viewport: Viewport,
        entity: Entity,
        component: &str,
    ) -> Result<bool, EditorError> {
        let meta = self.meta_of_kind(component, ComponentKind::Unique)?;
        if self.entity_component_value(sandbox, viewport, entity, &meta).is_none()
            || self.refuse_locked(sandbox, viewport, entity, &meta)
        {
            return Ok(false);
        }
        self.write_unique_value(sandbox, viewport, entity, &meta, &meta.default)?;
        self.call_sandbox_component_build_function(sandbox, viewport, entity, meta.id)?;
        Ok(true)
    }

    /// Overwrite a unique component, keeping asset references balanced.
    pub(crate) fn write_unique_value(
        &mut self,
        sandbox: SandboxIndex,
        viewport: Viewport,
        entity: Entity,
        meta: &ComponentMeta,
        data: &ComponentData,
    ) -> Result<bool, EditorError> {
        let Some(old) = self.entity_component_value(sandbox, viewport, entity, meta) else {
            return Ok(false);
        };
        let Some(manager) = self.manager_mut(sandbox, viewport)? else {
            return Ok(false);
        };
        manager.set_component_value(entity, meta.id, data)?;
        self.rebalance_assets(sandbox, viewport, meta, &old, data);
        self.mark_dirty(sandbox, viewport)?;
        Ok(true)
    }

    // ------------------------------------------------------------------
    // Shared components
    // ------------------------------------------------------------------

    pub(crate) fn find_or_create_shared_instance(
        &mut self,
        sandbox: SandboxIndex,
        viewport: Viewport,
        meta: &ComponentMeta,
        data: &ComponentData,
    ) -> Result<Option<SharedInstance>, EditorError> {
        let Some(manager) = self.manager_mut(sandbox, viewport)? else {
            return Ok(None);
        };
        if let Some(instance) = manager.find_shared_instance(meta.id, data) {
            return Ok(Some(instance));
        }
        let instance = manager.register_shared_instance(meta.id, data)?;
        debug!(component = %meta.name, %instance, "created shared instance");
        Ok(Some(instance))
    }

    /// Instance holding exactly `data`, created when none exists yet.
    /// Calling it twice with the same value yields the same instance.
    pub fn find_or_create_sandbox_shared_component_instance(
        &mut self,
        sandbox: SandboxIndex,
        viewport: Viewport,
        component: &str,
        data: &ComponentData,
    ) -> Result<Option<SharedInstance>, EditorError> {
        let meta = self.meta_of_kind(component, ComponentKind::Shared)?;
        self.find_or_create_shared_instance(sandbox, viewport, &meta, data)
    }

    /// Attach a shared component. `None` picks (or creates) the instance
    /// holding the default value.
    pub fn add_sandbox_entity_shared_component(
        &mut self,
        sandbox: SandboxIndex,
        viewport: Viewport,
        entity: Entity,
        component: &str,
        instance: Option<SharedInstance>,
    ) -> Result<bool, EditorError> {
        let meta = self.meta_of_kind(component, ComponentKind::Shared)?;
        match self.live_manager(sandbox, viewport, entity)? {
            Some(manager) if !manager.has_shared_component(entity, meta.id) => {}
            _ => return Ok(false),
        }
        let instance = match instance {
            Some(instance) => instance,
            None => match self.find_or_create_shared_instance(sandbox, viewport, &meta, &meta.default)? {
                Some(instance) => instance,
                None => return Ok(false),
            },
        };

        let Some(manager) = self.manager_mut(sandbox, viewport)? else {
            return Ok(false);
        };
        let Some(value) = manager.shared_value(meta.id, instance) else {
            return Ok(false);
        };
        let previous = manager.entity_location(entity).map(|loc| loc.archetype);
        manager.add_shared_component(entity, meta.id, instance)?;
        destroy_if_empty(manager, previous);

        let assets = self.value_assets(&meta, &value);
        self.register_assets(sandbox, viewport, &assets, 1);
        self.mark_dirty(sandbox, viewport)?;
        self.call_sandbox_component_build_function(sandbox, viewport, entity, meta.id)?;
        Ok(true)
    }

    pub fn remove_sandbox_entity_shared_component(
        &mut self,
        sandbox: SandboxIndex,
        viewport: Viewport,
        entity: Entity,
        component: &str,
    ) -> Result<bool, EditorError> {
        let meta = self.meta_of_kind(component, ComponentKind::Shared)?;
        let Some(value) = self.entity_component_value(sandbox, viewport, entity, &meta) else {
            return Ok(false);
        };
        if self.refuse_locked(sandbox, viewport, entity, &meta) {
            return Ok(false);
        }
        let assets = self.value_assets(&meta, &value);
        self.unregister_assets(sandbox, viewport, &assets);

        let Some(manager) = self.manager_mut(sandbox, viewport)? else {
            return Ok(false);
        };
        let previous = manager.entity_location(entity).map(|loc| loc.archetype);
        let instance = manager.remove_shared_component(entity, meta.id)?;
        manager.unregister_unreferenced_shared_instance(meta.id, instance);
        destroy_if_empty(manager, previous);
        self.mark_dirty(sandbox, viewport)?;
        Ok(true)
    }

    /// Reset a shared component by removing it and adding the default
    /// instance back, which reuses the asset bookkeeping of both paths.
    pub fn reset_sandbox_entity_shared_component(
        &mut self,
        sandbox: SandboxIndex,
        viewport: Viewport,
        entity: Entity,
        component: &str,
    ) -> Result<bool, EditorError> {
        if !self.remove_sandbox_entity_shared_component(sandbox, viewport, entity, component)? {
            return Ok(false);
        }
        self.add_sandbox_entity_shared_component(sandbox, viewport, entity, component, None)
    }

    /// Point an entity at another existing instance. The old instance is
    /// unregistered when nothing references it anymore.
    pub fn change_sandbox_entity_shared_instance(
        &mut self,
        sandbox: SandboxIndex,
        viewport: Viewport,
        entity: Entity,
        component: &str,
        instance: SharedInstance,
    ) -> Result<bool, EditorError> {
        let meta = self.meta_of_kind(component, ComponentKind::Shared)?;
        if self.refuse_locked(sandbox, viewport, entity, &meta) {
            return Ok(false);
        }
        self.reassign_shared_instance(sandbox, viewport, entity, &meta, instance)
    }

    fn reassign_shared_instance(
        &mut self,
        sandbox: SandboxIndex,
        viewport: Viewport,
        entity: Entity,
        meta: &ComponentMeta,
        instance: SharedInstance,
    ) -> Result<bool, EditorError> {
        let Some(old_value) = self.entity_component_value(sandbox, viewport, entity, meta) else {
            return Ok(false);
        };
        let Some(manager) = self.manager_mut(sandbox, viewport)? else {
            return Ok(false);
        };
        let Some(new_value) = manager.shared_value(meta.id, instance) else {
            return Ok(false);
        };
        let old = manager.change_entity_shared_instance(entity, meta.id, instance)?;
        if old == instance {
            return Ok(false);
        }
        manager.unregister_unreferenced_shared_instance(meta.id, old);
        self.rebalance_assets(sandbox, viewport, meta, &old_value, &new_value);
        self.mark_dirty(sandbox, viewport)?;
        Ok(true)
    }

    /// Give an entity the shared value `data` without touching the instance
    /// other entities may still share.
    pub(crate) fn write_shared_value(
        &mut self,
        sandbox: SandboxIndex,
        viewport: Viewport,
        entity: Entity,
        meta: &ComponentMeta,
        data: &ComponentData,
    ) -> Result<bool, EditorError> {
        if self.live_manager(sandbox, viewport, entity)?.is_none() {
            return Ok(false);
        }
        let Some(instance) = self.find_or_create_shared_instance(sandbox, viewport, meta, data)? else {
            return Ok(false);
        };
        let changed = self.reassign_shared_instance(sandbox, viewport, entity, meta, instance)?;
        if !changed {
            // Freshly created for nothing if the entity was already there.
            if let Some(manager) = self.manager_mut(sandbox, viewport)? {
                if manager.entity_shared_instance(entity, meta.id) != Some(instance) {
                    manager.unregister_unreferenced_shared_instance(meta.id, instance);
                }
            }
        }
        Ok(changed)
    }

    // ------------------------------------------------------------------
    // Component data
    // ------------------------------------------------------------------

    pub fn sandbox_entity_component_data(
        &self,
        sandbox: SandboxIndex,
        viewport: Viewport,
        entity: Entity,
        component: &str,
    ) -> Result<Option<ComponentData>, EditorError> {
        let meta = self
            .registry
            .meta_by_name(component)
            .ok_or_else(|| EditorError::UnknownComponent(component.to_string()))?;
        Ok(self.entity_component_value(sandbox, viewport, entity, meta))
    }

    /// Replace a component value. Shared components get a matching instance
    /// instead of being rewritten in place. Dependent builds are re-run.
    pub fn set_sandbox_entity_component_data(
        &mut self,
        sandbox: SandboxIndex,
        viewport: Viewport,
        entity: Entity,
        component: &str,
        data: &ComponentData,
    ) -> Result<bool, EditorError> {
        let meta = self
            .registry
            .meta_by_name(component)
            .cloned()
            .ok_or_else(|| EditorError::UnknownComponent(component.to_string()))?;
        if self.refuse_locked(sandbox, viewport, entity, &meta) {
            return Ok(false);
        }
        let changed = match meta.kind {
            ComponentKind::Unique => self.write_unique_value(sandbox, viewport, entity, &meta, data)?,
            ComponentKind::Shared => self.write_shared_value(sandbox, viewport, entity, &meta, data)?,
            ComponentKind::Global => {
                return Err(EditorError::WrongKind {
                    component: meta.name,
                    expected: ComponentKind::Unique,
                    actual: ComponentKind::Global,
                })
            }
        };
        if changed {
            self.notify_sandbox_component_changed(sandbox, viewport, entity, meta.id)?;
        }
        Ok(changed)
    }

    // ------------------------------------------------------------------
    // Link components
    // ------------------------------------------------------------------

    /// Build the link view of the entity's target component.
    pub fn convert_sandbox_target_to_link_component(
        &mut self,
        sandbox: SandboxIndex,
        viewport: Viewport,
        entity: Entity,
        link: &str,
        previous_link: Option<&ComponentData>,
    ) -> Result<Option<ComponentData>, EditorError> {
        let link_meta = self.link_meta(link)?;
        let target_meta = match link_target_meta(&self.link_context(), &link_meta) {
            Ok(meta) => meta.clone(),
            Err(err) => return Err(self.report_link_error(sandbox, entity, link, err)),
        };
        let Some(target) = self.entity_component_value(sandbox, viewport, entity, &target_meta) else {
            return Ok(None);
        };
        let mut link_data = link_meta.default.clone();
        let result = convert_target_to_link(
            &self.link_context(),
            &link_meta,
            &target,
            &mut link_data,
            None,
            previous_link,
        );
        match result {
            Ok(()) => Ok(Some(link_data)),
            Err(err) => Err(self.report_link_error(sandbox, entity, link, err)),
        }
    }

    /// Convert a link value onto the live target, returning the new target
    /// value without writing it.
    #[allow(clippy::too_many_arguments)]
    fn link_to_target_value(
        &mut self,
        sandbox: SandboxIndex,
        viewport: Viewport,
        entity: Entity,
        link_meta: &ComponentMeta,
        link: &ComponentData,
        previous_link: Option<&ComponentData>,
        previous_target: Option<&ComponentData>,
        apply_modifier: bool,
    ) -> Result<Option<(ComponentMeta, ComponentData)>, EditorError> {
        let target_meta = match link_target_meta(&self.link_context(), link_meta) {
            Ok(meta) => meta.clone(),
            Err(err) => return Err(self.report_link_error(sandbox, entity, &link_meta.name, err)),
        };
        let Some(mut staged) = self.entity_component_value(sandbox, viewport, entity, &target_meta) else {
            return Ok(None);
        };
        let result = convert_link_to_target(
            &self.link_context(),
            link_meta,
            link,
            &mut staged,
            previous_link,
            previous_target,
            apply_modifier,
        );
        match result {
            Ok(()) => Ok(Some((target_meta, staged))),
            Err(err) => Err(self.report_link_error(sandbox, entity, &link_meta.name, err)),
        }
    }

    /// Write a link value into the entity's target component, routing shared
    /// targets through the instance update path.
    #[allow(clippy::too_many_arguments)]
    pub fn convert_sandbox_link_component_to_target(
        &mut self,
        sandbox: SandboxIndex,
        viewport: Viewport,
        entity: Entity,
        link: &str,
        link_data: &ComponentData,
        previous_link: Option<&ComponentData>,
        previous_target: Option<&ComponentData>,
        apply_modifier: bool,
    ) -> Result<bool, EditorError> {
        let link_meta = self.link_meta(link)?;
        let target_kind = match link_target_meta(&self.link_context(), &link_meta) {
            Ok(meta) => meta.kind,
            Err(err) => return Err(self.report_link_error(sandbox, entity, link, err)),
        };
        match target_kind {
            ComponentKind::Shared => self.sandbox_update_shared_link_component_for_entity(
                sandbox,
                viewport,
                entity,
                link,
                link_data,
                previous_link,
                previous_target,
                apply_modifier,
            ),
            _ => self.sandbox_update_unique_link_component_for_entity(
                sandbox,
                viewport,
                entity,
                link,
                link_data,
                previous_link,
                previous_target,
                apply_modifier,
            ),
        }
    }

    /// Convert a link value and move the entity to the shared instance
    /// holding the result, creating it when needed.
    #[allow(clippy::too_many_arguments)]
    pub fn sandbox_update_shared_link_component_for_entity(
        &mut self,
        sandbox: SandboxIndex,
        viewport: Viewport,
        entity: Entity,
        link: &str,
        link_data: &ComponentData,
        previous_link: Option<&ComponentData>,
        previous_target: Option<&ComponentData>,
        apply_modifier: bool,
    ) -> Result<bool, EditorError> {
        let link_meta = self.link_meta(link)?;
        let Some((target_meta, value)) = self.link_to_target_value(
            sandbox,
            viewport,
            entity,
            &link_meta,
            link_data,
            previous_link,
            previous_target,
            apply_modifier,
        )?
        else {
            return Ok(false);
        };
        if target_meta.kind != ComponentKind::Shared {
            return Err(EditorError::WrongKind {
                component: target_meta.name,
                expected: ComponentKind::Shared,
                actual: target_meta.kind,
            });
        }
        if self.refuse_locked(sandbox, viewport, entity, &target_meta) {
            return Ok(false);
        }
        let changed = self.write_shared_value(sandbox, viewport, entity, &target_meta, &value)?;
        if changed {
            self.notify_sandbox_component_changed(sandbox, viewport, entity, target_meta.id)?;
        }
        Ok(changed)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn sandbox_update_unique_link_component_for_entity(
        &mut self,
        sandbox: SandboxIndex,
        viewport: Viewport,
        entity: Entity,
        link: &str,
        link_data: &ComponentData,
        previous_link: Option<&ComponentData>,
        previous_target: Option<&ComponentData>,
        apply_modifier: bool,
    ) -> Result<bool, EditorError> {
        let link_meta = self.link_meta(link)?;
        let Some((target_meta, value)) = self.link_to_target_value(
            sandbox,
            viewport,
            entity,
            &link_meta,
            link_data,
            previous_link,
            previous_target,
            apply_modifier,
        )?
        else {
            return Ok(false);
        };
        if target_meta.kind != ComponentKind::Unique {
            return Err(EditorError::WrongKind {
                component: target_meta.name,
                expected: ComponentKind::Unique,
                actual: target_meta.kind,
            });
        }
        if self.refuse_locked(sandbox, viewport, entity, &target_meta) {
            return Ok(false);
        }
        let changed = self.write_unique_value(sandbox, viewport, entity, &target_meta, &value)?;
        if changed {
            self.notify_sandbox_component_changed(sandbox, viewport, entity, target_meta.id)?;
        }
        Ok(changed)
    }

    // ------------------------------------------------------------------
    // Global components
    // ------------------------------------------------------------------

    pub fn register_sandbox_global_component(
        &mut self,
        sandbox: SandboxIndex,
        viewport: Viewport,
        component: &str,
    ) -> Result<bool, EditorError> {
        let meta = self.meta_of_kind(component, ComponentKind::Global)?;
        let Some(manager) = self.manager_mut(sandbox, viewport)? else {
            return Ok(false);
        };
        if manager.exists_global_component(meta.id) {
            return Ok(false);
        }
        manager.register_global_component(meta.id, &meta.default)?;
        let assets = self.value_assets(&meta, &meta.default);
        self.register_assets(sandbox, viewport, &assets, 1);
        self.mark_dirty(sandbox, viewport)?;
        Ok(true)
    }

    pub fn remove_sandbox_global_component(
        &mut self,
        sandbox: SandboxIndex,
        viewport: Viewport,
        component: &str,
    ) -> Result<bool, EditorError> {
        let meta = self.meta_of_kind(component, ComponentKind::Global)?;
        if self.sandbox(sandbox)?.locked.is_global_locked(viewport, meta.id) {
            self.console
                .warn(format!("{} is locked by a background build and cannot be removed", meta.name));
            return Ok(false);
        }
        let Some(value) = self.sandbox_global_component_data(sandbox, viewport, component)? else {
            return Ok(false);
        };
        let assets = self.value_assets(&meta, &value);
        self.unregister_assets(sandbox, viewport, &assets);
        if let Some(manager) = self.manager_mut(sandbox, viewport)? {
            manager.remove_global_component(meta.id)?;
        }
        self.mark_dirty(sandbox, viewport)?;
        Ok(true)
    }

    pub fn sandbox_global_component_data(
        &self,
        sandbox: SandboxIndex,
        viewport: Viewport,
        component: &str,
    ) -> Result<Option<ComponentData>, EditorError> {
        let meta = self.meta_of_kind(component, ComponentKind::Global)?;
        Ok(self
            .manager(sandbox, viewport)?
            .and_then(|manager| manager.global_value(meta.id)))
    }

    /// Replace a global value and re-run the builds that read it.
    pub fn set_sandbox_global_component_data(
        &mut self,
        sandbox: SandboxIndex,
        viewport: Viewport,
        component: &str,
        data: &ComponentData,
    ) -> Result<bool, EditorError> {
        let meta = self.meta_of_kind(component, ComponentKind::Global)?;
        if self.sandbox(sandbox)?.locked.is_global_locked(viewport, meta.id) {
            self.console
                .warn(format!("{} is locked by a background build and cannot be changed", meta.name));
            return Ok(false);
        }
        let Some(old) = self.sandbox_global_component_data(sandbox, viewport, component)? else {
            return Ok(false);
        };
        if let Some(manager) = self.manager_mut(sandbox, viewport)? {
            manager.set_global_value(meta.id, data)?;
        }
        self.rebalance_assets(sandbox, viewport, &meta, &old, data);
        self.mark_dirty(sandbox, viewport)?;
        self.notify_sandbox_global_component_changed(sandbox, viewport, meta.id)?;
        Ok(true)
    }

    // ------------------------------------------------------------------
    // Selection
    // ------------------------------------------------------------------

    pub fn select_sandbox_entity(&mut self, sandbox: SandboxIndex, entity: Entity) -> Result<bool, EditorError> {
        let state = self.sandbox_mut(sandbox)?;
        if !state.scene.exists_entity(entity) || state.selection.contains(&entity) {
            return Ok(false);
        }
        state.selection.push(entity);
        Ok(true)
    }

    pub fn deselect_sandbox_entity(&mut self, sandbox: SandboxIndex, entity: Entity) -> Result<bool, EditorError> {
        let state = self.sandbox_mut(sandbox)?;
        let before = state.selection.len();
        state.selection.retain(|e| *e != entity);
        Ok(state.selection.len() != before)
    }

    pub fn clear_sandbox_selection(&mut self, sandbox: SandboxIndex) -> Result<(), EditorError> {
        self.sandbox_mut(sandbox)?.selection.clear();
        Ok(())
    }

    pub fn is_sandbox_entity_selected(&self, sandbox: SandboxIndex, entity: Entity) -> bool {
        self.sandbox(sandbox)
            .map_or(false, |s| s.selection.contains(&entity))
    }

    // ------------------------------------------------------------------
    // Diagnostics
    // ------------------------------------------------------------------

    /// References the scene holds per asset, recomputed from component
    /// values. Matches the asset database when bookkeeping is consistent.
    pub fn sandbox_assets_referenced(&self, sandbox: SandboxIndex) -> Result<HashMap<AssetTypedHandle, u32>, EditorError> {
        let manager = &self.sandbox(sandbox)?.scene;
        let mut counts = HashMap::new();
        for entity in manager.entities() {
            for asset in self.entity_assets(sandbox, Viewport::Scene, entity) {
                *counts.entry(asset).or_insert(0) += 1;
            }
        }
        for id in manager.global_components() {
            if let (Some(meta), Some(value)) = (self.registry.meta(id), manager.global_value(id)) {
                for asset in self.value_assets(meta, &value) {
                    *counts.entry(asset).or_insert(0) += 1;
                }
            }
        }
        Ok(counts)
    }
}
