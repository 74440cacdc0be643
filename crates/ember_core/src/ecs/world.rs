// world.rs - Entity manager with unique, shared and global components
//
// All mutations are immediate ("commit" style): there is no deferred
// command buffer, and the manager is owned by a single thread. Background
// work reads snapshots and hands results back to the owning thread.

use crate::ecs::archetype::{ArchetypeSignature, ArchetypeStorage};
use crate::ecs::arena::{BufferArena, BufferHandle};
use crate::ecs::shared::SharedComponentStore;
use crate::ecs::{
    ArchetypeId, ComponentData, ComponentId, ComponentInfo, ComponentKind, Entity,
    EntityLoc, EntityManagerError, SharedInstance,
};
use std::collections::HashMap;
use tracing::{debug, trace};

type Result<T> = std::result::Result<T, EntityManagerError>;

#[derive(Debug, Clone, Copy, Default)]
struct EntityInfo {
    generation: u32,
    location: Option<EntityLoc>,
    parent: Option<Entity>,
}

/// Owns entities and all of their component storage.
#[derive(Debug, Default)]
pub struct EntityManager {
    infos: Vec<EntityInfo>,
    free_indices: Vec<u32>,
    live_entities: usize,

    components: HashMap<ComponentId, ComponentInfo>,
    unique_sizes: HashMap<ComponentId, usize>,

    archetypes: Vec<Option<ArchetypeStorage>>,
    archetype_lookup: HashMap<ArchetypeSignature, ArchetypeId>,

    shared: HashMap<ComponentId, SharedComponentStore>,
    globals: HashMap<ComponentId, Box<[u8]>>,
    arenas: HashMap<ComponentId, BufferArena>,
}

/// Copy a detached value into row bytes, allocating its buffers.
fn attach(arena: &mut BufferArena, info: &ComponentInfo, data: &ComponentData) -> Result<Vec<u8>> {
    if data.bytes.len() != info.size {
        return Err(EntityManagerError::SizeMismatch {
            component: info.id,
            expected: info.size,
            actual: data.bytes.len(),
        });
    }
    let mut row = data.bytes.clone();
    for &offset in &info.buffer_offsets {
        let handle = match data.buffers.get(&offset) {
            Some(contents) if !contents.is_empty() => arena.allocate(contents.clone()),
            _ => BufferHandle::NULL,
        };
        handle.write_at(&mut row, offset);
    }
    Ok(row)
}

/// Build a detached value from row bytes.
fn detach(arena: &BufferArena, info: &ComponentInfo, row: &[u8]) -> ComponentData {
    let mut data = ComponentData::new(row.to_vec());
    for &offset in &info.buffer_offsets {
        let handle = BufferHandle::read_at(row, offset);
        BufferHandle::NULL.write_at(&mut data.bytes, offset);
        if let Some(contents) = arena.get(handle) {
            if !contents.is_empty() {
                data.buffers.insert(offset, contents.to_vec());
            }
        }
    }
    data
}

/// Bring an externally built value into the same shape `detach` produces.
fn normalize(info: &ComponentInfo, data: &ComponentData) -> ComponentData {
    let mut normalized = ComponentData::new(data.bytes.clone());
    for &offset in &info.buffer_offsets {
        if offset + BufferHandle::SIZE <= normalized.bytes.len() {
            BufferHandle::NULL.write_at(&mut normalized.bytes, offset);
        }
        if let Some(contents) = data.buffers.get(&offset) {
            if !contents.is_empty() {
                normalized.buffers.insert(offset, contents.clone());
            }
        }
    }
    normalized
}

fn release(arena: &mut BufferArena, info: &ComponentInfo, row: &[u8]) {
    for &offset in &info.buffer_offsets {
        arena.deallocate(BufferHandle::read_at(row, offset));
    }
}

fn duplicate_buffers(arena: &mut BufferArena, info: &ComponentInfo, row: &mut [u8]) {
    for &offset in &info.buffer_offsets {
        let copy = arena.duplicate(BufferHandle::read_at(row, offset));
        copy.write_at(row, offset);
    }
}

impl EntityManager {
    /// Create a new empty entity manager.
    pub fn new() -> Self {
        Self::default()
    }

    // ------------------------------------------------------------------
    // Component registration
    // ------------------------------------------------------------------

    /// Register (or re-register) the storage layout of a component.
    ///
    /// Re-registration must keep kind and size; buffer offsets and the
    /// name may be refreshed.
    pub fn register_component(&mut self, info: ComponentInfo) -> Result<()> {
        if let Some(previous) = self.components.get(&info.id) {
            if previous.kind != info.kind {
                return Err(EntityManagerError::WrongKind {
                    component: info.id,
                    expected: previous.kind,
                    actual: info.kind,
                });
            }
            if previous.size != info.size {
                return Err(EntityManagerError::LayoutMismatch {
                    component: info.id,
                    previous: previous.size,
                    requested: info.size,
                });
            }
        } else {
            trace!(component = info.id, name = %info.name, kind = %info.kind, "registering component");
        }
        if info.kind == ComponentKind::Unique {
            self.unique_sizes.insert(info.id, info.size);
        }
        if info.kind == ComponentKind::Shared {
            self.shared.entry(info.id).or_default();
        }
        self.arenas.entry(info.id).or_default();
        self.components.insert(info.id, info);
        Ok(())
    }

    pub fn component_info(&self, id: ComponentId) -> Option<&ComponentInfo> {
        self.components.get(&id)
    }

    pub fn is_component_registered(&self, id: ComponentId) -> bool {
        self.components.contains_key(&id)
    }

    fn info_of(&self, id: ComponentId, expected: ComponentKind) -> Result<&ComponentInfo> {
        let info = self
            .components
            .get(&id)
            .ok_or(EntityManagerError::ComponentNotRegistered { component: id })?;
        if info.kind != expected {
            return Err(EntityManagerError::WrongKind {
                component: id,
                expected,
                actual: info.kind,
            });
        }
        Ok(info)
    }

    // ------------------------------------------------------------------
    // Entities
    // ------------------------------------------------------------------

    pub fn exists_entity(&self, entity: Entity) -> bool {
        self.infos
            .get(entity.index() as usize)
            .map_or(false, |info| info.generation == entity.generation() && info.location.is_some())
    }

    fn location_of(&self, entity: Entity) -> Result<EntityLoc> {
        self.entity_location(entity)
            .ok_or(EntityManagerError::EntityNotFound { entity })
    }

    /// Current storage location of an entity.
    pub fn entity_location(&self, entity: Entity) -> Option<EntityLoc> {
        let info = self.infos.get(entity.index() as usize)?;
        if info.generation != entity.generation() {
            return None;
        }
        info.location
    }

    /// Number of live entities.
    pub fn entity_count(&self) -> usize {
        self.live_entities
    }

    /// All live entities in index order.
    pub fn entities(&self) -> Vec<Entity> {
        self.infos
            .iter()
            .enumerate()
            .filter(|(_, info)| info.location.is_some())
            .map(|(index, info)| Entity::new(index as u32, info.generation))
            .collect()
    }

    fn allocate_entity(&mut self) -> Entity {
        self.live_entities += 1;
        if let Some(index) = self.free_indices.pop() {
            return Entity::new(index, self.infos[index as usize].generation);
        }
        self.infos.push(EntityInfo::default());
        Entity::new((self.infos.len() - 1) as u32, 0)
    }

    fn archetype_for(&mut self, signature: &ArchetypeSignature) -> ArchetypeId {
        if let Some(&id) = self.archetype_lookup.get(signature) {
            return id;
        }
        let id = self.archetypes.len() as ArchetypeId;
        self.archetypes
            .push(Some(ArchetypeStorage::new(signature.clone(), &self.unique_sizes)));
        self.archetype_lookup.insert(signature.clone(), id);
        trace!(archetype = id, ?signature, "created archetype");
        id
    }

    fn storage(&self, id: ArchetypeId) -> &ArchetypeStorage {
        self.archetypes[id as usize]
            .as_ref()
            .expect("entity points at a destroyed archetype")
    }

    fn storage_mut(&mut self, id: ArchetypeId) -> &mut ArchetypeStorage {
        self.archetypes[id as usize]
            .as_mut()
            .expect("entity points at a destroyed archetype")
    }

    fn place_entity(&mut self, entity: Entity, archetype: ArchetypeId) -> EntityLoc {
        let row = self.storage_mut(archetype).push_row(entity) as u32;
        let loc = EntityLoc { archetype, row };
        self.infos[entity.index() as usize].location = Some(loc);
        loc
    }

    /// Remove a row and patch the location of the entity moved into it.
    fn vacate_row(&mut self, loc: EntityLoc) {
        if let Some(moved) = self.storage_mut(loc.archetype).swap_remove_row(loc.row as usize) {
            self.infos[moved.index() as usize].location = Some(loc);
        }
    }

    /// Create an entity without components.
    pub fn create_entity(&mut self) -> Entity {
        let entity = self.allocate_entity();
        let archetype = self.archetype_for(&ArchetypeSignature::default());
        self.place_entity(entity, archetype);
        entity
    }

    /// Create an entity with the given unique values and shared instances
    /// in a single archetype placement.
    pub fn create_entity_with(
        &mut self,
        unique: &[(ComponentId, ComponentData)],
        shared: &[(ComponentId, SharedInstance)],
    ) -> Result<Entity> {
        for (id, data) in unique {
            let info = self.info_of(*id, ComponentKind::Unique)?;
            if data.bytes.len() != info.size {
                return Err(EntityManagerError::SizeMismatch {
                    component: *id,
                    expected: info.size,
                    actual: data.bytes.len(),
                });
            }
        }
        for (id, instance) in shared {
            self.info_of(*id, ComponentKind::Shared)?;
            if !self.exists_shared_instance(*id, *instance) {
                return Err(EntityManagerError::SharedInstanceNotFound {
                    component: *id,
                    instance: *instance,
                });
            }
        }

        let signature = ArchetypeSignature::new(
            unique.iter().map(|(id, _)| *id).collect(),
            shared.iter().map(|(id, _)| *id).collect(),
        );
        let entity = self.allocate_entity();
        let archetype = self.archetype_for(&signature);
        let loc = self.place_entity(entity, archetype);

        for (id, data) in unique {
            let row = {
                let info = &self.components[id];
                let arena = self.arenas.entry(*id).or_default();
                attach(arena, info, data)?
            };
            if let Some(dst) = self.storage_mut(archetype).row_bytes_mut(*id, loc.row as usize) {
                dst.copy_from_slice(&row);
            }
        }
        for (id, instance) in shared {
            self.storage_mut(archetype)
                .set_shared_instance(*id, loc.row as usize, *instance);
            if let Some(store) = self.shared.get_mut(id) {
                store.add_references(*instance, 1);
            }
        }
        Ok(entity)
    }

    /// Delete an entity, releasing its buffers and shared references.
    ///
    /// Shared instances are left registered even when this was their last
    /// reference; callers decide whether to reclaim them.
    pub fn delete_entity(&mut self, entity: Entity) -> Result<()> {
        let loc = self.location_of(entity)?;
        let signature = self.storage(loc.archetype).signature().clone();

        for id in &signature.unique {
            let info = &self.components[id];
            if info.buffer_offsets.is_empty() {
                continue;
            }
            let row = self.storage(loc.archetype).row_bytes(*id, loc.row as usize).map(|r| r.to_vec());
            if let (Some(row), Some(arena)) = (row, self.arenas.get_mut(id)) {
                release(arena, &self.components[id], &row);
            }
        }
        for id in &signature.shared {
            if let Some(instance) = self.storage(loc.archetype).shared_instance(*id, loc.row as usize) {
                if let Some(store) = self.shared.get_mut(id) {
                    store.remove_reference(instance);
                }
            }
        }

        for info in self.infos.iter_mut() {
            if info.parent == Some(entity) {
                info.parent = None;
            }
        }

        self.vacate_row(loc);
        let info = &mut self.infos[entity.index() as usize];
        info.location = None;
        info.parent = None;
        info.generation = info.generation.wrapping_add(1);
        self.free_indices.push(entity.index());
        self.live_entities -= 1;
        trace!(%entity, "deleted entity");
        Ok(())
    }

    /// Duplicate an entity `count` times, including its buffers and shared
    /// instance references.
    pub fn copy_entity(&mut self, entity: Entity, count: usize) -> Result<Vec<Entity>> {
        let loc = self.location_of(entity)?;
        let signature = self.storage(loc.archetype).signature().clone();
        let parent = self.infos[entity.index() as usize].parent;

        let unique: Vec<(ComponentId, Vec<u8>)> = signature
            .unique
            .iter()
            .filter_map(|id| {
                self.storage(loc.archetype)
                    .row_bytes(*id, loc.row as usize)
                    .map(|row| (*id, row.to_vec()))
            })
            .collect();
        let shared: Vec<(ComponentId, SharedInstance)> = signature
            .shared
            .iter()
            .filter_map(|id| {
                self.storage(loc.archetype)
                    .shared_instance(*id, loc.row as usize)
                    .map(|instance| (*id, instance))
            })
            .collect();

        let mut copies = Vec::with_capacity(count);
        for _ in 0..count {
            let copy = self.allocate_entity();
            let copy_loc = self.place_entity(copy, loc.archetype);
            self.infos[copy.index() as usize].parent = parent;

            for (id, bytes) in &unique {
                let mut row = bytes.clone();
                if let Some(arena) = self.arenas.get_mut(id) {
                    duplicate_buffers(arena, &self.components[id], &mut row);
                }
                if let Some(dst) = self
                    .storage_mut(loc.archetype)
                    .row_bytes_mut(*id, copy_loc.row as usize)
                {
                    dst.copy_from_slice(&row);
                }
            }
            for (id, instance) in &shared {
                self.storage_mut(loc.archetype)
                    .set_shared_instance(*id, copy_loc.row as usize, *instance);
            }
            copies.push(copy);
        }

        for (id, instance) in &shared {
            if let Some(store) = self.shared.get_mut(id) {
                store.add_references(*instance, count as u32);
            }
        }
        debug!(%entity, count, "copied entity");
        Ok(copies)
    }

    /// Move an entity to the archetype of `signature`, carrying over every
    /// component both archetypes have in common.
    fn relocate(&mut self, entity: Entity, signature: ArchetypeSignature) -> Result<EntityLoc> {
        let old = self.location_of(entity)?;
        let target = self.archetype_for(&signature);
        if target == old.archetype {
            return Ok(old);
        }

        let (unique, shared) = {
            let storage = self.storage(old.archetype);
            let unique: Vec<(ComponentId, Vec<u8>)> = storage
                .signature()
                .unique
                .iter()
                .filter(|id| signature.contains_unique(**id))
                .filter_map(|id| storage.row_bytes(*id, old.row as usize).map(|r| (*id, r.to_vec())))
                .collect();
            let shared: Vec<(ComponentId, SharedInstance)> = storage
                .signature()
                .shared
                .iter()
                .filter(|id| signature.contains_shared(**id))
                .filter_map(|id| storage.shared_instance(*id, old.row as usize).map(|i| (*id, i)))
                .collect();
            (unique, shared)
        };

        self.vacate_row(old);
        let new = self.place_entity(entity, target);
        let storage = self.storage_mut(target);
        for (id, bytes) in unique {
            if let Some(dst) = storage.row_bytes_mut(id, new.row as usize) {
                dst.copy_from_slice(&bytes);
            }
        }
        for (id, instance) in shared {
            storage.set_shared_instance(id, new.row as usize, instance);
        }
        Ok(new)
    }

    // ------------------------------------------------------------------
    // Unique components
    // ------------------------------------------------------------------

    pub fn has_component(&self, entity: Entity, id: ComponentId) -> bool {
        self.entity_location(entity)
            .map_or(false, |loc| self.storage(loc.archetype).signature().contains_unique(id))
    }

    pub fn add_component(&mut self, entity: Entity, id: ComponentId, data: &ComponentData) -> Result<()> {
        let info = self.info_of(id, ComponentKind::Unique)?.clone();
        let loc = self.location_of(entity)?;
        let signature = self.storage(loc.archetype).signature().clone();
        if signature.contains_unique(id) {
            return Err(EntityManagerError::ComponentAlreadyPresent { entity, component: id });
        }
        let arena = self.arenas.entry(id).or_default();
        let row = attach(arena, &info, data)?;
        let loc = self.relocate(entity, signature.with_unique(id))?;
        if let Some(dst) = self.storage_mut(loc.archetype).row_bytes_mut(id, loc.row as usize) {
            dst.copy_from_slice(&row);
        }
        Ok(())
    }

    pub fn remove_component(&mut self, entity: Entity, id: ComponentId) -> Result<()> {
        let loc = self.location_of(entity)?;
        let signature = self.storage(loc.archetype).signature().clone();
        if !signature.contains_unique(id) {
            return Err(EntityManagerError::ComponentMissing { entity, component: id });
        }
        let row = self
            .storage(loc.archetype)
            .row_bytes(id, loc.row as usize)
            .map(|r| r.to_vec());
        if let (Some(row), Some(arena), Some(info)) =
            (row, self.arenas.get_mut(&id), self.components.get(&id))
        {
            release(arena, info, &row);
        }
        self.relocate(entity, signature.without_unique(id))?;
        Ok(())
    }

    /// Raw bytes of a unique component. Buffer fields hold arena handles.
    pub fn component(&self, entity: Entity, id: ComponentId) -> Option<&[u8]> {
        let loc = self.entity_location(entity)?;
        self.storage(loc.archetype).row_bytes(id, loc.row as usize)
    }

    /// Mutable raw bytes of a unique component.
    ///
    /// Buffer handle bytes must not be rewritten through this view; use
    /// `set_component_value` to replace buffer contents.
    pub fn component_mut(&mut self, entity: Entity, id: ComponentId) -> Option<&mut [u8]> {
        let loc = self.entity_location(entity)?;
        self.archetypes[loc.archetype as usize]
            .as_mut()?
            .row_bytes_mut(id, loc.row as usize)
    }

    pub fn component_value(&self, entity: Entity, id: ComponentId) -> Option<ComponentData> {
        let row = self.component(entity, id)?;
        let info = self.components.get(&id)?;
        let arena = self.arenas.get(&id)?;
        Some(detach(arena, info, row))
    }

    /// Overwrite a unique component, releasing the previous buffers.
    pub fn set_component_value(&mut self, entity: Entity, id: ComponentId, data: &ComponentData) -> Result<()> {
        let info = self.info_of(id, ComponentKind::Unique)?.clone();
        let old = self
            .component(entity, id)
            .map(|r| r.to_vec())
            .ok_or(EntityManagerError::ComponentMissing { entity, component: id })?;
        let arena = self.arenas.entry(id).or_default();
        let row = attach(arena, &info, data)?;
        release(arena, &info, &old);
        if let Some(dst) = self.component_mut(entity, id) {
            dst.copy_from_slice(&row);
        }
        Ok(())
    }

    /// Contents of a buffer field of a unique component.
    pub fn component_buffer(&self, entity: Entity, id: ComponentId, offset: usize) -> Option<&[u8]> {
        let row = self.component(entity, id)?;
        self.arenas.get(&id)?.get(BufferHandle::read_at(row, offset))
    }

    /// Allocator holding the buffer fields of a unique component.
    pub fn component_allocator(&self, id: ComponentId) -> Option<&BufferArena> {
        self.allocator_of(id, ComponentKind::Unique)
    }

    fn allocator_of(&self, id: ComponentId, kind: ComponentKind) -> Option<&BufferArena> {
        (self.components.get(&id)?.kind == kind)
            .then(|| self.arenas.get(&id))
            .flatten()
    }

    // ------------------------------------------------------------------
    // Shared components
    // ------------------------------------------------------------------

    pub fn has_shared_component(&self, entity: Entity, id: ComponentId) -> bool {
        self.entity_location(entity)
            .map_or(false, |loc| self.storage(loc.archetype).signature().contains_shared(id))
    }

    pub fn entity_shared_instance(&self, entity: Entity, id: ComponentId) -> Option<SharedInstance> {
        let loc = self.entity_location(entity)?;
        self.storage(loc.archetype).shared_instance(id, loc.row as usize)
    }

    pub fn exists_shared_instance(&self, id: ComponentId, instance: SharedInstance) -> bool {
        self.shared.get(&id).map_or(false, |store| store.contains(instance))
    }

    pub fn shared_instances(&self, id: ComponentId) -> Vec<SharedInstance> {
        self.shared
            .get(&id)
            .map(|store| store.instances().collect())
            .unwrap_or_default()
    }

    pub fn shared_instance_count(&self, id: ComponentId) -> usize {
        self.shared.get(&id).map_or(0, SharedComponentStore::len)
    }

    /// Number of entities referencing an instance.
    pub fn shared_instance_references(&self, id: ComponentId, instance: SharedInstance) -> Option<u32> {
        self.shared.get(&id)?.references(instance)
    }

    pub fn register_shared_instance(&mut self, id: ComponentId, data: &ComponentData) -> Result<SharedInstance> {
        let info = self.info_of(id, ComponentKind::Shared)?.clone();
        let arena = self.arenas.entry(id).or_default();
        let row = attach(arena, &info, data)?;
        let instance = self.shared.entry(id).or_default().insert(row.into_boxed_slice());
        trace!(component = id, %instance, "registered shared instance");
        Ok(instance)
    }

    /// Remove an instance no entity references anymore.
    pub fn unregister_shared_instance(&mut self, id: ComponentId, instance: SharedInstance) -> Result<()> {
        let info = self.info_of(id, ComponentKind::Shared)?.clone();
        let store = self
            .shared
            .get_mut(&id)
            .ok_or(EntityManagerError::SharedInstanceNotFound { component: id, instance })?;
        let references = store
            .references(instance)
            .ok_or(EntityManagerError::SharedInstanceNotFound { component: id, instance })?;
        if references > 0 {
            return Err(EntityManagerError::SharedInstanceReferenced {
                component: id,
                instance,
                references,
            });
        }
        if let Some(row) = store.remove(instance) {
            if let Some(arena) = self.arenas.get_mut(&id) {
                release(arena, &info, &row);
            }
        }
        trace!(component = id, %instance, "unregistered shared instance");
        Ok(())
    }

    /// Unregister the instance if nothing references it. Returns whether it
    /// was removed.
    pub fn unregister_unreferenced_shared_instance(&mut self, id: ComponentId, instance: SharedInstance) -> bool {
        match self.shared_instance_references(id, instance) {
            Some(0) => self.unregister_shared_instance(id, instance).is_ok(),
            _ => false,
        }
    }

    /// Find an instance whose value equals `data` (fields and buffer contents).
    pub fn find_shared_instance(&self, id: ComponentId, data: &ComponentData) -> Option<SharedInstance> {
        let info = self.components.get(&id)?;
        if info.kind != ComponentKind::Shared || data.bytes.len() != info.size {
            return None;
        }
        let wanted = normalize(info, data);
        let store = self.shared.get(&id)?;
        let arena = self.arenas.get(&id)?;
        store.instances().find(|&instance| {
            store
                .get(instance)
                .map_or(false, |row| detach(arena, info, row) == wanted)
        })
    }

    pub fn shared_data(&self, id: ComponentId, instance: SharedInstance) -> Option<&[u8]> {
        self.shared.get(&id)?.get(instance)
    }

    pub fn shared_value(&self, id: ComponentId, instance: SharedInstance) -> Option<ComponentData> {
        let row = self.shared_data(id, instance)?;
        let info = self.components.get(&id)?;
        let arena = self.arenas.get(&id)?;
        Some(detach(arena, info, row))
    }

    /// Rewrite an instance in place. Every entity referencing it observes
    /// the new value.
    pub fn set_shared_value(&mut self, id: ComponentId, instance: SharedInstance, data: &ComponentData) -> Result<()> {
        let info = self.info_of(id, ComponentKind::Shared)?.clone();
        let old = self
            .shared_data(id, instance)
            .map(|r| r.to_vec())
            .ok_or(EntityManagerError::SharedInstanceNotFound { component: id, instance })?;
        let arena = self.arenas.entry(id).or_default();
        let row = attach(arena, &info, data)?;
        release(arena, &info, &old);
        if let Some(dst) = self.shared.get_mut(&id).and_then(|s| s.get_mut(instance)) {
            dst.copy_from_slice(&row);
        }
        Ok(())
    }

    pub fn shared_component_allocator(&self, id: ComponentId) -> Option<&BufferArena> {
        self.allocator_of(id, ComponentKind::Shared)
    }

    pub fn add_shared_component(&mut self, entity: Entity, id: ComponentId, instance: SharedInstance) -> Result<()> {
        self.info_of(id, ComponentKind::Shared)?;
        let loc = self.location_of(entity)?;
        if !self.exists_shared_instance(id, instance) {
            return Err(EntityManagerError::SharedInstanceNotFound { component: id, instance });
        }
        let signature = self.storage(loc.archetype).signature().clone();
        if signature.contains_shared(id) {
            return Err(EntityManagerError::ComponentAlreadyPresent { entity, component: id });
        }
        let loc = self.relocate(entity, signature.with_shared(id))?;
        self.storage_mut(loc.archetype)
            .set_shared_instance(id, loc.row as usize, instance);
        if let Some(store) = self.shared.get_mut(&id) {
            store.add_references(instance, 1);
        }
        Ok(())
    }

    /// Detach a shared component, returning the instance it referenced.
    pub fn remove_shared_component(&mut self, entity: Entity, id: ComponentId) -> Result<SharedInstance> {
        let loc = self.location_of(entity)?;
        let signature = self.storage(loc.archetype).signature().clone();
        let instance = self
            .storage(loc.archetype)
            .shared_instance(id, loc.row as usize)
            .filter(|_| signature.contains_shared(id))
            .ok_or(EntityManagerError::ComponentMissing { entity, component: id })?;
        if let Some(store) = self.shared.get_mut(&id) {
            store.remove_reference(instance);
        }
        self.relocate(entity, signature.without_shared(id))?;
        Ok(instance)
    }

    /// Point an entity at another instance, returning the previous one.
    pub fn change_entity_shared_instance(
        &mut self,
        entity: Entity,
        id: ComponentId,
        instance: SharedInstance,
    ) -> Result<SharedInstance> {
        let loc = self.location_of(entity)?;
        if !self.exists_shared_instance(id, instance) {
            return Err(EntityManagerError::SharedInstanceNotFound { component: id, instance });
        }
        let previous = self
            .storage(loc.archetype)
            .shared_instance(id, loc.row as usize)
            .ok_or(EntityManagerError::ComponentMissing { entity, component: id })?;
        if previous == instance {
            return Ok(previous);
        }
        self.storage_mut(loc.archetype)
            .set_shared_instance(id, loc.row as usize, instance);
        if let Some(store) = self.shared.get_mut(&id) {
            store.remove_reference(previous);
            store.add_references(instance, 1);
        }
        Ok(previous)
    }

    /// Entities currently pointing at an instance.
    pub fn entities_with_shared_instance(&self, id: ComponentId, instance: SharedInstance) -> Vec<Entity> {
        let mut entities = Vec::new();
        for storage in self.archetypes.iter().flatten() {
            if !storage.signature().contains_shared(id) {
                continue;
            }
            for (row, entity) in storage.entities().iter().enumerate() {
                if storage.shared_instance(id, row) == Some(instance) {
                    entities.push(*entity);
                }
            }
        }
        entities
    }

    /// If another instance holds the same value, move every entity of
    /// `instance` onto it and remove `instance`. Returns the surviving
    /// instance when a merge happened.
    pub fn try_merge_shared_instance(&mut self, id: ComponentId, instance: SharedInstance) -> Result<Option<SharedInstance>> {
        let info = self.info_of(id, ComponentKind::Shared)?.clone();
        let value = self
            .shared_value(id, instance)
            .ok_or(EntityManagerError::SharedInstanceNotFound { component: id, instance })?;
        let survivor = {
            let store = &self.shared[&id];
            let arena = &self.arenas[&id];
            store.instances().find(|&other| {
                other != instance
                    && store
                        .get(other)
                        .map_or(false, |row| detach(arena, &info, row) == value)
            })
        };
        let Some(survivor) = survivor else {
            return Ok(None);
        };
        for entity in self.entities_with_shared_instance(id, instance) {
            self.change_entity_shared_instance(entity, id, survivor)?;
        }
        self.unregister_shared_instance(id, instance)?;
        debug!(component = id, %instance, %survivor, "merged shared instance");
        Ok(Some(survivor))
    }

    // ------------------------------------------------------------------
    // Global components
    // ------------------------------------------------------------------

    pub fn exists_global_component(&self, id: ComponentId) -> bool {
        self.globals.contains_key(&id)
    }

    pub fn global_components(&self) -> Vec<ComponentId> {
        let mut ids: Vec<ComponentId> = self.globals.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn register_global_component(&mut self, id: ComponentId, data: &ComponentData) -> Result<()> {
        let info = self.info_of(id, ComponentKind::Global)?.clone();
        if self.globals.contains_key(&id) {
            return Err(EntityManagerError::GlobalAlreadyPresent { component: id });
        }
        let arena = self.arenas.entry(id).or_default();
        let row = attach(arena, &info, data)?;
        self.globals.insert(id, row.into_boxed_slice());
        Ok(())
    }

    pub fn remove_global_component(&mut self, id: ComponentId) -> Result<()> {
        let row = self
            .globals
            .remove(&id)
            .ok_or(EntityManagerError::GlobalMissing { component: id })?;
        if let (Some(arena), Some(info)) = (self.arenas.get_mut(&id), self.components.get(&id)) {
            release(arena, info, &row);
        }
        Ok(())
    }

    pub fn global_component(&self, id: ComponentId) -> Option<&[u8]> {
        self.globals.get(&id).map(|row| &row[..])
    }

    pub fn global_component_mut(&mut self, id: ComponentId) -> Option<&mut [u8]> {
        self.globals.get_mut(&id).map(|row| &mut row[..])
    }

    pub fn global_value(&self, id: ComponentId) -> Option<ComponentData> {
        let row = self.globals.get(&id)?;
        Some(detach(self.arenas.get(&id)?, self.components.get(&id)?, row))
    }

    pub fn set_global_value(&mut self, id: ComponentId, data: &ComponentData) -> Result<()> {
        let info = self.info_of(id, ComponentKind::Global)?.clone();
        let old = self
            .globals
            .get(&id)
            .map(|r| r.to_vec())
            .ok_or(EntityManagerError::GlobalMissing { component: id })?;
        let arena = self.arenas.entry(id).or_default();
        let row = attach(arena, &info, data)?;
        release(arena, &info, &old);
        self.globals.insert(id, row.into_boxed_slice());
        Ok(())
    }

    pub fn global_component_allocator(&self, id: ComponentId) -> Option<&BufferArena> {
        self.allocator_of(id, ComponentKind::Global)
    }

    // ------------------------------------------------------------------
    // Signatures, hierarchy, archetypes
    // ------------------------------------------------------------------

    /// Unique components of an entity, sorted by id.
    pub fn entity_signature(&self, entity: Entity) -> Option<Vec<ComponentId>> {
        let loc = self.entity_location(entity)?;
        Some(self.storage(loc.archetype).signature().unique.clone())
    }

    /// Shared components of an entity with the instance each references.
    pub fn entity_shared_signature(&self, entity: Entity) -> Option<Vec<(ComponentId, SharedInstance)>> {
        let loc = self.entity_location(entity)?;
        let storage = self.storage(loc.archetype);
        Some(
            storage
                .signature()
                .shared
                .iter()
                .filter_map(|id| storage.shared_instance(*id, loc.row as usize).map(|i| (*id, i)))
                .collect(),
        )
    }

    /// Parent `child` under `parent`, or detach it with `None`.
    pub fn set_parent(&mut self, child: Entity, parent: Option<Entity>) -> Result<()> {
        self.location_of(child)?;
        if let Some(parent) = parent {
            self.location_of(parent)?;
            let mut cursor = Some(parent);
            while let Some(current) = cursor {
                if current == child {
                    return Err(EntityManagerError::HierarchyCycle { child, parent });
                }
                cursor = self.parent(current);
            }
        }
        self.infos[child.index() as usize].parent = parent;
        Ok(())
    }

    pub fn parent(&self, entity: Entity) -> Option<Entity> {
        self.entity_location(entity)?;
        self.infos[entity.index() as usize].parent
    }

    pub fn children(&self, entity: Entity) -> Vec<Entity> {
        self.entities()
            .into_iter()
            .filter(|e| self.infos[e.index() as usize].parent == Some(entity))
            .collect()
    }

    pub fn archetype(&self, id: ArchetypeId) -> Option<&ArchetypeStorage> {
        self.archetypes.get(id as usize)?.as_ref()
    }

    /// Number of archetypes currently allocated.
    pub fn archetype_count(&self) -> usize {
        self.archetypes.iter().flatten().count()
    }

    /// Free an archetype's storage once no entity lives in it.
    pub fn destroy_archetype_if_empty(&mut self, id: ArchetypeId) -> bool {
        let Some(slot) = self.archetypes.get_mut(id as usize) else {
            return false;
        };
        if !slot.as_ref().map_or(false, |s| s.is_empty()) {
            return false;
        }
        if let Some(storage) = slot.take() {
            self.archetype_lookup.remove(storage.signature());
            trace!(archetype = id, "destroyed empty archetype");
        }
        true
    }

    /// Deep copy of the whole manager. Every allocator of the copy starts a
    /// new epoch, so holders of cached bindings notice the switch.
    pub fn duplicate(&self) -> EntityManager {
        EntityManager {
            infos: self.infos.clone(),
            free_indices: self.free_indices.clone(),
            live_entities: self.live_entities,
            components: self.components.clone(),
            unique_sizes: self.unique_sizes.clone(),
            archetypes: self.archetypes.clone(),
            archetype_lookup: self.archetype_lookup.clone(),
            shared: self.shared.clone(),
            globals: self.globals.clone(),
            arenas: self
                .arenas
                .iter()
                .map(|(id, arena)| (*id, arena.snapshot()))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const POSITION: ComponentId = 1;
    const NAME: ComponentId = 2;
    const MATERIAL: ComponentId = 3;
    const SETTINGS: ComponentId = 4;

    fn manager() -> EntityManager {
        let mut manager = EntityManager::new();
        manager
            .register_component(ComponentInfo {
                id: POSITION,
                name: "Position".into(),
                kind: ComponentKind::Unique,
                size: 8,
                buffer_offsets: vec![],
            })
            .unwrap();
        manager
            .register_component(ComponentInfo {
                id: NAME,
                name: "Name".into(),
                kind: ComponentKind::Unique,
                size: 8,
                buffer_offsets: vec![0],
            })
            .unwrap();
        manager
            .register_component(ComponentInfo {
                id: MATERIAL,
                name: "Material".into(),
                kind: ComponentKind::Shared,
                size: 4,
                buffer_offsets: vec![],
            })
            .unwrap();
        manager
            .register_component(ComponentInfo {
                id: SETTINGS,
                name: "Settings".into(),
                kind: ComponentKind::Global,
                size: 4,
                buffer_offsets: vec![],
            })
            .unwrap();
        manager
    }

    fn named(text: &str) -> ComponentData {
        let mut data = ComponentData::zeroed(8);
        data.set_buffer(0, text.as_bytes().to_vec());
        data
    }

    #[test]
    fn add_component_moves_archetype() {
        let mut manager = manager();
        let entity = manager.create_entity();
        let before = manager.entity_location(entity).unwrap();

        manager
            .add_component(entity, POSITION, &ComponentData::from_pod(&[1u32, 2u32]))
            .unwrap();
        let after = manager.entity_location(entity).unwrap();
        assert_ne!(before.archetype, after.archetype);
        assert_eq!(
            manager.component_value(entity, POSITION).unwrap().read_pod::<[u32; 2]>(),
            Some([1, 2])
        );
        assert!(matches!(
            manager.add_component(entity, POSITION, &ComponentData::zeroed(8)),
            Err(EntityManagerError::ComponentAlreadyPresent { .. })
        ));
    }

    #[test]
    fn swap_remove_keeps_other_locations_valid() {
        let mut manager = manager();
        let a = manager.create_entity_with(&[(POSITION, ComponentData::from_pod(&[1u32, 1u32]))], &[]).unwrap();
        let b = manager.create_entity_with(&[(POSITION, ComponentData::from_pod(&[2u32, 2u32]))], &[]).unwrap();
        manager.delete_entity(a).unwrap();
        assert!(!manager.exists_entity(a));
        assert_eq!(
            manager.component_value(b, POSITION).unwrap().read_pod::<[u32; 2]>(),
            Some([2, 2])
        );
        assert_eq!(manager.entity_location(b).unwrap().row, 0);
    }

    #[test]
    fn stale_handle_after_delete() {
        let mut manager = manager();
        let entity = manager.create_entity();
        manager.delete_entity(entity).unwrap();
        let reused = manager.create_entity();
        assert_eq!(reused.index(), entity.index());
        assert!(!manager.exists_entity(entity));
        assert!(manager.exists_entity(reused));
        assert_eq!(
            manager.delete_entity(entity),
            Err(EntityManagerError::EntityNotFound { entity })
        );
    }

    #[test]
    fn buffers_are_released_on_remove_and_delete() {
        let mut manager = manager();
        let entity = manager.create_entity_with(&[(NAME, named("crate"))], &[]).unwrap();
        assert_eq!(manager.component_buffer(entity, NAME, 0), Some(&b"crate"[..]));
        assert_eq!(manager.component_allocator(NAME).unwrap().len(), 1);

        manager.set_component_value(entity, NAME, &named("barrel")).unwrap();
        assert_eq!(manager.component_allocator(NAME).unwrap().len(), 1);

        manager.remove_component(entity, NAME).unwrap();
        assert!(manager.component_allocator(NAME).unwrap().is_empty());

        let other = manager.create_entity_with(&[(NAME, named("door"))], &[]).unwrap();
        manager.delete_entity(other).unwrap();
        assert!(manager.component_allocator(NAME).unwrap().is_empty());
    }

    #[test]
    fn copy_entity_duplicates_buffers_and_shared_references() {
        let mut manager = manager();
        let instance = manager
            .register_shared_instance(MATERIAL, &ComponentData::from_pod(&7u32))
            .unwrap();
        let entity = manager
            .create_entity_with(&[(NAME, named("tree"))], &[(MATERIAL, instance)])
            .unwrap();

        let copies = manager.copy_entity(entity, 3).unwrap();
        assert_eq!(copies.len(), 3);
        assert_eq!(manager.shared_instance_references(MATERIAL, instance), Some(4));
        assert_eq!(manager.component_allocator(NAME).unwrap().len(), 4);
        for copy in &copies {
            assert_eq!(manager.component_buffer(*copy, NAME, 0), Some(&b"tree"[..]));
        }

        // Copies own their buffers independently.
        manager.set_component_value(copies[0], NAME, &named("bush")).unwrap();
        assert_eq!(manager.component_buffer(entity, NAME, 0), Some(&b"tree"[..]));
    }

    #[test]
    fn shared_instances_find_and_cleanup() {
        let mut manager = manager();
        let value = ComponentData::from_pod(&5u32);
        let instance = manager.register_shared_instance(MATERIAL, &value).unwrap();
        assert_eq!(manager.find_shared_instance(MATERIAL, &value), Some(instance));

        let entity = manager.create_entity();
        manager.add_shared_component(entity, MATERIAL, instance).unwrap();
        assert!(!manager.unregister_unreferenced_shared_instance(MATERIAL, instance));

        let removed = manager.remove_shared_component(entity, MATERIAL).unwrap();
        assert_eq!(removed, instance);
        assert!(manager.unregister_unreferenced_shared_instance(MATERIAL, instance));
        assert!(!manager.exists_shared_instance(MATERIAL, instance));
        assert_eq!(manager.shared_instance_count(MATERIAL), 0);
    }

    #[test]
    fn merge_moves_entities_onto_identical_instance() {
        let mut manager = manager();
        let original = manager.register_shared_instance(MATERIAL, &ComponentData::from_pod(&1u32)).unwrap();
        let copy = manager.register_shared_instance(MATERIAL, &ComponentData::from_pod(&1u32)).unwrap();
        let a = manager.create_entity_with(&[], &[(MATERIAL, original)]).unwrap();
        let b = manager.create_entity_with(&[], &[(MATERIAL, copy)]).unwrap();

        let survivor = manager.try_merge_shared_instance(MATERIAL, copy).unwrap();
        assert_eq!(survivor, Some(original));
        assert!(!manager.exists_shared_instance(MATERIAL, copy));
        assert_eq!(manager.entity_shared_instance(b, MATERIAL), Some(original));
        assert_eq!(manager.shared_instance_references(MATERIAL, original), Some(2));
        assert_eq!(manager.entities_with_shared_instance(MATERIAL, original), vec![a, b]);
        assert_eq!(manager.shared_instance_count(MATERIAL), 1);
    }

    #[test]
    fn referenced_instance_cannot_be_unregistered() {
        let mut manager = manager();
        let instance = manager.register_shared_instance(MATERIAL, &ComponentData::from_pod(&1u32)).unwrap();
        manager.create_entity_with(&[], &[(MATERIAL, instance)]).unwrap();
        assert!(matches!(
            manager.unregister_shared_instance(MATERIAL, instance),
            Err(EntityManagerError::SharedInstanceReferenced { references: 1, .. })
        ));
    }

    #[test]
    fn hierarchy_rejects_cycles_and_unparents_on_delete() {
        let mut manager = manager();
        let root = manager.create_entity();
        let child = manager.create_entity();
        manager.set_parent(child, Some(root)).unwrap();
        assert_eq!(manager.children(root), vec![child]);
        assert!(matches!(
            manager.set_parent(root, Some(child)),
            Err(EntityManagerError::HierarchyCycle { .. })
        ));
        manager.delete_entity(root).unwrap();
        assert_eq!(manager.parent(child), None);
    }

    #[test]
    fn empty_archetype_can_be_destroyed() {
        let mut manager = manager();
        let entity = manager.create_entity();
        let empty = manager.entity_location(entity).unwrap().archetype;
        manager.add_component(entity, POSITION, &ComponentData::zeroed(8)).unwrap();
        assert!(manager.destroy_archetype_if_empty(empty));
        assert!(manager.archetype(empty).is_none());

        // The empty signature is recreated on demand.
        let other = manager.create_entity();
        assert!(manager.exists_entity(other));
    }

    #[test]
    fn globals_round_trip() {
        let mut manager = manager();
        manager.register_global_component(SETTINGS, &ComponentData::from_pod(&9u32)).unwrap();
        assert_eq!(manager.global_value(SETTINGS).unwrap().read_pod::<u32>(), Some(9));
        assert!(manager.register_global_component(SETTINGS, &ComponentData::from_pod(&1u32)).is_err());
        manager.remove_global_component(SETTINGS).unwrap();
        assert!(!manager.exists_global_component(SETTINGS));
    }

    #[test]
    fn duplicate_starts_new_allocator_epochs() {
        let mut manager = manager();
        let entity = manager.create_entity_with(&[(NAME, named("lamp"))], &[]).unwrap();
        let copy = manager.duplicate();
        assert_ne!(
            manager.component_allocator(NAME).unwrap().epoch(),
            copy.component_allocator(NAME).unwrap().epoch()
        );
        assert_eq!(copy.component_buffer(entity, NAME, 0), Some(&b"lamp"[..]));
    }
}
