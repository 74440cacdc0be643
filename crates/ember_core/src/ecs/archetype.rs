// archetype.rs - Archetype identification and row storage
//
// An archetype is a unique combination of unique and shared component
// types. Entities with the same combination share the same storage, one
// byte column per unique component and one instance column per shared
// component.

use crate::ecs::{ComponentId, Entity, SharedInstance};
use std::collections::HashMap;

/// Sorted unique and shared component sets.
///
/// The lists are always sorted and deduplicated so equal sets produce
/// equal signatures regardless of insertion order.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct ArchetypeSignature {
    pub unique: Vec<ComponentId>,
    pub shared: Vec<ComponentId>,
}

impl ArchetypeSignature {
    pub fn new(mut unique: Vec<ComponentId>, mut shared: Vec<ComponentId>) -> Self {
        unique.sort_unstable();
        unique.dedup();
        shared.sort_unstable();
        shared.dedup();
        Self { unique, shared }
    }

    pub fn contains_unique(&self, id: ComponentId) -> bool {
        self.unique.binary_search(&id).is_ok()
    }

    pub fn contains_shared(&self, id: ComponentId) -> bool {
        self.shared.binary_search(&id).is_ok()
    }

    pub(crate) fn with_unique(&self, id: ComponentId) -> Self {
        let mut unique = self.unique.clone();
        unique.push(id);
        Self::new(unique, self.shared.clone())
    }

    pub(crate) fn without_unique(&self, id: ComponentId) -> Self {
        let unique = self.unique.iter().copied().filter(|&c| c != id).collect();
        Self::new(unique, self.shared.clone())
    }

    pub(crate) fn with_shared(&self, id: ComponentId) -> Self {
        let mut shared = self.shared.clone();
        shared.push(id);
        Self::new(self.unique.clone(), shared)
    }

    pub(crate) fn without_shared(&self, id: ComponentId) -> Self {
        let shared = self.shared.iter().copied().filter(|&c| c != id).collect();
        Self::new(self.unique.clone(), shared)
    }
}

/// Tightly packed bytes of one unique component for every row.
#[derive(Debug, Clone)]
pub(crate) struct Column {
    elem_size: usize,
    bytes: Vec<u8>,
}

impl Column {
    fn new(elem_size: usize) -> Self {
        Self {
            elem_size,
            bytes: Vec::new(),
        }
    }

    fn push_zeroed(&mut self) {
        self.bytes.resize(self.bytes.len() + self.elem_size, 0);
    }

    fn row(&self, row: usize) -> &[u8] {
        let start = row * self.elem_size;
        &self.bytes[start..start + self.elem_size]
    }

    fn row_mut(&mut self, row: usize) -> &mut [u8] {
        let start = row * self.elem_size;
        &mut self.bytes[start..start + self.elem_size]
    }

    fn swap_remove(&mut self, row: usize, last: usize) {
        if row != last {
            let size = self.elem_size;
            let (head, tail) = self.bytes.split_at_mut(last * size);
            head[row * size..row * size + size].copy_from_slice(&tail[..size]);
        }
        self.bytes.truncate(last * self.elem_size);
    }
}

/// Storage for all entities of a single archetype.
#[derive(Debug, Clone)]
pub struct ArchetypeStorage {
    signature: ArchetypeSignature,
    columns: HashMap<ComponentId, Column>,
    shared: HashMap<ComponentId, Vec<SharedInstance>>,
    entities: Vec<Entity>,
}

impl ArchetypeStorage {
    /// `sizes` must contain the byte size of every unique component.
    pub(crate) fn new(signature: ArchetypeSignature, sizes: &HashMap<ComponentId, usize>) -> Self {
        let columns = signature
            .unique
            .iter()
            .map(|&cid| (cid, Column::new(sizes.get(&cid).copied().unwrap_or(0))))
            .collect();
        let shared = signature.shared.iter().map(|&cid| (cid, Vec::new())).collect();
        Self {
            signature,
            columns,
            shared,
            entities: Vec::new(),
        }
    }

    pub fn signature(&self) -> &ArchetypeSignature {
        &self.signature
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn entities(&self) -> &[Entity] {
        &self.entities
    }

    /// Allocate a zero-filled row for `entity`.
    pub(crate) fn push_row(&mut self, entity: Entity) -> usize {
        for column in self.columns.values_mut() {
            column.push_zeroed();
        }
        for instances in self.shared.values_mut() {
            instances.push(SharedInstance::new(0, 0));
        }
        self.entities.push(entity);
        self.entities.len() - 1
    }

    /// Get raw bytes for a component at a specific row.
    pub fn row_bytes(&self, cid: ComponentId, row: usize) -> Option<&[u8]> {
        if row >= self.entities.len() {
            return None;
        }
        self.columns.get(&cid).map(|c| c.row(row))
    }

    pub fn row_bytes_mut(&mut self, cid: ComponentId, row: usize) -> Option<&mut [u8]> {
        if row >= self.entities.len() {
            return None;
        }
        self.columns.get_mut(&cid).map(|c| c.row_mut(row))
    }

    pub fn shared_instance(&self, cid: ComponentId, row: usize) -> Option<SharedInstance> {
        self.shared.get(&cid).and_then(|v| v.get(row)).copied()
    }

    pub(crate) fn set_shared_instance(&mut self, cid: ComponentId, row: usize, instance: SharedInstance) {
        if let Some(slot) = self.shared.get_mut(&cid).and_then(|v| v.get_mut(row)) {
            *slot = instance;
        }
    }

    /// Remove a row by moving the last row into its place.
    ///
    /// Returns the entity that now occupies `row`, if one was moved.
    pub(crate) fn swap_remove_row(&mut self, row: usize) -> Option<Entity> {
        let last = self.entities.len() - 1;
        for column in self.columns.values_mut() {
            column.swap_remove(row, last);
        }
        for instances in self.shared.values_mut() {
            instances.swap_remove(row);
        }
        self.entities.swap_remove(row);
        (row != last).then(|| self.entities[row])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_is_order_independent() {
        let a = ArchetypeSignature::new(vec![3, 1, 2, 1], vec![9, 8]);
        let b = ArchetypeSignature::new(vec![1, 2, 3], vec![8, 9]);
        assert_eq!(a, b);
        assert!(a.contains_unique(2));
        assert!(a.contains_shared(9));
        assert!(!a.contains_unique(9));
    }

    #[test]
    fn swap_remove_moves_last_row() {
        let sizes = HashMap::from([(1, 4usize)]);
        let mut storage = ArchetypeStorage::new(ArchetypeSignature::new(vec![1], vec![]), &sizes);
        let e0 = Entity::new(0, 1);
        let e1 = Entity::new(1, 1);
        let r0 = storage.push_row(e0);
        let r1 = storage.push_row(e1);
        storage.row_bytes_mut(1, r0).unwrap().copy_from_slice(&[1, 1, 1, 1]);
        storage.row_bytes_mut(1, r1).unwrap().copy_from_slice(&[2, 2, 2, 2]);

        let moved = storage.swap_remove_row(r0);
        assert_eq!(moved, Some(e1));
        assert_eq!(storage.len(), 1);
        assert_eq!(storage.row_bytes(1, 0), Some(&[2, 2, 2, 2][..]));
        assert_eq!(storage.row_bytes(1, 1), None);
    }
}
