// shared.rs - De-duplicated shared component values
//
// A shared component value lives in one slot and is referenced by every
// entity that points at it. Slots are generation tagged so an instance
// handle kept after its slot was reclaimed never resolves again.

use crate::ecs::SharedInstance;

#[derive(Debug, Clone, Default)]
struct SharedSlot {
    generation: u32,
    data: Option<Box<[u8]>>,
    references: u32,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct SharedComponentStore {
    slots: Vec<SharedSlot>,
    free: Vec<u32>,
}

impl SharedComponentStore {
    pub fn insert(&mut self, bytes: Box<[u8]>) -> SharedInstance {
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.data = Some(bytes);
            slot.references = 0;
            return SharedInstance::new(index, slot.generation);
        }
        let index = self.slots.len() as u32;
        self.slots.push(SharedSlot {
            generation: 1,
            data: Some(bytes),
            references: 0,
        });
        SharedInstance::new(index, 1)
    }

    fn slot(&self, instance: SharedInstance) -> Option<&SharedSlot> {
        self.slots
            .get(instance.index() as usize)
            .filter(|s| s.generation == instance.generation() && s.data.is_some())
    }

    fn slot_mut(&mut self, instance: SharedInstance) -> Option<&mut SharedSlot> {
        self.slots
            .get_mut(instance.index() as usize)
            .filter(|s| s.generation == instance.generation() && s.data.is_some())
    }

    pub fn contains(&self, instance: SharedInstance) -> bool {
        self.slot(instance).is_some()
    }

    pub fn get(&self, instance: SharedInstance) -> Option<&[u8]> {
        self.slot(instance).and_then(|s| s.data.as_deref())
    }

    pub fn get_mut(&mut self, instance: SharedInstance) -> Option<&mut [u8]> {
        self.slot_mut(instance).and_then(|s| s.data.as_deref_mut())
    }

    pub fn references(&self, instance: SharedInstance) -> Option<u32> {
        self.slot(instance).map(|s| s.references)
    }

    pub fn add_references(&mut self, instance: SharedInstance, count: u32) {
        if let Some(slot) = self.slot_mut(instance) {
            slot.references += count;
        }
    }

    pub fn remove_reference(&mut self, instance: SharedInstance) {
        if let Some(slot) = self.slot_mut(instance) {
            debug_assert!(slot.references > 0, "shared instance reference underflow");
            slot.references = slot.references.saturating_sub(1);
        }
    }

    /// Remove the slot and hand back its bytes so buffers can be released.
    pub fn remove(&mut self, instance: SharedInstance) -> Option<Box<[u8]>> {
        let slot = self.slot_mut(instance)?;
        let data = slot.data.take();
        slot.generation = slot.generation.wrapping_add(1).max(1);
        slot.references = 0;
        self.free.push(instance.index());
        data
    }

    pub fn instances(&self) -> impl Iterator<Item = SharedInstance> + '_ {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.data
                .as_ref()
                .map(|_| SharedInstance::new(index as u32, slot.generation))
        })
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.data.is_some()).count()
    }
}
