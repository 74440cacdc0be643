// arena.rs - Out-of-line storage for variable-length component fields
//
// Buffer fields (names, paths, blobs) cannot live in the fixed-size
// component rows. They are stored here and referenced through
// generation-tagged handles, so a stale handle is detected instead of
// reading someone else's data after the slot was reused.

use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_EPOCH: AtomicU64 = AtomicU64::new(1);

fn next_epoch() -> u64 {
    NEXT_EPOCH.fetch_add(1, Ordering::Relaxed)
}

/// Handle to a buffer inside a `BufferArena`.
///
/// Generation 0 is the null handle, which is also what a zero-filled
/// component row contains.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
pub struct BufferHandle {
    index: u32,
    generation: u32,
}

impl BufferHandle {
    pub const NULL: BufferHandle = BufferHandle {
        index: 0,
        generation: 0,
    };

    /// Encoded size inside a component row.
    pub const SIZE: usize = 8;

    #[inline]
    pub fn is_null(self) -> bool {
        self.generation == 0
    }

    pub fn to_bytes(self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[..4].copy_from_slice(&self.index.to_le_bytes());
        out[4..].copy_from_slice(&self.generation.to_le_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut index = [0u8; 4];
        let mut generation = [0u8; 4];
        index.copy_from_slice(&bytes[..4]);
        generation.copy_from_slice(&bytes[4..Self::SIZE]);
        Self {
            index: u32::from_le_bytes(index),
            generation: u32::from_le_bytes(generation),
        }
    }

    /// Read the handle stored at `offset` inside a component row.
    pub fn read_at(row: &[u8], offset: usize) -> Self {
        Self::from_bytes(&row[offset..offset + Self::SIZE])
    }

    /// Store the handle at `offset` inside a component row.
    pub fn write_at(self, row: &mut [u8], offset: usize) {
        row[offset..offset + Self::SIZE].copy_from_slice(&self.to_bytes());
    }
}

#[derive(Debug, Clone, Default)]
struct Slot {
    generation: u32,
    data: Option<Vec<u8>>,
}

/// Per-component allocator for buffer fields.
///
/// Every arena carries an `epoch`. It changes whenever the arena is
/// recreated or cleared, which tells holders of cached handles that all of
/// them became invalid at once.
#[derive(Debug)]
pub struct BufferArena {
    slots: Vec<Slot>,
    free: Vec<u32>,
    live: usize,
    epoch: u64,
}

impl BufferArena {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            live: 0,
            epoch: next_epoch(),
        }
    }

    #[inline]
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Number of live buffers.
    #[inline]
    pub fn len(&self) -> usize {
        self.live
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    pub fn allocate(&mut self, contents: Vec<u8>) -> BufferHandle {
        self.live += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.data = Some(contents);
            return BufferHandle {
                index,
                generation: slot.generation,
            };
        }
        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 1,
            data: Some(contents),
        });
        BufferHandle {
            index,
            generation: 1,
        }
    }

    pub fn get(&self, handle: BufferHandle) -> Option<&[u8]> {
        if handle.is_null() {
            return None;
        }
        let slot = self.slots.get(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.data.as_deref()
    }

    pub fn get_mut(&mut self, handle: BufferHandle) -> Option<&mut Vec<u8>> {
        if handle.is_null() {
            return None;
        }
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.data.as_mut()
    }

    pub fn contains(&self, handle: BufferHandle) -> bool {
        self.get(handle).is_some()
    }

    /// Free a buffer. Returns false for null or stale handles.
    pub fn deallocate(&mut self, handle: BufferHandle) -> bool {
        if !self.contains(handle) {
            return false;
        }
        let slot = &mut self.slots[handle.index as usize];
        slot.data = None;
        // Generation 0 is reserved for the null handle.
        slot.generation = slot.generation.wrapping_add(1).max(1);
        self.free.push(handle.index);
        self.live -= 1;
        true
    }

    /// Allocate a copy of an existing buffer. Null or stale handles copy to null.
    pub fn duplicate(&mut self, handle: BufferHandle) -> BufferHandle {
        match self.get(handle) {
            Some(contents) => {
                let contents = contents.to_vec();
                self.allocate(contents)
            }
            None => BufferHandle::NULL,
        }
    }

    /// Copy every buffer into a new arena with its own epoch.
    ///
    /// Handles stay valid in the copy, which is how a runtime world starts
    /// from the scene it was created from.
    pub fn snapshot(&self) -> Self {
        Self {
            slots: self.slots.clone(),
            free: self.free.clone(),
            live: self.live,
            epoch: next_epoch(),
        }
    }

    /// Drop every buffer and start a new epoch.
    pub fn clear(&mut self) {
        self.slots.clear();
        self.free.clear();
        self.live = 0;
        self.epoch = next_epoch();
    }
}

impl Default for BufferArena {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_handle_is_rejected_after_reuse() {
        let mut arena = BufferArena::new();
        let first = arena.allocate(b"a".to_vec());
        assert!(arena.deallocate(first));
        let second = arena.allocate(b"b".to_vec());
        assert_eq!(second.index, first.index);
        assert_eq!(arena.get(first), None);
        assert_eq!(arena.get(second), Some(&b"b"[..]));
        assert!(!arena.deallocate(first));
    }

    #[test]
    fn clear_changes_epoch() {
        let mut arena = BufferArena::new();
        let epoch = arena.epoch();
        let handle = arena.allocate(vec![1, 2, 3]);
        arena.clear();
        assert_ne!(arena.epoch(), epoch);
        assert!(arena.is_empty());
        assert!(!arena.contains(handle));
    }

    #[test]
    fn handle_encoding_round_trip() {
        let mut row = vec![0u8; 16];
        let handle = BufferHandle {
            index: 5,
            generation: 9,
        };
        handle.write_at(&mut row, 4);
        assert_eq!(BufferHandle::read_at(&row, 4), handle);
        assert!(BufferHandle::read_at(&row, 8).is_null());
    }
}
