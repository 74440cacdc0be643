// component.rs - Runtime component identification
//
// Components are identified by u32 IDs, not Rust TypeIds. Their layout is
// described at runtime so module-defined components coexist with built-in
// ones and can disappear again when a module is unloaded.

use std::collections::BTreeMap;
use std::fmt;

pub type ComponentId = u32;

/// Storage category of a component.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ComponentKind {
    /// Stored per entity inside its archetype.
    Unique,
    /// Stored once per distinct value and referenced by many entities.
    Shared,
    /// Singleton per entity manager.
    Global,
}

impl fmt::Display for ComponentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ComponentKind::Unique => "unique",
            ComponentKind::Shared => "shared",
            ComponentKind::Global => "global",
        })
    }
}

/// Layout information the entity manager needs to store a component.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ComponentInfo {
    pub id: ComponentId,
    pub name: String,
    pub kind: ComponentKind,
    pub size: usize,
    /// Byte offsets of fields holding a `BufferHandle`.
    pub buffer_offsets: Vec<usize>,
}

/// Handle of a de-duplicated shared component value.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SharedInstance {
    index: u32,
    generation: u32,
}

impl SharedInstance {
    pub(crate) const fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Display for SharedInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "instance {}:{}", self.index, self.generation)
    }
}

/// Detached component value: fixed-size bytes plus the contents of its
/// buffer fields.
///
/// Inside the entity manager buffer fields hold handles into a component
/// arena. A detached value carries the buffer contents instead, keyed by
/// field offset, and keeps zeros at those offsets so two values compare
/// equal exactly when their fields and buffer contents are equal.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct ComponentData {
    pub bytes: Vec<u8>,
    pub buffers: BTreeMap<usize, Vec<u8>>,
}

impl ComponentData {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            buffers: BTreeMap::new(),
        }
    }

    pub fn zeroed(size: usize) -> Self {
        Self::new(vec![0; size])
    }

    /// Typed view for plain components without buffer fields.
    pub fn from_pod<T: bytemuck::Pod>(value: &T) -> Self {
        Self::new(bytemuck::bytes_of(value).to_vec())
    }

    /// Read the fixed-size part as `T` (unaligned read).
    pub fn read_pod<T: bytemuck::Pod>(&self) -> Option<T> {
        (self.bytes.len() == std::mem::size_of::<T>())
            .then(|| bytemuck::pod_read_unaligned(&self.bytes))
    }

    pub fn size(&self) -> usize {
        self.bytes.len()
    }

    pub fn buffer(&self, offset: usize) -> Option<&[u8]> {
        self.buffers.get(&offset).map(|b| b.as_slice())
    }

    pub fn set_buffer(&mut self, offset: usize, contents: Vec<u8>) {
        self.buffers.insert(offset, contents);
    }
}
