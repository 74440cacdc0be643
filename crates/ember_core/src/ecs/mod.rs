//! Entity Component System core types.
//!
//! Components are registered at runtime with a byte layout and stored per
//! archetype. Variable-length fields live in per-component buffer arenas
//! and are referenced from rows through generation-tagged handles.

mod archetype;
mod arena;
mod component;
mod entity;
mod manager_error;
mod shared;
mod world;

pub use archetype::{ArchetypeSignature, ArchetypeStorage};
pub use arena::{BufferArena, BufferHandle};
pub use component::{ComponentData, ComponentId, ComponentInfo, ComponentKind, SharedInstance};
pub use entity::{ArchetypeId, Entity, EntityLoc};
pub use manager_error::EntityManagerError;
pub use world::EntityManager;
