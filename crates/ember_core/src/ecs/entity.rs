//! Entity handle with generational index
//!
//! Entities are lightweight handles (8 bytes) that reference data in the
//! entity manager. The generation counter prevents use-after-free bugs:
//! the editor routinely holds handles across frames while simulation or
//! other panels delete entities underneath it.

use std::fmt;

/// Entity handle (generation-indexed for safety)
///
/// Format: [32-bit index | 32-bit generation]
/// - Index: Position in the entity metadata array
/// - Generation: Incremented on entity destruction
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Entity {
    index: u32,
    generation: u32,
}

impl Entity {
    pub(crate) const fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// Serialize to 64-bit integer (for save files and UI identifiers)
    pub fn to_bits(&self) -> u64 {
        ((self.generation as u64) << 32) | (self.index as u64)
    }

    /// Deserialize from 64-bit integer
    pub fn from_bits(bits: u64) -> Self {
        Self {
            index: bits as u32,
            generation: (bits >> 32) as u32,
        }
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Entity {}", self.index)?;
        if self.generation > 0 {
            write!(f, " (gen {})", self.generation)?;
        }
        Ok(())
    }
}

/// Archetype identifier inside one entity manager.
pub type ArchetypeId = u32;

/// Where an entity's unique component data currently lives.
///
/// Adding or removing a component moves the entity to another archetype,
/// so a cached location must be compared against the current one before
/// any stored row is reused.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct EntityLoc {
    pub archetype: ArchetypeId,
    pub row: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bits_round_trip() {
        let entity = Entity::new(42, 7);
        assert_eq!(Entity::from_bits(entity.to_bits()), entity);
    }

    #[test]
    fn display_hides_zero_generation() {
        assert_eq!(Entity::new(3, 0).to_string(), "Entity 3");
        assert_eq!(Entity::new(3, 2).to_string(), "Entity 3 (gen 2)");
    }
}
