//! Runtime reflection for component layouts.
//!
//! Describes each component as a list of typed fields so the editor can
//! build default values, find asset references, compare values and map
//! link components onto their runtime targets.

mod compare;
mod error;
mod field;
mod registry;

pub use compare::{structurally_equal, AssetResolver};
pub use error::RegistryError;
pub use field::{read_field, write_field, FieldMeta, FieldTags, FieldType, FieldValue};
pub use registry::{ComponentMeta, ComponentMetaBuilder, ComponentRegistry};
