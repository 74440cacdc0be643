//! Ember Engine Core
//!
//! Contains the data layer shared by the runtime and the editor:
//! - Entity manager with unique, shared and global components
//! - Runtime reflection for component layouts and link components
//! - Asset identifiers referenced from component fields
//! - Math helpers

pub mod asset;
pub mod ecs;
pub mod math;
pub mod reflect;

pub use glam;

/// Engine version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
