//! Ember Editor
//!
//! Editor-side state for sandboxed scenes:
//! - Sandbox entity operations with asset reference counting
//! - Link component conversion between editor views and runtime components
//! - Component build scheduling on a worker pool
//! - Inspector panel state

pub mod build;
pub mod console;
pub mod editor;
pub mod editor_error;
pub mod entity_ops;
pub mod events;
pub mod gpu_lock;
pub mod inspector;
pub mod link;
pub mod locks;
pub mod module;
pub mod sandbox;
pub mod settings;
pub mod tasks;

pub use build::{BuildCompletion, BuildError, BuildStatus, BuildTarget, JobStatus, SharedSplitJob};
pub use console::{Console, ConsoleLevel, ConsoleMessage};
pub use editor::EditorState;
pub use editor_error::EditorError;
pub use entity_ops::DeleteStatus;
pub use events::{EditorEvent, EventQueue};
pub use gpu_lock::{GpuLock, GpuLockGuard};
pub use inspector::{FrameEvent, InspectorEntityData, InspectorTarget};
pub use link::{LinkContext, LinkError};
pub use locks::{LockedComponents, LockedEntry, ReserveError};
pub use module::{
    BackgroundContext, BuildFunction, BuildInput, BuildOutcome, BuildTask, ComponentBuildEntry, EditorModule,
    ModifierInput, ModuleLinkFunctions,
};
pub use sandbox::{Sandbox, SandboxIndex, Viewport};
pub use settings::{EditorSettings, SettingsError};
pub use tasks::TaskRunner;

/// Editor version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
