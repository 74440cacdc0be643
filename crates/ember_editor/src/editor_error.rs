use crate::link::LinkError;
use crate::sandbox::SandboxIndex;
use crate::settings::SettingsError;
use ember_asset::AssetError;
use ember_core::ecs::{ComponentKind, EntityManagerError};
use ember_core::reflect::RegistryError;
use thiserror::Error;

/// Errors surfaced by editor operations.
///
/// Stale entities and missing runtime worlds are not errors: those
/// operations return `Ok(false)` or `None` instead.
#[derive(Debug, Error)]
pub enum EditorError {
    #[error("sandbox {0} does not exist")]
    UnknownSandbox(SandboxIndex),

    #[error("component {0} is not registered")]
    UnknownComponent(String),

    #[error("component {component} is {actual}, expected {expected}")]
    WrongKind {
        component: String,
        expected: ComponentKind,
        actual: ComponentKind,
    },

    #[error("module {0} is not registered")]
    UnknownModule(String),

    #[error("module {module} has {locks} background builds running")]
    ModuleLocked { module: String, locks: u32 },

    #[error(transparent)]
    Link(#[from] LinkError),

    #[error(transparent)]
    EntityManager(#[from] EntityManagerError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Asset(#[from] AssetError),

    #[error(transparent)]
    Settings(#[from] SettingsError),

    #[error("failed to start build workers: {0}")]
    TaskRunner(#[from] rayon::ThreadPoolBuildError),
}
