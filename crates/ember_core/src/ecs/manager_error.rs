use crate::ecs::{ComponentId, ComponentKind, Entity, SharedInstance};
use thiserror::Error;

/// Errors returned by entity manager mutations.
///
/// The editor treats most of these as expected races (an entity deleted by
/// simulation earlier in the frame) and checks existence before calling.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EntityManagerError {
    #[error("{entity} does not exist")]
    EntityNotFound { entity: Entity },

    #[error("component id {component} is not registered")]
    ComponentNotRegistered { component: ComponentId },

    #[error("component id {component} is registered as {actual}, expected {expected}")]
    WrongKind {
        component: ComponentId,
        expected: ComponentKind,
        actual: ComponentKind,
    },

    #[error("component id {component} was registered with {previous} bytes, now {requested}")]
    LayoutMismatch {
        component: ComponentId,
        previous: usize,
        requested: usize,
    },

    #[error("component id {component} expects {expected} bytes but received {actual} bytes")]
    SizeMismatch {
        component: ComponentId,
        expected: usize,
        actual: usize,
    },

    #[error("{entity} already has component {component}")]
    ComponentAlreadyPresent { entity: Entity, component: ComponentId },

    #[error("{entity} does not have component {component}")]
    ComponentMissing { entity: Entity, component: ComponentId },

    #[error("shared component {component} has no {instance}")]
    SharedInstanceNotFound {
        component: ComponentId,
        instance: SharedInstance,
    },

    #[error("shared component {component} {instance} is still referenced by {references} entities")]
    SharedInstanceReferenced {
        component: ComponentId,
        instance: SharedInstance,
        references: u32,
    },

    #[error("global component {component} is not registered in this entity manager")]
    GlobalMissing { component: ComponentId },

    #[error("global component {component} is already present")]
    GlobalAlreadyPresent { component: ComponentId },

    #[error("parenting {child} under {parent} would create a cycle")]
    HierarchyCycle { child: Entity, parent: Entity },
}
