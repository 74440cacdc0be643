use crate::ecs::ComponentKind;
use crate::reflect::FieldType;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("component {component} declares field {field} twice")]
    DuplicateField { component: String, field: String },

    #[error("component {component} has no field named {field}")]
    UnknownField { component: String, field: String },

    #[error("field {field} holds {expected}, value has a different type")]
    FieldTypeMismatch { field: String, expected: FieldType },

    #[error("component {component} was registered as {previous}, cannot become {requested}")]
    KindChanged {
        component: String,
        previous: ComponentKind,
        requested: ComponentKind,
    },

    #[error("component {0} is not registered")]
    UnknownComponent(String),
}
