// registry.rs - Component name/id resolution and layout metadata
//
// The registry is owned by the editor rather than being a process-wide
// static: several editors (and tests) can coexist, and hot-reloading a
// module only touches the registry it was loaded into.

use crate::asset::AssetHandle;
use crate::ecs::{ComponentData, ComponentId, ComponentInfo, ComponentKind};
use crate::reflect::{write_field, FieldMeta, FieldTags, FieldType, FieldValue, RegistryError};
use std::collections::HashMap;
use tracing::{debug, info};

/// Reflection data for one component type.
#[derive(Debug, Clone)]
pub struct ComponentMeta {
    pub id: ComponentId,
    pub name: String,
    pub kind: ComponentKind,
    pub size: usize,
    pub fields: Vec<FieldMeta>,
    /// Value used when the component is added or reset.
    pub default: ComponentData,
    /// Name of the runtime component this type is an editor view of.
    pub link_target: Option<String>,
    /// Module that registered the type, if any.
    pub module: Option<String>,
}

impl ComponentMeta {
    pub fn field(&self, name: &str) -> Option<&FieldMeta> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn buffer_offsets(&self) -> Vec<usize> {
        self.fields
            .iter()
            .filter(|f| f.is_buffer())
            .map(|f| f.offset)
            .collect()
    }

    /// Fields holding asset handles or asset pointers.
    pub fn asset_fields(&self) -> impl Iterator<Item = &FieldMeta> {
        self.fields.iter().filter(|f| f.ty.asset_type().is_some())
    }

    pub fn is_link(&self) -> bool {
        self.link_target.is_some()
    }

    /// Storage description handed to the entity manager.
    pub fn info(&self) -> ComponentInfo {
        ComponentInfo {
            id: self.id,
            name: self.name.clone(),
            kind: self.kind,
            size: self.size,
            buffer_offsets: self.buffer_offsets(),
        }
    }
}

/// Declarative description of a component type, laid out on `register`.
#[derive(Debug, Clone)]
pub struct ComponentMetaBuilder {
    name: String,
    kind: ComponentKind,
    fields: Vec<(String, FieldType, FieldTags)>,
    defaults: Vec<(String, FieldValue)>,
    link_target: Option<String>,
    module: Option<String>,
}

impl ComponentMetaBuilder {
    pub fn new(name: impl Into<String>, kind: ComponentKind) -> Self {
        Self {
            name: name.into(),
            kind,
            fields: Vec::new(),
            defaults: Vec::new(),
            link_target: None,
            module: None,
        }
    }

    pub fn field(self, name: impl Into<String>, ty: FieldType) -> Self {
        self.field_with(name, ty, FieldTags::empty())
    }

    pub fn field_with(mut self, name: impl Into<String>, ty: FieldType, tags: FieldTags) -> Self {
        self.fields.push((name.into(), ty, tags));
        self
    }

    pub fn default_value(mut self, field: impl Into<String>, value: FieldValue) -> Self {
        self.defaults.push((field.into(), value));
        self
    }

    /// Mark this type as the editor view of `target`.
    pub fn link_to(mut self, target: impl Into<String>) -> Self {
        self.link_target = Some(target.into());
        self
    }

    pub fn module(mut self, module: impl Into<String>) -> Self {
        self.module = Some(module.into());
        self
    }

    fn layout(self, id: ComponentId) -> Result<ComponentMeta, RegistryError> {
        let mut fields: Vec<FieldMeta> = Vec::with_capacity(self.fields.len());
        let mut offset = 0usize;
        let mut max_align = 1usize;
        for (name, ty, tags) in self.fields {
            if fields.iter().any(|f| f.name == name) {
                return Err(RegistryError::DuplicateField {
                    component: self.name,
                    field: name,
                });
            }
            let align = ty.align();
            max_align = max_align.max(align);
            offset = offset.next_multiple_of(align);
            fields.push(FieldMeta {
                name,
                ty,
                offset,
                tags,
            });
            offset += ty.size();
        }
        let size = offset.next_multiple_of(max_align);

        let mut default = ComponentData::zeroed(size);
        for field in fields.iter().filter(|f| matches!(f.ty, FieldType::Asset(_))) {
            write_field(field, &mut default, &FieldValue::Asset(AssetHandle::INVALID))?;
        }
        for (name, value) in &self.defaults {
            let field = fields
                .iter()
                .find(|f| &f.name == name)
                .ok_or_else(|| RegistryError::UnknownField {
                    component: self.name.clone(),
                    field: name.clone(),
                })?;
            write_field(field, &mut default, value)?;
        }

        Ok(ComponentMeta {
            id,
            name: self.name,
            kind: self.kind,
            size,
            fields,
            default,
            link_target: self.link_target,
            module: self.module,
        })
    }
}

/// Maps component names to ids and holds their reflection data.
#[derive(Debug, Default)]
pub struct ComponentRegistry {
    metas: HashMap<ComponentId, ComponentMeta>,
    /// Ids stay assigned to a name across unregistration so reloaded
    /// modules keep addressing the same storage.
    ids: HashMap<String, ComponentId>,
    next_id: ComponentId,
}

impl ComponentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a component type, or replace the definition of a name that
    /// was registered before.
    pub fn register(&mut self, builder: ComponentMetaBuilder) -> Result<ComponentId, RegistryError> {
        let id = match self.ids.get(&builder.name) {
            Some(&id) => id,
            None => {
                let id = self.next_id;
                self.next_id += 1;
                self.ids.insert(builder.name.clone(), id);
                id
            }
        };
        let meta = builder.layout(id)?;
        if let Some(previous) = self.metas.get(&id) {
            if previous.kind != meta.kind {
                return Err(RegistryError::KindChanged {
                    component: meta.name,
                    previous: previous.kind,
                    requested: meta.kind,
                });
            }
            debug!(component = %meta.name, id, "re-registered component");
        } else {
            debug!(component = %meta.name, id, size = meta.size, "registered component");
        }
        self.metas.insert(id, meta);
        Ok(id)
    }

    pub fn id_of(&self, name: &str) -> Option<ComponentId> {
        self.ids.get(name).copied().filter(|id| self.metas.contains_key(id))
    }

    pub fn meta(&self, id: ComponentId) -> Option<&ComponentMeta> {
        self.metas.get(&id)
    }

    pub fn meta_by_name(&self, name: &str) -> Option<&ComponentMeta> {
        self.id_of(name).and_then(|id| self.metas.get(&id))
    }

    pub fn contains(&self, id: ComponentId) -> bool {
        self.metas.contains_key(&id)
    }

    pub fn components(&self) -> impl Iterator<Item = &ComponentMeta> {
        self.metas.values()
    }

    /// Remove every type registered by `module`. Returns the removed ids.
    pub fn unregister_module(&mut self, module: &str) -> Vec<ComponentId> {
        let mut removed: Vec<ComponentId> = self
            .metas
            .values()
            .filter(|m| m.module.as_deref() == Some(module))
            .map(|m| m.id)
            .collect();
        removed.sort_unstable();
        for id in &removed {
            self.metas.remove(id);
        }
        if !removed.is_empty() {
            info!(module, count = removed.len(), "unregistered module components");
        }
        removed
    }

    /// Target component of a link type.
    pub fn link_target(&self, link: ComponentId) -> Option<ComponentId> {
        let target = self.metas.get(&link)?.link_target.as_deref()?;
        self.id_of(target)
    }

    /// Link type viewing `target`, if one is registered.
    pub fn link_of_target(&self, target: ComponentId) -> Option<ComponentId> {
        let target_name = &self.metas.get(&target)?.name;
        self.metas
            .values()
            .find(|m| m.link_target.as_deref() == Some(target_name.as_str()))
            .map(|m| m.id)
    }
}
