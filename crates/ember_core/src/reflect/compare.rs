// compare.rs - Structural equality of component values

use crate::asset::{AssetHandle, AssetType};
use crate::ecs::ComponentData;
use crate::reflect::{read_field, ComponentMeta, FieldType, FieldValue};

/// Maps runtime asset addresses back to database handles.
pub trait AssetResolver {
    fn handle_of_pointer(&self, ty: AssetType, pointer: u64) -> AssetHandle;
    fn pointer_of_handle(&self, ty: AssetType, handle: AssetHandle) -> u64;
}

/// Field-by-field comparison of two values of the same component type.
///
/// Editor-only fields are skipped. Buffers compare by content and asset
/// pointers by the asset they resolve to, so two pointers to the same
/// asset are equal even when their bits differ.
pub fn structurally_equal(
    meta: &ComponentMeta,
    a: &ComponentData,
    b: &ComponentData,
    resolver: &dyn AssetResolver,
) -> bool {
    if a.size() != meta.size || b.size() != meta.size {
        return false;
    }
    meta.fields.iter().filter(|f| !f.is_editor_only()).all(|field| {
        match (field.ty, read_field(field, a), read_field(field, b)) {
            (FieldType::AssetPointer(ty), FieldValue::AssetPointer(pa), FieldValue::AssetPointer(pb)) => {
                pa == pb || resolver.handle_of_pointer(ty, pa) == resolver.handle_of_pointer(ty, pb)
            }
            (_, va, vb) => va == vb,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ecs::ComponentKind;
    use crate::reflect::{write_field, ComponentMetaBuilder, ComponentRegistry, FieldTags};

    /// Pointers with the same high 32 bits belong to the same asset.
    struct Aliased;

    impl AssetResolver for Aliased {
        fn handle_of_pointer(&self, _ty: AssetType, pointer: u64) -> AssetHandle {
            AssetHandle((pointer >> 32) as u32)
        }

        fn pointer_of_handle(&self, _ty: AssetType, handle: AssetHandle) -> u64 {
            (handle.0 as u64) << 32
        }
    }

    fn meta() -> ComponentMeta {
        let mut registry = ComponentRegistry::new();
        let id = registry
            .register(
                ComponentMetaBuilder::new("Mesh", ComponentKind::Unique)
                    .field("mesh", FieldType::AssetPointer(AssetType::Mesh))
                    .field("label", FieldType::Buffer)
                    .field_with("note", FieldType::U32, FieldTags::EDITOR_ONLY),
            )
            .unwrap();
        registry.meta(id).unwrap().clone()
    }

    fn set(meta: &ComponentMeta, data: &mut ComponentData, name: &str, value: FieldValue) {
        write_field(meta.field(name).unwrap(), data, &value).unwrap();
    }

    #[test]
    fn pointers_compare_by_identity() {
        let meta = meta();
        let mut a = meta.default.clone();
        let mut b = meta.default.clone();
        set(&meta, &mut a, "mesh", FieldValue::AssetPointer((7 << 32) | 1));
        set(&meta, &mut b, "mesh", FieldValue::AssetPointer((7 << 32) | 2));
        assert!(structurally_equal(&meta, &a, &b, &Aliased));
        set(&meta, &mut b, "mesh", FieldValue::AssetPointer(8 << 32));
        assert!(!structurally_equal(&meta, &a, &b, &Aliased));
    }

    #[test]
    fn editor_only_ignored_buffers_by_content() {
        let meta = meta();
        let mut a = meta.default.clone();
        let mut b = meta.default.clone();
        set(&meta, &mut a, "note", FieldValue::U32(1));
        set(&meta, &mut b, "note", FieldValue::U32(2));
        assert!(structurally_equal(&meta, &a, &b, &Aliased));

        set(&meta, &mut a, "label", FieldValue::Buffer(b"x".to_vec()));
        assert!(!structurally_equal(&meta, &a, &b, &Aliased));
        set(&meta, &mut b, "label", FieldValue::Buffer(b"x".to_vec()));
        assert!(structurally_equal(&meta, &a, &b, &Aliased));
    }
}
