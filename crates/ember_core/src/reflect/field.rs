// field.rs - Field layout and typed access into component bytes

use crate::asset::{AssetHandle, AssetType};
use crate::ecs::{BufferHandle, ComponentData};
use crate::math::{Quat, Vec3};
use crate::reflect::RegistryError;
use bitflags::bitflags;
use std::fmt;

/// Type of a reflected field.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum FieldType {
    Bool,
    U32,
    I32,
    F32,
    Vec3,
    Quat,
    /// Asset handle as seen by the editor.
    Asset(AssetType),
    /// Runtime address of a loaded asset. Only meaningful inside the
    /// process that loaded it, so it is compared through the asset database.
    AssetPointer(AssetType),
    /// Variable-length bytes stored out of line.
    Buffer,
}

impl FieldType {
    pub const fn size(self) -> usize {
        match self {
            FieldType::Bool => 1,
            FieldType::U32 | FieldType::I32 | FieldType::F32 => 4,
            FieldType::Vec3 => 12,
            FieldType::Quat => 16,
            FieldType::Asset(_) => 4,
            FieldType::AssetPointer(_) => 8,
            FieldType::Buffer => BufferHandle::SIZE,
        }
    }

    pub const fn align(self) -> usize {
        match self {
            FieldType::Bool => 1,
            FieldType::AssetPointer(_) | FieldType::Buffer => 8,
            _ => 4,
        }
    }

    /// Asset type referenced by the field, for both handle and pointer fields.
    pub fn asset_type(self) -> Option<AssetType> {
        match self {
            FieldType::Asset(ty) | FieldType::AssetPointer(ty) => Some(ty),
            _ => None,
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldType::Asset(ty) => write!(f, "asset<{ty}>"),
            FieldType::AssetPointer(ty) => write!(f, "asset pointer<{ty}>"),
            other => write!(f, "{}", format!("{other:?}").to_lowercase()),
        }
    }
}

bitflags! {
    /// Per-field behaviour flags.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
    pub struct FieldTags: u8 {
        /// Applied as a delta against a gesture baseline when converting a
        /// link component to its target.
        const MODIFIER = 1 << 0;
        /// Exists only on the editor side; has no target counterpart and is
        /// ignored by structural comparison.
        const EDITOR_ONLY = 1 << 1;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldMeta {
    pub name: String,
    pub ty: FieldType,
    pub offset: usize,
    pub tags: FieldTags,
}

impl FieldMeta {
    pub fn is_modifier(&self) -> bool {
        self.tags.contains(FieldTags::MODIFIER)
    }

    pub fn is_editor_only(&self) -> bool {
        self.tags.contains(FieldTags::EDITOR_ONLY)
    }

    pub fn is_buffer(&self) -> bool {
        self.ty == FieldType::Buffer
    }

    fn bytes<'a>(&self, data: &'a ComponentData) -> &'a [u8] {
        &data.bytes[self.offset..self.offset + self.ty.size()]
    }
}

/// Decoded value of a single field.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Bool(bool),
    U32(u32),
    I32(i32),
    F32(f32),
    Vec3(Vec3),
    Quat(Quat),
    Asset(AssetHandle),
    AssetPointer(u64),
    Buffer(Vec<u8>),
}

impl FieldValue {
    fn matches(&self, ty: FieldType) -> bool {
        matches!(
            (self, ty),
            (FieldValue::Bool(_), FieldType::Bool)
                | (FieldValue::U32(_), FieldType::U32)
                | (FieldValue::I32(_), FieldType::I32)
                | (FieldValue::F32(_), FieldType::F32)
                | (FieldValue::Vec3(_), FieldType::Vec3)
                | (FieldValue::Quat(_), FieldType::Quat)
                | (FieldValue::Asset(_), FieldType::Asset(_))
                | (FieldValue::AssetPointer(_), FieldType::AssetPointer(_))
                | (FieldValue::Buffer(_), FieldType::Buffer)
        )
    }
}

/// Decode a field from a detached component value.
pub fn read_field(field: &FieldMeta, data: &ComponentData) -> FieldValue {
    let bytes = field.bytes(data);
    match field.ty {
        FieldType::Bool => FieldValue::Bool(bytes[0] != 0),
        FieldType::U32 => FieldValue::U32(bytemuck::pod_read_unaligned(bytes)),
        FieldType::I32 => FieldValue::I32(bytemuck::pod_read_unaligned(bytes)),
        FieldType::F32 => FieldValue::F32(bytemuck::pod_read_unaligned(bytes)),
        FieldType::Vec3 => {
            FieldValue::Vec3(Vec3::from_array(bytemuck::pod_read_unaligned::<[f32; 3]>(bytes)))
        }
        FieldType::Quat => {
            FieldValue::Quat(Quat::from_array(bytemuck::pod_read_unaligned::<[f32; 4]>(bytes)))
        }
        FieldType::Asset(_) => FieldValue::Asset(AssetHandle(bytemuck::pod_read_unaligned(bytes))),
        FieldType::AssetPointer(_) => FieldValue::AssetPointer(bytemuck::pod_read_unaligned(bytes)),
        FieldType::Buffer => {
            FieldValue::Buffer(data.buffer(field.offset).map(<[u8]>::to_vec).unwrap_or_default())
        }
    }
}

/// Encode a field into a detached component value.
pub fn write_field(field: &FieldMeta, data: &mut ComponentData, value: &FieldValue) -> Result<(), RegistryError> {
    if !value.matches(field.ty) {
        return Err(RegistryError::FieldTypeMismatch {
            field: field.name.clone(),
            expected: field.ty,
        });
    }
    let range = field.offset..field.offset + field.ty.size();
    let dst = &mut data.bytes[range];
    match value {
        FieldValue::Bool(v) => dst[0] = u8::from(*v),
        FieldValue::U32(v) => dst.copy_from_slice(&v.to_le_bytes()),
        FieldValue::I32(v) => dst.copy_from_slice(&v.to_le_bytes()),
        FieldValue::F32(v) => dst.copy_from_slice(&v.to_le_bytes()),
        FieldValue::Vec3(v) => dst.copy_from_slice(bytemuck::cast_slice(&v.to_array())),
        FieldValue::Quat(v) => dst.copy_from_slice(bytemuck::cast_slice(&v.to_array())),
        FieldValue::Asset(v) => dst.copy_from_slice(&v.0.to_le_bytes()),
        FieldValue::AssetPointer(v) => dst.copy_from_slice(&v.to_le_bytes()),
        FieldValue::Buffer(contents) => {
            dst.fill(0);
            if contents.is_empty() {
                data.buffers.remove(&field.offset);
            } else {
                data.buffers.insert(field.offset, contents.clone());
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field(ty: FieldType, offset: usize) -> FieldMeta {
        FieldMeta {
            name: "value".into(),
            ty,
            offset,
            tags: FieldTags::empty(),
        }
    }

    #[test]
    fn write_then_read() {
        let mut data = ComponentData::zeroed(32);
        let rotation = field(FieldType::Quat, 0);
        let q = Quat::from_rotation_y(1.0);
        write_field(&rotation, &mut data, &FieldValue::Quat(q)).unwrap();
        assert_eq!(read_field(&rotation, &data), FieldValue::Quat(q));

        let name = field(FieldType::Buffer, 16);
        write_field(&name, &mut data, &FieldValue::Buffer(b"rock".to_vec())).unwrap();
        assert_eq!(data.buffer(16), Some(&b"rock"[..]));
        assert_eq!(&data.bytes[16..24], &[0u8; 8]);
    }

    #[test]
    fn type_mismatch_is_rejected() {
        let mut data = ComponentData::zeroed(4);
        let err = write_field(&field(FieldType::F32, 0), &mut data, &FieldValue::U32(1)).unwrap_err();
        assert!(matches!(err, RegistryError::FieldTypeMismatch { .. }));
    }

    #[test]
    fn empty_buffer_clears_contents() {
        let mut data = ComponentData::zeroed(8);
        let name = field(FieldType::Buffer, 0);
        write_field(&name, &mut data, &FieldValue::Buffer(b"x".to_vec())).unwrap();
        write_field(&name, &mut data, &FieldValue::Buffer(Vec::new())).unwrap();
        assert!(data.buffers.is_empty());
    }
}
