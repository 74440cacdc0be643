//! Asset identifiers referenced from component fields.
//!
//! The asset database itself lives in `ember_asset`; the core only needs
//! the identifiers so reflection can describe asset-bearing fields.

use std::fmt;

/// Category of a loaded asset.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AssetType {
    Mesh,
    Texture,
    GpuSampler,
    Shader,
    Material,
    Misc,
}

impl AssetType {
    pub const COUNT: usize = 6;

    pub const ALL: [AssetType; Self::COUNT] = [
        AssetType::Mesh,
        AssetType::Texture,
        AssetType::GpuSampler,
        AssetType::Shader,
        AssetType::Material,
        AssetType::Misc,
    ];

    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            AssetType::Mesh => "Mesh",
            AssetType::Texture => "Texture",
            AssetType::GpuSampler => "GPU Sampler",
            AssetType::Shader => "Shader",
            AssetType::Material => "Material",
            AssetType::Misc => "Misc",
        }
    }
}

impl fmt::Display for AssetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Handle of an asset inside the asset database, unique per asset type.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AssetHandle(pub u32);

impl AssetHandle {
    /// Stored in component fields that do not reference any asset.
    pub const INVALID: AssetHandle = AssetHandle(u32::MAX);

    #[inline]
    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }
}

impl Default for AssetHandle {
    fn default() -> Self {
        Self::INVALID
    }
}

/// An asset handle together with its type.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AssetTypedHandle {
    pub handle: AssetHandle,
    pub ty: AssetType,
}

impl AssetTypedHandle {
    pub fn new(handle: AssetHandle, ty: AssetType) -> Self {
        Self { handle, ty }
    }
}

impl fmt::Display for AssetTypedHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} #{}", self.ty, self.handle.0)
    }
}
