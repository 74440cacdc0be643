//! Ember Asset Database
//!
//! Tracks loaded assets and how many references each sandbox holds on
//! them. Components reference assets either by handle (editor side) or by
//! runtime address (runtime side); the database maps between the two.

use ember_core::asset::{AssetHandle, AssetType, AssetTypedHandle};
use ember_core::ecs::ComponentData;
use ember_core::reflect::{read_field, AssetResolver, ComponentMeta, FieldType, FieldValue};
use std::collections::HashMap;
use thiserror::Error;
use tracing::{debug, warn};

/// Index of a sandbox inside the editor.
pub type SandboxIndex = u32;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AssetError {
    #[error("{asset} is not registered")]
    UnknownAsset { asset: AssetTypedHandle },

    #[error("sandbox {sandbox} holds no reference to {asset}")]
    ReferenceUnderflow {
        asset: AssetTypedHandle,
        sandbox: SandboxIndex,
    },
}

#[derive(Debug)]
struct AssetEntry {
    name: String,
    runtime_address: u64,
    references: HashMap<SandboxIndex, u32>,
}

impl AssetEntry {
    fn total_references(&self) -> u32 {
        self.references.values().sum()
    }
}

/// Base of the synthetic runtime addresses handed out to loaded assets.
const ADDRESS_BASE: u64 = 0x1000_0000;
const ADDRESS_STRIDE: u64 = 0x100;

#[derive(Debug, Default)]
pub struct AssetDatabase {
    assets: HashMap<AssetTypedHandle, AssetEntry>,
    by_address: HashMap<u64, AssetTypedHandle>,
    next_handle: [u32; AssetType::COUNT],
    next_address: u64,
}

impl AssetDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an asset, or return the existing handle of `name`.
    pub fn add_asset(&mut self, name: &str, ty: AssetType) -> AssetHandle {
        if let Some(handle) = self.find_asset(name, ty) {
            return handle;
        }
        let handle = AssetHandle(self.next_handle[ty.index()]);
        self.next_handle[ty.index()] += 1;
        let runtime_address = ADDRESS_BASE + self.next_address * ADDRESS_STRIDE;
        self.next_address += 1;

        let typed = AssetTypedHandle::new(handle, ty);
        self.assets.insert(
            typed,
            AssetEntry {
                name: name.to_string(),
                runtime_address,
                references: HashMap::new(),
            },
        );
        self.by_address.insert(runtime_address, typed);
        debug!(asset = %typed, name, "registered asset");
        handle
    }

    pub fn find_asset(&self, name: &str, ty: AssetType) -> Option<AssetHandle> {
        self.assets
            .iter()
            .find(|(typed, entry)| typed.ty == ty && entry.name == name)
            .map(|(typed, _)| typed.handle)
    }

    pub fn asset_name(&self, asset: AssetTypedHandle) -> Option<&str> {
        self.assets.get(&asset).map(|e| e.name.as_str())
    }

    pub fn runtime_address(&self, asset: AssetTypedHandle) -> Option<u64> {
        self.assets.get(&asset).map(|e| e.runtime_address)
    }

    /// Whether any sandbox still holds a reference.
    pub fn is_loaded(&self, asset: AssetTypedHandle) -> bool {
        self.reference_count(asset) > 0
    }

    pub fn reference_count(&self, asset: AssetTypedHandle) -> u32 {
        self.assets.get(&asset).map_or(0, AssetEntry::total_references)
    }

    pub fn sandbox_reference_count(&self, asset: AssetTypedHandle, sandbox: SandboxIndex) -> u32 {
        self.assets
            .get(&asset)
            .and_then(|e| e.references.get(&sandbox).copied())
            .unwrap_or(0)
    }

    pub fn increment_asset_reference_in_sandbox(
        &mut self,
        asset: AssetTypedHandle,
        sandbox: SandboxIndex,
        count: u32,
    ) -> Result<(), AssetError> {
        let entry = self
            .assets
            .get_mut(&asset)
            .ok_or(AssetError::UnknownAsset { asset })?;
        *entry.references.entry(sandbox).or_insert(0) += count;
        Ok(())
    }

    /// Drop one reference `sandbox` holds on `asset`. The asset unloads when
    /// no sandbox references it anymore.
    pub fn unregister_sandbox_asset(
        &mut self,
        asset: AssetTypedHandle,
        sandbox: SandboxIndex,
    ) -> Result<(), AssetError> {
        let entry = self
            .assets
            .get_mut(&asset)
            .ok_or(AssetError::UnknownAsset { asset })?;
        let references = entry
            .references
            .get_mut(&sandbox)
            .ok_or(AssetError::ReferenceUnderflow { asset, sandbox })?;
        *references -= 1;
        if *references == 0 {
            entry.references.remove(&sandbox);
        }
        if entry.references.is_empty() {
            debug!(%asset, "asset unloaded");
        }
        Ok(())
    }

    /// Batch form of `unregister_sandbox_asset`. Failures are logged and the
    /// remaining assets are still processed.
    pub fn unregister_sandbox_assets(&mut self, assets: &[AssetTypedHandle], sandbox: SandboxIndex) {
        for &asset in assets {
            if let Err(err) = self.unregister_sandbox_asset(asset, sandbox) {
                warn!(%err, "failed to unregister sandbox asset");
            }
        }
    }

    /// Forget every reference held by a sandbox that is being destroyed.
    pub fn remove_sandbox(&mut self, sandbox: SandboxIndex) {
        for entry in self.assets.values_mut() {
            entry.references.remove(&sandbox);
        }
    }
}

impl AssetResolver for AssetDatabase {
    fn handle_of_pointer(&self, ty: AssetType, pointer: u64) -> AssetHandle {
        self.by_address
            .get(&pointer)
            .filter(|typed| typed.ty == ty)
            .map_or(AssetHandle::INVALID, |typed| typed.handle)
    }

    fn pointer_of_handle(&self, ty: AssetType, handle: AssetHandle) -> u64 {
        self.runtime_address(AssetTypedHandle::new(handle, ty))
            .unwrap_or(0)
    }
}

/// Assets referenced by a component value, one entry per asset field.
///
/// Fields holding no asset (invalid handles, null or unknown pointers) are
/// skipped.
pub fn editor_component_assets(
    meta: &ComponentMeta,
    data: &ComponentData,
    resolver: &dyn AssetResolver,
) -> Vec<AssetTypedHandle> {
    if data.size() != meta.size {
        return Vec::new();
    }
    meta.asset_fields()
        .filter_map(|field| {
            let handle = match (field.ty, read_field(field, data)) {
                (FieldType::Asset(_), FieldValue::Asset(handle)) => handle,
                (FieldType::AssetPointer(ty), FieldValue::AssetPointer(pointer)) if pointer != 0 => {
                    resolver.handle_of_pointer(ty, pointer)
                }
                _ => return None,
            };
            let ty = field.ty.asset_type()?;
            handle.is_valid().then(|| AssetTypedHandle::new(handle, ty))
        })
        .collect()
}
