// link.rs - Link component <-> target component conversion
//
// A link component is the editor-facing view of a runtime component. Its
// fields map onto the target's fields by name; asset handles become
// runtime asset pointers and euler angles become rotations. Conversions
// are staged into a copy of the destination, so a failed conversion never
// leaves a half-written value behind.

use crate::module::{EditorModule, ModifierInput, ModuleLinkFunctions};
use ember_core::asset::AssetHandle;
use ember_core::ecs::ComponentData;
use ember_core::math::{quat_approx_eq, quat_from_euler_degrees, quat_to_euler_degrees};
use ember_core::reflect::{
    read_field, structurally_equal, write_field, AssetResolver, ComponentMeta, ComponentRegistry,
    FieldMeta, FieldType, FieldValue,
};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use thiserror::Error;

/// Rotations within this distance keep the previous euler angles, so the
/// inspector does not flip between equivalent representations.
const EULER_STABILITY_EPSILON: f32 = 1e-4;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LinkError {
    #[error("module {module} providing the conversion of {component} is not loaded")]
    ModuleNotLoaded { module: String, component: String },

    #[error("link component {link} does not match its target: field {field} {reason}")]
    IncompatibleLayout {
        link: String,
        field: String,
        reason: String,
    },

    #[error("component {component} is not a link component")]
    NotALinkType { component: String },

    #[error("target {target} of link component {link} is not registered")]
    TargetMissing { link: String, target: String },

    #[error("conversion function of {component} crashed")]
    Crashed { component: String },
}

/// What a conversion needs from the editor.
#[derive(Clone, Copy)]
pub struct LinkContext<'a> {
    pub registry: &'a ComponentRegistry,
    pub assets: &'a dyn AssetResolver,
    pub modules: &'a HashMap<String, EditorModule>,
}

/// Target type of a link component.
pub fn link_target_meta<'a>(ctx: &LinkContext<'a>, link_meta: &ComponentMeta) -> Result<&'a ComponentMeta, LinkError> {
    let target = link_meta
        .link_target
        .as_deref()
        .ok_or_else(|| LinkError::NotALinkType {
            component: link_meta.name.clone(),
        })?;
    ctx.registry
        .meta_by_name(target)
        .ok_or_else(|| LinkError::TargetMissing {
            link: link_meta.name.clone(),
            target: target.to_string(),
        })
}

fn module_functions(ctx: &LinkContext<'_>, link_meta: &ComponentMeta) -> Result<Option<Arc<ModuleLinkFunctions>>, LinkError> {
    let Some(module) = link_meta.module.as_deref().and_then(|name| ctx.modules.get(name)) else {
        return Ok(None);
    };
    let Some(functions) = module.link_entry(link_meta.id) else {
        return Ok(None);
    };
    if !module.is_loaded() {
        return Err(LinkError::ModuleNotLoaded {
            module: module.name.clone(),
            component: link_meta.name.clone(),
        });
    }
    if functions.has_crashed() {
        return Err(LinkError::Crashed {
            component: link_meta.name.clone(),
        });
    }
    Ok(Some(Arc::clone(functions)))
}

fn compatible(link: FieldType, target: FieldType) -> bool {
    match (link, target) {
        (FieldType::Asset(a), FieldType::AssetPointer(b)) => a == b,
        (FieldType::Vec3, FieldType::Quat) => true,
        (a, b) => a == b,
    }
}

/// Pair every non editor-only link field with its target field.
fn field_pairs<'m>(link_meta: &'m ComponentMeta, target_meta: &'m ComponentMeta) -> Result<Vec<(&'m FieldMeta, &'m FieldMeta)>, LinkError> {
    link_meta
        .fields
        .iter()
        .filter(|f| !f.is_editor_only())
        .map(|link_field| {
            let incompatible = |reason: String| LinkError::IncompatibleLayout {
                link: link_meta.name.clone(),
                field: link_field.name.clone(),
                reason,
            };
            let target_field = target_meta
                .field(&link_field.name)
                .ok_or_else(|| incompatible(format!("is missing in {}", target_meta.name)))?;
            if !compatible(link_field.ty, target_field.ty) {
                return Err(incompatible(format!(
                    "of type {} cannot map to {}",
                    link_field.ty, target_field.ty
                )));
            }
            Ok((link_field, target_field))
        })
        .collect()
}

/// Check that a link type maps onto its target.
pub fn validate_link_layout(ctx: &LinkContext<'_>, link_meta: &ComponentMeta) -> Result<(), LinkError> {
    let target_meta = link_target_meta(ctx, link_meta)?;
    field_pairs(link_meta, target_meta).map(|_| ())
}

fn check_size(meta: &ComponentMeta, link_meta: &ComponentMeta, data: &ComponentData) -> Result<(), LinkError> {
    if data.size() == meta.size {
        return Ok(());
    }
    Err(LinkError::IncompatibleLayout {
        link: link_meta.name.clone(),
        field: meta.name.clone(),
        reason: format!("value has {} bytes, expected {}", data.size(), meta.size),
    })
}

fn to_target_value(target: &FieldMeta, value: FieldValue, assets: &dyn AssetResolver) -> FieldValue {
    match (target.ty, value) {
        (FieldType::AssetPointer(ty), FieldValue::Asset(handle)) => {
            let pointer = if handle.is_valid() {
                assets.pointer_of_handle(ty, handle)
            } else {
                0
            };
            FieldValue::AssetPointer(pointer)
        }
        (FieldType::Quat, FieldValue::Vec3(euler)) => FieldValue::Quat(quat_from_euler_degrees(euler)),
        (_, value) => value,
    }
}

fn to_link_value(
    link: &FieldMeta,
    value: FieldValue,
    previous_link: Option<FieldValue>,
    assets: &dyn AssetResolver,
) -> FieldValue {
    match (link.ty, value) {
        (FieldType::Asset(ty), FieldValue::AssetPointer(pointer)) => FieldValue::Asset(if pointer == 0 {
            AssetHandle::INVALID
        } else {
            assets.handle_of_pointer(ty, pointer)
        }),
        (FieldType::Vec3, FieldValue::Quat(rotation)) => match previous_link {
            Some(FieldValue::Vec3(euler))
                if quat_approx_eq(quat_from_euler_degrees(euler), rotation, EULER_STABILITY_EPSILON) =>
            {
                FieldValue::Vec3(euler)
            }
            _ => FieldValue::Vec3(quat_to_euler_degrees(rotation)),
        },
        (_, value) => value,
    }
}

/// `baseline ⊕ (link − previous_link)` for the numeric field types.
fn apply_delta(
    target: &FieldMeta,
    link: FieldValue,
    previous_link: FieldValue,
    baseline: FieldValue,
    assets: &dyn AssetResolver,
) -> FieldValue {
    match (link, previous_link, baseline) {
        (FieldValue::F32(l), FieldValue::F32(p), FieldValue::F32(b)) => FieldValue::F32(b + (l - p)),
        (FieldValue::I32(l), FieldValue::I32(p), FieldValue::I32(b)) => {
            FieldValue::I32(b.wrapping_add(l.wrapping_sub(p)))
        }
        (FieldValue::U32(l), FieldValue::U32(p), FieldValue::U32(b)) => {
            FieldValue::U32(b.wrapping_add(l.wrapping_sub(p)))
        }
        (FieldValue::Vec3(l), FieldValue::Vec3(p), FieldValue::Vec3(b)) => FieldValue::Vec3(b + (l - p)),
        (FieldValue::Vec3(l), FieldValue::Vec3(p), FieldValue::Quat(b)) => {
            FieldValue::Quat((b * quat_from_euler_degrees(l - p)).normalize())
        }
        (link, _, _) => to_target_value(target, link, assets),
    }
}

fn run_guarded(functions: &ModuleLinkFunctions, link_meta: &ComponentMeta, call: impl FnOnce()) -> Result<(), LinkError> {
    catch_unwind(AssertUnwindSafe(call)).map_err(|_| {
        functions.mark_crashed();
        tracing::error!(component = %link_meta.name, "link conversion function crashed");
        LinkError::Crashed {
            component: link_meta.name.clone(),
        }
    })
}

/// Fill `link_out` from a target value.
///
/// When the target did not change since `previous_target` the previous
/// link value is kept as is, including its editor-only fields.
pub fn convert_target_to_link(
    ctx: &LinkContext<'_>,
    link_meta: &ComponentMeta,
    target: &ComponentData,
    link_out: &mut ComponentData,
    previous_target: Option<&ComponentData>,
    previous_link: Option<&ComponentData>,
) -> Result<(), LinkError> {
    let target_meta = link_target_meta(ctx, link_meta)?;
    let pairs = field_pairs(link_meta, target_meta)?;
    check_size(target_meta, link_meta, target)?;
    let functions = module_functions(ctx, link_meta)?;

    let previous_link = previous_link.filter(|p| p.size() == link_meta.size);
    if let (Some(previous_target), Some(previous_link)) = (previous_target, previous_link) {
        if structurally_equal(target_meta, previous_target, target, ctx.assets) {
            *link_out = previous_link.clone();
            return Ok(());
        }
    }

    let mut staged = if link_out.size() == link_meta.size {
        link_out.clone()
    } else {
        link_meta.default.clone()
    };

    match functions.as_deref().and_then(|f| f.to_link.clone().map(|call| (f, call))) {
        Some((functions, to_link)) => {
            run_guarded(functions, link_meta, || to_link(target, &mut staged))?;
        }
        None => {
            for (link_field, target_field) in pairs {
                let value = read_field(target_field, target);
                let previous = previous_link.map(|p| read_field(link_field, p));
                let value = to_link_value(link_field, value, previous, ctx.assets);
                write_field(link_field, &mut staged, &value).map_err(|err| LinkError::IncompatibleLayout {
                    link: link_meta.name.clone(),
                    field: link_field.name.clone(),
                    reason: err.to_string(),
                })?;
            }
        }
    }

    *link_out = staged;
    Ok(())
}

/// Write a link value into `target_out`.
///
/// With `apply_modifier`, fields tagged `MODIFIER` are applied as the delta
/// between `link` and `previous_link` on top of `previous_target`, the
/// value captured when the gesture started. Target fields without a link
/// counterpart keep their current value.
pub fn convert_link_to_target(
    ctx: &LinkContext<'_>,
    link_meta: &ComponentMeta,
    link: &ComponentData,
    target_out: &mut ComponentData,
    previous_link: Option<&ComponentData>,
    previous_target: Option<&ComponentData>,
    apply_modifier: bool,
) -> Result<(), LinkError> {
    let target_meta = link_target_meta(ctx, link_meta)?;
    let pairs = field_pairs(link_meta, target_meta)?;
    check_size(link_meta, link_meta, link)?;
    let functions = module_functions(ctx, link_meta)?;

    let modifier_base = if apply_modifier {
        previous_link
            .filter(|p| p.size() == link_meta.size)
            .zip(previous_target.filter(|p| p.size() == target_meta.size))
    } else {
        None
    };

    let mut staged = if target_out.size() == target_meta.size {
        target_out.clone()
    } else {
        target_meta.default.clone()
    };

    match functions.as_deref().and_then(|f| f.to_target.clone().map(|call| (f, call))) {
        Some((functions, to_target)) => {
            run_guarded(functions, link_meta, || to_target(link, &mut staged))?;
        }
        None => {
            for (link_field, target_field) in pairs {
                let value = read_field(link_field, link);
                let value = match modifier_base {
                    Some((previous_link, baseline)) if link_field.is_modifier() => apply_delta(
                        target_field,
                        value,
                        read_field(link_field, previous_link),
                        read_field(target_field, baseline),
                        ctx.assets,
                    ),
                    _ => to_target_value(target_field, value, ctx.assets),
                };
                write_field(target_field, &mut staged, &value).map_err(|err| LinkError::IncompatibleLayout {
                    link: link_meta.name.clone(),
                    field: link_field.name.clone(),
                    reason: err.to_string(),
                })?;
            }
        }
    }

    if let (Some((previous_link, baseline)), Some(functions)) = (modifier_base, functions.as_deref()) {
        if let Some(apply) = functions.apply_modifier.clone() {
            let input = ModifierInput {
                link,
                previous_link,
                baseline_target: baseline,
            };
            run_guarded(functions, link_meta, || apply(&input, &mut staged))?;
        }
    }

    *target_out = staged;
    Ok(())
}

/// Whether the live target value differs from the cached copy, ignoring
/// editor-only fields and asset pointer bit patterns.
pub fn target_changed(
    ctx: &LinkContext<'_>,
    target_meta: &ComponentMeta,
    current: &ComponentData,
    cached: &ComponentData,
) -> bool {
    !structurally_equal(target_meta, current, cached, ctx.assets)
}
