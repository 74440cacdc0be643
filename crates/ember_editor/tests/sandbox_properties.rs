//! Cross-module behaviour of sandbox operations, builds and links.

use bytemuck::{Pod, Zeroable};
use ember_core::asset::{AssetHandle, AssetType, AssetTypedHandle};
use ember_core::ecs::{ComponentData, ComponentKind};
use ember_core::math::{quat_approx_eq, Quat, Vec3};
use ember_core::reflect::{read_field, write_field, ComponentMetaBuilder, FieldTags, FieldType, FieldValue};
use ember_editor::{
    BackgroundContext, BuildInput, BuildOutcome, BuildStatus, ConsoleLevel, DeleteStatus, EditorModule,
    EditorSettings, EditorState, SandboxIndex, Viewport,
};
use std::sync::mpsc;
use std::sync::Mutex;
use std::time::Duration;

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
struct Health {
    hp: u32,
    armor: u32,
}

fn editor() -> (EditorState, SandboxIndex) {
    let mut editor = EditorState::new(EditorSettings {
        worker_threads: 2,
        ..Default::default()
    })
    .unwrap();
    let sandbox = editor.create_sandbox("main").unwrap();
    (editor, sandbox)
}

fn set(editor: &EditorState, component: &str, data: &mut ComponentData, field: &str, value: FieldValue) {
    let meta = editor.registry().meta_by_name(component).unwrap();
    write_field(meta.field(field).unwrap(), data, &value).unwrap();
}

fn get(editor: &EditorState, component: &str, data: &ComponentData, field: &str) -> FieldValue {
    let meta = editor.registry().meta_by_name(component).unwrap();
    read_field(meta.field(field).unwrap(), data)
}

fn register_renderer(editor: &mut EditorState) -> AssetTypedHandle {
    editor
        .register_component(
            ComponentMetaBuilder::new("Renderer", ComponentKind::Unique)
                .field("mesh", FieldType::Asset(AssetType::Mesh))
                .field("material", FieldType::Asset(AssetType::Material)),
        )
        .unwrap();
    let mesh = editor.assets_mut().add_asset("rock.mesh", AssetType::Mesh);
    AssetTypedHandle::new(mesh, AssetType::Mesh)
}

#[test]
fn asset_references_follow_component_lifetime() {
    let (mut editor, sb) = editor();
    let mesh = register_renderer(&mut editor);

    let entity = editor.create_sandbox_entity(sb, Viewport::Scene).unwrap().unwrap();
    assert!(editor.add_sandbox_entity_component(sb, Viewport::Scene, entity, "Renderer").unwrap());
    let mut value = editor
        .sandbox_entity_component_data(sb, Viewport::Scene, entity, "Renderer")
        .unwrap()
        .unwrap();
    set(&editor, "Renderer", &mut value, "mesh", FieldValue::Asset(mesh.handle));
    editor
        .set_sandbox_entity_component_data(sb, Viewport::Scene, entity, "Renderer", &value)
        .unwrap();
    assert_eq!(editor.assets().sandbox_reference_count(mesh, sb), 1);

    let copies = editor.copy_sandbox_entity(sb, Viewport::Scene, entity, 3).unwrap();
    assert_eq!(copies.len(), 3);
    assert_eq!(editor.assets().sandbox_reference_count(mesh, sb), 4);
    let recomputed = editor.sandbox_assets_referenced(sb).unwrap();
    assert_eq!(recomputed.get(&mesh), Some(&4));

    for copy in copies {
        assert_eq!(editor.delete_sandbox_entity(sb, Viewport::Scene, copy).unwrap(), DeleteStatus::Deleted);
    }
    assert!(editor.remove_sandbox_entity_component(sb, Viewport::Scene, entity, "Renderer").unwrap());
    assert!(!editor.assets().is_loaded(mesh));

    // Removing twice is a no-op.
    assert!(!editor.remove_sandbox_entity_component(sb, Viewport::Scene, entity, "Renderer").unwrap());
}

#[test]
fn runtime_edits_do_not_touch_asset_counts() {
    let (mut editor, sb) = editor();
    let mesh = register_renderer(&mut editor);
    let entity = editor
        .create_sandbox_entity_with(sb, Viewport::Scene, &["Renderer"], &[])
        .unwrap()
        .unwrap();
    let mut value = editor
        .sandbox_entity_component_data(sb, Viewport::Scene, entity, "Renderer")
        .unwrap()
        .unwrap();
    set(&editor, "Renderer", &mut value, "mesh", FieldValue::Asset(mesh.handle));
    editor
        .set_sandbox_entity_component_data(sb, Viewport::Scene, entity, "Renderer", &value)
        .unwrap();

    editor.start_sandbox_runtime(sb).unwrap();
    editor.copy_sandbox_entity(sb, Viewport::Runtime, entity, 5).unwrap();
    assert!(editor.remove_sandbox_entity_component(sb, Viewport::Runtime, entity, "Renderer").unwrap());
    assert_eq!(editor.assets().sandbox_reference_count(mesh, sb), 1);
    editor.stop_sandbox_runtime(sb).unwrap();
    assert!(editor.create_sandbox_entity(sb, Viewport::Runtime).unwrap().is_none());
}

#[test]
fn reset_restores_defaults_and_rebalances_assets() {
    let (mut editor, sb) = editor();
    let mesh = register_renderer(&mut editor);
    editor
        .register_component(
            ComponentMetaBuilder::new("Armor", ComponentKind::Unique)
                .field("hp", FieldType::U32)
                .field("armor", FieldType::U32)
                .default_value("hp", FieldValue::U32(100)),
        )
        .unwrap();
    let entity = editor
        .create_sandbox_entity_with(sb, Viewport::Scene, &["Renderer", "Armor"], &[])
        .unwrap()
        .unwrap();

    let damaged = ComponentData::from_pod(&Health { hp: 12, armor: 3 });
    editor
        .set_sandbox_entity_component_data(sb, Viewport::Scene, entity, "Armor", &damaged)
        .unwrap();
    let mut renderer = editor
        .sandbox_entity_component_data(sb, Viewport::Scene, entity, "Renderer")
        .unwrap()
        .unwrap();
    set(&editor, "Renderer", &mut renderer, "mesh", FieldValue::Asset(mesh.handle));
    editor
        .set_sandbox_entity_component_data(sb, Viewport::Scene, entity, "Renderer", &renderer)
        .unwrap();

    assert!(editor.reset_sandbox_entity_component(sb, Viewport::Scene, entity, "Armor").unwrap());
    assert!(editor.reset_sandbox_entity_component(sb, Viewport::Scene, entity, "Renderer").unwrap());
    let armor = editor
        .sandbox_entity_component_data(sb, Viewport::Scene, entity, "Armor")
        .unwrap()
        .unwrap();
    assert_eq!(armor.read_pod::<Health>(), Some(Health { hp: 100, armor: 0 }));
    assert_eq!(editor.assets().sandbox_reference_count(mesh, sb), 0);
}

#[test]
fn shared_updates_are_idempotent_and_deduplicated() {
    let (mut editor, sb) = editor();
    editor
        .register_component(ComponentMetaBuilder::new("Team", ComponentKind::Shared).field("id", FieldType::U32))
        .unwrap();
    editor
        .register_component(
            ComponentMetaBuilder::new("TeamLink", ComponentKind::Unique)
                .field("id", FieldType::U32)
                .link_to("Team"),
        )
        .unwrap();
    let team = editor.component_id("Team").unwrap();

    let value = ComponentData::from_pod(&7u32);
    let first = editor
        .find_or_create_sandbox_shared_component_instance(sb, Viewport::Scene, "Team", &value)
        .unwrap()
        .unwrap();
    let second = editor
        .find_or_create_sandbox_shared_component_instance(sb, Viewport::Scene, "Team", &value)
        .unwrap()
        .unwrap();
    assert_eq!(first, second);

    let a = editor.create_sandbox_entity_with(sb, Viewport::Scene, &[], &["Team"]).unwrap().unwrap();
    let b = editor.create_sandbox_entity_with(sb, Viewport::Scene, &[], &["Team"]).unwrap().unwrap();
    let default_instance = editor
        .sandbox(sb)
        .unwrap()
        .entity_manager(Viewport::Scene)
        .unwrap()
        .entity_shared_instance(a, team)
        .unwrap();

    let link = ComponentData::from_pod(&7u32);
    for entity in [a, b] {
        assert!(editor
            .sandbox_update_shared_link_component_for_entity(sb, Viewport::Scene, entity, "TeamLink", &link, None, None, false)
            .unwrap());
        // Same value again changes nothing.
        assert!(!editor
            .sandbox_update_shared_link_component_for_entity(sb, Viewport::Scene, entity, "TeamLink", &link, None, None, false)
            .unwrap());
    }

    let manager = editor.sandbox(sb).unwrap().entity_manager(Viewport::Scene).unwrap();
    assert_eq!(manager.entity_shared_instance(a, team), Some(first));
    assert_eq!(manager.entity_shared_instance(b, team), Some(first));
    assert_eq!(manager.shared_instance_references(team, first), Some(2));
    // The default instance lost its last entity and was cleaned up.
    assert!(!manager.exists_shared_instance(team, default_instance));
}

#[test]
fn orphaned_shared_instances_are_unregistered() {
    let (mut editor, sb) = editor();
    editor
        .register_component(
            ComponentMetaBuilder::new("Material", ComponentKind::Shared).field("texture", FieldType::Asset(AssetType::Texture)),
        )
        .unwrap();
    let material = editor.component_id("Material").unwrap();
    let texture = editor.assets_mut().add_asset("bark.png", AssetType::Texture);
    let mut value = editor.registry().meta(material).unwrap().default.clone();
    set(&editor, "Material", &mut value, "texture", FieldValue::Asset(texture));
    let instance = editor
        .find_or_create_sandbox_shared_component_instance(sb, Viewport::Scene, "Material", &value)
        .unwrap()
        .unwrap();

    let a = editor.create_sandbox_entity(sb, Viewport::Scene).unwrap().unwrap();
    let b = editor.create_sandbox_entity(sb, Viewport::Scene).unwrap().unwrap();
    for entity in [a, b] {
        assert!(editor
            .add_sandbox_entity_shared_component(sb, Viewport::Scene, entity, "Material", Some(instance))
            .unwrap());
    }
    let asset = AssetTypedHandle::new(texture, AssetType::Texture);
    assert_eq!(editor.assets().sandbox_reference_count(asset, sb), 2);

    assert!(editor.remove_sandbox_entity_shared_component(sb, Viewport::Scene, a, "Material").unwrap());
    let manager = editor.sandbox(sb).unwrap().entity_manager(Viewport::Scene).unwrap();
    assert!(manager.exists_shared_instance(material, instance));

    assert_eq!(editor.delete_sandbox_entity(sb, Viewport::Scene, b).unwrap(), DeleteStatus::Deleted);
    let manager = editor.sandbox(sb).unwrap().entity_manager(Viewport::Scene).unwrap();
    assert!(!manager.exists_shared_instance(material, instance));
    assert!(!editor.assets().is_loaded(asset));
}

#[test]
fn delete_waits_for_background_builds() {
    let (mut editor, sb) = editor();
    let baked = editor
        .register_component(ComponentMetaBuilder::new("Baked", ComponentKind::Unique).field("v", FieldType::U32))
        .unwrap();
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let release_rx = Mutex::new(Some(release_rx));
    editor.register_module(EditorModule::new("bake").with_build_function(baked, vec![], move |_| {
        let Some(rx) = release_rx.lock().unwrap().take() else {
            return BuildOutcome::Unchanged;
        };
        BuildOutcome::Deferred(Box::new(move |_: BuildInput, _: &BackgroundContext| {
            rx.recv_timeout(Duration::from_secs(5)).ok();
            ComponentData::from_pod(&1u32)
        }))
    }));
    editor.load_module("bake").unwrap();

    let entity = editor.create_sandbox_entity(sb, Viewport::Scene).unwrap().unwrap();
    editor.add_sandbox_entity_component(sb, Viewport::Scene, entity, "Baked").unwrap();
    assert_eq!(editor.sandbox_background_build_count(sb), 1);
    assert!(matches!(editor.unload_module("bake"), Err(ember_editor::EditorError::ModuleLocked { .. })));
    // Locked while the build runs.
    assert!(!editor.remove_sandbox_entity_component(sb, Viewport::Scene, entity, "Baked").unwrap());

    assert_eq!(editor.delete_sandbox_entity(sb, Viewport::Scene, entity).unwrap(), DeleteStatus::Deferred);
    editor.process_events();
    assert!(editor
        .sandbox(sb)
        .unwrap()
        .entity_manager(Viewport::Scene)
        .unwrap()
        .exists_entity(entity));

    release_tx.send(()).unwrap();
    assert!(editor.pump_until_idle(Duration::from_secs(5)));
    let sandbox = editor.sandbox(sb).unwrap();
    assert!(!sandbox.entity_manager(Viewport::Scene).unwrap().exists_entity(entity));
    assert!(sandbox.locked_components().is_empty());
}

#[test]
fn link_round_trip_through_sandbox() {
    let (mut editor, sb) = editor();
    editor
        .register_component(
            ComponentMetaBuilder::new("Light", ComponentKind::Unique)
                .field("color", FieldType::Vec3)
                .field("intensity", FieldType::F32)
                .field("cookie", FieldType::AssetPointer(AssetType::Texture)),
        )
        .unwrap();
    editor
        .register_component(
            ComponentMetaBuilder::new("LightLink", ComponentKind::Unique)
                .field("color", FieldType::Vec3)
                .field("intensity", FieldType::F32)
                .field("cookie", FieldType::Asset(AssetType::Texture))
                .link_to("Light"),
        )
        .unwrap();
    let cookie = editor.assets_mut().add_asset("cookie.png", AssetType::Texture);
    let entity = editor
        .create_sandbox_entity_with(sb, Viewport::Scene, &["Light"], &[])
        .unwrap()
        .unwrap();

    let mut link = editor
        .convert_sandbox_target_to_link_component(sb, Viewport::Scene, entity, "LightLink", None)
        .unwrap()
        .unwrap();
    set(&editor, "LightLink", &mut link, "color", FieldValue::Vec3(Vec3::new(1.0, 0.5, 0.25)));
    set(&editor, "LightLink", &mut link, "intensity", FieldValue::F32(3.0));
    set(&editor, "LightLink", &mut link, "cookie", FieldValue::Asset(cookie));
    assert!(editor
        .convert_sandbox_link_component_to_target(sb, Viewport::Scene, entity, "LightLink", &link, None, None, false)
        .unwrap());

    let target = editor
        .sandbox_entity_component_data(sb, Viewport::Scene, entity, "Light")
        .unwrap()
        .unwrap();
    assert!(matches!(get(&editor, "Light", &target, "cookie"), FieldValue::AssetPointer(p) if p != 0));
    let back = editor
        .convert_sandbox_target_to_link_component(sb, Viewport::Scene, entity, "LightLink", None)
        .unwrap()
        .unwrap();
    assert_eq!(back, link);
    // The pointer field resolves to a referenced asset.
    let asset = AssetTypedHandle::new(cookie, AssetType::Texture);
    assert_eq!(editor.assets().sandbox_reference_count(asset, sb), 1);
    assert_ne!(cookie, AssetHandle::INVALID);
}

#[test]
fn modifier_applies_three_steps_against_one_baseline() {
    let (mut editor, sb) = editor();
    editor
        .register_component(ComponentMetaBuilder::new("Transform", ComponentKind::Unique).field("rotation", FieldType::Quat))
        .unwrap();
    editor
        .register_component(
            ComponentMetaBuilder::new("TransformLink", ComponentKind::Unique)
                .field_with("rotation", FieldType::Vec3, FieldTags::MODIFIER)
                .link_to("Transform"),
        )
        .unwrap();
    let entity = editor
        .create_sandbox_entity_with(sb, Viewport::Scene, &["Transform"], &[])
        .unwrap()
        .unwrap();
    let start = Quat::from_rotation_y(0.4);
    let mut target = editor
        .sandbox_entity_component_data(sb, Viewport::Scene, entity, "Transform")
        .unwrap()
        .unwrap();
    set(&editor, "Transform", &mut target, "rotation", FieldValue::Quat(start));
    editor
        .set_sandbox_entity_component_data(sb, Viewport::Scene, entity, "Transform", &target)
        .unwrap();

    let baseline = target.clone();
    let gesture_start = editor
        .convert_sandbox_target_to_link_component(sb, Viewport::Scene, entity, "TransformLink", None)
        .unwrap()
        .unwrap();
    let FieldValue::Vec3(start_euler) = get(&editor, "TransformLink", &gesture_start, "rotation") else {
        panic!("link rotation is not a vector");
    };
    for step in 1..=3 {
        let mut link = gesture_start.clone();
        let euler = start_euler + Vec3::new(10.0 * step as f32, 0.0, 0.0);
        set(&editor, "TransformLink", &mut link, "rotation", FieldValue::Vec3(euler));
        editor
            .convert_sandbox_link_component_to_target(
                sb,
                Viewport::Scene,
                entity,
                "TransformLink",
                &link,
                Some(&gesture_start),
                Some(&baseline),
                true,
            )
            .unwrap();
    }

    let result = editor
        .sandbox_entity_component_data(sb, Viewport::Scene, entity, "Transform")
        .unwrap()
        .unwrap();
    let FieldValue::Quat(rotation) = get(&editor, "Transform", &result, "rotation") else {
        panic!("target rotation is not a quaternion");
    };
    assert!(quat_approx_eq(rotation, start * Quat::from_rotation_x(30f32.to_radians()), 1e-5));
}

#[test]
fn crashing_builds_are_isolated_and_sticky() {
    let (mut editor, sb) = editor();
    let source = editor
        .register_component(ComponentMetaBuilder::new("Source", ComponentKind::Unique).field("v", FieldType::U32))
        .unwrap();
    let derived = editor
        .register_component(ComponentMetaBuilder::new("Derived", ComponentKind::Unique).field("v", FieldType::U32))
        .unwrap();
    let baked = editor
        .register_component(ComponentMetaBuilder::new("Baked", ComponentKind::Unique).field("v", FieldType::U32))
        .unwrap();
    editor.register_module(
        EditorModule::new("buggy")
            .with_build_function(derived, vec![source], |_| panic!("derived build exploded"))
            .with_build_function(baked, vec![], |_| {
                BuildOutcome::Deferred(Box::new(|_: BuildInput, ctx: &BackgroundContext| -> ComponentData {
                    let _gpu = ctx.lock_gpu();
                    panic!("baking exploded while holding the gpu");
                }))
            }),
    );
    editor.load_module("buggy").unwrap();

    let entity = editor
        .create_sandbox_entity_with(sb, Viewport::Scene, &["Source", "Derived"], &[])
        .unwrap()
        .unwrap();
    let entry = editor.module("buggy").unwrap().build_entry(derived).unwrap().clone();
    assert!(entry.has_crashed());
    assert!(editor.console().count(ConsoleLevel::Error) >= 1);
    assert!(editor
        .console()
        .messages()
        .iter()
        .any(|m| m.text.contains("main") && m.text.contains("Derived")));

    // The manager is intact and the entry is skipped from now on.
    assert!(editor
        .sandbox_entity_component_data(sb, Viewport::Scene, entity, "Derived")
        .unwrap()
        .is_some());
    assert_eq!(
        editor
            .call_sandbox_component_build_function(sb, Viewport::Scene, entity, derived)
            .unwrap(),
        BuildStatus::Skipped
    );
    let warnings = editor.console().count(ConsoleLevel::Warning);
    editor
        .set_sandbox_entity_component_data(sb, Viewport::Scene, entity, "Source", &ComponentData::from_pod(&5u32))
        .unwrap();
    editor
        .set_sandbox_entity_component_data(sb, Viewport::Scene, entity, "Source", &ComponentData::from_pod(&6u32))
        .unwrap();
    assert_eq!(editor.console().count(ConsoleLevel::Warning), warnings);

    // A background crash releases every lock it held.
    editor.add_sandbox_entity_component(sb, Viewport::Scene, entity, "Baked").unwrap();
    assert!(editor.pump_until_idle(Duration::from_secs(5)));
    let baked_entry = editor.module("buggy").unwrap().build_entry(baked).unwrap().clone();
    assert!(baked_entry.has_crashed());
    assert!(!editor.gpu_lock().is_locked());
    assert!(editor.sandbox(sb).unwrap().locked_components().is_empty());
    assert_eq!(editor.module("buggy").unwrap().lock_count(), 0);

    // Reloading the module starts over.
    editor.reload_module(EditorModule::new("buggy")).unwrap();
    assert!(editor.module("buggy").unwrap().build_entry(derived).is_none());
}
