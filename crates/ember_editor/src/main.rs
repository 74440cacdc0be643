//! Ember Editor
//!
//! Headless editor session: builds a sandbox, edits a few entities and logs
//! what the editor state ends up with.

use anyhow::{Context, Result};
use ember_core::asset::{AssetType, AssetTypedHandle};
use ember_core::ecs::{ComponentData, ComponentKind};
use ember_core::reflect::{write_field, ComponentMetaBuilder, FieldTags, FieldType, FieldValue};
use ember_editor::{BuildOutcome, EditorModule, EditorSettings, EditorState, InspectorEntityData, InspectorTarget, Viewport};
use glam::Vec3;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    let settings_path = std::env::args()
        .nth(1)
        .map_or_else(|| PathBuf::from("ember_settings.json"), PathBuf::from);
    let settings = EditorSettings::load(&settings_path)
        .with_context(|| format!("loading {}", settings_path.display()))?;

    // Initialize logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&settings.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    tracing::info!("Ember Editor v{}", ember_editor::VERSION);

    let mut editor = EditorState::new(settings).context("creating editor state")?;
    let sandbox = editor.create_sandbox("main").context("creating sandbox")?;

    editor.register_component(
        ComponentMetaBuilder::new("Transform", ComponentKind::Unique)
            .field("rotation", FieldType::Quat)
            .field("scale", FieldType::F32),
    )?;
    editor.register_component(
        ComponentMetaBuilder::new("TransformLink", ComponentKind::Unique)
            .field_with("rotation", FieldType::Vec3, FieldTags::MODIFIER)
            .field_with("scale", FieldType::F32, FieldTags::MODIFIER)
            .link_to("Transform"),
    )?;
    editor.register_component(
        ComponentMetaBuilder::new("Renderer", ComponentKind::Shared)
            .field("mesh", FieldType::Asset(AssetType::Mesh))
            .field("lod_bias", FieldType::F32),
    )?;
    let bounds = editor.register_component(
        ComponentMetaBuilder::new("Bounds", ComponentKind::Unique)
            .field("radius", FieldType::F32)
            .module("geometry"),
    )?;
    let transform = editor.component_id("Transform")?;

    editor.register_module(EditorModule::new("geometry").with_build_function(bounds, vec![transform], move |input| {
        let scale = input
            .dependency(transform)
            .and_then(|data| data.bytes.get(16..20))
            .and_then(|bytes| bytes.try_into().ok())
            .map_or(1.0, f32::from_le_bytes);
        BuildOutcome::Done(ComponentData::from_pod(&scale.abs()))
    }));
    editor.load_module("geometry")?;

    let rock = editor.assets_mut().add_asset("rock.mesh", AssetType::Mesh);
    let renderer_meta = editor
        .registry()
        .meta_by_name("Renderer")
        .cloned()
        .context("renderer component missing")?;
    let mut rock_renderer = renderer_meta.default.clone();
    if let Some(field) = renderer_meta.field("mesh") {
        write_field(field, &mut rock_renderer, &FieldValue::Asset(rock))?;
    }
    let rock_instance = editor
        .find_or_create_sandbox_shared_component_instance(sandbox, Viewport::Scene, "Renderer", &rock_renderer)?
        .context("scene has no entity manager")?;

    let entity = editor
        .create_sandbox_entity_with(sandbox, Viewport::Scene, &["Transform", "Bounds"], &[])?
        .context("scene has no entity manager")?;
    editor.add_sandbox_entity_shared_component(sandbox, Viewport::Scene, entity, "Renderer", Some(rock_instance))?;
    let copies = editor.copy_sandbox_entity(sandbox, Viewport::Scene, entity, 3)?;
    tracing::info!(%entity, copies = copies.len(), "entities created");

    let mut panel = InspectorEntityData::new(sandbox, Viewport::Scene);
    panel.set_target(Some(InspectorTarget::Entity(entity)));
    panel.update_frame(&mut editor);
    panel.begin_modifier_gesture(&editor, "TransformLink");
    for step in 1..=3 {
        let euler = Vec3::new(0.0, 15.0 * step as f32, 0.0);
        panel.set_field_value(&mut editor, "TransformLink", "rotation", FieldValue::Vec3(euler))?;
        panel.set_field_value(&mut editor, "TransformLink", "scale", FieldValue::F32(0.5 * step as f32))?;
        panel.refresh_modifier_gesture(&editor, "TransformLink");
        panel.update_frame(&mut editor);
    }
    panel.update_frame(&mut editor);

    let radius = editor
        .sandbox_entity_component_data(sandbox, Viewport::Scene, entity, "Bounds")?
        .and_then(|data| data.read_pod::<f32>());
    tracing::info!(?radius, "bounds rebuilt from transform");

    for copy in &copies {
        editor.delete_sandbox_entity(sandbox, Viewport::Scene, *copy)?;
    }
    if !editor.pump_until_idle(Duration::from_secs(5)) {
        tracing::warn!("background work still pending");
    }

    let rock_asset = AssetTypedHandle::new(rock, AssetType::Mesh);
    tracing::info!(
        references = editor.assets().reference_count(rock_asset),
        dirty = editor.sandbox(sandbox)?.is_dirty(),
        "session finished"
    );
    for message in editor.console().messages() {
        tracing::info!(level = ?message.level, "{}", message.text);
    }

    Ok(())
}
