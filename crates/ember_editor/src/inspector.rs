// inspector.rs - Per-panel inspector state
//
// An inspector panel shows the components of one entity (or one global
// component) and keeps widget state that must survive archetype moves,
// shared instance changes and scene/runtime swaps. Drawing happens
// elsewhere; this is the bookkeeping the drawer reads and writes.

use crate::editor::EditorState;
use crate::link::{convert_link_to_target, convert_target_to_link, link_target_meta, target_changed};
use crate::sandbox::{SandboxIndex, Viewport};
use crate::EditorError;
use ember_core::ecs::{ComponentData, ComponentId, ComponentKind, Entity, EntityLoc, EntityManager, SharedInstance};
use ember_core::reflect::{read_field, write_field, ComponentMeta, FieldType, FieldValue};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, trace};

/// What an inspector panel is pointed at.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum InspectorTarget {
    Entity(Entity),
    Global(ComponentId),
}

/// Something `update_frame` did, for the drawer to react to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameEvent {
    /// The runtime world was created or torn down; every binding was reset.
    SourceChanged,
    /// The inspected entity or global component no longer exists.
    TargetGone,
    Dropped(ComponentId),
    Rebound(ComponentId),
    GestureFinalized(ComponentId),
    LinkRegenerated(ComponentId),
    Tracked(ComponentId),
}

/// Where a tracked component's storage lived last frame.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
struct Binding {
    location: Option<EntityLoc>,
    epoch: Option<u64>,
    instance: Option<SharedInstance>,
}

#[derive(Debug, Clone)]
struct CreatedInstance {
    kind: ComponentKind,
    binding: Binding,
    /// Value the widgets show. For shared components this is a private
    /// copy; edits reach the entity through instance reassignment.
    value: ComponentData,
}

/// Editable text backing a buffer field, kept apart from component storage
/// so typing is not lost when the storage moves.
#[derive(Debug, Clone, Default)]
struct MatchingInput {
    text: String,
    dirty: bool,
}

#[derive(Debug, Clone)]
struct ModifierGesture {
    start_link: ComponentData,
    baseline_target: ComponentData,
    refreshed: bool,
}

#[derive(Debug, Clone)]
struct LinkShadow {
    target: ComponentId,
    data: ComponentData,
    previous_data: ComponentData,
    target_copy: ComponentData,
    gesture: Option<ModifierGesture>,
    is_ui_change_triggered: bool,
}

/// Inspector state for one panel.
#[derive(Debug)]
pub struct InspectorEntityData {
    sandbox: SandboxIndex,
    viewport: Viewport,
    target: Option<InspectorTarget>,
    session: u64,
    created_instances: BTreeMap<ComponentId, CreatedInstance>,
    matching_inputs: HashMap<(ComponentId, usize), MatchingInput>,
    link_components: BTreeMap<ComponentId, LinkShadow>,
}

fn text_of(value: &FieldValue) -> String {
    match value {
        FieldValue::Buffer(bytes) => String::from_utf8_lossy(bytes).into_owned(),
        _ => String::new(),
    }
}

impl InspectorEntityData {
    pub fn new(sandbox: SandboxIndex, viewport: Viewport) -> Self {
        Self {
            sandbox,
            viewport,
            target: None,
            session: 0,
            created_instances: BTreeMap::new(),
            matching_inputs: HashMap::new(),
            link_components: BTreeMap::new(),
        }
    }

    pub fn target(&self) -> Option<InspectorTarget> {
        self.target
    }

    pub fn viewport(&self) -> Viewport {
        self.viewport
    }

    /// Point the panel at something else. All cached state is dropped.
    pub fn set_target(&mut self, target: Option<InspectorTarget>) {
        if self.target != target {
            self.clear();
            self.target = target;
        }
    }

    pub fn set_viewport(&mut self, viewport: Viewport) {
        if self.viewport != viewport {
            self.clear();
            self.viewport = viewport;
        }
    }

    pub fn clear(&mut self) {
        self.created_instances.clear();
        self.matching_inputs.clear();
        self.link_components.clear();
    }

    /// Components currently shown, links included.
    pub fn tracked_components(&self) -> Vec<ComponentId> {
        self.created_instances
            .keys()
            .chain(self.link_components.keys())
            .copied()
            .collect()
    }

    pub fn is_tracking(&self, component: ComponentId) -> bool {
        self.created_instances.contains_key(&component) || self.link_components.contains_key(&component)
    }

    pub fn has_modifier_gesture(&self, link: ComponentId) -> bool {
        self.link_components
            .get(&link)
            .map_or(false, |shadow| shadow.gesture.is_some())
    }

    fn entity(&self) -> Option<Entity> {
        match self.target? {
            InspectorTarget::Entity(entity) => Some(entity),
            InspectorTarget::Global(_) => None,
        }
    }

    fn drop_component(&mut self, component: ComponentId) {
        self.created_instances.remove(&component);
        self.link_components.remove(&component);
        self.matching_inputs.retain(|(id, _), _| *id != component);
    }

    fn refresh_inputs(&mut self, meta: &ComponentMeta, value: &ComponentData) {
        for field in meta.fields.iter().filter(|f| f.is_buffer()) {
            let input = self.matching_inputs.entry((meta.id, field.offset)).or_default();
            if !input.dirty {
                input.text = text_of(&read_field(field, value));
            }
        }
    }

    fn live_value(&self, manager: &EntityManager, component: ComponentId, kind: ComponentKind) -> Option<ComponentData> {
        match (kind, self.target?) {
            (ComponentKind::Global, _) => manager.global_value(component),
            (ComponentKind::Unique, InspectorTarget::Entity(entity)) => manager.component_value(entity, component),
            (ComponentKind::Shared, InspectorTarget::Entity(entity)) => {
                let instance = manager.entity_shared_instance(entity, component)?;
                manager.shared_value(component, instance)
            }
            _ => None,
        }
    }

    fn binding(&self, manager: &EntityManager, component: ComponentId, kind: ComponentKind) -> Binding {
        let entity = self.entity();
        let (epoch, instance) = match kind {
            ComponentKind::Unique => (manager.component_allocator(component).map(|a| a.epoch()), None),
            ComponentKind::Shared => (
                manager.shared_component_allocator(component).map(|a| a.epoch()),
                entity.and_then(|e| manager.entity_shared_instance(e, component)),
            ),
            ComponentKind::Global => (manager.global_component_allocator(component).map(|a| a.epoch()), None),
        };
        Binding {
            location: entity.and_then(|e| manager.entity_location(e)),
            epoch,
            instance,
        }
    }

    fn present(&self, manager: &EntityManager, component: ComponentId, kind: ComponentKind) -> bool {
        match (kind, self.target) {
            (ComponentKind::Global, _) => manager.exists_global_component(component),
            (ComponentKind::Unique, Some(InspectorTarget::Entity(e))) => manager.has_component(e, component),
            (ComponentKind::Shared, Some(InspectorTarget::Entity(e))) => manager.has_shared_component(e, component),
            _ => false,
        }
    }

    /// Start showing a component. Targets with a link type are shown through
    /// their link. Returns false when the component is not on the target.
    pub fn track_component(&mut self, editor: &EditorState, component: &str) -> Result<bool, EditorError> {
        let meta = editor
            .registry
            .meta_by_name(component)
            .ok_or_else(|| EditorError::UnknownComponent(component.to_string()))?;
        let Some(manager) = editor.manager(self.sandbox, self.viewport)? else {
            return Ok(false);
        };
        let link = if meta.is_link() {
            Some(meta)
        } else {
            editor.registry.link_of_target(meta.id).and_then(|id| editor.registry.meta(id))
        };
        if let Some(link_meta) = link {
            return self.track_link(editor, manager, link_meta);
        }
        if self.created_instances.contains_key(&meta.id) || !self.present(manager, meta.id, meta.kind) {
            return Ok(false);
        }
        let Some(value) = self.live_value(manager, meta.id, meta.kind) else {
            return Ok(false);
        };
        let binding = self.binding(manager, meta.id, meta.kind);
        self.refresh_inputs(meta, &value);
        self.created_instances.insert(
            meta.id,
            CreatedInstance {
                kind: meta.kind,
                binding,
                value,
            },
        );
        trace!(component = %meta.name, "inspector tracking component");
        Ok(true)
    }

    fn track_link(&mut self, editor: &EditorState, manager: &EntityManager, link_meta: &ComponentMeta) -> Result<bool, EditorError> {
        if self.link_components.contains_key(&link_meta.id) {
            return Ok(false);
        }
        let ctx = editor.link_context();
        let target_meta = link_target_meta(&ctx, link_meta)?;
        if !self.present(manager, target_meta.id, target_meta.kind) {
            return Ok(false);
        }
        let Some(target) = self.live_value(manager, target_meta.id, target_meta.kind) else {
            return Ok(false);
        };
        let mut data = link_meta.default.clone();
        convert_target_to_link(&ctx, link_meta, &target, &mut data, None, None)?;
        self.refresh_inputs(link_meta, &data);
        self.link_components.insert(
            link_meta.id,
            LinkShadow {
                target: target_meta.id,
                previous_data: data.clone(),
                data,
                target_copy: target,
                gesture: None,
                is_ui_change_triggered: false,
            },
        );
        Ok(true)
    }

    /// Advance the panel by one frame against the live sandbox.
    pub fn update_frame(&mut self, editor: &mut EditorState) -> Vec<FrameEvent> {
        let mut events = Vec::new();
        let Ok(sandbox) = editor.sandbox(self.sandbox) else {
            self.clear();
            self.target = None;
            events.push(FrameEvent::TargetGone);
            return events;
        };

        // Runtime buffers die with the runtime world.
        let session = sandbox.runtime_session();
        if session != self.session {
            self.session = session;
            if self.viewport == Viewport::Runtime {
                self.clear();
                events.push(FrameEvent::SourceChanged);
            }
        }

        let Some(target) = self.target else {
            return events;
        };
        let exists = match (sandbox.entity_manager(self.viewport), target) {
            (Some(manager), InspectorTarget::Entity(entity)) => manager.exists_entity(entity),
            (Some(manager), InspectorTarget::Global(component)) => manager.exists_global_component(component),
            (None, _) => false,
        };
        if !exists {
            debug!(?target, "inspected target is gone");
            self.clear();
            self.target = None;
            events.push(FrameEvent::TargetGone);
            return events;
        }

        self.drop_vanished_types(editor, &mut events);
        self.drop_removed_components(editor, &mut events);
        self.rebind(editor, &mut events);
        self.finalize_gestures(&mut events);
        self.regenerate_links(editor, &mut events);
        self.track_untracked(editor, &mut events);
        events
    }

    fn drop_vanished_types(&mut self, editor: &EditorState, events: &mut Vec<FrameEvent>) {
        let vanished: Vec<ComponentId> = self
            .created_instances
            .keys()
            .copied()
            .filter(|id| !editor.registry.contains(*id))
            .chain(
                self.link_components
                    .iter()
                    .filter(|(id, shadow)| !editor.registry.contains(**id) || !editor.registry.contains(shadow.target))
                    .map(|(id, _)| *id),
            )
            .collect();
        for component in vanished {
            self.drop_component(component);
            events.push(FrameEvent::Dropped(component));
        }
    }

    fn drop_removed_components(&mut self, editor: &EditorState, events: &mut Vec<FrameEvent>) {
        let Ok(Some(manager)) = editor.manager(self.sandbox, self.viewport) else {
            return;
        };
        let mut removed: Vec<ComponentId> = self
            .created_instances
            .iter()
            .filter(|(id, instance)| !self.present(manager, **id, instance.kind))
            .map(|(id, _)| *id)
            .collect();
        for (link, shadow) in &self.link_components {
            let kind = editor.registry.meta(shadow.target).map(|m| m.kind);
            if kind.map_or(true, |kind| !self.present(manager, shadow.target, kind)) {
                removed.push(*link);
            }
        }
        for component in removed {
            self.drop_component(component);
            events.push(FrameEvent::Dropped(component));
        }
    }

    fn rebind(&mut self, editor: &EditorState, events: &mut Vec<FrameEvent>) {
        let Ok(Some(manager)) = editor.manager(self.sandbox, self.viewport) else {
            return;
        };
        let ids: Vec<ComponentId> = self.created_instances.keys().copied().collect();
        for component in ids {
            let Some(meta) = editor.registry.meta(component) else {
                continue;
            };
            let binding = self.binding(manager, component, meta.kind);
            let Some(value) = self.live_value(manager, component, meta.kind) else {
                continue;
            };
            let Some(instance) = self.created_instances.get_mut(&component) else {
                continue;
            };
            let moved = instance.binding != binding;
            instance.binding = binding;
            instance.value = value.clone();
            if moved {
                events.push(FrameEvent::Rebound(component));
            }
            self.refresh_inputs(meta, &value);
        }
    }

    fn finalize_gestures(&mut self, events: &mut Vec<FrameEvent>) {
        for (link, shadow) in &mut self.link_components {
            let Some(gesture) = shadow.gesture.as_mut() else {
                continue;
            };
            if gesture.refreshed {
                gesture.refreshed = false;
                continue;
            }
            // Mouse released: the baseline is no longer needed.
            shadow.gesture = None;
            shadow.previous_data = shadow.data.clone();
            events.push(FrameEvent::GestureFinalized(*link));
        }
    }

    fn regenerate_links(&mut self, editor: &EditorState, events: &mut Vec<FrameEvent>) {
        let Ok(Some(manager)) = editor.manager(self.sandbox, self.viewport) else {
            return;
        };
        let ctx = editor.link_context();
        let links: Vec<ComponentId> = self.link_components.keys().copied().collect();
        for link in links {
            let (Some(link_meta), Some(shadow)) = (editor.registry.meta(link), self.link_components.get(&link)) else {
                continue;
            };
            let Some(target_meta) = editor.registry.meta(shadow.target) else {
                continue;
            };
            let Some(live) = self.live_value(manager, target_meta.id, target_meta.kind) else {
                continue;
            };
            let Some(shadow) = self.link_components.get_mut(&link) else {
                continue;
            };
            if shadow.is_ui_change_triggered {
                shadow.is_ui_change_triggered = false;
                shadow.target_copy = live;
                continue;
            }
            if !target_changed(&ctx, target_meta, &live, &shadow.target_copy) {
                continue;
            }
            let mut data = shadow.data.clone();
            let converted = convert_target_to_link(
                &ctx,
                link_meta,
                &live,
                &mut data,
                Some(&shadow.target_copy),
                Some(&shadow.data),
            );
            if converted.is_err() {
                continue;
            }
            shadow.previous_data = data.clone();
            shadow.data = data.clone();
            shadow.target_copy = live;
            self.refresh_inputs(link_meta, &data);
            events.push(FrameEvent::LinkRegenerated(link));
        }
    }

    fn track_untracked(&mut self, editor: &EditorState, events: &mut Vec<FrameEvent>) {
        let Ok(Some(manager)) = editor.manager(self.sandbox, self.viewport) else {
            return;
        };
        let candidates: Vec<ComponentId> = match self.target {
            Some(InspectorTarget::Entity(entity)) => {
                let mut ids = manager.entity_signature(entity).unwrap_or_default();
                ids.extend(
                    manager
                        .entity_shared_signature(entity)
                        .unwrap_or_default()
                        .into_iter()
                        .map(|(id, _)| id),
                );
                ids
            }
            Some(InspectorTarget::Global(component)) => vec![component],
            None => Vec::new(),
        };
        for component in candidates {
            let shown_by_link = self.link_components.values().any(|s| s.target == component);
            if shown_by_link || self.created_instances.contains_key(&component) {
                continue;
            }
            let Some(meta) = editor.registry.meta(component) else {
                continue;
            };
            let name = meta.name.clone();
            if let Ok(true) = self.track_component(editor, &name) {
                let shown = editor.registry.link_of_target(component).unwrap_or(component);
                events.push(FrameEvent::Tracked(shown));
            }
        }
    }

    // ------------------------------------------------------------------
    // UI-facing edits
    // ------------------------------------------------------------------

    /// Value a widget shows for `field` of `component` (link or plain).
    pub fn field_value(&self, editor: &EditorState, component: &str, field: &str) -> Option<FieldValue> {
        let meta = editor.registry.meta_by_name(component)?;
        let field = meta.field(field)?;
        let data = match self.link_components.get(&meta.id) {
            Some(shadow) => &shadow.data,
            None => &self.created_instances.get(&meta.id)?.value,
        };
        Some(read_field(field, data))
    }

    /// Edit a field from a widget and write it to the sandbox.
    pub fn set_field_value(
        &mut self,
        editor: &mut EditorState,
        component: &str,
        field: &str,
        value: FieldValue,
    ) -> Result<bool, EditorError> {
        let meta = editor
            .registry
            .meta_by_name(component)
            .cloned()
            .ok_or_else(|| EditorError::UnknownComponent(component.to_string()))?;
        let field_meta = meta
            .field(field)
            .ok_or_else(|| ember_core::reflect::RegistryError::UnknownField {
                component: component.to_string(),
                field: field.to_string(),
            })?
            .clone();
        let Some(target) = self.target else {
            return Ok(false);
        };

        if self.link_components.contains_key(&meta.id) {
            return self.set_link_field(editor, &meta, &field_meta, &value, target);
        }

        let Some(instance) = self.created_instances.get(&meta.id) else {
            return Ok(false);
        };
        let mut data = instance.value.clone();
        write_field(&field_meta, &mut data, &value)?;
        let written = match (meta.kind, target) {
            (ComponentKind::Global, _) => {
                editor.set_sandbox_global_component_data(self.sandbox, self.viewport, component, &data)?
            }
            (_, InspectorTarget::Entity(entity)) => {
                editor.set_sandbox_entity_component_data(self.sandbox, self.viewport, entity, component, &data)?
            }
            (_, InspectorTarget::Global(_)) => false,
        };
        if written {
            if let Some(instance) = self.created_instances.get_mut(&meta.id) {
                instance.value = data;
            }
        }
        Ok(written)
    }

    fn set_link_field(
        &mut self,
        editor: &mut EditorState,
        link_meta: &ComponentMeta,
        field: &ember_core::reflect::FieldMeta,
        value: &FieldValue,
        target: InspectorTarget,
    ) -> Result<bool, EditorError> {
        let Some(shadow) = self.link_components.get(&link_meta.id) else {
            return Ok(false);
        };
        let mut data = shadow.data.clone();
        write_field(field, &mut data, value)?;
        let (previous_link, previous_target, apply_modifier) = match &shadow.gesture {
            Some(gesture) => (gesture.start_link.clone(), gesture.baseline_target.clone(), true),
            None => (shadow.previous_data.clone(), shadow.target_copy.clone(), false),
        };
        let target_component = shadow.target;

        let written = match target {
            InspectorTarget::Entity(entity) => editor.convert_sandbox_link_component_to_target(
                self.sandbox,
                self.viewport,
                entity,
                &link_meta.name,
                &data,
                Some(&previous_link),
                Some(&previous_target),
                apply_modifier,
            )?,
            InspectorTarget::Global(_) => {
                let target_name = editor.component_name(target_component);
                let Some(mut staged) = editor.sandbox_global_component_data(self.sandbox, self.viewport, &target_name)?
                else {
                    return Ok(false);
                };
                convert_link_to_target(
                    &editor.link_context(),
                    link_meta,
                    &data,
                    &mut staged,
                    Some(&previous_link),
                    Some(&previous_target),
                    apply_modifier,
                )?;
                editor.set_sandbox_global_component_data(self.sandbox, self.viewport, &target_name, &staged)?
            }
        };

        let live = match editor.manager(self.sandbox, self.viewport)? {
            Some(manager) => editor
                .registry
                .meta(target_component)
                .and_then(|m| self.live_value(manager, target_component, m.kind)),
            None => None,
        };
        if let Some(shadow) = self.link_components.get_mut(&link_meta.id) {
            shadow.data = data;
            if shadow.gesture.is_none() {
                shadow.previous_data = shadow.data.clone();
            }
            if let Some(live) = live {
                shadow.target_copy = live;
            }
            shadow.is_ui_change_triggered = true;
        }
        Ok(written)
    }

    /// Type into a buffer field without committing it.
    pub fn edit_text(&mut self, editor: &EditorState, component: &str, field: &str, text: &str) -> bool {
        let Some(meta) = editor.registry.meta_by_name(component) else {
            return false;
        };
        let Some(field) = meta.field(field).filter(|f| f.ty == FieldType::Buffer) else {
            return false;
        };
        if !self.is_tracking(meta.id) {
            return false;
        }
        let input = self.matching_inputs.entry((meta.id, field.offset)).or_default();
        input.text = text.to_string();
        input.dirty = true;
        true
    }

    /// Current text of a buffer field input, typed or not.
    pub fn input_text(&self, editor: &EditorState, component: &str, field: &str) -> Option<&str> {
        let meta = editor.registry.meta_by_name(component)?;
        let field = meta.field(field)?;
        self.matching_inputs
            .get(&(meta.id, field.offset))
            .map(|input| input.text.as_str())
    }

    /// Write typed text to the component.
    pub fn commit_text(&mut self, editor: &mut EditorState, component: &str, field: &str) -> Result<bool, EditorError> {
        let Some(meta) = editor.registry.meta_by_name(component) else {
            return Err(EditorError::UnknownComponent(component.to_string()));
        };
        let Some(offset) = meta.field(field).map(|f| f.offset) else {
            return Ok(false);
        };
        let key = (meta.id, offset);
        let Some(text) = self.matching_inputs.get(&key).filter(|i| i.dirty).map(|i| i.text.clone()) else {
            return Ok(false);
        };
        let written = self.set_field_value(editor, component, field, FieldValue::Buffer(text.into_bytes()))?;
        if written {
            if let Some(input) = self.matching_inputs.get_mut(&key) {
                input.dirty = false;
            }
        }
        Ok(written)
    }

    /// Capture the target value a drag gesture on `link` is applied against.
    pub fn begin_modifier_gesture(&mut self, editor: &EditorState, link: &str) -> bool {
        let Some(id) = editor.registry.id_of(link) else {
            return false;
        };
        let Some(shadow) = self.link_components.get_mut(&id) else {
            return false;
        };
        shadow.gesture = Some(ModifierGesture {
            start_link: shadow.data.clone(),
            baseline_target: shadow.target_copy.clone(),
            refreshed: true,
        });
        true
    }

    /// Keep a gesture alive for this frame. Gestures not refreshed are
    /// finalized by the next `update_frame`.
    pub fn refresh_modifier_gesture(&mut self, editor: &EditorState, link: &str) -> bool {
        let Some(id) = editor.registry.id_of(link) else {
            return false;
        };
        match self.link_components.get_mut(&id).and_then(|s| s.gesture.as_mut()) {
            Some(gesture) => {
                gesture.refreshed = true;
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::EditorSettings;
    use ember_core::math::{quat_approx_eq, Quat, Vec3};
    use ember_core::reflect::{ComponentMetaBuilder, FieldTags};

    struct Setup {
        editor: EditorState,
        sandbox: SandboxIndex,
        entity: Entity,
    }

    fn setup() -> Setup {
        let mut editor = EditorState::new(EditorSettings {
            worker_threads: 1,
            ..Default::default()
        })
        .unwrap();
        let sandbox = editor.create_sandbox("main").unwrap();
        editor
            .register_component(
                ComponentMetaBuilder::new("Transform", ComponentKind::Unique)
                    .field("rotation", FieldType::Quat)
                    .field("scale", FieldType::F32),
            )
            .unwrap();
        editor
            .register_component(
                ComponentMetaBuilder::new("TransformLink", ComponentKind::Unique)
                    .field_with("rotation", FieldType::Vec3, FieldTags::MODIFIER)
                    .field_with("scale", FieldType::F32, FieldTags::MODIFIER)
                    .link_to("Transform"),
            )
            .unwrap();
        editor
            .register_component(ComponentMetaBuilder::new("Name", ComponentKind::Unique).field("text", FieldType::Buffer))
            .unwrap();
        editor
            .register_component(ComponentMetaBuilder::new("Tag", ComponentKind::Unique).field("value", FieldType::U32))
            .unwrap();
        editor
            .register_component(ComponentMetaBuilder::new("Team", ComponentKind::Shared).field("id", FieldType::U32))
            .unwrap();
        let entity = editor
            .create_sandbox_entity_with(sandbox, Viewport::Scene, &["Transform", "Name"], &["Team"])
            .unwrap()
            .unwrap();
        Setup { editor, sandbox, entity }
    }

    #[test]
    fn tracks_entity_components_through_links() {
        let Setup {
            mut editor,
            sandbox,
            entity,
        } = setup();
        let mut panel = InspectorEntityData::new(sandbox, Viewport::Scene);
        panel.set_target(Some(InspectorTarget::Entity(entity)));
        let events = panel.update_frame(&mut editor);

        let link = editor.component_id("TransformLink").unwrap();
        let transform = editor.component_id("Transform").unwrap();
        assert!(events.contains(&FrameEvent::Tracked(link)));
        assert!(panel.is_tracking(link));
        assert!(!panel.is_tracking(transform));
        assert!(panel.is_tracking(editor.component_id("Team").unwrap()));
    }

    #[test]
    fn typed_text_survives_archetype_move() {
        let Setup {
            mut editor,
            sandbox,
            entity,
        } = setup();
        let mut panel = InspectorEntityData::new(sandbox, Viewport::Scene);
        panel.set_target(Some(InspectorTarget::Entity(entity)));
        panel.update_frame(&mut editor);

        assert!(panel.edit_text(&editor, "Name", "text", "crate"));
        editor
            .add_sandbox_entity_component(sandbox, Viewport::Scene, entity, "Tag")
            .unwrap();
        let events = panel.update_frame(&mut editor);
        let name = editor.component_id("Name").unwrap();
        assert!(events.contains(&FrameEvent::Rebound(name)));
        assert_eq!(panel.input_text(&editor, "Name", "text"), Some("crate"));

        assert!(panel.commit_text(&mut editor, "Name", "text").unwrap());
        let stored = editor
            .sandbox_entity_component_data(sandbox, Viewport::Scene, entity, "Name")
            .unwrap()
            .unwrap();
        assert_eq!(stored.buffer(0), Some(&b"crate"[..]));
    }

    #[test]
    fn shared_edit_moves_entity_to_matching_instance() {
        let Setup {
            mut editor,
            sandbox,
            entity,
        } = setup();
        let other = editor
            .create_sandbox_entity_with(sandbox, Viewport::Scene, &[], &["Team"])
            .unwrap()
            .unwrap();
        let team = editor.component_id("Team").unwrap();
        let mut panel = InspectorEntityData::new(sandbox, Viewport::Scene);
        panel.set_target(Some(InspectorTarget::Entity(entity)));
        panel.update_frame(&mut editor);

        assert!(panel.set_field_value(&mut editor, "Team", "id", FieldValue::U32(3)).unwrap());
        let manager = editor.sandbox(sandbox).unwrap().entity_manager(Viewport::Scene).unwrap();
        let mine = manager.entity_shared_instance(entity, team).unwrap();
        let theirs = manager.entity_shared_instance(other, team).unwrap();
        assert_ne!(mine, theirs);
        assert_eq!(manager.shared_value(team, theirs).unwrap().read_pod::<u32>(), Some(0));
        assert_eq!(panel.field_value(&editor, "Team", "id"), Some(FieldValue::U32(3)));
    }

    #[test]
    fn modifier_gesture_applies_against_start_value() {
        let Setup {
            mut editor,
            sandbox,
            entity,
        } = setup();
        let mut panel = InspectorEntityData::new(sandbox, Viewport::Scene);
        panel.set_target(Some(InspectorTarget::Entity(entity)));
        panel.update_frame(&mut editor);

        assert!(panel.begin_modifier_gesture(&editor, "TransformLink"));
        for step in 1..=3 {
            let euler = Vec3::new(0.0, 0.0, 10.0 * step as f32);
            panel
                .set_field_value(&mut editor, "TransformLink", "rotation", FieldValue::Vec3(euler))
                .unwrap();
            assert!(panel.refresh_modifier_gesture(&editor, "TransformLink"));
            panel.update_frame(&mut editor);
        }
        let link = editor.component_id("TransformLink").unwrap();
        let events = panel.update_frame(&mut editor);
        assert!(events.contains(&FrameEvent::GestureFinalized(link)));

        let transform = editor
            .sandbox_entity_component_data(sandbox, Viewport::Scene, entity, "Transform")
            .unwrap()
            .unwrap();
        let meta = editor.registry().meta_by_name("Transform").unwrap();
        let FieldValue::Quat(rotation) = read_field(meta.field("rotation").unwrap(), &transform) else {
            panic!("rotation is not a quaternion");
        };
        assert!(quat_approx_eq(rotation, Quat::from_rotation_z(30f32.to_radians()), 1e-5));
    }

    #[test]
    fn external_change_regenerates_link_view() {
        let Setup {
            mut editor,
            sandbox,
            entity,
        } = setup();
        let mut panel = InspectorEntityData::new(sandbox, Viewport::Scene);
        panel.set_target(Some(InspectorTarget::Entity(entity)));
        panel.update_frame(&mut editor);

        let meta = editor.registry().meta_by_name("Transform").unwrap().clone();
        let mut value = editor
            .sandbox_entity_component_data(sandbox, Viewport::Scene, entity, "Transform")
            .unwrap()
            .unwrap();
        write_field(meta.field("scale").unwrap(), &mut value, &FieldValue::F32(4.0)).unwrap();
        editor
            .set_sandbox_entity_component_data(sandbox, Viewport::Scene, entity, "Transform", &value)
            .unwrap();

        let link = editor.component_id("TransformLink").unwrap();
        let events = panel.update_frame(&mut editor);
        assert!(events.contains(&FrameEvent::LinkRegenerated(link)));
        assert_eq!(panel.field_value(&editor, "TransformLink", "scale"), Some(FieldValue::F32(4.0)));
    }

    #[test]
    fn runtime_teardown_and_deletion_clear_the_panel() {
        let Setup {
            mut editor,
            sandbox,
            entity,
        } = setup();
        editor.start_sandbox_runtime(sandbox).unwrap();
        let mut panel = InspectorEntityData::new(sandbox, Viewport::Runtime);
        panel.set_target(Some(InspectorTarget::Entity(entity)));
        panel.update_frame(&mut editor);
        assert!(!panel.tracked_components().is_empty());

        editor.stop_sandbox_runtime(sandbox).unwrap();
        let events = panel.update_frame(&mut editor);
        assert_eq!(events[0], FrameEvent::SourceChanged);
        assert!(events.contains(&FrameEvent::TargetGone));
        assert!(panel.tracked_components().is_empty());
        assert_eq!(panel.target(), None);
    }
}
