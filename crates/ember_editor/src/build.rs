// build.rs - Component build scheduling
//
// Build functions derive a component from its dependencies. They run on
// the main thread and may hand the heavy part to a worker, in which case the
// component and its dependencies stay locked until the main thread commits
// the result. Module code is untrusted: every call is isolated with
// `catch_unwind` and a crashing entry is skipped until its module reloads.

use crate::editor::{EditorState, ResolvedBuildEntry};
use crate::events::EditorEvent;
use crate::locks::LockedEntry;
use crate::module::{BackgroundContext, BuildInput, BuildOutcome};
use crate::sandbox::{SandboxIndex, Viewport};
use crate::EditorError;
use ember_core::ecs::{ComponentData, ComponentId, ComponentKind, Entity, SharedInstance};
use ember_core::reflect::ComponentMeta;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;
use thiserror::Error;
use tracing::{debug, error, trace, warn};

/// A build function failed instead of returning a value.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BuildError {
    #[error("build of {component} panicked: {message}")]
    Panicked { component: String, message: String },
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Run module code, turning a panic into a `BuildError`.
fn guarded<T>(component: &str, f: impl FnOnce() -> T) -> Result<T, BuildError> {
    panic::catch_unwind(AssertUnwindSafe(f)).map_err(|payload| BuildError::Panicked {
        component: component.to_string(),
        message: panic_message(payload.as_ref()),
    })
}

/// Where a build result is written.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BuildTarget {
    Unique,
    Shared(SharedInstance),
}

/// Posted by a worker when a deferred build is over.
#[derive(Debug)]
pub struct BuildCompletion {
    pub sandbox: SandboxIndex,
    pub viewport: Viewport,
    pub entity: Entity,
    pub component: ComponentId,
    pub target: BuildTarget,
    pub result: Option<ComponentData>,
    pub error: Option<BuildError>,
    pub module: String,
    /// Runtime session the build was started in.
    pub session: u64,
    pub(crate) job_counter: Option<Arc<AtomicU32>>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BuildStatus {
    /// Built on the main thread and written back.
    Built,
    /// The function had nothing to write.
    Unchanged,
    /// Running on a worker, or queued as a split job.
    Scheduled,
    /// The function panicked during this call.
    Crashed,
    /// Entry crashed earlier, or the target no longer exists.
    Skipped,
    /// The component or a dependency is locked by another build.
    Busy,
    NoBuildFunction,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum JobStatus {
    Pending { remaining: usize },
    Done,
}

/// Resumable build of a shared instance whose entities may derive different
/// values from their own dependencies.
///
/// Each entity first moves onto a private copy of the instance and is built
/// against it, in batches. When every sub-build has been committed, copies
/// that ended up equal are merged back together. A job that fails part way
/// stops splitting but still merges what it split.
#[derive(Debug)]
pub struct SharedSplitJob {
    sandbox: SandboxIndex,
    viewport: Viewport,
    component: ComponentId,
    source: SharedInstance,
    entities: Vec<Entity>,
    cursor: usize,
    created: Vec<SharedInstance>,
    outstanding: Arc<AtomicU32>,
    session: u64,
    failure: Option<EditorError>,
}

impl SharedSplitJob {
    pub fn component(&self) -> ComponentId {
        self.component
    }

    pub fn sandbox(&self) -> SandboxIndex {
        self.sandbox
    }

    /// Advance by one batch, or finish once all builds are in.
    pub fn step(&mut self, editor: &mut EditorState) -> Result<JobStatus, EditorError> {
        let Some(meta) = editor.registry.meta(self.component).cloned() else {
            return Ok(JobStatus::Done);
        };
        let session = editor.sandbox(self.sandbox)?.runtime_session();
        if self.viewport == Viewport::Runtime && session != self.session {
            debug!(component = %meta.name, "runtime restarted, split job dropped");
            return Ok(JobStatus::Done);
        }

        if self.cursor < self.entities.len() {
            let end = (self.cursor + editor.settings.build_batch_size.max(1)).min(self.entities.len());
            while self.cursor < end {
                let entity = self.entities[self.cursor];
                self.cursor += 1;
                if let Err(err) = self.split_entity(editor, &meta, entity) {
                    self.cursor = self.entities.len();
                    self.failure = Some(err);
                    break;
                }
            }
            if self.cursor < self.entities.len() {
                return Ok(JobStatus::Pending {
                    remaining: self.entities.len() - self.cursor,
                });
            }
        }

        let outstanding = self.outstanding.load(Ordering::Acquire);
        if outstanding > 0 {
            return Ok(JobStatus::Pending {
                remaining: outstanding as usize,
            });
        }

        let merged = self.merge(editor, &meta);
        match self.failure.take() {
            Some(err) => Err(err),
            None => merged.map(|()| JobStatus::Done),
        }
    }

    /// Entities that cannot be built stay on the source instance.
    fn split_entity(&mut self, editor: &mut EditorState, meta: &ComponentMeta, entity: Entity) -> Result<(), EditorError> {
        let Some(resolved) = editor.resolve_build_entry(meta.id) else {
            return Ok(());
        };
        if resolved.entry.has_crashed() || editor.is_locked(self.sandbox, self.viewport, entity, meta.id, true) {
            return Ok(());
        }
        let Some(manager) = editor.manager_mut(self.sandbox, self.viewport)? else {
            return Ok(());
        };
        if manager.entity_shared_instance(entity, meta.id) != Some(self.source) {
            return Ok(());
        }
        let Some(value) = manager.shared_value(meta.id, self.source) else {
            return Ok(());
        };
        let copy = manager.register_shared_instance(meta.id, &value)?;
        self.created.push(copy);
        manager.change_entity_shared_instance(entity, meta.id, copy)?;

        let Some(input) = editor.build_input(self.sandbox, self.viewport, entity, meta, Some(copy), &resolved) else {
            return Ok(());
        };
        editor.run_build(
            self.sandbox,
            self.viewport,
            meta,
            BuildTarget::Shared(copy),
            input,
            &resolved,
            Some(Arc::clone(&self.outstanding)),
        )?;
        Ok(())
    }

    fn merge(&mut self, editor: &mut EditorState, meta: &ComponentMeta) -> Result<(), EditorError> {
        let Some(manager) = editor.manager_mut(self.sandbox, self.viewport)? else {
            return Ok(());
        };
        let mut merged = 0;
        for &instance in &self.created {
            if manager.exists_shared_instance(meta.id, instance)
                && manager.try_merge_shared_instance(meta.id, instance)?.is_some()
            {
                merged += 1;
            }
        }
        manager.unregister_unreferenced_shared_instance(meta.id, self.source);
        for &instance in &self.created {
            manager.unregister_unreferenced_shared_instance(meta.id, instance);
        }
        debug!(
            component = %meta.name,
            split = self.created.len(),
            merged,
            "shared split job finished"
        );
        Ok(())
    }
}

impl EditorState {
    /// Snapshot of the value being built and of its dependencies.
    pub(crate) fn build_input(
        &self,
        sandbox: SandboxIndex,
        viewport: Viewport,
        entity: Entity,
        meta: &ComponentMeta,
        instance: Option<SharedInstance>,
        resolved: &ResolvedBuildEntry,
    ) -> Option<BuildInput> {
        let manager = self.manager(sandbox, viewport).ok()??;
        let data = match instance {
            Some(instance) => manager.shared_value(meta.id, instance)?,
            None => manager.component_value(entity, meta.id)?,
        };
        let mut dependencies = Vec::with_capacity(resolved.entry.component_dependencies.len());
        for &dependency in &resolved.entry.component_dependencies {
            let Some(dep_meta) = self.registry.meta(dependency) else {
                continue;
            };
            let value = match dep_meta.kind {
                ComponentKind::Unique => manager.component_value(entity, dependency),
                ComponentKind::Shared => manager
                    .entity_shared_instance(entity, dependency)
                    .and_then(|i| manager.shared_value(dependency, i)),
                ComponentKind::Global => manager.global_value(dependency),
            };
            if let Some(value) = value {
                dependencies.push((dependency, value));
            }
        }
        Some(BuildInput {
            sandbox,
            entity,
            component: meta.id,
            data,
            dependencies,
        })
    }

    fn lock_entries(
        &self,
        meta: &ComponentMeta,
        viewport: Viewport,
        entity: Entity,
        resolved: &ResolvedBuildEntry,
    ) -> Vec<LockedEntry> {
        let mut entries = vec![LockedEntry::Component {
            viewport,
            entity,
            component: meta.id,
            is_shared: meta.kind == ComponentKind::Shared,
        }];
        for &dependency in &resolved.entry.component_dependencies {
            let entry = match self.registry.meta(dependency).map(|m| m.kind) {
                Some(ComponentKind::Global) => LockedEntry::Global {
                    viewport,
                    component: dependency,
                },
                Some(kind) => LockedEntry::Component {
                    viewport,
                    entity,
                    component: dependency,
                    is_shared: kind == ComponentKind::Shared,
                },
                None => continue,
            };
            if !entries.contains(&entry) {
                entries.push(entry);
            }
        }
        entries
    }

    fn report_crash(&mut self, sandbox: SandboxIndex, err: &BuildError) {
        let sandbox_name = self
            .sandbox(sandbox)
            .map_or_else(|_| sandbox.to_string(), |s| s.name.clone());
        self.console.error(format!("sandbox {sandbox_name}: {err}"));
    }

    /// Call a build function and dispatch on its outcome.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn run_build(
        &mut self,
        sandbox: SandboxIndex,
        viewport: Viewport,
        meta: &ComponentMeta,
        target: BuildTarget,
        input: BuildInput,
        resolved: &ResolvedBuildEntry,
        job_counter: Option<Arc<AtomicU32>>,
    ) -> Result<BuildStatus, EditorError> {
        let function = Arc::clone(&resolved.entry.function);
        let outcome = match guarded(&meta.name, || function(&input)) {
            Ok(outcome) => outcome,
            Err(err) => {
                resolved.entry.mark_crashed();
                self.report_crash(sandbox, &err);
                return Ok(BuildStatus::Crashed);
            }
        };
        let entity = input.entity;
        match outcome {
            BuildOutcome::Done(data) => {
                self.commit_value(sandbox, viewport, entity, meta, target, &data)?;
                Ok(BuildStatus::Built)
            }
            BuildOutcome::Unchanged => Ok(BuildStatus::Unchanged),
            BuildOutcome::Deferred(task) => {
                let entries = self.lock_entries(meta, viewport, entity, resolved);
                let state = self.sandbox(sandbox)?;
                if let Err(err) = state.locked.try_reserve(&entries) {
                    self.console.warn(format!(
                        "{} on {entity} cannot be built in the background: {err}",
                        meta.name
                    ));
                    return Ok(BuildStatus::Busy);
                }
                let locked = Arc::clone(&state.locked);
                let pending = Arc::clone(&state.pending_builds);
                let session = state.runtime_session();
                let lock_count = Arc::clone(&resolved.lock_count);
                let entry = Arc::clone(&resolved.entry);
                let context = BackgroundContext {
                    gpu_lock: Arc::clone(&self.gpu_lock),
                    events: self.events.clone(),
                };
                let module = resolved.module.clone();
                let component = meta.name.clone();
                let component_id = meta.id;

                lock_count.fetch_add(1, Ordering::AcqRel);
                pending.fetch_add(1, Ordering::AcqRel);
                if let Some(counter) = &job_counter {
                    counter.fetch_add(1, Ordering::AcqRel);
                }

                self.tasks.spawn(Box::new(move || {
                    let outcome = guarded(&component, || task(input, &context));
                    let (result, error) = match outcome {
                        Ok(data) => (Some(data), None),
                        Err(err) => {
                            entry.mark_crashed();
                            context.gpu_lock.force_release_if_owner(thread::current().id());
                            error!(%err, "background build crashed");
                            (None, Some(err))
                        }
                    };
                    locked.release(&entries);
                    context.events.push(EditorEvent::BuildCompleted(BuildCompletion {
                        sandbox,
                        viewport,
                        entity,
                        component: component_id,
                        target,
                        result,
                        error,
                        module,
                        session,
                        job_counter,
                    }));
                    // After the push, so pending work is always visible as
                    // either a counter or a queued event.
                    pending.fetch_sub(1, Ordering::AcqRel);
                    lock_count.fetch_sub(1, Ordering::AcqRel);
                }));
                trace!(component = %meta.name, %entity, "build scheduled");
                Ok(BuildStatus::Scheduled)
            }
        }
    }

    /// Write a built value, keeping asset references balanced.
    fn commit_value(
        &mut self,
        sandbox: SandboxIndex,
        viewport: Viewport,
        entity: Entity,
        meta: &ComponentMeta,
        target: BuildTarget,
        data: &ComponentData,
    ) -> Result<bool, EditorError> {
        match target {
            BuildTarget::Unique => self.write_unique_value(sandbox, viewport, entity, meta, data),
            BuildTarget::Shared(instance) => self.rewrite_shared_instance(sandbox, viewport, meta, instance, data),
        }
    }

    /// Overwrite an instance in place. Every referencing entity holds its own
    /// asset references, so they move once per reference.
    fn rewrite_shared_instance(
        &mut self,
        sandbox: SandboxIndex,
        viewport: Viewport,
        meta: &ComponentMeta,
        instance: SharedInstance,
        data: &ComponentData,
    ) -> Result<bool, EditorError> {
        let Some(manager) = self.manager_mut(sandbox, viewport)? else {
            return Ok(false);
        };
        let (Some(old), Some(references)) = (
            manager.shared_value(meta.id, instance),
            manager.shared_instance_references(meta.id, instance),
        ) else {
            return Ok(false);
        };
        manager.set_shared_value(meta.id, instance, data)?;
        let added = self.value_assets(meta, data);
        let removed = self.value_assets(meta, &old);
        self.register_assets(sandbox, viewport, &added, references);
        for _ in 0..references {
            self.unregister_assets(sandbox, viewport, &removed);
        }
        self.sandbox_mut(sandbox)?.mark_dirty(viewport);
        Ok(true)
    }

    /// Run the build function of `component` for one entity.
    pub fn call_sandbox_component_build_function(
        &mut self,
        sandbox: SandboxIndex,
        viewport: Viewport,
        entity: Entity,
        component: ComponentId,
    ) -> Result<BuildStatus, EditorError> {
        let meta = self
            .registry
            .meta(component)
            .cloned()
            .ok_or_else(|| EditorError::UnknownComponent(component.to_string()))?;
        if meta.kind == ComponentKind::Shared {
            let instance = self
                .manager(sandbox, viewport)?
                .and_then(|manager| manager.entity_shared_instance(entity, component));
            return match instance {
                Some(instance) => self.call_sandbox_shared_component_build_function(sandbox, viewport, component, instance),
                None => Ok(BuildStatus::Skipped),
            };
        }

        let Some(resolved) = self.resolve_build_entry(component) else {
            return Ok(BuildStatus::NoBuildFunction);
        };
        if self.skip_crashed(&resolved, &meta) {
            return Ok(BuildStatus::Skipped);
        }
        if self.is_locked(sandbox, viewport, entity, component, false) {
            self.report_busy(&meta, entity);
            return Ok(BuildStatus::Busy);
        }
        let Some(input) = self.build_input(sandbox, viewport, entity, &meta, None, &resolved) else {
            return Ok(BuildStatus::Skipped);
        };
        self.run_build(sandbox, viewport, &meta, BuildTarget::Unique, input, &resolved, None)
    }

    /// Run the build function of a shared instance.
    ///
    /// When the build reads dependencies and more than one entity references
    /// the instance, a `SharedSplitJob` is queued instead and advanced by
    /// `process_events`.
    pub fn call_sandbox_shared_component_build_function(
        &mut self,
        sandbox: SandboxIndex,
        viewport: Viewport,
        component: ComponentId,
        instance: SharedInstance,
    ) -> Result<BuildStatus, EditorError> {
        let meta = self
            .registry
            .meta(component)
            .cloned()
            .ok_or_else(|| EditorError::UnknownComponent(component.to_string()))?;
        if meta.kind != ComponentKind::Shared {
            return Err(EditorError::WrongKind {
                component: meta.name,
                expected: ComponentKind::Shared,
                actual: meta.kind,
            });
        }
        let Some(resolved) = self.resolve_build_entry(component) else {
            return Ok(BuildStatus::NoBuildFunction);
        };
        if self.skip_crashed(&resolved, &meta) {
            return Ok(BuildStatus::Skipped);
        }
        let Some(manager) = self.manager(sandbox, viewport)? else {
            return Ok(BuildStatus::Skipped);
        };
        if !manager.exists_shared_instance(component, instance) {
            return Ok(BuildStatus::Skipped);
        }
        let entities = manager.entities_with_shared_instance(component, instance);
        let Some(&first) = entities.first() else {
            return Ok(BuildStatus::Skipped);
        };
        if let Some(&locked) = entities
            .iter()
            .find(|&&entity| self.is_locked(sandbox, viewport, entity, component, true))
        {
            self.report_busy(&meta, locked);
            return Ok(BuildStatus::Busy);
        }

        if resolved.entry.component_dependencies.is_empty() || entities.len() <= 1 {
            let Some(input) = self.build_input(sandbox, viewport, first, &meta, Some(instance), &resolved) else {
                return Ok(BuildStatus::Skipped);
            };
            return self.run_build(
                sandbox,
                viewport,
                &meta,
                BuildTarget::Shared(instance),
                input,
                &resolved,
                None,
            );
        }

        debug!(component = %meta.name, %instance, entities = entities.len(), "queued shared split job");
        let session = self.sandbox(sandbox)?.runtime_session();
        self.split_jobs.push(SharedSplitJob {
            sandbox,
            viewport,
            component,
            source: instance,
            entities,
            cursor: 0,
            created: Vec::new(),
            outstanding: Arc::new(AtomicU32::new(0)),
            session,
            failure: None,
        });
        Ok(BuildStatus::Scheduled)
    }

    fn report_busy(&mut self, meta: &ComponentMeta, entity: Entity) {
        self.console.warn(format!(
            "{} on {entity} is already being built in the background",
            meta.name
        ));
    }

    fn skip_crashed(&mut self, resolved: &ResolvedBuildEntry, meta: &ComponentMeta) -> bool {
        if !resolved.entry.has_crashed() {
            return false;
        }
        self.console.warn_once(
            format!("crashed-build:{}:{}", resolved.module, meta.name),
            format!(
                "build of {} is skipped until module {} is reloaded",
                meta.name, resolved.module
            ),
        );
        true
    }

    /// Re-run the builds that read `component` on `entity`. Returns how many
    /// build functions were called.
    pub fn notify_sandbox_component_changed(
        &mut self,
        sandbox: SandboxIndex,
        viewport: Viewport,
        entity: Entity,
        component: ComponentId,
    ) -> Result<usize, EditorError> {
        let mut dependents: Vec<ComponentId> = self
            .modules
            .values()
            .filter(|m| m.is_loaded())
            .flat_map(|m| m.build_entries.iter())
            .filter(|(_, entry)| entry.component_dependencies.contains(&component))
            .map(|(&built, _)| built)
            .collect();
        dependents.sort_unstable();
        dependents.dedup();

        let mut called = 0;
        for built in dependents {
            let present = self.manager(sandbox, viewport)?.map_or(false, |manager| {
                manager.has_component(entity, built) || manager.has_shared_component(entity, built)
            });
            if !present {
                continue;
            }
            match self.call_sandbox_component_build_function(sandbox, viewport, entity, built)? {
                BuildStatus::Skipped | BuildStatus::NoBuildFunction => {}
                _ => called += 1,
            }
        }
        Ok(called)
    }

    /// Re-run the builds that read the global `component`: once per entity
    /// for unique results, once per instance for shared ones.
    pub fn notify_sandbox_global_component_changed(
        &mut self,
        sandbox: SandboxIndex,
        viewport: Viewport,
        component: ComponentId,
    ) -> Result<usize, EditorError> {
        let mut dependents: Vec<ComponentId> = self
            .modules
            .values()
            .filter(|m| m.is_loaded())
            .flat_map(|m| m.build_entries.iter())
            .filter(|(_, entry)| entry.component_dependencies.contains(&component))
            .map(|(&built, _)| built)
            .collect();
        dependents.sort_unstable();
        dependents.dedup();

        let mut called = 0;
        for built in dependents {
            let Some(kind) = self.registry.meta(built).map(|meta| meta.kind) else {
                continue;
            };
            let Some(manager) = self.manager(sandbox, viewport)? else {
                return Ok(called);
            };
            let statuses = match kind {
                ComponentKind::Unique => {
                    let entities: Vec<Entity> = manager
                        .entities()
                        .into_iter()
                        .filter(|&entity| manager.has_component(entity, built))
                        .collect();
                    let mut statuses = Vec::with_capacity(entities.len());
                    for entity in entities {
                        statuses.push(self.call_sandbox_component_build_function(sandbox, viewport, entity, built)?);
                    }
                    statuses
                }
                ComponentKind::Shared => {
                    let instances = manager.shared_instances(built);
                    let mut statuses = Vec::with_capacity(instances.len());
                    for instance in instances {
                        statuses.push(self.call_sandbox_shared_component_build_function(sandbox, viewport, built, instance)?);
                    }
                    statuses
                }
                ComponentKind::Global => Vec::new(),
            };
            called += statuses
                .iter()
                .filter(|s| !matches!(s, BuildStatus::Skipped | BuildStatus::NoBuildFunction))
                .count();
        }
        trace!(component, called, "global component dependents rebuilt");
        Ok(called)
    }

    /// Commit a background build posted through the event queue.
    pub(crate) fn commit_build(&mut self, completion: BuildCompletion) {
        let name = self.component_name(completion.component);
        if let Some(err) = &completion.error {
            self.report_crash(completion.sandbox, err);
        } else if let Some(data) = &completion.result {
            let stale = completion.viewport == Viewport::Runtime
                && self
                    .sandbox(completion.sandbox)
                    .map_or(true, |s| s.runtime_session() != completion.session);
            if stale {
                debug!(component = %name, "dropping build result for a stopped runtime");
            } else if let Some(meta) = self.registry.meta(completion.component).cloned() {
                let committed = self.commit_value(
                    completion.sandbox,
                    completion.viewport,
                    completion.entity,
                    &meta,
                    completion.target,
                    data,
                );
                match committed {
                    Ok(true) => trace!(component = %name, entity = %completion.entity, "build committed"),
                    Ok(false) => debug!(component = %name, "build target gone before commit"),
                    Err(err) => self.console.error(format!("committing {name} failed: {err}")),
                }
            }
        }
        if let Some(counter) = completion.job_counter {
            counter.fetch_sub(1, Ordering::AcqRel);
        }
    }

    /// Advance every queued split job by one step.
    pub(crate) fn step_split_jobs(&mut self) {
        let jobs = std::mem::take(&mut self.split_jobs);
        let mut pending = Vec::with_capacity(jobs.len());
        for mut job in jobs {
            match job.step(self) {
                Ok(JobStatus::Pending { remaining }) => {
                    trace!(component = %job.component(), remaining, "split job pending");
                    pending.push(job);
                }
                Ok(JobStatus::Done) => {}
                Err(err) => {
                    warn!(%err, "split job aborted");
                    self.console.error(format!("shared build split failed: {err}"));
                }
            }
        }
        pending.append(&mut self.split_jobs);
        self.split_jobs = pending;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::console::ConsoleLevel;
    use crate::module::EditorModule;
    use crate::settings::EditorSettings;
    use ember_core::reflect::{ComponentMetaBuilder, FieldType};
    use parking_lot::RwLock;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    fn editor(batch: usize) -> EditorState {
        EditorState::new(EditorSettings {
            worker_threads: 2,
            build_batch_size: batch,
            ..Default::default()
        })
        .unwrap()
    }

    fn u32_data(value: u32) -> ComponentData {
        ComponentData::from_pod(&value)
    }

    /// Background task that blocks until `gate` is opened by dropping the
    /// write guard held by the test.
    fn gated_task(gate: &Arc<RwLock<()>>, value: u32) -> BuildOutcome {
        let gate = Arc::clone(gate);
        BuildOutcome::Deferred(Box::new(move |_: BuildInput, _: &BackgroundContext| {
            let _open = gate.read();
            ComponentData::from_pod(&value)
        }))
    }

    fn baked_entities(editor: &mut EditorState, sb: SandboxIndex, count: usize) -> Vec<Entity> {
        (0..count)
            .map(|_| {
                editor
                    .create_sandbox_entity_with(sb, Viewport::Scene, &["Baked"], &[])
                    .unwrap()
                    .unwrap()
            })
            .collect()
    }

    #[test]
    fn panic_payloads_become_messages() {
        let err = guarded("Mesh", || panic!("boom {}", 1)).unwrap_err();
        assert_eq!(
            err,
            BuildError::Panicked {
                component: "Mesh".into(),
                message: "boom 1".into()
            }
        );
        assert_eq!(guarded("Mesh", || 3).unwrap(), 3);
    }

    #[test]
    fn inline_build_writes_back() {
        let mut editor = editor(8);
        let sb = editor.create_sandbox("main").unwrap();
        let source = editor
            .register_component(ComponentMetaBuilder::new("Source", ComponentKind::Unique).field("v", FieldType::U32))
            .unwrap();
        let doubled = editor
            .register_component(ComponentMetaBuilder::new("Doubled", ComponentKind::Unique).field("v", FieldType::U32))
            .unwrap();
        editor.register_module(EditorModule::new("math").with_build_function(doubled, vec![source], move |input| {
            let v: u32 = input.dependency(source).and_then(|d| d.read_pod()).unwrap_or(0);
            BuildOutcome::Done(ComponentData::from_pod(&(v * 2)))
        }));
        editor.load_module("math").unwrap();

        let entity = editor
            .create_sandbox_entity_with(sb, Viewport::Scene, &["Source", "Doubled"], &[])
            .unwrap()
            .unwrap();
        editor
            .set_sandbox_entity_component_data(sb, Viewport::Scene, entity, "Source", &u32_data(21))
            .unwrap();
        let built = editor
            .sandbox_entity_component_data(sb, Viewport::Scene, entity, "Doubled")
            .unwrap()
            .unwrap();
        assert_eq!(built.read_pod::<u32>(), Some(42));
    }

    #[test]
    fn deferred_build_locks_until_committed() {
        let mut editor = editor(8);
        let sb = editor.create_sandbox("main").unwrap();
        let id = editor
            .register_component(ComponentMetaBuilder::new("Baked", ComponentKind::Unique).field("v", FieldType::U32))
            .unwrap();
        editor.register_module(EditorModule::new("bake").with_build_function(id, vec![], |_| {
            BuildOutcome::Deferred(Box::new(|_: BuildInput, ctx: &BackgroundContext| {
                let _gpu = ctx.lock_gpu();
                ComponentData::from_pod(&7u32)
            }))
        }));
        editor.load_module("bake").unwrap();
        let entity = editor.create_sandbox_entity(sb, Viewport::Scene).unwrap().unwrap();
        editor.add_sandbox_entity_component(sb, Viewport::Scene, entity, "Baked").unwrap();

        assert!(editor.pump_until_idle(Duration::from_secs(5)));
        let value = editor
            .sandbox_entity_component_data(sb, Viewport::Scene, entity, "Baked")
            .unwrap()
            .unwrap();
        assert_eq!(value.read_pod::<u32>(), Some(7));
        assert!(editor.sandbox(sb).unwrap().locked_components().is_empty());
        assert_eq!(editor.module("bake").unwrap().lock_count(), 0);
        assert!(!editor.gpu_lock().is_locked());
    }

    #[test]
    fn shared_split_builds_per_entity_then_merges() {
        let mut editor = editor(2);
        let sb = editor.create_sandbox("main").unwrap();
        let size = editor
            .register_component(ComponentMetaBuilder::new("Size", ComponentKind::Unique).field("v", FieldType::U32))
            .unwrap();
        let bounds = editor
            .register_component(ComponentMetaBuilder::new("Bounds", ComponentKind::Shared).field("v", FieldType::U32))
            .unwrap();
        editor.register_module(EditorModule::new("geo").with_build_function(bounds, vec![size], move |input| {
            let v: u32 = input.dependency(size).and_then(|d| d.read_pod()).unwrap_or(0);
            BuildOutcome::Done(ComponentData::from_pod(&v))
        }));

        let mut entities = Vec::new();
        for v in [1u32, 2, 1, 2, 1] {
            let e = editor.create_sandbox_entity(sb, Viewport::Scene).unwrap().unwrap();
            editor.add_sandbox_entity_component(sb, Viewport::Scene, e, "Size").unwrap();
            editor
                .set_sandbox_entity_component_data(sb, Viewport::Scene, e, "Size", &u32_data(v))
                .unwrap();
            editor
                .add_sandbox_entity_shared_component(sb, Viewport::Scene, e, "Bounds", None)
                .unwrap();
            entities.push(e);
        }
        editor.load_module("geo").unwrap();

        let manager = editor.sandbox(sb).unwrap().entity_manager(Viewport::Scene).unwrap();
        let instance = manager.entity_shared_instance(entities[0], bounds).unwrap();
        let status = editor
            .call_sandbox_shared_component_build_function(sb, Viewport::Scene, bounds, instance)
            .unwrap();
        assert_eq!(status, BuildStatus::Scheduled);
        assert!(editor.pump_until_idle(Duration::from_secs(5)));

        let manager = editor.sandbox(sb).unwrap().entity_manager(Viewport::Scene).unwrap();
        let one = manager.entity_shared_instance(entities[0], bounds).unwrap();
        let two = manager.entity_shared_instance(entities[1], bounds).unwrap();
        assert_ne!(one, two);
        assert_eq!(manager.entity_shared_instance(entities[2], bounds), Some(one));
        assert_eq!(manager.entity_shared_instance(entities[3], bounds), Some(two));
        assert_eq!(manager.shared_value(bounds, two).unwrap().read_pod::<u32>(), Some(2));
    }

    #[test]
    fn full_lock_set_reports_busy_instead_of_panicking() {
        let mut editor = EditorState::new(EditorSettings {
            worker_threads: 2,
            locked_component_capacity: 2,
            ..Default::default()
        })
        .unwrap();
        let sb = editor.create_sandbox("main").unwrap();
        let baked = editor
            .register_component(ComponentMetaBuilder::new("Baked", ComponentKind::Unique).field("v", FieldType::U32))
            .unwrap();
        let gate = Arc::new(RwLock::new(()));
        let task_gate = Arc::clone(&gate);
        editor.register_module(
            EditorModule::new("bake").with_build_function(baked, vec![], move |_| gated_task(&task_gate, 7)),
        );
        let entities = baked_entities(&mut editor, sb, 3);
        editor.load_module("bake").unwrap();

        let closed = gate.write();
        let warnings = editor.console().count(ConsoleLevel::Warning);
        let statuses: Vec<BuildStatus> = entities
            .iter()
            .map(|&e| {
                editor
                    .call_sandbox_component_build_function(sb, Viewport::Scene, e, baked)
                    .unwrap()
            })
            .collect();
        assert_eq!(statuses, vec![BuildStatus::Scheduled, BuildStatus::Scheduled, BuildStatus::Busy]);
        assert_eq!(editor.sandbox(sb).unwrap().locked_components().len(), 2);
        assert_eq!(editor.console().count(ConsoleLevel::Warning), warnings + 1);

        drop(closed);
        assert!(editor.pump_until_idle(Duration::from_secs(5)));
        let value = |editor: &EditorState, e| {
            editor
                .sandbox_entity_component_data(sb, Viewport::Scene, e, "Baked")
                .unwrap()
                .unwrap()
                .read_pod::<u32>()
        };
        assert_eq!(value(&editor, entities[0]), Some(7));
        assert_eq!(value(&editor, entities[2]), Some(0));
        assert!(editor.sandbox(sb).unwrap().locked_components().is_empty());
    }

    #[test]
    fn inline_build_waits_for_background_build_of_same_component() {
        let mut editor = editor(8);
        let sb = editor.create_sandbox("main").unwrap();
        let baked = editor
            .register_component(ComponentMetaBuilder::new("Baked", ComponentKind::Unique).field("v", FieldType::U32))
            .unwrap();
        let gate = Arc::new(RwLock::new(()));
        let task_gate = Arc::clone(&gate);
        let first = AtomicBool::new(true);
        editor.register_module(EditorModule::new("bake").with_build_function(baked, vec![], move |_| {
            if first.swap(false, Ordering::AcqRel) {
                gated_task(&task_gate, 7)
            } else {
                BuildOutcome::Done(ComponentData::from_pod(&99u32))
            }
        }));
        let entity = baked_entities(&mut editor, sb, 1)[0];
        editor.load_module("bake").unwrap();

        let closed = gate.write();
        assert_eq!(
            editor
                .call_sandbox_component_build_function(sb, Viewport::Scene, entity, baked)
                .unwrap(),
            BuildStatus::Scheduled
        );
        assert_eq!(
            editor
                .call_sandbox_component_build_function(sb, Viewport::Scene, entity, baked)
                .unwrap(),
            BuildStatus::Busy
        );
        let while_locked = editor
            .sandbox_entity_component_data(sb, Viewport::Scene, entity, "Baked")
            .unwrap()
            .unwrap();
        assert_eq!(while_locked.read_pod::<u32>(), Some(0));

        drop(closed);
        assert!(editor.pump_until_idle(Duration::from_secs(5)));
        let committed = editor
            .sandbox_entity_component_data(sb, Viewport::Scene, entity, "Baked")
            .unwrap()
            .unwrap();
        assert_eq!(committed.read_pod::<u32>(), Some(7));
    }

    #[test]
    fn crashed_split_build_merges_copies_back() {
        let mut editor = editor(2);
        let sb = editor.create_sandbox("main").unwrap();
        let size = editor
            .register_component(ComponentMetaBuilder::new("Size", ComponentKind::Unique).field("v", FieldType::U32))
            .unwrap();
        let bounds = editor
            .register_component(ComponentMetaBuilder::new("Bounds", ComponentKind::Shared).field("v", FieldType::U32))
            .unwrap();
        editor.register_module(EditorModule::new("geo").with_build_function(bounds, vec![size], move |input| {
            let v: u32 = input.dependency(size).and_then(|d| d.read_pod()).unwrap_or(0);
            assert!(v != 2, "cannot bound size 2");
            BuildOutcome::Done(ComponentData::from_pod(&v))
        }));

        let mut entities = Vec::new();
        for v in [1u32, 2, 3, 4, 5] {
            let e = editor
                .create_sandbox_entity_with(sb, Viewport::Scene, &["Size"], &["Bounds"])
                .unwrap()
                .unwrap();
            editor
                .set_sandbox_entity_component_data(sb, Viewport::Scene, e, "Size", &u32_data(v))
                .unwrap();
            entities.push(e);
        }
        editor.load_module("geo").unwrap();

        let manager = editor.sandbox(sb).unwrap().entity_manager(Viewport::Scene).unwrap();
        let source = manager.entity_shared_instance(entities[0], bounds).unwrap();
        assert_eq!(
            editor
                .call_sandbox_shared_component_build_function(sb, Viewport::Scene, bounds, source)
                .unwrap(),
            BuildStatus::Scheduled
        );
        assert!(editor.pump_until_idle(Duration::from_secs(5)));
        assert!(editor.module("geo").unwrap().build_entry(bounds).unwrap().has_crashed());

        // Only the first entity was built; everyone else is back on the source.
        let manager = editor.sandbox(sb).unwrap().entity_manager(Viewport::Scene).unwrap();
        assert_eq!(manager.shared_instance_count(bounds), 2);
        let built = manager.entity_shared_instance(entities[0], bounds).unwrap();
        assert_eq!(manager.shared_value(bounds, built).unwrap().read_pod::<u32>(), Some(1));
        for &e in &entities[1..] {
            assert_eq!(manager.entity_shared_instance(e, bounds), Some(source));
        }
        assert_eq!(manager.shared_instance_references(bounds, source), Some(4));
    }

    #[test]
    fn global_change_rebuilds_dependents() {
        let mut editor = editor(8);
        let sb = editor.create_sandbox("main").unwrap();
        let gravity = editor
            .register_component(ComponentMetaBuilder::new("Gravity", ComponentKind::Global).field("g", FieldType::U32))
            .unwrap();
        let fall = editor
            .register_component(ComponentMetaBuilder::new("Fall", ComponentKind::Unique).field("v", FieldType::U32))
            .unwrap();
        editor.register_module(EditorModule::new("physics").with_build_function(fall, vec![gravity], move |input| {
            let g: u32 = input.dependency(gravity).and_then(|d| d.read_pod()).unwrap_or(0);
            BuildOutcome::Done(ComponentData::from_pod(&(g * 2)))
        }));
        editor.load_module("physics").unwrap();
        assert!(editor
            .register_sandbox_global_component(sb, Viewport::Scene, "Gravity")
            .unwrap());
        let entity = editor
            .create_sandbox_entity_with(sb, Viewport::Scene, &["Fall"], &[])
            .unwrap()
            .unwrap();

        assert!(editor
            .set_sandbox_global_component_data(sb, Viewport::Scene, "Gravity", &u32_data(5))
            .unwrap());
        let value = editor
            .sandbox_entity_component_data(sb, Viewport::Scene, entity, "Fall")
            .unwrap()
            .unwrap();
        assert_eq!(value.read_pod::<u32>(), Some(10));
    }
}
