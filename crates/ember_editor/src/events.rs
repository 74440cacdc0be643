// events.rs - Main-thread event queue
//
// Background workers never touch editor state directly. They post events
// here and the main thread handles them in `EditorState::process_events`.

use crate::build::BuildCompletion;
use crate::sandbox::{SandboxIndex, Viewport};
use ember_core::ecs::Entity;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::ThreadId;

#[derive(Debug)]
pub enum EditorEvent {
    /// A background build finished (or crashed) and its result waits to be
    /// committed.
    BuildCompleted(BuildCompletion),
    /// A worker wants the GPU lock.
    GpuLockRequest { thread: ThreadId },
    /// Entity deletion postponed while background builds are pending.
    DeferredDelete {
        sandbox: SandboxIndex,
        viewport: Viewport,
        entity: Entity,
    },
}

/// Cloneable handle to the shared queue.
#[derive(Debug, Clone, Default)]
pub struct EventQueue {
    inner: Arc<Mutex<VecDeque<EditorEvent>>>,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, event: EditorEvent) {
        self.inner.lock().push_back(event);
    }

    /// Take every queued event, in posting order.
    pub fn drain(&self) -> Vec<EditorEvent> {
        self.inner.lock().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_preserves_order_across_threads() {
        let queue = EventQueue::new();
        let worker = queue.clone();
        let thread = std::thread::spawn(move || {
            worker.push(EditorEvent::GpuLockRequest {
                thread: std::thread::current().id(),
            });
            std::thread::current().id()
        })
        .join()
        .unwrap();
        queue.push(EditorEvent::GpuLockRequest {
            thread: std::thread::current().id(),
        });

        let events = queue.drain();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], EditorEvent::GpuLockRequest { thread: t } if t == thread));
        assert!(queue.is_empty());
    }
}
