// gpu_lock.rs - Cooperative GPU lock for background builds
//
// The GPU context may only be used while the main thread is paused at its
// event pump. A worker posts a request event and blocks until the main
// thread grants it the lock. The owner is tracked so a crashed worker's
// lock can be taken back.

use crate::events::{EditorEvent, EventQueue};
use parking_lot::{Condvar, Mutex};
use std::thread::{self, ThreadId};
use tracing::{trace, warn};

#[derive(Debug, Default)]
pub struct GpuLock {
    owner: Mutex<Option<ThreadId>>,
    granted: Condvar,
}

impl GpuLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn owner(&self) -> Option<ThreadId> {
        *self.owner.lock()
    }

    pub fn is_locked(&self) -> bool {
        self.owner().is_some()
    }

    /// Called from the main thread's event pump. Returns false when another
    /// thread still holds the lock; the request is retried next frame.
    pub fn grant(&self, thread: ThreadId) -> bool {
        let mut owner = self.owner.lock();
        match *owner {
            Some(current) if current != thread => false,
            _ => {
                *owner = Some(thread);
                self.granted.notify_all();
                trace!(?thread, "gpu lock granted");
                true
            }
        }
    }

    /// Request the lock from a worker and block until the main thread grants
    /// it. The lock is released when the guard is dropped.
    pub fn acquire<'a>(&'a self, events: &EventQueue) -> GpuLockGuard<'a> {
        let thread = thread::current().id();
        events.push(EditorEvent::GpuLockRequest { thread });
        let mut owner = self.owner.lock();
        while *owner != Some(thread) {
            self.granted.wait(&mut owner);
        }
        GpuLockGuard { lock: self, thread }
    }

    fn release(&self, thread: ThreadId) {
        let mut owner = self.owner.lock();
        if *owner == Some(thread) {
            *owner = None;
        }
    }

    /// Take the lock back from a crashed thread.
    pub fn force_release_if_owner(&self, thread: ThreadId) -> bool {
        let mut owner = self.owner.lock();
        if *owner != Some(thread) {
            return false;
        }
        *owner = None;
        warn!(?thread, "gpu lock released on behalf of crashed thread");
        true
    }
}

pub struct GpuLockGuard<'a> {
    lock: &'a GpuLock,
    thread: ThreadId,
}

impl Drop for GpuLockGuard<'_> {
    fn drop(&mut self) {
        self.lock.release(self.thread);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn worker_waits_for_main_thread_grant() {
        let lock = Arc::new(GpuLock::new());
        let events = EventQueue::new();

        let worker = {
            let lock = Arc::clone(&lock);
            let events = events.clone();
            thread::spawn(move || {
                let _guard = lock.acquire(&events);
                assert_eq!(lock.owner(), Some(thread::current().id()));
            })
        };

        // Event pump.
        loop {
            let requests = events.drain();
            if let Some(EditorEvent::GpuLockRequest { thread }) = requests.into_iter().next() {
                assert!(lock.grant(thread));
                break;
            }
            thread::yield_now();
        }
        worker.join().unwrap();
        assert!(!lock.is_locked());
    }

    #[test]
    fn force_release_only_for_owner() {
        let lock = GpuLock::new();
        let me = thread::current().id();
        let other = thread::spawn(|| thread::current().id()).join().unwrap();
        assert!(lock.grant(other));
        assert!(!lock.grant(me));
        assert!(!lock.force_release_if_owner(me));
        assert!(lock.force_release_if_owner(other));
        assert!(!lock.is_locked());
    }
}
