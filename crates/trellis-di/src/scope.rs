//! Nested scopes and the per-container scope stack
//!
//! A scope bounds per-scope lifetime instances and deterministic
//! teardown: ending a scope disposes its tracked instances in the order
//! they were registered, then fires completion callbacks so lifetimes can
//! evict their per-scope cache entries. A scope cannot end while a child
//! scope is still open.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error};

use trellis_reflect::{DisposerFn, Instance};

use crate::error::{DiError, DiResult};

type CompletionCallback = Box<dyn FnOnce() + Send>;

pub struct Scope {
    id: u64,
    parent: Option<Arc<Scope>>,
    disposables: Mutex<Vec<(Instance, DisposerFn)>>,
    completion: Mutex<Vec<CompletionCallback>>,
    live_children: AtomicUsize,
    ended: AtomicBool,
}

impl Scope {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn parent(&self) -> Option<&Arc<Scope>> {
        self.parent.as_ref()
    }

    /// Register an instance for disposal when this scope ends. Disposal
    /// runs in registration order.
    pub fn track_disposable(&self, instance: Instance, disposer: DisposerFn) {
        self.disposables.lock().push((instance, disposer));
    }

    /// Run `callback` after this scope's tracked instances are disposed.
    pub fn on_completed(&self, callback: impl FnOnce() + Send + 'static) {
        self.completion.lock().push(Box::new(callback));
    }

    fn complete(&self) {
        let disposables = std::mem::take(&mut *self.disposables.lock());
        for (instance, disposer) in &disposables {
            disposer(instance);
        }
        let callbacks = std::mem::take(&mut *self.completion.lock());
        for callback in callbacks {
            callback();
        }
        debug!(scope = self.id, disposed = disposables.len(), "scope completed");
    }
}

/// Owns the stack of live scopes for one container. Begin pushes, end
/// pops; the innermost scope is the current scope consulted by lifetimes.
pub struct ScopeManager {
    stack: Mutex<Vec<Arc<Scope>>>,
    next_id: AtomicU64,
}

impl ScopeManager {
    pub fn new() -> Self {
        Self {
            stack: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn begin_scope(&self) -> Arc<Scope> {
        let mut stack = self.stack.lock();
        let parent = stack.last().cloned();
        if let Some(parent) = &parent {
            parent.live_children.fetch_add(1, Ordering::SeqCst);
        }
        let scope = Arc::new(Scope {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            parent,
            disposables: Mutex::new(Vec::new()),
            completion: Mutex::new(Vec::new()),
            live_children: AtomicUsize::new(0),
            ended: AtomicBool::new(false),
        });
        stack.push(Arc::clone(&scope));
        debug!(scope = scope.id, depth = stack.len(), "scope started");
        scope
    }

    /// The innermost live scope, if any.
    pub fn current(&self) -> Option<Arc<Scope>> {
        self.stack.lock().last().cloned()
    }

    pub fn end_scope(&self, scope: &Arc<Scope>) -> DiResult<()> {
        if scope.ended.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if scope.live_children.load(Ordering::SeqCst) > 0 {
            scope.ended.store(false, Ordering::SeqCst);
            return Err(DiError::ScopeEndedWithLiveChild);
        }
        {
            let mut stack = self.stack.lock();
            match stack.last() {
                Some(top) if Arc::ptr_eq(top, scope) => {
                    stack.pop();
                }
                _ => {
                    scope.ended.store(false, Ordering::SeqCst);
                    return Err(DiError::ScopeOutOfOrder);
                }
            }
        }
        scope.complete();
        if let Some(parent) = scope.parent() {
            parent.live_children.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

impl Default for ScopeManager {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII handle returned by `begin_scope`. Call [`ScopeHandle::end`] to
/// surface teardown errors; dropping the handle ends the scope too but
/// can only log a failure.
pub struct ScopeHandle {
    scope: Arc<Scope>,
    manager: Arc<ScopeManager>,
    ended: bool,
}

impl ScopeHandle {
    pub(crate) fn new(scope: Arc<Scope>, manager: Arc<ScopeManager>) -> Self {
        Self {
            scope,
            manager,
            ended: false,
        }
    }

    pub fn scope(&self) -> &Arc<Scope> {
        &self.scope
    }

    pub fn end(mut self) -> DiResult<()> {
        self.ended = true;
        self.manager.end_scope(&self.scope)
    }
}

impl Drop for ScopeHandle {
    fn drop(&mut self) {
        if !self.ended {
            if let Err(err) = self.manager.end_scope(&self.scope) {
                error!(scope = self.scope.id(), %err, "failed to end scope on drop");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[test]
    fn test_disposal_runs_in_registration_order() {
        let manager = ScopeManager::new();
        let scope = manager.begin_scope();
        let order: Arc<StdMutex<Vec<u8>>> = Arc::new(StdMutex::new(Vec::new()));

        for tag in [1u8, 2, 3] {
            let order = Arc::clone(&order);
            scope.track_disposable(
                Arc::new(tag),
                Arc::new(move |_| order.lock().unwrap().push(tag)),
            );
        }
        manager.end_scope(&scope).unwrap();
        assert_eq!(*order.lock().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_completion_fires_after_disposal() {
        let manager = ScopeManager::new();
        let scope = manager.begin_scope();
        let order: Arc<StdMutex<Vec<&'static str>>> = Arc::new(StdMutex::new(Vec::new()));

        let disposal_order = Arc::clone(&order);
        scope.track_disposable(
            Arc::new(0u8),
            Arc::new(move |_| disposal_order.lock().unwrap().push("disposed")),
        );
        let completion_order = Arc::clone(&order);
        scope.on_completed(move || completion_order.lock().unwrap().push("completed"));

        manager.end_scope(&scope).unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["disposed", "completed"]);
    }

    #[test]
    fn test_ending_with_live_child_fails() {
        let manager = ScopeManager::new();
        let outer = manager.begin_scope();
        let inner = manager.begin_scope();

        assert!(matches!(
            manager.end_scope(&outer),
            Err(DiError::ScopeEndedWithLiveChild)
        ));

        manager.end_scope(&inner).unwrap();
        manager.end_scope(&outer).unwrap();
        assert!(manager.current().is_none());
    }

    #[test]
    fn test_end_is_idempotent() {
        let manager = ScopeManager::new();
        let scope = manager.begin_scope();
        manager.end_scope(&scope).unwrap();
        manager.end_scope(&scope).unwrap();
    }

    #[test]
    fn test_current_tracks_innermost() {
        let manager = ScopeManager::new();
        assert!(manager.current().is_none());
        let outer = manager.begin_scope();
        let inner = manager.begin_scope();
        assert_eq!(manager.current().unwrap().id(), inner.id());
        assert_eq!(inner.parent().unwrap().id(), outer.id());
    }
}
