//! Lifetime policies controlling instance reuse and disposal
//!
//! Transient services carry no policy object at all; the other policies
//! implement [`Lifetime`]. A policy instance is per-registration state:
//! deriving a registration (closing an open generic) clones the policy as
//! a fresh instance via [`Lifetime::clone_policy`].

use std::sync::Arc;

use dashmap::DashMap;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use tracing::debug;

use trellis_reflect::{DisposerFn, Instance};

use crate::error::{DiError, DiResult};
use crate::scope::Scope;

/// Everything a lifetime may consult while producing an instance.
pub struct CreationContext<'a> {
    /// Display name of the service being produced, for error messages.
    pub service: &'a str,
    pub scope: Option<&'a Arc<Scope>>,
    /// Disposal hook of the implementing type, when it declares one.
    pub disposer: Option<&'a DisposerFn>,
}

pub trait Lifetime: Send + Sync {
    fn get_instance(
        &self,
        create: &dyn Fn() -> DiResult<Instance>,
        context: &CreationContext<'_>,
    ) -> DiResult<Instance>;

    /// A fresh policy instance of the same kind, carrying no state.
    fn clone_policy(&self) -> Arc<dyn Lifetime>;

    /// Whether the owning container must dispose this lifetime when the
    /// container itself is dropped.
    fn container_bound(&self) -> bool {
        false
    }

    /// Dispose any instance this lifetime still holds.
    fn dispose(&self) {}
}

/// One instance per container, created on first request under
/// double-checked locking. Disposed with the owning container.
pub struct PerContainerLifetime {
    cell: OnceCell<Instance>,
    held_disposer: Mutex<Option<DisposerFn>>,
}

impl PerContainerLifetime {
    pub fn new() -> Self {
        Self {
            cell: OnceCell::new(),
            held_disposer: Mutex::new(None),
        }
    }
}

impl Default for PerContainerLifetime {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifetime for PerContainerLifetime {
    fn get_instance(
        &self,
        create: &dyn Fn() -> DiResult<Instance>,
        context: &CreationContext<'_>,
    ) -> DiResult<Instance> {
        self.cell
            .get_or_try_init(|| {
                let instance = create()?;
                if let Some(disposer) = context.disposer {
                    *self.held_disposer.lock() = Some(Arc::clone(disposer));
                }
                Ok(instance)
            })
            .map(Arc::clone)
    }

    fn clone_policy(&self) -> Arc<dyn Lifetime> {
        Arc::new(PerContainerLifetime::new())
    }

    fn container_bound(&self) -> bool {
        true
    }

    fn dispose(&self) {
        if let (Some(instance), Some(disposer)) =
            (self.cell.get(), self.held_disposer.lock().take())
        {
            disposer(instance);
        }
    }
}

/// One instance per scope. Requires an active scope; the cache entry is
/// evicted when its scope completes.
pub struct PerScopeLifetime {
    instances: Arc<DashMap<u64, Instance>>,
}

impl PerScopeLifetime {
    pub fn new() -> Self {
        Self {
            instances: Arc::new(DashMap::new()),
        }
    }
}

impl Default for PerScopeLifetime {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifetime for PerScopeLifetime {
    fn get_instance(
        &self,
        create: &dyn Fn() -> DiResult<Instance>,
        context: &CreationContext<'_>,
    ) -> DiResult<Instance> {
        let scope = context.scope.ok_or_else(|| DiError::ScopedInstanceWithoutScope {
            service: context.service.to_string(),
        })?;
        match self.instances.entry(scope.id()) {
            dashmap::mapref::entry::Entry::Occupied(entry) => Ok(Arc::clone(entry.get())),
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                let instance = create()?;
                entry.insert(Arc::clone(&instance));

                let instances = Arc::clone(&self.instances);
                let scope_id = scope.id();
                scope.on_completed(move || {
                    instances.remove(&scope_id);
                    debug!(scope = scope_id, "evicted per-scope instance");
                });
                if let Some(disposer) = context.disposer {
                    scope.track_disposable(Arc::clone(&instance), Arc::clone(disposer));
                }
                Ok(instance)
            }
        }
    }

    fn clone_policy(&self) -> Arc<dyn Lifetime> {
        Arc::new(PerScopeLifetime::new())
    }
}

/// A fresh instance per request, with disposable instances tracked
/// against the current scope. Disposable without a scope is fatal.
pub struct PerRequestLifetime;

impl PerRequestLifetime {
    pub fn new() -> Self {
        Self
    }
}

impl Default for PerRequestLifetime {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifetime for PerRequestLifetime {
    fn get_instance(
        &self,
        create: &dyn Fn() -> DiResult<Instance>,
        context: &CreationContext<'_>,
    ) -> DiResult<Instance> {
        let instance = create()?;
        if let Some(disposer) = context.disposer {
            let scope =
                context.scope.ok_or_else(|| DiError::DisposableInstanceWithoutScope {
                    service: context.service.to_string(),
                })?;
            scope.track_disposable(Arc::clone(&instance), Arc::clone(disposer));
        }
        Ok(instance)
    }

    fn clone_policy(&self) -> Arc<dyn Lifetime> {
        Arc::new(PerRequestLifetime::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scope::ScopeManager;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_create(counter: Arc<AtomicUsize>) -> impl Fn() -> DiResult<Instance> {
        move || Ok(Arc::new(counter.fetch_add(1, Ordering::SeqCst)) as Instance)
    }

    #[test]
    fn test_per_container_creates_once_and_disposes() {
        let lifetime = PerContainerLifetime::new();
        let created = Arc::new(AtomicUsize::new(0));
        let disposed = Arc::new(AtomicUsize::new(0));
        let disposed_clone = Arc::clone(&disposed);
        let disposer: DisposerFn = Arc::new(move |_| {
            disposed_clone.fetch_add(1, Ordering::SeqCst);
        });
        let context = CreationContext {
            service: "svc",
            scope: None,
            disposer: Some(&disposer),
        };

        let create = counting_create(Arc::clone(&created));
        let first = lifetime.get_instance(&create, &context).unwrap();
        let second = lifetime.get_instance(&create, &context).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(created.load(Ordering::SeqCst), 1);

        lifetime.dispose();
        assert_eq!(disposed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_per_scope_requires_scope_and_isolates() {
        let lifetime = PerScopeLifetime::new();
        let created = Arc::new(AtomicUsize::new(0));
        let create = counting_create(Arc::clone(&created));

        let missing = CreationContext {
            service: "svc",
            scope: None,
            disposer: None,
        };
        assert!(matches!(
            lifetime.get_instance(&create, &missing),
            Err(DiError::ScopedInstanceWithoutScope { .. })
        ));

        let manager = ScopeManager::new();
        let scope_a = manager.begin_scope();
        let in_a = CreationContext {
            service: "svc",
            scope: Some(&scope_a),
            disposer: None,
        };
        let first = lifetime.get_instance(&create, &in_a).unwrap();
        let second = lifetime.get_instance(&create, &in_a).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        manager.end_scope(&scope_a).unwrap();

        // A later scope gets a fresh instance; the old entry is evicted.
        let scope_b = manager.begin_scope();
        let in_b = CreationContext {
            service: "svc",
            scope: Some(&scope_b),
            disposer: None,
        };
        let third = lifetime.get_instance(&create, &in_b).unwrap();
        assert!(!Arc::ptr_eq(&first, &third));
        assert_eq!(created.load(Ordering::SeqCst), 2);
        manager.end_scope(&scope_b).unwrap();
    }

    #[test]
    fn test_per_request_tracks_disposables_against_scope() {
        let lifetime = PerRequestLifetime::new();
        let created = Arc::new(AtomicUsize::new(0));
        let create = counting_create(Arc::clone(&created));
        let disposed = Arc::new(AtomicUsize::new(0));
        let disposed_clone = Arc::clone(&disposed);
        let disposer: DisposerFn = Arc::new(move |_| {
            disposed_clone.fetch_add(1, Ordering::SeqCst);
        });

        let missing = CreationContext {
            service: "svc",
            scope: None,
            disposer: Some(&disposer),
        };
        assert!(matches!(
            lifetime.get_instance(&create, &missing),
            Err(DiError::DisposableInstanceWithoutScope { .. })
        ));

        let manager = ScopeManager::new();
        let scope = manager.begin_scope();
        let context = CreationContext {
            service: "svc",
            scope: Some(&scope),
            disposer: Some(&disposer),
        };
        let first = lifetime.get_instance(&create, &context).unwrap();
        let second = lifetime.get_instance(&create, &context).unwrap();
        assert!(!Arc::ptr_eq(&first, &second));

        manager.end_scope(&scope).unwrap();
        assert_eq!(disposed.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_clone_policy_yields_fresh_state() {
        let lifetime = PerContainerLifetime::new();
        let created = Arc::new(AtomicUsize::new(0));
        let create = counting_create(Arc::clone(&created));
        let context = CreationContext {
            service: "svc",
            scope: None,
            disposer: None,
        };

        let first = lifetime.get_instance(&create, &context).unwrap();
        let cloned = lifetime.clone_policy();
        let second = cloned.get_instance(&create, &context).unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
    }
}
