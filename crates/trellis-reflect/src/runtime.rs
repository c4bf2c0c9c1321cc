//! Runtime value shapes produced by structural resolution
//!
//! These are the concrete values a resolved `Lazy<T>`, `Factory<R>`,
//! `FactoryWith<..>` or `Sequence<T>` service turns into. They live here
//! rather than in the container crate because the interception engine
//! also consumes them (lazy proxy targets).

use std::sync::Arc;

use once_cell::sync::OnceCell;

use crate::key::{downcast_arc, downcast_contract, DynError, Instance};

/// Container-managed disposal contract.
///
/// Rust's `Drop` runs when the last `Arc` clone dies; `Disposable` is the
/// deterministic, scope-ordered teardown the container drives itself.
pub trait Disposable: Send + Sync {
    fn dispose(&self);
}

type DeferredFn = Arc<dyn Fn() -> Result<Instance, DynError> + Send + Sync>;

/// A deferred service accessor. The underlying service is resolved on
/// first access and cached for the lifetime of the `Lazy`.
pub struct Lazy {
    cell: OnceCell<Instance>,
    resolve: DeferredFn,
}

impl Lazy {
    pub fn new(resolve: impl Fn() -> Result<Instance, DynError> + Send + Sync + 'static) -> Self {
        Self {
            cell: OnceCell::new(),
            resolve: Arc::new(resolve),
        }
    }

    /// Resolve (once) and return the underlying instance.
    pub fn get(&self) -> Result<Instance, DynError> {
        self.cell
            .get_or_try_init(|| (self.resolve)())
            .map(Arc::clone)
    }

    /// Resolve and downcast to a concrete type.
    pub fn get_as<T: Send + Sync + 'static>(&self) -> Result<Arc<T>, DynError> {
        downcast_arc::<T>(self.get()?)
    }

    /// Resolve and downcast to a contract type.
    pub fn get_contract<C: ?Sized + Send + Sync + 'static>(&self) -> Result<Arc<C>, DynError> {
        downcast_contract::<C>(self.get()?)
    }

    /// Whether the underlying service has been resolved yet.
    pub fn is_resolved(&self) -> bool {
        self.cell.get().is_some()
    }
}

/// A zero-argument factory for a service; each call resolves anew.
pub struct InstanceFactory {
    create: DeferredFn,
}

impl InstanceFactory {
    pub fn new(create: impl Fn() -> Result<Instance, DynError> + Send + Sync + 'static) -> Self {
        Self {
            create: Arc::new(create),
        }
    }

    pub fn create(&self) -> Result<Instance, DynError> {
        (self.create)()
    }

    pub fn create_as<T: Send + Sync + 'static>(&self) -> Result<Arc<T>, DynError> {
        downcast_arc::<T>(self.create()?)
    }
}

type ParameterizedFn = Arc<dyn Fn(Vec<Instance>) -> Result<Instance, DynError> + Send + Sync>;

/// A factory taking caller-supplied runtime arguments, which are passed
/// through to the registration's factory expression.
pub struct ParameterizedFactory {
    create: ParameterizedFn,
}

impl ParameterizedFactory {
    pub fn new(
        create: impl Fn(Vec<Instance>) -> Result<Instance, DynError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            create: Arc::new(create),
        }
    }

    pub fn create(&self, args: Vec<Instance>) -> Result<Instance, DynError> {
        (self.create)(args)
    }

    pub fn create_as<T: Send + Sync + 'static>(
        &self,
        args: Vec<Instance>,
    ) -> Result<Arc<T>, DynError> {
        downcast_arc::<T>(self.create(args)?)
    }
}

/// The materialized form of a `Sequence<T>` resolution: every registered
/// instance of the element type, in registration order.
pub struct Sequence {
    items: Vec<Instance>,
}

impl Sequence {
    pub fn new(items: Vec<Instance>) -> Self {
        Self { items }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn items(&self) -> &[Instance] {
        &self.items
    }

    /// Downcast every element to a concrete type.
    pub fn to_vec_of<T: Send + Sync + 'static>(&self) -> Result<Vec<Arc<T>>, DynError> {
        self.items
            .iter()
            .map(|item| downcast_arc::<T>(Arc::clone(item)))
            .collect()
    }

    /// Downcast every element to a contract type.
    pub fn to_contracts<C: ?Sized + Send + Sync + 'static>(&self) -> Result<Vec<Arc<C>>, DynError> {
        self.items
            .iter()
            .map(|item| downcast_contract::<C>(Arc::clone(item)))
            .collect()
    }
}
