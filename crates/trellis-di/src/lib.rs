//! Runtime dependency-injection container with method interception
//!
//! Services are described in a [`trellis_reflect::TypeRegistry`] and
//! registered against a [`ServiceContainer`] by type, factory expression
//! or pinned value, optionally named and optionally bound to a lifetime
//! policy. Resolution compiles each (service, name) request into a cached
//! emitter graph: constructor selection, decorator wrapping, lifetime
//! caching and structural shapes (`Lazy<T>`, factories, sequences) are
//! all decided once, then replayed lock-free on every later request.
//!
//! Interception builds on decoration: [`ServiceContainer::intercept`]
//! synthesizes a proxy type per matched service and routes its method
//! calls through an interceptor chain.
//!
//! ```no_run
//! use std::sync::Arc;
//! use trellis_di::{PerContainerLifetime, ServiceContainer};
//! use trellis_reflect::TypeKey;
//!
//! struct Clock;
//!
//! # fn main() -> trellis_di::DiResult<()> {
//! let container = ServiceContainer::new();
//! container
//!     .registry()
//!     .describe::<Clock>("Clock")
//!     .constructor(vec![], |_| Ok(Box::new(Clock)))
//!     .build();
//! container.register_as::<Clock, Clock>(Some(Arc::new(PerContainerLifetime::new())));
//! let clock = container.get_as::<Clock>()?;
//! # let _ = clock;
//! # Ok(())
//! # }
//! ```

mod construction;
mod container;
mod error;
mod factory;
mod lifetime;
mod provider;
mod registration;
mod resolver;
mod scanning;
mod scope;

pub use container::{ContainerOptions, ContainerStats, ServiceContainer};
pub use error::{DiError, DiResult};
pub use factory::{DependencyFactory, FactoryExpr, FallbackFactory, OpaqueFactory};
pub use lifetime::{
    CreationContext, Lifetime, PerContainerLifetime, PerRequestLifetime, PerScopeLifetime,
};
pub use provider::{CompositionRoot, CompositionRootRegistry};
pub use registration::{
    DecoratorPredicate, FallbackPredicate, FallbackRule, ImplementingTypeFactory,
    ServiceRegistration,
};
pub use scanning::{
    convention_name, LifetimeFactory, ListScanner, ScanRegistrar, ShouldRegister, TypeScanner,
};
pub use scope::{Scope, ScopeHandle, ScopeManager};
