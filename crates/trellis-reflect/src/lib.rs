//! Type descriptor registry for Trellis
//!
//! Rust has no runtime reflection, so this crate supplies the capability
//! the container and the interception engine program against: an explicit
//! registry of [`TypeDescriptor`] values describing constructors,
//! properties, methods and implemented contracts, each carrying invokable
//! closures over type-erased instances.
//!
//! Described types are identified by a cheap [`TypeKey`]. Native Rust
//! types key off `std::any::TypeId`; types minted at runtime (closed
//! generics, proxy types) receive synthetic keys from the registry.
//! Instances flow through the system as `Arc<dyn Any + Send + Sync>`
//! ([`Instance`]) and are downcast back at typed boundaries.
//!
//! ## Usage
//!
//! ```rust
//! use trellis_reflect::{TypeRegistry, TypeKey, param, instance_of, downcast_arc};
//!
//! struct Greeter { prefix: String }
//!
//! let registry = TypeRegistry::new();
//! let key = registry
//!     .describe::<Greeter>("Greeter")
//!     .constructor(vec![], |_deps| {
//!         Ok(Box::new(Greeter { prefix: "hi".into() }))
//!     })
//!     .build();
//!
//! let descriptor = registry.describe_key(key).unwrap();
//! let built = (descriptor.constructors[0].invoke)(vec![]).unwrap();
//! ```

mod builder;
mod descriptor;
mod error;
mod key;
mod registry;
mod runtime;

pub use builder::{param, TypeDescriptorBuilder};
pub use descriptor::{
    CastFn, ConstructorDescriptor, ConstructorFn, ContractCast, DisposerFn, GenericBinder,
    GenericInstantiator, GenericParam, GenericShape, MethodBody, MethodDescriptor, MethodFn,
    ParameterDescriptor, PropertyDescriptor, PropertySetter, ReturnValue, TypeDescriptor,
    TypeKind,
};
pub use error::ReflectError;
pub use key::{
    arg_ref, downcast_arc, downcast_contract, freeze, instance_of, BoxedInstance, DynError,
    Instance, TypeKey,
};
pub use registry::{StructuralDefs, TypeRegistry};
pub use runtime::{Disposable, InstanceFactory, Lazy, ParameterizedFactory, Sequence};
