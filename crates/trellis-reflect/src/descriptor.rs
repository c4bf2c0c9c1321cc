//! Type and member descriptors
//!
//! A [`TypeDescriptor`] is the unit of "reflection" in Trellis: it names a
//! type, lists its constructors, properties and methods, and carries the
//! closures that actually construct instances, set properties and invoke
//! methods against the type-erased instance representation.

use std::any::Any;
use std::sync::Arc;

use crate::error::ReflectError;
use crate::key::{BoxedInstance, DynError, Instance, TypeKey};
use crate::registry::TypeRegistry;

/// Whether a described type is an abstract contract (trait object) or a
/// concrete, constructible type.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TypeKind {
    Contract,
    Concrete,
}

/// A constructor or method parameter: its name and the service type it
/// expects. The name doubles as a secondary disambiguator when resolving
/// named services by convention.
#[derive(Clone, Debug)]
pub struct ParameterDescriptor {
    pub name: String,
    pub service_key: TypeKey,
}

/// Builds an instance from already-resolved dependency instances, in
/// parameter order. The result stays boxed so property injection can
/// mutate it before it is frozen.
pub type ConstructorFn = Arc<dyn Fn(Vec<Instance>) -> Result<BoxedInstance, DynError> + Send + Sync>;

pub struct ConstructorDescriptor {
    pub parameters: Vec<ParameterDescriptor>,
    pub invoke: ConstructorFn,
}

/// Writes a resolved dependency into a property of a not-yet-frozen
/// instance.
pub type PropertySetter =
    Arc<dyn Fn(&mut (dyn Any + Send + Sync), Instance) -> Result<(), DynError> + Send + Sync>;

pub struct PropertyDescriptor {
    pub name: String,
    pub service_key: TypeKey,
    pub set: PropertySetter,
}

/// A method's return value; `None` models unit-returning methods.
pub type ReturnValue = Option<BoxedInstance>;

/// Invokes a method on a target instance. Arguments are mutable in place
/// so out-parameter style mutation propagates back to the caller.
pub type MethodFn =
    Arc<dyn Fn(&Instance, &mut Vec<BoxedInstance>) -> Result<ReturnValue, DynError> + Send + Sync>;

/// Closes a generic method over concrete type arguments, yielding a
/// directly invokable binding.
pub type GenericBinder = Arc<dyn Fn(&[TypeKey]) -> Result<MethodFn, DynError> + Send + Sync>;

pub enum MethodBody {
    Concrete(MethodFn),
    Generic(GenericBinder),
}

pub struct MethodDescriptor {
    pub name: String,
    pub arity: usize,
    /// Declared return type, when one is declared at all. Used by the
    /// proxy engine to recognize fluent methods that may return the
    /// target itself.
    pub return_key: Option<TypeKey>,
    pub body: MethodBody,
}

impl MethodDescriptor {
    pub fn is_generic(&self) -> bool {
        matches!(self.body, MethodBody::Generic(_))
    }
}

/// Re-wraps a concrete instance as one of its contracts.
pub type CastFn = Arc<dyn Fn(Instance) -> Result<Instance, DynError> + Send + Sync>;

pub struct ContractCast {
    pub contract: TypeKey,
    pub cast: CastFn,
}

/// Container-managed disposal hook; stands in for a disposal contract
/// check that reflection would provide elsewhere.
pub type DisposerFn = Arc<dyn Fn(&Instance) + Send + Sync>;

#[derive(Clone, Debug)]
pub struct GenericParam {
    pub name: String,
    pub constraints: Vec<TypeKey>,
}

/// The generic structure of a type: its open definition and the argument
/// keys it is closed over. Open definitions carry an empty `args` list.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct GenericShape {
    pub definition: TypeKey,
    pub args: Vec<TypeKey>,
}

/// Produces the descriptor of a closed generic type from the open
/// definition, given concrete argument keys.
pub type GenericInstantiator =
    Arc<dyn Fn(&TypeRegistry, &[TypeKey]) -> Result<TypeDescriptor, ReflectError> + Send + Sync>;

/// Full description of a type known to the registry.
pub struct TypeDescriptor {
    pub name: String,
    pub kind: TypeKind,
    pub generic: Option<GenericShape>,
    pub generic_params: Vec<GenericParam>,
    pub instantiator: Option<GenericInstantiator>,
    pub constructors: Vec<ConstructorDescriptor>,
    pub properties: Vec<PropertyDescriptor>,
    pub methods: Vec<Arc<MethodDescriptor>>,
    pub contracts: Vec<ContractCast>,
    pub disposer: Option<DisposerFn>,
}

impl TypeDescriptor {
    /// A bare descriptor with no members.
    pub fn named(name: impl Into<String>, kind: TypeKind) -> Self {
        Self {
            name: name.into(),
            kind,
            generic: None,
            generic_params: Vec::new(),
            instantiator: None,
            constructors: Vec::new(),
            properties: Vec::new(),
            methods: Vec::new(),
            contracts: Vec::new(),
            disposer: None,
        }
    }

    pub fn is_open_generic(&self) -> bool {
        !self.generic_params.is_empty() && self.instantiator.is_some()
    }

    /// The cast from this type to `contract`, if declared.
    pub fn cast_to(&self, contract: TypeKey) -> Option<&CastFn> {
        self.contracts
            .iter()
            .find(|c| c.contract == contract)
            .map(|c| &c.cast)
    }

    pub fn implements(&self, contract: TypeKey) -> bool {
        self.contracts.iter().any(|c| c.contract == contract)
    }

    pub fn contract_keys(&self) -> impl Iterator<Item = TypeKey> + '_ {
        self.contracts.iter().map(|c| c.contract)
    }

    pub fn method(&self, name: &str) -> Option<&Arc<MethodDescriptor>> {
        self.methods.iter().find(|m| m.name == name)
    }
}

impl std::fmt::Debug for TypeDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypeDescriptor")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("generic", &self.generic)
            .field("constructors", &self.constructors.len())
            .field("properties", &self.properties.len())
            .field("methods", &self.methods.len())
            .field("contracts", &self.contracts.len())
            .finish()
    }
}
