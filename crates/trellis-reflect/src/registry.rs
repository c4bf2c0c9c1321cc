//! The descriptor registry
//!
//! Interns descriptors under [`TypeKey`]s, allocates synthetic keys for
//! runtime-minted types, closes open generic definitions against concrete
//! arguments and mints the structural shapes (`Lazy<T>`, factories,
//! sequences) the resolution engine recognizes.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

use crate::builder::TypeDescriptorBuilder;
use crate::descriptor::{GenericShape, TypeDescriptor, TypeKind};
use crate::error::ReflectError;
use crate::key::TypeKey;

/// Keys of the well-known open generic definitions used for structural
/// resolution. Minted once per registry.
#[derive(Clone, Copy, Debug)]
pub struct StructuralDefs {
    /// `Lazy<T>`: deferred accessor for a single service.
    pub lazy: TypeKey,
    /// `Factory<R>`: zero-argument instance factory.
    pub factory: TypeKey,
    /// `FactoryWith<T1..Tn, R>`: factory taking runtime arguments; the
    /// last shape argument is the result type.
    pub parameterized_factory: TypeKey,
    /// `Sequence<T>`: all registered instances of an element type.
    pub sequence: TypeKey,
}

pub struct TypeRegistry {
    descriptors: DashMap<TypeKey, Arc<TypeDescriptor>>,
    shapes: DashMap<TypeKey, GenericShape>,
    closed: DashMap<(TypeKey, Vec<TypeKey>), TypeKey>,
    synthetic: AtomicU64,
    structural: StructuralDefs,
}

impl TypeRegistry {
    pub fn new() -> Self {
        let synthetic = AtomicU64::new(1);
        let descriptors = DashMap::new();

        let mut mint = |name: &str| {
            let key = TypeKey::Synthetic(synthetic.fetch_add(1, Ordering::Relaxed));
            descriptors.insert(key, Arc::new(TypeDescriptor::named(name, TypeKind::Contract)));
            key
        };
        let structural = StructuralDefs {
            lazy: mint("Lazy"),
            factory: mint("Factory"),
            parameterized_factory: mint("FactoryWith"),
            sequence: mint("Sequence"),
        };

        Self {
            descriptors,
            shapes: DashMap::new(),
            closed: DashMap::new(),
            synthetic,
            structural,
        }
    }

    pub fn structural(&self) -> &StructuralDefs {
        &self.structural
    }

    fn next_synthetic(&self) -> TypeKey {
        TypeKey::Synthetic(self.synthetic.fetch_add(1, Ordering::Relaxed))
    }

    /// Start describing a concrete native type.
    pub fn describe<T: Send + Sync + 'static>(
        &self,
        name: impl Into<String>,
    ) -> TypeDescriptorBuilder<'_, T> {
        TypeDescriptorBuilder::new(self, TypeKey::of::<T>(), name.into(), TypeKind::Concrete)
    }

    /// Start describing a contract (trait object) type.
    pub fn describe_contract<C: ?Sized + 'static>(
        &self,
        name: impl Into<String>,
    ) -> TypeDescriptorBuilder<'_, C> {
        TypeDescriptorBuilder::new(self, TypeKey::of::<C>(), name.into(), TypeKind::Contract)
    }

    /// Start describing a runtime-minted type under a fresh synthetic key.
    pub fn describe_synthetic(&self, name: impl Into<String>) -> TypeDescriptorBuilder<'_, ()> {
        TypeDescriptorBuilder::new(self, self.next_synthetic(), name.into(), TypeKind::Concrete)
    }

    /// Register a fully built descriptor under `key`, replacing any
    /// previous descriptor for the same key.
    pub fn register(&self, key: TypeKey, descriptor: TypeDescriptor) -> TypeKey {
        debug!(type_name = %descriptor.name, ?key, "registering type descriptor");
        if let Some(shape) = descriptor.generic.clone() {
            self.shapes.insert(key, shape);
        }
        self.descriptors.insert(key, Arc::new(descriptor));
        key
    }

    /// Register a descriptor under a fresh synthetic key.
    pub fn register_synthetic(&self, descriptor: TypeDescriptor) -> TypeKey {
        self.register(self.next_synthetic(), descriptor)
    }

    /// Look up the descriptor for `key`.
    pub fn describe_key(&self, key: TypeKey) -> Option<Arc<TypeDescriptor>> {
        self.descriptors.get(&key).map(|entry| Arc::clone(&entry))
    }

    /// Display name for a key, falling back to the raw key for unknown
    /// types (useful in error messages).
    pub fn name_of(&self, key: TypeKey) -> String {
        self.describe_key(key)
            .map(|d| d.name.clone())
            .unwrap_or_else(|| format!("{key:?}"))
    }

    /// The generic shape of `key`, if it is a closed generic or a
    /// structural shape.
    pub fn shape_of(&self, key: TypeKey) -> Option<GenericShape> {
        self.shapes.get(&key).map(|entry| entry.clone())
    }

    /// Mint (or reuse) the key for a structural shape closed over `args`.
    fn structural_key(&self, definition: TypeKey, args: Vec<TypeKey>, name: String) -> TypeKey {
        if let Some(existing) = self.closed.get(&(definition, args.clone())) {
            return *existing;
        }
        let key = self.next_synthetic();
        let shape = GenericShape {
            definition,
            args: args.clone(),
        };
        let mut descriptor = TypeDescriptor::named(name, TypeKind::Contract);
        descriptor.generic = Some(shape.clone());
        self.shapes.insert(key, shape);
        self.descriptors.insert(key, Arc::new(descriptor));
        self.closed.insert((definition, args), key);
        key
    }

    /// Key for `Lazy<item>`.
    pub fn lazy_of(&self, item: TypeKey) -> TypeKey {
        let name = format!("Lazy<{}>", self.name_of(item));
        self.structural_key(self.structural.lazy, vec![item], name)
    }

    /// Key for `Factory<result>`.
    pub fn factory_of(&self, result: TypeKey) -> TypeKey {
        let name = format!("Factory<{}>", self.name_of(result));
        self.structural_key(self.structural.factory, vec![result], name)
    }

    /// Key for `FactoryWith<params.., result>`.
    pub fn parameterized_factory_of(&self, params: &[TypeKey], result: TypeKey) -> TypeKey {
        let mut args = params.to_vec();
        args.push(result);
        let name = format!("FactoryWith<{}>", self.name_of(result));
        self.structural_key(self.structural.parameterized_factory, args, name)
    }

    /// Key for `Sequence<item>`.
    pub fn sequence_of(&self, item: TypeKey) -> TypeKey {
        let name = format!("Sequence<{}>", self.name_of(item));
        self.structural_key(self.structural.sequence, vec![item], name)
    }

    /// Close an open generic definition over concrete argument keys.
    ///
    /// Checks the definition's constraints against the arguments'
    /// declared contracts, runs the definition's instantiator and interns
    /// the resulting descriptor. Closing the same definition over the
    /// same arguments twice yields the same key.
    pub fn close_generic(
        &self,
        definition: TypeKey,
        args: &[TypeKey],
    ) -> Result<TypeKey, ReflectError> {
        if let Some(existing) = self.closed.get(&(definition, args.to_vec())) {
            return Ok(*existing);
        }

        let open = self
            .describe_key(definition)
            .ok_or_else(|| ReflectError::UnknownType {
                type_name: format!("{definition:?}"),
            })?;
        let instantiator = match &open.instantiator {
            Some(instantiator) if !open.generic_params.is_empty() => Arc::clone(instantiator),
            _ => {
                return Err(ReflectError::NotAGenericDefinition {
                    type_name: open.name.clone(),
                })
            }
        };
        if open.generic_params.len() != args.len() {
            return Err(ReflectError::GenericArityMismatch {
                type_name: open.name.clone(),
                expected: open.generic_params.len(),
                actual: args.len(),
            });
        }

        for (parameter, argument) in open.generic_params.iter().zip(args) {
            for constraint in &parameter.constraints {
                let satisfied = self
                    .describe_key(*argument)
                    .map(|d| d.implements(*constraint))
                    .unwrap_or(false)
                    || argument == constraint;
                if !satisfied {
                    return Err(ReflectError::ConstraintViolation {
                        definition: open.name.clone(),
                        parameter: parameter.name.clone(),
                        argument: self.name_of(*argument),
                        constraint: self.name_of(*constraint),
                    });
                }
            }
        }

        let mut descriptor = instantiator(self, args)?;
        descriptor.generic = Some(GenericShape {
            definition,
            args: args.to_vec(),
        });

        let key = self.register_synthetic(descriptor);
        self.closed.insert((definition, args.to_vec()), key);
        debug!(?definition, ?args, ?key, "closed generic definition");
        Ok(key)
    }
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::GenericParam;
    use crate::key::instance_of;

    #[test]
    fn test_structural_keys_are_memoized() {
        let registry = TypeRegistry::new();
        let item = TypeKey::of::<u32>();
        assert_eq!(registry.lazy_of(item), registry.lazy_of(item));
        assert_ne!(registry.lazy_of(item), registry.sequence_of(item));
    }

    #[test]
    fn test_shape_of_structural_key() {
        let registry = TypeRegistry::new();
        let item = TypeKey::of::<u32>();
        let key = registry.sequence_of(item);
        let shape = registry.shape_of(key).unwrap();
        assert_eq!(shape.definition, registry.structural().sequence);
        assert_eq!(shape.args, vec![item]);
    }

    #[test]
    fn test_close_generic_requires_definition() {
        let registry = TypeRegistry::new();
        let not_generic = registry
            .describe::<u32>("u32")
            .constructor(vec![], |_| Ok(Box::new(0u32)))
            .build();
        let err = registry.close_generic(not_generic, &[TypeKey::of::<u8>()]);
        assert!(matches!(err, Err(ReflectError::NotAGenericDefinition { .. })));
    }

    #[test]
    fn test_close_generic_interns_and_memoizes() {
        let registry = TypeRegistry::new();
        let definition = registry.register_synthetic({
            let mut d = TypeDescriptor::named("Pair", TypeKind::Concrete);
            d.generic_params = vec![GenericParam {
                name: "T".into(),
                constraints: vec![],
            }];
            d.instantiator = Some(Arc::new(|registry: &TypeRegistry, args: &[TypeKey]| {
                let mut closed =
                    TypeDescriptor::named(format!("Pair<{}>", registry.name_of(args[0])), TypeKind::Concrete);
                closed.constructors.push(crate::ConstructorDescriptor {
                    parameters: vec![],
                    invoke: Arc::new(|_| Ok(Box::new("pair".to_string()))),
                });
                Ok(closed)
            }));
            d
        });

        let arg = registry
            .describe::<u32>("u32")
            .constructor(vec![], |_| Ok(Box::new(0u32)))
            .build();

        let first = registry.close_generic(definition, &[arg]).unwrap();
        let second = registry.close_generic(definition, &[arg]).unwrap();
        assert_eq!(first, second);

        let descriptor = registry.describe_key(first).unwrap();
        assert_eq!(descriptor.name, "Pair<u32>");
        assert_eq!(descriptor.generic.as_ref().unwrap().definition, definition);
    }

    #[test]
    fn test_constraint_violation() {
        let registry = TypeRegistry::new();
        trait Bound: Send + Sync {}
        let bound = TypeKey::of::<dyn Bound>();

        let definition = registry.register_synthetic({
            let mut d = TypeDescriptor::named("Constrained", TypeKind::Concrete);
            d.generic_params = vec![GenericParam {
                name: "T".into(),
                constraints: vec![bound],
            }];
            d.instantiator = Some(Arc::new(|_, _| {
                Ok(TypeDescriptor::named("Constrained<..>", TypeKind::Concrete))
            }));
            d
        });

        let plain = registry
            .describe::<String>("String")
            .constructor(vec![], |_| Ok(Box::new(String::new())))
            .build();

        let err = registry.close_generic(definition, &[plain]);
        assert!(matches!(err, Err(ReflectError::ConstraintViolation { .. })));

        // u64 declares the contract, so it passes.
        let ok = registry
            .describe::<u64>("u64")
            .constructor(vec![], |_| Ok(Box::new(0u64)))
            .implements_with(bound, Arc::new(|instance| Ok(instance)))
            .build();
        assert!(registry.close_generic(definition, &[ok]).is_ok());
        let _ = instance_of(0u8);
    }
}
