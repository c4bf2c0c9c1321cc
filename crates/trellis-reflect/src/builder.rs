//! Fluent construction of type descriptors

use std::any::Any;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::descriptor::{
    ConstructorDescriptor, ContractCast, GenericInstantiator, GenericParam, MethodBody,
    MethodDescriptor, ParameterDescriptor, PropertyDescriptor, ReturnValue, TypeDescriptor,
    TypeKind,
};
use crate::key::{downcast_arc, BoxedInstance, DynError, Instance, TypeKey};
use crate::registry::TypeRegistry;
use crate::runtime::Disposable;

/// Shorthand for a [`ParameterDescriptor`].
pub fn param(name: impl Into<String>, service_key: TypeKey) -> ParameterDescriptor {
    ParameterDescriptor {
        name: name.into(),
        service_key,
    }
}

/// Builder returned by [`TypeRegistry::describe`] and friends.
///
/// The type parameter ties typed conveniences (`implements`,
/// `disposable`) to the described Rust type; untyped variants are
/// available for synthetic types.
pub struct TypeDescriptorBuilder<'r, T: ?Sized = ()> {
    registry: &'r TypeRegistry,
    key: TypeKey,
    descriptor: TypeDescriptor,
    _marker: PhantomData<fn(&T)>,
}

impl<'r, T: ?Sized> TypeDescriptorBuilder<'r, T> {
    pub(crate) fn new(
        registry: &'r TypeRegistry,
        key: TypeKey,
        name: String,
        kind: TypeKind,
    ) -> Self {
        Self {
            registry,
            key,
            descriptor: TypeDescriptor::named(name, kind),
            _marker: PhantomData,
        }
    }

    /// Declare a constructor. Declaration order is significant: it is the
    /// tie-break order used by constructor selection.
    pub fn constructor<F>(mut self, parameters: Vec<ParameterDescriptor>, invoke: F) -> Self
    where
        F: Fn(Vec<Instance>) -> Result<BoxedInstance, DynError> + Send + Sync + 'static,
    {
        self.descriptor.constructors.push(ConstructorDescriptor {
            parameters,
            invoke: Arc::new(invoke),
        });
        self
    }

    /// Declare an injectable property.
    pub fn property<F>(mut self, name: impl Into<String>, service_key: TypeKey, set: F) -> Self
    where
        F: Fn(&mut (dyn Any + Send + Sync), Instance) -> Result<(), DynError> + Send + Sync + 'static,
    {
        self.descriptor.properties.push(PropertyDescriptor {
            name: name.into(),
            service_key,
            set: Arc::new(set),
        });
        self
    }

    /// Declare an invokable method.
    pub fn method<F>(
        mut self,
        name: impl Into<String>,
        arity: usize,
        return_key: Option<TypeKey>,
        invoke: F,
    ) -> Self
    where
        F: Fn(&Instance, &mut Vec<BoxedInstance>) -> Result<ReturnValue, DynError>
            + Send
            + Sync
            + 'static,
    {
        self.descriptor.methods.push(Arc::new(MethodDescriptor {
            name: name.into(),
            arity,
            return_key,
            body: MethodBody::Concrete(Arc::new(invoke)),
        }));
        self
    }

    /// Declare a generic method. The binder closes the method over
    /// concrete type arguments on demand.
    pub fn generic_method<F>(
        mut self,
        name: impl Into<String>,
        arity: usize,
        return_key: Option<TypeKey>,
        bind: F,
    ) -> Self
    where
        F: Fn(&[TypeKey]) -> Result<crate::descriptor::MethodFn, DynError> + Send + Sync + 'static,
    {
        self.descriptor.methods.push(Arc::new(MethodDescriptor {
            name: name.into(),
            arity,
            return_key,
            body: MethodBody::Generic(Arc::new(bind)),
        }));
        self
    }

    /// Declare an implemented contract with an explicit cast closure.
    pub fn implements_with(mut self, contract: TypeKey, cast: crate::descriptor::CastFn) -> Self {
        self.descriptor.contracts.push(ContractCast { contract, cast });
        self
    }

    /// Turn this descriptor into an open generic definition.
    pub fn open_generic(
        mut self,
        params: Vec<GenericParam>,
        instantiator: GenericInstantiator,
    ) -> Self {
        self.descriptor.generic_params = params;
        self.descriptor.instantiator = Some(instantiator);
        self
    }

    /// Attach an explicit disposer closure.
    pub fn disposable_with(mut self, dispose: impl Fn(&Instance) + Send + Sync + 'static) -> Self {
        self.descriptor.disposer = Some(Arc::new(dispose));
        self
    }

    /// Register the descriptor and return its key.
    pub fn build(self) -> TypeKey {
        self.registry.register(self.key, self.descriptor)
    }
}

impl<'r, T: Send + Sync + 'static> TypeDescriptorBuilder<'r, T> {
    /// Declare that `T` implements contract `C`, with the coercion from
    /// `Arc<T>` to `Arc<C>` (usually just `|t| t`).
    pub fn implements<C>(self, cast: impl Fn(Arc<T>) -> Arc<C> + Send + Sync + 'static) -> Self
    where
        C: ?Sized + Send + Sync + 'static,
    {
        self.implements_with(
            TypeKey::of::<C>(),
            Arc::new(move |instance: Instance| {
                let concrete = downcast_arc::<T>(instance)?;
                Ok(Arc::new(cast(concrete)) as Instance)
            }),
        )
    }

    /// Track instances of `T` for container/scope-managed disposal.
    pub fn disposable(self) -> Self
    where
        T: Disposable,
    {
        self.disposable_with(|instance: &Instance| {
            if let Some(value) = instance.downcast_ref::<T>() {
                value.dispose();
            } else if let Some(contract) = instance.downcast_ref::<Arc<T>>() {
                contract.dispose();
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::instance_of;

    struct Repo {
        limit: usize,
    }

    trait Store: Send + Sync {
        fn limit(&self) -> usize;
    }

    impl Store for Repo {
        fn limit(&self) -> usize {
            self.limit
        }
    }

    #[test]
    fn test_constructor_and_contract_cast() {
        let registry = TypeRegistry::new();
        let key = registry
            .describe::<Repo>("Repo")
            .constructor(vec![], |_| Ok(Box::new(Repo { limit: 3 })))
            .implements::<dyn Store>(|repo| repo)
            .build();

        let descriptor = registry.describe_key(key).unwrap();
        let raw = crate::key::freeze((descriptor.constructors[0].invoke)(vec![]).unwrap());
        let cast = descriptor.cast_to(TypeKey::of::<dyn Store>()).unwrap();
        let contract = cast(raw).unwrap();
        let store = crate::key::downcast_contract::<dyn Store>(contract).unwrap();
        assert_eq!(store.limit(), 3);
    }

    #[test]
    fn test_property_setter_mutates_boxed_instance() {
        let registry = TypeRegistry::new();
        let key = registry
            .describe::<Repo>("Repo")
            .constructor(vec![], |_| Ok(Box::new(Repo { limit: 0 })))
            .property("limit", TypeKey::of::<usize>(), |target, value| {
                let repo = target
                    .downcast_mut::<Repo>()
                    .ok_or("expected Repo")?;
                repo.limit = *downcast_arc::<usize>(value)?;
                Ok(())
            })
            .build();

        let descriptor = registry.describe_key(key).unwrap();
        let mut boxed = (descriptor.constructors[0].invoke)(vec![]).unwrap();
        (descriptor.properties[0].set)(boxed.as_mut(), instance_of(9usize)).unwrap();
        let repo = boxed.downcast_ref::<Repo>().unwrap();
        assert_eq!(repo.limit, 9);
    }

    #[test]
    fn test_method_invocation() {
        let registry = TypeRegistry::new();
        let key = registry
            .describe::<Repo>("Repo")
            .constructor(vec![], |_| Ok(Box::new(Repo { limit: 7 })))
            .method("limit", 0, Some(TypeKey::of::<usize>()), |target, _args| {
                let repo = downcast_arc::<Repo>(Arc::clone(target))?;
                Ok(Some(Box::new(repo.limit) as BoxedInstance))
            })
            .build();

        let descriptor = registry.describe_key(key).unwrap();
        let instance = crate::key::freeze((descriptor.constructors[0].invoke)(vec![]).unwrap());
        let method = descriptor.method("limit").unwrap();
        let result = match &method.body {
            MethodBody::Concrete(invoke) => invoke(&instance, &mut Vec::new()).unwrap(),
            MethodBody::Generic(_) => unreachable!(),
        };
        assert_eq!(*result.unwrap().downcast_ref::<usize>().unwrap(), 7);
    }
}
