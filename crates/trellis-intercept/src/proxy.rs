//! Proxy type synthesis and runtime dispatch
//!
//! [`ProxyBuilder::get_proxy_type`] consumes an immutable
//! [`ProxyDefinition`] and registers a fresh synthetic type whose single
//! constructor takes the target (raw, or behind a `Lazy` when the
//! definition asks for a deferred target) and yields a [`ProxyInstance`].
//! The dispatch table is computed once per synthesized type; interceptors
//! themselves are materialized lazily, once per proxy instance.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use once_cell::sync::OnceCell;
use tracing::debug;

use trellis_reflect::{
    downcast_arc, param, BoxedInstance, Instance, Lazy, MethodBody, MethodDescriptor, MethodFn,
    ReturnValue, TypeDescriptor, TypeKey, TypeKind, TypeRegistry,
};

use crate::error::InterceptError;
use crate::invocation::{Interceptor, Invocation};

/// Creates one interceptor; called lazily, once per proxy instance that
/// actually hits an intercepted method.
pub type InterceptorFactory = Arc<dyn Fn() -> Arc<dyn Interceptor> + Send + Sync>;

/// Selects which of the target's methods an interceptor applies to.
pub type MethodSelector = Arc<dyn Fn(&MethodDescriptor) -> bool + Send + Sync>;

#[derive(Clone)]
pub struct InterceptorInfo {
    pub factory: InterceptorFactory,
    pub selector: MethodSelector,
    /// Registration order; interceptors run in ascending index order.
    pub index: usize,
}

static NEXT_DEFINITION_ID: AtomicU64 = AtomicU64::new(1);

/// Describes the proxy to synthesize: the target contract, any additional
/// interfaces whose methods the proxy also exposes, and the ordered
/// interceptor registrations. Immutable once handed to the builder.
pub struct ProxyDefinition {
    id: u64,
    target: TypeKey,
    additional_interfaces: Vec<TypeKey>,
    use_lazy_target: bool,
    interceptors: Vec<InterceptorInfo>,
}

impl ProxyDefinition {
    pub fn new(target: TypeKey) -> Self {
        Self {
            id: NEXT_DEFINITION_ID.fetch_add(1, Ordering::Relaxed),
            target,
            additional_interfaces: Vec::new(),
            use_lazy_target: false,
            interceptors: Vec::new(),
        }
    }

    /// Defer target creation until the first method actually needs it.
    pub fn set_lazy_target(&mut self, lazy: bool) -> &mut Self {
        self.use_lazy_target = lazy;
        self
    }

    /// Expose the methods of an additional interface through the proxy.
    pub fn add_interface(&mut self, interface: TypeKey) -> &mut Self {
        self.additional_interfaces.push(interface);
        self
    }

    /// Register an interceptor for the methods matched by `selector`.
    pub fn implement(
        &mut self,
        selector: impl Fn(&MethodDescriptor) -> bool + Send + Sync + 'static,
        factory: impl Fn() -> Arc<dyn Interceptor> + Send + Sync + 'static,
    ) -> &mut Self {
        let index = self.interceptors.len();
        self.interceptors.push(InterceptorInfo {
            factory: Arc::new(factory),
            selector: Arc::new(selector),
            index,
        });
        self
    }

    /// Register an interceptor for every interceptable method.
    pub fn implement_all(
        &mut self,
        factory: impl Fn() -> Arc<dyn Interceptor> + Send + Sync + 'static,
    ) -> &mut Self {
        self.implement(|_| true, factory)
    }

    pub fn target(&self) -> TypeKey {
        self.target
    }

    pub fn use_lazy_target(&self) -> bool {
        self.use_lazy_target
    }
}

/// One row of a proxy's dispatch table.
struct MethodEntry {
    descriptor: Arc<MethodDescriptor>,
    /// Indices into the definition's interceptor list, ascending by
    /// registration index. Empty means pass-through.
    interceptor_slots: Vec<usize>,
}

struct ProxyShape {
    target_name: String,
    entries: Vec<MethodEntry>,
    interceptors: Vec<InterceptorInfo>,
}

/// Synthesizes proxy types. Stateless apart from memoization: a given
/// (target, definition) pair is synthesized once.
pub struct ProxyBuilder {
    synthesized: DashMap<(TypeKey, u64), TypeKey>,
}

impl ProxyBuilder {
    pub fn new() -> Self {
        Self {
            synthesized: DashMap::new(),
        }
    }

    /// Synthesize (or reuse) the proxy type for `definition`.
    pub fn get_proxy_type(
        &self,
        registry: &TypeRegistry,
        definition: &ProxyDefinition,
    ) -> Result<TypeKey, InterceptError> {
        if let Some(existing) = self.synthesized.get(&(definition.target, definition.id)) {
            return Ok(*existing);
        }

        let target = registry.describe_key(definition.target).ok_or_else(|| {
            InterceptError::UnableToDetermineImplementingType {
                type_name: registry.name_of(definition.target),
            }
        })?;
        // A concrete target the container cannot construct has no usable
        // shape for any target-acquisition mode.
        if target.kind == TypeKind::Concrete && target.constructors.is_empty() {
            return Err(InterceptError::UnableToDetermineImplementingType {
                type_name: target.name.clone(),
            });
        }

        let mut methods: Vec<Arc<MethodDescriptor>> = target.methods.clone();
        for interface in &definition.additional_interfaces {
            if let Some(descriptor) = registry.describe_key(*interface) {
                methods.extend(descriptor.methods.iter().cloned());
            }
        }

        let entries: Vec<MethodEntry> = methods
            .into_iter()
            .map(|descriptor| {
                let mut slots: Vec<usize> = definition
                    .interceptors
                    .iter()
                    .filter(|info| (info.selector)(&descriptor))
                    .map(|info| info.index)
                    .collect();
                slots.sort_unstable();
                MethodEntry {
                    descriptor,
                    interceptor_slots: slots,
                }
            })
            .collect();

        let target_param = if definition.use_lazy_target {
            param("target", registry.lazy_of(definition.target))
        } else {
            param("target", definition.target)
        };

        let shape = Arc::new(ProxyShape {
            target_name: target.name.clone(),
            entries,
            interceptors: definition.interceptors.clone(),
        });

        let proxy_name = format!("{}Proxy", target.name);
        let use_lazy = definition.use_lazy_target;
        let ctor_shape = Arc::clone(&shape);
        let mut builder = registry
            .describe_synthetic(proxy_name.clone())
            .constructor(vec![target_param], move |mut deps| {
                if deps.is_empty() {
                    return Err(Box::new(InterceptError::TargetUnavailable {
                        reason: "proxy constructor called without a target".into(),
                    }) as trellis_reflect::DynError);
                }
                let supplied = deps.remove(0);
                let target_ref = if use_lazy {
                    TargetRef::Deferred(downcast_arc::<Lazy>(supplied)?)
                } else {
                    TargetRef::Eager(supplied)
                };
                Ok(Box::new(ProxyInstance::new(target_ref, Arc::clone(&ctor_shape)))
                    as BoxedInstance)
            });

        // Mirror the target's methods on the proxy descriptor so the
        // proxy stays invokable through the ordinary descriptor path.
        for (entry_index, entry) in shape.entries.iter().enumerate() {
            let name = entry.descriptor.name.clone();
            let arity = entry.descriptor.arity;
            let return_key = entry.descriptor.return_key;
            match &entry.descriptor.body {
                MethodBody::Concrete(_) => {
                    builder = builder.method(name, arity, return_key, move |instance, args| {
                        let proxy = downcast_arc::<ProxyInstance>(Arc::clone(instance))?;
                        let mut taken = std::mem::take(args);
                        let result = proxy.dispatch(entry_index, None, &mut taken);
                        *args = taken;
                        result.map_err(|e| Box::new(e) as trellis_reflect::DynError)
                    });
                }
                MethodBody::Generic(_) => {
                    builder = builder.generic_method(name, arity, return_key, move |type_args| {
                        let bound_args = type_args.to_vec();
                        Ok(Arc::new(move |instance: &Instance, args: &mut Vec<BoxedInstance>| {
                            let proxy = downcast_arc::<ProxyInstance>(Arc::clone(instance))?;
                            let mut taken = std::mem::take(args);
                            let result = proxy.dispatch(entry_index, Some(&bound_args), &mut taken);
                            *args = taken;
                            result.map_err(|e| Box::new(e) as trellis_reflect::DynError)
                        }) as MethodFn)
                    });
                }
            }
        }

        let key = builder.build();
        self.synthesized
            .insert((definition.target, definition.id), key);
        debug!(target = %shape.target_name, proxy = %proxy_name, ?key, "synthesized proxy type");
        Ok(key)
    }
}

impl Default for ProxyBuilder {
    fn default() -> Self {
        Self::new()
    }
}

enum TargetRef {
    Eager(Instance),
    Deferred(Arc<Lazy>),
}

/// The runtime stand-in for the target: holds the (possibly deferred)
/// target instance and the per-method dispatch table.
pub struct ProxyInstance {
    target: TargetRef,
    shape: Arc<ProxyShape>,
    /// Interceptors materialize on first use, one cell per registration.
    lazy_interceptors: Vec<OnceCell<Arc<dyn Interceptor>>>,
    /// Closed bindings of generic target methods, keyed by
    /// (method row, type-argument array) with element-wise equality.
    generic_bindings: DashMap<(usize, Vec<TypeKey>), MethodFn>,
    /// Calls that actually reached the target; used by tests and
    /// diagnostics.
    target_calls: AtomicUsize,
}

impl ProxyInstance {
    fn new(target: TargetRef, shape: Arc<ProxyShape>) -> Self {
        let lazy_interceptors = (0..shape.interceptors.len()).map(|_| OnceCell::new()).collect();
        Self {
            target,
            shape,
            lazy_interceptors,
            generic_bindings: DashMap::new(),
            target_calls: AtomicUsize::new(0),
        }
    }

    /// The real target instance, resolving a deferred target on demand.
    pub fn target(&self) -> Result<Instance, InterceptError> {
        match &self.target {
            TargetRef::Eager(instance) => Ok(Arc::clone(instance)),
            TargetRef::Deferred(lazy) => {
                lazy.get().map_err(|e| InterceptError::TargetUnavailable {
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Whether a deferred target has been created yet. Always true for an
    /// eager target.
    pub fn target_created(&self) -> bool {
        match &self.target {
            TargetRef::Eager(_) => true,
            TargetRef::Deferred(lazy) => lazy.is_resolved(),
        }
    }

    /// Number of invocations that reached the real target.
    pub fn target_call_count(&self) -> usize {
        self.target_calls.load(Ordering::Relaxed)
    }

    /// Invoke a non-generic method by name.
    pub fn invoke(
        self: &Arc<Self>,
        method: &str,
        args: Vec<BoxedInstance>,
    ) -> Result<ReturnValue, InterceptError> {
        let entry_index = self.entry_index(method)?;
        let mut args = args;
        self.dispatch(entry_index, None, &mut args)
    }

    /// Invoke a generic method by name, closed over `type_args`.
    pub fn invoke_generic(
        self: &Arc<Self>,
        method: &str,
        type_args: &[TypeKey],
        args: Vec<BoxedInstance>,
    ) -> Result<ReturnValue, InterceptError> {
        let entry_index = self.entry_index(method)?;
        let mut args = args;
        self.dispatch(entry_index, Some(type_args), &mut args)
    }

    fn entry_index(&self, method: &str) -> Result<usize, InterceptError> {
        self.shape
            .entries
            .iter()
            .position(|entry| entry.descriptor.name == method)
            .ok_or_else(|| InterceptError::UnknownMethod {
                type_name: format!("{}Proxy", self.shape.target_name),
                method: method.to_string(),
            })
    }

    /// Resolve the directly invokable target-method binding, closing a
    /// generic method over its type arguments through the per-instance
    /// binding cache.
    fn target_method(
        &self,
        entry_index: usize,
        type_args: Option<&[TypeKey]>,
    ) -> Result<MethodFn, InterceptError> {
        let descriptor = &self.shape.entries[entry_index].descriptor;
        match (&descriptor.body, type_args) {
            (MethodBody::Concrete(invoke), None) => Ok(Arc::clone(invoke)),
            (MethodBody::Concrete(_), Some(_)) => Err(InterceptError::UnexpectedTypeArguments {
                method: descriptor.name.clone(),
            }),
            (MethodBody::Generic(_), None) => Err(InterceptError::MissingTypeArguments {
                method: descriptor.name.clone(),
            }),
            (MethodBody::Generic(bind), Some(args)) => {
                let cache_key = (entry_index, args.to_vec());
                if let Some(bound) = self.generic_bindings.get(&cache_key) {
                    return Ok(Arc::clone(&bound));
                }
                let bound = bind(args).map_err(|source| InterceptError::InvocationFailed {
                    method: descriptor.name.clone(),
                    source,
                })?;
                self.generic_bindings.insert(cache_key, Arc::clone(&bound));
                Ok(bound)
            }
        }
    }

    fn dispatch(
        self: &Arc<Self>,
        entry_index: usize,
        type_args: Option<&[TypeKey]>,
        args: &mut Vec<BoxedInstance>,
    ) -> Result<ReturnValue, InterceptError> {
        let entry = &self.shape.entries[entry_index];
        let descriptor = Arc::clone(&entry.descriptor);
        if args.len() != descriptor.arity {
            return Err(InterceptError::ArityMismatch {
                method: descriptor.name.clone(),
                expected: descriptor.arity,
                actual: args.len(),
            });
        }
        let target_method = self.target_method(entry_index, type_args)?;

        if entry.interceptor_slots.is_empty() {
            return self.call_target(&descriptor, &target_method, args);
        }

        // Materialize the matched interceptors for this instance, in
        // ascending registration order.
        let chain: Vec<Arc<dyn Interceptor>> = entry
            .interceptor_slots
            .iter()
            .map(|&slot| {
                Arc::clone(
                    self.lazy_interceptors[slot]
                        .get_or_init(|| (self.shape.interceptors[slot].factory)()),
                )
            })
            .collect();

        let proxy = Arc::clone(self);
        let method_for_terminal = Arc::clone(&descriptor);
        let terminal = move |terminal_args: &mut Vec<BoxedInstance>| {
            proxy.call_target(&method_for_terminal, &target_method, terminal_args)
        };

        let mut invocation = Invocation::new(&descriptor, self, args, &chain, &terminal);
        invocation.proceed()
    }

    /// Forward to the real target. When the target returns itself (a
    /// fluent API), substitute the proxy so chained calls keep going
    /// through the interception machinery.
    fn call_target(
        self: &Arc<Self>,
        descriptor: &Arc<MethodDescriptor>,
        target_method: &MethodFn,
        args: &mut Vec<BoxedInstance>,
    ) -> Result<ReturnValue, InterceptError> {
        let target = self.target()?;
        self.target_calls.fetch_add(1, Ordering::Relaxed);
        let result =
            target_method(&target, args).map_err(|source| InterceptError::InvocationFailed {
                method: descriptor.name.clone(),
                source,
            })?;

        if let Some(returned) = &result {
            if let Some(inner) = returned.downcast_ref::<Instance>() {
                if Arc::ptr_eq(inner, &target) {
                    let as_proxy: Instance = Arc::clone(self) as Instance;
                    return Ok(Some(Box::new(as_proxy) as BoxedInstance));
                }
            }
        }
        Ok(result)
    }
}
