//! Emitter construction, the resolution engine
//!
//! An emitter is a composable closure producing one fragment of a
//! resolved object graph. `delegate_for` is the cached entry point: a hit
//! reads the persistent tree without locking, a miss builds the emitter
//! graph under the container's build lock and publishes the new tree root
//! atomically. Recursion is detected on a per-build dependency stack that
//! lives and dies with the top-level build call.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::debug;

use trellis_reflect::{
    freeze, DisposerFn, DynError, Instance, InstanceFactory, Lazy, ParameterizedFactory, Sequence,
    TypeKey,
};

use crate::construction::{
    plan_for_factory, plan_for_type, ConstructionPlan, ResolvabilityProbe,
};
use crate::container::ContainerInner;
use crate::error::{DiError, DiResult};
use crate::factory::DependencyFactory;
use crate::lifetime::CreationContext;
use crate::registration::{ConstructionStrategy, ServiceRegistration};
use crate::scanning::ScanRegistrar;
use crate::scope::Scope;

/// Everything an emitter may consult at invocation time.
pub(crate) struct ResolutionEnv {
    pub scope: Option<Arc<Scope>>,
    pub args: Vec<Instance>,
}

/// A compiled producer for one (service, name) request.
pub(crate) type Emitter = Arc<dyn Fn(&ResolutionEnv) -> DiResult<Instance> + Send + Sync>;

/// Per-build state: the in-progress dependency stack. Allocated fresh
/// for every top-level build, so concurrent resolutions cannot see each
/// other's markers.
#[derive(Default)]
pub(crate) struct BuildContext {
    stack: Vec<(TypeKey, String)>,
}

impl BuildContext {
    fn on_stack(&self, service: TypeKey, name: &str) -> bool {
        self.stack.iter().any(|(k, n)| *k == service && n == name)
    }
}

/// Bridges a factory expression's dependency-factory parameter onto the
/// container's resolution surface.
struct FactoryContext<'a> {
    inner: &'a Arc<ContainerInner>,
    args: &'a [Instance],
}

impl DependencyFactory for FactoryContext<'_> {
    fn get_instance(&self, service: TypeKey, name: &str) -> Result<Instance, DynError> {
        self.inner
            .resolve(service, name, Vec::new())
            .map_err(|err| Box::new(err) as DynError)
    }

    fn get_all_instances(&self, element: TypeKey) -> Result<Vec<Instance>, DynError> {
        self.inner
            .resolve_all(element)
            .map_err(|err| Box::new(err) as DynError)
    }

    fn runtime_args(&self) -> &[Instance] {
        self.args
    }
}

fn constant_emitter(value: Instance) -> Emitter {
    Arc::new(move |_env| Ok(Arc::clone(&value)))
}

fn boxed(err: DiError) -> DynError {
    Box::new(err)
}

impl ResolvabilityProbe for ContainerInner {
    fn can_resolve(&self, service: TypeKey, name: &str) -> bool {
        if self.registrations.get(service, name).is_some() {
            return true;
        }
        if self.fallbacks.any_match(service, name) {
            return true;
        }
        if let Some(shape) = self.registry.shape_of(service) {
            let structural = self.registry.structural();
            if shape.definition == structural.lazy
                || shape.definition == structural.factory
                || shape.definition == structural.parameterized_factory
                || shape.definition == structural.sequence
            {
                return true;
            }
            if self.registrations.get(shape.definition, name).is_some() {
                return true;
            }
        }
        name.is_empty() && self.registrations.named_for(service).len() == 1
    }
}

impl ContainerInner {
    /// Resolve (service, name) with the given runtime arguments.
    pub(crate) fn resolve(
        self: &Arc<Self>,
        service: TypeKey,
        name: &str,
        args: Vec<Instance>,
    ) -> DiResult<Instance> {
        let result = self.delegate_for(service, name).and_then(|emitter| {
            let env = ResolutionEnv {
                scope: self.scope_manager.current(),
                args,
            };
            emitter(&env)
        });
        result.map_err(|err| err.in_context(self.registry.name_of(service), name))
    }

    /// Every registered instance of `element`, in registration order.
    pub(crate) fn resolve_all(self: &Arc<Self>, element: TypeKey) -> DiResult<Vec<Instance>> {
        let sequence_key = self.registry.sequence_of(element);
        let instance = self.resolve(sequence_key, "", Vec::new())?;
        let sequence = trellis_reflect::downcast_arc::<Sequence>(instance).map_err(|source| {
            DiError::FactoryFailed {
                service: self.registry.name_of(element),
                source,
            }
        })?;
        Ok(sequence.items().to_vec())
    }

    /// Fast-path cache lookup; on miss, build and publish under the
    /// container build lock.
    fn delegate_for(self: &Arc<Self>, service: TypeKey, name: &str) -> DiResult<Emitter> {
        if name.is_empty() {
            let cache = self.default_cache.load();
            if let Some(emitter) = cache.search(&service) {
                return Ok(Arc::clone(emitter));
            }
        } else {
            let cache = self.named_cache.load();
            if let Some(emitter) = cache.search(&(service, name.to_string())) {
                return Ok(Arc::clone(emitter));
            }
        }

        let _guard = self.build_lock.lock();
        // Another thread may have published while this one waited.
        if name.is_empty() {
            let cache = self.default_cache.load();
            if let Some(emitter) = cache.search(&service) {
                return Ok(Arc::clone(emitter));
            }
        } else {
            let cache = self.named_cache.load();
            if let Some(emitter) = cache.search(&(service, name.to_string())) {
                return Ok(Arc::clone(emitter));
            }
        }

        let mut ctx = BuildContext::default();
        let emitter = self.build_emitter(service, name, &mut ctx)?;

        if name.is_empty() {
            let next = self.default_cache.load().add(service, Arc::clone(&emitter));
            self.default_cache.store(Arc::new(next));
        } else {
            let next = self
                .named_cache
                .load()
                .add((service, name.to_string()), Arc::clone(&emitter));
            self.named_cache.store(Arc::new(next));
        }
        debug!(service = %self.registry.name_of(service), name, "compiled resolution delegate");
        Ok(emitter)
    }

    pub(crate) fn build_emitter(
        self: &Arc<Self>,
        service: TypeKey,
        name: &str,
        ctx: &mut BuildContext,
    ) -> DiResult<Emitter> {
        if ctx.on_stack(service, name) {
            return Err(DiError::RecursiveDependencyDetected {
                service: self.registry.name_of(service),
                name: name.to_string(),
            });
        }
        ctx.stack.push((service, name.to_string()));
        let result = self.build_emitter_inner(service, name, ctx);
        ctx.stack.pop();
        result
    }

    fn build_emitter_inner(
        self: &Arc<Self>,
        service: TypeKey,
        name: &str,
        ctx: &mut BuildContext,
    ) -> DiResult<Emitter> {
        if let Some(registration) = self.registrations.get(service, name) {
            return self.build_registration_emitter(&registration, ctx);
        }

        // Lazy discovery: let the scanning collaborator register what it
        // finds, then retry the lookup once.
        if self.try_scan(service) {
            if let Some(registration) = self.registrations.get(service, name) {
                return self.build_registration_emitter(&registration, ctx);
            }
        }

        if let Some(rule) = self.fallbacks.first_match(service, name) {
            let factory = Arc::clone(&rule.factory);
            let (captured_service, captured_name) = (service, name.to_string());
            let mut derived = ServiceRegistration::new(service).named(name).with_factory(
                crate::factory::FactoryExpr::Opaque(Arc::new(move |dependency_factory| {
                    factory(dependency_factory, captured_service, &captured_name)
                })),
            );
            if let Some(lifetime) = &rule.lifetime {
                derived = derived.with_lifetime(lifetime.clone_policy());
            }
            let derived = self.store_derived(derived);
            return self.build_registration_emitter(&derived, ctx);
        }

        // Structural resolution for the well-known shapes, in fixed
        // order: Lazy, parameterized factory, zero-argument factory,
        // sequence.
        if let Some(shape) = self.registry.shape_of(service) {
            let structural = self.registry.structural();
            if shape.definition == structural.lazy {
                return Ok(self.lazy_emitter(shape.args[0], name));
            }
            if shape.definition == structural.parameterized_factory {
                let result = *shape.args.last().ok_or_else(|| {
                    DiError::UnableToDetermineImplementingType {
                        service: self.registry.name_of(service),
                    }
                })?;
                return Ok(self.parameterized_factory_emitter(result, name));
            }
            if shape.definition == structural.factory {
                return Ok(self.instance_factory_emitter(shape.args[0], name));
            }
            if shape.definition == structural.sequence {
                return self.sequence_emitter(shape.args[0], ctx);
            }
        }

        // Single-registration redirect: an unnamed lookup with exactly
        // one named registration resolves to it; more than one with no
        // default is ambiguous.
        if name.is_empty() && self.registrations.get(service, "").is_none() {
            let named = self.registrations.named_for(service);
            match named.len() {
                0 => {}
                1 => {
                    let redirect = named[0].name.clone();
                    debug!(service = %self.registry.name_of(service), name = %redirect, "single-registration redirect");
                    return self.build_emitter(service, &redirect, ctx);
                }
                count => {
                    return Err(DiError::AmbiguousDefaultService {
                        service: self.registry.name_of(service),
                        count,
                    })
                }
            }
        }

        // Closed generic from an open definition, cloning the lifetime
        // policy as a fresh instance.
        if let Some(shape) = self.registry.shape_of(service) {
            if let Some(open) = self.registrations.get(shape.definition, name) {
                if let Some(open_implementing) = open.implementing_key {
                    let closed = self.registry.close_generic(open_implementing, &shape.args)?;
                    let mut derived = ServiceRegistration::new(service)
                        .named(name)
                        .implemented_by(closed);
                    if let Some(lifetime) = &open.lifetime {
                        derived = derived.with_lifetime(lifetime.clone_policy());
                    }
                    let derived = self.store_derived(derived);
                    return self.build_registration_emitter(&derived, ctx);
                }
            }
        }

        Err(DiError::ServiceNotRegistered {
            service: self.registry.name_of(service),
            name: name.to_string(),
        })
    }

    fn build_registration_emitter(
        self: &Arc<Self>,
        registration: &Arc<ServiceRegistration>,
        ctx: &mut BuildContext,
    ) -> DiResult<Emitter> {
        match registration.strategy() {
            None => Err(DiError::UnableToDetermineImplementingType {
                service: self.registry.name_of(registration.service_key),
            }),
            Some(ConstructionStrategy::Value(value)) => Ok(constant_emitter(Arc::clone(value))),
            Some(_) => {
                let plan = self.plan_for(registration)?;
                let raw = self.emitter_from_plan(registration.service_key, &plan, ctx, None)?;
                let decorated = self.apply_decorators(registration, raw, ctx)?;
                self.apply_lifetime(registration, decorated, self.disposer_for_plan(&plan))
            }
        }
    }

    fn plan_for(&self, registration: &Arc<ServiceRegistration>) -> DiResult<Arc<ConstructionPlan>> {
        let cache_key = (registration.service_key, registration.name.clone());
        if let Some(plan) = self.plans.get(&cache_key) {
            return Ok(Arc::clone(&plan));
        }
        let plan = match registration.strategy() {
            Some(ConstructionStrategy::Factory(expr)) => plan_for_factory(expr, &self.registry)?,
            Some(ConstructionStrategy::ImplementingType(implementing)) => {
                let descriptor = self.registry.describe_key(implementing).ok_or_else(|| {
                    DiError::UnableToDetermineImplementingType {
                        service: self.registry.name_of(registration.service_key),
                    }
                })?;
                plan_for_type(implementing, &descriptor, self)?
            }
            _ => {
                return Err(DiError::UnableToDetermineImplementingType {
                    service: self.registry.name_of(registration.service_key),
                })
            }
        };
        let plan = Arc::new(plan);
        self.plans.insert(cache_key, Arc::clone(&plan));
        Ok(plan)
    }

    fn disposer_for_plan(&self, plan: &ConstructionPlan) -> Option<DisposerFn> {
        match plan {
            ConstructionPlan::Constructor(info) => self
                .registry
                .describe_key(info.implementing)
                .and_then(|descriptor| descriptor.disposer.clone()),
            // An opaque delegate's product type is unknown, so no
            // disposal hook can be attached.
            ConstructionPlan::Delegate(_) => None,
        }
    }

    fn emitter_from_plan(
        self: &Arc<Self>,
        service: TypeKey,
        plan: &ConstructionPlan,
        ctx: &mut BuildContext,
        decorator_inner: Option<(TypeKey, Emitter)>,
    ) -> DiResult<Emitter> {
        let info = match plan {
            ConstructionPlan::Delegate(delegate) => {
                let weak = Arc::downgrade(self);
                let delegate = Arc::clone(delegate);
                let service_name = self.registry.name_of(service);
                return Ok(Arc::new(move |env| {
                    let inner = weak.upgrade().ok_or(DiError::ContainerUnavailable)?;
                    let factory_context = FactoryContext {
                        inner: &inner,
                        args: &env.args,
                    };
                    delegate(&factory_context).map_err(|source| DiError::FactoryFailed {
                        service: service_name.clone(),
                        source,
                    })
                }));
            }
            ConstructionPlan::Constructor(info) => info,
        };

        let descriptor = self.registry.describe_key(info.implementing).ok_or_else(|| {
            DiError::UnableToDetermineImplementingType {
                service: self.registry.name_of(service),
            }
        })?;
        let owner = descriptor.name.clone();

        let mut dependency_emitters: Vec<Emitter> =
            Vec::with_capacity(info.constructor_dependencies.len());
        for dependency in &info.constructor_dependencies {
            let emitter: Emitter = if let Some(constant) = &dependency.constant {
                constant_emitter(Arc::clone(constant))
            } else if dependency.is_decorator_target {
                let (decorated, inner) =
                    decorator_inner.clone().ok_or_else(|| DiError::UnresolvedDependency {
                        service: owner.clone(),
                        dependency: self.registry.name_of(dependency.service_key),
                        member: format!("parameter {}", dependency.parameter_name),
                    })?;
                if dependency.service_key == self.registry.lazy_of(decorated) {
                    // A lazy decorator target defers the inner emitter.
                    Arc::new(move |env: &ResolutionEnv| {
                        let inner = Arc::clone(&inner);
                        let deferred_env = ResolutionEnv {
                            scope: env.scope.clone(),
                            args: env.args.clone(),
                        };
                        Ok(Arc::new(Lazy::new(move || {
                            inner(&deferred_env).map_err(boxed)
                        })) as Instance)
                    })
                } else {
                    inner
                }
            } else {
                self.build_emitter(dependency.service_key, &dependency.service_name, ctx)
                    .map_err(|err| match err {
                        DiError::ServiceNotRegistered { .. } => DiError::UnresolvedDependency {
                            service: owner.clone(),
                            dependency: self.registry.name_of(dependency.service_key),
                            member: format!("parameter {}", dependency.parameter_name),
                        },
                        other => other,
                    })?
            };
            dependency_emitters.push(emitter);
        }

        let mut property_injections: Vec<(trellis_reflect::PropertySetter, Emitter)> = Vec::new();
        if self.options.enable_property_injection {
            for property in &info.property_dependencies {
                let emitter: Emitter = if let Some(constant) = &property.constant {
                    constant_emitter(Arc::clone(constant))
                } else {
                    let member = descriptor.properties[property.property_index].name.clone();
                    self.build_emitter(property.service_key, &property.service_name, ctx)
                        .map_err(|err| match err {
                            DiError::ServiceNotRegistered { .. } => DiError::UnresolvedDependency {
                                service: owner.clone(),
                                dependency: self.registry.name_of(property.service_key),
                                member: format!("property {member}"),
                            },
                            other => other,
                        })?
                };
                let setter =
                    Arc::clone(&descriptor.properties[property.property_index].set);
                property_injections.push((setter, emitter));
            }
        }

        let constructor = Arc::clone(&descriptor.constructors[info.constructor_index].invoke);
        let cast = if service != info.implementing {
            descriptor.cast_to(service).cloned()
        } else {
            None
        };
        let implementing_name = descriptor.name.clone();

        Ok(Arc::new(move |env| {
            let dependencies: DiResult<Vec<Instance>> =
                dependency_emitters.iter().map(|emitter| emitter(env)).collect();
            let mut built =
                constructor(dependencies?).map_err(|source| DiError::ConstructorFailed {
                    implementing: implementing_name.clone(),
                    source,
                })?;
            for (setter, emitter) in &property_injections {
                let value = emitter(env)?;
                setter(built.as_mut(), value).map_err(|source| DiError::ConstructorFailed {
                    implementing: implementing_name.clone(),
                    source,
                })?;
            }
            let frozen = freeze(built);
            match &cast {
                Some(cast) => cast(frozen).map_err(|source| DiError::ConstructorFailed {
                    implementing: implementing_name.clone(),
                    source,
                }),
                None => Ok(frozen),
            }
        }))
    }

    fn apply_decorators(
        self: &Arc<Self>,
        registration: &Arc<ServiceRegistration>,
        raw: Emitter,
        ctx: &mut BuildContext,
    ) -> DiResult<Emitter> {
        let shape = self.registry.shape_of(registration.service_key);
        let matched = self.decorators.decorators_for(registration, shape.as_ref());
        let mut current = raw;
        for decorator in matched {
            let implementing = match (&decorator.implementing_factory, decorator.implementing_key) {
                (Some(factory), _) => factory(registration)?,
                (None, Some(key)) => {
                    let descriptor = self.registry.describe_key(key).ok_or_else(|| {
                        DiError::UnableToDetermineImplementingType {
                            service: self.registry.name_of(key),
                        }
                    })?;
                    if descriptor.is_open_generic() {
                        let shape = shape.as_ref().ok_or_else(|| {
                            DiError::UnableToDetermineImplementingType {
                                service: self.registry.name_of(key),
                            }
                        })?;
                        self.registry.close_generic(key, &shape.args)?
                    } else {
                        key
                    }
                }
                (None, None) => {
                    return Err(DiError::UnableToDetermineImplementingType {
                        service: self.registry.name_of(registration.service_key),
                    })
                }
            };

            let descriptor = self.registry.describe_key(implementing).ok_or_else(|| {
                DiError::UnableToDetermineImplementingType {
                    service: self.registry.name_of(implementing),
                }
            })?;
            let mut plan = plan_for_type(implementing, &descriptor, &**self)?;
            if let ConstructionPlan::Constructor(info) = &mut plan {
                let lazy_key = self.registry.lazy_of(registration.service_key);
                if let Some(target) = info.constructor_dependencies.iter_mut().find(|d| {
                    d.service_key == registration.service_key || d.service_key == lazy_key
                }) {
                    target.is_decorator_target = true;
                }
            }
            debug!(
                service = %self.registry.name_of(registration.service_key),
                decorator = %descriptor.name,
                index = decorator.index,
                "applying decorator"
            );
            current = self.emitter_from_plan(
                registration.service_key,
                &plan,
                ctx,
                Some((registration.service_key, current)),
            )?;
        }
        Ok(current)
    }

    fn apply_lifetime(
        self: &Arc<Self>,
        registration: &Arc<ServiceRegistration>,
        emitter: Emitter,
        disposer: Option<DisposerFn>,
    ) -> DiResult<Emitter> {
        let Some(lifetime) = registration.lifetime.clone() else {
            return Ok(emitter);
        };
        let service_name = self.registry.name_of(registration.service_key);

        if lifetime.container_bound() {
            // Container-wide singletons carry no per-request state, so
            // they are resolved once, eagerly, while the delegate is
            // being compiled.
            let env = ResolutionEnv {
                scope: None,
                args: Vec::new(),
            };
            let context = CreationContext {
                service: &service_name,
                scope: None,
                disposer: disposer.as_ref(),
            };
            let create = || emitter(&env);
            let instance = lifetime.get_instance(&create, &context)?;
            debug!(service = %service_name, "container singleton resolved at compile time");
            return Ok(constant_emitter(instance));
        }

        Ok(Arc::new(move |env| {
            let context = CreationContext {
                service: &service_name,
                scope: env.scope.as_ref(),
                disposer: disposer.as_ref(),
            };
            lifetime.get_instance(&|| emitter(env), &context)
        }))
    }

    // ------------------------------------------------------------------
    // Structural emitters
    // ------------------------------------------------------------------

    fn lazy_emitter(self: &Arc<Self>, element: TypeKey, name: &str) -> Emitter {
        let weak = Arc::downgrade(self);
        let name = name.to_string();
        Arc::new(move |_env| {
            let weak = weak.clone();
            let name = name.clone();
            let lazy = Lazy::new(move || {
                let inner = weak.upgrade().ok_or_else(|| boxed(DiError::ContainerUnavailable))?;
                inner.resolve(element, &name, Vec::new()).map_err(boxed)
            });
            Ok(Arc::new(lazy) as Instance)
        })
    }

    fn instance_factory_emitter(self: &Arc<Self>, result: TypeKey, name: &str) -> Emitter {
        let weak = Arc::downgrade(self);
        let name = name.to_string();
        Arc::new(move |_env| {
            let weak = weak.clone();
            let name = name.clone();
            let factory = InstanceFactory::new(move || {
                let inner = weak.upgrade().ok_or_else(|| boxed(DiError::ContainerUnavailable))?;
                inner.resolve(result, &name, Vec::new()).map_err(boxed)
            });
            Ok(Arc::new(factory) as Instance)
        })
    }

    fn parameterized_factory_emitter(self: &Arc<Self>, result: TypeKey, name: &str) -> Emitter {
        let weak = Arc::downgrade(self);
        let name = name.to_string();
        Arc::new(move |_env| {
            let weak = weak.clone();
            let name = name.clone();
            let factory = ParameterizedFactory::new(move |args| {
                let inner = weak.upgrade().ok_or_else(|| boxed(DiError::ContainerUnavailable))?;
                inner.resolve(result, &name, args).map_err(boxed)
            });
            Ok(Arc::new(factory) as Instance)
        })
    }

    /// Gather an emitter per registration of `element`, excluding any
    /// already mid-resolution on the build stack so an enumerable of a
    /// type never includes the registration currently being built.
    fn sequence_emitter(
        self: &Arc<Self>,
        element: TypeKey,
        ctx: &mut BuildContext,
    ) -> DiResult<Emitter> {
        let mut element_emitters = Vec::new();
        let exact = self.registrations.all_for(element);
        let mut seen: HashSet<String> = HashSet::new();
        for registration in &exact {
            seen.insert(registration.name.clone());
            if ctx.on_stack(element, &registration.name) {
                continue;
            }
            element_emitters.push(self.build_emitter(element, &registration.name, ctx)?);
        }
        // Open-generic registrations contribute closings of the element
        // type that no exact registration shadows.
        if let Some(shape) = self.registry.shape_of(element) {
            for open in self.registrations.all_for(shape.definition) {
                if seen.contains(&open.name)
                    || open.implementing_key.is_none()
                    || ctx.on_stack(element, &open.name)
                {
                    continue;
                }
                element_emitters.push(self.build_emitter(element, &open.name, ctx)?);
            }
        }

        Ok(Arc::new(move |env| {
            let items: DiResult<Vec<Instance>> =
                element_emitters.iter().map(|emitter| emitter(env)).collect();
            Ok(Arc::new(Sequence::new(items?)) as Instance)
        }))
    }

    // ------------------------------------------------------------------
    // Lazy discovery
    // ------------------------------------------------------------------

    /// Invoke the scanning collaborator, once per unknown service type.
    /// Returns whether a scan actually ran.
    fn try_scan(&self, service: TypeKey) -> bool {
        let binding = self.scanner.read().clone();
        let Some(binding) = binding else {
            return false;
        };
        if self.scan_attempted.insert(service, ()).is_some() {
            return false;
        }
        debug!(service = %self.registry.name_of(service), "scanning for unknown service");
        let before = self.registrations.registration_count();
        binding.scanner.scan(
            &self.registry,
            self,
            &binding.lifetime_factory,
            &binding.should_register,
        );
        // Compiled sequences and default redirects predate anything the
        // scan added, so any growth drops the caches. Overwrites are
        // handled when the scanned entry is stored.
        if self.registrations.registration_count() != before {
            self.invalidate();
        }
        true
    }
}

impl ScanRegistrar for ContainerInner {
    fn register_scanned(
        &self,
        service: TypeKey,
        implementing: TypeKey,
        name: &str,
        lifetime: Option<Arc<dyn crate::lifetime::Lifetime>>,
    ) {
        let mut registration = ServiceRegistration::new(service)
            .named(name)
            .implemented_by(implementing);
        if let Some(lifetime) = lifetime {
            registration = registration.with_lifetime(lifetime);
        }
        self.store_derived(registration);
    }
}
