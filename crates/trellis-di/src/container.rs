//! The service container
//!
//! Owns the registration, decorator and fallback stores, the compiled
//! emitter caches and the scope manager. Resolution reads the caches
//! without locking; a miss builds an emitter graph under a single
//! container-wide lock and publishes the result with an atomic root swap.

use std::sync::Arc;

use arc_swap::ArcSwap;
use dashmap::DashMap;
use parking_lot::{Mutex, ReentrantMutex, RwLock};
use tracing::{debug, info};

use trellis_collections::ImmutableHashTree;
use trellis_intercept::{
    Interceptor, InterceptError, Invocation, LambdaInterceptor, ProxyBuilder, ProxyDefinition,
};
use trellis_reflect::{
    downcast_arc, downcast_contract, Instance, MethodDescriptor, ReturnValue, TypeKey,
    TypeRegistry,
};

use crate::construction::ConstructionPlan;
use crate::error::{DiError, DiResult};
use crate::factory::{FactoryExpr, FallbackFactory};
use crate::lifetime::Lifetime;
use crate::registration::{
    DecoratorPredicate, DecoratorStore, FallbackRule, FallbackStore, ImplementingTypeFactory,
    RegisterOutcome, RegistrationStore, ServiceRegistration,
};
use crate::resolver::Emitter;
use crate::scanning::{LifetimeFactory, ScannerBinding, ShouldRegister, TypeScanner};
use crate::scope::{ScopeHandle, ScopeManager};

/// Tuning knobs for a container. Plain options struct with defaults.
#[derive(Clone)]
pub struct ContainerOptions {
    /// Run property injection for descriptors that declare injectable
    /// properties. On by default.
    pub enable_property_injection: bool,
}

impl Default for ContainerOptions {
    fn default() -> Self {
        Self {
            enable_property_injection: true,
        }
    }
}

/// Counts exposed for diagnostics.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ContainerStats {
    pub registrations: usize,
    pub cached_delegates: usize,
}

pub(crate) struct ContainerInner {
    pub(crate) registry: Arc<TypeRegistry>,
    pub(crate) options: ContainerOptions,
    pub(crate) registrations: RegistrationStore,
    pub(crate) decorators: DecoratorStore,
    pub(crate) fallbacks: FallbackStore,
    /// Construction plans cached per registration identity.
    pub(crate) plans: DashMap<(TypeKey, String), Arc<ConstructionPlan>>,
    /// Lock-free read path for default-named resolutions.
    pub(crate) default_cache: ArcSwap<ImmutableHashTree<TypeKey, Emitter>>,
    /// Lock-free read path for named resolutions.
    pub(crate) named_cache: ArcSwap<ImmutableHashTree<(TypeKey, String), Emitter>>,
    /// Coarse build lock; reentrant because compile-time singleton
    /// resolution may re-enter the build path.
    pub(crate) build_lock: ReentrantMutex<()>,
    pub(crate) scope_manager: Arc<ScopeManager>,
    pub(crate) proxy_builder: ProxyBuilder,
    pub(crate) scanner: RwLock<Option<ScannerBinding>>,
    pub(crate) scan_attempted: DashMap<TypeKey, ()>,
    /// Lifetimes the container must dispose when it is dropped.
    pub(crate) container_lifetimes: Mutex<Vec<Arc<dyn Lifetime>>>,
}

impl ContainerInner {
    /// Store a user registration; any successful overwrite invalidates
    /// all derived caches.
    pub(crate) fn store_registration(
        &self,
        registration: ServiceRegistration,
    ) -> Arc<ServiceRegistration> {
        self.remember_container_lifetime(&registration);
        let (stored, outcome) = self.registrations.register(registration);
        if outcome != RegisterOutcome::KeptReadOnly {
            self.invalidate();
        }
        stored
    }

    /// Store a registration derived during a build (fallback match,
    /// closed generic, scanner output). Inserts are additive and leave
    /// the caches alone; an overwrite invalidates them like any user
    /// re-registration.
    pub(crate) fn store_derived(
        &self,
        registration: ServiceRegistration,
    ) -> Arc<ServiceRegistration> {
        self.remember_container_lifetime(&registration);
        let (stored, outcome) = self.registrations.register(registration);
        if outcome == RegisterOutcome::Replaced {
            self.invalidate();
        }
        stored
    }

    fn remember_container_lifetime(&self, registration: &ServiceRegistration) {
        if let Some(lifetime) = &registration.lifetime {
            if lifetime.container_bound() {
                self.container_lifetimes.lock().push(Arc::clone(lifetime));
            }
        }
    }

    pub(crate) fn invalidate(&self) {
        self.default_cache
            .store(Arc::new(ImmutableHashTree::new()));
        self.named_cache.store(Arc::new(ImmutableHashTree::new()));
        self.plans.clear();
        debug!("container caches invalidated");
    }
}

impl Drop for ContainerInner {
    fn drop(&mut self) {
        let lifetimes = std::mem::take(&mut *self.container_lifetimes.lock());
        for lifetime in &lifetimes {
            lifetime.dispose();
        }
        info!(disposed = lifetimes.len(), "container dropped");
    }
}

/// A runtime dependency-injection container with method interception.
///
/// Cloning is cheap and shares all state; deferred accessors (lazies,
/// factories) hold weak references, so dropping every clone tears the
/// container down even if resolved instances outlive it.
#[derive(Clone)]
pub struct ServiceContainer {
    inner: Arc<ContainerInner>,
}

impl ServiceContainer {
    pub fn new() -> Self {
        Self::with_options(ContainerOptions::default())
    }

    pub fn with_options(options: ContainerOptions) -> Self {
        let inner = Arc::new(ContainerInner {
            registry: Arc::new(TypeRegistry::new()),
            options,
            registrations: RegistrationStore::new(),
            decorators: DecoratorStore::new(),
            fallbacks: FallbackStore::new(),
            plans: DashMap::new(),
            default_cache: ArcSwap::from_pointee(ImmutableHashTree::new()),
            named_cache: ArcSwap::from_pointee(ImmutableHashTree::new()),
            build_lock: ReentrantMutex::new(()),
            scope_manager: Arc::new(ScopeManager::new()),
            proxy_builder: ProxyBuilder::new(),
            scanner: RwLock::new(None),
            scan_attempted: DashMap::new(),
            container_lifetimes: Mutex::new(Vec::new()),
        });
        info!("container created");
        Self { inner }
    }

    /// The type registry services are described in.
    pub fn registry(&self) -> &Arc<TypeRegistry> {
        &self.inner.registry
    }

    // ------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------

    /// Add a fully specified registration.
    pub fn register(&self, registration: ServiceRegistration) {
        self.inner.store_registration(registration);
    }

    /// Map a service type to an implementing type.
    pub fn register_type(
        &self,
        service: TypeKey,
        implementing: TypeKey,
        name: &str,
        lifetime: Option<Arc<dyn Lifetime>>,
    ) {
        let mut registration = ServiceRegistration::new(service)
            .named(name)
            .implemented_by(implementing);
        if let Some(lifetime) = lifetime {
            registration = registration.with_lifetime(lifetime);
        }
        self.register(registration);
    }

    /// Typed sugar for [`ServiceContainer::register_type`].
    pub fn register_as<S: ?Sized + 'static, I: Send + Sync + 'static>(
        &self,
        lifetime: Option<Arc<dyn Lifetime>>,
    ) {
        self.register_type(TypeKey::of::<S>(), TypeKey::of::<I>(), "", lifetime);
    }

    /// Pin a pre-built instance as a value registration.
    pub fn register_instance(&self, service: TypeKey, value: Instance, name: &str) {
        self.register(
            ServiceRegistration::new(service)
                .named(name)
                .with_value(value),
        );
    }

    /// Register a constructed-by-code service.
    pub fn register_factory(
        &self,
        service: TypeKey,
        factory: FactoryExpr,
        name: &str,
        lifetime: Option<Arc<dyn Lifetime>>,
    ) {
        let mut registration = ServiceRegistration::new(service)
            .named(name)
            .with_factory(factory);
        if let Some(lifetime) = lifetime {
            registration = registration.with_lifetime(lifetime);
        }
        self.register(registration);
    }

    /// Wrap a service with a decorator type. Decorators apply in
    /// registration order, the first registered being innermost.
    pub fn decorate(
        &self,
        service: TypeKey,
        decorator: TypeKey,
        can_decorate: Option<DecoratorPredicate>,
    ) {
        self.inner
            .decorators
            .add(Some(service), Some(decorator), None, can_decorate);
        self.inner.invalidate();
    }

    /// Wrap services with a decorator whose concrete type is resolved
    /// just-in-time.
    pub fn decorate_deferred(
        &self,
        service: Option<TypeKey>,
        implementing_factory: ImplementingTypeFactory,
        can_decorate: Option<DecoratorPredicate>,
    ) {
        self.inner
            .decorators
            .add(service, None, Some(implementing_factory), can_decorate);
        self.inner.invalidate();
    }

    /// Add a catch-all resolution rule, consulted in registration order
    /// when no registration matches a request.
    pub fn register_fallback(
        &self,
        predicate: impl Fn(TypeKey, &str) -> bool + Send + Sync + 'static,
        factory: FallbackFactory,
        lifetime: Option<Arc<dyn Lifetime>>,
    ) {
        self.inner.fallbacks.add(FallbackRule {
            predicate: Arc::new(predicate),
            factory,
            lifetime,
        });
        self.inner.invalidate();
    }

    /// Attach the external type-scanning collaborator. Consulted once
    /// per unknown service type before fallback rules run.
    pub fn set_scanner(
        &self,
        scanner: Arc<dyn TypeScanner>,
        lifetime_factory: LifetimeFactory,
        should_register: ShouldRegister,
    ) {
        *self.inner.scanner.write() = Some(ScannerBinding {
            scanner,
            lifetime_factory,
            should_register,
        });
    }

    // ------------------------------------------------------------------
    // Resolution
    // ------------------------------------------------------------------

    /// Resolve the default instance of a service.
    pub fn get_instance(&self, service: TypeKey) -> DiResult<Instance> {
        self.inner.resolve(service, "", Vec::new())
    }

    /// Resolve a named instance of a service.
    pub fn get_named_instance(&self, service: TypeKey, name: &str) -> DiResult<Instance> {
        self.inner.resolve(service, name, Vec::new())
    }

    /// Resolve with caller-supplied runtime arguments, which flow to the
    /// registration's factory expression.
    pub fn get_instance_with_args(
        &self,
        service: TypeKey,
        name: &str,
        args: Vec<Instance>,
    ) -> DiResult<Instance> {
        self.inner.resolve(service, name, args)
    }

    /// Resolve if a matching registration exists. Only the absence of a
    /// registration yields `None`; construction failures stay fatal.
    pub fn try_get_instance(&self, service: TypeKey, name: &str) -> DiResult<Option<Instance>> {
        match self.inner.resolve(service, name, Vec::new()) {
            Ok(instance) => Ok(Some(instance)),
            Err(DiError::ServiceNotRegistered { .. }) => Ok(None),
            Err(other) => Err(other),
        }
    }

    /// Every registered instance of a service type, in registration
    /// order.
    pub fn get_all_instances(&self, element: TypeKey) -> DiResult<Vec<Instance>> {
        self.inner.resolve_all(element)
    }

    /// Resolve the default instance and downcast to a concrete type.
    pub fn get_as<T: Send + Sync + 'static>(&self) -> DiResult<Arc<T>> {
        let instance = self.get_instance(TypeKey::of::<T>())?;
        downcast_arc::<T>(instance).map_err(|source| DiError::FactoryFailed {
            service: self.inner.registry.name_of(TypeKey::of::<T>()),
            source,
        })
    }

    /// Resolve the default instance of a contract and downcast.
    pub fn get_contract<C: ?Sized + Send + Sync + 'static>(&self) -> DiResult<Arc<C>> {
        let instance = self.get_instance(TypeKey::of::<C>())?;
        downcast_contract::<C>(instance).map_err(|source| DiError::FactoryFailed {
            service: self.inner.registry.name_of(TypeKey::of::<C>()),
            source,
        })
    }

    // ------------------------------------------------------------------
    // Scopes
    // ------------------------------------------------------------------

    /// Open a new scope nested under the current one.
    pub fn begin_scope(&self) -> ScopeHandle {
        let scope = self.inner.scope_manager.begin_scope();
        ScopeHandle::new(scope, Arc::clone(&self.inner.scope_manager))
    }

    // ------------------------------------------------------------------
    // Interception
    // ------------------------------------------------------------------

    /// Register interception for every service matched by `selector`.
    /// `define` customizes the proxy (interceptors, lazy target,
    /// additional interfaces); the proxy type is synthesized once per
    /// target service, the first time that service is resolved.
    pub fn intercept(
        &self,
        selector: impl Fn(TypeKey, &str) -> bool + Send + Sync + 'static,
        define: impl Fn(&mut ProxyDefinition) + Send + Sync + 'static,
    ) {
        let weak = Arc::downgrade(&self.inner);
        let synthesized: DashMap<TypeKey, TypeKey> = DashMap::new();
        let implementing_factory: ImplementingTypeFactory = Arc::new(move |registration| {
            let inner = weak.upgrade().ok_or(DiError::ContainerUnavailable)?;
            if let Some(existing) = synthesized.get(&registration.service_key) {
                return Ok(*existing);
            }
            let mut definition = ProxyDefinition::new(registration.service_key);
            define(&mut definition);
            let proxy_key = inner
                .proxy_builder
                .get_proxy_type(&inner.registry, &definition)?;
            synthesized.insert(registration.service_key, proxy_key);
            Ok(proxy_key)
        });
        let can_decorate: DecoratorPredicate =
            Arc::new(move |registration| selector(registration.service_key, &registration.name));
        self.decorate_deferred(None, implementing_factory, Some(can_decorate));
    }

    /// Shorthand: run `implementation` around every method matched by
    /// `method_selector` on every service matched by `selector`.
    pub fn intercept_methods(
        &self,
        selector: impl Fn(TypeKey, &str) -> bool + Send + Sync + 'static,
        method_selector: impl Fn(&MethodDescriptor) -> bool + Send + Sync + Clone + 'static,
        implementation: impl Fn(&mut Invocation<'_>) -> Result<ReturnValue, InterceptError>
            + Send
            + Sync
            + 'static,
    ) {
        let implementation = Arc::new(implementation);
        self.intercept(selector, move |definition| {
            let implementation = Arc::clone(&implementation);
            let method_selector = method_selector.clone();
            definition.implement(method_selector, move || {
                let implementation = Arc::clone(&implementation);
                Arc::new(LambdaInterceptor::new(move |invocation: &mut Invocation<'_>| {
                    implementation(invocation)
                })) as Arc<dyn Interceptor>
            });
        });
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Drop all cached delegates and construction plans. The next
    /// resolution rebuilds from the current stores.
    pub fn invalidate(&self) {
        self.inner.invalidate();
    }

    pub fn stats(&self) -> ContainerStats {
        ContainerStats {
            registrations: self.inner.registrations.registration_count(),
            cached_delegates: self.inner.default_cache.load().len()
                + self.inner.named_cache.load().len(),
        }
    }
}

impl Default for ServiceContainer {
    fn default() -> Self {
        Self::new()
    }
}
