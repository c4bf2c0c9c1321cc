//! Registration metadata and the concurrent stores that hold it

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, warn};

use trellis_reflect::{GenericShape, Instance, TypeKey};

use crate::error::DiResult;
use crate::factory::{FactoryExpr, FallbackFactory};
use crate::lifetime::Lifetime;

/// How a registration produces instances. Precedence when several are
/// present on one registration: Value > FactoryExpression > ImplementingType.
pub enum ConstructionStrategy<'a> {
    Value(&'a Instance),
    Factory(&'a FactoryExpr),
    ImplementingType(TypeKey),
}

/// A stored mapping from (service type, name) to a construction strategy
/// and lifetime. Identity is (service_key, name); the empty name is the
/// default registration.
pub struct ServiceRegistration {
    pub service_key: TypeKey,
    pub name: String,
    pub implementing_key: Option<TypeKey>,
    pub factory: Option<FactoryExpr>,
    pub value: Option<Instance>,
    pub lifetime: Option<Arc<dyn Lifetime>>,
    pub read_only: bool,
}

impl ServiceRegistration {
    pub fn new(service_key: TypeKey) -> Self {
        Self {
            service_key,
            name: String::new(),
            implementing_key: None,
            factory: None,
            value: None,
            lifetime: None,
            read_only: false,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn implemented_by(mut self, implementing: TypeKey) -> Self {
        self.implementing_key = Some(implementing);
        self
    }

    pub fn with_factory(mut self, factory: FactoryExpr) -> Self {
        self.factory = Some(factory);
        self
    }

    pub fn with_value(mut self, value: Instance) -> Self {
        self.value = Some(value);
        self
    }

    pub fn with_lifetime(mut self, lifetime: Arc<dyn Lifetime>) -> Self {
        self.lifetime = Some(lifetime);
        self
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    pub fn strategy(&self) -> Option<ConstructionStrategy<'_>> {
        if let Some(value) = &self.value {
            return Some(ConstructionStrategy::Value(value));
        }
        if let Some(factory) = &self.factory {
            return Some(ConstructionStrategy::Factory(factory));
        }
        self.implementing_key
            .map(ConstructionStrategy::ImplementingType)
    }
}

#[derive(Clone)]
struct StoredRegistration {
    registration: Arc<ServiceRegistration>,
    /// Store-wide insertion counter; sequence order is registration order
    /// for `GetAllInstances`.
    sequence: u64,
}

/// Concurrent map of service type to named registrations. Last write
/// wins, except that a read-only entry silently keeps its value.
pub struct RegistrationStore {
    by_service: DashMap<TypeKey, DashMap<String, StoredRegistration>>,
    sequence: AtomicU64,
}

/// What `RegistrationStore::register` did with the incoming entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RegisterOutcome {
    /// A new (service, name) entry.
    Inserted,
    /// Overwrote an existing entry; anything compiled from the old entry
    /// is stale.
    Replaced,
    /// An existing read-only entry was kept; soft no-op, never an error.
    KeptReadOnly,
}

impl RegistrationStore {
    pub fn new() -> Self {
        Self {
            by_service: DashMap::new(),
            sequence: AtomicU64::new(0),
        }
    }

    pub fn register(&self, registration: ServiceRegistration) -> (Arc<ServiceRegistration>, RegisterOutcome) {
        let named = self
            .by_service
            .entry(registration.service_key)
            .or_default();
        if let Some(existing) = named.get(&registration.name) {
            if existing.registration.read_only {
                warn!(
                    service = ?registration.service_key,
                    name = %registration.name,
                    "ignoring overwrite of read-only registration"
                );
                return (Arc::clone(&existing.registration), RegisterOutcome::KeptReadOnly);
            }
        }
        let stored = Arc::new(registration);
        debug!(service = ?stored.service_key, name = %stored.name, "storing registration");
        let previous = named.insert(
            stored.name.clone(),
            StoredRegistration {
                registration: Arc::clone(&stored),
                sequence: self.sequence.fetch_add(1, Ordering::Relaxed),
            },
        );
        let outcome = if previous.is_some() {
            RegisterOutcome::Replaced
        } else {
            RegisterOutcome::Inserted
        };
        (stored, outcome)
    }

    pub fn get(&self, service_key: TypeKey, name: &str) -> Option<Arc<ServiceRegistration>> {
        self.by_service
            .get(&service_key)
            .and_then(|named| named.get(name).map(|s| Arc::clone(&s.registration)))
    }

    /// Every registration of `service_key`, in registration order.
    pub fn all_for(&self, service_key: TypeKey) -> Vec<Arc<ServiceRegistration>> {
        let Some(named) = self.by_service.get(&service_key) else {
            return Vec::new();
        };
        let mut entries: Vec<StoredRegistration> =
            named.iter().map(|entry| entry.value().clone()).collect();
        entries.sort_by_key(|stored| stored.sequence);
        entries
            .into_iter()
            .map(|stored| stored.registration)
            .collect()
    }

    /// Named (non-default) registrations of `service_key`, in
    /// registration order. Feeds the single-registration redirect.
    pub fn named_for(&self, service_key: TypeKey) -> Vec<Arc<ServiceRegistration>> {
        self.all_for(service_key)
            .into_iter()
            .filter(|registration| !registration.name.is_empty())
            .collect()
    }

    pub fn registration_count(&self) -> usize {
        self.by_service.iter().map(|named| named.len()).sum()
    }
}

impl Default for RegistrationStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Predicate deciding whether a decorator applies to a registration.
pub type DecoratorPredicate = Arc<dyn Fn(&ServiceRegistration) -> bool + Send + Sync>;

/// Deferred resolution of a decorator's concrete type. Runs just-in-time
/// while the decorated emitter is being built, which is how proxy types
/// get synthesized only for services that are actually resolved.
pub type ImplementingTypeFactory =
    Arc<dyn Fn(&ServiceRegistration) -> DiResult<TypeKey> + Send + Sync>;

/// A registration that wraps an already-resolved service instance.
/// Decorators apply in ascending index order; index 0 wraps the raw
/// instance, each subsequent index wraps the previous result.
pub struct DecoratorRegistration {
    /// Exact service key, or an open generic definition to match every
    /// closing of it. `None` matches on the predicate alone.
    pub service_key: Option<TypeKey>,
    pub implementing_key: Option<TypeKey>,
    pub implementing_factory: Option<ImplementingTypeFactory>,
    pub can_decorate: Option<DecoratorPredicate>,
    pub index: usize,
}

impl DecoratorRegistration {
    fn matches(&self, registration: &ServiceRegistration, shape: Option<&GenericShape>) -> bool {
        if let Some(service_key) = self.service_key {
            let key_matches = service_key == registration.service_key
                || shape.is_some_and(|s| s.definition == service_key);
            if !key_matches {
                return false;
            }
        }
        match &self.can_decorate {
            Some(predicate) => predicate(registration),
            None => true,
        }
    }
}

/// Ordered list of decorator registrations. Index is assignment order.
pub struct DecoratorStore {
    decorators: Mutex<Vec<Arc<DecoratorRegistration>>>,
}

impl DecoratorStore {
    pub fn new() -> Self {
        Self {
            decorators: Mutex::new(Vec::new()),
        }
    }

    pub fn add(
        &self,
        service_key: Option<TypeKey>,
        implementing_key: Option<TypeKey>,
        implementing_factory: Option<ImplementingTypeFactory>,
        can_decorate: Option<DecoratorPredicate>,
    ) -> Arc<DecoratorRegistration> {
        let mut decorators = self.decorators.lock();
        let decorator = Arc::new(DecoratorRegistration {
            service_key,
            implementing_key,
            implementing_factory,
            can_decorate,
            index: decorators.len(),
        });
        decorators.push(Arc::clone(&decorator));
        decorator
    }

    /// Decorators applying to `registration`, ascending by index.
    pub fn decorators_for(
        &self,
        registration: &ServiceRegistration,
        shape: Option<&GenericShape>,
    ) -> Vec<Arc<DecoratorRegistration>> {
        self.decorators
            .lock()
            .iter()
            .filter(|decorator| decorator.matches(registration, shape))
            .cloned()
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.decorators.lock().is_empty()
    }
}

impl Default for DecoratorStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Predicate over the requested (service key, name).
pub type FallbackPredicate = Arc<dyn Fn(TypeKey, &str) -> bool + Send + Sync>;

/// A catch-all resolution rule, consulted in registration order when no
/// registration matches; the first match is compiled into a registration
/// on the fly.
pub struct FallbackRule {
    pub predicate: FallbackPredicate,
    pub factory: FallbackFactory,
    pub lifetime: Option<Arc<dyn Lifetime>>,
}

pub struct FallbackStore {
    rules: Mutex<Vec<Arc<FallbackRule>>>,
}

impl FallbackStore {
    pub fn new() -> Self {
        Self {
            rules: Mutex::new(Vec::new()),
        }
    }

    pub fn add(&self, rule: FallbackRule) {
        self.rules.lock().push(Arc::new(rule));
    }

    pub fn first_match(&self, service_key: TypeKey, name: &str) -> Option<Arc<FallbackRule>> {
        self.rules
            .lock()
            .iter()
            .find(|rule| (rule.predicate)(service_key, name))
            .cloned()
    }

    pub fn any_match(&self, service_key: TypeKey, name: &str) -> bool {
        self.first_match(service_key, name).is_some()
    }
}

impl Default for FallbackStore {
    fn default() -> Self {
        Self::new()
    }
}
