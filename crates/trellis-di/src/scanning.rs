//! Lazy service discovery
//!
//! A container can be handed a [`TypeScanner`]: when a resolution request
//! finds no registration, the scanner is consulted once for that service
//! type and may register whatever it discovers before the lookup is
//! retried. Scanned registrations honor the caller-supplied lifetime
//! factory and registration predicate.

use std::sync::Arc;

use tracing::debug;

use trellis_reflect::{TypeKey, TypeRegistry};

use crate::lifetime::Lifetime;

/// Produces the lifetime to attach to each scanned registration. `None`
/// registers the service as transient.
pub type LifetimeFactory = Arc<dyn Fn() -> Option<Arc<dyn Lifetime>> + Send + Sync>;

/// Decides whether a discovered (service, implementing) pair should be
/// registered at all.
pub type ShouldRegister = Arc<dyn Fn(TypeKey, TypeKey) -> bool + Send + Sync>;

/// The registration surface a scanner writes through.
pub trait ScanRegistrar {
    fn register_scanned(
        &self,
        service: TypeKey,
        implementing: TypeKey,
        name: &str,
        lifetime: Option<Arc<dyn Lifetime>>,
    );
}

/// External collaborator that discovers implementations of unknown
/// service types.
pub trait TypeScanner: Send + Sync {
    fn scan(
        &self,
        registry: &Arc<TypeRegistry>,
        registrar: &dyn ScanRegistrar,
        lifetime_factory: &LifetimeFactory,
        should_register: &ShouldRegister,
    );
}

/// A scanner plus its registration policy, as bound to a container.
#[derive(Clone)]
pub(crate) struct ScannerBinding {
    pub scanner: Arc<dyn TypeScanner>,
    pub lifetime_factory: LifetimeFactory,
    pub should_register: ShouldRegister,
}

/// Derive the registration name for a discovered implementation.
///
/// The implementation whose name matches its contract's name (modulo an
/// `I` prefix and path) becomes the default registration; every other
/// implementation is registered under its own short name.
pub fn convention_name(service_name: &str, implementing_name: &str) -> String {
    let service_short = short_name(service_name);
    let service_short = service_short.strip_prefix("dyn ").unwrap_or(service_short);
    let implementing_short = short_name(implementing_name);

    let stripped = match service_short.strip_prefix('I') {
        Some(rest) if rest.starts_with(|c: char| c.is_ascii_uppercase()) => rest,
        _ => service_short,
    };
    if stripped == implementing_short {
        String::new()
    } else {
        implementing_short.to_string()
    }
}

fn short_name(name: &str) -> &str {
    name.rsplit("::").next().unwrap_or(name)
}

/// Scans a fixed candidate list: each described candidate is registered
/// against every contract it declares, named by convention.
pub struct ListScanner {
    candidates: Vec<TypeKey>,
}

impl ListScanner {
    pub fn new(candidates: Vec<TypeKey>) -> Self {
        Self { candidates }
    }
}

impl TypeScanner for ListScanner {
    fn scan(
        &self,
        registry: &Arc<TypeRegistry>,
        registrar: &dyn ScanRegistrar,
        lifetime_factory: &LifetimeFactory,
        should_register: &ShouldRegister,
    ) {
        for &candidate in &self.candidates {
            let Some(descriptor) = registry.describe_key(candidate) else {
                continue;
            };
            let contracts: Vec<TypeKey> = descriptor.contract_keys().collect();
            if contracts.is_empty() {
                if should_register(candidate, candidate) {
                    debug!(implementing = %descriptor.name, "scanned self-registration");
                    registrar.register_scanned(candidate, candidate, "", lifetime_factory());
                }
                continue;
            }
            for service in contracts {
                if !should_register(service, candidate) {
                    continue;
                }
                let name = convention_name(&registry.name_of(service), &descriptor.name);
                debug!(
                    service = %registry.name_of(service),
                    implementing = %descriptor.name,
                    name = %name,
                    "scanned registration"
                );
                registrar.register_scanned(service, candidate, &name, lifetime_factory());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn test_convention_name_prefix_match_is_default() {
        assert_eq!(convention_name("dyn app::ILogger", "app::Logger"), "");
        assert_eq!(convention_name("dyn app::Logger", "app::Logger"), "");
        assert_eq!(
            convention_name("dyn app::ILogger", "app::ConsoleLogger"),
            "ConsoleLogger"
        );
    }

    #[test]
    fn test_convention_name_keeps_non_prefix_i() {
        // `Inventory` starts with I but is not an I-prefixed contract name.
        assert_eq!(convention_name("dyn app::Inventory", "app::Inventory"), "");
        assert_eq!(
            convention_name("dyn app::Inventory", "app::DbInventory"),
            "DbInventory"
        );
    }

    struct CollectingRegistrar {
        seen: Mutex<Vec<(TypeKey, TypeKey, String)>>,
    }

    impl ScanRegistrar for CollectingRegistrar {
        fn register_scanned(
            &self,
            service: TypeKey,
            implementing: TypeKey,
            name: &str,
            _lifetime: Option<Arc<dyn Lifetime>>,
        ) {
            self.seen.lock().push((service, implementing, name.to_string()));
        }
    }

    trait Greeter: Send + Sync {}
    struct EnglishGreeter;
    impl Greeter for EnglishGreeter {}

    #[test]
    fn test_list_scanner_registers_declared_contracts() {
        let registry = Arc::new(TypeRegistry::new());
        let candidate = registry
            .describe::<EnglishGreeter>("EnglishGreeter")
            .constructor(vec![], |_| Ok(Box::new(EnglishGreeter)))
            .implements::<dyn Greeter>(|concrete| concrete as Arc<dyn Greeter>)
            .build();

        let registrar = CollectingRegistrar {
            seen: Mutex::new(Vec::new()),
        };
        let lifetime_factory: LifetimeFactory = Arc::new(|| None);
        let should_register: ShouldRegister = Arc::new(|_, _| true);

        ListScanner::new(vec![candidate]).scan(
            &registry,
            &registrar,
            &lifetime_factory,
            &should_register,
        );

        let seen = registrar.seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, TypeKey::of::<dyn Greeter>());
        assert_eq!(seen[0].1, candidate);
        assert_eq!(seen[0].2, "EnglishGreeter");
    }

    #[test]
    fn test_list_scanner_honors_predicate() {
        let registry = Arc::new(TypeRegistry::new());
        let candidate = registry
            .describe::<EnglishGreeter>("EnglishGreeter")
            .constructor(vec![], |_| Ok(Box::new(EnglishGreeter)))
            .build();

        let registrar = CollectingRegistrar {
            seen: Mutex::new(Vec::new()),
        };
        let lifetime_factory: LifetimeFactory = Arc::new(|| None);
        let should_register: ShouldRegister = Arc::new(|_, _| false);

        ListScanner::new(vec![candidate]).scan(
            &registry,
            &registrar,
            &lifetime_factory,
            &should_register,
        );
        assert!(registrar.seen.lock().is_empty());
    }
}
