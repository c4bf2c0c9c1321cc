//! Type identity and type-erased instance helpers

use std::any::{Any, TypeId};
use std::sync::Arc;

use crate::error::ReflectError;

/// Universal representation of a constructed service instance.
pub type Instance = Arc<dyn Any + Send + Sync>;

/// A freshly constructed, still-mutable instance. Property injection runs
/// against the box before it is frozen into an [`Instance`].
pub type BoxedInstance = Box<dyn Any + Send + Sync>;

/// Error type carried by user-supplied descriptor closures.
pub type DynError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Identity of a described type.
///
/// Native keys come from `std::any::TypeId` and cover every Rust type
/// (including unsized trait objects used as service contracts). Synthetic
/// keys are allocated by the [`TypeRegistry`](crate::TypeRegistry) for
/// types that only exist at runtime: closed generic instantiations and
/// synthesized proxy types.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum TypeKey {
    Native(TypeId),
    Synthetic(u64),
}

impl TypeKey {
    /// The key for a native Rust type, sized or not.
    ///
    /// Service contracts are keyed by their trait object type:
    /// `TypeKey::of::<dyn Greeter>()`.
    pub fn of<T: ?Sized + 'static>() -> Self {
        TypeKey::Native(TypeId::of::<T>())
    }
}

/// Wrap a plain value as an [`Instance`].
pub fn instance_of<T: Send + Sync + 'static>(value: T) -> Instance {
    Arc::new(value)
}

/// Freeze a constructed box into the shared instance representation.
pub fn freeze(boxed: BoxedInstance) -> Instance {
    Arc::from(boxed)
}

/// Downcast an instance to a concrete type.
pub fn downcast_arc<T: Send + Sync + 'static>(instance: Instance) -> Result<Arc<T>, DynError> {
    instance.downcast::<T>().map_err(|_| {
        Box::new(ReflectError::DowncastFailed {
            expected: std::any::type_name::<T>().to_string(),
        }) as DynError
    })
}

/// Downcast an instance holding a contract-typed `Arc<C>`.
///
/// Contract-typed instances store the `Arc<C>` itself as the erased
/// value, so the downcast goes through `Arc<Arc<C>>`.
pub fn downcast_contract<C: ?Sized + Send + Sync + 'static>(
    instance: Instance,
) -> Result<Arc<C>, DynError> {
    match instance.downcast::<Arc<C>>() {
        Ok(outer) => Ok(Arc::clone(&outer)),
        Err(_) => Err(Box::new(ReflectError::DowncastFailed {
            expected: std::any::type_name::<Arc<C>>().to_string(),
        }) as DynError),
    }
}

/// Borrow a method argument at `index` as `T`.
pub fn arg_ref<T: 'static>(args: &[BoxedInstance], index: usize) -> Result<&T, DynError> {
    args.get(index)
        .and_then(|arg| arg.downcast_ref::<T>())
        .ok_or_else(|| {
            Box::new(ReflectError::DowncastFailed {
                expected: format!("argument {} as {}", index, std::any::type_name::<T>()),
            }) as DynError
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    trait Marker: Send + Sync {}
    struct Impl;
    impl Marker for Impl {}

    #[test]
    fn test_native_keys_are_stable() {
        assert_eq!(TypeKey::of::<Impl>(), TypeKey::of::<Impl>());
        assert_ne!(TypeKey::of::<Impl>(), TypeKey::of::<dyn Marker>());
    }

    #[test]
    fn test_freeze_and_downcast() {
        let boxed: BoxedInstance = Box::new(41u32);
        let instance = freeze(boxed);
        let typed = downcast_arc::<u32>(instance).unwrap();
        assert_eq!(*typed, 41);
    }

    #[test]
    fn test_contract_round_trip() {
        let concrete = Arc::new(Impl);
        let contract: Arc<dyn Marker> = concrete;
        let instance = instance_of(contract);
        assert!(downcast_contract::<dyn Marker>(instance).is_ok());
    }

    #[test]
    fn test_failed_downcast_reports_expected_type() {
        let instance = instance_of(1u8);
        let err = downcast_arc::<u16>(instance).unwrap_err();
        assert!(err.to_string().contains("u16"));
    }
}
