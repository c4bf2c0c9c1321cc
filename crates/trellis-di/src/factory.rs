//! Factory expressions and their structural decomposition
//!
//! A registration may describe construction as a small closed AST instead
//! of an implementing type. When the expression is a plain `New` whose
//! arguments are dependency-factory calls or constants, it decomposes
//! into ordinary constructor/property dependencies that participate in
//! decoration and lifetime wrapping like any other registration. Anything
//! else compiles into an opaque delegate, which is a documented degraded
//! mode rather than an error.

use std::sync::Arc;

use trellis_reflect::{DynError, Instance, Sequence, TypeKey, TypeRegistry};

/// What a factory expression programs against: the resolution surface of
/// the owning container, plus any caller-supplied runtime arguments.
pub trait DependencyFactory: Send + Sync {
    fn get_instance(&self, service: TypeKey, name: &str) -> Result<Instance, DynError>;
    fn get_all_instances(&self, element: TypeKey) -> Result<Vec<Instance>, DynError>;
    /// Arguments passed by the caller of a parameterized resolution.
    fn runtime_args(&self) -> &[Instance];
}

/// A compiled, non-introspectable factory delegate.
pub type OpaqueFactory =
    Arc<dyn Fn(&dyn DependencyFactory) -> Result<Instance, DynError> + Send + Sync>;

/// Factory attached to a fallback rule; receives the requested key/name.
pub type FallbackFactory =
    Arc<dyn Fn(&dyn DependencyFactory, TypeKey, &str) -> Result<Instance, DynError> + Send + Sync>;

/// The closed factory-expression AST.
#[derive(Clone)]
pub enum FactoryExpr {
    /// Construct `implementing` with the given arguments, then apply the
    /// named property initializers.
    New {
        implementing: TypeKey,
        args: Vec<FactoryExpr>,
        initializers: Vec<(String, FactoryExpr)>,
    },
    GetInstance { service: TypeKey, name: String },
    GetAllInstances { element: TypeKey },
    Constant(Instance),
    Convert {
        expr: Box<FactoryExpr>,
        target: TypeKey,
    },
    Opaque(OpaqueFactory),
}

impl FactoryExpr {
    pub fn constant<T: Send + Sync + 'static>(value: T) -> Self {
        FactoryExpr::Constant(Arc::new(value))
    }

    pub fn opaque(
        delegate: impl Fn(&dyn DependencyFactory) -> Result<Instance, DynError> + Send + Sync + 'static,
    ) -> Self {
        FactoryExpr::Opaque(Arc::new(delegate))
    }

    /// The service key an expression is known to produce, when that is
    /// statically provable.
    fn produced_key(&self) -> Option<TypeKey> {
        match self {
            FactoryExpr::New { implementing, .. } => Some(*implementing),
            FactoryExpr::GetInstance { service, .. } => Some(*service),
            FactoryExpr::Convert { target, .. } => Some(*target),
            _ => None,
        }
    }
}

impl std::fmt::Debug for FactoryExpr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FactoryExpr::New { implementing, args, initializers } => f
                .debug_struct("New")
                .field("implementing", implementing)
                .field("args", &args.len())
                .field("initializers", &initializers.len())
                .finish(),
            FactoryExpr::GetInstance { service, name } => f
                .debug_struct("GetInstance")
                .field("service", service)
                .field("name", name)
                .finish(),
            FactoryExpr::GetAllInstances { element } => f
                .debug_struct("GetAllInstances")
                .field("element", element)
                .finish(),
            FactoryExpr::Constant(_) => f.write_str("Constant"),
            FactoryExpr::Convert { target, .. } => {
                f.debug_struct("Convert").field("target", target).finish()
            }
            FactoryExpr::Opaque(_) => f.write_str("Opaque"),
        }
    }
}

/// One extracted constructor argument or property initializer.
#[derive(Clone)]
pub enum DecomposedArgument {
    Service { service: TypeKey, name: String },
    AllServices { element: TypeKey },
    Constant(Instance),
}

/// The introspectable form of a decomposable factory expression.
pub struct DecomposedFactory {
    pub implementing: TypeKey,
    pub arguments: Vec<DecomposedArgument>,
    pub initializers: Vec<(String, DecomposedArgument)>,
}

fn decompose_argument(expr: &FactoryExpr) -> Option<DecomposedArgument> {
    match expr {
        FactoryExpr::GetInstance { service, name } => Some(DecomposedArgument::Service {
            service: *service,
            name: name.clone(),
        }),
        FactoryExpr::GetAllInstances { element } => Some(DecomposedArgument::AllServices {
            element: *element,
        }),
        FactoryExpr::Constant(value) => Some(DecomposedArgument::Constant(Arc::clone(value))),
        _ => None,
    }
}

/// Statically decompose a factory expression into constructor and
/// property dependencies. `None` means the expression must be compiled
/// whole via [`compile_opaque`].
pub fn decompose(expr: &FactoryExpr) -> Option<DecomposedFactory> {
    let FactoryExpr::New { implementing, args, initializers } = expr else {
        return None;
    };
    let arguments: Option<Vec<_>> = args.iter().map(decompose_argument).collect();
    let inits: Option<Vec<_>> = initializers
        .iter()
        .map(|(name, value)| decompose_argument(value).map(|arg| (name.clone(), arg)))
        .collect();
    Some(DecomposedFactory {
        implementing: *implementing,
        arguments: arguments?,
        initializers: inits?,
    })
}

fn evaluate(
    expr: &FactoryExpr,
    registry: &TypeRegistry,
    factory: &dyn DependencyFactory,
) -> Result<Instance, DynError> {
    match expr {
        FactoryExpr::Constant(value) => Ok(Arc::clone(value)),
        FactoryExpr::GetInstance { service, name } => factory.get_instance(*service, name),
        FactoryExpr::GetAllInstances { element } => {
            let items = factory.get_all_instances(*element)?;
            Ok(Arc::new(Sequence::new(items)) as Instance)
        }
        FactoryExpr::Opaque(delegate) => delegate(factory),
        FactoryExpr::New { implementing, args, initializers } => {
            let descriptor = registry.describe_key(*implementing).ok_or_else(|| {
                format!("unknown type in factory expression: {implementing:?}")
            })?;
            let constructor = descriptor
                .constructors
                .iter()
                .find(|c| c.parameters.len() == args.len())
                .ok_or_else(|| {
                    format!(
                        "{} has no constructor taking {} argument(s)",
                        descriptor.name,
                        args.len()
                    )
                })?;
            let resolved: Result<Vec<Instance>, DynError> = args
                .iter()
                .map(|arg| evaluate(arg, registry, factory))
                .collect();
            let mut built = (constructor.invoke)(resolved?)?;
            for (property_name, value) in initializers {
                let property = descriptor
                    .properties
                    .iter()
                    .find(|p| p.name == *property_name)
                    .ok_or_else(|| {
                        format!("{} has no property {property_name}", descriptor.name)
                    })?;
                let value = evaluate(value, registry, factory)?;
                (property.set)(built.as_mut(), value)?;
            }
            Ok(trellis_reflect::freeze(built))
        }
        FactoryExpr::Convert { expr, target } => {
            let source = expr
                .produced_key()
                .ok_or_else(|| format!("cannot prove conversion to {target:?} is safe"))?;
            let instance = evaluate(expr, registry, factory)?;
            let descriptor = registry
                .describe_key(source)
                .ok_or_else(|| format!("unknown conversion source: {source:?}"))?;
            let cast = descriptor.cast_to(*target).ok_or_else(|| {
                format!("{} does not implement {target:?}", descriptor.name)
            })?;
            cast(instance)
        }
    }
}

/// Compile a non-decomposable expression into an opaque delegate. No
/// fine-grained dependency introspection is possible afterwards.
pub fn compile_opaque(expr: FactoryExpr, registry: Arc<TypeRegistry>) -> OpaqueFactory {
    if let FactoryExpr::Opaque(delegate) = expr {
        return delegate;
    }
    Arc::new(move |factory| evaluate(&expr, &registry, factory))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_new_decomposes() {
        let expr = FactoryExpr::New {
            implementing: TypeKey::of::<String>(),
            args: vec![
                FactoryExpr::GetInstance {
                    service: TypeKey::of::<u32>(),
                    name: "named".into(),
                },
                FactoryExpr::constant(7u8),
                FactoryExpr::GetAllInstances {
                    element: TypeKey::of::<u16>(),
                },
            ],
            initializers: vec![],
        };
        let decomposed = decompose(&expr).unwrap();
        assert_eq!(decomposed.implementing, TypeKey::of::<String>());
        assert_eq!(decomposed.arguments.len(), 3);
        assert!(matches!(
            &decomposed.arguments[0],
            DecomposedArgument::Service { name, .. } if name == "named"
        ));
        assert!(matches!(decomposed.arguments[1], DecomposedArgument::Constant(_)));
        assert!(matches!(decomposed.arguments[2], DecomposedArgument::AllServices { .. }));
    }

    #[test]
    fn test_nested_new_does_not_decompose() {
        let expr = FactoryExpr::New {
            implementing: TypeKey::of::<String>(),
            args: vec![FactoryExpr::New {
                implementing: TypeKey::of::<u32>(),
                args: vec![],
                initializers: vec![],
            }],
            initializers: vec![],
        };
        assert!(decompose(&expr).is_none());
    }

    #[test]
    fn test_top_level_non_new_does_not_decompose() {
        assert!(decompose(&FactoryExpr::constant(1u8)).is_none());
        assert!(decompose(&FactoryExpr::opaque(|_| Ok(Arc::new(0u8) as Instance))).is_none());
    }

    struct NoDeps;
    impl DependencyFactory for NoDeps {
        fn get_instance(&self, service: TypeKey, _name: &str) -> Result<Instance, DynError> {
            Err(format!("unexpected get_instance for {service:?}").into())
        }
        fn get_all_instances(&self, _element: TypeKey) -> Result<Vec<Instance>, DynError> {
            Ok(Vec::new())
        }
        fn runtime_args(&self) -> &[Instance] {
            &[]
        }
    }

    #[test]
    fn test_opaque_compilation_interprets_new_with_initializers() {
        struct Widget {
            label: String,
        }

        let registry = Arc::new(TypeRegistry::new());
        registry
            .describe::<Widget>("Widget")
            .constructor(vec![], |_| Ok(Box::new(Widget { label: String::new() })))
            .property("label", TypeKey::of::<String>(), |target, value| {
                let widget = target.downcast_mut::<Widget>().ok_or("expected Widget")?;
                widget.label = (*trellis_reflect::downcast_arc::<String>(value)?).clone();
                Ok(())
            })
            .build();

        // The opaque initializer value blocks decomposition, so the whole
        // expression runs interpreted.
        let expr = FactoryExpr::New {
            implementing: TypeKey::of::<Widget>(),
            args: vec![],
            initializers: vec![(
                "label".into(),
                FactoryExpr::opaque(|_| Ok(Arc::new("hello".to_string()) as Instance)),
            )],
        };
        assert!(decompose(&expr).is_none());
        let delegate = compile_opaque(expr, Arc::clone(&registry));
        let instance = delegate(&NoDeps).unwrap();
        let widget = trellis_reflect::downcast_arc::<Widget>(instance).unwrap();
        assert_eq!(widget.label, "hello");
    }
}
