//! Construction plans and constructor selection
//!
//! A plan is the resolved recipe for building an implementing type: the
//! chosen constructor, its ordered dependencies and the property
//! dependencies, or a precompiled opaque delegate when the registration's
//! factory expression could not be decomposed.

use std::sync::Arc;

use trellis_reflect::{Instance, TypeDescriptor, TypeKey, TypeRegistry};

use crate::error::{DiError, DiResult};
use crate::factory::{decompose, DecomposedArgument, FactoryExpr, OpaqueFactory};

/// Answers "could the container produce (service, name)?" without
/// actually building anything. Constructor selection keys off this.
pub trait ResolvabilityProbe {
    fn can_resolve(&self, service: TypeKey, name: &str) -> bool;
}

#[derive(Clone)]
pub struct ConstructorDependency {
    pub service_key: TypeKey,
    /// Name chosen at plan time: empty for the default service, or the
    /// parameter's own name when only a same-named registration exists.
    pub service_name: String,
    pub parameter_name: String,
    pub is_required: bool,
    /// Constant captured from a factory expression; bypasses resolution.
    pub constant: Option<Instance>,
    /// Marks the parameter that receives the pre-decoration instance.
    pub is_decorator_target: bool,
}

#[derive(Clone)]
pub struct PropertyDependency {
    pub property_index: usize,
    pub service_key: TypeKey,
    pub service_name: String,
    pub constant: Option<Instance>,
}

pub struct ConstructionInfo {
    pub implementing: TypeKey,
    pub constructor_index: usize,
    pub constructor_dependencies: Vec<ConstructorDependency>,
    pub property_dependencies: Vec<PropertyDependency>,
}

/// Either an introspectable constructor recipe or an opaque delegate.
pub enum ConstructionPlan {
    Constructor(ConstructionInfo),
    Delegate(OpaqueFactory),
}

/// Pick the dependency name for a parameter or property: the default
/// service when resolvable, falling back to the member's own name for
/// convention-based named dependencies.
fn dependency_name(service: TypeKey, member_name: &str, probe: &dyn ResolvabilityProbe) -> String {
    if probe.can_resolve(service, "") {
        String::new()
    } else if probe.can_resolve(service, member_name) {
        member_name.to_string()
    } else {
        // Left as default; resolution will surface UnresolvedDependency.
        String::new()
    }
}

fn parameters_resolvable(
    descriptor: &TypeDescriptor,
    constructor_index: usize,
    probe: &dyn ResolvabilityProbe,
) -> bool {
    descriptor.constructors[constructor_index]
        .parameters
        .iter()
        .all(|p| probe.can_resolve(p.service_key, "") || probe.can_resolve(p.service_key, &p.name))
}

/// Constructor selection: a single candidate is used as-is; otherwise
/// candidates are tried in descending parameter count (declaration order
/// breaking ties) and the first whose parameters are all resolvable wins.
pub fn select_constructor(
    descriptor: &TypeDescriptor,
    probe: &dyn ResolvabilityProbe,
) -> DiResult<usize> {
    match descriptor.constructors.len() {
        0 => Err(DiError::NoPublicConstructor {
            implementing: descriptor.name.clone(),
        }),
        1 => Ok(0),
        n => {
            let mut order: Vec<usize> = (0..n).collect();
            order.sort_by_key(|&i| std::cmp::Reverse(descriptor.constructors[i].parameters.len()));
            order
                .into_iter()
                .find(|&i| parameters_resolvable(descriptor, i, probe))
                .ok_or_else(|| DiError::NoResolvableConstructor {
                    implementing: descriptor.name.clone(),
                })
        }
    }
}

/// Build a plan from an implementing type's descriptor.
pub fn plan_for_type(
    implementing: TypeKey,
    descriptor: &TypeDescriptor,
    probe: &dyn ResolvabilityProbe,
) -> DiResult<ConstructionPlan> {
    let constructor_index = select_constructor(descriptor, probe)?;
    let constructor_dependencies = descriptor.constructors[constructor_index]
        .parameters
        .iter()
        .map(|parameter| ConstructorDependency {
            service_key: parameter.service_key,
            service_name: dependency_name(parameter.service_key, &parameter.name, probe),
            parameter_name: parameter.name.clone(),
            is_required: true,
            constant: None,
            is_decorator_target: false,
        })
        .collect();
    let property_dependencies = descriptor
        .properties
        .iter()
        .enumerate()
        .map(|(index, property)| PropertyDependency {
            property_index: index,
            service_key: property.service_key,
            service_name: dependency_name(property.service_key, &property.name, probe),
            constant: None,
        })
        .collect();
    Ok(ConstructionPlan::Constructor(ConstructionInfo {
        implementing,
        constructor_index,
        constructor_dependencies,
        property_dependencies,
    }))
}

/// Build a plan from a factory expression: decomposable expressions yield
/// a constructor recipe whose dependencies participate in decoration and
/// lifetime wrapping; everything else compiles to an opaque delegate.
pub fn plan_for_factory(
    expr: &FactoryExpr,
    registry: &Arc<TypeRegistry>,
) -> DiResult<ConstructionPlan> {
    let Some(decomposed) = decompose(expr) else {
        return Ok(ConstructionPlan::Delegate(crate::factory::compile_opaque(
            expr.clone(),
            Arc::clone(registry),
        )));
    };

    let descriptor = registry
        .describe_key(decomposed.implementing)
        .ok_or_else(|| DiError::UnableToDetermineImplementingType {
            service: registry.name_of(decomposed.implementing),
        })?;
    let constructor_index = descriptor
        .constructors
        .iter()
        .position(|c| c.parameters.len() == decomposed.arguments.len())
        .ok_or_else(|| DiError::NoResolvableConstructor {
            implementing: descriptor.name.clone(),
        })?;

    let constructor_dependencies = decomposed
        .arguments
        .iter()
        .zip(&descriptor.constructors[constructor_index].parameters)
        .map(|(argument, parameter)| match argument {
            DecomposedArgument::Service { service, name } => ConstructorDependency {
                service_key: *service,
                service_name: name.clone(),
                parameter_name: parameter.name.clone(),
                is_required: true,
                constant: None,
                is_decorator_target: false,
            },
            DecomposedArgument::AllServices { element } => ConstructorDependency {
                service_key: registry.sequence_of(*element),
                service_name: String::new(),
                parameter_name: parameter.name.clone(),
                is_required: true,
                constant: None,
                is_decorator_target: false,
            },
            DecomposedArgument::Constant(value) => ConstructorDependency {
                service_key: parameter.service_key,
                service_name: String::new(),
                parameter_name: parameter.name.clone(),
                is_required: false,
                constant: Some(Arc::clone(value)),
                is_decorator_target: false,
            },
        })
        .collect();

    let mut property_dependencies = Vec::new();
    for (property_name, argument) in &decomposed.initializers {
        let property_index = descriptor
            .properties
            .iter()
            .position(|p| p.name == *property_name)
            .ok_or_else(|| DiError::UnresolvedDependency {
                service: descriptor.name.clone(),
                dependency: property_name.clone(),
                member: format!("property {property_name}"),
            })?;
        let property = &descriptor.properties[property_index];
        property_dependencies.push(match argument {
            DecomposedArgument::Service { service, name } => PropertyDependency {
                property_index,
                service_key: *service,
                service_name: name.clone(),
                constant: None,
            },
            DecomposedArgument::AllServices { element } => PropertyDependency {
                property_index,
                service_key: registry.sequence_of(*element),
                service_name: String::new(),
                constant: None,
            },
            DecomposedArgument::Constant(value) => PropertyDependency {
                property_index,
                service_key: property.service_key,
                service_name: String::new(),
                constant: Some(Arc::clone(value)),
            },
        });
    }

    Ok(ConstructionPlan::Constructor(ConstructionInfo {
        implementing: decomposed.implementing,
        constructor_index,
        constructor_dependencies,
        property_dependencies,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use trellis_reflect::param;

    struct FixedProbe {
        resolvable: HashSet<(TypeKey, String)>,
    }

    impl FixedProbe {
        fn of(entries: &[(TypeKey, &str)]) -> Self {
            Self {
                resolvable: entries
                    .iter()
                    .map(|(k, n)| (*k, n.to_string()))
                    .collect(),
            }
        }
    }

    impl ResolvabilityProbe for FixedProbe {
        fn can_resolve(&self, service: TypeKey, name: &str) -> bool {
            self.resolvable.contains(&(service, name.to_string()))
        }
    }

    struct Sample;

    fn descriptor_with_ctors(registry: &TypeRegistry) -> Arc<TypeDescriptor> {
        let a = TypeKey::of::<u8>();
        let b = TypeKey::of::<u16>();
        let key = registry
            .describe::<Sample>("Sample")
            .constructor(vec![param("a", a)], |_| Ok(Box::new(Sample)))
            .constructor(vec![param("a", a), param("b", b)], |_| Ok(Box::new(Sample)))
            .constructor(vec![param("b", b), param("a", a)], |_| Ok(Box::new(Sample)))
            .build();
        registry.describe_key(key).unwrap()
    }

    #[test]
    fn test_descending_arity_first_resolvable_wins() {
        let registry = TypeRegistry::new();
        let descriptor = descriptor_with_ctors(&registry);

        // Both two-parameter constructors are resolvable; declaration
        // order breaks the tie.
        let probe = FixedProbe::of(&[(TypeKey::of::<u8>(), ""), (TypeKey::of::<u16>(), "")]);
        assert_eq!(select_constructor(&descriptor, &probe).unwrap(), 1);

        // Only u8 resolvable: falls down to the one-parameter constructor.
        let probe = FixedProbe::of(&[(TypeKey::of::<u8>(), "")]);
        assert_eq!(select_constructor(&descriptor, &probe).unwrap(), 0);
    }

    #[test]
    fn test_parameter_name_keyed_resolution_counts() {
        let registry = TypeRegistry::new();
        let descriptor = descriptor_with_ctors(&registry);
        // u16 only resolvable under the parameter name "b".
        let probe = FixedProbe::of(&[(TypeKey::of::<u8>(), ""), (TypeKey::of::<u16>(), "b")]);
        let index = select_constructor(&descriptor, &probe).unwrap();
        assert_eq!(index, 1);

        let plan = plan_for_type(TypeKey::of::<Sample>(), &descriptor, &probe).unwrap();
        let ConstructionPlan::Constructor(info) = plan else {
            panic!("expected constructor plan");
        };
        assert_eq!(info.constructor_dependencies[1].service_name, "b");
    }

    #[test]
    fn test_no_candidates() {
        let registry = TypeRegistry::new();
        let key = registry.describe::<Sample>("Bare").build();
        let descriptor = registry.describe_key(key).unwrap();
        let probe = FixedProbe::of(&[]);
        assert!(matches!(
            select_constructor(&descriptor, &probe),
            Err(DiError::NoPublicConstructor { .. })
        ));
    }

    #[test]
    fn test_multiple_candidates_none_resolvable() {
        let registry = TypeRegistry::new();
        let descriptor = descriptor_with_ctors(&registry);
        let probe = FixedProbe::of(&[]);
        assert!(matches!(
            select_constructor(&descriptor, &probe),
            Err(DiError::NoResolvableConstructor { .. })
        ));
    }

    #[test]
    fn test_single_constructor_used_without_resolvability_check() {
        let registry = TypeRegistry::new();
        let key = registry
            .describe::<Sample>("Single")
            .constructor(vec![param("a", TypeKey::of::<u8>())], |_| Ok(Box::new(Sample)))
            .build();
        let descriptor = registry.describe_key(key).unwrap();
        let probe = FixedProbe::of(&[]);
        assert_eq!(select_constructor(&descriptor, &probe).unwrap(), 0);
    }

    #[test]
    fn test_factory_plan_maps_arguments() {
        let registry = Arc::new(TypeRegistry::new());
        let a = TypeKey::of::<u8>();
        registry
            .describe::<Sample>("Sample")
            .constructor(vec![param("dep", a), param("limit", TypeKey::of::<usize>())], |_| {
                Ok(Box::new(Sample))
            })
            .build();

        let expr = FactoryExpr::New {
            implementing: TypeKey::of::<Sample>(),
            args: vec![
                FactoryExpr::GetInstance { service: a, name: "named".into() },
                FactoryExpr::constant(10usize),
            ],
            initializers: vec![],
        };
        let plan = plan_for_factory(&expr, &registry).unwrap();
        let ConstructionPlan::Constructor(info) = plan else {
            panic!("expected constructor plan");
        };
        assert_eq!(info.constructor_dependencies[0].service_name, "named");
        assert!(info.constructor_dependencies[1].constant.is_some());
        assert!(!info.constructor_dependencies[1].is_required);
    }

    #[test]
    fn test_non_decomposable_factory_compiles_to_delegate() {
        let registry = Arc::new(TypeRegistry::new());
        let expr = FactoryExpr::opaque(|_| Ok(Arc::new(3u8) as Instance));
        let plan = plan_for_factory(&expr, &registry).unwrap();
        assert!(matches!(plan, ConstructionPlan::Delegate(_)));
    }
}
