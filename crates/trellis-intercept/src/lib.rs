//! Method interception for Trellis
//!
//! Synthesizes proxy types at runtime that stand in for a target service
//! and route selected method calls through an ordered chain of
//! interceptors. Rust has no runtime code generation, so a proxy here is
//! an indirection table of closures: the proxy type is a fresh
//! [`TypeDescriptor`](trellis_reflect::TypeDescriptor) whose constructor
//! yields a [`ProxyInstance`] carrying a per-method dispatch table.
//!
//! Methods with no matching interceptor pass straight through to the
//! target; fluent methods that return the target itself return the proxy
//! instead, so chained calls keep flowing through the interceptors.
//!
//! ## Usage
//!
//! ```rust,ignore
//! let mut definition = ProxyDefinition::new(target_key);
//! definition.implement_all(|| Arc::new(TimingInterceptor::default()));
//! let proxy_key = builder.get_proxy_type(&registry, &definition)?;
//! ```

mod error;
mod invocation;
mod proxy;

pub use error::InterceptError;
pub use invocation::{Interceptor, Invocation, LambdaInterceptor};
pub use proxy::{
    InterceptorFactory, InterceptorInfo, MethodSelector, ProxyBuilder, ProxyDefinition,
    ProxyInstance,
};
