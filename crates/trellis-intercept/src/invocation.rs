//! The per-call invocation record and the interceptor contract

use std::sync::Arc;

use trellis_reflect::{BoxedInstance, MethodDescriptor, ReturnValue};

use crate::error::InterceptError;
use crate::proxy::ProxyInstance;

/// User logic woven around a proxied method call.
///
/// An interceptor may inspect or mutate the arguments before calling
/// [`Invocation::proceed`], short-circuit by never calling it (the target
/// method then never runs), or wrap errors coming back from it.
pub trait Interceptor: Send + Sync {
    fn invoke(&self, invocation: &mut Invocation<'_>) -> Result<ReturnValue, InterceptError>;
}

/// An interceptor backed by a plain closure.
pub struct LambdaInterceptor<F> {
    implementation: F,
}

impl<F> LambdaInterceptor<F>
where
    F: Fn(&mut Invocation<'_>) -> Result<ReturnValue, InterceptError> + Send + Sync,
{
    pub fn new(implementation: F) -> Self {
        Self { implementation }
    }
}

impl<F> Interceptor for LambdaInterceptor<F>
where
    F: Fn(&mut Invocation<'_>) -> Result<ReturnValue, InterceptError> + Send + Sync,
{
    fn invoke(&self, invocation: &mut Invocation<'_>) -> Result<ReturnValue, InterceptError> {
        (self.implementation)(invocation)
    }
}

type TerminalCall<'a> = &'a dyn Fn(&mut Vec<BoxedInstance>) -> Result<ReturnValue, InterceptError>;

/// One intercepted call: the method being invoked, the proxy it was
/// invoked on, the (mutable) argument array and the continuation that
/// advances to the next interceptor or, at the end of the chain, to the
/// real target method.
///
/// Created per call and discarded afterwards; the chain is linear and
/// runs on the caller's thread.
pub struct Invocation<'a> {
    method: &'a Arc<MethodDescriptor>,
    proxy: &'a Arc<ProxyInstance>,
    args: &'a mut Vec<BoxedInstance>,
    chain: &'a [Arc<dyn Interceptor>],
    position: usize,
    terminal: TerminalCall<'a>,
}

impl<'a> Invocation<'a> {
    pub(crate) fn new(
        method: &'a Arc<MethodDescriptor>,
        proxy: &'a Arc<ProxyInstance>,
        args: &'a mut Vec<BoxedInstance>,
        chain: &'a [Arc<dyn Interceptor>],
        terminal: TerminalCall<'a>,
    ) -> Self {
        Self {
            method,
            proxy,
            args,
            chain,
            position: 0,
            terminal,
        }
    }

    /// The method being invoked.
    pub fn method(&self) -> &MethodDescriptor {
        self.method
    }

    /// The proxy instance the call entered through.
    pub fn proxy(&self) -> &Arc<ProxyInstance> {
        self.proxy
    }

    pub fn args(&self) -> &[BoxedInstance] {
        self.args
    }

    /// Mutable access to the argument array. Changes are visible to later
    /// interceptors and to the target method.
    pub fn args_mut(&mut self) -> &mut Vec<BoxedInstance> {
        self.args
    }

    /// Advance to the next interceptor in the chain, or to the real
    /// target method once the chain is exhausted.
    pub fn proceed(&mut self) -> Result<ReturnValue, InterceptError> {
        if self.position < self.chain.len() {
            let next = Arc::clone(&self.chain[self.position]);
            self.position += 1;
            let result = next.invoke(self);
            self.position -= 1;
            result
        } else {
            (self.terminal)(self.args)
        }
    }
}
