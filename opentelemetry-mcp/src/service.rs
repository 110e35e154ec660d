use crate::envelope::Envelope;
use crate::interceptor::Interceptor;
use crate::lifecycle::{TracedFuture, Truthiness};
use opentelemetry::Context;
use serde::Serialize;
use std::fmt::Display;
use std::task::{Context as TaskContext, Poll};
use tower::{Layer, Service};

/// Tower layer tracing requests through an [`Interceptor`].
///
/// Without an interceptor the layer is a passthrough, so a host can compose it
/// unconditionally and only pay for tracing on instrumented hook points.
#[derive(Clone, Debug, Default)]
pub struct TracingLayer {
    interceptor: Option<Interceptor>,
}

impl TracingLayer {
    /// Create a layer tracing requests with `interceptor`.
    pub fn new(interceptor: Interceptor) -> Self {
        TracingLayer {
            interceptor: Some(interceptor),
        }
    }

    /// Create a layer that forwards requests untouched.
    pub fn passthrough() -> Self {
        TracingLayer { interceptor: None }
    }
}

impl<S> Layer<S> for TracingLayer {
    type Service = TracingService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        TracingService {
            inner,
            interceptor: self.interceptor.clone(),
        }
    }
}

/// Service produced by [`TracingLayer`].
///
/// Each call opens a span before the request reaches the inner service and
/// finishes it when the inner future resolves. The inner service's response
/// and error are returned unchanged.
#[derive(Clone, Debug)]
pub struct TracingService<S> {
    inner: S,
    interceptor: Option<Interceptor>,
}

impl<S> TracingService<S> {
    /// Get a reference to the inner service.
    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    /// Consume the wrapper, returning the inner service.
    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S, Req> Service<Req> for TracingService<S>
where
    S: Service<Req>,
    S::Response: Truthiness,
    S::Error: Display,
    Req: Envelope + Serialize,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = TracedFuture<S::Future>;

    fn poll_ready(&mut self, cx: &mut TaskContext<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut request: Req) -> Self::Future {
        let Some(interceptor) = &self.interceptor else {
            return TracedFuture::new(self.inner.call(request), None);
        };

        let call = interceptor.begin(&Context::current(), &mut request);
        // Futures that do work before their first poll still see the span.
        let future = {
            let _guard = call.context().clone().attach();
            self.inner.call(request)
        };
        call.instrument(future)
    }
}
