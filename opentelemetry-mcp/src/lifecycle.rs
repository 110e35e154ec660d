//! Span lifecycle around one intercepted call.
//!
//! A [`TracedCall`] owns the span of a single call from the moment it is started
//! until it is ended. Ending happens exactly once: explicitly through
//! [`TracedCall::finish`], or on drop when the call unwinds or its future is
//! cancelled.
use opentelemetry::trace::{SpanBuilder, SpanContext, SpanKind, Status, TraceContextExt, Tracer};
use opentelemetry::{otel_debug, Context, KeyValue};
use opentelemetry_semantic_conventions::attribute::{EXCEPTION_MESSAGE, EXCEPTION_TYPE};
use pin_project_lite::pin_project;
use std::borrow::Cow;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::fmt::Display;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::sync::Arc;
use std::task::{ready, Context as TaskContext, Poll};

/// Name of the span event recording a failed call.
pub const EXCEPTION_EVENT: &str = "exception";

/// Whether a call result counts as a success worth marking on its span.
///
/// Only truthy results set the span status to `Ok`. Empty, zero and absent
/// results leave the status unset.
pub trait Truthiness {
    /// Returns `true` when the value is truthy.
    fn is_truthy(&self) -> bool;
}

impl Truthiness for () {
    fn is_truthy(&self) -> bool {
        false
    }
}

impl Truthiness for bool {
    fn is_truthy(&self) -> bool {
        *self
    }
}

macro_rules! impl_truthiness_for_integers {
    ($($t:ty),+) => {
        $(
            impl Truthiness for $t {
                fn is_truthy(&self) -> bool {
                    *self != 0
                }
            }
        )+
    };
}

impl_truthiness_for_integers!(i8, i16, i32, i64, i128, isize, u8, u16, u32, u64, u128, usize);

impl Truthiness for f32 {
    fn is_truthy(&self) -> bool {
        *self != 0.0
    }
}

impl Truthiness for f64 {
    fn is_truthy(&self) -> bool {
        *self != 0.0
    }
}

impl Truthiness for str {
    fn is_truthy(&self) -> bool {
        !self.is_empty()
    }
}

impl Truthiness for String {
    fn is_truthy(&self) -> bool {
        !self.is_empty()
    }
}

impl<T> Truthiness for [T] {
    fn is_truthy(&self) -> bool {
        !self.is_empty()
    }
}

impl<T> Truthiness for Vec<T> {
    fn is_truthy(&self) -> bool {
        !self.is_empty()
    }
}

impl<T> Truthiness for VecDeque<T> {
    fn is_truthy(&self) -> bool {
        !self.is_empty()
    }
}

impl<K, V, S> Truthiness for HashMap<K, V, S> {
    fn is_truthy(&self) -> bool {
        !self.is_empty()
    }
}

impl<T, S> Truthiness for HashSet<T, S> {
    fn is_truthy(&self) -> bool {
        !self.is_empty()
    }
}

impl<K, V> Truthiness for BTreeMap<K, V> {
    fn is_truthy(&self) -> bool {
        !self.is_empty()
    }
}

impl<T> Truthiness for BTreeSet<T> {
    fn is_truthy(&self) -> bool {
        !self.is_empty()
    }
}

impl<T: Truthiness> Truthiness for Option<T> {
    fn is_truthy(&self) -> bool {
        self.as_ref().is_some_and(T::is_truthy)
    }
}

impl<T: Truthiness + ?Sized> Truthiness for &T {
    fn is_truthy(&self) -> bool {
        (**self).is_truthy()
    }
}

impl<T: Truthiness + ?Sized> Truthiness for Box<T> {
    fn is_truthy(&self) -> bool {
        (**self).is_truthy()
    }
}

impl<T: Truthiness + ?Sized> Truthiness for Rc<T> {
    fn is_truthy(&self) -> bool {
        (**self).is_truthy()
    }
}

impl<T: Truthiness + ?Sized> Truthiness for Arc<T> {
    fn is_truthy(&self) -> bool {
        (**self).is_truthy()
    }
}

impl Truthiness for serde_json::Map<String, serde_json::Value> {
    fn is_truthy(&self) -> bool {
        !self.is_empty()
    }
}

impl Truthiness for serde_json::Value {
    fn is_truthy(&self) -> bool {
        use serde_json::Value;

        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Number(n) => n.as_f64().is_some_and(|n| n != 0.0),
            Value::String(s) => !s.is_empty(),
            Value::Array(a) => !a.is_empty(),
            Value::Object(o) => !o.is_empty(),
        }
    }
}

/// Where a [`TracedCall`] is in its life.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SpanState {
    /// The span is open and nothing was recorded yet.
    Started,
    /// The call succeeded with a truthy result, status is `Ok`.
    Ok,
    /// The call failed, the error was recorded and status is `Error`.
    ErrorRecorded,
    /// The span has ended. No further changes are recorded.
    Ended,
}

/// The span of one intercepted call, and the context that carries it.
#[derive(Debug)]
pub struct TracedCall {
    cx: Context,
    state: SpanState,
}

impl TracedCall {
    /// Start a span named `name` as a child of `parent`.
    ///
    /// A `parent` without an active span starts a new trace.
    pub fn start<T>(
        tracer: &T,
        name: impl Into<Cow<'static, str>>,
        kind: SpanKind,
        parent: &Context,
        attributes: Vec<KeyValue>,
    ) -> Self
    where
        T: Tracer,
        T::Span: Send + Sync + 'static,
    {
        let builder = SpanBuilder::from_name(name)
            .with_kind(kind)
            .with_attributes(attributes);
        let span = tracer.build_with_context(builder, parent);

        TracedCall {
            cx: parent.with_span(span),
            state: SpanState::Started,
        }
    }

    /// The context holding this call's span.
    pub fn context(&self) -> &Context {
        &self.cx
    }

    /// The span context of this call's span.
    pub fn span_context(&self) -> SpanContext {
        self.cx.span().span_context().clone()
    }

    /// Current state.
    pub fn state(&self) -> SpanState {
        self.state
    }

    /// Set an attribute on the span while it is open.
    pub fn set_attribute(&self, attribute: KeyValue) {
        if self.state != SpanState::Ended {
            self.cx.span().set_attribute(attribute);
        }
    }

    /// Mark the call as successful if `result` is truthy.
    pub fn record_success<R: Truthiness + ?Sized>(&mut self, result: &R) {
        if self.state == SpanState::Started && result.is_truthy() {
            self.cx.span().set_status(Status::Ok);
            self.state = SpanState::Ok;
        }
    }

    /// Record `err` as an exception event and set the error status.
    pub fn record_error<E: Display + ?Sized>(&mut self, err: &E) {
        if self.state != SpanState::Started {
            return;
        }

        let message = err.to_string();
        let span = self.cx.span();
        span.add_event(
            EXCEPTION_EVENT,
            vec![
                KeyValue::new(EXCEPTION_TYPE, std::any::type_name::<E>()),
                KeyValue::new(EXCEPTION_MESSAGE, message.clone()),
            ],
        );
        span.set_status(Status::error(message));
        self.state = SpanState::ErrorRecorded;

        otel_debug!(
            name: "McpSpan.ErrorRecorded",
            error_type = std::any::type_name::<E>()
        );
    }

    /// Record the outcome of the call and end the span.
    pub fn finish<R, E>(mut self, result: &Result<R, E>)
    where
        R: Truthiness,
        E: Display,
    {
        match result {
            Ok(value) => self.record_success(value),
            Err(err) => self.record_error(err),
        }
        self.end();
    }

    /// Run `body` with this call's context attached, then finish with its
    /// result.
    ///
    /// The previously current context is restored when `body` returns or
    /// unwinds.
    pub fn run<R, E, F>(self, body: F) -> Result<R, E>
    where
        R: Truthiness,
        E: Display,
        F: FnOnce(&Context) -> Result<R, E>,
    {
        let result = {
            let _guard = self.cx.clone().attach();
            body(&self.cx)
        };
        self.finish(&result);
        result
    }

    /// Drive `future` with this call's context attached on every poll, then
    /// finish with its output.
    pub fn instrument<F>(self, future: F) -> TracedFuture<F> {
        TracedFuture::new(future, Some(self))
    }

    /// End the span. Ending an ended span does nothing.
    pub fn end(&mut self) {
        if self.state != SpanState::Ended {
            self.cx.span().end();
            self.state = SpanState::Ended;
        }
    }
}

impl Drop for TracedCall {
    fn drop(&mut self) {
        self.end();
    }
}

/// Start a span, run `body` under it and finish with its result.
///
/// The result or error of `body` is returned unchanged.
pub fn run_traced<T, R, E, F>(
    tracer: &T,
    name: impl Into<Cow<'static, str>>,
    kind: SpanKind,
    parent: &Context,
    attributes: Vec<KeyValue>,
    body: F,
) -> Result<R, E>
where
    T: Tracer,
    T::Span: Send + Sync + 'static,
    R: Truthiness,
    E: Display,
    F: FnOnce(&Context) -> Result<R, E>,
{
    TracedCall::start(tracer, name, kind, parent, attributes).run(body)
}

pin_project! {
    /// A future whose output finishes a [`TracedCall`].
    ///
    /// Dropping it before completion ends the span without a status.
    #[derive(Debug)]
    pub struct TracedFuture<F> {
        #[pin]
        inner: F,
        call: Option<TracedCall>,
    }
}

impl<F> TracedFuture<F> {
    pub(crate) fn new(inner: F, call: Option<TracedCall>) -> Self {
        TracedFuture { inner, call }
    }
}

impl<F, R, E> Future for TracedFuture<F>
where
    F: Future<Output = Result<R, E>>,
    R: Truthiness,
    E: Display,
{
    type Output = Result<R, E>;

    fn poll(self: Pin<&mut Self>, task_cx: &mut TaskContext<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let _guard = this.call.as_ref().map(|call| call.context().clone().attach());

        let result = ready!(this.inner.poll(task_cx));
        if let Some(call) = this.call.take() {
            call.finish(&result);
        }
        Poll::Ready(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opentelemetry::trace::{Status, TraceId, TracerProvider as _};
    use opentelemetry::Value;
    use opentelemetry_sdk::trace::{InMemorySpanExporter, SdkTracerProvider, SpanData};
    use serde_json::json;

    fn provider() -> (SdkTracerProvider, InMemorySpanExporter) {
        let exporter = InMemorySpanExporter::default();
        let provider = SdkTracerProvider::builder()
            .with_simple_exporter(exporter.clone())
            .build();
        (provider, exporter)
    }

    fn finished(exporter: &InMemorySpanExporter) -> Vec<SpanData> {
        exporter.get_finished_spans().unwrap()
    }

    #[test]
    fn truthiness() {
        assert!(!().is_truthy());
        assert!(!0u8.is_truthy());
        assert!(3i64.is_truthy());
        assert!(!0.0f64.is_truthy());
        assert!(!"".is_truthy());
        assert!("x".is_truthy());
        assert!(!Vec::<u8>::new().is_truthy());
        assert!(!None::<bool>.is_truthy());
        assert!(!Some(false).is_truthy());
        assert!(Some(1).is_truthy());
        assert!(!HashMap::<u8, u8>::new().is_truthy());
        assert!(Arc::new(vec![1]).is_truthy());

        let falsy_values = [
            json!(null),
            json!(false),
            json!(0),
            json!(0.0),
            json!(""),
            json!([]),
            json!({}),
        ];
        for falsy in falsy_values {
            assert!(!falsy.is_truthy(), "{falsy}");
        }
        for truthy in [json!(true), json!(-1), json!("a"), json!([0]), json!({"a": null})] {
            assert!(truthy.is_truthy(), "{truthy}");
        }
    }

    #[test]
    fn truthy_result_sets_ok() {
        let (provider, exporter) = provider();
        let tracer = provider.tracer("test");

        let result: Result<_, String> =
            run_traced(&tracer, "ok", SpanKind::Internal, &Context::new(), vec![], |_| {
                Ok(json!({"content": []}))
            });
        assert!(result.is_ok());

        let spans = finished(&exporter);
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].name, "ok");
        assert_eq!(spans[0].status, Status::Ok);
    }

    #[test]
    fn falsy_result_leaves_status_unset() {
        let (provider, exporter) = provider();
        let tracer = provider.tracer("test");

        let result: Result<(), String> =
            run_traced(&tracer, "unit", SpanKind::Internal, &Context::new(), vec![], |_| Ok(()));
        assert_eq!(result, Ok(()));

        let spans = finished(&exporter);
        assert_eq!(spans[0].status, Status::Unset);
    }

    #[test]
    fn error_is_recorded_and_returned() {
        let (provider, exporter) = provider();
        let tracer = provider.tracer("test");

        let result: Result<u8, String> =
            run_traced(&tracer, "fail", SpanKind::Internal, &Context::new(), vec![], |_| {
                Err("boom".to_string())
            });
        assert_eq!(result, Err("boom".to_string()));

        let spans = finished(&exporter);
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].status, Status::error("boom"));

        let events = &spans[0].events.events;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].name, EXCEPTION_EVENT);
        assert!(events[0].attributes.iter().any(|kv| {
            kv.key.as_str() == EXCEPTION_MESSAGE && kv.value == Value::from("boom")
        }));
        assert!(events[0].attributes.iter().any(|kv| {
            kv.key.as_str() == EXCEPTION_TYPE && kv.value == Value::from("alloc::string::String")
        }));
    }

    #[test]
    fn body_sees_call_context_and_prior_context_is_restored() {
        let (provider, exporter) = provider();
        let tracer = provider.tracer("test");

        let before = Context::current().span().span_context().clone();
        let call = TracedCall::start(&tracer, "body", SpanKind::Internal, &Context::new(), vec![]);
        let expected = call.span_context();

        let seen: Result<_, String> = call.run(|cx| {
            assert_eq!(cx.span().span_context(), &expected);
            Ok(Context::current().span().span_context().span_id().to_string())
        });
        assert_eq!(seen.unwrap(), expected.span_id().to_string());
        assert_eq!(Context::current().span().span_context(), &before);
        assert_eq!(finished(&exporter).len(), 1);
    }

    #[test]
    fn child_of_parent_context() {
        let (provider, exporter) = provider();
        let tracer = provider.tracer("test");

        let parent =
            TracedCall::start(&tracer, "parent", SpanKind::Internal, &Context::new(), vec![]);
        let parent_sc = parent.span_context();
        let child =
            TracedCall::start(&tracer, "child", SpanKind::Internal, parent.context(), vec![]);
        let child_sc = child.span_context();
        drop(child);
        drop(parent);

        assert_eq!(child_sc.trace_id(), parent_sc.trace_id());
        let spans = finished(&exporter);
        let child = spans.iter().find(|s| s.name == "child").unwrap();
        assert_eq!(child.parent_span_id, parent_sc.span_id());
        assert_ne!(child_sc.trace_id(), TraceId::INVALID);
    }

    #[test]
    fn state_transitions() {
        let (provider, exporter) = provider();
        let tracer = provider.tracer("test");

        let mut call =
            TracedCall::start(&tracer, "states", SpanKind::Internal, &Context::new(), vec![]);
        assert_eq!(call.state(), SpanState::Started);

        call.record_success(&"done");
        assert_eq!(call.state(), SpanState::Ok);

        // Ok is final until the span ends.
        call.record_error("late");
        assert_eq!(call.state(), SpanState::Ok);

        call.end();
        assert_eq!(call.state(), SpanState::Ended);
        call.end();
        drop(call);

        let spans = finished(&exporter);
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].status, Status::Ok);
        assert!(spans[0].events.events.is_empty());
    }

    #[test]
    fn panic_in_body_ends_span() {
        let (provider, exporter) = provider();
        let tracer = provider.tracer("test");

        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _: Result<(), String> =
                run_traced(&tracer, "panics", SpanKind::Internal, &Context::new(), vec![], |_| {
                    panic!("handler panicked")
                });
        }));
        assert!(outcome.is_err());

        let spans = finished(&exporter);
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].status, Status::Unset);
        assert!(!Context::current().has_active_span());
    }

    #[tokio::test]
    async fn future_finishes_on_completion() {
        let (provider, exporter) = provider();
        let tracer = provider.tracer("test");

        let call = TracedCall::start(&tracer, "async", SpanKind::Internal, &Context::new(), vec![]);
        let expected = call.span_context();

        let result: Result<String, String> = call
            .instrument(async move {
                tokio::task::yield_now().await;
                Ok(Context::current().span().span_context().span_id().to_string())
            })
            .await;

        assert_eq!(result.unwrap(), expected.span_id().to_string());
        let spans = finished(&exporter);
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].status, Status::Ok);
    }

    #[tokio::test]
    async fn dropped_future_ends_span() {
        let (provider, exporter) = provider();
        let tracer = provider.tracer("test");

        let call = TracedCall::start(
            &tracer,
            "cancelled",
            SpanKind::Internal,
            &Context::new(),
            vec![],
        );
        let future = call.instrument(std::future::pending::<Result<(), String>>());
        drop(future);

        let spans = finished(&exporter);
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].status, Status::Unset);
    }
}
