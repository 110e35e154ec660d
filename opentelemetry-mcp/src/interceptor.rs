use crate::envelope::{ensure_metadata, read_metadata, Envelope, MetaExtractor, MetaInjector};
use crate::lifecycle::{TracedCall, Truthiness};
use crate::propagation::{extract, inject};
use crate::registry::HookPoint;
use crate::serialize::serialize;
use opentelemetry::global::BoxedTracer;
use opentelemetry::trace::{SpanKind, TraceContextExt};
use opentelemetry::{otel_debug, Context, KeyValue};
use opentelemetry_semantic_conventions::attribute::{
    RPC_JSONRPC_REQUEST_ID, RPC_JSONRPC_VERSION, RPC_METHOD, RPC_SYSTEM,
};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

/// Span attribute holding the hook point name.
pub const HOOK_NAME_KEY: &str = "name";
/// Span attribute holding the transport label.
pub const TRANSPORT_KEY: &str = "method";
/// Span attribute holding the serialized request.
///
/// On the client the request is captured after the trace context was written
/// into `_meta`, so the attribute shows the request as it is sent, including
/// `_meta.traceparent`.
pub const ARGS_KEY: &str = "args";

const RPC_SYSTEM_JSONRPC: &str = "jsonrpc";

pub(crate) struct Settings {
    pub(crate) tracer: BoxedTracer,
    pub(crate) transport: String,
    pub(crate) capture_args: bool,
}

impl fmt::Debug for Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Settings")
            .field("transport", &self.transport)
            .field("capture_args", &self.capture_args)
            .finish()
    }
}

/// Traces the calls made through one hook point.
///
/// On [`HookPoint::ClientSendRequest`] it opens a client span under the
/// caller's context and writes that span's context into the request's `_meta`
/// object before the request is sent. On [`HookPoint::ServerHandleRequest`] it
/// reads the remote parent from `_meta` and opens a server span under it.
#[derive(Clone, Debug)]
pub struct Interceptor {
    point: HookPoint,
    settings: Arc<Settings>,
}

impl Interceptor {
    pub(crate) fn new(point: HookPoint, settings: Arc<Settings>) -> Self {
        Interceptor { point, settings }
    }

    /// The hook point this interceptor traces.
    pub fn hook_point(&self) -> HookPoint {
        self.point
    }

    /// Start the span for `request`.
    ///
    /// On the client hook the span is a child of `parent` and its context is
    /// injected into the request. On the server hook `parent` is not used: the
    /// span is a child of the remote context in the request, or a new root.
    pub fn begin<Req>(&self, parent: &Context, request: &mut Req) -> TracedCall
    where
        Req: Envelope + Serialize + ?Sized,
    {
        match self.point {
            HookPoint::ClientSendRequest => {
                otel_debug!(name: "McpClient.SendRequest", method = request.method());

                let call = self.start(parent, SpanKind::Client, &*request);
                inject(
                    &mut MetaInjector(ensure_metadata(request)),
                    &call.span_context(),
                );
                self.capture_args(&call, &*request);
                call
            }
            HookPoint::ServerHandleRequest => {
                otel_debug!(name: "McpServer.HandleRequest", method = request.method());

                let meta = read_metadata(&*request);
                let parent = match extract(&MetaExtractor(meta.as_ref())) {
                    Some(remote) => Context::new().with_remote_span_context(remote),
                    None => Context::new(),
                };

                let call = self.start(&parent, SpanKind::Server, &*request);
                self.capture_args(&call, &*request);
                call
            }
        }
    }

    /// Run `call` on `request` under this hook point's span, using the
    /// current context as the client parent.
    ///
    /// The result or error of `call` is returned unchanged.
    pub fn intercept<Req, R, E, F>(&self, request: Req, call: F) -> Result<R, E>
    where
        Req: Envelope + Serialize,
        R: Truthiness,
        E: fmt::Display,
        F: FnOnce(Req) -> Result<R, E>,
    {
        self.intercept_with_context(&Context::current(), request, call)
    }

    /// Like [`Interceptor::intercept`] with an explicit client parent.
    pub fn intercept_with_context<Req, R, E, F>(
        &self,
        parent: &Context,
        mut request: Req,
        call: F,
    ) -> Result<R, E>
    where
        Req: Envelope + Serialize,
        R: Truthiness,
        E: fmt::Display,
        F: FnOnce(Req) -> Result<R, E>,
    {
        let traced = self.begin(parent, &mut request);
        traced.run(move |_| call(request))
    }

    fn start<Req>(&self, parent: &Context, kind: SpanKind, request: &Req) -> TracedCall
    where
        Req: Envelope + ?Sized,
    {
        let mut attributes = vec![
            KeyValue::new(HOOK_NAME_KEY, self.point.name()),
            KeyValue::new(TRANSPORT_KEY, self.settings.transport.clone()),
            KeyValue::new(RPC_SYSTEM, RPC_SYSTEM_JSONRPC),
            KeyValue::new(RPC_METHOD, request.method().to_owned()),
        ];
        if let Some(id) = request.request_id() {
            attributes.push(KeyValue::new(RPC_JSONRPC_REQUEST_ID, id));
        }
        if let Some(version) = request.protocol_version() {
            attributes.push(KeyValue::new(RPC_JSONRPC_VERSION, version.to_owned()));
        }

        TracedCall::start(
            &self.settings.tracer,
            request.method().to_owned(),
            kind,
            parent,
            attributes,
        )
    }

    fn capture_args<Req>(&self, call: &TracedCall, request: &Req)
    where
        Req: Serialize + ?Sized,
    {
        if self.settings.capture_args && call.context().span().is_recording() {
            call.set_attribute(KeyValue::new(ARGS_KEY, serialize(request)));
        }
    }
}
