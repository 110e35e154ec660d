use crate::interceptor::{Interceptor, Settings};
use crate::registry::{HookPoint, InterceptorRegistry};
use opentelemetry::global::{self, BoxedTracer};
use opentelemetry::trace::{Tracer, TracerProvider};
use opentelemetry::{otel_debug, otel_warn, InstrumentationScope};
use std::env;
use std::fmt;
use std::sync::Arc;

const INSTRUMENTATION_NAME: &str = "opentelemetry-mcp";
const DEFAULT_TRANSPORT: &str = "sse";

/// Environment variable enabling or disabling the `args` attribute.
pub const CAPTURE_ARGS_ENV: &str = "OTEL_INSTRUMENTATION_MCP_CAPTURE_ARGS";

fn instrumentation_scope() -> InstrumentationScope {
    InstrumentationScope::builder(INSTRUMENTATION_NAME)
        .with_version(env!("CARGO_PKG_VERSION"))
        .with_schema_url(opentelemetry_semantic_conventions::SCHEMA_URL)
        .build()
}

/// Installs MCP tracing on the hook points of an [`InterceptorRegistry`].
///
/// # Examples
///
/// ```
/// use opentelemetry_mcp::{HookPoint, InterceptorRegistry, McpInstrumentor};
///
/// let mut registry = InterceptorRegistry::new(HookPoint::ALL);
/// let instrumentor = McpInstrumentor::builder().with_transport("stdio").build();
/// instrumentor.instrument(&mut registry);
///
/// assert!(registry.is_attached(HookPoint::ClientSendRequest));
/// assert!(registry.is_attached(HookPoint::ServerHandleRequest));
/// ```
#[derive(Clone)]
pub struct McpInstrumentor {
    settings: Arc<Settings>,
}

impl fmt::Debug for McpInstrumentor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("McpInstrumentor")
            .field("transport", &self.settings.transport)
            .field("capture_args", &self.settings.capture_args)
            .finish()
    }
}

impl Default for McpInstrumentor {
    fn default() -> Self {
        McpInstrumentor::builder().build()
    }
}

impl McpInstrumentor {
    /// Create a builder to configure an instrumentor.
    pub fn builder() -> McpInstrumentorBuilder {
        McpInstrumentorBuilder::default()
    }

    /// Transport label recorded on every span.
    pub fn transport(&self) -> &str {
        &self.settings.transport
    }

    /// Whether requests are recorded in the `args` attribute.
    pub fn capture_args(&self) -> bool {
        self.settings.capture_args
    }

    /// An interceptor for `point` sharing this instrumentor's settings.
    pub fn interceptor(&self, point: HookPoint) -> Interceptor {
        Interceptor::new(point, self.settings.clone())
    }

    /// Attach interceptors to every hook point of `registry`.
    ///
    /// A hook point that cannot be instrumented is logged and skipped, the
    /// remaining ones are still attached.
    pub fn instrument(&self, registry: &mut InterceptorRegistry) {
        for point in HookPoint::ALL {
            match registry.attach(self.interceptor(point)) {
                Ok(()) => {
                    otel_debug!(name: "McpInstrumentor.Attached", hook_point = point.name());
                }
                Err(err) => {
                    otel_warn!(
                        name: "McpInstrumentor.AttachFailed",
                        hook_point = point.name(),
                        reason = err.to_string()
                    );
                }
            }
        }
    }

    /// Detach the interceptors from every hook point of `registry`.
    pub fn uninstrument(&self, registry: &mut InterceptorRegistry) {
        for point in HookPoint::ALL {
            if registry.detach(point).is_some() {
                otel_debug!(name: "McpInstrumentor.Detached", hook_point = point.name());
            }
        }
    }
}

/// Builder for [`McpInstrumentor`].
#[derive(Default)]
pub struct McpInstrumentorBuilder {
    tracer: Option<BoxedTracer>,
    transport: Option<String>,
    capture_args: Option<bool>,
}

impl fmt::Debug for McpInstrumentorBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("McpInstrumentorBuilder")
            .field("has_tracer", &self.tracer.is_some())
            .field("transport", &self.transport)
            .field("capture_args", &self.capture_args)
            .finish()
    }
}

impl McpInstrumentorBuilder {
    /// Record spans with a tracer from `provider`.
    ///
    /// When no provider is set the global tracer provider is used.
    pub fn with_tracer_provider<P>(mut self, provider: &P) -> Self
    where
        P: TracerProvider,
        P::Tracer: Send + Sync + 'static,
        <P::Tracer as Tracer>::Span: Send + Sync + 'static,
    {
        let tracer = provider.tracer_with_scope(instrumentation_scope());
        self.tracer = Some(BoxedTracer::new(Box::new(tracer)));
        self
    }

    /// Set the transport label recorded in the `method` attribute. Defaults
    /// to `sse`.
    pub fn with_transport(mut self, transport: impl Into<String>) -> Self {
        self.transport = Some(transport.into());
        self
    }

    /// Enable or disable recording requests in the `args` attribute.
    ///
    /// Overrides `OTEL_INSTRUMENTATION_MCP_CAPTURE_ARGS`. Enabled by default.
    pub fn with_capture_args(mut self, capture_args: bool) -> Self {
        self.capture_args = Some(capture_args);
        self
    }

    /// Create the instrumentor.
    pub fn build(self) -> McpInstrumentor {
        let capture_args = self
            .capture_args
            .or_else(capture_args_from_env)
            .unwrap_or(true);
        let tracer = self
            .tracer
            .unwrap_or_else(|| global::tracer_with_scope(instrumentation_scope()));

        McpInstrumentor {
            settings: Arc::new(Settings {
                tracer,
                transport: self
                    .transport
                    .unwrap_or_else(|| DEFAULT_TRANSPORT.to_owned()),
                capture_args,
            }),
        }
    }
}

fn capture_args_from_env() -> Option<bool> {
    let value = env::var(CAPTURE_ARGS_ENV).ok()?;
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" => Some(true),
        "false" | "0" => Some(false),
        _ => {
            otel_warn!(
                name: "McpInstrumentor.Config.InvalidValue",
                message = "Value must be `true` or `false`. Ignoring it.",
                variable = CAPTURE_ARGS_ENV,
                value = value.as_str()
            );
            None
        }
    }
}
