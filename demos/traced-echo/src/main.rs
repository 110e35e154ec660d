//! An MCP client and server talking over an in-process channel.
//!
//! Requests cross the channel as JSON text, so the only link between the
//! client span and the server span is the `traceparent` written into
//! `params._meta`. Spans are printed to stdout.
use opentelemetry::context::FutureExt;
use opentelemetry::global;
use opentelemetry::trace::{SpanKind, TraceContextExt, Tracer};
use opentelemetry::Context;
use opentelemetry_mcp::envelope::{JsonRpcRequest, RequestParams};
use opentelemetry_mcp::{HookPoint, InterceptorRegistry, McpInstrumentor};
use opentelemetry_sdk::trace::SdkTracerProvider;
use opentelemetry_stdout::SpanExporter;
use serde_json::{json, Map, Value};
use std::error::Error;
use std::fmt;
use tokio::sync::{mpsc, oneshot};
use tower::{service_fn, ServiceExt};
use tracing_subscriber::{fmt as log_fmt, prelude::*, EnvFilter};

type Reply = oneshot::Sender<Result<Value, EchoError>>;

#[derive(Debug)]
struct EchoError(String);

impl fmt::Display for EchoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Error for EchoError {}

fn init_tracer() -> SdkTracerProvider {
    let provider = SdkTracerProvider::builder()
        .with_simple_exporter(SpanExporter::default())
        .build();
    global::set_tracer_provider(provider.clone());
    provider
}

fn init_internal_logs() {
    // RUST_LOG=debug shows the instrumentation attaching to each hook point.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(log_fmt::layer().with_thread_names(true))
        .init();
}

async fn handle(request: JsonRpcRequest) -> Result<Value, EchoError> {
    let arguments = request
        .params
        .map(|params| params.arguments)
        .unwrap_or_default();

    match request.method.as_str() {
        "ping" => Ok(json!({})),
        "tools/call" => {
            let text = arguments.get("text").cloned().unwrap_or(Value::Null);
            Ok(json!({"content": [{"type": "text", "text": text}]}))
        }
        other => Err(EchoError(format!("method not found: {other}"))),
    }
}

async fn serve(registry: InterceptorRegistry, mut inbox: mpsc::Receiver<(String, Reply)>) {
    let handler = registry.wrap(HookPoint::ServerHandleRequest, service_fn(handle));

    while let Some((wire, reply)) = inbox.recv().await {
        let response = match serde_json::from_str::<JsonRpcRequest>(&wire) {
            Ok(request) => handler.clone().oneshot(request).await,
            Err(err) => Err(EchoError(format!("malformed request: {err}"))),
        };
        // the client may have given up on this request
        let _ = reply.send(response);
    }
}

async fn send(
    outbox: mpsc::Sender<(String, Reply)>,
    request: JsonRpcRequest,
) -> Result<Value, EchoError> {
    let wire = serde_json::to_string(&request).map_err(|err| EchoError(err.to_string()))?;
    println!("-> {wire}");

    let (reply, response) = oneshot::channel();
    outbox
        .send((wire, reply))
        .await
        .map_err(|_| EchoError("server is gone".to_owned()))?;
    response
        .await
        .map_err(|_| EchoError("server dropped the request".to_owned()))?
}

fn arguments(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error + Send + Sync + 'static>> {
    init_internal_logs();
    let provider = init_tracer();

    let mut registry = InterceptorRegistry::new(HookPoint::ALL);
    McpInstrumentor::builder()
        .with_transport("in-process")
        .build()
        .instrument(&mut registry);

    let (outbox, inbox) = mpsc::channel(8);
    let server = tokio::spawn(serve(registry.clone(), inbox));
    let client = registry.wrap(
        HookPoint::ClientSendRequest,
        service_fn(move |request: JsonRpcRequest| send(outbox.clone(), request)),
    );

    let tracer = global::tracer("traced-echo");
    let session = tracer
        .span_builder("echo-session")
        .with_kind(SpanKind::Internal)
        .start(&tracer);
    let cx = Context::current_with_span(session);

    let requests = [
        JsonRpcRequest::new(1, "ping"),
        JsonRpcRequest::new(2, "tools/call").with_params(RequestParams::new(arguments(
            json!({"name": "echo", "text": "hello over _meta"}),
        ))),
        JsonRpcRequest::new(3, "tools/unknown"),
    ];
    for request in requests {
        let method = request.method.clone();
        match client.clone().oneshot(request).with_context(cx.clone()).await {
            Ok(result) => println!("<- {method}: {result}"),
            Err(err) => println!("<- {method} failed: {err}"),
        }
    }

    cx.span().end();
    drop(client);
    server.await?;

    provider.shutdown()?;
    Ok(())
}
