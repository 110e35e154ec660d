//! # OpenTelemetry MCP instrumentation
//!
//! Traces Model Context Protocol (JSON-RPC 2.0) clients and servers so that a
//! request and its handling on the other side end up in one distributed trace.
//!
//! MCP has no header channel. The client side of this crate writes the W3C
//! `traceparent` of its span into the request's `params._meta` object, and the
//! server side reads it back to parent its own span. Requests are also
//! recorded on the span in the `args` attribute, using an encoder that never
//! fails on the call path.
//!
//! The RPC stack declares its call sites in an [`InterceptorRegistry`];
//! [`McpInstrumentor::instrument`] attaches an [`Interceptor`] to each of them.
//! Interceptors can run synchronous calls directly or wrap tower services
//! through [`TracingLayer`].
//!
//! ```
//! use opentelemetry_mcp::envelope::{Envelope, JsonRpcRequest};
//! use opentelemetry_mcp::{HookPoint, InterceptorRegistry, McpInstrumentor};
//! use opentelemetry_sdk::trace::SdkTracerProvider;
//! use serde_json::json;
//!
//! let provider = SdkTracerProvider::builder().build();
//! let mut registry = InterceptorRegistry::new(HookPoint::ALL);
//! McpInstrumentor::builder()
//!     .with_tracer_provider(&provider)
//!     .build()
//!     .instrument(&mut registry);
//!
//! let client = registry
//!     .interceptor(HookPoint::ClientSendRequest)
//!     .expect("client hook is exposed");
//! let response = client.intercept(JsonRpcRequest::new(1, "tools/list"), |request| {
//!     // the request leaves with the client span's context in `_meta`
//!     assert!(request.meta().unwrap().contains_key("traceparent"));
//!     Ok::<_, String>(json!({"tools": []}))
//! });
//! assert!(response.is_ok());
//! ```
#![warn(
    future_incompatible,
    missing_debug_implementations,
    missing_docs,
    nonstandard_style,
    rust_2018_idioms,
    unreachable_pub,
    unused
)]
#![cfg_attr(docsrs, feature(doc_cfg), deny(rustdoc::broken_intra_doc_links))]
#![doc(
    html_logo_url = "https://raw.githubusercontent.com/open-telemetry/opentelemetry-rust/main/assets/logo.svg"
)]

pub mod envelope;
pub mod lifecycle;
pub mod propagation;
pub mod serialize;

mod error;
mod instrumentor;
mod interceptor;
mod registry;
mod service;

pub use error::AttachError;
pub use instrumentor::{McpInstrumentor, McpInstrumentorBuilder, CAPTURE_ARGS_ENV};
pub use interceptor::{Interceptor, ARGS_KEY, HOOK_NAME_KEY, TRANSPORT_KEY};
pub use registry::{HookPoint, InterceptorRegistry};
pub use service::{TracingLayer, TracingService};
