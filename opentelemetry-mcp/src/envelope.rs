//! MCP request envelopes and the `_meta` carrier.
//!
//! The Model Context Protocol has no header channel: the only place a client
//! can attach out-of-band data to a request is the `params._meta` object. This
//! module gives the rest of the crate a shape-independent view of that object
//! through the [`Envelope`] trait, and adapts it to the OpenTelemetry
//! [`Injector`]/[`Extractor`] carrier traits.
use opentelemetry::propagation::{Extractor, Injector};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::borrow::Cow;
use std::fmt;

/// The `_meta` object of an MCP request.
pub type Meta = Map<String, Value>;

/// JSON-RPC protocol version carried by every MCP message.
pub const JSONRPC_VERSION: &str = "2.0";

/// Identifier correlating a JSON-RPC request with its response.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    /// Numeric request id.
    Number(i64),
    /// String request id.
    String(String),
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::Number(id) => fmt::Display::fmt(id, f),
            RequestId::String(id) => f.write_str(id),
        }
    }
}

impl From<i64> for RequestId {
    fn from(id: i64) -> Self {
        RequestId::Number(id)
    }
}

impl From<i32> for RequestId {
    fn from(id: i32) -> Self {
        RequestId::Number(id.into())
    }
}

impl From<String> for RequestId {
    fn from(id: String) -> Self {
        RequestId::String(id)
    }
}

impl From<&str> for RequestId {
    fn from(id: &str) -> Self {
        RequestId::String(id.to_owned())
    }
}

/// Parameters of an MCP request.
///
/// Everything except `_meta` is kept verbatim in `arguments`, so a request that
/// passes through this crate is re-encoded with the same fields it arrived with.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestParams {
    /// Request metadata, `_meta` on the wire.
    #[serde(rename = "_meta", default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Meta>,
    /// The method specific arguments.
    #[serde(flatten)]
    pub arguments: Map<String, Value>,
}

impl RequestParams {
    /// Create parameters from method arguments.
    pub fn new(arguments: Map<String, Value>) -> Self {
        RequestParams {
            meta: None,
            arguments,
        }
    }
}

/// A JSON-RPC 2.0 request as exchanged by MCP clients and servers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    /// Protocol version, always [`JSONRPC_VERSION`] for requests built here.
    pub jsonrpc: String,
    /// Request id.
    pub id: RequestId,
    /// Method name, e.g. `tools/call`.
    pub method: String,
    /// Optional parameters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<RequestParams>,
}

impl JsonRpcRequest {
    /// Create a request without parameters.
    pub fn new(id: impl Into<RequestId>, method: impl Into<String>) -> Self {
        JsonRpcRequest {
            jsonrpc: JSONRPC_VERSION.to_owned(),
            id: id.into(),
            method: method.into(),
            params: None,
        }
    }

    /// Attach parameters to the request.
    pub fn with_params(mut self, params: RequestParams) -> Self {
        self.params = Some(params);
        self
    }
}

/// Access to the parts of an RPC envelope the instrumentation needs.
///
/// Implement this for the request type of an RPC stack to instrument it. The
/// metadata object is the only part of the envelope that is ever mutated.
pub trait Envelope {
    /// The RPC method name. Used as the span name.
    fn method(&self) -> &str;

    /// The request id, if the envelope carries one.
    fn request_id(&self) -> Option<String> {
        None
    }

    /// The protocol version, if the envelope carries one.
    fn protocol_version(&self) -> Option<&str> {
        None
    }

    /// The metadata object, if present.
    fn meta(&self) -> Option<&Meta>;

    /// The metadata object, creating the parameters and the metadata object
    /// when either is missing.
    fn ensure_meta(&mut self) -> &mut Meta;
}

impl Envelope for JsonRpcRequest {
    fn method(&self) -> &str {
        &self.method
    }

    fn request_id(&self) -> Option<String> {
        Some(self.id.to_string())
    }

    fn protocol_version(&self) -> Option<&str> {
        Some(&self.jsonrpc)
    }

    fn meta(&self) -> Option<&Meta> {
        self.params.as_ref().and_then(|params| params.meta.as_ref())
    }

    fn ensure_meta(&mut self) -> &mut Meta {
        self.params
            .get_or_insert_with(RequestParams::default)
            .meta
            .get_or_insert_with(Meta::new)
    }
}

/// Returns the outbound envelope's metadata object, creating it if needed.
///
/// Mutations through the returned reference are part of the envelope and are
/// encoded with it.
pub fn ensure_metadata<E: Envelope + ?Sized>(envelope: &mut E) -> &mut Meta {
    envelope.ensure_meta()
}

/// Returns a read-only view of the inbound envelope's metadata object.
///
/// Missing parameters or metadata yield an empty object.
pub fn read_metadata<E: Envelope + ?Sized>(envelope: &E) -> Cow<'_, Meta> {
    envelope
        .meta()
        .map_or_else(|| Cow::Owned(Meta::new()), Cow::Borrowed)
}

/// Helper for injecting propagation fields into a request's `_meta` object.
#[derive(Debug)]
pub struct MetaInjector<'a>(pub &'a mut Meta);

impl Injector for MetaInjector<'_> {
    /// Set a key to a string value, replacing any previous value.
    fn set(&mut self, key: &str, value: String) {
        self.0.insert(key.to_owned(), Value::String(value));
    }
}

/// Helper for extracting propagation fields from a request's `_meta` object.
#[derive(Debug)]
pub struct MetaExtractor<'a>(pub &'a Meta);

impl Extractor for MetaExtractor<'_> {
    /// Get a value for a key. Values that are not JSON strings are ignored.
    fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    /// Collect all the keys holding string values.
    fn keys(&self) -> Vec<&str> {
        self.0
            .iter()
            .filter(|(_, value)| value.is_string())
            .map(|(key, _)| key.as_str())
            .collect::<Vec<_>>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn ensure_metadata_creates_params_and_meta() {
        let mut request = JsonRpcRequest::new(1, "tools/list");
        assert!(request.meta().is_none());

        ensure_metadata(&mut request).insert("progressToken".into(), json!(7));

        let params = request.params.as_ref().expect("params were created");
        assert_eq!(params.meta.as_ref().unwrap()["progressToken"], json!(7));
        assert!(params.arguments.is_empty());
    }

    #[test]
    fn ensure_metadata_keeps_existing_meta() {
        let mut request: JsonRpcRequest = serde_json::from_value(json!({
            "jsonrpc": "2.0",
            "id": "a",
            "method": "tools/call",
            "params": {"name": "echo", "_meta": {"progressToken": "p1"}}
        }))
        .unwrap();

        ensure_metadata(&mut request).insert("traceparent".into(), json!("x"));

        let meta = request.meta().unwrap();
        assert_eq!(meta["progressToken"], json!("p1"));
        assert_eq!(meta["traceparent"], json!("x"));
        assert_eq!(
            request.params.as_ref().unwrap().arguments["name"],
            json!("echo")
        );
    }

    #[test]
    fn null_meta_is_treated_as_absent() {
        let mut request: JsonRpcRequest = serde_json::from_value(json!({
            "jsonrpc": "2.0",
            "id": 3,
            "method": "ping",
            "params": {"_meta": null}
        }))
        .unwrap();
        assert!(read_metadata(&request).is_empty());

        ensure_metadata(&mut request);
        assert_eq!(request.meta(), Some(&Meta::new()));
    }

    #[test]
    fn read_metadata_without_params_is_empty() {
        let request = JsonRpcRequest::new(1, "ping");
        let meta = read_metadata(&request);
        assert!(meta.is_empty());
        assert!(matches!(meta, Cow::Owned(_)));
    }

    #[test]
    fn meta_round_trips_on_the_wire() {
        let mut request = JsonRpcRequest::new(9, "resources/read").with_params(
            RequestParams::new(
                json!({"uri": "file:///tmp/a"})
                    .as_object()
                    .cloned()
                    .unwrap(),
            ),
        );
        MetaInjector(ensure_metadata(&mut request)).set("traceparent", "tp".to_string());

        let wire = serde_json::to_value(&request).unwrap();
        assert_eq!(
            wire,
            json!({
                "jsonrpc": "2.0",
                "id": 9,
                "method": "resources/read",
                "params": {"uri": "file:///tmp/a", "_meta": {"traceparent": "tp"}}
            })
        );

        let decoded: JsonRpcRequest = serde_json::from_value(wire).unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn extractor_ignores_non_string_values() {
        let meta = json!({"traceparent": 12, "tracestate": "k=v", "progressToken": 3})
            .as_object()
            .cloned()
            .unwrap();
        let extractor = MetaExtractor(&meta);

        assert_eq!(extractor.get("traceparent"), None);
        assert_eq!(extractor.get("tracestate"), Some("k=v"));
        assert_eq!(extractor.keys(), vec!["tracestate"]);
    }
}
