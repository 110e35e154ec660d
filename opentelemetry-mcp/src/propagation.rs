//! # `traceparent` propagation through request metadata
//!
//! Encodes a [`SpanContext`] into the W3C Trace Context text form and decodes it
//! back. Unlike HTTP headers, MCP metadata keys are case sensitive and values are
//! preserved as written, so the encoding keeps every trace flag bit and the
//! decoding is strict about the shape of each field.

use opentelemetry::{
    propagation::{text_map_propagator::FieldIter, Extractor, Injector, TextMapPropagator},
    trace::{SpanContext, SpanId, TraceContextExt, TraceFlags, TraceId, TraceState},
    Context,
};
use std::str::FromStr;
use std::sync::OnceLock;

const SUPPORTED_VERSION: u8 = 0;
const INVALID_VERSION: &str = "ff";

/// Metadata key holding the encoded span context.
pub const TRACEPARENT: &str = "traceparent";
/// Metadata key holding vendor specific trace state.
pub const TRACESTATE: &str = "tracestate";

static TRACEPARENT_FIELDS: OnceLock<[String; 2]> = OnceLock::new();

fn traceparent_fields() -> &'static [String; 2] {
    TRACEPARENT_FIELDS.get_or_init(|| [TRACEPARENT.to_owned(), TRACESTATE.to_owned()])
}

/// Propagates [`SpanContext`]s in [W3C TraceContext] text form under the
/// `traceparent` and `tracestate` keys.
///
/// `traceparent: 00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01`
///
/// The four `-` separated fields are the version, the trace id, the parent span
/// id and the trace flags, all lower case hex.
///
/// [W3C TraceContext]: https://www.w3.org/TR/trace-context/
#[derive(Clone, Debug, Default)]
pub struct TraceParentPropagator {
    _private: (),
}

impl TraceParentPropagator {
    /// Create a new `TraceParentPropagator`.
    pub fn new() -> Self {
        TraceParentPropagator { _private: () }
    }

    /// Write `span_context` into the carrier.
    ///
    /// Invalid span contexts are not written. `tracestate` is only written when
    /// the trace state has entries.
    pub fn inject_span_context(&self, span_context: &SpanContext, injector: &mut dyn Injector) {
        if !span_context.is_valid() {
            return;
        }

        let value = format!(
            "{:02x}-{}-{}-{:02x}",
            SUPPORTED_VERSION,
            span_context.trace_id(),
            span_context.span_id(),
            span_context.trace_flags().to_u8()
        );
        injector.set(TRACEPARENT, value);

        let trace_state = span_context.trace_state().header();
        if !trace_state.is_empty() {
            injector.set(TRACESTATE, trace_state);
        }
    }

    /// Read a remote span context from the carrier.
    ///
    /// Returns `None` when `traceparent` is absent or malformed, or when it
    /// decodes to an invalid context.
    pub fn extract_span_context(&self, extractor: &dyn Extractor) -> Option<SpanContext> {
        let value = extractor.get(TRACEPARENT)?.trim();
        let parts = value.split('-').collect::<Vec<&str>>();
        if parts.len() < 4 {
            return None;
        }

        // Version 00 has exactly four fields, later versions may append more.
        let version = parts[0];
        if !is_lower_hex(version, 2) || version == INVALID_VERSION {
            return None;
        }
        if version == "00" && parts.len() != 4 {
            return None;
        }

        if !is_lower_hex(parts[1], 32) {
            return None;
        }
        let trace_id = TraceId::from_hex(parts[1]).ok()?;

        if !is_lower_hex(parts[2], 16) {
            return None;
        }
        let span_id = SpanId::from_hex(parts[2]).ok()?;

        if !is_lower_hex(parts[3], 2) {
            return None;
        }
        let flags = u8::from_str_radix(parts[3], 16).ok()?;

        let trace_state = extractor
            .get(TRACESTATE)
            .and_then(|state| TraceState::from_str(state).ok())
            .unwrap_or_default();

        let span_context =
            SpanContext::new(trace_id, span_id, TraceFlags::new(flags), true, trace_state);
        span_context.is_valid().then_some(span_context)
    }
}

fn is_lower_hex(field: &str, len: usize) -> bool {
    field.len() == len && field.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

impl TextMapPropagator for TraceParentPropagator {
    fn inject_context(&self, cx: &Context, injector: &mut dyn Injector) {
        self.inject_span_context(cx.span().span_context(), injector);
    }

    fn extract_with_context(&self, cx: &Context, extractor: &dyn Extractor) -> Context {
        self.extract_span_context(extractor)
            .map(|sc| cx.with_remote_span_context(sc))
            .unwrap_or_else(|| cx.clone())
    }

    fn fields(&self) -> FieldIter<'_> {
        FieldIter::new(traceparent_fields())
    }
}

/// Encode `span_context` into `carrier`.
pub fn inject(carrier: &mut dyn Injector, span_context: &SpanContext) {
    TraceParentPropagator::new().inject_span_context(span_context, carrier)
}

/// Decode a remote span context from `carrier`, if it holds a valid one.
pub fn extract(carrier: &dyn Extractor) -> Option<SpanContext> {
    TraceParentPropagator::new().extract_span_context(carrier)
}
