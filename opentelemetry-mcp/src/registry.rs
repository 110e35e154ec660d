use crate::error::AttachError;
use crate::interceptor::Interceptor;
use crate::service::{TracingLayer, TracingService};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// A call site of an RPC stack that can be intercepted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum HookPoint {
    /// Inbound request dispatch on the server.
    ServerHandleRequest,
    /// Outbound request send on the client.
    ClientSendRequest,
}

impl HookPoint {
    /// Every hook point, in attachment order.
    pub const ALL: [HookPoint; 2] = [HookPoint::ServerHandleRequest, HookPoint::ClientSendRequest];

    /// Stable name of the hook point.
    pub fn name(self) -> &'static str {
        match self {
            HookPoint::ServerHandleRequest => "server.handle_request",
            HookPoint::ClientSendRequest => "client.send_request",
        }
    }
}

impl fmt::Display for HookPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The hook points an RPC stack exposes, and the interceptors attached to them.
///
/// The host declares its call sites when it builds the registry, attaches
/// interceptors during setup (usually through
/// [`McpInstrumentor::instrument`](crate::McpInstrumentor::instrument)), then
/// wraps its client and server services with [`InterceptorRegistry::wrap`].
#[derive(Clone, Debug, Default)]
pub struct InterceptorRegistry {
    exposed: BTreeSet<HookPoint>,
    attached: BTreeMap<HookPoint, Interceptor>,
}

impl InterceptorRegistry {
    /// Create a registry for an RPC stack exposing `sites`.
    pub fn new(sites: impl IntoIterator<Item = HookPoint>) -> Self {
        InterceptorRegistry {
            exposed: sites.into_iter().collect(),
            attached: BTreeMap::new(),
        }
    }

    /// Whether the RPC stack exposes `point`.
    pub fn is_exposed(&self, point: HookPoint) -> bool {
        self.exposed.contains(&point)
    }

    /// Whether an interceptor is attached to `point`.
    pub fn is_attached(&self, point: HookPoint) -> bool {
        self.attached.contains_key(&point)
    }

    /// Attach `interceptor` to its hook point.
    ///
    /// Fails when the hook point is not exposed or already has an interceptor.
    /// The registry is unchanged on failure.
    pub fn attach(&mut self, interceptor: Interceptor) -> Result<(), AttachError> {
        let point = interceptor.hook_point();
        if !self.is_exposed(point) {
            return Err(AttachError::UnknownHookPoint(point));
        }
        if self.is_attached(point) {
            return Err(AttachError::AlreadyAttached(point));
        }

        self.attached.insert(point, interceptor);
        Ok(())
    }

    /// Remove the interceptor attached to `point`, if any.
    pub fn detach(&mut self, point: HookPoint) -> Option<Interceptor> {
        self.attached.remove(&point)
    }

    /// The interceptor attached to `point`.
    pub fn interceptor(&self, point: HookPoint) -> Option<&Interceptor> {
        self.attached.get(&point)
    }

    /// A tower layer applying the interceptor attached to `point`.
    ///
    /// The layer passes requests through untouched when nothing is attached.
    pub fn layer(&self, point: HookPoint) -> TracingLayer {
        match self.interceptor(point) {
            Some(interceptor) => TracingLayer::new(interceptor.clone()),
            None => TracingLayer::passthrough(),
        }
    }

    /// Wrap `service` with the interceptor attached to `point`.
    pub fn wrap<S>(&self, point: HookPoint, service: S) -> TracingService<S> {
        tower::Layer::layer(&self.layer(point), service)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::McpInstrumentor;

    #[test]
    fn hook_point_names() {
        assert_eq!(HookPoint::ServerHandleRequest.to_string(), "server.handle_request");
        assert_eq!(HookPoint::ClientSendRequest.name(), "client.send_request");
    }

    #[test]
    fn attach_and_detach() {
        let instrumentor = McpInstrumentor::builder().build();
        let mut registry = InterceptorRegistry::new(HookPoint::ALL);

        assert!(registry
            .attach(instrumentor.interceptor(HookPoint::ClientSendRequest))
            .is_ok());
        assert!(registry.is_attached(HookPoint::ClientSendRequest));
        assert!(!registry.is_attached(HookPoint::ServerHandleRequest));

        assert_eq!(
            registry.attach(instrumentor.interceptor(HookPoint::ClientSendRequest)),
            Err(AttachError::AlreadyAttached(HookPoint::ClientSendRequest))
        );

        assert!(registry.detach(HookPoint::ClientSendRequest).is_some());
        assert!(!registry.is_attached(HookPoint::ClientSendRequest));
        // detaching twice is fine
        assert!(registry.detach(HookPoint::ClientSendRequest).is_none());
    }

    #[test]
    fn attach_to_missing_site_fails() {
        let instrumentor = McpInstrumentor::builder().build();
        let mut registry = InterceptorRegistry::new([HookPoint::ServerHandleRequest]);

        assert!(!registry.is_exposed(HookPoint::ClientSendRequest));
        assert_eq!(
            registry.attach(instrumentor.interceptor(HookPoint::ClientSendRequest)),
            Err(AttachError::UnknownHookPoint(HookPoint::ClientSendRequest))
        );
        assert!(registry.interceptor(HookPoint::ClientSendRequest).is_none());
    }
}
