use crate::registry::HookPoint;
use thiserror::Error;

/// Errors that can occur while attaching an interceptor to a hook point.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum AttachError {
    /// The RPC stack does not expose the hook point.
    #[error("hook point `{0}` is not exposed by this RPC stack")]
    UnknownHookPoint(HookPoint),

    /// An interceptor is already attached to the hook point.
    #[error("hook point `{0}` is already instrumented")]
    AlreadyAttached(HookPoint),
}
