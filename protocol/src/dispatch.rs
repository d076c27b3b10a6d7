//! The isolate/subprocess -> host call-out seam.
//! Defined here, alongside the wire types it moves, so the isolate
//! worker and the RPC bridge can depend on the same contract without either
//! depending on the other: the isolate crate consumes a `dyn RpcDispatcher`
//! it is handed at construction time, and the bridge crate is the one
//! concrete implementation of it.

use async_trait::async_trait;

use crate::trace_event::CapabilityTraceEvent;
use crate::wire::RpcCallMessage;
use crate::wire::RpcResultMessage;

#[async_trait]
pub trait RpcDispatcher: Send + Sync {
    async fn dispatch(&self, call: RpcCallMessage) -> RpcResultMessage;

    /// Receives one event off the capability-context broadcast channel
    /// (see `InitMessage::capability_context`): a capability function
    /// running inside the isolate emits `capability_start`/`capability_end`
    /// here, one-way and ordered per sender, for the bridge to merge into
    /// its trace buffer. Default no-op so a dispatcher with no trace buffer
    /// to merge into (e.g. a bare test double) isn't forced to implement it.
    async fn record_capability_event(&self, _event: CapabilityTraceEvent) {}
}
