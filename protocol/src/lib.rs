//! Shared data model for the cellrun sandboxed execution runtime.
//!
//! Every other crate in the workspace depends on this one for the wire
//! envelopes and result/error types that flow between the executor facade,
//! the two execution paths, and the RPC bridge. Nothing in here performs
//! I/O or holds any mutable state; it is the vocabulary the rest of the
//! system speaks.

pub mod capability;
pub mod dispatch;
pub mod error;
pub mod permission;
pub mod request;
pub mod result;
pub mod tool;
pub mod trace_event;
pub mod wire;

pub use capability::Alias;
pub use capability::Capability;
pub use dispatch::RpcDispatcher;
pub use error::CellrunErr;
pub use error::ErrorKind;
pub use error::Result;
pub use permission::PermissionSet;
pub use request::ExecutionRequest;
pub use result::ExecutionResult;
pub use result::ExecutionResultError;
pub use tool::RpcEnvelopeRequest;
pub use tool::RpcEnvelopeResponse;
pub use tool::ToolDefinition;
pub use trace_event::CapabilityTraceEvent;
pub use trace_event::ToolInvocation;
pub use trace_event::TraceEvent;
pub use trace_event::TraceKind;
