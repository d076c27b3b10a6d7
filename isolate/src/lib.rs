//! Isolate Worker.
//!
//! Runs user code to completion in a memory-safe, in-process ECMAScript
//! engine (`boa_engine`) with no native I/O: every external call is routed
//! back through an injected [`cellrun_protocol::dispatch::RpcDispatcher`]
//! rather than a real filesystem/network primitive. See [`worker`] for the
//! execution loop and [`wrap`] for the pure-expression auto-return rule.

pub mod wrap;
pub mod worker;

pub use wrap::is_pure_expression;
pub use wrap::wrap_for_execution;
pub use worker::run_to_completion;
