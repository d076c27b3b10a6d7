//! The isolate runtime itself. Boa's `Context` is not `Send`,
//! so each execution gets its own dedicated OS thread, running a single
//! cooperative task at a time. The thread communicates with the async world
//! through two one-way channels rather than a single blocking round-trip:
//! a tool-proxy call registers its JS `resolve`/`reject` pair, hands a
//! `DispatchRequest` carrying its own `id` to the serving loop, and returns
//! a pending `Promise` immediately. The serving loop on the other side
//! spawns each dispatch onto the caller's Tokio runtime instead of blocking
//! on it, so many calls can be in flight at once; results are matched back
//! to their pending promise by `id` as they complete, in whatever order they
//! arrive — this is what lets `Promise.all([...])` over several tool calls
//! actually run concurrently instead of one at a time.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::mpsc as std_mpsc;
use std::time::Duration;
use std::time::Instant;

use boa_engine::builtins::promise::PromiseState;
use boa_engine::native_function::NativeFunction;
use boa_engine::object::builtins::JsPromise;
use boa_engine::JsError;
use boa_engine::JsResult;
use boa_engine::JsString;
use boa_engine::JsValue;
use boa_engine::Context;
use boa_engine::Source;
use cellrun_protocol::dispatch::RpcDispatcher;
use cellrun_protocol::request::is_identifier_safe;
use cellrun_protocol::trace_event::CapabilityTraceEvent;
use cellrun_protocol::wire::ExecutionCompleteMessage;
use cellrun_protocol::wire::InitMessage;
use cellrun_protocol::wire::RpcCallMessage;
use cellrun_protocol::ErrorKind;
use cellrun_protocol::ExecutionResult;
use cellrun_protocol::ExecutionResultError;
use cellrun_protocol::TraceKind;
use serde_json::Value;
use std::sync::Arc;
use tokio::runtime::Handle;
use uuid::Uuid;

use crate::wrap::wrap_for_execution;

/// A single fire-and-forget request from the isolate thread to the async
/// bridge. `id` is generated on the isolate thread (by
/// `__cellrun_register_promise`, before this request is ever sent) so the
/// matching [`DispatchAnswer`] can be routed back to the right pending
/// promise without the two sides needing a reply channel per call.
struct DispatchRequest {
    id: String,
    server: String,
    tool: String,
    args: Value,
    parent_trace_id: Option<String>,
}

/// One completed dispatch, sent from wherever on the Tokio runtime the call
/// happened to finish back to the isolate thread, keyed by the same `id`
/// the request carried.
type DispatchAnswer = (String, Result<Value, String>);

/// The JS `resolve`/`reject` pair for one in-flight tool call, keyed by its
/// dispatch id. Lives only on the isolate thread, so a plain `Rc<RefCell<_>>`
/// is enough — nothing here crosses threads.
type PendingCalls = Rc<RefCell<HashMap<String, (JsValue, JsValue)>>>;

/// One capability-context trace event, posted over the same serving loop as
/// [`DispatchRequest`] but fire-and-forget: the capability-context contract
/// (spec.md §4.5 item 2 / §6) is one-way and ordered per sender, so there is
/// no reply channel here — ordering falls out of the single-threaded
/// serving loop draining one [`WorkerMessage`] at a time.
struct CapabilityTraceRequest {
    kind: TraceKind,
    trace_id: String,
    parent_trace_id: Option<String>,
    capability: String,
    capability_id: String,
    args: Option<Value>,
    result: Option<Value>,
    success: Option<bool>,
    error: Option<String>,
}

/// Everything the isolate thread can post back to the serving loop.
enum WorkerMessage {
    Dispatch(DispatchRequest),
    CapabilityTrace(CapabilityTraceRequest),
}

/// Runs one `InitMessage` to completion on a dedicated thread and returns
/// the resulting [`ExecutionResult`]. `dispatcher` is the RPC bridge for
/// this execution; `tokio_handle` lets the isolate thread block on async
/// dispatcher calls without itself being an async task.
pub fn run_to_completion(
    init: InitMessage,
    dispatcher: Arc<dyn RpcDispatcher>,
    tokio_handle: Handle,
    timeout: Duration,
) -> ExecutionResult {
    let (request_tx, request_rx) = std_mpsc::channel::<WorkerMessage>();
    let (done_tx, done_rx) = std_mpsc::channel::<ExecutionCompleteMessage>();
    let (answer_tx, answer_rx) = std_mpsc::channel::<DispatchAnswer>();
    let root_trace_id = init.parent_trace_id.clone();

    let worker_thread = std::thread::spawn(move || {
        let outcome = run_isolate(init, request_tx, answer_rx);
        let _ = done_tx.send(outcome);
    });

    // Serve requests until the worker finishes or the deadline fires. Each
    // `Dispatch` is spawned onto the Tokio runtime rather than blocked on,
    // so several can be outstanding at once — multiplexed by the id the
    // isolate thread generated for it; its answer lands on `answer_tx` and
    // the isolate thread matches it back to the pending promise. This loop
    // itself never blocks on a dispatch, so it keeps draining the next
    // request (or `CapabilityTrace`, still one-way and handled in order)
    // while earlier calls are still in flight.
    let deadline = Instant::now() + timeout;
    let start = Instant::now();
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match request_rx.recv_timeout(remaining) {
            Ok(WorkerMessage::Dispatch(request)) => {
                let DispatchRequest {
                    id,
                    server,
                    tool,
                    args,
                    parent_trace_id,
                } = request;
                let call = RpcCallMessage {
                    id: id.clone(),
                    server,
                    tool,
                    args,
                    parent_trace_id: parent_trace_id.or_else(|| root_trace_id.clone()),
                };
                let dispatcher = Arc::clone(&dispatcher);
                let answer_tx = answer_tx.clone();
                tokio_handle.spawn(async move {
                    let result = dispatcher.dispatch(call).await;
                    let answer = if result.success {
                        Ok(result.result.unwrap_or(Value::Null))
                    } else {
                        Err(result.error.unwrap_or_else(|| "rpc call failed".to_string()))
                    };
                    let _ = answer_tx.send((id, answer));
                });
            }
            Ok(WorkerMessage::CapabilityTrace(request)) => {
                let CapabilityTraceRequest {
                    kind,
                    trace_id,
                    parent_trace_id,
                    capability,
                    capability_id,
                    args,
                    result,
                    success,
                    error,
                } = request;
                let event = CapabilityTraceEvent {
                    kind,
                    trace_id,
                    parent_trace_id: parent_trace_id.or_else(|| root_trace_id.clone()),
                    capability,
                    capability_id,
                    ts: start.elapsed().as_millis() as u64,
                    args,
                    result,
                    success,
                    duration_ms: None,
                    error,
                };
                let dispatcher = Arc::clone(&dispatcher);
                tokio_handle.block_on(dispatcher.record_capability_event(event));
            }
            Err(std_mpsc::RecvTimeoutError::Timeout) => {
                return ExecutionResult::err(
                    ExecutionResultError::new(ErrorKind::TimeoutError, "execution deadline exceeded"),
                    start.elapsed().as_millis() as u64,
                );
            }
            Err(std_mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }

    match done_rx.recv_timeout(Duration::from_millis(500)) {
        Ok(done) => {
            let elapsed = start.elapsed().as_millis() as u64;
            match (done.success, done.result, done.error) {
                (true, result, _) => ExecutionResult::ok(result.unwrap_or(Value::Null), elapsed),
                (false, _, Some(error)) => ExecutionResult::err(error, elapsed),
                (false, _, None) => ExecutionResult::err(
                    ExecutionResultError::new(ErrorKind::RuntimeError, "execution failed with no error detail"),
                    elapsed,
                ),
            }
        }
        Err(_) => {
            let _ = worker_thread.join();
            ExecutionResult::err(
                ExecutionResultError::new(ErrorKind::RuntimeError, "isolate thread terminated without a result"),
                start.elapsed().as_millis() as u64,
            )
        }
    }
}

fn run_isolate(
    init: InitMessage,
    request_tx: std_mpsc::Sender<WorkerMessage>,
    answer_rx: std_mpsc::Receiver<DispatchAnswer>,
) -> ExecutionCompleteMessage {
    let mut context = Context::default();
    let pending: PendingCalls = Rc::new(RefCell::new(HashMap::new()));

    if let Err(error) = inject_context(&mut context, &init.context) {
        return ExecutionCompleteMessage {
            success: false,
            result: None,
            error: Some(error),
        };
    }

    if let Err(error) = register_promise_function(&mut context, Rc::clone(&pending)) {
        return ExecutionCompleteMessage {
            success: false,
            result: None,
            error: Some(error),
        };
    }

    if let Err(error) = register_dispatch_function(&mut context, request_tx.clone()) {
        return ExecutionCompleteMessage {
            success: false,
            result: None,
            error: Some(error),
        };
    }

    if let Err(error) = register_capability_trace_function(&mut context, request_tx) {
        return ExecutionCompleteMessage {
            success: false,
            result: None,
            error: Some(error),
        };
    }

    if let Err(error) = inject_tool_proxies(&mut context, &init.tool_definitions) {
        return ExecutionCompleteMessage {
            success: false,
            result: None,
            error: Some(error),
        };
    }

    if let Some(capability_context) = &init.capability_context {
        if let Err(error) = eval_and_classify(&mut context, capability_context) {
            return ExecutionCompleteMessage {
                success: false,
                result: None,
                error: Some(error),
            };
        }
        if let Err(error) = eval_and_classify(&mut context, WRAP_CAPABILITIES_SOURCE) {
            return ExecutionCompleteMessage {
                success: false,
                result: None,
                error: Some(error),
            };
        }
    }

    let wrapped = wrap_for_execution(&init.code);
    let settled = match eval_and_settle(&mut context, &wrapped, &pending, &answer_rx) {
        Ok(value) => value,
        Err(error) => {
            return ExecutionCompleteMessage {
                success: false,
                result: None,
                error: Some(error),
            }
        }
    };

    match settled {
        Ok(value) => {
            let json = js_value_to_json(&value, &mut context);
            ExecutionCompleteMessage {
                success: true,
                result: Some(json),
                error: None,
            }
        }
        Err(rejection) => {
            let message = rejection
                .to_string(&mut context)
                .map(|s| s.to_std_string_escaped())
                .unwrap_or_else(|_| "unknown rejection".to_string());
            ExecutionCompleteMessage {
                success: false,
                result: None,
                error: Some(classify_error(&message)),
            }
        }
    }
}

/// Defense-in-depth identifier check: the
/// security validator is authoritative, but the isolate re-checks because
/// a malformed key here would otherwise be spliced straight into a
/// generated `const` declaration.
fn inject_context(
    context: &mut Context,
    values: &std::collections::HashMap<String, Value>,
) -> Result<(), ExecutionResultError> {
    for (key, value) in values {
        if !is_identifier_safe(key) {
            return Err(ExecutionResultError::new(
                ErrorKind::PermissionError,
                format!("context key '{key}' is not identifier-safe"),
            ));
        }
        let literal = serde_json::to_string(value).unwrap_or_else(|_| "null".to_string());
        let source = format!("const {key} = {literal};");
        eval_and_classify(context, &source).map_err(|e| *e)?;
    }
    Ok(())
}

/// Registers `__cellrun_register_promise(resolve, reject) -> id`: called from
/// inside a `new Promise((resolve, reject) => { ... })` executor, it stores
/// the pair under a freshly generated dispatch id and hands that id back to
/// JS so the matching `__cellrun_dispatch_async` call (and later, the
/// answer drained in [`eval_and_settle`]) can find it again.
fn register_promise_function(
    context: &mut Context,
    pending: PendingCalls,
) -> Result<(), ExecutionResultError> {
    let native = NativeFunction::from_copy_closure_with_captures(
        |_this, args, captures, _ctx| {
            let resolve = args.first().cloned().unwrap_or(JsValue::undefined());
            let reject = args.get(1).cloned().unwrap_or(JsValue::undefined());
            let id = Uuid::new_v4().to_string();
            captures.borrow_mut().insert(id.clone(), (resolve, reject));
            Ok(JsValue::from(JsString::from(id)))
        },
        pending,
    );

    context
        .register_global_callable(JsString::from("__cellrun_register_promise").into(), 2, native)
        .map_err(|e| ExecutionResultError::new(ErrorKind::RuntimeError, e.to_string()))
}

/// Registers `__cellrun_dispatch_async(id, server, tool, argsJson)`: posts a
/// [`DispatchRequest`] to the serving loop and returns immediately without
/// waiting for an answer. The answer, when it arrives, is matched back to
/// the `id`'s pending promise (registered by `__cellrun_register_promise`)
/// in [`eval_and_settle`]'s polling loop — never here, since this native
/// call must not block the isolate thread.
fn register_dispatch_function(
    context: &mut Context,
    request_tx: std_mpsc::Sender<WorkerMessage>,
) -> Result<(), ExecutionResultError> {
    let native = NativeFunction::from_copy_closure_with_captures(
        |_this, args, captures, _ctx| {
            let id = args
                .first()
                .and_then(JsValue::as_string)
                .map(|s| s.to_std_string_escaped())
                .unwrap_or_default();
            let server = args
                .get(1)
                .and_then(JsValue::as_string)
                .map(|s| s.to_std_string_escaped())
                .unwrap_or_default();
            let tool = args
                .get(2)
                .and_then(JsValue::as_string)
                .map(|s| s.to_std_string_escaped())
                .unwrap_or_default();
            let args_json_text = args
                .get(3)
                .and_then(JsValue::as_string)
                .map(|s| s.to_std_string_escaped())
                .unwrap_or_else(|| "null".to_string());
            let parsed_args: Value = serde_json::from_str(&args_json_text).unwrap_or(Value::Null);

            let sent = captures.send(WorkerMessage::Dispatch(DispatchRequest {
                id,
                server,
                tool,
                args: parsed_args,
                parent_trace_id: None,
            }));
            if sent.is_err() {
                return Err(JsError::from_opaque(JsValue::from(JsString::from(
                    "dispatch channel closed",
                ))));
            }
            Ok(JsValue::undefined())
        },
        request_tx,
    );

    context
        .register_global_callable(
            JsString::from("__cellrun_dispatch_async").into(),
            4,
            native,
        )
        .map_err(|e| ExecutionResultError::new(ErrorKind::RuntimeError, e.to_string()))
}

/// Registers `__cellrun_capability_trace`, the native function the
/// capability-function wrapper (see [`WRAP_CAPABILITIES_SOURCE`]) calls to
/// post a `capability_start`/`capability_end` event. One-way: unlike
/// `__cellrun_dispatch` it never blocks on a reply, since the serving loop
/// only needs to forward the event, not answer it.
fn register_capability_trace_function(
    context: &mut Context,
    request_tx: std_mpsc::Sender<WorkerMessage>,
) -> Result<(), ExecutionResultError> {
    let native = NativeFunction::from_copy_closure_with_captures(
        |_this, args, captures, _ctx| {
            let arg_str = |idx: usize| -> Option<String> {
                args.get(idx)
                    .filter(|v| !v.is_null() && !v.is_undefined())
                    .and_then(JsValue::as_string)
                    .map(|s| s.to_std_string_escaped())
            };
            let kind = if arg_str(0).as_deref() == Some("end") {
                TraceKind::End
            } else {
                TraceKind::Start
            };
            let trace_id = arg_str(1).unwrap_or_default();
            let parent_trace_id = arg_str(2);
            let capability = arg_str(3).unwrap_or_default();
            let capability_id = arg_str(4).unwrap_or_default();
            let args_json = arg_str(5).and_then(|text| serde_json::from_str(&text).ok());
            let result_json = arg_str(6).and_then(|text| serde_json::from_str(&text).ok());
            let success = match arg_str(7).as_deref() {
                Some("true") => Some(true),
                Some("false") => Some(false),
                _ => None,
            };
            let error = arg_str(8);

            let sent = captures.send(WorkerMessage::CapabilityTrace(CapabilityTraceRequest {
                kind,
                trace_id,
                parent_trace_id,
                capability,
                capability_id,
                args: args_json,
                result: result_json,
                success,
                error,
            }));
            if sent.is_err() {
                return Err(JsError::from_opaque(JsValue::from(JsString::from(
                    "capability trace channel closed",
                ))));
            }
            Ok(JsValue::undefined())
        },
        request_tx,
    );

    context
        .register_global_callable(
            JsString::from("__cellrun_capability_trace").into(),
            9,
            native,
        )
        .map_err(|e| ExecutionResultError::new(ErrorKind::RuntimeError, e.to_string()))
}

/// Wraps every function exposed on `globalThis.capabilities` (the contract
/// `capabilityContext` source is expected to populate) so that calling it
/// emits a `capability_start`/`capability_end` pair around the call, per
/// spec.md's "these functions must emit capability_start/capability_end"
/// requirement. `capability_id` is the capability's own name: the isolate
/// has no FQDN resolution of its own, so it reuses the name the context
/// registered the function under.
const WRAP_CAPABILITIES_SOURCE: &str = r#"
(function () {
  let __cellrun_cap_seq = 0;
  const caps = globalThis.capabilities || {};
  for (const name of Object.keys(caps)) {
    const original = caps[name];
    if (typeof original !== "function") continue;
    caps[name] = async function (args) {
      const traceId = "cap-" + name + "-" + (__cellrun_cap_seq++);
      const argsText = JSON.stringify(args === undefined ? null : args);
      __cellrun_capability_trace("start", traceId, null, name, name, argsText, null, null, null);
      try {
        const result = await original(args);
        const resultText = JSON.stringify(result === undefined ? null : result);
        __cellrun_capability_trace("end", traceId, null, name, name, null, resultText, "true", null);
        return result;
      } catch (e) {
        const message = e && e.message ? e.message : String(e);
        __cellrun_capability_trace("end", traceId, null, name, name, null, null, "false", message);
        throw e;
      }
    };
  }
})();
"#;

/// Generates the `tools.<server>.<tool>` proxy tree as plain JS: each method
/// returns a `new Promise` whose executor registers its `resolve`/`reject`
/// under a dispatch id and fires the request off without waiting, so several
/// calls (e.g. inside `Promise.all([...])`) are outstanding at once rather
/// than serialized one at a time.
fn inject_tool_proxies(
    context: &mut Context,
    tool_definitions: &[cellrun_protocol::tool::ToolDefinition],
) -> Result<(), ExecutionResultError> {
    let mut by_server: std::collections::BTreeMap<&str, Vec<&str>> = std::collections::BTreeMap::new();
    for def in tool_definitions {
        by_server.entry(&def.server).or_default().push(&def.tool);
    }

    let mut source = String::from("globalThis.tools = {};\n");
    for (server, tools) in by_server {
        source.push_str(&format!("globalThis.tools[{server:?}] = {{}};\n"));
        for tool in tools {
            source.push_str(&format!(
                "globalThis.tools[{server:?}][{tool:?}] = function(args) {{\n\
                 \x20\x20return new Promise((resolve, reject) => {{\n\
                 \x20\x20\x20\x20const id = __cellrun_register_promise(resolve, reject);\n\
                 \x20\x20\x20\x20const argsText = JSON.stringify(args === undefined ? null : args);\n\
                 \x20\x20\x20\x20__cellrun_dispatch_async(id, {server:?}, {tool:?}, argsText);\n\
                 \x20\x20}});\n\
                 }};\n"
            ));
        }
    }

    eval_and_classify(context, &source).map_err(|e| *e)
}

/// Evaluates `source`, runs pending jobs so any `await`/promise chain it
/// started settles, and returns the final completion value or a
/// classified [`ExecutionResultError`] on a synchronous eval failure.
fn eval_and_classify(context: &mut Context, source: &str) -> Result<JsValue, Box<ExecutionResultError>> {
    let result = context.eval(Source::from_bytes(source.as_bytes()));
    context.run_jobs();
    result.map_err(|e| {
        let message = e.to_string();
        Box::new(classify_error(&message))
    })
}

/// Evaluates the wrapped async IIFE and waits for its returned promise to
/// settle, draining both Boa's own job queue and any [`DispatchAnswer`]s
/// that have arrived from the serving loop in the meantime — each matched
/// back to its pending JS promise by id and resolved or rejected in place,
/// which is what lets several concurrently-issued tool calls settle in
/// whatever order they actually complete.
fn eval_and_settle(
    context: &mut Context,
    source: &str,
    pending: &PendingCalls,
    answer_rx: &std_mpsc::Receiver<DispatchAnswer>,
) -> Result<Result<JsValue, JsValue>, ExecutionResultError> {
    let value = context
        .eval(Source::from_bytes(source.as_bytes()))
        .map_err(|e| classify_error(&e.to_string()))?;

    context.run_jobs();

    let Some(object) = value.as_object() else {
        return Ok(Ok(value));
    };
    let Ok(promise) = JsPromise::from_object(object.clone()) else {
        return Ok(Ok(value));
    };

    loop {
        while let Ok((id, answer)) = answer_rx.try_recv() {
            settle_pending_call(context, pending, id, answer);
        }

        match promise.state() {
            PromiseState::Pending => {
                context.run_jobs();
                if let Ok((id, answer)) = answer_rx.recv_timeout(Duration::from_millis(5)) {
                    settle_pending_call(context, pending, id, answer);
                }
            }
            PromiseState::Fulfilled(value) => return Ok(Ok(value)),
            PromiseState::Rejected(reason) => return Ok(Err(reason)),
        }
    }
}

/// Resolves or rejects the JS promise registered under `id`, if it is still
/// pending (it may already have been settled, or never registered, if the
/// answer arrived after the execution itself finished).
fn settle_pending_call(context: &mut Context, pending: &PendingCalls, id: String, answer: Result<Value, String>) {
    let Some((resolve, reject)) = pending.borrow_mut().remove(&id) else {
        return;
    };
    match answer {
        Ok(value) => {
            let js_value = json_to_js_value(&value, context).unwrap_or(JsValue::null());
            let _ = call_js_function(&resolve, &[js_value], context);
        }
        Err(message) => {
            let js_error = JsValue::from(JsString::from(message));
            let _ = call_js_function(&reject, &[js_error], context);
        }
    }
}

/// Parses `value` through the engine's own `JSON.parse`, mirroring how
/// [`js_value_to_json`] projects the other direction through `JSON.stringify`.
fn json_to_js_value(value: &Value, context: &mut Context) -> Option<JsValue> {
    let text = serde_json::to_string(value).ok()?;
    let parse = context.eval(Source::from_bytes(b"JSON.parse")).ok()?;
    let func = parse.as_object()?;
    func.call(&JsValue::undefined(), &[JsValue::from(JsString::from(text))], context)
        .ok()
}

fn call_js_function(value: &JsValue, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let object = value
        .as_object()
        .ok_or_else(|| JsError::from_opaque(JsValue::from(JsString::from("resolver is not callable"))))?;
    object.call(&JsValue::undefined(), args, context)
}

/// `undefined` is normalized to JSON `null`.
/// Everything else is projected through the engine's
/// own `JSON.stringify` rather than hand-walking `JsValue` variants, since
/// that is the one place guaranteed to agree with the isolate's own
/// notion of serializability.
fn js_value_to_json(value: &JsValue, context: &mut Context) -> Value {
    if value.is_undefined() {
        return Value::Null;
    }

    let Ok(stringify) = context.eval(Source::from_bytes(b"JSON.stringify")) else {
        return Value::Null;
    };
    let Some(func) = stringify.as_object() else {
        return Value::Null;
    };
    let Ok(text) = func.call(&JsValue::undefined(), &[value.clone()], context) else {
        return Value::Null;
    };
    match text.as_string() {
        Some(s) => serde_json::from_str(&s.to_std_string_escaped()).unwrap_or(Value::Null),
        None => Value::Null,
    }
}

/// Heuristic error classification by message text.
fn classify_error(message: &str) -> ExecutionResultError {
    let lower = message.to_lowercase();
    let kind = if lower.contains("unexpected token") || lower.contains("syntaxerror") {
        ErrorKind::SyntaxError
    } else if lower.contains("permission") || lower.contains("not granted") {
        ErrorKind::PermissionError
    } else {
        ErrorKind::RuntimeError
    };
    ExecutionResultError::new(kind, message)
}
