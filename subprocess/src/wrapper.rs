//! Builds the wrapper script a Deno child process actually runs.
//! Context variables are spliced in as `const` bindings,
//! exactly like the isolate path's `inject_context`, so both paths see the
//! same bindings in scope; the submitted code itself is run through
//! [`cellrun_isolate::wrap_for_execution`] so the pure-expression
//! auto-return rule applies identically on both
//! paths.

use std::collections::HashMap;

use cellrun_isolate::wrap_for_execution;
use serde_json::Value;

use crate::SENTINEL;

/// Renders `context` as `const <key> = <json literal>;` lines. Keys are
/// assumed identifier-safe already (the security validator is the
/// authoritative gate; this function does not re-check, since it runs
/// strictly after validation succeeds).
fn render_context(context: &HashMap<String, Value>) -> String {
    let mut keys: Vec<&String> = context.keys().collect();
    keys.sort();
    keys.into_iter()
        .map(|key| {
            let literal = context
                .get(key)
                .and_then(|v| serde_json::to_string(v).ok())
                .unwrap_or_else(|| "null".to_string());
            format!("const {key} = {literal};\n")
        })
        .collect()
}

/// Wraps `code` into a standalone Deno script that catches both a
/// synchronous throw and a rejected promise, then writes exactly one
/// sentinel-prefixed JSON line to stdout describing the outcome.
pub fn wrap_with_sentinel(code: &str, context: &HashMap<String, Value>) -> String {
    let context_block = render_context(context);
    let wrapped_code = wrap_for_execution(code);
    format!(
        r#"{context_block}(async function() {{
  try {{
    const result = await ({wrapped_code});
    const normalized = result === undefined ? null : result;
    console.log({sentinel:?} + JSON.stringify({{ success: true, result: normalized }}));
  }} catch (err) {{
    const payload = {{
      success: false,
      error: {{
        type: err && err.constructor ? err.constructor.name : "Error",
        message: err && err.message !== undefined ? String(err.message) : String(err),
        stack: err && err.stack ? String(err.stack) : undefined,
      }},
    }};
    console.log({sentinel:?} + JSON.stringify(payload));
  }}
}})();
"#,
        sentinel = SENTINEL,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn renders_sorted_context_bindings() {
        let mut ctx = HashMap::new();
        ctx.insert("b".to_string(), json!(2));
        ctx.insert("a".to_string(), json!(1));
        let rendered = render_context(&ctx);
        let a_idx = rendered.find("const a").expect("a present");
        let b_idx = rendered.find("const b").expect("b present");
        assert!(a_idx < b_idx);
    }

    #[test]
    fn wraps_pure_expression_with_return_and_sentinel() {
        let script = wrap_with_sentinel("2 + 40", &HashMap::new());
        assert!(script.contains("return (2 + 40);"));
        assert!(script.contains(SENTINEL));
        assert!(script.contains("JSON.stringify"));
    }
}
