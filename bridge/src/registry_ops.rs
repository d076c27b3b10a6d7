//! In-host capability-registry operations reachable via the reserved
//! `std/cap_*` server prefix. Responses are
//! wrapped in the same MCP-style content envelope external tools use, so
//! the isolate's tool proxies do not need a special case for them.

use cellrun_protocol::Fqdn;
use cellrun_registry::CapabilityRegistry;
use serde_json::json;
use serde_json::Value;

fn content_envelope(payload: Value) -> Value {
    json!({ "content": [{ "text": payload.to_string() }] })
}

fn fqdn_from_args(args: &Value, field: &str) -> Result<Fqdn, String> {
    let raw = args
        .get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| format!("missing '{field}' argument"))?;
    Fqdn::parse(raw).ok_or_else(|| format!("'{field}' is not a valid fqdn: {raw}"))
}

pub fn handle(
    op: &str,
    args: &Value,
    registry: &CapabilityRegistry,
    org: &str,
    project: &str,
) -> Result<Value, String> {
    match op {
        "list" => {
            let capabilities = registry.list(org, project);
            Ok(content_envelope(json!(capabilities)))
        }
        "search" => {
            let query = args
                .get("query")
                .and_then(Value::as_str)
                .ok_or_else(|| "missing 'query' argument".to_string())?;
            let capabilities = registry.search(org, project, query);
            Ok(content_envelope(json!(capabilities)))
        }
        "whois" => {
            let fqdn = fqdn_from_args(args, "fqdn")?;
            let capability = registry.whois(&fqdn);
            Ok(content_envelope(json!(capability)))
        }
        "rename" => {
            let fqdn = fqdn_from_args(args, "fqdn")?;
            let new_display_name = args
                .get("newDisplayName")
                .and_then(Value::as_str)
                .ok_or_else(|| "missing 'newDisplayName' argument".to_string())?;
            registry
                .rename(&fqdn, new_display_name)
                .map_err(|e| e.to_string())?;
            Ok(content_envelope(json!({ "renamed": true })))
        }
        "merge" => {
            let target = fqdn_from_args(args, "target")?;
            let source = fqdn_from_args(args, "source")?;
            let force_source_snippet = args
                .get("forceSourceSnippet")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            let merged = registry
                .merge(&target, &source, force_source_snippet)
                .map_err(|e| e.to_string())?;
            Ok(content_envelope(json!(merged)))
        }
        other => Err(format!("unknown capability registry operation: {other}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cellrun_registry::generate_fqdn;
    use cellrun_protocol::Capability;

    #[test]
    fn list_returns_capabilities_in_scope() {
        let registry = CapabilityRegistry::new();
        let fqdn = generate_fqdn("acme", "w", "fs", "read", "return 1;", |_| false);
        registry
            .insert(Capability::new(fqdn, "return 1;".to_string(), vec![]))
            .expect("insert succeeds");

        let result = handle("list", &json!({}), &registry, "acme", "w").expect("list succeeds");
        let text = result["content"][0]["text"].as_str().expect("text field");
        assert!(text.contains("fs:read"));
    }

    #[test]
    fn unknown_op_is_rejected() {
        let registry = CapabilityRegistry::new();
        let err = handle("delete", &json!({}), &registry, "acme", "w").unwrap_err();
        assert!(err.contains("unknown capability registry operation"));
    }
}
