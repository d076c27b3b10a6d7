//! Security Validator.
//!
//! A pure, pre-execution gate: `validate` never mutates its inputs and never
//! performs I/O. It is the first stage of the layered security pipeline
//! (static validation → resource admission → permission-set enforcement →
//! sandbox isolation) and runs before a resource token is ever
//! acquired.

use std::collections::HashMap;
use std::sync::LazyLock;

use cellrun_protocol::request::is_identifier_safe;
use regex::Regex;
use serde_json::Value;
use thiserror::Error;

/// Which execution path the code is headed for. Some denylist checks (raw
/// subprocess-spawn idioms) only apply when the target is the isolate, since
/// the subprocess path is itself an OS process whose spawn rights are
/// already governed by the permission mapper.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionTarget {
    Isolate,
    Subprocess,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityErrorKind {
    CodeTooLong,
    InvalidContextKey,
    DenylistedPattern,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("security validation failed ({kind:?}): {detail}")]
pub struct SecurityError {
    pub kind: SecurityErrorKind,
    pub detail: String,
}

impl SecurityError {
    fn new(kind: SecurityErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SecurityValidatorConfig {
    /// Maximum code length in characters. Default 100,000.
    pub max_code_length: usize,
}

impl Default for SecurityValidatorConfig {
    fn default() -> Self {
        Self {
            max_code_length: 100_000,
        }
    }
}

struct DenyRule {
    pattern: Regex,
    reason: &'static str,
    isolate_only: bool,
}

/// Patterns covering two families.2 names explicitly: escape
/// sequences that attempt a direct isolate break, and raw process-spawn
/// idioms (the latter gated to the isolate target).
static DENY_RULES: LazyLock<Vec<DenyRule>> = LazyLock::new(|| {
    let rule = |pattern: &str, reason: &'static str, isolate_only: bool| DenyRule {
        pattern: Regex::new(pattern).unwrap_or_else(|_| unreachable!("static denylist pattern is valid regex")),
        reason,
        isolate_only,
    };
    vec![
        // Isolate-break attempts via the constructor chain (the canonical
        // `(() => {}).constructor("return this")()` sandbox escape).
        rule(
            r"constructor\s*\.\s*constructor",
            "constructor-chain isolate escape",
            false,
        ),
        rule(
            r"\bFunction\s*\(",
            "dynamic Function constructor",
            false,
        ),
        rule(r"\bglobalThis\b", "direct globalThis access", false),
        rule(r"\bprocess\s*\.\s*binding\b", "process.binding escape", false),
        rule(r"\bprocess\s*\.\s*mainModule\b", "process.mainModule escape", false),
        // Raw subprocess-spawn idioms, isolate target only.
        rule(r"\brequire\s*\(\s*['\"]child_process['\"]", "child_process require", true),
        rule(r"\bDeno\s*\.\s*Command\b", "Deno.Command spawn", true),
        rule(r"\bBun\s*\.\s*spawn\b", "Bun.spawn", true),
        rule(r"\bimport\s*\(\s*['\"]child_process['\"]", "child_process dynamic import", true),
    ]
});

pub struct SecurityValidator {
    config: SecurityValidatorConfig,
}

impl Default for SecurityValidator {
    fn default() -> Self {
        Self::new(SecurityValidatorConfig::default())
    }
}

impl SecurityValidator {
    pub fn new(config: SecurityValidatorConfig) -> Self {
        Self { config }
    }

    /// `validate(code, context) -> Ok | Err(kind, detail)`.
    pub fn validate(
        &self,
        code: &str,
        context: &HashMap<String, Value>,
        target: ExecutionTarget,
    ) -> Result<(), SecurityError> {
        if code.chars().count() > self.config.max_code_length {
            return Err(SecurityError::new(
                SecurityErrorKind::CodeTooLong,
                format!(
                    "code length {} exceeds maximum {}",
                    code.chars().count(),
                    self.config.max_code_length
                ),
            ));
        }

        for key in context.keys() {
            if !is_identifier_safe(key) {
                return Err(SecurityError::new(
                    SecurityErrorKind::InvalidContextKey,
                    format!("context key '{key}' is not identifier-safe"),
                ));
            }
        }

        for rule in DENY_RULES.iter() {
            if rule.isolate_only && target != ExecutionTarget::Isolate {
                continue;
            }
            if rule.pattern.is_match(code) {
                return Err(SecurityError::new(
                    SecurityErrorKind::DenylistedPattern,
                    format!("code matches denylisted pattern: {}", rule.reason),
                ));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(pairs: &[(&str, Value)]) -> HashMap<String, Value> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn accepts_benign_code_and_context() {
        let validator = SecurityValidator::default();
        let context = ctx(&[("deps", Value::from(1))]);
        assert!(validator
            .validate("2 + 40", &context, ExecutionTarget::Isolate)
            .is_ok());
    }

    #[test]
    fn rejects_oversized_code() {
        let validator = SecurityValidator::new(SecurityValidatorConfig {
            max_code_length: 10,
        });
        let err = validator
            .validate(&"a".repeat(11), &HashMap::new(), ExecutionTarget::Isolate)
            .unwrap_err();
        assert_eq!(err.kind, SecurityErrorKind::CodeTooLong);
    }

    #[test]
    fn rejects_invalid_context_key_before_any_execution() {
        let validator = SecurityValidator::default();
        let context = ctx(&[("1invalid", Value::from(1))]);
        let err = validator
            .validate("1", &context, ExecutionTarget::Isolate)
            .unwrap_err();
        assert_eq!(err.kind, SecurityErrorKind::InvalidContextKey);
    }

    #[test]
    fn rejects_constructor_chain_escape_on_either_path() {
        let validator = SecurityValidator::default();
        let code = "(()=>{}).constructor.constructor('return this')()";
        assert_eq!(
            validator
                .validate(code, &HashMap::new(), ExecutionTarget::Isolate)
                .unwrap_err()
                .kind,
            SecurityErrorKind::DenylistedPattern
        );
        assert_eq!(
            validator
                .validate(code, &HashMap::new(), ExecutionTarget::Subprocess)
                .unwrap_err()
                .kind,
            SecurityErrorKind::DenylistedPattern
        );
    }

    #[test]
    fn raw_spawn_idiom_only_denied_for_isolate_target() {
        let validator = SecurityValidator::default();
        let code = "require('child_process').execSync('ls')";
        assert!(validator
            .validate(code, &HashMap::new(), ExecutionTarget::Isolate)
            .is_err());
        // On the subprocess path the OS-level permission flags
        // are responsible for denying spawn, not the static validator.
        assert!(validator
            .validate(code, &HashMap::new(), ExecutionTarget::Subprocess)
            .is_ok());
    }

    #[test]
    fn validate_never_mutates_inputs() {
        let validator = SecurityValidator::default();
        let code = "2 + 2".to_string();
        let context = ctx(&[("ok", Value::from(true))]);
        let code_before = code.clone();
        let context_before = context.clone();
        let _ = validator.validate(&code, &context, ExecutionTarget::Isolate);
        assert_eq!(code, code_before);
        assert_eq!(context, context_before);
    }
}
