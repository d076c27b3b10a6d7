use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

/// A fully-qualified capability name: `<org>.<project>.<namespace>.<action>.<hash>`,
/// lowercase, dot-separated. `hash` is a stable 4–8 hex-char
/// prefix of the code digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fqdn {
    pub org: String,
    pub project: String,
    pub namespace: String,
    pub action: String,
    pub hash: String,
}

impl Fqdn {
    pub fn new(
        org: impl Into<String>,
        project: impl Into<String>,
        namespace: impl Into<String>,
        action: impl Into<String>,
        hash: impl Into<String>,
    ) -> Self {
        Self {
            org: org.into().to_lowercase(),
            project: project.into().to_lowercase(),
            namespace: namespace.into().to_lowercase(),
            action: action.into().to_lowercase(),
            hash: hash.into().to_lowercase(),
        }
    }

    /// `<namespace>:<action>` — the human display name subset.
    pub fn display_name(&self) -> String {
        format!("{}:{}", self.namespace, self.action)
    }

    /// The `(org, project, namespace, action)` family used to scope hash
    /// collision checks during FQDN generation.
    pub fn family(&self) -> (&str, &str, &str, &str) {
        (&self.org, &self.project, &self.namespace, &self.action)
    }

    /// Parses a dotted FQDN string back into its five components.
    pub fn parse(s: &str) -> Option<Self> {
        let mut parts = s.split('.');
        let org = parts.next()?.to_string();
        let project = parts.next()?.to_string();
        let namespace = parts.next()?.to_string();
        let action = parts.next()?.to_string();
        let hash = parts.next()?.to_string();
        if parts.next().is_some() {
            return None;
        }
        Some(Self::new(org, project, namespace, action, hash))
    }
}

impl std::fmt::Display for Fqdn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}.{}.{}.{}.{}",
            self.org, self.project, self.namespace, self.action, self.hash
        )
    }
}

/// A learned, re-executable artifact persisted after a successful, eligible
/// run.
///
/// Invariant: `(org, project, namespace, action, hash)` (i.e. `fqdn`) is
/// unique, and `usage_count >= success_count >= 0`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Capability {
    pub fqdn: Fqdn,
    pub display_name: String,
    pub code_snippet: String,
    pub tools_used: Vec<String>,
    pub usage_count: u64,
    pub success_count: u64,
    pub total_latency_ms: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters_schema: Option<Value>,
}

impl Capability {
    pub fn new(fqdn: Fqdn, code_snippet: String, tools_used: Vec<String>) -> Self {
        let now = Utc::now();
        let display_name = fqdn.display_name();
        Self {
            fqdn,
            display_name,
            code_snippet,
            tools_used,
            usage_count: 0,
            success_count: 0,
            total_latency_ms: 0,
            created_at: now,
            updated_at: now,
            parameters_schema: None,
        }
    }

    pub fn is_invariant_satisfied(&self) -> bool {
        self.usage_count >= self.success_count
    }
}

/// `(org, project, alias) -> target fqdn`. Aliases are many-to-one onto an
/// FQDN. Produced automatically on rename; resolving through one
/// logs a deprecation notice. Alias chaining is resolved in DESIGN.md to be
/// non-chaining: an alias always points directly at a live FQDN, never at
/// another alias.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alias {
    pub org: String,
    pub project: String,
    pub alias: String,
    pub target_fqdn: Fqdn,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fqdn_round_trips_through_display_and_parse() {
        let fqdn = Fqdn::new("Acme", "Widgets", "fs", "Read_Json", "A1B2");
        let s = fqdn.to_string();
        assert_eq!(s, "acme.widgets.fs.read_json.a1b2");
        let parsed = Fqdn::parse(&s).expect("parse");
        assert_eq!(parsed, fqdn);
    }

    #[test]
    fn display_name_is_namespace_colon_action() {
        let fqdn = Fqdn::new("acme", "widgets", "fs", "read_json", "a1b2");
        assert_eq!(fqdn.display_name(), "fs:read_json");
    }
}
