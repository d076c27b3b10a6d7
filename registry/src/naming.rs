use cellrun_protocol::Fqdn;
use sha2::Digest;
use sha2::Sha256;

/// `org + "." + project + "." + namespace + "." + action + "." + hashPrefix(codeDigest)`.
/// `exists` checks whether a candidate FQDN string is already
/// taken; the prefix starts at 4 hex chars and grows to 8 on collision.
pub fn generate_fqdn(
    org: &str,
    project: &str,
    namespace: &str,
    action: &str,
    code: &str,
    exists: impl Fn(&str) -> bool,
) -> Fqdn {
    let digest = code_digest(code);
    for len in 4..=8 {
        let hash = &digest[..len];
        let candidate = Fqdn::new(org, project, namespace, action, hash);
        if !exists(&candidate.to_string()) {
            return candidate;
        }
    }
    // Exhausted the 4-8 window; fall back to the full digest rather than
    // silently colliding. Vanishingly unlikely in practice.
    Fqdn::new(org, project, namespace, action, &digest)
}

/// Normalizes code (trims surrounding whitespace) before hashing, so
/// cosmetic differences in leading/trailing whitespace do not change the
/// generated FQDN.
fn code_digest(code: &str) -> String {
    let normalized = code.trim();
    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generates_four_char_hash_prefix_when_unambiguous() {
        let fqdn = generate_fqdn("acme", "widgets", "fs", "read", "return 1;", |_| false);
        assert_eq!(fqdn.hash.len(), 4);
    }

    #[test]
    fn expands_prefix_length_on_collision() {
        let mut first_candidate = None;
        let fqdn = generate_fqdn("acme", "widgets", "fs", "read", "return 1;", |candidate| {
            if first_candidate.is_none() {
                first_candidate = Some(candidate.to_string());
                true
            } else {
                false
            }
        });
        assert_eq!(fqdn.hash.len(), 5);
    }

    #[test]
    fn same_code_produces_same_fqdn() {
        let a = generate_fqdn("acme", "w", "fs", "read", "  return 1;  ", |_| false);
        let b = generate_fqdn("acme", "w", "fs", "read", "return 1;", |_| false);
        assert_eq!(a, b);
    }
}
