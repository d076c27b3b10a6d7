use cellrun_protocol::Capability;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeError {
    ToolsUsedMismatch,
}

impl std::fmt::Display for MergeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MergeError::ToolsUsedMismatch => {
                write!(f, "merge precondition failed: toolsUsed lists differ")
            }
        }
    }
}

/// Merges `source` into `target`: stats summed, `created_at`
/// is the earlier of the two, and the code snippet kept is the one with the
/// later `updated_at` unless `force_source_snippet` overrides that.
/// Precondition: `target.tools_used == source.tools_used` (order-sensitive,
/// since it records the sequence a successful run exercised).
pub fn merge_capabilities(
    mut target: Capability,
    source: Capability,
    force_source_snippet: bool,
) -> Result<Capability, MergeError> {
    if target.tools_used != source.tools_used {
        return Err(MergeError::ToolsUsedMismatch);
    }

    target.usage_count += source.usage_count;
    target.success_count += source.success_count;
    target.total_latency_ms += source.total_latency_ms;
    target.created_at = target.created_at.min(source.created_at);

    let keep_source_snippet = force_source_snippet || source.updated_at > target.updated_at;
    if keep_source_snippet {
        target.code_snippet = source.code_snippet;
    }
    target.updated_at = target.updated_at.max(source.updated_at);

    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cellrun_protocol::Fqdn;

    fn cap(action: &str) -> Capability {
        Capability::new(
            Fqdn::new("acme", "w", "fs", action, "aaaa"),
            format!("snippet-{action}"),
            vec!["fs:read".to_string()],
        )
    }

    #[test]
    fn newer_snippet_wins_by_default() {
        let mut target = cap("a");
        let mut source = cap("b");
        source.updated_at = target.updated_at + chrono::Duration::seconds(1);
        let merged = merge_capabilities(target.clone(), source.clone(), false).expect("merges");
        assert_eq!(merged.code_snippet, source.code_snippet);

        target.updated_at = source.updated_at + chrono::Duration::seconds(1);
        let merged = merge_capabilities(target.clone(), source, false).expect("merges");
        assert_eq!(merged.code_snippet, target.code_snippet);
    }

    #[test]
    fn force_source_snippet_overrides_recency() {
        let target = cap("a");
        let mut source = cap("b");
        source.updated_at = target.created_at - chrono::Duration::seconds(10);
        let merged = merge_capabilities(target, source.clone(), true).expect("merges");
        assert_eq!(merged.code_snippet, source.code_snippet);
    }
}
