//! Pure-expression detection and REPL-style auto-return wrapping.
//! The isolate always evaluates one async IIFE so `await` is
//! legal at the top level and a `return` inside it becomes the execution
//! result; a bare expression has no implicit completion value in that
//! shape, so we wrap it in `return (...)` ourselves when we can tell the
//! submitted code is "just an expression".

const STATEMENT_LEADING_KEYWORDS: &[&str] = &[
    "const", "let", "var", "function", "async", "class", "if", "for", "while", "do", "try",
    "switch", "return", "throw", "break", "continue", "import", "export", "{",
];

/// Best-effort classification, not a full parse: code is treated as a pure
/// expression when, after trimming, it does not open with a statement
/// keyword and contains no top-level `;`-separated statement sequence.
/// Multi-line or semicolon-terminated snippets with an unambiguous single
/// trailing expression (e.g. `"2 + 40;"`) still count as pure expressions.
pub fn is_pure_expression(code: &str) -> bool {
    let trimmed = code.trim();
    if trimmed.is_empty() {
        return false;
    }

    let starts_with_statement_keyword = STATEMENT_LEADING_KEYWORDS.iter().any(|kw| {
        trimmed == *kw
            || trimmed
                .strip_prefix(kw)
                .is_some_and(|rest| rest.starts_with(|c: char| !c.is_alphanumeric() && c != '_'))
    });
    if starts_with_statement_keyword {
        return false;
    }

    let body = trimmed.strip_suffix(';').unwrap_or(trimmed);
    !contains_top_level_statement_separator(body)
}

/// Walks the code tracking bracket/quote depth and flags a `;` found at
/// depth zero that is not the code's own trailing terminator — a signal
/// that more than one statement is present.
fn contains_top_level_statement_separator(body: &str) -> bool {
    let mut depth: i32 = 0;
    let mut in_string: Option<char> = None;
    let mut chars = body.chars().peekable();
    while let Some(c) = chars.next() {
        if let Some(quote) = in_string {
            if c == '\\' {
                chars.next();
            } else if c == quote {
                in_string = None;
            }
            continue;
        }
        match c {
            '\'' | '"' | '`' => in_string = Some(c),
            '(' | '[' | '{' => depth += 1,
            ')' | ']' | '}' => depth -= 1,
            ';' if depth == 0 => return true,
            _ => {}
        }
    }
    false
}

/// Wraps submitted code into the async IIFE the worker evaluates. Pure
/// expressions are wrapped as `return (<expr>);`; statement code is pasted
/// in as-is and must contain its own explicit `return`.
pub fn wrap_for_execution(code: &str) -> String {
    let body = if is_pure_expression(code) {
        format!("return ({});", code.trim().trim_end_matches(';'))
    } else {
        code.to_string()
    };
    format!("(async function() {{\n{body}\n}})()")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arithmetic_expression_is_pure() {
        assert!(is_pure_expression("2 + 40"));
        assert!(is_pure_expression("2 + 40;"));
    }

    #[test]
    fn statement_sequence_is_not_pure() {
        assert!(!is_pure_expression("const x = 1; x + 1;"));
        assert!(!is_pure_expression("if (true) { 1 } else { 2 }"));
        assert!(!is_pure_expression("return 42;"));
    }

    #[test]
    fn semicolons_inside_braces_do_not_count_as_top_level() {
        assert!(is_pure_expression("[1, 2, 3].map(x => { return x; })"));
    }

    #[test]
    fn wrap_injects_return_only_for_pure_expressions() {
        assert_eq!(
            wrap_for_execution("2 + 40"),
            "(async function() {\nreturn (2 + 40);\n})()"
        );
        assert_eq!(
            wrap_for_execution("const x = 1; return x;"),
            "(async function() {\nconst x = 1; return x;\n})()"
        );
    }
}
