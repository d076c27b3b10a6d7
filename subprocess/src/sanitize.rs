//! Error-message sanitization for the subprocess path. Absolute home-directory
//! paths and the execution's own temp-file path are replaced with generic
//! tokens before a message or stack trace is allowed to reach the caller.

use std::path::Path;

const HOME_TOKEN: &str = "<home>";
const TEMPFILE_TOKEN: &str = "<tempfile>";

/// Replaces every occurrence of the current user's home directory and of
/// `script_path` (the execution's own generated temp file) with generic
/// tokens. Never panics on a message that contains neither.
pub fn sanitize_message(message: &str, script_path: &Path) -> String {
    let mut sanitized = message.to_string();

    if let Some(script_str) = script_path.to_str() {
        sanitized = sanitized.replace(script_str, TEMPFILE_TOKEN);
    }
    if let Some(parent) = script_path.parent().and_then(Path::to_str) {
        if !parent.is_empty() && parent != "/" {
            sanitized = sanitized.replace(parent, TEMPFILE_TOKEN);
        }
    }

    if let Ok(home) = std::env::var("HOME") {
        if !home.is_empty() {
            sanitized = sanitized.replace(&home, HOME_TOKEN);
        }
    }

    sanitized
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replaces_script_path_with_tempfile_token() {
        let path = Path::new("/tmp/cellrun-abc123-uuid.js");
        let message = format!("Error reading {}", path.display());
        let sanitized = sanitize_message(&message, path);
        assert_eq!(sanitized, format!("Error reading {TEMPFILE_TOKEN}"));
    }

    #[test]
    fn leaves_unrelated_messages_untouched() {
        let path = Path::new("/tmp/cellrun-abc123-uuid.js");
        let sanitized = sanitize_message("TypeError: x is not a function", path);
        assert_eq!(sanitized, "TypeError: x is not a function");
    }

    #[test]
    fn replaces_home_directory_when_present() {
        std::env::set_var("HOME", "/home/sandboxuser");
        let path = Path::new("/tmp/cellrun-xyz.js");
        let sanitized = sanitize_message("denied: /home/sandboxuser/.secret", path);
        assert_eq!(sanitized, format!("denied: {HOME_TOKEN}/.secret"));
    }
}
