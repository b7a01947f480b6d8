//! Compiler diagnostics cleanup.
//!
//! Compiler messages carry loader chains, module trace lines and stack
//! frames of the compiler itself. Only the part a program author can act on
//! is kept.

use std::sync::LazyLock;

use regex::Regex;

const SYNTAX_ERROR_LABEL: &str = "Syntax error:";

static EXPORT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"\s*(.+?)\s*(")?export '(.+?)' was not found in '(.+?)'"#).unwrap()
});

static STACK_FRAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*at\s.*:\d+:\d+[\s)]*$").unwrap());

/// Cleans up one compiler error or warning.
pub fn format_message(message: &str) -> String {
    let mut lines: Vec<String> = message.split('\n').map(str::to_string).collect();

    if lines.len() > 2 && lines[1].is_empty() {
        lines.remove(1);
    }

    // Drop the loader chain in front of the resource.
    if let Some(index) = lines[0].rfind('!') {
        lines[0] = lines[0][index + 1..].to_string();
    }

    lines.retain(|line| !line.starts_with(" @ "));

    if lines.len() < 2 || lines[0].is_empty() || lines[1].is_empty() {
        return lines.join("\n");
    }

    if lines[1].starts_with("Module not found: ") {
        let reason = lines[1]
            .replacen("Cannot resolve 'file' or 'directory' ", "", 1)
            .replacen("Cannot resolve module ", "", 1)
            .replacen("Error: ", "", 1)
            .replacen("[CaseSensitivePathsPlugin] ", "", 1);
        lines.truncate(1);
        lines.push(reason);
    }

    if lines[1].starts_with("Module build failed: ") {
        lines[1] = lines[1].replacen("Module build failed: SyntaxError:", SYNTAX_ERROR_LABEL, 1);
    }

    if EXPORT_RE.is_match(&lines[1]) {
        lines[1] = EXPORT_RE
            .replace(&lines[1], "${1} '${4}' does not contain an export named '${3}'.")
            .into_owned();
    }

    lines
        .iter()
        .filter(|line| !(STACK_FRAME_RE.is_match(line) && !line.contains("webpack:")))
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

pub fn is_syntax_error(message: &str) -> bool {
    message.contains(SYNTAX_ERROR_LABEL)
}

/// The single error reported for a failed build: the first syntax error if
/// there is one, the first error otherwise.
pub fn select_error(errors: &[String]) -> Option<String> {
    let formatted: Vec<String> = errors.iter().map(|error| format_message(error)).collect();
    formatted
        .iter()
        .find(|message| is_syntax_error(message))
        .or_else(|| formatted.first())
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strips_loader_chain_and_trace() {
        let message = "./node_modules/babel-loader/lib!./src/App.js\n\nModule build failed: SyntaxError: Unexpected token (3:4)\n @ ./src/index.js 1:0-24";
        assert_eq!(
            format_message(message),
            "./src/App.js\nSyntax error: Unexpected token (3:4)"
        );
    }

    #[test]
    fn test_module_not_found() {
        let message = "./src/index.js\nModule not found: Error: Cannot resolve module 'lodash' in /app/src";
        assert_eq!(
            format_message(message),
            "./src/index.js\nModule not found: 'lodash' in /app/src"
        );
    }

    #[test]
    fn test_missing_export() {
        let message = "./src/index.js\n43:10-14 \"export 'Menu' was not found in 'site'";
        assert_eq!(
            format_message(message),
            "./src/index.js\n43:10-14 'site' does not contain an export named 'Menu'."
        );
    }

    #[test]
    fn test_compiler_stack_frames_are_removed() {
        let message = "./src/App.js\nTypeError: boom\n    at compile (/svc/node_modules/x/index.js:10:5)\n    at webpack:///./src/App.js:3:1";
        assert_eq!(
            format_message(message),
            "./src/App.js\nTypeError: boom\n    at webpack:///./src/App.js:3:1"
        );
    }

    #[test]
    fn test_single_line_passes_through() {
        assert_eq!(format_message("Something failed"), "Something failed");
    }

    #[test]
    fn test_select_prefers_syntax_errors() {
        let errors = vec![
            "./a.js\nModule not found: Error: Cannot resolve module 'x'".to_string(),
            "./b.js\nModule build failed: SyntaxError: Unexpected token".to_string(),
            "./c.js\nModule build failed: SyntaxError: Missing semicolon".to_string(),
        ];
        assert_eq!(
            select_error(&errors).as_deref(),
            Some("./b.js\nSyntax error: Unexpected token")
        );

        assert_eq!(
            select_error(&errors[..1]).as_deref(),
            Some("./a.js\nModule not found: 'x'")
        );
        assert_eq!(select_error(&[]), None);
    }
}
