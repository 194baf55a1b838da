//! Line-oriented parser for static-analysis tool output.
//!
//! The accepted shape is `PATH:LINE[:COL]: MESSAGE`. Lines that do not
//! match are ignored, tool by tool, line by line.

/// One parsed finding, before diff-scope and generated-file filtering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFinding {
    /// Path relative to the repository root.
    pub path: String,
    /// 1-based line number in the file.
    pub line: u32,
    pub message: String,
}

/// Parse a whole tool output, dropping unparseable lines.
///
/// `workspace` is the absolute workspace path reported by `pwd`; tool
/// output that uses absolute paths is relativised against it.
pub fn parse(output: &[u8], workspace: &str) -> Vec<RawFinding> {
    String::from_utf8_lossy(output)
        .lines()
        .filter_map(|line| parse_line(line, workspace))
        .collect()
}

/// Parse a single `PATH:LINE[:COL]: MESSAGE` line.
pub fn parse_line(line: &str, workspace: &str) -> Option<RawFinding> {
    let (path, rest) = line.split_once(':')?;
    let (lineno, rest) = rest.split_once(':')?;
    let lineno: u32 = lineno.trim().parse().ok()?;

    // An optional column slot sits between the line number and the message.
    let message = match rest.split_once(':') {
        Some((maybe_col, tail)) if maybe_col.trim().parse::<u32>().is_ok() => tail,
        _ => rest,
    };
    let message = message.trim();
    if path.is_empty() || message.is_empty() {
        return None;
    }

    Some(RawFinding {
        path: relativise(path, workspace).to_string(),
        line: lineno,
        message: message.to_string(),
    })
}

/// Strip the workspace prefix from an absolute path.
fn relativise<'a>(path: &'a str, workspace: &str) -> &'a str {
    if workspace.is_empty() {
        return path;
    }
    path.strip_prefix(workspace)
        .map(|rest| rest.trim_start_matches('/'))
        .unwrap_or(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    const WORKSPACE: &str = "/tmp/diffci/workspace";

    #[test]
    fn parses_path_line_message() {
        let finding = parse_line("main.go:1: error1", WORKSPACE).unwrap();
        assert_eq!(finding.path, "main.go");
        assert_eq!(finding.line, 1);
        assert_eq!(finding.message, "error1");
    }

    #[test]
    fn parses_optional_column() {
        let finding = parse_line("src/lib.rs:12:34: unused variable", WORKSPACE).unwrap();
        assert_eq!(finding.path, "src/lib.rs");
        assert_eq!(finding.line, 12);
        assert_eq!(finding.message, "unused variable");
    }

    #[test]
    fn message_may_contain_colons() {
        let finding = parse_line("main.go:1: error: expected ';'", WORKSPACE).unwrap();
        assert_eq!(finding.message, "error: expected ';'");
    }

    #[test]
    fn absolute_path_is_stripped_to_workspace_relative() {
        let line = format!("{WORKSPACE}/sub/x.go:3: msg");
        let finding = parse_line(&line, WORKSPACE).unwrap();
        assert_eq!(finding.path, "sub/x.go");
    }

    #[test]
    fn absolute_path_outside_workspace_is_kept() {
        let finding = parse_line("/usr/lib/other.go:3: msg", WORKSPACE).unwrap();
        assert_eq!(finding.path, "/usr/lib/other.go");
    }

    #[test]
    fn unparseable_lines_are_ignored() {
        assert_eq!(parse_line("exit status 1", WORKSPACE), None);
        assert_eq!(parse_line("found 3 issues", WORKSPACE), None);
        assert_eq!(parse_line("main.go:x: not a number", WORKSPACE), None);
        assert_eq!(parse_line("", WORKSPACE), None);
        assert_eq!(parse_line("main.go:1:", WORKSPACE), None);
    }

    #[test]
    fn parse_keeps_order_and_drops_noise() {
        let output = b"warming up\nmain.go:1: first\ngarbage\nmain.go:9: second\n";
        let findings = parse(output, WORKSPACE);
        assert_eq!(findings.len(), 2);
        assert_eq!(findings[0].message, "first");
        assert_eq!(findings[1].message, "second");
    }
}
