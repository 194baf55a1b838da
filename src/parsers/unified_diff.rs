//! Unified-diff parser.
//!
//! Converts `git diff A...B` output into a per-file, per-hunk, per-line map
//! that answers "is line L of file F part of the change, and at what
//! position in the diff?". The position is the 1-based offset of a line
//! within a file's diff body, counted from the first `@@` header: the forge
//! anchors review comments to it.

use std::collections::HashMap;

/// How a line participates in the change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineKind {
    Context,
    Added,
    Removed,
}

/// One line of a hunk body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Line {
    pub kind: LineKind,
    /// 1-based line number in the new file; `None` for removed lines.
    pub new_lineno: Option<u32>,
    /// 1-based offset within the file's diff body.
    pub hunk_pos: u32,
}

/// A contiguous change region within one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hunk {
    /// New-file line number the hunk starts at.
    pub new_start: u32,
    pub lines: Vec<Line>,
}

/// All hunks for one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Patch {
    /// Path of the file in the new tree, relative to the repository root.
    pub path: String,
    pub hunks: Vec<Hunk>,
}

/// Parsed diff with a lookup index over added lines.
///
/// Lifetime is one analysis.
#[derive(Debug, Default)]
pub struct DiffSet {
    patches: Vec<Patch>,
    positions: HashMap<(String, u32), u32>,
}

impl DiffSet {
    /// Parse unified-diff bytes as produced by `git diff` or `git show`.
    ///
    /// Tolerates renames, new files, deletions and multi-hunk patches.
    /// Binary files are excluded. Anything before the first `diff --git`
    /// marker (e.g. a `git show` commit header) is skipped.
    pub fn parse(input: &[u8]) -> Self {
        let text = String::from_utf8_lossy(input);
        let mut parser = Parser::default();
        for line in text.split('\n') {
            parser.feed(line);
        }
        parser.finish()
    }

    pub fn patches(&self) -> &[Patch] {
        &self.patches
    }

    /// True when the diff contains no added lines at all.
    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    /// Diff position of an added line, or `None` when (path, line) is not
    /// part of the change.
    pub fn position_of(&self, path: &str, new_lineno: u32) -> Option<u32> {
        self.positions.get(&(path.to_string(), new_lineno)).copied()
    }
}

/// Streaming state for one `DiffSet::parse` call.
#[derive(Default)]
struct Parser {
    patches: Vec<Patch>,
    current: Option<FileState>,
}

struct FileState {
    path: Option<String>,
    rename_target: Option<String>,
    binary: bool,
    hunks: Vec<Hunk>,
    /// Running diff-body offset; 0 until the first hunk header is seen.
    pos: u32,
    in_body: bool,
    new_lineno: u32,
}

impl FileState {
    fn new() -> Self {
        Self {
            path: None,
            rename_target: None,
            binary: false,
            hunks: Vec::new(),
            pos: 0,
            in_body: false,
            new_lineno: 0,
        }
    }

    fn into_patch(mut self) -> Option<Patch> {
        if self.binary {
            return None;
        }
        let path = self.path.take().or(self.rename_target)?;
        Some(Patch {
            path,
            hunks: self.hunks,
        })
    }
}

impl Parser {
    fn feed(&mut self, line: &str) {
        if line.starts_with("diff --git ") {
            self.flush();
            self.current = Some(FileState::new());
            return;
        }
        let Some(state) = self.current.as_mut() else {
            // Preamble before the first file marker (commit header etc).
            return;
        };

        if let Some(header) = line.strip_prefix("@@ ") {
            if let Some(new_start) = parse_hunk_header(header) {
                // Later hunk headers are part of the body for position
                // accounting; the first is not.
                if state.in_body {
                    state.pos += 1;
                }
                state.in_body = true;
                state.new_lineno = new_start;
                state.hunks.push(Hunk {
                    new_start,
                    lines: Vec::new(),
                });
            }
            return;
        }

        if state.in_body {
            let Some(hunk) = state.hunks.last_mut() else {
                return;
            };
            match line.as_bytes().first() {
                Some(b'+') => {
                    state.pos += 1;
                    hunk.lines.push(Line {
                        kind: LineKind::Added,
                        new_lineno: Some(state.new_lineno),
                        hunk_pos: state.pos,
                    });
                    state.new_lineno += 1;
                }
                Some(b'-') => {
                    state.pos += 1;
                    hunk.lines.push(Line {
                        kind: LineKind::Removed,
                        new_lineno: None,
                        hunk_pos: state.pos,
                    });
                }
                Some(b' ') => {
                    state.pos += 1;
                    hunk.lines.push(Line {
                        kind: LineKind::Context,
                        new_lineno: Some(state.new_lineno),
                        hunk_pos: state.pos,
                    });
                    state.new_lineno += 1;
                }
                // "\ No newline at end of file" occupies a body position
                // but anchors nothing.
                Some(b'\\') => state.pos += 1,
                // A non-body line ends the body (trailing diff metadata).
                _ => state.in_body = false,
            }
            return;
        }

        if let Some(rest) = line.strip_prefix("+++ ") {
            if rest != "/dev/null" {
                state.path = Some(strip_tree_prefix(rest).to_string());
            }
        } else if let Some(rest) = line.strip_prefix("--- ") {
            // Keep the old path for deletions, where `+++` is /dev/null.
            if rest != "/dev/null" && state.path.is_none() {
                state.path = Some(strip_tree_prefix(rest).to_string());
            }
        } else if let Some(rest) = line.strip_prefix("rename to ") {
            // Pure renames carry no ---/+++ header at all.
            state.rename_target = Some(rest.to_string());
        } else if line.starts_with("Binary files ") || line.starts_with("GIT binary patch") {
            state.binary = true;
        }
    }

    fn flush(&mut self) {
        if let Some(state) = self.current.take() {
            if let Some(patch) = state.into_patch() {
                self.patches.push(patch);
            }
        }
    }

    fn finish(mut self) -> DiffSet {
        self.flush();
        let mut positions = HashMap::new();
        for patch in &self.patches {
            for hunk in &patch.hunks {
                for line in &hunk.lines {
                    if line.kind == LineKind::Added {
                        if let Some(lineno) = line.new_lineno {
                            positions.insert((patch.path.clone(), lineno), line.hunk_pos);
                        }
                    }
                }
            }
        }
        DiffSet {
            patches: self.patches,
            positions,
        }
    }
}

/// Extract the new-file start line from `-a,b +c,d @@ ...`.
fn parse_hunk_header(header: &str) -> Option<u32> {
    let plus = header.split_whitespace().find(|part| part.starts_with('+'))?;
    let range = &plus[1..];
    let start = range.split(',').next()?;
    start.parse().ok()
}

/// Drop git's `a/` / `b/` tree prefix and any trailing tab metadata.
fn strip_tree_prefix(path: &str) -> &str {
    let path = path.split('\t').next().unwrap_or(path);
    path.strip_prefix("a/")
        .or_else(|| path.strip_prefix("b/"))
        .unwrap_or(path)
}
