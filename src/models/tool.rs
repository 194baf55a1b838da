//! Configured static-analysis tools.

use serde::{Deserialize, Serialize};

/// Identifier of a configured tool, assigned by the store.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type,
)]
#[serde(transparent)]
#[sqlx(transparent)]
pub struct ToolId(pub i32);

impl std::fmt::Display for ToolId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Placeholder in a tool's argument template, expanded to the base ref of
/// the job at invocation time.
pub const BASE_BRANCH_PLACEHOLDER: &str = "%BASE_BRANCH%";

/// A static-analysis tool as configured in the store.
///
/// Tools are opaque executables that read source and write findings in
/// `path:line: message` form. Read-mostly configuration, loaded once per job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Tool {
    pub id: ToolId,
    /// Display name, prefixed onto every issue this tool reports.
    pub name: String,
    /// Project URL shown on the dashboard.
    pub url: String,
    /// Executable path or name resolved inside the workspace.
    pub path: String,
    /// Whitespace-separated argument template; may contain
    /// [`BASE_BRANCH_PLACEHOLDER`].
    pub args: String,
}

impl Tool {
    /// Build the argv for this tool against the given base ref.
    pub fn argv(&self, base_ref: &str) -> Vec<String> {
        let mut argv = vec![self.path.clone()];
        argv.extend(
            self.args
                .split_whitespace()
                .map(|arg| arg.replace(BASE_BRANCH_PLACEHOLDER, base_ref)),
        );
        argv
    }
}
