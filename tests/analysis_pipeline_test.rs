//! End-to-end pipeline test against a real git repository.
//!
//! Builds an upstream repo with a feature branch, runs the engine through
//! the filesystem executor with stub analysis tools, and checks that only
//! diff-scoped findings survive. Requires `git` and `sh` on the host.
//!
//! Run with: `cargo test --test analysis_pipeline_test -- --ignored`

#![cfg(unix)]

use std::path::Path;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use diffci::executor::FileSystemExecutorFactory;
use diffci::models::analysis::{Analysis, AnalysisStatus};
use diffci::models::job::Job;
use diffci::models::tool::{Tool, ToolId};
use diffci::services::engine;

/// Run a git command in `dir`, panicking on failure.
fn git(dir: &Path, args: &[&str]) {
    let output = std::process::Command::new("git")
        .args(args)
        .current_dir(dir)
        .env("GIT_AUTHOR_NAME", "diffci test")
        .env("GIT_AUTHOR_EMAIL", "test@diffci.invalid")
        .env("GIT_COMMITTER_NAME", "diffci test")
        .env("GIT_COMMITTER_EMAIL", "test@diffci.invalid")
        .output()
        .expect("run git");
    assert!(
        output.status.success(),
        "git {args:?} failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
}

fn write_executable(path: &Path, body: &str) {
    use std::os::unix::fs::PermissionsExt;
    std::fs::write(path, body).expect("write script");
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
        .expect("mark executable");
}

const BASE_SOURCE: &str = "package main\n\nfunc main() {}\n";
const FEATURE_SOURCE: &str = "package main\n\nfunc main() {}\nfunc banned() {}\n";

#[tokio::test]
#[ignore]
async fn pull_request_analysis_end_to_end() {
    let fixture = tempfile::tempdir().expect("fixture dir");

    // Upstream repository: main with a clean file, feature adding line 4.
    let upstream = fixture.path().join("upstream");
    std::fs::create_dir_all(&upstream).unwrap();
    git(&upstream, &["init", "-b", "main"]);
    std::fs::write(upstream.join("main.go"), BASE_SOURCE).unwrap();
    git(&upstream, &["add", "."]);
    git(&upstream, &["commit", "-m", "initial"]);
    git(&upstream, &["checkout", "-b", "feature"]);
    std::fs::write(upstream.join("main.go"), FEATURE_SOURCE).unwrap();
    git(&upstream, &["commit", "-am", "add banned function"]);

    // Stub tool and generated-file helper on the executor's search path.
    // The tool reports one in-diff finding (line 4) and one outside the
    // diff (line 1), and exits non-zero like real linters do.
    let bin = fixture.path().join("bin");
    std::fs::create_dir_all(&bin).unwrap();
    write_executable(
        &bin.join("checker"),
        "#!/bin/sh\necho \"main.go:4: banned function\"\necho \"main.go:1: noise outside diff\"\nexit 1\n",
    );
    write_executable(&bin.join("isFileGenerated"), "#!/bin/sh\nexit 1\n");

    let workspaces = fixture.path().join("workspaces");
    let factory = FileSystemExecutorFactory::new(&workspaces).with_search_path(format!(
        "{}:/usr/local/bin:/usr/bin:/bin",
        bin.display()
    ));

    let tools = vec![Tool {
        id: ToolId(1),
        name: "Checker".to_string(),
        url: "https://example.com/checker".to_string(),
        path: "checker".to_string(),
        args: String::new(),
    }];

    let upstream_url = upstream.display().to_string();
    let job = Job::PullRequest {
        base_url: upstream_url.clone(),
        base_ref: "main".to_string(),
        head_url: upstream_url,
        head_ref: "feature".to_string(),
        installation_id: 1,
        repo_id: 1,
        pr_number: 1,
    };

    let mut analysis = Analysis::pending(Uuid::new_v4(), 1, 1);
    engine::analyse(
        &CancellationToken::new(),
        &factory,
        &tools,
        &job,
        &mut analysis,
    )
    .await
    .expect("analysis succeeds");

    assert_eq!(analysis.status, AnalysisStatus::Failure);
    assert_eq!(analysis.tool_runs.len(), 1);
    let issues = &analysis.tool_runs[0].issues;
    assert_eq!(issues.len(), 1, "only the diff-scoped finding survives");
    assert_eq!(issues[0].path, "main.go");
    assert_eq!(issues[0].line, 4);
    // Three context lines precede the added line in the hunk body.
    assert_eq!(issues[0].hunk_pos, 4);
    assert_eq!(issues[0].body, "Checker: banned function");

    assert!(analysis.clone_duration_ms.is_some());
    assert!(analysis.deps_duration_ms.is_some());
    assert!(analysis.total_duration_ms.is_some());

    // The workspace root is empty again after stop.
    let leftovers: Vec<_> = std::fs::read_dir(&workspaces)
        .map(|entries| entries.collect())
        .unwrap_or_default();
    assert!(leftovers.is_empty(), "workspace must be removed");
}

#[tokio::test]
#[ignore]
async fn push_analysis_with_clean_tree_is_success() {
    let fixture = tempfile::tempdir().expect("fixture dir");

    let upstream = fixture.path().join("upstream");
    std::fs::create_dir_all(&upstream).unwrap();
    git(&upstream, &["init", "-b", "main"]);
    std::fs::write(upstream.join("main.go"), BASE_SOURCE).unwrap();
    git(&upstream, &["add", "."]);
    git(&upstream, &["commit", "-m", "initial"]);
    std::fs::write(upstream.join("main.go"), FEATURE_SOURCE).unwrap();
    git(&upstream, &["commit", "-am", "second"]);

    // A tool that never reports anything.
    let bin = fixture.path().join("bin");
    std::fs::create_dir_all(&bin).unwrap();
    write_executable(&bin.join("checker"), "#!/bin/sh\nexit 0\n");
    write_executable(&bin.join("isFileGenerated"), "#!/bin/sh\nexit 1\n");

    let workspaces = fixture.path().join("workspaces");
    let factory = FileSystemExecutorFactory::new(&workspaces).with_search_path(format!(
        "{}:/usr/local/bin:/usr/bin:/bin",
        bin.display()
    ));

    let tools = vec![Tool {
        id: ToolId(1),
        name: "Checker".to_string(),
        url: String::new(),
        path: "checker".to_string(),
        args: String::new(),
    }];

    let upstream_url = upstream.display().to_string();
    let job = Job::Push {
        base_url: upstream_url.clone(),
        base_ref: "main~1".to_string(),
        head_url: upstream_url,
        head_ref: "main".to_string(),
        installation_id: 1,
        repo_id: 1,
    };

    let mut analysis = Analysis::pending(Uuid::new_v4(), 1, 1);
    engine::analyse(
        &CancellationToken::new(),
        &factory,
        &tools,
        &job,
        &mut analysis,
    )
    .await
    .expect("analysis succeeds");

    assert_eq!(analysis.status, AnalysisStatus::Success);
    assert_eq!(analysis.issue_count(), 0);
    assert_eq!(analysis.tool_runs.len(), 1);
}
