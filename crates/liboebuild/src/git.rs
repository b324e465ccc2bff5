use anyhow::{Context, Result};
use std::fs;
use std::path::Path;
use std::process::{Command, Output, Stdio};
use tracing::debug;

/// Name of the remote every managed repository fetches from.
pub const REMOTE: &str = "upstream";

/// Run a git command with the given arguments in the specified directory.
/// Returns the output if successful, otherwise returns an error with the full command details.
fn run_git(repo_path: &Path, args: &[&str]) -> Result<Output> {
    debug!(dir = %repo_path.display(), "git {}", args.join(" "));
    let output = Command::new("git")
        .current_dir(repo_path)
        .args(args)
        .output()
        .with_context(|| format!("Failed to execute git command: git {}", args.join(" ")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let command = format!("git {}", args.join(" "));
        anyhow::bail!("Git command failed: {}\nError: {}", command, stderr.trim());
    }

    Ok(output)
}

/// Run a git command whose progress is streamed straight to the terminal.
fn run_git_streaming(repo_path: &Path, args: &[&str]) -> Result<()> {
    debug!(dir = %repo_path.display(), "git {}", args.join(" "));
    let status = Command::new("git")
        .current_dir(repo_path)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .status()
        .with_context(|| format!("Failed to execute git command: git {}", args.join(" ")))?;

    if !status.success() {
        anyhow::bail!("Git command failed: git {}", args.join(" "));
    }
    Ok(())
}

/// Trimmed stdout of a successful git command.
fn git_stdout(repo_path: &Path, args: &[&str]) -> Result<String> {
    let output = run_git(repo_path, args)?;
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Check whether `dir` is the top level of a git repository.
pub fn is_repo(dir: &Path) -> bool {
    dir.join(".git").exists()
        && run_git(dir, &["rev-parse", "--is-inside-work-tree"]).is_ok()
}

/// Initialise `dir` as a repository if needed.
fn ensure_initialized(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;
    if !dir.join(".git").exists() {
        run_git(dir, &["init", "--quiet"])?;
    }
    Ok(())
}

/// URL of `remote`, or `None` when the remote is not configured.
pub fn remote_url(dir: &Path, remote: &str) -> Option<String> {
    git_stdout(dir, &["remote", "get-url", remote])
        .ok()
        .filter(|url| !url.is_empty())
}

/// Point the `upstream` remote at `url`, adding it when missing.
fn ensure_remote(dir: &Path, url: &str) -> Result<()> {
    match remote_url(dir, REMOTE) {
        Some(current) if current == url => Ok(()),
        Some(_) => {
            run_git(dir, &["remote", "set-url", REMOTE, url])?;
            Ok(())
        }
        None => {
            run_git(dir, &["remote", "add", REMOTE, url])?;
            Ok(())
        }
    }
}

/// Ensure `dir` tracks `remote_url` and check out the latest `branch` from it.
///
/// The branch is reset to the fetched tip; nothing is ever merged. A dirty working tree that
/// conflicts with the checkout makes the call fail.
pub fn clone_or_pull(dir: &Path, remote_url: &str, branch: &str, progress: bool) -> Result<()> {
    ensure_initialized(dir)?;
    ensure_remote(dir, remote_url)?;

    let mut fetch = vec!["fetch", REMOTE, branch];
    if progress {
        fetch.insert(1, "--progress");
        run_git_streaming(dir, &fetch)?;
    } else {
        fetch.insert(1, "--quiet");
        run_git(dir, &fetch)?;
    }

    run_git(dir, &["checkout", "--quiet", "-B", branch, "FETCH_HEAD"])
        .with_context(|| format!("Failed to check out {branch} in {}", dir.display()))?;
    Ok(())
}

/// Check out `commit` in `dir`, fetching it from `remote_url` when it is not yet present.
pub fn checkout_commit(dir: &Path, remote_url: &str, commit: &str) -> Result<()> {
    ensure_initialized(dir)?;
    ensure_remote(dir, remote_url)?;

    if run_git(dir, &["checkout", "--quiet", commit]).is_ok() {
        return Ok(());
    }

    // Shallow fetch of the exact commit; fall back to a full fetch for servers that refuse
    // unadvertised objects.
    if run_git(dir, &["fetch", "--quiet", "--depth=1", REMOTE, commit]).is_err() {
        run_git(dir, &["fetch", "--quiet", REMOTE])?;
    }
    run_git(dir, &["checkout", "--quiet", commit])
        .with_context(|| format!("Failed to check out {commit} in {}", dir.display()))?;
    Ok(())
}

/// State of a repository's checkout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Head {
    /// URL of the `upstream` remote (falls back to `origin`).
    pub remote_url: String,
    /// Current branch name, `HEAD` when detached.
    pub branch: String,
    /// Full commit sha of `HEAD`.
    pub commit: String,
}

/// Read `(remote_url, branch, HEAD sha)` of the repository at `dir`.
pub fn read_head(dir: &Path) -> Result<Head> {
    let remote_url = remote_url(dir, REMOTE)
        .or_else(|| remote_url(dir, "origin"))
        .with_context(|| format!("No upstream remote configured in {}", dir.display()))?;
    let branch = git_stdout(dir, &["rev-parse", "--abbrev-ref", "HEAD"])?;
    let commit = git_stdout(dir, &["rev-parse", "HEAD"])?;
    Ok(Head {
        remote_url,
        branch,
        commit,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn setup_origin() -> Result<(TempDir, PathBuf, String)> {
        let temp_dir = TempDir::new()?;
        let origin = temp_dir.path().join("origin");
        fs::create_dir_all(&origin)?;

        run_git(&origin, &["init", "-b", "main"])?;
        run_git(&origin, &["config", "user.email", "test@example.com"])?;
        run_git(&origin, &["config", "user.name", "Test User"])?;
        fs::write(origin.join("README.md"), "# Test Repo")?;
        run_git(&origin, &["add", "README.md"])?;
        run_git(&origin, &["commit", "-m", "Initial commit"])?;
        let first = git_stdout(&origin, &["rev-parse", "HEAD"])?;

        Ok((temp_dir, origin, first))
    }

    fn url(path: &Path) -> String {
        path.to_str().unwrap().to_string()
    }

    #[test]
    fn test_clone_or_pull_fresh_directory() -> Result<()> {
        let (temp_dir, origin, first) = setup_origin()?;
        let target = temp_dir.path().join("src").join("repo");

        clone_or_pull(&target, &url(&origin), "main", false)?;

        assert!(is_repo(&target));
        assert!(target.join("README.md").exists());
        let head = read_head(&target)?;
        assert_eq!(head.remote_url, url(&origin));
        assert_eq!(head.branch, "main");
        assert_eq!(head.commit, first);

        Ok(())
    }

    #[test]
    fn test_clone_or_pull_moves_to_new_tip() -> Result<()> {
        let (temp_dir, origin, _) = setup_origin()?;
        let target = temp_dir.path().join("repo");
        clone_or_pull(&target, &url(&origin), "main", false)?;

        fs::write(origin.join("second.txt"), "two")?;
        run_git(&origin, &["add", "second.txt"])?;
        run_git(&origin, &["commit", "-m", "Second commit"])?;
        let second = git_stdout(&origin, &["rev-parse", "HEAD"])?;

        clone_or_pull(&target, &url(&origin), "main", false)?;
        assert_eq!(read_head(&target)?.commit, second);
        assert!(target.join("second.txt").exists());

        Ok(())
    }

    #[test]
    fn test_clone_or_pull_unknown_branch_fails() -> Result<()> {
        let (temp_dir, origin, _) = setup_origin()?;
        let target = temp_dir.path().join("repo");

        let result = clone_or_pull(&target, &url(&origin), "does-not-exist", false);
        assert!(result.is_err());

        Ok(())
    }

    #[test]
    fn test_checkout_commit_into_empty_directory() -> Result<()> {
        let (temp_dir, origin, first) = setup_origin()?;
        fs::write(origin.join("later.txt"), "later")?;
        run_git(&origin, &["add", "later.txt"])?;
        run_git(&origin, &["commit", "-m", "Later commit"])?;

        let target = temp_dir.path().join("pinned");
        fs::create_dir_all(&target)?;
        checkout_commit(&target, &url(&origin), &first)?;

        let head = read_head(&target)?;
        assert_eq!(head.commit, first);
        assert_eq!(head.branch, "HEAD");
        assert!(target.join("README.md").exists());
        assert!(!target.join("later.txt").exists());

        Ok(())
    }

    #[test]
    fn test_checkout_commit_unknown_sha_fails() -> Result<()> {
        let (temp_dir, origin, _) = setup_origin()?;
        let target = temp_dir.path().join("pinned");

        let result = checkout_commit(
            &target,
            &url(&origin),
            "0123456789abcdef0123456789abcdef01234567",
        );
        assert!(result.is_err());

        Ok(())
    }

    #[test]
    fn test_remote_url_replaced_when_different() -> Result<()> {
        let (temp_dir, origin, _) = setup_origin()?;
        let target = temp_dir.path().join("repo");
        ensure_initialized(&target)?;
        run_git(&target, &["remote", "add", REMOTE, "https://example.invalid/old.git"])?;

        clone_or_pull(&target, &url(&origin), "main", false)?;
        assert_eq!(remote_url(&target, REMOTE), Some(url(&origin)));

        Ok(())
    }

    #[test]
    fn test_is_repo() -> Result<()> {
        let (temp_dir, origin, _) = setup_origin()?;
        assert!(is_repo(&origin));
        let plain = temp_dir.path().join("plain");
        fs::create_dir_all(&plain)?;
        assert!(!is_repo(&plain));
        Ok(())
    }
}
