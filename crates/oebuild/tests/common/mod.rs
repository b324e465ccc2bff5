#![allow(dead_code)]

use std::{
    fs,
    path::{Path, PathBuf},
    process::{Command, Output},
};

use anyhow::{Context, Result, bail};
use tempfile::TempDir;

/// Path of the compiled oebuild binary.
pub fn oebuild_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_oebuild"))
}

/// Run oebuild in `cwd` without prompts or colors.
pub fn run_oebuild(cwd: &Path, args: &[&str]) -> Result<Output> {
    Command::new(oebuild_binary())
        .current_dir(cwd)
        .args(["--no-prompt", "--no-color"])
        .args(args)
        .env_remove("OEBUILD_LOG")
        .output()
        .context("Failed to run oebuild")
}

/// Run a git command, failing on a non-zero exit.
pub fn git(dir: &Path, args: &[&str]) -> Result<String> {
    let output = Command::new("git").current_dir(dir).args(args).output()?;
    if !output.status.success() {
        bail!(
            "git {:?} failed: {}",
            args,
            String::from_utf8_lossy(&output.stderr)
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Create a repository at `path` with one commit.
pub fn create_repo(path: &Path) -> Result<()> {
    fs::create_dir_all(path)?;
    git(path, &["init", "-b", "main"])?;
    git(path, &["config", "user.email", "test@example.com"])?;
    git(path, &["config", "user.name", "Test User"])?;
    fs::write(path.join("README.md"), "# Test Repo\n")?;
    git(path, &["add", "."])?;
    git(path, &["commit", "-m", "Initial commit"])?;
    Ok(())
}

/// Initialize a workspace through the binary and seed its recipe tree with templates.
///
/// Returns the temp dir and the workspace root.
pub fn create_workspace() -> Result<(TempDir, PathBuf)> {
    let temp_dir = TempDir::new()?;
    let output = run_oebuild(temp_dir.path(), &["init", "ws"])?;
    if !output.status.success() {
        bail!(
            "oebuild init failed: {}",
            String::from_utf8_lossy(&output.stderr)
        );
    }
    let root = temp_dir.path().join("ws");
    let tree = root.join("src").join("yocto-meta-openeuler").join(".oebuild");
    fs::create_dir_all(tree.join("platform"))?;
    fs::create_dir_all(tree.join("features"))?;
    fs::write(
        tree.join("common.yaml"),
        "type: common\nlocal_conf: |\n  COMMON = \"1\"\n",
    )?;
    fs::write(
        tree.join("platform").join("qemu-aarch64.yaml"),
        "type: platform\nmachine: qemu-aarch64\ntoolchain_type: EXTERNAL_TOOLCHAIN_aarch64\n",
    )?;
    fs::write(
        tree.join("features").join("arm-only.yaml"),
        "type: feature\nsupport: aarch64-std\n",
    )?;
    fs::write(
        tree.join("features").join("debug.yaml"),
        "type: feature\nlocal_conf: |\n  DEBUG_BUILD = \"1\"\n",
    )?;
    Ok((temp_dir, root))
}
