use std::{
    env,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use liboebuild::docker::{ContainerRuntime, DockerCli};

/// Expand a leading `~` in a filesystem path using the `HOME` environment variable.
pub fn expand_tilde(path: &Path) -> PathBuf {
    if let Ok(rest) = path.strip_prefix("~")
        && let Ok(home) = env::var("HOME")
    {
        return PathBuf::from(home).join(rest);
    }
    path.to_path_buf()
}

/// Resolve a user-supplied path against the current directory.
pub fn absolute(path: &Path) -> Result<PathBuf> {
    let path = expand_tilde(path);
    if path.is_absolute() {
        return Ok(path);
    }
    let cwd = env::current_dir().context("Failed to get current directory")?;
    Ok(cwd.join(path))
}

/// Resolve an optional user-supplied path.
pub fn absolute_opt(path: Option<&Path>) -> Result<Option<PathBuf>> {
    path.map(absolute).transpose()
}

/// Locate the docker CLI.
pub fn docker() -> Result<Box<dyn ContainerRuntime>> {
    Ok(Box::new(DockerCli::locate()?))
}
