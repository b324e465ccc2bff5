use std::{
    fs,
    path::{Path, PathBuf},
};

use chrono::Local;
use tracing::{debug, info};

use crate::{
    error::{OebuildError, Result},
    store,
    types::{BasicRepo, WorkspaceConfig},
};

/// Directory whose presence marks a workspace root.
pub const SENTINEL_DIR: &str = ".oebuild";

/// Name of the workspace config document inside the sentinel directory.
pub const CONFIG_FILE: &str = "config";

/// Name of the compile descriptor inside a build context.
pub const COMPILE_FILE: &str = "compile.yaml";

/// Key of the recipe tree within `basic_repo`.
pub const RECIPE_TREE_KEY: &str = "yocto_meta_openeuler";

/// Packaged default workspace config.
const DEFAULT_CONFIG: &str = include_str!("default_config.yaml");

/// Walk up from `start_dir` until a directory holding `SENTINEL_DIR/CONFIG_FILE` is found.
///
/// The recipe tree keeps its templates in a directory also named [`SENTINEL_DIR`], so the
/// config file, not the directory, marks a root.
pub fn find_root(start_dir: &Path) -> Option<PathBuf> {
    let mut current = start_dir;
    loop {
        if current.join(SENTINEL_DIR).join(CONFIG_FILE).is_file() {
            return Some(current.to_path_buf());
        }
        match current.parent() {
            Some(parent) => current = parent,
            None => return None,
        }
    }
}

/// Parse the packaged default workspace config.
pub fn default_config() -> Result<WorkspaceConfig> {
    serde_yaml::from_str(DEFAULT_CONFIG).map_err(|e| OebuildError::DocumentError {
        path: PathBuf::from(CONFIG_FILE),
        message: e.to_string(),
    })
}

/// A recognized oebuild workspace.
#[derive(Debug, Clone)]
pub struct Workspace {
    /// Directory holding the sentinel.
    root: PathBuf,
}

impl Workspace {
    /// Locate the workspace enclosing `start_dir`.
    pub fn discover(start_dir: &Path) -> Result<Self> {
        let root = find_root(start_dir).ok_or_else(|| OebuildError::WorkspaceNotFound {
            start: start_dir.to_path_buf(),
            sentinel: SENTINEL_DIR,
        })?;
        debug!(root = %root.display(), "found workspace");
        Ok(Self { root })
    }

    /// Create a new workspace at `dir`, which must not exist yet.
    ///
    /// The packaged default config is written with the recipe tree's URL and branch replaced
    /// by the given overrides.
    pub fn init(dir: &Path, remote_url: Option<&str>, branch: Option<&str>) -> Result<Self> {
        if dir.exists() {
            return Err(OebuildError::config(
                "directory",
                format!("{} already exists", dir.display()),
            ));
        }

        let mut config = default_config()?;
        if let Some(recipe) = config.basic_repo.get_mut(RECIPE_TREE_KEY) {
            if let Some(url) = remote_url {
                recipe.remote_url = url.to_string();
            }
            if let Some(branch) = branch {
                recipe.branch = branch.to_string();
            }
        }

        fs::create_dir_all(dir.join("src"))?;
        fs::create_dir_all(dir.join(SENTINEL_DIR))?;
        let workspace = Self {
            root: fs::canonicalize(dir).unwrap_or_else(|_| dir.to_path_buf()),
        };
        workspace.write_config(&config)?;
        info!(root = %workspace.root.display(), "initialized workspace");
        Ok(workspace)
    }

    /// Open a workspace rooted at `root` without searching.
    pub fn at(root: PathBuf) -> Self {
        Self { root }
    }

    /// Workspace root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory of checked-out repositories.
    pub fn src_dir(&self) -> PathBuf {
        self.root.join("src")
    }

    /// Directory of build contexts.
    pub fn build_dir(&self) -> PathBuf {
        self.root.join("build")
    }

    /// Directory of the named build context.
    pub fn build_context(&self, name: &str) -> PathBuf {
        self.build_dir().join(name)
    }

    /// Path of the workspace config document.
    pub fn config_path(&self) -> PathBuf {
        self.root.join(SENTINEL_DIR).join(CONFIG_FILE)
    }

    /// Read the workspace config.
    pub fn read_config(&self) -> Result<WorkspaceConfig> {
        store::read_document(&self.config_path())
    }

    /// Replace the workspace config.
    pub fn write_config(&self, config: &WorkspaceConfig) -> Result<()> {
        store::write_document(&self.config_path(), config)
    }

    /// The authoritative recipe tree from `config`.
    pub fn recipe_repo(config: &WorkspaceConfig) -> Result<&BasicRepo> {
        config
            .basic_repo
            .get(RECIPE_TREE_KEY)
            .or_else(|| config.basic_repo.values().next())
            .ok_or_else(|| OebuildError::config("basic_repo", "no recipe tree configured"))
    }

    /// Host directory of the recipe tree.
    pub fn recipe_dir(&self, config: &WorkspaceConfig) -> Result<PathBuf> {
        Ok(self.src_dir().join(&Self::recipe_repo(config)?.path))
    }

    /// Fresh backup location for a displaced repository directory named `name`.
    pub fn backup_path(&self, name: &str) -> PathBuf {
        let stamp = Local::now().format("%Y%m%d%H%M%S");
        self.root.join("yocto_bak").join(format!("{name}_{stamp}"))
    }

    /// Names of all build contexts, sorted.
    pub fn build_contexts(&self) -> Result<Vec<String>> {
        let build_dir = self.build_dir();
        if !build_dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut names = Vec::new();
        for entry in fs::read_dir(&build_dir)? {
            let entry = entry?;
            if entry.file_type()?.is_dir()
                && let Some(name) = entry.file_name().to_str()
            {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }
}
