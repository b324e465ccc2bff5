use std::{
    env, fs,
    path::{Path, PathBuf},
};

use tracing::{debug, info, warn};

use crate::{
    docker::ContainerRuntime,
    environment::{self, BuildLock, EnvironmentManager, Execution},
    error::{OebuildError, Result, container_error, vcs_error},
    git, manifest,
    materialize::{self, BuildPaths},
    store::{self, EnvRecordStore},
    template::{self, ComposeOptions, FeatureInfo},
    types::{BuildIn, CompileDescriptor, Manifest, RepoSpec, WorkspaceConfig},
    workspace::{COMPILE_FILE, Workspace},
};

/// Options for [`Oebuild::generate`].
#[derive(Debug, Clone, Default)]
pub struct GenerateOptions {
    /// Platform template to build.
    pub platform: String,
    /// Feature templates, in order.
    pub features: Vec<String>,
    /// Build context name; defaults to the platform.
    pub name: Option<String>,
    /// Execution mode. Composed descriptors default to docker; an installed compile file
    /// keeps its own mode unless this is set.
    pub build_in: Option<BuildIn>,
    /// External GCC toolchain.
    pub toolchain_dir: Option<PathBuf>,
    /// External LLVM toolchain.
    pub llvm_toolchain_dir: Option<PathBuf>,
    /// Nativesdk for host builds.
    pub nativesdk_dir: Option<PathBuf>,
    /// sstate mirror directory.
    pub sstate_mirrors: Option<PathBuf>,
    /// `SSTATE_DIR` override.
    pub sstate_dir: Option<PathBuf>,
    /// `TMPDIR` override.
    pub tmp_dir: Option<PathBuf>,
    /// Disable repository fetching inside the build.
    pub no_fetch: bool,
    /// Leave `bblayers.conf` at its stock content.
    pub no_layer: bool,
    /// Build timestamp.
    pub datetime: Option<String>,
    /// Container image; derived from the recipe tree branch when absent.
    pub docker_image: Option<String>,
    /// Install this descriptor instead of composing templates.
    pub compile_file: Option<PathBuf>,
}

impl GenerateOptions {
    /// Name of the build context these options produce.
    pub fn context_name(&self) -> String {
        if let Some(name) = &self.name {
            return name.clone();
        }
        if self.platform.is_empty()
            && let Some(stem) = self
                .compile_file
                .as_deref()
                .and_then(Path::file_stem)
                .and_then(|s| s.to_str())
        {
            return stem.to_string();
        }
        self.platform.clone()
    }
}

/// A build context and its descriptor.
#[derive(Debug, Clone)]
pub struct BuildContext {
    /// Context name (the directory basename).
    pub name: String,
    /// Context directory.
    pub dir: PathBuf,
    /// Parsed `compile.yaml`.
    pub descriptor: CompileDescriptor,
}

impl BuildContext {
    /// Path of the context's `compile.yaml`.
    pub fn descriptor_path(&self) -> PathBuf {
        self.dir.join(COMPILE_FILE)
    }
}

/// Result of bringing the recipe tree up to date.
#[derive(Debug, Clone)]
pub struct RecipeSync {
    /// Recipe tree directory.
    pub path: PathBuf,
    /// Branch that was checked out.
    pub branch: String,
    /// Where a tree with a stale remote was moved.
    pub backup: Option<PathBuf>,
}

/// A repository that failed to update.
#[derive(Debug, Clone)]
pub struct RepoFailure {
    /// Local name.
    pub name: String,
    /// Failure message.
    pub error: String,
}

/// Outcome of `clear docker`.
#[derive(Debug, Clone, Default)]
pub struct ClearReport {
    /// `(context, container id)` pairs that were removed.
    pub removed: Vec<(String, String)>,
    /// Contexts skipped because a session holds them.
    pub busy: Vec<String>,
    /// Contexts whose container could not be removed.
    pub failures: Vec<RepoFailure>,
}

/// Split `repo:tag`; the tag defaults to `latest`.
pub fn parse_image_reference(reference: &str) -> Result<(String, String)> {
    let reference = reference.trim();
    if reference.is_empty() {
        return Err(OebuildError::config("image", "empty image reference"));
    }
    match reference.rsplit_once(':') {
        Some((repo, tag)) if !tag.contains('/') => {
            if repo.is_empty() || tag.is_empty() {
                return Err(OebuildError::config(
                    "image",
                    format!("malformed image reference '{reference}'"),
                ));
            }
            Ok((repo.to_string(), tag.to_string()))
        }
        _ => Ok((reference.to_string(), "latest".to_string())),
    }
}

/// Top-level workflows over one workspace.
///
/// `Oebuild` wires the template composer, the materializer, the environment manager and the
/// drivers together. It never talks to the user; callers decide how to prompt and report.
pub struct Oebuild {
    /// The workspace operated on.
    workspace: Workspace,
}

impl Oebuild {
    /// Create a workspace at `dir` and return a manager for it.
    pub fn init(dir: &Path, remote_url: Option<&str>, branch: Option<&str>) -> Result<Self> {
        Ok(Self {
            workspace: Workspace::init(dir, remote_url, branch)?,
        })
    }

    /// Manager for the workspace enclosing `start_dir`.
    pub fn discover(start_dir: &Path) -> Result<Self> {
        Ok(Self {
            workspace: Workspace::discover(start_dir)?,
        })
    }

    /// The workspace.
    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    /// Read the workspace config.
    pub fn config(&self) -> Result<WorkspaceConfig> {
        self.workspace.read_config()
    }

    /// Host locations for the build context `name`.
    fn build_paths(&self, name: &str, config: &WorkspaceConfig) -> Result<BuildPaths> {
        Ok(BuildPaths {
            build_dir: self.workspace.build_context(name),
            src_dir: self.workspace.src_dir(),
            recipe_dir: self.workspace.recipe_dir(config)?,
        })
    }

    /// Clone or pull the recipe tree at its configured branch.
    ///
    /// A checkout whose `upstream` remote differs from the configured URL is moved under
    /// `yocto_bak/` first, and a fresh clone takes its place.
    pub fn sync_recipe_tree(&self, progress: bool) -> Result<RecipeSync> {
        let config = self.config()?;
        let recipe = Workspace::recipe_repo(&config)?;
        let path = self.workspace.recipe_dir(&config)?;

        let mut backup = None;
        if path.exists()
            && let Some(current) = git::remote_url(&path, git::REMOTE)
            && current != recipe.remote_url
        {
            let target = self.workspace.backup_path(&recipe.path);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            info!(from = %path.display(), to = %target.display(), "remote changed, backing up recipe tree");
            fs::rename(&path, &target)?;
            backup = Some(target);
        }

        git::clone_or_pull(&path, &recipe.remote_url, &recipe.branch, progress)
            .map_err(|e| vcs_error(&e))?;
        Ok(RecipeSync {
            path,
            branch: recipe.branch.clone(),
            backup,
        })
    }

    /// Image tag mapped to the recipe tree's configured branch.
    pub fn mapped_tag(config: &WorkspaceConfig) -> Result<Option<String>> {
        let branch = &Workspace::recipe_repo(config)?.branch;
        Ok(config.docker.tag_map.get(branch).cloned())
    }

    /// Full image reference for `tag`.
    pub fn image_for_tag(config: &WorkspaceConfig, tag: &str) -> String {
        format!("{}:{tag}", config.docker.repo_url)
    }

    /// Image for the recipe tree's branch, when the tag map has one.
    pub fn default_image(config: &WorkspaceConfig) -> Result<Option<String>> {
        Ok(Self::mapped_tag(config)?.map(|tag| Self::image_for_tag(config, &tag)))
    }

    /// Pull `image` unless it is already present. Returns whether a pull happened.
    pub fn pull_image(&self, runtime: &dyn ContainerRuntime, image: &str) -> Result<bool> {
        if runtime.image_exists(image).map_err(|e| container_error(&e))? {
            debug!(image, "image already present");
            return Ok(false);
        }
        runtime
            .pull_with_progress(image)
            .map_err(|e| container_error(&e))?;
        Ok(true)
    }

    /// Clone or pull `repos` under `src/`. Failures are collected, not fatal.
    pub fn sync_repos(&self, repos: &[RepoSpec], progress: bool) -> Vec<RepoFailure> {
        let src_dir = self.workspace.src_dir();
        let mut failures = Vec::new();
        for repo in repos {
            let dir = src_dir.join(&repo.name);
            if let Err(e) = git::clone_or_pull(&dir, &repo.url, &repo.refspec, progress) {
                warn!(repo = %repo.name, error = %e, "update failed");
                failures.push(RepoFailure {
                    name: repo.name.clone(),
                    error: format!("{e:#}"),
                });
            }
        }
        failures
    }

    /// Clone the repos of `descriptor` that are not yet checked out. Returns their names.
    pub fn fetch_missing_repos(
        &self,
        descriptor: &CompileDescriptor,
        progress: bool,
    ) -> Result<Vec<String>> {
        let src_dir = self.workspace.src_dir();
        let mut fetched = Vec::new();
        for repo in &descriptor.repos {
            let dir = src_dir.join(&repo.name);
            if git::is_repo(&dir) {
                continue;
            }
            git::clone_or_pull(&dir, &repo.url, &repo.refspec, progress)
                .map_err(|e| vcs_error(&e))?;
            fetched.push(repo.name.clone());
        }
        Ok(fetched)
    }

    /// Platforms and features offered by the recipe tree.
    pub fn list_templates(&self) -> Result<(Vec<String>, Vec<FeatureInfo>)> {
        let recipe_dir = self.workspace.recipe_dir(&self.config()?)?;
        Ok((
            template::list_platforms(&recipe_dir)?,
            template::list_features(&recipe_dir)?,
        ))
    }

    /// Whether a build context called `name` already exists.
    pub fn context_exists(&self, name: &str) -> bool {
        self.workspace.build_context(name).exists()
    }

    /// Compose the descriptor `options` describe, without writing anything.
    pub fn compose_descriptor(&self, options: &GenerateOptions) -> Result<CompileDescriptor> {
        let config = self.config()?;
        let paths = self.build_paths(&options.context_name(), &config)?;

        let mut descriptor = match &options.compile_file {
            Some(path) => {
                let mut descriptor: CompileDescriptor = store::read_document(path)?;
                if let Some(build_in) = options.build_in {
                    descriptor.build_in = build_in;
                }
                descriptor
            }
            None => {
                let composition = template::compose(
                    &paths.recipe_dir,
                    &options.platform,
                    &options.features,
                    &ComposeOptions {
                        datetime: options.datetime.clone(),
                        no_fetch: options.no_fetch,
                    },
                )?;
                CompileDescriptor {
                    build_in: options.build_in.unwrap_or_default(),
                    machine: composition.machine,
                    toolchain_type: composition.toolchain_type,
                    toolchain_dir: None,
                    llvm_toolchain_dir: None,
                    nativesdk_dir: None,
                    sstate_mirrors: None,
                    sstate_dir: None,
                    tmp_dir: None,
                    no_layer: None,
                    repos: composition.repos,
                    local_conf: composition.local_conf,
                    layers: composition.layers,
                    docker_param: None,
                    bitbake_cmds: None,
                }
            }
        };

        for (field, dir) in [
            ("toolchain_dir", &options.toolchain_dir),
            ("llvm_toolchain_dir", &options.llvm_toolchain_dir),
            ("sstate_mirrors", &options.sstate_mirrors),
        ] {
            if let Some(dir) = dir
                && !dir.is_dir()
            {
                return Err(OebuildError::config(
                    field,
                    format!("{} is not a directory", dir.display()),
                ));
            }
        }
        descriptor.toolchain_dir = options.toolchain_dir.clone().or(descriptor.toolchain_dir);
        descriptor.llvm_toolchain_dir = options
            .llvm_toolchain_dir
            .clone()
            .or(descriptor.llvm_toolchain_dir);
        descriptor.nativesdk_dir = options.nativesdk_dir.clone().or(descriptor.nativesdk_dir);
        descriptor.sstate_mirrors = options.sstate_mirrors.clone().or(descriptor.sstate_mirrors);
        descriptor.sstate_dir = options.sstate_dir.clone().or(descriptor.sstate_dir);
        descriptor.tmp_dir = options.tmp_dir.clone().or(descriptor.tmp_dir);
        if options.no_layer {
            descriptor.no_layer = Some(true);
        }

        match descriptor.build_in {
            BuildIn::Host => {
                descriptor.docker_param = None;
                if let Some(dir) = &descriptor.nativesdk_dir {
                    materialize::resolve_nativesdk(dir)?;
                }
            }
            BuildIn::Docker => {
                let image = match &options.docker_image {
                    Some(image) => image.clone(),
                    None => match descriptor.docker_param.as_ref().map(|p| p.image.clone()) {
                        Some(image) => image,
                        None => Self::default_image(&config)?.ok_or_else(|| {
                            OebuildError::config(
                                "docker_image",
                                "the recipe tree branch has no image tag; pass --with-docker-image",
                            )
                        })?,
                    },
                };
                descriptor.docker_param =
                    Some(environment::docker_param(&image, &descriptor, &paths));
            }
        }

        descriptor.validate()?;
        Ok(descriptor)
    }

    /// Compose and write `build/<name>/compile.yaml`.
    ///
    /// Composition happens before anything touches the disk, so a rejected template leaves
    /// the workspace unchanged. An existing context keeps its directory but loses `conf/`.
    pub fn generate(&self, options: &GenerateOptions) -> Result<BuildContext> {
        let descriptor = self.compose_descriptor(options)?;
        let name = options.context_name();
        let dir = self.workspace.build_context(&name);

        let conf = dir.join("conf");
        if conf.exists() {
            debug!(dir = %conf.display(), "removing stale configuration");
            fs::remove_dir_all(&conf)?;
        }
        let context = BuildContext {
            name,
            dir,
            descriptor,
        };
        store::write_document(&context.descriptor_path(), &context.descriptor)?;
        info!(context = %context.name, "generated build context");
        Ok(context)
    }

    /// The build context whose directory is `dir`.
    pub fn context_at(&self, dir: &Path) -> Result<BuildContext> {
        let path = dir.join(COMPILE_FILE);
        if !path.is_file() {
            return Err(OebuildError::config(
                COMPILE_FILE,
                format!(
                    "{} is not a build context; run oebuild generate and cd into build/<name>",
                    dir.display()
                ),
            ));
        }
        let descriptor: CompileDescriptor = store::read_document(&path)?;
        descriptor.validate()?;
        let name = dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(BuildContext {
            name,
            dir: dir.to_path_buf(),
            descriptor,
        })
    }

    /// Pin the context's container image and persist the descriptor.
    pub fn set_docker_image(&self, context: &mut BuildContext, image: &str) -> Result<()> {
        let param = context.descriptor.docker_param.as_mut().ok_or_else(|| {
            OebuildError::config("docker_param", "build context is not a docker build")
        })?;
        param.image = image.to_string();
        store::write_document(&context.descriptor_path(), &context.descriptor)
    }

    /// What a `bitbake` invocation runs.
    pub fn execution_for(context: &BuildContext, command: Option<&str>) -> Execution {
        match command {
            Some(command) if !command.trim().is_empty() => {
                Execution::Commands(vec![format!("bitbake {}", command.trim())])
            }
            _ => match &context.descriptor.bitbake_cmds {
                Some(cmds) if !cmds.is_empty() => Execution::Commands(cmds.clone()),
                _ => Execution::Interactive,
            },
        }
    }

    /// Enter the build environment of `context` and run `execution`.
    ///
    /// A non-zero exit from a one-shot command becomes [`OebuildError::CommandExit`].
    pub fn bitbake(
        &self,
        context: &BuildContext,
        runtime: Option<&dyn ContainerRuntime>,
        execution: &Execution,
        home: PathBuf,
    ) -> Result<()> {
        let config = self.config()?;
        let paths = self.build_paths(&context.name, &config)?;
        let paths = BuildPaths {
            build_dir: context.dir.clone(),
            ..paths
        };
        let manager = EnvironmentManager::new(&context.descriptor, &paths, home)
            .with_proxies(environment::host_proxies());
        let code = manager.run(runtime, execution)?;
        match execution {
            Execution::Commands(_) if code != 0 => Err(OebuildError::CommandExit { code }),
            _ => Ok(()),
        }
    }

    /// Snapshot `src/` into `path`.
    pub fn create_manifest(&self, path: &Path) -> Result<Manifest> {
        manifest::create(&self.workspace.src_dir(), path)
    }

    /// Restore `src/` from the manifest at `path`.
    pub fn recover_manifest(
        &self,
        path: &Path,
        on_progress: impl FnMut(&manifest::RestoreProgress),
    ) -> Result<manifest::RestoreReport> {
        let pinned = manifest::read(path)?;
        Ok(manifest::restore(
            &pinned,
            &self.workspace.src_dir(),
            manifest::worker_count(),
            on_progress,
        ))
    }

    /// Stop and remove every recorded container, then drop the records.
    ///
    /// Contexts held by a running session are skipped. Per-context failures are reported
    /// rather than returned.
    pub fn clear_containers(&self, runtime: &dyn ContainerRuntime) -> Result<ClearReport> {
        let mut report = ClearReport::default();
        for name in self.workspace.build_contexts()? {
            let dir = self.workspace.build_context(&name);
            let store = EnvRecordStore::new(&dir);
            if !store.path().exists() {
                continue;
            }
            let Some(_lock) = BuildLock::try_acquire(&dir)? else {
                report.busy.push(name);
                continue;
            };
            let record = match store.read() {
                Ok(record) => record,
                Err(e) => {
                    report.failures.push(RepoFailure {
                        name,
                        error: e.to_string(),
                    });
                    continue;
                }
            };
            let Some(id) = record.short_id().map(str::to_string) else {
                if let Err(e) = store.remove() {
                    report.failures.push(RepoFailure {
                        name,
                        error: e.to_string(),
                    });
                }
                continue;
            };
            let removed = remove_container(runtime, &id)
                .map_err(|e| format!("{e:#}"))
                .and_then(|()| store.remove().map_err(|e| e.to_string()));
            match removed {
                Ok(()) => report.removed.push((name, id)),
                Err(error) => {
                    warn!(context = %name, container = %id, %error, "failed to clear container");
                    report.failures.push(RepoFailure { name, error });
                }
            }
        }
        Ok(report)
    }

    /// Commit the container recorded for `context` as `reference` (`repo:tag`).
    pub fn docker_save(
        &self,
        context: &BuildContext,
        runtime: &dyn ContainerRuntime,
        reference: &str,
    ) -> Result<String> {
        let (repo, tag) = parse_image_reference(reference)?;
        let record = EnvRecordStore::new(&context.dir).read()?;
        let id = record.short_id().ok_or_else(|| {
            OebuildError::ContainerError(format!(
                "no container recorded for build context '{}'",
                context.name
            ))
        })?;
        runtime
            .commit(id, &repo, &tag)
            .map_err(|e| container_error(&e))?;
        Ok(format!("{repo}:{tag}"))
    }
}

/// Stop (when running) and force-remove a container; a vanished container counts as removed.
fn remove_container(runtime: &dyn ContainerRuntime, id: &str) -> anyhow::Result<()> {
    if !runtime.exists(id)? {
        return Ok(());
    }
    if runtime.is_running(id)? {
        runtime.stop(id)?;
    }
    runtime.remove(id, true)
}

/// `HOME` of the invoking user.
pub fn home_dir() -> Result<PathBuf> {
    env::var_os("HOME")
        .filter(|h| !h.is_empty())
        .map(PathBuf::from)
        .ok_or_else(|| OebuildError::config("HOME", "environment variable is not set"))
}
