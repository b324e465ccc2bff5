//! Binds a compile descriptor to a host shell or a container session.
//!
//! A session walks through the same states in order: the configuration is materialized, the
//! execution environment is provisioned, the shell init file is spliced, the shell runs, and
//! the init file is restored. Restoration is tied to guards, so it happens on every exit path.

use std::{
    env, fmt,
    fs::{self, OpenOptions},
    io::{self, IsTerminal, Write},
    path::{Path, PathBuf},
    process::{self, Command},
};

use fs4::FileExt;
use nix::unistd::{getgid, getuid};
use tracing::{debug, info, warn};

use crate::{
    docker::{self, ContainerRuntime},
    error::{OebuildError, Result, container_error},
    materialize::{self, BuildPaths, NativeSdk},
    splice::{self, SpliceGuard},
    store::EnvRecordStore,
    types::{BuildIn, CompileDescriptor, DockerParam},
};

/// Source tree inside the container.
pub const CONTAINER_SRC_DIR: &str = "/usr1/openeuler/src";
/// Parent of build contexts inside the container.
pub const CONTAINER_BUILD_ROOT: &str = "/home/openeuler/build";
/// Non-root build user inside the container.
pub const CONTAINER_USER: &str = "openeuler";
/// Home directory of [`CONTAINER_USER`].
pub const CONTAINER_HOME: &str = "/home/openeuler";
/// Parent of mounted GCC toolchains inside the container.
pub const CONTAINER_GCC_ROOT: &str = "/usr1/openeuler/gcc";
/// Mounted LLVM toolchain inside the container.
pub const CONTAINER_LLVM_DIR: &str = "/usr1/openeuler/llvm";
/// Mounted sstate mirror inside the container.
pub const CONTAINER_SSTATE_DIR: &str = "/usr1/openeuler/sstate-cache";
/// Runtime parameters used when none are configured.
pub const DEFAULT_PARAMETERS: &str = "-itd --network host";
/// Container main command used when none is configured.
pub const DEFAULT_COMMAND: &str = "bash";
/// Build engine init script, relative to the source tree.
pub const OE_INIT_SCRIPT: &str = "yocto-poky/oe-init-build-env";
/// Script written into host build contexts.
pub const BUILD_SCRIPT: &str = "build.sh";
/// Lock file guarding a build context.
const LOCK_FILE: &str = ".env.lock";
/// Staging directory for the container's init file.
const RC_STAGING_DIR: &str = ".oebuild-rc";
/// Proxy variables forwarded into containers.
const PROXY_VARS: &[&str] = &["http_proxy", "https_proxy"];

/// Assemble the container coordinates for a build context.
pub fn docker_param(image: &str, descriptor: &CompileDescriptor, paths: &BuildPaths) -> DockerParam {
    let mut volumes = vec![
        format!("{}:{CONTAINER_SRC_DIR}", paths.src_dir.display()),
        format!(
            "{}:{}",
            paths.build_dir.display(),
            container_build_dir(&paths.build_dir)
        ),
    ];
    if let Some(dir) = &descriptor.toolchain_dir {
        let name = dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        volumes.push(format!("{}:{CONTAINER_GCC_ROOT}/{name}", dir.display()));
    }
    if let Some(dir) = &descriptor.llvm_toolchain_dir {
        volumes.push(format!("{}:{CONTAINER_LLVM_DIR}", dir.display()));
    }
    if let Some(dir) = &descriptor.sstate_mirrors {
        volumes.push(format!("{}:{CONTAINER_SSTATE_DIR}", dir.display()));
    }
    DockerParam {
        image: image.to_string(),
        parameters: DEFAULT_PARAMETERS.to_string(),
        volumes,
        command: DEFAULT_COMMAND.to_string(),
    }
}

/// Path of a build context inside the container; the basename is kept.
pub fn container_build_dir(build_dir: &Path) -> String {
    let name = build_dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    format!("{CONTAINER_BUILD_ROOT}/{name}")
}

/// Lines forwarding `(name, value)` proxy settings into a container shell.
pub fn proxy_lines(proxies: &[(String, String)]) -> Vec<String> {
    let mut lines = Vec::new();
    for (name, value) in proxies {
        lines.push(format!("export {name}={value}"));
        let git_key = if name.starts_with("https") {
            "https.proxy"
        } else {
            "http.proxy"
        };
        lines.push(format!("git config --global {git_key} {value}"));
    }
    lines
}

/// Proxy settings present in the process environment.
pub fn host_proxies() -> Vec<(String, String)> {
    PROXY_VARS
        .iter()
        .filter_map(|name| {
            env::var(name)
                .ok()
                .filter(|v| !v.is_empty())
                .map(|v| ((*name).to_string(), v))
        })
        .collect()
}

/// Lines greeting the user of an interactive session.
pub fn banner_lines(name: &str, machine: &str) -> Vec<String> {
    vec![
        "echo \"\"".to_string(),
        format!("echo \"oebuild build context '{name}' (MACHINE={machine})\""),
        "echo \"build the image with: bitbake openeuler-image\"".to_string(),
        "echo \"\"".to_string(),
    ]
}

/// What a session runs once the environment is ready.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Execution {
    /// Attach an interactive shell.
    Interactive,
    /// Run commands in order, stopping at the first failure, then exit.
    Commands(Vec<String>),
}

impl Execution {
    /// Lines placed after the activation lines.
    fn tail_lines(&self, name: &str, machine: &str) -> Vec<String> {
        match self {
            Self::Interactive => banner_lines(name, machine),
            Self::Commands(commands) => {
                vec![commands.join(" && "), "exit $?".to_string()]
            }
        }
    }
}

/// Session states, in the order they are entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Configuration materialized.
    Prepared,
    /// Container running or host script written.
    Provisioned,
    /// Init file carries the managed lines.
    Spliced,
    /// Shell running.
    Executing,
    /// Init file restored.
    Restored,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Prepared => "prepared",
            Self::Provisioned => "provisioned",
            Self::Spliced => "spliced",
            Self::Executing => "executing",
            Self::Restored => "restored",
        };
        f.write_str(s)
    }
}

/// Exclusive hold on a build context for the duration of a session.
#[derive(Debug)]
pub struct BuildLock {
    /// The locked file.
    file: fs::File,
}

impl BuildLock {
    /// Block until the build context at `build_dir` is free, then take it.
    pub fn acquire(build_dir: &Path) -> Result<Self> {
        let file = Self::open(build_dir)?;
        file.lock_exclusive()?;
        Self::stamp(&file)?;
        Ok(Self { file })
    }

    /// Take the build context if no other process holds it.
    pub fn try_acquire(build_dir: &Path) -> Result<Option<Self>> {
        let file = Self::open(build_dir)?;
        if file.try_lock_exclusive().is_err() {
            return Ok(None);
        }
        Self::stamp(&file)?;
        Ok(Some(Self { file }))
    }

    /// Open (creating) the lock file.
    fn open(build_dir: &Path) -> Result<fs::File> {
        fs::create_dir_all(build_dir)?;
        Ok(OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(build_dir.join(LOCK_FILE))?)
    }

    /// Record the holder's pid.
    fn stamp(mut file: &fs::File) -> Result<()> {
        file.set_len(0)?;
        writeln!(file, "{}", process::id())?;
        Ok(())
    }
}

impl Drop for BuildLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            warn!(error = %e, "failed to release build context lock");
        }
    }
}

/// Restores the build user's init file inside a container when dropped.
struct ContainerRcGuard<'a> {
    /// Runtime holding the container.
    runtime: &'a dyn ContainerRuntime,
    /// Container short id.
    id: String,
    /// Host staging directory.
    staging: PathBuf,
}

impl ContainerRcGuard<'_> {
    /// Path of the init file inside the container.
    fn rc_path() -> String {
        format!("{CONTAINER_HOME}/.bashrc")
    }

    /// Copy the init file out, apply `edit`, and copy it back in.
    fn rewrite(&self, edit: impl FnOnce(&Path) -> Result<()>) -> Result<()> {
        fs::create_dir_all(&self.staging)?;
        let local = self.staging.join(".bashrc");
        if let Err(e) = self.runtime.copy_out(&self.id, &Self::rc_path(), &self.staging) {
            debug!(error = %e, "no init file in container, starting from empty");
            fs::write(&local, "")?;
        }
        edit(&local)?;
        self.runtime
            .copy_in(&self.id, &local, CONTAINER_HOME)
            .map_err(|e| container_error(&e))?;
        Ok(())
    }
}

impl Drop for ContainerRcGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.rewrite(splice::restore_file) {
            warn!(container = %self.id, error = %e, "failed to restore container init file");
        }
        if let Err(e) = fs::remove_dir_all(&self.staging) {
            debug!(error = %e, "failed to remove staging directory");
        }
    }
}

/// Drives one session for a build context.
pub struct EnvironmentManager<'a> {
    /// The descriptor being built.
    descriptor: &'a CompileDescriptor,
    /// Host locations of the build context.
    paths: &'a BuildPaths,
    /// Build context name.
    name: String,
    /// Home directory holding the host `~/.bashrc`.
    home: PathBuf,
    /// Proxy settings forwarded into containers.
    proxies: Vec<(String, String)>,
    /// Host shell invocation.
    shell: Vec<String>,
    /// Whether stdin is a terminal; one-shot container commands get a pseudo-terminal only then.
    terminal: bool,
}

impl<'a> EnvironmentManager<'a> {
    /// Create a manager for the build context at `paths.build_dir`.
    pub fn new(descriptor: &'a CompileDescriptor, paths: &'a BuildPaths, home: PathBuf) -> Self {
        let name = paths
            .build_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self {
            descriptor,
            paths,
            name,
            home,
            proxies: Vec::new(),
            shell: vec!["bash".to_string(), "-i".to_string()],
            terminal: io::stdin().is_terminal(),
        }
    }

    /// Forward these proxy settings into container sessions.
    pub fn with_proxies(mut self, proxies: Vec<(String, String)>) -> Self {
        self.proxies = proxies;
        self
    }

    /// Replace the host shell invocation.
    pub fn with_shell(mut self, shell: Vec<String>) -> Self {
        self.shell = shell;
        self
    }

    /// Override terminal detection.
    pub fn with_terminal(mut self, terminal: bool) -> Self {
        self.terminal = terminal;
        self
    }

    /// Whether the container shell gets a pseudo-terminal.
    fn wants_tty(&self, execution: &Execution) -> bool {
        match execution {
            Execution::Interactive => true,
            Execution::Commands(_) => self.terminal,
        }
    }

    /// Log a state transition.
    fn enter(&self, state: SessionState) {
        debug!(context = %self.name, %state, "session state");
    }

    /// Run a session in the mode the descriptor selects. Returns the shell's exit code.
    pub fn run(&self, runtime: Option<&dyn ContainerRuntime>, execution: &Execution) -> Result<i32> {
        let _lock = BuildLock::acquire(&self.paths.build_dir)?;
        match self.descriptor.build_in {
            BuildIn::Host => self.run_host(execution),
            BuildIn::Docker => {
                let runtime = runtime.ok_or_else(|| {
                    OebuildError::ContainerError("no container runtime available".to_string())
                })?;
                self.run_container(runtime, execution)
            }
        }
    }

    /// Activation script for host builds.
    pub fn build_script(&self, nativesdk: Option<&NativeSdk>) -> String {
        let mut script = String::from("#!/bin/bash\n");
        if let Some(sdk) = nativesdk {
            script.push_str(&format!(". {}\n", sdk.setup_file.display()));
        }
        script.push_str(&format!(
            ". {} {}\n",
            self.paths.src_dir.join(OE_INIT_SCRIPT).display(),
            self.paths.build_dir.display()
        ));
        script
    }

    /// Managed lines for the host `~/.bashrc`.
    pub fn host_rc_lines(&self, execution: &Execution) -> Vec<String> {
        let mut lines = vec![
            format!(". {}", self.paths.build_dir.join(BUILD_SCRIPT).display()),
            splice::self_clean_line(),
        ];
        lines.extend(execution.tail_lines(&self.name, &self.descriptor.machine));
        lines
    }

    /// Managed lines for the container user's `~/.bashrc`.
    pub fn container_rc_lines(&self, execution: &Execution) -> Vec<String> {
        let mut lines = proxy_lines(&self.proxies);
        lines.push(format!(
            ". {CONTAINER_SRC_DIR}/{OE_INIT_SCRIPT} {}",
            container_build_dir(&self.paths.build_dir)
        ));
        lines.push(splice::self_clean_line());
        lines.extend(execution.tail_lines(&self.name, &self.descriptor.machine));
        lines
    }

    /// Host session: write `build.sh`, splice `~/.bashrc`, run the shell.
    pub fn run_host(&self, execution: &Execution) -> Result<i32> {
        let nativesdk = materialize::materialize(self.descriptor, self.paths)?;
        self.enter(SessionState::Prepared);

        let script = self.paths.build_dir.join(BUILD_SCRIPT);
        fs::write(&script, self.build_script(nativesdk.as_ref()))?;
        self.enter(SessionState::Provisioned);

        let code = {
            let _guard = SpliceGuard::splice(&self.home.join(".bashrc"), &self.host_rc_lines(execution))?;
            self.enter(SessionState::Spliced);

            let (program, args) = self
                .shell
                .split_first()
                .ok_or_else(|| OebuildError::config("shell", "empty shell command"))?;
            self.enter(SessionState::Executing);
            let status = Command::new(program)
                .args(args)
                .current_dir(&self.paths.build_dir)
                .status()?;
            status.code().unwrap_or(-1)
        };
        self.enter(SessionState::Restored);
        Ok(code)
    }

    /// Container session: provision, reconcile ids, splice the user's `~/.bashrc`, attach.
    pub fn run_container(&self, runtime: &dyn ContainerRuntime, execution: &Execution) -> Result<i32> {
        let param = self.descriptor.require_docker()?;
        materialize::materialize(self.descriptor, self.paths)?;
        self.enter(SessionState::Prepared);

        let store = EnvRecordStore::new(&self.paths.build_dir);
        let provisioned = docker::ensure_running(runtime, &store, param)?;
        docker::reconcile_ids(
            runtime,
            &provisioned.short_id,
            CONTAINER_USER,
            getuid().as_raw(),
            getgid().as_raw(),
        )?;
        info!(container = %provisioned.short_id, created = provisioned.created, "container ready");
        self.enter(SessionState::Provisioned);

        let code = {
            let guard = ContainerRcGuard {
                runtime,
                id: provisioned.short_id.clone(),
                staging: self.paths.build_dir.join(RC_STAGING_DIR),
            };
            let lines = self.container_rc_lines(execution);
            guard.rewrite(|rc| splice::splice_file(rc, &lines))?;
            self.enter(SessionState::Spliced);

            self.enter(SessionState::Executing);
            let workdir = container_build_dir(&self.paths.build_dir);
            runtime
                .exec_interactive(
                    &provisioned.short_id,
                    &["bash", "-i"],
                    CONTAINER_USER,
                    Some(&workdir),
                    self.wants_tty(execution),
                )
                .map_err(|e| container_error(&e))?
        };
        self.enter(SessionState::Restored);
        Ok(code)
    }
}
