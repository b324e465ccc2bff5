use std::{
    fs,
    io::{Cursor, Write},
    path::{Path, PathBuf},
    process::{Command, Output, Stdio},
};

use anyhow::{Context, Result as AnyResult};
use tracing::{debug, info, warn};
use which::which;

use crate::{
    error::{OebuildError, Result, container_error},
    store::EnvRecordStore,
    types::{ContainerRecord, DockerParam, EnvRecord},
};

/// Length of the short container id recorded in environment records.
const SHORT_ID_LEN: usize = 12;

/// Result of a captured exec. Stdout and stderr are kept apart.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecResult {
    /// Exit code of the command, `-1` when killed by a signal.
    pub exit_code: i32,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl ExecResult {
    /// Whether the command exited with status 0.
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// The command's standard output.
    pub fn output(&self) -> &str {
        &self.stdout
    }
}

/// The container operations oebuild relies on.
pub trait ContainerRuntime {
    /// Whether `image` is present locally.
    fn image_exists(&self, image: &str) -> AnyResult<bool>;
    /// Pull `image`, streaming the runtime's progress lines to stdout.
    fn pull_with_progress(&self, image: &str) -> AnyResult<()>;
    /// Create a container and return its short id.
    fn create(
        &self,
        image: &str,
        parameters: &str,
        volumes: &[String],
        command: &str,
    ) -> AnyResult<String>;
    /// Start a container.
    fn start(&self, id: &str) -> AnyResult<()>;
    /// Stop a container.
    fn stop(&self, id: &str) -> AnyResult<()>;
    /// Remove a container.
    fn remove(&self, id: &str, force: bool) -> AnyResult<()>;
    /// Whether a container with this id exists, running or not.
    fn exists(&self, id: &str) -> AnyResult<bool>;
    /// Whether the container is running.
    fn is_running(&self, id: &str) -> AnyResult<bool>;
    /// Run `argv` in the container and capture its output.
    fn exec(
        &self,
        id: &str,
        argv: &[&str],
        user: &str,
        workdir: Option<&str>,
    ) -> AnyResult<ExecResult>;
    /// Run `argv` attached to the caller's stdio and return its exit code. A pseudo-terminal
    /// is allocated only when `tty` is set.
    fn exec_interactive(
        &self,
        id: &str,
        argv: &[&str],
        user: &str,
        workdir: Option<&str>,
        tty: bool,
    ) -> AnyResult<i32>;
    /// Image the container was created from.
    fn image_of(&self, id: &str) -> AnyResult<String>;
    /// Copy the host file or directory `src` into the container directory `dst`.
    fn copy_in(&self, id: &str, src: &Path, dst: &str) -> AnyResult<()>;
    /// Copy the container path `src` into the host directory `dst_dir`.
    fn copy_out(&self, id: &str, src: &str, dst_dir: &Path) -> AnyResult<()>;
    /// Commit the container to `repo:tag`.
    fn commit(&self, id: &str, repo: &str, tag: &str) -> AnyResult<()>;
}

/// [`ContainerRuntime`] backed by the `docker` command line client.
#[derive(Debug, Clone)]
pub struct DockerCli {
    /// Path of the docker binary.
    binary: PathBuf,
}

impl DockerCli {
    /// Locate `docker` on `PATH`.
    pub fn locate() -> Result<Self> {
        let binary = which("docker").map_err(|_| {
            OebuildError::ContainerError(
                "docker is required but was not found in PATH".to_string(),
            )
        })?;
        Ok(Self { binary })
    }

    /// Run docker with `args`, failing on a non-zero exit.
    fn run(&self, args: &[&str]) -> AnyResult<Output> {
        debug!("docker {}", args.join(" "));
        let output = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .with_context(|| format!("Failed to execute docker {}", args.join(" ")))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!(
                "docker command failed: docker {}\nError: {}",
                args.join(" "),
                stderr.trim()
            );
        }
        Ok(output)
    }

    /// Whether docker with `args` exits successfully, discarding its output.
    fn succeeds(&self, args: &[&str]) -> AnyResult<bool> {
        let status = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .with_context(|| format!("Failed to execute docker {}", args.join(" ")))?;
        Ok(status.success())
    }

    /// Arguments shared by captured and interactive exec.
    fn exec_args<'a>(
        flags: &'a str,
        id: &'a str,
        argv: &[&'a str],
        user: &'a str,
        workdir: Option<&'a str>,
    ) -> Vec<&'a str> {
        let mut args = vec!["exec"];
        if !flags.is_empty() {
            args.push(flags);
        }
        args.extend(["-u", user]);
        if let Some(dir) = workdir {
            args.extend(["-w", dir]);
        }
        args.push(id);
        args.extend_from_slice(argv);
        args
    }
}

impl ContainerRuntime for DockerCli {
    fn image_exists(&self, image: &str) -> AnyResult<bool> {
        self.succeeds(&["image", "inspect", image])
    }

    fn pull_with_progress(&self, image: &str) -> AnyResult<()> {
        info!(image, "pulling image");
        let status = Command::new(&self.binary)
            .args(["pull", image])
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .status()
            .with_context(|| format!("Failed to execute docker pull {image}"))?;
        if !status.success() {
            anyhow::bail!("docker pull {image} failed");
        }
        Ok(())
    }

    fn create(
        &self,
        image: &str,
        parameters: &str,
        volumes: &[String],
        command: &str,
    ) -> AnyResult<String> {
        let params = normalize_parameters(parameters);
        let mut args: Vec<&str> = vec!["create"];
        args.extend(params.iter().map(String::as_str));
        for volume in volumes {
            args.extend(["-v", volume.as_str()]);
        }
        args.push(image);
        args.extend(command.split_whitespace());

        let output = self.run(&args)?;
        let id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if id.is_empty() {
            anyhow::bail!("docker create returned no container id");
        }
        Ok(short_id(&id))
    }

    fn start(&self, id: &str) -> AnyResult<()> {
        self.run(&["start", id])?;
        Ok(())
    }

    fn stop(&self, id: &str) -> AnyResult<()> {
        self.run(&["stop", id])?;
        Ok(())
    }

    fn remove(&self, id: &str, force: bool) -> AnyResult<()> {
        if force {
            self.run(&["rm", "-f", id])?;
        } else {
            self.run(&["rm", id])?;
        }
        Ok(())
    }

    fn exists(&self, id: &str) -> AnyResult<bool> {
        self.succeeds(&["container", "inspect", id])
    }

    fn is_running(&self, id: &str) -> AnyResult<bool> {
        let output = self.run(&["container", "inspect", "-f", "{{.State.Running}}", id])?;
        Ok(String::from_utf8_lossy(&output.stdout).trim() == "true")
    }

    fn exec(
        &self,
        id: &str,
        argv: &[&str],
        user: &str,
        workdir: Option<&str>,
    ) -> AnyResult<ExecResult> {
        let args = Self::exec_args("", id, argv, user, workdir);
        debug!("docker {}", args.join(" "));
        let output = Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::null())
            .output()
            .with_context(|| format!("Failed to execute docker {}", args.join(" ")))?;
        Ok(ExecResult {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    fn exec_interactive(
        &self,
        id: &str,
        argv: &[&str],
        user: &str,
        workdir: Option<&str>,
        tty: bool,
    ) -> AnyResult<i32> {
        let mode = if tty { "-it" } else { "-i" };
        let args = Self::exec_args(mode, id, argv, user, workdir);
        debug!("docker {}", args.join(" "));
        let status = Command::new(&self.binary)
            .args(&args)
            .status()
            .with_context(|| format!("Failed to execute docker {}", args.join(" ")))?;
        Ok(status.code().unwrap_or(-1))
    }

    fn image_of(&self, id: &str) -> AnyResult<String> {
        let output = self.run(&["container", "inspect", "-f", "{{.Config.Image}}", id])?;
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    fn copy_in(&self, id: &str, src: &Path, dst: &str) -> AnyResult<()> {
        let archive = tar_path(src)?;
        let target = format!("{id}:{dst}");
        debug!(src = %src.display(), target, "docker cp -");
        let mut child = Command::new(&self.binary)
            .args(["cp", "-", target.as_str()])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .context("Failed to execute docker cp")?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(&archive)
                .context("Failed to stream archive to docker cp")?;
        }
        let output = child.wait_with_output().context("docker cp did not finish")?;
        if !output.status.success() {
            anyhow::bail!(
                "docker cp into {target} failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }

    fn copy_out(&self, id: &str, src: &str, dst_dir: &Path) -> AnyResult<()> {
        let source = format!("{id}:{src}");
        let output = self.run(&["cp", &source, "-"])?;
        fs::create_dir_all(dst_dir)
            .with_context(|| format!("Failed to create {}", dst_dir.display()))?;
        tar::Archive::new(Cursor::new(output.stdout))
            .unpack(dst_dir)
            .with_context(|| format!("Failed to unpack {source} into {}", dst_dir.display()))?;
        Ok(())
    }

    fn commit(&self, id: &str, repo: &str, tag: &str) -> AnyResult<()> {
        let reference = format!("{repo}:{tag}");
        self.run(&["commit", id, &reference])?;
        Ok(())
    }
}

/// Truncate a container id to its short form.
fn short_id(id: &str) -> String {
    id.chars().take(SHORT_ID_LEN).collect()
}

/// Split runtime parameters and drop the detach flag, which `create` does not accept.
pub fn normalize_parameters(parameters: &str) -> Vec<String> {
    let mut out = Vec::new();
    for token in parameters.split_whitespace() {
        if token == "-d" || token == "--detach" {
            continue;
        }
        if let Some(cluster) = token.strip_prefix('-')
            && !cluster.starts_with('-')
            && cluster.len() > 1
            && cluster.chars().all(|c| c.is_ascii_alphabetic())
        {
            let kept: String = cluster.chars().filter(|c| *c != 'd').collect();
            if !kept.is_empty() {
                out.push(format!("-{kept}"));
            }
            continue;
        }
        out.push(token.to_string());
    }
    out
}

/// Build an in-memory tar of `src`, stored under its basename.
fn tar_path(src: &Path) -> AnyResult<Vec<u8>> {
    let name = src
        .file_name()
        .with_context(|| format!("{} has no file name", src.display()))?;
    let mut builder = tar::Builder::new(Vec::new());
    if src.is_dir() {
        builder
            .append_dir_all(name, src)
            .with_context(|| format!("Failed to archive {}", src.display()))?;
    } else {
        builder
            .append_path_with_name(src, name)
            .with_context(|| format!("Failed to archive {}", src.display()))?;
    }
    builder.into_inner().context("Failed to finish archive")
}

/// Outcome of [`ensure_running`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Provisioned {
    /// Short id of the running container.
    pub short_id: String,
    /// Whether the container was created by this call.
    pub created: bool,
}

/// Reuse the container recorded in `store` if it still exists, otherwise create one from
/// `param` and record it. The container is started when it is not running.
pub fn ensure_running(
    runtime: &dyn ContainerRuntime,
    store: &EnvRecordStore,
    param: &DockerParam,
) -> Result<Provisioned> {
    let record = store.read()?;
    let mut existing = None;
    if let Some(id) = record.short_id() {
        if runtime.exists(id).map_err(|e| container_error(&e))? {
            match runtime.image_of(id) {
                Ok(image) if image != param.image => warn!(
                    container = id,
                    recorded = %image,
                    wanted = %param.image,
                    "reusing a container built from another image; run `oebuild clear docker` to switch"
                ),
                Ok(_) => {}
                Err(e) => debug!(container = id, error = %e, "could not inspect container image"),
            }
            existing = Some(id.to_string());
        } else {
            info!(container = id, "recorded container is gone, creating a replacement");
        }
    }

    let (short_id, created) = match existing {
        Some(id) => (id, false),
        None => {
            if !runtime
                .image_exists(&param.image)
                .map_err(|e| container_error(&e))?
            {
                runtime
                    .pull_with_progress(&param.image)
                    .map_err(|e| container_error(&e))?;
            }
            let id = runtime
                .create(&param.image, &param.parameters, &param.volumes, &param.command)
                .map_err(|e| container_error(&e))?;
            store.write(&EnvRecord {
                container: Some(ContainerRecord {
                    short_id: id.clone(),
                }),
            })?;
            info!(container = %id, image = %param.image, "created container");
            (id, true)
        }
    };

    if !runtime.is_running(&short_id).map_err(|e| container_error(&e))? {
        runtime.start(&short_id).map_err(|e| container_error(&e))?;
    }
    Ok(Provisioned { short_id, created })
}

/// Extract the numeric value of `field` (`uid` or `gid`) for `user` from `id` output.
pub fn parse_id_field(output: &str, field: &str, user: &str) -> Option<u32> {
    let prefix = format!("{field}=");
    let suffix = format!("({user})");
    output.split_whitespace().find_map(|token| {
        let rest = token.strip_prefix(&prefix)?;
        let number = rest.strip_suffix(&suffix)?;
        number.parse().ok()
    })
}

/// Make `user`'s uid and gid inside the container match the host ids.
///
/// Returns whether anything was changed.
pub fn reconcile_ids(
    runtime: &dyn ContainerRuntime,
    id: &str,
    user: &str,
    host_uid: u32,
    host_gid: u32,
) -> Result<bool> {
    let res = runtime
        .exec(id, &["id", user], "root", None)
        .map_err(|e| container_error(&e))?;
    if !res.success() {
        return Err(OebuildError::ContainerError(format!(
            "id {user} failed: {}",
            res.stderr.trim()
        )));
    }
    let uid = parse_id_field(res.output(), "uid", user).ok_or_else(|| {
        OebuildError::ContainerError(format!("could not parse uid of {user} from '{}'", res.stdout.trim()))
    })?;
    let gid = parse_id_field(res.output(), "gid", user).ok_or_else(|| {
        OebuildError::ContainerError(format!("could not parse gid of {user} from '{}'", res.stdout.trim()))
    })?;

    let mut changed = false;
    if uid != host_uid {
        let target = host_uid.to_string();
        run_root_step(runtime, id, &["usermod", "-u", &target, user])?;
        changed = true;
    }
    if gid != host_gid {
        let target = host_gid.to_string();
        run_root_step(runtime, id, &["groupmod", "-g", &target, user])?;
        changed = true;
    }
    if changed {
        debug!(container = id, user, host_uid, host_gid, "reconciled container ids");
    }
    Ok(changed)
}

/// Run a management command as root; a non-zero exit is a container error.
fn run_root_step(runtime: &dyn ContainerRuntime, id: &str, argv: &[&str]) -> Result<()> {
    let res = runtime
        .exec(id, argv, "root", None)
        .map_err(|e| container_error(&e))?;
    if !res.success() {
        return Err(OebuildError::ContainerError(format!(
            "{} exited with {}: {}",
            argv.join(" "),
            res.exit_code,
            res.stderr.trim()
        )));
    }
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::fake::{FakeContainer, FakeRuntime};
    use super::*;
    use tempfile::tempdir;

    fn param() -> DockerParam {
        DockerParam {
            image: "openeuler-container:latest".to_string(),
            parameters: "-itd --network host".to_string(),
            volumes: vec!["/ws/src:/usr1/openeuler/src".to_string()],
            command: "bash".to_string(),
        }
    }

    #[test]
    fn normalize_drops_detach() {
        assert_eq!(
            normalize_parameters("-itd --network host"),
            vec!["-it", "--network", "host"]
        );
        assert_eq!(normalize_parameters("-d --privileged"), vec!["--privileged"]);
        assert_eq!(normalize_parameters("--detach -e A=d"), vec!["-e", "A=d"]);
    }

    #[test]
    fn parses_id_output() {
        let out = "uid=1001(openeuler) gid=1002(openeuler) groups=1002(openeuler),27(sudo)";
        assert_eq!(parse_id_field(out, "uid", "openeuler"), Some(1001));
        assert_eq!(parse_id_field(out, "gid", "openeuler"), Some(1002));
        assert_eq!(parse_id_field(out, "uid", "root"), None);
        assert_eq!(parse_id_field("garbage", "uid", "openeuler"), None);
    }

    #[test]
    fn ensure_running_creates_and_records() {
        let tmp = tempdir().unwrap();
        let store = EnvRecordStore::new(tmp.path());
        let runtime = FakeRuntime::default();

        let first = ensure_running(&runtime, &store, &param()).unwrap();
        assert!(first.created);
        assert!(runtime.called("pull"));
        assert_eq!(store.read().unwrap().short_id(), Some(first.short_id.as_str()));
        assert!(runtime.is_running(&first.short_id).unwrap());
    }

    #[test]
    fn ensure_running_reuses_existing_container() {
        let tmp = tempdir().unwrap();
        let store = EnvRecordStore::new(tmp.path());
        let runtime = FakeRuntime::default();
        runtime.insert("abc123", FakeContainer::default());
        store
            .write(&EnvRecord {
                container: Some(ContainerRecord {
                    short_id: "abc123".to_string(),
                }),
            })
            .unwrap();

        let got = ensure_running(&runtime, &store, &param()).unwrap();
        assert_eq!(
            got,
            Provisioned {
                short_id: "abc123".to_string(),
                created: false
            }
        );
        assert!(!runtime.called("create"));
        assert!(runtime.called("start"));
    }

    #[test]
    fn ensure_running_keeps_container_from_older_image() {
        let tmp = tempdir().unwrap();
        let store = EnvRecordStore::new(tmp.path());
        let runtime = FakeRuntime::default();
        runtime.insert(
            "old1",
            FakeContainer {
                image: "openeuler-container:22.03-lts".to_string(),
                running: true,
                ..FakeContainer::default()
            },
        );
        store
            .write(&EnvRecord {
                container: Some(ContainerRecord {
                    short_id: "old1".to_string(),
                }),
            })
            .unwrap();

        let got = ensure_running(&runtime, &store, &param()).unwrap();
        assert_eq!(got.short_id, "old1");
        assert!(runtime.called("inspect"));
        assert!(!runtime.called("create"));
        assert_eq!(runtime.image_of("old1").unwrap(), "openeuler-container:22.03-lts");
    }

    #[test]
    fn ensure_running_replaces_vanished_container() {
        let tmp = tempdir().unwrap();
        let store = EnvRecordStore::new(tmp.path());
        let runtime = FakeRuntime::default();
        runtime.images.borrow_mut().push(param().image);
        store
            .write(&EnvRecord {
                container: Some(ContainerRecord {
                    short_id: "gone".to_string(),
                }),
            })
            .unwrap();

        let got = ensure_running(&runtime, &store, &param()).unwrap();
        assert!(got.created);
        assert_ne!(got.short_id, "gone");
        assert!(!runtime.called("pull"));
        assert_eq!(store.read().unwrap().short_id(), Some(got.short_id.as_str()));
    }

    #[test]
    fn reconcile_matches_host_ids() {
        let runtime = FakeRuntime::default();
        runtime.insert(
            "c1",
            FakeContainer {
                uid: 1000,
                gid: 1000,
                ..FakeContainer::default()
            },
        );

        assert!(reconcile_ids(&runtime, "c1", "openeuler", 1234, 1000).unwrap());
        assert!(runtime.called("usermod"));
        assert!(!runtime.called("groupmod"));
        let c = runtime.containers.borrow().get("c1").cloned().unwrap();
        assert_eq!((c.uid, c.gid), (1234, 1000));

        assert!(!reconcile_ids(&runtime, "c1", "openeuler", 1234, 1000).unwrap());
    }

    #[test]
    fn tar_keeps_basename() {
        let tmp = tempdir().unwrap();
        let file = tmp.path().join(".bashrc");
        fs::write(&file, "echo hi\n").unwrap();

        let bytes = tar_path(&file).unwrap();
        let mut archive = tar::Archive::new(Cursor::new(bytes));
        let names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec![".bashrc"]);
    }
}
