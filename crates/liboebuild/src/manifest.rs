use std::{
    collections::BTreeMap,
    fs,
    path::Path,
    result::Result as StdResult,
    sync::{Mutex, mpsc},
    thread,
};

use sysinfo::{CpuRefreshKind, RefreshKind, System};
use tracing::{debug, info, warn};

use crate::{
    error::{Result, vcs_error},
    git, store,
    types::{Manifest, PinnedRepo},
};

/// Fixed comment block written ahead of every manifest.
pub const BANNER: &str = "\
# this file is generated by oebuild manifest --create
# it pins every repository under src/ to the commit it was at
# restore it with: oebuild manifest --recover
";

/// Attempts per repository during restore.
const RESTORE_ATTEMPTS: usize = 3;

/// Record `{remote_url, commit}` for every repository directly under `src_dir`.
///
/// Directories that are not repositories are skipped.
pub fn snapshot(src_dir: &Path) -> Result<Manifest> {
    let mut manifest_list = BTreeMap::new();
    for entry in fs::read_dir(src_dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let dir = entry.path();
        if !git::is_repo(&dir) {
            debug!(dir = %dir.display(), "not a repository, skipping");
            continue;
        }
        let head = git::read_head(&dir).map_err(|e| vcs_error(&e))?;
        let name = entry.file_name().to_string_lossy().into_owned();
        manifest_list.insert(
            name,
            PinnedRepo {
                remote_url: head.remote_url,
                version: head.commit,
            },
        );
    }
    Ok(Manifest { manifest_list })
}

/// Snapshot `src_dir` into the manifest file at `path`.
pub fn create(src_dir: &Path, path: &Path) -> Result<Manifest> {
    let manifest = snapshot(src_dir)?;
    store::write_document_with_banner(path, BANNER, &manifest)?;
    info!(path = %path.display(), repos = manifest.manifest_list.len(), "wrote manifest");
    Ok(manifest)
}

/// Read a manifest file.
pub fn read(path: &Path) -> Result<Manifest> {
    store::read_document(path)
}

/// Number of restore workers: one per logical CPU, at least one.
pub fn worker_count() -> usize {
    let sys = System::new_with_specifics(RefreshKind::new().with_cpu(CpuRefreshKind::new()));
    sys.cpus().len().max(1)
}

/// One completed repository during a restore.
#[derive(Debug, Clone)]
pub struct RestoreProgress {
    /// Local name of the repository.
    pub name: String,
    /// Repositories finished so far, this one included.
    pub completed: usize,
    /// Repositories in the manifest.
    pub total: usize,
    /// Failure message when the repository could not be restored.
    pub error: Option<String>,
}

impl RestoreProgress {
    /// Completion percentage.
    pub fn percent(&self) -> usize {
        if self.total == 0 {
            100
        } else {
            self.completed * 100 / self.total
        }
    }
}

/// Outcome of a restore.
#[derive(Debug, Default, Clone)]
pub struct RestoreReport {
    /// Repositories now at their pinned commit, sorted.
    pub restored: Vec<String>,
    /// Repositories that could not be restored with the final error, sorted by name.
    pub failed: Vec<(String, String)>,
}

impl RestoreReport {
    /// Whether every repository was restored.
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Check out `pin` into `dir`, retrying a few times.
fn restore_one(dir: &Path, pin: &PinnedRepo) -> StdResult<(), String> {
    let mut last = String::new();
    for attempt in 1..=RESTORE_ATTEMPTS {
        match git::checkout_commit(dir, &pin.remote_url, &pin.version) {
            Ok(()) => return Ok(()),
            Err(e) => {
                warn!(dir = %dir.display(), attempt, error = %e, "checkout failed");
                last = format!("{e:#}");
            }
        }
    }
    Err(last)
}

/// Bring every repository in `manifest` under `src_dir` to its pinned commit.
///
/// Repositories are restored in parallel across [`worker_count`] workers. `on_progress` is
/// called on the calling thread once per repository, in completion order. A repository that
/// fails after retries is recorded in the report without stopping the others.
pub fn restore(
    manifest: &Manifest,
    src_dir: &Path,
    workers: usize,
    mut on_progress: impl FnMut(&RestoreProgress),
) -> RestoreReport {
    let total = manifest.manifest_list.len();
    let queue = Mutex::new(manifest.manifest_list.iter());
    let (tx, rx) = mpsc::channel::<(String, StdResult<(), String>)>();
    let mut report = RestoreReport::default();

    thread::scope(|scope| {
        for _ in 0..workers.clamp(1, total.max(1)) {
            let tx = tx.clone();
            let queue = &queue;
            scope.spawn(move || {
                loop {
                    let next = match queue.lock() {
                        Ok(mut iter) => iter.next(),
                        Err(_) => None,
                    };
                    let Some((name, pin)) = next else {
                        break;
                    };
                    let outcome = restore_one(&src_dir.join(name), pin);
                    if tx.send((name.clone(), outcome)).is_err() {
                        break;
                    }
                }
            });
        }
        drop(tx);

        for (completed, (name, outcome)) in rx.iter().enumerate() {
            let progress = RestoreProgress {
                name: name.clone(),
                completed: completed + 1,
                total,
                error: outcome.as_ref().err().cloned(),
            };
            on_progress(&progress);
            match outcome {
                Ok(()) => report.restored.push(name),
                Err(e) => report.failed.push((name, e)),
            }
        }
    });

    report.restored.sort();
    report.failed.sort();
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;
    use tempfile::tempdir;

    fn git(dir: &Path, args: &[&str]) -> String {
        let output = Command::new("git")
            .current_dir(dir)
            .args(args)
            .output()
            .unwrap();
        assert!(output.status.success(), "git {args:?} failed");
        String::from_utf8_lossy(&output.stdout).trim().to_string()
    }

    /// Create an origin repository with two commits; returns the first commit.
    fn origin(path: &Path, file: &str) -> String {
        fs::create_dir_all(path).unwrap();
        git(path, &["init", "-b", "main"]);
        git(path, &["config", "user.email", "test@example.com"]);
        git(path, &["config", "user.name", "Test User"]);
        fs::write(path.join(file), "one").unwrap();
        git(path, &["add", "."]);
        git(path, &["commit", "-m", "one"]);
        let first = git(path, &["rev-parse", "HEAD"]);
        fs::write(path.join(file), "two").unwrap();
        git(path, &["commit", "-am", "two"]);
        first
    }

    #[test]
    fn snapshot_skips_non_repositories_and_sorts() {
        let tmp = tempdir().unwrap();
        let src = tmp.path().join("src");
        let remote_b = tmp.path().join("remote-b");
        let remote_a = tmp.path().join("remote-a");
        origin(&remote_b, "b.txt");
        origin(&remote_a, "a.txt");
        git::clone_or_pull(&src.join("B"), remote_b.to_str().unwrap(), "main", false).unwrap();
        git::clone_or_pull(&src.join("A"), remote_a.to_str().unwrap(), "main", false).unwrap();
        fs::create_dir_all(src.join("plain")).unwrap();

        let manifest = snapshot(&src).unwrap();
        let names: Vec<_> = manifest.manifest_list.keys().cloned().collect();
        assert_eq!(names, vec!["A", "B"]);
        assert_eq!(
            manifest.manifest_list["A"].remote_url,
            remote_a.to_str().unwrap()
        );
    }

    #[test]
    fn create_then_recover_round_trips() {
        let tmp = tempdir().unwrap();
        let src = tmp.path().join("src");
        let remote_a = tmp.path().join("remote-a");
        let remote_b = tmp.path().join("remote-b");
        let first_a = origin(&remote_a, "a.txt");
        origin(&remote_b, "b.txt");
        git::clone_or_pull(&src.join("A"), remote_a.to_str().unwrap(), "main", false).unwrap();
        git::clone_or_pull(&src.join("B"), remote_b.to_str().unwrap(), "main", false).unwrap();
        git::checkout_commit(&src.join("A"), remote_a.to_str().unwrap(), &first_a).unwrap();

        let path = tmp.path().join("m.yaml");
        let before = create(&src, &path).unwrap();
        let text = fs::read_to_string(&path).unwrap();
        assert!(text.starts_with(BANNER));
        assert!(text.contains("manifest_list:"));

        fs::remove_dir_all(src.join("A")).unwrap();
        fs::remove_dir_all(src.join("B")).unwrap();
        fs::create_dir_all(src.join("A")).unwrap();
        fs::create_dir_all(src.join("B")).unwrap();

        let mut seen = Vec::new();
        let report = restore(&read(&path).unwrap(), &src, 2, |p| seen.push(p.percent()));
        assert!(report.is_complete(), "{:?}", report.failed);
        assert_eq!(report.restored, vec!["A", "B"]);
        assert_eq!(seen.last(), Some(&100));
        assert_eq!(fs::read_to_string(src.join("A").join("a.txt")).unwrap(), "one");
        assert_eq!(fs::read_to_string(src.join("B").join("b.txt")).unwrap(), "two");

        assert_eq!(snapshot(&src).unwrap(), before);
    }

    #[test]
    fn unknown_commit_is_reported_not_fatal() {
        let tmp = tempdir().unwrap();
        let src = tmp.path().join("src");
        let remote = tmp.path().join("remote");
        let first = origin(&remote, "a.txt");
        let url = remote.to_str().unwrap().to_string();

        let mut manifest = Manifest::default();
        manifest.manifest_list.insert(
            "good".to_string(),
            PinnedRepo {
                remote_url: url.clone(),
                version: first,
            },
        );
        manifest.manifest_list.insert(
            "bad".to_string(),
            PinnedRepo {
                remote_url: url,
                version: "0123456789abcdef0123456789abcdef01234567".to_string(),
            },
        );

        let report = restore(&manifest, &src, 4, |_| {});
        assert_eq!(report.restored, vec!["good"]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "bad");
    }

    #[test]
    fn percent_of_empty_manifest_is_complete() {
        let progress = RestoreProgress {
            name: String::new(),
            completed: 0,
            total: 0,
            error: None,
        };
        assert_eq!(progress.percent(), 100);
        assert!(worker_count() >= 1);
    }
}
