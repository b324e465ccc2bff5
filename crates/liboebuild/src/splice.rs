use std::{
    fs, io,
    path::{Path, PathBuf},
};

use tracing::{debug, warn};

use crate::error::Result;

/// Marker appended to every managed line.
pub const SENTINEL: &str = "  ###!!!###";

/// Drop every managed line and every blank line from `content`.
pub fn restore(content: &str) -> String {
    let mut out = String::with_capacity(content.len());
    for line in content.lines() {
        if line.ends_with(SENTINEL) || line.trim().is_empty() {
            continue;
        }
        out.push_str(line);
        out.push('\n');
    }
    out
}

/// Append `line` as a managed line. Multi-line input is tagged line by line.
pub fn append(content: &str, line: &str) -> String {
    let mut out = content.to_string();
    if !out.is_empty() && !out.ends_with('\n') {
        out.push('\n');
    }
    for part in line.lines() {
        out.push_str(part);
        out.push_str(SENTINEL);
        out.push('\n');
    }
    out
}

/// Restore `content` and append each command in order.
pub fn init<S: AsRef<str>>(content: &str, commands: &[S]) -> String {
    commands
        .iter()
        .fold(restore(content), |acc, cmd| append(&acc, cmd.as_ref()))
}

/// Command that strips every managed line from `~/.bashrc` when the shell runs it.
pub fn self_clean_line() -> String {
    format!("sed -i '/{SENTINEL}$/d' ~/.bashrc")
}

/// Whether `content` carries any managed line.
pub fn is_spliced(content: &str) -> bool {
    content.lines().any(|l| l.ends_with(SENTINEL))
}

/// Splice `commands` into the file at `path`, creating it when missing.
pub fn splice_file<S: AsRef<str>>(path: &Path, commands: &[S]) -> Result<()> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(e.into()),
    };
    debug!(path = %path.display(), lines = commands.len(), "splicing shell init file");
    fs::write(path, init(&content, commands))?;
    Ok(())
}

/// Remove every managed line from the file at `path`. Missing files are left alone.
pub fn restore_file(path: &Path) -> Result<()> {
    if !path.exists() {
        return Ok(());
    }
    let content = fs::read_to_string(path)?;
    if !is_spliced(&content) {
        return Ok(());
    }
    debug!(path = %path.display(), "restoring shell init file");
    fs::write(path, restore(&content))?;
    Ok(())
}

/// Restores a spliced file when dropped, on every exit path.
#[derive(Debug)]
pub struct SpliceGuard {
    /// File that was spliced.
    path: PathBuf,
}

impl SpliceGuard {
    /// Splice `commands` into `path` and return a guard that restores it.
    pub fn splice<S: AsRef<str>>(path: &Path, commands: &[S]) -> Result<Self> {
        splice_file(path, commands)?;
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    /// Path of the managed file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for SpliceGuard {
    fn drop(&mut self) {
        if let Err(e) = restore_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "failed to restore shell init file");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const SAMPLES: &[&str] = &[
        "",
        "\n",
        "export PATH=$HOME/bin:$PATH\n",
        "alias ll='ls -l'\n\n\nexport EDITOR=vim",
        "# comment\n   \nsource /etc/bashrc\n",
    ];

    #[test]
    fn init_then_restore_returns_restored_input() {
        let commands = ["cd /home/openeuler/build/qemu", ". oe-init-build-env", "echo hi"];
        for sample in SAMPLES {
            let spliced = init(sample, &commands);
            assert_eq!(restore(&spliced), restore(sample), "sample {sample:?}");
        }
    }

    #[test]
    fn restore_is_idempotent() {
        for sample in SAMPLES {
            let once = restore(sample);
            assert_eq!(restore(&once), once);
        }
    }

    #[test]
    fn managed_lines_are_exactly_the_appended_ones() {
        let spliced = init("alias ll='ls -l'\n", &["a", "b"]);
        let managed: Vec<&str> = spliced.lines().filter(|l| l.ends_with(SENTINEL)).collect();
        assert_eq!(managed, vec![format!("a{SENTINEL}"), format!("b{SENTINEL}")]);
        assert!(spliced.starts_with("alias ll='ls -l'\n"));
    }

    #[test]
    fn append_adds_missing_newline() {
        let out = append("export A=1", "b");
        assert_eq!(out, format!("export A=1\nb{SENTINEL}\n"));
    }

    #[test]
    fn splicing_twice_does_not_accumulate() {
        let once = init("x\n", &["a"]);
        let twice = init(&once, &["a"]);
        assert_eq!(once, twice);
    }

    #[test]
    fn self_clean_line_removes_managed_lines() {
        let line = self_clean_line();
        assert_eq!(line, "sed -i '/  ###!!!###$/d' ~/.bashrc");
    }

    #[test]
    fn guard_restores_on_drop() {
        let tmp = tempdir().unwrap();
        let rc = tmp.path().join(".bashrc");
        fs::write(&rc, "export A=1\n").unwrap();
        {
            let guard = SpliceGuard::splice(&rc, &["echo managed"]).unwrap();
            let during = fs::read_to_string(guard.path()).unwrap();
            assert!(is_spliced(&during));
        }
        assert_eq!(fs::read_to_string(&rc).unwrap(), "export A=1\n");
    }

    #[test]
    fn splice_file_creates_missing_file() {
        let tmp = tempdir().unwrap();
        let rc = tmp.path().join(".bashrc");
        splice_file(&rc, &["echo hi"]).unwrap();
        assert_eq!(fs::read_to_string(&rc).unwrap(), format!("echo hi{SENTINEL}\n"));
        restore_file(&rc).unwrap();
        assert_eq!(fs::read_to_string(&rc).unwrap(), "");
    }
}
