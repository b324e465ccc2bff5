//! Turns a compile descriptor into `conf/bblayers.conf` and `conf/local.conf`.
//!
//! Both files are rewritten line by line so that hand edits outside the managed keys survive,
//! and running the materializer twice produces byte-identical output.

use std::{
    fs,
    path::{Path, PathBuf},
};

use glob::Pattern;
use tracing::debug;

use crate::{
    environment::{CONTAINER_GCC_ROOT, CONTAINER_LLVM_DIR, CONTAINER_SRC_DIR, CONTAINER_SSTATE_DIR},
    error::{OebuildError, Result},
    store,
    template::TEMPLATE_DIR,
    types::{BuildIn, CompileDescriptor},
};

/// Line separating generated settings from the user fragment in `local.conf`.
pub const USER_CONTENT_MARKER: &str = "# user added content";

/// Stock `bblayers.conf` used when a build context has none yet.
const STOCK_BBLAYERS: &str = r#"# POKY_BBLAYERS_CONF_VERSION is increased each time build/conf/bblayers.conf
# changes incompatibly
POKY_BBLAYERS_CONF_VERSION = "2"

BBPATH = "${TOPDIR}"
BBFILES ?= ""

BBLAYERS ?= " \
  "
"#;

/// Sample `local.conf` inside the recipe tree's template directory.
const LOCAL_CONF_SAMPLE: &str = "local.conf.sample";

/// A parsed variable assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Assignment<'a> {
    /// Variable name, including any override suffix.
    key: &'a str,
    /// Operator, e.g. `=`, `?=`, `+=`.
    op: &'static str,
    /// Whether the line is commented out.
    commented: bool,
}

impl Assignment<'_> {
    /// Plain or weak assignments, the ones a later setting of the key supersedes.
    fn is_plain(&self) -> bool {
        matches!(self.op, "=" | "?=" | "??=" | ":=")
    }
}

/// Parse `line` as a (possibly commented) `KEY <op> value` assignment.
fn parse_assignment(line: &str) -> Option<Assignment<'_>> {
    let trimmed = line.trim_start();
    let (commented, body) = match trimmed.strip_prefix('#') {
        Some(rest) => (true, rest.trim_start_matches('#').trim_start()),
        None => (false, trimmed),
    };
    let body = body.strip_prefix("export ").map_or(body, str::trim_start);

    let eq = body.find('=')?;
    let lhs = body[..eq].trim_end();
    let stripped = lhs.trim_end_matches(['?', ':', '+', '.']);
    let key = stripped.trim_end();
    let op = match (&lhs[stripped.len()..], body[eq + 1..].chars().next()) {
        ("", Some('+')) => "=+",
        ("", Some('.')) => "=.",
        ("", _) => "=",
        ("?", _) => "?=",
        ("??", _) => "??=",
        (":", _) => ":=",
        ("+", _) => "+=",
        (".", _) => ".=",
        _ => return None,
    };

    let valid_key = !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_-${}[]/:.~".contains(c))
        && key
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '_' || c == '$');
    valid_key.then_some(Assignment { key, op, commented })
}

/// Set `key` to `value` in `lines`.
///
/// The first uncommented plain assignment is replaced, else the first commented one, else the
/// line is appended. Remaining uncommented plain assignments of the key are commented out.
fn set_key(lines: &mut Vec<String>, key: &str, value: &str) {
    let new_line = format!("{key} = \"{value}\"");
    let matches = |commented: bool| {
        move |line: &String| {
            parse_assignment(line)
                .is_some_and(|a| a.key == key && a.commented == commented && (commented || a.is_plain()))
        }
    };

    let target = lines
        .iter()
        .position(matches(false))
        .or_else(|| lines.iter().position(matches(true)));

    match target {
        Some(index) => {
            lines[index] = new_line;
            for (i, line) in lines.iter_mut().enumerate() {
                if i != index && matches(false)(&*line) {
                    *line = format!("# {line}");
                }
            }
        }
        None => lines.push(new_line),
    }
}

/// Apply a user fragment after the marker.
///
/// A commented assignment whose key is set uncommented elsewhere replaces that line; an
/// identical line already present is skipped. Everything else is appended.
fn apply_fragment(lines: &mut Vec<String>, fragment: &str) {
    for line in fragment.lines() {
        if let Some(a) = parse_assignment(line)
            && a.commented
        {
            if lines.iter().any(|l| l.trim() == line.trim()) {
                continue;
            }
            let existing = lines.iter().position(|l| {
                parse_assignment(l).is_some_and(|b| !b.commented && b.is_plain() && b.key == a.key)
            });
            if let Some(index) = existing {
                lines[index] = line.to_string();
                continue;
            }
        }
        lines.push(line.to_string());
    }
}

/// Join lines with a trailing newline.
fn join_lines(lines: &[String]) -> String {
    let mut out = lines.join("\n");
    out.push('\n');
    out
}

/// Compile a layer glob such as `*/yocto-poky/meta-*`.
fn layer_pattern(pattern: &str) -> Result<Pattern> {
    Pattern::new(pattern)
        .map_err(|e| OebuildError::config("layers", format!("bad pattern '{pattern}': {e}")))
}

/// Strip trailing path separators.
fn normalize_layer(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() { path } else { trimmed }
}

/// The `BBLAYERS` assignment of a `bblayers.conf`, with the surrounding text kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerList {
    /// Lines before the assignment.
    head: Vec<String>,
    /// Text up to and including the opening quote.
    prefix: String,
    /// Indentation of entry lines.
    indent: String,
    /// Quote character.
    quote: char,
    /// Text after the closing quote.
    suffix: String,
    /// Layer paths.
    entries: Vec<String>,
    /// Lines after the assignment.
    tail: Vec<String>,
}

impl LayerList {
    /// Parse `text`, creating an empty `BBLAYERS ?=` assignment when none exists.
    pub fn parse(text: &str) -> Self {
        let lines: Vec<&str> = text.lines().collect();
        let start = lines.iter().position(|l| {
            parse_assignment(l).is_some_and(|a| !a.commented && a.key == "BBLAYERS" && a.is_plain())
        });

        let Some(start) = start else {
            return Self {
                head: lines.iter().map(ToString::to_string).collect(),
                prefix: "BBLAYERS ?= \"".to_string(),
                indent: "  ".to_string(),
                quote: '"',
                suffix: String::new(),
                entries: Vec::new(),
                tail: Vec::new(),
            };
        };

        let first = lines[start];
        let eq = first.find('=').unwrap_or(0);
        let (quote_pos, quote) = first[eq..]
            .char_indices()
            .find(|(_, c)| *c == '"' || *c == '\'')
            .map_or((first.len(), '"'), |(i, c)| (eq + i, c));
        let prefix = first[..(quote_pos + 1).min(first.len())].to_string();

        let mut body = String::new();
        let mut indent = None;
        let mut suffix = String::new();
        let mut end = start;
        let mut rest = first.get(quote_pos + 1..).unwrap_or("");
        loop {
            if let Some(close) = rest.find(quote) {
                body.push_str(&rest[..close]);
                suffix = rest[close + 1..].to_string();
                break;
            }
            body.push_str(rest);
            body.push(' ');
            end += 1;
            let Some(next) = lines.get(end) else {
                break;
            };
            if indent.is_none() && !next.trim().is_empty() {
                let width = next.len() - next.trim_start().len();
                indent = Some(next[..width].to_string());
            }
            rest = next;
        }

        let entries = body
            .split_whitespace()
            .filter(|s| *s != "\\")
            .map(ToString::to_string)
            .collect();

        Self {
            head: lines[..start].iter().map(ToString::to_string).collect(),
            prefix,
            indent: indent.filter(|i| !i.is_empty()).unwrap_or_else(|| "  ".to_string()),
            quote,
            suffix,
            entries,
            tail: lines
                .get(end + 1..)
                .unwrap_or_default()
                .iter()
                .map(ToString::to_string)
                .collect(),
        }
    }

    /// Layer paths in order.
    pub fn entries(&self) -> &[String] {
        &self.entries
    }

    /// Add `layer` unless it is already listed. Returns whether it was added.
    pub fn add(&mut self, layer: &str) -> bool {
        let wanted = normalize_layer(layer);
        if self.entries.iter().any(|e| normalize_layer(e) == wanted) {
            return false;
        }
        self.entries.push(wanted.to_string());
        true
    }

    /// Remove every entry matching the glob `pattern`. Returns the number removed.
    pub fn remove(&mut self, pattern: &str) -> Result<usize> {
        let pattern = layer_pattern(normalize_layer(pattern))?;
        let before = self.entries.len();
        self.entries
            .retain(|e| !pattern.matches(normalize_layer(e)));
        Ok(before - self.entries.len())
    }

    /// Render back to text in multi-line form.
    pub fn render(&self) -> String {
        let mut lines = self.head.clone();
        lines.push(format!("{} \\", self.prefix));
        for entry in &self.entries {
            lines.push(format!("{}{entry} \\", self.indent));
        }
        lines.push(format!("{}{}{}", self.indent, self.quote, self.suffix));
        lines.extend(self.tail.iter().cloned());
        join_lines(&lines)
    }
}

/// Check that every layer under `base` exists and contains `conf/layer.conf`.
pub fn validate_layers<S: AsRef<str>>(base: &Path, layers: &[S]) -> Result<()> {
    for layer in layers {
        let layer = layer.as_ref();
        let path = base.join(layer);
        if !path.join("conf").join("layer.conf").is_file() {
            return Err(OebuildError::config(
                "layers",
                format!("{} is not a layer (missing conf/layer.conf)", path.display()),
            ));
        }
    }
    Ok(())
}

/// Read `path`, or `None` when it does not exist.
fn read_optional(path: &Path) -> Result<Option<String>> {
    if path.is_file() {
        Ok(Some(fs::read_to_string(path)?))
    } else {
        Ok(None)
    }
}

/// Write `contents` to `path`, creating parents first.
fn write_text(path: &Path, contents: &str) -> Result<()> {
    store::ensure_file(path)?;
    fs::write(path, contents)?;
    Ok(())
}

/// Add `layers` to the layer list file, validated under `host_base` and written under
/// `emit_base`. Returns how many were added.
pub fn add_layers<S: AsRef<str>>(
    bblayers: &Path,
    host_base: &Path,
    emit_base: &Path,
    layers: &[S],
) -> Result<usize> {
    validate_layers(host_base, layers)?;
    let text = read_optional(bblayers)?.unwrap_or_else(|| STOCK_BBLAYERS.to_string());
    let mut list = LayerList::parse(&text);
    let added = layers
        .iter()
        .filter(|l| list.add(&emit_base.join(l.as_ref()).to_string_lossy()))
        .count();
    write_text(bblayers, &list.render())?;
    debug!(path = %bblayers.display(), added, "updated layer list");
    Ok(added)
}

/// Remove layers matching any of `patterns` from the layer list file.
pub fn remove_layers<S: AsRef<str>>(bblayers: &Path, patterns: &[S]) -> Result<usize> {
    let Some(text) = read_optional(bblayers)? else {
        return Ok(0);
    };
    let mut list = LayerList::parse(&text);
    let mut removed = 0;
    for pattern in patterns {
        removed += list.remove(pattern.as_ref())?;
    }
    write_text(bblayers, &list.render())?;
    Ok(removed)
}

/// A validated nativesdk installation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeSdk {
    /// Declared nativesdk directory.
    pub dir: PathBuf,
    /// The `environment-setup-*` script.
    pub setup_file: PathBuf,
    /// Value of `OECORE_NATIVE_SYSROOT`.
    pub sysroot: PathBuf,
}

/// Locate and validate the nativesdk at `dir`.
pub fn resolve_nativesdk(dir: &Path) -> Result<NativeSdk> {
    if !dir.is_dir() {
        return Err(OebuildError::NativesdkNotExist {
            path: dir.to_path_buf(),
        });
    }
    let mut candidates = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let is_setup = entry
            .file_name()
            .to_str()
            .is_some_and(|n| n.starts_with("environment-setup-"));
        if is_setup && entry.file_type()?.is_file() {
            candidates.push(entry.path());
        }
    }
    candidates.sort();
    let Some(setup_file) = candidates.into_iter().next() else {
        return Err(OebuildError::NativesdkNotExist {
            path: dir.to_path_buf(),
        });
    };

    let contents = fs::read_to_string(&setup_file)?;
    let value = contents
        .lines()
        .find_map(|l| l.trim().strip_prefix("export OECORE_NATIVE_SYSROOT="))
        .map(|v| v.trim().trim_matches(['"', '\'']).to_string())
        .ok_or_else(|| OebuildError::NativesdkNotValid {
            path: dir.to_path_buf(),
            message: format!("{} does not export OECORE_NATIVE_SYSROOT", setup_file.display()),
        })?;

    let sysroot = PathBuf::from(&value);
    let canonical_dir = fs::canonicalize(dir).unwrap_or_else(|_| dir.to_path_buf());
    if !sysroot.starts_with(dir) && !sysroot.starts_with(&canonical_dir) {
        return Err(OebuildError::NativesdkNotValid {
            path: dir.to_path_buf(),
            message: format!("OECORE_NATIVE_SYSROOT {value} lies outside the nativesdk directory"),
        });
    }

    Ok(NativeSdk {
        dir: dir.to_path_buf(),
        setup_file,
        sysroot,
    })
}

/// Host locations a build context is materialized against.
#[derive(Debug, Clone)]
pub struct BuildPaths {
    /// The build context directory.
    pub build_dir: PathBuf,
    /// Workspace `src/` on the host.
    pub src_dir: PathBuf,
    /// Recipe tree on the host.
    pub recipe_dir: PathBuf,
}

impl BuildPaths {
    /// `conf/bblayers.conf` of the build context.
    pub fn bblayers(&self) -> PathBuf {
        self.build_dir.join("conf").join("bblayers.conf")
    }

    /// `conf/local.conf` of the build context.
    pub fn local_conf(&self) -> PathBuf {
        self.build_dir.join("conf").join("local.conf")
    }
}

/// Compute the `local.conf` header settings for `descriptor`, in order.
fn header_settings(
    descriptor: &CompileDescriptor,
    paths: &BuildPaths,
    nativesdk: Option<&NativeSdk>,
    existing: &[String],
) -> Vec<(String, String)> {
    let docker = descriptor.build_in == BuildIn::Docker;
    let mut settings = vec![("MACHINE".to_string(), descriptor.machine.clone())];

    if let Some(dir) = &descriptor.toolchain_dir {
        let has_gcc_keys = existing
            .iter()
            .filter_map(|l| parse_assignment(l))
            .any(|a| a.key.starts_with("EXTERNAL_GCC_"));
        let mut key = descriptor.toolchain_type.clone();
        if has_gcc_keys && !key.starts_with("EXTERNAL_GCC_") && key.starts_with("EXTERNAL_") {
            key = key.replacen("EXTERNAL_", "EXTERNAL_GCC_", 1);
        }
        let value = if docker {
            let name = dir.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
            format!("{CONTAINER_GCC_ROOT}/{name}")
        } else {
            dir.display().to_string()
        };
        settings.push((key, value));
    }

    if let Some(dir) = &descriptor.llvm_toolchain_dir {
        let value = if docker {
            CONTAINER_LLVM_DIR.to_string()
        } else {
            dir.display().to_string()
        };
        settings.push(("EXTERNAL_LLVM_TOOLCHAIN".to_string(), value));
    }

    if !docker {
        if let Some(sdk) = nativesdk {
            settings.push((
                "OPENEULER_NATIVESDK_SYSROOT".to_string(),
                sdk.sysroot.display().to_string(),
            ));
        }
        settings.push(("OPENEULER_SP_DIR".to_string(), paths.src_dir.display().to_string()));
    }

    if let Some(dir) = &descriptor.sstate_mirrors {
        let target = if docker {
            CONTAINER_SSTATE_DIR.to_string()
        } else {
            dir.display().to_string()
        };
        let mut value = format!("file://.* file://{target}/PATH");
        if fs::symlink_metadata(dir).is_ok_and(|m| m.file_type().is_symlink()) {
            value.push_str(";downloadfilename=PATH");
        }
        settings.push(("SSTATE_MIRRORS".to_string(), value));
    }

    if let Some(dir) = &descriptor.sstate_dir {
        settings.push(("SSTATE_DIR".to_string(), dir.display().to_string()));
    }
    if let Some(dir) = &descriptor.tmp_dir {
        settings.push(("TMPDIR".to_string(), dir.display().to_string()));
    }
    settings
}

/// Render `local.conf` from `stock`: header keys, the marker, then the user fragment.
fn render_local_conf(
    stock: &str,
    descriptor: &CompileDescriptor,
    paths: &BuildPaths,
    nativesdk: Option<&NativeSdk>,
) -> String {
    let mut lines: Vec<String> = stock
        .lines()
        .take_while(|l| l.trim() != USER_CONTENT_MARKER)
        .map(ToString::to_string)
        .collect();

    for (key, value) in header_settings(descriptor, paths, nativesdk, &lines) {
        set_key(&mut lines, &key, &value);
    }
    lines.push(USER_CONTENT_MARKER.to_string());
    apply_fragment(&mut lines, &descriptor.local_conf);
    join_lines(&lines)
}

/// Write `local.conf` for `descriptor`.
pub fn write_local_conf(
    descriptor: &CompileDescriptor,
    paths: &BuildPaths,
    nativesdk: Option<&NativeSdk>,
) -> Result<()> {
    let target = paths.local_conf();
    let stock = match read_optional(&target)? {
        Some(text) => text,
        None => read_optional(&paths.recipe_dir.join(TEMPLATE_DIR).join(LOCAL_CONF_SAMPLE))?
            .unwrap_or_default(),
    };
    write_text(&target, &render_local_conf(&stock, descriptor, paths, nativesdk))?;
    debug!(path = %target.display(), "wrote local.conf");
    Ok(())
}

/// Materialize both configuration files of a build context.
///
/// Host builds with a nativesdk validate it first and return it.
pub fn materialize(descriptor: &CompileDescriptor, paths: &BuildPaths) -> Result<Option<NativeSdk>> {
    let nativesdk = match (&descriptor.build_in, &descriptor.nativesdk_dir) {
        (BuildIn::Host, Some(dir)) => Some(resolve_nativesdk(dir)?),
        _ => None,
    };

    if descriptor.wants_layers() {
        let emit_base = match descriptor.build_in {
            BuildIn::Docker => PathBuf::from(CONTAINER_SRC_DIR),
            BuildIn::Host => paths.src_dir.clone(),
        };
        add_layers(&paths.bblayers(), &paths.src_dir, &emit_base, &descriptor.layers)?;
    } else if !paths.bblayers().exists() {
        write_text(&paths.bblayers(), STOCK_BBLAYERS)?;
    }

    write_local_conf(descriptor, paths, nativesdk.as_ref())?;
    Ok(nativesdk)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::{TempDir, tempdir};

    fn descriptor(build_in: BuildIn) -> CompileDescriptor {
        CompileDescriptor {
            build_in,
            machine: "qemuarm64".to_string(),
            toolchain_type: "EXTERNAL_TOOLCHAIN_aarch64".to_string(),
            toolchain_dir: None,
            llvm_toolchain_dir: None,
            nativesdk_dir: None,
            sstate_mirrors: None,
            sstate_dir: None,
            tmp_dir: None,
            no_layer: None,
            repos: Vec::new(),
            local_conf: String::new(),
            layers: Vec::new(),
            docker_param: None,
            bitbake_cmds: None,
        }
    }

    fn make_layer(src: &Path, rel: &str) {
        let conf = src.join(rel).join("conf");
        fs::create_dir_all(&conf).unwrap();
        fs::write(conf.join("layer.conf"), "BBPATH .= \":${LAYERDIR}\"\n").unwrap();
    }

    fn paths(tmp: &TempDir) -> BuildPaths {
        let src_dir = tmp.path().join("src");
        let recipe_dir = src_dir.join("yocto-meta-openeuler");
        fs::create_dir_all(&recipe_dir).unwrap();
        BuildPaths {
            build_dir: tmp.path().join("build").join("qemu"),
            src_dir,
            recipe_dir,
        }
    }

    #[test]
    fn parses_assignments() {
        let a = parse_assignment("MACHINE ??= \"qemux86\"").unwrap();
        assert_eq!((a.key, a.op, a.commented), ("MACHINE", "??=", false));
        let a = parse_assignment("# MACHINE ?= \"x\"").unwrap();
        assert_eq!((a.key, a.op, a.commented), ("MACHINE", "?=", true));
        let a = parse_assignment("DISTRO_FEATURES:append = \" x\"").unwrap();
        assert_eq!(a.key, "DISTRO_FEATURES:append");
        let a = parse_assignment("IMAGE_INSTALL += \"x\"").unwrap();
        assert_eq!(a.op, "+=");
        let a = parse_assignment("BBPATH =. \"x\"").unwrap();
        assert_eq!(a.op, "=.");
        let a = parse_assignment("export http_proxy=\"x\"").unwrap();
        assert_eq!(a.key, "http_proxy");
        assert!(parse_assignment("# This is a comment = prose").is_none());
        assert!(parse_assignment("require conf/distro.conf").is_none());
    }

    #[test]
    fn set_key_activates_commented_default() {
        let mut lines = vec![
            "# MACHINE ??= \"qemux86\"".to_string(),
            "DISTRO ?= \"openeuler\"".to_string(),
        ];
        set_key(&mut lines, "MACHINE", "qemuarm64");
        assert_eq!(lines[0], "MACHINE = \"qemuarm64\"");
        assert_eq!(lines.len(), 2);
    }

    #[test]
    fn set_key_comments_out_duplicates() {
        let mut lines = vec![
            "MACHINE ?= \"a\"".to_string(),
            "MACHINE ??= \"b\"".to_string(),
            "MACHINE:append = \"c\"".to_string(),
        ];
        set_key(&mut lines, "MACHINE", "z");
        assert_eq!(
            lines,
            vec![
                "MACHINE = \"z\"",
                "# MACHINE ??= \"b\"",
                "MACHINE:append = \"c\""
            ]
        );
    }

    #[test]
    fn machine_replacement_leaves_single_uncommented_line() {
        let tmp = tempdir().unwrap();
        let paths = paths(&tmp);
        fs::create_dir_all(paths.build_dir.join("conf")).unwrap();
        fs::write(
            paths.local_conf(),
            "# MACHINE ??= \"qemux86\"\nDISTRO ?= \"openeuler\"\n",
        )
        .unwrap();

        write_local_conf(&descriptor(BuildIn::Docker), &paths, None).unwrap();
        let text = fs::read_to_string(paths.local_conf()).unwrap();
        let machine_lines: Vec<&str> = text
            .lines()
            .filter(|l| parse_assignment(l).is_some_and(|a| !a.commented && a.key == "MACHINE"))
            .collect();
        assert_eq!(machine_lines, vec!["MACHINE = \"qemuarm64\""]);
    }

    #[test]
    fn local_conf_is_idempotent() {
        let tmp = tempdir().unwrap();
        let paths = paths(&tmp);
        let sample = paths.recipe_dir.join(TEMPLATE_DIR);
        fs::create_dir_all(&sample).unwrap();
        fs::write(
            sample.join(LOCAL_CONF_SAMPLE),
            "# MACHINE ??= \"qemux86\"\nPACKAGE_CLASSES ?= \"package_rpm\"\nINHERIT += \"rm_work\"\n",
        )
        .unwrap();

        let mut desc = descriptor(BuildIn::Docker);
        desc.toolchain_dir = Some(PathBuf::from("/opt/gcc-aarch64"));
        desc.sstate_dir = Some(PathBuf::from("/data/sstate"));
        desc.local_conf = "FOO = \"1\"\n# INHERIT += \"rm_work\"\n# PACKAGE_CLASSES ?= \"package_rpm\"\n".to_string();

        write_local_conf(&desc, &paths, None).unwrap();
        let first = fs::read_to_string(paths.local_conf()).unwrap();
        write_local_conf(&desc, &paths, None).unwrap();
        let second = fs::read_to_string(paths.local_conf()).unwrap();

        assert_eq!(first, second);
        assert_eq!(first.matches(USER_CONTENT_MARKER).count(), 1);
        assert!(first.contains("EXTERNAL_TOOLCHAIN_aarch64 = \"/usr1/openeuler/gcc/gcc-aarch64\""));
        assert!(first.contains("SSTATE_DIR = \"/data/sstate\""));
        assert!(first.lines().any(|l| l == "# PACKAGE_CLASSES ?= \"package_rpm\""));
        assert!(!first.lines().any(|l| l == "PACKAGE_CLASSES ?= \"package_rpm\""));
        assert!(first.ends_with("FOO = \"1\"\n# INHERIT += \"rm_work\"\n"));
    }

    #[test]
    fn toolchain_key_follows_existing_gcc_naming() {
        let tmp = tempdir().unwrap();
        let paths = paths(&tmp);
        fs::create_dir_all(paths.build_dir.join("conf")).unwrap();
        fs::write(paths.local_conf(), "EXTERNAL_GCC_TOOLCHAIN_arm ?= \"\"\n").unwrap();

        let mut desc = descriptor(BuildIn::Host);
        desc.toolchain_dir = Some(PathBuf::from("/opt/tc"));
        write_local_conf(&desc, &paths, None).unwrap();
        let text = fs::read_to_string(paths.local_conf()).unwrap();
        assert!(text.contains("EXTERNAL_GCC_TOOLCHAIN_aarch64 = \"/opt/tc\""));
        assert!(text.contains(&format!("OPENEULER_SP_DIR = \"{}\"", paths.src_dir.display())));
    }

    #[test]
    fn sstate_mirror_is_mapped_into_container() {
        let tmp = tempdir().unwrap();
        let paths = paths(&tmp);
        let mirror = tmp.path().join("mirror");
        fs::create_dir_all(&mirror).unwrap();
        let mut desc = descriptor(BuildIn::Docker);
        desc.sstate_mirrors = Some(mirror);

        write_local_conf(&desc, &paths, None).unwrap();
        let text = fs::read_to_string(paths.local_conf()).unwrap();
        assert!(text.contains(
            "SSTATE_MIRRORS = \"file://.* file:///usr1/openeuler/sstate-cache/PATH\""
        ));
    }

    #[test]
    fn symlinked_sstate_mirror_keeps_download_file_names() {
        use std::os::unix::fs::symlink;

        let tmp = tempdir().unwrap();
        let paths = paths(&tmp);
        let real = tmp.path().join("mirror-real");
        fs::create_dir_all(&real).unwrap();
        let link = tmp.path().join("mirror");
        symlink(&real, &link).unwrap();
        let mut desc = descriptor(BuildIn::Host);
        desc.sstate_mirrors = Some(link.clone());

        write_local_conf(&desc, &paths, None).unwrap();
        let text = fs::read_to_string(paths.local_conf()).unwrap();
        assert!(text.contains(&format!(
            "SSTATE_MIRRORS = \"file://.* file://{}/PATH;downloadfilename=PATH\"",
            link.display()
        )));
    }

    #[test]
    fn llvm_toolchain_points_into_container() {
        let tmp = tempdir().unwrap();
        let paths = paths(&tmp);
        let mut desc = descriptor(BuildIn::Docker);
        desc.llvm_toolchain_dir = Some(PathBuf::from("/opt/clang-17"));

        write_local_conf(&desc, &paths, None).unwrap();
        let text = fs::read_to_string(paths.local_conf()).unwrap();
        assert!(text.contains("EXTERNAL_LLVM_TOOLCHAIN = \"/usr1/openeuler/llvm\""));
    }

    #[test]
    fn host_nativesdk_sysroot_is_exported() {
        let tmp = tempdir().unwrap();
        let paths = paths(&tmp);
        let sdk_dir = tmp.path().join("sdk");
        let sdk = NativeSdk {
            setup_file: sdk_dir.join("environment-setup-x86_64-pokysdk-linux"),
            sysroot: sdk_dir.join("sysroots").join("x86_64-pokysdk-linux"),
            dir: sdk_dir,
        };

        write_local_conf(&descriptor(BuildIn::Host), &paths, Some(&sdk)).unwrap();
        let text = fs::read_to_string(paths.local_conf()).unwrap();
        assert!(text.contains(&format!(
            "OPENEULER_NATIVESDK_SYSROOT = \"{}\"",
            sdk.sysroot.display()
        )));
    }

    #[test]
    fn regeneration_replaces_user_content() {
        let tmp = tempdir().unwrap();
        let paths = paths(&tmp);
        fs::create_dir_all(paths.build_dir.join("conf")).unwrap();
        fs::write(
            paths.local_conf(),
            format!("KEEP = \"1\"\n{USER_CONTENT_MARKER}\nOLD_FRAGMENT = \"1\"\n"),
        )
        .unwrap();

        let mut desc = descriptor(BuildIn::Host);
        desc.local_conf = "NEW_FRAGMENT = \"1\"\n".to_string();
        write_local_conf(&desc, &paths, None).unwrap();
        let text = fs::read_to_string(paths.local_conf()).unwrap();

        assert!(text.starts_with("KEEP = \"1\"\n"));
        assert!(!text.contains("OLD_FRAGMENT"));
        assert_eq!(text.matches(USER_CONTENT_MARKER).count(), 1);
        assert!(text.ends_with(&format!("{USER_CONTENT_MARKER}\nNEW_FRAGMENT = \"1\"\n")));
    }

    #[test]
    fn layer_list_round_trips_and_deduplicates() {
        let text = "BBPATH = \"${TOPDIR}\"\n\nBBLAYERS ?= \" \\\n  /a/meta \\\n  /a/meta-poky/ \\\n  \"\nBBFILES ?= \"\"\n";
        let mut list = LayerList::parse(text);
        assert_eq!(list.entries(), ["/a/meta", "/a/meta-poky/"]);
        assert_eq!(list.render(), text);

        assert!(!list.add("/a/meta-poky"));
        assert!(list.add("/a/meta-oe/"));
        assert_eq!(list.entries().last().map(String::as_str), Some("/a/meta-oe"));
    }

    #[test]
    fn single_line_layer_list_becomes_multi_line() {
        let mut list = LayerList::parse("BBLAYERS = \"/x /y\"\n");
        assert_eq!(list.entries(), ["/x", "/y"]);
        assert_eq!(list.remove("/y/").unwrap(), 1);
        assert_eq!(list.render(), "BBLAYERS = \" \\\n  /x \\\n  \"\n");
    }

    #[test]
    fn remove_uses_wildcards() {
        let mut list = LayerList::parse(STOCK_BBLAYERS);
        list.add("/src/yocto-poky/meta");
        list.add("/src/yocto-poky/meta-poky");
        list.add("/src/meta-openeuler");
        assert_eq!(list.remove("/src/yocto-poky/*").unwrap(), 2);
        assert_eq!(list.entries(), ["/src/meta-openeuler"]);
    }

    #[test]
    fn layers_are_validated_individually() {
        let tmp = tempdir().unwrap();
        make_layer(tmp.path(), "good");
        fs::create_dir_all(tmp.path().join("bad")).unwrap();

        assert!(validate_layers(tmp.path(), &["good"]).is_ok());
        let err = validate_layers(tmp.path(), &["good", "bad"]).unwrap_err();
        assert!(matches!(err, OebuildError::ConfigError { ref field, .. } if field == "layers"));
    }

    #[test]
    fn materialize_is_idempotent_for_docker_layers() {
        let tmp = tempdir().unwrap();
        let paths = paths(&tmp);
        make_layer(&paths.src_dir, "yocto-poky/meta");
        make_layer(&paths.src_dir, "yocto-meta-openeuler/meta-openeuler");

        let mut desc = descriptor(BuildIn::Docker);
        desc.layers = vec![
            "yocto-poky/meta".to_string(),
            "yocto-meta-openeuler/meta-openeuler".to_string(),
            "yocto-poky/meta".to_string(),
        ];

        materialize(&desc, &paths).unwrap();
        let first = fs::read_to_string(paths.bblayers()).unwrap();
        materialize(&desc, &paths).unwrap();
        assert_eq!(fs::read_to_string(paths.bblayers()).unwrap(), first);

        let list = LayerList::parse(&first);
        assert_eq!(
            list.entries(),
            [
                "/usr1/openeuler/src/yocto-poky/meta",
                "/usr1/openeuler/src/yocto-meta-openeuler/meta-openeuler"
            ]
        );
    }

    #[test]
    fn missing_layer_aborts_materialization() {
        let tmp = tempdir().unwrap();
        let paths = paths(&tmp);
        let mut desc = descriptor(BuildIn::Host);
        desc.layers = vec!["nope".to_string()];
        assert!(materialize(&desc, &paths).is_err());
        assert!(!paths.bblayers().exists());
    }

    #[test]
    fn nativesdk_validation() {
        let tmp = tempdir().unwrap();
        let sdk = tmp.path().join("sdk");
        assert!(matches!(
            resolve_nativesdk(&sdk).unwrap_err(),
            OebuildError::NativesdkNotExist { .. }
        ));

        fs::create_dir_all(&sdk).unwrap();
        let setup = sdk.join("environment-setup-x86_64-pokysdk-linux");
        fs::write(&setup, "export OECORE_NATIVE_SYSROOT=\"/elsewhere/sysroot\"\n").unwrap();
        assert!(matches!(
            resolve_nativesdk(&sdk).unwrap_err(),
            OebuildError::NativesdkNotValid { .. }
        ));

        let sysroot = sdk.join("sysroots").join("x86_64-pokysdk-linux");
        fs::write(
            &setup,
            format!("export OECORE_NATIVE_SYSROOT=\"{}\"\n", sysroot.display()),
        )
        .unwrap();
        let resolved = resolve_nativesdk(&sdk).unwrap();
        assert_eq!(resolved.sysroot, sysroot);
        assert_eq!(resolved.setup_file, setup);
    }

    #[test]
    fn layer_patterns_follow_glob_rules() {
        assert!(layer_pattern("a*c").unwrap().matches("abbbc"));
        assert!(layer_pattern("a?c").unwrap().matches("abc"));
        assert!(layer_pattern("*").unwrap().matches(""));
        assert!(!layer_pattern("a*d").unwrap().matches("abc"));
        assert!(layer_pattern("/src/meta-[ab]").unwrap().matches("/src/meta-b"));
        assert!(!layer_pattern("/src/meta-[ab]").unwrap().matches("/src/meta-c"));
    }

    #[test]
    fn bad_layer_pattern_is_a_config_error() {
        let mut list = LayerList::parse(STOCK_BBLAYERS);
        list.add("/src/meta-openeuler");
        let err = list.remove("/src/meta-[").unwrap_err();
        assert!(matches!(err, OebuildError::ConfigError { .. }));
        assert_eq!(list.entries(), ["/src/meta-openeuler"]);
    }
}
