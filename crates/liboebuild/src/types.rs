use std::{collections::BTreeMap, fmt, path::PathBuf, str::FromStr};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::{OebuildError, Result};

/// Where a build context executes the build engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildIn {
    /// Inside a pre-provisioned container.
    #[default]
    Docker,
    /// Directly on the host, activated through a nativesdk.
    Host,
}

impl fmt::Display for BuildIn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Docker => f.write_str("docker"),
            Self::Host => f.write_str("host"),
        }
    }
}

impl FromStr for BuildIn {
    type Err = OebuildError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "docker" => Ok(Self::Docker),
            "host" => Ok(Self::Host),
            other => Err(OebuildError::config(
                "build_in",
                format!("expected 'docker' or 'host', got '{other}'"),
            )),
        }
    }
}

/// Workspace-level configuration stored under the sentinel directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceConfig {
    /// Container image coordinates.
    pub docker: DockerConfig,
    /// Repositories every workspace needs, keyed by name.
    pub basic_repo: IndexMap<String, BasicRepo>,
}

/// Container image repository and the branch to tag mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DockerConfig {
    /// Image repository, e.g. `swr.cn-north-4.myhuaweicloud.com/openeuler-embedded/openeuler-container`.
    pub repo_url: String,
    /// Recipe tree branch to image tag.
    pub tag_map: IndexMap<String, String>,
}

/// A repository the workspace itself requires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BasicRepo {
    /// Directory name under `src/`.
    pub path: String,
    /// Upstream URL.
    pub remote_url: String,
    /// Branch to track.
    pub branch: String,
}

/// Kind tag carried by every template document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TemplateKind {
    /// Selects the machine and toolchain.
    Platform,
    /// Optional functionality layered onto a platform.
    Feature,
    /// Shared defaults.
    Common,
}

impl fmt::Display for TemplateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Platform => f.write_str("platform"),
            Self::Feature => f.write_str("feature"),
            Self::Common => f.write_str("common"),
        }
    }
}

/// Source coordinates of a repo named in a template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoSource {
    /// Upstream URL.
    pub url: String,
    /// Branch or tag.
    pub refspec: String,
}

/// A platform, feature or common template document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Template {
    /// Template kind.
    #[serde(rename = "type")]
    pub kind: TemplateKind,
    /// Machine name (platform only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub machine: Option<String>,
    /// Toolchain variable name (platform only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub toolchain_type: Option<String>,
    /// `|`-separated platform names a feature applies to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub support: Option<String>,
    /// Repositories keyed by local name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repos: Option<IndexMap<String, RepoSource>>,
    /// Layer paths, relative to the workspace source tree.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layers: Option<Vec<String>>,
    /// Free-form `local.conf` fragment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_conf: Option<String>,
}

impl Template {
    /// Platform names listed in `support`, empty when unrestricted.
    pub fn support_set(&self) -> Vec<&str> {
        self.support
            .as_deref()
            .map(|s| {
                s.split('|')
                    .map(str::trim)
                    .filter(|p| !p.is_empty())
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// A repository to fetch, as listed in a compile descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoSpec {
    /// Directory name under `src/`.
    pub name: String,
    /// Upstream URL.
    pub url: String,
    /// Branch or tag.
    pub refspec: String,
}

/// Container coordinates for a docker build context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DockerParam {
    /// Image reference.
    pub image: String,
    /// Extra runtime parameters, e.g. `-itd --network host`.
    pub parameters: String,
    /// Bind mounts as `<host>:<container>`.
    pub volumes: Vec<String>,
    /// Container main command.
    pub command: String,
}

/// The merged, materializable description of one build context (`compile.yaml`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompileDescriptor {
    /// Execution mode.
    pub build_in: BuildIn,
    /// `MACHINE` value.
    pub machine: String,
    /// Name of the `local.conf` variable that points at the external toolchain.
    pub toolchain_type: String,
    /// Host directory of an external GCC toolchain.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub toolchain_dir: Option<PathBuf>,
    /// Host directory of an external LLVM toolchain.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llvm_toolchain_dir: Option<PathBuf>,
    /// Host directory of the nativesdk (host builds).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nativesdk_dir: Option<PathBuf>,
    /// Host directory used as an sstate mirror.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sstate_mirrors: Option<PathBuf>,
    /// `SSTATE_DIR` override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sstate_dir: Option<PathBuf>,
    /// `TMPDIR` override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tmp_dir: Option<PathBuf>,
    /// Skip layer materialization.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub no_layer: Option<bool>,
    /// Repositories the build needs.
    #[serde(default)]
    pub repos: Vec<RepoSpec>,
    /// `local.conf` fragment.
    #[serde(default)]
    pub local_conf: String,
    /// Layer paths, relative to the workspace source tree.
    #[serde(default)]
    pub layers: Vec<String>,
    /// Container coordinates, required for docker builds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docker_param: Option<DockerParam>,
    /// Commands run non-interactively when `bitbake` is invoked without one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bitbake_cmds: Option<Vec<String>>,
}

impl CompileDescriptor {
    /// Check cross-field invariants.
    pub fn validate(&self) -> Result<()> {
        if self.machine.trim().is_empty() {
            return Err(OebuildError::config("machine", "must not be empty"));
        }
        if self.toolchain_type.trim().is_empty() {
            return Err(OebuildError::config("toolchain_type", "must not be empty"));
        }
        if self.build_in == BuildIn::Docker && self.docker_param.is_none() {
            return Err(OebuildError::config(
                "docker_param",
                "required when build_in is docker",
            ));
        }
        Ok(())
    }

    /// Whether layers should be written to `bblayers.conf`.
    pub fn wants_layers(&self) -> bool {
        !self.no_layer.unwrap_or(false)
    }

    /// Docker parameters, or a config error for host contexts.
    pub fn require_docker(&self) -> Result<&DockerParam> {
        self.docker_param.as_ref().ok_or_else(|| {
            OebuildError::config("docker_param", "build context is not a docker build")
        })
    }
}

/// Container reference persisted in an environment record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerRecord {
    /// Short container id.
    pub short_id: String,
}

/// Per-build-context note of the associated container (`.env`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvRecord {
    /// Currently associated container, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<ContainerRecord>,
}

impl EnvRecord {
    /// Short id of the recorded container.
    pub fn short_id(&self) -> Option<&str> {
        self.container.as_ref().map(|c| c.short_id.as_str())
    }
}

/// A repository pinned to a commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PinnedRepo {
    /// Upstream URL.
    pub remote_url: String,
    /// Commit sha.
    pub version: String,
}

/// A pinned snapshot of a workspace `src/`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    /// Repositories keyed by local name, sorted.
    pub manifest_list: BTreeMap<String, PinnedRepo>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(build_in: BuildIn) -> CompileDescriptor {
        CompileDescriptor {
            build_in,
            machine: "qemu-aarch64".to_string(),
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

    #[test]
    fn docker_descriptor_requires_docker_param() {
        let err = descriptor(BuildIn::Docker).validate().unwrap_err();
        assert!(matches!(err, OebuildError::ConfigError { ref field, .. } if field == "docker_param"));
        assert!(descriptor(BuildIn::Host).validate().is_ok());
    }

    #[test]
    fn support_set_splits_on_pipes() {
        let template = Template {
            kind: TemplateKind::Feature,
            machine: None,
            toolchain_type: None,
            support: Some("qemu-aarch64 | raspberrypi4-64|".to_string()),
            repos: None,
            layers: None,
            local_conf: None,
        };
        assert_eq!(template.support_set(), vec!["qemu-aarch64", "raspberrypi4-64"]);
    }

    #[test]
    fn descriptor_keys_follow_emission_order() {
        let mut desc = descriptor(BuildIn::Host);
        desc.nativesdk_dir = Some(PathBuf::from("/opt/sdk"));
        desc.local_conf = "A = \"1\"\nB = \"2\"\n".to_string();
        desc.layers = vec!["yocto-poky/meta".to_string()];
        let text = serde_yaml::to_string(&desc).unwrap();
        let keys: Vec<&str> = text
            .lines()
            .filter(|l| !l.starts_with(' ') && !l.starts_with('-') && l.contains(':'))
            .map(|l| l.split(':').next().unwrap())
            .collect();
        assert_eq!(
            keys,
            vec![
                "build_in",
                "machine",
                "toolchain_type",
                "nativesdk_dir",
                "repos",
                "local_conf",
                "layers"
            ]
        );
        assert!(text.contains("local_conf: |"));
    }

    #[test]
    fn build_in_parses_known_values() {
        assert_eq!("docker".parse::<BuildIn>().unwrap(), BuildIn::Docker);
        assert_eq!("host".parse::<BuildIn>().unwrap(), BuildIn::Host);
        assert!("vm".parse::<BuildIn>().is_err());
    }
}
