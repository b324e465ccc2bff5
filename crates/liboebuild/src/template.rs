use std::{
    fs,
    path::{Path, PathBuf},
};

use indexmap::IndexMap;
use tracing::debug;

use crate::{
    error::{OebuildError, Result},
    store,
    types::{RepoSource, RepoSpec, Template, TemplateKind},
};

/// Directory inside the recipe tree holding the templates.
pub const TEMPLATE_DIR: &str = ".oebuild";

/// Path of the common template relative to [`TEMPLATE_DIR`].
const COMMON_FILE: &str = "common.yaml";

/// Directory of platform templates relative to [`TEMPLATE_DIR`].
const PLATFORM_DIR: &str = "platform";

/// Directory of feature templates relative to [`TEMPLATE_DIR`].
const FEATURE_DIR: &str = "features";

/// Lines synthesized into the composed `local_conf`.
#[derive(Debug, Clone, Default)]
pub struct ComposeOptions {
    /// Build timestamp emitted as `DATETIME`.
    pub datetime: Option<String>,
    /// Emit `OPENEULER_FETCH = "disable"`.
    pub no_fetch: bool,
}

/// The merged output of a platform, its features and the common base.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Composition {
    /// Platform name.
    pub platform: String,
    /// `MACHINE` value from the platform.
    pub machine: String,
    /// Toolchain variable name from the platform.
    pub toolchain_type: String,
    /// Repositories, in encounter order.
    pub repos: Vec<RepoSpec>,
    /// Layer paths in concatenation order (common, platform, features).
    pub layers: Vec<String>,
    /// Features fragments, then platform, then common, then synthesized lines.
    pub local_conf: String,
}

/// A loaded platform.
#[derive(Debug)]
struct Platform {
    /// Platform name.
    name: String,
    /// `MACHINE` value.
    machine: String,
    /// Toolchain variable name.
    toolchain_type: String,
    /// Platform `local_conf` fragment.
    fragment: String,
}

/// Accumulates templates in order and merges them.
#[derive(Debug)]
pub struct Composer {
    /// `<recipe tree>/.oebuild`.
    template_dir: PathBuf,
    /// Repositories keyed by local name.
    repos: IndexMap<String, RepoSource>,
    /// Layers in encounter order.
    layers: Vec<String>,
    /// Common `local_conf` fragment.
    common_fragment: String,
    /// Selected platform.
    platform: Option<Platform>,
    /// Feature `local_conf` fragments in declared order.
    feature_fragments: Vec<String>,
}

impl Composer {
    /// Start a composition seeded from the recipe tree's common template.
    pub fn new(recipe_dir: &Path) -> Result<Self> {
        let mut composer = Self {
            template_dir: recipe_dir.join(TEMPLATE_DIR),
            repos: IndexMap::new(),
            layers: Vec::new(),
            common_fragment: String::new(),
            platform: None,
            feature_fragments: Vec::new(),
        };

        let common_path = composer.template_dir.join(COMMON_FILE);
        if !common_path.is_file() {
            return Err(OebuildError::config(
                "common",
                format!(
                    "{} not found; run `oebuild update` to fetch the recipe tree",
                    common_path.display()
                ),
            ));
        }
        let common = load(&common_path, TemplateKind::Common)?;
        composer.absorb(&common);
        composer.common_fragment = common.local_conf.unwrap_or_default();
        Ok(composer)
    }

    /// Merge repos and layers of `template` into the accumulators.
    fn absorb(&mut self, template: &Template) {
        if let Some(repos) = &template.repos {
            for (name, source) in repos {
                self.repos.insert(name.clone(), source.clone());
            }
        }
        if let Some(layers) = &template.layers {
            self.layers.extend(layers.iter().cloned());
        }
    }

    /// Load the platform template `name`.
    pub fn add_platform(&mut self, name: &str) -> Result<()> {
        if let Some(existing) = &self.platform {
            return Err(OebuildError::config(
                "platform",
                format!("platform '{}' is already selected", existing.name),
            ));
        }
        let path = self.template_dir.join(PLATFORM_DIR).join(format!("{name}.yaml"));
        if !path.is_file() {
            return Err(OebuildError::config(
                "platform",
                format!("unknown platform '{name}'"),
            ));
        }
        let template = load(&path, TemplateKind::Platform)?;
        let machine = required(template.machine.as_deref(), "machine", &path)?;
        let toolchain_type = required(template.toolchain_type.as_deref(), "toolchain_type", &path)?;

        self.absorb(&template);
        self.platform = Some(Platform {
            name: name.to_string(),
            machine,
            toolchain_type,
            fragment: template.local_conf.unwrap_or_default(),
        });
        debug!(platform = name, "loaded platform template");
        Ok(())
    }

    /// Load the feature template `name`; the platform must already be selected.
    pub fn add_feature(&mut self, name: &str) -> Result<()> {
        let Some(platform) = &self.platform else {
            return Err(OebuildError::config(
                "feature",
                format!("feature '{name}' requires a platform to be selected first"),
            ));
        };
        let path = self.template_dir.join(FEATURE_DIR).join(format!("{name}.yaml"));
        if !path.is_file() {
            return Err(OebuildError::config(
                "feature",
                format!("unknown feature '{name}'"),
            ));
        }
        let template = load(&path, TemplateKind::Feature)?;
        let support = template.support_set();
        if !support.is_empty() && !support.contains(&platform.name.as_str()) {
            return Err(OebuildError::FeatureMismatch {
                feature: name.to_string(),
                platform: platform.name.clone(),
                support: support.join("|"),
            });
        }

        self.absorb(&template);
        self.feature_fragments
            .push(template.local_conf.unwrap_or_default());
        debug!(feature = name, "loaded feature template");
        Ok(())
    }

    /// Produce the merged composition.
    pub fn finish(self, options: &ComposeOptions) -> Result<Composition> {
        let platform = self
            .platform
            .ok_or_else(|| OebuildError::config("platform", "no platform selected"))?;

        let mut local_conf = String::new();
        for fragment in self
            .feature_fragments
            .iter()
            .chain([&platform.fragment, &self.common_fragment])
        {
            push_fragment(&mut local_conf, fragment);
        }
        if let Some(stamp) = &options.datetime {
            push_fragment(&mut local_conf, &format!("DATETIME = \"{stamp}\""));
        }
        if options.no_fetch {
            push_fragment(&mut local_conf, "OPENEULER_FETCH = \"disable\"");
        }

        let repos = self
            .repos
            .into_iter()
            .map(|(name, source)| RepoSpec {
                name,
                url: source.url,
                refspec: source.refspec,
            })
            .collect();

        Ok(Composition {
            platform: platform.name,
            machine: platform.machine,
            toolchain_type: platform.toolchain_type,
            repos,
            layers: self.layers,
            local_conf,
        })
    }
}

/// Compose `platform` and `features` from the templates in `recipe_dir`.
pub fn compose(
    recipe_dir: &Path,
    platform: &str,
    features: &[String],
    options: &ComposeOptions,
) -> Result<Composition> {
    let mut composer = Composer::new(recipe_dir)?;
    composer.add_platform(platform)?;
    for feature in features {
        composer.add_feature(feature)?;
    }
    composer.finish(options)
}

/// Append `fragment` with a guaranteed trailing newline.
fn push_fragment(out: &mut String, fragment: &str) {
    if fragment.trim().is_empty() {
        return;
    }
    out.push_str(fragment);
    if !fragment.ends_with('\n') {
        out.push('\n');
    }
}

/// Read a template and check its `type` tag.
fn load(path: &Path, expected: TemplateKind) -> Result<Template> {
    let template: Template = store::read_document(path)?;
    if template.kind != expected {
        return Err(OebuildError::config(
            "type",
            format!(
                "{} is a {} template, expected {expected}",
                path.display(),
                template.kind
            ),
        ));
    }
    Ok(template)
}

/// A mandatory platform field.
fn required(value: Option<&str>, field: &str, path: &Path) -> Result<String> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v.to_string()),
        _ => Err(OebuildError::config(
            field,
            format!("missing in {}", path.display()),
        )),
    }
}

/// A feature template and the platforms it supports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeatureInfo {
    /// Feature name.
    pub name: String,
    /// Supported platforms, empty for all.
    pub support: Vec<String>,
}

/// Template file stems in `dir`, sorted.
fn template_names(dir: &Path) -> Result<Vec<String>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut names = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().is_some_and(|e| e == "yaml")
            && let Some(stem) = path.file_stem().and_then(|s| s.to_str())
        {
            names.push(stem.to_string());
        }
    }
    names.sort();
    Ok(names)
}

/// Platforms available in the recipe tree.
pub fn list_platforms(recipe_dir: &Path) -> Result<Vec<String>> {
    template_names(&recipe_dir.join(TEMPLATE_DIR).join(PLATFORM_DIR))
}

/// Features available in the recipe tree.
pub fn list_features(recipe_dir: &Path) -> Result<Vec<FeatureInfo>> {
    let dir = recipe_dir.join(TEMPLATE_DIR).join(FEATURE_DIR);
    template_names(&dir)?
        .into_iter()
        .map(|name| {
            let template: Template = store::read_document(&dir.join(format!("{name}.yaml")))?;
            let support = template
                .support_set()
                .into_iter()
                .map(str::to_string)
                .collect();
            Ok(FeatureInfo { name, support })
        })
        .collect()
}
