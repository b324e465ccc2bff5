use std::path::PathBuf;

use clap::{ArgGroup, Parser, Subcommand, ValueEnum};
use liboebuild::BuildIn;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(group(
    ArgGroup::new("color_mode")
        .args(["color", "no_color"])
))]
/// Top-level CLI options for oebuild.
pub struct Cli {
    /// Enable colored output
    #[arg(long, global = true)]
    pub color: bool,

    /// Disable colored output
    #[arg(long = "no-color", global = true)]
    pub no_color: bool,

    /// Suppress all output
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Skip confirmation prompts, taking the default answer
    #[arg(long, global = true)]
    pub no_prompt: bool,

    /// Log debug details to stderr
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    /// The workflow to run.
    pub command: Commands,
}

/// Steps of `oebuild update`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum UpdateStep {
    /// Pull the build container image.
    Docker,
    /// Update the recipe tree.
    Meta,
    /// Update the repositories of the current build context.
    Layer,
}

impl UpdateStep {
    /// Name as written on the command line.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Docker => "docker",
            Self::Meta => "meta",
            Self::Layer => "layer",
        }
    }
}

/// What `oebuild update --list` shows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ListTarget {
    /// The branch to image tag map.
    Docker,
}

/// Resources `oebuild clear` removes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ClearTarget {
    /// Containers recorded by build contexts.
    Docker,
}

#[derive(Subcommand)]
/// CLI subcommands supported by oebuild.
pub enum Commands {
    /// Create a new workspace
    Init {
        /// Directory to create
        directory: PathBuf,

        /// Remote URL of the recipe tree
        #[arg(short = 'u', long = "remote_url", value_name = "URL")]
        remote_url: Option<String>,

        /// Branch of the recipe tree
        #[arg(short, long, value_name = "BRANCH")]
        branch: Option<String>,
    },

    /// Update the recipe tree, the container image and build repositories
    Update {
        /// Container image tag to pull, overriding the branch mapping
        #[arg(short, long, value_name = "TAG")]
        tag: Option<String>,

        /// List instead of updating
        #[arg(short, long, value_name = "WHAT")]
        list: Option<ListTarget>,

        /// Run only these steps
        #[arg(short, long = "enable", value_name = "STEP")]
        enable: Vec<UpdateStep>,

        /// Skip these steps
        #[arg(short, long = "ignore", value_name = "STEP")]
        ignore: Vec<UpdateStep>,
    },

    /// Compose templates into a build context
    #[command(group(
        ArgGroup::new("source")
            .args(["platform", "compile_file", "list"])
            .required(true)
    ))]
    Generate {
        /// Platform template
        #[arg(short, long, value_name = "PLATFORM")]
        platform: Option<String>,

        /// Feature template (repeatable, applied in order)
        #[arg(short, long = "feature", value_name = "FEATURE")]
        features: Vec<String>,

        /// Build context name, defaults to the platform
        #[arg(short = 'd', long = "directory", value_name = "NAME")]
        directory: Option<String>,

        /// External GCC toolchain directory
        #[arg(short = 't', long = "toolchain_dir", value_name = "DIR")]
        toolchain_dir: Option<PathBuf>,

        /// External LLVM toolchain directory
        #[arg(long = "llvm_toolchain_dir", value_name = "DIR")]
        llvm_toolchain_dir: Option<PathBuf>,

        /// Nativesdk directory for host builds
        #[arg(short = 'n', long = "nativesdk_dir", value_name = "DIR")]
        nativesdk_dir: Option<PathBuf>,

        /// sstate-cache mirror directory
        #[arg(short = 's', long = "sstate_mirrors", value_name = "DIR")]
        sstate_mirrors: Option<PathBuf>,

        /// SSTATE_DIR override
        #[arg(long = "sstate_dir", value_name = "DIR")]
        sstate_dir: Option<PathBuf>,

        /// TMPDIR override
        #[arg(long = "tmp_dir", value_name = "DIR")]
        tmp_dir: Option<PathBuf>,

        /// Build timestamp written as DATETIME
        #[arg(long, value_name = "STAMP")]
        datetime: Option<String>,

        /// Disable repository fetching during the build
        #[arg(long = "no_fetch")]
        no_fetch: bool,

        /// Keep bblayers.conf at its stock content
        #[arg(long = "no_layer")]
        no_layer: bool,

        /// Where the build runs: docker (default) or host
        #[arg(long = "build_in", alias = "b_in", value_name = "MODE", value_parser = parse_build_in)]
        build_in: Option<BuildIn>,

        /// Install this compile descriptor instead of composing templates
        #[arg(short = 'c', long = "compile", value_name = "FILE")]
        compile_file: Option<PathBuf>,

        /// Container image for docker builds
        #[arg(long = "with-docker-image", value_name = "IMAGE")]
        docker_image: Option<String>,

        /// List platforms and features
        #[arg(short, long)]
        list: bool,
    },

    /// Enter the build environment of the current build context
    Bitbake {
        /// Replace the container image and remember it
        #[arg(long = "with-docker-image", value_name = "IMAGE")]
        docker_image: Option<String>,

        /// Bitbake arguments; an interactive shell is opened when omitted
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },

    /// Snapshot or restore the repositories under src/
    #[command(group(
        ArgGroup::new("mode")
            .args(["create", "recover"])
            .required(true)
    ))]
    Manifest {
        /// Write a manifest
        #[arg(short, long)]
        create: bool,

        /// Restore from a manifest
        #[arg(short, long)]
        recover: bool,

        /// Manifest file
        #[arg(short = 'm', long = "manifest_dir", alias = "m_dir", value_name = "PATH")]
        manifest: PathBuf,
    },

    /// Remove resources created by build contexts
    Clear {
        /// What to remove
        target: ClearTarget,
    },

    /// Commit the current build context's container to an image
    #[command(name = "docker-save")]
    DockerSave {
        /// Target image as repo:tag
        image: String,
    },
}

/// Parse `docker` or `host`.
fn parse_build_in(value: &str) -> Result<BuildIn, String> {
    value.parse().map_err(|e: liboebuild::OebuildError| e.to_string())
}

/// Parameters for `oebuild generate`.
pub struct GenerateRequest {
    /// Platform template.
    pub platform: Option<String>,
    /// Feature templates.
    pub features: Vec<String>,
    /// Build context name.
    pub directory: Option<String>,
    /// External GCC toolchain.
    pub toolchain_dir: Option<PathBuf>,
    /// External LLVM toolchain.
    pub llvm_toolchain_dir: Option<PathBuf>,
    /// Nativesdk directory.
    pub nativesdk_dir: Option<PathBuf>,
    /// sstate mirror directory.
    pub sstate_mirrors: Option<PathBuf>,
    /// SSTATE_DIR override.
    pub sstate_dir: Option<PathBuf>,
    /// TMPDIR override.
    pub tmp_dir: Option<PathBuf>,
    /// Build timestamp.
    pub datetime: Option<String>,
    /// Disable fetching.
    pub no_fetch: bool,
    /// Stock bblayers.conf.
    pub no_layer: bool,
    /// Execution mode, when given.
    pub build_in: Option<BuildIn>,
    /// Descriptor to install.
    pub compile_file: Option<PathBuf>,
    /// Container image.
    pub docker_image: Option<String>,
}

/// Parameters for `oebuild update`.
pub struct UpdateRequest {
    /// Explicit image tag.
    pub tag: Option<String>,
    /// Steps to run.
    pub steps: Vec<UpdateStep>,
}

impl UpdateRequest {
    /// Resolve `-e`/`-i` into the steps to run, in execution order.
    pub fn new(tag: Option<String>, enable: &[UpdateStep], ignore: &[UpdateStep]) -> Self {
        let wanted: &[UpdateStep] = if enable.is_empty() {
            &[UpdateStep::Meta, UpdateStep::Docker]
        } else {
            enable
        };
        let steps = [UpdateStep::Meta, UpdateStep::Docker, UpdateStep::Layer]
            .into_iter()
            .filter(|s| wanted.contains(s) && !ignore.contains(s))
            .collect();
        Self { tag, steps }
    }
}
