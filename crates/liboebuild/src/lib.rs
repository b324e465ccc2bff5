#![deny(missing_docs)]
#![deny(rustdoc::missing_crate_level_docs)]
//! Core library for oebuild, the workspace and build-context front-end for openEuler embedded
//! builds.
//!
//! A workspace holds checked-out repositories under `src/` and build contexts under `build/`.
//! This crate composes platform and feature templates into a compile descriptor, materializes
//! the descriptor into `bblayers.conf` and `local.conf`, and drives the build engine in a host
//! shell or a container. Rendering and prompting live in `oebuild-term` and the `oebuild`
//! binary.

/// Container runtime driver.
pub mod docker;
/// Host shell and container sessions.
pub mod environment;
/// Error type shared by every operation.
mod error;
/// Git driver.
pub mod git;
/// Repository snapshots and restores.
pub mod manifest;
/// `bblayers.conf` and `local.conf` generation.
pub mod materialize;
/// Top-level workflows.
mod oebuild;
/// Reversible shell init file edits.
pub mod splice;
/// YAML documents and the environment record.
pub mod store;
/// Template composition.
pub mod template;
/// Document and descriptor types.
pub mod types;
/// Workspace layout and discovery.
pub mod workspace;

pub use error::{OebuildError, Result, container_error, vcs_error};
pub use oebuild::{
    BuildContext, ClearReport, GenerateOptions, Oebuild, RecipeSync, RepoFailure, home_dir,
    parse_image_reference,
};
pub use types::{BuildIn, CompileDescriptor};
pub use workspace::Workspace;
