use std::env;

use anyhow::Result;
use liboebuild::{BuildIn, Oebuild, home_dir};
use oebuild_term::Output;

use crate::{ui::emit, utils::docker};

/// Run the `oebuild bitbake` command logic.
///
/// With no arguments the build environment opens interactively; otherwise the arguments are
/// handed to `bitbake` and its exit status becomes the process exit status.
pub fn bitbake(
    oebuild: &Oebuild,
    output: &dyn Output,
    docker_image: Option<&str>,
    command: &[String],
    progress: bool,
) -> Result<()> {
    let cwd = env::current_dir()?;
    let mut context = oebuild.context_at(&cwd)?;

    if let Some(image) = docker_image {
        oebuild.set_docker_image(&mut context, image)?;
        emit(output.message(&format!("{} now builds in {image}", context.name)))?;
    }

    let fetched = oebuild.fetch_missing_repos(&context.descriptor, progress)?;
    if !fetched.is_empty() {
        emit(output.message(&format!("fetched {}", fetched.join(", "))))?;
    }

    let runtime = match context.descriptor.build_in {
        BuildIn::Docker => Some(docker()?),
        BuildIn::Host => None,
    };
    let joined = (!command.is_empty()).then(|| command.join(" "));
    let execution = Oebuild::execution_for(&context, joined.as_deref());

    // The session owns the terminal from here on.
    emit(output.finish())?;
    oebuild.bitbake(&context, runtime.as_deref(), &execution, home_dir()?)?;
    Ok(())
}
