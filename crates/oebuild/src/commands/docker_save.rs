use std::env;

use anyhow::Result;
use liboebuild::Oebuild;
use oebuild_term::Output;

use crate::{ui::emit, utils::docker};

/// Run the `oebuild docker-save` command logic.
pub fn docker_save(oebuild: &Oebuild, output: &dyn Output, image: &str) -> Result<()> {
    let cwd = env::current_dir()?;
    let context = oebuild.context_at(&cwd)?;
    let runtime = docker()?;
    let spinner = output.spinner(&format!("committing {}", context.name));
    match oebuild.docker_save(&context, runtime.as_ref(), image) {
        Ok(reference) => {
            spinner.finish("done");
            emit(output.success(&format!("saved {reference}")))
        }
        Err(e) => {
            spinner.finish("commit failed");
            Err(e.into())
        }
    }
}
