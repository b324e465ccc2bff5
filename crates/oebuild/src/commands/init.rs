use std::path::Path;

use anyhow::Result;
use liboebuild::Oebuild;
use oebuild_term::Output;

use crate::{ui::emit, utils::absolute};

/// Run the `oebuild init` command logic.
pub fn init(
    output: &dyn Output,
    directory: &Path,
    remote_url: Option<&str>,
    branch: Option<&str>,
) -> Result<()> {
    let directory = absolute(directory)?;
    let oebuild = Oebuild::init(&directory, remote_url, branch)?;
    let root = oebuild.workspace().root();

    emit(output.success(&format!("initialized workspace {}", root.display())))?;
    let section = output.section("next steps");
    emit(section.message(&format!("cd {}", root.display())))?;
    emit(section.message("oebuild update"))?;
    emit(section.message("oebuild generate -p <platform>"))?;
    Ok(())
}
