use anyhow::Result;
use liboebuild::{Oebuild, OebuildError};
use oebuild_term::Output;

use crate::{
    ui::{emit, prompt_confirm},
    utils::docker,
};

/// Run the `oebuild clear docker` command logic. Per-context failures are warnings.
pub fn clear_docker(oebuild: &Oebuild, output: &dyn Output, no_prompt: bool) -> Result<()> {
    if !prompt_confirm(
        output,
        "Stop and remove every container recorded by build contexts?",
        no_prompt,
        true,
    )? {
        return Err(OebuildError::UserAborted.into());
    }
    let runtime = docker()?;
    let report = oebuild.clear_containers(runtime.as_ref())?;

    if report.removed.is_empty() && report.busy.is_empty() && report.failures.is_empty() {
        emit(output.message("No containers recorded."))?;
        return Ok(());
    }
    for (name, id) in &report.removed {
        emit(output.success(&format!("removed {id} ({name})")))?;
    }
    for name in &report.busy {
        emit(output.warn(&format!("{name} is in use, skipped")))?;
    }
    for failure in &report.failures {
        emit(output.warn(&format!("{}: {}", failure.name, failure.error)))?;
    }
    Ok(())
}
