use std::path::Path;

use anyhow::Result;
use liboebuild::{Oebuild, OebuildError};
use oebuild_term::Output;

use crate::{ui::emit, utils::absolute};

/// Write a manifest of every repository under `src/`.
pub fn create(oebuild: &Oebuild, output: &dyn Output, path: &Path) -> Result<()> {
    let path = absolute(path)?;
    let manifest = oebuild.create_manifest(&path)?;
    emit(output.success(&format!(
        "recorded {} repositories in {}",
        manifest.manifest_list.len(),
        path.display()
    )))?;
    Ok(())
}

/// Restore the repositories under `src/` from a manifest.
pub fn recover(oebuild: &Oebuild, output: &dyn Output, path: &Path) -> Result<()> {
    let path = absolute(path)?;
    let mut bar = None;
    let report = oebuild.recover_manifest(&path, |step| {
        let bar = bar.get_or_insert_with(|| output.progress("restoring", step.total as u64));
        bar.set_message(&step.name);
        bar.set_position(step.completed as u64);
    })?;
    if let Some(bar) = bar {
        bar.finish(&format!("{} restored", report.restored.len()));
    }

    if report.is_complete() {
        emit(output.success(&format!(
            "restored {} repositories",
            report.restored.len()
        )))?;
        return Ok(());
    }
    let section = output.section("failed");
    for (name, error) in &report.failed {
        emit(section.fail(&format!("{name}: {error}")))?;
    }
    Err(OebuildError::VcsError(format!(
        "{} of {} repositories could not be restored",
        report.failed.len(),
        report.failed.len() + report.restored.len()
    ))
    .into())
}
