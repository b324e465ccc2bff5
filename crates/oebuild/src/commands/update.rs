use std::env;

use anyhow::Result;
use liboebuild::{Oebuild, OebuildError};
use oebuild_term::Output;

use crate::{
    args::{UpdateRequest, UpdateStep},
    ui::{emit, prompt_select},
    utils::docker,
};

/// Print the branch to image tag map.
pub fn list_tags(oebuild: &Oebuild, output: &dyn Output) -> Result<()> {
    let config = oebuild.config()?;
    let section = output.section(&format!("images from {}", config.docker.repo_url));
    for (branch, tag) in &config.docker.tag_map {
        emit(section.item(branch, tag))?;
    }
    Ok(())
}

/// Run the `oebuild update` command logic.
///
/// Every requested step runs even when an earlier one fails; the first failure decides the
/// exit status once all steps are done.
pub fn update(
    oebuild: &Oebuild,
    output: &dyn Output,
    request: &UpdateRequest,
    no_prompt: bool,
    progress: bool,
) -> Result<()> {
    let mut first_error = None;
    let mut failed = Vec::new();
    for step in &request.steps {
        let result = match step {
            UpdateStep::Meta => update_meta(oebuild, output, progress),
            UpdateStep::Docker => update_docker(oebuild, output, request.tag.as_deref(), no_prompt),
            UpdateStep::Layer => update_layers(oebuild, output, progress),
        };
        if let Err(e) = result {
            if matches!(e.downcast_ref::<OebuildError>(), Some(OebuildError::UserAborted)) {
                return Err(e);
            }
            emit(output.fail(&format!("{} update failed: {e:#}", step.name())))?;
            failed.push(step.name());
            if first_error.is_none() {
                first_error = Some(e);
            }
        }
    }
    match first_error {
        None => Ok(()),
        Some(e) => Err(e.context(format!("update failed for: {}", failed.join(", ")))),
    }
}

/// Bring the recipe tree up to date.
fn update_meta(oebuild: &Oebuild, output: &dyn Output, progress: bool) -> Result<()> {
    emit(output.message("updating recipe tree"))?;
    let sync = oebuild.sync_recipe_tree(progress)?;
    if let Some(backup) = &sync.backup {
        emit(output.warn(&format!(
            "remote changed, previous checkout moved to {}",
            backup.display()
        )))?;
    }
    emit(output.success(&format!(
        "{} is at {}",
        sync.path.display(),
        sync.branch
    )))?;
    Ok(())
}

/// Pull the container image for the recipe tree's branch.
fn update_docker(
    oebuild: &Oebuild,
    output: &dyn Output,
    tag: Option<&str>,
    no_prompt: bool,
) -> Result<()> {
    let config = oebuild.config()?;
    let tag = match tag {
        Some(tag) => tag.to_string(),
        None => match Oebuild::mapped_tag(&config)? {
            Some(tag) => tag,
            None => {
                let choices: Vec<(String, String)> = config
                    .docker
                    .tag_map
                    .iter()
                    .map(|(b, t)| (b.clone(), t.clone()))
                    .collect();
                if no_prompt || choices.is_empty() {
                    return Err(OebuildError::config(
                        "tag_map",
                        "the recipe tree branch has no image tag; pass --tag",
                    )
                    .into());
                }
                let labels = choices
                    .iter()
                    .map(|(branch, tag)| format!("{tag} ({branch})"))
                    .collect();
                let index = prompt_select(output, "Which image tag should be pulled?", labels)?;
                choices[index].1.clone()
            }
        },
    };

    let image = Oebuild::image_for_tag(&config, &tag);
    let runtime = docker()?;
    emit(output.message(&format!("pulling {image}")))?;
    if oebuild.pull_image(runtime.as_ref(), &image)? {
        emit(output.success(&format!("pulled {image}")))?;
    } else {
        emit(output.success(&format!("{image} is up to date")))?;
    }
    Ok(())
}

/// Update every repository of the current build context.
fn update_layers(oebuild: &Oebuild, output: &dyn Output, progress: bool) -> Result<()> {
    let cwd = env::current_dir()?;
    let context = oebuild.context_at(&cwd)?;
    let repos = &context.descriptor.repos;
    emit(output.message(&format!(
        "updating {} repositories of {}",
        repos.len(),
        context.name
    )))?;

    let failures = oebuild.sync_repos(repos, progress);
    if failures.is_empty() {
        emit(output.success("repositories updated"))?;
        return Ok(());
    }
    let section = output.section("failed");
    for failure in &failures {
        emit(section.fail(&format!("{}: {}", failure.name, failure.error)))?;
    }
    let names: Vec<_> = failures.iter().map(|f| f.name.as_str()).collect();
    Err(OebuildError::VcsError(format!("failed to update {}", names.join(", "))).into())
}
