use anyhow::Result;
use liboebuild::{GenerateOptions, Oebuild, OebuildError};
use oebuild_term::Output;

use crate::{
    args::GenerateRequest,
    ui::{emit, prompt_input, prompt_select},
    utils::absolute_opt,
};

/// Print the platforms and features offered by the recipe tree.
pub fn list(oebuild: &Oebuild, output: &dyn Output) -> Result<()> {
    let (platforms, features) = oebuild.list_templates()?;

    let section = output.section("platforms");
    if platforms.is_empty() {
        emit(section.message("(none)"))?;
    }
    for platform in &platforms {
        emit(section.message(platform))?;
    }

    let section = output.section("features");
    if features.is_empty() {
        emit(section.message("(none)"))?;
    }
    for feature in &features {
        let support = if feature.support.is_empty() {
            "all".to_string()
        } else {
            feature.support.join("|")
        };
        emit(section.item(&feature.name, &support))?;
    }
    Ok(())
}

/// Run the `oebuild generate` command logic.
pub fn generate(
    oebuild: &Oebuild,
    output: &dyn Output,
    request: GenerateRequest,
    no_prompt: bool,
) -> Result<()> {
    let mut options = GenerateOptions {
        platform: request.platform.unwrap_or_default(),
        features: request.features,
        name: request.directory,
        build_in: request.build_in,
        toolchain_dir: absolute_opt(request.toolchain_dir.as_deref())?,
        llvm_toolchain_dir: absolute_opt(request.llvm_toolchain_dir.as_deref())?,
        nativesdk_dir: absolute_opt(request.nativesdk_dir.as_deref())?,
        sstate_mirrors: absolute_opt(request.sstate_mirrors.as_deref())?,
        sstate_dir: absolute_opt(request.sstate_dir.as_deref())?,
        tmp_dir: absolute_opt(request.tmp_dir.as_deref())?,
        no_fetch: request.no_fetch,
        no_layer: request.no_layer,
        datetime: request.datetime,
        docker_image: request.docker_image,
        compile_file: absolute_opt(request.compile_file.as_deref())?,
    };

    resolve_name(oebuild, output, &mut options, no_prompt)?;
    let context = oebuild.generate(&options)?;

    emit(output.success(&format!(
        "generated {}",
        context.descriptor_path().display()
    )))?;
    let section = output.section(&context.name);
    emit(section.item("machine", &context.descriptor.machine))?;
    emit(section.item("toolchain", &context.descriptor.toolchain_type))?;
    emit(section.item("build in", &context.descriptor.build_in.to_string()))?;
    if let Some(param) = &context.descriptor.docker_param {
        emit(section.item("image", &param.image))?;
    }

    let next = output.section("next steps");
    emit(next.message(&format!("cd {}", context.dir.display())))?;
    emit(next.message("oebuild bitbake"))?;
    Ok(())
}

/// Settle on a context name that either does not exist or may be overwritten.
fn resolve_name(
    oebuild: &Oebuild,
    output: &dyn Output,
    options: &mut GenerateOptions,
    no_prompt: bool,
) -> Result<()> {
    loop {
        let name = options.context_name();
        if !oebuild.context_exists(&name) || no_prompt {
            return Ok(());
        }
        let choice = prompt_select(
            output,
            &format!("Build context '{name}' already exists"),
            vec![
                "Overwrite it".to_string(),
                "Use another name".to_string(),
                "Abort".to_string(),
            ],
        )?;
        match choice {
            0 => return Ok(()),
            1 => {
                let name = prompt_input(output, "New build context name", None)?;
                let name = name.trim();
                if name.is_empty() {
                    return Err(OebuildError::config("directory", "name must not be empty").into());
                }
                options.name = Some(name.to_string());
            }
            _ => return Err(OebuildError::UserAborted.into()),
        }
    }
}
