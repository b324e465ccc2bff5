use std::result::Result as StdResult;

use anyhow::Result;
use liboebuild::OebuildError;
use oebuild_term::{Output, OutputError};

/// Convert output-layer failures into domain errors.
pub fn map_output_error(err: OutputError) -> OebuildError {
    match err {
        OutputError::Cancelled => OebuildError::UserAborted,
        OutputError::Io(e) => OebuildError::IoError(e),
        other => OebuildError::config("prompt", other.to_string()),
    }
}

/// Emit an output result, mapping errors into `OebuildError`.
pub fn emit(result: StdResult<(), OutputError>) -> Result<()> {
    result.map_err(map_output_error)?;
    Ok(())
}

/// Prompt for confirmation; `no_prompt` answers `default` without asking.
pub fn prompt_confirm(
    output: &dyn Output,
    prompt: &str,
    no_prompt: bool,
    default: bool,
) -> Result<bool> {
    if no_prompt {
        return Ok(default);
    }
    Ok(output.confirm(prompt).map_err(map_output_error)?)
}

/// Prompt for a selection, mapping cancellation to `UserAborted`.
pub fn prompt_select(output: &dyn Output, prompt: &str, options: Vec<String>) -> Result<usize> {
    Ok(output.select(prompt, options).map_err(map_output_error)?)
}

/// Prompt for a line of text.
pub fn prompt_input(output: &dyn Output, prompt: &str, default: Option<&str>) -> Result<String> {
    Ok(output.input(prompt, default).map_err(map_output_error)?)
}
