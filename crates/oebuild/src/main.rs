#![deny(missing_docs)]
#![deny(rustdoc::missing_crate_level_docs)]
//! Command-line front-end for openEuler embedded builds, built on the liboebuild crate.

use std::{
    env,
    io::{self, IsTerminal, Write},
    process,
    sync::Arc,
};

use anyhow::Result;
use clap::Parser;
use liboebuild::{Oebuild, OebuildError};
use oebuild_term::{Output, Quiet, Terminal};
use tracing_subscriber::EnvFilter;

/// Command-line argument definitions.
mod args;
/// Subcommand implementations.
mod commands;
/// Output and prompt helpers.
mod ui;
/// Path and runtime helpers.
mod utils;

use crate::args::{Cli, ClearTarget, Commands, GenerateRequest, ListTarget, UpdateRequest};

/// Environment variable holding the log filter.
const LOG_ENV: &str = "OEBUILD_LOG";

/// Install the stderr log subscriber. `OEBUILD_LOG` wins over `--verbose`.
fn init_tracing(verbose: bool) {
    let fallback = if verbose {
        "warn,liboebuild=debug,oebuild=debug"
    } else {
        "warn"
    };
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(fallback));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}

/// Whether to write ANSI colors.
fn use_color(cli: &Cli) -> bool {
    if cli.color {
        true
    } else if cli.no_color || env::var_os("NO_COLOR").is_some() {
        false
    } else {
        io::stdout().is_terminal()
    }
}

/// Report a failure through `output`, falling back to stderr.
fn report(output: &dyn Output, msg: &str) {
    if let Err(display_err) = output.fail(msg) {
        eprintln!("Failed to report error via output handler: {display_err:#}");
    }
    if let Err(finish_err) = output.finish() {
        eprintln!("Failed to flush output handler: {finish_err:#}");
    }
}

/// CLI entrypoint.
fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let color = use_color(&cli);
    let output: Arc<dyn Output> = if cli.quiet {
        Arc::new(Quiet)
    } else {
        Arc::new(Terminal::new(color))
    };

    if let Err(e) = run(cli, &output) {
        if color && io::stdout().is_terminal() {
            print!("\x1b[0m");
            if let Err(flush_err) = io::stdout().flush() {
                eprintln!("Failed to flush stdout while resetting colors: {flush_err}");
            }
        }

        let exit_code = match e.downcast_ref::<OebuildError>() {
            Some(err @ OebuildError::CommandExit { .. }) => err.exit_code(),
            Some(err @ OebuildError::UserAborted) => {
                if let Err(finish_err) = output.finish() {
                    eprintln!("Failed to flush output handler: {finish_err:#}");
                }
                err.exit_code()
            }
            Some(err) => {
                report(output.as_ref(), &format!("{e:#}"));
                err.exit_code()
            }
            None => {
                report(output.as_ref(), &format!("{e:#}"));
                1
            }
        };

        process::exit(exit_code);
    }
    Ok(())
}

/// Execute the selected CLI command using the provided output implementation.
fn run(cli: Cli, output: &Arc<dyn Output>) -> Result<()> {
    let output = output.as_ref();
    let progress = !cli.quiet;

    if let Commands::Init {
        directory,
        remote_url,
        branch,
    } = &cli.command
    {
        commands::init::init(output, directory, remote_url.as_deref(), branch.as_deref())?;
        output.finish()?;
        return Ok(());
    }

    let cwd = env::current_dir()?;
    let oebuild = Oebuild::discover(&cwd)?;

    match cli.command {
        Commands::Init { .. } => {}
        Commands::Update {
            tag,
            list,
            enable,
            ignore,
        } => match list {
            Some(ListTarget::Docker) => commands::update::list_tags(&oebuild, output)?,
            None => {
                let request = UpdateRequest::new(tag, &enable, &ignore);
                commands::update::update(&oebuild, output, &request, cli.no_prompt, progress)?;
            }
        },
        Commands::Generate {
            platform,
            features,
            directory,
            toolchain_dir,
            llvm_toolchain_dir,
            nativesdk_dir,
            sstate_mirrors,
            sstate_dir,
            tmp_dir,
            datetime,
            no_fetch,
            no_layer,
            build_in,
            compile_file,
            docker_image,
            list,
        } => {
            if list {
                commands::generate::list(&oebuild, output)?;
            } else {
                commands::generate::generate(
                    &oebuild,
                    output,
                    GenerateRequest {
                        platform,
                        features,
                        directory,
                        toolchain_dir,
                        llvm_toolchain_dir,
                        nativesdk_dir,
                        sstate_mirrors,
                        sstate_dir,
                        tmp_dir,
                        datetime,
                        no_fetch,
                        no_layer,
                        build_in,
                        compile_file,
                        docker_image,
                    },
                    cli.no_prompt,
                )?;
            }
        }
        Commands::Bitbake {
            docker_image,
            command,
        } => {
            commands::bitbake::bitbake(
                &oebuild,
                output,
                docker_image.as_deref(),
                &command,
                progress,
            )?;
        }
        Commands::Manifest {
            create,
            recover: _,
            manifest,
        } => {
            if create {
                commands::manifest::create(&oebuild, output, &manifest)?;
            } else {
                commands::manifest::recover(&oebuild, output, &manifest)?;
            }
        }
        Commands::Clear { target } => match target {
            ClearTarget::Docker => commands::clear::clear_docker(&oebuild, output, cli.no_prompt)?,
        },
        Commands::DockerSave { image } => {
            commands::docker_save::docker_save(&oebuild, output, &image)?;
        }
    }

    output.finish()?;
    Ok(())
}
