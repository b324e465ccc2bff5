#![deny(missing_docs)]
#![deny(rustdoc::missing_crate_level_docs)]
//! User-facing output for oebuild: status lines, prompts and progress indicators.
//!
//! Commands talk to an [`Output`] rather than to stdout directly, so the same workflow can run
//! against a colored terminal ([`Terminal`]) or silently ([`Quiet`]). Long-running steps such
//! as image pulls and manifest recovery report through a [`Progress`] handle.

use std::{
    io::{self, Write},
    result::Result as StdResult,
    time::Duration,
};

use crossterm::terminal;
use dialoguer::{
    Confirm, Input, Select,
    theme::{ColorfulTheme, SimpleTheme, Theme},
};
use indicatif::{ProgressBar, ProgressStyle};
use termcolor::{Color, ColorChoice, ColorSpec, StandardStream, WriteColor};
use thiserror::Error;

/// Indentation (in spaces) added by each nested section.
const INDENT: usize = 4;

/// Width used when the terminal size cannot be determined.
const FALLBACK_WIDTH: usize = 100;

/// Spinner redraw interval.
const TICK: Duration = Duration::from_millis(120);

/// Errors produced by [`Output`] implementations.
#[derive(Debug, Error)]
pub enum OutputError {
    /// The backend cannot perform this operation, e.g. prompting in quiet mode.
    #[error("{0}")]
    Unsupported(&'static str),

    /// The caller supplied invalid input, e.g. an empty option list.
    #[error("{0}")]
    InvalidInput(&'static str),

    /// The interactive prompt failed.
    #[error("Prompt error: {0}")]
    Prompt(#[from] dialoguer::Error),

    /// Writing to the terminal failed.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// The user dismissed a prompt.
    #[error("Selection cancelled")]
    Cancelled,
}

/// Result alias for output operations.
pub type Result<T> = StdResult<T, OutputError>;

/// Handle on a running spinner or progress bar.
pub trait Progress: Send + Sync {
    /// Move a bar to `position`. Spinners ignore this.
    fn set_position(&self, position: u64);
    /// Replace the text shown next to the indicator.
    fn set_message(&self, msg: &str);
    /// Stop the indicator, leaving `msg` on screen.
    fn finish(&self, msg: &str);
}

/// Abstraction over how user-facing messages and prompts are produced.
pub trait Output: Send + Sync {
    /// Print an informational message.
    fn message(&self, msg: &str) -> Result<()>;
    /// Print a success message.
    fn success(&self, msg: &str) -> Result<()>;
    /// Print a warning message.
    fn warn(&self, msg: &str) -> Result<()>;
    /// Print an error message on stderr.
    fn fail(&self, msg: &str) -> Result<()>;
    /// Print a `key: value` line.
    fn item(&self, key: &str, value: &str) -> Result<()>;
    /// Ask a yes/no question.
    fn confirm(&self, prompt: &str) -> Result<bool>;
    /// Present `options` and return the index chosen.
    fn select(&self, prompt: &str, options: Vec<String>) -> Result<usize>;
    /// Ask for a line of text, offering `default`.
    fn input(&self, prompt: &str, default: Option<&str>) -> Result<String>;
    /// Start a spinner for a step of unknown length.
    fn spinner(&self, msg: &str) -> Box<dyn Progress>;
    /// Start a bar that counts to `total`.
    fn progress(&self, msg: &str, total: u64) -> Box<dyn Progress>;
    /// Flush buffered output.
    fn finish(&self) -> Result<()>;
    /// Print `header` and return an output whose messages are indented beneath it.
    fn section(&self, header: &str) -> Box<dyn Output>;
}

/// A [`Progress`] that draws nothing.
struct Hidden;

impl Progress for Hidden {
    fn set_position(&self, _position: u64) {}

    fn set_message(&self, _msg: &str) {}

    fn finish(&self, _msg: &str) {}
}

/// Output that prints nothing and refuses to prompt.
pub struct Quiet;

impl Output for Quiet {
    fn message(&self, _msg: &str) -> Result<()> {
        Ok(())
    }

    fn success(&self, _msg: &str) -> Result<()> {
        Ok(())
    }

    fn warn(&self, _msg: &str) -> Result<()> {
        Ok(())
    }

    fn fail(&self, _msg: &str) -> Result<()> {
        Ok(())
    }

    fn item(&self, _key: &str, _value: &str) -> Result<()> {
        Ok(())
    }

    fn confirm(&self, _prompt: &str) -> Result<bool> {
        Err(OutputError::Unsupported(
            "Cannot prompt for confirmation in quiet mode",
        ))
    }

    fn select(&self, _prompt: &str, _options: Vec<String>) -> Result<usize> {
        Err(OutputError::Unsupported(
            "Cannot prompt for selection in quiet mode",
        ))
    }

    fn input(&self, _prompt: &str, _default: Option<&str>) -> Result<String> {
        Err(OutputError::Unsupported("Cannot prompt for input in quiet mode"))
    }

    fn spinner(&self, _msg: &str) -> Box<dyn Progress> {
        Box::new(Hidden)
    }

    fn progress(&self, _msg: &str, _total: u64) -> Box<dyn Progress> {
        Box::new(Hidden)
    }

    fn finish(&self) -> Result<()> {
        Ok(())
    }

    fn section(&self, _header: &str) -> Box<dyn Output> {
        Box::new(Self)
    }
}

/// An indicatif bar or spinner.
struct Bar(ProgressBar);

impl Progress for Bar {
    fn set_position(&self, position: u64) {
        self.0.set_position(position);
    }

    fn set_message(&self, msg: &str) {
        self.0.set_message(msg.to_string());
    }

    fn finish(&self, msg: &str) {
        self.0.finish_with_message(msg.to_string());
    }
}

/// Colored terminal renderer.
pub struct Terminal {
    /// Whether ANSI colors are written.
    color_choice: ColorChoice,
    /// Current indentation in spaces.
    indent: usize,
    /// Column at which messages wrap.
    width: usize,
}

impl Terminal {
    /// Create a terminal output; `color` forces colors on or off.
    pub fn new(color: bool) -> Self {
        let color_choice = if color {
            ColorChoice::Always
        } else {
            ColorChoice::Never
        };
        let width = terminal::size()
            .map(|(cols, _)| usize::from(cols))
            .unwrap_or(FALLBACK_WIDTH);
        Self {
            color_choice,
            indent: 0,
            width,
        }
    }

    /// Prompt theme matching the color setting.
    fn theme(&self) -> Box<dyn Theme> {
        match self.color_choice {
            ColorChoice::Never => Box::new(SimpleTheme),
            _ => Box::new(ColorfulTheme::default()),
        }
    }

    /// Wrap `msg` to the terminal width at the current indentation.
    fn layout(&self, msg: &str) -> String {
        let pad = " ".repeat(self.indent);
        let width = self.width.saturating_sub(self.indent).max(20);
        let options = textwrap::Options::new(width)
            .initial_indent(&pad)
            .subsequent_indent(&pad);
        textwrap::fill(msg, options)
    }

    /// Write `msg` in `color` to `stream`.
    fn write_to(&self, mut stream: StandardStream, msg: &str, color: Color) -> Result<()> {
        stream.set_color(ColorSpec::new().set_fg(Some(color)))?;
        writeln!(stream, "{}", self.layout(msg))?;
        stream.reset()?;
        stream.flush()?;
        Ok(())
    }

    /// Write `msg` in `color` to stdout.
    fn write_colored(&self, msg: &str, color: Color) -> Result<()> {
        self.write_to(StandardStream::stdout(self.color_choice), msg, color)
    }

    /// Style shared by spinners and bars.
    fn style(&self, template: &str) -> ProgressStyle {
        let pad = " ".repeat(self.indent);
        ProgressStyle::with_template(&format!("{pad}{template}"))
            .unwrap_or_else(|_| ProgressStyle::default_bar())
    }
}

impl Output for Terminal {
    fn message(&self, msg: &str) -> Result<()> {
        self.write_colored(msg, Color::Cyan)
    }

    fn success(&self, msg: &str) -> Result<()> {
        self.write_colored(msg, Color::Green)
    }

    fn warn(&self, msg: &str) -> Result<()> {
        self.write_colored(msg, Color::Yellow)
    }

    fn fail(&self, msg: &str) -> Result<()> {
        self.write_to(StandardStream::stderr(self.color_choice), msg, Color::Red)
    }

    fn item(&self, key: &str, value: &str) -> Result<()> {
        let mut stdout = StandardStream::stdout(self.color_choice);
        write!(stdout, "{}", " ".repeat(self.indent))?;
        stdout.set_color(ColorSpec::new().set_bold(true))?;
        write!(stdout, "{key}:")?;
        stdout.reset()?;
        writeln!(stdout, " {value}")?;
        stdout.flush()?;
        Ok(())
    }

    fn confirm(&self, prompt: &str) -> Result<bool> {
        let theme = self.theme();
        Confirm::with_theme(theme.as_ref())
            .with_prompt(prompt)
            .default(false)
            .interact_opt()?
            .ok_or(OutputError::Cancelled)
    }

    fn select(&self, prompt: &str, options: Vec<String>) -> Result<usize> {
        if options.is_empty() {
            return Err(OutputError::InvalidInput(
                "No options provided for selection",
            ));
        }
        let theme = self.theme();
        Select::with_theme(theme.as_ref())
            .with_prompt(prompt)
            .items(&options)
            .default(0)
            .interact_opt()?
            .ok_or(OutputError::Cancelled)
    }

    fn input(&self, prompt: &str, default: Option<&str>) -> Result<String> {
        let theme = self.theme();
        let mut input = Input::<String>::with_theme(theme.as_ref()).with_prompt(prompt);
        if let Some(default) = default {
            input = input.default(default.to_string());
        }
        Ok(input.interact_text()?)
    }

    fn spinner(&self, msg: &str) -> Box<dyn Progress> {
        let bar = ProgressBar::new_spinner();
        bar.set_style(self.style("{spinner:.cyan} {msg}"));
        bar.set_message(msg.to_string());
        bar.enable_steady_tick(TICK);
        Box::new(Bar(bar))
    }

    fn progress(&self, msg: &str, total: u64) -> Box<dyn Progress> {
        let bar = ProgressBar::new(total);
        bar.set_style(self.style("{msg} [{bar:30.cyan/blue}] {pos}/{len} ({percent}%)"));
        bar.set_message(msg.to_string());
        Box::new(Bar(bar))
    }

    fn finish(&self) -> Result<()> {
        io::stdout().flush()?;
        Ok(())
    }

    fn section(&self, header: &str) -> Box<dyn Output> {
        // A header that fails to print does not stop the nested output.
        self.message(header).ok();
        Box::new(Self {
            color_choice: self.color_choice,
            indent: self.indent + INDENT,
            width: self.width,
        })
    }
}
