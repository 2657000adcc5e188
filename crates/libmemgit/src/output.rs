use std::{
    io::{self, Write},
    result::Result as StdResult,
    time::Duration,
};

use indicatif::{ProgressBar, ProgressStyle};
use termcolor::{Color, ColorChoice, ColorSpec, StandardStream, WriteColor};
use thiserror::Error;

/// Indentation level (in spaces) used for nested output sections.
const INDENT: usize = 4;

/// Spinner tick interval.
const TICK: Duration = Duration::from_millis(100);

/// Errors produced by [`Output`] implementations.
#[derive(Debug, Error)]
pub enum OutputError {
    /// Underlying I/O error while writing to the terminal.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Convenience alias for output-related fallible operations.
pub type Result<T> = StdResult<T, OutputError>;

/// Abstraction over how user-facing progress messages are produced.
pub trait Output: Send + Sync {
    /// Print an informational message.
    fn message(&self, msg: &str) -> Result<()>;
    /// Print a success message.
    fn success(&self, msg: &str) -> Result<()>;
    /// Print a warning message.
    fn warn(&self, msg: &str) -> Result<()>;
    /// Print an error/failure message.
    fn fail(&self, msg: &str) -> Result<()>;
    /// Flush any buffered output.
    fn finish(&self) -> Result<()>;
    /// Create a nested output section that indents subsequent messages.
    fn section(&self, header: &str) -> Box<dyn Output>;
    /// Start a spinner for a long-running step.
    fn spinner(&self, msg: &str) -> Spinner;
}

/// Output implementation that suppresses all messages.
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

    fn finish(&self) -> Result<()> {
        Ok(())
    }

    fn section(&self, _header: &str) -> Box<dyn Output> {
        Box::new(Self)
    }

    fn spinner(&self, _msg: &str) -> Spinner {
        Spinner::hidden()
    }
}

/// Color-capable terminal renderer for user messages.
///
/// Messages go to stdout; failures go to stderr so they survive redirection.
pub struct Terminal {
    /// Whether ANSI colors are emitted.
    color_choice: ColorChoice,
    /// Current indentation in spaces.
    indent: usize,
}

impl Terminal {
    /// Create a new terminal output.
    ///
    /// - `color`: when `true`, always render colored output; when `false`,
    ///   disable ANSI colors.
    pub fn new(color: bool) -> Self {
        let color_choice = if color {
            ColorChoice::Always
        } else {
            ColorChoice::Never
        };
        Self {
            color_choice,
            indent: 0,
        }
    }

    /// Write `msg` in `color` to `stream` at the current indent.
    fn write_colored(&self, mut stream: StandardStream, msg: &str, color: Color) -> Result<()> {
        stream.set_color(ColorSpec::new().set_fg(Some(color)))?;
        writeln!(stream, "{}{msg}", " ".repeat(self.indent))?;
        stream.reset()?;
        stream.flush()?;
        Ok(())
    }

    /// Colored line on stdout.
    fn stdout(&self, msg: &str, color: Color) -> Result<()> {
        self.write_colored(StandardStream::stdout(self.color_choice), msg, color)
    }
}

impl Output for Terminal {
    fn message(&self, msg: &str) -> Result<()> {
        self.stdout(msg, Color::Cyan)
    }

    fn success(&self, msg: &str) -> Result<()> {
        self.stdout(msg, Color::Green)
    }

    fn warn(&self, msg: &str) -> Result<()> {
        self.stdout(msg, Color::Rgb(255, 165, 0)) // Orange
    }

    fn fail(&self, msg: &str) -> Result<()> {
        self.write_colored(StandardStream::stderr(self.color_choice), msg, Color::Red)
    }

    fn finish(&self) -> Result<()> {
        io::stdout().flush()?;
        Ok(())
    }

    fn section(&self, header: &str) -> Box<dyn Output> {
        self.message(header).ok();
        Box::new(Self {
            color_choice: self.color_choice,
            indent: self.indent + INDENT,
        })
    }

    fn spinner(&self, msg: &str) -> Spinner {
        Spinner::start(&format!("{}{msg}", " ".repeat(self.indent)))
    }
}

/// Progress spinner for network steps. Hidden when not attached to a terminal.
pub struct Spinner {
    /// Underlying progress bar; `None` for quiet output.
    bar: Option<ProgressBar>,
}

impl Spinner {
    /// Spinner that draws nothing.
    pub fn hidden() -> Self {
        Self { bar: None }
    }

    /// Start a ticking spinner showing `msg`.
    fn start(msg: &str) -> Self {
        let bar = ProgressBar::new_spinner();
        bar.enable_steady_tick(TICK);
        bar.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        bar.set_message(msg.to_string());
        Self { bar: Some(bar) }
    }

    /// Stop the spinner and leave a success message in its place.
    pub fn finish_success(&self, msg: &str) {
        if let Some(bar) = &self.bar {
            bar.finish_with_message(msg.to_string());
        }
    }

    /// Stop the spinner and leave a failure message in its place.
    pub fn finish_fail(&self, msg: &str) {
        if let Some(bar) = &self.bar {
            bar.abandon_with_message(msg.to_string());
        }
    }

    /// Stop the spinner and erase it.
    pub fn finish_clear(&self) {
        if let Some(bar) = &self.bar {
            bar.finish_and_clear();
        }
    }
}
