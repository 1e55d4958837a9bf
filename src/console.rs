//! Console output for a translation run.
//!
//! Styled `[LABEL] message` lines, with color only when stdout is a
//! terminal and `NO_COLOR` is unset. Debug traces go through `log`
//! instead; this is what the user reads.

use std::io::{self, IsTerminal};

/// Longest sample shown in the run report, in characters.
const SAMPLE_WIDTH: usize = 160;

/// ANSI styles used by the console.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Style {
    Bold,
    Dim,
    Red,
    Green,
    Yellow,
    Blue,
    Magenta,
    Cyan,
}

impl Style {
    fn sgr(self) -> u8 {
        match self {
            Style::Bold => 1,
            Style::Dim => 2,
            Style::Red => 31,
            Style::Green => 32,
            Style::Yellow => 33,
            Style::Blue => 34,
            Style::Magenta => 35,
            Style::Cyan => 36,
        }
    }
}

/// Kind of a console line; decides label, color and stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Info,
    Ok,
    Warn,
    Error,
    Step,
}

impl Level {
    fn label(self) -> &'static str {
        match self {
            Level::Info => "INFO",
            Level::Ok => "OK",
            Level::Warn => "WARN",
            Level::Error => "ERROR",
            Level::Step => "STEP",
        }
    }

    fn color(self) -> Style {
        match self {
            Level::Info => Style::Blue,
            Level::Ok => Style::Green,
            Level::Warn => Style::Yellow,
            Level::Error => Style::Red,
            Level::Step => Style::Cyan,
        }
    }
}

/// Styled terminal output.
#[derive(Debug, Clone)]
pub struct Console {
    colors_enabled: bool,
}

impl Default for Console {
    fn default() -> Self {
        Self::new()
    }
}

impl Console {
    /// Creates a console, enabling colors for an interactive stdout unless
    /// `NO_COLOR` is set.
    pub fn new() -> Self {
        let colors_enabled = std::env::var_os("NO_COLOR").is_none() && io::stdout().is_terminal();
        Self { colors_enabled }
    }

    /// Creates a console with colors forced on or off.
    pub fn with_colors(enabled: bool) -> Self {
        Self {
            colors_enabled: enabled,
        }
    }

    /// Wraps `text` in the given styles when colors are enabled.
    pub fn style(&self, text: &str, styles: &[Style]) -> String {
        if !self.colors_enabled || styles.is_empty() {
            return text.to_string();
        }
        let codes: Vec<String> = styles.iter().map(|s| s.sgr().to_string()).collect();
        format!("\x1b[{}m{}\x1b[0m", codes.join(";"), text)
    }

    /// Formats one console line without printing it.
    pub fn line(&self, level: Level, message: &str) -> String {
        let label = self.style(level.label(), &[level.color(), Style::Bold]);
        format!("[{}] {}", label, message)
    }

    fn emit(&self, level: Level, message: &str) {
        let line = self.line(level, message);
        match level {
            Level::Error => eprintln!("{}", line),
            _ => println!("{}", line),
        }
    }

    pub fn info(&self, message: &str) {
        self.emit(Level::Info, message);
    }

    pub fn success(&self, message: &str) {
        self.emit(Level::Ok, message);
    }

    pub fn warning(&self, message: &str) {
        self.emit(Level::Warn, message);
    }

    /// Prints to stderr.
    pub fn error(&self, message: &str) {
        self.emit(Level::Error, message);
    }

    pub fn step(&self, message: &str) {
        self.emit(Level::Step, message);
    }

    /// Prints a blank line and a bold magenta heading.
    pub fn section(&self, title: &str) {
        println!();
        println!("{}", self.style(title, &[Style::Magenta, Style::Bold]));
    }

    /// Formats a document position like `[Document 2/7]`.
    pub fn document_info(&self, position: usize, total: usize) -> String {
        self.style(
            &format!("[Document {}/{}]", position, total),
            &[Style::Cyan, Style::Bold],
        )
    }

    /// Formats a count in bold green.
    pub fn count(&self, n: usize) -> String {
        self.style(&n.to_string(), &[Style::Green, Style::Bold])
    }

    /// Prints one numbered sample of translated markup, shortened to fit
    /// on a line.
    pub fn sample(&self, number: usize, markup: &str) {
        let number = self.style(&format!("{:>2}.", number), &[Style::Dim]);
        println!("{} {}", number, shorten(markup, SAMPLE_WIDTH));
    }
}

/// Collapses whitespace runs and cuts `text` to `width` characters.
fn shorten(text: &str, width: usize) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() <= width {
        return collapsed;
    }
    let mut cut: String = collapsed.chars().take(width.saturating_sub(3)).collect();
    cut.push_str("...");
    cut
}
