//! Diagnostic reporting shared by the scanner and the parser.
//!
//! Every diagnostic is rendered to stderr as
//!
//! ```text
//! <filename>:<line>:<col>: <kind>: <message>
//! <trimmed source line>
//!         ^~~~
//! ```
//!
//! with the caret aligned under the offending token. The context also keeps
//! the sticky `has_errors` flag which decides whether an output file may be
//! written, and records everything it emitted so tests can inspect it.

use std::{cell::RefCell, fmt::Display, rc::Rc};

use colored::Colorize;

use crate::lexer::{Origin, Token};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
        })
    }
}

/// One reported diagnostic, as recorded for later inspection.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub severity: Severity,
    pub message: String,
    pub origin: Origin,
}

#[derive(Debug, Default)]
pub struct Diagnostics {
    has_errors: bool,
    emitted: Vec<Diagnostic>,
}

/// The context is created once at the top of the pipeline and handed to
/// scanner and parser alike.
pub type DiagnosticsRef = Rc<RefCell<Diagnostics>>;

impl Diagnostics {
    pub fn shared() -> DiagnosticsRef {
        Rc::new(RefCell::new(Self::default()))
    }

    pub fn has_errors(&self) -> bool {
        self.has_errors
    }

    pub fn emitted(&self) -> &[Diagnostic] {
        &self.emitted
    }

    /// All recorded messages of the given severity.
    pub fn messages(&self, severity: Severity) -> Vec<String> {
        self.emitted
            .iter()
            .filter(|d| d.severity == severity)
            .map(|d| d.message.clone())
            .collect()
    }

    pub fn info(&mut self, origin: &Origin, width: usize, message: &str) {
        self.report(Severity::Info, origin, width, message);
    }

    pub fn warning(&mut self, origin: &Origin, width: usize, message: &str) {
        self.report(Severity::Warning, origin, width, message);
    }

    pub fn error(&mut self, origin: &Origin, width: usize, message: &str) {
        self.has_errors = true;
        self.report(Severity::Error, origin, width, message);
    }

    /// Report an error attributed to a whole token.
    pub fn error_at(&mut self, token: &Token, message: &str) {
        self.error(&token.origin, token.width(), message);
    }

    /// Report a warning attributed to a whole token.
    pub fn warning_at(&mut self, token: &Token, message: &str) {
        self.warning(&token.origin, token.width(), message);
    }

    fn report(&mut self, severity: Severity, origin: &Origin, width: usize, message: &str) {
        let kind = match severity {
            Severity::Info => "info".white().bold(),
            Severity::Warning => "warning".yellow().bold(),
            Severity::Error => "error".red().bold(),
        };
        let header = format!(
            "{}:{}:{}:",
            origin.filename, origin.line_num, origin.col_num
        );

        eprintln!("{} {}: {}", header.white().bold(), kind, message);
        eprintln!("{}", origin.line_str);
        let pad = " ".repeat(origin.col_num.saturating_sub(1));
        let marker = format!("^{}", "~".repeat(width.saturating_sub(1)));
        eprintln!("{}{}", pad, marker.green());

        self.emitted.push(Diagnostic {
            severity,
            message: message.to_owned(),
            origin: origin.clone(),
        });
    }
}
