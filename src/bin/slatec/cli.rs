//! CLI argument parsing for slatec.

use clap::{Parser, ValueEnum};

/// Struct containing the CLI configuration for slatec.
#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct Cli {
    /// The path to the .src source file.
    #[arg(index = 1)]
    pub file: std::path::PathBuf,

    /// Only generate the .c file, do not invoke the C toolchain.
    #[arg(short = 'c', long = "c_only")]
    pub c_only: bool,

    /// Run the program after compiling it.
    #[arg(short, long)]
    pub run: bool,

    /// Scan only: print the token stream and exit.
    #[arg(long)]
    pub dump_tokens: bool,

    /// Directory holding runtime.h, runtime.c and runtime_inline.c.
    #[arg(long, default_value = "runtime")]
    pub runtime: std::path::PathBuf,

    /// Specify the log level of the compiler.
    #[arg(value_enum, short, long, default_value_t = LogLevel::default())]
    pub verbosity: LogLevel,
}

impl Cli {
    pub fn init() -> Self {
        Cli::parse()
    }
}

/// Enum for specifying the log level of slatec.
#[derive(ValueEnum, Clone, Default, Debug)]
pub enum LogLevel {
    /// Only critical errors will be logged.
    #[default]
    #[value(alias("0"))]
    Error,

    /// Also log warnings about the compilation flow.
    #[value(alias("1"))]
    Warn,

    /// Also log which files are written and compiled.
    #[value(alias("2"))]
    Info,

    /// Log internal state of the compiler.
    #[value(alias("3"))]
    Debug,

    /// Log everything, including the token stream as it is consumed.
    #[value(alias("4"))]
    Trace,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        })
    }
}

impl From<&LogLevel> for log::Level {
    fn from(value: &LogLevel) -> Self {
        match value {
            LogLevel::Error => log::Level::Error,
            LogLevel::Warn => log::Level::Warn,
            LogLevel::Info => log::Level::Info,
            LogLevel::Debug => log::Level::Debug,
            LogLevel::Trace => log::Level::Trace,
        }
    }
}
