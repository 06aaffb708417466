//! # slatec
//!
//! This binary is the Slate compiler driver. It wires scanner, parser and
//! code generator together, writes the generated C translation unit, and
//! hands final machine-code generation to gcc.

mod cli;

use cli::*;

use std::{
    fs,
    path::Path,
    process::{Command, ExitCode},
};

use log::{error, info};
use slate_lang::{codegen::CodeGen, diagnostics::Diagnostics, lexer::Scanner, parser::Parser};

fn main() -> ExitCode {
    let args = Cli::init();

    simple_logger::init_with_level((&args.verbosity).into()).expect("logger init failed");

    let diagnostics = Diagnostics::shared();
    let scanner = match Scanner::open(&args.file, diagnostics.clone()) {
        Ok(scanner) => scanner,
        Err(err) => {
            error!("could not open '{}': {err}", args.file.to_string_lossy());
            return ExitCode::FAILURE;
        }
    };

    if args.dump_tokens {
        for token in scanner {
            println!("{token}");
        }
        return if diagnostics.borrow().has_errors() {
            ExitCode::FAILURE
        } else {
            ExitCode::SUCCESS
        };
    }

    let parser = Parser::new(scanner, CodeGen::new(), diagnostics.clone());
    let gen = parser.parse();

    if diagnostics.borrow().has_errors() {
        println!("BUILD FAILED");
        return ExitCode::FAILURE;
    }

    let stem = args.file.with_extension("");
    let c_file = args.file.with_extension("c");

    let inline_path = args.runtime.join("runtime_inline.c");
    let runtime_inline = match fs::read_to_string(&inline_path) {
        Ok(source) => source,
        Err(err) => {
            error!("could not read '{}': {err}", inline_path.to_string_lossy());
            return ExitCode::FAILURE;
        }
    };

    info!("Writing '{}'...", c_file.to_string_lossy());
    if let Err(err) = gen.write_file(&c_file, &runtime_inline) {
        error!("could not write '{}': {err}", c_file.to_string_lossy());
        return ExitCode::FAILURE;
    }

    if args.c_only {
        return ExitCode::SUCCESS;
    }

    match compile_c(&c_file, &stem, &args.runtime) {
        Ok(()) => {}
        Err(code) => return code,
    }

    if args.run {
        info!("Running '{}'...", stem.to_string_lossy());
        return match Command::new(&stem).status() {
            Ok(status) => ExitCode::from(status.code().unwrap_or(1) as u8),
            Err(err) => {
                error!("could not run '{}': {err}", stem.to_string_lossy());
                ExitCode::FAILURE
            }
        };
    }

    ExitCode::SUCCESS
}

/// Invoke the external C toolchain on the generated translation unit. The
/// runtime uses `int`-sized label addresses, hence the 32-bit target and the
/// silenced pointer-cast warnings.
fn compile_c(c_file: &Path, out_file: &Path, runtime_dir: &Path) -> Result<(), ExitCode> {
    info!("Compiling '{}'...", c_file.to_string_lossy());

    let output = Command::new("gcc")
        .args([
            "-m32",
            "-Wno-int-to-pointer-cast",
            "-Wno-pointer-to-int-cast",
            "-o",
        ])
        .arg(out_file)
        .arg("-I")
        .arg(runtime_dir)
        .arg(runtime_dir.join("runtime.c"))
        .arg(c_file)
        .output();

    let output = match output {
        Ok(output) => output,
        Err(err) => {
            error!("could not invoke gcc: {err}");
            return Err(ExitCode::FAILURE);
        }
    };

    let stderr = String::from_utf8_lossy(&output.stderr);
    if !stderr.is_empty() {
        error!("{stderr}");
    }

    if !output.status.success() {
        error!("GCC ERROR");
        return Err(ExitCode::from(output.status.code().unwrap_or(1) as u8));
    }

    Ok(())
}
