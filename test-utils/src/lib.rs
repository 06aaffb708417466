use std::{
    error::Error,
    fs,
    path::Path,
    process::{Command, Output},
    str,
};

const SLATEC_PATH: &str = "./target/debug/slatec";

/// Outcome of running the compiler on one source file in `--c_only` mode.
pub struct Build {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    /// The emitted translation unit, if one was written.
    pub c_text: Option<String>,
}

fn capture(output: &Output) -> Result<(String, String), Box<dyn Error>> {
    Ok((
        str::from_utf8(&output.stdout)?.to_owned(),
        str::from_utf8(&output.stderr)?.to_owned(),
    ))
}

/// Compile `src_path` down to C only. The generated `.c` file is read and
/// removed again so repeated test runs stay hermetic.
pub fn compile_to_c(src_path: &Path) -> Result<Build, Box<dyn Error>> {
    let output = Command::new(SLATEC_PATH)
        .arg(src_path)
        .arg("--c_only")
        .output()?;
    let (stdout, stderr) = capture(&output)?;

    let c_path = src_path.with_extension("c");
    let c_text = fs::read_to_string(&c_path).ok();
    fs::remove_file(&c_path).ok();

    Ok(Build {
        success: output.status.success(),
        stdout,
        stderr,
        c_text,
    })
}

/// Run the compiler in `--dump-tokens` mode and return its stdout lines.
pub fn dump_tokens(src_path: &Path) -> Result<Vec<String>, Box<dyn Error>> {
    let output = Command::new(SLATEC_PATH)
        .arg(src_path)
        .arg("--dump-tokens")
        .output()?;
    let (stdout, _) = capture(&output)?;
    Ok(stdout.lines().map(str::to_owned).collect())
}
