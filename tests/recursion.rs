use std::{error::Error, path::Path};

use test_utils::compile_to_c;

const SRC_PATH: &str = "./demos/fact.src";

#[test]
fn recursive_procedure_compiles() -> Result<(), Box<dyn Error>> {
    let build = compile_to_c(Path::new(SRC_PATH))?;

    assert!(build.success, "{}", build.stderr);
    assert!(build.stderr.is_empty(), "{}", build.stderr);

    let c_text = build.c_text.expect("no .c file written");
    assert!(c_text.contains("\nfactorial_start_1:\n"));

    let calls = c_text.matches("    goto factorial_start_1;\n").count();
    assert_eq!(calls, 2, "recursive call and main call expected");

    Ok(())
}
