use std::{error::Error, path::Path};

use test_utils::compile_to_c;

const SRC_PATH: &str = "./demos/floats.src";

#[test]
fn float_literals_are_bit_punned() -> Result<(), Box<dyn Error>> {
    let build = compile_to_c(Path::new(SRC_PATH))?;

    assert!(build.success, "{}", build.stderr);
    assert!(build.stderr.is_empty(), "{}", build.stderr);

    let c_text = build.c_text.expect("no .c file written");
    assert!(c_text.contains("    tmp_float = 0.5;\n"));
    assert!(c_text.contains("    tmp_float = 2.25;\n"));
    assert!(c_text.contains("&tmp_float, sizeof(int));\n"));
    assert!(c_text.contains("    goto putfloat;\n"));

    Ok(())
}
