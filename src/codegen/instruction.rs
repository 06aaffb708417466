use std::fmt::Display;

/// Render a frame-relative address expression, folding the sign of the
/// offset into the operator.
pub fn frame_expr(mem: i64) -> String {
    if mem >= 0 {
        format!("FP + {mem}")
    } else {
        format!("FP - {}", -mem)
    }
}

fn indexed(base: String, off: Option<usize>) -> String {
    match off {
        Some(reg) => format!("M[{base} + R[{reg}]]"),
        None => format!("M[{base}]"),
    }
}

/// One emitted target-machine statement. Every variant renders as exactly
/// one line of C: statements carry a four-space indent and a trailing `;`,
/// label definitions sit flush left and end with `:`.
#[derive(Debug, Clone)]
pub enum Instruction {
    Label(String),
    Goto(String),
    /// Computed goto through a register holding a label address.
    GotoReg(usize),
    /// `if (R[reg] == 0) goto label;`
    BranchZero(usize, String),
    /// `R[dst] = <expr>;` for an arbitrary right-hand side.
    SetReg(usize, String),
    /// `R[dst] = M[FP + mem];`, optionally indexed by an offset register.
    LoadFrame {
        dst: usize,
        mem: i64,
        off: Option<usize>,
    },
    /// `M[FP + mem] = R[src];`, optionally indexed by an offset register.
    StoreFrame {
        src: usize,
        mem: i64,
        off: Option<usize>,
    },
    /// Absolute store into the global region.
    StoreGlobal {
        src: usize,
        addr: usize,
        off: Option<usize>,
    },
    /// `M[R[addr]] = R[src];` for stores through a pointer slot.
    StoreIndirect { src: usize, addr: usize },
    /// `M[SP] = R[src];` (first half of a push).
    StoreStack(usize),
    /// `M[SP] = (int)&&label;` (pushing a return address).
    StoreStackLabel(String),
    SpInc,
    SpDec,
    IncSp(usize),
    DecSp(usize),
    /// `FP = <expr>;`
    SetFp(String),
    SetFpToSp,
    SetSpToFp,
    /// `tmp_float = <literal>;`
    SetTmpFloat(String),
    /// `memcpy(&R[dst], &tmp_float, sizeof(int));`
    PunFloat(usize),
    Comment(String),
    /// A raw pre-formatted statement.
    Raw(String),
    Blank,
}

impl Display for Instruction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let line = match self {
            Instruction::Label(name) => return write!(f, "{name}:"),
            Instruction::Blank => return Ok(()),
            Instruction::Goto(label) => format!("goto {label};"),
            Instruction::GotoReg(reg) => format!("goto *(void *)R[{reg}];"),
            Instruction::BranchZero(reg, label) => format!("if (R[{reg}] == 0) goto {label};"),
            Instruction::SetReg(dst, expr) => format!("R[{dst}] = {expr};"),
            Instruction::LoadFrame { dst, mem, off } => {
                format!("R[{dst}] = {};", indexed(frame_expr(*mem), *off))
            }
            Instruction::StoreFrame { src, mem, off } => {
                format!("{} = R[{src}];", indexed(frame_expr(*mem), *off))
            }
            Instruction::StoreGlobal { src, addr, off } => {
                format!("{} = R[{src}];", indexed(addr.to_string(), *off))
            }
            Instruction::StoreIndirect { src, addr } => format!("M[R[{addr}]] = R[{src}];"),
            Instruction::StoreStack(src) => format!("M[SP] = R[{src}];"),
            Instruction::StoreStackLabel(label) => format!("M[SP] = (int)&&{label};"),
            Instruction::SpInc => "SP++;".to_owned(),
            Instruction::SpDec => "SP--;".to_owned(),
            Instruction::IncSp(n) => format!("SP = SP + {n};"),
            Instruction::DecSp(n) => format!("SP = SP - {n};"),
            Instruction::SetFp(expr) => format!("FP = {expr};"),
            Instruction::SetFpToSp => "FP = SP;".to_owned(),
            Instruction::SetSpToFp => "SP = FP;".to_owned(),
            Instruction::SetTmpFloat(literal) => format!("tmp_float = {literal};"),
            Instruction::PunFloat(dst) => format!("memcpy(&R[{dst}], &tmp_float, sizeof(int));"),
            Instruction::Comment(text) => format!("/* {text} */"),
            Instruction::Raw(text) => text.to_owned(),
        };
        write!(f, "    {line}")
    }
}
