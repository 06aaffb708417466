//! Code generation against the flat register/memory target machine.
//!
//! The generator is a strictly append-only buffer of [`Instruction`]s plus
//! two counters: the monotone register cursor (registers are never reused)
//! and per-prefix label counters. The parser composes the primitives below
//! while it parses; nothing here inspects or rewrites prior output, so the
//! generator itself can never fail.

mod instruction;

pub use instruction::*;

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Write};
use std::path::Path;

pub struct CodeGen {
    lines: Vec<Instruction>,
    current_reg: usize,
    label_counts: HashMap<String, usize>,
}

impl CodeGen {
    pub fn new() -> Self {
        Self {
            lines: vec![],
            current_reg: 1,
            label_counts: HashMap::new(),
        }
    }

    fn write(&mut self, instruction: Instruction) {
        self.lines.push(instruction);
    }

    /// Reserve a fresh register index.
    pub fn new_reg(&mut self) -> usize {
        let reg = self.current_reg;
        self.current_reg += 1;
        reg
    }

    /// Emit `R[i] = <expr>;` into a fresh register and return its index.
    pub fn set_new_reg(&mut self, expr: impl ToString) -> usize {
        let reg = self.new_reg();
        self.write(Instruction::SetReg(reg, expr.to_string()));
        reg
    }

    /// Materialize a float literal bit-exactly: the literal is written to
    /// the runtime's `tmp_float` slot and copied into the register without
    /// conversion.
    pub fn set_new_reg_float(&mut self, literal: &str) -> usize {
        let reg = self.new_reg();
        self.write(Instruction::SetTmpFloat(literal.to_owned()));
        self.write(Instruction::PunFloat(reg));
        reg
    }

    pub fn move_mem_to_reg(&mut self, mem: i64, reg: usize, off: Option<usize>) {
        self.write(Instruction::LoadFrame { dst: reg, mem, off });
    }

    pub fn move_reg_to_mem(&mut self, reg: usize, mem: i64, off: Option<usize>) {
        self.write(Instruction::StoreFrame { src: reg, mem, off });
    }

    pub fn move_reg_to_mem_global(&mut self, reg: usize, addr: usize, off: Option<usize>) {
        self.write(Instruction::StoreGlobal {
            src: reg,
            addr,
            off,
        });
    }

    pub fn move_reg_to_mem_indirect(&mut self, reg: usize, addr_reg: usize) {
        self.write(Instruction::StoreIndirect {
            src: reg,
            addr: addr_reg,
        });
    }

    /// Push a register: `M[SP] = R[reg]; SP++;`
    pub fn push_stack(&mut self, reg: usize) {
        self.write(Instruction::StoreStack(reg));
        self.write(Instruction::SpInc);
    }

    /// Push the address of a label (the return address of a call).
    pub fn push_return_addr(&mut self, label: &str) {
        self.write(Instruction::StoreStackLabel(label.to_owned()));
        self.write(Instruction::SpInc);
    }

    /// Pop into a fresh register: decrement first, then read `M[SP]`.
    pub fn pop_stack(&mut self) -> usize {
        self.write(Instruction::SpDec);
        self.set_new_reg("M[SP]")
    }

    pub fn inc_sp(&mut self, amount: usize) {
        self.write(Instruction::IncSp(amount));
    }

    pub fn dec_sp(&mut self, amount: usize) {
        self.write(Instruction::DecSp(amount));
    }

    pub fn set_fp(&mut self, expr: impl ToString) {
        self.write(Instruction::SetFp(expr.to_string()));
    }

    pub fn set_fp_to_sp(&mut self) {
        self.write(Instruction::SetFpToSp);
    }

    pub fn set_sp_to_fp(&mut self) {
        self.write(Instruction::SetSpToFp);
    }

    /// Mint a fresh label `<prefix>_<n>`; counters are per prefix and start
    /// at 1.
    pub fn new_label(&mut self, prefix: &str) -> String {
        let count = self.label_counts.entry(prefix.to_owned()).or_insert(1);
        let label = format!("{prefix}_{count}");
        *count += 1;
        label
    }

    pub fn put_label(&mut self, name: &str) {
        self.write(Instruction::Label(name.to_owned()));
    }

    pub fn goto_label(&mut self, label: &str) {
        self.write(Instruction::Goto(label.to_owned()));
    }

    pub fn goto_reg(&mut self, reg: usize) {
        self.write(Instruction::GotoReg(reg));
    }

    pub fn branch_zero(&mut self, reg: usize, label: &str) {
        self.write(Instruction::BranchZero(reg, label.to_owned()));
    }

    pub fn comment(&mut self, text: &str) {
        self.write(Instruction::Comment(text.to_owned()));
    }

    pub fn raw(&mut self, statement: &str) {
        self.write(Instruction::Raw(statement.to_owned()));
    }

    pub fn blank_line(&mut self) {
        self.write(Instruction::Blank);
    }

    /// Emit the procedure epilogue: fetch the return address, restore the
    /// caller's FP, unwind locals, arguments and the two saved slots, then
    /// jump back.
    pub fn return_to_caller(&mut self, arg_size: usize, local_size: usize) {
        let ret = self.set_new_reg("M[FP - 2]");
        self.set_fp("M[FP - 1]");
        self.dec_sp(local_size + arg_size + 2);
        self.goto_reg(ret);
    }

    pub fn instructions(&self) -> &[Instruction] {
        &self.lines
    }

    /// The buffer rendered line by line, as it will appear in the output.
    pub fn rendered(&self) -> Vec<String> {
        self.lines.iter().map(|i| i.to_string()).collect()
    }

    /// Serialize the fixed prologue, the inlined runtime, the buffered
    /// statements, and the epilogue into `path`.
    pub fn write_file(&self, path: &Path, runtime_inline: &str) -> io::Result<()> {
        let mut file = File::create(path)?;

        writeln!(file, "#include \"runtime.h\"")?;
        writeln!(file, "int main(void) {{")?;
        writeln!(file, "    goto main;")?;
        writeln!(file)?;
        file.write_all(runtime_inline.as_bytes())?;
        writeln!(file)?;
        for line in &self.lines {
            writeln!(file, "{line}")?;
        }
        writeln!(file)?;
        writeln!(file, "return 0;")?;
        writeln!(file, "}}")?;

        Ok(())
    }
}

impl Default for CodeGen {
    fn default() -> Self {
        Self::new()
    }
}
