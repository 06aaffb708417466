//! Symbol table and lexical scoping for the Slate compiler.
//!
//! Scopes form a stack whose bottom frame is the global scope; name lookup
//! checks the innermost frame first and then the global frame, so procedure
//! bodies see their own declarations and the globals but not the locals of
//! enclosing procedures. Address assignment is deterministic at insertion
//! time: globals take slots from a monotone cursor over the global region,
//! locals take the next slot after everything already sitting in their frame.

use std::{
    cell::RefCell,
    collections::HashMap,
    error::Error,
    fmt::Display,
    rc::Rc,
};

/// Declared type of a symbol or inferred type of an expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    Integer,
    Float,
    Bool,
    Str,
    Procedure,
}

impl ValueType {
    /// Map a `type_mark` keyword onto its type.
    pub fn from_type_mark(keyword: &str) -> Option<Self> {
        match keyword {
            "integer" => Some(ValueType::Integer),
            "float" => Some(ValueType::Float),
            "bool" => Some(ValueType::Bool),
            "string" => Some(ValueType::Str),
            _ => None,
        }
    }
}

impl Display for ValueType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ValueType::Integer => "INTEGER",
            ValueType::Float => "FLOAT",
            ValueType::Bool => "BOOL",
            ValueType::Str => "STRING",
            ValueType::Procedure => "procedure",
        })
    }
}

/// Parameter passing direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    In,
    Out,
}

/// A named entity: variable, array, parameter, or procedure.
#[derive(Debug, Clone)]
pub struct Symbol {
    pub name: String,
    pub kind_type: ValueType,
    /// Slots occupied in the owning region: 1 for scalars, N for arrays,
    /// 1 for `out` parameters (they hold an address), 0 for procedures.
    pub size: usize,
    /// Slot offset within the global region or the owning frame's
    /// params+locals block.
    pub addr: usize,
    pub is_global: bool,
    pub is_param: bool,
    pub is_array: bool,
    /// Set on `out` parameters: the slot stores an address, so reads and
    /// writes go through one extra memory indirection.
    pub indirect: bool,
    pub direction: Option<Direction>,
    /// Has been read, or was assigned, or is an `in` parameter.
    pub used: bool,
    /// Ordered parameter symbols, for procedures.
    pub params: Vec<SymbolRef>,
    /// Entry label emitted for the body, for procedures.
    pub label: String,
}

pub type SymbolRef = Rc<RefCell<Symbol>>;

impl Symbol {
    pub fn variable(name: impl ToString, kind_type: ValueType) -> Self {
        Self {
            name: name.to_string(),
            kind_type,
            size: 1,
            addr: 0,
            is_global: false,
            is_param: false,
            is_array: false,
            indirect: false,
            direction: None,
            used: false,
            params: vec![],
            label: String::new(),
        }
    }

    pub fn array(name: impl ToString, kind_type: ValueType, len: usize) -> Self {
        let mut sym = Self::variable(name, kind_type);
        sym.is_array = true;
        sym.size = len;
        sym
    }

    pub fn procedure(name: impl ToString, label: impl ToString) -> Self {
        let mut sym = Self::variable(name, ValueType::Procedure);
        sym.size = 0;
        sym.label = label.to_string();
        sym
    }

    fn shared(self) -> SymbolRef {
        Rc::new(RefCell::new(self))
    }
}

#[derive(Debug, Clone)]
pub struct SymbolError(pub String);

impl Display for SymbolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl Error for SymbolError {}

#[derive(Debug, Default)]
struct ScopeFrame {
    symbols: HashMap<String, SymbolRef>,
}

/// The scope stack. Frame 0 is the global scope and stays visible from every
/// nested frame.
#[derive(Debug)]
pub struct ScopeStack {
    frames: Vec<ScopeFrame>,
    global_addr: usize,
}

impl ScopeStack {
    /// A fresh stack containing only the global frame, pre-populated with
    /// the runtime's built-in procedures.
    pub fn new() -> Self {
        let mut scope = Self {
            frames: vec![ScopeFrame::default()],
            global_addr: 0,
        };

        for (name, kind_type) in [
            ("putinteger", ValueType::Integer),
            ("putfloat", ValueType::Float),
            ("putbool", ValueType::Bool),
            ("putstring", ValueType::Str),
        ] {
            let mut param = Symbol::variable("value", kind_type);
            param.is_param = true;
            param.direction = Some(Direction::In);
            param.used = true;

            let mut builtin = Symbol::procedure(name, name);
            builtin.params.push(param.shared());

            scope
                .add_symbol(builtin, true)
                .expect("builtin procedures collide");
        }

        scope
    }

    pub fn enter_scope(&mut self) {
        self.frames.push(ScopeFrame::default());
    }

    pub fn exit_scope(&mut self) {
        self.frames.pop();
    }

    /// Number of frames on the stack; 1 means only the global scope.
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// Assign an address and place the symbol in the global or innermost
    /// scope. Fails if the chosen scope already holds the name.
    pub fn add_symbol(&mut self, mut sym: Symbol, is_global: bool) -> Result<SymbolRef, SymbolError> {
        let frame_idx = if is_global { 0 } else { self.frames.len() - 1 };

        if self.frames[frame_idx].symbols.contains_key(&sym.name) {
            return Err(SymbolError(format!(
                "symbol '{}' is already declared in this scope",
                sym.name
            )));
        }

        if is_global {
            sym.is_global = true;
            sym.addr = self.global_addr;
            self.global_addr += sym.size;
        } else {
            sym.addr = self.local_params_size() + self.local_locals_size();
        }

        let sym = sym.shared();
        self.frames[frame_idx]
            .symbols
            .insert(sym.borrow().name.clone(), sym.clone());
        Ok(sym)
    }

    /// Place an existing symbol into the innermost scope without assigning a
    /// new address. Used to make a procedure visible inside its own body.
    pub fn add_symbol_ref(&mut self, sym: SymbolRef) {
        let name = sym.borrow().name.clone();
        self.frames
            .last_mut()
            .expect("scope stack is never empty")
            .symbols
            .insert(name, sym);
    }

    /// Look a name up in the innermost scope, then in the global scope.
    pub fn get_symbol(&self, name: &str) -> Result<SymbolRef, SymbolError> {
        let innermost = self.frames.last().expect("scope stack is never empty");
        if let Some(sym) = innermost.symbols.get(name) {
            return Ok(sym.clone());
        }
        if let Some(sym) = self.frames[0].symbols.get(name) {
            return Ok(sym.clone());
        }
        Err(SymbolError(format!(
            "Tried to lookup unknown symbol '{name}'"
        )))
    }

    /// Names visible from the innermost scope (innermost plus globals).
    pub fn cur_symbols(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .frames
            .last()
            .expect("scope stack is never empty")
            .symbols
            .keys()
            .chain(self.frames[0].symbols.keys())
            .cloned()
            .collect();
        names.sort();
        names.dedup();
        names
    }

    /// Total slots taken by parameters of the innermost scope.
    pub fn local_params_size(&self) -> usize {
        self.sized_symbols(|s| s.is_param)
    }

    /// Total slots taken by non-parameter locals of the innermost scope.
    pub fn local_locals_size(&self) -> usize {
        self.sized_symbols(|s| !s.is_param)
    }

    fn sized_symbols(&self, select: impl Fn(&Symbol) -> bool) -> usize {
        self.frames
            .last()
            .expect("scope stack is never empty")
            .symbols
            .values()
            .map(|s| s.borrow())
            .filter(|s| s.kind_type != ValueType::Procedure && select(s))
            .map(|s| s.size)
            .sum()
    }
}

impl Default for ScopeStack {
    fn default() -> Self {
        Self::new()
    }
}
