//! Recursive-descent parser with integrated semantic analysis.
//!
//! The parser pulls tokens lazily from the scanner, manages the scope stack,
//! type-checks as it matches, and emits target-machine statements through
//! the code generator on the fly; there is no AST. Recoverable errors travel
//! as [`ParseError`] up to the nearest resync region, which logs them and
//! skips ahead to a synchronization token, so a single run can report many
//! errors without looping.

mod error;

pub use error::*;

use log::trace;

use crate::{
    codegen::{frame_expr, CodeGen},
    diagnostics::DiagnosticsRef,
    lexer::{Origin, Scanner, Token, TokenKind},
    symbols::{Direction, ScopeStack, Symbol, SymbolRef, ValueType},
};

/// Sync set after a failed declaration.
const DECL_SYNC: &[&str] = &["begin", "\n"];
/// Sync set after a failed statement.
const STMT_SYNC: &[&str] = &["\n"];
/// Sync set inside parameter and argument lists.
const LIST_SYNC: &[&str] = &[",", ")", "\n"];

pub struct Parser {
    scanner: Scanner,
    gen: CodeGen,
    scope: ScopeStack,
    diagnostics: DiagnosticsRef,
    /// The current token; never a comment or a bare newline (resync is the
    /// one place that walks the raw stream).
    token: Token,
    /// One-token lookahead buffer filled by `peek`.
    pending: Option<Token>,
    /// The EOF token once the scanner produced it; replayed forever after.
    eof: Option<Token>,
    /// Counter for naming anonymous string-literal arrays.
    string_count: usize,
    /// Nesting depth of `if`/`for` bodies currently being parsed; statements
    /// at depth 0 execute exactly once per activation.
    control_depth: usize,
    /// Frame slots claimed by string literals inside `if`/`for` branches of
    /// the current activation; their claim does not execute exactly once, so
    /// the epilogue must not unwind them.
    conditional_locals: usize,
}

impl Parser {
    pub fn new(scanner: Scanner, gen: CodeGen, diagnostics: DiagnosticsRef) -> Self {
        let start = Token::new(
            TokenKind::Special,
            "\n",
            Origin {
                filename: scanner.filename().to_owned(),
                line_num: 0,
                col_num: 1,
                line_str: String::new(),
            },
        );

        let mut parser = Self {
            scanner,
            gen,
            scope: ScopeStack::new(),
            diagnostics,
            token: start,
            pending: None,
            eof: None,
            string_count: 0,
            control_depth: 0,
            conditional_locals: 0,
        };
        parser.advance();
        parser
    }

    /// Parse one whole program and hand back the filled code buffer. All
    /// diagnostics go through the shared context; whether anything may be
    /// written afterwards is decided by its `has_errors` flag.
    pub fn parse(mut self) -> CodeGen {
        if let Err(err) = self.program() {
            self.report(&err);
        }
        self.gen
    }

    // ------------------------------------------------------------------
    // token stream plumbing
    // ------------------------------------------------------------------

    fn pull_raw(&mut self) -> Token {
        match self.scanner.next() {
            Some(token) => {
                if token.is_eof() {
                    self.eof = Some(token.clone());
                }
                token
            }
            None => self.eof.clone().unwrap_or_else(|| {
                Token::new(
                    TokenKind::Special,
                    "EOF",
                    Origin {
                        filename: self.scanner.filename().to_owned(),
                        line_num: 0,
                        col_num: 1,
                        line_str: String::new(),
                    },
                )
            }),
        }
    }

    /// Next token of the raw stream: comments dropped, newlines kept.
    fn next_raw(&mut self) -> Token {
        if let Some(token) = self.pending.take() {
            return token;
        }
        loop {
            let token = self.pull_raw();
            if token.kind != TokenKind::Comment {
                return token;
            }
        }
    }

    /// Advance to the next syntactic token, skipping newline tokens.
    fn advance(&mut self) {
        loop {
            let token = self.next_raw();
            if token.is_newline() {
                continue;
            }
            trace!("current token: {token}");
            self.token = token;
            return;
        }
    }

    /// Look at the token after the current one without consuming anything.
    fn peek(&mut self) -> Token {
        if self.pending.is_none() {
            loop {
                let token = self.pull_raw();
                if token.kind == TokenKind::Comment || token.is_newline() {
                    continue;
                }
                self.pending = Some(token);
                break;
            }
        }
        self.pending.clone().expect("peek buffer was just filled")
    }

    fn match_token(&mut self, kind: TokenKind, value: &str) -> bool {
        if self.token.is(kind, value) {
            self.advance();
            return true;
        }
        false
    }

    fn match_kind(&mut self, kind: TokenKind) -> Option<String> {
        if self.token.kind == kind {
            let value = self.token.value.clone();
            self.advance();
            return Some(value);
        }
        None
    }

    fn expect_kind(&mut self, kind: TokenKind, message: &str) -> PResult<String> {
        let token = self.token.clone();
        self.match_kind(kind)
            .ok_or_else(|| ParseError::syntax(message, &token))
    }

    fn expect_keyword(&mut self, value: &str) -> PResult<()> {
        if self.match_token(TokenKind::Keyword, value) {
            return Ok(());
        }
        Err(ParseError::syntax(
            format!("expected '{value}'"),
            &self.token,
        ))
    }

    fn expect_symbol(&mut self, value: &str) -> PResult<()> {
        if self.match_token(TokenKind::Symbol, value) {
            return Ok(());
        }
        Err(ParseError::syntax(
            format!("expected '{value}'"),
            &self.token,
        ))
    }

    fn report(&mut self, err: &ParseError) {
        if let ParseError::Syntax { message, token } = err {
            self.diagnostics.borrow_mut().error_at(token, message);
        }
    }

    /// Recover from a parse error: log it (scan errors were already
    /// reported by the scanner), then skip raw tokens until one from `find`
    /// comes up. A newline sync token is consumed so the parser lands on the
    /// next syntactic token; any other sync token is left in place.
    fn resync(&mut self, find: &[&str], err: ParseError) {
        self.report(&err);
        while !self.token.is_eof() && !find.contains(&self.token.value.as_str()) {
            self.token = self.next_raw();
        }
        if self.token.is_newline() {
            self.advance();
        }
    }

    fn scan_failure(&self) -> ParseError {
        ParseError::scan(&self.token)
    }

    fn lookup(&mut self, token: &Token) -> PResult<SymbolRef> {
        self.scope.get_symbol(&token.value).map_err(|_| {
            ParseError::syntax(format!("undefined identifier '{}'", token.value), token)
        })
    }

    /// Frame slots an epilogue may unwind: declared locals plus string
    /// slots claimed on every path through the body. Slots claimed inside a
    /// conditional or repeated branch stay allocated.
    fn frame_unwind_size(&self) -> usize {
        self.scope.local_locals_size() - self.conditional_locals
    }

    /// Frame-relative slot of a non-global symbol. Parameters sit below the
    /// saved FP and return address, locals directly above FP.
    fn frame_offset(&self, sym: &Symbol) -> i64 {
        let params = self.scope.local_params_size() as i64;
        if sym.is_param {
            sym.addr as i64 - params - 2
        } else {
            sym.addr as i64 - params
        }
    }

    // ------------------------------------------------------------------
    // program structure
    // ------------------------------------------------------------------

    /// `program := "program" IDENT "is" declarations "begin" statements
    /// "end" "program"`
    fn program(&mut self) -> PResult<()> {
        self.expect_keyword("program")?;
        self.expect_kind(TokenKind::Identifier, "expected a program name")?;
        self.expect_keyword("is")?;

        self.scope.enter_scope();
        self.declarations();

        self.expect_keyword("begin")?;
        self.gen.put_label("main");
        let local_size = self.scope.local_locals_size();
        if local_size > 0 {
            self.gen.inc_sp(local_size);
        }

        self.statements(&["end"]);

        self.expect_keyword("end")?;
        self.expect_keyword("program")?;
        self.scope.exit_scope();

        if !self.token.is_eof() && self.token.kind != TokenKind::Invalid {
            self.diagnostics
                .borrow_mut()
                .warning_at(&self.token, "text after 'end program' is ignored");
        }
        Ok(())
    }

    /// `(declaration ";")*`, ending at `begin`. Each declaration is its own
    /// resync region.
    fn declarations(&mut self) {
        loop {
            if self.token.is(TokenKind::Keyword, "begin") || self.token.is_eof() {
                return;
            }
            match self.declaration() {
                Ok(()) => {
                    if let Err(err) = self.expect_symbol(";") {
                        self.resync(DECL_SYNC, err);
                    }
                }
                Err(err) => self.resync(DECL_SYNC, err),
            }
        }
    }

    /// `declaration := ["global"] (procedure_decl | variable_decl)`
    fn declaration(&mut self) -> PResult<()> {
        if self.token.kind == TokenKind::Invalid {
            return Err(self.scan_failure());
        }

        let is_global = self.match_token(TokenKind::Keyword, "global");

        if self.match_token(TokenKind::Keyword, "procedure") {
            return self.procedure_declaration(is_global);
        }

        if ValueType::from_type_mark(&self.token.value).is_some() {
            let name_token = self.token.clone();
            let sym = self.variable_declaration()?;
            let name = sym.name.clone();
            self.scope.add_symbol(sym, is_global).map_err(|_| {
                ParseError::syntax(format!("duplicate declaration of '{name}'"), &name_token)
            })?;
            return Ok(());
        }

        Err(ParseError::syntax("expected a declaration", &self.token))
    }

    /// `variable_decl := type_mark IDENT ["[" INTEGER "]"]`
    fn variable_declaration(&mut self) -> PResult<Symbol> {
        let type_mark = self.type_mark()?;
        let name = self.expect_kind(TokenKind::Identifier, "expected an identifier")?;

        if !self.match_token(TokenKind::Symbol, "[") {
            return Ok(Symbol::variable(name, type_mark));
        }

        let size_token = self.token.clone();
        let size = self.expect_kind(TokenKind::Integer, "expected an array size")?;
        let size: usize = size
            .parse()
            .map_err(|_| ParseError::syntax("invalid array size", &size_token))?;
        if size == 0 {
            return Err(ParseError::syntax(
                "array size must be at least 1",
                &size_token,
            ));
        }
        self.expect_symbol("]")?;

        Ok(Symbol::array(name, type_mark, size))
    }

    /// `type_mark := "integer" | "float" | "bool" | "string"`
    fn type_mark(&mut self) -> PResult<ValueType> {
        if self.token.kind == TokenKind::Keyword {
            if let Some(type_mark) = ValueType::from_type_mark(&self.token.value) {
                self.advance();
                return Ok(type_mark);
            }
        }
        Err(ParseError::syntax("expected a type mark", &self.token))
    }

    /// `procedure_decl := "procedure" IDENT "(" [param_list] ")"
    /// declarations "begin" statements "end" "procedure"`
    ///
    /// The body's code is emitted inline right here; the `goto main;` of the
    /// output prologue jumps over it. The procedure symbol goes into the
    /// parent scope and into its own scope, so it can call itself.
    fn procedure_declaration(&mut self, is_global: bool) -> PResult<()> {
        let name_token = self.token.clone();
        let name = self.expect_kind(TokenKind::Identifier, "expected a procedure name")?;
        let label = self.gen.new_label(&format!("{name}_start"));

        let proc = self
            .scope
            .add_symbol(Symbol::procedure(&name, &label), is_global)
            .map_err(|_| {
                ParseError::syntax(format!("duplicate declaration of '{name}'"), &name_token)
            })?;

        self.scope.enter_scope();
        let saved_depth = std::mem::take(&mut self.control_depth);
        let saved_conditional = std::mem::take(&mut self.conditional_locals);
        let result = self.procedure_body(&proc, &label);
        self.conditional_locals = saved_conditional;
        self.control_depth = saved_depth;
        self.scope.exit_scope();
        result
    }

    fn procedure_body(&mut self, proc: &SymbolRef, label: &str) -> PResult<()> {
        self.scope.add_symbol_ref(proc.clone());

        self.expect_symbol("(")?;
        if !self.match_token(TokenKind::Symbol, ")") {
            self.param_list(proc);
            self.expect_symbol(")")?;
        }

        self.declarations();

        self.expect_keyword("begin")?;
        self.gen.put_label(label);
        let local_size = self.scope.local_locals_size();
        if local_size > 0 {
            self.gen.inc_sp(local_size);
        }

        self.statements(&["end"]);

        self.expect_keyword("end")?;
        self.expect_keyword("procedure")?;

        // fall-through safety net, emitted even after an explicit return
        self.gen
            .return_to_caller(self.scope.local_params_size(), self.frame_unwind_size());
        self.gen.blank_line();
        Ok(())
    }

    /// `param_list := param ("," param)*`
    fn param_list(&mut self, proc: &SymbolRef) {
        loop {
            match self.param() {
                Ok(sym) => {
                    let name = sym.name.clone();
                    match self.scope.add_symbol(sym, false) {
                        Ok(param) => proc.borrow_mut().params.push(param),
                        Err(_) => {
                            let token = self.token.clone();
                            self.diagnostics
                                .borrow_mut()
                                .error_at(&token, &format!("duplicate declaration of '{name}'"));
                        }
                    }
                }
                Err(err) => self.resync(LIST_SYNC, err),
            }
            if !self.match_token(TokenKind::Symbol, ",") {
                return;
            }
        }
    }

    /// `param := variable_decl ("in" | "out")`
    fn param(&mut self) -> PResult<Symbol> {
        if self.token.kind == TokenKind::Invalid {
            return Err(self.scan_failure());
        }

        let mut sym = self.variable_declaration()?;
        sym.is_param = true;

        if self.match_token(TokenKind::Keyword, "in") {
            sym.direction = Some(Direction::In);
            sym.used = true;
        } else if self.match_token(TokenKind::Keyword, "out") {
            sym.direction = Some(Direction::Out);
            sym.indirect = true;
            // the slot stores an address, never the value
            sym.size = 1;
        } else {
            return Err(ParseError::syntax(
                "expected 'in' or 'out' after parameter",
                &self.token,
            ));
        }

        Ok(sym)
    }

    // ------------------------------------------------------------------
    // statements
    // ------------------------------------------------------------------

    /// `(statement ";")*`, ending at one of `terminators`. Each statement is
    /// its own resync region.
    fn statements(&mut self, terminators: &[&str]) {
        loop {
            if self.token.is_eof() {
                return;
            }
            if self.token.kind == TokenKind::Keyword
                && terminators.contains(&self.token.value.as_str())
            {
                return;
            }
            match self.statement() {
                Ok(()) => {
                    if let Err(err) = self.expect_symbol(";") {
                        self.resync(STMT_SYNC, err);
                    }
                }
                Err(err) => self.resync(STMT_SYNC, err),
            }
        }
    }

    /// `statement := if_stmt | loop_stmt | procedure_call | assignment |
    /// return_stmt`
    fn statement(&mut self) -> PResult<()> {
        if self.token.kind == TokenKind::Invalid {
            return Err(self.scan_failure());
        }
        if self.match_token(TokenKind::Keyword, "if") {
            return self.if_statement();
        }
        if self.match_token(TokenKind::Keyword, "for") {
            return self.loop_statement();
        }
        if self.match_token(TokenKind::Keyword, "return") {
            return self.return_statement();
        }
        if self.token.kind == TokenKind::Identifier {
            let name_token = self.token.clone();
            self.advance();
            if self.match_token(TokenKind::Symbol, "(") {
                return self.procedure_call(&name_token);
            }
            return self.assignment(&name_token);
        }
        Err(ParseError::syntax("expected a statement", &self.token))
    }

    /// `if_stmt := "if" "(" expression ")" "then" statements
    /// ["else" statements] "end" "if"`
    fn if_statement(&mut self) -> PResult<()> {
        self.expect_symbol("(")?;
        let guard_token = self.token.clone();
        let (guard, guard_type) = self.expression()?;
        self.expect_symbol(")")?;
        if guard_type != ValueType::Bool {
            return Err(ParseError::syntax(
                format!("'if' condition must be of type 'BOOL', found '{guard_type}'"),
                &guard_token,
            ));
        }
        self.expect_keyword("then")?;

        let else_label = self.gen.new_label("else");
        let end_label = self.gen.new_label("endif");
        self.gen.branch_zero(guard, &else_label);

        self.control_depth += 1;
        self.statements(&["else", "end"]);
        self.control_depth -= 1;
        self.gen.goto_label(&end_label);
        self.gen.put_label(&else_label);

        if self.match_token(TokenKind::Keyword, "else") {
            self.control_depth += 1;
            self.statements(&["end"]);
            self.control_depth -= 1;
        }
        self.gen.put_label(&end_label);

        self.expect_keyword("end")?;
        self.expect_keyword("if")?;
        Ok(())
    }

    /// `loop_stmt := "for" "(" assignment ";" expression ")" statements
    /// "end" "for"`
    ///
    /// The header assignment sits after the loop label, so it re-runs on
    /// every iteration before the guard is evaluated; header and body both
    /// parse at a raised control depth.
    fn loop_statement(&mut self) -> PResult<()> {
        self.expect_symbol("(")?;

        let loop_label = self.gen.new_label("for");
        let end_label = self.gen.new_label("endfor");
        self.gen.put_label(&loop_label);

        self.control_depth += 1;
        let result = self.loop_header_and_body(&loop_label, &end_label);
        self.control_depth -= 1;
        result
    }

    fn loop_header_and_body(&mut self, loop_label: &str, end_label: &str) -> PResult<()> {
        let name_token = self.token.clone();
        if self.match_kind(TokenKind::Identifier).is_none() {
            return Err(ParseError::syntax(
                "expected an assignment in 'for' header",
                &name_token,
            ));
        }
        self.assignment(&name_token)?;
        self.expect_symbol(";")?;

        let guard_token = self.token.clone();
        let (guard, guard_type) = self.expression()?;
        if guard_type != ValueType::Bool {
            return Err(ParseError::syntax(
                format!("'for' condition must be of type 'BOOL', found '{guard_type}'"),
                &guard_token,
            ));
        }
        self.expect_symbol(")")?;
        self.gen.branch_zero(guard, end_label);

        self.statements(&["end"]);
        self.gen.goto_label(loop_label);
        self.gen.put_label(end_label);

        self.expect_keyword("end")?;
        self.expect_keyword("for")?;
        Ok(())
    }

    /// `return_stmt := "return"`
    fn return_statement(&mut self) -> PResult<()> {
        if self.scope.depth() >= 3 {
            self.gen
                .return_to_caller(self.scope.local_params_size(), self.frame_unwind_size());
        } else {
            // no frame to unwind at program level
            self.gen.raw("return 0;");
        }
        Ok(())
    }

    /// `assignment := destination ":=" expression` with the destination
    /// identifier already consumed.
    fn assignment(&mut self, name_token: &Token) -> PResult<()> {
        let sym = self.lookup(name_token)?;
        if sym.borrow().kind_type == ValueType::Procedure {
            return Err(ParseError::syntax(
                format!("cannot assign to procedure '{}'", name_token.value),
                name_token,
            ));
        }

        let index = self.index_expression(&sym, name_token)?;
        if sym.borrow().is_array && index.is_none() {
            return Err(ParseError::syntax(
                format!("cannot use array '{}' without an index here", name_token.value),
                name_token,
            ));
        }
        self.expect_symbol(":=")?;

        let (value, expr_type) = self.expression()?;
        let dest_type = sym.borrow().kind_type;
        if expr_type != dest_type {
            return Err(ParseError::syntax(
                format!(
                    "cannot assign expression of type '{expr_type}' to destination of type '{dest_type}'"
                ),
                name_token,
            ));
        }

        sym.borrow_mut().used = true;
        self.store(&sym, value, index);
        Ok(())
    }

    /// Optional `"[" expression "]"` after a name. The index must be an
    /// `INTEGER` and the symbol an array.
    fn index_expression(
        &mut self,
        sym: &SymbolRef,
        name_token: &Token,
    ) -> PResult<Option<usize>> {
        if !self.match_token(TokenKind::Symbol, "[") {
            return Ok(None);
        }
        if !sym.borrow().is_array {
            return Err(ParseError::syntax(
                format!("'{}' is not an array", name_token.value),
                name_token,
            ));
        }

        let index_token = self.token.clone();
        let (index, index_type) = self.expression()?;
        if index_type != ValueType::Integer {
            return Err(ParseError::syntax(
                format!("array index must be of type 'INTEGER', found '{index_type}'"),
                &index_token,
            ));
        }
        self.expect_symbol("]")?;
        Ok(Some(index))
    }

    // ------------------------------------------------------------------
    // procedure calls
    // ------------------------------------------------------------------

    /// `procedure_call := IDENT "(" [argument_list] ")"` with the name and
    /// `(` already consumed.
    ///
    /// Arguments are evaluated and pushed left to right, then the return
    /// address and the current FP; the callee runs with FP = SP and returns
    /// through the address at `M[FP - 2]`.
    fn procedure_call(&mut self, name_token: &Token) -> PResult<()> {
        let sym = self.lookup(name_token)?;
        if sym.borrow().kind_type != ValueType::Procedure {
            return Err(ParseError::syntax(
                format!("'{}' is not a procedure", name_token.value),
                name_token,
            ));
        }

        let params: Vec<SymbolRef> = sym.borrow().params.clone();
        let mut supplied = 0;

        if !self.match_token(TokenKind::Symbol, ")") {
            loop {
                let param = params.get(supplied).cloned();
                if let Err(err) = self.argument(param.as_ref()) {
                    self.resync(LIST_SYNC, err);
                }
                supplied += 1;
                if !self.match_token(TokenKind::Symbol, ",") {
                    break;
                }
            }
            self.expect_symbol(")")?;
        }

        if supplied != params.len() {
            return Err(ParseError::syntax(
                format!(
                    "'{}' expects {} argument(s), found {}",
                    name_token.value,
                    params.len(),
                    supplied
                ),
                name_token,
            ));
        }

        let ret_label = self.gen.new_label("ret");
        self.gen.push_return_addr(&ret_label);
        let saved_fp = self.gen.set_new_reg("FP");
        self.gen.push_stack(saved_fp);
        self.gen.set_fp_to_sp();
        self.gen.goto_label(&sym.borrow().label);
        self.gen.put_label(&ret_label);
        Ok(())
    }

    /// One argument of a call. `in` arguments push values (arrays element by
    /// element), `out` arguments push an address.
    fn argument(&mut self, param: Option<&SymbolRef>) -> PResult<()> {
        let Some(param) = param else {
            // surplus argument: still parse it, the arity error follows at
            // the call level
            self.expression()?;
            return Ok(());
        };

        if param.borrow().direction == Some(Direction::Out) {
            return self.out_argument(param);
        }

        // a bare array identifier expands into element pushes
        if self.token.kind == TokenKind::Identifier {
            if let Ok(arg) = self.scope.get_symbol(&self.token.value) {
                if arg.borrow().is_array && !self.peek().is(TokenKind::Symbol, "[") {
                    let arg_token = self.token.clone();
                    self.advance();
                    return self.array_argument(param, &arg, &arg_token);
                }
            }
        }

        let arg_token = self.token.clone();
        let (value, arg_type) = self.expression()?;

        let p = param.borrow();
        if p.is_array {
            return Err(ParseError::syntax(
                format!("parameter '{}' expects an array argument", p.name),
                &arg_token,
            ));
        }
        if arg_type != p.kind_type {
            return Err(ParseError::syntax(
                format!(
                    "argument type mismatch: expected '{}', found '{arg_type}'",
                    p.kind_type
                ),
                &arg_token,
            ));
        }
        drop(p);

        self.gen.push_stack(value);
        Ok(())
    }

    /// Push every element of an array argument, left to right.
    fn array_argument(
        &mut self,
        param: &SymbolRef,
        arg: &SymbolRef,
        arg_token: &Token,
    ) -> PResult<()> {
        let p = param.borrow();
        let a = arg.borrow();

        if a.kind_type != p.kind_type {
            return Err(ParseError::syntax(
                format!(
                    "argument type mismatch: expected '{}', found '{}'",
                    p.kind_type, a.kind_type
                ),
                arg_token,
            ));
        }
        if p.is_array && p.size != a.size {
            return Err(ParseError::syntax(
                format!("array size mismatch: expected {}, found {}", p.size, a.size),
                arg_token,
            ));
        }

        if !a.used {
            self.diagnostics.borrow_mut().warning_at(
                arg_token,
                &format!("variable '{}' is uninitialized when used here", a.name),
            );
        }

        let (is_global, indirect, addr, size) = (a.is_global, a.indirect, a.addr, a.size);
        let mem = if is_global { 0 } else { self.frame_offset(&a) };
        drop(a);
        drop(p);
        arg.borrow_mut().used = true;

        if indirect {
            let ptr = self.gen.new_reg();
            self.gen.move_mem_to_reg(mem, ptr, None);
            for k in 0..size {
                let value = self.gen.set_new_reg(format!("M[R[{ptr}] + {k}]"));
                self.gen.push_stack(value);
            }
            return Ok(());
        }

        for k in 0..size {
            let value = if is_global {
                self.gen.set_new_reg(format!("M[{}]", addr + k))
            } else {
                let value = self.gen.new_reg();
                self.gen.move_mem_to_reg(mem + k as i64, value, None);
                value
            };
            self.gen.push_stack(value);
        }
        Ok(())
    }

    /// An `out` argument: a plain identifier whose address is pushed once.
    fn out_argument(&mut self, param: &SymbolRef) -> PResult<()> {
        let arg_token = self.token.clone();
        if arg_token.kind != TokenKind::Identifier {
            return Err(ParseError::syntax(
                "'out' argument must be an identifier",
                &arg_token,
            ));
        }
        self.advance();

        let arg = self.lookup(&arg_token)?;
        let p = param.borrow();
        let a = arg.borrow();

        if a.kind_type != p.kind_type {
            return Err(ParseError::syntax(
                format!(
                    "argument type mismatch: expected '{}', found '{}'",
                    p.kind_type, a.kind_type
                ),
                &arg_token,
            ));
        }
        if p.is_array != a.is_array {
            let expected = if p.is_array { "an array" } else { "a scalar" };
            return Err(ParseError::syntax(
                format!("parameter '{}' expects {expected} argument", p.name),
                &arg_token,
            ));
        }

        let (is_global, indirect, addr) = (a.is_global, a.indirect, a.addr);
        let mem = if is_global { 0 } else { self.frame_offset(&a) };
        drop(a);
        drop(p);
        // the callee writes through the pushed address
        arg.borrow_mut().used = true;

        let address = if indirect {
            let reg = self.gen.new_reg();
            self.gen.move_mem_to_reg(mem, reg, None);
            reg
        } else if is_global {
            self.gen.set_new_reg(addr)
        } else {
            self.gen.set_new_reg(frame_expr(mem))
        };
        self.gen.push_stack(address);
        Ok(())
    }

    // ------------------------------------------------------------------
    // expressions
    // ------------------------------------------------------------------

    /// `expression := ["not"] arith_op (("&" | "|") arith_op)*`
    fn expression(&mut self) -> PResult<(usize, ValueType)> {
        let not_token = self.token.clone();
        let negate = self.match_token(TokenKind::Keyword, "not");

        let (mut value, expr_type) = self.arith_op()?;

        if negate {
            if !matches!(expr_type, ValueType::Integer | ValueType::Bool) {
                return Err(ParseError::syntax(
                    format!(
                        "operator 'not' requires an 'INTEGER' or 'BOOL' operand, found '{expr_type}'"
                    ),
                    &not_token,
                ));
            }
            value = self.gen.set_new_reg(format!("~R[{value}]"));
        }

        loop {
            let op_token = self.token.clone();
            let op = if self.match_token(TokenKind::Symbol, "&") {
                "&"
            } else if self.match_token(TokenKind::Symbol, "|") {
                "|"
            } else {
                return Ok((value, expr_type));
            };

            let (rhs, rhs_type) = self.arith_op()?;
            if rhs_type != expr_type {
                return Err(ParseError::syntax(
                    format!(
                        "cannot apply '{op}' to operands of type '{expr_type}' and '{rhs_type}'"
                    ),
                    &op_token,
                ));
            }
            value = self.gen.set_new_reg(format!("R[{value}] {op} R[{rhs}]"));
        }
    }

    /// `arith_op := relation (("+" | "-") relation)*`
    fn arith_op(&mut self) -> PResult<(usize, ValueType)> {
        let (mut value, expr_type) = self.relation()?;

        loop {
            let op_token = self.token.clone();
            let op = if self.match_token(TokenKind::Symbol, "+") {
                "+"
            } else if self.match_token(TokenKind::Symbol, "-") {
                "-"
            } else {
                return Ok((value, expr_type));
            };

            let (rhs, rhs_type) = self.relation()?;
            if rhs_type != expr_type {
                return Err(ParseError::syntax(
                    format!(
                        "cannot apply '{op}' to operands of type '{expr_type}' and '{rhs_type}'"
                    ),
                    &op_token,
                ));
            }
            value = self.gen.set_new_reg(format!("R[{value}] {op} R[{rhs}]"));
        }
    }

    /// `relation := term (relop term)*`; every relational operator yields
    /// `BOOL`.
    fn relation(&mut self) -> PResult<(usize, ValueType)> {
        let (mut value, mut expr_type) = self.term()?;

        loop {
            let op_token = self.token.clone();
            let op = if self.match_token(TokenKind::Symbol, "<=") {
                "<="
            } else if self.match_token(TokenKind::Symbol, ">=") {
                ">="
            } else if self.match_token(TokenKind::Symbol, "<") {
                "<"
            } else if self.match_token(TokenKind::Symbol, ">") {
                ">"
            } else if self.match_token(TokenKind::Symbol, "==") {
                "=="
            } else if self.match_token(TokenKind::Symbol, "!=") {
                "!="
            } else {
                return Ok((value, expr_type));
            };

            let (rhs, rhs_type) = self.term()?;
            if rhs_type != expr_type {
                return Err(ParseError::syntax(
                    format!(
                        "cannot apply '{op}' to operands of type '{expr_type}' and '{rhs_type}'"
                    ),
                    &op_token,
                ));
            }
            value = self.gen.set_new_reg(format!("R[{value}] {op} R[{rhs}]"));
            expr_type = ValueType::Bool;
        }
    }

    /// `term := factor (("*" | "/") factor)*`
    fn term(&mut self) -> PResult<(usize, ValueType)> {
        let (mut value, expr_type) = self.factor()?;

        loop {
            let op_token = self.token.clone();
            let op = if self.match_token(TokenKind::Symbol, "*") {
                "*"
            } else if self.match_token(TokenKind::Symbol, "/") {
                "/"
            } else {
                return Ok((value, expr_type));
            };

            let (rhs, rhs_type) = self.factor()?;
            if rhs_type != expr_type {
                return Err(ParseError::syntax(
                    format!(
                        "cannot apply '{op}' to operands of type '{expr_type}' and '{rhs_type}'"
                    ),
                    &op_token,
                ));
            }
            value = self.gen.set_new_reg(format!("R[{value}] {op} R[{rhs}]"));
        }
    }

    /// `factor := "(" expression ")" | ["-"] IDENT ["[" expression "]"] |
    /// ["-"] NUMBER | STRING | "true" | "false"`
    fn factor(&mut self) -> PResult<(usize, ValueType)> {
        if self.token.kind == TokenKind::Invalid {
            return Err(self.scan_failure());
        }

        if self.match_token(TokenKind::Symbol, "(") {
            let value = self.expression()?;
            self.expect_symbol(")")?;
            return Ok(value);
        }

        let negate = self.match_token(TokenKind::Symbol, "-");
        let token = self.token.clone();

        let (value, expr_type) = match token.kind {
            TokenKind::Identifier => {
                self.advance();
                self.name_factor(&token)?
            }
            TokenKind::Integer => {
                self.advance();
                (self.gen.set_new_reg(&token.value), ValueType::Integer)
            }
            TokenKind::Float => {
                self.advance();
                (self.gen.set_new_reg_float(&token.value), ValueType::Float)
            }
            TokenKind::Str if !negate => {
                self.advance();
                self.string_factor(&token)?
            }
            TokenKind::Bool if !negate => {
                self.advance();
                let value = self
                    .gen
                    .set_new_reg(if token.value == "true" { "1" } else { "0" });
                (value, ValueType::Bool)
            }
            _ => return Err(ParseError::syntax("expected an expression", &token)),
        };

        if negate {
            if !matches!(expr_type, ValueType::Integer | ValueType::Float) {
                return Err(ParseError::syntax(
                    format!("unary '-' requires a numeric operand, found '{expr_type}'"),
                    &token,
                ));
            }
            return Ok((self.gen.set_new_reg(format!("-1 * R[{value}]")), expr_type));
        }
        Ok((value, expr_type))
    }

    /// A name used as a value: resolve, warn on uninitialized reads, load.
    fn name_factor(&mut self, name_token: &Token) -> PResult<(usize, ValueType)> {
        let sym = self.lookup(name_token)?;
        let kind_type = sym.borrow().kind_type;
        if kind_type == ValueType::Procedure {
            return Err(ParseError::syntax(
                format!("'{}' is not a variable", name_token.value),
                name_token,
            ));
        }

        let index = self.index_expression(&sym, name_token)?;
        if sym.borrow().is_array && index.is_none() {
            return Err(ParseError::syntax(
                format!("cannot use array '{}' without an index here", name_token.value),
                name_token,
            ));
        }

        if !sym.borrow().used {
            self.diagnostics.borrow_mut().warning_at(
                name_token,
                &format!(
                    "variable '{}' is uninitialized when used here",
                    name_token.value
                ),
            );
        }
        sym.borrow_mut().used = true;

        Ok((self.load(&sym, index), kind_type))
    }

    /// A string literal: materialize an anonymous NUL-terminated char array
    /// on the current frame and yield its base address.
    fn string_factor(&mut self, token: &Token) -> PResult<(usize, ValueType)> {
        let len = token.value.chars().count() + 1;
        self.string_count += 1;
        // '#' cannot occur in a scanned identifier, so the name is collision
        // free
        let name = format!("#str_{}", self.string_count);

        let sym = self
            .scope
            .add_symbol(Symbol::array(name, ValueType::Str, len), false)
            .map_err(|err| ParseError::syntax(err.0, token))?;

        // keep SP above the fresh slots so calls do not clobber them; a
        // claim inside an `if`/`for` branch does not run exactly once, so
        // the epilogue leaves those slots allocated
        self.gen.inc_sp(len);
        if self.control_depth > 0 {
            self.conditional_locals += len;
        }

        let base = self.frame_offset(&sym.borrow());
        for (k, ch) in token.value.chars().enumerate() {
            let lit = if ch == '\'' {
                "'\\''".to_owned()
            } else {
                format!("'{ch}'")
            };
            let value = self.gen.set_new_reg(lit);
            self.gen.move_reg_to_mem(value, base + k as i64, None);
        }
        let nul = self.gen.set_new_reg("0");
        self.gen.move_reg_to_mem(nul, base + len as i64 - 1, None);

        let address = self.gen.set_new_reg(frame_expr(base));
        Ok((address, ValueType::Str))
    }

    // ------------------------------------------------------------------
    // loads and stores
    // ------------------------------------------------------------------

    /// Load a symbol's value into a fresh register, honoring its storage
    /// class: pointer slots are dereferenced, globals are absolute, locals
    /// and parameters are frame-relative.
    fn load(&mut self, sym: &SymbolRef, index: Option<usize>) -> usize {
        let s = sym.borrow();
        let (is_global, indirect, addr) = (s.is_global, s.indirect, s.addr);
        let mem = if is_global { 0 } else { self.frame_offset(&s) };
        drop(s);

        if indirect {
            let ptr = self.gen.new_reg();
            self.gen.move_mem_to_reg(mem, ptr, None);
            let address = match index {
                Some(idx) => self.gen.set_new_reg(format!("R[{ptr}] + R[{idx}]")),
                None => ptr,
            };
            return self.gen.set_new_reg(format!("M[R[{address}]]"));
        }

        if is_global {
            return match index {
                Some(idx) => self.gen.set_new_reg(format!("M[{addr} + R[{idx}]]")),
                None => self.gen.set_new_reg(format!("M[{addr}]")),
            };
        }

        let value = self.gen.new_reg();
        self.gen.move_mem_to_reg(mem, value, index);
        value
    }

    /// Store a register into a symbol's slot, honoring its storage class.
    fn store(&mut self, sym: &SymbolRef, value: usize, index: Option<usize>) {
        let s = sym.borrow();
        let (is_global, indirect, addr) = (s.is_global, s.indirect, s.addr);
        let mem = if is_global { 0 } else { self.frame_offset(&s) };
        drop(s);

        if indirect {
            let ptr = self.gen.new_reg();
            self.gen.move_mem_to_reg(mem, ptr, None);
            let address = match index {
                Some(idx) => self.gen.set_new_reg(format!("R[{ptr}] + R[{idx}]")),
                None => ptr,
            };
            self.gen.move_reg_to_mem_indirect(value, address);
        } else if is_global {
            self.gen.move_reg_to_mem_global(value, addr, index);
        } else {
            self.gen.move_reg_to_mem(value, mem, index);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::{Diagnostics, Severity};

    fn compile(source: &str) -> (Vec<String>, DiagnosticsRef) {
        let diagnostics = Diagnostics::shared();
        let scanner = Scanner::from_source(source, "test.src", diagnostics.clone());
        let parser = Parser::new(scanner, CodeGen::new(), diagnostics.clone());
        let gen = parser.parse();
        (gen.rendered(), diagnostics)
    }

    fn errors(diagnostics: &DiagnosticsRef) -> Vec<String> {
        diagnostics.borrow().messages(Severity::Error)
    }

    fn warnings(diagnostics: &DiagnosticsRef) -> Vec<String> {
        diagnostics.borrow().messages(Severity::Warning)
    }

    fn label_definitions(lines: &[String]) -> Vec<String> {
        lines
            .iter()
            .filter(|l| l.ends_with(':') && !l.starts_with(' '))
            .map(|l| l.trim_end_matches(':').to_owned())
            .collect()
    }

    fn goto_targets(lines: &[String]) -> Vec<String> {
        lines
            .iter()
            .filter(|l| !l.contains("goto *("))
            .filter_map(|l| l.split("goto ").nth(1))
            .map(|target| target.trim_end_matches(';').to_owned())
            .collect()
    }

    fn register_writes(lines: &[String]) -> Vec<usize> {
        lines
            .iter()
            .filter_map(|l| l.strip_prefix("    R["))
            .filter_map(|rest| rest.split(']').next())
            .filter_map(|n| n.parse().ok())
            .collect()
    }

    #[test]
    fn test_minimal_program() {
        let (lines, diagnostics) = compile("program p is begin end program");
        assert_eq!(lines, vec!["main:"]);
        assert!(!diagnostics.borrow().has_errors());
        assert!(diagnostics.borrow().emitted().is_empty());
    }

    #[test]
    fn test_assignment_and_arithmetic() {
        let (lines, diagnostics) = compile(
            "program p is\n\
             global integer x;\n\
             begin\n\
                 x := 1 + 2 * 3;\n\
             end program",
        );
        assert_eq!(
            lines,
            vec![
                "main:",
                "    R[1] = 1;",
                "    R[2] = 2;",
                "    R[3] = 3;",
                "    R[4] = R[2] * R[3];",
                "    R[5] = R[1] + R[4];",
                "    M[0] = R[5];",
            ]
        );
        assert!(diagnostics.borrow().emitted().is_empty());
    }

    #[test]
    fn test_assignment_type_mismatch() {
        let (_, diagnostics) = compile(
            "program p is\n\
             global integer x;\n\
             global float y;\n\
             begin\n\
                 y := 0.5;\n\
                 x := y;\n\
             end program",
        );
        assert!(diagnostics.borrow().has_errors());
        assert!(errors(&diagnostics).iter().any(|m| m
            == "cannot assign expression of type 'FLOAT' to destination of type 'INTEGER'"));
    }

    #[test]
    fn test_uninitialized_use_warns() {
        let (lines, diagnostics) = compile(
            "program p is\n\
             global integer x;\n\
             global integer y;\n\
             begin\n\
                 y := x;\n\
             end program",
        );
        assert!(!diagnostics.borrow().has_errors());
        assert_eq!(
            warnings(&diagnostics),
            vec!["variable 'x' is uninitialized when used here"]
        );
        assert!(lines.contains(&"    M[1] = R[1];".to_owned()));
    }

    #[test]
    fn test_assignment_marks_destination_used() {
        let (_, diagnostics) = compile(
            "program p is\n\
             global integer x;\n\
             begin\n\
                 x := 1;\n\
                 x := x + 1;\n\
             end program",
        );
        assert!(warnings(&diagnostics).is_empty());
    }

    #[test]
    fn test_if_else_shape() {
        let (lines, diagnostics) = compile(
            "program p is\n\
             begin\n\
                 if (true) then\n\
                     putinteger(1);\n\
                 else\n\
                     putinteger(2);\n\
                 end if;\n\
             end program",
        );
        assert!(!diagnostics.borrow().has_errors());
        assert!(lines.contains(&"    if (R[1] == 0) goto else_1;".to_owned()));
        assert!(lines.contains(&"    goto endif_1;".to_owned()));
        assert!(lines.contains(&"else_1:".to_owned()));
        assert!(lines.contains(&"endif_1:".to_owned()));
        assert!(lines.contains(&"    goto putinteger;".to_owned()));
        let else_pos = lines.iter().position(|l| l == "else_1:").unwrap();
        let end_pos = lines.iter().position(|l| l == "endif_1:").unwrap();
        assert!(else_pos < end_pos);
    }

    #[test]
    fn test_if_guard_must_be_bool() {
        let (_, diagnostics) = compile(
            "program p is\n\
             begin\n\
                 if (1 + 1) then\n\
                     putinteger(1);\n\
                 end if;\n\
             end program",
        );
        assert!(errors(&diagnostics)
            .iter()
            .any(|m| m.contains("'if' condition must be of type 'BOOL'")));
    }

    #[test]
    fn test_for_loop_shape() {
        let (lines, diagnostics) = compile(
            "program p is\n\
             integer i;\n\
             begin\n\
                 for (i := 0; i < 10)\n\
                     putinteger(i);\n\
                 end for;\n\
             end program",
        );
        assert!(!diagnostics.borrow().has_errors());
        assert!(lines.contains(&"for_1:".to_owned()));
        assert!(lines.contains(&"    goto for_1;".to_owned()));
        assert!(lines.contains(&"endfor_1:".to_owned()));
        assert!(lines.contains(&"    if (R[4] == 0) goto endfor_1;".to_owned()));
        // the header assignment sits between the loop label and the guard
        let loop_pos = lines.iter().position(|l| l == "for_1:").unwrap();
        assert_eq!(lines[loop_pos + 1], "    R[1] = 0;");
        assert_eq!(lines[loop_pos + 2], "    M[FP + 0] = R[1];");
    }

    #[test]
    fn test_recursive_procedure() {
        let (lines, diagnostics) = compile(
            "program p is\n\
             procedure countdown(integer n in)\n\
             begin\n\
                 if (n > 0) then\n\
                     countdown(n - 1);\n\
                 end if;\n\
             end procedure;\n\
             begin\n\
                 countdown(3);\n\
             end program",
        );
        assert!(!diagnostics.borrow().has_errors());
        assert!(lines.contains(&"countdown_start_1:".to_owned()));
        let calls = lines
            .iter()
            .filter(|l| *l == "    goto countdown_start_1;")
            .count();
        assert_eq!(calls, 2);
        // the single in parameter sits below the saved FP and return address
        assert!(lines.contains(&"    R[1] = M[FP - 3];".to_owned()));
    }

    #[test]
    fn test_local_does_not_shadow_global_store() {
        let (lines, diagnostics) = compile(
            "program p is\n\
             global integer x;\n\
             procedure setlocal()\n\
             integer x;\n\
             begin\n\
                 x := 5;\n\
             end procedure;\n\
             begin\n\
                 x := 1;\n\
             end program",
        );
        assert!(!diagnostics.borrow().has_errors());
        assert!(lines.contains(&"    M[FP + 0] = R[1];".to_owned()));
        assert!(lines.contains(&"    M[0] = R[3];".to_owned()));
    }

    #[test]
    fn test_out_parameter_round_trip() {
        let (lines, diagnostics) = compile(
            "program p is\n\
             global integer result;\n\
             procedure produce(integer value out)\n\
             begin\n\
                 value := 42;\n\
             end procedure;\n\
             begin\n\
                 produce(result);\n\
                 putinteger(result);\n\
             end program",
        );
        assert!(!diagnostics.borrow().has_errors());
        // the callee stores through the pushed address
        assert!(lines.contains(&"    M[R[2]] = R[1];".to_owned()));
        // the caller pushes the global's absolute address
        assert!(lines.contains(&"    R[4] = 0;".to_owned()));
        // passing through 'out' counts as initialization
        assert!(warnings(&diagnostics).is_empty());
    }

    #[test]
    fn test_out_argument_must_be_identifier() {
        let (_, diagnostics) = compile(
            "program p is\n\
             procedure produce(integer value out)\n\
             begin\n\
                 value := 1;\n\
             end procedure;\n\
             begin\n\
                 produce(1 + 2);\n\
             end program",
        );
        assert!(errors(&diagnostics)
            .iter()
            .any(|m| m.contains("'out' argument must be an identifier")));
    }

    #[test]
    fn test_argument_count_mismatch() {
        let (_, diagnostics) = compile(
            "program p is\n\
             begin\n\
                 putinteger(1, 2);\n\
             end program",
        );
        assert!(errors(&diagnostics)
            .iter()
            .any(|m| m.contains("expects 1 argument(s), found 2")));
    }

    #[test]
    fn test_argument_type_mismatch() {
        let (_, diagnostics) = compile(
            "program p is\n\
             begin\n\
                 putinteger(true);\n\
             end program",
        );
        assert!(errors(&diagnostics)
            .iter()
            .any(|m| m.contains("argument type mismatch: expected 'INTEGER', found 'BOOL'")));
    }

    #[test]
    fn test_array_store_and_load() {
        let (lines, diagnostics) = compile(
            "program p is\n\
             global integer a[5];\n\
             global integer x;\n\
             begin\n\
                 a[2] := 7;\n\
                 x := a[2];\n\
             end program",
        );
        assert!(!diagnostics.borrow().has_errors());
        assert!(lines.contains(&"    M[0 + R[1]] = R[2];".to_owned()));
        assert!(lines.contains(&"    R[4] = M[0 + R[3]];".to_owned()));
    }

    #[test]
    fn test_array_index_must_be_integer() {
        let (_, diagnostics) = compile(
            "program p is\n\
             global integer a[5];\n\
             begin\n\
                 a[true] := 1;\n\
             end program",
        );
        assert!(errors(&diagnostics)
            .iter()
            .any(|m| m.contains("array index must be of type 'INTEGER'")));
    }

    #[test]
    fn test_array_size_zero_is_rejected() {
        let (_, diagnostics) = compile(
            "program p is\n\
             global integer a[0];\n\
             begin\n\
             end program",
        );
        assert!(errors(&diagnostics)
            .iter()
            .any(|m| m.contains("array size must be at least 1")));
    }

    #[test]
    fn test_bare_array_in_expression_is_rejected() {
        let (_, diagnostics) = compile(
            "program p is\n\
             global integer a[5];\n\
             global integer x;\n\
             begin\n\
                 x := a;\n\
             end program",
        );
        assert!(errors(&diagnostics)
            .iter()
            .any(|m| m.contains("cannot use array 'a' without an index")));
    }

    #[test]
    fn test_bare_array_destination_is_rejected() {
        let (_, diagnostics) = compile(
            "program p is\n\
             global integer a[5];\n\
             begin\n\
                 a := 1;\n\
             end program",
        );
        assert!(errors(&diagnostics)
            .iter()
            .any(|m| m.contains("cannot use array 'a' without an index")));
    }

    #[test]
    fn test_array_argument_expands_elementwise() {
        let (lines, diagnostics) = compile(
            "program p is\n\
             global integer a[3];\n\
             begin\n\
                 a[0] := 1;\n\
                 putinteger(a);\n\
             end program",
        );
        assert!(!diagnostics.borrow().has_errors());
        assert!(lines.contains(&"    R[3] = M[0];".to_owned()));
        assert!(lines.contains(&"    R[4] = M[1];".to_owned()));
        assert!(lines.contains(&"    R[5] = M[2];".to_owned()));
        let pushes = lines.iter().filter(|l| *l == "    SP++;").count();
        // three element pushes plus return address and saved FP
        assert_eq!(pushes, 5);
    }

    #[test]
    fn test_string_literal_materialization() {
        let (lines, diagnostics) = compile(
            "program p is\n\
             begin\n\
                 putstring(\"hi\");\n\
             end program",
        );
        assert!(!diagnostics.borrow().has_errors());
        assert!(lines.contains(&"    SP = SP + 3;".to_owned()));
        assert!(lines.contains(&"    R[1] = 'h';".to_owned()));
        assert!(lines.contains(&"    M[FP + 0] = R[1];".to_owned()));
        assert!(lines.contains(&"    R[3] = 0;".to_owned()));
        assert!(lines.contains(&"    R[4] = FP + 0;".to_owned()));
    }

    #[test]
    fn test_conditional_string_is_not_unwound_by_epilogue() {
        let (lines, diagnostics) = compile(
            "program p is\n\
             procedure greet(bool flag in)\n\
             begin\n\
                 if (flag) then\n\
                     putstring(\"hi\");\n\
                 end if;\n\
                 return;\n\
             end procedure;\n\
             begin\n\
                 greet(true);\n\
             end program",
        );
        assert!(!diagnostics.borrow().has_errors());
        // the claim runs only when the branch is taken
        assert_eq!(
            lines.iter().filter(|l| *l == "    SP = SP + 3;").count(),
            1
        );
        // both epilogues unwind the argument and saved slots only, never
        // the conditionally claimed string storage
        assert_eq!(
            lines.iter().filter(|l| *l == "    SP = SP - 3;").count(),
            2
        );
        assert!(!lines.contains(&"    SP = SP - 6;".to_owned()));
    }

    #[test]
    fn test_unconditional_string_is_unwound_by_epilogue() {
        let (lines, diagnostics) = compile(
            "program p is\n\
             procedure greet()\n\
             begin\n\
                 putstring(\"hi\");\n\
             end procedure;\n\
             begin\n\
                 greet();\n\
             end program",
        );
        assert!(!diagnostics.borrow().has_errors());
        assert!(lines.contains(&"    SP = SP + 3;".to_owned()));
        assert!(lines.contains(&"    SP = SP - 5;".to_owned()));
    }

    #[test]
    fn test_loop_string_slots_stay_allocated() {
        let (lines, diagnostics) = compile(
            "program p is\n\
             procedure shout()\n\
             integer i;\n\
             begin\n\
                 i := 0;\n\
                 for (i := i + 1; i <= 2)\n\
                     putstring(\"y\");\n\
                 end for;\n\
             end procedure;\n\
             begin\n\
                 shout();\n\
             end program",
        );
        assert!(!diagnostics.borrow().has_errors());
        assert!(lines.contains(&"    SP = SP + 2;".to_owned()));
        // declared local plus the two saved slots; the looped claim stays
        assert!(lines.contains(&"    SP = SP - 3;".to_owned()));
        assert!(!lines.contains(&"    SP = SP - 5;".to_owned()));
    }

    #[test]
    fn test_float_literal_is_bit_punned() {
        let (lines, diagnostics) = compile(
            "program p is\n\
             global float f;\n\
             begin\n\
                 f := 3.14;\n\
             end program",
        );
        assert!(!diagnostics.borrow().has_errors());
        assert!(lines.contains(&"    tmp_float = 3.14;".to_owned()));
        assert!(lines.contains(&"    memcpy(&R[1], &tmp_float, sizeof(int));".to_owned()));
    }

    #[test]
    fn test_unary_minus() {
        let (lines, _) = compile(
            "program p is\n\
             global integer x;\n\
             begin\n\
                 x := -3;\n\
             end program",
        );
        assert!(lines.contains(&"    R[2] = -1 * R[1];".to_owned()));
    }

    #[test]
    fn test_not_and_bitwise_ops() {
        let (lines, diagnostics) = compile(
            "program p is\n\
             global bool a;\n\
             global bool b;\n\
             begin\n\
                 a := true;\n\
                 b := not a & true;\n\
             end program",
        );
        assert!(!diagnostics.borrow().has_errors());
        assert!(lines.iter().any(|l| l.contains("= ~R[")));
        assert!(lines.iter().any(|l| l.contains("] & R[")));
    }

    #[test]
    fn test_relational_yields_bool() {
        let (_, diagnostics) = compile(
            "program p is\n\
             global bool flag;\n\
             global float f;\n\
             begin\n\
                 f := 1.0;\n\
                 flag := f < 2.0;\n\
             end program",
        );
        assert!(!diagnostics.borrow().has_errors());
    }

    #[test]
    fn test_mixed_operand_types_are_rejected() {
        let (_, diagnostics) = compile(
            "program p is\n\
             global integer x;\n\
             begin\n\
                 x := 1 + 2.0;\n\
             end program",
        );
        assert!(errors(&diagnostics)
            .iter()
            .any(|m| m.contains("cannot apply '+' to operands of type 'INTEGER' and 'FLOAT'")));
    }

    #[test]
    fn test_undefined_identifier() {
        let (_, diagnostics) = compile(
            "program p is\n\
             begin\n\
                 x := 1;\n\
             end program",
        );
        assert!(errors(&diagnostics)
            .iter()
            .any(|m| m.contains("undefined identifier 'x'")));
    }

    #[test]
    fn test_duplicate_declaration() {
        let (_, diagnostics) = compile(
            "program p is\n\
             global integer x;\n\
             global float x;\n\
             begin\n\
             end program",
        );
        assert!(errors(&diagnostics)
            .iter()
            .any(|m| m.contains("duplicate declaration of 'x'")));
    }

    #[test]
    fn test_resync_reports_multiple_errors() {
        let (_, diagnostics) = compile(
            "program p is\n\
             begin\n\
                 a := 1;\n\
                 b := 2;\n\
             end program",
        );
        assert_eq!(errors(&diagnostics).len(), 2);
    }

    #[test]
    fn test_scan_error_is_reported_once() {
        let (_, diagnostics) = compile(
            "program p is\n\
             global integer x;\n\
             begin\n\
                 x := 1.2.3;\n\
             end program",
        );
        assert_eq!(errors(&diagnostics).len(), 1);
        assert!(errors(&diagnostics)[0].contains("too many decimals"));
    }

    #[test]
    fn test_explicit_return_keeps_fallthrough_epilogue() {
        let (lines, diagnostics) = compile(
            "program p is\n\
             procedure noop()\n\
             begin\n\
                 return;\n\
             end procedure;\n\
             begin\n\
             end program",
        );
        assert!(!diagnostics.borrow().has_errors());
        let epilogues = lines.iter().filter(|l| l.contains("goto *(void *)")).count();
        assert_eq!(epilogues, 2);
    }

    #[test]
    fn test_return_at_program_level() {
        let (lines, diagnostics) = compile(
            "program p is\n\
             begin\n\
                 return;\n\
             end program",
        );
        assert!(!diagnostics.borrow().has_errors());
        assert!(lines.contains(&"    return 0;".to_owned()));
    }

    #[test]
    fn test_call_sequence_layout() {
        let (lines, diagnostics) = compile(
            "program p is\n\
             begin\n\
                 putinteger(9);\n\
             end program",
        );
        assert!(!diagnostics.borrow().has_errors());
        assert_eq!(
            lines,
            vec![
                "main:",
                "    R[1] = 9;",
                "    M[SP] = R[1];",
                "    SP++;",
                "    M[SP] = (int)&&ret_1;",
                "    SP++;",
                "    R[2] = FP;",
                "    M[SP] = R[2];",
                "    SP++;",
                "    FP = SP;",
                "    goto putinteger;",
                "ret_1:",
            ]
        );
    }

    #[test]
    fn test_labels_are_unique_and_gotos_resolve() {
        let (lines, diagnostics) = compile(
            "program p is\n\
             global integer x;\n\
             procedure twice(integer n in)\n\
             begin\n\
                 putinteger(n);\n\
                 putinteger(n);\n\
             end procedure;\n\
             begin\n\
                 x := 0;\n\
                 for (x := x + 1; x < 3)\n\
                     if (x == 2) then\n\
                         twice(x);\n\
                     else\n\
                         putinteger(0);\n\
                     end if;\n\
                 end for;\n\
             end program",
        );
        assert!(!diagnostics.borrow().has_errors());

        let mut labels = label_definitions(&lines);
        let total = labels.len();
        labels.sort();
        labels.dedup();
        assert_eq!(labels.len(), total, "duplicate label definition emitted");

        for target in goto_targets(&lines) {
            assert!(
                labels.binary_search(&target).is_ok() || target == "putinteger",
                "goto to undefined label '{target}'"
            );
        }
        // builtins come from the runtime, everything else must be defined
        assert!(labels.binary_search(&"main".to_owned()).is_ok());
    }

    #[test]
    fn test_registers_are_strictly_monotone() {
        let (lines, _) = compile(
            "program p is\n\
             global integer x;\n\
             begin\n\
                 x := 1 + 2 * 3 - 4;\n\
                 putinteger(x);\n\
             end program",
        );
        let writes = register_writes(&lines);
        assert!(!writes.is_empty());
        for pair in writes.windows(2) {
            assert!(pair[0] < pair[1], "register {} reused", pair[1]);
        }
    }

    #[test]
    fn test_nested_procedure_code_precedes_outer_entry() {
        let (lines, diagnostics) = compile(
            "program p is\n\
             procedure outer()\n\
             procedure inner(integer n in)\n\
             begin\n\
                 putinteger(n);\n\
             end procedure;\n\
             begin\n\
                 inner(7);\n\
             end procedure;\n\
             begin\n\
                 outer();\n\
             end program",
        );
        assert!(!diagnostics.borrow().has_errors());
        let inner = lines.iter().position(|l| l == "inner_start_1:").unwrap();
        let outer = lines.iter().position(|l| l == "outer_start_1:").unwrap();
        let main = lines.iter().position(|l| l == "main:").unwrap();
        assert!(inner < outer && outer < main);
    }

    #[test]
    fn test_sibling_procedure_is_not_visible_in_nested_body() {
        let (_, diagnostics) = compile(
            "program p is\n\
             procedure outer()\n\
             procedure first()\n\
             begin\n\
             end procedure;\n\
             procedure second()\n\
             begin\n\
                 first();\n\
             end procedure;\n\
             begin\n\
             end procedure;\n\
             begin\n\
             end program",
        );
        // lookup sees the innermost scope and the globals, nothing between
        assert!(errors(&diagnostics)
            .iter()
            .any(|m| m.contains("undefined identifier 'first'")));
    }

    #[test]
    fn test_label_counters_across_statements() {
        let (lines, diagnostics) = compile(
            "program p is\n\
             begin\n\
                 if (true) then\n\
                 end if;\n\
                 if (false) then\n\
                 end if;\n\
             end program",
        );
        assert!(!diagnostics.borrow().has_errors());
        for label in ["else_1:", "endif_1:", "else_2:", "endif_2:"] {
            assert!(lines.contains(&label.to_owned()), "missing {label}");
        }
    }

    #[test]
    fn test_string_variable_holds_address() {
        let (lines, diagnostics) = compile(
            "program p is\n\
             string s;\n\
             begin\n\
                 s := \"ok\";\n\
                 putstring(s);\n\
             end program",
        );
        assert!(!diagnostics.borrow().has_errors());
        // the literal lands above the declared local, its address in s
        assert!(lines.contains(&"    M[FP + 1] = R[1];".to_owned()));
        assert!(lines.contains(&"    R[4] = FP + 1;".to_owned()));
        assert!(lines.contains(&"    M[FP + 0] = R[4];".to_owned()));
    }

    #[test]
    fn test_call_of_non_procedure_is_rejected() {
        let (_, diagnostics) = compile(
            "program p is\n\
             global integer x;\n\
             begin\n\
                 x(1);\n\
             end program",
        );
        assert!(errors(&diagnostics)
            .iter()
            .any(|m| m.contains("'x' is not a procedure")));
    }

    #[test]
    fn test_assignment_to_procedure_is_rejected() {
        let (_, diagnostics) = compile(
            "program p is\n\
             begin\n\
                 putinteger := 1;\n\
             end program",
        );
        assert!(errors(&diagnostics)
            .iter()
            .any(|m| m.contains("cannot assign to procedure 'putinteger'")));
    }

    #[test]
    fn test_procedure_in_expression_is_rejected() {
        let (_, diagnostics) = compile(
            "program p is\n\
             global integer x;\n\
             begin\n\
                 x := putinteger;\n\
             end program",
        );
        assert!(errors(&diagnostics)
            .iter()
            .any(|m| m.contains("'putinteger' is not a variable")));
    }

    #[test]
    fn test_duplicate_parameter_name() {
        let (_, diagnostics) = compile(
            "program p is\n\
             procedure twice(integer n in, integer n in)\n\
             begin\n\
             end procedure;\n\
             begin\n\
             end program",
        );
        assert!(errors(&diagnostics)
            .iter()
            .any(|m| m.contains("duplicate declaration of 'n'")));
    }

    #[test]
    fn test_parameter_requires_direction() {
        let (_, diagnostics) = compile(
            "program p is\n\
             procedure oops(integer n)\n\
             begin\n\
             end procedure;\n\
             begin\n\
             end program",
        );
        assert!(errors(&diagnostics)
            .iter()
            .any(|m| m.contains("expected 'in' or 'out' after parameter")));
    }

    #[test]
    fn test_for_guard_must_be_bool() {
        let (_, diagnostics) = compile(
            "program p is\n\
             integer i;\n\
             begin\n\
                 i := 0;\n\
                 for (i := i + 1; i)\n\
                 end for;\n\
             end program",
        );
        assert!(errors(&diagnostics)
            .iter()
            .any(|m| m.contains("'for' condition must be of type 'BOOL'")));
    }

    #[test]
    fn test_global_procedure_is_callable_from_procedure() {
        let (_, diagnostics) = compile(
            "program p is\n\
             global procedure shout(integer n in)\n\
             begin\n\
                 putinteger(n);\n\
             end procedure;\n\
             procedure caller()\n\
             begin\n\
                 shout(1);\n\
             end procedure;\n\
             begin\n\
                 caller();\n\
             end program",
        );
        assert!(!diagnostics.borrow().has_errors());
    }

    #[test]
    fn test_out_array_passes_base_address_once() {
        let (lines, diagnostics) = compile(
            "program p is\n\
             global integer buf[4];\n\
             procedure fill(integer slots[4] out)\n\
             begin\n\
                 slots[0] := 1;\n\
             end procedure;\n\
             begin\n\
                 fill(buf);\n\
             end program",
        );
        assert!(!diagnostics.borrow().has_errors());
        // one address push for the whole array: three pushes total with the
        // return address and saved FP
        let pushes = lines.iter().filter(|l| *l == "    SP++;").count();
        assert_eq!(pushes, 3);
    }

    #[test]
    fn test_procedure_entry_advances_sp_past_locals() {
        let (lines, _) = compile(
            "program p is\n\
             procedure work()\n\
             integer a;\n\
             integer b[4];\n\
             begin\n\
                 a := 1;\n\
             end procedure;\n\
             begin\n\
             end program",
        );
        let entry = lines
            .iter()
            .position(|l| l == "work_start_1:")
            .expect("entry label missing");
        assert_eq!(lines[entry + 1], "    SP = SP + 5;");
        // epilogue unwinds locals plus the two saved slots
        assert!(lines.contains(&"    SP = SP - 7;".to_owned()));
    }
}
